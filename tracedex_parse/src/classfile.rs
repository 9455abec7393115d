// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reading JVM class files into the format-agnostic model.

use std::{io::Read, sync::Arc};

use tracedex_models::models::{
    opcode_length, AccessFlags, AttributeBody, ClassKind, ClassModel, ConstantPoolEntry,
    FieldModel, FormatError, Invokation, InvokeKind, JvmClass, JvmMember, MethodBody, MethodModel,
};

pub fn parse_class<R: Read>(r: &mut R) -> Result<JvmClass, FormatError> {
    JvmClass::read(r)
}

/// Walk the code array and resolve every invoke through the constant pool.
pub fn extract_invocations(class: &JvmClass, member: &JvmMember) -> Vec<Invokation> {
    let code = match member.code() {
        Some(code) => code,
        None => return vec![],
    };
    let pool = &class.constant_pool;
    let mut invocations = vec![];
    let mut pc = 0usize;
    while pc < code.code.len() {
        let op = code.code[pc];
        let kind = match op {
            0xb6 => Some(InvokeKind::Virtual),
            0xb7 => Some(InvokeKind::Direct),
            0xb8 => Some(InvokeKind::Static),
            0xb9 => Some(InvokeKind::Interface),
            _ => None,
        };
        if let Some(kind) = kind {
            if let Some(bytes) = code.code.get(pc + 1..pc + 3) {
                let index = u16::from_be_bytes([bytes[0], bytes[1]]);
                if let Some((class_name, method_name, descriptor)) = pool.member_ref(index) {
                    invocations.push(Invokation {
                        kind,
                        class_name: class_name.into_owned(),
                        method_name: method_name.into_owned(),
                        proto: descriptor.into_owned(),
                        address: pc as u32,
                    });
                }
            }
        }
        match opcode_length(&code.code, pc) {
            Ok(length) => pc += length,
            Err(e) => {
                log::warn!("stopping invoke scan at pc {}: {}", pc, e);
                break;
            }
        }
    }
    invocations
}

fn declared_exceptions(class: &JvmClass, member: &JvmMember) -> Vec<String> {
    member
        .attributes
        .iter()
        .find_map(|a| match &a.body {
            AttributeBody::Exceptions(indices) => Some(
                indices
                    .iter()
                    .filter_map(|&idx| class.constant_pool.class_name(idx))
                    .map(|name| name.into_owned())
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

/// Lift a parsed class file into the format-agnostic model.
pub fn build_class_model(class: &JvmClass, context_spec: &str) -> ClassModel {
    let pool = &class.constant_pool;
    let name = class
        .class_name()
        .map(|n| n.into_owned())
        .unwrap_or_default();

    let fields = class
        .fields
        .iter()
        .map(|field| FieldModel {
            name: pool
                .utf8(field.name_index)
                .map(|n| n.into_owned())
                .unwrap_or_default(),
            descriptor: pool
                .utf8(field.descriptor_index)
                .map(|d| d.into_owned())
                .unwrap_or_default(),
            access_flags: AccessFlags::from_bits_truncate(field.access_flags as u64),
        })
        .collect();

    let methods = class
        .methods
        .iter()
        .map(|member| {
            Arc::new(MethodModel {
                class_name: name.clone(),
                name: pool
                    .utf8(member.name_index)
                    .map(|n| n.into_owned())
                    .unwrap_or_default(),
                proto: pool
                    .utf8(member.descriptor_index)
                    .map(|d| d.into_owned())
                    .unwrap_or_default(),
                access_flags: AccessFlags::from_bits_truncate(member.access_flags as u64),
                exceptions: declared_exceptions(class, member),
                invocations: extract_invocations(class, member),
                body: MethodBody::Jvm {
                    code: member.code().cloned(),
                },
            })
        })
        .collect();

    ClassModel {
        context_spec: context_spec.to_string(),
        name,
        access_flags: AccessFlags::from_bits_truncate(class.access_flags as u64),
        super_name: class.super_class_name().map(|n| n.into_owned()),
        interface_names: class
            .interfaces
            .iter()
            .filter_map(|&idx| pool.class_name(idx))
            .map(|n| n.into_owned())
            .collect(),
        fields,
        methods,
        kind: ClassKind::Jvm {
            minor_version: class.minor_version,
            major_version: class.major_version,
        },
    }
}

/// Whether a string constant index is referenced from any method body of the
/// class, used when pruning constants during rewrite.
pub fn string_constant_used(class: &JvmClass, index: u16) -> bool {
    if !matches!(
        class.constant_pool.get(index),
        Some(ConstantPoolEntry::String(_))
    ) {
        return false;
    }
    class.methods.iter().chain(class.fields.iter()).any(|m| {
        m.code().map_or(false, |code| {
            let mut pc = 0usize;
            while pc < code.code.len() {
                match code.code[pc] {
                    // ldc
                    0x12 => {
                        if code.code.get(pc + 1) == Some(&(index as u8)) && index < 256 {
                            return true;
                        }
                    }
                    // ldc_w
                    0x13 => {
                        if let Some(bytes) = code.code.get(pc + 1..pc + 3) {
                            if u16::from_be_bytes([bytes[0], bytes[1]]) == index {
                                return true;
                            }
                        }
                    }
                    _ => {}
                }
                match opcode_length(&code.code, pc) {
                    Ok(length) => pc += length,
                    Err(_) => return false,
                }
            }
            false
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedex_models::models::{
        CodeAttribute, ConstantPool, JvmAttribute,
    };

    fn class_with_invoke() -> JvmClass {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class("com/example/Caller");
        let super_class = pool.ensure_class("java/lang/Object");
        let method_ref =
            pool.ensure_method_ref("java/io/PrintStream", "println", "(Ljava/lang/String;)V");
        let name = pool.ensure_utf8("run");
        let descriptor = pool.ensure_utf8("()V");
        let code_name = pool.ensure_utf8("Code");
        let mut code = vec![0x01, 0x4b]; // aconst_null, astore_0
        code.push(0xb6); // invokevirtual
        code.extend_from_slice(&method_ref.to_be_bytes());
        code.push(0xb1); // return
        JvmClass {
            minor_version: 0,
            major_version: 52,
            constant_pool: pool,
            access_flags: 0x21,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: vec![JvmMember {
                access_flags: 0x1,
                name_index: name,
                descriptor_index: descriptor,
                attributes: vec![JvmAttribute {
                    name_index: code_name,
                    body: AttributeBody::Code(CodeAttribute {
                        max_stack: 2,
                        max_locals: 1,
                        code,
                        exception_table: vec![],
                        attributes: vec![],
                    }),
                }],
            }],
            attributes: vec![],
        }
    }

    #[test]
    fn invocations_are_resolved_through_the_pool() {
        let class = class_with_invoke();
        let invocations = extract_invocations(&class, &class.methods[0]);
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].class_name, "java/io/PrintStream");
        assert_eq!(invocations[0].method_name, "println");
        assert_eq!(invocations[0].address, 2);
        assert_eq!(invocations[0].kind, InvokeKind::Virtual);
    }

    #[test]
    fn model_carries_both_format_details() {
        let class = class_with_invoke();
        let model = build_class_model(&class, "test.apk");
        assert_eq!(model.name, "com/example/Caller");
        assert_eq!(model.super_name.as_deref(), Some("java/lang/Object"));
        assert!(matches!(model.kind, ClassKind::Jvm { major_version: 52, .. }));
        let method = model.find_method("run", "()V").unwrap();
        assert_eq!(method.invocations.len(), 1);
        assert!(method.body.has_code());
    }
}
