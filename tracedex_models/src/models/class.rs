// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The format-agnostic class model. Readers for both containers produce these
//! structures so resolution, reference extraction and injection never care
//! which binary format a class came from.

use std::sync::Arc;

use super::{opcode_length, AccessFlags, CodeAttribute, CodeItem, InvokeKind};

/// Which container a class was read from. `Unknown` is the placeholder for a
/// name that could not be resolved anywhere; it never compares equal to a
/// loaded class.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ClassKind {
    Dex {
        dex_identifier: String,
        class_idx: u32,
    },
    Jvm {
        minor_version: u16,
        major_version: u16,
    },
    Unknown,
}

impl ClassKind {
    pub fn is_unknown(&self) -> bool {
        matches!(self, ClassKind::Unknown)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldModel {
    pub name: String,
    pub descriptor: String,
    pub access_flags: AccessFlags,
}

/// A call site found in a method body. The address is the unit offset (dex)
/// or byte pc (JVM) of the invoke instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Invokation {
    pub kind: InvokeKind,
    pub class_name: String,
    pub method_name: String,
    pub proto: String,
    pub address: u32,
}

impl Invokation {
    pub fn full_name(&self) -> String {
        format!("{}->{}{}", self.class_name, self.method_name, self.proto)
    }
}

/// The decoded body of a method, when one exists. Abstract and native
/// methods carry `None`.
#[derive(Debug, Clone, Default)]
pub enum MethodBody {
    Dex {
        method_idx: u32,
        code: Option<CodeItem>,
    },
    Jvm {
        code: Option<CodeAttribute>,
    },
    #[default]
    None,
}

impl MethodBody {
    pub fn has_code(&self) -> bool {
        match self {
            MethodBody::Dex { code, .. } => code.is_some(),
            MethodBody::Jvm { code } => code.is_some(),
            MethodBody::None => false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MethodModel {
    pub class_name: String,
    pub name: String,
    pub proto: String,
    pub access_flags: AccessFlags,
    /// Exception class names declared on the method, from the Throws
    /// annotation (dex) or the Exceptions attribute (JVM).
    pub exceptions: Vec<String>,
    #[serde(skip_serializing, skip_deserializing)]
    pub invocations: Vec<Invokation>,
    #[serde(skip_serializing, skip_deserializing)]
    pub body: MethodBody,
}

impl PartialEq for MethodModel {
    fn eq(&self, other: &Self) -> bool {
        self.class_name == other.class_name
            && self.name == other.name
            && self.proto == other.proto
    }
}

impl MethodModel {
    pub fn full_name(&self) -> String {
        format!("{}->{}{}", self.class_name, self.name, self.proto)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(AccessFlags::ABSTRACT)
    }

    pub fn is_native(&self) -> bool {
        self.access_flags.contains(AccessFlags::NATIVE)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>" || self.name == "<clinit>"
    }

    /// Map a bytecode offset to the index of the instruction starting at or
    /// after it. Monotonic in the offset and idempotent: feeding the offset
    /// of instruction `i` back in yields `i` again.
    pub fn bytecode_index_for_offset(&self, offset: u32) -> Option<usize> {
        match &self.body {
            MethodBody::Dex { code: Some(code), .. } => {
                code.insns.iter().position(|(_, at, _)| at.0 >= offset)
            }
            MethodBody::Jvm { code: Some(code) } => {
                let mut pc = 0usize;
                let mut index = 0usize;
                while pc < code.code.len() {
                    if pc as u32 >= offset {
                        return Some(index);
                    }
                    pc += opcode_length(&code.code, pc).ok()?;
                    index += 1;
                }
                None
            }
            _ => None,
        }
    }
}

/// A class resolved from some context, unified over both binary formats.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClassModel {
    /// Specification string of the context the class was loaded from.
    pub context_spec: String,
    /// Qualified binary name, e.g. `java/lang/String`.
    pub name: String,
    pub access_flags: AccessFlags,
    pub super_name: Option<String>,
    pub interface_names: Vec<String>,
    pub fields: Vec<FieldModel>,
    pub methods: Vec<Arc<MethodModel>>,
    pub kind: ClassKind,
}

impl PartialEq for ClassModel {
    fn eq(&self, other: &Self) -> bool {
        // an unresolved placeholder matches nothing, not even itself
        if self.kind.is_unknown() || other.kind.is_unknown() {
            return false;
        }
        self.context_spec == other.context_spec && self.name == other.name
    }
}

impl ClassModel {
    /// The placeholder for a class that could not be resolved.
    pub fn unknown(name: &str) -> ClassModel {
        ClassModel {
            context_spec: String::new(),
            name: name.to_string(),
            access_flags: AccessFlags::empty(),
            super_name: None,
            interface_names: vec![],
            fields: vec![],
            methods: vec![],
            kind: ClassKind::Unknown,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.kind.is_unknown()
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(AccessFlags::INTERFACE)
    }

    pub fn get_human_friendly_name(&self) -> String {
        self.name.replace('/', ".")
    }

    pub fn find_method(&self, name: &str, proto: &str) -> Option<&Arc<MethodModel>> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.proto == proto)
    }

    pub fn find_methods_by_name(&self, name: &str) -> Vec<&Arc<MethodModel>> {
        self.methods.iter().filter(|m| m.name == name).collect()
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldModel> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Instruction, InstructionOffset, InstructionSize};

    fn dex_method(insns: Vec<(InstructionSize, InstructionOffset, Instruction)>) -> MethodModel {
        MethodModel {
            class_name: "Lcom/example/A;".to_string(),
            name: "run".to_string(),
            proto: "()V".to_string(),
            access_flags: AccessFlags::PUBLIC,
            exceptions: vec![],
            invocations: vec![],
            body: MethodBody::Dex {
                method_idx: 0,
                code: Some(CodeItem {
                    registers_size: 1,
                    ins_size: 1,
                    outs_size: 0,
                    debug_info_off: 0,
                    insns,
                    tries: vec![],
                    handlers: vec![],
                }),
            },
        }
    }

    #[test]
    fn unknown_class_never_equals() {
        let unknown = ClassModel::unknown("Lcom/example/Gone;");
        let other = ClassModel::unknown("Lcom/example/Gone;");
        assert_ne!(unknown, other);
        assert_ne!(unknown, unknown.clone());
    }

    #[test]
    fn index_for_offset_is_monotonic_and_idempotent() {
        let method = dex_method(vec![
            (InstructionSize(2), InstructionOffset(0), Instruction::ConstString(0, 1)),
            (InstructionSize(1), InstructionOffset(2), Instruction::MoveResult(0)),
            (InstructionSize(1), InstructionOffset(3), Instruction::ReturnVoid),
        ]);
        assert_eq!(method.bytecode_index_for_offset(0), Some(0));
        assert_eq!(method.bytecode_index_for_offset(1), Some(1));
        assert_eq!(method.bytecode_index_for_offset(2), Some(1));
        assert_eq!(method.bytecode_index_for_offset(3), Some(2));
        assert_eq!(method.bytecode_index_for_offset(4), None);
        // idempotent through the instruction's own offset
        let index = method.bytecode_index_for_offset(2).unwrap();
        let offset = match &method.body {
            MethodBody::Dex { code: Some(code), .. } => code.insns[index].1 .0,
            _ => unreachable!(),
        };
        assert_eq!(method.bytecode_index_for_offset(offset), Some(index));
    }

    #[test]
    fn jvm_index_for_offset_walks_opcodes() {
        let method = MethodModel {
            class_name: "com/example/A".to_string(),
            name: "run".to_string(),
            proto: "()V".to_string(),
            access_flags: AccessFlags::PUBLIC,
            exceptions: vec![],
            invocations: vec![],
            body: MethodBody::Jvm {
                code: Some(CodeAttribute {
                    max_stack: 1,
                    max_locals: 1,
                    // bipush 5, istore_1, return
                    code: vec![0x10, 0x05, 0x3c, 0xb1],
                    exception_table: vec![],
                    attributes: vec![],
                }),
            },
        };
        assert_eq!(method.bytecode_index_for_offset(0), Some(0));
        assert_eq!(method.bytecode_index_for_offset(2), Some(1));
        assert_eq!(method.bytecode_index_for_offset(3), Some(2));
    }
}
