// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Patching class-file method bodies. Payload bytes are padded to four-byte
//! multiples so switch padding downstream never moves, then spliced in with
//! branch offsets, exception-table pcs and line numbers adjusted. Constants
//! are appended to the pool; existing indices never change.

use std::convert::TryFrom;

use tracedex_models::models::{
    opcode_length, AttributeBody, CodeAttribute, FormatError, JvmClass,
};

use crate::injection::{emit_jvm_payload, jvm_targets, Injection};

fn read_i16_at(code: &[u8], at: usize) -> Result<i16, FormatError> {
    let bytes = code
        .get(at..at + 2)
        .ok_or_else(|| FormatError::corrupt("truncated branch operand"))?;
    Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_i32_at(code: &[u8], at: usize) -> Result<i32, FormatError> {
    let bytes = code
        .get(at..at + 4)
        .ok_or_else(|| FormatError::corrupt("truncated branch operand"))?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_i16_at(code: &mut [u8], at: usize, value: i16) {
    code[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_i32_at(code: &mut [u8], at: usize, value: i32) {
    code[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Splice `bytes` in front of the instruction at `pc`. The payload is padded
/// with nops to a multiple of four bytes.
pub fn insert_bytes(
    code: &mut CodeAttribute,
    pc: usize,
    mut bytes: Vec<u8>,
    stack_delta: u16,
) -> Result<(), FormatError> {
    if pc > code.code.len() {
        return Err(FormatError::corrupt(format!(
            "splice pc {} past the end of the method",
            pc
        )));
    }
    while bytes.len() % 4 != 0 {
        bytes.push(0x00); // nop
    }
    if bytes.is_empty() {
        return Ok(());
    }
    let len = bytes.len() as i64;

    // exactly one end of a branch shifting means the offset must change
    let shift_for = |src: usize, target: i64| -> i64 {
        match (src >= pc, target >= pc as i64) {
            (false, true) => len,
            (true, false) => -len,
            _ => 0,
        }
    };

    let mut walk = 0usize;
    while walk < code.code.len() {
        let op = code.code[walk];
        match op {
            // if*, goto, jsr, ifnull, ifnonnull
            0x99..=0xa8 | 0xc6 | 0xc7 => {
                let offset = read_i16_at(&code.code, walk + 1)?;
                let shift = shift_for(walk, walk as i64 + offset as i64);
                if shift != 0 {
                    let adjusted = i16::try_from(offset as i64 + shift)
                        .map_err(|_| FormatError::corrupt("branch offset exceeds 16 bits"))?;
                    write_i16_at(&mut code.code, walk + 1, adjusted);
                }
            }
            // goto_w, jsr_w
            0xc8 | 0xc9 => {
                let offset = read_i32_at(&code.code, walk + 1)?;
                let shift = shift_for(walk, walk as i64 + offset as i64);
                if shift != 0 {
                    let adjusted = i32::try_from(offset as i64 + shift)
                        .map_err(|_| FormatError::corrupt("branch offset exceeds 32 bits"))?;
                    write_i32_at(&mut code.code, walk + 1, adjusted);
                }
            }
            // tableswitch
            0xaa => {
                let base = (walk + 4) & !3;
                let low = read_i32_at(&code.code, base + 4)?;
                let high = read_i32_at(&code.code, base + 8)?;
                let count = (high - low + 1) as usize;
                for slot in 0..=count {
                    // slot 0 is the default offset
                    let at = if slot == 0 { base } else { base + 8 + 4 * slot };
                    let offset = read_i32_at(&code.code, at)?;
                    let shift = shift_for(walk, walk as i64 + offset as i64);
                    if shift != 0 {
                        write_i32_at(&mut code.code, at, (offset as i64 + shift) as i32);
                    }
                }
            }
            // lookupswitch
            0xab => {
                let base = (walk + 4) & !3;
                let npairs = read_i32_at(&code.code, base + 4)? as usize;
                for slot in 0..=npairs {
                    let at = if slot == 0 { base } else { base + 4 + 8 * slot };
                    let offset = read_i32_at(&code.code, at)?;
                    let shift = shift_for(walk, walk as i64 + offset as i64);
                    if shift != 0 {
                        write_i32_at(&mut code.code, at, (offset as i64 + shift) as i32);
                    }
                }
            }
            _ => {}
        }
        walk += opcode_length(&code.code, walk)?;
    }

    for entry in &mut code.exception_table {
        if entry.start_pc as usize >= pc {
            entry.start_pc = grow_pc(entry.start_pc, len)?;
        }
        if entry.end_pc as usize >= pc {
            entry.end_pc = grow_pc(entry.end_pc, len)?;
        }
        if entry.handler_pc as usize >= pc {
            entry.handler_pc = grow_pc(entry.handler_pc, len)?;
        }
    }
    for attribute in &mut code.attributes {
        if let AttributeBody::LineNumberTable(entries) = &mut attribute.body {
            for (start_pc, _) in entries {
                if *start_pc as usize >= pc {
                    *start_pc = grow_pc(*start_pc, len)?;
                }
            }
        }
    }

    let tail = code.code.split_off(pc);
    code.code.extend_from_slice(&bytes);
    code.code.extend_from_slice(&tail);
    code.max_stack += stack_delta;
    Ok(())
}

fn grow_pc(pc: u16, len: i64) -> Result<u16, FormatError> {
    u16::try_from(pc as i64 + len).map_err(|_| FormatError::corrupt("pc exceeds 16 bits"))
}

/// Apply one injection to one method of a class. Returns whether anything
/// was spliced. Targets are patched from the highest pc down so earlier
/// splices never invalidate later target pcs.
pub fn apply_injection(
    class: &mut JvmClass,
    method_index: usize,
    injection: &Injection,
) -> Result<bool, FormatError> {
    let display_name = {
        let member = class
            .methods
            .get(method_index)
            .ok_or_else(|| FormatError::corrupt("method index out of range"))?;
        let name = class
            .constant_pool
            .utf8(member.name_index)
            .map(|n| n.into_owned())
            .unwrap_or_default();
        let descriptor = class
            .constant_pool
            .utf8(member.descriptor_index)
            .map(|d| d.into_owned())
            .unwrap_or_default();
        format!("{}{}", name, descriptor)
    };

    let mut targets = match class.methods[method_index].code() {
        Some(code) => jvm_targets(class, code, &injection.target),
        None => return Ok(false),
    };
    if targets.is_empty() {
        return Ok(false);
    }
    targets.sort_unstable();

    let payload = emit_jvm_payload(&mut class.constant_pool, &injection.payload, &display_name)?;
    let code = match class.methods[method_index].code_mut() {
        Some(code) => code,
        None => return Ok(false),
    };
    for &pc in targets.iter().rev() {
        insert_bytes(code, pc, payload.code.clone(), payload.stack_delta)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::{InjectionPayload, InjectionTarget};
    use tracedex_models::models::{
        ConstantPool, ExceptionTableEntry, JvmAttribute, JvmMember,
    };

    fn class_with_code(code: Vec<u8>, exception_table: Vec<ExceptionTableEntry>) -> JvmClass {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class("com/example/Patched");
        let super_class = pool.ensure_class("java/lang/Object");
        let name = pool.ensure_utf8("run");
        let descriptor = pool.ensure_utf8("()V");
        let code_name = pool.ensure_utf8("Code");
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
                        max_stack: 1,
                        max_locals: 1,
                        code,
                        exception_table,
                        attributes: vec![],
                    }),
                }],
            }],
            attributes: vec![],
        }
    }

    #[test]
    fn entry_injection_prepends_and_keeps_the_rest() {
        let original = vec![0x03, 0x3b, 0xb1]; // iconst_0, istore_0, return
        let mut class = class_with_code(original.clone(), vec![]);
        let injection = Injection {
            target: InjectionTarget::MethodEntry,
            payload: InjectionPayload::PrintText("in".into()),
        };
        assert!(apply_injection(&mut class, 0, &injection).unwrap());

        let code = class.methods[0].code().unwrap();
        // 9 payload bytes padded to 12
        assert_eq!(code.code.len(), 12 + original.len());
        assert_eq!(code.code[0], 0xb2);
        assert_eq!(&code.code[12..], original.as_slice());
        assert_eq!(code.max_stack, 3);
    }

    #[test]
    fn branch_and_exception_table_survive_a_splice() {
        // goto +4 over the istore to the return, try covering everything
        let code = vec![0xa7, 0x00, 0x04, 0x3b, 0xb1];
        let table = vec![ExceptionTableEntry {
            start_pc: 3,
            end_pc: 5,
            handler_pc: 4,
            catch_type: 0,
        }];
        let mut class = class_with_code(code, table);
        let injection = Injection {
            // splices in front of the istore at pc 3
            target: InjectionTarget::Offset(3),
            payload: InjectionPayload::GcCall,
        };
        assert!(apply_injection(&mut class, 0, &injection).unwrap());

        let code = class.methods[0].code().unwrap();
        // 3-byte invokestatic padded to 4
        assert_eq!(read_i16_at(&code.code, 1).unwrap(), 8);
        assert_eq!(code.exception_table[0].start_pc, 7);
        assert_eq!(code.exception_table[0].end_pc, 9);
        assert_eq!(code.exception_table[0].handler_pc, 8);
    }

    #[test]
    fn exit_injection_hits_every_return() {
        // iconst_0, ifeq +4, return, return
        let code = vec![0x03, 0x99, 0x00, 0x04, 0xb1, 0xb1];
        let mut class = class_with_code(code, vec![]);
        let injection = Injection {
            target: InjectionTarget::MethodExit,
            payload: InjectionPayload::GcCall,
        };
        assert!(apply_injection(&mut class, 0, &injection).unwrap());

        let code = class.methods[0].code().unwrap();
        // both returns got a 4-byte payload in front
        assert_eq!(code.code.len(), 6 + 8);
        assert_eq!(code.code[4], 0xb8);
        assert_eq!(code.code[8], 0xb1);
        assert_eq!(code.code[9], 0xb8);
        assert_eq!(code.code[13], 0xb1);
        // the conditional branch still lands on the second return
        assert_eq!(read_i16_at(&code.code, 2).unwrap(), 12);
    }
}
