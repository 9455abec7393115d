// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Injection points and payloads. A target computes where instrumentation
//! goes (entry, every return, an offset, or a scanned opcode family); a
//! payload emits the instruction sequence, pulling the constants it needs
//! into the pool it is emitted against.

use std::convert::TryFrom;

use tracedex_models::models::{
    opcode_length, parse_method_descriptor, CodeAttribute, CodeItem, ConstantPool, DexFile,
    FieldOpType, FormatError, Instruction, InvokeKind, JvmClass, TypeDescriptor,
};

use crate::dex_patch::index_for_offset;
use crate::dex_writer::DexPools;

const SYSTEM: &str = "Ljava/lang/System;";
const PRINT_STREAM: &str = "Ljava/io/PrintStream;";

/// A field identity used to narrow field-access targets. Class names use the
/// format's native spelling: descriptors for dex, internal names for class
/// files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub class_name: String,
    pub field_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionTarget {
    MethodEntry,
    /// Before every return instruction.
    MethodExit,
    /// Before the instruction covering a code address.
    Offset(u32),
    /// Every `move-exception` (dex) or handler pc (class file).
    ExceptionHandler,
    /// Every `throw` / `athrow`.
    ThrowSite,
    /// Every `monitor-enter`, the closest approximation of "finally".
    Finally,
    /// Every constructor call.
    Construction,
    /// Every field read and write, optionally narrowed to one field.
    FieldAccess { field: Option<FieldSpec> },
    /// Entry of `finalize()V`, synthesized when the class has none.
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionPayload {
    /// Print a fixed line to `System.out`.
    PrintText(String),
    /// Throw a fresh `RuntimeException`.
    Crash,
    GcCall,
    StackTraceDump,
    /// Print the current value of a static field.
    FieldSnapshot {
        class_name: String,
        field_name: String,
        descriptor: String,
    },
    /// Print the method name and each parameter value.
    ParameterDump,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub target: InjectionTarget,
    pub payload: InjectionPayload,
}

/// Instruction indices a target resolves to within a dex method body.
pub fn dex_targets(file: &DexFile, code: &CodeItem, target: &InjectionTarget) -> Vec<usize> {
    match target {
        InjectionTarget::MethodEntry | InjectionTarget::Finalize => vec![0],
        InjectionTarget::MethodExit => code
            .insns
            .iter()
            .enumerate()
            .filter(|(_, (_, _, insn))| insn.is_return())
            .map(|(i, _)| i)
            .collect(),
        InjectionTarget::Offset(offset) => vec![index_for_offset(code, *offset)],
        InjectionTarget::ExceptionHandler => scan(code, |insn| {
            matches!(insn, Instruction::MoveException(_))
        }),
        InjectionTarget::ThrowSite => scan(code, |insn| matches!(insn, Instruction::Throw(_))),
        InjectionTarget::Finally => scan(code, |insn| {
            matches!(insn, Instruction::MonitorEnter(_))
        }),
        InjectionTarget::Construction => scan(code, |insn| {
            let (kind, idx) = match insn {
                Instruction::Invoke35c(kind, _, idx, _) => (kind, idx),
                Instruction::InvokeRange(kind, _, idx, _) => (kind, idx),
                _ => return false,
            };
            *kind == InvokeKind::Direct
                && file
                    .methods
                    .get(*idx as usize)
                    .map(|m| m.method_name == "<init>")
                    .unwrap_or(false)
        }),
        InjectionTarget::FieldAccess { field } => scan(code, |insn| {
            let idx = match insn {
                Instruction::InstanceGet(_, _, idx, _)
                | Instruction::InstancePut(_, _, idx, _)
                | Instruction::StaticGet(_, idx, _)
                | Instruction::StaticPut(_, idx, _) => *idx,
                _ => return false,
            };
            match field {
                None => true,
                Some(spec) => file
                    .fields
                    .get(idx as usize)
                    .map(|f| {
                        f.name == spec.field_name
                            && file.get_type_name(f.class_idx as usize)
                                == Some(spec.class_name.as_str())
                    })
                    .unwrap_or(false),
            }
        }),
    }
}

fn scan(code: &CodeItem, pred: impl Fn(&Instruction) -> bool) -> Vec<usize> {
    code.insns
        .iter()
        .enumerate()
        .filter(|(_, (_, _, insn))| pred(insn))
        .map(|(i, _)| i)
        .collect()
}

/// The frame of the method receiving a dex payload, as it was before the
/// splice. Scratch registers are taken above the old frame top.
pub struct DexFrame<'a> {
    pub registers_size: u16,
    pub ins_size: u16,
    pub is_static: bool,
    pub proto: &'a str,
    pub display_name: &'a str,
}

pub struct DexPayload {
    pub instructions: Vec<Instruction>,
    pub scratch_registers: u16,
    pub outs: u16,
}

fn narrow_reg(reg: u16) -> Result<u8, FormatError> {
    u8::try_from(reg).map_err(|_| {
        FormatError::corrupt("register frame too large for injection scratch registers")
    })
}

fn const_string(reg: u8, string_idx: u32) -> Instruction {
    match u16::try_from(string_idx) {
        Ok(idx) => Instruction::ConstString(reg, idx),
        Err(_) => Instruction::ConstStringJumbo(reg, string_idx),
    }
}

fn field_op_type(descriptor: &str) -> FieldOpType {
    match descriptor.chars().next() {
        Some('J') | Some('D') => FieldOpType::Wide,
        Some('L') | Some('[') => FieldOpType::Object,
        Some('Z') => FieldOpType::Boolean,
        Some('B') => FieldOpType::Byte,
        Some('C') => FieldOpType::Char,
        Some('S') => FieldOpType::Short,
        _ => FieldOpType::Default,
    }
}

/// The `println` overload matching a value of the given descriptor.
fn println_descriptor(descriptor: &str) -> &'static str {
    match descriptor.chars().next() {
        Some('L') | Some('[') => "(Ljava/lang/Object;)V",
        Some('J') => "(J)V",
        Some('D') => "(D)V",
        Some('F') => "(F)V",
        Some('Z') => "(Z)V",
        Some('C') => "(C)V",
        _ => "(I)V",
    }
}

fn ensure_out_field(pools: &mut DexPools) -> Result<u16, FormatError> {
    pools.ensure_field(SYSTEM, "out", PRINT_STREAM)
}

fn ensure_println(pools: &mut DexPools, descriptor: &str) -> Result<u16, FormatError> {
    pools.ensure_method(PRINT_STREAM, "println", descriptor)
}

/// Emit a payload against a dex pool set. The caller splices the returned
/// instructions and grows the frame by `scratch_registers`.
pub fn emit_dex_payload(
    pools: &mut DexPools,
    payload: &InjectionPayload,
    frame: &DexFrame,
) -> Result<DexPayload, FormatError> {
    let base = frame.registers_size;
    match payload {
        InjectionPayload::PrintText(text) => {
            let out = ensure_out_field(pools)?;
            let println = ensure_println(pools, "(Ljava/lang/String;)V")?;
            let text_idx = pools.ensure_string(text);
            Ok(DexPayload {
                instructions: vec![
                    Instruction::StaticGet(narrow_reg(base)?, out, FieldOpType::Object),
                    const_string(narrow_reg(base + 1)?, text_idx),
                    Instruction::InvokeRange(InvokeKind::Virtual, 2, println, base),
                ],
                scratch_registers: 2,
                outs: 2,
            })
        }
        InjectionPayload::Crash => {
            let exception = pools.ensure_type("Ljava/lang/RuntimeException;")?;
            let init = pools.ensure_method("Ljava/lang/RuntimeException;", "<init>", "()V")?;
            let reg = narrow_reg(base)?;
            Ok(DexPayload {
                instructions: vec![
                    Instruction::NewInstance(reg, exception),
                    Instruction::InvokeRange(InvokeKind::Direct, 1, init, base),
                    Instruction::Throw(reg),
                ],
                scratch_registers: 1,
                outs: 1,
            })
        }
        InjectionPayload::GcCall => {
            let gc = pools.ensure_method(SYSTEM, "gc", "()V")?;
            Ok(DexPayload {
                instructions: vec![Instruction::InvokeRange(InvokeKind::Static, 0, gc, 0)],
                scratch_registers: 0,
                outs: 0,
            })
        }
        InjectionPayload::StackTraceDump => {
            let dump = pools.ensure_method("Ljava/lang/Thread;", "dumpStack", "()V")?;
            Ok(DexPayload {
                instructions: vec![Instruction::InvokeRange(InvokeKind::Static, 0, dump, 0)],
                scratch_registers: 0,
                outs: 0,
            })
        }
        InjectionPayload::FieldSnapshot {
            class_name,
            field_name,
            descriptor,
        } => {
            let out = ensure_out_field(pools)?;
            let field = pools.ensure_field(class_name, field_name, descriptor)?;
            let println = ensure_println(pools, println_descriptor(descriptor))?;
            let op_type = field_op_type(descriptor);
            let width = if op_type == FieldOpType::Wide { 2 } else { 1 };
            Ok(DexPayload {
                instructions: vec![
                    Instruction::StaticGet(narrow_reg(base)?, out, FieldOpType::Object),
                    Instruction::StaticGet(narrow_reg(base + 1)?, field, op_type),
                    Instruction::InvokeRange(InvokeKind::Virtual, 1 + width, println, base),
                ],
                scratch_registers: 1 + width as u16,
                outs: 1 + width as u16,
            })
        }
        InjectionPayload::ParameterDump => {
            let out = ensure_out_field(pools)?;
            let println_string = ensure_println(pools, "(Ljava/lang/String;)V")?;
            let name_idx = pools.ensure_string(frame.display_name);
            let (arguments, _) = parse_method_descriptor(frame.proto)?;

            let mut instructions = vec![
                Instruction::StaticGet(narrow_reg(base)?, out, FieldOpType::Object),
                const_string(narrow_reg(base + 1)?, name_idx),
                Instruction::InvokeRange(InvokeKind::Virtual, 2, println_string, base),
            ];
            // parameters sit in the top ins_size registers of the old frame
            let mut reg = frame.registers_size - frame.ins_size;
            if !frame.is_static {
                reg += 1;
            }
            let mut max_width = 1u8;
            for argument in &arguments {
                let width: u8 = if argument.is_wide() { 2 } else { 1 };
                max_width = max_width.max(width);
                let move_opcode: u16 = match argument {
                    TypeDescriptor::Primitive(p) if p.is_wide() => 0x06, // move-wide/16
                    TypeDescriptor::Primitive(_) => 0x03,                // move/16
                    _ => 0x09,                                           // move-object/16
                };
                instructions.push(Instruction::Other(vec![move_opcode, base + 1, reg]));
                let println = ensure_println(pools, println_descriptor(&argument.to_descriptor()))?;
                instructions.push(Instruction::InvokeRange(
                    InvokeKind::Virtual,
                    1 + width,
                    println,
                    base,
                ));
                reg += width as u16;
            }
            let scratch = 1 + max_width as u16;
            narrow_reg(base + scratch - 1)?;
            Ok(DexPayload {
                instructions,
                scratch_registers: scratch,
                outs: scratch,
            })
        }
    }
}

/// Moves the incoming arguments back to where the body reads them after the
/// frame grew. Dalvik delivers arguments in the top `ins_size` registers, so
/// growing from `old_registers` to `new_registers` shifts their arrival
/// upward while the body keeps addressing the old slots. Emitted in
/// ascending slot order; a destination can only alias a source that was
/// already copied.
pub fn relocate_arguments(
    proto: &str,
    is_static: bool,
    old_registers: u16,
    new_registers: u16,
    ins_size: u16,
) -> Result<Vec<Instruction>, FormatError> {
    if new_registers <= old_registers || ins_size == 0 {
        return Ok(vec![]);
    }
    let old_base = old_registers - ins_size;
    let new_base = new_registers - ins_size;
    let mut instructions = vec![];
    let mut slot = 0u16;
    if !is_static {
        // move-object/16
        instructions.push(Instruction::Other(vec![0x09, old_base, new_base]));
        slot = 1;
    }
    let (arguments, _) = parse_method_descriptor(proto)?;
    for argument in &arguments {
        if slot >= ins_size {
            break;
        }
        let move_opcode: u16 = match argument {
            TypeDescriptor::Primitive(p) if p.is_wide() => 0x06, // move-wide/16
            TypeDescriptor::Primitive(_) => 0x03,                // move/16
            _ => 0x09,                                           // move-object/16
        };
        instructions.push(Instruction::Other(vec![
            move_opcode,
            old_base + slot,
            new_base + slot,
        ]));
        slot += if argument.is_wide() { 2 } else { 1 };
    }
    Ok(instructions)
}

/// Program counters a target resolves to within a class-file method body.
pub fn jvm_targets(class: &JvmClass, code: &CodeAttribute, target: &InjectionTarget) -> Vec<usize> {
    match target {
        InjectionTarget::MethodEntry | InjectionTarget::Finalize => vec![0],
        InjectionTarget::ExceptionHandler => {
            let mut pcs: Vec<usize> = code
                .exception_table
                .iter()
                .map(|e| e.handler_pc as usize)
                .collect();
            pcs.sort_unstable();
            pcs.dedup();
            pcs
        }
        InjectionTarget::Offset(offset) => {
            let mut pc = 0usize;
            while pc < code.code.len() && pc < *offset as usize {
                match opcode_length(&code.code, pc) {
                    Ok(length) => pc += length,
                    Err(_) => break,
                }
            }
            vec![pc.min(code.code.len())]
        }
        _ => {
            let pool = &class.constant_pool;
            let mut pcs = vec![];
            let mut pc = 0usize;
            while pc < code.code.len() {
                let op = code.code[pc];
                let matches_target = match target {
                    InjectionTarget::MethodExit => (0xac..=0xb1).contains(&op),
                    InjectionTarget::ThrowSite => op == 0xbf,
                    InjectionTarget::Finally => op == 0xc2,
                    InjectionTarget::Construction => {
                        op == 0xb7
                            && member_at(pool, &code.code, pc)
                                .map(|(_, name)| name == "<init>")
                                .unwrap_or(false)
                    }
                    InjectionTarget::FieldAccess { field } => {
                        (0xb2..=0xb5).contains(&op)
                            && match field {
                                None => true,
                                Some(spec) => member_at(pool, &code.code, pc)
                                    .map(|(class_name, name)| {
                                        class_name == spec.class_name && name == spec.field_name
                                    })
                                    .unwrap_or(false),
                            }
                    }
                    _ => false,
                };
                if matches_target {
                    pcs.push(pc);
                }
                match opcode_length(&code.code, pc) {
                    Ok(length) => pc += length,
                    Err(_) => break,
                }
            }
            pcs
        }
    }
}

fn member_at(pool: &ConstantPool, code: &[u8], pc: usize) -> Option<(String, String)> {
    let bytes = code.get(pc + 1..pc + 3)?;
    let index = u16::from_be_bytes([bytes[0], bytes[1]]);
    let (class_name, name, _) = pool.member_ref(index)?;
    Some((class_name.into_owned(), name.into_owned()))
}

pub struct JvmPayload {
    pub code: Vec<u8>,
    pub stack_delta: u16,
}

fn push_indexed(code: &mut Vec<u8>, opcode: u8, index: u16) {
    code.push(opcode);
    code.extend_from_slice(&index.to_be_bytes());
}

/// Emit a payload as JVM bytecode, appending the constants it needs to the
/// pool. Indices of existing entries never move.
pub fn emit_jvm_payload(
    pool: &mut ConstantPool,
    payload: &InjectionPayload,
    display_name: &str,
) -> Result<JvmPayload, FormatError> {
    let mut code = vec![];
    match payload {
        InjectionPayload::PrintText(_) | InjectionPayload::ParameterDump => {
            let text = match payload {
                InjectionPayload::PrintText(text) => text.as_str(),
                // parameter values need frame layout the class file does not
                // describe per call site; the dump degrades to the signature
                _ => display_name,
            };
            let out = pool.ensure_field_ref("java/lang/System", "out", "Ljava/io/PrintStream;");
            let string = pool.ensure_string(text);
            let println = pool.ensure_method_ref(
                "java/io/PrintStream",
                "println",
                "(Ljava/lang/String;)V",
            );
            push_indexed(&mut code, 0xb2, out); // getstatic
            push_indexed(&mut code, 0x13, string); // ldc_w
            push_indexed(&mut code, 0xb6, println); // invokevirtual
            Ok(JvmPayload {
                code,
                stack_delta: 2,
            })
        }
        InjectionPayload::Crash => {
            let exception = pool.ensure_class("java/lang/RuntimeException");
            let init = pool.ensure_method_ref("java/lang/RuntimeException", "<init>", "()V");
            push_indexed(&mut code, 0xbb, exception); // new
            code.push(0x59); // dup
            push_indexed(&mut code, 0xb7, init); // invokespecial
            code.push(0xbf); // athrow
            Ok(JvmPayload {
                code,
                stack_delta: 2,
            })
        }
        InjectionPayload::GcCall => {
            let gc = pool.ensure_method_ref("java/lang/System", "gc", "()V");
            push_indexed(&mut code, 0xb8, gc); // invokestatic
            Ok(JvmPayload {
                code,
                stack_delta: 0,
            })
        }
        InjectionPayload::StackTraceDump => {
            let dump = pool.ensure_method_ref("java/lang/Thread", "dumpStack", "()V");
            push_indexed(&mut code, 0xb8, dump);
            Ok(JvmPayload {
                code,
                stack_delta: 0,
            })
        }
        InjectionPayload::FieldSnapshot {
            class_name,
            field_name,
            descriptor,
        } => {
            let out = pool.ensure_field_ref("java/lang/System", "out", "Ljava/io/PrintStream;");
            let field = pool.ensure_field_ref(class_name, field_name, descriptor);
            let println = pool.ensure_method_ref(
                "java/io/PrintStream",
                "println",
                println_descriptor(descriptor),
            );
            push_indexed(&mut code, 0xb2, out);
            push_indexed(&mut code, 0xb2, field);
            push_indexed(&mut code, 0xb6, println);
            let width = if matches!(descriptor.chars().next(), Some('J') | Some('D')) {
                2
            } else {
                1
            };
            Ok(JvmPayload {
                code,
                stack_delta: 1 + width,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedex_models::models::InstructionOffset;

    fn code_of(insns: Vec<Instruction>) -> CodeItem {
        let mut offset = 0u32;
        let insns = insns
            .into_iter()
            .map(|insn| {
                let size = insn.size();
                let entry = (size, InstructionOffset(offset), insn);
                offset += entry.0 .0;
                entry
            })
            .collect();
        CodeItem {
            registers_size: 4,
            ins_size: 1,
            outs_size: 1,
            debug_info_off: 0,
            insns,
            tries: vec![],
            handlers: vec![],
        }
    }

    fn empty_file() -> DexFile {
        DexFile {
            identifier: String::new(),
            file_name: String::new(),
            header: Default::default(),
            strings: vec![],
            types: vec![],
            protos: vec![],
            fields: vec![],
            methods: vec![],
            classes: vec![],
        }
    }

    #[test]
    fn exit_target_finds_every_return() {
        let code = code_of(vec![
            Instruction::ConstLit16(0, 1),
            Instruction::Return(0),
            Instruction::ConstLit16(0, 2),
            Instruction::ReturnVoid,
        ]);
        let file = empty_file();
        assert_eq!(
            dex_targets(&file, &code, &InjectionTarget::MethodExit),
            vec![1, 3]
        );
        assert_eq!(
            dex_targets(&file, &code, &InjectionTarget::MethodEntry),
            vec![0]
        );
    }

    #[test]
    fn exception_handler_target_scans_move_exception() {
        let code = code_of(vec![
            Instruction::ConstLit16(0, 1),
            Instruction::MoveException(1),
            Instruction::Throw(1),
            Instruction::ReturnVoid,
        ]);
        let file = empty_file();
        assert_eq!(
            dex_targets(&file, &code, &InjectionTarget::ExceptionHandler),
            vec![1]
        );
        assert_eq!(
            dex_targets(&file, &code, &InjectionTarget::ThrowSite),
            vec![2]
        );
    }

    #[test]
    fn print_payload_reaches_through_the_range_form() {
        let mut pools = DexPools {
            strings: vec![],
            types: vec![],
            protos: vec![],
            fields: vec![],
            methods: vec![],
        };
        let frame = DexFrame {
            registers_size: 4,
            ins_size: 1,
            is_static: false,
            proto: "()V",
            display_name: "LFoo;->bar()V",
        };
        let payload =
            emit_dex_payload(&mut pools, &InjectionPayload::PrintText("hi".into()), &frame)
                .unwrap();
        assert_eq!(payload.scratch_registers, 2);
        assert!(matches!(
            payload.instructions[0],
            Instruction::StaticGet(4, _, FieldOpType::Object)
        ));
        assert!(matches!(
            payload.instructions[1],
            Instruction::ConstString(5, _)
        ));
        assert!(matches!(
            payload.instructions[2],
            Instruction::InvokeRange(InvokeKind::Virtual, 2, _, 4)
        ));
        // the pool now knows System.out and println
        assert!(pools
            .methods
            .iter()
            .any(|m| m.method_name == "println"));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut pools = DexPools {
            strings: vec![],
            types: vec![],
            protos: vec![],
            fields: vec![],
            methods: vec![],
        };
        let frame = DexFrame {
            registers_size: 400,
            ins_size: 1,
            is_static: true,
            proto: "()V",
            display_name: "big",
        };
        assert!(
            emit_dex_payload(&mut pools, &InjectionPayload::PrintText("x".into()), &frame).is_err()
        );
    }

    #[test]
    fn jvm_print_payload_is_nine_bytes() {
        let mut pool = ConstantPool::new();
        let payload =
            emit_jvm_payload(&mut pool, &InjectionPayload::PrintText("hi".into()), "m").unwrap();
        assert_eq!(payload.code.len(), 9);
        assert_eq!(payload.code[0], 0xb2);
        assert_eq!(payload.code[3], 0x13);
        assert_eq!(payload.code[6], 0xb6);
        assert_eq!(payload.stack_delta, 2);
    }
}
