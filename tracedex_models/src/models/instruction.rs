// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The dalvik instruction stream. Instructions that matter for reference
//! extraction and bytecode patching get named variants; everything else is
//! carried as raw units so a stream always re-encodes to the exact bytes it
//! was decoded from.

use std::{
    convert::TryFrom,
    fmt::Debug,
    io::{Read, Seek},
};

pub use ux::{i4, u4};

use super::{Decode, FormatError, InstructionOffset, InstructionSize};

/// The comparison of a two-register or against-zero branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestFunction {
    Equal,
    NotEqual,
    LessThan,
    GreaterEqual,
    GreaterThan,
    LessEqual,
}

impl From<u8> for TestFunction {
    fn from(value: u8) -> Self {
        match value {
            0 => TestFunction::Equal,
            1 => TestFunction::NotEqual,
            2 => TestFunction::LessThan,
            3 => TestFunction::GreaterEqual,
            4 => TestFunction::GreaterThan,
            _ => TestFunction::LessEqual,
        }
    }
}

impl TestFunction {
    fn ordinal(&self) -> u8 {
        match self {
            TestFunction::Equal => 0,
            TestFunction::NotEqual => 1,
            TestFunction::LessThan => 2,
            TestFunction::GreaterEqual => 3,
            TestFunction::GreaterThan => 4,
            TestFunction::LessEqual => 5,
        }
    }
}

/// Dispatch kind of an invoke. The quick forms only occur in odex input and
/// carry a vtable slot instead of a method index until the class-path pass
/// rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Virtual,
    Super,
    Direct,
    Static,
    Interface,
    VirtualQuick,
    SuperQuick,
}

impl InvokeKind {
    fn opcode_35c(&self) -> u8 {
        match self {
            InvokeKind::Virtual => 0x6e,
            InvokeKind::Super => 0x6f,
            InvokeKind::Direct => 0x70,
            InvokeKind::Static => 0x71,
            InvokeKind::Interface => 0x72,
            InvokeKind::VirtualQuick => 0xf8,
            InvokeKind::SuperQuick => 0xfa,
        }
    }

    fn opcode_range(&self) -> u8 {
        match self {
            InvokeKind::Virtual => 0x74,
            InvokeKind::Super => 0x75,
            InvokeKind::Direct => 0x76,
            InvokeKind::Static => 0x77,
            InvokeKind::Interface => 0x78,
            InvokeKind::VirtualQuick => 0xf9,
            InvokeKind::SuperQuick => 0xfb,
        }
    }

    pub fn is_quick(&self) -> bool {
        matches!(self, InvokeKind::VirtualQuick | InvokeKind::SuperQuick)
    }
}

/// Width class of a field access; the opcode is the family base plus this
/// offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldOpType {
    Default,
    Wide,
    Object,
    Boolean,
    Byte,
    Char,
    Short,
}

impl FieldOpType {
    fn from_offset(offset: u8) -> FieldOpType {
        match offset {
            0 => FieldOpType::Default,
            1 => FieldOpType::Wide,
            2 => FieldOpType::Object,
            3 => FieldOpType::Boolean,
            4 => FieldOpType::Byte,
            5 => FieldOpType::Char,
            _ => FieldOpType::Short,
        }
    }

    fn offset(&self) -> u8 {
        match self {
            FieldOpType::Default => 0,
            FieldOpType::Wide => 1,
            FieldOpType::Object => 2,
            FieldOpType::Boolean => 3,
            FieldOpType::Byte => 4,
            FieldOpType::Char => 5,
            FieldOpType::Short => 6,
        }
    }
}

/// A decoded switch payload. The random id keeps payloads distinguishable
/// after cloning a stream, since equality on targets alone would conflate
/// identical tables.
#[derive(Debug, Clone, Eq)]
pub struct SwitchPayload {
    id: u32,
    pub packed: bool,
    pub first_key: i32,
    /// (key, target) pairs; targets are unit offsets relative to the switch
    /// instruction, not the payload.
    pub targets: Vec<(i32, i32)>,
}

impl PartialEq for SwitchPayload {
    fn eq(&self, other: &Self) -> bool {
        self.packed == other.packed
            && self.first_key == other.first_key
            && self.targets == other.targets
    }
}

#[allow(clippy::derived_hash_with_manual_eq)]
impl std::hash::Hash for SwitchPayload {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl SwitchPayload {
    pub fn new(packed: bool, first_key: i32, targets: Vec<(i32, i32)>) -> SwitchPayload {
        SwitchPayload {
            id: rand::random(),
            packed,
            first_key,
            targets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instruction {
    Nop,

    ConstLit4(u4, i4),
    ConstLit16(u8, i16),
    ConstLit32(u8, i32),
    ConstHigh16(u8, i16),
    ConstString(u8, u16),
    ConstStringJumbo(u8, u32),
    ConstClass(u8, u16),

    MoveResult(u8),
    MoveResultWide(u8),
    MoveResultObject(u8),
    MoveException(u8),

    ReturnVoid,
    Return(u8),
    ReturnWide(u8),
    ReturnObject(u8),

    MonitorEnter(u8),
    MonitorExit(u8),

    NewInstance(u8, u16),
    FillArrayData(u8, i32),
    Throw(u8),

    Goto8(i8),
    Goto16(i16),
    Goto32(i32),

    PackedSwitch(u8, i32),
    SparseSwitch(u8, i32),

    Test(TestFunction, u4, u4, i16),
    TestZero(TestFunction, u8, i16),

    InstanceGet(u4, u4, u16, FieldOpType),
    InstancePut(u4, u4, u16, FieldOpType),
    StaticGet(u8, u16, FieldOpType),
    StaticPut(u8, u16, FieldOpType),

    /// 35c form: argument count, method (or vtable) index, registers C..G.
    Invoke35c(InvokeKind, u8, u16, [u8; 5]),
    /// Range form: register count, method (or vtable) index, first register.
    InvokeRange(InvokeKind, u8, u16, u16),

    /// fill-array-data payload: element width plus raw element bytes.
    ArrayData(u16, Vec<u8>),
    SwitchData(SwitchPayload),

    /// Anything without a named variant, kept as its raw units including the
    /// opcode unit.
    Other(Vec<u16>),
}

impl Instruction {
    /// Instruction length in 16-bit units for every non-payload opcode.
    pub fn unit_len(opcode: u8) -> u32 {
        match opcode {
            0x00
            | 0x01
            | 0x04
            | 0x07
            | 0x0a..=0x12
            | 0x1d..=0x1e
            | 0x21
            | 0x27..=0x28
            | 0x73
            | 0x79..=0x8f
            | 0xb0..=0xcf
            | 0xe3..=0xf7 => 1,

            0x02
            | 0x05
            | 0x08
            | 0x13
            | 0x15..=0x16
            | 0x19..=0x1a
            | 0x1c
            | 0x1f..=0x20
            | 0x22..=0x23
            | 0x29
            | 0x2d..=0x3d
            | 0x44..=0x6d
            | 0x90..=0xaf
            | 0xd0..=0xe2
            | 0xfe..=0xff => 2,

            0x03
            | 0x06
            | 0x09
            | 0x14
            | 0x17
            | 0x1b
            | 0x24..=0x26
            | 0x2a..=0x2c
            | 0x6e..=0x72
            | 0x74..=0x78
            | 0xf8..=0xfd => 3,

            0x18 => 5,

            _ => 1,
        }
    }

    fn decode_35c(kind: InvokeKind, op: u16, data: &[u16]) -> Instruction {
        let high = (op >> 8) as u8;
        let arg_count = (high >> 4) & 0b1111;
        let regs = [
            (data[1] & 0x000f) as u8,
            ((data[1] & 0x00f0) >> 4) as u8,
            ((data[1] & 0x0f00) >> 8) as u8,
            ((data[1] & 0xf000) >> 12) as u8,
            high & 0b1111,
        ];
        Instruction::Invoke35c(kind, arg_count, data[0], regs)
    }

    /// Decode one non-payload instruction from its opcode unit and the
    /// already-read trailing units.
    pub fn decode(op: u16, data: &[u16]) -> Instruction {
        let high = (op >> 8) as u8;
        let opcode = (op & 0xff) as u8;
        match opcode {
            0x00 => Instruction::Nop,

            0x0a => Instruction::MoveResult(high),
            0x0b => Instruction::MoveResultWide(high),
            0x0c => Instruction::MoveResultObject(high),
            0x0d => Instruction::MoveException(high),

            0x0e => Instruction::ReturnVoid,
            0x0f => Instruction::Return(high),
            0x10 => Instruction::ReturnWide(high),
            0x11 => Instruction::ReturnObject(high),

            0x12 => Instruction::ConstLit4(
                u4::new(high & 0b1111),
                i4::new(((high & 0xf0) as i8) >> 4),
            ),
            0x13 => Instruction::ConstLit16(high, data[0] as i16),
            0x14 => Instruction::ConstLit32(
                high,
                (((data[1] as u32) << 16) | data[0] as u32) as i32,
            ),
            0x15 => Instruction::ConstHigh16(high, data[0] as i16),
            0x1a => Instruction::ConstString(high, data[0]),
            0x1b => Instruction::ConstStringJumbo(
                high,
                ((data[1] as u32) << 16) | data[0] as u32,
            ),
            0x1c => Instruction::ConstClass(high, data[0]),

            0x1d => Instruction::MonitorEnter(high),
            0x1e => Instruction::MonitorExit(high),

            0x22 => Instruction::NewInstance(high, data[0]),
            0x26 => Instruction::FillArrayData(
                high,
                (((data[1] as u32) << 16) | data[0] as u32) as i32,
            ),
            0x27 => Instruction::Throw(high),

            0x28 => Instruction::Goto8(high as i8),
            0x29 => Instruction::Goto16(data[0] as i16),
            0x2a => Instruction::Goto32((((data[1] as u32) << 16) | data[0] as u32) as i32),

            0x2b => Instruction::PackedSwitch(
                high,
                (((data[1] as u32) << 16) | data[0] as u32) as i32,
            ),
            0x2c => Instruction::SparseSwitch(
                high,
                (((data[1] as u32) << 16) | data[0] as u32) as i32,
            ),

            0x32..=0x37 => Instruction::Test(
                (opcode - 0x32).into(),
                u4::new(high & 0b1111),
                u4::new(high >> 4),
                data[0] as i16,
            ),
            0x38..=0x3d => Instruction::TestZero((opcode - 0x38).into(), high, data[0] as i16),

            0x52..=0x58 => Instruction::InstanceGet(
                u4::new(high & 0b1111),
                u4::new(high >> 4),
                data[0],
                FieldOpType::from_offset(opcode - 0x52),
            ),
            0x59..=0x5f => Instruction::InstancePut(
                u4::new(high & 0b1111),
                u4::new(high >> 4),
                data[0],
                FieldOpType::from_offset(opcode - 0x59),
            ),
            0x60..=0x66 => {
                Instruction::StaticGet(high, data[0], FieldOpType::from_offset(opcode - 0x60))
            }
            0x67..=0x6d => {
                Instruction::StaticPut(high, data[0], FieldOpType::from_offset(opcode - 0x67))
            }

            0x6e => Self::decode_35c(InvokeKind::Virtual, op, data),
            0x6f => Self::decode_35c(InvokeKind::Super, op, data),
            0x70 => Self::decode_35c(InvokeKind::Direct, op, data),
            0x71 => Self::decode_35c(InvokeKind::Static, op, data),
            0x72 => Self::decode_35c(InvokeKind::Interface, op, data),

            0x74 => Instruction::InvokeRange(InvokeKind::Virtual, high, data[0], data[1]),
            0x75 => Instruction::InvokeRange(InvokeKind::Super, high, data[0], data[1]),
            0x76 => Instruction::InvokeRange(InvokeKind::Direct, high, data[0], data[1]),
            0x77 => Instruction::InvokeRange(InvokeKind::Static, high, data[0], data[1]),
            0x78 => Instruction::InvokeRange(InvokeKind::Interface, high, data[0], data[1]),

            0xf8 => Self::decode_35c(InvokeKind::VirtualQuick, op, data),
            0xf9 => Instruction::InvokeRange(InvokeKind::VirtualQuick, high, data[0], data[1]),
            0xfa => Self::decode_35c(InvokeKind::SuperQuick, op, data),
            0xfb => Instruction::InvokeRange(InvokeKind::SuperQuick, high, data[0], data[1]),

            _ => {
                let mut units = vec![op];
                units.extend_from_slice(data);
                Instruction::Other(units)
            }
        }
    }

    /// Re-encode into 16-bit units, the inverse of `decode`/`read_stream`.
    pub fn to_units(&self) -> Vec<u16> {
        let unit = |opcode: u8, high: u8| ((high as u16) << 8) | opcode as u16;
        let split32 = |v: u32| [(v & 0xffff) as u16, (v >> 16) as u16];
        match self {
            Instruction::Nop => vec![0x0000],

            Instruction::ConstLit4(dst, lit) => {
                let high = (u8::from(*dst) & 0b1111) | ((i8::from(*lit) as u8) << 4);
                vec![unit(0x12, high)]
            }
            Instruction::ConstLit16(dst, lit) => vec![unit(0x13, *dst), *lit as u16],
            Instruction::ConstLit32(dst, lit) => {
                let [lo, hi] = split32(*lit as u32);
                vec![unit(0x14, *dst), lo, hi]
            }
            Instruction::ConstHigh16(dst, lit) => vec![unit(0x15, *dst), *lit as u16],
            Instruction::ConstString(dst, idx) => vec![unit(0x1a, *dst), *idx],
            Instruction::ConstStringJumbo(dst, idx) => {
                let [lo, hi] = split32(*idx);
                vec![unit(0x1b, *dst), lo, hi]
            }
            Instruction::ConstClass(dst, idx) => vec![unit(0x1c, *dst), *idx],

            Instruction::MoveResult(dst) => vec![unit(0x0a, *dst)],
            Instruction::MoveResultWide(dst) => vec![unit(0x0b, *dst)],
            Instruction::MoveResultObject(dst) => vec![unit(0x0c, *dst)],
            Instruction::MoveException(dst) => vec![unit(0x0d, *dst)],

            Instruction::ReturnVoid => vec![0x000e],
            Instruction::Return(src) => vec![unit(0x0f, *src)],
            Instruction::ReturnWide(src) => vec![unit(0x10, *src)],
            Instruction::ReturnObject(src) => vec![unit(0x11, *src)],

            Instruction::MonitorEnter(src) => vec![unit(0x1d, *src)],
            Instruction::MonitorExit(src) => vec![unit(0x1e, *src)],

            Instruction::NewInstance(dst, type_idx) => vec![unit(0x22, *dst), *type_idx],
            Instruction::FillArrayData(src, offset) => {
                let [lo, hi] = split32(*offset as u32);
                vec![unit(0x26, *src), lo, hi]
            }
            Instruction::Throw(src) => vec![unit(0x27, *src)],

            Instruction::Goto8(offset) => vec![unit(0x28, *offset as u8)],
            Instruction::Goto16(offset) => vec![0x0029, *offset as u16],
            Instruction::Goto32(offset) => {
                let [lo, hi] = split32(*offset as u32);
                vec![0x002a, lo, hi]
            }

            Instruction::PackedSwitch(src, offset) => {
                let [lo, hi] = split32(*offset as u32);
                vec![unit(0x2b, *src), lo, hi]
            }
            Instruction::SparseSwitch(src, offset) => {
                let [lo, hi] = split32(*offset as u32);
                vec![unit(0x2c, *src), lo, hi]
            }

            Instruction::Test(func, a, b, offset) => {
                let high = (u8::from(*a) & 0b1111) | (u8::from(*b) << 4);
                vec![unit(0x32 + func.ordinal(), high), *offset as u16]
            }
            Instruction::TestZero(func, a, offset) => {
                vec![unit(0x38 + func.ordinal(), *a), *offset as u16]
            }

            Instruction::InstanceGet(a, b, field, ty) => {
                let high = (u8::from(*a) & 0b1111) | (u8::from(*b) << 4);
                vec![unit(0x52 + ty.offset(), high), *field]
            }
            Instruction::InstancePut(a, b, field, ty) => {
                let high = (u8::from(*a) & 0b1111) | (u8::from(*b) << 4);
                vec![unit(0x59 + ty.offset(), high), *field]
            }
            Instruction::StaticGet(a, field, ty) => vec![unit(0x60 + ty.offset(), *a), *field],
            Instruction::StaticPut(a, field, ty) => vec![unit(0x67 + ty.offset(), *a), *field],

            Instruction::Invoke35c(kind, arg_count, idx, regs) => {
                let high = ((arg_count & 0b1111) << 4) | (regs[4] & 0b1111);
                let packed = ((regs[3] as u16 & 0xf) << 12)
                    | ((regs[2] as u16 & 0xf) << 8)
                    | ((regs[1] as u16 & 0xf) << 4)
                    | (regs[0] as u16 & 0xf);
                vec![unit(kind.opcode_35c(), high), *idx, packed]
            }
            Instruction::InvokeRange(kind, count, idx, first) => {
                vec![unit(kind.opcode_range(), *count), *idx, *first]
            }

            Instruction::ArrayData(element_width, data) => {
                let count = if *element_width == 0 {
                    0
                } else {
                    data.len() as u32 / *element_width as u32
                };
                let mut units = vec![0x0300, *element_width];
                units.extend_from_slice(&split32(count));
                for chunk in data.chunks(2) {
                    let lo = chunk[0] as u16;
                    let hi = if chunk.len() > 1 { chunk[1] as u16 } else { 0 };
                    units.push((hi << 8) | lo);
                }
                units
            }
            Instruction::SwitchData(payload) => {
                let mut units = vec![];
                if payload.packed {
                    units.push(0x0100);
                    units.push(payload.targets.len() as u16);
                    units.extend_from_slice(&split32(payload.first_key as u32));
                    for &(_, target) in &payload.targets {
                        units.extend_from_slice(&split32(target as u32));
                    }
                } else {
                    units.push(0x0200);
                    units.push(payload.targets.len() as u16);
                    for &(key, _) in &payload.targets {
                        units.extend_from_slice(&split32(key as u32));
                    }
                    for &(_, target) in &payload.targets {
                        units.extend_from_slice(&split32(target as u32));
                    }
                }
                units
            }

            Instruction::Other(units) => units.clone(),
        }
    }

    /// Unit length of this decoded instruction.
    pub fn size(&self) -> InstructionSize {
        InstructionSize(self.to_units().len() as u32)
    }

    /// The branch offset in units relative to this instruction, for every
    /// variant that carries one.
    pub fn branch_offset(&self) -> Option<i32> {
        match self {
            Instruction::Goto8(offset) => Some(*offset as i32),
            Instruction::Goto16(offset) => Some(*offset as i32),
            Instruction::Goto32(offset) => Some(*offset),
            Instruction::Test(_, _, _, offset) => Some(*offset as i32),
            Instruction::TestZero(_, _, offset) => Some(*offset as i32),
            Instruction::PackedSwitch(_, offset) => Some(*offset),
            Instruction::SparseSwitch(_, offset) => Some(*offset),
            Instruction::FillArrayData(_, offset) => Some(*offset),
            _ => None,
        }
    }

    /// The same instruction with its branch offset replaced. Errors when the
    /// new offset does not fit the encoding width.
    pub fn with_branch_offset(&self, offset: i32) -> Result<Instruction, FormatError> {
        let narrow16 = |offset: i32| -> Result<i16, FormatError> {
            i16::try_from(offset)
                .map_err(|_| FormatError::corrupt("branch offset exceeds 16 bits"))
        };
        Ok(match self {
            Instruction::Goto8(_) => {
                let offset = i8::try_from(offset)
                    .map_err(|_| FormatError::corrupt("branch offset exceeds 8 bits"))?;
                Instruction::Goto8(offset)
            }
            Instruction::Goto16(_) => Instruction::Goto16(narrow16(offset)?),
            Instruction::Goto32(_) => Instruction::Goto32(offset),
            Instruction::Test(func, a, b, _) => {
                Instruction::Test(*func, *a, *b, narrow16(offset)?)
            }
            Instruction::TestZero(func, a, _) => {
                Instruction::TestZero(*func, *a, narrow16(offset)?)
            }
            Instruction::PackedSwitch(src, _) => Instruction::PackedSwitch(*src, offset),
            Instruction::SparseSwitch(src, _) => Instruction::SparseSwitch(*src, offset),
            Instruction::FillArrayData(src, _) => Instruction::FillArrayData(*src, offset),
            other => other.clone(),
        })
    }

    pub fn is_return(&self) -> bool {
        matches!(
            self,
            Instruction::ReturnVoid
                | Instruction::Return(_)
                | Instruction::ReturnWide(_)
                | Instruction::ReturnObject(_)
        )
    }

    pub fn is_payload(&self) -> bool {
        matches!(
            self,
            Instruction::ArrayData(_, _) | Instruction::SwitchData(_)
        )
    }

    /// Decode a whole instruction stream of `insns_size` 16-bit units,
    /// yielding each instruction with its unit size and offset.
    pub fn read_stream<R: Read + Seek>(
        byte_view: &mut R,
        insns_size: u32,
    ) -> Result<Vec<(InstructionSize, InstructionOffset, Instruction)>, FormatError> {
        let mut insns = vec![];
        let mut i = 0u32;
        while i < insns_size {
            let op = u16::from_bytes(byte_view)?;
            let opcode = (op & 0xff) as u8;
            let ident = (op >> 8) as u8;
            if opcode == 0 && (1..=3).contains(&ident) {
                let (size, insn) = Self::read_payload(byte_view, ident)?;
                insns.push((InstructionSize(size), InstructionOffset(i), insn));
                i += size;
                continue;
            }
            let unit_len = Self::unit_len(opcode);
            let mut data = Vec::with_capacity((unit_len - 1) as usize);
            for _ in 0..unit_len - 1 {
                data.push(u16::from_bytes(byte_view)?);
            }
            let insn = Instruction::decode(op, &data);
            insns.push((InstructionSize(unit_len), InstructionOffset(i), insn));
            i += unit_len;
        }
        if i != insns_size {
            return Err(FormatError::corrupt(
                "instruction stream overruns its declared size",
            ));
        }
        Ok(insns)
    }

    fn read_payload<R: Read + Seek>(
        byte_view: &mut R,
        ident: u8,
    ) -> Result<(u32, Instruction), FormatError> {
        match ident {
            0x01 => {
                let size = u16::from_bytes(byte_view)? as u32;
                let first_key = i32::from_bytes(byte_view)?;
                let mut targets = Vec::with_capacity(size as usize);
                for n in 0..size as i32 {
                    targets.push((first_key + n, i32::from_bytes(byte_view)?));
                }
                Ok((
                    size * 2 + 4,
                    Instruction::SwitchData(SwitchPayload::new(true, first_key, targets)),
                ))
            }
            0x02 => {
                let size = u16::from_bytes(byte_view)? as u32;
                let mut keys = Vec::with_capacity(size as usize);
                for _ in 0..size {
                    keys.push(i32::from_bytes(byte_view)?);
                }
                let mut targets = Vec::with_capacity(size as usize);
                for key in keys {
                    targets.push((key, i32::from_bytes(byte_view)?));
                }
                let first_key = targets.first().map(|&(k, _)| k).unwrap_or(0);
                Ok((
                    size * 4 + 2,
                    Instruction::SwitchData(SwitchPayload::new(false, first_key, targets)),
                ))
            }
            0x03 => {
                let element_width = u16::from_bytes(byte_view)?;
                let count = u32::from_bytes(byte_view)?;
                let byte_len = element_width as u32 * count;
                let mut data = vec![0u8; byte_len as usize];
                byte_view.read_exact(&mut data)?;
                if byte_len % 2 != 0 {
                    u8::from_bytes(byte_view)?;
                }
                Ok((
                    (byte_len + 1) / 2 + 4,
                    Instruction::ArrayData(element_width, data),
                ))
            }
            _ => Err(FormatError::corrupt("unknown payload ident")),
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::ConstLit4(_, _) => "const/4",
            Instruction::ConstLit16(_, _) => "const/16",
            Instruction::ConstLit32(_, _) => "const",
            Instruction::ConstHigh16(_, _) => "const/high16",
            Instruction::ConstString(_, _) => "const-string",
            Instruction::ConstStringJumbo(_, _) => "const-string/jumbo",
            Instruction::ConstClass(_, _) => "const-class",
            Instruction::MoveResult(_) => "move-result",
            Instruction::MoveResultWide(_) => "move-result-wide",
            Instruction::MoveResultObject(_) => "move-result-object",
            Instruction::MoveException(_) => "move-exception",
            Instruction::ReturnVoid => "return-void",
            Instruction::Return(_) => "return",
            Instruction::ReturnWide(_) => "return-wide",
            Instruction::ReturnObject(_) => "return-object",
            Instruction::MonitorEnter(_) => "monitor-enter",
            Instruction::MonitorExit(_) => "monitor-exit",
            Instruction::NewInstance(_, _) => "new-instance",
            Instruction::FillArrayData(_, _) => "fill-array-data",
            Instruction::Throw(_) => "throw",
            Instruction::Goto8(_) => "goto",
            Instruction::Goto16(_) => "goto/16",
            Instruction::Goto32(_) => "goto/32",
            Instruction::PackedSwitch(_, _) => "packed-switch",
            Instruction::SparseSwitch(_, _) => "sparse-switch",
            Instruction::Test(_, _, _, _) => "if-test",
            Instruction::TestZero(_, _, _) => "if-testz",
            Instruction::InstanceGet(_, _, _, _) => "iget",
            Instruction::InstancePut(_, _, _, _) => "iput",
            Instruction::StaticGet(_, _, _) => "sget",
            Instruction::StaticPut(_, _, _) => "sput",
            Instruction::Invoke35c(_, _, _, _) => "invoke",
            Instruction::InvokeRange(_, _, _, _) => "invoke/range",
            Instruction::ArrayData(_, _) => "array-data",
            Instruction::SwitchData(_) => "switch-data",
            Instruction::Other(_) => "raw",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn units_to_bytes(units: &[u16]) -> Vec<u8> {
        units.iter().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn decode_const_string_and_back() {
        let units = [0x011au16, 0x002a];
        let bytes = units_to_bytes(&units);
        let insns = Instruction::read_stream(&mut Cursor::new(bytes), 2).unwrap();
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].2, Instruction::ConstString(1, 0x2a));
        assert_eq!(insns[0].2.to_units(), units);
    }

    #[test]
    fn decode_invoke_virtual() {
        // invoke-virtual {v1, v2}, method@5
        let insn = Instruction::decode(0x206e, &[5, 0x0021]);
        match insn {
            Instruction::Invoke35c(InvokeKind::Virtual, 2, 5, regs) => {
                assert_eq!(&regs[..2], &[1, 2]);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
        assert_eq!(insn.to_units(), vec![0x206e, 5, 0x0021]);
    }

    #[test]
    fn negative_const_lit4() {
        let insn = Instruction::decode(0xe112, &[]);
        assert_eq!(
            insn,
            Instruction::ConstLit4(u4::new(1), i4::new(-2))
        );
        assert_eq!(insn.to_units(), vec![0xe112]);
    }

    #[test]
    fn branch_offset_roundtrip() {
        let insn = Instruction::decode(0x1228, &[]);
        assert_eq!(insn, Instruction::Goto8(0x12));
        assert_eq!(insn.branch_offset(), Some(0x12));
        let moved = insn.with_branch_offset(-3).unwrap();
        assert_eq!(moved.to_units(), vec![0xfd28]);
        assert!(insn.with_branch_offset(300).is_err());
    }

    #[test]
    fn unknown_opcode_keeps_raw_units() {
        // const-wide v0, lit64 is carried verbatim
        let units = [0x0018u16, 1, 2, 3, 4];
        let bytes = units_to_bytes(&units);
        let insns = Instruction::read_stream(&mut Cursor::new(bytes), 5).unwrap();
        assert_eq!(insns[0].2, Instruction::Other(units.to_vec()));
        assert_eq!(insns[0].2.to_units(), units);
    }

    #[test]
    fn packed_switch_payload_roundtrip() {
        let payload = SwitchPayload::new(true, 10, vec![(10, 4), (11, 8)]);
        let insn = Instruction::SwitchData(payload);
        let units = insn.to_units();
        assert_eq!(units[0], 0x0100);
        let bytes = units_to_bytes(&units);
        let insns = Instruction::read_stream(&mut Cursor::new(bytes), units.len() as u32).unwrap();
        assert_eq!(insns[0].2, insn);
    }

    #[test]
    fn sparse_switch_payload_roundtrip() {
        let payload = SwitchPayload::new(false, -5, vec![(-5, 4), (100, 8)]);
        let insn = Instruction::SwitchData(payload);
        let units = insn.to_units();
        assert_eq!(units[0], 0x0200);
        let bytes = units_to_bytes(&units);
        let insns = Instruction::read_stream(&mut Cursor::new(bytes), units.len() as u32).unwrap();
        assert_eq!(insns[0].2, insn);
    }

    #[test]
    fn array_data_odd_length_is_padded() {
        let insn = Instruction::ArrayData(1, vec![1, 2, 3]);
        let units = insn.to_units();
        assert_eq!(units.len(), 6);
        let bytes = units_to_bytes(&units);
        let insns = Instruction::read_stream(&mut Cursor::new(bytes), units.len() as u32).unwrap();
        assert_eq!(insns[0].2, insn);
    }
}
