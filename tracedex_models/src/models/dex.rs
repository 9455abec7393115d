// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Structures of the dex container: header, id pools, class definitions,
//! class data, code items with try/handler tables and encoded values.

use std::{
    borrow::Cow,
    io::{Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use bitflags::bitflags;
use tracedex_macros::iterator;

#[cfg(not(target_arch = "wasm32"))]
use rayon::prelude::*;

use super::{Decode, Encode, FormatError, Instruction};

pub const DEX_MAGIC: &[u8; 4] = b"dex\n";
pub const ODEX_MAGIC: &[u8; 4] = b"dey\n";
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;
pub const NO_INDEX: u32 = 0xffff_ffff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    pub struct AccessFlags: u64 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

impl std::fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.get_string_representation())
    }
}

impl AccessFlags {
    pub fn get_string_representation(&self) -> String {
        let mut flags = vec![];
        if self.contains(AccessFlags::PUBLIC) {
            flags.push("public");
        } else if self.contains(AccessFlags::PRIVATE) {
            flags.push("private");
        } else if self.contains(AccessFlags::PROTECTED) {
            flags.push("protected");
        }
        if self.contains(AccessFlags::STATIC) {
            flags.push("static");
        }
        if self.contains(AccessFlags::FINAL) {
            flags.push("final");
        }
        if self.contains(AccessFlags::SYNCHRONIZED) {
            flags.push("synchronized");
        }
        if self.contains(AccessFlags::NATIVE) {
            flags.push("native");
        }
        if self.contains(AccessFlags::INTERFACE) {
            flags.push("interface");
        }
        if self.contains(AccessFlags::ABSTRACT) {
            flags.push("abstract");
        }
        if self.contains(AccessFlags::ENUM) {
            flags.push("enum");
        }
        if self.contains(AccessFlags::CONSTRUCTOR) {
            flags.push("constructor");
        }
        flags.join(" ")
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DexHeader {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
}

impl DexHeader {
    pub const SIZE: u32 = 0x70;

    pub fn is_dex(&self) -> bool {
        &self.magic[..4] == DEX_MAGIC
    }

    /// Device-optimized dex, pre-linked against one class layout. Needs the
    /// class-path pass before quick instructions can be classified.
    pub fn is_odex(&self) -> bool {
        &self.magic[..4] == ODEX_MAGIC
    }
}

impl Decode for DexHeader {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let mut magic = [0u8; 8];
        byte_view.read_exact(&mut magic)?;
        if &magic[..4] != DEX_MAGIC && &magic[..4] != ODEX_MAGIC {
            return Err(FormatError::NotADexFile);
        }
        let checksum = u32::from_bytes(byte_view)?;
        let mut signature = [0u8; 20];
        byte_view.read_exact(&mut signature)?;
        Ok(DexHeader {
            magic,
            checksum,
            signature,
            file_size: u32::from_bytes(byte_view)?,
            header_size: u32::from_bytes(byte_view)?,
            endian_tag: u32::from_bytes(byte_view)?,
            link_size: u32::from_bytes(byte_view)?,
            link_off: u32::from_bytes(byte_view)?,
            map_off: u32::from_bytes(byte_view)?,
            string_ids_size: u32::from_bytes(byte_view)?,
            string_ids_off: u32::from_bytes(byte_view)?,
            type_ids_size: u32::from_bytes(byte_view)?,
            type_ids_off: u32::from_bytes(byte_view)?,
            proto_ids_size: u32::from_bytes(byte_view)?,
            proto_ids_off: u32::from_bytes(byte_view)?,
            field_ids_size: u32::from_bytes(byte_view)?,
            field_ids_off: u32::from_bytes(byte_view)?,
            method_ids_size: u32::from_bytes(byte_view)?,
            method_ids_off: u32::from_bytes(byte_view)?,
            class_defs_size: u32::from_bytes(byte_view)?,
            class_defs_off: u32::from_bytes(byte_view)?,
            data_size: u32::from_bytes(byte_view)?,
            data_off: u32::from_bytes(byte_view)?,
        })
    }
}

impl Encode for DexHeader {
    fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError> {
        writer.write_all(&self.magic)?;
        self.checksum.to_bytes(writer)?;
        writer.write_all(&self.signature)?;
        for value in [
            self.file_size,
            self.header_size,
            self.endian_tag,
            self.link_size,
            self.link_off,
            self.map_off,
            self.string_ids_size,
            self.string_ids_off,
            self.type_ids_size,
            self.type_ids_off,
            self.proto_ids_size,
            self.proto_ids_off,
            self.field_ids_size,
            self.field_ids_off,
            self.method_ids_size,
            self.method_ids_off,
            self.class_defs_size,
            self.class_defs_off,
            self.data_size,
            self.data_off,
        ]
        .iter()
        {
            value.to_bytes(writer)?;
        }
        Ok(Self::SIZE as usize)
    }
}

/// One entry of the string pool: the utf16 length and the raw MUTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StringEntry {
    pub utf16_size: u32,
    pub dat: Vec<u8>,
}

impl StringEntry {
    pub fn from_str(s: &str) -> StringEntry {
        let encoded = cesu8::to_java_cesu8(s);
        StringEntry {
            utf16_size: s.encode_utf16().count() as u32,
            dat: encoded.into_owned(),
        }
    }

    pub fn to_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.dat)
    }

    pub fn to_str_lossy(&self) -> Cow<str> {
        cesu8::from_java_cesu8(&self.dat).unwrap_or_else(|_| String::from_utf8_lossy(&self.dat))
    }
}

impl Decode for StringEntry {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let (_, utf16_size) = Self::read_leb128(byte_view)?;
        let mut dat = vec![];
        // MUTF-8 has no embedded NUL; the entry is terminated by one.
        loop {
            let byte = u8::from_bytes(byte_view)?;
            if byte == 0 {
                break;
            }
            dat.push(byte);
        }
        Ok(StringEntry {
            utf16_size: utf16_size as u32,
            dat,
        })
    }
}

impl Encode for StringEntry {
    fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError> {
        let mut written = Self::write_leb128(writer, self.utf16_size as u64)?;
        writer.write_all(&self.dat)?;
        writer.write_all(&[0])?;
        written += self.dat.len() + 1;
        Ok(written)
    }
}

/// A method prototype: shorty, return type and argument type indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Proto {
    pub shorty_idx: u32,
    pub return_type_idx: u32,
    pub parameters_off: u32,
    pub arguments: Vec<u16>,
}

impl Decode for Proto {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let shorty_idx = u32::from_bytes(byte_view)?;
        let return_type_idx = u32::from_bytes(byte_view)?;
        let parameters_off = u32::from_bytes(byte_view)?;
        let current = byte_view.seek(SeekFrom::Current(0))?;
        let mut arguments = vec![];
        if parameters_off != 0 {
            byte_view.seek(SeekFrom::Start(parameters_off as u64))?;
            let size = u32::from_bytes(byte_view)?;
            for _ in 0..size {
                arguments.push(u16::from_bytes(byte_view)?);
            }
        }
        byte_view.seek(SeekFrom::Start(current))?;
        Ok(Proto {
            shorty_idx,
            return_type_idx,
            parameters_off,
            arguments,
        })
    }
}

impl Proto {
    pub fn to_string(&self, file: &DexFile) -> String {
        let args = self
            .arguments
            .iter()
            .map(|&arg| file.get_type_name(arg).unwrap_or("INVALID").to_string())
            .collect::<Vec<_>>()
            .join("");
        format!(
            "({}){}",
            args,
            file.get_type_name(self.return_type_idx as usize)
                .unwrap_or("INVALID")
        )
    }
}

/// A field as listed in the field-id pool. The name is resolved up front to
/// save string-pool lookups, as the reference cache keys on it heavily.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FieldId {
    pub class_idx: u16,
    pub type_idx: u16,
    pub name_idx: u32,
    pub name: String,
}

impl Decode for FieldId {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        Ok(FieldId {
            class_idx: u16::from_bytes(byte_view)?,
            type_idx: u16::from_bytes(byte_view)?,
            name_idx: u32::from_bytes(byte_view)?,
            name: String::new(),
        })
    }
}

/// A method as listed in the method-id pool, with the name and prototype
/// strings attached for convenience.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MethodId {
    pub class_idx: u16,
    pub method_idx: u32,
    pub proto_idx: u16,
    pub name_idx: u32,
    pub method_name: String,
    pub proto_name: String,
}

impl Decode for MethodId {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        Ok(MethodId {
            class_idx: u16::from_bytes(byte_view)?,
            method_idx: 0,
            proto_idx: u16::from_bytes(byte_view)?,
            name_idx: u32::from_bytes(byte_view)?,
            method_name: String::new(),
            proto_name: String::new(),
        })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClassDefItem {
    pub class_idx: u32,
    pub access_flags: u32,
    pub superclass_idx: u32,
    pub interfaces_off: u32,
    pub source_file_idx: u32,
    pub annotations_off: u32,
    pub class_data_off: u32,
    pub static_values_off: u32,
}

impl Decode for ClassDefItem {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        Ok(ClassDefItem {
            class_idx: u32::from_bytes(byte_view)?,
            access_flags: u32::from_bytes(byte_view)?,
            superclass_idx: u32::from_bytes(byte_view)?,
            interfaces_off: u32::from_bytes(byte_view)?,
            source_file_idx: u32::from_bytes(byte_view)?,
            annotations_off: u32::from_bytes(byte_view)?,
            class_data_off: u32::from_bytes(byte_view)?,
            static_values_off: u32::from_bytes(byte_view)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EncodedField {
    pub field_idx: u32,
    pub access_flags: AccessFlags,
}

impl Decode for EncodedField {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let (_, diff) = Self::read_leb128(byte_view)?;
        let (_, flags) = Self::read_leb128(byte_view)?;
        Ok(EncodedField {
            field_idx: diff as u32,
            access_flags: AccessFlags::from_bits_truncate(flags),
        })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EncodedMethod {
    pub method_idx: u32,
    pub access_flags: AccessFlags,
    pub code_off: u64,
}

impl Decode for EncodedMethod {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let (_, diff) = Self::read_leb128(byte_view)?;
        let (_, flags) = Self::read_leb128(byte_view)?;
        let (_, code_off) = Self::read_leb128(byte_view)?;
        Ok(EncodedMethod {
            method_idx: diff as u32,
            access_flags: AccessFlags::from_bits_truncate(flags),
            code_off,
        })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClassData {
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

impl Decode for ClassData {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let (_, static_fields_size) = Self::read_leb128(byte_view)?;
        let (_, instance_fields_size) = Self::read_leb128(byte_view)?;
        let (_, direct_methods_size) = Self::read_leb128(byte_view)?;
        let (_, virtual_methods_size) = Self::read_leb128(byte_view)?;

        let read_fields = |byte_view: &mut R, count: u64| -> Result<Vec<EncodedField>, FormatError> {
            let mut fields = Vec::with_capacity(count as usize);
            let mut last_index = 0;
            for i in 0..count {
                let mut field = EncodedField::from_bytes(byte_view)?;
                // indices are diff-encoded against the previous entry
                if i == 0 {
                    last_index = field.field_idx;
                } else {
                    last_index += field.field_idx;
                    field.field_idx = last_index;
                }
                fields.push(field);
            }
            Ok(fields)
        };
        let read_methods =
            |byte_view: &mut R, count: u64| -> Result<Vec<EncodedMethod>, FormatError> {
                let mut methods = Vec::with_capacity(count as usize);
                let mut last_index = 0;
                for i in 0..count {
                    let mut method = EncodedMethod::from_bytes(byte_view)?;
                    if i == 0 {
                        last_index = method.method_idx;
                    } else {
                        last_index += method.method_idx;
                        method.method_idx = last_index;
                    }
                    methods.push(method);
                }
                Ok(methods)
            };

        let static_fields = read_fields(byte_view, static_fields_size)?;
        let instance_fields = read_fields(byte_view, instance_fields_size)?;
        let direct_methods = read_methods(byte_view, direct_methods_size)?;
        let virtual_methods = read_methods(byte_view, virtual_methods_size)?;
        Ok(ClassData {
            static_fields,
            instance_fields,
            direct_methods,
            virtual_methods,
        })
    }
}

#[derive(
    Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct InstructionSize(pub u32);

#[derive(
    Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct InstructionOffset(pub u32);

impl std::ops::Add<InstructionSize> for InstructionOffset {
    type Output = InstructionOffset;
    fn add(self, rhs: InstructionSize) -> Self::Output {
        InstructionOffset(self.0 + rhs.0)
    }
}

impl std::ops::Add<u32> for InstructionOffset {
    type Output = InstructionOffset;
    fn add(self, rhs: u32) -> Self::Output {
        InstructionOffset(self.0 + rhs)
    }
}

impl From<u32> for InstructionOffset {
    fn from(v: u32) -> Self {
        InstructionOffset(v)
    }
}

impl From<u32> for InstructionSize {
    fn from(v: u32) -> Self {
        InstructionSize(v)
    }
}

impl From<InstructionOffset> for u32 {
    fn from(inner: InstructionOffset) -> Self {
        inner.0
    }
}

impl From<InstructionSize> for u32 {
    fn from(inner: InstructionSize) -> Self {
        inner.0
    }
}

impl From<InstructionOffset> for usize {
    fn from(inner: InstructionOffset) -> Self {
        inner.0 as usize
    }
}

impl From<InstructionSize> for usize {
    fn from(inner: InstructionSize) -> Self {
        inner.0 as usize
    }
}

/// A try region over the instruction stream, with its handler resolved to an
/// index into `CodeItem::handlers`.
#[derive(Debug, Clone, PartialEq)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    pub handler_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchHandler {
    /// (type index, handler address) pairs, in declaration order.
    pub catches: Vec<(u32, u32)>,
    pub catch_all_addr: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub debug_info_off: u32,
    pub insns: Vec<(InstructionSize, InstructionOffset, Instruction)>,
    pub tries: Vec<TryItem>,
    pub handlers: Vec<CatchHandler>,
}

impl CodeItem {
    /// Total size of the instruction stream in 16-bit units.
    pub fn insns_unit_size(&self) -> u32 {
        self.insns
            .last()
            .map(|(size, offset, _)| offset.0 + size.0)
            .unwrap_or(0)
    }
}

impl Decode for CodeItem {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let registers_size = u16::from_bytes(byte_view)?;
        let ins_size = u16::from_bytes(byte_view)?;
        let outs_size = u16::from_bytes(byte_view)?;
        let tries_size = u16::from_bytes(byte_view)?;
        let debug_info_off = u32::from_bytes(byte_view)?;
        let insns_size = u32::from_bytes(byte_view)?;

        let insns = Instruction::read_stream(byte_view, insns_size)?;

        let mut tries = Vec::with_capacity(tries_size as usize);
        let mut handlers = vec![];
        if tries_size > 0 {
            if insns_size % 2 != 0 {
                u16::from_bytes(byte_view)?;
            }
            let mut raw_tries = Vec::with_capacity(tries_size as usize);
            for _ in 0..tries_size {
                let start_addr = u32::from_bytes(byte_view)?;
                let insn_count = u16::from_bytes(byte_view)?;
                let handler_off = u16::from_bytes(byte_view)?;
                raw_tries.push((start_addr, insn_count, handler_off));
            }
            let list_start = byte_view.seek(SeekFrom::Current(0))?;
            let (_, handler_count) = Self::read_leb128(byte_view)?;
            let mut offsets = vec![];
            for _ in 0..handler_count {
                let offset = byte_view.seek(SeekFrom::Current(0))? - list_start;
                offsets.push(offset as u16);
                let (_, size) = Self::read_sleb128(byte_view)?;
                let pair_count = size.unsigned_abs();
                let mut catches = vec![];
                for _ in 0..pair_count {
                    let (_, type_idx) = Self::read_leb128(byte_view)?;
                    let (_, addr) = Self::read_leb128(byte_view)?;
                    catches.push((type_idx as u32, addr as u32));
                }
                let catch_all_addr = if size <= 0 {
                    let (_, addr) = Self::read_leb128(byte_view)?;
                    Some(addr as u32)
                } else {
                    None
                };
                handlers.push(CatchHandler {
                    catches,
                    catch_all_addr,
                });
            }
            for (start_addr, insn_count, handler_off) in raw_tries {
                let handler_index = offsets
                    .iter()
                    .position(|&o| o == handler_off)
                    .ok_or_else(|| FormatError::corrupt("try references unknown handler"))?;
                tries.push(TryItem {
                    start_addr,
                    insn_count,
                    handler_index,
                });
            }
        }

        Ok(CodeItem {
            registers_size,
            ins_size,
            outs_size,
            debug_info_off,
            insns,
            tries,
            handlers,
        })
    }
}

impl Encode for CodeItem {
    fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError> {
        let mut written = 0;
        written += self.registers_size.to_bytes(writer)?;
        written += self.ins_size.to_bytes(writer)?;
        written += self.outs_size.to_bytes(writer)?;
        written += (self.tries.len() as u16).to_bytes(writer)?;
        written += self.debug_info_off.to_bytes(writer)?;
        let insns_size = self.insns_unit_size();
        written += insns_size.to_bytes(writer)?;
        for (_, _, insn) in &self.insns {
            for unit in insn.to_units() {
                written += unit.to_bytes(writer)?;
            }
        }
        if !self.tries.is_empty() {
            if insns_size % 2 != 0 {
                written += 0u16.to_bytes(writer)?;
            }
            // handler list offsets have to be known before the try items are
            // written, so the list is serialized into a scratch buffer first
            let mut handler_bytes = vec![];
            let mut offsets = vec![];
            Self::write_leb128(&mut handler_bytes, self.handlers.len() as u64)?;
            for handler in &self.handlers {
                offsets.push(handler_bytes.len() as u16);
                let size = if handler.catch_all_addr.is_some() {
                    -(handler.catches.len() as i64)
                } else {
                    handler.catches.len() as i64
                };
                Self::write_sleb128(&mut handler_bytes, size)?;
                for &(type_idx, addr) in &handler.catches {
                    Self::write_leb128(&mut handler_bytes, type_idx as u64)?;
                    Self::write_leb128(&mut handler_bytes, addr as u64)?;
                }
                if let Some(addr) = handler.catch_all_addr {
                    Self::write_leb128(&mut handler_bytes, addr as u64)?;
                }
            }
            for try_item in &self.tries {
                written += try_item.start_addr.to_bytes(writer)?;
                written += try_item.insn_count.to_bytes(writer)?;
                written += offsets[try_item.handler_index].to_bytes(writer)?;
            }
            writer.write_all(&handler_bytes)?;
            written += handler_bytes.len();
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ValueType {
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    MethodType,
    MethodHandle,
    String,
    Type,
    Field,
    Method,
    Enum,
    Array,
    Annotation,
    Null,
    Boolean,
}

impl ValueType {
    pub fn tag(&self) -> u8 {
        match self {
            ValueType::Byte => 0x00,
            ValueType::Short => 0x02,
            ValueType::Char => 0x03,
            ValueType::Int => 0x04,
            ValueType::Long => 0x06,
            ValueType::Float => 0x10,
            ValueType::Double => 0x11,
            ValueType::MethodType => 0x15,
            ValueType::MethodHandle => 0x16,
            ValueType::String => 0x17,
            ValueType::Type => 0x18,
            ValueType::Field => 0x19,
            ValueType::Method => 0x1a,
            ValueType::Enum => 0x1b,
            ValueType::Array => 0x1c,
            ValueType::Annotation => 0x1d,
            ValueType::Null => 0x1e,
            ValueType::Boolean => 0x1f,
        }
    }
}

/// A single encoded value as found in static-value arrays and annotations.
/// The payload bytes are kept raw; typed accessors pick them apart.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EncodedItem {
    pub value_arg: u8,
    pub value_type: ValueType,
    pub values: Vec<u8>,
    pub inner: Option<EncodedArray>,
}

impl EncodedItem {
    /// Build an index-valued item (string/type/field/method/enum) with the
    /// minimal byte width the format requires.
    pub fn with_index(value_type: ValueType, index: u32) -> EncodedItem {
        let bytes = index.to_le_bytes();
        let mut len = 4;
        while len > 1 && bytes[len - 1] == 0 {
            len -= 1;
        }
        EncodedItem {
            value_arg: (len - 1) as u8,
            value_type,
            values: bytes[..len].to_vec(),
            inner: None,
        }
    }

    fn index_value(&self, expected: ValueType) -> Option<u32> {
        if self.value_type != expected {
            return None;
        }
        let mut bytes = [0u8; 4];
        for (i, b) in self.values.iter().take(4).enumerate() {
            bytes[i] = *b;
        }
        Some(u32::from_le_bytes(bytes))
    }

    pub fn get_string_id(&self) -> Option<u32> {
        self.index_value(ValueType::String)
    }

    pub fn get_type_id(&self) -> Option<u32> {
        self.index_value(ValueType::Type)
    }

    pub fn get_field_id(&self) -> Option<u32> {
        self.index_value(ValueType::Field)
    }

    pub fn get_method_id(&self) -> Option<u32> {
        self.index_value(ValueType::Method)
    }
}

impl Decode for EncodedItem {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let byte = u8::from_bytes(byte_view)?;
        let value_arg = (byte & 0b1110_0000) >> 5;
        let value_type = match byte & 0b0001_1111 {
            0x00 => ValueType::Byte,
            0x02 => ValueType::Short,
            0x03 => ValueType::Char,
            0x04 => ValueType::Int,
            0x06 => ValueType::Long,
            0x10 => ValueType::Float,
            0x11 => ValueType::Double,
            0x15 => ValueType::MethodType,
            0x16 => ValueType::MethodHandle,
            0x17 => ValueType::String,
            0x18 => ValueType::Type,
            0x19 => ValueType::Field,
            0x1a => ValueType::Method,
            0x1b => ValueType::Enum,
            0x1c => ValueType::Array,
            0x1d => ValueType::Annotation,
            0x1e => ValueType::Null,
            0x1f => ValueType::Boolean,
            other => {
                return Err(FormatError::corrupt(format!(
                    "unknown encoded value type {:#x}",
                    other
                )))
            }
        };
        match value_type {
            ValueType::Boolean | ValueType::Null => Ok(EncodedItem {
                value_arg,
                value_type,
                values: vec![],
                inner: None,
            }),
            ValueType::Array => {
                let inner = EncodedArray::from_bytes(byte_view)?;
                Ok(EncodedItem {
                    value_arg,
                    value_type,
                    values: vec![],
                    inner: Some(inner),
                })
            }
            ValueType::Annotation => {
                let annotation = EncodedAnnotation::from_bytes(byte_view)?;
                let mut values = vec![];
                annotation.to_bytes(&mut values)?;
                Ok(EncodedItem {
                    value_arg,
                    value_type,
                    values,
                    inner: None,
                })
            }
            _ => {
                let mut values = vec![0u8; (value_arg + 1) as usize];
                byte_view.read_exact(&mut values)?;
                Ok(EncodedItem {
                    value_arg,
                    value_type,
                    values,
                    inner: None,
                })
            }
        }
    }
}

impl Encode for EncodedItem {
    fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError> {
        let header = (self.value_arg << 5) | self.value_type.tag();
        let mut written = header.to_bytes(writer)?;
        if let Some(inner) = &self.inner {
            written += inner.to_bytes(writer)?;
        } else {
            writer.write_all(&self.values)?;
            written += self.values.len();
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EncodedArray {
    pub items: Vec<EncodedItem>,
}

impl Decode for EncodedArray {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let (_, size) = Self::read_leb128(byte_view)?;
        let mut items = Vec::with_capacity(size as usize);
        for _ in 0..size {
            items.push(EncodedItem::from_bytes(byte_view)?);
        }
        Ok(EncodedArray { items })
    }
}

impl Encode for EncodedArray {
    fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError> {
        let mut written = Self::write_leb128(writer, self.items.len() as u64)?;
        for item in &self.items {
            written += item.to_bytes(writer)?;
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnnotationElement {
    pub name_idx: u64,
    pub value: EncodedItem,
}

impl Decode for AnnotationElement {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let (_, name_idx) = Self::read_leb128(byte_view)?;
        let value = EncodedItem::from_bytes(byte_view)?;
        Ok(AnnotationElement { name_idx, value })
    }
}

impl Encode for AnnotationElement {
    fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError> {
        let mut written = Self::write_leb128(writer, self.name_idx)?;
        written += self.value.to_bytes(writer)?;
        Ok(written)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EncodedAnnotation {
    pub type_idx: u64,
    pub elements: Vec<AnnotationElement>,
}

impl Decode for EncodedAnnotation {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let (_, type_idx) = Self::read_leb128(byte_view)?;
        let (_, size) = Self::read_leb128(byte_view)?;
        let mut elements = Vec::with_capacity(size as usize);
        for _ in 0..size {
            elements.push(AnnotationElement::from_bytes(byte_view)?);
        }
        Ok(EncodedAnnotation { type_idx, elements })
    }
}

impl Encode for EncodedAnnotation {
    fn to_bytes<W: Write>(&self, writer: &mut W) -> Result<usize, FormatError> {
        let mut written = Self::write_leb128(writer, self.type_idx)?;
        written += Self::write_leb128(writer, self.elements.len() as u64)?;
        for element in &self.elements {
            written += element.to_bytes(writer)?;
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AnnotationVisibility {
    Build,
    Runtime,
    System,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnnotationItem {
    pub visibility: AnnotationVisibility,
    pub annotation: EncodedAnnotation,
}

impl Decode for AnnotationItem {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let visibility = match u8::from_bytes(byte_view)? {
            0x00 => AnnotationVisibility::Build,
            0x01 => AnnotationVisibility::Runtime,
            0x02 => AnnotationVisibility::System,
            _ => AnnotationVisibility::Unknown,
        };
        let annotation = EncodedAnnotation::from_bytes(byte_view)?;
        Ok(AnnotationItem {
            visibility,
            annotation,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MethodAnnotation {
    pub method_idx: u32,
    pub annotations_off: u32,
}

impl Decode for MethodAnnotation {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        Ok(MethodAnnotation {
            method_idx: u32::from_bytes(byte_view)?,
            annotations_off: u32::from_bytes(byte_view)?,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AnnotationsDirectoryItem {
    pub class_annotations_off: u32,
    pub field_annotations: Vec<(u32, u32)>,
    pub method_annotations: Vec<MethodAnnotation>,
    pub parameter_annotations: Vec<(u32, u32)>,
}

impl Decode for AnnotationsDirectoryItem {
    fn from_bytes<R: Read + Seek>(byte_view: &mut R) -> Result<Self, FormatError> {
        let class_annotations_off = u32::from_bytes(byte_view)?;
        let fields_size = u32::from_bytes(byte_view)?;
        let methods_size = u32::from_bytes(byte_view)?;
        let parameters_size = u32::from_bytes(byte_view)?;
        let mut field_annotations = Vec::with_capacity(fields_size as usize);
        for _ in 0..fields_size {
            field_annotations.push((u32::from_bytes(byte_view)?, u32::from_bytes(byte_view)?));
        }
        let mut method_annotations = Vec::with_capacity(methods_size as usize);
        for _ in 0..methods_size {
            method_annotations.push(MethodAnnotation::from_bytes(byte_view)?);
        }
        let mut parameter_annotations = Vec::with_capacity(parameters_size as usize);
        for _ in 0..parameters_size {
            parameter_annotations.push((u32::from_bytes(byte_view)?, u32::from_bytes(byte_view)?));
        }
        Ok(AnnotationsDirectoryItem {
            class_annotations_off,
            field_annotations,
            method_annotations,
            parameter_annotations,
        })
    }
}

/// One method of a dex class together with its decoded body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MethodData {
    pub name: String,
    pub method: Arc<MethodId>,
    pub method_idx: u32,
    pub access_flags: AccessFlags,
    #[serde(skip_serializing, skip_deserializing)]
    pub code: Option<CodeItem>,
}

/// A class definition of one dex file, with decoded class data and method
/// bodies attached.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DexClass {
    pub dex_identifier: String,
    pub class_idx: u32,
    pub class_name: String,
    pub access_flags: AccessFlags,
    pub super_class: u32,
    pub interfaces: Vec<u16>,
    pub annotations_off: u32,
    pub source_file_idx: u32,
    pub class_data: Option<ClassData>,
    pub codes: Vec<MethodData>,
    pub static_values: Vec<EncodedItem>,
    /// Exception class names from the Throws system annotation, keyed by
    /// method index.
    pub method_throws: std::collections::HashMap<u32, Vec<String>>,
}

impl PartialEq for DexClass {
    fn eq(&self, other: &Self) -> bool {
        self.dex_identifier == other.dex_identifier && self.class_idx == other.class_idx
    }
}

impl DexClass {
    pub fn get_human_friendly_name(&self) -> String {
        self.class_name
            .trim_start_matches('L')
            .trim_end_matches(';')
            .replace('/', ".")
    }

    /// The static initializer value zipped against the static-field list, if
    /// one was recorded for this field.
    pub fn get_data_for_static_field(&self, field_idx: u32) -> Option<&EncodedItem> {
        let class_data = self.class_data.as_ref()?;
        for (data, field) in self.static_values.iter().zip(&class_data.static_fields) {
            if field.field_idx == field_idx {
                return Some(data);
            }
        }
        None
    }
}

/// A parsed dex file: header plus the fully resolved id pools and class
/// definitions. The identifier is the hex form of the header signature and
/// distinguishes dex files across contexts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DexFile {
    pub identifier: String,
    pub file_name: String,
    pub header: DexHeader,
    pub strings: Vec<StringEntry>,
    pub types: Vec<u32>,
    pub protos: Vec<Arc<Proto>>,
    pub fields: Vec<Arc<FieldId>>,
    pub methods: Vec<Arc<MethodId>>,
    pub classes: Vec<Arc<DexClass>>,
}

impl PartialEq for DexFile {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl DexFile {
    pub fn get_string<T>(&self, string_idx: T) -> Option<&str>
    where
        T: Into<usize>,
    {
        self.strings
            .get(string_idx.into())
            .and_then(|se| se.to_str().ok())
    }

    pub fn get_type_name<T>(&self, type_idx: T) -> Option<&str>
    where
        T: Into<usize>,
    {
        match self.types.get(type_idx.into()) {
            Some(idx) => self.get_string(*idx as usize),
            None => None,
        }
    }

    pub fn get_field_name<T>(&self, field_idx: T) -> Option<&str>
    where
        T: Into<u32> + Copy,
    {
        self.fields
            .get(field_idx.into() as usize)
            .map(|f| f.name.as_str())
    }

    pub fn get_method_name<T>(&self, method_idx: T) -> Option<&str>
    where
        T: Into<u32> + Copy,
    {
        self.methods
            .get(method_idx.into() as usize)
            .map(|m| m.method_name.as_str())
    }

    pub fn get_class_by_name(&self, class_name: &str) -> Option<Arc<DexClass>> {
        #[cfg(not(target_arch = "wasm32"))]
        return self
            .classes
            .par_iter()
            .find_first(|c| c.class_name == class_name)
            .cloned();
        #[cfg(target_arch = "wasm32")]
        return self
            .classes
            .iter()
            .find(|c| c.class_name == class_name)
            .cloned();
    }

    pub fn get_classes_containing_name(&self, class_name: &str) -> Vec<Arc<DexClass>> {
        iterator!(self.classes)
            .filter(|c| c.class_name.contains(class_name))
            .cloned()
            .collect()
    }

    /// Find the index of a type by its descriptor string.
    pub fn get_type_idx_for_name(&self, type_name: &str) -> Option<u32> {
        self.types.iter().enumerate().find_map(|(idx, &name_idx)| {
            match self.get_string(name_idx as usize) {
                Some(name) if name == type_name => Some(idx as u32),
                _ => None,
            }
        })
    }
}
