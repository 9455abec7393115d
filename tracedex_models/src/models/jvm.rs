// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! JVM class-file structures. The pool is unsorted, so appending entries
//! never disturbs existing indices; attributes the engine does not interpret
//! are kept as raw bytes and re-emitted verbatim.

use std::{
    borrow::Cow,
    io::{Read, Write},
};

use log::warn;

use super::{
    read_exact_vec, read_u16_be, read_u32_be, read_u8, write_u16_be, write_u32_be, write_u8,
    FormatError,
};

pub const CLASS_MAGIC: u32 = 0xCAFE_BABE;

#[derive(Debug, Clone, PartialEq)]
pub enum ConstantPoolEntry {
    /// Raw MUTF-8 bytes, converted lazily for display.
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
}

impl ConstantPoolEntry {
    pub fn tag(&self) -> u8 {
        match self {
            ConstantPoolEntry::Utf8(_) => 1,
            ConstantPoolEntry::Integer(_) => 3,
            ConstantPoolEntry::Float(_) => 4,
            ConstantPoolEntry::Long(_) => 5,
            ConstantPoolEntry::Double(_) => 6,
            ConstantPoolEntry::Class(_) => 7,
            ConstantPoolEntry::String(_) => 8,
            ConstantPoolEntry::FieldRef(_, _) => 9,
            ConstantPoolEntry::MethodRef(_, _) => 10,
            ConstantPoolEntry::InterfaceMethodRef(_, _) => 11,
            ConstantPoolEntry::NameAndType(_, _) => 12,
            ConstantPoolEntry::MethodHandle(_, _) => 15,
            ConstantPoolEntry::MethodType(_) => 16,
            ConstantPoolEntry::Dynamic(_, _) => 17,
            ConstantPoolEntry::InvokeDynamic(_, _) => 18,
            ConstantPoolEntry::Module(_) => 19,
            ConstantPoolEntry::Package(_) => 20,
        }
    }

    /// Long and Double take up two pool slots.
    pub fn is_wide(&self) -> bool {
        matches!(
            self,
            ConstantPoolEntry::Long(_) | ConstantPoolEntry::Double(_)
        )
    }
}

/// The constant pool with its one-based indexing. Slot 0 and the slot after
/// each Long/Double entry hold `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Option<ConstantPoolEntry>>,
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool {
            entries: vec![None],
        }
    }

    pub fn len(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Option<&ConstantPoolEntry> {
        self.entries.get(index as usize).and_then(|e| e.as_ref())
    }

    /// Append an entry, returning its index. Existing indices stay valid
    /// since the pool carries no ordering invariant.
    pub fn push(&mut self, entry: ConstantPoolEntry) -> u16 {
        let index = self.entries.len() as u16;
        let wide = entry.is_wide();
        self.entries.push(Some(entry));
        if wide {
            self.entries.push(None);
        }
        index
    }

    pub fn utf8(&self, index: u16) -> Option<Cow<str>> {
        match self.get(index)? {
            ConstantPoolEntry::Utf8(bytes) => Some(
                cesu8::from_java_cesu8(bytes)
                    .unwrap_or_else(|_| String::from_utf8_lossy(bytes)),
            ),
            _ => None,
        }
    }

    pub fn class_name(&self, index: u16) -> Option<Cow<str>> {
        match self.get(index)? {
            ConstantPoolEntry::Class(name_index) => self.utf8(*name_index),
            _ => None,
        }
    }

    pub fn name_and_type(&self, index: u16) -> Option<(Cow<str>, Cow<str>)> {
        match self.get(index)? {
            ConstantPoolEntry::NameAndType(name_index, descriptor_index) => {
                Some((self.utf8(*name_index)?, self.utf8(*descriptor_index)?))
            }
            _ => None,
        }
    }

    /// Resolve a Field/Method/InterfaceMethod ref into (class, name,
    /// descriptor).
    pub fn member_ref(&self, index: u16) -> Option<(Cow<str>, Cow<str>, Cow<str>)> {
        match self.get(index)? {
            ConstantPoolEntry::FieldRef(class_index, nat_index)
            | ConstantPoolEntry::MethodRef(class_index, nat_index)
            | ConstantPoolEntry::InterfaceMethodRef(class_index, nat_index) => {
                let class = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*nat_index)?;
                Some((class, name, descriptor))
            }
            _ => None,
        }
    }

    fn find(&self, entry: &ConstantPoolEntry) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.as_ref() == Some(entry))
            .map(|i| i as u16)
    }

    /// Reuse an existing entry or append a new one.
    pub fn ensure(&mut self, entry: ConstantPoolEntry) -> u16 {
        match self.find(&entry) {
            Some(index) => index,
            None => self.push(entry),
        }
    }

    pub fn ensure_utf8(&mut self, value: &str) -> u16 {
        let bytes = cesu8::to_java_cesu8(value).into_owned();
        self.ensure(ConstantPoolEntry::Utf8(bytes))
    }

    pub fn ensure_class(&mut self, name: &str) -> u16 {
        let name_index = self.ensure_utf8(name);
        self.ensure(ConstantPoolEntry::Class(name_index))
    }

    pub fn ensure_string(&mut self, value: &str) -> u16 {
        let utf8_index = self.ensure_utf8(value);
        self.ensure(ConstantPoolEntry::String(utf8_index))
    }

    pub fn ensure_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.ensure_utf8(name);
        let descriptor_index = self.ensure_utf8(descriptor);
        self.ensure(ConstantPoolEntry::NameAndType(name_index, descriptor_index))
    }

    pub fn ensure_field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.ensure_class(class);
        let nat_index = self.ensure_name_and_type(name, descriptor);
        self.ensure(ConstantPoolEntry::FieldRef(class_index, nat_index))
    }

    pub fn ensure_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.ensure_class(class);
        let nat_index = self.ensure_name_and_type(name, descriptor);
        self.ensure(ConstantPoolEntry::MethodRef(class_index, nat_index))
    }

    /// Read `count - 1` pool entries. A corrupt tag 0 or 2 stops the pool
    /// early and is handed back so the caller can re-read it as the high
    /// half of the access-flags word that follows the pool.
    pub fn read<R: Read>(r: &mut R, count: u16) -> Result<(ConstantPool, Option<u8>), FormatError> {
        let mut entries: Vec<Option<ConstantPoolEntry>> = vec![None];
        let mut stray_tag = None;
        while (entries.len() as u16) < count {
            let tag = read_u8(r)?;
            let entry = match tag {
                1 => {
                    let length = read_u16_be(r)? as usize;
                    ConstantPoolEntry::Utf8(read_exact_vec(r, length)?)
                }
                3 => ConstantPoolEntry::Integer(read_u32_be(r)? as i32),
                4 => ConstantPoolEntry::Float(read_u32_be(r)?),
                5 => {
                    let high = read_u32_be(r)? as u64;
                    let low = read_u32_be(r)? as u64;
                    ConstantPoolEntry::Long(((high << 32) | low) as i64)
                }
                6 => {
                    let high = read_u32_be(r)? as u64;
                    let low = read_u32_be(r)? as u64;
                    ConstantPoolEntry::Double((high << 32) | low)
                }
                7 => ConstantPoolEntry::Class(read_u16_be(r)?),
                8 => ConstantPoolEntry::String(read_u16_be(r)?),
                9 => ConstantPoolEntry::FieldRef(read_u16_be(r)?, read_u16_be(r)?),
                10 => ConstantPoolEntry::MethodRef(read_u16_be(r)?, read_u16_be(r)?),
                11 => ConstantPoolEntry::InterfaceMethodRef(read_u16_be(r)?, read_u16_be(r)?),
                12 => ConstantPoolEntry::NameAndType(read_u16_be(r)?, read_u16_be(r)?),
                15 => ConstantPoolEntry::MethodHandle(read_u8(r)?, read_u16_be(r)?),
                16 => ConstantPoolEntry::MethodType(read_u16_be(r)?),
                17 => ConstantPoolEntry::Dynamic(read_u16_be(r)?, read_u16_be(r)?),
                18 => ConstantPoolEntry::InvokeDynamic(read_u16_be(r)?, read_u16_be(r)?),
                19 => ConstantPoolEntry::Module(read_u16_be(r)?),
                20 => ConstantPoolEntry::Package(read_u16_be(r)?),
                // tags 0 and 2 do not exist in the format; some obfuscators
                // overstate the pool count, so the byte is really the start
                // of the access-flags word
                0 | 2 => {
                    warn!(
                        "constant pool slot {} has invalid tag {}, resynchronizing at the access flags",
                        entries.len(),
                        tag
                    );
                    stray_tag = Some(tag);
                    break;
                }
                other => {
                    return Err(FormatError::corrupt(format!(
                        "unknown constant pool tag {}",
                        other
                    )))
                }
            };
            let wide = entry.is_wide();
            entries.push(Some(entry));
            if wide {
                entries.push(None);
            }
        }
        Ok((ConstantPool { entries }, stray_tag))
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), FormatError> {
        write_u16_be(w, self.entries.len() as u16)?;
        for entry in self.entries.iter().flatten() {
            write_u8(w, entry.tag())?;
            match entry {
                ConstantPoolEntry::Utf8(bytes) => {
                    write_u16_be(w, bytes.len() as u16)?;
                    w.write_all(bytes)?;
                }
                ConstantPoolEntry::Integer(v) => write_u32_be(w, *v as u32)?,
                ConstantPoolEntry::Float(v) => write_u32_be(w, *v)?,
                ConstantPoolEntry::Long(v) => {
                    let bits = *v as u64;
                    write_u32_be(w, (bits >> 32) as u32)?;
                    write_u32_be(w, (bits & 0xffff_ffff) as u32)?;
                }
                ConstantPoolEntry::Double(bits) => {
                    write_u32_be(w, (bits >> 32) as u32)?;
                    write_u32_be(w, (bits & 0xffff_ffff) as u32)?;
                }
                ConstantPoolEntry::Class(v)
                | ConstantPoolEntry::String(v)
                | ConstantPoolEntry::MethodType(v)
                | ConstantPoolEntry::Module(v)
                | ConstantPoolEntry::Package(v) => write_u16_be(w, *v)?,
                ConstantPoolEntry::FieldRef(a, b)
                | ConstantPoolEntry::MethodRef(a, b)
                | ConstantPoolEntry::InterfaceMethodRef(a, b)
                | ConstantPoolEntry::NameAndType(a, b)
                | ConstantPoolEntry::Dynamic(a, b)
                | ConstantPoolEntry::InvokeDynamic(a, b) => {
                    write_u16_be(w, *a)?;
                    write_u16_be(w, *b)?;
                }
                ConstantPoolEntry::MethodHandle(kind, index) => {
                    write_u8(w, *kind)?;
                    write_u16_be(w, *index)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<JvmAttribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InnerClassEntry {
    pub inner_class_info: u16,
    pub outer_class_info: u16,
    pub inner_name: u16,
    pub access_flags: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeBody {
    Code(CodeAttribute),
    Exceptions(Vec<u16>),
    ConstantValue(u16),
    SourceFile(u16),
    /// (start_pc, line_number) pairs.
    LineNumberTable(Vec<(u16, u16)>),
    InnerClasses(Vec<InnerClassEntry>),
    /// Unparsed attribute, re-emitted byte for byte.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JvmAttribute {
    pub name_index: u16,
    pub body: AttributeBody,
}

impl JvmAttribute {
    pub fn read<R: Read>(r: &mut R, pool: &ConstantPool) -> Result<JvmAttribute, FormatError> {
        let name_index = read_u16_be(r)?;
        let length = read_u32_be(r)? as usize;
        let bytes = read_exact_vec(r, length)?;
        let name = pool.utf8(name_index).unwrap_or(Cow::Borrowed(""));
        let body = match name.as_ref() {
            "Code" => {
                let mut cursor = std::io::Cursor::new(&bytes);
                AttributeBody::Code(Self::read_code(&mut cursor, pool)?)
            }
            "Exceptions" => {
                let mut cursor = std::io::Cursor::new(&bytes);
                let count = read_u16_be(&mut cursor)?;
                let mut exceptions = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    exceptions.push(read_u16_be(&mut cursor)?);
                }
                AttributeBody::Exceptions(exceptions)
            }
            "ConstantValue" => {
                let mut cursor = std::io::Cursor::new(&bytes);
                AttributeBody::ConstantValue(read_u16_be(&mut cursor)?)
            }
            "SourceFile" => {
                let mut cursor = std::io::Cursor::new(&bytes);
                AttributeBody::SourceFile(read_u16_be(&mut cursor)?)
            }
            "LineNumberTable" => {
                let mut cursor = std::io::Cursor::new(&bytes);
                let count = read_u16_be(&mut cursor)?;
                let mut table = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    table.push((read_u16_be(&mut cursor)?, read_u16_be(&mut cursor)?));
                }
                AttributeBody::LineNumberTable(table)
            }
            "InnerClasses" => {
                let mut cursor = std::io::Cursor::new(&bytes);
                let count = read_u16_be(&mut cursor)?;
                let mut classes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    classes.push(InnerClassEntry {
                        inner_class_info: read_u16_be(&mut cursor)?,
                        outer_class_info: read_u16_be(&mut cursor)?,
                        inner_name: read_u16_be(&mut cursor)?,
                        access_flags: read_u16_be(&mut cursor)?,
                    });
                }
                AttributeBody::InnerClasses(classes)
            }
            _ => AttributeBody::Raw(bytes),
        };
        Ok(JvmAttribute { name_index, body })
    }

    fn read_code<R: Read>(r: &mut R, pool: &ConstantPool) -> Result<CodeAttribute, FormatError> {
        let max_stack = read_u16_be(r)?;
        let max_locals = read_u16_be(r)?;
        let code_length = read_u32_be(r)? as usize;
        let code = read_exact_vec(r, code_length)?;
        let table_length = read_u16_be(r)?;
        let mut exception_table = Vec::with_capacity(table_length as usize);
        for _ in 0..table_length {
            exception_table.push(ExceptionTableEntry {
                start_pc: read_u16_be(r)?,
                end_pc: read_u16_be(r)?,
                handler_pc: read_u16_be(r)?,
                catch_type: read_u16_be(r)?,
            });
        }
        let attribute_count = read_u16_be(r)?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            attributes.push(JvmAttribute::read(r, pool)?);
        }
        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), FormatError> {
        write_u16_be(w, self.name_index)?;
        let mut body = vec![];
        match &self.body {
            AttributeBody::Code(code) => {
                write_u16_be(&mut body, code.max_stack)?;
                write_u16_be(&mut body, code.max_locals)?;
                write_u32_be(&mut body, code.code.len() as u32)?;
                body.extend_from_slice(&code.code);
                write_u16_be(&mut body, code.exception_table.len() as u16)?;
                for entry in &code.exception_table {
                    write_u16_be(&mut body, entry.start_pc)?;
                    write_u16_be(&mut body, entry.end_pc)?;
                    write_u16_be(&mut body, entry.handler_pc)?;
                    write_u16_be(&mut body, entry.catch_type)?;
                }
                write_u16_be(&mut body, code.attributes.len() as u16)?;
                for attribute in &code.attributes {
                    attribute.write(&mut body)?;
                }
            }
            AttributeBody::Exceptions(exceptions) => {
                write_u16_be(&mut body, exceptions.len() as u16)?;
                for exception in exceptions {
                    write_u16_be(&mut body, *exception)?;
                }
            }
            AttributeBody::ConstantValue(index) | AttributeBody::SourceFile(index) => {
                write_u16_be(&mut body, *index)?;
            }
            AttributeBody::LineNumberTable(table) => {
                write_u16_be(&mut body, table.len() as u16)?;
                for (start_pc, line) in table {
                    write_u16_be(&mut body, *start_pc)?;
                    write_u16_be(&mut body, *line)?;
                }
            }
            AttributeBody::InnerClasses(classes) => {
                write_u16_be(&mut body, classes.len() as u16)?;
                for class in classes {
                    write_u16_be(&mut body, class.inner_class_info)?;
                    write_u16_be(&mut body, class.outer_class_info)?;
                    write_u16_be(&mut body, class.inner_name)?;
                    write_u16_be(&mut body, class.access_flags)?;
                }
            }
            AttributeBody::Raw(bytes) => {
                body.extend_from_slice(bytes);
            }
        }
        write_u32_be(w, body.len() as u32)?;
        w.write_all(&body)?;
        Ok(())
    }
}

/// A field or method of a class file.
#[derive(Debug, Clone, PartialEq)]
pub struct JvmMember {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<JvmAttribute>,
}

impl JvmMember {
    fn read<R: Read>(r: &mut R, pool: &ConstantPool) -> Result<JvmMember, FormatError> {
        let access_flags = read_u16_be(r)?;
        let name_index = read_u16_be(r)?;
        let descriptor_index = read_u16_be(r)?;
        let attribute_count = read_u16_be(r)?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            attributes.push(JvmAttribute::read(r, pool)?);
        }
        Ok(JvmMember {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<(), FormatError> {
        write_u16_be(w, self.access_flags)?;
        write_u16_be(w, self.name_index)?;
        write_u16_be(w, self.descriptor_index)?;
        write_u16_be(w, self.attributes.len() as u16)?;
        for attribute in &self.attributes {
            attribute.write(w)?;
        }
        Ok(())
    }

    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|a| match &a.body {
            AttributeBody::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|a| match &mut a.body {
            AttributeBody::Code(code) => Some(code),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JvmClass {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<JvmMember>,
    pub methods: Vec<JvmMember>,
    pub attributes: Vec<JvmAttribute>,
}

impl JvmClass {
    pub fn read<R: Read>(r: &mut R) -> Result<JvmClass, FormatError> {
        let magic = read_u32_be(r)?;
        if magic != CLASS_MAGIC {
            return Err(FormatError::NotAClassFile);
        }
        let minor_version = read_u16_be(r)?;
        let major_version = read_u16_be(r)?;
        let pool_count = read_u16_be(r)?;
        let (constant_pool, stray_tag) = ConstantPool::read(r, pool_count)?;
        let access_flags = match stray_tag {
            Some(high) => ((high as u16) << 8) | read_u8(r)? as u16,
            None => read_u16_be(r)?,
        };
        let this_class = read_u16_be(r)?;
        let super_class = read_u16_be(r)?;
        let interface_count = read_u16_be(r)?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(read_u16_be(r)?);
        }
        let field_count = read_u16_be(r)?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(JvmMember::read(r, &constant_pool)?);
        }
        let method_count = read_u16_be(r)?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(JvmMember::read(r, &constant_pool)?);
        }
        let attribute_count = read_u16_be(r)?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            attributes.push(JvmAttribute::read(r, &constant_pool)?);
        }
        Ok(JvmClass {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), FormatError> {
        write_u32_be(w, CLASS_MAGIC)?;
        write_u16_be(w, self.minor_version)?;
        write_u16_be(w, self.major_version)?;
        self.constant_pool.write(w)?;
        write_u16_be(w, self.access_flags)?;
        write_u16_be(w, self.this_class)?;
        write_u16_be(w, self.super_class)?;
        write_u16_be(w, self.interfaces.len() as u16)?;
        for interface in &self.interfaces {
            write_u16_be(w, *interface)?;
        }
        write_u16_be(w, self.fields.len() as u16)?;
        for field in &self.fields {
            field.write(w)?;
        }
        write_u16_be(w, self.methods.len() as u16)?;
        for method in &self.methods {
            method.write(w)?;
        }
        write_u16_be(w, self.attributes.len() as u16)?;
        for attribute in &self.attributes {
            attribute.write(w)?;
        }
        Ok(())
    }

    pub fn class_name(&self) -> Option<Cow<str>> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn super_class_name(&self) -> Option<Cow<str>> {
        if self.super_class == 0 {
            return None;
        }
        self.constant_pool.class_name(self.super_class)
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&JvmMember> {
        self.methods.iter().find(|m| {
            self.constant_pool.utf8(m.name_index).as_deref() == Some(name)
                && self.constant_pool.utf8(m.descriptor_index).as_deref() == Some(descriptor)
        })
    }
}

/// Length in bytes of the JVM instruction starting at `pc`, accounting for
/// the padded tableswitch/lookupswitch forms and the wide prefix.
pub fn opcode_length(code: &[u8], pc: usize) -> Result<usize, FormatError> {
    let op = *code
        .get(pc)
        .ok_or_else(|| FormatError::corrupt("pc outside code array"))?;
    let fixed = match op {
        0x00..=0x0f => 1,
        0x10 => 2,                      // bipush
        0x11 => 3,                      // sipush
        0x12 => 2,                      // ldc
        0x13 | 0x14 => 3,               // ldc_w, ldc2_w
        0x15..=0x19 => 2,               // loads with index
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,               // stores with index
        0x3b..=0x83 => 1,
        0x84 => 3,                      // iinc
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,               // branches, jsr
        0xa9 => 2,                      // ret
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,               // field access, invokes
        0xb9 | 0xba => 5,               // invokeinterface, invokedynamic
        0xbb => 3,                      // new
        0xbc => 2,                      // newarray
        0xbd => 3,                      // anewarray
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,               // checkcast, instanceof
        0xc2 | 0xc3 => 1,
        0xc5 => 4,                      // multianewarray
        0xc6 | 0xc7 => 3,               // ifnull, ifnonnull
        0xc8 | 0xc9 => 5,               // goto_w, jsr_w
        0xaa => {
            // tableswitch: pad to 4-byte alignment, default, low, high
            let base = (pc + 4) & !3;
            let low = read_i32_at(code, base + 4)?;
            let high = read_i32_at(code, base + 8)?;
            let entries = (high - low + 1) as usize;
            return Ok(base + 12 + entries * 4 - pc);
        }
        0xab => {
            // lookupswitch: pad, default, npairs
            let base = (pc + 4) & !3;
            let npairs = read_i32_at(code, base + 4)? as usize;
            return Ok(base + 8 + npairs * 8 - pc);
        }
        0xc4 => {
            // wide prefix
            let inner = *code
                .get(pc + 1)
                .ok_or_else(|| FormatError::corrupt("wide at end of code"))?;
            return Ok(if inner == 0x84 { 6 } else { 4 });
        }
        other => {
            return Err(FormatError::corrupt(format!(
                "unknown JVM opcode {:#x}",
                other
            )))
        }
    };
    Ok(fixed)
}

fn read_i32_at(code: &[u8], at: usize) -> Result<i32, FormatError> {
    let bytes = code
        .get(at..at + 4)
        .ok_or_else(|| FormatError::corrupt("switch table outside code array"))?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_class() -> JvmClass {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class("com/example/Sample");
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
                        code: vec![0xb1], // return
                        exception_table: vec![],
                        attributes: vec![],
                    }),
                }],
            }],
            attributes: vec![],
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let class = minimal_class();
        let mut bytes = vec![];
        class.write(&mut bytes).unwrap();
        let parsed = JvmClass::read(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(parsed, class);
        assert_eq!(parsed.class_name().as_deref(), Some("com/example/Sample"));
        assert!(parsed.find_method("run", "()V").is_some());
    }

    #[test]
    fn bad_magic_is_not_a_class_file() {
        let bytes = [0u8; 16];
        match JvmClass::read(&mut std::io::Cursor::new(bytes)) {
            Err(FormatError::NotAClassFile) => {}
            other => panic!("expected NotAClassFile, got {:?}", other),
        }
    }

    #[test]
    fn appending_pool_entries_keeps_indices() {
        let mut class = minimal_class();
        let before = class.this_class;
        let added = class
            .constant_pool
            .ensure_method_ref("java/io/PrintStream", "println", "(Ljava/lang/String;)V");
        assert!(added > before);
        assert_eq!(class.constant_pool.class_name(before).as_deref(), Some("com/example/Sample"));
        // pushing the same ref again reuses the entry
        let again = class
            .constant_pool
            .ensure_method_ref("java/io/PrintStream", "println", "(Ljava/lang/String;)V");
        assert_eq!(added, again);
    }

    #[test]
    fn overstated_pool_count_resynchronizes_at_the_access_flags() {
        // pool count 6 but only four real entries; the byte where the fifth
        // tag would sit is the high half of access_flags 0x0021
        let mut bytes = vec![];
        bytes.extend_from_slice(&CLASS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&49u16.to_be_bytes());
        bytes.extend_from_slice(&6u16.to_be_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&5u16.to_be_bytes());
        bytes.extend_from_slice(b"Stale");
        bytes.push(7);
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&16u16.to_be_bytes());
        bytes.extend_from_slice(b"java/lang/Object");
        bytes.push(7);
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(&0x0021u16.to_be_bytes());
        bytes.extend_from_slice(&2u16.to_be_bytes()); // this_class
        bytes.extend_from_slice(&4u16.to_be_bytes()); // super_class
        bytes.extend_from_slice(&[0u8; 8]); // no interfaces, fields, methods, attributes

        let parsed = JvmClass::read(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(parsed.access_flags, 0x0021);
        assert_eq!(parsed.this_class, 2);
        assert_eq!(parsed.super_class, 4);
        assert_eq!(parsed.class_name().as_deref(), Some("Stale"));
        assert_eq!(parsed.super_class_name().as_deref(), Some("java/lang/Object"));

        // the truncated pool writes a consistent count back out
        let mut rewritten = vec![];
        parsed.write(&mut rewritten).unwrap();
        let reparsed = JvmClass::read(&mut std::io::Cursor::new(rewritten)).unwrap();
        assert_eq!(reparsed, parsed);
    }

    #[test]
    fn unknown_attribute_roundtrips_verbatim() {
        let mut pool = ConstantPool::new();
        let name = pool.ensure_utf8("Mystery");
        let attribute = JvmAttribute {
            name_index: name,
            body: AttributeBody::Raw(vec![1, 2, 3, 4]),
        };
        let mut bytes = vec![];
        attribute.write(&mut bytes).unwrap();
        let parsed = JvmAttribute::read(&mut std::io::Cursor::new(bytes), &pool).unwrap();
        assert_eq!(parsed, attribute);
    }

    #[test]
    fn switch_opcode_lengths() {
        // tableswitch at pc 0: pad 3, default 4, low 4, high 4, one entry
        let mut code = vec![0xaa, 0, 0, 0];
        code.extend_from_slice(&10i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&4i32.to_be_bytes());
        assert_eq!(opcode_length(&code, 0).unwrap(), code.len());
        assert_eq!(opcode_length(&[0xb6, 0, 1], 0).unwrap(), 3);
        assert_eq!(opcode_length(&[0xc4, 0x84, 0, 1, 0, 1], 0).unwrap(), 6);
    }
}
