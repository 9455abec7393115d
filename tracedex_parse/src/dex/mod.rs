// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Decoding of dex containers into `DexFile` structures and the bridge from
//! dex classes to the format-agnostic class model.

use std::{
    collections::{HashMap, HashSet},
    io::{Cursor, Read, Seek, SeekFrom},
    sync::{Arc, Mutex},
    vec,
};

use tracedex_macros::iterator;
use tracedex_models::models::*;

#[cfg(not(target_arch = "wasm32"))]
use rayon::iter::{IndexedParallelIterator, ParallelIterator};

pub trait ReadSeek: Read + Seek {}

impl<T> ReadSeek for T where T: Read + Seek {}

pub struct ArrayView<'a, T> {
    data: &'a [T],
}

impl<'a, T> ArrayView<'a, T> {
    pub fn new(data: &[T]) -> ArrayView<T> {
        ArrayView { data }
    }
    pub fn get_cursor(&self) -> Cursor<&[T]> {
        Cursor::new(self.data)
    }
}

pub fn parse_dex<R: Read>(file_name: &str, mut f: R) -> Result<DexFile, FormatError> {
    let mut buffer = vec![];
    f.read_to_end(&mut buffer)?;
    parse_dex_buf(file_name, &ArrayView::new(&buffer))
}

/// Decode a whole dex file: header, id pools, then every class definition
/// with its class data, code items, static values and Throws annotations.
/// A corrupt class is logged and skipped; I/O errors abort the parse.
pub fn parse_dex_buf(file_name: &str, buffer: &ArrayView<u8>) -> Result<DexFile, FormatError> {
    let mut pool_cursor = buffer.get_cursor();
    let header = DexHeader::from_bytes(&mut pool_cursor)?;

    pool_cursor.seek(SeekFrom::Start(header.string_ids_off as u64))?;
    let strings = parse_string_table(
        header.string_ids_off,
        header.string_ids_size,
        &mut pool_cursor,
    )?;

    pool_cursor.seek(SeekFrom::Start(header.type_ids_off as u64))?;
    let types = parse_type_table(header.type_ids_size, &mut pool_cursor)?;

    pool_cursor.seek(SeekFrom::Start(header.proto_ids_off as u64))?;
    let protos = parse_proto_table(header.proto_ids_size, &mut pool_cursor)?;

    pool_cursor.seek(SeekFrom::Start(header.method_ids_off as u64))?;
    let methods = parse_method_table(
        header.method_ids_size,
        &strings,
        &protos,
        &types,
        &mut pool_cursor,
    )?;

    pool_cursor.seek(SeekFrom::Start(header.field_ids_off as u64))?;
    let fields = parse_field_table(header.field_ids_size, &mut pool_cursor, &strings)?;

    let mut class_cursor = buffer.get_cursor();
    class_cursor.seek(SeekFrom::Start(header.class_defs_off as u64))?;
    let class_defs = parse_class_def_table(header.class_defs_size, &mut class_cursor)?;

    let identifier = format!("{:02x?}", header.signature);
    let mut parsed: Vec<(usize, Arc<DexClass>)> = Vec::with_capacity(class_defs.len());
    let vec_lock = Mutex::new(&mut parsed);
    let skeleton = DexFile {
        identifier: identifier.clone(),
        file_name: file_name.to_string(),
        header: header.clone(),
        strings: strings.clone(),
        types: types.clone(),
        protos: protos.clone(),
        fields: fields.clone(),
        methods: methods.clone(),
        classes: vec![],
    };

    iterator!(class_defs)
        .enumerate()
        .for_each(|(def_index, class_def)| {
            match parse_class(buffer, &skeleton, class_def) {
                Ok(class) => {
                    if let Ok(mut parsed) = vec_lock.lock() {
                        parsed.push((def_index, Arc::new(class)));
                    }
                }
                Err(e) if e.is_io() => {
                    log::error!("i/o failure while reading class: {}", e);
                }
                Err(e) => {
                    log::warn!(
                        "skipping corrupt class {}: {}",
                        skeleton
                            .get_type_name(class_def.class_idx as usize)
                            .unwrap_or("?"),
                        e
                    );
                }
            }
        });

    drop(vec_lock);
    // workers finish in scheduling order; class_defs order is part of the
    // format (a superclass precedes its subclasses), so restore it
    parsed.sort_by_key(|&(def_index, _)| def_index);
    let ret_classes = parsed.into_iter().map(|(_, class)| class).collect();

    Ok(DexFile {
        identifier,
        file_name: file_name.to_string(),
        header,
        strings,
        types,
        protos,
        fields,
        methods,
        classes: ret_classes,
    })
}

fn parse_class(
    buffer: &ArrayView<u8>,
    file: &DexFile,
    class_def: &ClassDefItem,
) -> Result<DexClass, FormatError> {
    let class_name = file
        .get_type_name(class_def.class_idx as usize)
        .ok_or_else(|| FormatError::corrupt("class name index out of range"))?
        .to_string();
    let access_flags = AccessFlags::from_bits_truncate(class_def.access_flags as u64);

    // classes declared outside the data section live in another dex (sdk
    // classes of an odex classpath); keep the definition without bodies
    if class_def.class_data_off != 0 && class_def.class_data_off < file.header.data_off {
        return Ok(DexClass {
            dex_identifier: file.identifier.clone(),
            class_idx: class_def.class_idx,
            class_name,
            access_flags,
            super_class: class_def.superclass_idx,
            interfaces: vec![],
            annotations_off: class_def.annotations_off,
            source_file_idx: class_def.source_file_idx,
            class_data: None,
            codes: vec![],
            static_values: vec![],
            method_throws: HashMap::new(),
        });
    }

    let mut cursor = buffer.get_cursor();
    let class_data = if class_def.class_data_off != 0 {
        cursor.seek(SeekFrom::Start(class_def.class_data_off as u64))?;
        Some(ClassData::from_bytes(&mut cursor)?)
    } else {
        None
    };

    let static_values = if class_def.static_values_off != 0 {
        cursor.seek(SeekFrom::Start(class_def.static_values_off as u64))?;
        EncodedArray::from_bytes(&mut cursor)?.items
    } else {
        vec![]
    };

    let interfaces = if class_def.interfaces_off != 0 {
        cursor.seek(SeekFrom::Start(class_def.interfaces_off as u64))?;
        let size = u32::from_bytes(&mut cursor)?;
        let mut interfaces = Vec::with_capacity(size as usize);
        for _ in 0..size {
            interfaces.push(u16::from_bytes(&mut cursor)?);
        }
        interfaces
    } else {
        vec![]
    };

    let method_throws = if class_def.annotations_off != 0 {
        parse_throws(buffer, file, class_def.annotations_off).unwrap_or_else(|e| {
            log::warn!("bad annotations directory for {}: {}", class_name, e);
            HashMap::new()
        })
    } else {
        HashMap::new()
    };

    let mut codes = vec![];
    if let Some(class_data) = &class_data {
        for method in class_data
            .direct_methods
            .iter()
            .chain(&class_data.virtual_methods)
        {
            let method_id = file
                .methods
                .get(method.method_idx as usize)
                .ok_or_else(|| FormatError::corrupt("method index out of range"))?
                .clone();
            // abstract and native methods carry no code item
            let code = if method.code_off == 0 || (method.code_off as u32) < file.header.data_off {
                None
            } else {
                let mut code_cursor = buffer.get_cursor();
                code_cursor.seek(SeekFrom::Start(method.code_off))?;
                Some(CodeItem::from_bytes(&mut code_cursor)?)
            };
            codes.push(MethodData {
                name: method_id.method_name.clone(),
                method_idx: method.method_idx,
                method: method_id,
                access_flags: method.access_flags,
                code,
            });
        }
    }

    Ok(DexClass {
        dex_identifier: file.identifier.clone(),
        class_idx: class_def.class_idx,
        class_name,
        access_flags,
        super_class: class_def.superclass_idx,
        interfaces,
        annotations_off: class_def.annotations_off,
        source_file_idx: class_def.source_file_idx,
        class_data,
        codes,
        static_values,
        method_throws,
    })
}

const THROWS_ANNOTATION: &str = "Ldalvik/annotation/Throws;";

/// Collect declared exceptions from the Throws system annotation of each
/// annotated method. Offsets already visited are refused, which keeps a
/// malformed self-referencing directory from looping.
fn parse_throws(
    buffer: &ArrayView<u8>,
    file: &DexFile,
    annotations_off: u32,
) -> Result<HashMap<u32, Vec<String>>, FormatError> {
    let mut cursor = buffer.get_cursor();
    cursor.seek(SeekFrom::Start(annotations_off as u64))?;
    let directory = AnnotationsDirectoryItem::from_bytes(&mut cursor)?;

    let mut throws = HashMap::new();
    let mut visited = HashSet::new();
    visited.insert(annotations_off);
    for method_annotation in &directory.method_annotations {
        if method_annotation.annotations_off == 0
            || !visited.insert(method_annotation.annotations_off)
        {
            continue;
        }
        cursor.seek(SeekFrom::Start(method_annotation.annotations_off as u64))?;
        let set_size = u32::from_bytes(&mut cursor)?;
        let mut item_offsets = Vec::with_capacity(set_size as usize);
        for _ in 0..set_size {
            item_offsets.push(u32::from_bytes(&mut cursor)?);
        }
        let mut exceptions = vec![];
        for item_offset in item_offsets {
            if !visited.insert(item_offset) {
                continue;
            }
            cursor.seek(SeekFrom::Start(item_offset as u64))?;
            let item = AnnotationItem::from_bytes(&mut cursor)?;
            if item.visibility != AnnotationVisibility::System {
                continue;
            }
            if file.get_type_name(item.annotation.type_idx as usize) != Some(THROWS_ANNOTATION) {
                continue;
            }
            for element in &item.annotation.elements {
                if file.get_string(element.name_idx as usize) != Some("value") {
                    continue;
                }
                if let Some(array) = &element.value.inner {
                    for entry in &array.items {
                        if let Some(type_idx) = entry.get_type_id() {
                            if let Some(name) = file.get_type_name(type_idx as usize) {
                                exceptions.push(name.to_string());
                            }
                        }
                    }
                }
            }
        }
        if !exceptions.is_empty() {
            throws.insert(method_annotation.method_idx, exceptions);
        }
    }
    Ok(throws)
}

/// Call sites of a code item, resolved against the method-id pool. Quick
/// invokes still carry vtable slots and are left out; the class-path pass
/// rewrites them first.
pub fn extract_invocations(file: &DexFile, code: &CodeItem) -> Vec<Invokation> {
    let mut invocations = vec![];
    for (_, offset, insn) in &code.insns {
        let (kind, idx) = match insn {
            Instruction::Invoke35c(kind, _, idx, _) => (*kind, *idx),
            Instruction::InvokeRange(kind, _, idx, _) => (*kind, *idx),
            _ => continue,
        };
        if kind.is_quick() {
            continue;
        }
        let method = match file.methods.get(idx as usize) {
            Some(method) => method,
            None => continue,
        };
        let class_name = file
            .get_type_name(method.class_idx as usize)
            .unwrap_or("")
            .to_string();
        invocations.push(Invokation {
            kind,
            class_name,
            method_name: method.method_name.clone(),
            proto: method.proto_name.clone(),
            address: offset.0,
        });
    }
    invocations
}

/// Lift a dex class into the format-agnostic model.
pub fn build_class_model(file: &DexFile, class: &Arc<DexClass>, context_spec: &str) -> ClassModel {
    let super_name = file
        .get_type_name(class.super_class as usize)
        .map(|s| s.to_string());
    let interface_names = class
        .interfaces
        .iter()
        .filter_map(|&idx| file.get_type_name(idx as usize))
        .map(|s| s.to_string())
        .collect();

    let mut fields = vec![];
    if let Some(class_data) = &class.class_data {
        for field in class_data
            .static_fields
            .iter()
            .chain(&class_data.instance_fields)
        {
            if let Some(field_id) = file.fields.get(field.field_idx as usize) {
                fields.push(FieldModel {
                    name: field_id.name.clone(),
                    descriptor: file
                        .get_type_name(field_id.type_idx as usize)
                        .unwrap_or("")
                        .to_string(),
                    access_flags: field.access_flags,
                });
            }
        }
    }

    let methods = class
        .codes
        .iter()
        .map(|method_data| {
            let invocations = method_data
                .code
                .as_ref()
                .map(|code| extract_invocations(file, code))
                .unwrap_or_default();
            Arc::new(MethodModel {
                class_name: class.class_name.clone(),
                name: method_data.name.clone(),
                proto: method_data.method.proto_name.clone(),
                access_flags: method_data.access_flags,
                exceptions: class
                    .method_throws
                    .get(&method_data.method_idx)
                    .cloned()
                    .unwrap_or_default(),
                invocations,
                body: MethodBody::Dex {
                    method_idx: method_data.method_idx,
                    code: method_data.code.clone(),
                },
            })
        })
        .collect();

    ClassModel {
        context_spec: context_spec.to_string(),
        name: class.class_name.clone(),
        access_flags: class.access_flags,
        super_name,
        interface_names,
        fields,
        methods,
        kind: ClassKind::Dex {
            dex_identifier: file.identifier.clone(),
            class_idx: class.class_idx,
        },
    }
}

fn get_string_from_idx<T>(idx: T, strings: &[StringEntry]) -> Option<String>
where
    T: Into<usize>,
{
    strings
        .get(idx.into())
        .and_then(|se| se.to_str().ok())
        .map(|s| s.to_owned())
}

fn parse_field_table(
    field_ids_size: u32,
    pool_cursor: &mut Cursor<&[u8]>,
    strings: &[StringEntry],
) -> Result<Vec<Arc<FieldId>>, FormatError> {
    let mut fields = Vec::with_capacity(field_ids_size as usize);
    for _ in 0..field_ids_size {
        let mut field = FieldId::from_bytes(pool_cursor)?;
        if let Some(name) = get_string_from_idx(field.name_idx as usize, strings) {
            field.name = name;
        }
        fields.push(Arc::new(field));
    }
    Ok(fields)
}

fn parse_class_def_table<T: Read + Seek>(
    class_defs_size: u32,
    buffer: &mut T,
) -> Result<Vec<Arc<ClassDefItem>>, FormatError> {
    let mut classes = Vec::with_capacity(class_defs_size as usize);
    for _ in 0..class_defs_size {
        classes.push(Arc::new(ClassDefItem::from_bytes(buffer)?));
    }
    Ok(classes)
}

fn parse_proto_table<T: Read + Seek>(
    proto_ids_size: u32,
    buffer: &mut T,
) -> Result<Vec<Arc<Proto>>, FormatError> {
    let mut protos = Vec::with_capacity(proto_ids_size as usize);
    for _ in 0..proto_ids_size {
        protos.push(Arc::new(Proto::from_bytes(buffer)?));
    }
    Ok(protos)
}

fn parse_method_table<T: Read + Seek>(
    method_ids_size: u32,
    strings: &[StringEntry],
    protos: &[Arc<Proto>],
    types: &[u32],
    buffer: &mut T,
) -> Result<Vec<Arc<MethodId>>, FormatError> {
    let mut methods = Vec::with_capacity(method_ids_size as usize);
    for i in 0..method_ids_size {
        let mut method = MethodId::from_bytes(buffer)?;
        method.method_name = strings
            .get(method.name_idx as usize)
            .map(|s| s.to_str_lossy().to_string())
            .ok_or_else(|| FormatError::corrupt("method name index out of range"))?;

        let proto = protos
            .get(method.proto_idx as usize)
            .ok_or_else(|| FormatError::corrupt("proto index out of range"))?;
        let type_name = |type_idx: usize| -> String {
            types
                .get(type_idx)
                .and_then(|&string_idx| strings.get(string_idx as usize))
                .map(|s| s.to_str_lossy().to_string())
                .unwrap_or_default()
        };
        let return_type = type_name(proto.return_type_idx as usize);
        let arg_string = proto
            .arguments
            .iter()
            .map(|&arg_type| type_name(arg_type as usize))
            .collect::<Vec<_>>()
            .join("");
        method.proto_name = format!("({}){}", arg_string, return_type);
        method.method_idx = i;
        methods.push(Arc::new(method));
    }
    Ok(methods)
}

fn parse_type_table<T: Read + Seek>(
    type_ids_size: u32,
    buffer: &mut T,
) -> Result<Vec<u32>, FormatError> {
    let mut type_names = Vec::with_capacity(type_ids_size as usize);
    for _ in 0..type_ids_size {
        type_names.push(u32::from_bytes(buffer)?);
    }
    Ok(type_names)
}

fn parse_string_table<T: Read + Seek>(
    start: u32,
    string_table_entries: u32,
    buffer: &mut T,
) -> Result<Vec<StringEntry>, FormatError> {
    let mut strings = Vec::with_capacity(string_table_entries as usize);
    let mut offset = start;
    for _ in 0..string_table_entries {
        let data_off = u32::from_bytes(buffer)?;
        buffer.seek(SeekFrom::Start(data_off as u64))?;
        strings.push(StringEntry::from_bytes(buffer)?);

        offset += 4;
        buffer.seek(SeekFrom::Start(offset as u64))?;
    }
    Ok(strings)
}
