// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reassembling a dex file. The writer rebuilds the container from the model:
//! pools are sorted per the format's ordering rules, every index is remapped
//! through the old-to-new maps, sections are emitted with a fresh map list,
//! and the signature and checksum are recomputed. Annotations and debug info
//! are not carried into rewritten output; their offsets are zero.

use std::{collections::HashMap, convert::TryFrom, sync::Arc};

use adler::Adler32;
use sha1::{Digest, Sha1};

use tracedex_models::models::{
    parse_method_descriptor, CatchHandler, ClassData, CodeItem, DexClass, DexFile, Encode,
    EncodedArray, EncodedField, EncodedItem, EncodedMethod, FieldId, FormatError, Instruction,
    InvokeKind, MethodId, Proto, StringEntry, TypeDescriptor, ValueType, DEX_MAGIC,
    ENDIAN_CONSTANT, NO_INDEX,
};

const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_TYPE_LIST: u16 = 0x1001;
const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
const TYPE_CODE_ITEM: u16 = 0x2001;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;

/// Mutable copies of the five id pools. Injection payloads append the
/// entries they need; the writer sorts and remaps everything at emit time.
pub struct DexPools {
    pub strings: Vec<StringEntry>,
    pub types: Vec<u32>,
    pub protos: Vec<Arc<Proto>>,
    pub fields: Vec<Arc<FieldId>>,
    pub methods: Vec<Arc<MethodId>>,
}

impl DexPools {
    pub fn from_file(file: &DexFile) -> DexPools {
        DexPools {
            strings: file.strings.clone(),
            types: file.types.clone(),
            protos: file.protos.clone(),
            fields: file.fields.clone(),
            methods: file.methods.clone(),
        }
    }

    pub fn string(&self, idx: usize) -> Option<String> {
        self.strings.get(idx).map(|s| s.to_str_lossy().into_owned())
    }

    pub fn type_name(&self, idx: usize) -> Option<String> {
        self.types
            .get(idx)
            .and_then(|&string_idx| self.string(string_idx as usize))
    }

    pub fn ensure_string(&mut self, value: &str) -> u32 {
        if let Some(idx) = self
            .strings
            .iter()
            .position(|s| s.to_str_lossy() == value)
        {
            return idx as u32;
        }
        self.strings.push(StringEntry::from_str(value));
        (self.strings.len() - 1) as u32
    }

    pub fn ensure_type(&mut self, descriptor: &str) -> Result<u16, FormatError> {
        let string_idx = self.ensure_string(descriptor);
        if let Some(idx) = self.types.iter().position(|&s| s == string_idx) {
            return Ok(idx as u16);
        }
        if self.types.len() >= u16::MAX as usize {
            return Err(FormatError::corrupt("type pool exhausted"));
        }
        self.types.push(string_idx);
        Ok((self.types.len() - 1) as u16)
    }

    /// The shorty form of a method descriptor: return first, every reference
    /// type collapsed to `L`.
    fn shorty(arguments: &[TypeDescriptor], return_type: &TypeDescriptor) -> String {
        let shorty_char = |t: &TypeDescriptor| match t {
            TypeDescriptor::Primitive(_) => t.to_descriptor().chars().next().unwrap_or('L'),
            _ => 'L',
        };
        let mut s = String::with_capacity(arguments.len() + 1);
        s.push(shorty_char(return_type));
        for argument in arguments {
            s.push(shorty_char(argument));
        }
        s
    }

    pub fn ensure_proto(&mut self, descriptor: &str) -> Result<u16, FormatError> {
        let (arguments, return_type) = parse_method_descriptor(descriptor)?;
        let shorty_idx = self.ensure_string(&Self::shorty(&arguments, &return_type));
        let return_type_idx = self.ensure_type(&return_type.to_descriptor())? as u32;
        let mut argument_idxs = Vec::with_capacity(arguments.len());
        for argument in &arguments {
            argument_idxs.push(self.ensure_type(&argument.to_descriptor())?);
        }
        if let Some(idx) = self.protos.iter().position(|p| {
            p.return_type_idx == return_type_idx && p.arguments == argument_idxs
        }) {
            return Ok(idx as u16);
        }
        if self.protos.len() >= u16::MAX as usize {
            return Err(FormatError::corrupt("proto pool exhausted"));
        }
        self.protos.push(Arc::new(Proto {
            shorty_idx,
            return_type_idx,
            parameters_off: 0,
            arguments: argument_idxs,
        }));
        Ok((self.protos.len() - 1) as u16)
    }

    pub fn ensure_field(
        &mut self,
        class_descriptor: &str,
        name: &str,
        type_descriptor: &str,
    ) -> Result<u16, FormatError> {
        let class_idx = self.ensure_type(class_descriptor)?;
        let type_idx = self.ensure_type(type_descriptor)?;
        let name_idx = self.ensure_string(name);
        if let Some(idx) = self.fields.iter().position(|f| {
            f.class_idx == class_idx && f.type_idx == type_idx && f.name_idx == name_idx
        }) {
            return Ok(idx as u16);
        }
        if self.fields.len() >= u16::MAX as usize {
            return Err(FormatError::corrupt("field pool exhausted"));
        }
        self.fields.push(Arc::new(FieldId {
            class_idx,
            type_idx,
            name_idx,
            name: name.to_string(),
        }));
        Ok((self.fields.len() - 1) as u16)
    }

    pub fn ensure_method(
        &mut self,
        class_descriptor: &str,
        name: &str,
        proto_descriptor: &str,
    ) -> Result<u16, FormatError> {
        let class_idx = self.ensure_type(class_descriptor)?;
        let proto_idx = self.ensure_proto(proto_descriptor)?;
        let name_idx = self.ensure_string(name);
        if let Some(idx) = self.methods.iter().position(|m| {
            m.class_idx == class_idx && m.proto_idx == proto_idx && m.name_idx == name_idx
        }) {
            return Ok(idx as u16);
        }
        let method_idx = self.methods.len();
        self.methods.push(Arc::new(MethodId {
            class_idx,
            method_idx: method_idx as u32,
            proto_idx,
            name_idx,
            method_name: name.to_string(),
            proto_name: proto_descriptor.to_string(),
        }));
        if method_idx > u16::MAX as usize {
            return Err(FormatError::corrupt("method pool exhausted"));
        }
        Ok(method_idx as u16)
    }
}

/// A dex ready for reassembly: the (possibly extended) pools plus the class
/// list with patched method bodies substituted in.
pub struct DexImage {
    pub pools: DexPools,
    pub classes: Vec<Arc<DexClass>>,
}

impl DexImage {
    pub fn from_file(file: &DexFile) -> DexImage {
        DexImage {
            pools: DexPools::from_file(file),
            classes: file.classes.clone(),
        }
    }
}

/// The old-to-new index maps produced by sorting the pools.
struct IndexMaps {
    strings: Vec<u32>,
    types: Vec<u32>,
    protos: Vec<u32>,
    fields: Vec<u32>,
    methods: Vec<u32>,
}

impl IndexMaps {
    fn string(&self, old: u32) -> Result<u32, FormatError> {
        self.strings
            .get(old as usize)
            .copied()
            .ok_or_else(|| FormatError::corrupt(format!("string index {} out of range", old)))
    }

    fn type_idx(&self, old: u32) -> Result<u32, FormatError> {
        if old == NO_INDEX {
            return Ok(NO_INDEX);
        }
        self.types
            .get(old as usize)
            .copied()
            .ok_or_else(|| FormatError::corrupt(format!("type index {} out of range", old)))
    }

    fn type_u16(&self, old: u16) -> Result<u16, FormatError> {
        u16::try_from(self.type_idx(old as u32)?)
            .map_err(|_| FormatError::corrupt("type index exceeds 16 bits"))
    }

    fn field_u16(&self, old: u16) -> Result<u16, FormatError> {
        let new = self
            .fields
            .get(old as usize)
            .copied()
            .ok_or_else(|| FormatError::corrupt(format!("field index {} out of range", old)))?;
        u16::try_from(new).map_err(|_| FormatError::corrupt("field index exceeds 16 bits"))
    }

    fn method(&self, old: u32) -> Result<u32, FormatError> {
        self.methods
            .get(old as usize)
            .copied()
            .ok_or_else(|| FormatError::corrupt(format!("method index {} out of range", old)))
    }

    fn method_u16(&self, old: u16) -> Result<u16, FormatError> {
        u16::try_from(self.method(old as u32)?)
            .map_err(|_| FormatError::corrupt("method index exceeds 16 bits"))
    }
}

/// Sort a pool by a key and return (sorted permutation, old-to-new map).
fn sort_pool<K: Ord>(len: usize, key: impl Fn(usize) -> K) -> (Vec<usize>, Vec<u32>) {
    let mut order: Vec<usize> = (0..len).collect();
    order.sort_by_key(|&i| key(i));
    let mut map = vec![0u32; len];
    for (new, &old) in order.iter().enumerate() {
        map[old] = new as u32;
    }
    (order, map)
}

fn build_maps(pools: &DexPools) -> IndexMaps {
    // string order approximates UTF-16 code point order via the MUTF-8 bytes
    let (_, strings) = sort_pool(pools.strings.len(), |i| pools.strings[i].dat.clone());
    let (_, types) = sort_pool(pools.types.len(), |i| strings[pools.types[i] as usize]);
    let (_, protos) = sort_pool(pools.protos.len(), |i| {
        let p = &pools.protos[i];
        let arguments: Vec<u32> = p
            .arguments
            .iter()
            .map(|&a| types.get(a as usize).copied().unwrap_or(NO_INDEX))
            .collect();
        (
            types.get(p.return_type_idx as usize).copied().unwrap_or(NO_INDEX),
            arguments,
        )
    });
    let (_, fields) = sort_pool(pools.fields.len(), |i| {
        let f = &pools.fields[i];
        (
            types.get(f.class_idx as usize).copied().unwrap_or(NO_INDEX),
            strings.get(f.name_idx as usize).copied().unwrap_or(NO_INDEX),
            types.get(f.type_idx as usize).copied().unwrap_or(NO_INDEX),
        )
    });
    let (_, methods) = sort_pool(pools.methods.len(), |i| {
        let m = &pools.methods[i];
        (
            types.get(m.class_idx as usize).copied().unwrap_or(NO_INDEX),
            strings.get(m.name_idx as usize).copied().unwrap_or(NO_INDEX),
            protos.get(m.proto_idx as usize).copied().unwrap_or(NO_INDEX),
        )
    });
    IndexMaps {
        strings,
        types,
        protos,
        fields,
        methods,
    }
}

/// Raw units of index-carrying opcodes without a named variant. Anything not
/// listed here carries no pool index and passes through untouched.
fn remap_raw_units(units: &mut [u16], maps: &IndexMaps) -> Result<(), FormatError> {
    if units.is_empty() {
        return Ok(());
    }
    let opcode = (units[0] & 0xff) as u8;
    match opcode {
        // check-cast, instance-of, new-array, filled-new-array (+ range)
        0x1f | 0x20 | 0x23 | 0x24 | 0x25 => {
            if units.len() > 1 {
                units[1] = maps.type_u16(units[1])?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn remap_instruction(insn: &Instruction, maps: &IndexMaps) -> Result<Instruction, FormatError> {
    Ok(match insn {
        Instruction::ConstString(reg, idx) => {
            let new = maps.string(*idx as u32)?;
            match u16::try_from(new) {
                Ok(new) => Instruction::ConstString(*reg, new),
                // widening to jumbo would shift every following offset
                Err(_) => {
                    return Err(FormatError::corrupt("string index exceeds 16 bits"));
                }
            }
        }
        Instruction::ConstStringJumbo(reg, idx) => {
            Instruction::ConstStringJumbo(*reg, maps.string(*idx)?)
        }
        Instruction::ConstClass(reg, idx) => Instruction::ConstClass(*reg, maps.type_u16(*idx)?),
        Instruction::NewInstance(reg, idx) => Instruction::NewInstance(*reg, maps.type_u16(*idx)?),
        Instruction::InstanceGet(a, b, idx, kind) => {
            Instruction::InstanceGet(*a, *b, maps.field_u16(*idx)?, *kind)
        }
        Instruction::InstancePut(a, b, idx, kind) => {
            Instruction::InstancePut(*a, *b, maps.field_u16(*idx)?, *kind)
        }
        Instruction::StaticGet(reg, idx, kind) => {
            Instruction::StaticGet(*reg, maps.field_u16(*idx)?, *kind)
        }
        Instruction::StaticPut(reg, idx, kind) => {
            Instruction::StaticPut(*reg, maps.field_u16(*idx)?, *kind)
        }
        Instruction::Invoke35c(kind, count, idx, regs) if !kind.is_quick() => {
            Instruction::Invoke35c(*kind, *count, maps.method_u16(*idx)?, *regs)
        }
        Instruction::InvokeRange(kind, count, idx, first) if !kind.is_quick() => {
            Instruction::InvokeRange(*kind, *count, maps.method_u16(*idx)?, *first)
        }
        Instruction::Invoke35c(kind, ..) | Instruction::InvokeRange(kind, ..) => {
            debug_assert!(matches!(
                kind,
                InvokeKind::VirtualQuick | InvokeKind::SuperQuick
            ));
            return Err(FormatError::corrupt(
                "quick invoke left in output; run the class-path pass first",
            ));
        }
        Instruction::Other(units) => {
            let mut units = units.clone();
            remap_raw_units(&mut units, maps)?;
            Instruction::Other(units)
        }
        other => other.clone(),
    })
}

fn remap_code(code: &CodeItem, maps: &IndexMaps) -> Result<CodeItem, FormatError> {
    let mut code = code.clone();
    code.debug_info_off = 0;
    for (_, _, insn) in &mut code.insns {
        *insn = remap_instruction(insn, maps)?;
    }
    code.handlers = code
        .handlers
        .iter()
        .map(|handler| {
            Ok(CatchHandler {
                catches: handler
                    .catches
                    .iter()
                    .map(|&(type_idx, addr)| Ok((maps.type_idx(type_idx)?, addr)))
                    .collect::<Result<_, FormatError>>()?,
                catch_all_addr: handler.catch_all_addr,
            })
        })
        .collect::<Result<_, FormatError>>()?;
    Ok(code)
}

fn remap_encoded_item(item: &EncodedItem, maps: &IndexMaps) -> Result<EncodedItem, FormatError> {
    let remapped = match item.value_type {
        ValueType::String => item
            .get_string_id()
            .map(|idx| maps.string(idx))
            .transpose()?
            .map(|new| EncodedItem::with_index(ValueType::String, new)),
        ValueType::Type => item
            .get_type_id()
            .map(|idx| maps.type_idx(idx))
            .transpose()?
            .map(|new| EncodedItem::with_index(ValueType::Type, new)),
        ValueType::Field | ValueType::Enum => {
            let mut bytes = [0u8; 4];
            for (i, b) in item.values.iter().take(4).enumerate() {
                bytes[i] = *b;
            }
            let idx = u32::from_le_bytes(bytes);
            let new = maps
                .fields
                .get(idx as usize)
                .copied()
                .ok_or_else(|| FormatError::corrupt("field index out of range"))?;
            Some(EncodedItem::with_index(item.value_type, new))
        }
        ValueType::Method => item
            .get_method_id()
            .map(|idx| maps.method(idx))
            .transpose()?
            .map(|new| EncodedItem::with_index(ValueType::Method, new)),
        ValueType::Array => {
            let inner = item
                .inner
                .as_ref()
                .map(|array| {
                    array
                        .items
                        .iter()
                        .map(|i| remap_encoded_item(i, maps))
                        .collect::<Result<Vec<_>, FormatError>>()
                })
                .transpose()?;
            return Ok(EncodedItem {
                value_arg: item.value_arg,
                value_type: ValueType::Array,
                values: item.values.clone(),
                inner: inner.map(|items| EncodedArray { items }),
            });
        }
        _ => None,
    };
    Ok(remapped.unwrap_or_else(|| item.clone()))
}

fn align4(buffer: &mut Vec<u8>) {
    while buffer.len() % 4 != 0 {
        buffer.push(0);
    }
}

fn encode_uleb(buffer: &mut Vec<u8>, value: u64) {
    // infallible for Vec
    let _ = <u32 as Encode>::write_leb128(buffer, value);
}

struct MapEntry {
    item_type: u16,
    size: u32,
    offset: u32,
}

/// Reassemble the image into a complete dex byte vector.
pub fn write_dex(image: &DexImage) -> Result<Vec<u8>, FormatError> {
    let pools = &image.pools;
    let maps = build_maps(pools);

    let string_count = pools.strings.len();
    let type_count = pools.types.len();
    let proto_count = pools.protos.len();
    let field_count = pools.fields.len();
    let method_count = pools.methods.len();
    let class_count = image.classes.len();

    let header_size = 0x70u32;
    let string_ids_off = header_size;
    let type_ids_off = string_ids_off + 4 * string_count as u32;
    let proto_ids_off = type_ids_off + 4 * type_count as u32;
    let field_ids_off = proto_ids_off + 12 * proto_count as u32;
    let method_ids_off = field_ids_off + 8 * field_count as u32;
    let class_defs_off = method_ids_off + 8 * method_count as u32;
    let data_off = class_defs_off + 32 * class_count as u32;

    // sorted views of the pools
    let mut string_order: Vec<usize> = (0..string_count).collect();
    string_order.sort_by_key(|&old| maps.strings[old]);
    let sorted_strings: Vec<&StringEntry> =
        string_order.iter().map(|&old| &pools.strings[old]).collect();

    let mut sorted_types = vec![0u32; type_count];
    for (old, &string_idx) in pools.types.iter().enumerate() {
        sorted_types[maps.types[old] as usize] = maps.string(string_idx)?;
    }
    let mut sorted_protos: Vec<(u32, u32, Vec<u16>)> = vec![(0, 0, vec![]); proto_count];
    for (old, proto) in pools.protos.iter().enumerate() {
        let arguments = proto
            .arguments
            .iter()
            .map(|&a| maps.type_u16(a))
            .collect::<Result<Vec<_>, _>>()?;
        sorted_protos[maps.protos[old] as usize] = (
            maps.string(proto.shorty_idx)?,
            maps.type_idx(proto.return_type_idx)?,
            arguments,
        );
    }
    let mut sorted_fields: Vec<(u16, u16, u32)> = vec![(0, 0, 0); field_count];
    for (old, field) in pools.fields.iter().enumerate() {
        sorted_fields[maps.fields[old] as usize] = (
            maps.type_u16(field.class_idx)?,
            maps.type_u16(field.type_idx)?,
            maps.string(field.name_idx)?,
        );
    }
    let mut sorted_methods: Vec<(u16, u16, u32)> = vec![(0, 0, 0); method_count];
    for (old, method) in pools.methods.iter().enumerate() {
        let proto = maps
            .protos
            .get(method.proto_idx as usize)
            .copied()
            .ok_or_else(|| FormatError::corrupt("proto index out of range"))?;
        sorted_methods[maps.methods[old] as usize] = (
            maps.type_u16(method.class_idx)?,
            u16::try_from(proto).map_err(|_| FormatError::corrupt("proto index exceeds 16 bits"))?,
            maps.string(method.name_idx)?,
        );
    }

    // data section, assembled before the id tables so offsets are known
    let mut data = Vec::new();
    let abs = |data: &Vec<u8>| data_off + data.len() as u32;

    // type lists: proto parameters and class interfaces, deduplicated
    let mut type_list_offs: HashMap<Vec<u16>, u32> = HashMap::new();
    let mut type_list_count = 0u32;
    let mut type_lists_off = 0u32;
    {
        let mut lists: Vec<Vec<u16>> = vec![];
        for (_, _, arguments) in &sorted_protos {
            if !arguments.is_empty() {
                lists.push(arguments.clone());
            }
        }
        for class in &image.classes {
            if !class.interfaces.is_empty() {
                let interfaces = class
                    .interfaces
                    .iter()
                    .map(|&i| maps.type_u16(i))
                    .collect::<Result<Vec<_>, _>>()?;
                lists.push(interfaces);
            }
        }
        for list in lists {
            if type_list_offs.contains_key(&list) {
                continue;
            }
            align4(&mut data);
            if type_list_count == 0 {
                type_lists_off = abs(&data);
            }
            let off = abs(&data);
            data.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for &entry in &list {
                data.extend_from_slice(&entry.to_le_bytes());
            }
            type_list_offs.insert(list, off);
            type_list_count += 1;
        }
    }

    // code items, keyed by (class index in image, method idx) for class data
    let mut code_offs: HashMap<(usize, u32), u32> = HashMap::new();
    let mut code_count = 0u32;
    let mut code_items_off = 0u32;
    for (class_pos, class) in image.classes.iter().enumerate() {
        for method_data in &class.codes {
            let code = match &method_data.code {
                Some(code) => code,
                None => continue,
            };
            align4(&mut data);
            if code_count == 0 {
                code_items_off = abs(&data);
            }
            let off = abs(&data);
            let remapped = remap_code(code, &maps)?;
            remapped.to_bytes(&mut data)?;
            code_offs.insert((class_pos, method_data.method_idx), off);
            code_count += 1;
        }
    }

    // class data items
    let mut class_data_offs: HashMap<usize, u32> = HashMap::new();
    let mut class_data_count = 0u32;
    let mut class_data_items_off = 0u32;
    for (class_pos, class) in image.classes.iter().enumerate() {
        let class_data = match &class.class_data {
            Some(class_data) => class_data,
            None => continue,
        };
        if class_data_count == 0 {
            class_data_items_off = abs(&data);
        }
        let off = abs(&data);
        encode_class_data(
            &mut data,
            class_data,
            &maps,
            |method_idx| code_offs.get(&(class_pos, method_idx)).copied(),
        )?;
        class_data_offs.insert(class_pos, off);
        class_data_count += 1;
    }

    // static value arrays
    let mut static_value_offs: HashMap<usize, u32> = HashMap::new();
    let mut static_values_count = 0u32;
    let mut static_values_off = 0u32;
    for (class_pos, class) in image.classes.iter().enumerate() {
        if class.static_values.is_empty() {
            continue;
        }
        if static_values_count == 0 {
            static_values_off = abs(&data);
        }
        let off = abs(&data);
        encode_uleb(&mut data, class.static_values.len() as u64);
        for item in &class.static_values {
            remap_encoded_item(item, &maps)?.to_bytes(&mut data)?;
        }
        static_value_offs.insert(class_pos, off);
        static_values_count += 1;
    }

    // string data
    let mut string_data_offs = Vec::with_capacity(string_count);
    let string_data_off = abs(&data);
    for entry in &sorted_strings {
        string_data_offs.push(abs(&data));
        entry.to_bytes(&mut data)?;
    }

    // map list
    align4(&mut data);
    let map_off = abs(&data);
    {
        let mut entries = vec![
            MapEntry {
                item_type: TYPE_HEADER_ITEM,
                size: 1,
                offset: 0,
            },
            MapEntry {
                item_type: TYPE_STRING_ID_ITEM,
                size: string_count as u32,
                offset: string_ids_off,
            },
            MapEntry {
                item_type: TYPE_TYPE_ID_ITEM,
                size: type_count as u32,
                offset: type_ids_off,
            },
            MapEntry {
                item_type: TYPE_PROTO_ID_ITEM,
                size: proto_count as u32,
                offset: proto_ids_off,
            },
            MapEntry {
                item_type: TYPE_FIELD_ID_ITEM,
                size: field_count as u32,
                offset: field_ids_off,
            },
            MapEntry {
                item_type: TYPE_METHOD_ID_ITEM,
                size: method_count as u32,
                offset: method_ids_off,
            },
            MapEntry {
                item_type: TYPE_CLASS_DEF_ITEM,
                size: class_count as u32,
                offset: class_defs_off,
            },
        ];
        if type_list_count > 0 {
            entries.push(MapEntry {
                item_type: TYPE_TYPE_LIST,
                size: type_list_count,
                offset: type_lists_off,
            });
        }
        if code_count > 0 {
            entries.push(MapEntry {
                item_type: TYPE_CODE_ITEM,
                size: code_count,
                offset: code_items_off,
            });
        }
        if class_data_count > 0 {
            entries.push(MapEntry {
                item_type: TYPE_CLASS_DATA_ITEM,
                size: class_data_count,
                offset: class_data_items_off,
            });
        }
        if static_values_count > 0 {
            entries.push(MapEntry {
                item_type: TYPE_ENCODED_ARRAY_ITEM,
                size: static_values_count,
                offset: static_values_off,
            });
        }
        if string_count > 0 {
            entries.push(MapEntry {
                item_type: TYPE_STRING_DATA_ITEM,
                size: string_count as u32,
                offset: string_data_off,
            });
        }
        entries.push(MapEntry {
            item_type: TYPE_MAP_LIST,
            size: 1,
            offset: map_off,
        });
        entries.retain(|e| e.size > 0);
        entries.sort_by_key(|e| e.offset);
        data.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for entry in entries {
            data.extend_from_slice(&entry.item_type.to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes());
            data.extend_from_slice(&entry.size.to_le_bytes());
            data.extend_from_slice(&entry.offset.to_le_bytes());
        }
    }

    let file_size = data_off + data.len() as u32;

    // assemble the whole file
    let mut out = Vec::with_capacity(file_size as usize);
    out.extend_from_slice(DEX_MAGIC);
    out.extend_from_slice(b"035\0");
    out.extend_from_slice(&0u32.to_le_bytes()); // checksum, patched below
    out.extend_from_slice(&[0u8; 20]); // signature, patched below
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(&header_size.to_le_bytes());
    out.extend_from_slice(&ENDIAN_CONSTANT.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // link_size
    out.extend_from_slice(&0u32.to_le_bytes()); // link_off
    out.extend_from_slice(&map_off.to_le_bytes());
    out.extend_from_slice(&(string_count as u32).to_le_bytes());
    out.extend_from_slice(&string_ids_off.to_le_bytes());
    out.extend_from_slice(&(type_count as u32).to_le_bytes());
    out.extend_from_slice(&type_ids_off.to_le_bytes());
    out.extend_from_slice(&(proto_count as u32).to_le_bytes());
    out.extend_from_slice(&proto_ids_off.to_le_bytes());
    out.extend_from_slice(&(field_count as u32).to_le_bytes());
    out.extend_from_slice(&field_ids_off.to_le_bytes());
    out.extend_from_slice(&(method_count as u32).to_le_bytes());
    out.extend_from_slice(&method_ids_off.to_le_bytes());
    out.extend_from_slice(&(class_count as u32).to_le_bytes());
    out.extend_from_slice(&class_defs_off.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data_off.to_le_bytes());
    debug_assert_eq!(out.len(), header_size as usize);

    for &off in &string_data_offs {
        out.extend_from_slice(&off.to_le_bytes());
    }
    for &string_idx in &sorted_types {
        out.extend_from_slice(&string_idx.to_le_bytes());
    }
    for (shorty_idx, return_type_idx, arguments) in &sorted_protos {
        out.extend_from_slice(&shorty_idx.to_le_bytes());
        out.extend_from_slice(&return_type_idx.to_le_bytes());
        let parameters_off = if arguments.is_empty() {
            0
        } else {
            type_list_offs.get(arguments).copied().unwrap_or(0)
        };
        out.extend_from_slice(&parameters_off.to_le_bytes());
    }
    for (class_idx, type_idx, name_idx) in &sorted_fields {
        out.extend_from_slice(&class_idx.to_le_bytes());
        out.extend_from_slice(&type_idx.to_le_bytes());
        out.extend_from_slice(&name_idx.to_le_bytes());
    }
    for (class_idx, proto_idx, name_idx) in &sorted_methods {
        out.extend_from_slice(&class_idx.to_le_bytes());
        out.extend_from_slice(&proto_idx.to_le_bytes());
        out.extend_from_slice(&name_idx.to_le_bytes());
    }
    for (class_pos, class) in image.classes.iter().enumerate() {
        out.extend_from_slice(&maps.type_idx(class.class_idx)?.to_le_bytes());
        out.extend_from_slice(&(class.access_flags.bits() as u32).to_le_bytes());
        out.extend_from_slice(&maps.type_idx(class.super_class)?.to_le_bytes());
        let interfaces_off = if class.interfaces.is_empty() {
            0
        } else {
            let interfaces = class
                .interfaces
                .iter()
                .map(|&i| maps.type_u16(i))
                .collect::<Result<Vec<_>, _>>()?;
            type_list_offs.get(&interfaces).copied().unwrap_or(0)
        };
        out.extend_from_slice(&interfaces_off.to_le_bytes());
        let source_file_idx = if class.source_file_idx == NO_INDEX {
            NO_INDEX
        } else {
            maps.string(class.source_file_idx)?
        };
        out.extend_from_slice(&source_file_idx.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // annotations dropped
        let class_data_off = class_data_offs.get(&class_pos).copied().unwrap_or(0);
        out.extend_from_slice(&class_data_off.to_le_bytes());
        let static_values_off = static_value_offs.get(&class_pos).copied().unwrap_or(0);
        out.extend_from_slice(&static_values_off.to_le_bytes());
    }
    debug_assert_eq!(out.len(), data_off as usize);
    out.extend_from_slice(&data);

    // signature over everything after it, then checksum over everything
    // after the checksum
    let mut hasher = Sha1::new();
    hasher.update(&out[32..]);
    let signature = hasher.finalize();
    out[12..32].copy_from_slice(signature.as_slice());
    let mut adler = Adler32::new();
    adler.write_slice(&out[12..]);
    let checksum = adler.checksum();
    out[8..12].copy_from_slice(&checksum.to_le_bytes());

    Ok(out)
}

/// Class data with diff-encoded indices, remapped and re-sorted; encoded
/// method entries point at the freshly emitted code items.
fn encode_class_data(
    data: &mut Vec<u8>,
    class_data: &ClassData,
    maps: &IndexMaps,
    code_off: impl Fn(u32) -> Option<u32>,
) -> Result<(), FormatError> {
    encode_uleb(data, class_data.static_fields.len() as u64);
    encode_uleb(data, class_data.instance_fields.len() as u64);
    encode_uleb(data, class_data.direct_methods.len() as u64);
    encode_uleb(data, class_data.virtual_methods.len() as u64);

    let mut encode_fields =
        |data: &mut Vec<u8>, fields: &[EncodedField]| -> Result<(), FormatError> {
        let mut remapped: Vec<(u32, u64)> = fields
            .iter()
            .map(|f| {
                let new = maps
                    .fields
                    .get(f.field_idx as usize)
                    .copied()
                    .ok_or_else(|| FormatError::corrupt("field index out of range"))?;
                Ok((new, f.access_flags.bits()))
            })
            .collect::<Result<_, FormatError>>()?;
        remapped.sort_by_key(|&(idx, _)| idx);
        let mut last = 0u32;
        for (i, (idx, flags)) in remapped.iter().enumerate() {
            let diff = if i == 0 { *idx } else { idx - last };
            last = *idx;
            encode_uleb(data, diff as u64);
            encode_uleb(data, *flags);
        }
        Ok(())
    };
    encode_fields(data, &class_data.static_fields)?;
    encode_fields(data, &class_data.instance_fields)?;

    let mut encode_methods =
        |data: &mut Vec<u8>, methods: &[EncodedMethod]| -> Result<(), FormatError> {
            let mut remapped: Vec<(u32, u64, u32)> = methods
                .iter()
                .map(|m| {
                    let new = maps.method(m.method_idx)?;
                    let off = code_off(m.method_idx).unwrap_or(0);
                    Ok((new, m.access_flags.bits(), off))
                })
                .collect::<Result<_, FormatError>>()?;
            remapped.sort_by_key(|&(idx, _, _)| idx);
            let mut last = 0u32;
            for (i, (idx, flags, off)) in remapped.iter().enumerate() {
                let diff = if i == 0 { *idx } else { idx - last };
                last = *idx;
                encode_uleb(data, diff as u64);
                encode_uleb(data, *flags);
                encode_uleb(data, *off as u64);
            }
            Ok(())
        };
    encode_methods(data, &class_data.direct_methods)?;
    encode_methods(data, &class_data.virtual_methods)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedex_models::models::{
        AccessFlags, Instruction, InstructionOffset, InstructionSize, MethodData,
    };

    fn image_with_one_class() -> DexImage {
        let mut pools = DexPools {
            strings: vec![],
            types: vec![],
            protos: vec![],
            fields: vec![],
            methods: vec![],
        };
        let class_type = pools.ensure_type("LFoo;").unwrap();
        let object_type = pools.ensure_type("Ljava/lang/Object;").unwrap();
        let method_idx = pools.ensure_method("LFoo;", "bar", "()V").unwrap();
        let text_idx = pools.ensure_string("hello");

        let code = CodeItem {
            registers_size: 1,
            ins_size: 1,
            outs_size: 0,
            debug_info_off: 0,
            insns: vec![
                (
                    InstructionSize(2),
                    InstructionOffset(0),
                    Instruction::ConstString(0, text_idx as u16),
                ),
                (
                    InstructionSize(1),
                    InstructionOffset(2),
                    Instruction::ReturnVoid,
                ),
            ],
            tries: vec![],
            handlers: vec![],
        };
        let class = DexClass {
            dex_identifier: String::new(),
            class_idx: class_type as u32,
            class_name: "LFoo;".to_string(),
            access_flags: AccessFlags::PUBLIC,
            super_class: object_type as u32,
            interfaces: vec![],
            annotations_off: 0,
            source_file_idx: NO_INDEX,
            class_data: Some(ClassData {
                static_fields: vec![],
                instance_fields: vec![],
                direct_methods: vec![],
                virtual_methods: vec![EncodedMethod {
                    method_idx: method_idx as u32,
                    access_flags: AccessFlags::PUBLIC,
                    code_off: 0,
                }],
            }),
            codes: vec![MethodData {
                name: "bar".to_string(),
                method: pools.methods[method_idx as usize].clone(),
                method_idx: method_idx as u32,
                access_flags: AccessFlags::PUBLIC,
                code: Some(code),
            }],
            static_values: vec![],
            method_throws: Default::default(),
        };
        DexImage {
            pools,
            classes: vec![Arc::new(class)],
        }
    }

    #[test]
    fn written_dex_reads_back() {
        let image = image_with_one_class();
        let bytes = write_dex(&image).unwrap();
        let view = tracedex_parse::dex::ArrayView::new(&bytes);
        let file = tracedex_parse::dex::parse_dex_buf("out.dex", &view).unwrap();

        assert_eq!(file.classes.len(), 1);
        let class = file.get_class_by_name("LFoo;").unwrap();
        assert_eq!(class.codes.len(), 1);
        let code = class.codes[0].code.as_ref().unwrap();
        assert!(matches!(code.insns[0].2, Instruction::ConstString(0, _)));
        assert_eq!(code.insns[1].2, Instruction::ReturnVoid);
        // the string behind the remapped index is still the payload text
        if let Instruction::ConstString(_, idx) = code.insns[0].2 {
            assert_eq!(file.get_string(idx as usize), Some("hello"));
        }
    }

    #[test]
    fn checksum_and_signature_are_consistent() {
        let image = image_with_one_class();
        let bytes = write_dex(&image).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(&bytes[32..]);
        assert_eq!(&bytes[12..32], hasher.finalize().as_slice());

        let mut adler = Adler32::new();
        adler.write_slice(&bytes[12..]);
        assert_eq!(
            &bytes[8..12],
            adler.checksum().to_le_bytes().as_slice()
        );
    }

    #[test]
    fn pools_are_sorted_after_rebuild() {
        let image = image_with_one_class();
        let bytes = write_dex(&image).unwrap();
        let view = tracedex_parse::dex::ArrayView::new(&bytes);
        let file = tracedex_parse::dex::parse_dex_buf("out.dex", &view).unwrap();

        let strings: Vec<_> = file
            .strings
            .iter()
            .map(|s| s.dat.clone())
            .collect();
        let mut sorted = strings.clone();
        sorted.sort();
        assert_eq!(strings, sorted);
    }

    #[test]
    fn class_definition_order_survives_a_rewrite() {
        let mut pools = DexPools {
            strings: vec![],
            types: vec![],
            protos: vec![],
            fields: vec![],
            methods: vec![],
        };
        let object = pools.ensure_type("Ljava/lang/Object;").unwrap();
        // a superclass must be defined before its subclasses
        let names = ["LBase;", "LMiddle;", "LLeaf;", "LOther;"];
        let mut classes = vec![];
        let mut super_idx = object as u32;
        for name in &names {
            let idx = pools.ensure_type(name).unwrap();
            classes.push(Arc::new(DexClass {
                dex_identifier: String::new(),
                class_idx: idx as u32,
                class_name: name.to_string(),
                access_flags: AccessFlags::PUBLIC,
                super_class: super_idx,
                interfaces: vec![],
                annotations_off: 0,
                source_file_idx: NO_INDEX,
                class_data: None,
                codes: vec![],
                static_values: vec![],
                method_throws: Default::default(),
            }));
            super_idx = idx as u32;
        }
        let image = DexImage { pools, classes };
        let bytes = write_dex(&image).unwrap();
        let view = tracedex_parse::dex::ArrayView::new(&bytes);
        let file = tracedex_parse::dex::parse_dex_buf("out.dex", &view).unwrap();

        let parsed: Vec<&str> = file
            .classes
            .iter()
            .map(|c| c.class_name.as_str())
            .collect();
        assert_eq!(parsed, names);
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut pools = DexPools {
            strings: vec![],
            types: vec![],
            protos: vec![],
            fields: vec![],
            methods: vec![],
        };
        let a = pools.ensure_method("LFoo;", "bar", "(I)V").unwrap();
        let b = pools.ensure_method("LFoo;", "bar", "(I)V").unwrap();
        assert_eq!(a, b);
        assert_eq!(pools.methods.len(), 1);
    }
}
