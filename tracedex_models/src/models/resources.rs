// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Compiled resource table (resources.arsc). Only the package/type skeleton
//! is decoded, which is enough to decide whether a numeric resource id
//! resolves inside the application or points into the framework.

use std::{
    collections::HashMap,
    io::{Cursor, Seek, SeekFrom},
};

use log::debug;

use super::{Decode, FormatError};

const RES_TABLE_TYPE: u16 = 0x0002;
const RES_TABLE_PACKAGE_TYPE: u16 = 0x0200;
const RES_TABLE_TYPE_TYPE: u16 = 0x0201;
const RES_TABLE_TYPE_SPEC_TYPE: u16 = 0x0202;

/// Package id of the android framework; references with it never resolve in
/// the application's own table.
pub const ANDROID_PACKAGE_ID: u8 = 0x01;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResourcePackage {
    pub id: u8,
    pub name: String,
    /// Highest entry count seen per type id.
    pub type_entries: HashMap<u8, u32>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceTable {
    pub packages: Vec<ResourcePackage>,
}

/// Split a resource id into (package, type, entry).
pub fn split_resource_id(resource_id: u32) -> (u8, u8, u16) {
    (
        (resource_id >> 24) as u8,
        ((resource_id >> 16) & 0xff) as u8,
        (resource_id & 0xffff) as u16,
    )
}

/// Whether an id references the android framework table (0x01 package).
pub fn is_android_reference(resource_id: u32) -> bool {
    (resource_id >> 24) as u8 == ANDROID_PACKAGE_ID
}

impl ResourceTable {
    pub fn from_bytes(data: &[u8]) -> Result<ResourceTable, FormatError> {
        let mut cursor = Cursor::new(data);
        let chunk_type = u16::from_bytes(&mut cursor)?;
        if chunk_type != RES_TABLE_TYPE {
            return Err(FormatError::corrupt("missing RES_TABLE chunk"));
        }
        let header_size = u16::from_bytes(&mut cursor)?;
        let _size = u32::from_bytes(&mut cursor)?;
        let package_count = u32::from_bytes(&mut cursor)?;
        cursor.seek(SeekFrom::Start(header_size as u64))?;

        let mut packages = vec![];
        while (cursor.position() as usize) < data.len() && packages.len() < package_count as usize {
            let chunk_start = cursor.position();
            let chunk_type = u16::from_bytes(&mut cursor)?;
            let chunk_header_size = u16::from_bytes(&mut cursor)?;
            let chunk_size = u32::from_bytes(&mut cursor)?;
            if chunk_size == 0 {
                return Err(FormatError::corrupt("zero-size resource chunk"));
            }
            if chunk_type == RES_TABLE_PACKAGE_TYPE {
                packages.push(Self::read_package(
                    &mut cursor,
                    chunk_start,
                    chunk_header_size,
                    chunk_size,
                )?);
            }
            cursor.seek(SeekFrom::Start(chunk_start + chunk_size as u64))?;
        }
        debug!("resource table with {} package(s)", packages.len());
        Ok(ResourceTable { packages })
    }

    fn read_package(
        cursor: &mut Cursor<&[u8]>,
        chunk_start: u64,
        header_size: u16,
        chunk_size: u32,
    ) -> Result<ResourcePackage, FormatError> {
        let id = u32::from_bytes(cursor)? as u8;
        let mut name_utf16 = [0u16; 128];
        for slot in name_utf16.iter_mut() {
            *slot = u16::from_bytes(cursor)?;
        }
        let end = name_utf16.iter().position(|&c| c == 0).unwrap_or(128);
        let name = String::from_utf16_lossy(&name_utf16[..end]);

        cursor.seek(SeekFrom::Start(chunk_start + header_size as u64))?;
        let package_end = chunk_start + chunk_size as u64;
        let mut type_entries: HashMap<u8, u32> = HashMap::new();
        while cursor.position() < package_end {
            let inner_start = cursor.position();
            let inner_type = u16::from_bytes(cursor)?;
            let _inner_header_size = u16::from_bytes(cursor)?;
            let inner_size = u32::from_bytes(cursor)?;
            if inner_size == 0 {
                break;
            }
            match inner_type {
                RES_TABLE_TYPE_SPEC_TYPE => {
                    let type_id = u8::from_bytes(cursor)?;
                    let _res0 = u8::from_bytes(cursor)?;
                    let _res1 = u16::from_bytes(cursor)?;
                    let entry_count = u32::from_bytes(cursor)?;
                    let slot = type_entries.entry(type_id).or_insert(0);
                    *slot = (*slot).max(entry_count);
                }
                RES_TABLE_TYPE_TYPE => {
                    let type_id = u8::from_bytes(cursor)?;
                    let _flags = u8::from_bytes(cursor)?;
                    let _reserved = u16::from_bytes(cursor)?;
                    let entry_count = u32::from_bytes(cursor)?;
                    let slot = type_entries.entry(type_id).or_insert(0);
                    *slot = (*slot).max(entry_count);
                }
                _ => {}
            }
            cursor.seek(SeekFrom::Start(inner_start + inner_size as u64))?;
        }
        Ok(ResourcePackage {
            id,
            name,
            type_entries,
        })
    }

    /// Whether the table has an entry slot for this resource id.
    pub fn can_resolve(&self, resource_id: u32) -> bool {
        let (package_id, type_id, entry) = split_resource_id(resource_id);
        self.packages.iter().any(|p| {
            p.id == package_id
                && p.type_entries
                    .get(&type_id)
                    .map(|&count| (entry as u32) < count)
                    .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(package_id: u8, type_id: u8, entries: u32) -> ResourceTable {
        let mut type_entries = HashMap::new();
        type_entries.insert(type_id, entries);
        ResourceTable {
            packages: vec![ResourcePackage {
                id: package_id,
                name: "com.example".to_string(),
                type_entries,
            }],
        }
    }

    #[test]
    fn resolves_inside_entry_range() {
        let table = table_with(0x7f, 0x02, 10);
        assert!(table.can_resolve(0x7f02_0000));
        assert!(table.can_resolve(0x7f02_0009));
        assert!(!table.can_resolve(0x7f02_000a));
        assert!(!table.can_resolve(0x7f03_0000));
        assert!(!table.can_resolve(0x0102_0000));
    }

    #[test]
    fn android_reference_is_package_one() {
        assert!(is_android_reference(0x0104_0001));
        assert!(!is_android_reference(0x7f04_0001));
        assert_eq!(split_resource_id(0x7f02_0003), (0x7f, 0x02, 3));
    }

    #[test]
    fn package_chunk_skeleton_parses() {
        // RES_TABLE header, one package with one typeSpec of 4 entries
        let mut bytes = vec![];
        bytes.extend_from_slice(&RES_TABLE_TYPE.to_le_bytes());
        bytes.extend_from_slice(&12u16.to_le_bytes()); // header size
        bytes.extend_from_slice(&0u32.to_le_bytes()); // total size (unused)
        bytes.extend_from_slice(&1u32.to_le_bytes()); // package count

        let mut package = vec![];
        package.extend_from_slice(&RES_TABLE_PACKAGE_TYPE.to_le_bytes());
        let package_header_size = 8u16 + 4 + 256;
        package.extend_from_slice(&package_header_size.to_le_bytes());
        let type_spec_size = 16u32;
        let package_size = package_header_size as u32 + type_spec_size;
        package.extend_from_slice(&package_size.to_le_bytes());
        package.extend_from_slice(&0x7fu32.to_le_bytes());
        let mut name = [0u16; 128];
        for (i, c) in "com.example".encode_utf16().enumerate() {
            name[i] = c;
        }
        for c in name {
            package.extend_from_slice(&c.to_le_bytes());
        }
        package.extend_from_slice(&RES_TABLE_TYPE_SPEC_TYPE.to_le_bytes());
        package.extend_from_slice(&16u16.to_le_bytes());
        package.extend_from_slice(&type_spec_size.to_le_bytes());
        package.push(0x02); // type id
        package.push(0);
        package.extend_from_slice(&0u16.to_le_bytes());
        package.extend_from_slice(&4u32.to_le_bytes()); // entry count
        bytes.extend_from_slice(&package);

        let table = ResourceTable::from_bytes(&bytes).unwrap();
        assert_eq!(table.packages.len(), 1);
        assert_eq!(table.packages[0].name, "com.example");
        assert!(table.can_resolve(0x7f02_0003));
        assert!(!table.can_resolve(0x7f02_0004));
    }
}
