// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-context reference cache. One pass over every method body collects
//! resource-id constants, string constants, field accesses and call sites;
//! after construction the cache is frozen and only queried.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracedex_macros::iterator;
use tracedex_models::models::{
    is_android_reference, DexClass, DexFile, Instruction, Invokation, ResourceTable,
};

#[cfg(not(target_arch = "wasm32"))]
use rayon::iter::ParallelIterator;

use crate::dex::extract_invocations;

/// Where a numeric resource reference points, judged against the context's
/// own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOrigin {
    /// Resolves in the application's own resource table.
    Internal,
    /// References the android framework table.
    Android,
    /// Looks like a resource id but resolves nowhere we know of.
    External,
}

#[derive(Debug, Clone)]
pub struct ResourceReference {
    pub resource_id: u32,
    pub origin: ResourceOrigin,
    pub method: String,
    pub address: u32,
}

#[derive(Debug, Clone)]
pub struct StringReference {
    pub value: String,
    pub method: String,
    pub address: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccessKind {
    InstanceGet,
    InstancePut,
    StaticGet,
    StaticPut,
}

impl FieldAccessKind {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            FieldAccessKind::InstancePut | FieldAccessKind::StaticPut
        )
    }
}

#[derive(Debug, Clone)]
pub struct FieldAccess {
    pub kind: FieldAccessKind,
    pub class_name: String,
    pub field_name: String,
    pub method: String,
    pub address: u32,
}

#[derive(Debug, Clone)]
pub struct CallSite {
    pub caller: String,
    pub invocation: Invokation,
}

/// The frozen result of the analysis pass.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    resources: Vec<ResourceReference>,
    strings: Vec<StringReference>,
    field_accesses: Vec<FieldAccess>,
    call_sites: Vec<CallSite>,
    /// Invocations per method id, keyed by (dex identifier, method index).
    invocations: HashMap<(String, u32), Vec<Invokation>>,
}

/// A candidate resource id has a plausible package byte and a nonzero type
/// byte; everything else is an ordinary integer constant.
fn looks_like_resource_id(value: u32) -> bool {
    let package = (value >> 24) as u8;
    let type_id = ((value >> 16) & 0xff) as u8;
    (package == 0x01 || package >= 0x7f) && type_id != 0
}

impl ReferenceCache {
    /// Run the analysis pass over every dex of a context. The cache never
    /// changes afterwards; contexts rebuild it wholesale when their dex set
    /// changes.
    pub fn analyze(dex_files: &[Arc<DexFile>], resources: Option<&ResourceTable>) -> ReferenceCache {
        let cache = Mutex::new(ReferenceCache::default());
        for file in dex_files {
            iterator!(file.classes).for_each(|class| {
                let partial = Self::analyze_class(file, class, resources);
                if let Ok(mut cache) = cache.lock() {
                    cache.resources.extend(partial.resources);
                    cache.strings.extend(partial.strings);
                    cache.field_accesses.extend(partial.field_accesses);
                    cache.call_sites.extend(partial.call_sites);
                    cache.invocations.extend(partial.invocations);
                }
            });
        }
        match cache.into_inner() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn analyze_class(
        file: &DexFile,
        class: &Arc<DexClass>,
        resources: Option<&ResourceTable>,
    ) -> ReferenceCache {
        let mut partial = ReferenceCache::default();
        for method_data in &class.codes {
            let code = match &method_data.code {
                Some(code) => code,
                None => continue,
            };
            let method_name = format!(
                "{}->{}{}",
                class.class_name, method_data.name, method_data.method.proto_name
            );
            for (_, offset, insn) in &code.insns {
                let resource_candidate = match insn {
                    Instruction::ConstLit32(_, lit) => Some(*lit as u32),
                    Instruction::ConstHigh16(_, lit) => Some((*lit as u16 as u32) << 16),
                    _ => None,
                };
                if let Some(id) = resource_candidate.filter(|&id| looks_like_resource_id(id)) {
                    let origin = if resources.map(|r| r.can_resolve(id)).unwrap_or(false) {
                        ResourceOrigin::Internal
                    } else if is_android_reference(id) {
                        ResourceOrigin::Android
                    } else {
                        ResourceOrigin::External
                    };
                    partial.resources.push(ResourceReference {
                        resource_id: id,
                        origin,
                        method: method_name.clone(),
                        address: offset.0,
                    });
                    continue;
                }
                match insn {
                    Instruction::ConstString(_, string_idx) => {
                        if let Some(value) = file.get_string(*string_idx as usize) {
                            partial.strings.push(StringReference {
                                value: value.to_string(),
                                method: method_name.clone(),
                                address: offset.0,
                            });
                        }
                    }
                    Instruction::ConstStringJumbo(_, string_idx) => {
                        if let Some(value) = file.get_string(*string_idx as usize) {
                            partial.strings.push(StringReference {
                                value: value.to_string(),
                                method: method_name.clone(),
                                address: offset.0,
                            });
                        }
                    }
                    Instruction::InstanceGet(_, _, field_idx, _) => {
                        partial.push_field_access(
                            file,
                            FieldAccessKind::InstanceGet,
                            *field_idx,
                            &method_name,
                            offset.0,
                        );
                    }
                    Instruction::InstancePut(_, _, field_idx, _) => {
                        partial.push_field_access(
                            file,
                            FieldAccessKind::InstancePut,
                            *field_idx,
                            &method_name,
                            offset.0,
                        );
                    }
                    Instruction::StaticGet(_, field_idx, _) => {
                        partial.push_field_access(
                            file,
                            FieldAccessKind::StaticGet,
                            *field_idx,
                            &method_name,
                            offset.0,
                        );
                    }
                    Instruction::StaticPut(_, field_idx, _) => {
                        partial.push_field_access(
                            file,
                            FieldAccessKind::StaticPut,
                            *field_idx,
                            &method_name,
                            offset.0,
                        );
                    }
                    _ => {}
                }
            }
            let invocations = extract_invocations(file, code);
            for invocation in &invocations {
                partial.call_sites.push(CallSite {
                    caller: method_name.clone(),
                    invocation: invocation.clone(),
                });
            }
            partial.invocations.insert(
                (file.identifier.clone(), method_data.method_idx),
                invocations,
            );
        }
        partial
    }

    fn push_field_access(
        &mut self,
        file: &DexFile,
        kind: FieldAccessKind,
        field_idx: u16,
        method: &str,
        address: u32,
    ) {
        let field = match file.fields.get(field_idx as usize) {
            Some(field) => field,
            None => return,
        };
        let class_name = file
            .get_type_name(field.class_idx as usize)
            .unwrap_or("")
            .to_string();
        self.field_accesses.push(FieldAccess {
            kind,
            class_name,
            field_name: field.name.clone(),
            method: method.to_string(),
            address,
        });
    }

    pub fn resources(&self) -> &[ResourceReference] {
        &self.resources
    }

    pub fn strings(&self) -> &[StringReference] {
        &self.strings
    }

    pub fn field_accesses(&self) -> &[FieldAccess] {
        &self.field_accesses
    }

    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    pub fn resources_with_origin(&self, origin: ResourceOrigin) -> Vec<&ResourceReference> {
        self.resources
            .iter()
            .filter(|r| r.origin == origin)
            .collect()
    }

    pub fn references_to_resource(&self, resource_id: u32) -> Vec<&ResourceReference> {
        self.resources
            .iter()
            .filter(|r| r.resource_id == resource_id)
            .collect()
    }

    pub fn references_to_string(&self, value: &str) -> Vec<&StringReference> {
        self.strings.iter().filter(|s| s.value == value).collect()
    }

    pub fn accesses_to_field(&self, class_name: &str, field_name: &str) -> Vec<&FieldAccess> {
        self.field_accesses
            .iter()
            .filter(|f| f.class_name == class_name && f.field_name == field_name)
            .collect()
    }

    pub fn callers_of(&self, class_name: &str, method_name: &str) -> Vec<&CallSite> {
        self.call_sites
            .iter()
            .filter(|c| {
                c.invocation.class_name == class_name && c.invocation.method_name == method_name
            })
            .collect()
    }

    pub fn invocations_of_method(&self, dex_identifier: &str, method_idx: u32) -> &[Invokation] {
        self.invocations
            .get(&(dex_identifier.to_string(), method_idx))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedex_models::models::{
        u4, AccessFlags, ClassData, CodeItem, DexClass, FieldId, FieldOpType, InstructionOffset,
        MethodData, MethodId, ResourcePackage, StringEntry, NO_INDEX,
    };

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
            registers_size: 2,
            ins_size: 1,
            outs_size: 0,
            debug_info_off: 0,
            insns,
            tries: vec![],
            handlers: vec![],
        }
    }

    fn fixture(insns: Vec<Instruction>) -> Vec<Arc<DexFile>> {
        let strings: Vec<StringEntry> = ["I", "LWidget;", "f", "hello", "run", "()V"]
            .iter()
            .map(|s| StringEntry::from_str(s))
            .collect();
        let types = vec![1u32, 0u32]; // LWidget;, I
        let fields = vec![Arc::new(FieldId {
            class_idx: 0,
            type_idx: 1,
            name_idx: 2,
            name: "f".to_string(),
        })];
        let method = Arc::new(MethodId {
            class_idx: 0,
            method_idx: 0,
            proto_idx: 0,
            name_idx: 4,
            method_name: "run".to_string(),
            proto_name: "()V".to_string(),
        });
        let class = DexClass {
            dex_identifier: "fixture".to_string(),
            class_idx: 0,
            class_name: "LWidget;".to_string(),
            access_flags: AccessFlags::PUBLIC,
            super_class: NO_INDEX,
            interfaces: vec![],
            annotations_off: 0,
            source_file_idx: NO_INDEX,
            class_data: Some(ClassData {
                static_fields: vec![],
                instance_fields: vec![],
                direct_methods: vec![],
                virtual_methods: vec![],
            }),
            codes: vec![MethodData {
                name: "run".to_string(),
                method: method.clone(),
                method_idx: 0,
                access_flags: AccessFlags::PUBLIC,
                code: Some(code_of(insns)),
            }],
            static_values: vec![],
            method_throws: Default::default(),
        };
        vec![Arc::new(DexFile {
            identifier: "fixture".to_string(),
            file_name: "fixture/classes.dex".to_string(),
            header: Default::default(),
            strings,
            types,
            protos: vec![],
            fields,
            methods: vec![method],
            classes: vec![Arc::new(class)],
        })]
    }

    fn app_table() -> ResourceTable {
        let mut type_entries = std::collections::HashMap::new();
        type_entries.insert(0x01u8, 4u32);
        ResourceTable {
            packages: vec![ResourcePackage {
                id: 0x7f,
                name: "app".to_string(),
                type_entries,
            }],
        }
    }

    #[test]
    fn iget_records_one_read_access() {
        let files = fixture(vec![
            Instruction::InstanceGet(u4::new(0), u4::new(1), 0, FieldOpType::Default),
            Instruction::ReturnVoid,
        ]);
        let cache = ReferenceCache::analyze(&files, None);

        let accesses = cache.accesses_to_field("LWidget;", "f");
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].kind, FieldAccessKind::InstanceGet);
        assert!(!accesses[0].kind.is_write());
        assert_eq!(accesses[0].method, "LWidget;->run()V");
    }

    #[test]
    fn resource_ids_partition_by_table_and_package() {
        let files = fixture(vec![
            Instruction::ConstLit32(0, 0x7f01_0002),
            Instruction::ConstHigh16(0, 0x0101),
            Instruction::ConstLit32(0, 0x7f99_0001),
            Instruction::ReturnVoid,
        ]);
        let table = app_table();
        let cache = ReferenceCache::analyze(&files, Some(&table));

        let internal = cache.resources_with_origin(ResourceOrigin::Internal);
        assert_eq!(internal.len(), 1);
        assert_eq!(internal[0].resource_id, 0x7f01_0002);
        let android = cache.resources_with_origin(ResourceOrigin::Android);
        assert_eq!(android.len(), 1);
        assert_eq!(android[0].resource_id, 0x0101_0000);
        let external = cache.resources_with_origin(ResourceOrigin::External);
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].resource_id, 0x7f99_0001);
    }

    #[test]
    fn plain_integers_are_not_resource_references() {
        let files = fixture(vec![
            Instruction::ConstLit32(0, 42),
            Instruction::ConstLit32(0, 0x7f00_0001), // zero type byte
            Instruction::ReturnVoid,
        ]);
        let cache = ReferenceCache::analyze(&files, Some(&app_table()));
        assert!(cache.resources().is_empty());
    }

    #[test]
    fn string_constants_are_indexed_by_value() {
        let files = fixture(vec![
            Instruction::ConstString(0, 3),
            Instruction::ReturnVoid,
        ]);
        let cache = ReferenceCache::analyze(&files, None);
        let hits = cache.references_to_string("hello");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].address, 0);
        assert!(cache.references_to_string("absent").is_empty());
    }
}
