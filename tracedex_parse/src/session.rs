// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The analysis session. It owns the class-path state needed to turn the
//! quick instructions of an odex file back into canonical method references,
//! rebuilt whenever the active dex changes, and carries the cancellation flag
//! long-running passes poll between classes.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tracedex_models::models::{CodeItem, DexClass, DexFile, Instruction, InvokeKind};

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    /// The cancellation flag was cleared mid-pass. No partial results are
    /// handed out.
    Cancelled,
    /// `deodex` was called before `prepare_class_path`, or for a dex other
    /// than the prepared one.
    ClassPathNotPrepared,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Cancelled => write!(f, "analysis cancelled"),
            SessionError::ClassPathNotPrepared => write!(f, "class path not prepared"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One vtable slot. `method_idx` is an index into the active dex's method
/// pool, absent when the defining class lives in another dex of the
/// classpath.
#[derive(Debug, Clone)]
struct VtableSlot {
    method_name: String,
    proto: String,
    method_idx: Option<u32>,
}

/// Virtual-method tables for the active dex: for every class the slots in
/// vtable order (superclass slots first, overrides in place, new methods
/// appended), laid out over the whole classpath.
struct ClassPathState {
    dex_identifier: String,
    vtables: HashMap<String, Vec<VtableSlot>>,
}

/// Primitive descriptors get placeholder entries so hierarchy walks
/// terminate on them instead of reporting an unresolved class.
const PRIMITIVE_TYPES: [&str; 9] = ["B", "C", "D", "F", "I", "J", "S", "V", "Z"];

/// A rewritten method body produced by `deodex`.
pub struct DeodexedMethod {
    pub class_name: String,
    pub method_idx: u32,
    pub code: CodeItem,
}

#[derive(Default)]
pub struct AnalysisSession {
    class_path: Mutex<Option<ClassPathState>>,
    is_running: AtomicBool,
}

impl AnalysisSession {
    pub fn new() -> AnalysisSession {
        AnalysisSession {
            class_path: Mutex::new(None),
            is_running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Request a prompt abort of the current pass. The flag sticks until
    /// `resume` is called.
    pub fn cancel(&self) {
        self.is_running.store(false, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.is_running.store(true, Ordering::Relaxed);
    }

    /// Build the vtables for `active` over a classpath spanning every dex of
    /// the loaded contexts. A repeated call for the same dex is a cheap
    /// no-op; a different dex replaces the state wholesale.
    pub fn prepare_class_path(&self, active: &Arc<DexFile>, class_path: &[Arc<DexFile>]) {
        let mut guard = match self.class_path.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(state) = guard.as_ref() {
            if state.dex_identifier == active.identifier {
                return;
            }
        }
        log::info!("building class path for {}", active.file_name);
        *guard = Some(ClassPathState {
            dex_identifier: active.identifier.clone(),
            vtables: build_vtables(active, class_path),
        });
    }

    /// Rewrite the quick invokes of an odex dex back into canonical form.
    /// Only methods that actually change are returned. Classes whose quick
    /// indices do not resolve keep those instructions untouched.
    pub fn deodex(&self, file: &Arc<DexFile>) -> Result<Vec<DeodexedMethod>, SessionError> {
        let guard = match self.class_path.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = guard
            .as_ref()
            .filter(|s| s.dex_identifier == file.identifier)
            .ok_or(SessionError::ClassPathNotPrepared)?;

        let mut rewritten = vec![];
        for class in &file.classes {
            if !self.is_running() {
                return Err(SessionError::Cancelled);
            }
            for method_data in &class.codes {
                let code = match &method_data.code {
                    Some(code) => code,
                    None => continue,
                };
                if let Some(code) = deodex_code(state, file, class, code) {
                    rewritten.push(DeodexedMethod {
                        class_name: class.class_name.clone(),
                        method_idx: method_data.method_idx,
                        code,
                    });
                }
            }
        }
        Ok(rewritten)
    }
}

/// Vtable order per the runtime layout: the superclass's table, overridden
/// in place on a name + proto match, new virtual methods appended. Class
/// lookup spans the active dex and every classpath dex, so a hierarchy
/// crossing a dex boundary still gets its superclass slots.
fn build_vtables(
    active: &Arc<DexFile>,
    class_path: &[Arc<DexFile>],
) -> HashMap<String, Vec<VtableSlot>> {
    let mut by_name: HashMap<&str, (&Arc<DexFile>, &Arc<DexClass>)> = HashMap::new();
    // the active dex wins on a duplicate definition
    for dex in std::iter::once(active).chain(class_path.iter()) {
        for class in &dex.classes {
            by_name.entry(class.class_name.as_str()).or_insert((dex, class));
        }
    }
    let mut memo: HashMap<String, Vec<VtableSlot>> = HashMap::new();
    for primitive in &PRIMITIVE_TYPES {
        memo.insert((*primitive).to_string(), vec![]);
    }
    for class in &active.classes {
        let mut visiting = HashSet::new();
        vtable_for(active, &by_name, &class.class_name, &mut memo, &mut visiting);
    }
    memo
}

fn vtable_for(
    active: &Arc<DexFile>,
    by_name: &HashMap<&str, (&Arc<DexFile>, &Arc<DexClass>)>,
    name: &str,
    memo: &mut HashMap<String, Vec<VtableSlot>>,
    visiting: &mut HashSet<String>,
) -> Vec<VtableSlot> {
    if let Some(table) = memo.get(name) {
        return table.clone();
    }
    // classes outside every loaded dex contribute no slots
    let (owner, class) = match by_name.get(name) {
        Some(&(owner, class)) => (owner, class),
        None => return vec![],
    };
    if !visiting.insert(name.to_string()) {
        log::warn!("superclass cycle at {}", name);
        return vec![];
    }

    let mut table = match owner.get_type_name(class.super_class as usize) {
        Some(super_name) => {
            let super_name = super_name.to_string();
            vtable_for(active, by_name, &super_name, memo, visiting)
        }
        None => vec![],
    };

    let in_active = Arc::ptr_eq(owner, active);
    if let Some(class_data) = &class.class_data {
        for method in &class_data.virtual_methods {
            let id = match owner.methods.get(method.method_idx as usize) {
                Some(id) => id,
                None => continue,
            };
            let slot = VtableSlot {
                method_name: id.method_name.clone(),
                proto: id.proto_name.clone(),
                method_idx: if in_active { Some(method.method_idx) } else { None },
            };
            let position = table.iter().position(|existing| {
                existing.method_name == slot.method_name && existing.proto == slot.proto
            });
            match position {
                Some(position) => table[position] = slot,
                None => table.push(slot),
            }
        }
    }

    visiting.remove(name);
    memo.insert(name.to_string(), table.clone());
    table
}

/// One method body: quick invokes looked up through the vtable, everything
/// else copied through. `None` when nothing changed.
fn deodex_code(
    state: &ClassPathState,
    file: &Arc<DexFile>,
    class: &DexClass,
    code: &CodeItem,
) -> Option<CodeItem> {
    let mut changed = false;
    let mut insns = code.insns.clone();
    for (_, _, insn) in &mut insns {
        let replacement = match insn {
            Instruction::Invoke35c(kind, count, vtable_idx, regs) if kind.is_quick() => {
                quick_target(state, file, class, *kind, *vtable_idx)
                    .map(|(kind, midx)| Instruction::Invoke35c(kind, *count, midx, *regs))
            }
            Instruction::InvokeRange(kind, count, vtable_idx, first) if kind.is_quick() => {
                quick_target(state, file, class, *kind, *vtable_idx)
                    .map(|(kind, midx)| Instruction::InvokeRange(kind, *count, midx, *first))
            }
            _ => None,
        };
        if let Some(replacement) = replacement {
            *insn = replacement;
            changed = true;
        }
    }
    if changed {
        let mut code = code.clone();
        code.insns = insns;
        Some(code)
    } else {
        None
    }
}

/// Resolve a vtable slot to a method-pool index. Virtual-quick goes through
/// the enclosing class's own table, super-quick through the superclass's.
fn quick_target(
    state: &ClassPathState,
    file: &Arc<DexFile>,
    class: &DexClass,
    kind: InvokeKind,
    vtable_idx: u16,
) -> Option<(InvokeKind, u16)> {
    let (canonical, table_owner) = match kind {
        InvokeKind::VirtualQuick => (InvokeKind::Virtual, Some(class.class_name.clone())),
        InvokeKind::SuperQuick => (
            InvokeKind::Super,
            file.get_type_name(class.super_class as usize)
                .map(|n| n.to_string()),
        ),
        _ => return None,
    };
    let table = state.vtables.get(&table_owner?)?;
    let slot = table.get(vtable_idx as usize)?;
    // a slot defined in another classpath dex has no index in this pool
    let method_idx = slot.method_idx?;
    if method_idx > u16::MAX as u32 {
        log::warn!(
            "vtable slot {} of {} exceeds the 16-bit method index space",
            vtable_idx,
            class.class_name
        );
        return None;
    }
    Some((canonical, method_idx as u16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedex_models::models::{
        AccessFlags, ClassData, DexHeader, EncodedMethod, InstructionOffset, InstructionSize,
        MethodData, MethodId, StringEntry,
    };

    fn method_id(class_idx: u16, idx: u32, name: &str, proto: &str) -> Arc<MethodId> {
        Arc::new(MethodId {
            class_idx,
            method_idx: idx,
            proto_idx: 0,
            name_idx: 0,
            method_name: name.to_string(),
            proto_name: proto.to_string(),
        })
    }

    fn virtual_methods(indices: &[u32]) -> ClassData {
        ClassData {
            static_fields: vec![],
            instance_fields: vec![],
            direct_methods: vec![],
            virtual_methods: indices
                .iter()
                .map(|&method_idx| EncodedMethod {
                    method_idx,
                    access_flags: AccessFlags::PUBLIC,
                    code_off: 0,
                })
                .collect(),
        }
    }

    fn class(
        idx: u32,
        name: &str,
        super_class: u32,
        data: ClassData,
        codes: Vec<MethodData>,
    ) -> Arc<DexClass> {
        Arc::new(DexClass {
            dex_identifier: "fixture".to_string(),
            class_idx: idx,
            class_name: name.to_string(),
            access_flags: AccessFlags::PUBLIC,
            super_class,
            interfaces: vec![],
            annotations_off: 0,
            source_file_idx: 0,
            class_data: Some(data),
            codes,
            static_values: vec![],
            method_throws: HashMap::new(),
        })
    }

    /// Types: 0 = LBase; 1 = LDerived; 2 = Ljava/lang/Object;
    /// Methods: 0 = Base.foo, 1 = Derived.foo (override), 2 = Derived.bar.
    fn fixture(derived_codes: Vec<MethodData>) -> Arc<DexFile> {
        let strings = vec![
            StringEntry::from_str("LBase;"),
            StringEntry::from_str("LDerived;"),
            StringEntry::from_str("Ljava/lang/Object;"),
        ];
        Arc::new(DexFile {
            identifier: "fixture".to_string(),
            file_name: "fixture.dex".to_string(),
            header: DexHeader::default(),
            strings,
            types: vec![0, 1, 2],
            protos: vec![],
            fields: vec![],
            methods: vec![
                method_id(0, 0, "foo", "()V"),
                method_id(1, 1, "foo", "()V"),
                method_id(1, 2, "bar", "()V"),
            ],
            classes: vec![
                class(0, "LBase;", 2, virtual_methods(&[0]), vec![]),
                class(1, "LDerived;", 0, virtual_methods(&[1, 2]), derived_codes),
            ],
        })
    }

    fn slot_indices(vtables: &HashMap<String, Vec<VtableSlot>>, name: &str) -> Vec<Option<u32>> {
        vtables[name].iter().map(|s| s.method_idx).collect()
    }

    #[test]
    fn vtables_override_in_place_and_append() {
        let file = fixture(vec![]);
        let vtables = build_vtables(&file, &[]);
        assert_eq!(slot_indices(&vtables, "LBase;"), vec![Some(0)]);
        // Derived.foo takes Base.foo's slot, bar appends
        assert_eq!(slot_indices(&vtables, "LDerived;"), vec![Some(1), Some(2)]);
        // primitive placeholders resolve to empty tables
        assert!(vtables["I"].is_empty());
    }

    #[test]
    fn quick_invokes_become_canonical() {
        let quick = Instruction::Invoke35c(InvokeKind::VirtualQuick, 1, 0, [4, 0, 0, 0, 0]);
        let code = CodeItem {
            registers_size: 5,
            ins_size: 1,
            outs_size: 1,
            debug_info_off: 0,
            insns: vec![
                (InstructionSize(3), InstructionOffset(0), quick),
                (
                    InstructionSize(1),
                    InstructionOffset(3),
                    Instruction::ReturnVoid,
                ),
            ],
            tries: vec![],
            handlers: vec![],
        };
        let file = fixture(vec![MethodData {
            name: "run".to_string(),
            method: method_id(1, 2, "bar", "()V"),
            method_idx: 2,
            access_flags: AccessFlags::PUBLIC,
            code: Some(code),
        }]);

        let session = AnalysisSession::new();
        session.prepare_class_path(&file, &[]);
        let rewritten = session.deodex(&file).unwrap();
        assert_eq!(rewritten.len(), 1);
        // slot 0 of LDerived; is the override, method 1
        assert_eq!(
            rewritten[0].code.insns[0].2,
            Instruction::Invoke35c(InvokeKind::Virtual, 1, 1, [4, 0, 0, 0, 0])
        );
        assert_eq!(rewritten[0].code.insns[1].2, Instruction::ReturnVoid);
    }

    #[test]
    fn classpath_spans_every_loaded_dex() {
        // LBase; with foo lives in another dex of the classpath
        let base_dex = Arc::new(DexFile {
            identifier: "base".to_string(),
            file_name: "base.dex".to_string(),
            header: DexHeader::default(),
            strings: vec![
                StringEntry::from_str("LBase;"),
                StringEntry::from_str("Ljava/lang/Object;"),
            ],
            types: vec![0, 1],
            protos: vec![],
            fields: vec![],
            methods: vec![method_id(0, 0, "foo", "()V")],
            classes: vec![class(0, "LBase;", 1, virtual_methods(&[0]), vec![])],
        });

        // the active dex defines LDerived; extending LBase; and adding bar,
        // so bar sits in slot 1 behind the inherited foo
        let quick = Instruction::Invoke35c(InvokeKind::VirtualQuick, 1, 1, [4, 0, 0, 0, 0]);
        let inherited = Instruction::Invoke35c(InvokeKind::VirtualQuick, 1, 0, [4, 0, 0, 0, 0]);
        let code = CodeItem {
            registers_size: 5,
            ins_size: 1,
            outs_size: 1,
            debug_info_off: 0,
            insns: vec![
                (InstructionSize(3), InstructionOffset(0), quick),
                (InstructionSize(3), InstructionOffset(3), inherited.clone()),
                (
                    InstructionSize(1),
                    InstructionOffset(6),
                    Instruction::ReturnVoid,
                ),
            ],
            tries: vec![],
            handlers: vec![],
        };
        let active = Arc::new(DexFile {
            identifier: "active".to_string(),
            file_name: "active.dex".to_string(),
            header: DexHeader::default(),
            strings: vec![
                StringEntry::from_str("LBase;"),
                StringEntry::from_str("LDerived;"),
            ],
            types: vec![0, 1],
            protos: vec![],
            fields: vec![],
            methods: vec![method_id(1, 0, "bar", "()V")],
            classes: vec![class(
                1,
                "LDerived;",
                0,
                virtual_methods(&[0]),
                vec![MethodData {
                    name: "run".to_string(),
                    method: method_id(1, 0, "bar", "()V"),
                    method_idx: 0,
                    access_flags: AccessFlags::PUBLIC,
                    code: Some(code),
                }],
            )],
        });

        let session = AnalysisSession::new();
        session.prepare_class_path(&active, &[base_dex]);
        let rewritten = session.deodex(&active).unwrap();
        assert_eq!(rewritten.len(), 1);
        // slot 1 resolves to bar in the active pool
        assert_eq!(
            rewritten[0].code.insns[0].2,
            Instruction::Invoke35c(InvokeKind::Virtual, 1, 0, [4, 0, 0, 0, 0])
        );
        // slot 0 belongs to the other dex and stays quick
        assert_eq!(rewritten[0].code.insns[1].2, inherited);
    }

    #[test]
    fn preparing_twice_is_idempotent_and_cancel_aborts() {
        let file = fixture(vec![]);
        let session = AnalysisSession::new();
        session.prepare_class_path(&file, &[]);
        session.prepare_class_path(&file, &[]);

        session.cancel();
        assert!(matches!(session.deodex(&file), Err(SessionError::Cancelled)));
        session.resume();
        assert!(session.deodex(&file).unwrap().is_empty());
    }

    #[test]
    fn deodex_without_preparation_is_an_error() {
        let file = fixture(vec![]);
        let session = AnalysisSession::new();
        assert!(matches!(
            session.deodex(&file),
            Err(SessionError::ClassPathNotPrepared)
        ));
    }
}
