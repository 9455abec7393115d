// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The mediator between registered modifications and the containers they
//! land in. Injections are registered per context and method, performed in
//! one pass per context, and written out as a postfixed copy of the original
//! archive. A perform run polls the session's cancellation flag between
//! classes and bails before any artifact is written.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use tracedex_models::models::{
    AccessFlags, AttributeBody, ClassData, CodeAttribute, CodeItem, DexClass, DexFile,
    EncodedMethod, FormatError, Instruction, InstructionOffset, JvmAttribute, JvmClass, JvmMember,
    MethodData,
};
use tracedex_parse::{
    context::{descriptor_form, plain_form, ClassContext, ContextKind},
    session::AnalysisSession,
};

use crate::{
    artifact::{write_archive, ProgressReporter},
    class_patch::apply_injection,
    dex_patch::insert_instructions,
    dex_writer::{write_dex, DexImage, DexPools},
    injection::{
        dex_targets, emit_dex_payload, relocate_arguments, DexFrame, Injection, InjectionTarget,
    },
};

#[derive(Debug)]
pub enum InjectError {
    Io(std::io::Error),
    Format(FormatError),
    /// A context cannot be rewritten, or a registration points nowhere.
    Context(String),
    /// The session was cancelled before the artifact was written.
    Cancelled,
}

impl std::fmt::Display for InjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InjectError::Io(e) => write!(f, "io error: {}", e),
            InjectError::Format(e) => write!(f, "format error: {}", e),
            InjectError::Context(what) => write!(f, "{}", what),
            InjectError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for InjectError {}

impl From<std::io::Error> for InjectError {
    fn from(e: std::io::Error) -> Self {
        InjectError::Io(e)
    }
}

impl From<FormatError> for InjectError {
    fn from(e: FormatError) -> Self {
        InjectError::Format(e)
    }
}

/// Identifies one method of one class, in the class name spelling of the
/// containing format (descriptor for dex, internal name for class files).
/// Both spellings are accepted on registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey {
    pub class_name: String,
    pub method_name: String,
    pub proto: String,
}

impl MethodKey {
    pub fn new(class_name: &str, method_name: &str, proto: &str) -> MethodKey {
        MethodKey {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            proto: proto.to_string(),
        }
    }
}

type Registrations = HashMap<String, HashMap<MethodKey, Vec<Injection>>>;

/// Tracks pending injections per context and performs them. Performing does
/// not clear the pending list, so a repeated perform re-applies the same
/// modifications against the pristine original.
#[derive(Default)]
pub struct ModificationMediator {
    registrations: Mutex<Registrations>,
    modified: Mutex<HashSet<String>>,
    modified_methods: Mutex<HashSet<(String, MethodKey)>>,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ModificationMediator {
    pub fn new() -> ModificationMediator {
        ModificationMediator::default()
    }

    pub fn register_modification(&self, context_spec: &str, key: MethodKey, injection: Injection) {
        let mut registrations = lock_or_recover(&self.registrations);
        registrations
            .entry(context_spec.to_string())
            .or_default()
            .entry(key)
            .or_default()
            .push(injection);
    }

    /// Drop one method's pending injections along with its modified marker.
    /// Everything else registered for the context stays.
    pub fn unregister_modification(&self, context_spec: &str, key: &MethodKey) {
        let mut registrations = lock_or_recover(&self.registrations);
        if let Some(jobs) = registrations.get_mut(context_spec) {
            jobs.remove(key);
            if jobs.is_empty() {
                registrations.remove(context_spec);
            }
        }
        lock_or_recover(&self.modified_methods)
            .remove(&(context_spec.to_string(), key.clone()));
    }

    /// Drop everything pending for a context along with its modified markers.
    pub fn unregister_modifications(&self, context_spec: &str) {
        lock_or_recover(&self.registrations).remove(context_spec);
        lock_or_recover(&self.modified).remove(context_spec);
        lock_or_recover(&self.modified_methods).retain(|(spec, _)| spec != context_spec);
    }

    /// Specs of the contexts a perform run has produced artifacts for.
    pub fn modified_contexts(&self) -> Vec<String> {
        let mut specs: Vec<String> = lock_or_recover(&self.modified).iter().cloned().collect();
        specs.sort_unstable();
        specs
    }

    /// Whether a perform run actually spliced this method.
    pub fn is_modified(&self, context_spec: &str, key: &MethodKey) -> bool {
        lock_or_recover(&self.modified_methods)
            .contains(&(context_spec.to_string(), key.clone()))
    }

    pub fn modifications_for(&self, context_spec: &str) -> HashMap<MethodKey, Vec<Injection>> {
        lock_or_recover(&self.registrations)
            .get(context_spec)
            .cloned()
            .unwrap_or_default()
    }

    /// Perform everything registered for one context and write the artifact
    /// next to the original, postfixed. `Ok(None)` when nothing is
    /// registered or nothing could be applied; the progress reporter is only
    /// driven when there is work.
    pub fn perform_registered_modifications(
        &self,
        context: &Arc<ClassContext>,
        session: &AnalysisSession,
        reporter: &dyn ProgressReporter,
        postfix: &str,
    ) -> Result<Option<PathBuf>, InjectError> {
        let jobs = {
            let registrations = lock_or_recover(&self.registrations);
            match registrations.get(context.spec()) {
                Some(jobs) if !jobs.is_empty() => jobs.clone(),
                _ => return Ok(None),
            }
        };
        // one unit of progress per distinct class
        let by_class = group_by_class(&jobs);
        reporter.report_start(by_class.len());
        let result = self.perform_grouped(context, session, reporter, postfix, &by_class);
        reporter.report_end();
        result
    }

    fn perform_grouped(
        &self,
        context: &Arc<ClassContext>,
        session: &AnalysisSession,
        reporter: &dyn ProgressReporter,
        postfix: &str,
        by_class: &BTreeMap<String, Vec<(MethodKey, Vec<Injection>)>>,
    ) -> Result<Option<PathBuf>, InjectError> {
        let mut finished = 0usize;
        let mut applied: Vec<MethodKey> = vec![];
        let replacements = match context.kind() {
            ContextKind::Apk { .. } => {
                let mut replacements = HashMap::new();
                let mut seen: HashSet<&str> = HashSet::new();
                for dex in context.dex_files() {
                    if let Some(bytes) = rewrite_dex(
                        dex,
                        by_class,
                        session,
                        reporter,
                        &mut finished,
                        &mut seen,
                        &mut applied,
                    )? {
                        replacements.insert(entry_name(&dex.file_name, context.spec()), bytes);
                    }
                }
                for class_name in by_class.keys() {
                    if !seen.contains(class_name.as_str()) {
                        log::warn!("{} not found in {}", class_name, context.spec());
                    }
                }
                replacements
            }
            ContextKind::Jar { class_files } => rewrite_jar_classes(
                class_files,
                by_class,
                session,
                reporter,
                &mut finished,
                &mut applied,
            )?,
            _ => {
                log::warn!("{} is not backed by a rewritable archive", context.spec());
                return Ok(None);
            }
        };
        if replacements.is_empty() {
            return Ok(None);
        }
        if !session.is_running() {
            return Err(InjectError::Cancelled);
        }
        let path = write_archive(Path::new(context.spec()), postfix, &replacements)?;
        lock_or_recover(&self.modified).insert(context.spec().to_string());
        let mut modified_methods = lock_or_recover(&self.modified_methods);
        for key in applied {
            modified_methods.insert((context.spec().to_string(), key));
        }
        Ok(Some(path))
    }

    /// Perform every registered context in turn. A failing context loses
    /// only its own artifact.
    pub fn perform_all(
        &self,
        contexts: &[Arc<ClassContext>],
        session: &AnalysisSession,
        reporter: &dyn ProgressReporter,
        postfix: &str,
    ) -> Vec<(String, Result<Option<PathBuf>, InjectError>)> {
        contexts
            .iter()
            .map(|context| {
                let result =
                    self.perform_registered_modifications(context, session, reporter, postfix);
                if let Err(e) = &result {
                    log::error!("modifying {} failed: {}", context.spec(), e);
                }
                (context.spec().to_string(), result)
            })
            .collect()
    }
}

fn group_by_class(
    jobs: &HashMap<MethodKey, Vec<Injection>>,
) -> BTreeMap<String, Vec<(MethodKey, Vec<Injection>)>> {
    let mut by_class: BTreeMap<String, Vec<(MethodKey, Vec<Injection>)>> = BTreeMap::new();
    for (key, injections) in jobs {
        by_class
            .entry(key.class_name.clone())
            .or_default()
            .push((key.clone(), injections.clone()));
    }
    for methods in by_class.values_mut() {
        methods.sort_by(|a, b| a.0.cmp(&b.0));
    }
    by_class
}

/// `app.apk/classes.dex` relative to the context spec `app.apk`.
fn entry_name(file_name: &str, spec: &str) -> String {
    file_name
        .strip_prefix(&format!("{}/", spec))
        .or_else(|| file_name.rsplit('/').next())
        .unwrap_or(file_name)
        .to_string()
}

/// Rewrite every registered class this dex contains. `None` when none of
/// them live here.
fn rewrite_dex<'a>(
    dex: &DexFile,
    by_class: &'a BTreeMap<String, Vec<(MethodKey, Vec<Injection>)>>,
    session: &AnalysisSession,
    reporter: &dyn ProgressReporter,
    finished: &mut usize,
    seen: &mut HashSet<&'a str>,
    applied: &mut Vec<MethodKey>,
) -> Result<Option<Vec<u8>>, InjectError> {
    let mut image: Option<DexImage> = None;
    for (class_name, methods) in by_class {
        if !session.is_running() {
            return Err(InjectError::Cancelled);
        }
        let descriptor = descriptor_form(class_name);
        let class_pos = match dex.classes.iter().position(|c| c.class_name == descriptor) {
            Some(pos) => pos,
            None => continue,
        };
        seen.insert(class_name.as_str());
        let image = image.get_or_insert_with(|| DexImage::from_file(dex));
        let mut class = (*image.classes[class_pos]).clone();
        for (key, injections) in methods {
            if apply_dex_injections(&mut image.pools, dex, &mut class, key, injections)? {
                applied.push(key.clone());
            }
        }
        image.classes[class_pos] = Arc::new(class);
        *finished += 1;
        reporter.report_work(*finished);
    }
    match image {
        Some(image) => Ok(Some(write_dex(&image)?)),
        None => Ok(None),
    }
}

/// Returns whether anything was spliced into the method.
fn apply_dex_injections(
    pools: &mut DexPools,
    dex: &DexFile,
    class: &mut DexClass,
    key: &MethodKey,
    injections: &[Injection],
) -> Result<bool, InjectError> {
    let method_pos = class
        .codes
        .iter()
        .position(|m| m.name == key.method_name && m.method.proto_name == key.proto);
    let method_pos = match method_pos {
        Some(pos) => pos,
        None => {
            let wants_finalize = injections
                .iter()
                .any(|i| i.target == InjectionTarget::Finalize);
            if wants_finalize && key.method_name == "finalize" && key.proto == "()V" {
                synthesize_dex_finalize(pools, class)?
            } else {
                log::warn!(
                    "{}->{}{} has no body to modify",
                    class.class_name,
                    key.method_name,
                    key.proto
                );
                return Ok(false);
            }
        }
    };
    let display_name = format!("{}->{}{}", class.class_name, key.method_name, key.proto);
    let is_static = class.codes[method_pos]
        .access_flags
        .contains(AccessFlags::STATIC);
    let (orig_registers, ins_size) = match &class.codes[method_pos].code {
        Some(code) => (code.registers_size, code.ins_size),
        None => {
            log::warn!("{} is abstract or native, skipping", display_name);
            return Ok(false);
        }
    };
    // every payload addresses scratch above the original frame top; the
    // frame itself grows once, after all splices
    let mut max_scratch = 0u16;
    let mut spliced = false;
    for injection in injections {
        let code = match &mut class.codes[method_pos].code {
            Some(code) => code,
            None => return Ok(spliced),
        };
        let mut targets = dex_targets(dex, code, &injection.target);
        targets.sort_unstable();
        targets.dedup();
        if targets.is_empty() {
            continue;
        }
        let frame = DexFrame {
            registers_size: orig_registers,
            ins_size,
            is_static,
            proto: &key.proto,
            display_name: &display_name,
        };
        let payload = emit_dex_payload(pools, &injection.payload, &frame)?;
        max_scratch = max_scratch.max(payload.scratch_registers);
        // highest index first so earlier splices keep later indices valid
        for &index in targets.iter().rev() {
            insert_instructions(code, index, payload.instructions.clone(), payload.outs)?;
        }
        spliced = true;
    }
    if max_scratch > 0 {
        if let Some(code) = &mut class.codes[method_pos].code {
            code.registers_size = orig_registers + max_scratch;
            // the grown frame shifts where the arguments arrive; copy them
            // back down before anything else runs
            let prologue = relocate_arguments(
                &key.proto,
                is_static,
                orig_registers,
                code.registers_size,
                ins_size,
            )?;
            if !prologue.is_empty() {
                insert_instructions(code, 0, prologue, 0)?;
            }
        }
    }
    Ok(spliced)
}

/// Add an empty protected `finalize()V` so entry instrumentation has a body
/// to land in. Returns its position in the method list.
fn synthesize_dex_finalize(
    pools: &mut DexPools,
    class: &mut DexClass,
) -> Result<usize, InjectError> {
    let method_idx = pools.ensure_method(&class.class_name, "finalize", "()V")?;
    let method = pools.methods[method_idx as usize].clone();
    let insn = Instruction::ReturnVoid;
    let code = CodeItem {
        registers_size: 1,
        ins_size: 1,
        outs_size: 0,
        debug_info_off: 0,
        insns: vec![(insn.size(), InstructionOffset(0), insn)],
        tries: vec![],
        handlers: vec![],
    };
    let encoded = EncodedMethod {
        method_idx: method_idx as u32,
        access_flags: AccessFlags::PROTECTED,
        code_off: 0,
    };
    let class_data = class.class_data.get_or_insert_with(|| ClassData {
        static_fields: vec![],
        instance_fields: vec![],
        direct_methods: vec![],
        virtual_methods: vec![],
    });
    let at = class_data
        .virtual_methods
        .iter()
        .position(|m| m.method_idx > encoded.method_idx)
        .unwrap_or(class_data.virtual_methods.len());
    class_data.virtual_methods.insert(at, encoded);
    class.codes.push(MethodData {
        name: "finalize".to_string(),
        method,
        method_idx: method_idx as u32,
        access_flags: AccessFlags::PROTECTED,
        code: Some(code),
    });
    Ok(class.codes.len() - 1)
}

fn rewrite_jar_classes(
    class_files: &HashMap<String, Arc<Vec<u8>>>,
    by_class: &BTreeMap<String, Vec<(MethodKey, Vec<Injection>)>>,
    session: &AnalysisSession,
    reporter: &dyn ProgressReporter,
    finished: &mut usize,
    applied: &mut Vec<MethodKey>,
) -> Result<HashMap<String, Vec<u8>>, InjectError> {
    let mut replacements = HashMap::new();
    for (class_name, methods) in by_class {
        if !session.is_running() {
            return Err(InjectError::Cancelled);
        }
        let plain = plain_form(class_name);
        let bytes = match class_files.get(plain) {
            Some(bytes) => bytes,
            None => {
                log::warn!("{} not found in the archive", plain);
                continue;
            }
        };
        let mut class = JvmClass::read(&mut std::io::Cursor::new(bytes.as_slice()))?;
        let mut touched = false;
        for (key, injections) in methods {
            let method_index = find_jvm_method(&class, &key.method_name, &key.proto);
            let method_index = match method_index {
                Some(index) => index,
                None => {
                    let wants_finalize = injections
                        .iter()
                        .any(|i| i.target == InjectionTarget::Finalize);
                    if wants_finalize && key.method_name == "finalize" && key.proto == "()V" {
                        synthesize_jvm_finalize(&mut class)
                    } else {
                        log::warn!("{}.{}{} has no body to modify", plain, key.method_name, key.proto);
                        continue;
                    }
                }
            };
            let mut key_touched = false;
            for injection in injections {
                key_touched |= apply_injection(&mut class, method_index, injection)?;
            }
            if key_touched {
                applied.push(key.clone());
            }
            touched |= key_touched;
        }
        if touched {
            let mut out = vec![];
            class.write(&mut out)?;
            replacements.insert(format!("{}.class", plain), out);
        }
        *finished += 1;
        reporter.report_work(*finished);
    }
    Ok(replacements)
}

fn find_jvm_method(class: &JvmClass, name: &str, descriptor: &str) -> Option<usize> {
    class.methods.iter().position(|m| {
        class.constant_pool.utf8(m.name_index).as_deref() == Some(name)
            && class.constant_pool.utf8(m.descriptor_index).as_deref() == Some(descriptor)
    })
}

fn synthesize_jvm_finalize(class: &mut JvmClass) -> usize {
    let name = class.constant_pool.ensure_utf8("finalize");
    let descriptor = class.constant_pool.ensure_utf8("()V");
    let code_name = class.constant_pool.ensure_utf8("Code");
    class.methods.push(JvmMember {
        access_flags: 0x4, // protected
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
    });
    class.methods.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::SilentReporter;
    use crate::injection::InjectionPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracedex_parse::dex::{parse_dex_buf, ArrayView};

    struct CountingReporter {
        starts: AtomicUsize,
        works: AtomicUsize,
        ends: AtomicUsize,
    }

    impl CountingReporter {
        fn new() -> CountingReporter {
            CountingReporter {
                starts: AtomicUsize::new(0),
                works: AtomicUsize::new(0),
                ends: AtomicUsize::new(0),
            }
        }
    }

    impl ProgressReporter for CountingReporter {
        fn report_start(&self, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn report_work(&self, _finished: usize) {
            self.works.fetch_add(1, Ordering::SeqCst);
        }
        fn report_end(&self) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fixture_dex() -> DexFile {
        fixture_dex_with("()V", 1, 1)
    }

    fn fixture_dex_with(proto: &str, registers_size: u16, ins_size: u16) -> DexFile {
        let mut pools = DexPools {
            strings: vec![],
            types: vec![],
            protos: vec![],
            fields: vec![],
            methods: vec![],
        };
        let object = pools.ensure_type("Ljava/lang/Object;").unwrap();
        let foo = pools.ensure_type("LFoo;").unwrap();
        let bar = pools.ensure_method("LFoo;", "bar", proto).unwrap();
        let method = pools.methods[bar as usize].clone();
        let insn = Instruction::ReturnVoid;
        let code = CodeItem {
            registers_size,
            ins_size,
            outs_size: 0,
            debug_info_off: 0,
            insns: vec![(insn.size(), InstructionOffset(0), insn)],
            tries: vec![],
            handlers: vec![],
        };
        let class = DexClass {
            dex_identifier: "fixture".to_string(),
            class_idx: foo as u32,
            class_name: "LFoo;".to_string(),
            access_flags: AccessFlags::PUBLIC,
            super_class: object as u32,
            interfaces: vec![],
            annotations_off: 0,
            source_file_idx: tracedex_models::models::NO_INDEX,
            class_data: Some(ClassData {
                static_fields: vec![],
                instance_fields: vec![],
                direct_methods: vec![],
                virtual_methods: vec![EncodedMethod {
                    method_idx: bar as u32,
                    access_flags: AccessFlags::PUBLIC,
                    code_off: 0,
                }],
            }),
            codes: vec![MethodData {
                name: "bar".to_string(),
                method,
                method_idx: bar as u32,
                access_flags: AccessFlags::PUBLIC,
                code: Some(code),
            }],
            static_values: vec![],
            method_throws: Default::default(),
        };
        DexFile {
            identifier: "fixture".to_string(),
            file_name: "app.apk/classes.dex".to_string(),
            header: Default::default(),
            strings: pools.strings.clone(),
            types: pools.types.clone(),
            protos: pools.protos.clone(),
            fields: pools.fields.clone(),
            methods: pools.methods.clone(),
            classes: vec![Arc::new(class)],
        }
    }

    fn single_job(key: MethodKey, injection: Injection) -> BTreeMap<String, Vec<(MethodKey, Vec<Injection>)>> {
        let mut jobs = HashMap::new();
        jobs.insert(key, vec![injection]);
        group_by_class(&jobs)
    }

    #[test]
    fn register_then_unregister_leaves_nothing_pending() {
        let mediator = ModificationMediator::new();
        mediator.register_modification(
            "app.apk",
            MethodKey::new("LFoo;", "bar", "()V"),
            Injection {
                target: InjectionTarget::MethodEntry,
                payload: InjectionPayload::GcCall,
            },
        );
        assert_eq!(mediator.modifications_for("app.apk").len(), 1);
        mediator.unregister_modifications("app.apk");
        assert!(mediator.modifications_for("app.apk").is_empty());
        assert!(mediator.modified_contexts().is_empty());
    }

    #[test]
    fn unregistering_one_method_keeps_the_rest() {
        let mediator = ModificationMediator::new();
        let bar = MethodKey::new("LFoo;", "bar", "()V");
        let baz = MethodKey::new("LFoo;", "baz", "(I)V");
        for key in vec![bar.clone(), baz.clone()] {
            mediator.register_modification(
                "app.apk",
                key,
                Injection {
                    target: InjectionTarget::MethodEntry,
                    payload: InjectionPayload::GcCall,
                },
            );
        }
        assert_eq!(mediator.modifications_for("app.apk").len(), 2);

        mediator.unregister_modification("app.apk", &bar);
        let remaining = mediator.modifications_for("app.apk");
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key(&baz));
        assert!(!mediator.is_modified("app.apk", &baz));

        mediator.unregister_modification("app.apk", &baz);
        assert!(mediator.modifications_for("app.apk").is_empty());
    }

    #[test]
    fn perform_without_registrations_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let context = ClassContext::open(dir.path().to_str().unwrap()).unwrap();
        let mediator = ModificationMediator::new();
        let session = AnalysisSession::new();
        let reporter = CountingReporter::new();
        let result = mediator
            .perform_registered_modifications(&context, &session, &reporter, "_out")
            .unwrap();
        assert!(result.is_none());
        assert_eq!(reporter.starts.load(Ordering::SeqCst), 0);
        assert_eq!(reporter.works.load(Ordering::SeqCst), 0);
        assert_eq!(reporter.ends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn entry_print_lands_in_the_rewritten_dex() {
        let dex = fixture_dex();
        let by_class = single_job(
            MethodKey::new("LFoo;", "bar", "()V"),
            Injection {
                target: InjectionTarget::MethodEntry,
                payload: InjectionPayload::PrintText("trace hit".to_string()),
            },
        );
        let session = AnalysisSession::new();
        let mut finished = 0;
        let mut seen = HashSet::new();
        let bytes = rewrite_dex(&dex, &by_class, &session, &SilentReporter, &mut finished, &mut seen, &mut vec![])
            .unwrap()
            .unwrap();
        assert_eq!(finished, 1);

        let view = ArrayView::new(&bytes);
        let parsed = parse_dex_buf("rewritten", &view).unwrap();
        assert!(parsed
            .strings
            .iter()
            .any(|s| s.to_str_lossy() == "trace hit"));
        let class = parsed.get_class_by_name("LFoo;").unwrap();
        let code = class.codes[0].code.as_ref().unwrap();
        // payload plus alignment nop in front of the original return-void
        assert_eq!(code.registers_size, 3);
        // the receiver arrives at the top of the grown frame and is copied
        // back to its old slot before anything else runs
        assert_eq!(code.insns[0].2, Instruction::Other(vec![0x09, 0, 2]));
        assert!(code.insns.len() > 1);
        assert!(matches!(
            code.insns.last().map(|(_, _, i)| i),
            Some(Instruction::ReturnVoid)
        ));
    }

    #[test]
    fn parameters_are_relocated_when_the_frame_grows() {
        // virtual bar(I)V: receiver in r0, int parameter in r1
        let dex = fixture_dex_with("(I)V", 2, 2);
        let by_class = single_job(
            MethodKey::new("LFoo;", "bar", "(I)V"),
            Injection {
                target: InjectionTarget::MethodEntry,
                payload: InjectionPayload::PrintText("enter".to_string()),
            },
        );
        let session = AnalysisSession::new();
        let mut finished = 0;
        let mut seen = HashSet::new();
        let bytes = rewrite_dex(&dex, &by_class, &session, &SilentReporter, &mut finished, &mut seen, &mut vec![])
            .unwrap()
            .unwrap();

        let view = ArrayView::new(&bytes);
        let parsed = parse_dex_buf("rewritten", &view).unwrap();
        let class = parsed.get_class_by_name("LFoo;").unwrap();
        let code = class.codes[0].code.as_ref().unwrap();
        // two scratch registers on top of the old frame of two
        assert_eq!(code.registers_size, 4);
        assert_eq!(code.ins_size, 2);
        // the arguments now arrive in r2/r3 and are moved back to r0/r1
        assert_eq!(code.insns[0].2, Instruction::Other(vec![0x09, 0, 2]));
        assert_eq!(code.insns[1].2, Instruction::Other(vec![0x03, 1, 3]));
        // the payload addresses scratch above the old frame top
        assert!(matches!(
            code.insns.iter().find_map(|(_, _, i)| match i {
                Instruction::StaticGet(reg, _, _) => Some(*reg),
                _ => None,
            }),
            Some(2)
        ));
        assert!(matches!(
            code.insns.last().map(|(_, _, i)| i),
            Some(Instruction::ReturnVoid)
        ));
    }

    #[test]
    fn finalize_is_synthesized_when_missing() {
        let dex = fixture_dex();
        let by_class = single_job(
            MethodKey::new("LFoo;", "finalize", "()V"),
            Injection {
                target: InjectionTarget::Finalize,
                payload: InjectionPayload::StackTraceDump,
            },
        );
        let session = AnalysisSession::new();
        let mut finished = 0;
        let mut seen = HashSet::new();
        let bytes = rewrite_dex(&dex, &by_class, &session, &SilentReporter, &mut finished, &mut seen, &mut vec![])
            .unwrap()
            .unwrap();

        let view = ArrayView::new(&bytes);
        let parsed = parse_dex_buf("rewritten", &view).unwrap();
        let class = parsed.get_class_by_name("LFoo;").unwrap();
        let finalize = class
            .codes
            .iter()
            .find(|m| m.name == "finalize")
            .expect("finalize was not synthesized");
        assert!(finalize.access_flags.contains(AccessFlags::PROTECTED));
        let code = finalize.code.as_ref().unwrap();
        assert!(matches!(
            code.insns.last().map(|(_, _, i)| i),
            Some(Instruction::ReturnVoid)
        ));
        assert!(code.insns.len() > 1);
    }

    #[test]
    fn cancellation_aborts_before_any_output() {
        let dex = fixture_dex();
        let by_class = single_job(
            MethodKey::new("LFoo;", "bar", "()V"),
            Injection {
                target: InjectionTarget::MethodEntry,
                payload: InjectionPayload::GcCall,
            },
        );
        let session = AnalysisSession::new();
        session.cancel();
        let mut finished = 0;
        let mut seen = HashSet::new();
        let result = rewrite_dex(&dex, &by_class, &session, &SilentReporter, &mut finished, &mut seen, &mut vec![]);
        assert!(matches!(result, Err(InjectError::Cancelled)));
        assert_eq!(finished, 0);
    }
}
