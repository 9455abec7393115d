// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The context graph. A context wraps one class source (directory, jar, apk)
//! or collaborates over its children; resolution walks cache, then parents,
//! then the context's own classes. Resolved models are cached per context.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock, Weak},
};

use tracedex_models::models::{
    AndroidManifest, ClassModel, DexFile, FormatError, ResourceTable,
};

use crate::{classfile, dex, extraction, references::ReferenceCache};

#[derive(Debug)]
pub enum ContextError {
    /// The name resolves nowhere in this context graph. Recoverable; callers
    /// substitute the unknown placeholder.
    ClassNotFound(String),
    /// The underlying source failed to read. Fatal for the resolution.
    Io(std::io::Error),
    Format(FormatError),
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextError::ClassNotFound(name) => write!(f, "class not found: {}", name),
            ContextError::Io(e) => write!(f, "i/o error: {}", e),
            ContextError::Format(e) => write!(f, "format error: {}", e),
        }
    }
}

impl std::error::Error for ContextError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ContextError::Io(e) => Some(e),
            ContextError::Format(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ContextError {
    fn from(e: std::io::Error) -> Self {
        ContextError::Io(e)
    }
}

impl From<FormatError> for ContextError {
    fn from(e: FormatError) -> Self {
        ContextError::Format(e)
    }
}

/// What a context is backed by.
pub enum ContextKind {
    /// Loose class files under a directory root.
    Directory { root: PathBuf },
    /// Class files from a jar archive, parsed lazily per class.
    Jar {
        class_files: HashMap<String, Arc<Vec<u8>>>,
    },
    /// One or more dex files with manifest, resources and the frozen
    /// reference cache.
    Apk {
        dex_files: Vec<Arc<DexFile>>,
        manifest: Option<AndroidManifest>,
        manifest_content: String,
        resources: Option<ResourceTable>,
        references: ReferenceCache,
    },
    /// No classes of its own; resolution fans out over the children.
    Collaborate,
    /// A spec that matched no known container.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextResourceKind {
    Class,
    File,
}

/// One entry a context can provide, as listed by `resources()`.
#[derive(Debug, Clone)]
pub struct ContextResource {
    pub name: String,
    pub kind: ContextResourceKind,
}

pub struct ClassContext {
    spec: String,
    kind: ContextKind,
    parent: Mutex<Weak<ClassContext>>,
    children: Mutex<Vec<Arc<ClassContext>>>,
    class_cache: RwLock<HashMap<String, Arc<ClassModel>>>,
    resource_cache: Mutex<Option<Arc<Vec<ContextResource>>>>,
}

/// `Lcom/foo/Bar;` for a plain name, unchanged when already a descriptor.
pub fn descriptor_form(name: &str) -> String {
    if name.starts_with('L') && name.ends_with(';') {
        name.to_string()
    } else {
        format!("L{};", name)
    }
}

/// `com/foo/Bar` for a descriptor, unchanged when already plain.
pub fn plain_form(name: &str) -> &str {
    name.strip_prefix('L')
        .and_then(|n| n.strip_suffix(';'))
        .unwrap_or(name)
}

impl ClassContext {
    /// Open a context from a path: a directory of class files, a zip (apk or
    /// jar), or a bare dex. Anything unrecognized becomes `Unknown`.
    pub fn open(spec: &str) -> Result<Arc<ClassContext>, ContextError> {
        let path = Path::new(spec);
        let kind = if path.is_dir() {
            ContextKind::Directory {
                root: path.to_path_buf(),
            }
        } else {
            let contents = extraction::load_file(spec, 0)?;
            Self::kind_from_contents(spec, contents)
        };
        Ok(Arc::new(Self::with_kind(spec, kind)))
    }

    fn kind_from_contents(spec: &str, contents: extraction::ArchiveContents) -> ContextKind {
        if !contents.dex_files.is_empty() {
            let references =
                ReferenceCache::analyze(&contents.dex_files, contents.resources.as_ref());
            ContextKind::Apk {
                dex_files: contents.dex_files,
                manifest: contents.manifest,
                manifest_content: contents.manifest_content,
                resources: contents.resources,
                references,
            }
        } else if !contents.class_files.is_empty() {
            ContextKind::Jar {
                class_files: contents.class_files,
            }
        } else {
            log::warn!("{} contains neither dex nor class files", spec);
            ContextKind::Unknown
        }
    }

    pub fn collaborate(spec: &str) -> Arc<ClassContext> {
        Arc::new(Self::with_kind(spec, ContextKind::Collaborate))
    }

    pub fn with_kind(spec: &str, kind: ContextKind) -> ClassContext {
        ClassContext {
            spec: spec.to_string(),
            kind,
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(vec![]),
            class_cache: RwLock::new(HashMap::new()),
            resource_cache: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn kind(&self) -> &ContextKind {
        &self.kind
    }

    pub fn parent(&self) -> Option<Arc<ClassContext>> {
        self.parent.lock().ok()?.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<ClassContext>> {
        self.children
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Attach a child context. The child resolves through this context as
    /// its parent from now on; the resource listing is invalidated, cached
    /// class models stay valid.
    pub fn add_context(self: &Arc<Self>, child: Arc<ClassContext>) {
        if let Ok(mut parent) = child.parent.lock() {
            *parent = Arc::downgrade(self);
        }
        if let Ok(mut children) = self.children.lock() {
            children.push(child);
        }
        self.invalidate_resources();
    }

    pub fn remove_context(&self, spec: &str) {
        if let Ok(mut children) = self.children.lock() {
            children.retain(|c| c.spec != spec);
        }
        self.invalidate_resources();
    }

    fn invalidate_resources(&self) {
        if let Ok(mut cache) = self.resource_cache.lock() {
            *cache = None;
        }
    }

    pub fn reference_cache(&self) -> Option<&ReferenceCache> {
        match &self.kind {
            ContextKind::Apk { references, .. } => Some(references),
            _ => None,
        }
    }

    pub fn manifest(&self) -> Option<&AndroidManifest> {
        match &self.kind {
            ContextKind::Apk { manifest, .. } => manifest.as_ref(),
            _ => None,
        }
    }

    pub fn resource_table(&self) -> Option<&ResourceTable> {
        match &self.kind {
            ContextKind::Apk { resources, .. } => resources.as_ref(),
            _ => None,
        }
    }

    pub fn dex_files(&self) -> &[Arc<DexFile>] {
        match &self.kind {
            ContextKind::Apk { dex_files, .. } => dex_files,
            _ => &[],
        }
    }

    /// Resolve a class name: cache, then the parent chain, then this
    /// context's own classes. `ClassNotFound` from a parent falls through to
    /// the local scan; fatal errors propagate immediately.
    pub fn resolve(self: &Arc<Self>, name: &str) -> Result<Arc<ClassModel>, ContextError> {
        let key = plain_form(name).to_string();
        if let Ok(cache) = self.class_cache.read() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }
        if let Some(parent) = self.parent() {
            match parent.resolve(name) {
                Ok(model) => {
                    self.cache_model(&key, model.clone());
                    return Ok(model);
                }
                Err(ContextError::ClassNotFound(_)) => {}
                Err(fatal) => return Err(fatal),
            }
        }
        let model = self.resolve_down(&key)?;
        self.cache_model(&key, model.clone());
        Ok(model)
    }

    /// Like `resolve`, but a missing class yields the unknown placeholder
    /// instead of an error. Placeholders are not cached.
    pub fn resolve_or_unknown(self: &Arc<Self>, name: &str) -> Result<Arc<ClassModel>, ContextError> {
        match self.resolve(name) {
            Ok(model) => Ok(model),
            Err(ContextError::ClassNotFound(_)) => {
                Ok(Arc::new(ClassModel::unknown(&descriptor_form(name))))
            }
            Err(fatal) => Err(fatal),
        }
    }

    fn cache_model(&self, key: &str, model: Arc<ClassModel>) {
        if let Ok(mut cache) = self.class_cache.write() {
            cache.insert(key.to_string(), model);
        }
    }

    /// Scan this context and, for a collaborating context, its subtree.
    fn resolve_down(self: &Arc<Self>, key: &str) -> Result<Arc<ClassModel>, ContextError> {
        match self.resolve_local(key) {
            Err(ContextError::ClassNotFound(_)) => {}
            other => return other,
        }
        for child in self.children() {
            match child.resolve_down(key) {
                Err(ContextError::ClassNotFound(_)) => continue,
                other => return other,
            }
        }
        Err(ContextError::ClassNotFound(key.to_string()))
    }

    fn resolve_local(&self, key: &str) -> Result<Arc<ClassModel>, ContextError> {
        match &self.kind {
            ContextKind::Directory { root } => {
                let path = root.join(format!("{}.class", key));
                let bytes = match std::fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(ContextError::ClassNotFound(key.to_string()))
                    }
                    Err(e) => return Err(ContextError::Io(e)),
                };
                let class = classfile::parse_class(&mut std::io::Cursor::new(bytes))?;
                Ok(Arc::new(classfile::build_class_model(&class, &self.spec)))
            }
            ContextKind::Jar { class_files } => {
                let bytes = class_files
                    .get(key)
                    .ok_or_else(|| ContextError::ClassNotFound(key.to_string()))?;
                let class = classfile::parse_class(&mut std::io::Cursor::new(bytes.as_slice()))?;
                Ok(Arc::new(classfile::build_class_model(&class, &self.spec)))
            }
            ContextKind::Apk { dex_files, .. } => {
                let descriptor = descriptor_form(key);
                for file in dex_files {
                    if let Some(class) = file.get_class_by_name(&descriptor) {
                        return Ok(Arc::new(dex::build_class_model(file, &class, &self.spec)));
                    }
                }
                Err(ContextError::ClassNotFound(key.to_string()))
            }
            ContextKind::Collaborate | ContextKind::Unknown => {
                Err(ContextError::ClassNotFound(key.to_string()))
            }
        }
    }

    /// Everything this context can provide, computed once and invalidated
    /// when the child set changes.
    pub fn resources(self: &Arc<Self>) -> Arc<Vec<ContextResource>> {
        if let Ok(cache) = self.resource_cache.lock() {
            if let Some(resources) = cache.as_ref() {
                return resources.clone();
            }
        }
        let mut resources = vec![];
        self.collect_resources(&mut resources);
        let resources = Arc::new(resources);
        if let Ok(mut cache) = self.resource_cache.lock() {
            *cache = Some(resources.clone());
        }
        resources
    }

    fn collect_resources(self: &Arc<Self>, out: &mut Vec<ContextResource>) {
        match &self.kind {
            ContextKind::Directory { root } => {
                collect_directory_classes(root, root, out);
            }
            ContextKind::Jar { class_files } => {
                out.extend(class_files.keys().map(|name| ContextResource {
                    name: name.clone(),
                    kind: ContextResourceKind::Class,
                }));
            }
            ContextKind::Apk { dex_files, .. } => {
                for file in dex_files {
                    out.extend(file.classes.iter().map(|class| ContextResource {
                        name: plain_form(&class.class_name).to_string(),
                        kind: ContextResourceKind::Class,
                    }));
                }
            }
            ContextKind::Collaborate | ContextKind::Unknown => {}
        }
        for child in self.children() {
            child.collect_resources(out);
        }
    }
}

fn collect_directory_classes(root: &Path, dir: &Path, out: &mut Vec<ContextResource>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("cannot list {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_directory_classes(root, &path, out);
        } else if path.extension().map(|e| e == "class").unwrap_or(false) {
            if let Ok(relative) = path.strip_prefix(root) {
                let name = relative
                    .with_extension("")
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push(ContextResource {
                    name,
                    kind: ContextResourceKind::Class,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedex_models::models::{
        AttributeBody, CodeAttribute, ConstantPool, JvmAttribute, JvmClass, JvmMember,
    };

    fn write_class(dir: &Path, name: &str) {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class(name);
        let super_class = pool.ensure_class("java/lang/Object");
        let method_name = pool.ensure_utf8("run");
        let descriptor = pool.ensure_utf8("()V");
        let code_name = pool.ensure_utf8("Code");
        let class = JvmClass {
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
                name_index: method_name,
                descriptor_index: descriptor,
                attributes: vec![JvmAttribute {
                    name_index: code_name,
                    body: AttributeBody::Code(CodeAttribute {
                        max_stack: 1,
                        max_locals: 1,
                        code: vec![0xb1],
                        exception_table: vec![],
                        attributes: vec![],
                    }),
                }],
            }],
            attributes: vec![],
        };
        let path = dir.join(format!("{}.class", name));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut bytes = vec![];
        class.write(&mut bytes).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn directory_context_resolves_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "com/example/Probe");
        let context = ClassContext::open(dir.path().to_str().unwrap()).unwrap();

        let first = context.resolve("com/example/Probe").unwrap();
        assert_eq!(first.name, "com/example/Probe");
        let second = context.resolve("com/example/Probe").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_class_is_not_found_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let context = ClassContext::open(dir.path().to_str().unwrap()).unwrap();
        match context.resolve("com/example/Nope") {
            Err(ContextError::ClassNotFound(name)) => assert_eq!(name, "com/example/Nope"),
            other => panic!("expected ClassNotFound, got {:?}", other.map(|m| m.name.clone())),
        }
        let placeholder = context.resolve_or_unknown("com/example/Nope").unwrap();
        assert!(placeholder.is_unknown());
    }

    #[test]
    fn collaborate_resolves_through_children() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        write_class(dir_a.path(), "a/First");
        write_class(dir_b.path(), "b/Second");

        let hub = ClassContext::collaborate("hub");
        hub.add_context(ClassContext::open(dir_a.path().to_str().unwrap()).unwrap());
        hub.add_context(ClassContext::open(dir_b.path().to_str().unwrap()).unwrap());

        assert!(hub.resolve("a/First").is_ok());
        assert!(hub.resolve("b/Second").is_ok());
        assert!(matches!(
            hub.resolve("c/Third"),
            Err(ContextError::ClassNotFound(_))
        ));
    }

    #[test]
    fn child_falls_back_to_parent() {
        let dir_parent = tempfile::tempdir().unwrap();
        let dir_child = tempfile::tempdir().unwrap();
        write_class(dir_parent.path(), "shared/Base");
        write_class(dir_child.path(), "app/Main");

        let parent = ClassContext::open(dir_parent.path().to_str().unwrap()).unwrap();
        let child = ClassContext::open(dir_child.path().to_str().unwrap()).unwrap();
        parent.add_context(child.clone());

        // the parent wins for names it knows, the child scans itself otherwise
        let base = child.resolve("shared/Base").unwrap();
        assert_eq!(base.context_spec, parent.spec());
        let main = child.resolve("app/Main").unwrap();
        assert_eq!(main.context_spec, child.spec());
    }

    #[test]
    fn resource_listing_invalidated_by_child_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_class(dir.path(), "x/Y");
        let hub = ClassContext::collaborate("hub");
        assert!(hub.resources().is_empty());

        hub.add_context(ClassContext::open(dir.path().to_str().unwrap()).unwrap());
        let listed = hub.resources();
        assert!(listed.iter().any(|r| r.name == "x/Y"));

        hub.remove_context(dir.path().to_str().unwrap());
        assert!(hub.resources().is_empty());
    }
}
