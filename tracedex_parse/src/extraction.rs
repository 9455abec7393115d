// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Zip extraction. Dex containers, class files, the binary manifest and the
//! resource table are pulled out of an archive; nested archives are walked up
//! to a depth limit. Everything else is kept as opaque bytes.

use abxml::{
    visitor::{Executor, ModelVisitor, XmlVisitor},
    STR_ARSC,
};

use std::{
    collections::HashMap,
    fs::File,
    io::{Cursor, Read},
    sync::Arc,
};
use zip::ZipArchive;

use crate::dex::{parse_dex_buf, ArrayView};
use tracedex_models::models::{AndroidManifest, DexFile, ResourceTable};

/// Everything found inside one archive (or a bare dex/class file).
#[derive(Default)]
pub struct ArchiveContents {
    pub dex_files: Vec<Arc<DexFile>>,
    /// Raw class files keyed by binary class name (path without `.class`).
    pub class_files: HashMap<String, Arc<Vec<u8>>>,
    pub manifest: Option<AndroidManifest>,
    pub manifest_content: String,
    pub resources: Option<ResourceTable>,
    /// Remaining entries, keyed by their path in the archive.
    pub binaries: HashMap<String, Arc<Vec<u8>>>,
}

impl ArchiveContents {
    fn merge(&mut self, inner: ArchiveContents) {
        self.dex_files.extend(inner.dex_files);
        self.class_files.extend(inner.class_files);
        if self.manifest.is_none() {
            self.manifest = inner.manifest;
            self.manifest_content = inner.manifest_content;
        }
        if self.resources.is_none() {
            self.resources = inner.resources;
        }
        self.binaries.extend(inner.binaries);
    }
}

pub fn extract_zip(
    archive_name: &str,
    f: &ArrayView<u8>,
    depth: u32,
    max_depth: u32,
) -> ArchiveContents {
    let mut contents = ArchiveContents::default();
    let mut bin_manifest = vec![];
    let mut bin_res_file = vec![];
    let mut dex_jobs = vec![];

    let mut archive = match ZipArchive::new(f.get_cursor()) {
        Ok(archive) => archive,
        Err(e) => {
            log::warn!("{} is not a readable archive: {}", archive_name, e);
            return contents;
        }
    };

    for i in 0..archive.len() {
        let mut file = match archive.by_index(i) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("skipping archive entry {}: {}", i, e);
                continue;
            }
        };
        let mut zip_bytes: Vec<u8> = vec![];
        if let Err(e) = std::io::copy(&mut file, &mut zip_bytes) {
            log::warn!("could not inflate {}: {}", file.name(), e);
            continue;
        }
        let ptr = zip_bytes.as_slice();
        let file_name = format!("{}/{}", archive_name, file.name());

        if file.name().ends_with("AndroidManifest.xml") {
            log::info!("Found AndroidManifest.xml in {}", archive_name);
            bin_manifest = zip_bytes.clone();
            contents
                .binaries
                .insert(file.name().to_string(), Arc::new(zip_bytes));
            continue;
        } else if file.name().ends_with("resources.arsc") {
            log::info!("Found resources.arsc in {}", archive_name);
            bin_res_file = zip_bytes;
            continue;
        }

        if file.name().ends_with(".class") && check_for_class_signature(ptr) {
            let class_name = file.name().trim_end_matches(".class").to_string();
            contents.class_files.insert(class_name, Arc::new(zip_bytes));
        } else if check_for_dex_signature(ptr) {
            let dex_bytes = zip_bytes.clone();
            dex_jobs.push(std::thread::spawn(move || {
                let array_view = ArrayView::new(zip_bytes.as_slice());
                parse_dex_buf(&file_name, &array_view)
            }));
            contents
                .binaries
                .insert(file.name().to_string(), Arc::new(dex_bytes));
        } else if (max_depth == 0 || depth <= max_depth) && check_for_zip_signature(ptr) {
            let array_view = ArrayView::new(zip_bytes.as_slice());
            let inner = extract_zip(&file_name, &array_view, depth + 1, max_depth);
            contents.merge(inner);
        } else {
            contents
                .binaries
                .insert(file.name().to_string(), Arc::new(zip_bytes));
        }
    }

    for dex_job in dex_jobs {
        match dex_job.join() {
            Ok(Ok(dex_file)) => contents.dex_files.push(Arc::new(dex_file)),
            Ok(Err(e)) => log::warn!("dropping unreadable dex: {}", e),
            Err(_) => log::error!("dex parse worker panicked"),
        }
    }

    if !bin_res_file.is_empty() {
        match ResourceTable::from_bytes(&bin_res_file) {
            Ok(table) => contents.resources = Some(table),
            Err(e) => log::warn!("unreadable resource table: {}", e),
        }
    }
    if !bin_manifest.is_empty() {
        let (manifest_content, manifest) = decode_manifest(&bin_manifest, &bin_res_file);
        contents.manifest_content = manifest_content;
        contents.manifest = Some(manifest);
    }

    contents
}

/// Decode the binary manifest XML through the framework string table, then
/// deserialize the reconstructed document.
fn decode_manifest(bin_manifest: &[u8], bin_res_file: &[u8]) -> (String, AndroidManifest) {
    let mut visitor = ModelVisitor::default();
    if let Err(e) = Executor::arsc(STR_ARSC, &mut visitor) {
        log::warn!("framework resources unavailable: {}", e);
    }
    if !bin_res_file.is_empty() {
        if let Err(e) = Executor::arsc(bin_res_file, &mut visitor) {
            log::warn!("application resources unavailable: {}", e);
        }
    }
    let mut visitor = XmlVisitor::new(visitor.get_resources());
    let _ = Executor::xml(Cursor::new(bin_manifest), &mut visitor);
    let content = visitor.into_string().unwrap_or_else(|_| String::new());
    let manifest = serde_xml_rs::from_str(&content)
        .or_else::<AndroidManifest, _>(|err| {
            log::warn!("{:?}", err);
            Ok(AndroidManifest::default())
        })
        .unwrap_or_default();
    (content, manifest)
}

pub fn load_file(path: &str, max_depth: i64) -> Result<ArchiveContents, std::io::Error> {
    let mut f = File::open(path)?;
    let mut bytes: Vec<u8> = vec![];
    f.read_to_end(&mut bytes)?;
    let ptr = bytes.as_slice();
    let contents = if check_for_zip_signature(ptr) {
        extract_zip(path, &ArrayView::new(&bytes), 1, max_depth as u32)
    } else if check_for_dex_signature(ptr) {
        log::debug!("found bare dex");
        let dex_file = parse_dex_buf(path, &ArrayView::new(&bytes)).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        ArchiveContents {
            dex_files: vec![Arc::new(dex_file)],
            ..Default::default()
        }
    } else if check_for_class_signature(ptr) {
        log::debug!("found bare class file");
        let mut contents = ArchiveContents::default();
        let class_name = path.trim_end_matches(".class").to_string();
        contents.class_files.insert(class_name, Arc::new(bytes));
        contents
    } else {
        log::debug!("unrecognized container {}", path);
        ArchiveContents::default()
    };
    Ok(contents)
}

#[inline(always)]
pub fn check_for_dex_signature<T: Read>(mut ptr: T) -> bool {
    let mut buf: [u8; 3] = [0, 0, 0];
    match ptr.read_exact(&mut buf) {
        Err(_) => false,
        _ => {
            let [a, b, c] = buf;
            // covers both "dex\n" and the optimized "dey\n"
            a == b'd' && b == b'e' && (c == b'x' || c == b'y')
        }
    }
}

#[inline(always)]
pub fn check_for_zip_signature<T: Read>(mut ptr: T) -> bool {
    let mut buf: [u8; 2] = [0, 0];
    match ptr.read_exact(&mut buf) {
        Err(_) => false,
        _ => {
            let [a, b] = buf;
            a == b'P' && b == b'K'
        }
    }
}

#[inline(always)]
pub fn check_for_class_signature<T: Read>(mut ptr: T) -> bool {
    let mut buf: [u8; 4] = [0; 4];
    match ptr.read_exact(&mut buf) {
        Err(_) => false,
        _ => buf == [0xca, 0xfe, 0xba, 0xbe],
    }
}
