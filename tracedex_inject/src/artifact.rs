// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Writing the output artifact: a copy of the original archive with the
//! rewritten entries substituted, named with a postfix before the extension.
//! Midlet jars get their `.jad` descriptor rewritten alongside when one
//! exists; a missing or unreadable descriptor is ignored.

use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use zip::{write::FileOptions, ZipArchive, ZipWriter};

/// Fractional progress of a perform run, driven per rewritten class.
pub trait ProgressReporter {
    fn report_start(&self, total: usize);
    fn report_work(&self, finished: usize);
    fn report_end(&self);
}

/// A reporter for callers that do not care.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn report_start(&self, _total: usize) {}
    fn report_work(&self, _finished: usize) {}
    fn report_end(&self) {}
}

/// `dir/app.apk` with postfix `_traced` becomes `dir/app_traced.apk`.
pub fn output_path(original: &Path, postfix: &str) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match original.extension() {
        Some(ext) => format!("{}{}.{}", stem, postfix, ext.to_string_lossy()),
        None => format!("{}{}", stem, postfix),
    };
    original.with_file_name(name)
}

/// Copy the original archive, substituting the given entries. Entries not in
/// the original are appended.
pub fn write_archive(
    original: &Path,
    postfix: &str,
    replacements: &HashMap<String, Vec<u8>>,
) -> Result<PathBuf, std::io::Error> {
    let mut archive = ZipArchive::new(File::open(original)?)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let target = output_path(original, postfix);
    let mut writer = ZipWriter::new(File::create(&target)?);
    let options = FileOptions::default();
    let zip_err =
        |e: zip::result::ZipError| std::io::Error::new(std::io::ErrorKind::Other, e.to_string());

    let mut written = std::collections::HashSet::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        let name = entry.name().to_string();
        writer.start_file(&name, options).map_err(zip_err)?;
        if let Some(bytes) = replacements.get(&name) {
            writer.write_all(bytes)?;
        } else {
            let mut bytes = vec![];
            entry.read_to_end(&mut bytes)?;
            writer.write_all(&bytes)?;
        }
        written.insert(name);
    }
    for (name, bytes) in replacements {
        if written.contains(name) {
            continue;
        }
        writer.start_file(name, options).map_err(zip_err)?;
        writer.write_all(bytes)?;
    }
    writer.finish().map_err(zip_err)?;

    rewrite_jad(original, &target);
    Ok(target)
}

/// Rewrite the `.jad` descriptor next to a midlet jar: jar size and url get
/// the new artifact's values. Every failure here is deliberately swallowed;
/// the descriptor is an optional companion.
fn rewrite_jad(original: &Path, target: &Path) {
    let jad_source = original.with_extension("jad");
    let content = match std::fs::read_to_string(&jad_source) {
        Ok(content) => content,
        Err(_) => return,
    };
    let new_size = match std::fs::metadata(target) {
        Ok(meta) => meta.len(),
        Err(_) => return,
    };
    let jar_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let rewritten: String = content
        .lines()
        .map(|line| {
            if line.starts_with("MIDlet-Jar-Size:") {
                format!("MIDlet-Jar-Size: {}", new_size)
            } else if line.starts_with("MIDlet-Jar-URL:") {
                format!("MIDlet-Jar-URL: {}", jar_name)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let jad_target = target.with_extension("jad");
    if let Err(e) = std::fs::write(&jad_target, rewritten) {
        log::debug!("could not write {}: {}", jad_target.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postfix_lands_before_the_extension() {
        assert_eq!(
            output_path(Path::new("/tmp/app.apk"), "_traced"),
            PathBuf::from("/tmp/app_traced.apk")
        );
        assert_eq!(
            output_path(Path::new("game.jar"), "-mod"),
            PathBuf::from("game-mod.jar")
        );
        assert_eq!(
            output_path(Path::new("noext"), "_x"),
            PathBuf::from("noext_x")
        );
    }

    #[test]
    fn archive_rewrite_substitutes_and_copies() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.jar");
        {
            let mut writer = ZipWriter::new(File::create(&source).unwrap());
            let options = FileOptions::default();
            writer.start_file("keep.txt", options).unwrap();
            writer.write_all(b"keep me").unwrap();
            writer.start_file("swap.bin", options).unwrap();
            writer.write_all(b"old").unwrap();
            writer.finish().unwrap();
        }

        let mut replacements = HashMap::new();
        replacements.insert("swap.bin".to_string(), b"new contents".to_vec());
        let target = write_archive(&source, "_out", &replacements).unwrap();
        assert_eq!(target, dir.path().join("app_out.jar"));

        let mut archive = ZipArchive::new(File::open(&target).unwrap()).unwrap();
        let mut kept = String::new();
        archive
            .by_name("keep.txt")
            .unwrap()
            .read_to_string(&mut kept)
            .unwrap();
        assert_eq!(kept, "keep me");
        let mut swapped = vec![];
        archive
            .by_name("swap.bin")
            .unwrap()
            .read_to_end(&mut swapped)
            .unwrap();
        assert_eq!(swapped, b"new contents");
    }

    #[test]
    fn jad_companion_is_rewritten_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("midlet.jar");
        {
            let mut writer = ZipWriter::new(File::create(&source).unwrap());
            writer
                .start_file("META-INF/MANIFEST.MF", FileOptions::default())
                .unwrap();
            writer.write_all(b"Manifest-Version: 1.0\n").unwrap();
            writer.finish().unwrap();
        }
        std::fs::write(
            dir.path().join("midlet.jad"),
            "MIDlet-Name: Probe\nMIDlet-Jar-URL: midlet.jar\nMIDlet-Jar-Size: 1\n",
        )
        .unwrap();

        let target = write_archive(&source, "_out", &HashMap::new()).unwrap();
        let jad = std::fs::read_to_string(dir.path().join("midlet_out.jad")).unwrap();
        assert!(jad.contains("MIDlet-Jar-URL: midlet_out.jar"));
        let size = std::fs::metadata(&target).unwrap().len();
        assert!(jad.contains(&format!("MIDlet-Jar-Size: {}", size)));
        assert!(jad.contains("MIDlet-Name: Probe"));
    }
}
