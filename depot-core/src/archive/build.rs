// depot-core/src/archive/build.rs

use std::fs;
use std::io::{Seek, Write};

use depot_common::error::{DepotError, Result};
use depot_common::model::Manifest;
use depot_common::validation::validate_package_name;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{FileSource, FileSpec};
use crate::{MANIFEST_NAME, PKG_SERVICE_DIR};

// Fixed so that identical inputs compress to identical bytes on any host.
const COMPRESSION_LEVEL: i64 = 6;

/// Writes a deterministic package archive to `out`.
///
/// Entries are sorted by name, timestamps are zeroed and the compression
/// parameters are pinned, so the same (package name, file set) always
/// produces byte-identical output. The generated manifest is written last
/// at its reserved path.
pub fn build_package<W: Write + Seek>(
    package_name: &str,
    files: &[FileSpec],
    out: W,
) -> Result<()> {
    validate_package_name(package_name)?;

    let mut sorted: Vec<&FileSpec> = files.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for pair in sorted.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(DepotError::DuplicateFile(pair[0].name.clone()));
        }
    }
    for file in &sorted {
        if file.name == PKG_SERVICE_DIR || file.name.starts_with(".depotpkg/") {
            return Err(DepotError::ReservedPath(file.name.clone()));
        }
    }

    debug!("Building package '{}' with {} file(s)", package_name, sorted.len());
    let mut zip = ZipWriter::new(out);
    let base = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL))
        .last_modified_time(zip::DateTime::default());

    for file in &sorted {
        match &file.source {
            FileSource::Symlink(target) => {
                zip.add_symlink(file.name.as_str(), target.as_str(), base)?;
            }
            FileSource::Disk(path) => {
                let mode = if file.executable { 0o755 } else { 0o644 };
                zip.start_file(file.name.as_str(), base.unix_permissions(mode))?;
                let mut src = fs::File::open(path)?;
                std::io::copy(&mut src, &mut zip)?;
            }
            FileSource::Memory(bytes) => {
                let mode = if file.executable { 0o755 } else { 0o644 };
                zip.start_file(file.name.as_str(), base.unix_permissions(mode))?;
                zip.write_all(bytes)?;
            }
        }
    }

    let manifest = Manifest::new(package_name);
    zip.start_file(MANIFEST_NAME, base.unix_permissions(0o644))?;
    serde_json::to_writer(&mut zip, &manifest)?;

    zip.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn mem(name: &str, bytes: &[u8]) -> FileSpec {
        FileSpec::regular(name, FileSource::Memory(bytes.to_vec()))
    }

    fn build(name: &str, files: &[FileSpec]) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        build_package(name, files, &mut out)?;
        Ok(out.into_inner())
    }

    #[test]
    fn output_is_deterministic() {
        let files = vec![
            mem("b/file", b"bbb"),
            mem("a/file", b"aaa"),
            FileSpec::executable("bin/tool", FileSource::Memory(b"#!/bin/sh\n".to_vec())),
            FileSpec::symlink("link", "a/file"),
        ];
        let mut reversed = files.clone();
        reversed.reverse();

        let first = build("pkg/a", &files).unwrap();
        let second = build("pkg/a", &reversed).unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn different_content_differs() {
        let a = build("pkg/a", &[mem("f", b"one")]).unwrap();
        let b = build("pkg/a", &[mem("f", b"two")]).unwrap();
        assert_ne!(a, b);
        // The package name is part of the archive via the manifest.
        let c = build("pkg/b", &[mem("f", b"one")]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let err = build("pkg/a", &[mem("f", b"one"), mem("f", b"two")]).unwrap_err();
        assert!(matches!(err, DepotError::DuplicateFile(name) if name == "f"));
    }

    #[test]
    fn reserved_paths_are_rejected() {
        let err = build("pkg/a", &[mem(".depotpkg/manifest.json", b"{}")]).unwrap_err();
        assert!(matches!(err, DepotError::ReservedPath(_)));
        let err = build("pkg/a", &[mem(".depotpkg/extra", b"x")]).unwrap_err();
        assert!(matches!(err, DepotError::ReservedPath(_)));
    }

    #[test]
    fn bad_package_name_is_rejected() {
        assert!(build("Bad Name", &[]).is_err());
    }
}
