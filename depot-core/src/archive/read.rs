// depot-core/src/archive/read.rs

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use depot_common::error::{DepotError, Result};
use depot_common::model::{Manifest, Pin};
use depot_common::validation::{validate_instance_id, validate_package_name};
use sha1::{Digest, Sha1};
use tracing::debug;
use zip::ZipArchive;

use crate::MANIFEST_NAME;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// One entry of an opened archive, as exposed to the deployer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub name: String,
    pub size: u64,
    pub executable: bool,
    pub symlink: bool,
}

/// An opened, hash-verified package archive.
#[derive(Debug)]
pub struct PackageInstance<R: Read + Seek> {
    zip: ZipArchive<R>,
    pin: Pin,
    files: Vec<ArchiveFile>,
}

impl<R: Read + Seek> PackageInstance<R> {
    /// Opens a package archive, hashing the raw byte stream first.
    ///
    /// The instance ID is always the SHA-1 of the bytes as stored, never
    /// of any decoded content, so verification is a single pass over the
    /// stream. When `expected_id` is given, a disagreement fails with
    /// `HashMismatch` before the archive structure is even looked at.
    pub fn open(mut source: R, expected_id: Option<&str>) -> Result<Self> {
        source.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha1::new();
        std::io::copy(&mut source, &mut hasher)?;
        let instance_id = hex::encode(hasher.finalize());

        if let Some(expected) = expected_id {
            validate_instance_id(expected)?;
            if expected != instance_id {
                return Err(DepotError::HashMismatch {
                    expected: expected.to_string(),
                    actual: instance_id,
                });
            }
        }

        source.seek(SeekFrom::Start(0))?;
        let mut zip = ZipArchive::new(source)?;

        let manifest: Manifest = {
            let entry = zip.by_name(MANIFEST_NAME)?;
            serde_json::from_reader(entry)?
        };
        validate_package_name(&manifest.package_name)?;

        let mut files = Vec::new();
        for i in 0..zip.len() {
            let entry = zip.by_index_raw(i)?;
            if entry.is_dir() || entry.name().starts_with(".depotpkg/") {
                continue;
            }
            let mode = entry.unix_mode().unwrap_or(0o644);
            files.push(ArchiveFile {
                name: entry.name().to_string(),
                size: entry.size(),
                executable: mode & 0o111 != 0,
                symlink: mode & S_IFMT == S_IFLNK,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            "Opened {}:{} with {} file(s)",
            manifest.package_name,
            instance_id,
            files.len()
        );
        Ok(Self {
            zip,
            pin: Pin::new(manifest.package_name, instance_id),
            files,
        })
    }

    pub fn pin(&self) -> &Pin {
        &self.pin
    }

    /// Archive entries outside the reserved service directory, by name.
    pub fn files(&self) -> &[ArchiveFile] {
        &self.files
    }

    /// Extracts every entry (the manifest included) under `dest`.
    ///
    /// `dest` is expected to be a fresh directory; existing files are
    /// overwritten. Entry paths that would escape `dest` are rejected.
    pub fn extract_into(&mut self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        for i in 0..self.zip.len() {
            let mut entry = self.zip.by_index(i)?;
            let rel = entry.enclosed_name().ok_or_else(|| {
                DepotError::Validation(format!("Unsafe archive path '{}'", entry.name()))
            })?;
            let path = dest.join(rel);

            if entry.is_dir() {
                fs::create_dir_all(&path)?;
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mode = entry.unix_mode().unwrap_or(0o644);
            if mode & S_IFMT == S_IFLNK {
                let mut target = String::new();
                entry.read_to_string(&mut target)?;
                std::os::unix::fs::symlink(&target, &path)?;
                continue;
            }

            let mut out = fs::File::create(&path)?;
            std::io::copy(&mut entry, &mut out)?;
            let perm = if mode & 0o111 != 0 { 0o755 } else { 0o644 };
            fs::set_permissions(&path, fs::Permissions::from_mode(perm))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::TempDir;

    use super::super::{build_package, FileSource, FileSpec};
    use super::*;

    fn sample_archive() -> Vec<u8> {
        let files = vec![
            FileSpec::regular("docs/readme", FileSource::Memory(b"hello".to_vec())),
            FileSpec::executable("bin/tool", FileSource::Memory(b"#!/bin/sh\n".to_vec())),
            FileSpec::symlink("current", "bin/tool"),
        ];
        let mut out = Cursor::new(Vec::new());
        build_package("pkg/a", &files, &mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn content_addressing_round_trip() {
        let bytes = sample_archive();

        let instance = PackageInstance::open(Cursor::new(bytes.clone()), None).unwrap();
        let id = instance.pin().instance_id.clone();
        assert_eq!(id.len(), 40);
        assert_eq!(instance.pin().package_name, "pkg/a");

        // Re-opening with the derived ID as expected succeeds.
        PackageInstance::open(Cursor::new(bytes.clone()), Some(&id)).unwrap();

        // Any other well-formed ID fails with a hash mismatch.
        let wrong = "0".repeat(40);
        let err = PackageInstance::open(Cursor::new(bytes), Some(&wrong)).unwrap_err();
        assert!(matches!(err, DepotError::HashMismatch { .. }), "{err}");
    }

    #[test]
    fn file_listing_skips_the_service_dir() {
        let instance = PackageInstance::open(Cursor::new(sample_archive()), None).unwrap();
        let names: Vec<&str> = instance.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["bin/tool", "current", "docs/readme"]);

        let tool = &instance.files()[0];
        assert!(tool.executable);
        assert!(!tool.symlink);
        let link = &instance.files()[1];
        assert!(link.symlink);
    }

    #[test]
    fn extraction_restores_modes_and_symlinks() {
        let mut instance = PackageInstance::open(Cursor::new(sample_archive()), None).unwrap();
        let dest = TempDir::new().unwrap();
        instance.extract_into(dest.path()).unwrap();

        assert_eq!(
            fs::read_to_string(dest.path().join("docs/readme")).unwrap(),
            "hello"
        );
        let mode = fs::metadata(dest.path().join("bin/tool"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);

        let target = fs::read_link(dest.path().join("current")).unwrap();
        assert_eq!(target.to_str().unwrap(), "bin/tool");

        // The manifest is extracted too: the deployer reads it back.
        let manifest = fs::read_to_string(dest.path().join(MANIFEST_NAME)).unwrap();
        assert!(manifest.contains("pkg/a"));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let err = PackageInstance::open(Cursor::new(b"not a zip".to_vec()), None).unwrap_err();
        assert!(matches!(err, DepotError::Zip(_)), "{err}");
    }
}
