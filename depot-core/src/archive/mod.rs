// depot-core/src/archive/mod.rs
//
// The deterministic package archive: a zip container with sorted,
// timestamp-stripped entries plus an embedded manifest. The SHA-1 of the
// raw archive bytes is the instance ID.

mod build;
mod read;

pub use build::build_package;
pub use read::{ArchiveFile, PackageInstance};

use std::path::PathBuf;

/// Where the bytes of one to-be-packaged file come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Regular file on disk, read at build time.
    Disk(PathBuf),
    /// In-memory contents (generated files, tests).
    Memory(Vec<u8>),
    /// Symlink with the given relative target. Not followed.
    Symlink(String),
}

/// One entry destined for an archive. Immutable once constructed;
/// produced by the filesystem scanner or assembled by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Slash-separated path inside the archive.
    pub name: String,
    pub executable: bool,
    pub source: FileSource,
}

impl FileSpec {
    pub fn regular(name: impl Into<String>, source: FileSource) -> Self {
        Self {
            name: name.into(),
            executable: false,
            source,
        }
    }

    pub fn executable(name: impl Into<String>, source: FileSource) -> Self {
        Self {
            name: name.into(),
            executable: true,
            source,
        }
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: false,
            source: FileSource::Symlink(target.into()),
        }
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.source, FileSource::Symlink(_))
    }
}
