// depot-core/src/pkgdef.rs
//
// Build-time package definition files: which package name to use and
// which files under a root directory go into the archive.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use depot_common::error::{DepotError, Result};
use depot_common::validation::validate_package_name;
use serde::Deserialize;
use tracing::debug;

use crate::archive::{FileSource, FileSpec};
use crate::scan::scan_dir;

/// One data entry of a package definition: a single file, or a whole
/// directory with optional glob excludes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DataEntry {
    File {
        file: String,
    },
    Dir {
        dir: String,
        #[serde(default)]
        exclude: Vec<String>,
    },
}

/// JSON package definition consumed by the `build` command. Has no role
/// at deploy time.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageDef {
    pub package: String,
    /// Base directory the data entries are relative to, itself relative
    /// to the definition file's location.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    pub data: Vec<DataEntry>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

impl PackageDef {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let def: PackageDef = serde_json::from_str(&text)?;
        validate_package_name(&def.package)?;
        Ok(def)
    }

    /// Collects the file list described by the data entries, resolved
    /// against `def_dir` (the directory the definition file lives in).
    pub fn collect_files(&self, def_dir: &Path) -> Result<Vec<FileSpec>> {
        let base = def_dir.join(&self.root);
        let mut out = Vec::new();

        for entry in &self.data {
            match entry {
                DataEntry::File { file } => {
                    let path = base.join(file);
                    let meta = fs::symlink_metadata(&path)?;
                    if meta.file_type().is_symlink() {
                        let target = fs::read_link(&path)?;
                        let target = target.to_str().ok_or_else(|| {
                            DepotError::Validation(format!(
                                "Non-UTF8 link target in {}",
                                path.display()
                            ))
                        })?;
                        out.push(FileSpec::symlink(file.clone(), target));
                    } else {
                        out.push(FileSpec {
                            name: file.clone(),
                            executable: meta.permissions().mode() & 0o111 != 0,
                            source: FileSource::Disk(path),
                        });
                    }
                }
                DataEntry::Dir { dir, exclude } => {
                    let patterns: Vec<glob::Pattern> = exclude
                        .iter()
                        .map(|p| {
                            glob::Pattern::new(p).map_err(|e| {
                                DepotError::Validation(format!("Bad exclude pattern '{p}': {e}"))
                            })
                        })
                        .collect::<Result<_>>()?;

                    let scanned = scan_dir(&base.join(dir))?;
                    for mut spec in scanned {
                        if patterns.iter().any(|p| p.matches(&spec.name)) {
                            continue;
                        }
                        if dir != "." {
                            spec.name = format!("{}/{}", dir, spec.name);
                        }
                        out.push(spec);
                    }
                }
            }
        }

        debug!("Package '{}': {} file(s) collected", self.package, out.len());
        Ok(out)
    }
}
