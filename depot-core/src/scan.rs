// depot-core/src/scan.rs
//
// Walks a directory tree into the ordered file list used to build
// archives. Symlinks are recorded, not followed; targets must stay
// inside the scanned root so extracted packages remain confined.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use depot_common::error::{DepotError, Result};
use tracing::debug;
use walkdir::WalkDir;

use crate::archive::{FileSource, FileSpec};
use crate::{PKG_SERVICE_DIR, SITE_SERVICE_DIR};

/// Returns every non-directory entry under `root`, ordered by path, with
/// the reserved service directories skipped. Symlink targets are
/// normalized to relative form; a target that resolves outside `root`
/// fails with `EscapingSymlink`.
pub fn scan_dir(root: &Path) -> Result<Vec<FileSpec>> {
    let root = root.canonicalize()?;
    debug!("Scanning {}", root.display());

    let mut out = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() == 1
                && e.file_type().is_dir()
                && (e.file_name() == SITE_SERVICE_DIR || e.file_name() == PKG_SERVICE_DIR))
        });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(&root)
            .map_err(|_| DepotError::Validation("Scanner left the root".to_string()))?
            .to_path_buf();
        let name = archive_name(&rel)?;

        if entry.file_type().is_symlink() {
            let target = fs::read_link(entry.path())?;
            let target = normalize_symlink(&rel, &target, &root)?;
            out.push(FileSpec::symlink(name, target));
        } else {
            let executable =
                entry.metadata().map_err(std::io::Error::from)?.permissions().mode() & 0o111 != 0;
            out.push(FileSpec {
                name,
                executable,
                source: FileSource::Disk(entry.path().to_path_buf()),
            });
        }
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn archive_name(rel: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for c in rel.components() {
        match c {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s),
                None => {
                    return Err(DepotError::Validation(format!(
                        "Non-UTF8 file name: {}",
                        rel.display()
                    )))
                }
            },
            _ => {
                return Err(DepotError::Validation(format!(
                    "Unexpected path component in {}",
                    rel.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Rewrites a symlink target into the relative string stored in archives.
///
/// Relative targets are kept verbatim after a confinement check. Absolute
/// targets pointing inside the root are rewritten relative to the link's
/// directory; anything resolving outside the root is an error.
fn normalize_symlink(link_rel: &Path, target: &Path, root: &Path) -> Result<String> {
    let link_dir = link_rel.parent().unwrap_or_else(|| Path::new(""));

    let escaping = || DepotError::EscapingSymlink {
        name: link_rel.display().to_string(),
        target: target.display().to_string(),
    };

    let relative = if target.is_absolute() {
        let inside = target.strip_prefix(root).map_err(|_| escaping())?;
        relative_to(link_dir, inside)
    } else {
        // Confinement check only; the stored string stays as authored.
        resolve_within(link_dir, target).ok_or_else(escaping)?;
        target.to_path_buf()
    };

    // The resulting root-relative location must also stay confined.
    resolve_within(link_dir, &relative).ok_or_else(escaping)?;
    archive_name_relaxed(&relative)
}

// Like archive_name, but permits '..' segments (valid in link targets).
fn archive_name_relaxed(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for c in path.components() {
        match c {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s),
                None => {
                    return Err(DepotError::Validation(format!(
                        "Non-UTF8 link target: {}",
                        path.display()
                    )))
                }
            },
            Component::ParentDir => parts.push(".."),
            Component::CurDir => {}
            _ => {
                return Err(DepotError::Validation(format!(
                    "Unexpected component in link target {}",
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Lexically resolves `target` against the root-relative directory
/// `base`. Returns the root-relative result, or None if any '..' pops
/// past the root.
fn resolve_within(base: &Path, target: &Path) -> Option<PathBuf> {
    let mut stack: Vec<std::ffi::OsString> =
        base.components().map(|c| c.as_os_str().to_os_string()).collect();
    for c in target.components() {
        match c {
            Component::Normal(part) => stack.push(part.to_os_string()),
            Component::ParentDir => {
                stack.pop()?;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(stack.iter().collect())
}

/// Relative path from the directory `from` to the path `to`, both given
/// relative to the same root.
fn relative_to(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for c in &to[common..] {
        out.push(c);
    }
    out
}
