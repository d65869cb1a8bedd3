// depot-core/src/deploy.rs
//
// Local deployment of package instances under a site root:
//
//   <root>/.depot/pkgs/<digest>/<instance-id>/...   extracted content
//   <root>/.depot/pkgs/<digest>/_current            symlink to an ID
//   <root>/<file>                                   symlink through _current
//
// Instance directories are immutable once fully written and keyed by
// content hash. The only operation that changes which version is live is
// the atomic rename of the _current symlink.

use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use depot_common::error::{DepotError, Result};
use depot_common::model::{Manifest, PackageState, Pin};
use depot_common::validation::{validate_instance_id, validate_package_name};
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::PackageInstance;
use crate::{MANIFEST_NAME, PKG_SERVICE_DIR, SITE_SERVICE_DIR};

const PKGS_DIR: &str = "pkgs";
const CURRENT_LINK: &str = "_current";

/// Deploys, inspects and removes package instances at one site root.
#[derive(Debug, Clone)]
pub struct Deployer {
    root: PathBuf,
}

impl Deployer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn service_dir(&self) -> PathBuf {
        self.root.join(SITE_SERVICE_DIR)
    }

    fn packages_dir(&self) -> PathBuf {
        self.service_dir().join(PKGS_DIR)
    }

    fn package_dir(&self, package_name: &str) -> PathBuf {
        self.packages_dir().join(package_name_digest(package_name))
    }

    /// A temp file under the site root's service directory, used to stage
    /// downloads next to where they will be extracted.
    pub fn temp_file(&self) -> Result<NamedTempFile> {
        let dir = self.service_dir().join("tmp");
        fs::create_dir_all(&dir)?;
        Ok(NamedTempFile::new_in(dir)?)
    }

    /// Installs an instance and makes it the live version of its package.
    ///
    /// Everything before the `_current` swap is side-effect-free for
    /// already-installed consumers; everything after it is best-effort
    /// and logged rather than failed, except the final concurrent-deploy
    /// check.
    pub fn deploy_instance<R: Read + Seek>(
        &self,
        instance: &mut PackageInstance<R>,
    ) -> Result<PackageState> {
        let pin = instance.pin().clone();
        validate_package_name(&pin.package_name)?;
        validate_instance_id(&pin.instance_id)?;
        info!("Deploying {} into {}", pin, self.root.display());

        let pkg_dir = self.package_dir(&pin.package_name);

        // What is live now, and which site-root links belong to it.
        let prev = match self.check_deployed(&pin.package_name) {
            Ok(prev) => prev,
            Err(e) => {
                warn!("Ignoring unreadable deployed state: {}", e);
                None
            }
        };
        let old_files = match &prev {
            Some(state) => scan_package_dir(&pkg_dir.join(&state.instance_id))?,
            None => Vec::new(),
        };
        // The new file set comes from the archive listing, not from a
        // rescan of the extracted tree: after the swap nothing may fail
        // the deploy except the concurrency check.
        let new_files: Vec<String> = instance.files().iter().map(|f| f.name.clone()).collect();

        // Extract into a temp dir first, then move it into place under
        // its instance ID. An existing instance dir is reused as is.
        let instance_dir = pkg_dir.join(&pin.instance_id);
        if !instance_dir.exists() {
            fs::create_dir_all(&pkg_dir)?;
            let staging = tempfile::Builder::new()
                .prefix("extract_")
                .tempdir_in(&pkg_dir)?
                .keep();
            if let Err(e) = instance.extract_into(&staging) {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
            if let Err(e) = fs::rename(&staging, &instance_dir) {
                if instance_dir.exists() {
                    // Lost a race with another deploy of the same ID. The
                    // content is identical, so theirs is as good as ours.
                    let _ = fs::remove_dir_all(&staging);
                } else {
                    let _ = fs::remove_dir_all(&staging);
                    return Err(e.into());
                }
            }
        } else {
            debug!("Instance {} is already extracted", pin.instance_id);
        }

        // Point of no return: the atomic swap.
        ensure_symlink(&pkg_dir.join(CURRENT_LINK), Path::new(&pin.instance_id))?;

        // Refresh site-root links and drop the ones only the old version
        // had. Failures here leave the new version live, so log only.
        let digest = package_name_digest(&pin.package_name);
        for name in &new_files {
            if let Err(e) = self.link_site_file(&digest, name) {
                warn!("Failed to link {}: {}", name, e);
            }
        }
        for name in old_files.iter().filter(|n| !new_files.contains(n)) {
            if let Err(e) = ensure_file_gone(&self.root.join(name)) {
                warn!("Failed to unlink stale {}: {}", name, e);
            } else {
                prune_empty_dirs(&self.root, Path::new(name));
            }
        }

        // Superseded instance dirs are pure garbage. Collect them off the
        // main flow; the outcome is logged, never propagated.
        let cleanup = prev
            .as_ref()
            .filter(|state| state.instance_id != pin.instance_id)
            .map(|state| {
                let old_dir = pkg_dir.join(&state.instance_id);
                std::thread::spawn(move || ensure_directory_gone(&old_dir))
            });
        if let Some(handle) = cleanup {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to remove the old instance: {}", e),
                Err(_) => warn!("Old-instance cleanup panicked"),
            }
        }

        // Detect a deploy of the same package racing this one.
        let state = self.confirm_swapped(&pin)?;
        info!("Deployed {}", state);
        Ok(state)
    }

    /// Verifies that the swapped-in version is still the pinned one. The
    /// last step of a deploy: another deploy racing this one may have
    /// repointed `_current` in the meantime.
    fn confirm_swapped(&self, pin: &Pin) -> Result<PackageState> {
        let state = self
            .check_deployed(&pin.package_name)?
            .ok_or_else(|| DepotError::Corruption("Deployed state vanished".to_string()))?;
        if state.instance_id != pin.instance_id {
            return Err(DepotError::ConcurrentDeploy(state.instance_id));
        }
        Ok(state)
    }

    /// What is currently live for a package name, if anything.
    ///
    /// `Ok(None)` means "not deployed". A `_current` link pointing at
    /// something that is not an instance ID, or a manifest naming a
    /// different package, is corruption and an error.
    pub fn check_deployed(&self, package_name: &str) -> Result<Option<PackageState>> {
        validate_package_name(package_name)?;
        let pkg_dir = self.package_dir(package_name);

        let target = match fs::read_link(pkg_dir.join(CURRENT_LINK)) {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let instance_id = target
            .to_str()
            .ok_or_else(|| DepotError::Corruption("Non-UTF8 _current target".to_string()))?
            .to_string();
        validate_instance_id(&instance_id)
            .map_err(|_| DepotError::Corruption(format!("Bad _current target '{instance_id}'")))?;

        let manifest = read_manifest(&pkg_dir.join(&instance_id))?;
        if manifest.package_name != package_name {
            return Err(DepotError::Corruption(format!(
                "Manifest names '{}' where '{}' is deployed",
                manifest.package_name, package_name
            )));
        }
        Ok(Some(PackageState {
            package_name: package_name.to_string(),
            instance_id,
        }))
    }

    /// All validly-deployed packages at this site root, ordered by name.
    /// Entries that do not look like deployments are skipped, not failed.
    pub fn find_deployed(&self) -> Result<Vec<PackageState>> {
        let entries = match fs::read_dir(self.packages_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let target = match fs::read_link(dir.join(CURRENT_LINK)) {
                Ok(target) => target,
                Err(_) => continue,
            };
            let instance_id = match target.to_str() {
                Some(id) if validate_instance_id(id).is_ok() => id.to_string(),
                _ => continue,
            };
            let manifest = match read_manifest(&dir.join(&instance_id)) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };
            // The directory must actually correspond to the claimed name.
            if dir.file_name().and_then(|n| n.to_str())
                != Some(package_name_digest(&manifest.package_name).as_str())
            {
                warn!("Skipping misplaced package at {}", dir.display());
                continue;
            }
            found.push(PackageState {
                package_name: manifest.package_name,
                instance_id,
            });
        }

        found.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        found.dedup_by(|a, b| a.package_name == b.package_name);
        Ok(found)
    }

    /// Removes a deployed package and its site-root links. A package that
    /// is not deployed is a no-op; the call is idempotent.
    pub fn remove_deployed(&self, package_name: &str) -> Result<()> {
        validate_package_name(package_name)?;
        info!("Removing {} from {}", package_name, self.root.display());
        let pkg_dir = self.package_dir(package_name);

        match self.check_deployed(package_name) {
            Ok(Some(state)) => {
                for name in scan_package_dir(&pkg_dir.join(&state.instance_id))? {
                    if let Err(e) = ensure_file_gone(&self.root.join(&name)) {
                        warn!("Failed to unlink {}: {}", name, e);
                    } else {
                        prune_empty_dirs(&self.root, Path::new(&name));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Removing corrupted deployment: {}", e),
        }
        ensure_directory_gone(&pkg_dir)
    }

    fn link_site_file(&self, digest: &str, name: &str) -> Result<()> {
        let link = self.root.join(name);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        // Hop up to the root, then back down through the indirection.
        let depth = name.matches('/').count();
        let mut target = PathBuf::new();
        for _ in 0..depth {
            target.push("..");
        }
        target.push(SITE_SERVICE_DIR);
        target.push(PKGS_DIR);
        target.push(digest);
        target.push(CURRENT_LINK);
        target.push(name);
        ensure_symlink(&link, &target)
    }
}

/// Directory name for a package: its last path components plus a short
/// hash of the full name. Keeps service paths flat and short; the real
/// name lives in the manifest inside.
fn package_name_digest(package_name: &str) -> String {
    let digest = hex::encode(Sha1::digest(package_name.as_bytes()));
    let mut chunks: Vec<&str> = package_name.split('/').collect();
    if chunks.len() > 2 {
        chunks.drain(..chunks.len() - 2);
    }
    chunks.push(&digest[..10]);
    chunks.join("_")
}

fn read_manifest(instance_dir: &Path) -> Result<Manifest> {
    let text = fs::read_to_string(instance_dir.join(MANIFEST_NAME))?;
    Ok(serde_json::from_str(&text)?)
}

/// Relative paths of all files and symlinks in an instance directory,
/// sorted, with the archive service directory skipped.
fn scan_package_dir(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() == 1 && e.file_type().is_dir() && e.file_name() == PKG_SERVICE_DIR)
        });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).map_err(|_| {
            DepotError::Corruption(format!("Entry outside {}", dir.display()))
        })?;
        match rel.to_str() {
            Some(name) => out.push(name.to_string()),
            None => {
                return Err(DepotError::Corruption(format!(
                    "Non-UTF8 path in {}",
                    dir.display()
                )))
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Atomically points `link` at `target`: a uniquely-named sibling symlink
/// is created first, then renamed over the destination.
fn ensure_symlink(link: &Path, target: &Path) -> Result<()> {
    let staging = sibling_temp_name(link);
    std::os::unix::fs::symlink(target, &staging)?;
    match fs::rename(&staging, link) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&staging);
            Err(e.into())
        }
    }
}

/// Removes a directory tree, renaming it aside first so the visible path
/// disappears in one step even if the recursive delete is slow or fails
/// midway.
fn ensure_directory_gone(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let staging = sibling_temp_name(dir);
    match fs::rename(dir, &staging) {
        Ok(()) => fs::remove_dir_all(&staging).map_err(Into::into),
        Err(_) => fs::remove_dir_all(dir).map_err(Into::into),
    }
}

fn ensure_file_gone(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn sibling_temp_name(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp");
    path.with_file_name(format!("{name}_{}_{nanos}", std::process::id()))
}

/// Removes now-empty directories between a deleted file and the root.
/// Strictly best-effort.
fn prune_empty_dirs(root: &Path, rel: &Path) {
    let mut dir = rel.parent();
    while let Some(d) = dir {
        if d.as_os_str().is_empty() {
            break;
        }
        if fs::remove_dir(root.join(d)).is_err() {
            break;
        }
        dir = d.parent();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::TempDir;

    use super::*;
    use crate::archive::{build_package, FileSource, FileSpec};

    fn mem(name: &str, bytes: &[u8]) -> FileSpec {
        FileSpec::regular(name, FileSource::Memory(bytes.to_vec()))
    }

    fn make_instance(name: &str, files: &[FileSpec]) -> PackageInstance<Cursor<Vec<u8>>> {
        let mut out = Cursor::new(Vec::new());
        build_package(name, files, &mut out).unwrap();
        PackageInstance::open(Cursor::new(out.into_inner()), None).unwrap()
    }

    fn read_via_links(root: &Path, rel: &str) -> String {
        fs::read_to_string(root.join(rel)).unwrap()
    }

    #[test]
    fn deploy_then_check() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());
        let mut instance = make_instance("pkg/a", &[mem("file", b"hello")]);
        let pin = instance.pin().clone();

        let state = deployer.deploy_instance(&mut instance).unwrap();
        assert_eq!(state.pin(), pin);
        assert_eq!(read_via_links(tmp.path(), "file"), "hello");

        let checked = deployer.check_deployed("pkg/a").unwrap().unwrap();
        assert_eq!(checked, state);
        assert!(deployer.check_deployed("pkg/other").unwrap().is_none());
    }

    #[test]
    fn deploy_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());

        let mut first = make_instance("pkg/a", &[mem("a/file", b"x"), mem("b", b"y")]);
        deployer.deploy_instance(&mut first).unwrap();
        let listing_once = scan_package_dir(tmp.path()).unwrap();

        let mut again = make_instance("pkg/a", &[mem("a/file", b"x"), mem("b", b"y")]);
        deployer.deploy_instance(&mut again).unwrap();
        let listing_twice = scan_package_dir(tmp.path()).unwrap();

        assert_eq!(listing_once, listing_twice);
        assert_eq!(read_via_links(tmp.path(), "a/file"), "x");
    }

    #[test]
    fn deploy_upgrade_swaps_and_garbage_collects() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());

        let mut a = make_instance("pkg/a", &[mem("shared", b"old"), mem("only_in_a", b"a")]);
        let id_a = a.pin().instance_id.clone();
        deployer.deploy_instance(&mut a).unwrap();
        assert_eq!(read_via_links(tmp.path(), "only_in_a"), "a");

        let mut b = make_instance("pkg/a", &[mem("shared", b"new"), mem("only_in_b", b"b")]);
        let id_b = b.pin().instance_id.clone();
        let state = deployer.deploy_instance(&mut b).unwrap();
        assert_eq!(state.instance_id, id_b);

        // Every link resolves to B's content.
        assert_eq!(read_via_links(tmp.path(), "shared"), "new");
        assert_eq!(read_via_links(tmp.path(), "only_in_b"), "b");
        // A's extra file and instance dir are gone.
        assert!(!tmp.path().join("only_in_a").exists());
        let pkg_dir = deployer.package_dir("pkg/a");
        assert!(!pkg_dir.join(&id_a).exists());
        assert!(pkg_dir.join(&id_b).exists());
    }

    #[test]
    fn site_links_come_from_the_archive_listing() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());
        let mut instance = make_instance("pkg/a", &[mem("f", b"x")]);
        let id = instance.pin().instance_id.clone();
        deployer.deploy_instance(&mut instance).unwrap();

        // Junk that somehow ended up inside the instance dir must not be
        // linked into the site root by a redeploy of the same instance.
        let instance_dir = deployer.package_dir("pkg/a").join(&id);
        fs::write(instance_dir.join("junk"), b"j").unwrap();

        let mut again = make_instance("pkg/a", &[mem("f", b"x")]);
        deployer.deploy_instance(&mut again).unwrap();
        assert!(!tmp.path().join("junk").exists());
        assert_eq!(read_via_links(tmp.path(), "f"), "x");
    }

    #[test]
    fn concurrent_deploy_is_detected_after_the_swap() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());
        let mut ours = make_instance("pkg/a", &[mem("f", b"ours")]);
        let our_pin = ours.pin().clone();
        deployer.deploy_instance(&mut ours).unwrap();

        // Another deploy of the same package lands between our swap and
        // the final check: extract its instance and repoint _current.
        let mut theirs = make_instance("pkg/a", &[mem("f", b"theirs")]);
        let their_id = theirs.pin().instance_id.clone();
        let pkg_dir = deployer.package_dir("pkg/a");
        theirs.extract_into(&pkg_dir.join(&their_id)).unwrap();
        ensure_symlink(&pkg_dir.join(CURRENT_LINK), Path::new(&their_id)).unwrap();

        let err = deployer.confirm_swapped(&our_pin).unwrap_err();
        assert!(
            matches!(&err, DepotError::ConcurrentDeploy(id) if *id == their_id),
            "{err}"
        );
    }

    #[test]
    fn symlinks_in_packages_survive_deployment() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());
        let mut instance = make_instance(
            "pkg/a",
            &[mem("bin/tool", b"#!"), FileSpec::symlink("bin/alias", "tool")],
        );
        deployer.deploy_instance(&mut instance).unwrap();

        assert_eq!(read_via_links(tmp.path(), "bin/alias"), "#!");
    }

    #[test]
    fn find_deployed_lists_packages_sorted() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());
        assert!(deployer.find_deployed().unwrap().is_empty());

        let mut b = make_instance("pkg/b", &[mem("b", b"b")]);
        let mut a = make_instance("pkg/a", &[mem("a", b"a")]);
        deployer.deploy_instance(&mut b).unwrap();
        deployer.deploy_instance(&mut a).unwrap();

        let found = deployer.find_deployed().unwrap();
        let names: Vec<&str> = found.iter().map(|s| s.package_name.as_str()).collect();
        assert_eq!(names, vec!["pkg/a", "pkg/b"]);
    }

    #[test]
    fn find_deployed_skips_garbage() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());
        let mut instance = make_instance("pkg/a", &[mem("f", b"x")]);
        deployer.deploy_instance(&mut instance).unwrap();

        // A stray directory with no _current link.
        fs::create_dir_all(deployer.packages_dir().join("junk_0123456789")).unwrap();

        let found = deployer.find_deployed().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].package_name, "pkg/a");
    }

    #[test]
    fn remove_deployed_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());
        let mut instance = make_instance("pkg/a", &[mem("a/file", b"x")]);
        deployer.deploy_instance(&mut instance).unwrap();

        deployer.remove_deployed("pkg/a").unwrap();
        assert!(!tmp.path().join("a").exists());
        assert!(deployer.check_deployed("pkg/a").unwrap().is_none());

        // Again, with nothing deployed.
        deployer.remove_deployed("pkg/a").unwrap();
    }

    #[test]
    fn check_deployed_detects_name_mismatch() {
        let tmp = TempDir::new().unwrap();
        let deployer = Deployer::new(tmp.path());
        let mut instance = make_instance("pkg/a", &[mem("f", b"x")]);
        let id = instance.pin().instance_id.clone();
        deployer.deploy_instance(&mut instance).unwrap();

        // Graft pkg/a's deployment into pkg/b's slot.
        let rogue = deployer.package_dir("pkg/b");
        fs::create_dir_all(&rogue).unwrap();
        fs::rename(
            deployer.package_dir("pkg/a").join(&id),
            rogue.join(&id),
        )
        .unwrap();
        ensure_symlink(&rogue.join(CURRENT_LINK), Path::new(&id)).unwrap();

        let err = deployer.check_deployed("pkg/b").unwrap_err();
        assert!(matches!(err, DepotError::Corruption(_)), "{err}");
    }

    #[test]
    fn package_name_digest_shape() {
        let d = package_name_digest("infra/tools/depot");
        assert!(d.starts_with("tools_depot_"));
        assert_eq!(d.len(), "tools_depot_".len() + 10);
        // Stable across calls, distinct across names.
        assert_eq!(d, package_name_digest("infra/tools/depot"));
        assert_ne!(d, package_name_digest("other/tools/depot"));

        let short = package_name_digest("solo");
        assert!(short.starts_with("solo_"));
    }
}
