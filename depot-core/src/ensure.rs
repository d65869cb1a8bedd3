// depot-core/src/ensure.rs
//
// Declarative reconciliation: given the desired {name -> instance} set
// and what is deployed, compute the minimal action plan and apply it,
// collecting per-package failures instead of stopping at the first one.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use depot_common::error::{DepotError, PackageFailure, Result};
use depot_common::model::{PackageState, Pin};
use depot_common::validation::{
    validate_instance_id, validate_package_name, validate_version,
};
use depot_net::api::RemoteRepository;
use depot_net::transfer::InstanceFetcher;
use tracing::{error, info};

use crate::archive::PackageInstance;
use crate::deploy::Deployer;

/// The minimal set of mutations turning the deployed set into the
/// desired one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActionPlan {
    /// Pins to fetch and deploy (new packages and version changes).
    pub to_deploy: Vec<Pin>,
    /// Package names to remove entirely.
    pub to_delete: Vec<String>,
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        self.to_deploy.is_empty() && self.to_delete.is_empty()
    }
}

/// Diffs desired pins against deployed state.
///
/// A desired pin whose name and instance both match what is deployed is
/// left out of the plan entirely; that is the idempotent no-op path. A
/// name listed twice in `desired` is rejected before anything else.
pub fn plan_actions(desired: &[Pin], existing: &[PackageState]) -> Result<ActionPlan> {
    let mut seen = HashSet::new();
    for pin in desired {
        if !seen.insert(pin.package_name.as_str()) {
            return Err(DepotError::DuplicatePackage(pin.package_name.clone()));
        }
    }

    let deployed: HashMap<&str, &str> = existing
        .iter()
        .map(|s| (s.package_name.as_str(), s.instance_id.as_str()))
        .collect();

    let to_deploy = desired
        .iter()
        .filter(|pin| deployed.get(pin.package_name.as_str()) != Some(&pin.instance_id.as_str()))
        .cloned()
        .collect();
    let to_delete = existing
        .iter()
        .filter(|s| !seen.contains(s.package_name.as_str()))
        .map(|s| s.package_name.clone())
        .collect();

    Ok(ActionPlan {
        to_deploy,
        to_delete,
    })
}

/// Parses the declarative ensure-file format: one `<name> <version>` per
/// line, blank lines and `#` comments ignored.
pub fn parse_desired_state(text: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let (name, version) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(name), Some(version), None) => (name, version),
            _ => {
                return Err(DepotError::Validation(format!(
                    "Expected '<package> <version>' on line {}: '{}'",
                    lineno + 1,
                    line
                )))
            }
        };
        validate_package_name(name)?;
        validate_version(version)?;
        out.push((name.to_string(), version.to_string()));
    }
    Ok(out)
}

/// Resolves parsed (name, version) pairs into concrete pins. Versions
/// that are already instance IDs resolve locally inside the client.
pub async fn resolve_desired<R: RemoteRepository>(
    remote: &R,
    entries: &[(String, String)],
) -> Result<Vec<Pin>> {
    let mut pins = Vec::with_capacity(entries.len());
    for (name, version) in entries {
        pins.push(remote.resolve_version(name, version).await?);
    }
    Ok(pins)
}

/// Makes the site root match `desired`: removals first, then installs.
///
/// Failures are isolated per package; the remaining work still runs and
/// the call fails with an aggregate listing every package that could not
/// be updated. When the plan is empty nothing is touched at all.
pub async fn ensure_packages<F: InstanceFetcher>(
    root: &Path,
    desired: &[Pin],
    fetcher: &F,
) -> Result<Vec<PackageState>> {
    for pin in desired {
        validate_package_name(&pin.package_name)?;
        validate_instance_id(&pin.instance_id)?;
    }

    let deployer = Deployer::new(root);
    let existing = deployer.find_deployed()?;
    let plan = plan_actions(desired, &existing)?;
    if plan.is_empty() {
        info!("Already up to date: {} package(s)", desired.len());
        return Ok(existing);
    }
    info!(
        "Ensure: {} to deploy, {} to delete",
        plan.to_deploy.len(),
        plan.to_delete.len()
    );
    if !plan.to_deploy.is_empty() {
        fs::create_dir_all(root)?;
    }

    let mut failures = Vec::new();
    for name in &plan.to_delete {
        if let Err(e) = deployer.remove_deployed(name) {
            error!("Failed to remove {}: {}", name, e);
            failures.push(PackageFailure {
                package: name.clone(),
                error: e.to_string(),
            });
        }
    }
    for pin in &plan.to_deploy {
        if let Err(e) = fetch_and_deploy(&deployer, fetcher, pin).await {
            error!("Failed to deploy {}: {}", pin, e);
            failures.push(PackageFailure {
                package: pin.package_name.clone(),
                error: e.to_string(),
            });
        }
    }

    if failures.is_empty() {
        deployer.find_deployed()
    } else {
        Err(DepotError::Ensure(failures))
    }
}

/// Downloads one pinned instance into a staging file, verifies its hash
/// while opening it, and deploys it.
pub async fn fetch_and_deploy<F: InstanceFetcher>(
    deployer: &Deployer,
    fetcher: &F,
    pin: &Pin,
) -> Result<PackageState> {
    let mut staged = deployer.temp_file()?;
    fetcher.fetch(pin, &mut staged).await?;

    let mut instance = PackageInstance::open(staged, Some(&pin.instance_id))?;
    if instance.pin().package_name != pin.package_name {
        return Err(DepotError::Corruption(format!(
            "Fetched archive is for '{}', expected '{}'",
            instance.pin().package_name,
            pin.package_name
        )));
    }
    deployer.deploy_instance(&mut instance)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{Cursor, Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use super::*;
    use crate::archive::{build_package, FileSource, FileSpec};
    use crate::SITE_SERVICE_DIR;

    fn state(name: &str, id: &str) -> PackageState {
        PackageState {
            package_name: name.to_string(),
            instance_id: id.to_string(),
        }
    }

    #[test]
    fn plan_deploys_missing_packages() {
        let id1 = "1".repeat(40);
        let plan = plan_actions(&[Pin::new("pkg/a", &id1)], &[]).unwrap();
        assert_eq!(plan.to_deploy, vec![Pin::new("pkg/a", &id1)]);
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn plan_is_empty_when_in_sync() {
        let id1 = "1".repeat(40);
        let plan = plan_actions(&[Pin::new("pkg/a", &id1)], &[state("pkg/a", &id1)]).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn plan_replaces_and_deletes() {
        let (id1, id2) = ("1".repeat(40), "2".repeat(40));
        let plan = plan_actions(&[Pin::new("pkg/b", &id2)], &[state("pkg/a", &id1)]).unwrap();
        assert_eq!(plan.to_deploy, vec![Pin::new("pkg/b", &id2)]);
        assert_eq!(plan.to_delete, vec!["pkg/a".to_string()]);

        // Same name, new instance: deploy, no delete.
        let plan = plan_actions(&[Pin::new("pkg/a", &id2)], &[state("pkg/a", &id1)]).unwrap();
        assert_eq!(plan.to_deploy, vec![Pin::new("pkg/a", &id2)]);
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn plan_rejects_duplicate_names() {
        let (id1, id2) = ("1".repeat(40), "2".repeat(40));
        let err = plan_actions(
            &[Pin::new("pkg/a", &id1), Pin::new("pkg/a", &id2)],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, DepotError::DuplicatePackage(name) if name == "pkg/a"));
    }

    #[test]
    fn parses_the_ensure_file_format() {
        let text = "
            # comment
            pkg/a latest

            pkg/b  0123456789012345678901234567890123456789
        ";
        let entries = parse_desired_state(text).unwrap();
        assert_eq!(
            entries,
            vec![
                ("pkg/a".to_string(), "latest".to_string()),
                (
                    "pkg/b".to_string(),
                    "0123456789012345678901234567890123456789".to_string()
                ),
            ]
        );

        assert!(parse_desired_state("pkg/a").is_err());
        assert!(parse_desired_state("pkg/a one two").is_err());
        assert!(parse_desired_state("BAD latest").is_err());
    }

    // Serves archives from memory; unknown pins yield garbage bytes.
    struct MapFetcher {
        archives: HashMap<Pin, Vec<u8>>,
    }

    impl InstanceFetcher for MapFetcher {
        async fn fetch<W: Write + Seek>(&self, pin: &Pin, sink: &mut W) -> Result<()> {
            let bytes = self
                .archives
                .get(pin)
                .cloned()
                .unwrap_or_else(|| b"damaged download".to_vec());
            sink.seek(SeekFrom::Start(0))?;
            sink.write_all(&bytes)?;
            Ok(())
        }
    }

    fn archive_of(name: &str, files: &[FileSpec]) -> (Pin, Vec<u8>) {
        let mut out = Cursor::new(Vec::new());
        build_package(name, files, &mut out).unwrap();
        let bytes = out.into_inner();
        let instance = PackageInstance::open(Cursor::new(bytes.clone()), None).unwrap();
        (instance.pin().clone(), bytes)
    }

    fn mem(name: &str, bytes: &[u8]) -> FileSpec {
        FileSpec::regular(name, FileSource::Memory(bytes.to_vec()))
    }

    #[tokio::test]
    async fn ensure_installs_updates_and_removes() {
        let tmp = TempDir::new().unwrap();
        let (pin_a, bytes_a) = archive_of("pkg/a", &[mem("a", b"1")]);
        let (pin_b, bytes_b) = archive_of("pkg/b", &[mem("b", b"2")]);
        let fetcher = MapFetcher {
            archives: HashMap::from([(pin_a.clone(), bytes_a), (pin_b.clone(), bytes_b)]),
        };

        let deployed = ensure_packages(tmp.path(), &[pin_a.clone()], &fetcher)
            .await
            .unwrap();
        assert_eq!(deployed.len(), 1);
        assert!(tmp.path().join("a").exists());

        // Second call with the same desired set is a no-op.
        ensure_packages(tmp.path(), &[pin_a.clone()], &fetcher)
            .await
            .unwrap();

        // Switch to pkg/b: pkg/a is removed, pkg/b installed.
        let deployed = ensure_packages(tmp.path(), &[pin_b.clone()], &fetcher)
            .await
            .unwrap();
        assert_eq!(deployed.len(), 1);
        assert_eq!(deployed[0].package_name, "pkg/b");
        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().join("b").exists());
    }

    #[tokio::test]
    async fn ensure_rejects_duplicates_before_touching_anything() {
        let tmp = TempDir::new().unwrap();
        let fetcher = MapFetcher {
            archives: HashMap::new(),
        };
        let (id1, id2) = ("1".repeat(40), "2".repeat(40));
        let err = ensure_packages(
            tmp.path(),
            &[Pin::new("pkg/a", id1), Pin::new("pkg/a", id2)],
            &fetcher,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DepotError::DuplicatePackage(_)), "{err}");
        assert!(!tmp.path().join(SITE_SERVICE_DIR).exists());
    }

    #[tokio::test]
    async fn ensure_isolates_per_package_failures() {
        let tmp = TempDir::new().unwrap();
        let (pin_a, bytes_a) = archive_of("pkg/a", &[mem("a", b"1")]);
        // pkg/bad is desired, but the fetcher serves garbage for it.
        let pin_bad = Pin::new("pkg/bad", "f".repeat(40));
        let fetcher = MapFetcher {
            archives: HashMap::from([(pin_a.clone(), bytes_a)]),
        };

        let err = ensure_packages(tmp.path(), &[pin_a.clone(), pin_bad], &fetcher)
            .await
            .unwrap_err();
        match err {
            DepotError::Ensure(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].package, "pkg/bad");
            }
            other => panic!("expected an aggregate error, got {other}"),
        }

        // pkg/a went in regardless.
        let deployer = Deployer::new(tmp.path());
        let found = deployer.find_deployed().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].package_name, "pkg/a");
        assert!(tmp.path().join("a").exists());
    }
}
