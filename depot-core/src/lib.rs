// depot-core/src/lib.rs
pub mod archive;
pub mod deploy;
pub mod ensure;
pub mod pkgdef;
pub mod scan;

/// Reserved directory inside every package archive. Holds the manifest;
/// caller-supplied files may not collide with it.
pub const PKG_SERVICE_DIR: &str = ".depotpkg";

/// Reserved directory at the top of every site root. Holds the deployed
/// instances and all bookkeeping; never scanned, never packaged.
pub const SITE_SERVICE_DIR: &str = ".depot";

/// Archive path of the embedded package manifest.
pub const MANIFEST_NAME: &str = ".depotpkg/manifest.json";

pub use archive::{build_package, ArchiveFile, FileSource, FileSpec, PackageInstance};
pub use deploy::Deployer;
pub use ensure::{ensure_packages, parse_desired_state, plan_actions, resolve_desired, ActionPlan};
pub use pkgdef::PackageDef;
pub use scan::scan_dir;
