// depot-common/src/model.rs
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version of the package archive format this client produces.
pub const MANIFEST_FORMAT_VERSION: &str = "1";

/// Fully resolved identity of one published package instance.
///
/// The instance ID is the SHA-1 of the archive byte stream. It is derived,
/// never chosen, and is the sole criterion of content equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pin {
    pub package_name: String,
    pub instance_id: String,
}

impl Pin {
    pub fn new(package_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package_name, self.instance_id)
    }
}

/// What is currently installed at a site root for one package name.
///
/// At most one of these exists per package name per site root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageState {
    pub package_name: String,
    pub instance_id: String,
}

impl PackageState {
    pub fn pin(&self) -> Pin {
        Pin::new(self.package_name.clone(), self.instance_id.clone())
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package_name, self.instance_id)
    }
}

/// Package manifest embedded in every archive at a reserved path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: String,
    pub package_name: String,
}

impl Manifest {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION.to_string(),
            package_name: package_name.into(),
        }
    }
}

/// Open content-addressed-storage upload session handed out by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Opaque session identifier.
    pub id: String,
    /// Signed URL to upload the data to.
    pub url: String,
}

/// Per package path, per role access control list. The effective ACL for
/// "a/b/c" is the union of PackageAcls for "a", "a/b" and "a/b/c".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageAcl {
    pub package_path: String,
    pub role: String,
    pub principals: Vec<String>,
    #[serde(default)]
    pub modified_by: String,
    #[serde(default)]
    pub modified_ts: String,
}

/// Flavor of an ACL mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AclAction {
    Grant,
    Revoke,
}

/// One mutation to some package path ACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclChange {
    pub action: AclAction,
    pub role: String,
    pub principal: String,
}
