use std::sync::Arc;

use thiserror::Error;

/// One entry of the aggregate error returned by the ensure engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFailure {
    pub package: String,
    pub error: String,
}

fn format_failures(failures: &[PackageFailure]) -> String {
    let items: Vec<String> = failures
        .iter()
        .map(|f| format!("{}: {}", f.package, f.error))
        .collect();
    items.join("; ")
}

#[derive(Error, Debug, Clone)]
pub enum DepotError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Archive Error: {0}")]
    Zip(#[from] Arc<zip::result::ZipError>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Invalid package name '{0}'")]
    InvalidPackageName(String),

    #[error("Invalid instance ID '{0}'")]
    InvalidInstanceId(String),

    #[error("Duplicate file in package: {0}")]
    DuplicateFile(String),

    #[error("File is under the reserved package service directory: {0}")]
    ReservedPath(String),

    #[error("Symlink {name} escapes the package root (target '{target}')")]
    EscapingSymlink { name: String, target: String },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("API Error: {0}")]
    Api(String),

    #[error("Unexpected status '{status}' in {call} response")]
    UnexpectedStatus { call: &'static str, status: String },

    #[error("Request to the backend failed after {0} attempts")]
    BackendInaccessible(u32),

    #[error("Failed to upload the package file after {0} attempts")]
    UploadFailed(u32),

    #[error("Failed to download the package file after {0} attempts")]
    DownloadFailed(u32),

    #[error("Timeout while waiting for the storage backend to finalize the upload")]
    FinalizationTimeout,

    #[error("Timeout while waiting for the instance to accept tags")]
    TagAttachTimeout,

    #[error("Package file is uploaded, but the server asks to upload it again")]
    BadUpload,

    #[error("Upload session must have both an ID and an upload URL")]
    BadUploadSession,

    #[error("Another instance ({0}) was deployed concurrently")]
    ConcurrentDeploy(String),

    #[error("Package {0} is listed more than once")]
    DuplicatePackage(String),

    #[error("Deployed state is corrupted: {0}")]
    Corruption(String),

    #[error("Ensure Error: failed to update {} package(s): {}", .0.len(), format_failures(.0))]
    Ensure(Vec<PackageFailure>),
}

impl From<std::io::Error> for DepotError {
    fn from(err: std::io::Error) -> Self {
        DepotError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for DepotError {
    fn from(err: reqwest::Error) -> Self {
        DepotError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for DepotError {
    fn from(err: serde_json::Error) -> Self {
        DepotError::Json(Arc::new(err))
    }
}

impl From<zip::result::ZipError> for DepotError {
    fn from(err: zip::result::ZipError) -> Self {
        DepotError::Zip(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, DepotError>;
