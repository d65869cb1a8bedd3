// depot-common/src/lib.rs
pub mod config;
pub mod error;
pub mod model;
pub mod validation;

pub use config::Config;
pub use error::{DepotError, Result};
pub use model::{AclAction, AclChange, Manifest, PackageAcl, PackageState, Pin, UploadSession};
