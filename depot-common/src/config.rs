// depot-common/src/config.rs
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use super::error::Result;

/// Default backend to talk to when DEPOT_SERVICE_URL is not set.
pub const DEFAULT_SERVICE_URL: &str = "https://packages.depot-tools.dev";

/// Client configuration.
///
/// The retry/backoff/chunking constants live here rather than being
/// hardcoded at call sites: they are tunables, and tests shrink them to
/// keep retry loops fast.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root URL of the repository service.
    pub service_url: String,
    /// Bearer token for authenticated RPC calls, if any.
    pub auth_token: Option<String>,
    /// Default site root for deploy/ensure commands.
    pub site_root: Option<PathBuf>,

    /// How many times to attempt one RPC call before giving up.
    pub rpc_attempts: u32,
    /// Fixed delay between RPC attempts.
    pub rpc_retry_delay: Duration,

    /// Size of one chunk of a resumable upload.
    pub upload_chunk_size: u64,
    /// Transient-error budget for one resumable upload.
    pub upload_attempts: u32,
    /// Whole-request retry budget for downloads.
    pub download_attempts: u32,

    /// Total wall-clock budget for finalize-upload polling.
    pub finalization_timeout: Duration,
    /// Initial delay between finalize polls.
    pub finalize_poll_delay: Duration,
    /// Linear growth step of the finalize poll delay.
    pub finalize_poll_step: Duration,
    /// Upper bound of the finalize poll delay.
    pub finalize_poll_cap: Duration,

    /// How long to wait for a fresh instance to start accepting tags.
    pub tag_attach_timeout: Duration,
    /// Delay between tag-attach retries while the instance is processed.
    pub tag_attach_poll_delay: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading depot configuration");

        let service_url = env::var("DEPOT_SERVICE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string());
        let auth_token = env::var("DEPOT_AUTH_TOKEN").ok().filter(|s| !s.is_empty());
        let site_root = env::var("DEPOT_ROOT")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        debug!("Effective service URL: {}", service_url);

        Ok(Self {
            service_url,
            auth_token,
            site_root,
            ..Self::defaults()
        })
    }

    /// Built-in tuning constants, without touching the environment.
    pub fn defaults() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            auth_token: None,
            site_root: None,
            rpc_attempts: 10,
            rpc_retry_delay: Duration::from_secs(2),
            upload_chunk_size: 8 * 1024 * 1024,
            upload_attempts: 10,
            download_attempts: 5,
            finalization_timeout: Duration::from_secs(60),
            finalize_poll_delay: Duration::from_millis(500),
            finalize_poll_step: Duration::from_millis(500),
            finalize_poll_cap: Duration::from_secs(4),
            tag_attach_timeout: Duration::from_secs(60),
            tag_attach_poll_delay: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}
