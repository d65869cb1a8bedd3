// depot-net/src/transfer.rs
//
// Bulk data movement: resumable chunked uploads to the content-addressed
// storage and whole-file downloads from signed URLs. The storage speaks
// plain HTTP with Content-Range, not the JSON RPC protocol, so it gets
// its own retry handling here instead of going through retry::call_json.

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Instant;

use depot_common::config::Config;
use depot_common::error::{DepotError, Result};
use depot_common::model::{Pin, UploadSession};
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::api::RemoteRepository;

/// Client for the raw storage endpoints (signed upload/download URLs).
#[derive(Debug, Clone)]
pub struct StorageClient {
    client: Client,
    chunk_size: u64,
    upload_attempts: u32,
    download_attempts: u32,
    retry_delay: std::time::Duration,
}

/// Where the storage thinks a resumable upload currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadState {
    Complete,
    At(u64),
}

impl StorageClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            chunk_size: config.upload_chunk_size,
            upload_attempts: config.upload_attempts,
            download_attempts: config.download_attempts,
            retry_delay: config.rpc_retry_delay,
        }
    }

    /// Uploads the whole seekable stream to a resumable upload URL.
    ///
    /// Always asks the storage for the committed offset first, so that a
    /// restarted client resumes instead of re-sending everything. Every
    /// transient failure re-queries the offset; the transient-error budget
    /// is shared between probes and chunk PUTs.
    pub async fn upload<R: Read + Seek>(&self, url: &str, data: &mut R) -> Result<()> {
        let total = data.seek(SeekFrom::End(0))?;
        if total == 0 {
            return Err(DepotError::Validation(
                "Refusing to upload an empty file".to_string(),
            ));
        }
        let mut errors = 0u32;
        let mut offset = match self.query_offset(url, total, &mut errors).await? {
            UploadState::Complete => {
                debug!("Upload to {} is already complete", url);
                return Ok(());
            }
            UploadState::At(n) => n,
        };

        loop {
            let end = (offset + self.chunk_size).min(total);
            data.seek(SeekFrom::Start(offset))?;
            let mut chunk = vec![0u8; (end - offset) as usize];
            data.read_exact(&mut chunk)?;

            debug!("Uploading bytes {}-{} of {}", offset, end - 1, total);
            let result = self
                .client
                .put(url)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end - 1, total))
                .body(chunk)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().as_u16() < 300 => return Ok(()),
                Ok(resp) if resp.status().as_u16() == 308 => {
                    // Chunk accepted, more expected. The Range header tells
                    // us how much the storage has actually committed.
                    let committed = committed_offset(
                        resp.headers().get(RANGE).and_then(|v| v.to_str().ok()),
                    );
                    if committed >= total {
                        return Ok(());
                    }
                    if committed > offset {
                        offset = committed;
                        continue;
                    }
                    // A 308 that commits nothing new means the storage is
                    // stuck; it counts against the budget like any other
                    // transient failure.
                    warn!("Upload chunk got 308 without progress, will resume");
                }
                Ok(resp) if is_fatal(resp.status()) => {
                    return Err(DepotError::Api(format!(
                        "Storage replied {} to the upload",
                        resp.status()
                    )));
                }
                Ok(resp) => {
                    warn!("Upload chunk got {}, will resume", resp.status());
                }
                Err(e) => {
                    warn!("Upload chunk failed ({}), will resume", e);
                }
            }

            errors += 1;
            if errors >= self.upload_attempts {
                return Err(DepotError::UploadFailed(self.upload_attempts));
            }
            tokio::time::sleep(self.retry_delay).await;
            offset = match self.query_offset(url, total, &mut errors).await? {
                UploadState::Complete => return Ok(()),
                UploadState::At(n) => n,
            };
        }
    }

    /// Asks the storage how much of the upload it has committed. The probe
    /// is an empty-body PUT with a starless Content-Range.
    async fn query_offset(
        &self,
        url: &str,
        total: u64,
        errors: &mut u32,
    ) -> Result<UploadState> {
        loop {
            let result = self
                .client
                .put(url)
                .header(CONTENT_RANGE, format!("bytes */{total}"))
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().as_u16() < 300 => return Ok(UploadState::Complete),
                Ok(resp) if resp.status().as_u16() == 308 => {
                    let offset = committed_offset(
                        resp.headers().get(RANGE).and_then(|v| v.to_str().ok()),
                    );
                    return Ok(if offset >= total {
                        UploadState::Complete
                    } else {
                        UploadState::At(offset)
                    });
                }
                Ok(resp) if is_fatal(resp.status()) => {
                    return Err(DepotError::Api(format!(
                        "Storage replied {} to the offset query",
                        resp.status()
                    )));
                }
                Ok(resp) => {
                    warn!("Offset query got {}, retrying", resp.status());
                }
                Err(e) => {
                    warn!("Offset query failed ({}), retrying", e);
                }
            }

            *errors += 1;
            if *errors >= self.upload_attempts {
                return Err(DepotError::UploadFailed(self.upload_attempts));
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Downloads a file from a signed URL into a seekable sink, retrying
    /// the whole request on transient failures. The sink is rewound before
    /// each attempt; content integrity is verified by the caller against
    /// the instance ID, not here.
    pub async fn download<W: Write + Seek>(&self, url: &str, sink: &mut W) -> Result<()> {
        for attempt in 1..=self.download_attempts {
            sink.seek(SeekFrom::Start(0))?;
            debug!("Downloading {} (attempt {})", url, attempt);
            match self.try_download(url, sink).await? {
                Some(bytes) => {
                    debug!("Downloaded {} bytes", bytes);
                    return Ok(());
                }
                None => {
                    if attempt < self.download_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(DepotError::DownloadFailed(self.download_attempts))
    }

    /// One download attempt. `Ok(Some(n))` is success, `Ok(None)` asks the
    /// caller to retry, `Err` is terminal.
    async fn try_download<W: Write>(&self, url: &str, sink: &mut W) -> Result<Option<u64>> {
        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Download request failed ({}), retrying", e);
                return Ok(None);
            }
        };
        let status = resp.status();
        if is_fatal(status) {
            return Err(DepotError::Api(format!(
                "Storage replied {status} to the download"
            )));
        }
        if !status.is_success() {
            warn!("Download got {}, retrying", status);
            return Ok(None);
        }

        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    sink.write_all(&bytes)?;
                    written += bytes.len() as u64;
                }
                Err(e) => {
                    warn!("Download interrupted after {} bytes ({})", written, e);
                    return Ok(None);
                }
            }
        }
        Ok(Some(written))
    }
}

/// 4xx statuses other than 408 are terminal for storage traffic.
fn is_fatal(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT
}

/// Extracts the next upload offset from a "Range: bytes=0-N" header of a
/// 308 reply. N is the last committed byte, so the upload resumes at N+1.
/// A missing or malformed header means nothing is committed yet.
fn committed_offset(range: Option<&str>) -> u64 {
    range
        .and_then(|s| s.strip_prefix("bytes=0-"))
        .and_then(|s| s.parse::<u64>().ok())
        .map(|n| n + 1)
        .unwrap_or(0)
}

/// Makes sure the content with the given SHA-1 hash is published in the
/// content-addressed storage, uploading and finalizing it if necessary.
///
/// `session` is an upload session already handed out by the backend (for
/// example inside a register reply); when absent, one is requested. A
/// `None` reply to that request means the content is already there.
pub async fn upload_to_cas<R, D>(
    remote: &R,
    storage: &StorageClient,
    hash: &str,
    data: &mut D,
    session: Option<UploadSession>,
    config: &Config,
) -> Result<()>
where
    R: RemoteRepository,
    D: Read + Seek,
{
    let session = match session {
        Some(session) => session,
        None => match remote.initiate_upload(hash).await? {
            Some(session) => session,
            None => {
                debug!("Content {} is already uploaded", hash);
                return Ok(());
            }
        },
    };

    storage.upload(&session.url, data).await?;

    // The storage verifies the hash asynchronously. Poll with a linearly
    // growing delay until it publishes the content or the budget runs out.
    info!("Waiting for the storage to verify and publish the content");
    let started = Instant::now();
    let mut delay = config.finalize_poll_delay;
    loop {
        if remote.finalize_upload(&session.id).await? {
            return Ok(());
        }
        if started.elapsed() > config.finalization_timeout {
            return Err(DepotError::FinalizationTimeout);
        }
        tokio::time::sleep(delay).await;
        delay = (delay + config.finalize_poll_step).min(config.finalize_poll_cap);
    }
}

/// Registers a package instance, uploading its file first when the backend
/// asks for it. Returns the final registration outcome.
pub async fn register_instance<R, D>(
    remote: &R,
    storage: &StorageClient,
    pin: &Pin,
    data: &mut D,
    config: &Config,
) -> Result<crate::api::RegisterResult>
where
    R: RemoteRepository,
    D: Read + Seek,
{
    let result = remote.register_instance(pin).await?;
    let session = match result.upload_session {
        None => return Ok(result),
        Some(session) => session,
    };

    info!("Uploading {} to the storage", pin);
    upload_to_cas(remote, storage, &pin.instance_id, data, Some(session), config).await?;

    let result = remote.register_instance(pin).await?;
    if result.upload_session.is_some() {
        // The content is verifiably there. Being asked again is a server
        // side bug, not something more uploading can fix.
        return Err(DepotError::BadUpload);
    }
    Ok(result)
}

/// Attaches tags to a registered instance, waiting out the backend-side
/// processing window. A freshly uploaded instance may refuse tags until
/// the backend has finished examining it.
pub async fn attach_tags_when_ready<R>(
    remote: &R,
    pin: &Pin,
    tags: &[String],
    config: &Config,
) -> Result<()>
where
    R: RemoteRepository,
{
    if tags.is_empty() {
        return Ok(());
    }
    let started = Instant::now();
    loop {
        if remote.attach_tags(pin, tags).await? {
            info!("Attached {} tag(s) to {}", tags.len(), pin);
            return Ok(());
        }
        if started.elapsed() > config.tag_attach_timeout {
            return Err(DepotError::TagAttachTimeout);
        }
        debug!("{} is still being processed, will attach tags later", pin);
        tokio::time::sleep(config.tag_attach_poll_delay).await;
    }
}

/// Downloads the package file of the pinned instance into the sink.
pub async fn fetch_instance<R, W>(
    remote: &R,
    storage: &StorageClient,
    pin: &Pin,
    sink: &mut W,
) -> Result<()>
where
    R: RemoteRepository,
    W: Write + Seek,
{
    debug!("Fetching {}", pin);
    let info = remote.fetch_instance(pin).await?;
    storage.download(&info.fetch_url, sink).await
}

/// How the ensure engine obtains package files. Injected so that its
/// reconciliation logic can be tested without a repository service.
#[allow(async_fn_in_trait)]
pub trait InstanceFetcher {
    async fn fetch<W: Write + Seek>(&self, pin: &Pin, sink: &mut W) -> Result<()>;
}

/// The production fetcher: resolve the fetch URL, download from storage.
pub struct RemoteFetcher<'a, R: RemoteRepository> {
    pub remote: &'a R,
    pub storage: &'a StorageClient,
}

impl<R: RemoteRepository> InstanceFetcher for RemoteFetcher<'_, R> {
    async fn fetch<W: Write + Seek>(&self, pin: &Pin, sink: &mut W) -> Result<()> {
        fetch_instance(self.remote, self.storage, pin, sink).await
    }
}
