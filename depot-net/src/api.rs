// depot-net/src/api.rs
//
// Thin RPC facade over the retry primitive. Endpoint responses come back
// with open-ended status strings; they are mapped into closed Rust types
// here, with an explicit error for statuses this client does not know.

use depot_common::config::Config;
use depot_common::error::{DepotError, Result};
use depot_common::model::{AclChange, PackageAcl, Pin, UploadSession};
use depot_common::validation::{
    is_instance_id, validate_instance_id, validate_instance_tag, validate_package_name,
    validate_version,
};
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::call_json;

/// Outcome of `register_instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResult {
    /// Set when the backend wants the package file uploaded first.
    pub upload_session: Option<UploadSession>,
    pub already_registered: bool,
    pub registered_by: String,
    pub registered_ts: String,
}

/// Where to download a package instance from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchInfo {
    pub fetch_url: String,
}

/// Capability the repository service presents to the rest of the client.
///
/// Constructor-injected wherever it is consumed, so tests swap in mock
/// implementations instead of patching globals.
#[allow(async_fn_in_trait)]
pub trait RemoteRepository {
    /// Resolves a version (instance ID, tag or ref) into a concrete Pin.
    /// Versions that already look like instance IDs skip the backend.
    async fn resolve_version(&self, package_name: &str, version: &str) -> Result<Pin>;

    /// Registers an instance, possibly asking for an upload first.
    async fn register_instance(&self, pin: &Pin) -> Result<RegisterResult>;

    /// Opens an upload session for the given content hash. `None` means
    /// the content is already in the storage (nothing to upload).
    async fn initiate_upload(&self, hash: &str) -> Result<Option<UploadSession>>;

    /// Polls the finalization state of an upload session. `true` means
    /// the content is published; `false` means it is still processing.
    async fn finalize_upload(&self, session_id: &str) -> Result<bool>;

    /// Attaches tags to a registered instance. `false` means the backend
    /// has not finished processing the instance yet; retry later.
    async fn attach_tags(&self, pin: &Pin, tags: &[String]) -> Result<bool>;

    /// Returns a signed URL the instance file can be fetched from.
    async fn fetch_instance(&self, pin: &Pin) -> Result<FetchInfo>;

    /// Returns ACLs defined for a package path and its parents.
    async fn fetch_acl(&self, package_path: &str) -> Result<Vec<PackageAcl>>;

    /// Applies a set of ACL mutations to a package path.
    async fn modify_acl(&self, package_path: &str, changes: &[AclChange]) -> Result<()>;
}

/// Real repository client talking JSON over HTTP(S).
#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: Client,
    service_url: Url,
    config: Config,
}

impl RemoteClient {
    pub fn new(config: &Config) -> Result<Self> {
        let service_url = Url::parse(&config.service_url)
            .map_err(|e| DepotError::Config(format!("Invalid service URL: {e}")))?;
        Ok(Self {
            client: Client::new(),
            service_url,
            config: config.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.service_url
            .join(path)
            .map_err(|e| DepotError::Config(format!("Cannot build endpoint URL: {e}")))
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        call_json::<(), T>(
            &self.client,
            Method::GET,
            url,
            self.config.auth_token.as_deref(),
            None,
            &self.config,
        )
        .await
    }

    async fn post<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T> {
        call_json(
            &self.client,
            Method::POST,
            url,
            self.config.auth_token.as_deref(),
            Some(body),
            &self.config,
        )
        .await
    }
}

impl RemoteRepository for RemoteClient {
    async fn resolve_version(&self, package_name: &str, version: &str) -> Result<Pin> {
        validate_package_name(package_name)?;
        // Already an instance ID? Don't bother calling the backend.
        if is_instance_id(version) {
            return Ok(Pin::new(package_name, version));
        }
        validate_version(version)?;

        debug!("Resolving version '{}' of '{}'", version, package_name);
        let mut url = self.endpoint("api/repo/v1/instance/resolve")?;
        url.query_pairs_mut()
            .append_pair("package_name", package_name)
            .append_pair("version", version);
        let resp: ResolveResponse = self.get(url).await?;
        parse_resolve(package_name, resp)
    }

    async fn register_instance(&self, pin: &Pin) -> Result<RegisterResult> {
        validate_package_name(&pin.package_name)?;
        validate_instance_id(&pin.instance_id)?;

        let url = self.endpoint("api/repo/v1/instance/register")?;
        let body = InstanceRequest {
            package_name: &pin.package_name,
            instance_id: &pin.instance_id,
        };
        let resp: RegisterResponse = self.post(url, &body).await?;
        parse_register(resp)
    }

    async fn initiate_upload(&self, hash: &str) -> Result<Option<UploadSession>> {
        validate_instance_id(hash)?;
        let url = self.endpoint(&format!("api/cas/v1/upload/SHA1/{hash}"))?;
        let resp: UploadResponse = self.post(url, &()).await?;
        parse_initiate_upload(resp)
    }

    async fn finalize_upload(&self, session_id: &str) -> Result<bool> {
        let url = self.endpoint(&format!("api/cas/v1/finalize/{session_id}"))?;
        let resp: FinalizeResponse = self.post(url, &()).await?;
        parse_finalize_upload(resp)
    }

    async fn attach_tags(&self, pin: &Pin, tags: &[String]) -> Result<bool> {
        validate_package_name(&pin.package_name)?;
        validate_instance_id(&pin.instance_id)?;
        for tag in tags {
            validate_instance_tag(tag)?;
        }

        debug!("Attaching {} tag(s) to {}", tags.len(), pin);
        let url = self.endpoint("api/repo/v1/tags")?;
        let body = AttachTagsRequest {
            package_name: &pin.package_name,
            instance_id: &pin.instance_id,
            tags,
        };
        let resp: AttachTagsResponse = self.post(url, &body).await?;
        parse_attach_tags(resp)
    }

    async fn fetch_instance(&self, pin: &Pin) -> Result<FetchInfo> {
        validate_package_name(&pin.package_name)?;
        validate_instance_id(&pin.instance_id)?;

        let mut url = self.endpoint("api/repo/v1/instance")?;
        url.query_pairs_mut()
            .append_pair("package_name", &pin.package_name)
            .append_pair("instance_id", &pin.instance_id);
        let resp: FetchResponse = self.get(url).await?;
        parse_fetch_instance(resp)
    }

    async fn fetch_acl(&self, package_path: &str) -> Result<Vec<PackageAcl>> {
        validate_package_name(package_path)?;
        let mut url = self.endpoint("api/repo/v1/acl")?;
        url.query_pairs_mut().append_pair("package_path", package_path);
        let resp: FetchAclResponse = self.get(url).await?;
        parse_fetch_acl(resp)
    }

    async fn modify_acl(&self, package_path: &str, changes: &[AclChange]) -> Result<()> {
        validate_package_name(package_path)?;
        let url = self.endpoint("api/repo/v1/acl")?;
        let body = ModifyAclRequest {
            package_path,
            changes,
        };
        let resp: ModifyAclResponse = self.post(url, &body).await?;
        parse_modify_acl(resp)
    }
}

////////////////////////////////////////////////////////////////////////////
// Wire types and status mapping.

#[derive(Serialize)]
struct InstanceRequest<'a> {
    package_name: &'a str,
    instance_id: &'a str,
}

#[derive(Deserialize)]
struct ResolveResponse {
    status: String,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct RegisterResponse {
    status: String,
    #[serde(default)]
    upload_session_id: Option<String>,
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    registered_by: Option<String>,
    #[serde(default)]
    registered_ts: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct UploadResponse {
    status: String,
    #[serde(default)]
    upload_session_id: Option<String>,
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct FinalizeResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Serialize)]
struct AttachTagsRequest<'a> {
    package_name: &'a str,
    instance_id: &'a str,
    tags: &'a [String],
}

#[derive(Deserialize)]
struct AttachTagsResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct FetchResponse {
    status: String,
    #[serde(default)]
    fetch_url: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct FetchAclResponse {
    status: String,
    #[serde(default)]
    acls: Vec<PackageAcl>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Serialize)]
struct ModifyAclRequest<'a> {
    package_path: &'a str,
    changes: &'a [AclChange],
}

#[derive(Deserialize)]
struct ModifyAclResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

fn api_error(message: Option<String>) -> DepotError {
    DepotError::Api(message.unwrap_or_else(|| "Server returned an error".to_string()))
}

fn session_from(id: Option<String>, url: Option<String>) -> Result<UploadSession> {
    match (id, url) {
        (Some(id), Some(url)) if !id.is_empty() && !url.is_empty() => {
            Ok(UploadSession { id, url })
        }
        _ => Err(DepotError::BadUploadSession),
    }
}

fn parse_resolve(package_name: &str, resp: ResolveResponse) -> Result<Pin> {
    match resp.status.as_str() {
        "SUCCESS" => {
            let id = resp
                .instance_id
                .ok_or_else(|| DepotError::Api("Resolve reply lacks instance_id".to_string()))?;
            validate_instance_id(&id)?;
            Ok(Pin::new(package_name, id))
        }
        "PACKAGE_NOT_FOUND" => Err(DepotError::Api(format!(
            "Package '{package_name}' is not registered"
        ))),
        "INSTANCE_NOT_FOUND" => Err(DepotError::Api(format!(
            "No such version of '{package_name}'"
        ))),
        "ERROR" => Err(api_error(resp.error_message)),
        _ => Err(DepotError::UnexpectedStatus {
            call: "resolve_version",
            status: resp.status,
        }),
    }
}

fn parse_register(resp: RegisterResponse) -> Result<RegisterResult> {
    let done = |already| RegisterResult {
        upload_session: None,
        already_registered: already,
        registered_by: resp.registered_by.clone().unwrap_or_default(),
        registered_ts: resp.registered_ts.clone().unwrap_or_default(),
    };
    match resp.status.as_str() {
        "REGISTERED" => Ok(done(false)),
        "ALREADY_REGISTERED" => Ok(done(true)),
        "UPLOAD_FIRST" => Ok(RegisterResult {
            upload_session: Some(session_from(resp.upload_session_id, resp.upload_url)?),
            already_registered: false,
            registered_by: String::new(),
            registered_ts: String::new(),
        }),
        "ERROR" => Err(api_error(resp.error_message)),
        _ => Err(DepotError::UnexpectedStatus {
            call: "register_instance",
            status: resp.status,
        }),
    }
}

fn parse_initiate_upload(resp: UploadResponse) -> Result<Option<UploadSession>> {
    match resp.status.as_str() {
        "SUCCESS" => Ok(Some(session_from(resp.upload_session_id, resp.upload_url)?)),
        "ALREADY_UPLOADED" => Ok(None),
        "ERROR" => Err(api_error(resp.error_message)),
        _ => Err(DepotError::UnexpectedStatus {
            call: "initiate_upload",
            status: resp.status,
        }),
    }
}

fn parse_finalize_upload(resp: FinalizeResponse) -> Result<bool> {
    match resp.status.as_str() {
        "PUBLISHED" => Ok(true),
        "UPLOADING" | "VERIFYING" => Ok(false),
        "MISSING" => Err(DepotError::Api(
            "Upload session is unexpectedly missing".to_string(),
        )),
        "ERROR" => Err(api_error(resp.error_message)),
        _ => Err(DepotError::UnexpectedStatus {
            call: "finalize_upload",
            status: resp.status,
        }),
    }
}

fn parse_attach_tags(resp: AttachTagsResponse) -> Result<bool> {
    match resp.status.as_str() {
        "SUCCESS" => Ok(true),
        "PROCESSING_NOT_FINISHED_YET" => Ok(false),
        "PROCESSING_FAILED" => Err(DepotError::Api(
            "The instance failed server-side processing".to_string(),
        )),
        "ERROR" => Err(api_error(resp.error_message)),
        _ => Err(DepotError::UnexpectedStatus {
            call: "attach_tags",
            status: resp.status,
        }),
    }
}

fn parse_fetch_instance(resp: FetchResponse) -> Result<FetchInfo> {
    match resp.status.as_str() {
        "SUCCESS" => {
            let fetch_url = resp
                .fetch_url
                .ok_or_else(|| DepotError::Api("Fetch reply lacks fetch_url".to_string()))?;
            Ok(FetchInfo { fetch_url })
        }
        "PACKAGE_NOT_FOUND" | "INSTANCE_NOT_FOUND" => Err(DepotError::Api(
            "No such package instance on the backend".to_string(),
        )),
        "ERROR" => Err(api_error(resp.error_message)),
        _ => Err(DepotError::UnexpectedStatus {
            call: "fetch_instance",
            status: resp.status,
        }),
    }
}

fn parse_fetch_acl(resp: FetchAclResponse) -> Result<Vec<PackageAcl>> {
    match resp.status.as_str() {
        "SUCCESS" => Ok(resp.acls),
        "ERROR" => Err(api_error(resp.error_message)),
        _ => Err(DepotError::UnexpectedStatus {
            call: "fetch_acl",
            status: resp.status,
        }),
    }
}

fn parse_modify_acl(resp: ModifyAclResponse) -> Result<()> {
    match resp.status.as_str() {
        "SUCCESS" => Ok(()),
        "ERROR" => Err(api_error(resp.error_message)),
        _ => Err(DepotError::UnexpectedStatus {
            call: "modify_acl",
            status: resp.status,
        }),
    }
}
