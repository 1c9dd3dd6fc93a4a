//! [`HubRepo`] — [`RemoteRepo`] over the Hugging Face Hub HTTP API.
//!
//! Routes used (all relative to the configured endpoint):
//!
//! | Method        | Route                                                     |
//! |---------------|-----------------------------------------------------------|
//! | `list_files`  | `GET  /api/{type}s/{repo}/revision/{rev}` → `siblings`    |
//! | `head`        | `GET  /api/{type}s/{repo}/revision/{rev}` → `sha`         |
//! | `download`    | `GET  /{type}s/{repo}/resolve/{rev}/{path}`               |
//! | `commit`      | `POST /api/{type}s/{repo}/preupload/{rev}`                |
//! |               | `POST /{type}s/{repo}.git/info/lfs/objects/batch`         |
//! |               | `POST /api/{type}s/{repo}/commit/{rev}` (NDJSON body)     |
//! | `list_commits`| `GET  /api/{type}s/{repo}/commits/{rev}` (first page)     |
//!
//! A commit first asks the Hub how each added file must travel. Files the
//! Hub routes to LFS (large files, or paths matching the repo's LFS
//! patterns) are uploaded through the LFS batch API and referenced by
//! `sha256` oid in the commit; the rest go inline as base64, up to
//! [`MAX_INLINE_BYTES`].
//!
//! Every call runs under the configured request timeout and goes through
//! [`with_retry`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::repo::RemoteRepo;
use crate::retry::{RetryPolicy, with_retry};
use crate::types::{Capabilities, CommitInfo, CommitOperation, RepoType};

/// Default Hub endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Largest file the commit endpoint accepts inline.
pub const MAX_INLINE_BYTES: usize = 10 * 1024 * 1024;

/// Leading bytes sent to `preupload` so the Hub can sniff binary content.
const PREUPLOAD_SAMPLE_BYTES: usize = 512;

/// Files per `preupload` request.
const PREUPLOAD_BATCH: usize = 256;

const LFS_MEDIA_TYPE: &str = "application/vnd.git-lfs+json";

/// Connection settings for [`HubRepo`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Base URL of the Hub (no trailing path).
    pub endpoint: String,
    /// `namespace/name` of the repository.
    pub repo_id: String,
    /// Repository kind.
    pub repo_type: RepoType,
    /// Branch or revision the protocol works against.
    pub revision: String,
    /// Bearer token. `None` allows read-only access to public repos.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl HubConfig {
    /// Settings for `repo_id` with Hub defaults.
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            repo_id: repo_id.into(),
            repo_type: RepoType::Dataset,
            revision: "main".to_owned(),
            token: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Hub-backed [`RemoteRepo`].
pub struct HubRepo {
    config: HubConfig,
    client: Client,
}

impl HubRepo {
    /// Build a client for `config`.
    ///
    /// # Errors
    /// Returns [`StoreError::Network`] if the HTTP client cannot be built
    /// (e.g. TLS backend initialisation failure).
    pub fn new(config: HubConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("hubstage/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Network {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    /// The settings this client was built with.
    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.config.endpoint).map_err(|e| StoreError::InvalidResponse {
            message: format!("invalid endpoint '{}': {e}", self.config.endpoint),
        })?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| StoreError::InvalidResponse {
                    message: format!("endpoint '{}' cannot be a base URL", self.config.endpoint),
                })?;
            path.pop_if_empty();
            for segment in segments {
                // Repo ids and file paths contain '/', which must stay a separator.
                path.extend(segment.split('/'));
            }
        }
        Ok(url)
    }

    fn api_url(&self, route: &str) -> Result<Url, StoreError> {
        self.url(&[
            "api",
            self.config.repo_type.api_segment(),
            &self.config.repo_id,
            route,
            &self.config.revision,
        ])
    }

    fn resolve_url(&self, path: &str) -> Result<Url, StoreError> {
        let mut segments = Vec::with_capacity(5);
        if let Some(prefix) = self.config.repo_type.resolve_prefix() {
            segments.push(prefix);
        }
        segments.extend([
            self.config.repo_id.as_str(),
            "resolve",
            self.config.revision.as_str(),
            path,
        ]);
        self.url(&segments)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder, resource: &str) -> Result<Response, StoreError> {
        send_request(self.authorized(request), resource)
    }

    fn lfs_batch_url(&self) -> Result<Url, StoreError> {
        let repo = format!("{}.git", self.config.repo_id);
        let mut segments = Vec::with_capacity(3);
        if let Some(prefix) = self.config.repo_type.resolve_prefix() {
            segments.push(prefix);
        }
        segments.extend([repo.as_str(), "info/lfs/objects/batch"]);
        self.url(&segments)
    }

    fn post_json(&self, url: &Url, body: &serde_json::Value, resource: &str) -> Result<String, StoreError> {
        let request = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
        self.send(request, resource)?
            .text()
            .map_err(transport_error)
    }

    /// Paths among `adds` the Hub wants uploaded through LFS.
    fn preupload(&self, adds: &[(&str, &[u8])]) -> Result<BTreeSet<String>, StoreError> {
        let url = self.api_url("preupload")?;
        let mut lfs = BTreeSet::new();
        for batch in adds.chunks(PREUPLOAD_BATCH) {
            let payload = preupload_payload(batch);
            let body = with_retry(&self.config.retry, "preupload", || {
                self.post_json(&url, &payload, &self.config.repo_id)
            })?;
            lfs.extend(parse_preupload(&body)?);
        }
        Ok(lfs)
    }

    /// Upload LFS objects the Hub does not already have.
    fn upload_lfs(&self, files: &[(&str, &[u8])]) -> Result<BTreeMap<String, LfsPointer>, StoreError> {
        let pointers: BTreeMap<String, LfsPointer> = files
            .iter()
            .map(|(path, content)| ((*path).to_owned(), LfsPointer::for_content(content)))
            .collect();
        let contents: BTreeMap<&str, &[u8]> = files
            .iter()
            .map(|(path, content)| (pointers[*path].oid.as_str(), *content))
            .collect();

        let url = self.lfs_batch_url()?;
        let payload = lfs_batch_payload(pointers.values());
        let body = with_retry(&self.config.retry, "lfs_batch", || {
            let request = self
                .client
                .post(url.clone())
                .header(reqwest::header::ACCEPT, LFS_MEDIA_TYPE)
                .header(reqwest::header::CONTENT_TYPE, LFS_MEDIA_TYPE)
                .body(payload.to_string());
            self.send(request, &self.config.repo_id)?
                .text()
                .map_err(transport_error)
        })?;

        for object in parse_lfs_batch(&body)? {
            let Some(upload) = object.upload else {
                debug!(oid = %object.oid, "LFS object already stored");
                continue;
            };
            let content = contents
                .get(object.oid.as_str())
                .copied()
                .ok_or_else(|| StoreError::InvalidResponse {
                    message: format!("LFS batch returned unknown object {}", object.oid),
                })?;
            if upload.header.contains_key("chunk_size") {
                return Err(StoreError::unsupported("multipart LFS upload"));
            }
            with_retry(&self.config.retry, "lfs_upload", || {
                // Pre-signed storage URL: the Hub token must not be sent there.
                let mut request = self.client.put(&upload.href).body(content.to_vec());
                for (name, value) in &upload.header {
                    request = request.header(name.as_str(), value.as_str());
                }
                send_request(request, &object.oid).map(drop)
            })?;
            if let Some(verify) = &object.verify {
                let body = json!({ "oid": object.oid, "size": content.len() });
                with_retry(&self.config.retry, "lfs_verify", || {
                    let mut request = self
                        .client
                        .post(&verify.href)
                        .header(reqwest::header::CONTENT_TYPE, LFS_MEDIA_TYPE)
                        .body(body.to_string());
                    for (name, value) in &verify.header {
                        request = request.header(name.as_str(), value.as_str());
                    }
                    self.send(request, &object.oid).map(drop)
                })?;
            }
            info!(oid = %object.oid, size = content.len(), "uploaded LFS object");
        }
        Ok(pointers)
    }

    fn revision_info(&self) -> Result<RevisionInfo, StoreError> {
        let url = self.api_url("revision")?;
        with_retry(&self.config.retry, "revision_info", || {
            let body = self
                .send(self.client.get(url.clone()), &self.config.repo_id)?
                .text()
                .map_err(transport_error)?;
            parse_revision_info(&body)
        })
    }
}

impl RemoteRepo for HubRepo {
    #[instrument(skip_all, fields(repo = %self.config.repo_id))]
    fn list_files(&self) -> Result<Vec<String>, StoreError> {
        let info = self.revision_info()?;
        debug!(files = info.siblings.len(), "listed repository files");
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    #[instrument(skip_all, fields(repo = %self.config.repo_id, path = %path))]
    fn download(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.resolve_url(path)?;
        with_retry(&self.config.retry, "download", || {
            let bytes = self
                .send(self.client.get(url.clone()), path)?
                .bytes()
                .map_err(transport_error)?;
            Ok(bytes.to_vec())
        })
    }

    fn head(&self) -> Result<String, StoreError> {
        self.revision_info()?
            .sha
            .ok_or_else(|| StoreError::InvalidResponse {
                message: "revision info has no sha".to_owned(),
            })
    }

    #[instrument(skip_all, fields(repo = %self.config.repo_id, ops = operations.len()))]
    fn commit(
        &self,
        operations: &[CommitOperation],
        message: &str,
        parent: Option<&str>,
    ) -> Result<CommitInfo, StoreError> {
        let adds: Vec<(&str, &[u8])> = operations
            .iter()
            .filter_map(|op| match op {
                CommitOperation::Add { path, content } => Some((path.as_str(), content.as_slice())),
                CommitOperation::Delete { .. } => None,
            })
            .collect();
        let lfs_paths = if adds.is_empty() {
            BTreeSet::new()
        } else {
            self.preupload(&adds)?
        };
        let lfs_files: Vec<(&str, &[u8])> = adds
            .iter()
            .copied()
            .filter(|(path, _)| lfs_paths.contains(*path))
            .collect();
        // Fail before uploading anything if an inline file is too big.
        check_inline_sizes(operations, &lfs_paths)?;
        let lfs = if lfs_files.is_empty() {
            BTreeMap::new()
        } else {
            self.upload_lfs(&lfs_files)?
        };

        let url = self.api_url("commit")?;
        let payload = commit_payload(operations, &lfs, message, parent)?;
        with_retry(&self.config.retry, "commit", || {
            let request = self
                .client
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(payload.clone());
            let body = self
                .send(request, &self.config.repo_id)?
                .text()
                .map_err(transport_error)?;
            parse_commit_response(&body, message)
        })
    }

    fn list_commits(&self) -> Result<Vec<CommitInfo>, StoreError> {
        let url = self.api_url("commits")?;
        with_retry(&self.config.retry, "list_commits", || {
            let result = self.send(self.client.get(url.clone()), &self.config.repo_id);
            let response = match result {
                Ok(response) => response,
                Err(
                    StoreError::NotFound { .. }
                    | StoreError::Rejected { status: 405, .. }
                    | StoreError::Server { status: 501, .. },
                ) => {
                    return Err(StoreError::unsupported("commit history"));
                }
                Err(e) => return Err(e),
            };
            let body = response.text().map_err(transport_error)?;
            parse_commit_listing(&body)
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { history: true }
    }
}

fn send_request(request: RequestBuilder, resource: &str) -> Result<Response, StoreError> {
    let response = request.send().map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(StoreError::from_status(
        status.as_u16(),
        resource,
        error_message(&body, status.canonical_reason().unwrap_or("request failed")),
    ))
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

/// How an LFS file is referenced from a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LfsPointer {
    /// Hex `sha256` of the content.
    oid: String,
    size: usize,
}

impl LfsPointer {
    fn for_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self {
            oid: format!("{:x}", hasher.finalize()),
            size: content.len(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PreuploadResponse {
    files: Vec<PreuploadFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreuploadFile {
    path: String,
    upload_mode: String,
}

#[derive(Debug, Deserialize)]
struct LfsBatchResponse {
    objects: Vec<LfsBatchObject>,
}

#[derive(Debug, Deserialize)]
struct LfsBatchObject {
    oid: String,
    #[serde(default)]
    actions: Option<LfsActions>,
    #[serde(default)]
    error: Option<LfsObjectError>,
}

#[derive(Debug, Deserialize)]
struct LfsActions {
    #[serde(default)]
    upload: Option<LfsAction>,
    #[serde(default)]
    verify: Option<LfsAction>,
}

#[derive(Clone, Debug, Deserialize)]
struct LfsAction {
    href: String,
    #[serde(default)]
    header: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LfsObjectError {
    code: u16,
    message: String,
}

/// One object from an LFS batch answer. No `upload` action means the
/// server already has it.
#[derive(Debug)]
struct LfsTransfer {
    oid: String,
    upload: Option<LfsAction>,
    verify: Option<LfsAction>,
}

#[derive(Debug, Deserialize)]
struct RevisionInfo {
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    commit_oid: String,
}

fn parse_revision_info(body: &str) -> Result<RevisionInfo, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::InvalidResponse {
        message: format!("revision info: {e}"),
    })
}

fn parse_commit_listing(body: &str) -> Result<Vec<CommitInfo>, StoreError> {
    let entries: Vec<CommitEntry> =
        serde_json::from_str(body).map_err(|e| StoreError::InvalidResponse {
            message: format!("commit listing: {e}"),
        })?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let message = entry
                .title
                .filter(|t| !t.is_empty())
                .or_else(|| {
                    entry
                        .message
                        .as_deref()
                        .and_then(|m| m.lines().next())
                        .map(str::to_owned)
                })
                .unwrap_or_default();
            let time = entry
                .date
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc));
            CommitInfo {
                id: entry.id,
                message,
                time,
            }
        })
        .collect())
}

fn parse_commit_response(body: &str, message: &str) -> Result<CommitInfo, StoreError> {
    let response: CommitResponse =
        serde_json::from_str(body).map_err(|e| StoreError::InvalidResponse {
            message: format!("commit response: {e}"),
        })?;
    Ok(CommitInfo {
        id: response.commit_oid,
        message: message.to_owned(),
        time: None,
    })
}

fn preupload_payload(files: &[(&str, &[u8])]) -> serde_json::Value {
    let files: Vec<serde_json::Value> = files
        .iter()
        .map(|(path, content)| {
            let sample = &content[..content.len().min(PREUPLOAD_SAMPLE_BYTES)];
            json!({
                "path": path,
                "size": content.len(),
                "sample": base64::engine::general_purpose::STANDARD.encode(sample),
            })
        })
        .collect();
    json!({ "files": files })
}

fn parse_preupload(body: &str) -> Result<BTreeSet<String>, StoreError> {
    let response: PreuploadResponse =
        serde_json::from_str(body).map_err(|e| StoreError::InvalidResponse {
            message: format!("preupload response: {e}"),
        })?;
    Ok(response
        .files
        .into_iter()
        .filter(|f| f.upload_mode == "lfs")
        .map(|f| f.path)
        .collect())
}

fn lfs_batch_payload<'a>(pointers: impl Iterator<Item = &'a LfsPointer>) -> serde_json::Value {
    let objects: Vec<serde_json::Value> = pointers
        .map(|p| json!({ "oid": p.oid, "size": p.size }))
        .collect();
    json!({
        "operation": "upload",
        "transfers": ["basic"],
        "objects": objects,
        "hash_algo": "sha256",
    })
}

fn parse_lfs_batch(body: &str) -> Result<Vec<LfsTransfer>, StoreError> {
    let response: LfsBatchResponse =
        serde_json::from_str(body).map_err(|e| StoreError::InvalidResponse {
            message: format!("LFS batch response: {e}"),
        })?;
    response
        .objects
        .into_iter()
        .map(|object| {
            if let Some(error) = object.error {
                return Err(StoreError::from_status(error.code, &object.oid, error.message));
            }
            let (upload, verify) = object
                .actions
                .map_or((None, None), |actions| (actions.upload, actions.verify));
            Ok(LfsTransfer {
                oid: object.oid,
                upload,
                verify,
            })
        })
        .collect()
}

/// Every added file not bound for LFS must fit inline.
fn check_inline_sizes(
    operations: &[CommitOperation],
    lfs_paths: &BTreeSet<String>,
) -> Result<(), StoreError> {
    for op in operations {
        if let CommitOperation::Add { path, content } = op
            && !lfs_paths.contains(path)
            && content.len() > MAX_INLINE_BYTES
        {
            return Err(StoreError::TooLarge {
                path: path.clone(),
                size: content.len(),
                limit: MAX_INLINE_BYTES,
            });
        }
    }
    Ok(())
}

/// NDJSON commit body: one header line, then one line per operation.
/// Adds listed in `lfs` are referenced by oid; the rest are inlined.
fn commit_payload(
    operations: &[CommitOperation],
    lfs: &BTreeMap<String, LfsPointer>,
    message: &str,
    parent: Option<&str>,
) -> Result<String, StoreError> {
    let lfs_paths: BTreeSet<String> = lfs.keys().cloned().collect();
    check_inline_sizes(operations, &lfs_paths)?;
    let mut header = json!({ "summary": message, "description": "" });
    if let Some(parent) = parent {
        header["parentCommit"] = json!(parent);
    }
    let mut lines = vec![json!({ "key": "header", "value": header })];
    for op in operations {
        lines.push(match op {
            CommitOperation::Add { path, content } => match lfs.get(path) {
                Some(pointer) => json!({
                    "key": "lfsFile",
                    "value": {
                        "path": path,
                        "algo": "sha256",
                        "oid": pointer.oid,
                        "size": pointer.size,
                    },
                }),
                None => json!({
                    "key": "file",
                    "value": {
                        "path": path,
                        "content": base64::engine::general_purpose::STANDARD.encode(content),
                        "encoding": "base64",
                    },
                }),
            },
            CommitOperation::Delete { path } => json!({
                "key": "deletedFile",
                "value": { "path": path },
            }),
        });
    }
    let mut body = String::new();
    for line in lines {
        let encoded = serde_json::to_string(&line).map_err(|e| StoreError::InvalidResponse {
            message: format!("encode commit payload: {e}"),
        })?;
        body.push_str(&encoded);
        body.push('\n');
    }
    Ok(body)
}

/// Pull `error` out of a JSON error body, falling back to the raw text.
fn error_message(body: &str, fallback: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        fallback.to_owned()
    } else {
        trimmed.to_owned()
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout {
            message: err.to_string(),
        }
    } else if err.is_decode() {
        StoreError::InvalidResponse {
            message: err.to_string(),
        }
    } else {
        StoreError::Network {
            message: err.to_string(),
        }
    }
}
