//! hubstage configuration (`hubstage.toml`).
//!
//! Every section and field is optional. A missing file yields all defaults;
//! only `repo.id` has to be set before anything can talk to the Hub.
//!
//! ```toml
//! [repo]
//! id = "org/stories"
//! type = "dataset"
//! revision = "main"
//! token_env = "HF_TOKEN"
//!
//! [merge]
//! on_malformed = "skip"
//! lease_ttl_secs = 900
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hubstage_store::{DEFAULT_ENDPOINT, HubConfig, RepoType, RetryPolicy};
use serde::Deserialize;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "hubstage.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubstageConfig {
    /// Which remote repository to operate on.
    #[serde(default)]
    pub repo: RepoConfig,

    /// Staging namespace layout.
    #[serde(default)]
    pub staging: StagingConfig,

    /// Main dataset layout.
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Merge behaviour.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Status resolution.
    #[serde(default)]
    pub status: StatusConfig,

    /// Remote call timeouts and retries.
    #[serde(default)]
    pub remote: RemoteConfig,
}

// ---------------------------------------------------------------------------
// RepoConfig
// ---------------------------------------------------------------------------

/// Remote repository coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// Repository id, e.g. `"org/stories"`. Empty means unset.
    #[serde(default)]
    pub id: String,

    /// Repository kind (default: `dataset`).
    #[serde(default, rename = "type")]
    pub repo_type: RepoType,

    /// Branch or revision merges read from and commit to.
    #[serde(default = "default_revision")]
    pub revision: String,

    /// Hub endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Name of the environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            repo_type: RepoType::default(),
            revision: default_revision(),
            endpoint: default_endpoint(),
            token_env: default_token_env(),
        }
    }
}

fn default_revision() -> String {
    "main".to_owned()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_owned()
}

fn default_token_env() -> String {
    "HF_TOKEN".to_owned()
}

// ---------------------------------------------------------------------------
// StagingConfig
// ---------------------------------------------------------------------------

/// Where submissions are staged.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingConfig {
    /// Staging directory inside the repo (default: `pending`).
    #[serde(default = "default_staging_dir")]
    pub dir: String,

    /// File extension of staging entries, including the dot.
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
            extension: default_extension(),
        }
    }
}

impl StagingConfig {
    /// `<dir>/`, the namespace every staging entry lives under.
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("{}/", self.dir.trim_matches('/'))
    }

    /// Whether `path` lies inside the staging namespace.
    #[must_use]
    pub fn covers(&self, path: &str) -> bool {
        path.trim_start_matches('/').starts_with(&self.namespace())
    }
}

fn default_staging_dir() -> String {
    "pending".to_owned()
}

fn default_extension() -> String {
    ".jsonl".to_owned()
}

// ---------------------------------------------------------------------------
// DatasetConfig
// ---------------------------------------------------------------------------

/// Main dataset shard layout.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// Shard path prefix; shards are `<prefix>-<i>-of-<n>.jsonl`.
    #[serde(default = "default_shard_prefix")]
    pub shard_prefix: String,

    /// Records per shard before a new shard is started.
    #[serde(default = "default_max_records_per_shard")]
    pub max_records_per_shard: usize,

    /// Encoded bytes per shard before a new shard is started. A single
    /// record larger than this still gets a shard of its own.
    #[serde(default = "default_max_shard_bytes")]
    pub max_shard_bytes: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            shard_prefix: default_shard_prefix(),
            max_records_per_shard: default_max_records_per_shard(),
            max_shard_bytes: default_max_shard_bytes(),
        }
    }
}

fn default_shard_prefix() -> String {
    "data/train".to_owned()
}

const fn default_max_records_per_shard() -> usize {
    100_000
}

const fn default_max_shard_bytes() -> usize {
    32 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// Merge behaviour settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// What to do with a staging entry that fails to decode.
    #[serde(default)]
    pub on_malformed: OnMalformed,

    /// Drop batch records whose trimmed text already exists in the dataset.
    #[serde(default)]
    pub dedup: bool,

    /// Seconds before an unreleased lease may be taken over.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Repo path of the merge marker.
    #[serde(default = "default_marker_path")]
    pub marker_path: String,

    /// Repo path of the merge lease.
    #[serde(default = "default_lease_path")]
    pub lease_path: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            on_malformed: OnMalformed::default(),
            dedup: false,
            lease_ttl_secs: default_lease_ttl_secs(),
            marker_path: default_marker_path(),
            lease_path: default_lease_path(),
        }
    }
}

impl MergeConfig {
    /// The lease TTL as a duration.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

const fn default_lease_ttl_secs() -> u64 {
    1800
}

fn default_marker_path() -> String {
    ".hubstage/merge-marker.json".to_owned()
}

fn default_lease_path() -> String {
    ".hubstage/lease.json".to_owned()
}

/// Policy for staging entries that fail to decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnMalformed {
    /// Abort the merge and report the path.
    #[default]
    Abort,
    /// Leave the file in staging, report it, and merge the rest.
    Skip,
}

impl fmt::Display for OnMalformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abort"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

// ---------------------------------------------------------------------------
// StatusConfig
// ---------------------------------------------------------------------------

/// Status resolution settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    /// A merge younger than this many seconds counts as "processing".
    #[serde(default = "default_processing_window_secs")]
    pub processing_window_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            processing_window_secs: default_processing_window_secs(),
        }
    }
}

impl StatusConfig {
    /// The processing window as a duration.
    #[must_use]
    pub const fn processing_window(&self) -> Duration {
        Duration::from_secs(self.processing_window_secs)
    }
}

const fn default_processing_window_secs() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

/// Timeout and retry budget for every remote call.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubled per retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RemoteConfig {
    /// The retry policy these settings describe.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backoff_base_ms() -> u64 {
    500
}

const fn default_backoff_max_ms() -> u64 {
    8_000
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading or applying a configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl HubstageConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields all defaults.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or values that
    /// make no sense (empty staging dir, zero shard size, dataset or merge
    /// files inside the staging directory).
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError {
            path: None,
            message: message.to_owned(),
        };
        if self.staging.dir.trim_matches('/').is_empty() {
            return Err(invalid("staging.dir must not be empty"));
        }
        if self.dataset.max_records_per_shard == 0 {
            return Err(invalid("dataset.max_records_per_shard must be at least 1"));
        }
        if self.dataset.max_shard_bytes == 0 {
            return Err(invalid("dataset.max_shard_bytes must be at least 1"));
        }
        if self.merge.marker_path == self.merge.lease_path {
            return Err(invalid("merge.marker_path and merge.lease_path must differ"));
        }

        // Anything under the staging namespace is consumed and deleted by a
        // merge, so the dataset and the merge bookkeeping must live elsewhere.
        let namespace = self.staging.namespace();
        for (key, path) in [
            ("dataset.shard_prefix", &self.dataset.shard_prefix),
            ("merge.marker_path", &self.merge.marker_path),
            ("merge.lease_path", &self.merge.lease_path),
        ] {
            if self.staging.covers(path) {
                return Err(ConfigError {
                    path: None,
                    message: format!(
                        "{key} = \"{path}\" is inside the staging directory '{namespace}'\n  To fix: move it outside '{namespace}' or change staging.dir"
                    ),
                });
            }
        }
        Ok(())
    }

    /// Build the Hub client configuration, reading the token from the
    /// environment variable named by `repo.token_env`.
    ///
    /// # Errors
    /// Returns `ConfigError` when `repo.id` is unset.
    pub fn hub_config(&self) -> Result<HubConfig, ConfigError> {
        let token = std::env::var(&self.repo.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        self.hub_config_with_token(token)
    }

    /// [`Self::hub_config`] with an explicit token.
    ///
    /// # Errors
    /// Returns `ConfigError` when `repo.id` is unset.
    pub fn hub_config_with_token(&self, token: Option<String>) -> Result<HubConfig, ConfigError> {
        if self.repo.id.trim().is_empty() {
            return Err(ConfigError {
                path: None,
                message: "repo.id is not set\n  To fix: add `[repo]\\nid = \"<org>/<name>\"` to hubstage.toml".to_owned(),
            });
        }
        Ok(HubConfig {
            endpoint: self.repo.endpoint.trim_end_matches('/').to_owned(),
            repo_id: self.repo.id.clone(),
            repo_type: self.repo.repo_type,
            revision: self.repo.revision.clone(),
            token,
            timeout: Duration::from_secs(self.remote.timeout_secs),
            retry: self.remote.retry_policy(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
