//! Value types shared between the [`RemoteRepo`](crate::RemoteRepo) trait and
//! its callers. They carry no HTTP client types; the backend is an
//! implementation detail.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CommitOperation
// ---------------------------------------------------------------------------

/// A single file change inside an atomic commit.
#[derive(Clone, PartialEq, Eq)]
pub enum CommitOperation {
    /// Create or overwrite `path` with `content`.
    Add {
        /// Repository-relative path.
        path: String,
        /// Full file content.
        content: Vec<u8>,
    },
    /// Remove `path`.
    Delete {
        /// Repository-relative path.
        path: String,
    },
}

impl CommitOperation {
    /// Build an [`Add`](Self::Add) operation.
    pub fn add(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::Add {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Build a [`Delete`](Self::Delete) operation.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::Delete { path: path.into() }
    }

    /// The path this operation touches.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Delete { path } => path,
        }
    }
}

impl fmt::Debug for CommitOperation {
    // File contents can be megabytes of shard data; log sizes only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add { path, content } => f
                .debug_struct("Add")
                .field("path", path)
                .field("bytes", &content.len())
                .finish(),
            Self::Delete { path } => f.debug_struct("Delete").field("path", path).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// CommitInfo
// ---------------------------------------------------------------------------

/// One entry of the repository's immutable history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Revision identifier of the commit.
    pub id: String,
    /// Commit summary line.
    pub message: String,
    /// Commit time, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Optional features a backend advertises.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `list_commits` is implemented.
    pub history: bool,
}

// ---------------------------------------------------------------------------
// RepoType
// ---------------------------------------------------------------------------

/// Kind of Hub repository.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    /// A dataset repository.
    #[default]
    Dataset,
    /// A model repository.
    Model,
    /// A Space.
    Space,
}

impl RepoType {
    /// Path segment used by the `/api/...` routes.
    #[must_use]
    pub const fn api_segment(self) -> &'static str {
        match self {
            Self::Dataset => "datasets",
            Self::Model => "models",
            Self::Space => "spaces",
        }
    }

    /// Leading path segment for `resolve` URLs (models have none).
    #[must_use]
    pub const fn resolve_prefix(self) -> Option<&'static str> {
        match self {
            Self::Dataset => Some("datasets"),
            Self::Model => None,
            Self::Space => Some("spaces"),
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dataset => write!(f, "dataset"),
            Self::Model => write!(f, "model"),
            Self::Space => write!(f, "space"),
        }
    }
}

impl FromStr for RepoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataset" => Ok(Self::Dataset),
            "model" => Ok(Self::Model),
            "space" => Ok(Self::Space),
            other => Err(format!(
                "unknown repo type '{other}' (expected dataset, model, or space)"
            )),
        }
    }
}
