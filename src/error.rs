//! Merge error type.
//!
//! Every variant says what went wrong and, where the operator can act on it,
//! how to fix it. A failed merge never leaves the repository in a state the
//! next run cannot settle: before publish nothing was written, and after
//! publish the merge marker lets the next run finish cleanup.

use std::fmt;

use hubstage_store::StoreError;

use crate::dataset::DatasetError;
use crate::lease::LeaseError;
use crate::merge_state::MergeStateError;
use crate::record::CodecError;

// ---------------------------------------------------------------------------
// MergeError
// ---------------------------------------------------------------------------

/// Why a merge run stopped.
#[derive(Debug)]
pub enum MergeError {
    /// A remote call failed before anything was published.
    Store {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        source: StoreError,
    },

    /// The main dataset could not be loaded.
    Dataset(DatasetError),

    /// A staging entry is not valid JSONL and the policy is to abort.
    MalformedRecord {
        /// The staging path.
        path: String,
        /// What the decoder rejected.
        source: CodecError,
    },

    /// The merge marker could not be read or written.
    MergeState(MergeStateError),

    /// The lease could not be taken or was lost mid-run.
    Lease(LeaseError),

    /// The publish commit failed. Whether it landed is not known when the
    /// failure was a timeout or a server error.
    PublishFailed {
        /// Run that was being published.
        merge_id: String,
        /// Underlying error.
        source: StoreError,
    },

    /// A publish path lies in the staging directory, so cleanup would
    /// delete published data.
    StagingOverlap {
        /// The offending path.
        path: String,
    },

    /// The snapshot was published but deleting the consumed entries failed.
    CleanupFailed {
        /// Run whose cleanup is pending.
        merge_id: String,
        /// Underlying error.
        source: StoreError,
    },

    /// A failpoint fired.
    Injected(String),
}

impl MergeError {
    /// Returns `true` when the failure is an authorization problem.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Store { source, .. }
            | Self::PublishFailed { source, .. }
            | Self::CleanupFailed { source, .. } => source.is_unauthorized(),
            Self::Dataset(DatasetError::Store { source, .. })
            | Self::Lease(LeaseError::Store(source))
            | Self::MergeState(MergeStateError::Store(source)) => source.is_unauthorized(),
            _ => false,
        }
    }

    pub(crate) fn store(context: impl Into<String>) -> impl FnOnce(StoreError) -> Self {
        let context = context.into();
        move |source| Self::Store { context, source }
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store { context, source } if source.is_unauthorized() => write!(
                f,
                "{context} failed: {source}\n  To fix: check that the token in the configured env var (repo.token_env) has write access to the repository."
            ),
            Self::Store { context, source } => write!(
                f,
                "{context} failed: {source}\n  Nothing was published; rerun the merge once the repository is reachable."
            ),
            Self::Dataset(e) => write!(f, "could not load main dataset: {e}"),
            Self::MalformedRecord { path, source } => write!(
                f,
                "staging entry '{path}' is malformed ({source}).\n  To fix: repair or delete '{path}', or set merge.on_malformed = \"skip\" to merge around it."
            ),
            Self::MergeState(e) => write!(f, "{e}"),
            Self::Lease(e) => write!(f, "{e}"),
            Self::PublishFailed { merge_id, source } if source.is_unauthorized() => write!(
                f,
                "publishing merge {merge_id} failed: {source}\n  Nothing was published.\n  To fix: check that the token in the configured env var (repo.token_env) has write access to the repository."
            ),
            Self::PublishFailed {
                merge_id,
                source: source @ StoreError::TooLarge { .. },
            } => write!(
                f,
                "publishing merge {merge_id} failed: {source}\n  Nothing was published.\n  To fix: lower dataset.max_shard_bytes so every shard fits."
            ),
            Self::PublishFailed { merge_id, source } if source.is_transient() => write!(
                f,
                "publishing merge {merge_id} failed: {source}\n  The publish may or may not have landed. Rerun the merge; it reconciles against the merge marker and never merges an entry twice."
            ),
            Self::PublishFailed { merge_id, source } => write!(
                f,
                "publishing merge {merge_id} was rejected: {source}\n  Nothing was published; staging entries are untouched."
            ),
            Self::StagingOverlap { path } => write!(
                f,
                "refusing to publish '{path}': it is inside the staging directory and cleanup would delete it.\n  To fix: move dataset.shard_prefix and the merge marker outside staging.dir."
            ),
            Self::CleanupFailed { merge_id, source } => write!(
                f,
                "merge {merge_id} was published but its staging entries could not be deleted: {source}\n  To fix: rerun the merge; it finishes the cleanup without merging those entries again."
            ),
            Self::Injected(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store { source, .. }
            | Self::PublishFailed { source, .. }
            | Self::CleanupFailed { source, .. } => Some(source),
            Self::Dataset(e) => Some(e),
            Self::MalformedRecord { source, .. } => Some(source),
            Self::MergeState(e) => Some(e),
            Self::Lease(e) => Some(e),
            Self::StagingOverlap { .. } | Self::Injected(_) => None,
        }
    }
}

impl From<DatasetError> for MergeError {
    fn from(e: DatasetError) -> Self {
        Self::Dataset(e)
    }
}

impl From<MergeStateError> for MergeError {
    fn from(e: MergeStateError) -> Self {
        Self::MergeState(e)
    }
}

impl From<LeaseError> for MergeError {
    fn from(e: LeaseError) -> Self {
        Self::Lease(e)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
