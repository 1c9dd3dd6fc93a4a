//! Submission writer: one staging entry per submission.
//!
//! Writers never touch the main dataset. Each submission is committed as its
//! own file so concurrent writers never rewrite each other's content.

use std::fmt;

use hubstage_store::{CommitInfo, CommitOperation, RemoteRepo, StoreError};
use rand::Rng;
use tracing::info;

use crate::config::StagingConfig;
use crate::record::{self, Record};
use crate::staging;
use crate::timestamp::BasicTimestamp;

/// Status tag written on every staged record.
pub const PENDING_STATUS: &str = "pending";

/// Result of a successful submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    /// Path of the new staging entry.
    pub path: String,
    /// The staged record.
    pub record: Record,
    /// The commit that created it.
    pub commit: CommitInfo,
}

/// Submission failures.
#[derive(Debug)]
pub enum SubmitError {
    /// The text was empty after trimming.
    Empty,
    /// The commit failed.
    Store(StoreError),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "refusing to stage an empty submission"),
            Self::Store(e) => write!(f, "could not stage submission: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Empty => None,
        }
    }
}

/// 8 lowercase hex characters.
#[must_use]
pub fn random_disambiguator() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}

/// Stage `text` as a new entry submitted at `now`.
///
/// # Errors
/// [`SubmitError::Empty`] for blank text, [`SubmitError::Store`] when the
/// commit fails.
pub fn submit(
    repo: &dyn RemoteRepo,
    config: &StagingConfig,
    text: &str,
    now: BasicTimestamp,
) -> Result<Submission, SubmitError> {
    let story = text.trim();
    if story.is_empty() {
        return Err(SubmitError::Empty);
    }

    let record = Record {
        story: story.to_owned(),
        timestamp_utc: now,
        status: Some(PENDING_STATUS.to_owned()),
    };
    let path = staging::entry_path(config, now, Some(&random_disambiguator()));
    let content = record::encode(std::slice::from_ref(&record));

    let commit = repo
        .commit(
            &[CommitOperation::add(path.clone(), content)],
            &format!("Add pending submission {now}"),
            None,
        )
        .map_err(SubmitError::Store)?;
    info!(path = %path, commit = %commit.id, "staged submission");

    Ok(Submission {
        path,
        record,
        commit,
    })
}
