//! Status resolution: what state is the merge pipeline in?
//!
//! The resolver is read-only and never fails. Every remote failure is folded
//! into the returned [`StatusReport`] as `Unknown` or `Error` with a reason.
//!
//! | pending | last merge                     | state        |
//! |---------|--------------------------------|--------------|
//! | unknown | -                              | `Unknown`    |
//! | 0       | -                              | `Idle`       |
//! | > 0     | within the processing window   | `Processing` |
//! | > 0     | older, or none recorded        | `Pending`    |
//! | > 0     | history unsupported, no marker | `Unknown`    |
//! | > 0     | lookup failed                  | `Unknown` (transient) / `Error` |
//!
//! The last merge comes from the merge marker when one exists. Otherwise the
//! resolver negotiates commit history via [`Capabilities`] and parses the
//! newest merge commit message.
//!
//! [`Capabilities`]: hubstage_store::Capabilities

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use hubstage_store::{RemoteRepo, StoreError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::HubstageConfig;
use crate::merge::MergeMessage;
use crate::merge_state::{MergeMarker, MergeStateError};
use crate::staging::StagingArea;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Pipeline state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    /// Nothing is waiting.
    Idle,
    /// Submissions are waiting for the next merge.
    Pending,
    /// A merge ran recently and new submissions already arrived.
    Processing,
    /// The state cannot be determined right now.
    Unknown,
    /// A non-transient failure prevented resolution.
    Error,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Unknown => write!(f, "unknown"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Where the last merge was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LastMergeSource {
    /// The structured merge marker.
    Marker,
    /// A merge commit message in history.
    History,
}

impl fmt::Display for LastMergeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Marker => write!(f, "merge marker"),
            Self::History => write!(f, "commit history"),
        }
    }
}

/// The most recent merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LastMerge {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Records it merged.
    pub merged: usize,
    /// Where this information came from.
    pub source: LastMergeSource,
    /// Marker merge id or commit id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Resolver result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// The state.
    pub state: MergeState,
    /// Human-readable explanation.
    pub message: String,
    /// Staging entries waiting, when the listing succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_count: Option<usize>,
    /// The last merge, when one could be located.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_merge: Option<LastMerge>,
}

impl StatusReport {
    fn new(state: MergeState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            pending_count: None,
            last_merge: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the pipeline state at `now`.
#[must_use]
pub fn resolve_status(
    repo: &dyn RemoteRepo,
    config: &HubstageConfig,
    now: DateTime<Utc>,
) -> StatusReport {
    let count = match pending_count(repo, config) {
        Ok(count) => count,
        Err(e) => {
            return StatusReport::new(
                MergeState::Unknown,
                format!("could not list the staging area: {e}"),
            );
        }
    };

    if count == 0 {
        let mut report = StatusReport::new(MergeState::Idle, "no submissions are waiting");
        report.pending_count = Some(0);
        report.last_merge = last_merge(repo, config).ok().flatten();
        return report;
    }

    let mut report = match last_merge(repo, config) {
        Ok(Some(merge)) => {
            let age = now.signed_duration_since(merge.at);
            let window =
                TimeDelta::from_std(config.status.processing_window()).unwrap_or(TimeDelta::MAX);
            let state = if age < window {
                MergeState::Processing
            } else {
                MergeState::Pending
            };
            let mut report = StatusReport::new(
                state,
                format!(
                    "{} waiting; the last merge ran {} ago",
                    submissions(count),
                    describe_age(age)
                ),
            );
            report.last_merge = Some(merge);
            report
        }
        Ok(None) => StatusReport::new(
            MergeState::Pending,
            format!("{} waiting; no merge recorded yet", submissions(count)),
        ),
        Err(StoreError::Unsupported { capability }) => StatusReport::new(
            MergeState::Unknown,
            format!(
                "{} waiting, but {capability} is not available so the last merge cannot be located",
                submissions(count)
            ),
        ),
        Err(e) if e.is_transient() => StatusReport::new(
            MergeState::Unknown,
            format!("{} waiting; last merge lookup failed: {e}", submissions(count)),
        ),
        Err(e) => StatusReport::new(
            MergeState::Error,
            format!("{} waiting; last merge lookup failed: {e}", submissions(count)),
        ),
    };
    report.pending_count = Some(count);
    report
}

/// Number of staging entries.
///
/// # Errors
/// Propagates the listing failure.
pub fn pending_count(repo: &dyn RemoteRepo, config: &HubstageConfig) -> Result<usize, StoreError> {
    StagingArea::new(repo, &config.staging)
        .list_pending()
        .map(|p| p.len())
}

/// Locate the most recent merge.
///
/// The merge marker wins; a corrupt marker is logged and history is used
/// instead. History is consulted only when the store advertises it.
///
/// # Errors
/// [`StoreError::Unsupported`] when there is no marker and no history, or
/// the remote failure that stopped the lookup.
pub fn last_merge(
    repo: &dyn RemoteRepo,
    config: &HubstageConfig,
) -> Result<Option<LastMerge>, StoreError> {
    match MergeMarker::read(repo, &config.merge.marker_path) {
        Ok(Some(marker)) => {
            return Ok(Some(LastMerge {
                at: marker.timestamp.as_datetime(),
                merged: marker.merged,
                source: LastMergeSource::Marker,
                reference: Some(marker.merge_id),
            }));
        }
        Ok(None) => debug!("no merge marker; falling back to history"),
        Err(MergeStateError::Store(e)) => return Err(e),
        Err(e) => warn!(error = %e, "ignoring unreadable merge marker"),
    }

    if !repo.capabilities().history {
        return Err(StoreError::unsupported("commit history"));
    }
    let commits = repo.list_commits()?;
    Ok(commits.into_iter().find_map(|commit| {
        let message = MergeMessage::parse(&commit.message)?;
        Some(LastMerge {
            at: commit
                .time
                .unwrap_or_else(|| message.timestamp.as_datetime()),
            merged: message.count,
            source: LastMergeSource::History,
            reference: Some(commit.id),
        })
    }))
}

fn submissions(count: usize) -> String {
    if count == 1 {
        "1 submission is".to_owned()
    } else {
        format!("{count} submissions are")
    }
}

fn describe_age(age: TimeDelta) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m", secs / 60),
        3600..86_400 => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
        _ => format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600),
    }
}
