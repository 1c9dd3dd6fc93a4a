//! Merge marker: the write-ahead record of a merge run.
//!
//! The marker lives in the repository itself (default
//! `.hubstage/merge-marker.json`) and is written in the same commit as the
//! published dataset snapshot, so it exists if and only if the snapshot does.
//! It names every staging entry that snapshot consumed. The cleanup commit
//! moves it to `complete`.
//!
//! # Lifecycle
//!
//! ```text
//! (publish commit) Published ──(cleanup commit)──▶ Complete
//! ```
//!
//! A run that finds a `Published` marker whose consumed entries are still
//! present resumes the cleanup instead of merging them again.

#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use hubstage_store::{CommitOperation, RemoteRepo, StoreError};
use serde::{Deserialize, Serialize};

use crate::timestamp::BasicTimestamp;

// ---------------------------------------------------------------------------
// MarkerPhase
// ---------------------------------------------------------------------------

/// Where the recorded merge run got to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerPhase {
    /// The snapshot is published; consumed entries may still be in staging.
    Published,
    /// Consumed entries are deleted.
    Complete,
}

impl MarkerPhase {
    /// Returns `true` for `Complete`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Phases reachable from this one.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Published => &[Self::Complete],
            Self::Complete => &[],
        }
    }

    /// Check whether transitioning to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        self.valid_transitions().contains(next)
    }
}

impl fmt::Display for MarkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Published => write!(f, "published"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

// ---------------------------------------------------------------------------
// MergeMarker
// ---------------------------------------------------------------------------

/// The persisted merge marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMarker {
    /// Identifier of the run that wrote the snapshot.
    pub merge_id: String,

    /// Current phase.
    pub phase: MarkerPhase,

    /// The timestamp embedded in the merge commit message.
    pub timestamp: BasicTimestamp,

    /// Records added by the run.
    pub merged: usize,

    /// Length of the published dataset.
    pub dataset_len: usize,

    /// Staging paths folded into the snapshot, sorted.
    pub consumed: Vec<String>,

    /// Last phase change.
    pub updated_at: DateTime<Utc>,
}

impl MergeMarker {
    /// A marker in the `Published` phase.
    #[must_use]
    pub fn published(
        merge_id: impl Into<String>,
        timestamp: BasicTimestamp,
        merged: usize,
        dataset_len: usize,
        mut consumed: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        consumed.sort();
        consumed.dedup();
        Self {
            merge_id: merge_id.into(),
            phase: MarkerPhase::Published,
            timestamp,
            merged,
            dataset_len,
            consumed,
            updated_at: now,
        }
    }

    /// Advance to `next`, updating the timestamp.
    ///
    /// # Errors
    /// Returns [`MergeStateError::InvalidTransition`] if the transition is
    /// not allowed.
    pub fn advance(&mut self, next: MarkerPhase, now: DateTime<Utc>) -> Result<(), MergeStateError> {
        if !self.phase.can_transition_to(&next) {
            return Err(MergeStateError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.updated_at = now;
        Ok(())
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, MergeStateError> {
        serde_json::to_string_pretty(self).map_err(|e| MergeStateError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MergeStateError> {
        serde_json::from_slice(bytes).map_err(|e| MergeStateError::Deserialize(e.to_string()))
    }

    /// The commit operation writing this marker to `path`.
    pub fn write_operation(&self, path: &str) -> Result<CommitOperation, MergeStateError> {
        let mut json = self.to_json()?;
        json.push('\n');
        Ok(CommitOperation::add(path, json.into_bytes()))
    }

    /// Read the marker at `path`. A missing marker is `Ok(None)`.
    pub fn read(repo: &dyn RemoteRepo, path: &str) -> Result<Option<Self>, MergeStateError> {
        match repo.download(path) {
            Ok(bytes) => Self::from_json(&bytes).map(Some),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(MergeStateError::Store(e)),
        }
    }
}

/// A fresh merge run identifier: `<timestamp>-<8 hex>`.
#[must_use]
pub fn new_merge_id(timestamp: BasicTimestamp) -> String {
    format!("{timestamp}-{}", crate::submit::random_disambiguator())
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// What a starting run must do about the previous one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No marker exists.
    NoMergeRecorded,
    /// The last run finished.
    Complete,
    /// The last run published but some consumed entries are still staged;
    /// delete exactly these.
    ResumeCleanup {
        /// Consumed paths still present, sorted.
        remaining: Vec<String>,
    },
    /// The last run published and its entries are gone, but the marker was
    /// never advanced.
    MarkComplete,
}

impl RecoveryOutcome {
    /// Returns `true` when a commit is needed to settle the previous run.
    #[must_use]
    pub const fn needs_commit(&self) -> bool {
        matches!(self, Self::ResumeCleanup { .. } | Self::MarkComplete)
    }
}

/// Decide recovery from the marker and the current file listing.
#[must_use]
pub fn recovery_outcome(marker: Option<&MergeMarker>, files: &BTreeSet<String>) -> RecoveryOutcome {
    let Some(marker) = marker else {
        return RecoveryOutcome::NoMergeRecorded;
    };
    if marker.phase.is_terminal() {
        return RecoveryOutcome::Complete;
    }
    let remaining: Vec<String> = marker
        .consumed
        .iter()
        .filter(|p| files.contains(*p))
        .cloned()
        .collect();
    if remaining.is_empty() {
        RecoveryOutcome::MarkComplete
    } else {
        RecoveryOutcome::ResumeCleanup { remaining }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors related to the merge marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeStateError {
    /// Invalid phase transition.
    InvalidTransition {
        /// The current phase.
        from: MarkerPhase,
        /// The attempted target phase.
        to: MarkerPhase,
    },
    /// Serialization error.
    Serialize(String),
    /// The marker exists but is not valid JSON for this version.
    Deserialize(String),
    /// The marker could not be downloaded.
    Store(StoreError),
}

impl fmt::Display for MergeStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid merge marker transition: {from} → {to}")
            }
            Self::Serialize(msg) => write!(f, "merge marker serialize error: {msg}"),
            Self::Deserialize(msg) => write!(
                f,
                "merge marker is corrupt: {msg}\n  To fix: check that the last merge's snapshot and staging area agree, then delete the marker file from the repository."
            ),
            Self::Store(e) => write!(f, "could not read merge marker: {e}"),
        }
    }
}

impl std::error::Error for MergeStateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hubstage_store::MemoryRepo;

    const PATH: &str = ".hubstage/merge-marker.json";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 1, 0).unwrap()
    }

    fn marker(consumed: &[&str]) -> MergeMarker {
        MergeMarker::published(
            "20240101T100100Z-00000000",
            "20240101T100100Z".parse().unwrap(),
            consumed.len(),
            1000 + consumed.len(),
            consumed.iter().map(|s| s.to_string()).collect(),
            now(),
        )
    }

    fn files(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn phase_transitions() {
        assert!(MarkerPhase::Published.can_transition_to(&MarkerPhase::Complete));
        assert!(!MarkerPhase::Complete.can_transition_to(&MarkerPhase::Published));
        assert!(!MarkerPhase::Published.can_transition_to(&MarkerPhase::Published));
        assert!(MarkerPhase::Complete.is_terminal());
    }

    #[test]
    fn advance_rejects_going_backwards() {
        let mut m = marker(&["pending/a.jsonl"]);
        m.advance(MarkerPhase::Complete, now()).unwrap();
        let err = m.advance(MarkerPhase::Published, now()).unwrap_err();
        assert_eq!(
            err,
            MergeStateError::InvalidTransition {
                from: MarkerPhase::Complete,
                to: MarkerPhase::Published,
            }
        );
    }

    #[test]
    fn consumed_is_sorted_and_unique() {
        let m = marker(&["pending/b.jsonl", "pending/a.jsonl", "pending/b.jsonl"]);
        assert_eq!(m.consumed, vec!["pending/a.jsonl", "pending/b.jsonl"]);
    }

    #[test]
    fn json_shape_is_stable() {
        let m = marker(&["pending/a.jsonl"]);
        let json: serde_json::Value = serde_json::from_str(&m.to_json().unwrap()).unwrap();
        assert_eq!(json["phase"], "published");
        assert_eq!(json["timestamp"], "20240101T100100Z");
        assert_eq!(json["merged"], 1);
        assert_eq!(json["dataset_len"], 1001);
        assert_eq!(json["consumed"][0], "pending/a.jsonl");
        assert_eq!(json["updated_at"], "2024-01-01T10:01:00Z");
    }

    #[test]
    fn read_missing_is_none_and_corrupt_is_error() {
        let repo = MemoryRepo::new();
        assert_eq!(MergeMarker::read(&repo, PATH).unwrap(), None);

        repo.put(PATH, b"{not json".to_vec());
        let err = MergeMarker::read(&repo, PATH).unwrap_err();
        assert!(matches!(err, MergeStateError::Deserialize(_)));
        assert!(err.to_string().contains("To fix"));
    }

    #[test]
    fn read_round_trips_written_marker() {
        let repo = MemoryRepo::new();
        let m = marker(&["pending/a.jsonl"]);
        repo.commit(&[m.write_operation(PATH).unwrap()], "publish", None)
            .unwrap();
        assert_eq!(MergeMarker::read(&repo, PATH).unwrap(), Some(m));
    }

    #[test]
    fn read_surfaces_store_errors() {
        let repo = MemoryRepo::new();
        repo.fail_download(
            PATH,
            StoreError::Network {
                message: "reset".into(),
            },
        );
        assert!(matches!(
            MergeMarker::read(&repo, PATH),
            Err(MergeStateError::Store(_))
        ));
    }

    #[test]
    fn recovery_dispatch() {
        assert_eq!(
            recovery_outcome(None, &files(&[])),
            RecoveryOutcome::NoMergeRecorded
        );

        let mut done = marker(&["pending/a.jsonl"]);
        done.advance(MarkerPhase::Complete, now()).unwrap();
        assert_eq!(
            recovery_outcome(Some(&done), &files(&["pending/a.jsonl"])),
            RecoveryOutcome::Complete
        );

        let published = marker(&["pending/a.jsonl", "pending/b.jsonl"]);
        assert_eq!(
            recovery_outcome(
                Some(&published),
                &files(&["pending/b.jsonl", "pending/c.jsonl"])
            ),
            RecoveryOutcome::ResumeCleanup {
                remaining: vec!["pending/b.jsonl".into()]
            }
        );
        assert_eq!(
            recovery_outcome(Some(&published), &files(&["pending/c.jsonl"])),
            RecoveryOutcome::MarkComplete
        );
        assert!(RecoveryOutcome::MarkComplete.needs_commit());
        assert!(!RecoveryOutcome::Complete.needs_commit());
    }

    #[test]
    fn merge_ids_differ() {
        let ts: BasicTimestamp = "20240101T100100Z".parse().unwrap();
        let a = new_merge_id(ts);
        assert!(a.starts_with("20240101T100100Z-"));
        assert_ne!(a, new_merge_id(ts));
    }
}
