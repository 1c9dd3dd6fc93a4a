//! The merge run: drain staging into the main dataset.
//!
//! ```text
//! pre-check ─▶ lease ─▶ reconcile ─▶ collect ─▶ load ─▶ combine ─▶ publish ─▶ cleanup
//!  (read only)                                                   (snapshot    (entries deleted,
//!                                                                 + marker)    marker complete,
//!                                                                              lease dropped)
//! ```
//!
//! Publish and cleanup are two commits. The marker written with the
//! snapshot lists the consumed entries, so a run that dies between the two
//! is finished by the next run's reconcile step instead of being merged a
//! second time.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use hubstage_store::{CommitInfo, CommitOperation, RemoteRepo};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::{HubstageConfig, OnMalformed};
use crate::dataset;
use crate::error::MergeError;
use crate::lease::{self, LeaseError};
use crate::merge::message::{MergeMessage, cleanup_message};
use crate::merge_state::{self, MarkerPhase, MergeMarker, RecoveryOutcome};
use crate::record::{self, Record};
use crate::staging::{self, StagingArea};
use crate::timestamp::BasicTimestamp;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// How a merge run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// No staging entries to merge. Not an error.
    NothingToDo {
        /// A previous run's cleanup that this run finished.
        #[serde(skip_serializing_if = "Option::is_none")]
        recovered: Option<RecoveryReport>,
        /// Entries left in staging because they failed to decode.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        skipped: Vec<SkippedEntry>,
    },
    /// A new snapshot was published and its entries cleared.
    Merged(MergeSummary),
}

/// A completed merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    /// Run identifier (also in the marker).
    pub merge_id: String,
    /// Timestamp in the commit messages.
    pub timestamp: BasicTimestamp,
    /// Records appended.
    pub merged: usize,
    /// Batch records dropped as exact duplicates.
    pub duplicates_dropped: usize,
    /// Dataset length before the run.
    pub previous_len: usize,
    /// Dataset length after the run.
    pub dataset_len: usize,
    /// Staging entries folded in and deleted.
    pub consumed: Vec<String>,
    /// Entries left in staging because they failed to decode.
    pub skipped: Vec<SkippedEntry>,
    /// Publish commit id.
    pub publish_commit: String,
    /// Cleanup commit id.
    pub cleanup_commit: String,
    /// A previous run's cleanup that this run finished first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered: Option<RecoveryReport>,
}

/// A staging entry left behind by the `skip` policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// Staging path.
    pub path: String,
    /// Decoder message.
    pub reason: String,
}

/// Cleanup finished on behalf of an interrupted run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// The interrupted run.
    pub merge_id: String,
    /// Entries deleted now.
    pub deleted: Vec<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run one merge as `owner` at `now`.
///
/// # Errors
/// See [`MergeError`]. On any error after the lease was taken, the lease is
/// released best-effort.
#[instrument(skip_all, fields(owner = %owner))]
pub fn run_merge(
    repo: &dyn RemoteRepo,
    config: &HubstageConfig,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<MergeOutcome, MergeError> {
    let lease_path = config.merge.lease_path.as_str();

    // Idle ticks must not commit anything.
    let files = repo
        .list_files()
        .map_err(MergeError::store("list repository files"))?;
    let pending = StagingArea::new(repo, &config.staging).pending_in(&files);
    let marker = MergeMarker::read(repo, &config.merge.marker_path)?;
    let recovery = merge_state::recovery_outcome(marker.as_ref(), &files.into_iter().collect());
    if pending.is_empty() && !recovery.needs_commit() {
        info!("no staging entries; nothing to do");
        return Ok(MergeOutcome::NothingToDo {
            recovered: None,
            skipped: Vec::new(),
        });
    }

    lease::acquire(repo, lease_path, owner, config.merge.lease_ttl(), now)?;

    let result = merge_under_lease(repo, config, owner, now);
    match &result {
        Ok(MergeOutcome::Merged(_)) | Err(MergeError::Lease(LeaseError::Lost { .. })) => {}
        Ok(MergeOutcome::NothingToDo { .. }) | Err(_) => {
            if let Err(e) = lease::release(repo, lease_path, owner) {
                warn!(error = %e, "could not release merge lease; it will expire");
            }
        }
    }
    result
}

fn merge_under_lease(
    repo: &dyn RemoteRepo,
    config: &HubstageConfig,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<MergeOutcome, MergeError> {
    let lease_path = config.merge.lease_path.as_str();
    let marker_path = config.merge.marker_path.as_str();
    let timestamp = BasicTimestamp::from_datetime(now);
    let staging = StagingArea::new(repo, &config.staging);

    // Reconcile against what is there now that we hold the lease.
    let mut files: BTreeSet<String> = repo
        .list_files()
        .map_err(MergeError::store("list repository files"))?
        .into_iter()
        .collect();
    let recovered = reconcile(repo, marker_path, &files, now)?;
    if let Some(report) = &recovered {
        for path in &report.deleted {
            files.remove(path);
        }
    }

    let pending = staging.pending_in(&files);
    if pending.is_empty() {
        info!("no staging entries after reconcile");
        return Ok(MergeOutcome::NothingToDo {
            recovered,
            skipped: Vec::new(),
        });
    }
    info!(count = pending.len(), "collecting staging entries");

    let batch = collect_batch(&staging, &pending, config.merge.on_malformed)?;
    if batch.consumed.is_empty() {
        warn!(skipped = batch.skipped.len(), "every staging entry was skipped");
        return Ok(MergeOutcome::NothingToDo {
            recovered,
            skipped: batch.skipped,
        });
    }

    let shards = dataset::shard_paths(&files, &config.dataset.shard_prefix);
    let main = dataset::load_shards(repo, &shards)?;
    let previous_len = main.len();
    info!(records = previous_len, "loaded main dataset");

    let (merged, duplicates_dropped) = combine(main, batch.records, config.merge.dedup);
    let added = merged.len() - previous_len;

    lease::verify(repo, lease_path, owner)?;
    crate::fp!(crate::failpoints::MERGE_BEFORE_PUBLISH).map_err(MergeError::Injected)?;

    let merge_id = merge_state::new_merge_id(timestamp);
    let mut marker = MergeMarker::published(
        merge_id.clone(),
        timestamp,
        added,
        merged.len(),
        batch.consumed.clone(),
        now,
    );
    let mut ops = dataset::publish_operations(&merged, &shards, &config.dataset);
    ops.push(marker.write_operation(marker_path)?);
    check_publish_paths(&ops, &batch.consumed, config)?;
    let message = MergeMessage {
        timestamp,
        count: added,
    };
    let publish = repo
        .commit(&ops, &message.to_string(), None)
        .map_err(|source| MergeError::PublishFailed {
            merge_id: merge_id.clone(),
            source,
        })?;
    info!(
        merge_id = %merge_id,
        commit = %publish.id,
        merged = added,
        dataset_len = merged.len(),
        "published merged dataset"
    );

    crate::fp!(crate::failpoints::MERGE_AFTER_PUBLISH).map_err(MergeError::Injected)?;

    lease::verify(repo, lease_path, owner)?;
    marker.advance(MarkerPhase::Complete, now)?;
    let mut ops = staging::delete_operations(&marker.consumed);
    ops.push(marker.write_operation(marker_path)?);
    ops.push(lease::release_operation(lease_path));
    let cleanup = repo
        .commit(&ops, &cleanup_message(timestamp), None)
        .map_err(|source| MergeError::CleanupFailed {
            merge_id: merge_id.clone(),
            source,
        })?;
    info!(commit = %cleanup.id, deleted = marker.consumed.len(), "cleaned up staging entries");

    Ok(MergeOutcome::Merged(MergeSummary {
        merge_id,
        timestamp,
        merged: added,
        duplicates_dropped,
        previous_len,
        dataset_len: merged.len(),
        consumed: marker.consumed,
        skipped: batch.skipped,
        publish_commit: publish.id,
        cleanup_commit: cleanup.id,
        recovered,
    }))
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Finish an interrupted run's cleanup, if the marker says one is pending.
fn reconcile(
    repo: &dyn RemoteRepo,
    marker_path: &str,
    files: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> Result<Option<RecoveryReport>, MergeError> {
    let Some(mut marker) = MergeMarker::read(repo, marker_path)? else {
        return Ok(None);
    };
    let deleted = match merge_state::recovery_outcome(Some(&marker), files) {
        RecoveryOutcome::ResumeCleanup { remaining } => remaining,
        RecoveryOutcome::MarkComplete => Vec::new(),
        RecoveryOutcome::NoMergeRecorded | RecoveryOutcome::Complete => return Ok(None),
    };
    warn!(
        merge_id = %marker.merge_id,
        remaining = deleted.len(),
        "previous merge was published but not cleaned up; finishing it"
    );

    marker.advance(MarkerPhase::Complete, now)?;
    let mut ops: Vec<CommitOperation> = staging::delete_operations(&deleted);
    ops.push(marker.write_operation(marker_path)?);
    let commit: CommitInfo = repo
        .commit(&ops, &cleanup_message(marker.timestamp), None)
        .map_err(|source| MergeError::CleanupFailed {
            merge_id: marker.merge_id.clone(),
            source,
        })?;
    info!(commit = %commit.id, "finished interrupted cleanup");

    Ok(Some(RecoveryReport {
        merge_id: marker.merge_id,
        deleted,
    }))
}

/// Cleanup deletes every consumed entry, so nothing the publish commit
/// writes may live in staging.
fn check_publish_paths(
    ops: &[CommitOperation],
    consumed: &[String],
    config: &HubstageConfig,
) -> Result<(), MergeError> {
    let consumed: HashSet<&str> = consumed.iter().map(String::as_str).collect();
    for op in ops {
        let path = op.path();
        if consumed.contains(path) || config.staging.covers(path) {
            return Err(MergeError::StagingOverlap {
                path: path.to_owned(),
            });
        }
    }
    Ok(())
}

struct Batch {
    records: Vec<Record>,
    consumed: Vec<String>,
    skipped: Vec<SkippedEntry>,
}

fn collect_batch(
    staging: &StagingArea<'_>,
    pending: &[String],
    on_malformed: OnMalformed,
) -> Result<Batch, MergeError> {
    let mut batch = Batch {
        records: Vec::new(),
        consumed: Vec::new(),
        skipped: Vec::new(),
    };
    for path in pending {
        let bytes = staging
            .fetch(path)
            .map_err(MergeError::store(format!("download staging entry '{path}'")))?;
        match record::decode(&bytes) {
            Ok(records) => {
                batch.records.extend(records);
                batch.consumed.push(path.clone());
            }
            Err(source) if on_malformed == OnMalformed::Skip => {
                warn!(path = %path, error = %source, "skipping malformed staging entry");
                batch.skipped.push(SkippedEntry {
                    path: path.clone(),
                    reason: source.to_string(),
                });
            }
            Err(source) => {
                return Err(MergeError::MalformedRecord {
                    path: path.clone(),
                    source,
                });
            }
        }
    }
    Ok(batch)
}

/// `main ++ batch`, optionally dropping batch records whose trimmed text is
/// already present. Returns the merged records and the number dropped.
#[must_use]
pub fn combine(main: Vec<Record>, batch: Vec<Record>, dedup: bool) -> (Vec<Record>, usize) {
    let mut merged = main;
    if !dedup {
        merged.extend(batch);
        return (merged, 0);
    }
    let mut seen: HashSet<String> = merged.iter().map(|r| r.story.trim().to_owned()).collect();
    let mut dropped = 0;
    for record in batch {
        if seen.insert(record.story.trim().to_owned()) {
            merged.push(record);
        } else {
            dropped += 1;
        }
    }
    (merged, dropped)
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    fn rec(story: &str) -> Record {
        Record::new(story, "20240101T000000Z".parse().unwrap())
    }

    #[test]
    fn combine_appends_in_order() {
        let (merged, dropped) = combine(vec![rec("a")], vec![rec("b"), rec("a")], false);
        let stories: Vec<&str> = merged.iter().map(|r| r.story.as_str()).collect();
        assert_eq!(stories, vec!["a", "b", "a"]);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn combine_dedup_drops_exact_trimmed_text() {
        let (merged, dropped) = combine(
            vec![rec("a")],
            vec![rec(" a "), rec("b"), rec("b"), rec("c")],
            true,
        );
        let stories: Vec<&str> = merged.iter().map(|r| r.story.as_str()).collect();
        assert_eq!(stories, vec!["a", "b", "c"]);
        assert_eq!(dropped, 2);
    }

    #[test]
    fn outcome_json_is_tagged() {
        let json = serde_json::to_value(MergeOutcome::NothingToDo {
            recovered: None,
            skipped: Vec::new(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "nothing_to_do"}));
    }
}
