//! Integration tests: a merge interrupted between publish and cleanup.
//!
//! The cleanup commit is made to fail with [`MemoryRepo::fail_next_commit`],
//! which leaves the repository exactly as a crash after the publish commit
//! would: the new snapshot is live, the marker says `published`, and the
//! consumed entries are still in staging. The next run must finish the
//! cleanup instead of merging those entries a second time.

#![allow(clippy::all, clippy::pedantic, clippy::nursery, clippy::unwrap_used)]

mod common;

use common::{OWNER, at, config, main_dataset, pending, repo_at, seed_main, stage, stage_many};
use hubstage::error::MergeError;
use hubstage::lease::Lease;
use hubstage::merge::MergeOutcome;
use hubstage::merge_state::{MarkerPhase, MergeMarker};
use hubstage::run_merge;
use hubstage_store::{MemoryRepo, StoreError};

const MAIN_LEN: usize = 20;
const STAGED: usize = 3;

fn server_error() -> StoreError {
    StoreError::Server {
        status: 503,
        message: "service unavailable".to_owned(),
    }
}

/// Seed `MAIN_LEN` records and `STAGED` entries, then run a merge whose
/// cleanup commit fails.
fn interrupted_merge() -> (MemoryRepo, Vec<String>, String) {
    let config = config();
    let repo = repo_at("20240101T100100Z");
    seed_main(&repo, &config, MAIN_LEN);
    let entries = stage_many(&repo, STAGED);
    repo.fail_next_commit("Cleanup", server_error());

    let err = run_merge(&repo, &config, OWNER, at("20240101T100100Z")).unwrap_err();
    let merge_id = match err {
        MergeError::CleanupFailed { merge_id, .. } => merge_id,
        other => panic!("expected CleanupFailed, got {other:?}"),
    };
    (repo, entries, merge_id)
}

#[test]
fn failed_cleanup_leaves_published_marker() {
    let config = config();
    let (repo, entries, merge_id) = interrupted_merge();

    assert_eq!(main_dataset(&repo, &config).len(), MAIN_LEN + STAGED);
    assert_eq!(pending(&repo, &config), entries);
    let marker = MergeMarker::read(&repo, &config.merge.marker_path)
        .unwrap()
        .unwrap();
    assert_eq!(marker.phase, MarkerPhase::Published);
    assert_eq!(marker.merge_id, merge_id);
    assert_eq!(marker.consumed, entries);
    assert!(Lease::read(&repo, &config.merge.lease_path).unwrap().is_none());
}

#[test]
fn rerun_finishes_cleanup_without_merging_twice() {
    let config = config();
    let (repo, entries, merge_id) = interrupted_merge();

    let outcome = run_merge(&repo, &config, OWNER, at("20240101T100200Z")).unwrap();

    match outcome {
        MergeOutcome::NothingToDo {
            recovered: Some(report),
            skipped,
        } => {
            assert_eq!(report.merge_id, merge_id);
            assert_eq!(report.deleted, entries);
            assert!(skipped.is_empty());
        }
        other => panic!("expected a recovery-only run, got {other:?}"),
    }
    assert_eq!(main_dataset(&repo, &config).len(), MAIN_LEN + STAGED);
    assert!(pending(&repo, &config).is_empty());
    let marker = MergeMarker::read(&repo, &config.merge.marker_path)
        .unwrap()
        .unwrap();
    assert_eq!(marker.phase, MarkerPhase::Complete);
    assert!(Lease::read(&repo, &config.merge.lease_path).unwrap().is_none());
    assert!(
        repo.commits()
            .iter()
            .any(|c| c.message == "Cleanup processed pending files (20240101T100100Z)")
    );
}

#[test]
fn rerun_recovers_then_merges_new_submissions() {
    let config = config();
    let (repo, entries, merge_id) = interrupted_merge();
    let fresh = stage(&repo, "20240101T100130Z", "arrived after the crash");

    let outcome = run_merge(&repo, &config, OWNER, at("20240101T100200Z")).unwrap();

    match outcome {
        MergeOutcome::Merged(summary) => {
            let report = summary.recovered.expect("recovery reported");
            assert_eq!(report.merge_id, merge_id);
            assert_eq!(report.deleted, entries);
            assert_eq!(summary.consumed, vec![fresh]);
            assert_eq!(summary.merged, 1);
        }
        other => panic!("expected a merge, got {other:?}"),
    }
    assert_eq!(main_dataset(&repo, &config).len(), MAIN_LEN + STAGED + 1);
    assert!(pending(&repo, &config).is_empty());
}

#[test]
fn recovery_only_deletes_entries_still_present() {
    let config = config();
    let (repo, entries, _) = interrupted_merge();
    repo.remove(&entries[0]);

    let outcome = run_merge(&repo, &config, OWNER, at("20240101T100200Z")).unwrap();

    match outcome {
        MergeOutcome::NothingToDo {
            recovered: Some(report),
            ..
        } => assert_eq!(report.deleted, entries[1..].to_vec()),
        other => panic!("expected a recovery-only run, got {other:?}"),
    }
    assert!(pending(&repo, &config).is_empty());
}

#[test]
fn published_marker_with_entries_gone_is_marked_complete() {
    let config = config();
    let (repo, entries, merge_id) = interrupted_merge();
    for entry in &entries {
        repo.remove(entry);
    }

    let outcome = run_merge(&repo, &config, OWNER, at("20240101T100200Z")).unwrap();

    match outcome {
        MergeOutcome::NothingToDo {
            recovered: Some(report),
            ..
        } => {
            assert_eq!(report.merge_id, merge_id);
            assert!(report.deleted.is_empty());
        }
        other => panic!("expected a recovery-only run, got {other:?}"),
    }
    let marker = MergeMarker::read(&repo, &config.merge.marker_path)
        .unwrap()
        .unwrap();
    assert_eq!(marker.phase, MarkerPhase::Complete);
}

#[test]
fn losing_the_marker_merges_the_batch_again() {
    let config = config();
    let (repo, _, _) = interrupted_merge();
    repo.remove(&config.merge.marker_path);

    let outcome = run_merge(&repo, &config, OWNER, at("20240101T100200Z")).unwrap();

    assert!(matches!(outcome, MergeOutcome::Merged(ref s) if s.recovered.is_none()));
    assert_eq!(main_dataset(&repo, &config).len(), MAIN_LEN + 2 * STAGED);
    assert!(pending(&repo, &config).is_empty());
}

#[test]
fn failed_recovery_commit_is_reported_and_retried() {
    let config = config();
    let (repo, _, merge_id) = interrupted_merge();
    repo.fail_next_commit("Cleanup", server_error());

    let err = run_merge(&repo, &config, OWNER, at("20240101T100200Z")).unwrap_err();
    assert!(matches!(err, MergeError::CleanupFailed { merge_id: ref id, .. } if *id == merge_id));
    assert!(Lease::read(&repo, &config.merge.lease_path).unwrap().is_none());

    run_merge(&repo, &config, OWNER, at("20240101T100300Z")).unwrap();
    assert_eq!(main_dataset(&repo, &config).len(), MAIN_LEN + STAGED);
    assert!(pending(&repo, &config).is_empty());
}
