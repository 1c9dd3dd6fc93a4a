//! Shared fixtures for hubstage integration tests.
//!
//! Every test runs against its own [`MemoryRepo`]; nothing touches the
//! network.

#![allow(dead_code, clippy::expect_used)]

use chrono::{DateTime, Utc};
use hubstage::HubstageConfig;
use hubstage::dataset::{self, layout_shards};
use hubstage::record::{self, Record};
use hubstage::staging::StagingArea;
use hubstage::timestamp::BasicTimestamp;
use hubstage_store::MemoryRepo;

/// Owner id used by test merge runs.
pub const OWNER: &str = "test-runner";

/// Parse a basic-format timestamp (`20240101T100000Z`).
pub fn ts(value: &str) -> BasicTimestamp {
    value.parse().expect("valid basic timestamp")
}

/// Instant for a basic-format timestamp.
pub fn at(value: &str) -> DateTime<Utc> {
    ts(value).as_datetime()
}

/// Default config for the `org/stories` dataset.
pub fn config() -> HubstageConfig {
    HubstageConfig::parse("[repo]\nid = \"org/stories\"\n").expect("valid config")
}

/// Config with a small shard size, so layouts span several shards.
pub fn config_with_shard_size(max_records_per_shard: usize) -> HubstageConfig {
    let mut config = config();
    config.dataset.max_records_per_shard = max_records_per_shard;
    config
}

/// A repository whose commits are stamped with `now`.
pub fn repo_at(now: &str) -> MemoryRepo {
    let repo = MemoryRepo::new();
    repo.set_clock(Some(at(now)));
    repo
}

/// `count` distinct records.
pub fn records(prefix: &str, count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| Record::new(format!("{prefix} story {i}"), ts("20231201T000000Z")))
        .collect()
}

/// Place a main dataset of `count` records without recording a commit.
pub fn seed_main(repo: &MemoryRepo, config: &HubstageConfig, count: usize) {
    for (path, content) in layout_shards(&records("main", count), &config.dataset) {
        repo.put(path, content);
    }
}

/// Place one staging entry holding `story` at `pending/entry_<stamp>.jsonl`.
pub fn stage(repo: &MemoryRepo, stamp: &str, story: &str) -> String {
    let path = format!("pending/entry_{stamp}.jsonl");
    let mut record = Record::new(story, ts(stamp));
    record.status = Some("pending".to_owned());
    repo.put(path.clone(), record::encode(&[record]));
    path
}

/// Place `count` staging entries one second apart, starting at 09:00:00.
pub fn stage_many(repo: &MemoryRepo, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let stamp = format!("20240101T09{:02}{:02}Z", i / 60, i % 60);
            stage(repo, &stamp, &format!("staged story {i}"))
        })
        .collect()
}

/// Current main dataset.
pub fn main_dataset(repo: &MemoryRepo, config: &HubstageConfig) -> Vec<Record> {
    dataset::load_main_dataset(repo, &config.dataset).expect("main dataset loads")
}

/// Staging entries currently present.
pub fn pending(repo: &MemoryRepo, config: &HubstageConfig) -> Vec<String> {
    StagingArea::new(repo, &config.staging)
        .list_pending()
        .expect("staging lists")
}
