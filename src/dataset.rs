//! Main dataset shards.
//!
//! The main dataset is an ordered list of [`Record`]s stored as JSONL shards
//! named `<prefix>-<i:05>-of-<n:05>.jsonl`. Only the merge rewrites shards,
//! and it always writes a complete, contiguous set.

use std::collections::BTreeSet;
use std::fmt;

use hubstage_store::{CommitOperation, RemoteRepo, StoreError};
use tracing::{debug, instrument};

use crate::config::DatasetConfig;
use crate::record::{self, CodecError, Record};

const SHARD_EXTENSION: &str = ".jsonl";

/// A shard path parsed back into its position.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShardName {
    /// 0-based shard index.
    pub index: usize,
    /// Number of shards in the set.
    pub total: usize,
    /// Full repo path.
    pub path: String,
}

/// Path of shard `index` out of `total`.
#[must_use]
pub fn shard_name(prefix: &str, index: usize, total: usize) -> String {
    format!("{prefix}-{index:05}-of-{total:05}{SHARD_EXTENSION}")
}

/// Parse `path` as a shard under `prefix`.
#[must_use]
pub fn parse_shard_name(prefix: &str, path: &str) -> Option<ShardName> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(SHARD_EXTENSION)?;
    let (index, total) = rest.split_once("-of-")?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(index) || !digits(total) {
        return None;
    }
    Some(ShardName {
        index: index.parse().ok()?,
        total: total.parse().ok()?,
        path: path.to_owned(),
    })
}

/// Every shard in a file listing, ordered by index.
#[must_use]
pub fn shard_paths<I, S>(files: I, prefix: &str) -> Vec<ShardName>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut shards: Vec<ShardName> = files
        .into_iter()
        .filter_map(|f| parse_shard_name(prefix, f.as_ref()))
        .collect();
    shards.sort();
    shards
}

/// Check that `shards` form one complete `0..n` set.
///
/// # Errors
/// [`DatasetError::InconsistentShards`] on gaps or mixed set sizes.
pub fn check_shard_set(shards: &[ShardName]) -> Result<(), DatasetError> {
    let Some(first) = shards.first() else {
        return Ok(());
    };
    let totals: BTreeSet<usize> = shards.iter().map(|s| s.total).collect();
    if totals.len() > 1 {
        return Err(DatasetError::InconsistentShards {
            detail: format!("shards from sets of sizes {totals:?} are mixed"),
        });
    }
    let indices: Vec<usize> = shards.iter().map(|s| s.index).collect();
    let expected: Vec<usize> = (0..first.total).collect();
    if indices != expected {
        return Err(DatasetError::InconsistentShards {
            detail: format!(
                "expected shards 0..{} of {}, found indices {indices:?}",
                first.total, first.total
            ),
        });
    }
    Ok(())
}

/// Download and decode the whole main dataset, in shard order.
///
/// An absent dataset (no shards) is empty, not an error.
///
/// # Errors
/// Store failures, undecodable shards, or an incomplete shard set.
#[instrument(skip_all, fields(prefix = %config.shard_prefix))]
pub fn load_main_dataset(
    repo: &dyn RemoteRepo,
    config: &DatasetConfig,
) -> Result<Vec<Record>, DatasetError> {
    let files = repo.list_files().map_err(|source| DatasetError::Store {
        path: None,
        source,
    })?;
    load_shards(repo, &shard_paths(&files, &config.shard_prefix))
}

/// Download and decode the given shards.
///
/// # Errors
/// See [`load_main_dataset`].
pub fn load_shards(
    repo: &dyn RemoteRepo,
    shards: &[ShardName],
) -> Result<Vec<Record>, DatasetError> {
    check_shard_set(shards)?;
    let mut records = Vec::new();
    for shard in shards {
        let bytes = repo.download(&shard.path).map_err(|source| DatasetError::Store {
            path: Some(shard.path.clone()),
            source,
        })?;
        let decoded = record::decode(&bytes).map_err(|source| DatasetError::Decode {
            path: shard.path.clone(),
            source,
        })?;
        debug!(path = %shard.path, records = decoded.len(), "loaded shard");
        records.extend(decoded);
    }
    Ok(records)
}

/// Split `records` into encoded shards.
///
/// A shard closes when it holds `max_records_per_shard` records or the next
/// record would push it past `max_shard_bytes`. A record larger than the
/// byte cap gets a shard of its own. An empty dataset still gets one (empty)
/// shard so the published layout is never ambiguous.
#[must_use]
pub fn layout_shards(records: &[Record], config: &DatasetConfig) -> Vec<(String, Vec<u8>)> {
    let per_shard = config.max_records_per_shard.max(1);
    let max_bytes = config.max_shard_bytes.max(1);

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut count = 0;
    for record in records {
        let line = record::encode(std::slice::from_ref(record));
        if count > 0 && (count == per_shard || current.len() + line.len() > max_bytes) {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.extend_from_slice(&line);
        count += 1;
    }
    if count > 0 || chunks.is_empty() {
        chunks.push(current);
    }

    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, content)| (shard_name(&config.shard_prefix, i, total), content))
        .collect()
}

/// Operations replacing `existing` shards with `records`.
///
/// Shards whose path is reused are overwritten; the rest are deleted.
#[must_use]
pub fn publish_operations(
    records: &[Record],
    existing: &[ShardName],
    config: &DatasetConfig,
) -> Vec<CommitOperation> {
    let shards = layout_shards(records, config);
    let written: BTreeSet<&str> = shards.iter().map(|(p, _)| p.as_str()).collect();
    let stale: Vec<CommitOperation> = existing
        .iter()
        .filter(|s| !written.contains(s.path.as_str()))
        .map(|s| CommitOperation::delete(s.path.clone()))
        .collect();
    let mut ops: Vec<CommitOperation> = shards
        .into_iter()
        .map(|(path, content)| CommitOperation::add(path, content))
        .collect();
    ops.extend(stale);
    ops
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reading the main dataset.
#[derive(Debug)]
pub enum DatasetError {
    /// Listing or downloading failed.
    Store {
        /// The shard being downloaded, if any.
        path: Option<String>,
        /// Underlying error.
        source: StoreError,
    },
    /// A shard is not valid JSONL.
    Decode {
        /// The shard path.
        path: String,
        /// Underlying error.
        source: CodecError,
    },
    /// The shard files do not form one complete set.
    InconsistentShards {
        /// What is wrong.
        detail: String,
    },
}

impl fmt::Display for DatasetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store { path: Some(p), source } => {
                write!(f, "could not download shard '{p}': {source}")
            }
            Self::Store { path: None, source } => {
                write!(f, "could not list dataset shards: {source}")
            }
            Self::Decode { path, source } => write!(
                f,
                "shard '{path}' is corrupt ({source}).\n  To fix: repair or remove the shard in the repository, then rerun the merge."
            ),
            Self::InconsistentShards { detail } => write!(
                f,
                "main dataset shards are inconsistent: {detail}.\n  To fix: delete the stray shards so one complete set remains."
            ),
        }
    }
}

impl std::error::Error for DatasetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store { source, .. } => Some(source),
            Self::Decode { source, .. } => Some(source),
            Self::InconsistentShards { .. } => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::timestamp::BasicTimestamp;
    use hubstage_store::MemoryRepo;

    fn records(n: usize) -> Vec<Record> {
        let ts: BasicTimestamp = "20240101T000000Z".parse().unwrap();
        (0..n).map(|i| Record::new(format!("story {i}"), ts)).collect()
    }

    fn cfg(per_shard: usize) -> DatasetConfig {
        DatasetConfig {
            max_records_per_shard: per_shard,
            ..DatasetConfig::default()
        }
    }

    #[test]
    fn shard_names_round_trip() {
        let name = shard_name("data/train", 3, 12);
        assert_eq!(name, "data/train-00003-of-00012.jsonl");
        let parsed = parse_shard_name("data/train", &name).unwrap();
        assert_eq!((parsed.index, parsed.total), (3, 12));
    }

    #[test]
    fn non_shards_are_ignored() {
        for path in [
            "data/train.jsonl",
            "data/train-00000-of-00001.parquet",
            "data/test-00000-of-00001.jsonl",
            "data/train-x-of-00001.jsonl",
            "data/train-00000-of-.jsonl",
        ] {
            assert!(parse_shard_name("data/train", path).is_none(), "{path}");
        }
    }

    #[test]
    fn layout_splits_by_shard_size() {
        let shards = layout_shards(&records(5), &cfg(2));
        let names: Vec<&str> = shards.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "data/train-00000-of-00003.jsonl",
                "data/train-00001-of-00003.jsonl",
                "data/train-00002-of-00003.jsonl",
            ]
        );
        assert_eq!(record::decode(&shards[2].1).unwrap().len(), 1);
    }

    #[test]
    fn layout_closes_shards_at_the_byte_cap() {
        let records = records(6);
        let line = record::encode(std::slice::from_ref(&records[0])).len();
        let config = DatasetConfig {
            max_records_per_shard: 100,
            max_shard_bytes: line * 2 + 1,
            ..DatasetConfig::default()
        };
        let shards = layout_shards(&records, &config);
        assert_eq!(shards.len(), 3);
        for (_, content) in &shards {
            assert!(content.len() <= config.max_shard_bytes);
            assert_eq!(record::decode(content).unwrap().len(), 2);
        }
        let all: Vec<Record> = shards
            .iter()
            .flat_map(|(_, c)| record::decode(c).unwrap())
            .collect();
        assert_eq!(all, records);
    }

    #[test]
    fn oversized_record_gets_its_own_shard() {
        let ts: BasicTimestamp = "20240101T000000Z".parse().unwrap();
        let records = vec![
            Record::new("a", ts),
            Record::new("x".repeat(64), ts),
            Record::new("b", ts),
        ];
        let config = DatasetConfig {
            max_shard_bytes: 60,
            ..DatasetConfig::default()
        };
        let shards = layout_shards(&records, &config);
        let sizes: Vec<usize> = shards
            .iter()
            .map(|(_, c)| record::decode(c).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![1, 1, 1]);
        assert!(shards[1].1.len() > 60);
    }

    #[test]
    fn empty_dataset_has_one_empty_shard() {
        let shards = layout_shards(&[], &cfg(10));
        assert_eq!(shards.len(), 1);
        assert!(shards[0].1.is_empty());
    }

    #[test]
    fn publish_deletes_stale_shards() {
        let existing = shard_paths(
            [
                "data/train-00000-of-00002.jsonl",
                "data/train-00001-of-00002.jsonl",
            ],
            "data/train",
        );
        let ops = publish_operations(&records(3), &existing, &cfg(10));
        let adds: Vec<&str> = ops
            .iter()
            .filter(|o| matches!(o, CommitOperation::Add { .. }))
            .map(CommitOperation::path)
            .collect();
        let deletes: Vec<&str> = ops
            .iter()
            .filter(|o| matches!(o, CommitOperation::Delete { .. }))
            .map(CommitOperation::path)
            .collect();
        assert_eq!(adds, vec!["data/train-00000-of-00001.jsonl"]);
        assert_eq!(
            deletes,
            vec![
                "data/train-00000-of-00002.jsonl",
                "data/train-00001-of-00002.jsonl",
            ]
        );
    }

    #[test]
    fn load_reads_shards_in_index_order() {
        let repo = MemoryRepo::new();
        for (path, content) in layout_shards(&records(5), &cfg(2)) {
            repo.put(path, content);
        }
        let loaded = load_main_dataset(&repo, &cfg(2)).unwrap();
        assert_eq!(loaded, records(5));
    }

    #[test]
    fn missing_dataset_is_empty() {
        let repo = MemoryRepo::new();
        assert!(load_main_dataset(&repo, &cfg(2)).unwrap().is_empty());
    }

    #[test]
    fn incomplete_set_is_rejected() {
        let repo = MemoryRepo::new();
        repo.put("data/train-00000-of-00002.jsonl", Vec::new());
        let err = load_main_dataset(&repo, &cfg(2)).unwrap_err();
        assert!(matches!(err, DatasetError::InconsistentShards { .. }));
        assert!(err.to_string().contains("To fix"));
    }

    #[test]
    fn corrupt_shard_names_path() {
        let repo = MemoryRepo::new();
        repo.put("data/train-00000-of-00001.jsonl", b"not json\n".to_vec());
        let err = load_main_dataset(&repo, &cfg(2)).unwrap_err();
        match err {
            DatasetError::Decode { path, .. } => {
                assert_eq!(path, "data/train-00000-of-00001.jsonl")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
