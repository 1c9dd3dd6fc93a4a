//! Staging namespace access.
//!
//! Staging entries are single-record JSONL files under `<dir>/`, named
//! `entry_<YYYYMMDDTHHMMSSZ>_<8 hex>.jsonl`. Entries written without the
//! hex disambiguator are still picked up; listing only filters on the
//! directory prefix and extension.

use hubstage_store::{CommitInfo, CommitOperation, RemoteRepo, StoreError};
use tracing::{debug, instrument};

use crate::config::StagingConfig;
use crate::timestamp::BasicTimestamp;

/// File name prefix of every staging entry.
pub const ENTRY_PREFIX: &str = "entry_";

/// Keep the paths under `dir/` with `extension`, sorted lexicographically.
///
/// Entries in subdirectories of `dir/` count too.
#[must_use]
pub fn filter_pending<I, S>(paths: I, dir: &str, extension: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let prefix = format!("{}/", dir.trim_matches('/'));
    let mut pending: Vec<String> = paths
        .into_iter()
        .map(Into::into)
        .filter(|p| {
            p.strip_prefix(&prefix).is_some_and(|name| {
                let file = name.rsplit('/').next().unwrap_or(name);
                file.len() > extension.len() && file.ends_with(extension)
            })
        })
        .collect();
    pending.sort();
    pending
}

/// Path of a new staging entry.
///
/// `disambiguator` is appended to the timestamp when present so that two
/// submissions within the same second land in different files.
#[must_use]
pub fn entry_path(
    config: &StagingConfig,
    timestamp: BasicTimestamp,
    disambiguator: Option<&str>,
) -> String {
    let dir = config.dir.trim_matches('/');
    match disambiguator {
        Some(tag) => format!("{dir}/{ENTRY_PREFIX}{timestamp}_{tag}{}", config.extension),
        None => format!("{dir}/{ENTRY_PREFIX}{timestamp}{}", config.extension),
    }
}

/// The staging namespace of one repository.
pub struct StagingArea<'a> {
    repo: &'a dyn RemoteRepo,
    config: &'a StagingConfig,
}

impl<'a> StagingArea<'a> {
    /// Bind the staging layout to a repository.
    #[must_use]
    pub fn new(repo: &'a dyn RemoteRepo, config: &'a StagingConfig) -> Self {
        Self { repo, config }
    }

    /// Every staging entry currently present, sorted.
    ///
    /// # Errors
    /// Propagates listing failures; an unreachable store is never reported
    /// as an empty namespace.
    #[instrument(skip_all, fields(dir = %self.config.dir))]
    pub fn list_pending(&self) -> Result<Vec<String>, StoreError> {
        let files = self.repo.list_files()?;
        Ok(self.pending_in(files))
    }

    /// Staging entries within an already-fetched listing.
    #[must_use]
    pub fn pending_in<I, S>(&self, files: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pending = filter_pending(files, &self.config.dir, &self.config.extension);
        debug!(count = pending.len(), "listed staging entries");
        pending
    }

    /// Raw bytes of one entry.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] when the entry is gone; any other variant
    /// for auth or transport failures.
    pub fn fetch(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.repo.download(path)
    }

    /// Delete `paths` in one commit.
    ///
    /// # Errors
    /// Propagates the commit failure. Nothing is deleted when it fails.
    #[instrument(skip_all, fields(count = paths.len()))]
    pub fn delete(&self, paths: &[String], message: &str) -> Result<CommitInfo, StoreError> {
        self.repo.commit(&delete_operations(paths), message, None)
    }
}

/// One delete operation per path.
#[must_use]
pub fn delete_operations(paths: &[String]) -> Vec<CommitOperation> {
    paths.iter().map(CommitOperation::delete).collect()
}
