//! [`MemoryRepo`] — an in-process [`RemoteRepo`] with fault injection.
//!
//! Files live in a `BTreeMap`, every successful commit bumps a synthetic
//! 40-hex revision id, and history is kept newest first. Faults can be armed
//! per operation so tests can reproduce partial failures (e.g. the cleanup
//! commit of a merge failing after the publish commit succeeded).

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::repo::RemoteRepo;
use crate::types::{Capabilities, CommitInfo, CommitOperation};

/// In-memory repository.
pub struct MemoryRepo {
    state: Mutex<MemoryState>,
}

struct MemoryState {
    files: BTreeMap<String, Vec<u8>>,
    history: Vec<CommitInfo>,
    revision: u64,
    history_supported: bool,
    clock: Option<DateTime<Utc>>,
    listing_error: Option<StoreError>,
    history_error: Option<StoreError>,
    download_errors: BTreeMap<String, StoreError>,
    commit_faults: Vec<CommitFault>,
}

struct CommitFault {
    message_prefix: String,
    error: StoreError,
}

impl Default for MemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepo {
    /// An empty repository with history support.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                files: BTreeMap::new(),
                history: Vec::new(),
                revision: 0,
                history_supported: true,
                clock: None,
                listing_error: None,
                history_error: None,
                download_errors: BTreeMap::new(),
                commit_faults: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a file without recording a commit.
    pub fn put(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.lock().files.insert(path.into(), content.into());
    }

    /// Remove a file without recording a commit.
    pub fn remove(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.remove(path)
    }

    /// Current content of `path`.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Every path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Recorded history, newest first.
    #[must_use]
    pub fn commits(&self) -> Vec<CommitInfo> {
        self.lock().history.clone()
    }

    /// Append a commit to history without touching files.
    pub fn record_commit(&self, message: impl Into<String>, time: Option<DateTime<Utc>>) {
        let mut state = self.lock();
        state.revision += 1;
        let id = format!("{:040x}", state.revision);
        state.history.insert(
            0,
            CommitInfo {
                id,
                message: message.into(),
                time,
            },
        );
    }

    /// Toggle the history capability.
    pub fn set_history_supported(&self, supported: bool) {
        self.lock().history_supported = supported;
    }

    /// Fix the commit time stamped on new commits (`None` = wall clock).
    pub fn set_clock(&self, now: Option<DateTime<Utc>>) {
        self.lock().clock = now;
    }

    /// Make `list_files` and `head` fail with `error` until cleared.
    pub fn set_listing_error(&self, error: Option<StoreError>) {
        self.lock().listing_error = error;
    }

    /// Make `list_commits` fail with `error` until cleared.
    pub fn set_history_error(&self, error: Option<StoreError>) {
        self.lock().history_error = error;
    }

    /// Make downloads of `path` fail with `error`.
    pub fn fail_download(&self, path: impl Into<String>, error: StoreError) {
        self.lock().download_errors.insert(path.into(), error);
    }

    /// Fail the next commit whose message starts with `message_prefix`.
    ///
    /// The fault fires once; nothing is written when it does.
    pub fn fail_next_commit(&self, message_prefix: impl Into<String>, error: StoreError) {
        self.lock().commit_faults.push(CommitFault {
            message_prefix: message_prefix.into(),
            error,
        });
    }
}

impl RemoteRepo for MemoryRepo {
    fn list_files(&self) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        if let Some(err) = &state.listing_error {
            return Err(err.clone());
        }
        Ok(state.files.keys().cloned().collect())
    }

    fn download(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let state = self.lock();
        if let Some(err) = state.download_errors.get(path) {
            return Err(err.clone());
        }
        state.files.get(path).cloned().ok_or_else(|| StoreError::NotFound {
            path: path.to_owned(),
        })
    }

    fn head(&self) -> Result<String, StoreError> {
        let state = self.lock();
        if let Some(err) = &state.listing_error {
            return Err(err.clone());
        }
        Ok(format!("{:040x}", state.revision))
    }

    fn commit(
        &self,
        operations: &[CommitOperation],
        message: &str,
        parent: Option<&str>,
    ) -> Result<CommitInfo, StoreError> {
        let mut state = self.lock();

        if let Some(idx) = state
            .commit_faults
            .iter()
            .position(|f| message.starts_with(&f.message_prefix))
        {
            return Err(state.commit_faults.remove(idx).error);
        }

        let head = format!("{:040x}", state.revision);
        if let Some(parent) = parent
            && parent != head
        {
            return Err(StoreError::Conflict {
                message: format!("expected parent {parent}, branch is at {head}"),
            });
        }

        for op in operations {
            if let CommitOperation::Delete { path } = op
                && !state.files.contains_key(path)
            {
                return Err(StoreError::NotFound { path: path.clone() });
            }
        }
        for op in operations {
            match op {
                CommitOperation::Add { path, content } => {
                    state.files.insert(path.clone(), content.clone());
                }
                CommitOperation::Delete { path } => {
                    state.files.remove(path);
                }
            }
        }

        state.revision += 1;
        let info = CommitInfo {
            id: format!("{:040x}", state.revision),
            message: message.to_owned(),
            time: Some(state.clock.unwrap_or_else(Utc::now)),
        };
        state.history.insert(0, info.clone());
        Ok(info)
    }

    fn list_commits(&self) -> Result<Vec<CommitInfo>, StoreError> {
        let state = self.lock();
        if !state.history_supported {
            return Err(StoreError::unsupported("commit history"));
        }
        if let Some(err) = &state.history_error {
            return Err(err.clone());
        }
        Ok(state.history.clone())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            history: self.lock().history_supported,
        }
    }
}
