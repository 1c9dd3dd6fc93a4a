//! The [`RemoteRepo`] trait: the abstraction boundary between hubstage and
//! the versioned object store.
//!
//! | Group    | Methods                          |
//! |----------|----------------------------------|
//! | Listing  | `list_files`, `head`             |
//! | Read     | `download`                       |
//! | Write    | `commit`                         |
//! | History  | `list_commits`, `capabilities`   |

use crate::error::StoreError;
use crate::types::{Capabilities, CommitInfo, CommitOperation};

/// The remote repository interface consumed by the merge protocol.
///
/// Implementations may be backed by the Hub HTTP API ([`HubRepo`](crate::HubRepo))
/// or an in-process double ([`MemoryRepo`](crate::MemoryRepo)).
///
/// # Object safety
///
/// This trait is object-safe. Callers take `&dyn RemoteRepo`.
pub trait RemoteRepo {
    /// List every file path at the configured revision.
    fn list_files(&self) -> Result<Vec<String>, StoreError>;

    /// Fetch the raw bytes of `path`.
    ///
    /// Returns [`StoreError::NotFound`] when the path does not exist; every
    /// other failure is reported as its own variant, never as empty content.
    fn download(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// The revision id the configured branch currently points at.
    fn head(&self) -> Result<String, StoreError>;

    /// Apply `operations` as one atomic commit.
    ///
    /// When `parent` is `Some`, the commit only succeeds if the branch still
    /// points at that revision; otherwise [`StoreError::Conflict`] is
    /// returned and nothing is written.
    fn commit(
        &self,
        operations: &[CommitOperation],
        message: &str,
        parent: Option<&str>,
    ) -> Result<CommitInfo, StoreError>;

    /// Commit history of the configured branch, newest first.
    ///
    /// Backends without history access return [`StoreError::Unsupported`].
    fn list_commits(&self) -> Result<Vec<CommitInfo>, StoreError> {
        Err(StoreError::unsupported("commit history"))
    }

    /// Optional features this backend offers.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}
