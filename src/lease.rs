//! Merge lease: one merge run at a time.
//!
//! The lease is a small JSON file in the repository (default
//! `.hubstage/lease.json`) naming its owner and an expiry. It is taken with a
//! compare-and-swap on the branch head: the lease commit carries the head
//! the owner observed as its parent, so two runners racing for a free lease
//! cannot both succeed. A lease nobody released expires after its TTL and
//! may be taken over.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use hubstage_store::{CommitOperation, RemoteRepo, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Head-moved retries before giving up on acquisition.
pub const ACQUIRE_ATTEMPTS: u32 = 5;

/// The persisted lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Who holds it.
    pub owner: String,
    /// When it was taken.
    pub acquired_at: DateTime<Utc>,
    /// When it may be taken over.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease for `owner` starting at `now`.
    #[must_use]
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        Self {
            owner: owner.into(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Returns `true` once `now` reaches the expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// The commit operation writing this lease to `path`.
    #[must_use]
    pub fn write_operation(&self, path: &str) -> CommitOperation {
        let mut json = serde_json::to_string_pretty(self).unwrap_or_default();
        json.push('\n');
        CommitOperation::add(path, json.into_bytes())
    }

    /// Read the lease at `path`. No lease is `Ok(None)`.
    ///
    /// # Errors
    /// [`LeaseError::Corrupt`] for unreadable JSON, [`LeaseError::Store`]
    /// for remote failures.
    pub fn read(repo: &dyn RemoteRepo, path: &str) -> Result<Option<Self>, LeaseError> {
        match repo.download(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LeaseError::Corrupt {
                    path: path.to_owned(),
                    message: e.to_string(),
                }),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(LeaseError::Store(e)),
        }
    }
}

/// An owner id unique enough to tell runners apart: `<host>-<pid>-<8 hex>`.
#[must_use]
pub fn new_owner_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "hubstage".to_owned());
    format!(
        "{host}-{}-{}",
        std::process::id(),
        crate::submit::random_disambiguator()
    )
}

/// Take the lease at `path` for `owner`.
///
/// Re-acquiring a lease `owner` already holds refreshes its expiry.
///
/// # Errors
/// [`LeaseError::Held`] when another owner holds a live lease,
/// [`LeaseError::Contended`] when the head kept moving, and store or
/// corruption errors otherwise.
pub fn acquire(
    repo: &dyn RemoteRepo,
    path: &str,
    owner: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Lease, LeaseError> {
    for attempt in 1..=ACQUIRE_ATTEMPTS {
        let head = repo.head().map_err(LeaseError::Store)?;
        if let Some(current) = Lease::read(repo, path)?
            && current.owner != owner
        {
            if !current.is_expired(now) {
                return Err(LeaseError::Held {
                    owner: current.owner,
                    expires_at: current.expires_at,
                });
            }
            warn!(
                previous_owner = %current.owner,
                expired_at = %current.expires_at,
                "taking over expired merge lease"
            );
        }

        let lease = Lease::new(owner, now, ttl);
        match repo.commit(
            &[lease.write_operation(path)],
            &format!("Acquire merge lease ({owner})"),
            Some(&head),
        ) {
            Ok(_) => {
                info!(owner, expires_at = %lease.expires_at, "acquired merge lease");
                return Ok(lease);
            }
            Err(StoreError::Conflict { message }) => {
                warn!(attempt, %message, "branch moved while acquiring lease, retrying");
            }
            Err(e) => return Err(LeaseError::Store(e)),
        }
    }
    Err(LeaseError::Contended {
        attempts: ACQUIRE_ATTEMPTS,
    })
}

/// Confirm `owner` still holds the lease at `path`.
///
/// # Errors
/// [`LeaseError::Lost`] when the lease is gone or owned by someone else.
pub fn verify(repo: &dyn RemoteRepo, path: &str, owner: &str) -> Result<Lease, LeaseError> {
    match Lease::read(repo, path)? {
        Some(lease) if lease.owner == owner => Ok(lease),
        other => Err(LeaseError::Lost {
            owner: owner.to_owned(),
            found: other.map(|l| l.owner),
        }),
    }
}

/// The commit operation dropping the lease.
#[must_use]
pub fn release_operation(path: &str) -> CommitOperation {
    CommitOperation::delete(path)
}

/// Release the lease if `owner` still holds it.
///
/// # Errors
/// [`LeaseError::Lost`] when it is not ours; store errors otherwise.
pub fn release(repo: &dyn RemoteRepo, path: &str, owner: &str) -> Result<(), LeaseError> {
    verify(repo, path, owner)?;
    repo.commit(
        &[release_operation(path)],
        &format!("Release merge lease ({owner})"),
        None,
    )
    .map_err(LeaseError::Store)?;
    info!(owner, "released merge lease");
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Lease failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseError {
    /// Another runner holds a live lease.
    Held {
        /// The holder.
        owner: String,
        /// When it may be taken over.
        expires_at: DateTime<Utc>,
    },
    /// The lease we held is gone or was taken over.
    Lost {
        /// Who we are.
        owner: String,
        /// Who holds it now, if anyone.
        found: Option<String>,
    },
    /// The branch head kept moving during acquisition.
    Contended {
        /// Attempts made.
        attempts: u32,
    },
    /// The lease file is not valid JSON.
    Corrupt {
        /// Lease path.
        path: String,
        /// Parser message.
        message: String,
    },
    /// A remote call failed.
    Store(StoreError),
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Held { owner, expires_at } => write!(
                f,
                "another merge is running (lease held by '{owner}' until {expires_at}).\n  To fix: wait for it to finish; the lease expires on its own if that run died."
            ),
            Self::Lost { owner, found: Some(other) } => write!(
                f,
                "merge lease of '{owner}' was taken over by '{other}'.\n  To fix: raise merge.lease_ttl_secs above the longest merge duration, then rerun."
            ),
            Self::Lost { owner, found: None } => write!(
                f,
                "merge lease of '{owner}' disappeared.\n  To fix: make sure nothing else deletes the lease file, then rerun."
            ),
            Self::Contended { attempts } => write!(
                f,
                "could not take the merge lease: the branch moved on each of {attempts} attempts.\n  To fix: rerun; submissions are arriving faster than usual."
            ),
            Self::Corrupt { path, message } => write!(
                f,
                "lease file '{path}' is corrupt: {message}\n  To fix: make sure no merge is running, then delete '{path}' from the repository."
            ),
            Self::Store(e) => write!(f, "lease operation failed: {e}"),
        }
    }
}

impl std::error::Error for LeaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hubstage_store::MemoryRepo;

    const PATH: &str = ".hubstage/lease.json";
    const TTL: Duration = Duration::from_secs(1800);

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, min, 0).unwrap()
    }

    #[test]
    fn acquire_on_free_repo() {
        let repo = MemoryRepo::new();
        let lease = acquire(&repo, PATH, "runner-a", TTL, at(0)).unwrap();
        assert_eq!(lease.expires_at, at(30));
        assert_eq!(Lease::read(&repo, PATH).unwrap(), Some(lease));
        assert_eq!(repo.commits()[0].message, "Acquire merge lease (runner-a)");
    }

    #[test]
    fn live_lease_blocks_other_owner() {
        let repo = MemoryRepo::new();
        acquire(&repo, PATH, "runner-a", TTL, at(0)).unwrap();
        let err = acquire(&repo, PATH, "runner-b", TTL, at(10)).unwrap_err();
        assert!(matches!(err, LeaseError::Held { ref owner, .. } if owner == "runner-a"));
        assert!(err.to_string().contains("To fix"));
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let repo = MemoryRepo::new();
        acquire(&repo, PATH, "runner-a", TTL, at(0)).unwrap();
        let lease = acquire(&repo, PATH, "runner-b", TTL, at(30)).unwrap();
        assert_eq!(lease.owner, "runner-b");
        assert!(matches!(
            verify(&repo, PATH, "runner-a"),
            Err(LeaseError::Lost { found: Some(ref o), .. }) if o == "runner-b"
        ));
    }

    #[test]
    fn same_owner_refreshes() {
        let repo = MemoryRepo::new();
        acquire(&repo, PATH, "runner-a", TTL, at(0)).unwrap();
        let lease = acquire(&repo, PATH, "runner-a", TTL, at(5)).unwrap();
        assert_eq!(lease.expires_at, at(35));
    }

    #[test]
    fn moved_head_is_retried_then_contended() {
        let repo = MemoryRepo::new();
        // A conflict on every attempt simulates a branch that never settles.
        for _ in 0..ACQUIRE_ATTEMPTS {
            repo.fail_next_commit(
                "Acquire",
                StoreError::Conflict {
                    message: "moved".into(),
                },
            );
        }
        let err = acquire(&repo, PATH, "runner-a", TTL, at(0)).unwrap_err();
        assert_eq!(err, LeaseError::Contended { attempts: ACQUIRE_ATTEMPTS });

        repo.fail_next_commit(
            "Acquire",
            StoreError::Conflict {
                message: "moved".into(),
            },
        );
        assert!(acquire(&repo, PATH, "runner-a", TTL, at(0)).is_ok());
    }

    #[test]
    fn release_only_by_owner() {
        let repo = MemoryRepo::new();
        acquire(&repo, PATH, "runner-a", TTL, at(0)).unwrap();
        assert!(matches!(
            release(&repo, PATH, "runner-b"),
            Err(LeaseError::Lost { .. })
        ));
        release(&repo, PATH, "runner-a").unwrap();
        assert_eq!(Lease::read(&repo, PATH).unwrap(), None);
        assert!(matches!(
            verify(&repo, PATH, "runner-a"),
            Err(LeaseError::Lost { found: None, .. })
        ));
    }

    #[test]
    fn corrupt_lease_is_reported() {
        let repo = MemoryRepo::new();
        repo.put(PATH, b"garbage".to_vec());
        let err = acquire(&repo, PATH, "runner-a", TTL, at(0)).unwrap_err();
        assert!(matches!(err, LeaseError::Corrupt { .. }));
    }

    #[test]
    fn owner_ids_are_distinct() {
        assert_ne!(new_owner_id(), new_owner_id());
    }
}
