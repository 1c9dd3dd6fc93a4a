//! Error types for remote repository operations.
//!
//! [`StoreError`] is the single error type returned by all
//! [`RemoteRepo`](crate::RemoteRepo) methods. Variants separate the failure
//! classes callers must treat differently: transient faults are retried,
//! authorization failures are surfaced verbatim, a missing path is an answer
//! rather than a failure, and an unsupported capability degrades gracefully.

use thiserror::Error;

/// Errors returned by [`RemoteRepo`](crate::RemoteRepo) operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The requested path (or revision) does not exist.
    #[error("not found: {path}")]
    NotFound {
        /// The path that was requested.
        path: String,
    },

    /// The credential was rejected (HTTP 401/403). Never retried.
    #[error("unauthorized (HTTP {status}): {message}")]
    Unauthorized {
        /// HTTP status code.
        status: u16,
        /// Server-provided reason.
        message: String,
    },

    /// The service asked us to slow down (HTTP 429).
    #[error("rate limited: {message}")]
    RateLimited {
        /// Server-provided reason.
        message: String,
    },

    /// The request did not complete within the configured timeout.
    #[error("request timed out: {message}")]
    Timeout {
        /// What was being attempted.
        message: String,
    },

    /// The connection could not be established or was dropped.
    #[error("network error: {message}")]
    Network {
        /// Transport-level description.
        message: String,
    },

    /// The service failed internally (HTTP 5xx).
    #[error("server error (HTTP {status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server-provided reason.
        message: String,
    },

    /// A commit's parent-revision precondition did not hold.
    #[error("revision conflict: {message}")]
    Conflict {
        /// Details about the mismatch.
        message: String,
    },

    /// The backing service does not offer this capability.
    #[error("{capability} is not supported by this repository backend")]
    Unsupported {
        /// Name of the missing capability (e.g. `"commit history"`).
        capability: String,
    },

    /// The service answered with a body we could not interpret.
    #[error("invalid response: {message}")]
    InvalidResponse {
        /// What was wrong with the response.
        message: String,
    },

    /// A file exceeds what the backend accepts in a single commit. Nothing
    /// was sent.
    #[error("'{path}' is {size} bytes, over the {limit}-byte limit for a single upload")]
    TooLarge {
        /// Offending path.
        path: String,
        /// Its size in bytes.
        size: usize,
        /// The limit it broke.
        limit: usize,
    },

    /// Any other client-side rejection (HTTP 4xx not covered above).
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Server-provided reason.
        message: String,
    },
}

impl StoreError {
    /// Whether a retry with backoff may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Network { .. } | Self::Server { .. }
        )
    }

    /// Whether this is an authorization failure.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Whether this reports a missing path.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this reports an unavailable capability.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Shorthand for an [`Unsupported`](Self::Unsupported) error.
    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::Unsupported {
            capability: capability.into(),
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// `path` names the resource for [`NotFound`](Self::NotFound).
    #[must_use]
    pub fn from_status(status: u16, path: &str, message: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized { status, message },
            404 => Self::NotFound {
                path: path.to_owned(),
            },
            408 => Self::Timeout { message },
            409 | 412 => Self::Conflict { message },
            429 => Self::RateLimited { message },
            500..=599 => Self::Server { status, message },
            _ => Self::Rejected { status, message },
        }
    }
}
