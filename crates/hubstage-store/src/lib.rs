//! Remote repository abstraction for hubstage.
//!
//! This crate defines the [`RemoteRepo`] trait, the single interface through
//! which the merge protocol talks to the versioned object store holding the
//! dataset. Nothing outside this crate speaks HTTP; callers program against
//! the trait and are handed a concrete implementation.
//!
//! # Crate layout
//!
//! - [`repo`] — the [`RemoteRepo`] trait definition.
//! - [`types`] — value types used in trait signatures ([`CommitOperation`],
//!   [`CommitInfo`], [`Capabilities`], [`RepoType`]).
//! - [`error`] — the [`StoreError`] enum returned by all trait methods.
//! - [`retry`] — bounded retry with exponential backoff for transient errors.
//! - [`hub`] — [`HubRepo`], the Hugging Face Hub HTTP implementation.
//! - [`memory`] — [`MemoryRepo`], an in-process implementation with fault
//!   injection, used by tests and dry runs.

pub mod error;
pub mod hub;
pub mod memory;
pub mod repo;
pub mod retry;
pub mod types;

pub use error::StoreError;
pub use hub::{DEFAULT_ENDPOINT, HubConfig, HubRepo};
pub use memory::MemoryRepo;
pub use repo::RemoteRepo;
pub use retry::{RetryPolicy, with_retry};
pub use types::{Capabilities, CommitInfo, CommitOperation, RepoType};
