//! Staging-to-main merge.
//!
//! - [`message`]: the publish and cleanup commit messages.
//! - [`run`]: the merge run itself ([`run_merge`]).

pub mod message;
pub mod run;

pub use message::{MergeMessage, cleanup_message};
pub use run::{MergeOutcome, MergeSummary, RecoveryReport, SkippedEntry, combine, run_merge};
