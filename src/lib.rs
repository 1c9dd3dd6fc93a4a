//! hubstage library crate.
//!
//! Contributors append single-record staging files to a Hub dataset
//! repository; a periodic merge folds them into the main dataset shards.
//! The `hubstage` binary is a thin CLI over these modules; integration tests
//! drive them directly against [`hubstage_store::MemoryRepo`].

pub mod config;
pub mod dataset;
pub mod error;
pub mod failpoints;
pub mod format;
pub mod lease;
pub mod merge;
pub mod merge_state;
pub mod record;
pub mod staging;
pub mod status;
pub mod submit;
pub mod telemetry;
pub mod timestamp;

pub use config::HubstageConfig;
pub use error::MergeError;
pub use merge::{MergeOutcome, run_merge};
pub use status::{MergeState, StatusReport, resolve_status};
