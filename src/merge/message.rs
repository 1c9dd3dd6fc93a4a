//! Merge commit messages.
//!
//! The publish commit message is a wire contract: status resolution falls
//! back to parsing it from history when no merge marker is available.
//!
//! ```text
//! Merge pending submissions (20240101T100100Z) — merged 2 entries
//! ```

use std::fmt;
use std::str::FromStr;

use crate::timestamp::BasicTimestamp;

const MERGE_PREFIX: &str = "Merge pending submissions (";
const MERGE_INFIX: &str = ") — merged ";
const MERGE_SUFFIX: &str = " entries";

/// A parsed publish commit message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeMessage {
    /// When the merge ran.
    pub timestamp: BasicTimestamp,
    /// Records merged.
    pub count: usize,
}

impl MergeMessage {
    /// Parse the first line of a commit message.
    ///
    /// Returns `None` for anything that is not a merge message.
    #[must_use]
    pub fn parse(message: &str) -> Option<Self> {
        message.parse().ok()
    }
}

impl fmt::Display for MergeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{MERGE_PREFIX}{}{MERGE_INFIX}{}{MERGE_SUFFIX}",
            self.timestamp, self.count
        )
    }
}

/// A commit message that is not a merge message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotAMergeMessage;

impl fmt::Display for NotAMergeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a merge commit message")
    }
}

impl std::error::Error for NotAMergeMessage {}

impl FromStr for MergeMessage {
    type Err = NotAMergeMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.lines().next().unwrap_or_default().trim();
        let rest = line.strip_prefix(MERGE_PREFIX).ok_or(NotAMergeMessage)?;
        let (timestamp, rest) = rest.split_once(MERGE_INFIX).ok_or(NotAMergeMessage)?;
        let count = rest.strip_suffix(MERGE_SUFFIX).ok_or(NotAMergeMessage)?;
        if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NotAMergeMessage);
        }
        Ok(Self {
            timestamp: timestamp.parse().map_err(|_| NotAMergeMessage)?,
            count: count.parse().map_err(|_| NotAMergeMessage)?,
        })
    }
}

/// Message of the commit deleting consumed staging entries.
#[must_use]
pub fn cleanup_message(timestamp: BasicTimestamp) -> String {
    format!("Cleanup processed pending files ({timestamp})")
}
