//! Second-resolution UTC timestamps in ISO-8601 basic format
//! (`YYYYMMDDTHHMMSSZ`), the form used in staging filenames, staging
//! records and merge commit messages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// `strftime` pattern for [`BasicTimestamp`].
pub const BASIC_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// A UTC instant truncated to whole seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BasicTimestamp(DateTime<Utc>);

impl BasicTimestamp {
    /// Truncate `instant` to whole seconds.
    #[must_use]
    pub fn from_datetime(instant: DateTime<Utc>) -> Self {
        Self(instant.trunc_subsecs(0))
    }

    /// The wall-clock now.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// The underlying instant.
    #[must_use]
    pub const fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for BasicTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(BASIC_FORMAT))
    }
}

/// A string that is not a `YYYYMMDDTHHMMSSZ` timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimestampError {
    /// The rejected input.
    pub value: String,
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid timestamp '{}': expected YYYYMMDDTHHMMSSZ (e.g. 20240101T120000Z)",
            self.value
        )
    }
}

impl std::error::Error for TimestampError {}

impl FromStr for BasicTimestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // chrono accepts unpadded fields; the wire format is fixed width.
        if s.len() != 16 {
            return Err(TimestampError {
                value: s.to_owned(),
            });
        }
        NaiveDateTime::parse_from_str(s, BASIC_FORMAT)
            .map(|naive| Self(naive.and_utc()))
            .map_err(|_| TimestampError {
                value: s.to_owned(),
            })
    }
}

impl TryFrom<String> for BasicTimestamp {
    type Error = TimestampError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BasicTimestamp> for String {
    fn from(ts: BasicTimestamp) -> Self {
        ts.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn display_is_basic_iso() {
        let ts = BasicTimestamp::from_datetime(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert_eq!(ts.to_string(), "20240101T120000Z");
    }

    #[test]
    fn subseconds_are_dropped() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap()
            + chrono::Duration::milliseconds(999);
        let ts = BasicTimestamp::from_datetime(instant);
        assert_eq!(ts.to_string(), "20240309T070503Z");
        assert_eq!(ts.as_datetime().timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn parse_accepts_wire_format() {
        let ts: BasicTimestamp = "20240101T100005Z".parse().unwrap();
        assert_eq!(
            ts.as_datetime(),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 5).unwrap()
        );
    }

    #[test]
    fn parse_rejects_other_shapes() {
        for bad in [
            "",
            "2024-01-01T10:00:05Z",
            "20240101T100005",
            "20241301T100005Z",
            "2024011T100005Z0",
            "20240101t100005z",
        ] {
            assert!(bad.parse::<BasicTimestamp>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let ts: BasicTimestamp = "20240101T120000Z".parse().unwrap();
        assert_eq!(serde_json::to_string(&ts).unwrap(), "\"20240101T120000Z\"");
        let back: BasicTimestamp = serde_json::from_str("\"20240101T120000Z\"").unwrap();
        assert_eq!(back, ts);
        assert!(serde_json::from_str::<BasicTimestamp>("\"yesterday\"").is_err());
    }
}
