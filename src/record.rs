//! Line-delimited JSON record codec.
//!
//! The same format is used for single-record staging files and for the
//! main dataset shards: one JSON object per line, UTF-8, `\n` separated.
//!
//! ```text
//! {"story":"...","timestamp_utc":"20240101T120000Z","status":"pending"}
//! ```
//!
//! Decoding is strict: a line that is not a valid record is an error, never
//! silently dropped. Blank lines (including the trailing newline) are not
//! records and are skipped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::timestamp::BasicTimestamp;

/// One submitted text record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The submitted text.
    pub story: String,
    /// Submission time.
    pub timestamp_utc: BasicTimestamp,
    /// Optional tracking tag set by the writer (e.g. `"pending"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Record {
    /// A record with no status tag.
    pub fn new(story: impl Into<String>, timestamp_utc: BasicTimestamp) -> Self {
        Self {
            story: story.into(),
            timestamp_utc,
            status: None,
        }
    }
}

/// Decoding failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The input is not UTF-8.
    InvalidUtf8 {
        /// Byte offset of the first invalid sequence.
        valid_up_to: usize,
    },
    /// A non-blank line is not a valid record.
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What the JSON decoder rejected.
        reason: String,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUtf8 { valid_up_to } => {
                write!(f, "invalid UTF-8 after byte {valid_up_to}")
            }
            Self::Malformed { line, reason } => write!(f, "line {line}: {reason}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Decode a JSONL byte stream. Empty input yields no records.
///
/// # Errors
/// Returns [`CodecError`] for invalid UTF-8 or any malformed line.
pub fn decode(bytes: &[u8]) -> Result<Vec<Record>, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|e| CodecError::InvalidUtf8 {
        valid_up_to: e.valid_up_to(),
    })?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| CodecError::Malformed {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Encode records as JSONL, one compact object per line, newline-terminated.
#[must_use]
pub fn encode(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        // Serializing a struct of strings into a Vec cannot fail.
        if serde_json::to_writer(&mut out, record).is_ok() {
            out.push(b'\n');
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    fn ts(s: &str) -> BasicTimestamp {
        s.parse().unwrap()
    }

    #[test]
    fn empty_input_is_zero_records() {
        assert!(decode(b"").unwrap().is_empty());
        assert!(decode(b"\n\n  \n").unwrap().is_empty());
    }

    #[test]
    fn decodes_staging_line_with_status() {
        let line = "{\"story\": \"ඔබේ කතාව\", \"timestamp_utc\": \"20240101T100000Z\", \"status\": \"pending\"}\n";
        let records = decode(line.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].story, "ඔබේ කතාව");
        assert_eq!(records[0].timestamp_utc, ts("20240101T100000Z"));
        assert_eq!(records[0].status.as_deref(), Some("pending"));
    }

    #[test]
    fn status_is_optional_and_unknown_fields_ignored() {
        let line = r#"{"story":"x","timestamp_utc":"20240101T100000Z","lang":"si"}"#;
        let records = decode(line.as_bytes()).unwrap();
        assert_eq!(records[0].status, None);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let input = concat!(
            r#"{"story":"a","timestamp_utc":"20240101T100000Z"}"#,
            "\n\n",
            r#"{"story":"b""#,
            "\n"
        );
        let err = decode(input.as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { line: 3, .. }), "{err:?}");
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let err = decode(br#"{"story":"no time"}"#).unwrap_err();
        match err {
            CodecError::Malformed { line, reason } => {
                assert_eq!(line, 1);
                assert!(reason.contains("timestamp_utc"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let err = decode(br#"{"story":"x","timestamp_utc":"2024-01-01"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { line: 1, .. }));
    }

    #[test]
    fn invalid_utf8_is_distinct() {
        let err = decode(&[b'{', 0xff, 0xfe]).unwrap_err();
        assert_eq!(err, CodecError::InvalidUtf8 { valid_up_to: 1 });
    }

    #[test]
    fn byte_order_mark_is_tolerated() {
        let input = "\u{feff}{\"story\":\"x\",\"timestamp_utc\":\"20240101T100000Z\"}\n";
        assert_eq!(decode(input.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn encode_is_one_line_per_record_and_keeps_unicode() {
        let records = vec![
            Record::new("පළමු", ts("20240101T100000Z")),
            Record {
                story: "line\nbreak".into(),
                timestamp_utc: ts("20240101T100005Z"),
                status: Some("pending".into()),
            },
        ];
        let bytes = encode(&records);
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("පළමු"));
        assert!(text.ends_with('\n'));
        assert!(!text.contains("\"status\":null"));
        assert_eq!(decode(&bytes).unwrap(), records);
    }
}
