//! Timestamped value codec (C3).
//!
//! Encodes a cached entry as `"<ISO-8601 UTC>;<payload>"` so that a short
//! range-read of the first 50 bytes of the stored string yields the
//! creation instant without transferring the payload. The separator must
//! be the *first* `;` in the string and must fall within byte offsets
//! `[20, 50]` — wide enough to hold any RFC 3339 UTC timestamp
//! (`2024-01-01T00:00:00.123456789+00:00` is 35 bytes) but narrow enough to
//! reject a payload that happens to start with a `;` from being mistaken
//! for the separator.

use crate::error::CodecError;
use chrono::{DateTime, SecondsFormat, Utc};

const MIN_SEPARATOR_BYTE: usize = 20;
const MAX_SEPARATOR_BYTE: usize = 50;

/// Encode a `(created_at, payload)` pair into the wire format.
pub fn encode(created_at: DateTime<Utc>, payload: &str) -> String {
    format!(
        "{};{}",
        created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        payload
    )
}

/// Decode a full `"<ISO-8601>;<payload>"` string into its parts.
pub fn decode(encoded: &str) -> Result<(DateTime<Utc>, String), CodecError> {
    let sep = find_separator(encoded)?;
    let created_at = parse_timestamp(&encoded[..sep])?;
    Ok((created_at, encoded[sep + 1..].to_string()))
}

/// Decode only the creation timestamp from a (possibly truncated) prefix
/// of the wire format, e.g. the first 50 bytes read back by
/// `get_prefix(key, 50)`. This is the operation that lets a peek avoid
/// transferring the payload.
pub fn decode_timestamp(prefix: &str) -> Result<DateTime<Utc>, CodecError> {
    let sep = find_separator(prefix)?;
    parse_timestamp(&prefix[..sep])
}

fn find_separator(s: &str) -> Result<usize, CodecError> {
    let sep = s.find(';').ok_or(CodecError::MissingSeparator)?;
    if sep < MIN_SEPARATOR_BYTE || sep > MAX_SEPARATOR_BYTE {
        return Err(CodecError::SeparatorOutOfRange(sep));
    }
    Ok(sep)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CodecError::InvalidTimestamp(e.to_string()))
}
