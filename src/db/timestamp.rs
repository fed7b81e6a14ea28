//! Stored timestamp format
//!
//! Every timestamp column holds RFC 3339 UTC text with exactly six fractional
//! digits (`2026-01-01T00:00:00.000000Z`). The fixed width makes SQLite's text
//! comparison agree with chronological order, which the delta queries rely on.

use chrono::{DateTime, Duration, DurationRound, SecondsFormat, Utc};

/// Current time at storage precision
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Drop sub-microsecond precision
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::microseconds(1)).unwrap_or(ts)
}

/// Format for storage and for binding in comparisons
pub fn format(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// Next `updated_at` for a record last written at `previous`.
///
/// Never earlier than `previous + 1µs`, so a record's timestamp strictly
/// increases even when the wall clock stalls or steps back.
pub fn next_after(previous: &DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = *previous + Duration::microseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}
