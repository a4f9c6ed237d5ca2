//! Timestamp utilities

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, Utc, Weekday};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current calendar date in the host's local time zone
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// First date on or after `from` that falls on `weekday`
///
/// Returns `from` itself when it already is that weekday.
pub fn next_weekday_on_or_after(from: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() as i64
        - from.weekday().num_days_from_monday() as i64)
        % 7;
    from + ChronoDuration::days(ahead)
}

/// Render a timestamp for use inside a file name
///
/// Colons and dots are replaced so the result is valid on every platform,
/// e.g. `2025-03-01T08-15-30-123Z`. Lexicographic order matches time order.
pub fn file_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}
