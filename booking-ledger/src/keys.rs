//! Canonical key assignment
//!
//! The storage key of a booking is derived from its semantic identity only:
//!
//! - assembly: `assembly-{grade}-{section}-{date}`
//! - regular:  `regular-{grade}-{section}-{date}-{time slot}`
//!
//! Two bookings with the same identity therefore share one ledger slot.
//! Whether the second write replaces or is refused is decided by the
//! ledger's conflict policy, not here.

use booking_common::{BookingKind, BookingRecord};
use chrono::NaiveDate;

/// Canonical storage key for `record`
pub fn canonical_key(record: &BookingRecord) -> String {
    key_for(
        record.kind,
        &record.grade,
        &record.section,
        record.date,
        &record.time_slot,
    )
}

/// Canonical key from the identity fields directly
pub fn key_for(
    kind: BookingKind,
    grade: &str,
    section: &str,
    date: NaiveDate,
    time_slot: &str,
) -> String {
    let date = date.format("%Y-%m-%d");
    match kind {
        BookingKind::Assembly => format!(
            "assembly-{}-{}-{}",
            normalize_component(grade),
            normalize_component(section),
            date
        ),
        BookingKind::Regular => format!(
            "regular-{}-{}-{}-{}",
            normalize_component(grade),
            normalize_component(section),
            date,
            normalize_component(time_slot)
        ),
    }
}

/// Normalized form of one key component (grade, section, time slot)
///
/// Trims, lowercases ASCII letters and joins whitespace-separated words with
/// `_`, so `"  الحصة   الأولى "` and `"الحصة الأولى"` give the same key.
pub fn normalize_component(part: &str) -> String {
    part
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}
