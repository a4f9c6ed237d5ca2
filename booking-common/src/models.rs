//! Booking record model
//!
//! Field names on disk are camelCase, matching the JSON documents the
//! ledger has always written (`referenceNumber`, `timeSlot`, `createdAt`, ...).
//! The booking kind is stored under `type`.

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Kind of booking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingKind {
    /// A classroom booked for one time slot
    Regular,
    /// The morning assembly for a grade/section on a date
    Assembly,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Regular => "regular",
            BookingKind::Assembly => "assembly",
        }
    }
}

impl fmt::Display for BookingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record shape a migrated booking was converted from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginalFormat {
    Old,
    Legacy,
    Modern,
}

impl OriginalFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginalFormat::Old => "old",
            OriginalFormat::Legacy => "legacy",
            OriginalFormat::Modern => "modern",
        }
    }
}

impl fmt::Display for OriginalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a migrated record came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProvenance {
    /// Storage key the record had before migration
    pub original_key: String,
    pub original_format: OriginalFormat,
    pub migrated_at: DateTime<Utc>,
    /// Weekday name of a legacy record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_day: Option<String>,
    /// Period of a legacy record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_period: Option<String>,
    /// Numeric classroom id of an old record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_classroom_id: Option<String>,
    /// Numeric time slot of an old record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_time_slot: Option<String>,
}

/// A booking in the ledger
///
/// `reference_number` and `created_at` never change after creation;
/// `updated_at` moves forward on every update. Fields the ledger does not
/// know about are kept in `extra` so a read/write cycle loses nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    pub reference_number: String,
    #[serde(rename = "type")]
    pub kind: BookingKind,
    /// Classroom or grade name
    #[serde(alias = "classroom")]
    pub grade: String,
    #[serde(default)]
    pub section: String,
    pub date: NaiveDate,
    /// Time-slot name or ordinal; empty for assemblies
    #[serde(default)]
    pub time_slot: String,
    #[serde(default)]
    pub teacher: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<MigrationProvenance>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BookingRecord {
    /// Build a fresh record from a creation request
    pub fn from_new(new: NewBooking, reference_number: String, at: DateTime<Utc>) -> Self {
        Self {
            reference_number,
            kind: new.kind,
            grade: new.grade,
            section: new.section,
            date: new.date,
            time_slot: new.time_slot,
            teacher: new.teacher,
            phone: new.phone,
            subject: new.subject,
            notes: new.notes,
            created_at: at,
            updated_at: at,
            provenance: None,
            extra: Map::new(),
        }
    }

    /// Apply the fields present in `patch` and move `updated_at` forward
    ///
    /// `updated_at` never goes below `created_at` or its previous value,
    /// even if the supplied clock reading is behind.
    pub fn apply_patch(&mut self, patch: &BookingPatch, at: DateTime<Utc>) {
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(grade) = &patch.grade {
            self.grade = grade.clone();
        }
        if let Some(section) = &patch.section {
            self.section = section.clone();
        }
        if let Some(date) = patch.date {
            self.date = date;
        }
        if let Some(time_slot) = &patch.time_slot {
            self.time_slot = time_slot.clone();
        }
        if let Some(teacher) = &patch.teacher {
            self.teacher = teacher.clone();
        }
        if let Some(phone) = &patch.phone {
            self.phone = phone.clone();
        }
        if let Some(subject) = &patch.subject {
            self.subject = subject.clone();
        }
        if let Some(notes) = &patch.notes {
            self.notes = notes.clone();
        }
        self.updated_at = at.max(self.updated_at).max(self.created_at);
    }

    /// Value of a scannable field rendered as text
    pub fn field_value(&self, field: RecordField) -> String {
        match field {
            RecordField::ReferenceNumber => self.reference_number.clone(),
            RecordField::Kind => self.kind.as_str().to_string(),
            RecordField::Grade => self.grade.clone(),
            RecordField::Section => self.section.clone(),
            RecordField::Date => self.date.format("%Y-%m-%d").to_string(),
            RecordField::TimeSlot => self.time_slot.clone(),
            RecordField::Teacher => self.teacher.clone(),
            RecordField::Subject => self.subject.clone(),
        }
    }
}

/// Client request to create a booking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBooking {
    #[serde(rename = "type")]
    pub kind: BookingKind,
    pub grade: String,
    #[serde(default)]
    pub section: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub time_slot: String,
    #[serde(default)]
    pub teacher: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub notes: String,
}

/// Changed fields of an update request; `None` leaves a field as is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingPatch {
    #[serde(default, rename = "type")]
    pub kind: Option<BookingKind>,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub time_slot: Option<String>,
    #[serde(default)]
    pub teacher: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl BookingPatch {
    /// Whether the patch touches a field that feeds the canonical key
    pub fn changes_identity(&self) -> bool {
        self.kind.is_some()
            || self.grade.is_some()
            || self.section.is_some()
            || self.date.is_some()
            || self.time_slot.is_some()
    }
}

/// Record attributes that can be used for a linear scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    ReferenceNumber,
    Kind,
    Grade,
    Section,
    Date,
    TimeSlot,
    Teacher,
    Subject,
}

impl std::str::FromStr for RecordField {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "referenceNumber" | "reference_number" => Ok(RecordField::ReferenceNumber),
            "type" | "kind" => Ok(RecordField::Kind),
            "grade" | "classroom" => Ok(RecordField::Grade),
            "section" => Ok(RecordField::Section),
            "date" => Ok(RecordField::Date),
            "timeSlot" | "time_slot" => Ok(RecordField::TimeSlot),
            "teacher" => Ok(RecordField::Teacher),
            "subject" => Ok(RecordField::Subject),
            other => Err(crate::Error::InvalidInput(format!("unknown record field: {}", other))),
        }
    }
}

/// Severity of a data-loss alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Warning => f.write_str("WARNING"),
            AlertSeverity::Critical => f.write_str("CRITICAL"),
        }
    }
}

/// Unexplained drop in the ledger's record count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub loss_count: usize,
    pub previous_count: usize,
    pub current_count: usize,
}

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a booking reference number, e.g. `BK-20250301-7KQ2XM`
///
/// The date part is the creation day; the suffix is random.
pub fn generate_reference_number(at: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
        .collect();
    format!("BK-{}-{}", at.format("%Y%m%d"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record() -> BookingRecord {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).unwrap();
        BookingRecord::from_new(
            NewBooking {
                kind: BookingKind::Regular,
                grade: "10".to_string(),
                section: "1".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                time_slot: "الحصة الأولى".to_string(),
                teacher: "A".to_string(),
                phone: String::new(),
                subject: "Physics".to_string(),
                notes: String::new(),
            },
            "BK-20250301-AAAAAA".to_string(),
            at,
        )
    }

    #[test]
    fn test_record_serializes_with_camel_case_and_type() {
        let json = serde_json::to_value(sample_record()).unwrap();
        assert_eq!(json["referenceNumber"], "BK-20250301-AAAAAA");
        assert_eq!(json["type"], "regular");
        assert_eq!(json["timeSlot"], "الحصة الأولى");
        assert_eq!(json["date"], "2025-03-01");
        assert!(json.get("provenance").is_none());
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let mut json = serde_json::to_value(sample_record()).unwrap();
        json["roomColor"] = Value::String("blue".to_string());

        let record: BookingRecord = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(record.extra.get("roomColor"), Some(&Value::String("blue".to_string())));
        assert_eq!(serde_json::to_value(&record).unwrap(), json);
    }

    #[test]
    fn test_provenance_round_trip() {
        let mut record = sample_record();
        record.provenance = Some(MigrationProvenance {
            original_key: "10-1-الأحد-2".to_string(),
            original_format: OriginalFormat::Legacy,
            migrated_at: Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap(),
            original_day: Some("الأحد".to_string()),
            original_period: Some("2".to_string()),
            original_classroom_id: None,
            original_time_slot: None,
        });

        let text = serde_json::to_string(&record).unwrap();
        assert!(text.contains("\"originalFormat\":\"legacy\""));
        let back: BookingRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_apply_patch_bumps_updated_at() {
        let mut record = sample_record();
        let later = record.created_at + chrono::Duration::minutes(5);
        record.apply_patch(
            &BookingPatch {
                teacher: Some("B".to_string()),
                ..Default::default()
            },
            later,
        );
        assert_eq!(record.teacher, "B");
        assert_eq!(record.subject, "Physics");
        assert_eq!(record.updated_at, later);
    }

    #[test]
    fn test_apply_patch_never_moves_updated_at_backwards() {
        let mut record = sample_record();
        let earlier = record.created_at - chrono::Duration::hours(1);
        record.apply_patch(&BookingPatch::default(), earlier);
        assert_eq!(record.updated_at, record.created_at);
    }

    #[test]
    fn test_patch_identity_detection() {
        assert!(!BookingPatch { teacher: Some("X".into()), ..Default::default() }.changes_identity());
        assert!(BookingPatch { time_slot: Some("3".into()), ..Default::default() }.changes_identity());
    }

    #[test]
    fn test_reference_number_shape() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).unwrap();
        let reference = generate_reference_number(at);
        assert!(reference.starts_with("BK-20250301-"));
        assert_eq!(reference.len(), "BK-20250301-".len() + 6);
    }

    #[test]
    fn test_record_field_parsing() {
        assert_eq!("timeSlot".parse::<RecordField>().unwrap(), RecordField::TimeSlot);
        assert_eq!("type".parse::<RecordField>().unwrap(), RecordField::Kind);
        assert!("colour".parse::<RecordField>().is_err());
    }

    #[test]
    fn test_alert_severity_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&AlertSeverity::Critical).unwrap(), "\"CRITICAL\"");
        assert_eq!(AlertSeverity::Warning.to_string(), "WARNING");
    }
}
