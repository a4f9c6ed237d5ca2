//! Conversion of old-layout entries into booking records

use super::shape::RecordShape;
use booking_common::catalog::{Catalog, SlotKind};
use booking_common::models::{generate_reference_number, MigrationProvenance, OriginalFormat};
use booking_common::time::next_weekday_on_or_after;
use booking_common::{BookingKind, BookingRecord, Error, Result};
use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde_json::{Map, Value};

/// Converts classified entries, stamping provenance with one migration time
pub struct Converter<'a> {
    catalog: &'a Catalog,
    today: NaiveDate,
    at: DateTime<Utc>,
}

impl<'a> Converter<'a> {
    pub fn new(catalog: &'a Catalog, today: NaiveDate, at: DateTime<Utc>) -> Self {
        Self { catalog, today, at }
    }

    pub fn convert(&self, key: &str, shape: RecordShape, entry: &Value) -> Result<BookingRecord> {
        let fields = entry
            .as_object()
            .ok_or_else(|| Error::InvalidInput("entry is not an object".to_string()))?;
        match shape {
            RecordShape::Old => self.from_old(key, fields),
            RecordShape::Legacy => self.from_legacy(key, fields),
            RecordShape::Modern => self.from_modern(fields),
        }
    }

    fn from_old(&self, key: &str, fields: &Map<String, Value>) -> Result<BookingRecord> {
        let classroom_id = text(fields, &["classroom_id"])
            .ok_or_else(|| Error::InvalidInput("classroom_id is empty".to_string()))?;
        let classroom = classroom_id
            .parse::<u32>()
            .ok()
            .and_then(|id| self.catalog.classroom_by_id(id))
            .ok_or_else(|| Error::InvalidInput(format!("unknown classroom id {}", classroom_id)))?;

        let raw_slot = text(fields, &["time_slot"]).unwrap_or_default();
        let slot = raw_slot
            .parse::<u32>()
            .ok()
            .and_then(|ordinal| self.catalog.slot_by_ordinal(ordinal));
        let (kind, time_slot) = match slot {
            Some(s) if s.kind == SlotKind::Assembly => (BookingKind::Assembly, String::new()),
            Some(s) => (BookingKind::Regular, s.name.clone()),
            None => (BookingKind::Regular, raw_slot.clone()),
        };

        let date = text(fields, &["date"])
            .and_then(|d| parse_date(&d))
            .unwrap_or(self.today);
        let created_at = self.created_at(fields);

        Ok(BookingRecord {
            reference_number: self.reference_number(fields, created_at),
            kind,
            grade: classroom.grade.clone().unwrap_or_else(|| classroom.name.clone()),
            section: classroom.section.clone().unwrap_or_default(),
            date,
            time_slot,
            teacher: text(fields, &["teacher_name", "teacher"]).unwrap_or_default(),
            phone: text(fields, &["phone", "teacher_phone"]).unwrap_or_default(),
            subject: text(fields, &["subject"]).unwrap_or_default(),
            notes: text(fields, &["notes"]).unwrap_or_default(),
            created_at,
            updated_at: created_at,
            provenance: Some(MigrationProvenance {
                original_key: key.to_string(),
                original_format: OriginalFormat::Old,
                migrated_at: self.at,
                original_day: None,
                original_period: None,
                original_classroom_id: Some(classroom_id),
                original_time_slot: Some(raw_slot),
            }),
            extra: Map::new(),
        })
    }

    fn from_legacy(&self, key: &str, fields: &Map<String, Value>) -> Result<BookingRecord> {
        let day = text(fields, &["day"]).unwrap_or_default();
        let weekday = parse_weekday(&day)
            .ok_or_else(|| Error::InvalidInput(format!("unknown school day {:?}", day)))?;
        let period = text(fields, &["period"]).unwrap_or_default();

        let (key_grade, key_section) = grade_section_from_key(key);
        let grade = text(fields, &["grade", "classroom"])
            .or(key_grade)
            .unwrap_or_default();
        let section = text(fields, &["section"]).or(key_section).unwrap_or_default();

        let kind = text(fields, &["type"])
            .and_then(|t| parse_kind(&t))
            .unwrap_or(if period.eq_ignore_ascii_case("assembly") {
                BookingKind::Assembly
            } else {
                BookingKind::Regular
            });
        let created_at = self.created_at(fields);

        Ok(BookingRecord {
            reference_number: self.reference_number(fields, created_at),
            kind,
            grade,
            section,
            date: next_weekday_on_or_after(self.today, weekday),
            time_slot: period.clone(),
            teacher: text(fields, &["teacher", "teacher_name"]).unwrap_or_default(),
            phone: text(fields, &["phone"]).unwrap_or_default(),
            subject: text(fields, &["subject"]).unwrap_or_default(),
            notes: text(fields, &["notes"]).unwrap_or_default(),
            created_at,
            updated_at: created_at,
            provenance: Some(MigrationProvenance {
                original_key: key.to_string(),
                original_format: OriginalFormat::Legacy,
                migrated_at: self.at,
                original_day: Some(day),
                original_period: Some(period),
                original_classroom_id: None,
                original_time_slot: None,
            }),
            extra: Map::new(),
        })
    }

    /// Backfill missing optional fields; a complete record passes unchanged
    fn from_modern(&self, fields: &Map<String, Value>) -> Result<BookingRecord> {
        let mut fields = fields.clone();

        for name in ["grade", "classroom", "section", "timeSlot"] {
            if let Some(Value::Number(n)) = fields.get(name) {
                let as_text = n.to_string();
                fields.insert(name.to_string(), Value::String(as_text));
            }
        }
        if !present(&fields, "type") {
            let slot = fields.get("timeSlot").and_then(Value::as_str).unwrap_or_default();
            let kind = if slot.eq_ignore_ascii_case("assembly") {
                BookingKind::Assembly
            } else {
                BookingKind::Regular
            };
            fields.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        }
        if !present(&fields, "createdAt") {
            fields.insert("createdAt".to_string(), serde_json::to_value(self.at)?);
        }
        if !present(&fields, "updatedAt") {
            let created = fields.get("createdAt").cloned().unwrap_or(Value::Null);
            fields.insert("updatedAt".to_string(), created);
        }
        if !present(&fields, "referenceNumber") {
            let created_at = fields
                .get("createdAt")
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
                .unwrap_or(self.at);
            fields.insert(
                "referenceNumber".to_string(),
                Value::String(generate_reference_number(created_at)),
            );
        }

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| Error::InvalidInput(format!("not a valid booking: {}", e)))
    }

    fn created_at(&self, fields: &Map<String, Value>) -> DateTime<Utc> {
        text(fields, &["createdAt", "created_at"])
            .and_then(|t| parse_timestamp(&t))
            .unwrap_or(self.at)
    }

    fn reference_number(&self, fields: &Map<String, Value>, created_at: DateTime<Utc>) -> String {
        text(fields, &["referenceNumber", "reference_number"])
            .unwrap_or_else(|| generate_reference_number(created_at))
    }
}

fn present(fields: &Map<String, Value>, name: &str) -> bool {
    fields.get(name).map_or(false, |v| !v.is_null())
}

/// First non-empty field among `names`, numbers rendered as text
fn text(fields: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match fields.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_kind(text: &str) -> Option<BookingKind> {
    match text.to_ascii_lowercase().as_str() {
        "regular" => Some(BookingKind::Regular),
        "assembly" => Some(BookingKind::Assembly),
        _ => None,
    }
}

/// School days (Sunday to Thursday), in Arabic or English
pub fn parse_weekday(day: &str) -> Option<Weekday> {
    match day.trim() {
        "الأحد" | "الاحد" => Some(Weekday::Sun),
        "الاثنين" | "الإثنين" => Some(Weekday::Mon),
        "الثلاثاء" => Some(Weekday::Tue),
        "الأربعاء" | "الاربعاء" => Some(Weekday::Wed),
        "الخميس" => Some(Weekday::Thu),
        other => match other.to_ascii_lowercase().as_str() {
            "sunday" | "sun" => Some(Weekday::Sun),
            "monday" | "mon" => Some(Weekday::Mon),
            "tuesday" | "tue" => Some(Weekday::Tue),
            "wednesday" | "wed" => Some(Weekday::Wed),
            "thursday" | "thu" => Some(Weekday::Thu),
            _ => None,
        },
    }
}

/// Grade and section from the first two digit runs of a key, e.g. `10-2-...`
pub fn grade_section_from_key(key: &str) -> (Option<String>, Option<String>) {
    let mut runs = key
        .split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .map(str::to_string);
    (runs.next(), runs.next())
}
