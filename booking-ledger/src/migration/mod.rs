//! Ledger migration
//!
//! Rewrites every entry of the ledger into the current record layout:
//! entries are classified ([`shape::classify`]), converted, and stored under
//! their canonical key. Entries that cannot be converted stay in the file
//! untouched and are counted as skipped.
//!
//! A migration run always completes with a [`MigrationReport`]. Before the
//! converted ledger is written the current file is saved as a pre-migration
//! snapshot, whether or not anything changed. Ledger writes wait while a
//! migration is between reading the file and writing the converted one.

mod convert;
mod shape;

pub use convert::{grade_section_from_key, parse_weekday, Converter};
pub use shape::{classify, RecordShape, Unclassified};

use crate::backup::{BackupClass, BackupScheduler};
use crate::keys::canonical_key;
use crate::store::{write_atomic, Ledger, LedgerDocument};
use booking_common::catalog::Catalog;
use booking_common::time::{file_stamp, now, today};
use booking_common::{BookingKind, Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Converted entries per original layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatCounts {
    pub old: usize,
    pub legacy: usize,
    pub modern: usize,
}

impl FormatCounts {
    fn bump(&mut self, shape: RecordShape) {
        match shape {
            RecordShape::Old => self.old += 1,
            RecordShape::Legacy => self.legacy += 1,
            RecordShape::Modern => self.modern += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub regular: usize,
    pub assembly: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub timestamp: DateTime<Utc>,
    pub dry_run: bool,
    /// Entries in the ledger before migration
    pub original_count: usize,
    /// Records in the ledger after migration
    pub migrated_count: usize,
    /// Entries left in their original form
    pub skipped: usize,
    /// Converted records that replaced another on the same canonical key
    pub collisions: usize,
    pub by_format: FormatCounts,
    pub by_kind: KindCounts,
    /// Distinct booking dates covered, ascending
    pub dates: Vec<NaiveDate>,
    pub backup_file: Option<String>,
    pub report_file: Option<PathBuf>,
}

pub struct MigrationEngine {
    ledger: Arc<Ledger>,
    backups: Arc<BackupScheduler>,
    catalog: Arc<Catalog>,
    report_dir: PathBuf,
    today: Option<NaiveDate>,
}

impl MigrationEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        backups: Arc<BackupScheduler>,
        catalog: Arc<Catalog>,
        report_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            backups,
            catalog,
            report_dir: report_dir.into(),
            today: None,
        }
    }

    /// Resolve weekday names and missing dates against a fixed date
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Convert the ledger in place and persist the report
    pub async fn migrate_all(&self) -> Result<MigrationReport> {
        let started = now();
        let exclusive = self.ledger.lock_exclusive().await;
        let (document, mut report) = self.convert_ledger(started, false).await?;

        let snapshot = self
            .backups
            .snapshot(self.ledger.path(), BackupClass::Migration)
            .await?;
        report.backup_file = snapshot.map(|s| s.file_name);

        exclusive.replace_document(document, "migration").await?;

        let report_path = self
            .report_dir
            .join(format!("migration_report_{}.json", file_stamp(started)));
        report.report_file = Some(report_path.clone());
        let bytes = serde_json::to_vec_pretty(&report)?;
        if let Err(e) = write_atomic(&report_path, &bytes).await {
            warn!("Could not write migration report {}: {}", report_path.display(), e);
        }

        info!(
            "✓ Migration complete: {} -> {} records ({} old, {} legacy, {} modern, {} skipped, {} collisions)",
            report.original_count,
            report.migrated_count,
            report.by_format.old,
            report.by_format.legacy,
            report.by_format.modern,
            report.skipped,
            report.collisions
        );
        Ok(report)
    }

    /// Classify and convert without writing anything
    pub async fn plan(&self) -> Result<MigrationReport> {
        let (_, report) = self.convert_ledger(now(), true).await?;
        Ok(report)
    }

    async fn convert_ledger(
        &self,
        started: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<(LedgerDocument, MigrationReport)> {
        let entries = self.read_entries().await?;
        let today = self.today.unwrap_or_else(today);
        let converter = Converter::new(&self.catalog, today, started);

        let mut document = LedgerDocument::default();
        let mut by_format = FormatCounts::default();
        let mut collisions = 0;

        for (key, entry) in &entries {
            let converted = classify(entry)
                .map_err(|e| Error::InvalidInput(e.to_string()))
                .and_then(|shape| Ok((shape, converter.convert(key, shape, entry)?)));
            match converted {
                Ok((shape, record)) => {
                    by_format.bump(shape);
                    let new_key = canonical_key(&record);
                    if document.records.insert(new_key.clone(), record).is_some() {
                        debug!("Migration: {} overwrote an earlier record at {}", key, new_key);
                        collisions += 1;
                    }
                }
                Err(e) => {
                    warn!("Migration: keeping entry {} unchanged: {}", key, e);
                    document.unrecognized.insert(key.clone(), entry.clone());
                }
            }
        }
        // An unconverted entry never shadows a converted record
        document
            .unrecognized
            .retain(|key, _| !document.records.contains_key(key));

        let mut by_kind = KindCounts::default();
        let mut dates = BTreeSet::new();
        for record in document.records.values() {
            match record.kind {
                BookingKind::Regular => by_kind.regular += 1,
                BookingKind::Assembly => by_kind.assembly += 1,
            }
            dates.insert(record.date);
        }

        let report = MigrationReport {
            timestamp: started,
            dry_run,
            original_count: entries.len(),
            migrated_count: document.records.len(),
            skipped: entries.len() - by_format.old - by_format.legacy - by_format.modern,
            collisions,
            by_format,
            by_kind,
            dates: dates.into_iter().collect(),
            backup_file: None,
            report_file: None,
        };
        Ok((document, report))
    }

    /// Raw ledger entries in file order
    async fn read_entries(&self) -> Result<Vec<(String, Value)>> {
        let bytes = match tokio::fs::read(self.ledger.path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        let corrupt = |reason: String| Error::CorruptData {
            path: self.ledger.path().display().to_string(),
            reason,
        };
        match serde_json::from_slice::<Value>(&bytes).map_err(|e| corrupt(e.to_string()))? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(corrupt("top-level value is not an object".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use booking_common::config::BackupSettings;
    use booking_common::events::ChangeBus;
    use booking_common::models::{NewBooking, OriginalFormat};
    use booking_common::BookingRecord;
    use chrono::{Datelike, Weekday};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        ledger: Arc<Ledger>,
        backups: Arc<BackupScheduler>,
        engine: MigrationEngine,
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    async fn fixture(content: Value) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::write(root.join("bookings.json"), serde_json::to_vec(&content).unwrap()).unwrap();
        let backups = Arc::new(
            BackupScheduler::open(root.join("backups"), BackupSettings::default()).unwrap(),
        );
        let ledger = Arc::new(
            Ledger::open(root.join("bookings.json"), Arc::clone(&backups), ChangeBus::new(16)).await,
        );
        let engine = MigrationEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&backups),
            Arc::new(Catalog::default()),
            root.clone(),
        )
        .with_today(day());
        Fixture {
            _dir: dir,
            root,
            ledger,
            backups,
            engine,
        }
    }

    #[tokio::test]
    async fn test_mixed_ledger_migrates() {
        let fx = fixture(json!({
            "old-1": {"classroom_id": 7, "teacher_name": "Z", "time_slot": 1, "date": "2025-03-04"},
            "10-1-sunday": {"day": "الأحد", "period": "2", "teacher": "X"},
            "regular-8-2-2025-03-05-3": {
                "type": "regular", "grade": "8", "section": "2", "date": "2025-03-05",
                "timeSlot": "3", "teacher": "Y"
            },
            "garbage": {"foo": "bar"}
        }))
        .await;

        let report = fx.engine.migrate_all().await.unwrap();

        assert_eq!(report.original_count, 4);
        assert_eq!(report.migrated_count, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.collisions, 0);
        assert_eq!(report.by_format, FormatCounts { old: 1, legacy: 1, modern: 1 });
        assert_eq!(report.by_kind.regular, 3);
        assert_eq!(report.dates.len(), 3);
        assert!(report.backup_file.as_deref().unwrap().starts_with("bookings_pre_migration_"));
        assert!(report.report_file.as_ref().unwrap().exists());

        let records = fx.ledger.get_all().await;
        assert_eq!(records.len(), 3);
        for (key, record) in &records {
            assert_eq!(key, &canonical_key(record));
        }
        let legacy = records
            .values()
            .find(|r| r.teacher == "X")
            .unwrap();
        assert_eq!(legacy.date.weekday(), Weekday::Sun);
        assert!(legacy.date >= day());
        assert_eq!(legacy.time_slot, "2");
        assert_eq!(
            legacy.provenance.as_ref().unwrap().original_format,
            OriginalFormat::Legacy
        );

        // The unconvertible entry is still on disk
        assert_eq!(fx.ledger.status().await.unrecognized_count, 1);
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let fx = fixture(json!({
            "old-1": {"classroom_id": 3, "teacher_name": "Z", "time_slot": 2},
            "legacy": {"day": "Wednesday", "period": "4", "grade": "12", "section": "1"}
        }))
        .await;

        fx.engine.migrate_all().await.unwrap();
        let first = fx.ledger.get_all().await;
        let report = fx.engine.migrate_all().await.unwrap();
        let second = fx.ledger.get_all().await;

        assert_eq!(first, second);
        assert_eq!(report.by_format.modern, 2);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_collisions_resolve_to_later_entry() {
        let fx = fixture(json!({
            "a": {"classroom_id": 1, "teacher_name": "first", "time_slot": 1, "date": "2025-03-02"},
            "b": {"classroom_id": 1, "teacher_name": "second", "time_slot": 1, "date": "2025-03-02"}
        }))
        .await;

        let report = fx.engine.migrate_all().await.unwrap();
        assert_eq!(report.collisions, 1);
        assert_eq!(report.migrated_count, 1);
        let records = fx.ledger.get_all().await;
        assert_eq!(records.values().next().unwrap().teacher, "second");
    }

    #[tokio::test]
    async fn test_plan_writes_nothing() {
        let content = json!({"old-1": {"classroom_id": 3, "teacher_name": "Z", "time_slot": 2}});
        let fx = fixture(content.clone()).await;
        let before = std::fs::read(fx.root.join("bookings.json")).unwrap();

        let report = fx.engine.plan().await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.by_format.old, 1);
        assert_eq!(std::fs::read(fx.root.join("bookings.json")).unwrap(), before);
        assert!(fx.backups.list(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_numeric_grade_and_section_migrate() {
        let fx = fixture(json!({
            "regular-10-1-2025-03-01-1": {
                "type": "regular", "grade": 10, "section": 1, "date": "2025-03-01",
                "timeSlot": 1, "teacher": "A"
            }
        }))
        .await;

        let report = fx.engine.migrate_all().await.unwrap();

        assert_eq!(report.by_format.modern, 1);
        assert_eq!(report.skipped, 0);
        let records = fx.ledger.get_all().await;
        assert_eq!(records.len(), 1);
        let record = records.values().next().unwrap();
        assert_eq!(record.grade, "10");
        assert_eq!(record.section, "1");
    }

    #[tokio::test]
    async fn test_write_during_migration_is_kept() {
        let fx = fixture(json!({
            "old-1": {"classroom_id": 3, "teacher_name": "Z", "time_slot": 2, "date": "2025-03-02"}
        }))
        .await;
        let record = BookingRecord::from_new(
            NewBooking {
                kind: BookingKind::Regular,
                grade: "11".to_string(),
                section: "2".to_string(),
                date: day(),
                time_slot: "الحصة الثالثة".to_string(),
                teacher: "late".to_string(),
                phone: String::new(),
                subject: String::new(),
                notes: String::new(),
            },
            "BK-LATE".to_string(),
            now(),
        );
        let key = canonical_key(&record);

        // The migration takes the writer lock on its first poll; the upsert
        // has to wait for the converted ledger to be written
        let (report, written) = tokio::join!(
            fx.engine.migrate_all(),
            fx.ledger.upsert(&key, record)
        );
        report.unwrap();
        written.unwrap();

        let records = fx.ledger.get_all().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[&key].teacher, "late");
    }

    #[tokio::test]
    async fn test_corrupt_ledger_is_not_migrated() {
        let fx = fixture(json!([1, 2, 3])).await;
        let err = fx.engine.migrate_all().await.unwrap_err();
        assert!(matches!(err, Error::CorruptData { .. }));
        assert!(fx.backups.list(None).await.is_empty());
    }
}
