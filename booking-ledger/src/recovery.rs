//! Ledger recovery
//!
//! Rebuilds the ledger file from the best available source:
//!
//! 1. The primary ledger file
//! 2. The ledger's in-memory mirror of its last committed state
//! 3. Backups of the ledger in the backup directory (and any extra
//!    directories configured), newest first
//!
//! The first source holding at least one record wins. The current ledger
//! file is copied to an emergency snapshot before it is overwritten, and
//! every step is logged to `recovery_report.json`. The ledger's writer lock
//! is held for the whole run, so a write either lands before the sources are
//! read or after the rebuilt file is in place.

use crate::backup::{sha256_hex, BackupClass, BackupScheduler};
use crate::store::{write_atomic, Ledger, LedgerDocument, LedgerLock};
use booking_common::config::RecoverySettings;
use booking_common::time::now;
use booking_common::{BookingRecord, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info, warn};

/// Where the restored records came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoverySource {
    Primary,
    Fallback,
    Backup { path: PathBuf },
}

impl std::fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySource::Primary => f.write_str("primary ledger file"),
            RecoverySource::Fallback => f.write_str("in-memory fallback"),
            RecoverySource::Backup { path } => write!(f, "backup {}", path.display()),
        }
    }
}

/// Persisted outcome of one recovery run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub timestamp: DateTime<Utc>,
    /// False when no source held any records
    pub recovered: bool,
    pub source: Option<RecoverySource>,
    pub restored_count: usize,
    pub emergency_backup: Option<String>,
    pub steps: Vec<String>,
}

/// Records written back to the ledger, with the run's report
#[derive(Debug, Clone)]
pub struct RestoredRecordSet {
    pub records: BTreeMap<String, BookingRecord>,
    pub report: RecoveryReport,
}

struct Candidate {
    source: RecoverySource,
    document: LedgerDocument,
}

pub struct RecoveryEngine {
    ledger: Arc<Ledger>,
    backups: Arc<BackupScheduler>,
    settings: RecoverySettings,
    report_path: PathBuf,
    running: AtomicBool,
}

/// Clears the running flag when a recovery run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RecoveryEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        backups: Arc<BackupScheduler>,
        settings: RecoverySettings,
        report_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            backups,
            settings,
            report_path: report_path.into(),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Rebuild the ledger from the best available source
    ///
    /// Fails with `Conflict` if a recovery is already in progress. Finding
    /// nothing to restore is not an error: the ledger is left empty and the
    /// report says so.
    pub async fn recover(&self) -> Result<RestoredRecordSet> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Conflict("recovery already in progress".to_string()));
        }
        let _guard = RunGuard(&self.running);

        // Writes wait until the rebuilt ledger is in place
        let exclusive = self.ledger.lock_exclusive().await;

        let mut steps = Vec::new();
        step(&mut steps, "Recovery started".to_string());

        let chosen = self.select_candidate(&exclusive, &mut steps).await;
        self.pause().await;

        let emergency = self
            .backups
            .snapshot(self.ledger.path(), BackupClass::Emergency)
            .await
            .map_err(|e| {
                error!("Emergency snapshot failed, ledger left untouched: {}", e);
                e
            })?;
        let emergency_backup = emergency.map(|s| s.file_name);
        match &emergency_backup {
            Some(name) => step(&mut steps, format!("Current ledger saved as {}", name)),
            None => step(&mut steps, "No ledger file to save before rebuild".to_string()),
        }
        self.pause().await;

        let (source, document) = match chosen {
            Some(c) => (Some(c.source), c.document),
            None => {
                step(
                    &mut steps,
                    "Nothing recoverable: no source holds any records, ledger left empty".to_string(),
                );
                (None, LedgerDocument::default())
            }
        };

        let records = document.records.clone();
        exclusive.replace_document(document, "recovery").await?;
        step(&mut steps, format!("Ledger rebuilt with {} records", records.len()));

        let report = RecoveryReport {
            timestamp: now(),
            recovered: source.is_some(),
            source,
            restored_count: records.len(),
            emergency_backup,
            steps,
        };
        self.persist_report(&report).await;

        Ok(RestoredRecordSet { records, report })
    }

    async fn select_candidate(&self, ledger: &LedgerLock<'_>, steps: &mut Vec<String>) -> Option<Candidate> {
        match ledger.load_document().await {
            Ok(doc) if !doc.records.is_empty() => {
                step(steps, format!("Primary ledger holds {} records", doc.records.len()));
                return Some(Candidate {
                    source: RecoverySource::Primary,
                    document: doc,
                });
            }
            Ok(_) => step(steps, "Primary ledger holds no records".to_string()),
            Err(e) => step(steps, format!("Primary ledger unreadable: {}", e)),
        }

        let mirror = self.ledger.mirror().await;
        if !mirror.is_empty() {
            step(steps, format!("In-memory fallback holds {} records", mirror.len()));
            return Some(Candidate {
                source: RecoverySource::Fallback,
                document: LedgerDocument::from_records(mirror),
            });
        }
        step(steps, "In-memory fallback is empty".to_string());

        for path in self.backup_candidates().await {
            match self.read_backup(&path).await {
                Ok(doc) if !doc.records.is_empty() => {
                    step(
                        steps,
                        format!("Backup {} holds {} records", path.display(), doc.records.len()),
                    );
                    return Some(Candidate {
                        source: RecoverySource::Backup { path },
                        document: doc,
                    });
                }
                Ok(_) => step(steps, format!("Backup {} holds no records", path.display())),
                Err(e) => step(steps, format!("Backup {} rejected: {}", path.display(), e)),
            }
        }
        None
    }

    /// Backups of the ledger file across all backup directories, newest first
    async fn backup_candidates(&self) -> Vec<PathBuf> {
        let prefix = self
            .ledger
            .path()
            .file_stem()
            .map(|s| format!("{}_", s.to_string_lossy()))
            .unwrap_or_default();

        let mut dirs = vec![self.backups.dir().to_path_buf()];
        dirs.extend(self.settings.extra_backup_dirs.iter().cloned());

        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        for dir in dirs {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping backup directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if !is_ledger_backup(&name, &prefix) {
                    continue;
                }
                let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(t) => t,
                    Err(_) => SystemTime::UNIX_EPOCH,
                };
                found.push((modified, entry.path()));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        found.into_iter().map(|(_, path)| path).collect()
    }

    async fn read_backup(&self, path: &Path) -> Result<LedgerDocument> {
        let bytes = tokio::fs::read(path).await?;
        if path.parent() == Some(self.backups.dir()) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Some(entry) = self.backups.entry(&name).await {
                if !entry.sha256.is_empty() && entry.sha256 != sha256_hex(&bytes) {
                    return Err(Error::CorruptData {
                        path: path.display().to_string(),
                        reason: "checksum mismatch".to_string(),
                    });
                }
            }
        }
        LedgerDocument::parse(&bytes, path)
    }

    async fn persist_report(&self, report: &RecoveryReport) {
        let result = match serde_json::to_vec_pretty(report) {
            Ok(bytes) => write_atomic(&self.report_path, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Could not write recovery report {}: {}", self.report_path.display(), e);
        }
    }

    async fn pause(&self) {
        let delay = self.settings.step_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn step(steps: &mut Vec<String>, message: String) {
    info!("Recovery: {}", message);
    steps.push(message);
}

/// Backup naming convention: `{ledger stem}_..backup.._{stamp}.json`
fn is_ledger_backup(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix) && name.contains("backup") && name.ends_with(".json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::canonical_key;
    use booking_common::config::BackupSettings;
    use booking_common::events::ChangeBus;
    use booking_common::models::NewBooking;
    use booking_common::BookingKind;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        ledger: Arc<Ledger>,
        backups: Arc<BackupScheduler>,
        engine: RecoveryEngine,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let backups = Arc::new(
            BackupScheduler::open(root.join("backups"), BackupSettings::default()).unwrap(),
        );
        let ledger = Arc::new(
            Ledger::open(root.join("bookings.json"), Arc::clone(&backups), ChangeBus::new(16)).await,
        );
        let engine = RecoveryEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&backups),
            RecoverySettings {
                extra_backup_dirs: Vec::new(),
                step_delay_ms: 0,
            },
            root.join("recovery_report.json"),
        );
        Fixture {
            _dir: dir,
            root,
            ledger,
            backups,
            engine,
        }
    }

    fn records(n: usize) -> BTreeMap<String, BookingRecord> {
        (0..n)
            .map(|i| {
                let record = BookingRecord::from_new(
                    NewBooking {
                        kind: BookingKind::Regular,
                        grade: "10".to_string(),
                        section: "1".to_string(),
                        date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                        time_slot: format!("slot {}", i),
                        teacher: "T".to_string(),
                        phone: String::new(),
                        subject: String::new(),
                        notes: String::new(),
                    },
                    format!("BK-{}", i),
                    now(),
                );
                (canonical_key(&record), record)
            })
            .collect()
    }

    fn write_backup(dir: &Path, name: &str, records: &BTreeMap<String, BookingRecord>) {
        let bytes = LedgerDocument::from_records(records.clone()).to_json().unwrap();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[tokio::test]
    async fn test_empty_primary_restores_from_backup() {
        let fx = fixture().await;
        std::fs::write(fx.ledger.path(), b"{}").unwrap();
        write_backup(fx.backups.dir(), "bookings_backup_2025-03-01T08-00-00-000Z.json", &records(12));

        let restored = fx.engine.recover().await.unwrap();

        assert_eq!(restored.records.len(), 12);
        assert!(restored.report.recovered);
        assert!(matches!(restored.report.source, Some(RecoverySource::Backup { .. })));
        assert_eq!(fx.ledger.count().await, 12);
        assert!(fx.root.join("recovery_report.json").exists());
    }

    #[tokio::test]
    async fn test_primary_with_records_is_preferred() {
        let fx = fixture().await;
        fx.ledger.replace_all(records(3), "test").await.unwrap();
        write_backup(fx.backups.dir(), "bookings_backup_2025-03-01T08-00-00-000Z.json", &records(12));

        let restored = fx.engine.recover().await.unwrap();
        assert_eq!(restored.report.source, Some(RecoverySource::Primary));
        assert_eq!(fx.ledger.count().await, 3);
    }

    #[tokio::test]
    async fn test_fallback_used_when_file_is_corrupt() {
        let fx = fixture().await;
        fx.ledger.replace_all(records(5), "test").await.unwrap();
        std::fs::write(fx.ledger.path(), b"not json").unwrap();

        let restored = fx.engine.recover().await.unwrap();
        assert_eq!(restored.report.source, Some(RecoverySource::Fallback));
        assert_eq!(fx.ledger.count().await, 5);

        // The corrupt bytes were saved before being overwritten
        let emergency = restored.report.emergency_backup.unwrap();
        assert!(emergency.starts_with("bookings_emergency_"));
        assert_eq!(std::fs::read(fx.backups.dir().join(emergency)).unwrap(), b"not json");
    }

    #[tokio::test]
    async fn test_newest_backup_wins() {
        let fx = fixture().await;
        std::fs::write(fx.ledger.path(), b"{}").unwrap();
        write_backup(fx.backups.dir(), "bookings_backup_old.json", &records(4));
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_backup(fx.backups.dir(), "bookings_backup_new.json", &records(7));

        let restored = fx.engine.recover().await.unwrap();
        assert_eq!(restored.records.len(), 7);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_disqualifies_backup() {
        let fx = fixture().await;
        fx.ledger.replace_all(records(6), "test").await.unwrap();
        let snapshot = fx
            .backups
            .snapshot_before_write(fx.ledger.path())
            .await
            .unwrap()
            .unwrap();
        write_backup(fx.backups.dir(), &snapshot.file_name, &records(9));
        std::fs::write(fx.ledger.path(), b"{}").unwrap();

        // Fresh ledger so the mirror does not hold the records
        let ledger = Arc::new(
            Ledger::open(fx.ledger.path().to_path_buf(), Arc::clone(&fx.backups), ChangeBus::new(4)).await,
        );
        let engine = RecoveryEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&fx.backups),
            RecoverySettings {
                extra_backup_dirs: Vec::new(),
                step_delay_ms: 0,
            },
            fx.root.join("recovery_report.json"),
        );
        let restored = engine.recover().await.unwrap();
        assert!(!restored.report.recovered);
        assert!(restored
            .report
            .steps
            .iter()
            .any(|s| s.contains("checksum mismatch")));
    }

    #[tokio::test]
    async fn test_nothing_recoverable_leaves_empty_ledger() {
        let fx = fixture().await;
        std::fs::write(fx.ledger.path(), b"{}").unwrap();

        let restored = fx.engine.recover().await.unwrap();
        assert!(!restored.report.recovered);
        assert_eq!(restored.report.restored_count, 0);
        assert!(restored.report.steps.iter().any(|s| s.contains("Nothing recoverable")));
        assert_eq!(fx.ledger.count().await, 0);
    }

    #[tokio::test]
    async fn test_extra_backup_dirs_are_scanned() {
        let fx = fixture().await;
        let extra = fx.root.join("external");
        std::fs::create_dir_all(&extra).unwrap();
        write_backup(&extra, "bookings_backup_external.json", &records(2));
        // Backups of other files are never candidates
        write_backup(fx.backups.dir(), "classrooms_backup_x.json", &records(8));

        let engine = RecoveryEngine::new(
            Arc::clone(&fx.ledger),
            Arc::clone(&fx.backups),
            RecoverySettings {
                extra_backup_dirs: vec![extra],
                step_delay_ms: 0,
            },
            fx.root.join("recovery_report.json"),
        );
        let restored = engine.recover().await.unwrap();
        assert_eq!(restored.records.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_during_recovery_is_kept() {
        let fx = fixture().await;
        let engine = Arc::new(RecoveryEngine::new(
            Arc::clone(&fx.ledger),
            Arc::clone(&fx.backups),
            RecoverySettings {
                extra_backup_dirs: Vec::new(),
                step_delay_ms: 200,
            },
            fx.root.join("recovery_report.json"),
        ));
        let all = records(2);
        let mut entries = all.into_iter();
        let (key_a, record_a) = entries.next().unwrap();
        let (key_b, record_b) = entries.next().unwrap();
        fx.ledger.upsert(&key_a, record_a).await.unwrap();

        let running = Arc::clone(&engine);
        let recovery = tokio::spawn(async move { running.recover().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(engine.is_running());

        // Waits for the rebuild, then commits on top of it
        fx.ledger.upsert(&key_b, record_b).await.unwrap();
        let restored = recovery.await.unwrap().unwrap();

        assert_eq!(restored.records.len(), 1);
        let after = fx.ledger.get_all().await;
        assert_eq!(after.len(), 2);
        assert!(after.contains_key(&key_b));
    }

    #[test]
    fn test_backup_name_filter() {
        assert!(is_ledger_backup("bookings_backup_x.json", "bookings_"));
        assert!(is_ledger_backup("bookings_auto_backup_x.json", "bookings_"));
        assert!(!is_ledger_backup("bookings_emergency_x.json", "bookings_"));
        assert!(!is_ledger_backup("bookings_pre_migration_x.json", "bookings_"));
        assert!(!is_ledger_backup("classrooms_backup_x.json", "bookings_"));
        assert!(!is_ledger_backup("catalog.json", "bookings_"));
    }
}
