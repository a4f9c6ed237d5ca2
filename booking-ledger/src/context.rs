//! Booking context
//!
//! One explicitly constructed object owning every long-lived component:
//! catalog, change bus, backup scheduler, ledger, recovery engine and health
//! monitor. Anything that needs one of them is handed the context (or the
//! component) by reference.

use crate::backup::BackupScheduler;
use crate::health::{HealthMonitor, HealthPaths};
use crate::keys::canonical_key;
use crate::migration::MigrationEngine;
use crate::recovery::RecoveryEngine;
use crate::store::Ledger;
use crate::tasks::ScheduledTask;
use booking_common::catalog::Catalog;
use booking_common::config::{ConflictPolicy, DataPaths, LedgerConfig};
use booking_common::events::{ChangeBus, LedgerEvent, Subscription};
use booking_common::models::{generate_reference_number, BookingPatch, NewBooking};
use booking_common::time::now;
use booking_common::{BookingKind, BookingRecord, Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct BookingContext {
    config: LedgerConfig,
    paths: DataPaths,
    catalog: Arc<Catalog>,
    bus: ChangeBus,
    backups: Arc<BackupScheduler>,
    ledger: Arc<Ledger>,
    recovery: Arc<RecoveryEngine>,
    health: Arc<HealthMonitor>,
    periodic_backup: Mutex<Option<ScheduledTask>>,
}

impl BookingContext {
    /// Build every component over the data directory `data_dir`
    ///
    /// Creates the directory layout and writes the default catalog files if
    /// they are missing.
    pub async fn open(config: LedgerConfig, data_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let paths = DataPaths::new(data_dir);
        paths.ensure_dirs()?;
        info!("Data directory: {}", paths.root.display());

        let catalog = Arc::new(Catalog::load_or_init(&paths.classrooms, &paths.timeslots)?);
        let bus = ChangeBus::new(config.events.capacity);
        let backups = Arc::new(BackupScheduler::open(&paths.backups, config.backup.clone())?);
        backups.track(&paths.classrooms);
        backups.track(&paths.timeslots);

        let ledger = Arc::new(Ledger::open(&paths.bookings, Arc::clone(&backups), bus.clone()).await);
        let recovery = Arc::new(RecoveryEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&backups),
            config.recovery.clone(),
            &paths.recovery_report,
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&ledger),
            Arc::clone(&backups),
            Arc::clone(&recovery),
            config.health.clone(),
            HealthPaths {
                alerts: paths.alerts.clone(),
                report: paths.health_report.clone(),
            },
        ));

        Ok(Self {
            config,
            paths,
            catalog,
            bus,
            backups,
            ledger,
            recovery,
            health,
            periodic_backup: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn backups(&self) -> &Arc<BackupScheduler> {
        &self.backups
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// A migration engine over this context's ledger
    pub fn migration(&self) -> MigrationEngine {
        MigrationEngine::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.backups),
            Arc::clone(&self.catalog),
            self.paths.root.clone(),
        )
    }

    /// Create a booking under its canonical key
    ///
    /// Under the default last-write-wins policy a booking for an occupied
    /// slot replaces the existing one; under `reject` it fails with
    /// `Conflict`.
    pub async fn create_booking(&self, new: NewBooking) -> Result<(String, BookingRecord)> {
        validate_new(&new)?;
        let at = now();
        let record = BookingRecord::from_new(new, generate_reference_number(at), at);
        let key = canonical_key(&record);

        match self.config.ledger.conflict_policy {
            ConflictPolicy::LastWriteWins => self.ledger.upsert(&key, record.clone()).await?,
            ConflictPolicy::Reject => self.ledger.insert_new(&key, record.clone()).await?,
        };
        info!(key = %key, reference = %record.reference_number, "Booking created");
        Ok((key, record))
    }

    pub async fn update_booking(
        &self,
        reference_number: &str,
        patch: BookingPatch,
    ) -> Result<(String, BookingRecord)> {
        if patch.grade.as_deref().map_or(false, |g| g.trim().is_empty()) {
            return Err(Error::InvalidInput("grade must not be empty".to_string()));
        }
        self.ledger
            .update_by_reference(reference_number, &patch, self.config.ledger.conflict_policy)
            .await
    }

    pub async fn delete_booking(&self, reference_number: &str) -> Result<(String, BookingRecord)> {
        self.ledger.delete_by_reference(reference_number).await
    }

    pub async fn bookings(&self) -> BTreeMap<String, BookingRecord> {
        self.ledger.get_all().await
    }

    pub fn subscribe(&self, name: &str) -> Subscription {
        self.bus.register(name)
    }

    /// Full-state event for a subscriber catching up after (re)connecting
    pub async fn full_state_event(&self) -> LedgerEvent {
        self.ledger.full_state_event("snapshot").await
    }

    /// Restore a backup over the file it was taken from
    ///
    /// Ledger backups go through the ledger so subscribers see the change.
    pub async fn restore_backup(&self, file_name: &str) -> Result<PathBuf> {
        let entry = self
            .backups
            .entry(file_name)
            .await
            .ok_or_else(|| Error::NotFound(format!("backup {}", file_name)))?;
        let ledger_file = self.ledger.path().file_name().map(|n| n.to_string_lossy().to_string());
        if ledger_file.as_deref() == Some(entry.source_file_name.as_str()) {
            self.ledger.restore_backup(file_name).await?;
            Ok(self.ledger.path().to_path_buf())
        } else {
            self.backups.restore_snapshot(file_name).await
        }
    }

    /// Reconcile the backup catalog, then start periodic backups and the
    /// health monitor
    pub async fn start_background(&self) {
        match self.backups.reconcile().await {
            Ok(summary) if !summary.dropped.is_empty() || !summary.adopted.is_empty() => info!(
                "Backup catalog reconciled: {} dropped, {} adopted",
                summary.dropped.len(),
                summary.adopted.len()
            ),
            Ok(_) => {}
            Err(e) => warn!("Backup catalog reconcile failed: {}", e),
        }

        let mut periodic = self.periodic_backup.lock().await;
        if periodic.is_none() {
            *periodic = Some(self.backups.spawn_periodic());
        }
        drop(periodic);

        self.health.start().await;
    }

    /// Stop background tasks; in-flight ticks finish first
    pub async fn shutdown(&self) {
        self.health.stop().await;
        let periodic = self.periodic_backup.lock().await.take();
        if let Some(task) = periodic {
            task.stop().await;
        }
        info!("Background tasks stopped");
    }
}

fn validate_new(new: &NewBooking) -> Result<()> {
    if new.grade.trim().is_empty() {
        return Err(Error::InvalidInput("grade must not be empty".to_string()));
    }
    if new.kind == BookingKind::Regular && new.time_slot.trim().is_empty() {
        return Err(Error::InvalidInput(
            "a regular booking needs a time slot".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn booking(teacher: &str) -> NewBooking {
        NewBooking {
            kind: BookingKind::Regular,
            grade: "10".to_string(),
            section: "1".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            time_slot: "الحصة الأولى".to_string(),
            teacher: teacher.to_string(),
            phone: String::new(),
            subject: String::new(),
            notes: String::new(),
        }
    }

    #[tokio::test]
    async fn test_same_slot_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let ctx = BookingContext::open(LedgerConfig::default(), dir.path()).await.unwrap();

        let (key_a, _) = ctx.create_booking(booking("A")).await.unwrap();
        let (key_b, _) = ctx.create_booking(booking("B")).await.unwrap();

        assert_eq!(key_a, key_b);
        let all = ctx.bookings().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[&key_a].teacher, "B");
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_second_booking() {
        let dir = TempDir::new().unwrap();
        let mut config = LedgerConfig::default();
        config.ledger.conflict_policy = ConflictPolicy::Reject;
        let ctx = BookingContext::open(config, dir.path()).await.unwrap();

        ctx.create_booking(booking("A")).await.unwrap();
        let err = ctx.create_booking(booking("B")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(ctx.bookings().await.values().next().unwrap().teacher, "A");
    }

    #[tokio::test]
    async fn test_invalid_booking_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = BookingContext::open(LedgerConfig::default(), dir.path()).await.unwrap();

        let mut no_slot = booking("A");
        no_slot.time_slot = " ".to_string();
        assert!(matches!(
            ctx.create_booking(no_slot).await.unwrap_err(),
            Error::InvalidInput(_)
        ));

        let mut assembly = booking("A");
        assembly.kind = BookingKind::Assembly;
        assembly.time_slot = String::new();
        let (key, _) = ctx.create_booking(assembly).await.unwrap();
        assert_eq!(key, "assembly-10-1-2025-03-01");
    }

    #[tokio::test]
    async fn test_update_and_delete_by_reference() {
        let dir = TempDir::new().unwrap();
        let ctx = BookingContext::open(LedgerConfig::default(), dir.path()).await.unwrap();
        let (_, created) = ctx.create_booking(booking("A")).await.unwrap();

        let (_, updated) = ctx
            .update_booking(
                &created.reference_number,
                BookingPatch {
                    subject: Some("Physics".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.subject, "Physics");
        assert_eq!(updated.created_at, created.created_at);

        ctx.delete_booking(&created.reference_number).await.unwrap();
        assert!(ctx.bookings().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_backup_dispatches_by_source_file() {
        let dir = TempDir::new().unwrap();
        let ctx = BookingContext::open(LedgerConfig::default(), dir.path()).await.unwrap();
        ctx.create_booking(booking("A")).await.unwrap();
        let taken = ctx.backups().snapshot_periodic().await;
        ctx.delete_booking(&ctx.bookings().await.values().next().unwrap().reference_number.clone())
            .await
            .unwrap();

        let ledger_backup = taken.iter().find(|s| s.logical_name == "bookings").unwrap();
        let restored = ctx.restore_backup(&ledger_backup.file_name).await.unwrap();
        assert_eq!(restored, ctx.paths().bookings);
        assert_eq!(ctx.bookings().await.len(), 1);

        let catalog_backup = taken.iter().find(|s| s.logical_name == "timeslots").unwrap();
        let restored = ctx.restore_backup(&catalog_backup.file_name).await.unwrap();
        assert_eq!(restored, ctx.paths().timeslots);
    }

    #[tokio::test]
    async fn test_open_writes_default_catalog() {
        let dir = TempDir::new().unwrap();
        let ctx = BookingContext::open(LedgerConfig::default(), dir.path()).await.unwrap();
        assert!(ctx.paths().classrooms.exists());
        assert!(ctx.paths().timeslots.exists());
        assert_eq!(ctx.catalog().slot_name(1), Some("الحصة الأولى"));
    }

    #[tokio::test]
    async fn test_background_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = LedgerConfig::default();
        config.health.random_backup_probability = 0.0;
        let ctx = BookingContext::open(config, dir.path()).await.unwrap();

        ctx.start_background().await;
        assert_eq!(ctx.health().state().await, crate::health::MonitorState::Running);
        ctx.shutdown().await;
        assert_eq!(ctx.health().state().await, crate::health::MonitorState::Stopped);
    }
}
