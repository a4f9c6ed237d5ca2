//! Backup scheduling and retention
//!
//! Three triggers produce snapshots of a persisted file:
//! - **Pre-write**: the ledger calls [`BackupScheduler::snapshot_before_write`]
//!   before every overwrite, so the previous state is always recoverable
//! - **Periodic**: [`BackupScheduler::spawn_periodic`] snapshots every tracked
//!   file on a fixed interval, whether or not anything was written
//! - **Special**: recovery and migration take emergency / pre-migration
//!   snapshots through [`BackupScheduler::snapshot`]
//!
//! After each snapshot the class it belongs to is rotated: entries beyond the
//! retention count, oldest first, are deleted.

mod catalog;

pub use catalog::{BackupCatalog, BackupClass, BackupSnapshot, ReconcileSummary};

use crate::store::write_atomic;
use crate::tasks::ScheduledTask;
use booking_common::config::BackupSettings;
use booking_common::time::{file_stamp, now};
use booking_common::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const CATALOG_FILE: &str = "catalog.json";

/// Number of records in a persisted JSON document
///
/// Objects count their keys, arrays their elements; anything unparseable
/// counts as zero.
pub fn count_records(bytes: &[u8]) -> usize {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(serde_json::Value::Object(map)) => map.len(),
        Ok(serde_json::Value::Array(items)) => items.len(),
        _ => 0,
    }
}

/// Hex sha256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Takes, rotates and lists snapshots in one backup directory
pub struct BackupScheduler {
    dir: PathBuf,
    settings: BackupSettings,
    /// Held for the whole snapshot + rotation so catalog updates never interleave
    catalog: Mutex<BackupCatalog>,
    tracked: StdMutex<Vec<PathBuf>>,
}

impl BackupScheduler {
    /// Open the backup directory, creating it if needed, and load its catalog
    pub fn open(dir: impl Into<PathBuf>, settings: BackupSettings) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let catalog = BackupCatalog::load(&dir.join(CATALOG_FILE));
        debug!("Backup catalog loaded with {} entries", catalog.len());
        Ok(Self {
            dir,
            settings,
            catalog: Mutex::new(catalog),
            tracked: StdMutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Include `path` in periodic snapshots
    pub fn track(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut tracked = self.tracked.lock().unwrap_or_else(|p| p.into_inner());
        if !tracked.contains(&path) {
            tracked.push(path);
        }
    }

    pub fn tracked_files(&self) -> Vec<PathBuf> {
        self.tracked.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Retention count for a class
    pub fn keep_for(&self, class: BackupClass) -> usize {
        match class {
            BackupClass::Manual => self.settings.manual_keep,
            BackupClass::Automatic => self.settings.auto_keep,
            BackupClass::Emergency | BackupClass::Migration => self.settings.special_keep,
        }
    }

    /// Copy the current content of `file` before it is overwritten
    ///
    /// Returns `None` when the file does not exist yet (nothing to preserve).
    pub async fn snapshot_before_write(&self, file: &Path) -> Result<Option<BackupSnapshot>> {
        self.snapshot(file, BackupClass::Manual).await
    }

    /// Snapshot every tracked file as an automatic backup
    ///
    /// Failures are logged per file; the returned list holds the snapshots
    /// that were written.
    pub async fn snapshot_periodic(&self) -> Vec<BackupSnapshot> {
        let mut taken = Vec::new();
        for file in self.tracked_files() {
            match self.snapshot(&file, BackupClass::Automatic).await {
                Ok(Some(snapshot)) => taken.push(snapshot),
                Ok(None) => debug!("Periodic backup: {} does not exist yet", file.display()),
                Err(e) => error!("Periodic backup of {} failed: {}", file.display(), e),
            }
        }
        if !taken.is_empty() {
            info!("Periodic backup: {} file(s) snapshotted", taken.len());
        }
        taken
    }

    /// Snapshot `file` into the backup directory under `class`, then rotate
    pub async fn snapshot(&self, file: &Path, class: BackupClass) -> Result<Option<BackupSnapshot>> {
        let bytes = match tokio::fs::read(file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let source_file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidInput(format!("not a file path: {}", file.display())))?;
        let logical_name = file
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source_file_name.clone());

        let mut catalog = self.catalog.lock().await;
        let created_at = now();
        let file_name = self
            .unique_name(&catalog, &logical_name, class, &file_stamp(created_at))
            .await?;

        tokio::fs::write(self.dir.join(&file_name), &bytes).await?;

        let snapshot = BackupSnapshot {
            file_name,
            source_file_name,
            logical_name: logical_name.clone(),
            class,
            created_at,
            sequence: catalog.next_sequence(),
            record_count: count_records(&bytes),
            sha256: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
        };
        catalog.add(snapshot.clone());
        debug!(
            file = %snapshot.file_name,
            records = snapshot.record_count,
            "Backup written"
        );

        self.rotate_locked(&mut catalog, &logical_name, class, self.keep_for(class))
            .await?;
        catalog.save(&self.dir.join(CATALOG_FILE)).await?;
        Ok(Some(snapshot))
    }

    async fn unique_name(
        &self,
        catalog: &BackupCatalog,
        logical: &str,
        class: BackupClass,
        stamp: &str,
    ) -> Result<String> {
        let base = format!("{}_{}_{}", logical, class.infix(), stamp);
        let mut candidate = format!("{}.json", base);
        let mut n = 1;
        while catalog.contains(&candidate) || tokio::fs::try_exists(self.dir.join(&candidate)).await? {
            candidate = format!("{}-{}.json", base, n);
            n += 1;
        }
        Ok(candidate)
    }

    /// Delete all but the `keep` newest snapshots of `logical_name` in `class`
    ///
    /// Returns the deleted file names.
    pub async fn rotate(&self, logical_name: &str, class: BackupClass, keep: usize) -> Result<Vec<String>> {
        let mut catalog = self.catalog.lock().await;
        let removed = self.rotate_locked(&mut catalog, logical_name, class, keep).await?;
        if !removed.is_empty() {
            catalog.save(&self.dir.join(CATALOG_FILE)).await?;
        }
        Ok(removed)
    }

    async fn rotate_locked(
        &self,
        catalog: &mut BackupCatalog,
        logical_name: &str,
        class: BackupClass,
        keep: usize,
    ) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for stale in catalog.entries_for(logical_name, class).into_iter().skip(keep) {
            match tokio::fs::remove_file(self.dir.join(&stale.file_name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Could not delete old backup {}: {}", stale.file_name, e);
                    continue;
                }
            }
            catalog.remove(&stale.file_name);
            removed.push(stale.file_name);
        }
        if !removed.is_empty() {
            debug!(
                "Rotated {} {} backup(s) of {} (keep {})",
                removed.len(),
                class.infix(),
                logical_name,
                keep
            );
        }
        Ok(removed)
    }

    /// Snapshots, newest first; all logical files when `logical_name` is `None`
    pub async fn list(&self, logical_name: Option<&str>) -> Vec<BackupSnapshot> {
        let catalog = self.catalog.lock().await;
        catalog
            .newest_first()
            .into_iter()
            .filter(|s| logical_name.map_or(true, |name| s.logical_name == name))
            .collect()
    }

    /// Most recent snapshot of any class
    pub async fn latest(&self) -> Option<BackupSnapshot> {
        self.list(None).await.into_iter().next()
    }

    /// Catalog entry for a backup file
    pub async fn entry(&self, file_name: &str) -> Option<BackupSnapshot> {
        self.catalog.lock().await.find(file_name).cloned()
    }

    /// Read a snapshot's content, verifying its checksum when one is recorded
    pub async fn read_snapshot(&self, file_name: &str) -> Result<Vec<u8>> {
        let entry = self
            .entry(file_name)
            .await
            .ok_or_else(|| Error::NotFound(format!("backup {}", file_name)))?;
        let bytes = tokio::fs::read(self.dir.join(file_name)).await?;
        if !entry.sha256.is_empty() && sha256_hex(&bytes) != entry.sha256 {
            return Err(Error::CorruptData {
                path: self.dir.join(file_name).display().to_string(),
                reason: "checksum mismatch".to_string(),
            });
        }
        Ok(bytes)
    }

    /// Copy a snapshot back over the tracked file it was taken from
    ///
    /// The live file gets its own pre-write backup first. The ledger file
    /// should be restored through `Ledger::restore_backup` instead, so its
    /// mirror and subscribers stay in step.
    pub async fn restore_snapshot(&self, file_name: &str) -> Result<PathBuf> {
        let entry = self
            .entry(file_name)
            .await
            .ok_or_else(|| Error::NotFound(format!("backup {}", file_name)))?;
        let target = self
            .tracked_files()
            .into_iter()
            .find(|p| p.file_name().map_or(false, |n| n.to_string_lossy() == entry.source_file_name))
            .ok_or_else(|| {
                Error::NotFound(format!("tracked file for {}", entry.source_file_name))
            })?;

        let bytes = self.read_snapshot(file_name).await?;
        self.snapshot_before_write(&target).await?;
        write_atomic(&target, &bytes).await?;
        info!("Restored {} from {}", target.display(), file_name);
        Ok(target)
    }

    /// Bring the catalog back in line with the directory
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let mut catalog = self.catalog.lock().await;
        let summary = catalog.reconcile(&self.dir).await?;
        catalog.save(&self.dir.join(CATALOG_FILE)).await?;
        Ok(summary)
    }

    /// Start periodic snapshots of all tracked files
    ///
    /// The first snapshot is taken one interval after start.
    pub fn spawn_periodic(self: &Arc<Self>) -> ScheduledTask {
        let scheduler = Arc::clone(self);
        let period = self.settings.periodic_interval();
        info!("Starting periodic backups every {:?}", period);
        ScheduledTask::spawn_interval("periodic-backup", period, false, move || {
            let scheduler = Arc::clone(&scheduler);
            async move {
                scheduler.snapshot_periodic().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir) -> BackupScheduler {
        BackupScheduler::open(dir.path().join("backups"), BackupSettings::default()).unwrap()
    }

    #[test]
    fn test_count_records() {
        assert_eq!(count_records(br#"{"a":1,"b":2}"#), 2);
        assert_eq!(count_records(br#"[1,2,3]"#), 3);
        assert_eq!(count_records(b"garbage"), 0);
        assert_eq!(count_records(b""), 0);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_not_snapshotted() {
        let dir = TempDir::new().unwrap();
        let backups = scheduler(&dir);
        let result = backups
            .snapshot_before_write(&dir.path().join("bookings.json"))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(backups.list(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_copies_prior_bytes() {
        let dir = TempDir::new().unwrap();
        let backups = scheduler(&dir);
        let file = dir.path().join("bookings.json");
        std::fs::write(&file, br#"{"k":{"x":1}}"#).unwrap();

        let snapshot = backups.snapshot_before_write(&file).await.unwrap().unwrap();
        assert!(snapshot.file_name.starts_with("bookings_backup_"));
        assert_eq!(snapshot.record_count, 1);
        assert_eq!(snapshot.class, BackupClass::Manual);

        let copied = std::fs::read(backups.dir().join(&snapshot.file_name)).unwrap();
        assert_eq!(copied, br#"{"k":{"x":1}}"#);
        assert_eq!(backups.read_snapshot(&snapshot.file_name).await.unwrap(), copied);
    }

    #[tokio::test]
    async fn test_manual_retention_keeps_ten_newest() {
        let dir = TempDir::new().unwrap();
        let backups = scheduler(&dir);
        let file = dir.path().join("bookings.json");

        let mut names = Vec::new();
        for i in 0..15 {
            std::fs::write(&file, format!("{{\"k{}\":{{}}}}", i)).unwrap();
            let snapshot = backups.snapshot_before_write(&file).await.unwrap().unwrap();
            names.push(snapshot.file_name);
        }

        let remaining = backups.list(Some("bookings")).await;
        assert_eq!(remaining.len(), 10);
        let remaining_names: Vec<String> = remaining.iter().map(|s| s.file_name.clone()).collect();
        let mut expected: Vec<String> = names[5..].to_vec();
        expected.reverse();
        assert_eq!(remaining_names, expected);

        for old in &names[..5] {
            assert!(!backups.dir().join(old).exists(), "{} should be rotated out", old);
        }
    }

    #[tokio::test]
    async fn test_classes_rotate_independently() {
        let dir = TempDir::new().unwrap();
        let backups = BackupScheduler::open(
            dir.path().join("backups"),
            BackupSettings {
                manual_keep: 2,
                auto_keep: 3,
                ..BackupSettings::default()
            },
        )
        .unwrap();
        let file = dir.path().join("bookings.json");
        std::fs::write(&file, b"{}").unwrap();
        backups.track(&file);

        for _ in 0..4 {
            backups.snapshot_before_write(&file).await.unwrap();
            backups.snapshot_periodic().await;
        }

        let all = backups.list(None).await;
        let manual = all.iter().filter(|s| s.class == BackupClass::Manual).count();
        let auto = all.iter().filter(|s| s.class == BackupClass::Automatic).count();
        assert_eq!(manual, 2);
        assert_eq!(auto, 3);
        assert!(all
            .iter()
            .filter(|s| s.class == BackupClass::Automatic)
            .all(|s| s.file_name.starts_with("bookings_auto_backup_")));
    }

    #[tokio::test]
    async fn test_explicit_rotate_trims_one_class() {
        let dir = TempDir::new().unwrap();
        let backups = scheduler(&dir);
        let file = dir.path().join("bookings.json");
        std::fs::write(&file, b"{}").unwrap();
        for _ in 0..4 {
            backups.snapshot_before_write(&file).await.unwrap();
        }
        backups.snapshot(&file, BackupClass::Emergency).await.unwrap();

        let removed = backups.rotate("bookings", BackupClass::Manual, 1).await.unwrap();
        assert_eq!(removed.len(), 3);

        let left = backups.list(Some("bookings")).await;
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|s| s.class == BackupClass::Emergency));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let backups = scheduler(&dir);
        let file = dir.path().join("bookings.json");
        std::fs::write(&file, b"{}").unwrap();
        let snapshot = backups.snapshot_before_write(&file).await.unwrap().unwrap();

        std::fs::write(backups.dir().join(&snapshot.file_name), b"{\"tampered\":1}").unwrap();
        let err = backups.read_snapshot(&snapshot.file_name).await.unwrap_err();
        assert!(matches!(err, Error::CorruptData { .. }));
    }

    #[tokio::test]
    async fn test_catalog_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bookings.json");
        std::fs::write(&file, b"{}").unwrap();
        {
            let backups = scheduler(&dir);
            backups.snapshot_before_write(&file).await.unwrap();
            backups.snapshot(&file, BackupClass::Emergency).await.unwrap();
        }
        let reopened = scheduler(&dir);
        let listed = reopened.list(Some("bookings")).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].class, BackupClass::Emergency);
    }

    #[tokio::test]
    async fn test_restore_snapshot_over_tracked_file() {
        let dir = TempDir::new().unwrap();
        let backups = scheduler(&dir);
        let file = dir.path().join("classrooms.json");
        std::fs::write(&file, b"[1,2,3]").unwrap();
        backups.track(&file);
        let good = backups.snapshot(&file, BackupClass::Automatic).await.unwrap().unwrap();

        std::fs::write(&file, b"[]").unwrap();
        let restored = backups.restore_snapshot(&good.file_name).await.unwrap();

        assert_eq!(restored, file);
        assert_eq!(std::fs::read(&file).unwrap(), b"[1,2,3]");
        // The overwritten content was kept as a pre-write backup
        let manual = backups.list(Some("classrooms")).await;
        assert!(manual.iter().any(|s| s.class == BackupClass::Manual && s.record_count == 0));
    }

    #[tokio::test]
    async fn test_reconcile_is_saved_to_catalog_file() {
        let dir = TempDir::new().unwrap();
        let backups = scheduler(&dir);
        std::fs::write(
            backups.dir().join("bookings_auto_backup_2025-01-01T00-00-00-000Z.json"),
            br#"{"a":{}}"#,
        )
        .unwrap();

        let summary = backups.reconcile().await.unwrap();
        assert_eq!(summary.adopted.len(), 1);

        let reopened = scheduler(&dir);
        let listed = reopened.list(Some("bookings")).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].class, BackupClass::Automatic);
        assert_eq!(listed[0].record_count, 1);
    }

    #[tokio::test]
    async fn test_restore_unknown_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let backups = scheduler(&dir);
        let err = backups.restore_snapshot("nope.json").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
