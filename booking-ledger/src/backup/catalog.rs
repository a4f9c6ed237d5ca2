//! Backup catalog
//!
//! Index of every snapshot in the backup directory, persisted as
//! `backups/catalog.json`. Rotation and listing read the catalog instead of
//! scanning the directory, so concurrent rotations never race on a listing.
//! [`BackupCatalog::reconcile`] brings the index back in line with the
//! directory after a crash or manual tampering.

use booking_common::time::now;
use booking_common::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Why a snapshot was taken; decides its file name and retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupClass {
    /// Taken right before a ledger write
    Manual,
    /// Periodic or health-triggered
    Automatic,
    /// Pre-recovery copy of the damaged state
    Emergency,
    /// Pre-migration copy
    Migration,
}

impl BackupClass {
    /// File name infix between the logical name and the timestamp
    pub fn infix(&self) -> &'static str {
        match self {
            BackupClass::Manual => "backup",
            BackupClass::Automatic => "auto_backup",
            BackupClass::Emergency => "emergency",
            BackupClass::Migration => "pre_migration",
        }
    }

    /// Split a backup file name into (logical name, class)
    ///
    /// `bookings_auto_backup_2025-...json` → `("bookings", Automatic)`.
    pub fn parse_file_name(file_name: &str) -> Option<(String, BackupClass)> {
        let stem = file_name.strip_suffix(".json")?;
        // Longest infixes first: "_backup_" is contained in "_auto_backup_"
        for class in [
            BackupClass::Automatic,
            BackupClass::Migration,
            BackupClass::Emergency,
            BackupClass::Manual,
        ] {
            let marker = format!("_{}_", class.infix());
            if let Some(pos) = stem.find(&marker) {
                if pos > 0 && pos + marker.len() < stem.len() {
                    return Some((stem[..pos].to_string(), class));
                }
            }
        }
        None
    }
}

/// One backup file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    /// File name inside the backup directory
    pub file_name: String,
    /// Name of the file that was copied, e.g. `bookings.json`
    pub source_file_name: String,
    /// Source file name without extension, e.g. `bookings`
    pub logical_name: String,
    pub class: BackupClass,
    pub created_at: DateTime<Utc>,
    /// Monotonic tie-breaker for snapshots taken within one millisecond
    pub sequence: u64,
    pub record_count: usize,
    /// Hex sha256 of the content; empty for adopted files
    #[serde(default)]
    pub sha256: String,
    pub size_bytes: u64,
}

/// What [`BackupCatalog::reconcile`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Entries dropped because their file is gone
    pub dropped: Vec<String>,
    /// Backup-named files that were added to the catalog
    pub adopted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCatalog {
    next_sequence: u64,
    entries: Vec<BackupSnapshot>,
}

impl BackupCatalog {
    /// Load the catalog file; missing or malformed files give an empty catalog
    pub fn load(path: &Path) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Cannot read backup catalog {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(
                    "Backup catalog {} is malformed ({}); it will be rebuilt from the directory",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Write the catalog via a temporary file and rename
    pub async fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    pub fn add(&mut self, snapshot: BackupSnapshot) {
        if snapshot.sequence >= self.next_sequence {
            self.next_sequence = snapshot.sequence + 1;
        }
        self.entries.push(snapshot);
    }

    pub fn remove(&mut self, file_name: &str) -> Option<BackupSnapshot> {
        let pos = self.entries.iter().position(|e| e.file_name == file_name)?;
        Some(self.entries.remove(pos))
    }

    pub fn find(&self, file_name: &str) -> Option<&BackupSnapshot> {
        self.entries.iter().find(|e| e.file_name == file_name)
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.find(file_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, newest first
    pub fn newest_first(&self) -> Vec<BackupSnapshot> {
        let mut entries = self.entries.clone();
        sort_newest_first(&mut entries);
        entries
    }

    /// Entries of one logical file and class, newest first
    pub fn entries_for(&self, logical_name: &str, class: BackupClass) -> Vec<BackupSnapshot> {
        let mut entries: Vec<BackupSnapshot> = self
            .entries
            .iter()
            .filter(|e| e.logical_name == logical_name && e.class == class)
            .cloned()
            .collect();
        sort_newest_first(&mut entries);
        entries
    }

    /// Drop entries whose file vanished and adopt unknown backup files
    ///
    /// Adopted files are ordered by modification time and get sequence
    /// numbers in that order; their record count is read from the file.
    pub async fn reconcile(&mut self, dir: &Path) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in std::mem::take(&mut self.entries) {
            if tokio::fs::try_exists(dir.join(&entry.file_name)).await? {
                kept.push(entry);
            } else {
                summary.dropped.push(entry.file_name);
            }
        }
        self.entries = kept;

        let mut found = Vec::new();
        let mut listing = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = listing.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if self.contains(&file_name) {
                continue;
            }
            let Some((logical_name, class)) = BackupClass::parse_file_name(&file_name) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified().map(DateTime::from).unwrap_or_else(|_| now());
            found.push((modified, file_name, logical_name, class, metadata.len()));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (modified, file_name, logical_name, class, size_bytes) in found {
            let record_count = tokio::fs::read(dir.join(&file_name))
                .await
                .map(|bytes| super::count_records(&bytes))
                .unwrap_or(0);
            let sequence = self.next_sequence();
            self.entries.push(BackupSnapshot {
                source_file_name: format!("{}.json", logical_name),
                file_name: file_name.clone(),
                logical_name,
                class,
                created_at: modified,
                sequence,
                record_count,
                sha256: String::new(),
                size_bytes,
            });
            summary.adopted.push(file_name);
        }

        if !summary.dropped.is_empty() || !summary.adopted.is_empty() {
            info!(
                "Backup catalog reconciled: {} dropped, {} adopted",
                summary.dropped.len(),
                summary.adopted.len()
            );
        }
        Ok(summary)
    }
}

fn sort_newest_first(entries: &mut [BackupSnapshot]) {
    entries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.sequence.cmp(&a.sequence))
    });
}
