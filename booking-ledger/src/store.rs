//! Booking ledger
//!
//! Key/value store of booking records backed by one JSON file
//! (`bookings.json`, canonical key → record).
//!
//! Write path, for every mutation:
//! 1. Take the writer lock (one write at a time, in arrival order)
//! 2. Re-read the file; a read or parse failure aborts the write
//! 3. Pre-write snapshot of the current file via the BackupScheduler
//! 4. Write the new document to a temporary file and rename it into place
//! 5. Publish the change on the ChangeBus while still holding the lock, so
//!    events go out in commit order
//!
//! Reads never fail: `get_all` logs a read/parse failure and returns an empty
//! collection. Entries that are not valid booking records (e.g. records a
//! migration could not convert) are carried along untouched.

use crate::backup::BackupScheduler;
use crate::keys::canonical_key;
use booking_common::config::ConflictPolicy;
use booking_common::events::{ChangeBus, LedgerEvent};
use booking_common::models::{BookingPatch, RecordField};
use booking_common::time::now;
use booking_common::{BookingRecord, Error, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Parsed content of the ledger file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerDocument {
    pub records: BTreeMap<String, BookingRecord>,
    /// Entries that did not parse as booking records, kept verbatim
    pub unrecognized: Map<String, Value>,
}

impl LedgerDocument {
    pub fn from_records(records: BTreeMap<String, BookingRecord>) -> Self {
        Self {
            records,
            unrecognized: Map::new(),
        }
    }

    /// Parse a ledger file; an empty file is an empty ledger
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::default());
        }

        let corrupt = |reason: String| Error::CorruptData {
            path: path.display().to_string(),
            reason,
        };
        let value: Value = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
        let Value::Object(entries) = value else {
            return Err(corrupt("top-level value is not an object".to_string()));
        };

        let mut doc = Self::default();
        for (key, entry) in entries {
            match serde_json::from_value::<BookingRecord>(entry.clone()) {
                Ok(record) => {
                    doc.records.insert(key, record);
                }
                Err(e) => {
                    debug!("Ledger entry {} is not a booking record: {}", key, e);
                    doc.unrecognized.insert(key, entry);
                }
            }
        }
        Ok(doc)
    }

    /// Serialize back to the on-disk form
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut map = Map::new();
        for (key, record) in &self.records {
            map.insert(key.clone(), serde_json::to_value(record)?);
        }
        for (key, entry) in &self.unrecognized {
            if !self.records.contains_key(key) {
                map.insert(key.clone(), entry.clone());
            }
        }
        Ok(serde_json::to_vec_pretty(&Value::Object(map))?)
    }

    fn occupied(&self, key: &str) -> bool {
        self.records.contains_key(key) || self.unrecognized.contains_key(key)
    }

    fn find_reference(&self, reference_number: &str) -> Option<(String, BookingRecord)> {
        self.records
            .iter()
            .find(|(_, r)| r.reference_number == reference_number)
            .map(|(k, r)| (k.clone(), r.clone()))
    }
}

/// Result of a successful single-record write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The key was empty
    Created,
    /// The key held `previous`, which was replaced
    Updated { previous: BookingRecord },
}

/// Readability of the ledger file, for health reporting
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStatus {
    pub readable: bool,
    pub record_count: usize,
    pub unrecognized_count: usize,
    pub error: Option<String>,
}

pub struct Ledger {
    path: PathBuf,
    backups: Arc<BackupScheduler>,
    bus: ChangeBus,
    writer: Mutex<()>,
    /// Last committed records; the in-process fallback used by recovery
    mirror: RwLock<BTreeMap<String, BookingRecord>>,
}

impl Ledger {
    /// Open the ledger at `path`; the file need not exist yet
    pub async fn open(path: impl Into<PathBuf>, backups: Arc<BackupScheduler>, bus: ChangeBus) -> Self {
        let path = path.into();
        backups.track(&path);
        let ledger = Self {
            path,
            backups,
            bus,
            writer: Mutex::new(()),
            mirror: RwLock::new(BTreeMap::new()),
        };

        match ledger.load_document().await {
            Ok(doc) => {
                info!(
                    "Opened ledger {} ({} records)",
                    ledger.path.display(),
                    doc.records.len()
                );
                *ledger.mirror.write().await = doc.records;
            }
            Err(e) => warn!("Ledger {} is not readable at open: {}", ledger.path.display(), e),
        }
        ledger
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Read and parse the ledger file, surfacing failures
    pub async fn load_document(&self) -> Result<LedgerDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => LedgerDocument::parse(&bytes, &self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LedgerDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// All records; empty if the file cannot be read or parsed
    pub async fn get_all(&self) -> BTreeMap<String, BookingRecord> {
        match self.load_document().await {
            Ok(doc) => doc.records,
            Err(e) => {
                error!("Ledger read failed, returning empty collection: {}", e);
                BTreeMap::new()
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<BookingRecord> {
        self.get_all().await.remove(key)
    }

    /// Number of records as seen by `get_all`
    pub async fn count(&self) -> usize {
        self.get_all().await.len()
    }

    pub async fn status(&self) -> LedgerStatus {
        match self.load_document().await {
            Ok(doc) => LedgerStatus {
                readable: true,
                record_count: doc.records.len(),
                unrecognized_count: doc.unrecognized.len(),
                error: None,
            },
            Err(e) => LedgerStatus {
                readable: false,
                record_count: 0,
                unrecognized_count: 0,
                error: Some(e.to_string()),
            },
        }
    }

    /// Records whose `field` equals `value` (linear scan)
    pub async fn scan_by_field(&self, field: RecordField, value: &str) -> Vec<(String, BookingRecord)> {
        self.get_all()
            .await
            .into_iter()
            .filter(|(_, r)| r.field_value(field) == value)
            .collect()
    }

    /// Last committed state held in memory
    pub async fn mirror(&self) -> BTreeMap<String, BookingRecord> {
        self.mirror.read().await.clone()
    }

    /// Full-state notification for a subscriber that needs to catch up
    pub async fn full_state_event(&self, reason: &str) -> LedgerEvent {
        LedgerEvent::BookingsUpdated {
            records: self.get_all().await,
            reason: reason.to_string(),
            timestamp: now(),
        }
    }

    /// Store `record` under `key`, replacing whatever is there
    ///
    /// Last write wins: no version check, no merge.
    pub async fn upsert(&self, key: &str, record: BookingRecord) -> Result<WriteOutcome> {
        self.write_record(key, record, |_| Ok(())).await
    }

    /// Store `record` under `key` only if the key is free
    pub async fn insert_new(&self, key: &str, record: BookingRecord) -> Result<WriteOutcome> {
        self.write_record(key, record, |doc| {
            if doc.occupied(key) {
                Err(Error::Conflict(format!("slot {} is already booked", key)))
            } else {
                Ok(())
            }
        })
        .await
    }

    /// Store `record` under `key` only if the stored record is unchanged
    ///
    /// `expected_updated_at` is the `updatedAt` the caller last saw, or
    /// `None` if it expects the key to be empty.
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected_updated_at: Option<DateTime<Utc>>,
        record: BookingRecord,
    ) -> Result<WriteOutcome> {
        self.write_record(key, record, |doc| {
            let current = doc.records.get(key).map(|r| r.updated_at);
            if current == expected_updated_at && !(current.is_none() && doc.occupied(key)) {
                Ok(())
            } else {
                Err(Error::Conflict(format!(
                    "slot {} changed (expected {:?}, found {:?})",
                    key, expected_updated_at, current
                )))
            }
        })
        .await
    }

    async fn write_record<F>(&self, key: &str, record: BookingRecord, check: F) -> Result<WriteOutcome>
    where
        F: FnOnce(&LedgerDocument) -> Result<()>,
    {
        let _guard = self.writer.lock().await;
        let mut doc = self.load_for_write().await?;
        check(&doc)?;

        doc.unrecognized.remove(key);
        let previous = doc.records.insert(key.to_string(), record.clone());
        self.commit(&doc).await?;

        let timestamp = now();
        let (outcome, event) = match previous {
            None => (
                WriteOutcome::Created,
                LedgerEvent::BookingCreated {
                    key: key.to_string(),
                    record,
                    timestamp,
                },
            ),
            Some(previous) => (
                WriteOutcome::Updated { previous },
                LedgerEvent::BookingUpdated {
                    key: key.to_string(),
                    record,
                    previous_key: None,
                    timestamp,
                },
            ),
        };
        debug!(key = %key, "Ledger write committed");
        self.bus.publish(event);
        Ok(outcome)
    }

    /// Delete the record with this reference number
    pub async fn delete_by_reference(&self, reference_number: &str) -> Result<(String, BookingRecord)> {
        let _guard = self.writer.lock().await;
        let mut doc = self.load_for_write().await?;

        let (key, record) = doc
            .find_reference(reference_number)
            .ok_or_else(|| Error::NotFound(format!("booking {}", reference_number)))?;
        doc.records.remove(&key);
        self.commit(&doc).await?;

        info!(key = %key, reference = %reference_number, "Booking deleted");
        self.bus.publish(LedgerEvent::BookingDeleted {
            reference_number: reference_number.to_string(),
            key: key.clone(),
            timestamp: now(),
        });
        Ok((key, record))
    }

    /// Merge `patch` into the record with this reference number
    ///
    /// If the patch changes an identity field the record moves to its new
    /// canonical key; `policy` decides what happens if that key is taken.
    pub async fn update_by_reference(
        &self,
        reference_number: &str,
        patch: &BookingPatch,
        policy: ConflictPolicy,
    ) -> Result<(String, BookingRecord)> {
        let _guard = self.writer.lock().await;
        let mut doc = self.load_for_write().await?;

        let (old_key, mut record) = doc
            .find_reference(reference_number)
            .ok_or_else(|| Error::NotFound(format!("booking {}", reference_number)))?;
        record.apply_patch(patch, now());

        let new_key = if patch.changes_identity() {
            canonical_key(&record)
        } else {
            old_key.clone()
        };

        if new_key != old_key {
            if doc.occupied(&new_key) && policy == ConflictPolicy::Reject {
                return Err(Error::Conflict(format!("slot {} is already booked", new_key)));
            }
            doc.records.remove(&old_key);
            doc.unrecognized.remove(&new_key);
        }
        doc.records.insert(new_key.clone(), record.clone());
        self.commit(&doc).await?;

        self.bus.publish(LedgerEvent::BookingUpdated {
            key: new_key.clone(),
            record: record.clone(),
            previous_key: (new_key != old_key).then_some(old_key),
            timestamp: now(),
        });
        Ok((new_key, record))
    }

    /// Replace the whole ledger with `records`
    ///
    /// Takes no pre-write snapshot; callers take their own emergency or
    /// migration snapshot first.
    pub async fn replace_all(&self, records: BTreeMap<String, BookingRecord>, reason: &str) -> Result<()> {
        self.replace_document(LedgerDocument::from_records(records), reason)
            .await
    }

    /// Replace the whole ledger file with `doc`, unrecognized entries included
    pub async fn replace_document(&self, doc: LedgerDocument, reason: &str) -> Result<()> {
        self.lock_exclusive().await.replace_document(doc, reason).await
    }

    /// Hold the writer lock until the returned handle is dropped
    ///
    /// Use it when the replacement document is built from the current state:
    /// no other write can commit between the read and the replace.
    pub async fn lock_exclusive(&self) -> LedgerLock<'_> {
        LedgerLock {
            ledger: self,
            _guard: self.writer.lock().await,
        }
    }

    async fn replace_locked(&self, doc: LedgerDocument, reason: &str) -> Result<()> {
        self.persist(&doc).await?;
        info!(
            "Ledger replaced ({}): {} records, {} unrecognized entries",
            reason,
            doc.records.len(),
            doc.unrecognized.len()
        );
        self.bus.publish(LedgerEvent::BookingsUpdated {
            records: doc.records,
            reason: reason.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Replace the ledger with the content of one of its backups
    ///
    /// Unlike `replace_all` this is a regular write: the current file gets a
    /// pre-write backup first.
    pub async fn restore_backup(&self, file_name: &str) -> Result<LedgerDocument> {
        let bytes = self.backups.read_snapshot(file_name).await?;
        let doc = LedgerDocument::parse(&bytes, &self.backups.dir().join(file_name))?;

        let _guard = self.writer.lock().await;
        self.commit(&doc).await?;
        info!(
            "Ledger restored from {} ({} records)",
            file_name,
            doc.records.len()
        );
        self.bus.publish(LedgerEvent::BookingsUpdated {
            records: doc.records.clone(),
            reason: format!("restore {}", file_name),
            timestamp: now(),
        });
        Ok(doc)
    }

    async fn load_for_write(&self) -> Result<LedgerDocument> {
        self.load_document().await.map_err(|e| {
            warn!("Ledger write aborted, current state unreadable: {}", e);
            e
        })
    }

    async fn commit(&self, doc: &LedgerDocument) -> Result<()> {
        self.backups.snapshot_before_write(&self.path).await?;
        self.persist(doc).await
    }

    async fn persist(&self, doc: &LedgerDocument) -> Result<()> {
        let bytes = doc.to_json()?;
        write_atomic(&self.path, &bytes).await?;
        *self.mirror.write().await = doc.records.clone();
        Ok(())
    }
}

/// Exclusive hold on a ledger's writer lock
///
/// Reads through the ledger still work; writes from other callers wait until
/// this is dropped or consumed by [`LedgerLock::replace_document`].
pub struct LedgerLock<'a> {
    ledger: &'a Ledger,
    _guard: MutexGuard<'a, ()>,
}

impl LedgerLock<'_> {
    pub async fn load_document(&self) -> Result<LedgerDocument> {
        self.ledger.load_document().await
    }

    /// Replace the whole file and publish `bookings-updated`, then release
    pub async fn replace_document(self, doc: LedgerDocument, reason: &str) -> Result<()> {
        self.ledger.replace_locked(doc, reason).await
    }
}

/// Write `bytes` to a sibling temporary file, then rename it over `path`
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
