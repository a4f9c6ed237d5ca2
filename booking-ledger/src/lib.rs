//! booking-ledger: durable booking ledger with automatic backup, loss
//! detection, recovery and format migration
//!
//! Everything hangs off a [`BookingContext`]:
//! - [`store::Ledger`]: key/value store of bookings in `bookings.json`
//! - [`keys`]: canonical storage keys
//! - [`backup::BackupScheduler`]: pre-write, periodic and special snapshots
//! - [`health::HealthMonitor`]: record-count sampling and loss alerts
//! - [`recovery::RecoveryEngine`]: rebuild the ledger from the best source
//! - [`migration::MigrationEngine`]: convert old record layouts

pub mod backup;
pub mod context;
pub mod health;
pub mod keys;
pub mod migration;
pub mod recovery;
pub mod store;
pub mod tasks;

pub use context::BookingContext;
pub use store::{Ledger, LedgerDocument, LedgerLock, WriteOutcome};
