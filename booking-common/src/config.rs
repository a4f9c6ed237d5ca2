//! Configuration loading and data directory resolution
//!
//! Bootstrap configuration comes from a TOML file. Every field is optional;
//! missing fields take the built-in defaults below, and a missing file only
//! produces a warning.
//!
//! Data directory resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `BOOKING_LEDGER_DATA_DIR` environment variable
//! 3. `data_dir` in the TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "BOOKING_LEDGER_DATA_DIR";

/// What happens when a new booking lands on an occupied canonical key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The later write replaces the earlier one silently
    #[default]
    LastWriteWins,
    /// The later write is refused with a conflict error
    Reject,
}

/// Complete bootstrap configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Root of the persisted layout (bookings, catalog, backups, reports)
    pub data_dir: Option<PathBuf>,
    pub ledger: LedgerSettings,
    pub backup: BackupSettings,
    pub health: HealthSettings,
    pub recovery: RecoverySettings,
    pub events: EventSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Pre-write backups kept per logical file
    pub manual_keep: usize,
    /// Periodic and health-triggered backups kept per logical file
    pub auto_keep: usize,
    /// Emergency and pre-migration snapshots kept per logical file
    pub special_keep: usize,
    pub periodic_interval_secs: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            manual_keep: 10,
            auto_keep: 20,
            special_keep: 20,
            periodic_interval_secs: 3600,
        }
    }
}

impl BackupSettings {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    /// Losses above this many records raise an alert
    pub alert_threshold: usize,
    /// Losses of at least this many records are critical
    pub critical_threshold: usize,
    /// Chance per tick of an extra automatic backup
    pub random_backup_probability: f64,
    /// Run the recovery engine when an alert is raised
    pub auto_recover: bool,
    pub alert_log_capacity: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            alert_threshold: 2,
            critical_threshold: 5,
            random_backup_probability: 0.05,
            auto_recover: true,
            alert_log_capacity: 100,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Directories scanned for backups besides the ledger's own backup dir
    pub extra_backup_dirs: Vec<PathBuf>,
    /// Pause between recovery steps
    pub step_delay_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            extra_backup_dirs: Vec::new(),
            step_delay_ms: 250,
        }
    }
}

impl RecoverySettings {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Per-subscriber queue capacity
    pub capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: LedgerConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, or from the default location
    ///
    /// A missing file is not an error: defaults are returned and a warning
    /// logged. A file that exists but does not parse is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_file() {
                Some(p) => p,
                None => {
                    warn!("No config file found; using built-in defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            warn!("Config file {} not found; using built-in defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.backup.manual_keep == 0 || self.backup.auto_keep == 0 || self.backup.special_keep == 0 {
            return Err(Error::Config("backup retention counts must be at least 1".to_string()));
        }
        if self.backup.periodic_interval_secs == 0 {
            return Err(Error::Config("backup.periodic_interval_secs must be positive".to_string()));
        }
        if self.health.interval_secs == 0 {
            return Err(Error::Config("health.interval_secs must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.health.random_backup_probability) {
            return Err(Error::Config(
                "health.random_backup_probability must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.health.alert_log_capacity == 0 {
            return Err(Error::Config("health.alert_log_capacity must be at least 1".to_string()));
        }
        if self.events.capacity == 0 {
            return Err(Error::Config("events.capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Resolve the data directory following the priority order above
    pub fn resolve_data_dir(&self, cli_arg: Option<&Path>) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = cli_arg {
            return path.to_path_buf();
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }

        // Priority 3: TOML config file
        if let Some(path) = &self.data_dir {
            return path.clone();
        }

        // Priority 4: OS-dependent compiled default
        default_data_dir()
    }
}

/// Default configuration file for the platform, if one exists
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("booking-ledger").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/booking-ledger/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }
    None
}

/// Get OS-dependent default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("booking-ledger"))
        .unwrap_or_else(|| PathBuf::from("./booking_ledger_data"))
}

/// Locations of every persisted file under one data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
    pub bookings: PathBuf,
    pub classrooms: PathBuf,
    pub timeslots: PathBuf,
    pub alerts: PathBuf,
    pub health_report: PathBuf,
    pub recovery_report: PathBuf,
    pub backups: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            bookings: root.join("bookings.json"),
            classrooms: root.join("classrooms.json"),
            timeslots: root.join("timeslots.json"),
            alerts: root.join("alerts.json"),
            health_report: root.join("health_report.json"),
            recovery_report: root.join("recovery_report.json"),
            backups: root.join("backups"),
            root,
        }
    }

    /// Report file for a migration run started at `stamp`
    pub fn migration_report(&self, stamp: &str) -> PathBuf {
        self.root.join(format!("migration_report_{}.json", stamp))
    }

    /// Create the data and backup directories if needed
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.backups)?;
        Ok(())
    }
}
