//! Ledger health monitoring
//!
//! Samples the ledger's record count on a fixed interval and raises an alert
//! when records disappear. An alert can trigger automatic recovery.
//!
//! Loss detection itself is a pure state machine ([`LossDetector`]); the
//! [`HealthMonitor`] feeds it samples and handles the I/O around it: the
//! alert log, the health report, out-of-band backups and recovery.

use crate::backup::{BackupClass, BackupScheduler};
use crate::recovery::RecoveryEngine;
use crate::store::{write_atomic, Ledger};
use crate::tasks::ScheduledTask;
use booking_common::config::HealthSettings;
use booking_common::models::{AlertRecord, AlertSeverity};
use booking_common::time::now;
use booking_common::{Error, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What one count sample means relative to the previous one
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// First sample after (re)start; nothing to compare with
    Seeded { count: usize },
    Unchanged { count: usize },
    Growth { previous: usize, current: usize },
    /// Records disappeared; `alert` is set when the loss exceeds the threshold
    Loss {
        previous: usize,
        current: usize,
        alert: Option<AlertRecord>,
    },
}

impl Observation {
    pub fn alert(&self) -> Option<&AlertRecord> {
        match self {
            Observation::Loss { alert, .. } => alert.as_ref(),
            _ => None,
        }
    }
}

/// Compares successive record counts and classifies the difference
#[derive(Debug, Clone)]
pub struct LossDetector {
    alert_threshold: usize,
    critical_threshold: usize,
    last_known: Option<usize>,
}

impl LossDetector {
    pub fn new(alert_threshold: usize, critical_threshold: usize) -> Self {
        Self {
            alert_threshold,
            critical_threshold,
            last_known: None,
        }
    }

    pub fn last_known(&self) -> Option<usize> {
        self.last_known
    }

    /// Forget the last count; the next sample seeds again
    pub fn reset(&mut self) {
        self.last_known = None;
    }

    /// Accept `count` as the new baseline without comparing
    pub fn reseed(&mut self, count: usize) {
        self.last_known = Some(count);
    }

    pub fn observe(&mut self, current: usize, at: DateTime<Utc>) -> Observation {
        let previous = match self.last_known.replace(current) {
            None => return Observation::Seeded { count: current },
            Some(previous) => previous,
        };

        if current == previous {
            return Observation::Unchanged { count: current };
        }
        if current > previous {
            return Observation::Growth { previous, current };
        }

        let loss = previous - current;
        let alert = (loss > self.alert_threshold).then(|| AlertRecord {
            timestamp: at,
            severity: if loss >= self.critical_threshold {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            },
            loss_count: loss,
            previous_count: previous,
            current_count: current,
        });
        Observation::Loss {
            previous,
            current,
            alert,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Loss alert raised on this check
    Alert,
    /// Ledger file could not be read or parsed
    Unreadable,
}

/// Result of one health check; also the content of `health_report.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub record_count: usize,
    pub last_known_count: Option<usize>,
    pub unrecognized_count: usize,
    pub ledger_readable: bool,
    pub alert: Option<AlertRecord>,
    pub alerts_logged: usize,
    pub latest_backup: Option<String>,
    /// Out-of-band backup taken on this check
    pub random_backup: Option<String>,
    /// Records restored by automatic recovery on this check
    pub recovered_count: Option<usize>,
}

/// Where the monitor persists its output
#[derive(Debug, Clone)]
pub struct HealthPaths {
    pub alerts: PathBuf,
    pub report: PathBuf,
}

pub struct HealthMonitor {
    ledger: Arc<Ledger>,
    backups: Arc<BackupScheduler>,
    recovery: Arc<RecoveryEngine>,
    settings: HealthSettings,
    paths: HealthPaths,
    detector: Mutex<LossDetector>,
    alerts: Mutex<VecDeque<AlertRecord>>,
    task: Mutex<Option<ScheduledTask>>,
}

impl HealthMonitor {
    /// Create a stopped monitor, reloading any persisted alert log
    pub fn new(
        ledger: Arc<Ledger>,
        backups: Arc<BackupScheduler>,
        recovery: Arc<RecoveryEngine>,
        settings: HealthSettings,
        paths: HealthPaths,
    ) -> Self {
        let alerts = load_alerts(&paths.alerts, settings.alert_log_capacity);
        Self {
            detector: Mutex::new(LossDetector::new(
                settings.alert_threshold,
                settings.critical_threshold,
            )),
            ledger,
            backups,
            recovery,
            settings,
            paths,
            alerts: Mutex::new(alerts),
            task: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> MonitorState {
        state_of(self.task.lock().await.as_ref())
    }

    /// Start periodic checks; the first check runs immediately and seeds
    ///
    /// Starting a running monitor does nothing. The task slot stays locked
    /// from the check to the spawn, so concurrent starts spawn one task.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().await;
        if state_of(slot.as_ref()) == MonitorState::Running {
            debug!("Health monitor already running");
            return;
        }
        self.detector.lock().await.reset();

        let monitor = Arc::clone(self);
        let period = self.settings.interval();
        let task = ScheduledTask::spawn_interval("health-monitor", period, true, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.check_once().await;
            }
        });
        *slot = Some(task);
        info!("Health monitor started (every {:?})", period);
    }

    /// Stop periodic checks, letting an in-flight check finish
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
            info!("Health monitor stopped");
        }
    }

    /// Alerts in the log, oldest first
    pub async fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.lock().await.iter().cloned().collect()
    }

    /// Sample the ledger once and act on the result
    pub async fn check_once(&self) -> HealthSnapshot {
        let status = self.ledger.status().await;
        if let Some(e) = &status.error {
            warn!("Health check: ledger unreadable: {}", e);
        }

        let timestamp = now();
        let observation = self.detector.lock().await.observe(status.record_count, timestamp);
        match &observation {
            Observation::Seeded { count } => info!("Health monitor seeded with {} records", count),
            Observation::Unchanged { count } => debug!("Health check: {} records", count),
            Observation::Growth { previous, current } => {
                info!("Ledger grew from {} to {} records", previous, current)
            }
            Observation::Loss {
                previous,
                current,
                alert: None,
            } => info!(
                "Ledger shrank from {} to {} records (within threshold)",
                previous, current
            ),
            Observation::Loss { alert: Some(_), .. } => {}
        }

        let alert = observation.alert().cloned();
        let mut recovered_count = None;
        if let Some(alert) = &alert {
            match alert.severity {
                AlertSeverity::Critical => error!(
                    "CRITICAL data loss: {} records lost ({} -> {})",
                    alert.loss_count, alert.previous_count, alert.current_count
                ),
                AlertSeverity::Warning => warn!(
                    "Data loss warning: {} records lost ({} -> {})",
                    alert.loss_count, alert.previous_count, alert.current_count
                ),
            }
            self.record_alert(alert.clone()).await;

            if self.settings.auto_recover {
                recovered_count = self.run_recovery().await;
            }
        }

        let random_backup = self.maybe_random_backup().await;

        let snapshot = HealthSnapshot {
            timestamp,
            status: if alert.is_some() {
                HealthStatus::Alert
            } else if !status.readable {
                HealthStatus::Unreadable
            } else {
                HealthStatus::Healthy
            },
            record_count: status.record_count,
            last_known_count: self.detector.lock().await.last_known(),
            unrecognized_count: status.unrecognized_count,
            ledger_readable: status.readable,
            alert,
            alerts_logged: self.alerts.lock().await.len(),
            latest_backup: self.backups.latest().await.map(|s| s.file_name),
            random_backup,
            recovered_count,
        };
        self.write_report(&snapshot).await;
        snapshot
    }

    async fn run_recovery(&self) -> Option<usize> {
        match self.recovery.recover().await {
            Ok(restored) => {
                let count = restored.report.restored_count;
                self.detector.lock().await.reseed(count);
                info!("Automatic recovery restored {} records", count);
                Some(count)
            }
            Err(Error::Conflict(_)) => {
                info!("Recovery already in progress, not starting another");
                None
            }
            Err(e) => {
                error!("Automatic recovery failed: {}", e);
                None
            }
        }
    }

    async fn maybe_random_backup(&self) -> Option<String> {
        let p = self.settings.random_backup_probability;
        if !roll(p) {
            return None;
        }
        match self.backups.snapshot(self.ledger.path(), BackupClass::Automatic).await {
            Ok(Some(snapshot)) => {
                debug!("Out-of-band backup {}", snapshot.file_name);
                Some(snapshot.file_name)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Out-of-band backup failed: {}", e);
                None
            }
        }
    }

    async fn record_alert(&self, alert: AlertRecord) {
        let mut alerts = self.alerts.lock().await;
        alerts.push_back(alert);
        while alerts.len() > self.settings.alert_log_capacity {
            alerts.pop_front();
        }
        let log: Vec<&AlertRecord> = alerts.iter().collect();
        if let Err(e) = persist_json(&self.paths.alerts, &log).await {
            warn!("Could not write alert log {}: {}", self.paths.alerts.display(), e);
        }
    }

    async fn write_report(&self, snapshot: &HealthSnapshot) {
        if let Err(e) = persist_json(&self.paths.report, snapshot).await {
            warn!("Could not write health report {}: {}", self.paths.report.display(), e);
        }
    }
}

fn state_of(task: Option<&ScheduledTask>) -> MonitorState {
    match task {
        Some(t) if t.is_running() => MonitorState::Running,
        _ => MonitorState::Stopped,
    }
}

fn roll(probability: f64) -> bool {
    probability > 0.0 && rand::thread_rng().gen_bool(probability.min(1.0))
}

async fn persist_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

fn load_alerts(path: &Path, capacity: usize) -> VecDeque<AlertRecord> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return VecDeque::new(),
        Err(e) => {
            warn!("Could not read alert log {}: {}", path.display(), e);
            return VecDeque::new();
        }
    };
    match serde_json::from_slice::<Vec<AlertRecord>>(&bytes) {
        Ok(alerts) => {
            let skip = alerts.len().saturating_sub(capacity);
            alerts.into_iter().skip(skip).collect()
        }
        Err(e) => {
            warn!("Ignoring malformed alert log {}: {}", path.display(), e);
            VecDeque::new()
        }
    }
}
