//! Engine statistics.
//!
//! Counters only: no user identifiers or sample values are retained.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::fusion::ConfirmationMode;

/// Activity counters for the running engine.
#[derive(Debug)]
pub struct EngineStats {
    samples_accepted: AtomicU64,
    samples_rejected: AtomicU64,
    /// Old samples dropped by window backpressure
    samples_dropped: AtomicU64,
    classifications: AtomicU64,
    classifier_failures: AtomicU64,
    stale_results: AtomicU64,
    cross_validated_alerts: AtomicU64,
    single_device_alerts: AtomicU64,
    recoveries: AtomicU64,
    manual_cancellations: AtomicU64,
    notifier_failures: AtomicU64,
    sessions_evicted: AtomicU64,
    started_at: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            samples_accepted: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
            classifier_failures: AtomicU64::new(0),
            stale_results: AtomicU64::new(0),
            cross_validated_alerts: AtomicU64::new(0),
            single_device_alerts: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            manual_cancellations: AtomicU64::new(0),
            notifier_failures: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats backed by a file, resuming previous totals if present.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!("Could not load previous engine stats: {}", e);
        }

        stats
    }

    pub fn record_sample_accepted(&self) {
        self.samples_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_rejected(&self) {
        self.samples_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_samples_dropped(&self, count: u64) {
        if count > 0 {
            self.samples_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_classification(&self) {
        self.classifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_classifier_failure(&self) {
        self.classifier_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_result(&self) {
        self.stale_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emergency(&self, mode: ConfirmationMode) {
        let counter = match mode {
            ConfirmationMode::CrossValidated => &self.cross_validated_alerts,
            ConfirmationMode::SingleDevice { .. } => &self.single_device_alerts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manual_cancellation(&self) {
        self.manual_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notifier_failure(&self) {
        self.notifier_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sessions_evicted(&self, count: u64) {
        self.sessions_evicted.fetch_add(count, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> StatsSnapshot {
        let cross_validated = self.cross_validated_alerts.load(Ordering::Relaxed);
        let single_device = self.single_device_alerts.load(Ordering::Relaxed);
        StatsSnapshot {
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            classifications: self.classifications.load(Ordering::Relaxed),
            classifier_failures: self.classifier_failures.load(Ordering::Relaxed),
            stale_results: self.stale_results.load(Ordering::Relaxed),
            emergencies: cross_validated + single_device,
            cross_validated_alerts: cross_validated,
            single_device_alerts: single_device,
            recoveries: self.recoveries.load(Ordering::Relaxed),
            manual_cancellations: self.manual_cancellations.load(Ordering::Relaxed),
            notifier_failures: self.notifier_failures.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        self.stats().to_string()
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                totals: self.stats(),
                last_updated: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        let Some(persisted) = read_persisted(path)? else {
            return Ok(());
        };

        let t = persisted.totals;
        self.samples_accepted.store(t.samples_accepted, Ordering::Relaxed);
        self.samples_rejected.store(t.samples_rejected, Ordering::Relaxed);
        self.samples_dropped.store(t.samples_dropped, Ordering::Relaxed);
        self.classifications.store(t.classifications, Ordering::Relaxed);
        self.classifier_failures.store(t.classifier_failures, Ordering::Relaxed);
        self.stale_results.store(t.stale_results, Ordering::Relaxed);
        self.cross_validated_alerts.store(t.cross_validated_alerts, Ordering::Relaxed);
        self.single_device_alerts.store(t.single_device_alerts, Ordering::Relaxed);
        self.recoveries.store(t.recoveries, Ordering::Relaxed);
        self.manual_cancellations.store(t.manual_cancellations, Ordering::Relaxed);
        self.notifier_failures.store(t.notifier_failures, Ordering::Relaxed);
        self.sessions_evicted.store(t.sessions_evicted, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub samples_accepted: u64,
    pub samples_rejected: u64,
    pub samples_dropped: u64,
    pub classifications: u64,
    pub classifier_failures: u64,
    pub stale_results: u64,
    pub emergencies: u64,
    pub cross_validated_alerts: u64,
    pub single_device_alerts: u64,
    pub recoveries: u64,
    pub manual_cancellations: u64,
    pub notifier_failures: u64,
    pub sessions_evicted: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Engine Statistics:\n\
             - Samples accepted: {}\n\
             - Samples rejected: {}\n\
             - Samples dropped (backpressure): {}\n\
             - Classifications: {} ({} failed, {} stale)\n\
             - Emergencies: {} ({} cross-validated, {} single-device)\n\
             - Recoveries: {}\n\
             - Manual cancellations: {}\n\
             - Notifier failures: {}\n\
             - Sessions evicted: {}\n\
             - Uptime: {} seconds",
            self.samples_accepted,
            self.samples_rejected,
            self.samples_dropped,
            self.classifications,
            self.classifier_failures,
            self.stale_results,
            self.emergencies,
            self.cross_validated_alerts,
            self.single_device_alerts,
            self.recoveries,
            self.manual_cancellations,
            self.notifier_failures,
            self.sessions_evicted,
            self.uptime_secs
        )
    }
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStats {
    pub totals: StatsSnapshot,
    pub last_updated: DateTime<Utc>,
}

/// Read a persisted stats file, `None` if it does not exist.
pub fn read_persisted(path: &std::path::Path) -> Result<Option<PersistedStats>, std::io::Error> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(std::io::Error::other)
}

/// Thread-safe shared engine statistics.
pub type SharedEngineStats = Arc<EngineStats>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sample::DeviceClass;

    #[test]
    fn test_counting() {
        let stats = EngineStats::new();
        stats.record_sample_accepted();
        stats.record_sample_accepted();
        stats.record_sample_rejected();
        stats.record_samples_dropped(0);
        stats.record_samples_dropped(3);
        stats.record_emergency(ConfirmationMode::CrossValidated);
        stats.record_emergency(ConfirmationMode::SingleDevice {
            device: DeviceClass::Wearable,
        });

        let snap = stats.stats();
        assert_eq!(snap.samples_accepted, 2);
        assert_eq!(snap.samples_rejected, 1);
        assert_eq!(snap.samples_dropped, 3);
        assert_eq!(snap.emergencies, 2);
        assert_eq!(snap.single_device_alerts, 1);
    }

    #[test]
    fn test_summary_format() {
        let summary = EngineStats::new().summary();
        assert!(summary.contains("Samples accepted"));
        assert!(summary.contains("Emergencies"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let stats = EngineStats::with_persistence(path.clone());
        stats.record_classification();
        stats.record_recovery();
        stats.save().unwrap();

        let resumed = EngineStats::with_persistence(path.clone());
        let snap = resumed.stats();
        assert_eq!(snap.classifications, 1);
        assert_eq!(snap.recoveries, 1);

        let persisted = read_persisted(&path).unwrap().unwrap();
        assert_eq!(persisted.totals.classifications, 1);
    }

    #[test]
    fn test_save_without_path_is_noop() {
        assert!(EngineStats::new().save().is_ok());
    }
}
