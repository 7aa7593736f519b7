//! Per-device liveness tracking.
//!
//! A device class is alive while its most recent sample is younger than the
//! liveness timeout. Liveness decides between fail-safe single-device alerts
//! and cross-validated dual-device alerts.

use crate::core::sample::{DeviceClass, PerDevice};
use chrono::{DateTime, Duration, Utc};

/// Default liveness timeout.
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 10_000;

/// Last-packet timestamps for both device classes of one user.
#[derive(Debug, Clone, Default)]
pub struct LivenessTracker {
    last_packet_at: PerDevice<Option<DateTime<Utc>>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a sample from `device` arrived at `now`.
    pub fn record_packet(&mut self, device: DeviceClass, now: DateTime<Utc>) {
        *self.last_packet_at.get_mut(device) = Some(now);
    }

    /// Whether `device` has sent anything within `timeout` of `now`.
    ///
    /// A device that never sent a packet is not alive.
    pub fn is_alive(&self, device: DeviceClass, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.last_packet_at.get(device) {
            Some(last) => now - *last < timeout,
            None => false,
        }
    }

    pub fn last_packet_at(&self, device: DeviceClass) -> Option<DateTime<Utc>> {
        *self.last_packet_at.get(device)
    }

    /// Most recent packet across both device classes.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        DeviceClass::ALL
            .iter()
            .filter_map(|d| self.last_packet_at(*d))
            .max()
    }
}
