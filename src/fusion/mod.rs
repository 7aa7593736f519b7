//! Fusion of per-device verdicts into a per-user emergency decision.
//!
//! ```text
//!            single-alive positive
//!          | dual-alive cross-validated
//!  NORMAL ──────────────────────────────▶ EMERGENCY
//!    ▲                                        │
//!    └──── sustained motion streak ───────────┤
//!    └──── manual cancellation ───────────────┘
//! ```
//!
//! When both devices are reachable a lone positive is held back until the
//! other device agrees within the cross-check window. When only one device is
//! reachable its positive is trusted immediately: a missing second opinion
//! must never block a genuine alert.

pub mod session;

pub use session::{ClassificationTicket, SampleOutcome, SessionSnapshot, UserSession, WindowPhase};

use crate::config::FusionConfig;
use crate::core::sample::{DeviceClass, PerDevice};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Confirmed-alert flag of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyState {
    #[default]
    Normal,
    Emergency,
}

/// How an emergency was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    /// Both devices alive and both reported a fall within the cross-check window
    CrossValidated,
    /// Only `device` was reachable; its verdict was trusted on its own
    SingleDevice { device: DeviceClass },
}

impl ConfirmationMode {
    /// Source description handed to the notifier.
    pub fn source_description(self) -> &'static str {
        match self {
            ConfirmationMode::CrossValidated => "wearable+handheld (cross-validated)",
            ConfirmationMode::SingleDevice {
                device: DeviceClass::Wearable,
            } => "wearable only (handheld offline)",
            ConfirmationMode::SingleDevice {
                device: DeviceClass::Handheld,
            } => "handheld only (wearable offline)",
        }
    }
}

/// Data the engine needs to act on a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub mode: ConfirmationMode,
    /// Tokens of the cooldowns armed by this confirmation
    pub cooldown_tokens: PerDevice<u64>,
}

/// Result of applying one classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Classifier saw no fall
    Negative,
    /// Positive while already in emergency
    Absorbed,
    /// Both devices alive, waiting for the other one to agree
    AwaitingCounterpart,
    /// Transitioned to emergency
    Confirmed(Confirmation),
    /// Verdict belonged to a retired session or predates the latest alert
    Stale,
}

impl Decision {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Decision::Confirmed(_))
    }
}

/// Why a user left the emergency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryReason {
    /// Sustained movement after the fall
    AutoRecovery,
    /// Cancelled by the person or a caregiver
    ManualCancel,
}

impl RecoveryReason {
    pub fn source_description(self) -> &'static str {
        match self {
            RecoveryReason::AutoRecovery => "auto-recovery (sustained movement)",
            RecoveryReason::ManualCancel => "manual cancellation",
        }
    }
}

/// Fusion parameters in the form the state machine compares against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    pub liveness_timeout: Duration,
    pub cross_check_window: Duration,
    pub recovery_streak: u32,
    pub walking_threshold_g: f64,
    pub inactivity_advisory: Duration,
}

impl From<&FusionConfig> for FusionParams {
    fn from(config: &FusionConfig) -> Self {
        Self {
            liveness_timeout: to_chrono(config.liveness_timeout),
            cross_check_window: to_chrono(config.cross_check_window),
            recovery_streak: config.recovery_streak,
            walking_threshold_g: config.walking_threshold_g,
            inactivity_advisory: to_chrono(config.inactivity_advisory),
        }
    }
}

impl Default for FusionParams {
    fn default() -> Self {
        Self::from(&FusionConfig::default())
    }
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}
