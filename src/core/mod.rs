//! Core building blocks of the fusion engine.
//!
//! This module contains:
//! - Sample validation, magnitude and activity classification
//! - Per-device liveness tracking
//! - Sliding classifier windows

pub mod liveness;
pub mod sample;
pub mod windowing;

// Re-export commonly used types
pub use liveness::{LivenessTracker, DEFAULT_LIVENESS_TIMEOUT_MS};
pub use sample::{
    clamp_sensitivity, AccelSample, ActivityLevel, DeviceClass, IncomingSample, IngestError,
    PerDevice, SamplePayload, DEFAULT_WALKING_THRESHOLD_G, GUEST_USER_ID,
};
pub use windowing::{WindowBuffer, WindowShape, WindowSummary};
