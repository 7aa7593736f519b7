//! SilverGuard fusion - multi-sensor fall detection for elderly care.
//!
//! Each monitored person carries two independent accelerometer sources: a
//! body-worn IoT node and a phone. Either may drop off the network at any
//! time. This library decides, per person and in near real time, whether a
//! fall has genuinely happened.
//!
//! # Guarantees
//!
//! - **Never miss**: when only one device is reachable, its positive verdict
//!   raises the alert on its own
//! - **Few false alarms**: when both devices are reachable, a fall must be seen
//!   by both within a short cross-check window
//! - **Bounded memory**: per-device windows drop their oldest samples under load
//! - **Fail safe**: a crashed or garbled classifier counts as "no fall" and
//!   never wedges a user
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SilverGuard Fusion                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌───────────┐   ┌────────────┐   ┌───────────┐  │
//! │  │ Liveness  │──▶│  Window   │──▶│ Classifier │──▶│  Fusion   │  │
//! │  │  Tracker  │   │  Buffers  │   │ (process)  │   │  Machine  │  │
//! │  └───────────┘   └───────────┘   └────────────┘   └───────────┘  │
//! │        ▲                                                │        │
//! │        │ samples                               alerts   ▼        │
//! │  ┌───────────┐                                   ┌───────────┐   │
//! │  │  Server   │◀──── remote configuration ────────│ Notifier  │   │
//! │  └───────────┘                                   └───────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use silverguard_fusion::{
//!     Config, EngineStats, FusionEngine, LogNotifier, SamplePayload, SubprocessClassifier,
//!     SystemClock,
//! };
//!
//! # async fn demo() {
//! let config = Config::default();
//! let engine = FusionEngine::new(
//!     &config,
//!     Arc::new(SubprocessClassifier::from_config(&config)),
//!     Arc::new(LogNotifier),
//!     Arc::new(SystemClock),
//!     Arc::new(EngineStats::new()),
//! );
//!
//! let sample: SamplePayload = serde_json::from_str(
//!     r#"{"userId": "u1", "acc_x": 0.1, "acc_y": 0.0, "acc_z": 0.98, "device_type": "iot"}"#,
//! ).unwrap();
//! let receipt = engine.ingest(sample).unwrap();
//! println!("{:?}", receipt.echo);
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod core;
pub mod engine;
pub mod fusion;
pub mod notifier;
pub mod remote;
pub mod stats;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use classifier::{
    ClassificationRequest, Classifier, ClassifierError, SubprocessClassifier, Verdict,
};
pub use config::{Config, ConfigError, DeviceProfile, FusionConfig};
pub use core::{AccelSample, DeviceClass, IngestError, PerDevice, SamplePayload};
pub use engine::{
    CancelOutcome, Clock, FusionEngine, IngestReceipt, ManualClock, StatusEcho, SystemClock,
};
pub use fusion::{ConfirmationMode, Decision, EmergencyState, SessionSnapshot};
pub use notifier::{EmergencyNotifier, LogNotifier, NotifierError};
pub use remote::{RemoteConfigEvent, RemoteConfigHandle, RemoteOutcome};
pub use stats::{EngineStats, SharedEngineStats, StatsSnapshot};

#[cfg(feature = "webhook")]
pub use notifier::WebhookNotifier;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
