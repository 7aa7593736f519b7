//! Accelerometer sample types for the fusion engine.
//!
//! Samples arrive on the wire as loosely-typed JSON from two kinds of device.
//! They are validated here, once, before any session state is touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Standard gravity, used to convert m/s² readings into g.
pub const STANDARD_GRAVITY: f64 = 9.8;

/// Any axis above this is taken as a m/s² reading rather than g.
const RAW_UNIT_AXIS_LIMIT: f64 = 5.0;

/// Magnitude above which a sample counts as walking (g).
pub const DEFAULT_WALKING_THRESHOLD_G: f64 = 1.2;

/// Magnitude above which a sample counts as vigorous activity (g).
pub const DEFAULT_ACTIVE_THRESHOLD_G: f64 = 2.0;

/// User id assumed when a client omits one.
pub const GUEST_USER_ID: &str = "guest";

/// One of the two independent sensor sources per monitored person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Body-worn IoT node (pendant).
    #[serde(alias = "iot")]
    Wearable,
    /// The monitored person's phone.
    #[serde(alias = "phone")]
    Handheld,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 2] = [DeviceClass::Wearable, DeviceClass::Handheld];

    /// The other device class of the pair.
    pub fn counterpart(self) -> Self {
        match self {
            DeviceClass::Wearable => DeviceClass::Handheld,
            DeviceClass::Handheld => DeviceClass::Wearable,
        }
    }

    /// Parse the `device_type` field of an ingestion payload.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "iot" | "wearable" => Some(DeviceClass::Wearable),
            "phone" | "handheld" => Some(DeviceClass::Handheld),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Wearable => "wearable",
            DeviceClass::Handheld => "handheld",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed pair of values, one per device class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerDevice<T> {
    pub wearable: T,
    pub handheld: T,
}

impl<T> PerDevice<T> {
    pub fn new(wearable: T, handheld: T) -> Self {
        Self { wearable, handheld }
    }

    pub fn get(&self, device: DeviceClass) -> &T {
        match device {
            DeviceClass::Wearable => &self.wearable,
            DeviceClass::Handheld => &self.handheld,
        }
    }

    pub fn get_mut(&mut self, device: DeviceClass) -> &mut T {
        match device {
            DeviceClass::Wearable => &mut self.wearable,
            DeviceClass::Handheld => &mut self.handheld,
        }
    }
}

/// A validated triaxial reading.
///
/// Gyro axes are optional on the wire (phones send zeros) and are only
/// forwarded to the classifier, never interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    #[serde(default)]
    pub gyro_x: f64,
    #[serde(default)]
    pub gyro_y: f64,
    #[serde(default)]
    pub gyro_z: f64,
}

impl AccelSample {
    pub fn new(acc_x: f64, acc_y: f64, acc_z: f64) -> Self {
        Self {
            acc_x,
            acc_y,
            acc_z,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.0,
        }
    }

    /// Combined-axis acceleration magnitude in g.
    ///
    /// Readings with any axis above 5 are assumed to be m/s² and are scaled
    /// down by standard gravity first.
    pub fn magnitude(&self) -> f64 {
        let (mut x, mut y, mut z) = (self.acc_x, self.acc_y, self.acc_z);
        if x.abs() > RAW_UNIT_AXIS_LIMIT
            || y.abs() > RAW_UNIT_AXIS_LIMIT
            || z.abs() > RAW_UNIT_AXIS_LIMIT
        {
            x /= STANDARD_GRAVITY;
            y /= STANDARD_GRAVITY;
            z /= STANDARD_GRAVITY;
        }
        (x * x + y * y + z * z).sqrt()
    }
}

/// Coarse activity classification of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Resting,
    Walking,
    Active,
}

impl ActivityLevel {
    pub fn classify(magnitude: f64, walking_threshold: f64) -> Self {
        if magnitude > DEFAULT_ACTIVE_THRESHOLD_G.max(walking_threshold) {
            ActivityLevel::Active
        } else if magnitude > walking_threshold {
            ActivityLevel::Walking
        } else {
            ActivityLevel::Resting
        }
    }

    /// Whether this level counts as movement for inactivity and recovery.
    pub fn is_moving(self) -> bool {
        !matches!(self, ActivityLevel::Resting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityLevel::Resting => "resting",
            ActivityLevel::Walking => "walking",
            ActivityLevel::Active => "active",
        }
    }
}

/// Raw ingestion payload, as posted by mobile and IoT clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplePayload {
    #[serde(default, rename = "userId", alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub acc_x: Option<f64>,
    #[serde(default)]
    pub acc_y: Option<f64>,
    #[serde(default)]
    pub acc_z: Option<f64>,
    #[serde(default)]
    pub gyro_x: Option<f64>,
    #[serde(default)]
    pub gyro_y: Option<f64>,
    #[serde(default)]
    pub gyro_z: Option<f64>,
    #[serde(default, alias = "deviceClass")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub sensitivity: Option<i64>,
}

/// Why an ingestion payload was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` is not a finite number")]
    NonFinite(&'static str),
    #[error("unknown device type `{0}`")]
    UnknownDevice(String),
    #[error("user id must not be empty")]
    EmptyUserId,
}

/// A sample that passed validation, stamped with its arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingSample {
    pub user_id: String,
    pub device: DeviceClass,
    pub sample: AccelSample,
    pub sensitivity: Option<u8>,
    pub received_at: DateTime<Utc>,
}

impl SamplePayload {
    /// Validate the payload. Nothing is mutated on failure.
    pub fn validate(self, received_at: DateTime<Utc>) -> Result<IncomingSample, IngestError> {
        let acc_x = required_axis(self.acc_x, "acc_x")?;
        let acc_y = required_axis(self.acc_y, "acc_y")?;
        let acc_z = required_axis(self.acc_z, "acc_z")?;

        let user_id = match self.user_id {
            Some(id) if id.trim().is_empty() => return Err(IngestError::EmptyUserId),
            Some(id) => id.trim().to_string(),
            None => GUEST_USER_ID.to_string(),
        };

        let device = match self.device_type.as_deref() {
            Some(raw) => DeviceClass::from_wire(raw)
                .ok_or_else(|| IngestError::UnknownDevice(raw.to_string()))?,
            None => DeviceClass::Handheld,
        };

        Ok(IncomingSample {
            user_id,
            device,
            sample: AccelSample {
                acc_x,
                acc_y,
                acc_z,
                gyro_x: optional_axis(self.gyro_x, "gyro_x")?,
                gyro_y: optional_axis(self.gyro_y, "gyro_y")?,
                gyro_z: optional_axis(self.gyro_z, "gyro_z")?,
            },
            sensitivity: self.sensitivity.map(clamp_sensitivity),
            received_at,
        })
    }
}

/// Clamp an externally supplied sensitivity into the classifier's 1..=100 range.
pub fn clamp_sensitivity(value: i64) -> u8 {
    value.clamp(1, 100) as u8
}

fn required_axis(value: Option<f64>, name: &'static str) -> Result<f64, IngestError> {
    match value {
        None => Err(IngestError::MissingField(name)),
        Some(v) if !v.is_finite() => Err(IngestError::NonFinite(name)),
        Some(v) => Ok(v),
    }
}

fn optional_axis(value: Option<f64>, name: &'static str) -> Result<f64, IngestError> {
    match value {
        None => Ok(0.0),
        Some(v) if !v.is_finite() => Err(IngestError::NonFinite(name)),
        Some(v) => Ok(v),
    }
}
