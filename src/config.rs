//! Configuration for the SilverGuard fusion engine.

use crate::core::sample::{DeviceClass, DEFAULT_WALKING_THRESHOLD_G};
use crate::core::windowing::WindowShape;
use crate::core::DEFAULT_LIVENESS_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Sensitivity used until the remote configuration says otherwise.
pub const DEFAULT_SENSITIVITY: u8 = 50;

/// Default ingestion port.
pub const DEFAULT_PORT: u16 = 60010;

/// Main configuration for the engine and its server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fusion timing and thresholds
    pub fusion: FusionConfig,

    /// Window and classifier settings for the body-worn node
    pub wearable: DeviceProfile,

    /// Window and classifier settings for the phone
    pub handheld: DeviceProfile,

    /// HTTP ingestion server
    pub server: ServerSettings,

    /// Where confirmed emergencies are delivered
    pub notifier: NotifierSettings,

    /// Path for persisted statistics
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("silverguard");

        Self {
            fusion: FusionConfig::default(),
            wearable: DeviceProfile::wearable(),
            handheld: DeviceProfile::handheld(),
            server: ServerSettings::default(),
            notifier: NotifierSettings::default(),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("silverguard")
            .join("config.json")
    }

    /// Path of the persisted statistics file.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    pub fn profile(&self, device: DeviceClass) -> &DeviceProfile {
        match device {
            DeviceClass::Wearable => &self.wearable,
            DeviceClass::Handheld => &self.handheld,
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for device in DeviceClass::ALL {
            let profile = self.profile(device);
            if !profile.window.is_valid() {
                return Err(ConfigError::Invalid(format!(
                    "{device} window needs 0 < slide <= capacity (got capacity {}, slide {})",
                    profile.window.capacity, profile.window.slide
                )));
            }
            if profile.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{device} classifier command is empty"
                )));
            }
        }

        let fusion = &self.fusion;
        if fusion.liveness_timeout.is_zero() {
            return Err(ConfigError::Invalid("liveness_timeout must be positive".into()));
        }
        if fusion.recovery_streak == 0 {
            return Err(ConfigError::Invalid("recovery_streak must be positive".into()));
        }
        if !(1..=100).contains(&fusion.default_sensitivity) {
            return Err(ConfigError::Invalid(
                "default_sensitivity must be within 1..=100".into(),
            ));
        }
        if !fusion.walking_threshold_g.is_finite() || fusion.walking_threshold_g <= 0.0 {
            return Err(ConfigError::Invalid(
                "walking_threshold_g must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

/// Timing and threshold parameters of the fusion state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// A device is offline once its last sample is this old
    #[serde(with = "duration_serde")]
    pub liveness_timeout: Duration,

    /// Span within which the other device must confirm a candidate fall
    #[serde(with = "duration_serde")]
    pub cross_check_window: Duration,

    /// Post-alert suppression of classification
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,

    /// Consecutive walking samples that clear an emergency
    pub recovery_streak: u32,

    /// Magnitude (g) above which a sample counts as walking
    pub walking_threshold_g: f64,

    /// Sensitivity assumed for users without remote configuration
    pub default_sensitivity: u8,

    /// Inactivity span that raises the long-inactivity advisory
    #[serde(with = "duration_serde")]
    pub inactivity_advisory: Duration,

    /// Upper bound on a classifier run; unbounded when unset
    #[serde(with = "option_duration_serde")]
    pub classifier_timeout: Option<Duration>,

    /// Idle sessions are evicted after this long; never when unset
    #[serde(with = "option_duration_serde")]
    pub session_idle_timeout: Option<Duration>,

    /// How often the eviction sweep runs
    #[serde(with = "duration_serde")]
    pub eviction_sweep_interval: Duration,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_millis(DEFAULT_LIVENESS_TIMEOUT_MS),
            cross_check_window: Duration::from_secs(3),
            cooldown: Duration::from_secs(5),
            recovery_streak: 30,
            walking_threshold_g: DEFAULT_WALKING_THRESHOLD_G,
            default_sensitivity: DEFAULT_SENSITIVITY,
            inactivity_advisory: Duration::from_secs(60 * 60),
            classifier_timeout: None,
            session_idle_timeout: None,
            eviction_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Window geometry and classifier command for one device class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    #[serde(flatten)]
    pub window: WindowShape,

    /// Program and arguments of the classifier process
    pub command: Vec<String>,

    /// Working directory for the classifier (model files are resolved relative to it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl DeviceProfile {
    pub fn wearable() -> Self {
        Self {
            window: WindowShape::wearable(),
            command: vec!["python3".to_string(), "predict_lstm.py".to_string()],
            working_dir: None,
        }
    }

    pub fn handheld() -> Self {
        Self {
            window: WindowShape::handheld(),
            command: vec!["python3".to_string(), "predict_rf.py".to_string()],
            working_dir: None,
        }
    }
}

/// HTTP ingestion server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Emergency delivery settings. Without a webhook alerts are only logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_token: Option<String>,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration, in milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.fusion.liveness_timeout, Duration::from_secs(10));
        assert_eq!(config.fusion.cross_check_window, Duration::from_secs(3));
        assert_eq!(config.fusion.cooldown, Duration::from_secs(5));
        assert_eq!(config.fusion.recovery_streak, 30);
        assert_eq!(config.wearable.window.capacity, 150);
        assert_eq!(config.handheld.window.slide, 25);
        assert!(config.fusion.classifier_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"fusion": {"cooldown": 2500, "classifier_timeout": 800}}"#)
                .unwrap();
        assert_eq!(config.fusion.cooldown, Duration::from_millis(2500));
        assert_eq!(
            config.fusion.classifier_timeout,
            Some(Duration::from_millis(800))
        );
        assert_eq!(config.fusion.cross_check_window, Duration::from_secs(3));
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn test_validate_rejects_bad_slide() {
        let mut config = Config::default();
        config.handheld.window.slide = 80;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.fusion.session_idle_timeout = Some(Duration::from_secs(1800));
        config.notifier.webhook_url = Some("http://127.0.0.1:9/alerts".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(
            loaded.fusion.session_idle_timeout,
            Some(Duration::from_secs(1800))
        );
        assert_eq!(loaded.notifier.webhook_url, config.notifier.webhook_url);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
    }
}
