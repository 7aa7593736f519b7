//! Classifier invocation.
//!
//! Fall classification is done by an external process, one per ready window.
//! The engine writes a single JSON document to the child's stdin:
//!
//! ```text
//! {"data": [{"acc_x": .., "acc_y": .., "acc_z": .., "gyro_x": .., ..}, ..],
//!  "config": {"threshold": 50}}
//! ```
//!
//! and expects a single JSON document on stdout:
//!
//! ```text
//! {"result": 1, "probability": 0.83}
//! ```
//!
//! Anything else resolves to a miss. A broken classifier must never raise an
//! alert on its own.

use crate::config::{Config, DeviceProfile};
use crate::core::sample::{AccelSample, DeviceClass, PerDevice};
use crate::core::windowing::WindowSummary;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Outcome of one classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub positive: bool,
    pub probability: f64,
}

impl Verdict {
    /// The miss-safe verdict used whenever classification fails.
    pub fn miss() -> Self {
        Self {
            positive: false,
            probability: 0.0,
        }
    }

    pub fn fall(probability: f64) -> Self {
        Self {
            positive: true,
            probability,
        }
    }

    /// Parse classifier stdout.
    ///
    /// Some runtimes print banners before the result, so when the whole output
    /// is not a document the last non-empty line is tried instead.
    pub fn parse(stdout: &str) -> Result<Self, ClassifierError> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Err(ClassifierError::EmptyOutput);
        }

        let raw = match serde_json::from_str::<RawVerdict>(trimmed) {
            Ok(raw) => raw,
            Err(first) => {
                let last_line = trimmed
                    .lines()
                    .rev()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .unwrap_or_default();
                serde_json::from_str::<RawVerdict>(last_line)
                    .map_err(|_| ClassifierError::Parse(first.to_string()))?
            }
        };

        let positive = match raw.result {
            0 => false,
            1 => true,
            other => {
                return Err(ClassifierError::Parse(format!(
                    "result must be 0 or 1, got {other}"
                )))
            }
        };

        if !raw.probability.is_finite() {
            return Err(ClassifierError::Parse("probability is not finite".into()));
        }

        Ok(Self {
            positive,
            probability: raw.probability.clamp(0.0, 1.0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    result: i64,
    #[serde(default)]
    probability: f64,
}

/// A window submitted for classification.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub user_id: String,
    pub device: DeviceClass,
    pub window: Vec<AccelSample>,
    pub sensitivity: u8,
}

impl ClassificationRequest {
    pub fn summary(&self) -> WindowSummary {
        WindowSummary::from_samples(&self.window)
    }
}

/// Document written to the classifier's stdin.
#[derive(Debug, Serialize)]
struct ClassifierInput<'a> {
    data: &'a [AccelSample],
    config: ClassifierInputConfig,
}

#[derive(Debug, Serialize)]
struct ClassifierInputConfig {
    threshold: f64,
}

impl<'a> ClassifierInput<'a> {
    fn new(request: &'a ClassificationRequest) -> Self {
        Self {
            data: &request.window,
            config: ClassifierInputConfig {
                threshold: f64::from(request.sensitivity),
            },
        }
    }
}

/// Classifier failure modes. All of them resolve to [`Verdict::miss`].
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("no classifier command configured for {0}")]
    MissingCommand(DeviceClass),
    #[error("failed to spawn classifier: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("classifier pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode classifier input: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("classifier exited with status {0:?}")]
    ExitStatus(Option<i32>),
    #[error("classifier produced no output")]
    EmptyOutput,
    #[error("unparseable classifier output: {0}")]
    Parse(String),
    #[error("classifier did not answer within {0:?}")]
    Timeout(Duration),
}

/// Anything that can turn a window into a verdict.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Verdict, ClassifierError>;
}

/// Run a classification, folding every failure into the miss-safe verdict.
///
/// Returns the verdict and whether the classifier failed.
pub async fn classify_or_miss(
    classifier: &dyn Classifier,
    request: &ClassificationRequest,
) -> (Verdict, bool) {
    match classifier.classify(request).await {
        Ok(verdict) => (verdict, false),
        Err(e) => {
            tracing::warn!(
                user = %request.user_id,
                device = %request.device,
                "Classifier failed, treating window as no fall: {}",
                e
            );
            (Verdict::miss(), true)
        }
    }
}

/// Runs one child process per window.
#[derive(Debug, Clone)]
pub struct SubprocessClassifier {
    profiles: PerDevice<DeviceProfile>,
    timeout: Option<Duration>,
}

impl SubprocessClassifier {
    pub fn new(wearable: DeviceProfile, handheld: DeviceProfile, timeout: Option<Duration>) -> Self {
        Self {
            profiles: PerDevice::new(wearable, handheld),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.wearable.clone(),
            config.handheld.clone(),
            config.fusion.classifier_timeout,
        )
    }

    async fn run(&self, request: &ClassificationRequest) -> Result<Verdict, ClassifierError> {
        let profile = self.profiles.get(request.device);
        let (program, args) = profile
            .command
            .split_first()
            .ok_or(ClassifierError::MissingCommand(request.device))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &profile.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(ClassifierError::Spawn)?;
        let payload = serde_json::to_vec(&ClassifierInput::new(request))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("classifier stdin unavailable"))?;
        let write_input = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
            // stdin dropped here, closing the pipe
        };

        let (written, output) = tokio::join!(write_input, child.wait_with_output());
        let output = output?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line.contains("ERROR") {
                tracing::warn!(user = %request.user_id, device = %request.device, "classifier: {}", line);
            } else {
                tracing::debug!(user = %request.user_id, device = %request.device, "classifier: {}", line);
            }
        }

        if !output.status.success() {
            return Err(ClassifierError::ExitStatus(output.status.code()));
        }
        // A child that exits without reading all input can still answer.
        if let Err(e) = written {
            tracing::debug!("Classifier closed stdin early: {}", e);
        }

        Verdict::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl Classifier for SubprocessClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Verdict, ClassifierError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(request))
                .await
                .map_err(|_| ClassifierError::Timeout(limit))?,
            None => self.run(request).await,
        }
    }
}
