//! Emergency notification.
//!
//! The engine calls the notifier exactly once per confirmed emergency and once
//! per auto-recovery. Delivery is fire-and-forget from the engine's point of
//! view: failures are logged and never roll back the fusion state.

use crate::config::NotifierSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Timezone of the caregiver-facing `local_date` field.
pub const LOCAL_TIMEZONE: chrono_tz::Tz = chrono_tz::Asia::Seoul;

/// Notifier error types.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// Network/HTTP error
    #[error("Notifier network error: {0}")]
    Network(String),
    /// Receiver returned an error response
    #[error("Notifier server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// JSON serialization error
    #[error("Notifier serialization error: {0}")]
    Serialization(String),
}

/// Kind of state change being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FallDetected,
    Recovered,
}

impl AlertKind {
    /// Status the persistent record moves to.
    pub fn status(self) -> &'static str {
        match self {
            AlertKind::FallDetected => "emergency",
            AlertKind::Recovered => "normal",
        }
    }
}

/// Collaborator that persists and delivers emergency state changes.
#[async_trait]
pub trait EmergencyNotifier: Send + Sync {
    async fn notify_emergency(&self, user_id: &str, source: &str) -> Result<(), NotifierError>;

    async fn notify_recovery(&self, user_id: &str, source: &str) -> Result<(), NotifierError>;
}

/// Event document delivered to external receivers.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    /// Unique per delivery, lets receivers de-duplicate
    pub event_id: String,
    pub user_id: String,
    pub event: AlertKind,
    pub status: &'static str,
    /// Which devices confirmed the event
    pub source: String,
    /// RFC 3339, UTC
    pub timestamp: String,
    /// Calendar date in the caregivers' timezone
    pub local_date: String,
    /// Host that produced the event
    pub node: String,
}

impl AlertEvent {
    pub fn new(
        kind: AlertKind,
        user_id: &str,
        source: &str,
        at: DateTime<Utc>,
        node: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            event: kind,
            status: kind.status(),
            source: source.to_string(),
            timestamp: at.to_rfc3339(),
            local_date: at
                .with_timezone(&LOCAL_TIMEZONE)
                .format("%Y-%m-%d")
                .to_string(),
            node: node.to_string(),
        }
    }
}

/// Name of this host, used to tag outgoing events.
pub fn node_name() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("silverguard-{hostname}")
}

/// Build the notifier described by the configuration.
///
/// Falls back to [`LogNotifier`] when no webhook is configured.
pub fn from_settings(
    settings: &NotifierSettings,
) -> Result<Arc<dyn EmergencyNotifier>, NotifierError> {
    match settings.webhook_url.as_deref() {
        #[cfg(feature = "webhook")]
        Some(url) => {
            tracing::info!("Delivering alerts to webhook {}", url);
            let notifier = WebhookNotifier::new(url, settings.webhook_token.clone())?;
            Ok(Arc::new(notifier))
        }
        #[cfg(not(feature = "webhook"))]
        Some(url) => {
            tracing::warn!(
                "Webhook {} configured but the webhook feature is disabled; alerts are only logged",
                url
            );
            Ok(Arc::new(LogNotifier))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl EmergencyNotifier for LogNotifier {
    async fn notify_emergency(&self, user_id: &str, source: &str) -> Result<(), NotifierError> {
        tracing::warn!(user = %user_id, source = %source, "EMERGENCY: fall confirmed");
        Ok(())
    }

    async fn notify_recovery(&self, user_id: &str, source: &str) -> Result<(), NotifierError> {
        tracing::info!(user = %user_id, source = %source, "User recovered");
        Ok(())
    }
}

/// Notifier that posts [`AlertEvent`]s to an HTTP endpoint.
#[cfg(feature = "webhook")]
pub struct WebhookNotifier {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
    node: String,
}

#[cfg(feature = "webhook")]
impl WebhookNotifier {
    /// Create a new webhook notifier.
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, NotifierError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| NotifierError::Network(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            token,
            client,
            node: node_name(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), NotifierError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(event);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifierError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NotifierError::Server {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!(event_id = %event.event_id, user = %event.user_id, "Alert delivered");
        Ok(())
    }
}

#[cfg(feature = "webhook")]
#[async_trait]
impl EmergencyNotifier for WebhookNotifier {
    async fn notify_emergency(&self, user_id: &str, source: &str) -> Result<(), NotifierError> {
        let event = AlertEvent::new(AlertKind::FallDetected, user_id, source, Utc::now(), &self.node);
        self.deliver(&event).await
    }

    async fn notify_recovery(&self, user_id: &str, source: &str) -> Result<(), NotifierError> {
        let event = AlertEvent::new(AlertKind::Recovered, user_id, source, Utc::now(), &self.node);
        self.deliver(&event).await
    }
}
