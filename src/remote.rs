//! Remote configuration intake.
//!
//! Caregiver apps change a user's sensitivity or cancel an emergency from
//! elsewhere. Those changes reach the engine as events on a channel, consumed
//! by a single listener task, so they are applied in the order they were sent.

use crate::engine::{CancelOutcome, FusionEngine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default capacity of the event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A change pushed by the remote configuration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteConfigEvent {
    Sensitivity { user_id: String, sensitivity: i64 },
    Cancel { user_id: String },
}

impl RemoteConfigEvent {
    pub fn user_id(&self) -> &str {
        match self {
            RemoteConfigEvent::Sensitivity { user_id, .. } => user_id,
            RemoteConfigEvent::Cancel { user_id } => user_id,
        }
    }
}

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteOutcome {
    /// Sensitivity stored, after clamping
    SensitivityApplied { sensitivity: u8 },
    Cancel { outcome: CancelOutcome },
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote configuration listener is not running")]
    ListenerClosed,
}

struct Envelope {
    event: RemoteConfigEvent,
    ack: Option<oneshot::Sender<RemoteOutcome>>,
}

/// Sending side of the intake channel.
#[derive(Clone)]
pub struct RemoteConfigHandle {
    tx: mpsc::Sender<Envelope>,
}

impl RemoteConfigHandle {
    /// Queue an event without waiting for it to be applied.
    pub async fn send(&self, event: RemoteConfigEvent) -> Result<(), RemoteError> {
        self.tx
            .send(Envelope { event, ack: None })
            .await
            .map_err(|_| RemoteError::ListenerClosed)
    }

    /// Queue an event and wait until the listener has applied it.
    pub async fn request(&self, event: RemoteConfigEvent) -> Result<RemoteOutcome, RemoteError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Envelope {
                event,
                ack: Some(ack),
            })
            .await
            .map_err(|_| RemoteError::ListenerClosed)?;
        done.await.map_err(|_| RemoteError::ListenerClosed)
    }
}

/// Receiving side, handed to [`spawn_listener`].
pub struct RemoteConfigReceiver {
    rx: mpsc::Receiver<Envelope>,
}

pub fn channel(capacity: usize) -> (RemoteConfigHandle, RemoteConfigReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RemoteConfigHandle { tx }, RemoteConfigReceiver { rx })
}

/// Apply one event to the engine.
pub fn apply(engine: &FusionEngine, event: RemoteConfigEvent) -> RemoteOutcome {
    match event {
        RemoteConfigEvent::Sensitivity {
            user_id,
            sensitivity,
        } => RemoteOutcome::SensitivityApplied {
            sensitivity: engine.update_sensitivity(&user_id, sensitivity),
        },
        RemoteConfigEvent::Cancel { user_id } => {
            let outcome = engine.cancel_emergency(&user_id);
            if outcome == CancelOutcome::UnknownUser {
                tracing::warn!(user = %user_id, "Cancellation for unknown user ignored");
            }
            RemoteOutcome::Cancel { outcome }
        }
    }
}

/// Consume events until every handle has been dropped.
pub fn spawn_listener(engine: Arc<FusionEngine>, receiver: RemoteConfigReceiver) -> JoinHandle<()> {
    let mut rx = receiver.rx;
    tokio::spawn(async move {
        while let Some(Envelope { event, ack }) = rx.recv().await {
            tracing::debug!(user = %event.user_id(), "Remote configuration event: {:?}", event);
            let outcome = apply(&engine, event);
            if let Some(ack) = ack {
                // Requester may have given up waiting.
                let _ = ack.send(outcome);
            }
        }
        tracing::debug!("Remote configuration listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event: RemoteConfigEvent =
            serde_json::from_str(r#"{"type":"sensitivity","user_id":"u1","sensitivity":75}"#)
                .unwrap();
        assert_eq!(
            event,
            RemoteConfigEvent::Sensitivity {
                user_id: "u1".to_string(),
                sensitivity: 75
            }
        );

        let event: RemoteConfigEvent =
            serde_json::from_str(r#"{"type":"cancel","user_id":"u2"}"#).unwrap();
        assert_eq!(event.user_id(), "u2");
    }

    #[tokio::test]
    async fn test_closed_listener_is_reported() {
        let (handle, receiver) = channel(4);
        drop(receiver);
        let result = handle
            .send(RemoteConfigEvent::Cancel {
                user_id: "u1".to_string(),
            })
            .await;
        assert!(matches!(result, Err(RemoteError::ListenerClosed)));
    }
}
