//! User notifications for the confirmation protocol.
//!
//! Notifications are fire-and-forget: the caller spawns them and failures
//! are only logged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::errors::AgentError;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    ConfirmationPending,
    ConfirmationTimeout,
    ConfirmationEscalated,
    ActionAutoExecuted,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::ConfirmationPending => "confirmation_pending",
            NotificationEvent::ConfirmationTimeout => "confirmation_timeout",
            NotificationEvent::ConfirmationEscalated => "confirmation_escalated",
            NotificationEvent::ActionAutoExecuted => "action_auto_executed",
        }
    }
}

/// A delivered notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub event: NotificationEvent,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: &str,
        event: NotificationEvent,
        payload: serde_json::Value,
    ) -> Result<(), AgentError>;
}

/// Deliver without waiting. Errors are logged at warn.
pub fn spawn_notify(
    notifier: &Arc<dyn Notifier>,
    user_id: &str,
    event: NotificationEvent,
    payload: serde_json::Value,
) {
    let notifier = Arc::clone(notifier);
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&user_id, event, payload).await {
            tracing::warn!(user_id = %user_id, event = event.as_str(), error = %e, "notification failed");
        }
    });
}

// ─── Implementations ────────────────────────────────────────────────────────

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        user_id: &str,
        event: NotificationEvent,
        payload: serde_json::Value,
    ) -> Result<(), AgentError> {
        tracing::info!(user_id = %user_id, event = event.as_str(), payload = %payload, "notify");
        Ok(())
    }
}

/// Forwards notifications into an mpsc channel (UI bridge, tests).
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(
        &self,
        user_id: &str,
        event: NotificationEvent,
        payload: serde_json::Value,
    ) -> Result<(), AgentError> {
        self.tx
            .send(Notification {
                user_id: user_id.to_string(),
                event,
                payload,
            })
            .await
            .map_err(|_| AgentError::AgentFailed {
                agent: "notifier".into(),
                reason: "notification channel closed".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new(4);
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        spawn_notify(
            &notifier,
            "u1",
            NotificationEvent::ConfirmationPending,
            serde_json::json!({"request_id": "r1"}),
        );
        let n = rx.recv().await.unwrap();
        assert_eq!(n.user_id, "u1");
        assert_eq!(n.event, NotificationEvent::ConfirmationPending);
        assert_eq!(n.payload["request_id"], "r1");
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (notifier, rx) = ChannelNotifier::new(1);
        drop(rx);
        let result = notifier
            .notify("u1", NotificationEvent::ConfirmationTimeout, serde_json::Value::Null)
            .await;
        assert!(result.is_err());
    }
}
