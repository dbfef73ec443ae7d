//! Dispatcher boundary to email, SMS and in-app transports

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::Channel;
use crate::reliability::Retryable;

/// Provider-assigned id of a delivered message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Transient failure such as a timeout or dropped connection; retryable
    #[error("dispatch failed: {0}")]
    Failed(String),

    /// Permanent failure such as an invalid recipient; never retried
    #[error("dispatch rejected: {0}")]
    Rejected(String),

    /// The channel's breaker is open; the transport was not called
    #[error("circuit breaker open for channel {0}")]
    CircuitOpen(Channel),

    /// The owning instance terminated before delivery finished
    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Stable taxonomy name, used in audit reasons
    pub fn code(&self) -> &'static str {
        match self {
            Self::Failed(_) => "DispatchFailed",
            Self::Rejected(_) => "DispatchRejected",
            Self::CircuitOpen(_) => "CircuitOpen",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Sends one notification through one channel
#[async_trait]
pub trait NotificationDispatcher: Send + Sync + 'static {
    async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        template: &str,
        payload: &serde_json::Value,
    ) -> Result<MessageId, DispatchError>;
}

/// Dispatcher that only writes the notification to the log
///
/// Used when no transport is wired in, e.g. local runs of the service.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        template: &str,
        payload: &serde_json::Value,
    ) -> Result<MessageId, DispatchError> {
        let message_id = MessageId(Uuid::now_v7().to_string());
        info!(%channel, recipient, template, %payload, %message_id, "notification sent");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_failed_is_retryable() {
        assert!(DispatchError::Failed("timeout".into()).is_retryable());
        assert!(!DispatchError::Rejected("bad address".into()).is_retryable());
        assert!(!DispatchError::CircuitOpen(Channel::Sms).is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
    }

    #[tokio::test]
    async fn test_log_dispatcher_succeeds() {
        let id = LogDispatcher
            .send(
                Channel::Email,
                "application:1",
                "default-email-template",
                &serde_json::json!({"state": "CREATED"}),
            )
            .await
            .unwrap();
        assert!(!id.0.is_empty());
    }
}
