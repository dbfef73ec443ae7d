//! Notification dispatch
//!
//! The engine never waits for delivery. Committed changes enqueue a
//! [`Notification`]; the [`NotificationWorker`] drains the queue and sends it on
//! every enabled channel through retry and a per-channel circuit breaker.
//! Delivery failures are audited and never roll back a committed transition.

mod dispatcher;
mod service;
mod worker;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::reliability::RetryPolicy;

pub use dispatcher::{DispatchError, LogDispatcher, MessageId, NotificationDispatcher};
pub use service::{Notification, NotificationEvent, NotificationQueue, NotificationService};
pub use worker::{ChannelDelivery, NotificationWorker};

/// Delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    InApp,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Self::Email, Self::Sms, Self::InApp];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::InApp => "in_app",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub template: String,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl ChannelConfig {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            enabled: true,
            template: template.into(),
            retry_policy: RetryPolicy::exponential(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// The `[notifications]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub email: ChannelConfig,
    pub sms: ChannelConfig,
    pub in_app: ChannelConfig,

    /// Recipient of deadline warnings and escalations
    pub supervisor_recipient: String,

    /// Pending notifications held before new ones are refused
    pub queue_capacity: usize,

    /// Dispatches running at once
    pub max_concurrent_dispatches: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            email: ChannelConfig::new("default-email-template"),
            sms: ChannelConfig::new("default-sms-template"),
            in_app: ChannelConfig::new("default-inapp-template"),
            supervisor_recipient: "role:enrollment-supervisor".to_string(),
            queue_capacity: 1024,
            max_concurrent_dispatches: 16,
        }
    }
}

impl NotificationConfig {
    pub fn channel(&self, channel: Channel) -> &ChannelConfig {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::InApp => &self.in_app,
        }
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut ChannelConfig {
        match channel {
            Channel::Email => &mut self.email,
            Channel::Sms => &mut self.sms,
            Channel::InApp => &mut self.in_app,
        }
    }

    /// Enabled channels in a fixed order
    pub fn enabled_channels(&self) -> impl Iterator<Item = (Channel, &ChannelConfig)> {
        Channel::ALL
            .into_iter()
            .map(|channel| (channel, self.channel(channel)))
            .filter(|(_, config)| config.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "notifications.queue_capacity",
                reason: "must be positive".into(),
            });
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(ConfigError::Invalid {
                field: "notifications.max_concurrent_dispatches",
                reason: "must be positive".into(),
            });
        }
        for channel in Channel::ALL {
            let config = self.channel(channel);
            if config.template.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "notifications.template",
                    reason: format!("{channel} template is empty"),
                });
            }
            config.retry_policy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_every_channel() {
        let config = NotificationConfig::default();
        let enabled: Vec<_> = config.enabled_channels().map(|(c, _)| c).collect();
        assert_eq!(enabled, Channel::ALL.to_vec());
        assert_eq!(config.email.retry_policy.max_attempts, 3);
        assert_eq!(config.max_concurrent_dispatches, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disabled_channel_is_skipped() {
        let mut config = NotificationConfig::default();
        config.sms = config.sms.clone().disabled();
        let enabled: Vec<_> = config.enabled_channels().map(|(c, _)| c).collect();
        assert_eq!(enabled, vec![Channel::Email, Channel::InApp]);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = NotificationConfig {
            queue_capacity: 0,
            ..NotificationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
