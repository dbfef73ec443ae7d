//! Append-only audit log
//!
//! Every transition attempt, fact change, deadline signal and failed
//! notification lands here. Entries are ordered by a sequence number assigned
//! at append time and are never changed afterwards; old entries move to an
//! archive once the retention window passes, but stay readable.

mod archiver;
mod entry;
mod memory;
mod postgres;
mod replay;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::serde_duration::duration_millis;

pub use archiver::AuditArchiver;
pub use entry::{Actor, AuditEntry, AuditKind, AuditOutcome, NewAuditEntry};
pub use memory::InMemoryAuditLog;
pub use postgres::PostgresAuditLog;
pub use replay::{history_as_of, replay, ReplayError, ReplayedState};

/// Audit log errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuditError {
    /// The log could not accept or return entries
    #[error("audit log unavailable: {0}")]
    Unavailable(String),

    #[error("audit serialization error: {0}")]
    Serialization(String),
}

/// Append-only, sequence-ordered record of everything the engine did
#[async_trait]
pub trait AuditRecorder: Send + Sync + 'static {
    /// Append an entry and return it with its assigned sequence number
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditError>;

    /// Full history of one instance, archived entries included, in sequence order
    async fn trail(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, AuditError>;

    /// History of one instance as it stood at `at`
    async fn trail_as_of(
        &self,
        instance_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let trail = self.trail(instance_id).await?;
        Ok(history_as_of(trail, at))
    }

    /// Move entries older than `cutoff` from the active log to the archive
    ///
    /// Returns how many entries moved.
    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError>;
}

/// Retention settings for the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Entries older than this move to the archive
    #[serde(rename = "retention_ms", with = "duration_millis")]
    pub retention: Duration,

    /// How often the archiver runs
    #[serde(rename = "archive_interval_ms", with = "duration_millis")]
    pub archive_interval: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(365 * 24 * 60 * 60),
            archive_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention.is_zero() {
            return Err(ConfigError::Invalid {
                field: "audit.retention_ms",
                reason: "must be positive".into(),
            });
        }
        if self.archive_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "audit.archive_interval_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}
