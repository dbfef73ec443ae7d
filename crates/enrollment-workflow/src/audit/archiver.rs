//! Periodic retention sweep

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{AuditConfig, AuditError, AuditRecorder};
use crate::clock::{chrono_duration, Clock, TimerOutcome};

/// Moves entries past the retention window into the archive
pub struct AuditArchiver {
    config: AuditConfig,
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
}

impl AuditArchiver {
    pub fn new(config: AuditConfig, audit: Arc<dyn AuditRecorder>, clock: Arc<dyn Clock>) -> Self {
        Self { config, audit, clock }
    }

    /// Archive everything older than `now - retention`
    pub async fn run_once(&self) -> Result<usize, AuditError> {
        let cutoff = self.clock.now() - chrono_duration(self.config.retention);
        let moved = self.audit.archive_before(cutoff).await?;
        if moved > 0 {
            info!(moved, %cutoff, "archived audit entries");
        } else {
            debug!(%cutoff, "no audit entries past retention");
        }
        Ok(moved)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.archive_interval.as_millis() as u64,
            "audit archiver started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.run_once().await {
                error!("audit archival failed: {}", e);
            }

            let timer = self.clock.after(self.config.archive_interval);
            let cancel = timer.cancellation();
            let outcome = tokio::select! {
                _ = shutdown.changed() => {
                    cancel.cancel();
                    TimerOutcome::Cancelled
                }
                outcome = timer.wait() => outcome,
            };
            if outcome == TimerOutcome::Cancelled {
                break;
            }
        }

        info!("audit archiver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Actor, AuditKind, AuditOutcome, InMemoryAuditLog, NewAuditEntry};
    use crate::clock::ManualClock;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_archives_past_retention_only() {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(InMemoryAuditLog::new());
        let config = AuditConfig {
            retention: Duration::from_secs(3600),
            ..AuditConfig::default()
        };
        let archiver = AuditArchiver::new(config, audit.clone(), clock.clone());
        let id = Uuid::now_v7();

        let entry = |clock: &ManualClock| {
            NewAuditEntry::new(id, AuditKind::Created, AuditOutcome::Applied, Actor::user("u"), clock.now())
        };
        audit.append(entry(&clock)).await.unwrap();
        clock.advance(Duration::from_secs(7200));
        audit.append(entry(&clock)).await.unwrap();

        assert_eq!(archiver.run_once().await.unwrap(), 1);
        assert_eq!(audit.archived_len(), 1);
        assert_eq!(audit.trail(id).await.unwrap().len(), 2);
    }
}
