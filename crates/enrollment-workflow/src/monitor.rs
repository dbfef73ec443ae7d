//! Deadline monitor for active instances
//!
//! Each scan walks the non-terminal instances and compares time spent in the
//! current state with that state's deadline. Crossing the warning fraction
//! raises a warning; crossing the escalation fraction runs the configured
//! timeout action. Neither ever changes instance state.
//!
//! Signals are idempotent per state entry: the monitor remembers the highest
//! level raised for `(instance, state_entered_at)` and, after a restart,
//! recovers it from the audit trail before raising anything again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{Actor, AuditKind, AuditOutcome, AuditRecorder, NewAuditEntry};
use crate::clock::{Clock, TimerOutcome};
use crate::config::ConfigError;
use crate::graph::TransitionGraph;
use crate::instance::WorkflowInstance;
use crate::notification::{NotificationEvent, NotificationService};
use crate::persistence::{StoreError, WorkflowStore};
use crate::serde_duration::duration_millis;

/// What happens once the escalation threshold is crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutAction {
    /// Audit the escalation and notify the supervisor
    NotifyAndEscalate,
    /// Audit the escalation only
    AuditOnly,
}

/// The `[monitor]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(rename = "scan_interval_ms", with = "duration_millis")]
    pub scan_interval: Duration,

    pub timeout_action: TimeoutAction,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            timeout_action: TimeoutAction::NotifyAndEscalate,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "monitor.scan_interval_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Deadline signal level, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeadlineLevel {
    Warning,
    Escalation,
}

impl DeadlineLevel {
    fn audit_kind(self) -> AuditKind {
        match self {
            Self::Warning => AuditKind::DeadlineWarning,
            Self::Escalation => AuditKind::DeadlineEscalation,
        }
    }
}

/// Counts from one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub warnings: usize,
    pub escalations: usize,
}

/// Periodic deadline watcher
pub struct TimeoutMonitor {
    config: MonitorConfig,
    graph: Arc<TransitionGraph>,
    store: Arc<dyn WorkflowStore>,
    audit: Arc<dyn AuditRecorder>,
    notifications: NotificationService,
    clock: Arc<dyn Clock>,
    /// Highest level raised per instance, for the state entry it was raised in
    signaled: DashMap<Uuid, (DateTime<Utc>, DeadlineLevel)>,
    scan_lock: tokio::sync::Mutex<()>,
}

impl TimeoutMonitor {
    pub fn new(
        config: MonitorConfig,
        graph: Arc<TransitionGraph>,
        store: Arc<dyn WorkflowStore>,
        audit: Arc<dyn AuditRecorder>,
        notifications: NotificationService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            graph,
            store,
            audit,
            notifications,
            clock,
            signaled: DashMap::new(),
            scan_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Instance entered a new state; its deadline starts over
    pub fn on_state_entered(&self, instance: &WorkflowInstance) {
        self.signaled.remove(&instance.id);
    }

    /// Instance reached a terminal state
    pub fn forget(&self, instance_id: Uuid) {
        self.signaled.remove(&instance_id);
    }

    /// Deadline level `instance` has reached at `now`, if any
    pub fn level_at(&self, instance: &WorkflowInstance, now: DateTime<Utc>) -> Option<DeadlineLevel> {
        let config = self.graph.state(instance.state)?;
        let deadline = config.deadline?;
        let fraction = elapsed_fraction(instance, deadline, now);

        if fraction >= config.escalation_threshold {
            Some(DeadlineLevel::Escalation)
        } else if fraction >= config.warning_threshold {
            Some(DeadlineLevel::Warning)
        } else {
            None
        }
    }

    /// Check every active instance once
    #[instrument(skip(self))]
    pub async fn scan(&self) -> Result<ScanReport, StoreError> {
        let _guard = self.scan_lock.lock().await;
        let now = self.clock.now();
        let active = self.store.list_active().await?;
        let mut report = ScanReport {
            scanned: active.len(),
            ..ScanReport::default()
        };

        for instance in &active {
            match self.check(instance, now).await {
                Some(DeadlineLevel::Warning) => report.warnings += 1,
                Some(DeadlineLevel::Escalation) => report.escalations += 1,
                None => {}
            }
        }

        if report.warnings + report.escalations > 0 {
            info!(
                scanned = report.scanned,
                warnings = report.warnings,
                escalations = report.escalations,
                "deadline scan raised signals"
            );
        } else {
            debug!(scanned = report.scanned, "deadline scan complete");
        }
        Ok(report)
    }

    /// Raise the signal for `instance` if it has not been raised for this state entry
    async fn check(&self, instance: &WorkflowInstance, now: DateTime<Utc>) -> Option<DeadlineLevel> {
        let level = self.level_at(instance, now)?;
        let entered_at = instance.state_entered_at;

        let cached = self.signaled.get(&instance.id).map(|entry| *entry);
        let previous = match cached {
            Some((at, previous)) if at == entered_at => Some(previous),
            _ => self.recover_from_audit(instance).await,
        };
        if previous.is_some_and(|previous| previous >= level) {
            self.signaled.insert(instance.id, (entered_at, previous.unwrap_or(level)));
            return None;
        }

        // the scan works from a snapshot; the instance may have moved on since
        let current = match self.store.load(instance.id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(instance_id = %instance.id, "cannot reload instance, skipping signal: {}", e);
                return None;
            }
        };
        if current.is_terminal() || current.state_entered_at != entered_at {
            debug!(instance_id = %instance.id, state = %current.state, "instance left the state before its signal");
            return None;
        }
        self.signaled.insert(instance.id, (entered_at, level));

        self.raise(&current, level, now).await;
        Some(level)
    }

    /// Highest level already audited for the current state entry
    async fn recover_from_audit(&self, instance: &WorkflowInstance) -> Option<DeadlineLevel> {
        let trail = match self.audit.trail(instance.id).await {
            Ok(trail) => trail,
            Err(e) => {
                warn!(instance_id = %instance.id, "cannot read audit trail, assuming no prior signal: {}", e);
                return None;
            }
        };

        trail
            .iter()
            .filter(|entry| entry.timestamp >= instance.state_entered_at)
            .filter(|entry| entry.from_state == Some(instance.state))
            .filter_map(|entry| match entry.kind {
                AuditKind::DeadlineWarning => Some(DeadlineLevel::Warning),
                AuditKind::DeadlineEscalation => Some(DeadlineLevel::Escalation),
                _ => None,
            })
            .max()
    }

    async fn raise(&self, instance: &WorkflowInstance, level: DeadlineLevel, now: DateTime<Utc>) {
        let deadline = self.graph.deadline(instance.state).unwrap_or_default();
        let fraction = elapsed_fraction(instance, deadline, now);

        let entry = NewAuditEntry::new(
            instance.id,
            level.audit_kind(),
            AuditOutcome::Applied,
            Actor::system("timeout-monitor"),
            now,
        )
        .from_state(instance.state)
        .with_version(instance.version)
        .with_reason(format!(
            "{:.0}% of {}s deadline elapsed in {}",
            fraction * 100.0,
            deadline.as_secs(),
            instance.state
        ));
        if let Err(e) = self.audit.append(entry).await {
            error!(instance_id = %instance.id, "failed to audit deadline signal: {}", e);
        }

        match level {
            DeadlineLevel::Warning => {
                warn!(instance_id = %instance.id, state = %instance.state, fraction, "deadline warning");
                self.notifications
                    .notify_supervisor(
                        instance,
                        NotificationEvent::DeadlineWarning {
                            state: instance.state,
                            elapsed_fraction: fraction,
                        },
                    )
                    .await;
            }
            DeadlineLevel::Escalation => {
                warn!(
                    instance_id = %instance.id,
                    state = %instance.state,
                    fraction,
                    action = ?self.config.timeout_action,
                    "deadline escalation"
                );
                if self.config.timeout_action == TimeoutAction::NotifyAndEscalate {
                    self.notifications
                        .notify_supervisor(
                            instance,
                            NotificationEvent::DeadlineEscalation {
                                state: instance.state,
                                elapsed_fraction: fraction,
                            },
                        )
                        .await;
                }
            }
        }
    }

    /// Scan every `scan_interval` until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.config.scan_interval.as_millis() as u64, "timeout monitor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.scan().await {
                error!("deadline scan failed: {}", e);
            }

            let timer = self.clock.after(self.config.scan_interval);
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

        info!("timeout monitor stopped");
    }
}

fn elapsed_fraction(instance: &WorkflowInstance, deadline: Duration, now: DateTime<Utc>) -> f64 {
    if deadline.is_zero() {
        return 0.0;
    }
    instance.time_in_state(now).as_secs_f64() / deadline.as_secs_f64()
}
