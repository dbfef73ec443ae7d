//! Delayed, fact-gated automatic transitions
//!
//! When an instance enters a state with an auto-transition rule, the scheduler
//! arms a timer for the rule's delay. The timer belongs to the instance's
//! lifecycle and dies with it. When it fires, a check is queued; the
//! [`AutoTransitionWorker`] re-reads the instance, re-evaluates the rule's facts
//! and, if they all hold, asks the transition engine for the move like any
//! other caller would.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{Actor, AuditEntry, AuditKind, AuditOutcome, AuditRecorder, NewAuditEntry};
use crate::clock::{Clock, TimerOutcome};
use crate::engine::{LifecycleTokens, TransitionEngine, TransitionError};
use crate::graph::{AutoTransitionRule, TransitionGraph};
use crate::instance::WorkflowInstance;
use crate::reliability::{retry_call_to_completion, CallError};
use crate::state::WorkflowState;

/// A due auto-transition, queued when its timer fires
#[derive(Debug, Clone)]
pub struct AutoTransitionCheck {
    pub instance_id: Uuid,
    pub source: WorkflowState,
    /// State entry the check was armed for; a newer entry supersedes it
    pub entered_at: DateTime<Utc>,
    pub rule: AutoTransitionRule,
    pub cancel: CancellationToken,
}

/// Receiving end of due checks
pub struct AutoTransitionQueue {
    rx: mpsc::UnboundedReceiver<AutoTransitionCheck>,
}

impl AutoTransitionQueue {
    pub async fn recv(&mut self) -> Option<AutoTransitionCheck> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AutoTransitionCheck> {
        self.rx.try_recv().ok()
    }
}

struct ArmedCheck {
    entered_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Arms and cancels deferred auto-transition checks
pub struct AutoTransitionScheduler {
    graph: Arc<TransitionGraph>,
    clock: Arc<dyn Clock>,
    lifecycle: Arc<LifecycleTokens>,
    tx: mpsc::UnboundedSender<AutoTransitionCheck>,
    armed: Arc<DashMap<Uuid, ArmedCheck>>,
}

impl AutoTransitionScheduler {
    pub fn new(
        graph: Arc<TransitionGraph>,
        clock: Arc<dyn Clock>,
        lifecycle: Arc<LifecycleTokens>,
    ) -> (Self, AutoTransitionQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                graph,
                clock,
                lifecycle,
                tx,
                armed: Arc::new(DashMap::new()),
            },
            AutoTransitionQueue { rx },
        )
    }

    /// Instance entered a new state: drop any previous check and arm the new rule
    pub fn on_state_entered(&self, instance: &WorkflowInstance) {
        self.cancel(instance.id);
        self.arm(instance);
    }

    /// Facts changed: run the rule now if its delay has passed and nothing is armed
    pub fn on_facts_changed(&self, instance: &WorkflowInstance) {
        let armed_for_entry = self
            .armed
            .get(&instance.id)
            .is_some_and(|armed| armed.entered_at == instance.state_entered_at);
        if !armed_for_entry {
            self.arm(instance);
        }
    }

    /// Cancel the pending check for an instance, if any
    pub fn cancel(&self, instance_id: Uuid) {
        if let Some((_, armed)) = self.armed.remove(&instance_id) {
            armed.cancel.cancel();
        }
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    fn arm(&self, instance: &WorkflowInstance) {
        if instance.is_terminal() {
            return;
        }
        let Some(rule) = self.graph.auto_transition(instance.state) else {
            return;
        };

        let remaining = rule
            .delay
            .saturating_sub(instance.time_in_state(self.clock.now()));
        let cancel = self.lifecycle.token(instance.id);
        let timer = self.clock.after(remaining);
        let timer_cancel = timer.cancellation();

        let check = AutoTransitionCheck {
            instance_id: instance.id,
            source: instance.state,
            entered_at: instance.state_entered_at,
            rule: rule.clone(),
            cancel: cancel.clone(),
        };

        self.armed.insert(
            instance.id,
            ArmedCheck {
                entered_at: instance.state_entered_at,
                cancel: cancel.clone(),
            },
        );
        debug!(
            instance_id = %instance.id,
            target = %rule.target,
            delay_ms = remaining.as_millis() as u64,
            "auto-transition armed"
        );

        let armed = Arc::clone(&self.armed);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    timer_cancel.cancel();
                    TimerOutcome::Cancelled
                }
                outcome = timer.wait() => outcome,
            };
            if outcome == TimerOutcome::Cancelled {
                return;
            }

            armed.remove_if(&check.instance_id, |_, current| current.entered_at == check.entered_at);
            if tx.send(check).is_err() {
                debug!("auto-transition queue closed");
            }
        });
    }
}

/// Result of processing one check
#[derive(Debug, Clone, PartialEq)]
pub enum AutoTransitionOutcome {
    /// The transition was applied
    Committed(AuditEntry),
    /// The transition was applied but its audit entry could not be written
    CommittedUnaudited { reason: String },
    /// Required facts did not hold; the check is dropped
    Abandoned { missing: Vec<String> },
    /// The instance moved on, or the engine refused for a reason other than facts
    Superseded,
    /// Retries exhausted; recorded in the audit log
    Failed { attempts: u32, reason: String },
    /// The instance terminated or left the state, or the runtime stopped,
    /// before an attempt could start
    Cancelled,
}

const AUTO_ACTOR: &str = "auto-transition";

/// Executes due checks against the transition engine
pub struct AutoTransitionWorker {
    engine: Arc<TransitionEngine>,
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
}

impl AutoTransitionWorker {
    pub fn new(engine: Arc<TransitionEngine>, audit: Arc<dyn AuditRecorder>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, audit, clock }
    }

    /// Evaluate one due check and request the transition if its facts hold
    #[instrument(skip(self, check), fields(instance_id = %check.instance_id, target = %check.rule.target))]
    pub async fn process(&self, check: &AutoTransitionCheck) -> AutoTransitionOutcome {
        // A request in flight is never torn off, so its commit is always reported
        let result = retry_call_to_completion(
            &check.rule.retry_policy,
            None,
            self.clock.as_ref(),
            &check.cancel,
            |attempt| self.attempt(check, attempt),
        )
        .await;

        match result {
            Ok(AutoTransitionOutcome::CommittedUnaudited { reason }) => {
                error!(%reason, "auto-transition applied but not audited");
                AutoTransitionOutcome::CommittedUnaudited { reason }
            }
            Ok(outcome) => outcome,
            Err(CallError::Rejected(TransitionError::PreconditionNotMet { missing, .. })) => {
                info!(?missing, "auto-transition abandoned, facts no longer hold");
                AutoTransitionOutcome::Abandoned { missing }
            }
            Err(CallError::Rejected(e)) => {
                debug!(error = %e, "auto-transition superseded");
                AutoTransitionOutcome::Superseded
            }
            Err(CallError::Exhausted { attempts, last }) => {
                let reason = format!("{}: gave up after {} attempts: {}", last.code(), attempts, last);
                self.record_failure(check, &reason).await;
                AutoTransitionOutcome::Failed { attempts, reason }
            }
            Err(CallError::CircuitOpen(name)) => {
                let reason = format!("CircuitOpen: {name}");
                self.record_failure(check, &reason).await;
                AutoTransitionOutcome::Failed { attempts: 0, reason }
            }
            Err(CallError::Cancelled) => AutoTransitionOutcome::Cancelled,
        }
    }

    async fn attempt(
        &self,
        check: &AutoTransitionCheck,
        attempt: u32,
    ) -> Result<AutoTransitionOutcome, TransitionError> {
        let instance = self.engine.get_instance(check.instance_id).await?;
        if instance.state != check.source || instance.state_entered_at != check.entered_at {
            return Ok(AutoTransitionOutcome::Superseded);
        }

        let missing = instance.missing_facts(&check.rule.required_facts);
        if !missing.is_empty() {
            return Ok(AutoTransitionOutcome::Abandoned { missing });
        }

        debug!(attempt, version = instance.version, "requesting auto-transition");
        let result = self
            .engine
            .request_transition(
                check.instance_id,
                check.rule.target,
                Some(instance.version),
                Actor::system(AUTO_ACTOR),
            )
            .await;

        match result {
            Ok(entry) => Ok(AutoTransitionOutcome::Committed(entry)),
            // the commit stands; only its audit entry is missing
            Err(TransitionError::AuditUnavailable(e)) => Ok(AutoTransitionOutcome::CommittedUnaudited {
                reason: format!("AuditUnavailable: {e}"),
            }),
            Err(e) => Err(e),
        }
    }

    async fn record_failure(&self, check: &AutoTransitionCheck, reason: &str) {
        error!(instance_id = %check.instance_id, %reason, "auto-transition failed");
        let entry = NewAuditEntry::new(
            check.instance_id,
            AuditKind::AutoTransitionFailed,
            AuditOutcome::Error,
            Actor::system(AUTO_ACTOR),
            self.clock.now(),
        )
        .from_state(check.source)
        .to_state(check.rule.target)
        .with_reason(reason);
        if let Err(e) = self.audit.append(entry).await {
            error!(instance_id = %check.instance_id, "failed to audit auto-transition failure: {}", e);
        }
    }

    /// Process every check already queued, one at a time
    pub async fn drain(&self, queue: &mut AutoTransitionQueue) -> Vec<AutoTransitionOutcome> {
        let mut outcomes = Vec::new();
        while let Some(check) = queue.try_recv() {
            outcomes.push(self.process(&check).await);
        }
        outcomes
    }

    /// Consume checks until shutdown; each check runs in its own task
    ///
    /// On shutdown the worker waits for checks in flight. Their lifecycle
    /// tokens are cancelled by then, so a pending backoff ends at once.
    pub async fn run(self: Arc<Self>, mut queue: AutoTransitionQueue, mut shutdown: watch::Receiver<bool>) {
        info!("auto-transition worker started");
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let check = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
                next = queue.recv() => match next {
                    Some(check) => check,
                    None => break,
                },
            };

            let worker = Arc::clone(&self);
            in_flight.spawn(async move {
                let outcome = worker.process(&check).await;
                if let AutoTransitionOutcome::Failed { .. } = outcome {
                    warn!(instance_id = %check.instance_id, "auto-transition needs operator attention");
                }
            });
        }

        let pending = in_flight.len();
        while in_flight.join_next().await.is_some() {}
        info!(pending, "auto-transition worker stopped");
    }
}
