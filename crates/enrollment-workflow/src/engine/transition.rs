//! Transition engine: the single write path for workflow instances

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::lifecycle::LifecycleTokens;
use crate::audit::{
    Actor, AuditEntry, AuditError, AuditKind, AuditOutcome, AuditRecorder, NewAuditEntry,
};
use crate::clock::Clock;
use crate::graph::TransitionGraph;
use crate::instance::{FactValue, WorkflowInstance};
use crate::monitor::TimeoutMonitor;
use crate::notification::{NotificationEvent, NotificationService};
use crate::persistence::{StoreError, WorkflowStore};
use crate::reliability::Retryable;
use crate::scheduler::AutoTransitionScheduler;
use crate::state::{ApplicationStatus, WorkflowState};

/// Transition engine errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("workflow instance not found: {0}")]
    NotFound(Uuid),

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("cannot enter {state}: missing facts {}", missing.join(", "))]
    PreconditionNotMet {
        state: WorkflowState,
        missing: Vec<String>,
    },

    /// The caller must re-read the instance and decide whether to retry
    #[error("concurrent modification: expected version {expected}, found {actual}")]
    ConcurrentModification { expected: u64, actual: u64 },

    #[error("instance is in terminal state {0}")]
    TerminalState(WorkflowState),

    #[error("application already has a workflow instance: {0}")]
    AlreadyExists(Uuid),

    #[error(transparent)]
    Store(StoreError),

    /// The store write landed but could not be audited
    #[error(transparent)]
    AuditUnavailable(AuditError),
}

impl TransitionError {
    /// Stable taxonomy name, used in audit reasons
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::PreconditionNotMet { .. } => "PreconditionNotMet",
            Self::ConcurrentModification { .. } => "ConcurrentModification",
            Self::TerminalState(_) => "TerminalState",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::Store(_) => "StoreUnavailable",
            Self::AuditUnavailable(_) => "AuditUnavailable",
        }
    }

    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            Self::Store(_) | Self::AuditUnavailable(_) => AuditOutcome::Error,
            _ => AuditOutcome::Rejected,
        }
    }
}

impl From<StoreError> for TransitionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::AlreadyExists(id) => Self::AlreadyExists(id),
            StoreError::ConcurrentModification { expected, actual } => {
                Self::ConcurrentModification { expected, actual }
            }
            other => Self::Store(other),
        }
    }
}

impl Retryable for TransitionError {
    fn is_retryable(&self) -> bool {
        // AuditUnavailable follows a landed commit; repeating the request cannot help
        matches!(self, Self::ConcurrentModification { .. } | Self::Store(_))
    }
}

/// Point-in-time view of one instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub instance_id: Uuid,
    pub application_id: Uuid,
    pub state: WorkflowState,
    pub application_status: ApplicationStatus,
    pub version: u64,
    pub state_entered_at: DateTime<Utc>,
    /// Time left before the current state's deadline; `None` without a deadline
    pub deadline_remaining: Option<Duration>,
    pub facts: BTreeMap<String, FactValue>,
}

/// Collaborators the engine is wired with
pub struct EngineParts {
    pub graph: Arc<TransitionGraph>,
    pub store: Arc<dyn WorkflowStore>,
    pub audit: Arc<dyn AuditRecorder>,
    pub notifications: NotificationService,
    pub monitor: Arc<TimeoutMonitor>,
    pub scheduler: Arc<AutoTransitionScheduler>,
    pub lifecycle: Arc<LifecycleTokens>,
    pub clock: Arc<dyn Clock>,
}

/// Validates and applies transitions and fact changes
///
/// The engine holds no per-instance lock. Every mutation is a compare-and-swap
/// against the store; a lost race surfaces as
/// [`TransitionError::ConcurrentModification`] and the caller decides whether
/// to re-read and retry. Every attempt, successful or not, is audited.
pub struct TransitionEngine {
    graph: Arc<TransitionGraph>,
    store: Arc<dyn WorkflowStore>,
    audit: Arc<dyn AuditRecorder>,
    notifications: NotificationService,
    monitor: Arc<TimeoutMonitor>,
    scheduler: Arc<AutoTransitionScheduler>,
    lifecycle: Arc<LifecycleTokens>,
    clock: Arc<dyn Clock>,
}

impl TransitionEngine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            graph: parts.graph,
            store: parts.store,
            audit: parts.audit,
            notifications: parts.notifications,
            monitor: parts.monitor,
            scheduler: parts.scheduler,
            lifecycle: parts.lifecycle,
            clock: parts.clock,
        }
    }

    pub fn graph(&self) -> &Arc<TransitionGraph> {
        &self.graph
    }

    /// Start a workflow for a newly submitted application
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn create_instance(
        &self,
        application_id: Uuid,
        actor: Actor,
    ) -> Result<WorkflowInstance, TransitionError> {
        let instance = WorkflowInstance::new(application_id, self.graph.initial(), self.clock.now());

        if let Err(e) = self.store.create(&instance).await {
            let error = TransitionError::from(e);
            let entry = self
                .entry(instance.id, AuditKind::Created, error.audit_outcome(), actor)
                .to_state(instance.state)
                .with_reason(format!("{}: {}", error.code(), error));
            return Err(self.reject(entry, error).await);
        }

        let entry = self
            .entry(instance.id, AuditKind::Created, AuditOutcome::Applied, actor)
            .to_state(instance.state)
            .with_version(instance.version);
        let audited = self.audit.append(entry).await;

        info!(instance_id = %instance.id, %application_id, state = %instance.state, "workflow instance created");
        self.monitor.on_state_entered(&instance);
        self.scheduler.on_state_entered(&instance);
        self.notifications
            .notify_applicant(&instance, NotificationEvent::Created { state: instance.state })
            .await;

        match audited {
            Ok(_) => Ok(instance),
            Err(e) => {
                error!(instance_id = %instance.id, "instance created but not audited: {}", e);
                Err(TransitionError::AuditUnavailable(e))
            }
        }
    }

    /// Move `instance_id` to `target`
    ///
    /// With `expected_version` set, a stale version fails fast; without it the
    /// loaded version is used, and the store still rejects a concurrent writer.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn request_transition(
        &self,
        instance_id: Uuid,
        target: WorkflowState,
        expected_version: Option<u64>,
        actor: Actor,
    ) -> Result<AuditEntry, TransitionError> {
        let entry = self
            .entry(instance_id, AuditKind::Transition, AuditOutcome::Rejected, actor.clone())
            .to_state(target);

        let instance = match self.store.load(instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                let error = TransitionError::from(e);
                return Err(self.reject_with(entry, error).await);
            }
        };
        let entry = entry.from_state(instance.state).with_version(instance.version);

        if let Err(error) = self.validate_transition(&instance, target, expected_version) {
            return Err(self.reject_with(entry, error).await);
        }

        let next = instance.transitioned(target, self.clock.now());
        if let Err(e) = self
            .store
            .compare_and_swap(instance_id, instance.version, &next)
            .await
        {
            let error = TransitionError::from(e);
            return Err(self.reject_with(entry, error).await);
        }

        info!(
            %instance_id,
            from = %instance.state,
            to = %target,
            version = next.version,
            "transition applied"
        );

        let applied = self
            .entry(instance_id, AuditKind::Transition, AuditOutcome::Applied, actor)
            .from_state(instance.state)
            .to_state(target)
            .with_version(next.version);
        let audited = self.audit.append(applied).await;

        self.after_commit(instance.state, &next).await;

        audited.map_err(|e| {
            error!(%instance_id, "transition applied but not audited: {}", e);
            TransitionError::AuditUnavailable(e)
        })
    }

    fn validate_transition(
        &self,
        instance: &WorkflowInstance,
        target: WorkflowState,
        expected_version: Option<u64>,
    ) -> Result<(), TransitionError> {
        if let Some(expected) = expected_version {
            if expected != instance.version {
                return Err(TransitionError::ConcurrentModification {
                    expected,
                    actual: instance.version,
                });
            }
        }

        if !self.graph.allows(instance.state, target) {
            return Err(TransitionError::InvalidTransition {
                from: instance.state,
                to: target,
            });
        }

        let missing = instance.missing_facts(self.graph.required_facts(target));
        if !missing.is_empty() {
            return Err(TransitionError::PreconditionNotMet {
                state: target,
                missing,
            });
        }

        Ok(())
    }

    async fn after_commit(&self, from: WorkflowState, instance: &WorkflowInstance) {
        if instance.is_terminal() {
            self.lifecycle.terminate(instance.id);
            self.scheduler.cancel(instance.id);
            self.monitor.forget(instance.id);
        } else {
            self.monitor.on_state_entered(instance);
            self.scheduler.on_state_entered(instance);
        }

        self.notifications
            .notify_applicant(
                instance,
                NotificationEvent::StateChanged {
                    from,
                    to: instance.state,
                },
            )
            .await;
    }

    /// Set a gating fact on `instance_id`
    #[instrument(skip(self, value, actor), fields(actor = %actor))]
    pub async fn record_fact(
        &self,
        instance_id: Uuid,
        fact: &str,
        value: FactValue,
        expected_version: Option<u64>,
        actor: Actor,
    ) -> Result<AuditEntry, TransitionError> {
        let reason = format!("{fact}={value}");
        let entry = self
            .entry(instance_id, AuditKind::FactRecorded, AuditOutcome::Rejected, actor.clone());

        let instance = match self.store.load(instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                let error = TransitionError::from(e);
                return Err(self.reject_with(entry, error).await);
            }
        };
        let entry = entry
            .from_state(instance.state)
            .to_state(instance.state)
            .with_version(instance.version);

        if instance.is_terminal() {
            let error = TransitionError::TerminalState(instance.state);
            return Err(self.reject_with(entry, error).await);
        }
        if let Some(expected) = expected_version.filter(|v| *v != instance.version) {
            let error = TransitionError::ConcurrentModification {
                expected,
                actual: instance.version,
            };
            return Err(self.reject_with(entry, error).await);
        }

        let next = instance.with_fact(fact, value, self.clock.now());
        if let Err(e) = self
            .store
            .compare_and_swap(instance_id, instance.version, &next)
            .await
        {
            let error = TransitionError::from(e);
            return Err(self.reject_with(entry, error).await);
        }

        debug!(%instance_id, %reason, version = next.version, "fact recorded");

        let applied = self
            .entry(instance_id, AuditKind::FactRecorded, AuditOutcome::Applied, actor)
            .from_state(next.state)
            .to_state(next.state)
            .with_version(next.version)
            .with_reason(reason);
        let audited = self.audit.append(applied).await;

        self.scheduler.on_facts_changed(&next);

        audited.map_err(|e| {
            error!(%instance_id, "fact recorded but not audited: {}", e);
            TransitionError::AuditUnavailable(e)
        })
    }

    /// Current state, version and remaining deadline of an instance
    #[instrument(skip(self))]
    pub async fn get_status(&self, instance_id: Uuid) -> Result<InstanceStatus, TransitionError> {
        let instance = self.get_instance(instance_id).await?;
        let deadline_remaining = if instance.is_terminal() {
            None
        } else {
            self.graph
                .deadline(instance.state)
                .map(|deadline| deadline.saturating_sub(instance.time_in_state(self.clock.now())))
        };

        Ok(InstanceStatus {
            instance_id: instance.id,
            application_id: instance.application_id,
            state: instance.state,
            application_status: instance.state.application_status(),
            version: instance.version,
            state_entered_at: instance.state_entered_at,
            deadline_remaining,
            facts: instance.facts,
        })
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, TransitionError> {
        Ok(self.store.load(instance_id).await?)
    }

    /// Every audit entry for `instance_id`, in sequence order
    pub async fn get_audit_trail(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, TransitionError> {
        self.audit
            .trail(instance_id)
            .await
            .map_err(TransitionError::AuditUnavailable)
    }

    /// Audit history of `instance_id` as it stood at `at`
    pub async fn get_audit_trail_as_of(
        &self,
        instance_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>, TransitionError> {
        self.audit
            .trail_as_of(instance_id, at)
            .await
            .map_err(TransitionError::AuditUnavailable)
    }

    /// Re-arm auto-transition checks for every active instance after a restart
    ///
    /// Deadline signals need no re-arming; the monitor recovers them from the audit log.
    pub async fn resume(&self) -> Result<usize, TransitionError> {
        let active = self.store.list_active().await?;
        for instance in &active {
            self.scheduler.on_state_entered(instance);
        }
        info!(active = active.len(), "resumed active workflow instances");
        Ok(active.len())
    }

    fn entry(&self, instance_id: Uuid, kind: AuditKind, outcome: AuditOutcome, actor: Actor) -> NewAuditEntry {
        NewAuditEntry::new(instance_id, kind, outcome, actor, self.clock.now())
    }

    /// Audit a refused attempt with the error's code as reason
    async fn reject_with(&self, entry: NewAuditEntry, error: TransitionError) -> TransitionError {
        let mut entry = entry.with_reason(format!("{}: {}", error.code(), error));
        entry.outcome = error.audit_outcome();
        self.reject(entry, error).await
    }

    async fn reject(&self, entry: NewAuditEntry, error: TransitionError) -> TransitionError {
        warn!(instance_id = %entry.instance_id, code = error.code(), "{}", error);
        if let Err(e) = self.audit.append(entry).await {
            error!("failed to audit rejected attempt: {}", e);
        }
        error
    }
}
