//! Fire-and-forget notification queue

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use super::NotificationConfig;
use crate::audit::{Actor, AuditKind, AuditOutcome, AuditRecorder, NewAuditEntry};
use crate::clock::Clock;
use crate::engine::LifecycleTokens;
use crate::instance::WorkflowInstance;
use crate::state::WorkflowState;

/// What a notification is about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    Created {
        state: WorkflowState,
    },
    StateChanged {
        from: WorkflowState,
        to: WorkflowState,
    },
    DeadlineWarning {
        state: WorkflowState,
        elapsed_fraction: f64,
    },
    DeadlineEscalation {
        state: WorkflowState,
        elapsed_fraction: f64,
    },
}

impl NotificationEvent {
    /// The state the notification refers to
    pub fn state(&self) -> WorkflowState {
        match self {
            Self::Created { state }
            | Self::DeadlineWarning { state, .. }
            | Self::DeadlineEscalation { state, .. } => *state,
            Self::StateChanged { to, .. } => *to,
        }
    }
}

/// A queued notification for one recipient, sent on every enabled channel
#[derive(Debug, Clone)]
pub struct Notification {
    pub instance_id: Uuid,
    pub application_id: Uuid,
    pub recipient: String,
    pub event: NotificationEvent,
    pub created_at: DateTime<Utc>,
    /// Cancelled when the instance terminates before delivery completes
    pub cancel: CancellationToken,
}

impl Notification {
    pub fn payload(&self) -> serde_json::Value {
        let state = self.event.state();
        serde_json::json!({
            "instance_id": self.instance_id,
            "application_id": self.application_id,
            "application_status": state.application_status(),
            "notification": self.event,
            "created_at": self.created_at,
        })
    }
}

/// Receiving end of the notification queue, drained by the notification worker
pub struct NotificationQueue {
    rx: mpsc::Receiver<Notification>,
}

impl NotificationQueue {
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Enqueues notifications without waiting for delivery
#[derive(Clone)]
pub struct NotificationService {
    config: Arc<NotificationConfig>,
    tx: mpsc::Sender<Notification>,
    lifecycle: Arc<LifecycleTokens>,
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    pub fn new(
        config: Arc<NotificationConfig>,
        lifecycle: Arc<LifecycleTokens>,
        audit: Arc<dyn AuditRecorder>,
        clock: Arc<dyn Clock>,
    ) -> (Self, NotificationQueue) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        (
            Self {
                config,
                tx,
                lifecycle,
                audit,
                clock,
            },
            NotificationQueue { rx },
        )
    }

    pub fn config(&self) -> &Arc<NotificationConfig> {
        &self.config
    }

    /// Notify the applicant about `instance`
    ///
    /// Terminal instances have their lifecycle cancelled already, so their
    /// final notification gets a token of its own.
    pub async fn notify_applicant(&self, instance: &WorkflowInstance, event: NotificationEvent) {
        let recipient = format!("application:{}", instance.application_id);
        self.enqueue(instance, recipient, event).await;
    }

    /// Notify the supervisor about `instance`
    pub async fn notify_supervisor(&self, instance: &WorkflowInstance, event: NotificationEvent) {
        let recipient = self.config.supervisor_recipient.clone();
        self.enqueue(instance, recipient, event).await;
    }

    async fn enqueue(&self, instance: &WorkflowInstance, recipient: String, event: NotificationEvent) {
        let cancel = if instance.is_terminal() {
            CancellationToken::new()
        } else {
            self.lifecycle.token(instance.id)
        };

        let notification = Notification {
            instance_id: instance.id,
            application_id: instance.application_id,
            recipient,
            event,
            created_at: self.clock.now(),
            cancel,
        };

        let reason = match self.tx.try_send(notification) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(n)) => {
                format!("QueueFull: notification for {} dropped, queue at capacity", n.recipient)
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                format!("QueueClosed: notification for {} dropped, worker stopped", n.recipient)
            }
        };

        warn!(instance_id = %instance.id, %reason, "notification not enqueued");
        let entry = NewAuditEntry::new(
            instance.id,
            AuditKind::NotificationFailed,
            AuditOutcome::Error,
            Actor::system("notification-service"),
            self.clock.now(),
        )
        .to_state(instance.state)
        .with_reason(reason);
        if let Err(e) = self.audit.append(entry).await {
            error!(instance_id = %instance.id, "failed to audit dropped notification: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::clock::ManualClock;

    fn service(capacity: usize) -> (NotificationService, NotificationQueue, Arc<InMemoryAuditLog>) {
        let audit = Arc::new(InMemoryAuditLog::new());
        let config = NotificationConfig {
            queue_capacity: capacity,
            ..NotificationConfig::default()
        };
        let (service, queue) = NotificationService::new(
            Arc::new(config),
            Arc::new(LifecycleTokens::new()),
            audit.clone(),
            Arc::new(ManualClock::default()),
        );
        (service, queue, audit)
    }

    fn instance(state: WorkflowState) -> WorkflowInstance {
        WorkflowInstance::new(Uuid::now_v7(), state, Utc::now())
    }

    #[tokio::test]
    async fn test_applicant_recipient() {
        let (service, mut queue, _) = service(4);
        let instance = instance(WorkflowState::Created);

        service
            .notify_applicant(&instance, NotificationEvent::Created { state: instance.state })
            .await;

        let queued = queue.try_recv().expect("should be queued");
        assert_eq!(queued.recipient, format!("application:{}", instance.application_id));
        assert_eq!(queued.payload()["application_status"], "SUBMITTED");
        assert_eq!(queued.payload()["notification"]["event"], "created");
    }

    #[tokio::test]
    async fn test_supervisor_recipient() {
        let (service, mut queue, _) = service(4);
        let instance = instance(WorkflowState::DocumentVerification);

        service
            .notify_supervisor(
                &instance,
                NotificationEvent::DeadlineEscalation {
                    state: instance.state,
                    elapsed_fraction: 0.9,
                },
            )
            .await;

        let queued = queue.try_recv().expect("should be queued");
        assert_eq!(queued.recipient, "role:enrollment-supervisor");
    }

    #[tokio::test]
    async fn test_full_queue_is_audited() {
        let (service, queue, audit) = service(1);
        let instance = instance(WorkflowState::Created);
        let event = NotificationEvent::Created { state: instance.state };

        service.notify_applicant(&instance, event.clone()).await;
        service.notify_applicant(&instance, event).await;

        assert_eq!(queue.len(), 1);
        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, AuditKind::NotificationFailed);
        assert_eq!(entries[0].outcome, AuditOutcome::Error);
        assert!(entries[0].reason.as_deref().unwrap().starts_with("QueueFull"));
    }
}
