//! Notification worker: drains the queue with bounded concurrency

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::{DispatchError, MessageId, NotificationDispatcher};
use super::service::{Notification, NotificationQueue};
use super::{Channel, NotificationConfig};
use crate::audit::{Actor, AuditKind, AuditOutcome, AuditRecorder, NewAuditEntry};
use crate::clock::Clock;
use crate::reliability::{retry_call, BreakerRegistry, CallError};

/// Outcome of one notification on one channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDelivery {
    pub channel: Channel,
    pub result: Result<MessageId, DispatchError>,
}

/// Sends queued notifications through retry and per-channel breakers
pub struct NotificationWorker {
    dispatcher: Arc<dyn NotificationDispatcher>,
    config: Arc<NotificationConfig>,
    breakers: Arc<BreakerRegistry>,
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
}

impl NotificationWorker {
    pub fn new(
        dispatcher: Arc<dyn NotificationDispatcher>,
        config: Arc<NotificationConfig>,
        breakers: Arc<BreakerRegistry>,
        audit: Arc<dyn AuditRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_dispatches.max(1)));
        Self {
            dispatcher,
            config,
            breakers,
            audit,
            clock,
            permits,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Deliver on every enabled channel; failed channels are audited
    #[instrument(skip(self, notification), fields(instance_id = %notification.instance_id, recipient = %notification.recipient))]
    pub async fn deliver(&self, notification: &Notification) -> Vec<ChannelDelivery> {
        let deliveries = self
            .config
            .enabled_channels()
            .map(|(channel, _)| self.deliver_on(channel, notification));
        let deliveries = futures::future::join_all(deliveries).await;

        for delivery in &deliveries {
            match &delivery.result {
                Ok(message_id) => {
                    debug!(channel = %delivery.channel, %message_id, "notification delivered");
                }
                Err(DispatchError::Cancelled) => {
                    debug!(channel = %delivery.channel, "notification cancelled, instance terminated");
                }
                Err(e) => {
                    warn!(channel = %delivery.channel, error = %e, "notification failed");
                    self.record_failure(notification, delivery.channel, e).await;
                }
            }
        }

        deliveries
    }

    async fn deliver_on(&self, channel: Channel, notification: &Notification) -> ChannelDelivery {
        let channel_config = self.config.channel(channel);
        let breaker = self.breakers.get(channel.as_str());
        let payload = notification.payload();

        let result = retry_call(
            &channel_config.retry_policy,
            Some(breaker.as_ref()),
            self.clock.as_ref(),
            &notification.cancel,
            |_attempt| {
                self.dispatcher.send(
                    channel,
                    &notification.recipient,
                    &channel_config.template,
                    &payload,
                )
            },
        )
        .await;

        let result = match result {
            Ok(message_id) => Ok(message_id),
            Err(CallError::CircuitOpen(_)) => Err(DispatchError::CircuitOpen(channel)),
            Err(CallError::Exhausted { last, .. }) => Err(last),
            Err(CallError::Rejected(e)) => Err(e),
            Err(CallError::Cancelled) => Err(DispatchError::Cancelled),
        };

        ChannelDelivery { channel, result }
    }

    async fn record_failure(&self, notification: &Notification, channel: Channel, error: &DispatchError) {
        let entry = NewAuditEntry::new(
            notification.instance_id,
            AuditKind::NotificationFailed,
            AuditOutcome::Error,
            Actor::system("notification-worker"),
            self.clock.now(),
        )
        .to_state(notification.event.state())
        .with_reason(format!(
            "{}: {} to {}: {}",
            error.code(),
            channel,
            notification.recipient,
            error
        ));

        if let Err(e) = self.audit.append(entry).await {
            error!(instance_id = %notification.instance_id, "failed to audit notification failure: {}", e);
        }
    }

    /// Deliver everything currently queued, one notification at a time
    pub async fn drain(&self, queue: &mut NotificationQueue) -> usize {
        let mut delivered = 0;
        while let Some(notification) = queue.try_recv() {
            self.deliver(&notification).await;
            delivered += 1;
        }
        delivered
    }

    /// Consume the queue until shutdown, running up to
    /// `max_concurrent_dispatches` deliveries at once
    ///
    /// Deliveries in flight at shutdown run to completion or cancellation.
    pub async fn run(self: Arc<Self>, mut queue: NotificationQueue, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent = self.config.max_concurrent_dispatches,
            "notification worker started"
        );
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let notification = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
                next = queue.recv() => match next {
                    Some(notification) => notification,
                    None => break,
                },
            };

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let worker = Arc::clone(&self);
            in_flight.spawn(async move {
                worker.deliver(&notification).await;
                drop(permit);
            });
        }

        let pending = in_flight.len();
        while in_flight.join_next().await.is_some() {}
        info!(pending, "notification worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::clock::ManualClock;
    use crate::engine::LifecycleTokens;
    use crate::instance::WorkflowInstance;
    use crate::notification::{NotificationEvent, NotificationService};
    use crate::reliability::{CircuitBreakerConfig, CircuitState, RetryPolicy};
    use crate::state::WorkflowState;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct ScriptedDispatcher {
        calls: AtomicU32,
        error: Option<DispatchError>,
    }

    #[async_trait]
    impl NotificationDispatcher for ScriptedDispatcher {
        async fn send(
            &self,
            _channel: Channel,
            _recipient: &str,
            _template: &str,
            _payload: &serde_json::Value,
        ) -> Result<MessageId, DispatchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(MessageId(format!("msg-{n}"))),
            }
        }
    }

    struct Harness {
        worker: NotificationWorker,
        service: NotificationService,
        queue: NotificationQueue,
        audit: Arc<InMemoryAuditLog>,
        dispatcher: Arc<ScriptedDispatcher>,
        lifecycle: Arc<LifecycleTokens>,
    }

    fn harness(error: Option<DispatchError>, attempts: u32) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(InMemoryAuditLog::new());
        let lifecycle = Arc::new(LifecycleTokens::new());
        let dispatcher = Arc::new(ScriptedDispatcher {
            calls: AtomicU32::new(0),
            error,
        });

        let policy = RetryPolicy::exponential()
            .with_max_attempts(attempts)
            .with_initial_backoff(Duration::ZERO)
            .with_max_backoff(Duration::ZERO);
        let mut config = NotificationConfig::default();
        config.email = config.email.clone().with_retry_policy(policy);
        config.sms = config.sms.clone().disabled();
        config.in_app = config.in_app.clone().disabled();
        let config = Arc::new(config);

        let (service, queue) =
            NotificationService::new(config.clone(), lifecycle.clone(), audit.clone(), clock.clone());
        let worker = NotificationWorker::new(
            dispatcher.clone(),
            config,
            Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default(), clock.clone())),
            audit.clone(),
            clock,
        );

        Harness {
            worker,
            service,
            queue,
            audit,
            dispatcher,
            lifecycle,
        }
    }

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(Uuid::now_v7(), WorkflowState::Created, Utc::now())
    }

    #[tokio::test]
    async fn test_delivers_on_enabled_channels() {
        let mut h = harness(None, 3);
        let instance = instance();
        h.service
            .notify_applicant(&instance, NotificationEvent::Created { state: instance.state })
            .await;

        assert_eq!(h.worker.drain(&mut h.queue).await, 1);
        assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);
        assert!(h.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_dispatch_is_audited_without_retry() {
        let mut h = harness(Some(DispatchError::Rejected("invalid recipient".into())), 3);
        let instance = instance();
        h.service
            .notify_applicant(&instance, NotificationEvent::Created { state: instance.state })
            .await;

        let notification = h.queue.try_recv().unwrap();
        let deliveries = h.worker.deliver(&notification).await;

        assert!(matches!(deliveries[0].result, Err(DispatchError::Rejected(_))));
        assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, AuditKind::NotificationFailed);
        assert!(entries[0]
            .reason
            .as_deref()
            .unwrap()
            .starts_with("DispatchRejected: email"));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        let mut h = harness(Some(DispatchError::Failed("timeout".into())), 3);
        let instance = instance();
        let event = NotificationEvent::Created { state: instance.state };
        h.service.notify_applicant(&instance, event.clone()).await;
        h.service.notify_applicant(&instance, event).await;

        let first = h.queue.try_recv().unwrap();
        let deliveries = h.worker.deliver(&first).await;
        assert!(matches!(deliveries[0].result, Err(DispatchError::Failed(_))));
        assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.worker.breakers().get("email").state(), CircuitState::Open);

        let second = h.queue.try_recv().unwrap();
        let deliveries = h.worker.deliver(&second).await;
        assert_eq!(deliveries[0].result, Err(DispatchError::CircuitOpen(Channel::Email)));
        assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 3);

        let reasons: Vec<_> = h
            .audit
            .entries()
            .into_iter()
            .filter_map(|entry| entry.reason)
            .collect();
        assert_eq!(reasons.len(), 2);
        assert!(reasons[1].starts_with("CircuitOpen"));
    }

    #[tokio::test]
    async fn test_terminated_instance_cancels_delivery() {
        let mut h = harness(None, 3);
        let instance = instance();
        h.service
            .notify_applicant(&instance, NotificationEvent::Created { state: instance.state })
            .await;
        h.lifecycle.terminate(instance.id);

        let notification = h.queue.try_recv().unwrap();
        let deliveries = h.worker.deliver(&notification).await;

        assert_eq!(deliveries[0].result, Err(DispatchError::Cancelled));
        assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 0);
        assert!(h.audit.entries().is_empty());
    }
}
