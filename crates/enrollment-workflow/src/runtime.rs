//! Wiring of the engine and its background tasks

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::audit::{AuditArchiver, AuditRecorder, InMemoryAuditLog};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::engine::{EngineParts, LifecycleTokens, TransitionEngine, TransitionError};
use crate::monitor::TimeoutMonitor;
use crate::notification::{
    LogDispatcher, NotificationDispatcher, NotificationQueue, NotificationService, NotificationWorker,
};
use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};
use crate::reliability::BreakerRegistry;
use crate::scheduler::{
    AutoTransitionOutcome, AutoTransitionQueue, AutoTransitionScheduler, AutoTransitionWorker,
};

/// Runtime errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("workflow runtime already started")]
    AlreadyStarted,

    #[error("failed to resume active instances: {0}")]
    Resume(#[from] TransitionError),
}

/// Builder for [`WorkflowRuntime`]
///
/// Anything not supplied falls back to the in-memory store and audit log,
/// the logging dispatcher, the system clock and the default configuration.
#[derive(Default)]
pub struct WorkflowRuntimeBuilder {
    config: Option<EngineConfig>,
    store: Option<Arc<dyn WorkflowStore>>,
    audit: Option<Arc<dyn AuditRecorder>>,
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl WorkflowRuntimeBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditRecorder>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and wire every component
    pub fn build(self) -> Result<WorkflowRuntime, ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let graph = Arc::new(config.graph()?);
        let store: Arc<dyn WorkflowStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryWorkflowStore::new()),
        };
        let audit: Arc<dyn AuditRecorder> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(InMemoryAuditLog::new()),
        };
        let dispatcher: Arc<dyn NotificationDispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(LogDispatcher),
        };
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let lifecycle = Arc::new(LifecycleTokens::new());
        let notification_config = Arc::new(config.notifications.clone());

        let (notifications, notification_queue) = NotificationService::new(
            notification_config.clone(),
            lifecycle.clone(),
            audit.clone(),
            clock.clone(),
        );
        let notification_worker = Arc::new(NotificationWorker::new(
            dispatcher,
            notification_config,
            Arc::new(BreakerRegistry::new(config.circuit_breaker.clone(), clock.clone())),
            audit.clone(),
            clock.clone(),
        ));

        let monitor = Arc::new(TimeoutMonitor::new(
            config.monitor.clone(),
            graph.clone(),
            store.clone(),
            audit.clone(),
            notifications.clone(),
            clock.clone(),
        ));
        let (scheduler, auto_queue) =
            AutoTransitionScheduler::new(graph.clone(), clock.clone(), lifecycle.clone());
        let scheduler = Arc::new(scheduler);

        let engine = Arc::new(TransitionEngine::new(EngineParts {
            graph,
            store: store.clone(),
            audit: audit.clone(),
            notifications,
            monitor: monitor.clone(),
            scheduler: scheduler.clone(),
            lifecycle: lifecycle.clone(),
            clock: clock.clone(),
        }));
        let auto_worker = Arc::new(AutoTransitionWorker::new(
            engine.clone(),
            audit.clone(),
            clock.clone(),
        ));

        Ok(WorkflowRuntime {
            config,
            engine,
            monitor,
            scheduler,
            notification_worker,
            auto_worker,
            notification_queue: Mutex::new(Some(notification_queue)),
            auto_queue: Mutex::new(Some(auto_queue)),
            audit,
            lifecycle,
            clock,
        })
    }
}

/// A wired engine plus its background workers
///
/// Tests drive the workers by hand through the `drain_*` methods; the service
/// calls [`WorkflowRuntime::start`] to run them as tasks instead.
pub struct WorkflowRuntime {
    config: EngineConfig,
    engine: Arc<TransitionEngine>,
    monitor: Arc<TimeoutMonitor>,
    scheduler: Arc<AutoTransitionScheduler>,
    notification_worker: Arc<NotificationWorker>,
    auto_worker: Arc<AutoTransitionWorker>,
    notification_queue: Mutex<Option<NotificationQueue>>,
    auto_queue: Mutex<Option<AutoTransitionQueue>>,
    audit: Arc<dyn AuditRecorder>,
    lifecycle: Arc<LifecycleTokens>,
    clock: Arc<dyn Clock>,
}

impl WorkflowRuntime {
    pub fn builder() -> WorkflowRuntimeBuilder {
        WorkflowRuntimeBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<TransitionEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<TimeoutMonitor> {
        &self.monitor
    }

    pub fn scheduler(&self) -> &Arc<AutoTransitionScheduler> {
        &self.scheduler
    }

    pub fn notification_worker(&self) -> &Arc<NotificationWorker> {
        &self.notification_worker
    }

    /// Deliver every queued notification; zero once the runtime has started
    pub async fn drain_notifications(&self) -> usize {
        match self.notification_queue.lock().await.as_mut() {
            Some(queue) => self.notification_worker.drain(queue).await,
            None => 0,
        }
    }

    /// Process every due auto-transition check; empty once the runtime has started
    pub async fn drain_auto_transitions(&self) -> Vec<AutoTransitionOutcome> {
        match self.auto_queue.lock().await.as_mut() {
            Some(queue) => self.auto_worker.drain(queue).await,
            None => Vec::new(),
        }
    }

    /// Re-arm active instances and spawn the background workers
    pub async fn start(&self) -> Result<RuntimeHandle, RuntimeError> {
        let notification_queue = self.notification_queue.lock().await.take();
        let auto_queue = self.auto_queue.lock().await.take();
        let (Some(notification_queue), Some(auto_queue)) = (notification_queue, auto_queue) else {
            return Err(RuntimeError::AlreadyStarted);
        };

        self.engine.resume().await?;

        let (shutdown, rx) = watch::channel(false);
        let archiver = AuditArchiver::new(self.config.audit.clone(), self.audit.clone(), self.clock.clone());
        let tasks = vec![
            tokio::spawn(self.notification_worker.clone().run(notification_queue, rx.clone())),
            tokio::spawn(self.auto_worker.clone().run(auto_queue, rx.clone())),
            tokio::spawn(self.monitor.clone().run(rx.clone())),
            tokio::spawn(archiver.run(rx)),
        ];

        info!("workflow runtime started");
        Ok(RuntimeHandle {
            shutdown,
            tasks,
            lifecycle: self.lifecycle.clone(),
        })
    }
}

/// Running background tasks; stop them with [`RuntimeHandle::shutdown`]
pub struct RuntimeHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    lifecycle: Arc<LifecycleTokens>,
}

impl RuntimeHandle {
    /// Signal every worker, cancel in-flight retries and wait for the tasks,
    /// including deliveries and checks they spawned, to end
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let active = self.lifecycle.tracked();
        self.lifecycle.cancel_all();
        futures::future::join_all(self.tasks).await;
        info!(active, "workflow runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Actor;
    use crate::clock::ManualClock;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_start_twice_fails() {
        let runtime = WorkflowRuntime::builder()
            .with_clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap();

        let handle = runtime.start().await.unwrap();
        assert!(matches!(runtime.start().await, Err(RuntimeError::AlreadyStarted)));
        assert_eq!(runtime.drain_notifications().await, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_drain_notifications() {
        let runtime = WorkflowRuntime::builder()
            .with_clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap();

        runtime
            .engine()
            .create_instance(Uuid::now_v7(), Actor::user("clerk-1"))
            .await
            .unwrap();
        assert_eq!(runtime.drain_notifications().await, 1);
        assert_eq!(runtime.drain_notifications().await, 0);
    }

    #[test]
    fn test_invalid_config_fails_to_build() {
        let mut config = EngineConfig::default();
        config.monitor.scan_interval = std::time::Duration::ZERO;
        assert!(WorkflowRuntime::builder().with_config(config).build().is_err());
    }
}
