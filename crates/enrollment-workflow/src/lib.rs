// Enrollment Workflow Engine
//
// This crate drives an enrollment application through its review stages.
//
// Key design decisions:
// - The state graph is fixed at deployment time (EngineConfig, TOML) and immutable at runtime
// - TransitionEngine is the single write path; the monitor and scheduler only call into it
// - No engine-side locks: optimistic concurrency via WorkflowStore::compare_and_swap
// - Every attempt is audited, applied or not; the audit trail replays to (state, version)
// - Notifications are fire-and-forget, with retry and per-channel circuit breakers
// - Background work per instance hangs off a cancellation token that dies with the instance
// - All time flows through Clock so tests can run on a ManualClock

pub mod audit;
pub mod clock;
pub mod config;
pub mod engine;
pub mod graph;
pub mod instance;
pub mod monitor;
pub mod notification;
pub mod persistence;
pub mod reliability;
pub mod runtime;
pub mod scheduler;
pub mod serde_duration;
pub mod state;

// Re-exports for convenience
pub use audit::{Actor, AuditEntry, AuditKind, AuditOutcome, AuditRecorder, InMemoryAuditLog, PostgresAuditLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use engine::{InstanceStatus, TransitionEngine, TransitionError};
pub use graph::{AutoTransitionRule, StateConfig, TransitionGraph};
pub use instance::{FactValue, WorkflowInstance};
pub use monitor::{MonitorConfig, TimeoutAction, TimeoutMonitor};
pub use notification::{Channel, DispatchError, LogDispatcher, NotificationDispatcher};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use reliability::{retry_call, retry_call_to_completion, CallError, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy, Retryable};
pub use runtime::{RuntimeError, RuntimeHandle, WorkflowRuntime, WorkflowRuntimeBuilder};
pub use scheduler::AutoTransitionOutcome;
pub use state::{ApplicationStatus, WorkflowState};
