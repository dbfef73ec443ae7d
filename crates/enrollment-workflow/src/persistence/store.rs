//! Workflow store trait and error types

use async_trait::async_trait;
use uuid::Uuid;

use crate::instance::WorkflowInstance;

/// Storage errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("workflow instance not found: {0}")]
    NotFound(Uuid),

    /// Instance id, or the application it belongs to, already taken
    #[error("workflow instance already exists: {0}")]
    AlreadyExists(Uuid),

    /// Optimistic concurrency check failed
    #[error("concurrent modification: expected version {expected}, found {actual}")]
    ConcurrentModification { expected: u64, actual: u64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable keyed storage of workflow instances with version stamps
///
/// Mutations are whole-record compare-and-swap: the write only lands if the
/// stored version still equals `expected_version`. Implementations never
/// delete instances.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Insert a new instance; an application owns at most one instance
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    /// Load an instance by id
    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Replace the stored record with `next` if its version is `expected_version`
    ///
    /// `next.version` must be greater than `expected_version`.
    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        next: &WorkflowInstance,
    ) -> Result<(), StoreError>;

    /// All instances not yet in a terminal state
    async fn list_active(&self) -> Result<Vec<WorkflowInstance>, StoreError>;
}
