//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::{StoreError, WorkflowStore};
use crate::instance::WorkflowInstance;

/// In-memory implementation of WorkflowStore
///
/// Provides the same compare-and-swap semantics as the PostgreSQL store; the
/// version check and the write happen under one write lock.
///
/// # Example
///
/// ```
/// use enrollment_workflow::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let taken = instances.contains_key(&instance.id)
            || instances
                .values()
                .any(|existing| existing.application_id == instance.application_id);
        if taken {
            return Err(StoreError::AlreadyExists(instance.id));
        }
        instances.insert(instance.id, instance.clone());
        debug!("created workflow instance");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self, next), fields(next_version = next.version))]
    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        next: &WorkflowInstance,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let current = instances.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if current.version != expected_version {
            return Err(StoreError::ConcurrentModification {
                expected: expected_version,
                actual: current.version,
            });
        }
        if next.version <= expected_version {
            return Err(StoreError::ConcurrentModification {
                expected: expected_version,
                actual: next.version,
            });
        }

        *current = next.clone();
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut active: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|instance| !instance.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|instance| instance.id);
        Ok(active)
    }
}
