//! PostgreSQL implementation of WorkflowStore

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{StoreError, WorkflowStore};
use crate::instance::{FactValue, WorkflowInstance};
use crate::state::WorkflowState;

/// PostgreSQL-backed workflow store
///
/// The compare-and-swap is a single conditional `UPDATE ... WHERE version = $n`;
/// zero affected rows means either the instance is missing or another writer
/// got there first, and a follow-up read tells the two apart.
///
/// # Example
///
/// ```ignore
/// use enrollment_workflow::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/enrollment").await?;
/// PostgresWorkflowStore::migrate(&pool).await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Serialization(format!("version {value} out of range")))
}

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let state: String = row.get("state");
    let version: i64 = row.get("version");
    let facts: serde_json::Value = row.get("facts");

    Ok(WorkflowInstance {
        id: row.get("id"),
        application_id: row.get("application_id"),
        state: state
            .parse::<WorkflowState>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        version: u64::try_from(version)
            .map_err(|_| StoreError::Serialization(format!("negative version {version}")))?,
        state_entered_at: row.get("state_entered_at"),
        facts: serde_json::from_value::<BTreeMap<String, FactValue>>(facts)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn facts_json(instance: &WorkflowInstance) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(&instance.facts).map_err(|e| StoreError::Serialization(e.to_string()))
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, application_id, state, version, state_entered_at, facts, created_at, updated_at
    FROM workflow_instances
"#;

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, application_id, state, version, state_entered_at, facts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(instance.id)
        .bind(instance.application_id)
        .bind(instance.state.as_str())
        .bind(to_i64(instance.version)?)
        .bind(instance.state_entered_at)
        .bind(facts_json(instance)?)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(instance.id));
        }

        debug!(application_id = %instance.application_id, "created workflow instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load workflow instance: {}", e);
                StoreError::Database(e.to_string())
            })?
            .ok_or(StoreError::NotFound(id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self, next), fields(next_version = next.version))]
    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        next: &WorkflowInstance,
    ) -> Result<(), StoreError> {
        if next.version <= expected_version {
            return Err(StoreError::ConcurrentModification {
                expected: expected_version,
                actual: next.version,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = $3,
                version = $4,
                state_entered_at = $5,
                facts = $6,
                updated_at = $7
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(to_i64(expected_version)?)
        .bind(next.state.as_str())
        .bind(to_i64(next.version)?)
        .bind(next.state_entered_at)
        .bind(facts_json(next)?)
        .bind(next.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update workflow instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current = self.load(id).await?;
        Err(StoreError::ConcurrentModification {
            expected: expected_version,
            actual: current.version,
        })
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE state NOT IN ('REJECTED', 'COMPLETED') ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list active workflow instances: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(instance_from_row).collect()
    }
}
