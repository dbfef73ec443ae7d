//! PostgreSQL implementation of AuditRecorder

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{Actor, AuditEntry, AuditError, AuditKind, AuditOutcome, AuditRecorder, NewAuditEntry};
use crate::state::WorkflowState;

/// Audit log stored in `workflow_audit_entries`, archived to `workflow_audit_archive`
///
/// Sequence numbers come from a `BIGSERIAL`; the schema ships with
/// [`PostgresWorkflowStore::migrate`](crate::PostgresWorkflowStore::migrate).
pub struct PostgresAuditLog {
    pool: PgPool,
}

impl PostgresAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: sqlx::Error) -> AuditError {
    error!("Audit log query failed: {}", e);
    AuditError::Unavailable(e.to_string())
}

fn parse_state(value: Option<String>) -> Result<Option<WorkflowState>, AuditError> {
    value
        .map(|s| s.parse::<WorkflowState>())
        .transpose()
        .map_err(|e| AuditError::Serialization(e.to_string()))
}

fn entry_from_row(row: &PgRow) -> Result<AuditEntry, AuditError> {
    let sequence: i64 = row.get("sequence");
    let kind: String = row.get("kind");
    let outcome: String = row.get("outcome");
    let actor: serde_json::Value = row.get("actor");
    let version: Option<i64> = row.get("version");

    Ok(AuditEntry {
        sequence: u64::try_from(sequence)
            .map_err(|_| AuditError::Serialization(format!("negative sequence {sequence}")))?,
        instance_id: row.get("instance_id"),
        kind: kind.parse::<AuditKind>().map_err(AuditError::Serialization)?,
        from_state: parse_state(row.get("from_state"))?,
        to_state: parse_state(row.get("to_state"))?,
        actor: serde_json::from_value::<Actor>(actor)
            .map_err(|e| AuditError::Serialization(e.to_string()))?,
        timestamp: row.get("recorded_at"),
        outcome: outcome
            .parse::<AuditOutcome>()
            .map_err(AuditError::Serialization)?,
        reason: row.get("reason"),
        version: version.and_then(|v| u64::try_from(v).ok()),
    })
}

#[async_trait]
impl AuditRecorder for PostgresAuditLog {
    #[instrument(skip(self, entry), fields(instance_id = %entry.instance_id, kind = %entry.kind))]
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let actor =
            serde_json::to_value(&entry.actor).map_err(|e| AuditError::Serialization(e.to_string()))?;
        let version = entry
            .version
            .map(i64::try_from)
            .transpose()
            .map_err(|e| AuditError::Serialization(e.to_string()))?;

        // Timestamps never run backwards relative to the newest entry
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_audit_entries
                (instance_id, kind, from_state, to_state, actor, recorded_at, outcome, reason, version)
            VALUES (
                $1, $2, $3, $4, $5,
                GREATEST($6, COALESCE((SELECT MAX(recorded_at) FROM workflow_audit_entries), $6)),
                $7, $8, $9
            )
            RETURNING sequence, instance_id, kind, from_state, to_state, actor, recorded_at, outcome, reason, version
            "#,
        )
        .bind(entry.instance_id)
        .bind(entry.kind.as_str())
        .bind(entry.from_state.map(WorkflowState::as_str))
        .bind(entry.to_state.map(WorkflowState::as_str))
        .bind(&actor)
        .bind(entry.timestamp)
        .bind(entry.outcome.as_str())
        .bind(entry.reason.as_deref())
        .bind(version)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        let appended = entry_from_row(&row)?;
        debug!(sequence = appended.sequence, "audit entry appended");
        Ok(appended)
    }

    #[instrument(skip(self))]
    async fn trail(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, AuditError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, instance_id, kind, from_state, to_state, actor, recorded_at, outcome, reason, version
            FROM workflow_audit_archive WHERE instance_id = $1
            UNION ALL
            SELECT sequence, instance_id, kind, from_state, to_state, actor, recorded_at, outcome, reason, version
            FROM workflow_audit_entries WHERE instance_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM workflow_audit_entries
                WHERE recorded_at < $1
                RETURNING sequence, instance_id, kind, from_state, to_state, actor, recorded_at, outcome, reason, version
            )
            INSERT INTO workflow_audit_archive
                (sequence, instance_id, kind, from_state, to_state, actor, recorded_at, outcome, reason, version)
            SELECT sequence, instance_id, kind, from_state, to_state, actor, recorded_at, outcome, reason, version
            FROM moved
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        let moved = result.rows_affected() as usize;
        debug!(moved, %cutoff, "audit archive sweep");
        Ok(moved)
    }
}
