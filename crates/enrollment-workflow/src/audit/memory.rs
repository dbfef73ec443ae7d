//! In-memory audit log

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{AuditEntry, AuditError, AuditRecorder, NewAuditEntry};

#[derive(Default)]
struct LogState {
    next_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    active: Vec<AuditEntry>,
    archive: Vec<AuditEntry>,
}

/// In-memory implementation of AuditRecorder
///
/// Sequence numbers and timestamps are assigned under one lock, so both are
/// monotonic: a timestamp earlier than the previous entry's is raised to it.
#[derive(Default)]
pub struct InMemoryAuditLog {
    state: Mutex<LogState>,
    unavailable: AtomicBool,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, appends fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every entry, archived first, in sequence order
    pub fn entries(&self) -> Vec<AuditEntry> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.archive.iter().chain(&state.active).cloned().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }

    pub fn archived_len(&self) -> usize {
        self.state.lock().archive.len()
    }
}

#[async_trait]
impl AuditRecorder for InMemoryAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("audit log is offline".into()));
        }

        let mut state = self.state.lock();
        state.next_sequence += 1;
        let sequence = state.next_sequence;

        let mut entry = entry.into_entry(sequence);
        if let Some(last) = state.last_timestamp {
            if entry.timestamp < last {
                entry.timestamp = last;
            }
        }
        state.last_timestamp = Some(entry.timestamp);
        state.active.push(entry.clone());

        debug!(
            sequence,
            instance_id = %entry.instance_id,
            kind = %entry.kind,
            outcome = %entry.outcome,
            "audit entry appended"
        );
        Ok(entry)
    }

    async fn trail(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, AuditError> {
        let state = self.state.lock();
        let mut trail: Vec<_> = state
            .archive
            .iter()
            .chain(&state.active)
            .filter(|entry| entry.instance_id == instance_id)
            .cloned()
            .collect();
        trail.sort_by_key(|entry| entry.sequence);
        Ok(trail)
    }

    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let mut state = self.state.lock();
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.active)
            .into_iter()
            .partition(|entry| entry.timestamp < cutoff);
        state.active = kept;
        let moved = expired.len();
        state.archive.extend(expired);
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Actor, AuditKind, AuditOutcome};
    use crate::state::WorkflowState;

    fn entry(instance_id: Uuid, at: DateTime<Utc>) -> NewAuditEntry {
        NewAuditEntry::new(
            instance_id,
            AuditKind::Transition,
            AuditOutcome::Applied,
            Actor::user("reviewer"),
            at,
        )
        .from_state(WorkflowState::Created)
        .to_state(WorkflowState::DocumentVerification)
    }

    #[tokio::test]
    async fn test_sequence_and_timestamps_monotonic() {
        let log = InMemoryAuditLog::new();
        let id = Uuid::now_v7();
        let now = Utc::now();

        let first = log.append(entry(id, now)).await.unwrap();
        let second = log
            .append(entry(id, now - chrono::Duration::seconds(5)))
            .await
            .unwrap();

        assert!(second.sequence > first.sequence);
        assert_eq!(second.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn test_trail_filters_by_instance() {
        let log = InMemoryAuditLog::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let now = Utc::now();

        log.append(entry(a, now)).await.unwrap();
        log.append(entry(b, now)).await.unwrap();
        log.append(entry(a, now)).await.unwrap();

        let trail = log.trail(a).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert!(trail.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_archive_keeps_history_readable() {
        let log = InMemoryAuditLog::new();
        let id = Uuid::now_v7();
        let start = Utc::now();

        log.append(entry(id, start)).await.unwrap();
        log.append(entry(id, start + chrono::Duration::days(10)))
            .await
            .unwrap();

        let moved = log
            .archive_before(start + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(log.archived_len(), 1);
        assert_eq!(log.trail(id).await.unwrap().len(), 2);

        let as_of = log
            .trail_as_of(id, start + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(as_of.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let log = InMemoryAuditLog::new();
        log.set_unavailable(true);
        let result = log.append(entry(Uuid::now_v7(), Utc::now())).await;
        assert!(matches!(result, Err(AuditError::Unavailable(_))));
        assert!(log.entries().is_empty());
    }
}
