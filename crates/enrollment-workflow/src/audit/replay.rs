//! Rebuild an instance's state from its audit trail

use chrono::{DateTime, Utc};

use crate::graph::TransitionGraph;
use crate::state::WorkflowState;

use super::{AuditEntry, AuditKind, AuditOutcome};

/// State and version reconstructed by [`replay`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayedState {
    pub state: WorkflowState,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("trail has no applied creation entry")]
    MissingCreation,

    #[error("entry {sequence} is out of sequence order")]
    OutOfOrder { sequence: u64 },

    #[error("entry {sequence} belongs to a different instance")]
    MixedInstances { sequence: u64 },

    #[error("entry {sequence} repeats the creation of the instance")]
    DuplicateCreation { sequence: u64 },

    #[error("entry {sequence} is missing {field}")]
    MissingField {
        sequence: u64,
        field: &'static str,
    },

    #[error("entry {sequence}: expected version {expected}, found {found}")]
    VersionGap {
        sequence: u64,
        expected: u64,
        found: u64,
    },

    #[error("entry {sequence}: transition starts from {found} but instance was in {expected}")]
    StateMismatch {
        sequence: u64,
        expected: WorkflowState,
        found: WorkflowState,
    },

    #[error("entry {sequence}: {from} -> {to} is not a configured edge")]
    IllegalTransition {
        sequence: u64,
        from: WorkflowState,
        to: WorkflowState,
    },
}

/// Fold an instance's audit trail into its current `(state, version)`
///
/// Only applied mutations count; rejected attempts, deadline signals and
/// notification failures are skipped. An applied entry is appended after its
/// commit, so concurrent writers can land their entries out of commit order;
/// applied mutations are therefore folded by the version they carry, which is
/// the commit order. Versions must be contiguous from the creation at 0, and
/// every transition must be an edge of `graph`.
pub fn replay(entries: &[AuditEntry], graph: &TransitionGraph) -> Result<ReplayedState, ReplayError> {
    let mut previous_sequence: Option<u64> = None;
    let instance_id = entries.first().map(|entry| entry.instance_id);
    let mut applied: Vec<(u64, &AuditEntry)> = Vec::new();

    for entry in entries {
        let sequence = entry.sequence;
        if previous_sequence.is_some_and(|previous| sequence <= previous) {
            return Err(ReplayError::OutOfOrder { sequence });
        }
        previous_sequence = Some(sequence);

        if Some(entry.instance_id) != instance_id {
            return Err(ReplayError::MixedInstances { sequence });
        }

        if entry.outcome != AuditOutcome::Applied || !entry.kind.is_mutation() {
            continue;
        }

        let version = entry.version.ok_or(ReplayError::MissingField {
            sequence,
            field: "version",
        })?;
        applied.push((version, entry));
    }

    // stable: equal versions keep their sequence order
    applied.sort_by_key(|(version, _)| *version);

    let mut current: Option<ReplayedState> = None;
    for (version, entry) in applied {
        let sequence = entry.sequence;

        let Some(state) = current else {
            if entry.kind != AuditKind::Created {
                return Err(ReplayError::MissingCreation);
            }
            let created = entry.to_state.ok_or(ReplayError::MissingField {
                sequence,
                field: "to_state",
            })?;
            if version != 0 {
                return Err(ReplayError::VersionGap {
                    sequence,
                    expected: 0,
                    found: version,
                });
            }
            current = Some(ReplayedState {
                state: created,
                version,
            });
            continue;
        };

        if entry.kind == AuditKind::Created {
            return Err(ReplayError::DuplicateCreation { sequence });
        }

        let expected = state.version + 1;
        if version != expected {
            return Err(ReplayError::VersionGap {
                sequence,
                expected,
                found: version,
            });
        }

        let next_state = match entry.kind {
            AuditKind::FactRecorded => state.state,
            _ => {
                let from = entry.from_state.ok_or(ReplayError::MissingField {
                    sequence,
                    field: "from_state",
                })?;
                let to = entry.to_state.ok_or(ReplayError::MissingField {
                    sequence,
                    field: "to_state",
                })?;
                if from != state.state {
                    return Err(ReplayError::StateMismatch {
                        sequence,
                        expected: state.state,
                        found: from,
                    });
                }
                if !graph.allows(from, to) {
                    return Err(ReplayError::IllegalTransition { sequence, from, to });
                }
                to
            }
        };

        current = Some(ReplayedState {
            state: next_state,
            version,
        });
    }

    current.ok_or(ReplayError::MissingCreation)
}

/// Entries of `trail` that make up its history as it stood at `at`
///
/// Keeps everything recorded by `at`, plus applied mutations committed before
/// the newest one kept whose entries were appended after it. The result stays
/// in sequence order and replays without version gaps.
pub fn history_as_of(trail: Vec<AuditEntry>, at: DateTime<Utc>) -> Vec<AuditEntry> {
    let is_applied = |entry: &AuditEntry| entry.outcome == AuditOutcome::Applied && entry.kind.is_mutation();
    let committed = trail
        .iter()
        .filter(|entry| entry.timestamp <= at && is_applied(entry))
        .filter_map(|entry| entry.version)
        .max();

    trail
        .into_iter()
        .filter(|entry| {
            entry.timestamp <= at
                || (is_applied(entry)
                    && entry
                        .version
                        .zip(committed)
                        .is_some_and(|(version, committed)| version <= committed))
        })
        .collect()
}
