//! Audit entry types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::WorkflowState;

/// What an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Instance created in the initial state
    Created,
    /// A transition attempt, applied or not
    Transition,
    /// A gating fact was recorded
    FactRecorded,
    DeadlineWarning,
    DeadlineEscalation,
    /// An auto-transition exhausted its retries
    AutoTransitionFailed,
    /// A notification could not be delivered
    NotificationFailed,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Transition => "transition",
            Self::FactRecorded => "fact_recorded",
            Self::DeadlineWarning => "deadline_warning",
            Self::DeadlineEscalation => "deadline_escalation",
            Self::AutoTransitionFailed => "auto_transition_failed",
            Self::NotificationFailed => "notification_failed",
        }
    }

    /// Kinds that change the instance record and bump its version
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Created | Self::Transition | Self::FactRecorded)
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "transition" => Ok(Self::Transition),
            "fact_recorded" => Ok(Self::FactRecorded),
            "deadline_warning" => Ok(Self::DeadlineWarning),
            "deadline_escalation" => Ok(Self::DeadlineEscalation),
            "auto_transition_failed" => Ok(Self::AutoTransitionFailed),
            "notification_failed" => Ok(Self::NotificationFailed),
            other => Err(format!("unknown audit kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    Rejected,
    Error,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(Self::Applied),
            "rejected" => Ok(Self::Rejected),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown audit outcome: {other}")),
        }
    }
}

/// Who asked for an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A human reviewer or applicant, by user id
    User(String),
    /// An engine component such as the auto-transition scheduler
    System(String),
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn system(component: impl Into<String>) -> Self {
        Self::System(component.into())
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::System(component) => write!(f, "system:{component}"),
        }
    }
}

/// Immutable record in the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned at append time, strictly increasing across the log
    pub sequence: u64,
    pub instance_id: Uuid,
    pub kind: AuditKind,
    pub from_state: Option<WorkflowState>,
    /// Destination, or the attempted destination for rejected transitions
    pub to_state: Option<WorkflowState>,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    /// Instance version after an applied mutation, or the version a refused attempt saw
    pub version: Option<u64>,
}

/// An audit entry before the log assigns its sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub instance_id: Uuid,
    pub kind: AuditKind,
    pub from_state: Option<WorkflowState>,
    pub to_state: Option<WorkflowState>,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub version: Option<u64>,
}

impl NewAuditEntry {
    pub fn new(
        instance_id: Uuid,
        kind: AuditKind,
        outcome: AuditOutcome,
        actor: Actor,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id,
            kind,
            from_state: None,
            to_state: None,
            actor,
            timestamp,
            outcome,
            reason: None,
            version: None,
        }
    }

    pub fn from_state(mut self, state: WorkflowState) -> Self {
        self.from_state = Some(state);
        self
    }

    pub fn to_state(mut self, state: WorkflowState) -> Self {
        self.to_state = Some(state);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub(crate) fn into_entry(self, sequence: u64) -> AuditEntry {
        AuditEntry {
            sequence,
            instance_id: self.instance_id,
            kind: self.kind,
            from_state: self.from_state,
            to_state: self.to_state,
            actor: self.actor,
            timestamp: self.timestamp,
            outcome: self.outcome,
            reason: self.reason,
            version: self.version,
        }
    }
}
