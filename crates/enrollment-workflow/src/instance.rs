//! Workflow instances and gating facts

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::elapsed_between;
use crate::state::WorkflowState;

/// Value of a named gating fact such as `fees-paid`
///
/// A fact holds when it is `true` or carries the time it became true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Flag(bool),
    At(DateTime<Utc>),
}

impl FactValue {
    pub fn holds(&self) -> bool {
        match self {
            Self::Flag(value) => *value,
            Self::At(_) => true,
        }
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<DateTime<Utc>> for FactValue {
    fn from(at: DateTime<Utc>) -> Self {
        Self::At(at)
    }
}

impl std::fmt::Display for FactValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag(value) => write!(f, "{value}"),
            Self::At(at) => write!(f, "{}", at.to_rfc3339()),
        }
    }
}

/// One enrollment application's workflow run
///
/// Instances are only ever changed through the transition engine; stores
/// receive whole successor records and compare versions before writing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub application_id: Uuid,
    pub state: WorkflowState,
    /// Starts at 0, +1 on every committed change
    pub version: u64,
    pub state_entered_at: DateTime<Utc>,
    #[serde(default)]
    pub facts: BTreeMap<String, FactValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// A freshly submitted application in the initial state
    pub fn new(application_id: Uuid, initial: WorkflowState, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            application_id,
            state: initial,
            version: 0,
            state_entered_at: now,
            facts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn fact_holds(&self, name: &str) -> bool {
        self.facts.get(name).is_some_and(FactValue::holds)
    }

    /// Required facts that do not currently hold, in name order
    pub fn missing_facts(&self, required: &BTreeSet<String>) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.fact_holds(name))
            .cloned()
            .collect()
    }

    /// Time spent in the current state
    pub fn time_in_state(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.state_entered_at, now)
    }

    /// Successor record after moving to `to`
    pub fn transitioned(&self, to: WorkflowState, now: DateTime<Utc>) -> Self {
        Self {
            state: to,
            version: self.version + 1,
            state_entered_at: now,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Successor record after recording a fact; the state entry time is kept
    pub fn with_fact(&self, name: impl Into<String>, value: FactValue, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.facts.insert(name.into(), value);
        next.version += 1;
        next.updated_at = now;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(Uuid::now_v7(), WorkflowState::Created, Utc::now())
    }

    #[test]
    fn test_new_instance_starts_at_version_zero() {
        let instance = instance();
        assert_eq!(instance.version, 0);
        assert_eq!(instance.state, WorkflowState::Created);
        assert!(instance.facts.is_empty());
    }

    #[test]
    fn test_transitioned_bumps_version_and_resets_entry() {
        let instance = instance();
        let later = instance.state_entered_at + chrono::Duration::hours(1);
        let next = instance.transitioned(WorkflowState::DocumentVerification, later);

        assert_eq!(next.version, 1);
        assert_eq!(next.state, WorkflowState::DocumentVerification);
        assert_eq!(next.state_entered_at, later);
        assert_eq!(next.id, instance.id);
    }

    #[test]
    fn test_with_fact_keeps_state_entry() {
        let instance = instance();
        let later = instance.state_entered_at + chrono::Duration::minutes(5);
        let next = instance.with_fact("fees-paid", FactValue::Flag(true), later);

        assert_eq!(next.version, 1);
        assert_eq!(next.state_entered_at, instance.state_entered_at);
        assert!(next.fact_holds("fees-paid"));
    }

    #[test]
    fn test_missing_facts() {
        let now = Utc::now();
        let instance = instance()
            .with_fact("documents-verified", FactValue::At(now), now)
            .with_fact("minimum-gpa-met", FactValue::Flag(false), now);

        let required: BTreeSet<String> = ["documents-verified", "minimum-gpa-met", "fees-paid"]
            .into_iter()
            .map(String::from)
            .collect();

        assert_eq!(
            instance.missing_facts(&required),
            vec!["fees-paid".to_string(), "minimum-gpa-met".to_string()]
        );
    }

    #[test]
    fn test_fact_value_serde() {
        let flag: FactValue = serde_json::from_str("true").unwrap();
        assert_eq!(flag, FactValue::Flag(true));

        let at: FactValue = serde_json::from_str("\"2024-05-01T12:00:00Z\"").unwrap();
        assert!(matches!(at, FactValue::At(_)));
        assert!(at.holds());
    }
}
