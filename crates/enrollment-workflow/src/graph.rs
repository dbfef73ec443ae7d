//! Deployment-time transition graph
//!
//! The graph is built once from configuration and never changes while the
//! process runs. It answers three questions for the engine: which edges leave a
//! state, which facts must hold to enter a state, and which deadline and
//! auto-transition rule apply while an instance sits in a state.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::reliability::RetryPolicy;
use crate::serde_duration::{duration_millis, option_duration_millis};
use crate::state::WorkflowState;

const HOUR: Duration = Duration::from_secs(60 * 60);

fn default_warning_threshold() -> f64 {
    0.75
}

fn default_escalation_threshold() -> f64 {
    0.9
}

/// Delayed, fact-gated transition out of a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTransitionRule {
    pub target: WorkflowState,

    /// Time after entering the source state before the check runs
    #[serde(rename = "delay_ms", with = "duration_millis")]
    pub delay: Duration,

    #[serde(default)]
    pub required_facts: BTreeSet<String>,

    /// Applies to the transition request itself, not to notifications
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Configuration of a single node of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    pub state: WorkflowState,

    /// Allowed destinations, in configured order
    #[serde(default)]
    pub transitions: Vec<WorkflowState>,

    #[serde(
        default,
        rename = "deadline_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub deadline: Option<Duration>,

    /// Fraction of the deadline at which a warning is raised
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Fraction of the deadline at which the timeout action runs
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,

    /// Facts that must hold before an instance may enter this state
    #[serde(default)]
    pub required_facts: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_transition: Option<AutoTransitionRule>,
}

impl StateConfig {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            state,
            transitions: Vec::new(),
            deadline: None,
            warning_threshold: default_warning_threshold(),
            escalation_threshold: default_escalation_threshold(),
            required_facts: BTreeSet::new(),
            auto_transition: None,
        }
    }

    pub fn with_transitions(mut self, targets: impl IntoIterator<Item = WorkflowState>) -> Self {
        self.transitions = targets.into_iter().collect();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_thresholds(mut self, warning: f64, escalation: f64) -> Self {
        self.warning_threshold = warning;
        self.escalation_threshold = escalation;
        self
    }

    pub fn with_required_facts<I, S>(mut self, facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_facts = facts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auto_transition(mut self, rule: AutoTransitionRule) -> Self {
        self.auto_transition = Some(rule);
        self
    }
}

/// Validated, immutable adjacency table with per-state rules
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionGraph {
    initial: WorkflowState,
    states: BTreeMap<WorkflowState, StateConfig>,
}

static NO_FACTS: BTreeSet<String> = BTreeSet::new();

impl TransitionGraph {
    /// Build and validate a graph; `CREATED` is the initial state
    pub fn from_states(states: impl IntoIterator<Item = StateConfig>) -> Result<Self, ConfigError> {
        let mut by_state = BTreeMap::new();
        for config in states {
            let state = config.state;
            if by_state.insert(state, config).is_some() {
                return Err(ConfigError::DuplicateState(state));
            }
        }

        let graph = Self {
            initial: WorkflowState::Created,
            states: by_state,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.states.contains_key(&self.initial) {
            return Err(ConfigError::UnknownState(self.initial));
        }

        for (state, config) in &self.states {
            let state = *state;

            for target in &config.transitions {
                if !self.states.contains_key(target) {
                    return Err(ConfigError::UnknownState(*target));
                }
            }

            if state.is_terminal() {
                if !config.transitions.is_empty() {
                    return Err(ConfigError::TerminalHasTransitions(state));
                }
                if config.auto_transition.is_some() {
                    return Err(ConfigError::TerminalHasTransitions(state));
                }
                continue;
            }

            if !config.transitions.contains(&WorkflowState::Rejected) {
                return Err(ConfigError::MissingRejection(state));
            }

            let (warning, escalation) = (config.warning_threshold, config.escalation_threshold);
            if !(warning > 0.0 && warning < escalation && escalation <= 1.0) {
                return Err(ConfigError::InvalidThresholds { state });
            }

            if config.deadline.is_some_and(|d| d.is_zero()) {
                return Err(ConfigError::Invalid {
                    field: "deadline_ms",
                    reason: format!("deadline of {state} must be positive"),
                });
            }

            if let Some(rule) = &config.auto_transition {
                if !config.transitions.contains(&rule.target) {
                    return Err(ConfigError::AutoTransitionNotAnEdge {
                        from: state,
                        to: rule.target,
                    });
                }
                rule.retry_policy.validate()?;
            }
        }

        Ok(())
    }

    /// The enrollment review graph used when no configuration document is supplied
    pub fn enrollment_default() -> Self {
        Self {
            initial: WorkflowState::Created,
            states: default_states()
                .into_iter()
                .map(|config| (config.state, config))
                .collect(),
        }
    }

    pub fn initial(&self) -> WorkflowState {
        self.initial
    }

    pub fn contains(&self, state: WorkflowState) -> bool {
        self.states.contains_key(&state)
    }

    pub fn state(&self, state: WorkflowState) -> Option<&StateConfig> {
        self.states.get(&state)
    }

    /// Configured states in declaration order of the enum
    pub fn states(&self) -> impl Iterator<Item = &StateConfig> {
        self.states.values()
    }

    pub fn outgoing(&self, from: WorkflowState) -> &[WorkflowState] {
        self.states
            .get(&from)
            .map(|config| config.transitions.as_slice())
            .unwrap_or(&[])
    }

    pub fn allows(&self, from: WorkflowState, to: WorkflowState) -> bool {
        self.outgoing(from).contains(&to)
    }

    pub fn required_facts(&self, state: WorkflowState) -> &BTreeSet<String> {
        self.states
            .get(&state)
            .map(|config| &config.required_facts)
            .unwrap_or(&NO_FACTS)
    }

    pub fn deadline(&self, state: WorkflowState) -> Option<Duration> {
        self.states.get(&state).and_then(|config| config.deadline)
    }

    pub fn auto_transition(&self, state: WorkflowState) -> Option<&AutoTransitionRule> {
        self.states
            .get(&state)
            .and_then(|config| config.auto_transition.as_ref())
    }
}

impl Default for TransitionGraph {
    fn default() -> Self {
        Self::enrollment_default()
    }
}

/// Node list of the enrollment review graph
pub fn default_states() -> Vec<StateConfig> {
    use crate::state::WorkflowState::*;

    vec![
        StateConfig::new(Created).with_transitions([DocumentVerification, Rejected]),
        StateConfig::new(DocumentVerification)
            .with_transitions([AcademicReview, Rejected])
            .with_deadline(48 * HOUR),
        StateConfig::new(AcademicReview)
            .with_transitions([FinalReview, Rejected])
            .with_deadline(72 * HOUR)
            .with_required_facts(["documents-verified", "minimum-gpa-met"]),
        StateConfig::new(FinalReview)
            .with_transitions([Approved, Rejected])
            .with_deadline(24 * HOUR),
        StateConfig::new(Approved)
            .with_transitions([Completed, Rejected])
            .with_auto_transition(AutoTransitionRule {
                target: Completed,
                delay: 24 * HOUR,
                required_facts: ["all-documents-verified", "fees-paid"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                retry_policy: RetryPolicy::exponential(),
            }),
        StateConfig::new(Rejected),
        StateConfig::new(Completed).with_required_facts(["all-documents-verified", "fees-paid"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowState::*;

    #[test]
    fn test_default_graph_validates() {
        let graph = TransitionGraph::from_states(default_states()).expect("should validate");
        assert_eq!(graph, TransitionGraph::enrollment_default());
        assert_eq!(graph.initial(), Created);
    }

    #[test]
    fn test_happy_path_and_rejection_edges() {
        let graph = TransitionGraph::enrollment_default();
        let happy = [
            Created,
            DocumentVerification,
            AcademicReview,
            FinalReview,
            Approved,
            Completed,
        ];
        for pair in happy.windows(2) {
            assert!(graph.allows(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        for state in WorkflowState::ALL {
            assert_eq!(graph.allows(state, Rejected), !state.is_terminal());
        }
        assert!(!graph.allows(Created, Approved));
        assert!(graph.outgoing(Completed).is_empty());
    }

    #[test]
    fn test_default_deadlines_and_facts() {
        let graph = TransitionGraph::enrollment_default();
        assert_eq!(graph.deadline(DocumentVerification), Some(48 * HOUR));
        assert_eq!(graph.deadline(AcademicReview), Some(72 * HOUR));
        assert_eq!(graph.deadline(FinalReview), Some(24 * HOUR));
        assert_eq!(graph.deadline(Created), None);
        assert_eq!(graph.deadline(Approved), None);

        assert!(graph.required_facts(AcademicReview).contains("minimum-gpa-met"));
        assert!(graph.required_facts(Created).is_empty());

        let rule = graph.auto_transition(Approved).expect("should have rule");
        assert_eq!(rule.target, Completed);
        assert_eq!(rule.delay, 24 * HOUR);
    }

    #[test]
    fn test_terminal_with_edges_rejected() {
        let mut states = default_states();
        states[5] = StateConfig::new(Rejected).with_transitions([Created]);
        assert!(matches!(
            TransitionGraph::from_states(states),
            Err(ConfigError::TerminalHasTransitions(Rejected))
        ));
    }

    #[test]
    fn test_missing_rejection_edge() {
        let mut states = default_states();
        states[1] = StateConfig::new(DocumentVerification).with_transitions([AcademicReview]);
        assert!(matches!(
            TransitionGraph::from_states(states),
            Err(ConfigError::MissingRejection(DocumentVerification))
        ));
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut states = default_states();
        states[1] = states[1].clone().with_thresholds(0.9, 0.75);
        assert!(matches!(
            TransitionGraph::from_states(states),
            Err(ConfigError::InvalidThresholds { state: DocumentVerification })
        ));
    }

    #[test]
    fn test_auto_transition_must_be_an_edge() {
        let mut states = default_states();
        states[4] = states[4].clone().with_transitions([Rejected]);
        assert!(matches!(
            TransitionGraph::from_states(states),
            Err(ConfigError::AutoTransitionNotAnEdge { from: Approved, to: Completed })
        ));
    }

    #[test]
    fn test_duplicate_and_unknown_states() {
        let mut states = default_states();
        states.push(StateConfig::new(Created).with_transitions([Rejected]));
        assert!(matches!(
            TransitionGraph::from_states(states),
            Err(ConfigError::DuplicateState(Created))
        ));

        let states: Vec<_> = default_states()
            .into_iter()
            .filter(|config| config.state != Completed)
            .collect();
        assert!(matches!(
            TransitionGraph::from_states(states),
            Err(ConfigError::UnknownState(Completed))
        ));
    }
}
