//! Engine configuration document
//!
//! The whole engine is configured by one TOML document read at startup:
//!
//! ```toml
//! [[states]]
//! state = "DOCUMENT_VERIFICATION"
//! transitions = ["ACADEMIC_REVIEW", "REJECTED"]
//! deadline_ms = 172800000
//!
//! [monitor]
//! scan_interval_ms = 60000
//!
//! [circuit_breaker]
//! failure_rate_threshold = 0.5
//! ```
//!
//! Every section is optional and falls back to the enrollment defaults.
//! Changing the document requires a restart.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audit::AuditConfig;
use crate::graph::{default_states, StateConfig, TransitionGraph};
use crate::monitor::MonitorConfig;
use crate::notification::NotificationConfig;
use crate::reliability::CircuitBreakerConfig;
use crate::state::WorkflowState;

/// Configuration errors, raised only at load time
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config document: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("state {0} is configured more than once")]
    DuplicateState(WorkflowState),

    #[error("state {0} is referenced but not configured")]
    UnknownState(WorkflowState),

    #[error("terminal state {0} must not have outgoing transitions")]
    TerminalHasTransitions(WorkflowState),

    #[error("state {0} has no transition to REJECTED")]
    MissingRejection(WorkflowState),

    #[error("state {state}: thresholds must satisfy 0 < warning < escalation <= 1")]
    InvalidThresholds { state: WorkflowState },

    #[error("auto-transition {from} -> {to} is not a configured edge")]
    AutoTransitionNotAnEdge {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn default_state_configs() -> Vec<StateConfig> {
    default_states()
}

/// Root of the configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_state_configs")]
    pub states: Vec<StateConfig>,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            states: default_states(),
            monitor: MonitorConfig::default(),
            notifications: NotificationConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate the document at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&document)
    }

    /// Like [`EngineConfig::load`], but a missing file yields the built-in defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using built-in defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.graph()?;
        self.monitor.validate()?;
        self.notifications.validate()?;
        self.circuit_breaker.validate()?;
        self.audit.validate()?;
        Ok(())
    }

    /// Build the validated transition graph
    pub fn graph(&self) -> Result<TransitionGraph, ConfigError> {
        TransitionGraph::from_states(self.states.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shipped_document_matches_defaults() {
        let document = include_str!("../../../config/workflow.toml");
        let config = EngineConfig::from_toml_str(document).expect("shipped config should parse");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").expect("should parse");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.graph().unwrap(), TransitionGraph::enrollment_default());
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [monitor]
            scan_interval_ms = 5000

            [circuit_breaker]
            reset_timeout_ms = 1000
            "#,
        )
        .expect("should parse");

        assert_eq!(config.monitor.scan_interval, Duration::from_secs(5));
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(1));
        assert_eq!(config.circuit_breaker.minimum_calls, 3);
    }

    #[test]
    fn test_invalid_graph_is_rejected() {
        let result = EngineConfig::from_toml_str(
            r#"
            [[states]]
            state = "CREATED"
            transitions = ["DOCUMENT_VERIFICATION"]

            [[states]]
            state = "DOCUMENT_VERIFICATION"
            transitions = ["REJECTED"]

            [[states]]
            state = "REJECTED"
            "#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::MissingRejection(WorkflowState::Created))
        ));
    }

    #[test]
    fn test_unknown_state_name_fails_to_parse() {
        let result = EngineConfig::from_toml_str(
            r#"
            [[states]]
            state = "ARCHIVED"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = EngineConfig::load_or_default("/nonexistent/workflow.toml")
            .expect("should fall back");
        assert_eq!(config, EngineConfig::default());
        assert!(matches!(
            EngineConfig::load("/nonexistent/workflow.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
