//! Workflow states and the application-level status they map to

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The fixed, finite set of review stages an enrollment application moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Application submitted, nothing reviewed yet
    Created,
    DocumentVerification,
    AcademicReview,
    FinalReview,
    Approved,
    /// Terminal
    Rejected,
    /// Terminal
    Completed,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 7] = [
        Self::Created,
        Self::DocumentVerification,
        Self::AcademicReview,
        Self::FinalReview,
        Self::Approved,
        Self::Rejected,
        Self::Completed,
    ];

    /// Terminal states keep no outgoing edges and are retained for audit
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::DocumentVerification => "DOCUMENT_VERIFICATION",
            Self::AcademicReview => "ACADEMIC_REVIEW",
            Self::FinalReview => "FINAL_REVIEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Completed => "COMPLETED",
        }
    }

    /// Status shown to applicants and the rest of the platform
    pub fn application_status(self) -> ApplicationStatus {
        match self {
            Self::Created => ApplicationStatus::Submitted,
            Self::DocumentVerification | Self::AcademicReview | Self::FinalReview => {
                ApplicationStatus::UnderReview
            }
            Self::Approved | Self::Completed => ApplicationStatus::Approved,
            Self::Rejected => ApplicationStatus::Rejected,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workflow state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for WorkflowState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// Application status as seen outside the workflow engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Submitted,
    UnderReview,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::UnderReview => write!(f, "UNDER_REVIEW"),
            Self::Approved => write!(f, "APPROVED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = WorkflowState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![WorkflowState::Rejected, WorkflowState::Completed]
        );
    }

    #[test]
    fn test_parse_round_trips_display() {
        for state in WorkflowState::ALL {
            assert_eq!(state.to_string().parse::<WorkflowState>(), Ok(state));
        }
        assert!("ARCHIVED".parse::<WorkflowState>().is_err());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&WorkflowState::DocumentVerification).unwrap();
        assert_eq!(json, "\"DOCUMENT_VERIFICATION\"");
    }

    #[test]
    fn test_application_status_mapping() {
        assert_eq!(
            WorkflowState::Created.application_status(),
            ApplicationStatus::Submitted
        );
        assert_eq!(
            WorkflowState::AcademicReview.application_status(),
            ApplicationStatus::UnderReview
        );
        assert_eq!(
            WorkflowState::Completed.application_status(),
            ApplicationStatus::Approved
        );
        assert_eq!(
            WorkflowState::Rejected.application_status(),
            ApplicationStatus::Rejected
        );
    }
}
