//! Mission phases and the transition table.

use serde::{Deserialize, Serialize};

/// Phase of a mission.
///
/// ```text
/// INITIALIZING -> PLANNING -> CODING -> TESTING -> DEPLOYMENT -> MAINTENANCE
///       any work phase -> AWAITING_APPROVAL -> successor of the paused phase
///       any non-terminal phase -> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Initializing,
    Planning,
    Coding,
    Testing,
    Deployment,
    Maintenance,
    AwaitingApproval,
    Failed,
}

/// Phases that run work and own a quality gate, in order.
pub const WORK_PHASES: [Phase; 5] = [
    Phase::Initializing,
    Phase::Planning,
    Phase::Coding,
    Phase::Testing,
    Phase::Deployment,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Planning => "PLANNING",
            Self::Coding => "CODING",
            Self::Testing => "TESTING",
            Self::Deployment => "DEPLOYMENT",
            Self::Maintenance => "MAINTENANCE",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "INITIALIZING" => Some(Self::Initializing),
            "PLANNING" => Some(Self::Planning),
            "CODING" => Some(Self::Coding),
            "TESTING" => Some(Self::Testing),
            "DEPLOYMENT" => Some(Self::Deployment),
            "MAINTENANCE" => Some(Self::Maintenance),
            "AWAITING_APPROVAL" => Some(Self::AwaitingApproval),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Declared successor in the delivery pipeline.
    pub fn successor(&self) -> Option<Phase> {
        match self {
            Self::Initializing => Some(Self::Planning),
            Self::Planning => Some(Self::Coding),
            Self::Coding => Some(Self::Testing),
            Self::Testing => Some(Self::Deployment),
            Self::Deployment => Some(Self::Maintenance),
            Self::Maintenance | Self::AwaitingApproval | Self::Failed => None,
        }
    }

    pub fn is_work_phase(&self) -> bool {
        WORK_PHASES.contains(self)
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Maintenance | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Targets a caller may request from `current`.
///
/// `paused` is the work phase a mission was in when it stopped for approval.
/// `AWAITING_APPROVAL` and `FAILED` are entered by the orchestrator, never on
/// request.
pub fn requestable_targets(current: Phase, paused: Option<Phase>) -> Vec<Phase> {
    match current {
        Phase::AwaitingApproval => paused.and_then(|p| p.successor()).into_iter().collect(),
        other => other.successor().into_iter().collect(),
    }
}
