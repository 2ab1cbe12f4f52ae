//! Crate-wide error taxonomy.
//!
//! Subsystems keep their own narrow error enums (`LedgerError`, `TaskError`,
//! `ProviderError`, ...) and convert into [`RuntimeError`] at the boundary
//! where a caller has to decide what to do with the failure:
//!
//! - `Validation` / `NotFound` are local: they terminate only the offending
//!   task or delegation and never mutate state.
//! - `StoreUnavailable` is fatal to the current operation and must reach the
//!   caller; the triggering outcome is *not* committed.
//! - `BreakerOpen` is recovered inside the provider chain.
//! - `GateFailure` moves a mission to `AWAITING_APPROVAL` or `FAILED`.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::mission::MissionError;
use crate::task::TaskError;

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found (known: {})", .known.join(", "))]
    NotFound {
        kind: &'static str,
        id: String,
        known: Vec<String>,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("circuit breaker open for provider '{provider}' ({remaining_ms} ms of cooldown left)")]
    BreakerOpen { provider: String, remaining_ms: u64 },

    #[error("quality gate for {phase} failed: {reason}")]
    GateFailure { phase: String, reason: String },

    #[error("not a legal transition from state {from} to {requested} (legal: {})", .legal.join(", "))]
    IllegalTransition {
        from: String,
        requested: String,
        legal: Vec<String>,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the error leaves the runtime's durable state untouched and only
    /// affects the request that produced it.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound { .. })
    }

    /// Short machine-friendly tag, used in ledger summaries and tool output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::GateFailure { .. } => "gate_failure",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<LedgerError> for RuntimeError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::StoreUnavailable(msg) => Self::StoreUnavailable(msg),
            LedgerError::Corrupt(msg) => Self::StoreUnavailable(format!("corrupt ledger: {}", msg)),
        }
    }
}

impl From<TaskError> for RuntimeError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::InvalidTransition { .. } => Self::Internal(e.to_string()),
            TaskError::EmptyAgentId => Self::Validation(e.to_string()),
        }
    }
}

impl From<MissionError> for RuntimeError {
    fn from(e: MissionError) -> Self {
        match e {
            MissionError::Store(msg) => Self::StoreUnavailable(msg),
            MissionError::Corrupt(msg) => Self::StoreUnavailable(format!("corrupt manifest: {}", msg)),
            MissionError::NotFound(id) => Self::NotFound {
                kind: "mission",
                id,
                known: Vec::new(),
            },
            MissionError::InvalidPlan(msg) => Self::Validation(msg),
        }
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
