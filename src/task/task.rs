//! Core Task type dispatched by the kernel.
//!
//! # Invariants
//! - `status` only moves forward: `Pending -> Running -> {Succeeded, Failed}`,
//!   or `Pending -> Cancelled` when cancellation wins before execution
//! - `id` is unique within a kernel
//! - `parent_id` is set only for tasks created by delegation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Running -> Succeeded
///        |          \-> Failed
///        \-> Cancelled
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

impl TaskStatus {
    /// `true` if the task is Succeeded, Failed, or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed { .. } => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Submission request for a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub agent_id: String,
    pub payload: serde_json::Value,
    pub parent_id: Option<TaskId>,
}

impl NewTask {
    pub fn new(agent_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            payload,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// A unit of dispatchable work.
///
/// Fields are private; the kernel drives status through the explicit
/// transition methods below so an illegal transition is an error, not a
/// silent overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    agent_id: String,
    payload: serde_json::Value,
    status: TaskStatus,
    parent_id: Option<TaskId>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    /// Set by an external cancel request; checked at the next scheduling point.
    cancel_requested: bool,
    /// Result payload produced by the agent (successful tasks only).
    output: Option<serde_json::Value>,
}

impl Task {
    /// Create a new pending task.
    ///
    /// # Errors
    /// Returns `Err` if `agent_id` is empty.
    pub fn new(request: NewTask) -> Result<Self, TaskError> {
        if request.agent_id.trim().is_empty() {
            return Err(TaskError::EmptyAgentId);
        }
        Ok(Self {
            id: TaskId::new(),
            agent_id: request.agent_id,
            payload: request.payload,
            status: TaskStatus::Pending,
            parent_id: request.parent_id,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            output: None,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.parent_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.output.as_ref()
    }

    /// `CANCELLING`: a cancel was requested and the task is not yet terminal.
    pub fn is_cancelling(&self) -> bool {
        self.cancel_requested && !self.status.is_terminal()
    }

    /// Flag the task for cancellation. Returns `false` if it already finished.
    pub fn request_cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// # Precondition
    /// `self.status == Pending`
    pub fn start(&mut self) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: other.label().to_string(),
                to: "RUNNING".to_string(),
            }),
        }
    }

    /// # Precondition
    /// `self.status == Running`
    pub fn succeed(&mut self, output: serde_json::Value) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Succeeded;
                self.output = Some(output);
                self.finished_at = Some(Utc::now());
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: other.label().to_string(),
                to: "SUCCEEDED".to_string(),
            }),
        }
    }

    /// # Precondition
    /// `self.status == Running`
    pub fn fail(&mut self, reason: String) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Failed { reason };
                self.finished_at = Some(Utc::now());
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: other.label().to_string(),
                to: "FAILED".to_string(),
            }),
        }
    }

    /// Cancel a task that never started.
    ///
    /// # Precondition
    /// `self.status == Pending`
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Cancelled;
                self.finished_at = Some(Utc::now());
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: other.label().to_string(),
                to: "CANCELLED".to_string(),
            }),
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task agent id cannot be empty")]
    EmptyAgentId,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}
