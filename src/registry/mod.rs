//! Agent and tool registries.
//!
//! Agents are looked up by exact id; an unknown id is always a hard
//! `NotFound` carrying the list of ids that do exist. The agent table is
//! built during boot and then frozen behind an `Arc`, so resolution takes no
//! locks. Tools can be attached to an agent after the kernel exists, which is
//! how the delegation tool gets wired in (see `runtime`).

mod agents;
mod schema;
mod tools;

pub use agents::{Agent, AgentContext, AgentFactory, AgentRegistration, AgentRegistry, AgentRole};
pub use schema::validate_params;
pub use tools::{Tool, ToolContext, ToolInfo, ToolRegistry};

#[cfg(test)]
pub(crate) use agents::tests;

use crate::error::RuntimeError;

/// Errors raised while looking up registered capabilities.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown agent '{id}' (known: {})", .known.join(", "))]
    UnknownAgent { id: String, known: Vec<String> },

    #[error("agent '{owner}' has no tool '{name}' (available: {})", .known.join(", "))]
    UnknownTool {
        owner: String,
        name: String,
        known: Vec<String>,
    },
}

impl From<RegistryError> for RuntimeError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownAgent { id, known } => RuntimeError::NotFound {
                kind: "agent",
                id,
                known,
            },
            RegistryError::UnknownTool { name, known, .. } => RuntimeError::NotFound {
                kind: "tool",
                id: name,
                known,
            },
        }
    }
}

/// Errors raised by tool parameter validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("invalid parameter '{field}' for tool {tool}: {message}")]
    InvalidParameter {
        tool: String,
        field: String,
        message: String,
    },

    #[error("tool {tool} declares an invalid parameter schema: {message}")]
    InvalidSchema { tool: String, message: String },
}

impl From<ToolError> for RuntimeError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::InvalidParameter { .. } => RuntimeError::Validation(e.to_string()),
            ToolError::InvalidSchema { .. } => RuntimeError::Internal(e.to_string()),
        }
    }
}
