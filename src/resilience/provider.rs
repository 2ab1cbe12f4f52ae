//! Uniform boundary to an intelligence backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A request for a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Free-form context (phase, mission id, ...). Backends may use it; the
    /// chain never looks at it.
    #[serde(default)]
    pub metadata: Value,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            metadata: Value::Null,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What the chain hands back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderResponse {
    /// Id of the backend that answered.
    pub provider: String,
    pub content: String,
    /// `true` when the answer came from the inert last-resort backend.
    pub degraded: bool,
    pub latency_ms: u64,
    /// 1-based position of the answering backend in the chain.
    pub attempt: u32,
}

/// Errors from a single backend call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Map an HTTP status to an error kind.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited(message),
            500..=599 => Self::Server { status, message },
            _ => Self::Client { status, message },
        }
    }
}

/// One intelligence backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    /// Produce a completion for `request`.
    ///
    /// Implementations should return promptly with `ProviderError::Cancelled`
    /// once `cancel` fires.
    async fn invoke(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(ProviderError::from_status(429, "slow down"), ProviderError::RateLimited(_)));
        assert!(matches!(
            ProviderError::from_status(529, "overloaded"),
            ProviderError::Server { status: 529, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(401, "bad key"),
            ProviderError::Client { status: 401, .. }
        ));
    }
}
