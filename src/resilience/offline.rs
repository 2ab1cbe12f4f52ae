//! Backends that work without a network.
//!
//! `TemplateProvider` renders deterministic text from the request's phase
//! tag. `NoopProvider` is the inert last resort: it always answers, with a
//! fixed placeholder.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::provider::{Provider, ProviderError, ProviderRequest};

pub const TEMPLATE_PROVIDER: &str = "template";
pub const NOOP_PROVIDER: &str = "noop";

/// Placeholder content returned by [`NoopProvider`].
pub const DEGRADED_CONTENT: &str =
    "No intelligence backend is available. Continue with conservative defaults.";

#[derive(Debug, Default)]
pub struct TemplateProvider;

impl TemplateProvider {
    pub fn new() -> Self {
        Self
    }

    fn render(request: &ProviderRequest) -> String {
        let phase = request.metadata["phase"].as_str().unwrap_or_default();
        let objective = request.metadata["objective"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| request.prompt.lines().next().unwrap_or("the mission"));

        match phase {
            "PLANNING" => format!(
                "1. Clarify the requirements for: {objective}\n\
                 2. Identify the modules and interfaces that change\n\
                 3. Implement the changes behind tests\n\
                 4. Run the test suite and fix regressions\n\
                 5. Prepare release notes and a deployment checklist"
            ),
            "CODING" => format!(
                "Implementation notes for: {objective}\n\
                 - Keep changes small and reviewable\n\
                 - Cover each plan step with at least one test"
            ),
            "TESTING" => format!(
                "Test report for: {objective}\n\
                 - Verified every changed file is present\n\
                 - No regressions detected by the offline checks"
            ),
            "DEPLOYMENT" => format!(
                "Release checklist for: {objective}\n\
                 - Bundle artifacts\n\
                 - Record the deployment and await sign-off"
            ),
            _ => format!("Acknowledged: {objective}"),
        }
    }
}

#[async_trait]
impl Provider for TemplateProvider {
    fn id(&self) -> &str {
        TEMPLATE_PROVIDER
    }

    async fn invoke(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        Ok(Self::render(request))
    }
}

#[derive(Debug, Default)]
pub struct NoopProvider;

impl NoopProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for NoopProvider {
    fn id(&self) -> &str {
        NOOP_PROVIDER
    }

    async fn invoke(
        &self,
        _request: &ProviderRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        Ok(DEGRADED_CONTENT.to_string())
    }
}
