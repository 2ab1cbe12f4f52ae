//! Phase specialists.
//!
//! Each specialist asks the provider chain for its document, writes it under
//! the mission's artifact directory, and reports one artifact whose
//! attributes are what the phase's quality gate inspects.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{SPECIALIST_CODING, SPECIALIST_DEPLOYMENT, SPECIALIST_PLANNING, SPECIALIST_TESTING};
use crate::delegation::DelegationPayload;
use crate::error::{Result, RuntimeError};
use crate::mission::{artifact_dir, gates, Phase};
use crate::registry::{Agent, AgentContext};
use crate::resilience::{ProviderChain, ProviderRequest, ProviderResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialistKind {
    Planning,
    Coding,
    Testing,
    Deployment,
}

impl SpecialistKind {
    pub const ALL: [SpecialistKind; 4] = [
        SpecialistKind::Planning,
        SpecialistKind::Coding,
        SpecialistKind::Testing,
        SpecialistKind::Deployment,
    ];

    pub fn agent_id(&self) -> &'static str {
        match self {
            Self::Planning => SPECIALIST_PLANNING,
            Self::Coding => SPECIALIST_CODING,
            Self::Testing => SPECIALIST_TESTING,
            Self::Deployment => SPECIALIST_DEPLOYMENT,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Planning => Phase::Planning,
            Self::Coding => Phase::Coding,
            Self::Testing => Phase::Testing,
            Self::Deployment => Phase::Deployment,
        }
    }

    /// Metadata fields a delegated payload must carry.
    pub fn required_metadata(&self) -> &'static [&'static str] {
        match self {
            Self::Planning => &["objective"],
            Self::Coding => &["objective", "plan"],
            Self::Testing => &["changeset"],
            Self::Deployment => &["test_report"],
        }
    }

    fn artifact_name(&self) -> &'static str {
        gates::required_artifact(self.phase()).unwrap_or("artifact")
    }

    fn file_name(&self) -> &'static str {
        match self {
            Self::Planning => "plan.md",
            Self::Coding => "implementation.md",
            Self::Testing => "test_report.md",
            Self::Deployment => "deployment.md",
        }
    }
}

pub struct SpecialistAgent {
    kind: SpecialistKind,
    chain: Arc<ProviderChain>,
}

impl SpecialistAgent {
    pub fn new(kind: SpecialistKind, chain: Arc<ProviderChain>) -> Self {
        Self { kind, chain }
    }

    async fn ask(
        &self,
        ctx: &AgentContext,
        payload: &DelegationPayload,
        objective: &str,
        prompt: String,
    ) -> Result<ProviderResponse> {
        let request = ProviderRequest::new(prompt).with_metadata(json!({
            "phase": self.kind.phase().as_str(),
            "mission_id": payload.mission_id,
            "objective": objective,
        }));
        let response = self.chain.invoke(&request, ctx.cancel_token()).await?;
        ctx.note_provider(&response.provider);
        if response.degraded {
            tracing::warn!(
                task_id = %ctx.task_id,
                agent = %self.kind.agent_id(),
                "Specialist is working from a degraded response"
            );
        }
        Ok(response)
    }

    async fn plan(
        &self,
        ctx: &AgentContext,
        payload: &DelegationPayload,
        objective: &str,
    ) -> Result<(String, Value)> {
        let response = self
            .ask(ctx, payload, objective, format!("Write a numbered plan for: {}", objective))
            .await?;
        let mut steps = parse_steps(&response.content);
        if steps.is_empty() {
            steps.push(objective.to_string());
        }
        let body = steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect::<Vec<_>>()
            .join("\n");
        Ok((
            format!("# Plan\n\n{}\n", body),
            json!({ "steps": steps, "provider": response.provider, "degraded": response.degraded }),
        ))
    }

    async fn code(
        &self,
        ctx: &AgentContext,
        payload: &DelegationPayload,
        objective: &str,
        path: &Path,
    ) -> Result<(String, Value)> {
        let steps: Vec<String> = payload
            .metadata
            .get("plan")
            .and_then(|plan| plan["attributes"]["steps"].as_array())
            .map(|s| s.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let response = self
            .ask(
                ctx,
                payload,
                objective,
                format!("Implement the plan for: {}\n{}", objective, steps.join("\n")),
            )
            .await?;
        let checklist = steps
            .iter()
            .map(|s| format!("- [x] {}", s))
            .collect::<Vec<_>>()
            .join("\n");
        Ok((
            format!("# Implementation\n\n{}\n\n## Steps\n\n{}\n", response.content, checklist),
            json!({
                "files": [path.display().to_string()],
                "steps": steps.len(),
                "provider": response.provider,
                "degraded": response.degraded,
            }),
        ))
    }

    async fn test(
        &self,
        ctx: &AgentContext,
        payload: &DelegationPayload,
        objective: &str,
    ) -> Result<(String, Value)> {
        let files: Vec<String> = payload
            .metadata
            .get("changeset")
            .and_then(|changeset| changeset["attributes"]["files"].as_array())
            .map(|f| f.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let mut missing = Vec::new();
        for file in &files {
            if !tokio::fs::try_exists(file).await.unwrap_or(false) {
                missing.push(file.clone());
            }
        }
        let passed = !files.is_empty() && missing.is_empty();
        let summary = format!(
            "{} of {} changed files present",
            files.len() - missing.len(),
            files.len()
        );
        let response = self
            .ask(ctx, payload, objective, format!("Report on tests for: {}\n{}", objective, summary))
            .await?;
        Ok((
            format!(
                "# Test report\n\nResult: {}\n{}\n\n{}\n",
                if passed { "PASSED" } else { "FAILED" },
                summary,
                response.content
            ),
            json!({
                "passed": passed,
                "checked": files.len(),
                "missing": missing,
                "summary": summary,
                "provider": response.provider,
            }),
        ))
    }

    async fn deploy(
        &self,
        ctx: &AgentContext,
        payload: &DelegationPayload,
        objective: &str,
    ) -> Result<(String, Value)> {
        let tests_passed = payload
            .metadata
            .get("test_report")
            .and_then(|report| report["attributes"]["passed"].as_bool())
            .unwrap_or(false);
        let response = self
            .ask(ctx, payload, objective, format!("Prepare the release of: {}", objective))
            .await?;
        Ok((
            format!(
                "# Deployment record\n\nTests passed: {}\nStatus: awaiting sign-off\n\n{}\n",
                tests_passed, response.content
            ),
            json!({
                "approved": false,
                "tests_passed": tests_passed,
                "provider": response.provider,
            }),
        ))
    }
}

#[async_trait]
impl Agent for SpecialistAgent {
    fn id(&self) -> &str {
        self.kind.agent_id()
    }

    async fn execute(&self, ctx: &AgentContext, payload: Value) -> Result<Value> {
        let payload = DelegationPayload::from_value(&payload)?;
        let objective = payload
            .metadata
            .get("objective")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("mission {}", payload.mission_id));

        let dir = artifact_dir(&payload.project_root);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RuntimeError::internal(format!("cannot create {}: {}", dir.display(), e)))?;
        let path: PathBuf = dir.join(self.kind.file_name());

        let (document, attributes) = match self.kind {
            SpecialistKind::Planning => self.plan(ctx, &payload, &objective).await?,
            SpecialistKind::Coding => self.code(ctx, &payload, &objective, &path).await?,
            SpecialistKind::Testing => self.test(ctx, &payload, &objective).await?,
            SpecialistKind::Deployment => self.deploy(ctx, &payload, &objective).await?,
        };

        if ctx.is_cancelled() {
            return Err(RuntimeError::Cancelled(format!(
                "{} stopped before writing {}",
                self.kind.agent_id(),
                path.display()
            )));
        }
        tokio::fs::write(&path, document)
            .await
            .map_err(|e| RuntimeError::internal(format!("cannot write {}: {}", path.display(), e)))?;

        tracing::info!(
            task_id = %ctx.task_id,
            agent = %self.kind.agent_id(),
            artifact = %self.kind.artifact_name(),
            path = %path.display(),
            "Specialist wrote artifact"
        );

        let mut artifacts = serde_json::Map::new();
        artifacts.insert(
            self.kind.artifact_name().to_string(),
            json!({ "location": path.display().to_string(), "attributes": attributes }),
        );
        Ok(json!({ "artifacts": artifacts }))
    }
}

/// Steps from a numbered or bulleted list, markers stripped.
fn parse_steps(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| {
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            let rest = if digits > 0 {
                line[digits..].strip_prefix('.').or_else(|| line[digits..].strip_prefix(')'))?
            } else {
                line.strip_prefix("- ").or_else(|| line.strip_prefix("* "))?
            };
            let step = rest.trim();
            (!step.is_empty()).then(|| step.to_string())
        })
        .collect()
}
