//! Operator agent: decides, then delegates.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::OPERATOR;
use crate::delegation::{DelegationPayload, DELEGATE_TOOL};
use crate::error::Result;
use crate::registry::{Agent, AgentContext};
use crate::resilience::{ProviderChain, ProviderRequest};

/// Artifacts forwarded to specialists under their own metadata key.
const FORWARDED_ARTIFACTS: [&str; 3] = ["plan", "changeset", "test_report"];

const SYSTEM_PROMPT: &str = "You are the operator of a software delivery mission. \
Summarize how the current phase should be handled in a few sentences.";

/// Runs each phase task the orchestrator submits.
///
/// # Execution Flow
/// 1. Ask the provider chain how to approach the phase
/// 2. If the payload names a `delegate_to` specialist, submit it a task
///    through `delegate_task`, forwarding the artifacts it needs
/// 3. Return the decision and the delegation receipt
pub struct OperatorAgent {
    chain: Arc<ProviderChain>,
}

impl OperatorAgent {
    pub fn new(chain: Arc<ProviderChain>) -> Self {
        Self { chain }
    }

    fn specialist_metadata(payload: &DelegationPayload, guidance: &str) -> Map<String, Value> {
        let mut metadata = Map::new();
        for key in ["objective", "description"] {
            if let Some(value) = payload.metadata.get(key) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        if let Some(artifacts) = payload.metadata.get("artifacts").and_then(Value::as_object) {
            for name in FORWARDED_ARTIFACTS {
                if let Some(artifact) = artifacts.get(name) {
                    metadata.insert(name.to_string(), artifact.clone());
                }
            }
        }
        metadata.insert("guidance".to_string(), json!(guidance));
        metadata
    }
}

#[async_trait]
impl Agent for OperatorAgent {
    fn id(&self) -> &str {
        OPERATOR
    }

    async fn execute(&self, ctx: &AgentContext, payload: Value) -> Result<Value> {
        let payload = DelegationPayload::from_value(&payload)?;
        let objective = payload
            .metadata
            .get("objective")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let request = ProviderRequest::new(format!(
            "Mission {} is in phase {}.\nObjective: {}",
            payload.mission_id, payload.phase, objective
        ))
        .with_system(SYSTEM_PROMPT)
        .with_metadata(json!({
            "mission_id": payload.mission_id,
            "objective": objective,
        }));
        let response = self.chain.invoke(&request, ctx.cancel_token()).await?;
        ctx.note_provider(&response.provider);

        let mut output = json!({
            "phase": payload.phase.as_str(),
            "decision": response.content,
            "provider": response.provider,
            "degraded": response.degraded,
        });

        let Some(target) = payload.metadata.get("delegate_to").and_then(Value::as_str) else {
            tracing::info!(
                task_id = %ctx.task_id,
                mission_id = %payload.mission_id,
                phase = %payload.phase,
                "Operator handled phase without delegation"
            );
            return Ok(output);
        };

        let child = DelegationPayload {
            metadata: Self::specialist_metadata(&payload, &response.content),
            ..payload.clone()
        };
        let receipt = ctx
            .call_tool(
                DELEGATE_TOOL,
                json!({ "agent_id": target, "payload": child.to_value() }),
            )
            .await?;
        tracing::info!(
            task_id = %ctx.task_id,
            mission_id = %payload.mission_id,
            phase = %payload.phase,
            target = %target,
            "Operator delegated phase"
        );
        output["delegated"] = receipt;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{register_builtin, SPECIALIST_PLANNING};
    use crate::delegation::DelegateTaskTool;
    use crate::kernel::Kernel;
    use crate::ledger::{InMemoryLedger, Ledger, LedgerEventKind, SharedLedger};
    use crate::mission::Phase;
    use crate::registry::{AgentRegistry, ToolRegistry};
    use crate::resilience::{ChainConfig, TemplateProvider};
    use crate::task::{NewTask, TaskStatus};
    use uuid::Uuid;

    async fn kernel() -> (Arc<Kernel>, Arc<InMemoryLedger>) {
        let chain = Arc::new(ProviderChain::new(
            vec![Arc::new(TemplateProvider::new())],
            ChainConfig::default(),
        ));
        let mut agents = AgentRegistry::new();
        register_builtin(&mut agents, chain);
        let ledger = Arc::new(InMemoryLedger::new());
        let shared: SharedLedger = ledger.clone();
        let kernel = Arc::new(Kernel::new(
            Arc::new(agents),
            Arc::new(ToolRegistry::new()),
            shared,
        ));
        kernel
            .tools()
            .register_tool(OPERATOR, Arc::new(DelegateTaskTool::new(Arc::downgrade(&kernel))))
            .await;
        (kernel, ledger)
    }

    fn payload(project_root: &std::path::Path, delegate_to: Option<&str>) -> Value {
        let mut metadata = json!({ "objective": "add login", "artifacts": {} });
        if let Some(target) = delegate_to {
            metadata["delegate_to"] = json!(target);
        }
        json!({
            "mission_id": "m1",
            "mission_uuid": Uuid::new_v4().to_string(),
            "phase": Phase::Planning.as_str(),
            "project_root": project_root.display().to_string(),
            "metadata": metadata,
        })
    }

    #[tokio::test]
    async fn delegates_to_named_specialist() {
        let (kernel, ledger) = kernel().await;
        let dir = tempfile::tempdir().unwrap();
        let root = kernel
            .submit(NewTask::new(OPERATOR, payload(dir.path(), Some(SPECIALIST_PLANNING))))
            .await
            .unwrap();

        let tree = kernel.run_tree(root).await.unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.iter().all(|t| t.status() == &TaskStatus::Succeeded));
        assert_eq!(tree[1].agent_id(), SPECIALIST_PLANNING);
        assert_eq!(tree[1].parent_id(), Some(root));

        let operator_out = tree[0].output().unwrap();
        assert_eq!(operator_out["provider"], "template");
        assert_eq!(operator_out["delegated"]["agent_id"], SPECIALIST_PLANNING);

        let kinds: Vec<_> = ledger
            .entries_for(root)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                LedgerEventKind::Submitted,
                LedgerEventKind::Started,
                LedgerEventKind::Delegated,
                LedgerEventKind::Completed
            ]
        );
    }

    #[tokio::test]
    async fn without_target_operator_only_decides() {
        let (kernel, _ledger) = kernel().await;
        let dir = tempfile::tempdir().unwrap();
        let root = kernel
            .submit(NewTask::new(OPERATOR, payload(dir.path(), None)))
            .await
            .unwrap();
        let tree = kernel.run_tree(root).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree[0].output().unwrap().get("delegated").is_none());
    }

    #[tokio::test]
    async fn unknown_target_fails_only_the_operator_task() {
        let (kernel, ledger) = kernel().await;
        let dir = tempfile::tempdir().unwrap();
        let root = kernel
            .submit(NewTask::new(OPERATOR, payload(dir.path(), Some("nonexistent"))))
            .await
            .unwrap();
        let task = kernel.run_to_completion(root).await.unwrap();
        match task.status() {
            TaskStatus::Failed { reason } => assert!(reason.contains("nonexistent")),
            other => panic!("unexpected status: {other}"),
        }
        let entries = ledger.read_since(0).await.unwrap();
        assert!(entries.iter().all(|e| e.task_id == root));
    }
}
