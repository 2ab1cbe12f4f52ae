//! The `delegate_task` tool.
//!
//! Lets an agent hand work to another registered agent through the kernel.
//! The tool holds only a weak handle to the kernel: it is built after the
//! kernel during boot and must not keep it alive.
//!
//! Checks run in a fixed order and every rejection happens before a task or
//! ledger entry exists:
//! 1. `agent_id` is a non-empty identifier
//! 2. `payload` carries `mission_id`, `mission_uuid`, `phase`, `project_root`
//!    and a `metadata` object
//! 3. `agent_id` resolves in the live registry (otherwise `NotFound` listing
//!    the known ids)
//! 4. `payload.metadata` has every field the target agent requires

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::mission::Phase;
use crate::registry::{AgentRegistry, Tool, ToolContext};
use crate::task::NewTask;

pub const DELEGATE_TOOL: &str = "delegate_task";
pub const LIST_AGENTS_TOOL: &str = "list_agents";

/// Payload every delegated task carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationPayload {
    pub mission_id: String,
    pub mission_uuid: Uuid,
    pub phase: Phase,
    pub project_root: PathBuf,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DelegationPayload {
    /// Parse and check a raw payload, naming the first bad field.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| RuntimeError::validation("payload must be a JSON object"))?;

        let field = |name: &str| {
            object
                .get(name)
                .filter(|v| !v.is_null())
                .ok_or_else(|| RuntimeError::validation(format!("payload is missing '{}'", name)))
        };

        // Accept numeric mission ids, as callers sometimes send them.
        let mission_id = match field("mission_id")? {
            Value::String(s) if !s.trim().is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => {
                return Err(RuntimeError::validation(
                    "payload field 'mission_id' must be a non-empty string or number",
                ))
            }
        };

        let mission_uuid = field("mission_uuid")?
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                RuntimeError::validation("payload field 'mission_uuid' must be a UUID string")
            })?;

        let phase_raw = field("phase")?;
        let phase = phase_raw.as_str().and_then(Phase::parse).ok_or_else(|| {
            RuntimeError::validation(format!(
                "payload field 'phase' is not a known phase tag: {}",
                phase_raw
            ))
        })?;

        let project_root = field("project_root")?
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                RuntimeError::validation("payload field 'project_root' must be a non-empty path")
            })?;

        let metadata = match object.get("metadata") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(m)) => m.clone(),
            Some(_) => {
                return Err(RuntimeError::validation(
                    "payload field 'metadata' must be an object",
                ))
            }
        };

        Ok(Self {
            mission_id,
            mission_uuid,
            phase,
            project_root,
            metadata,
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "mission_id": self.mission_id,
            "mission_uuid": self.mission_uuid.to_string(),
            "phase": self.phase.as_str(),
            "project_root": self.project_root.display().to_string(),
            "metadata": self.metadata,
        })
    }

    /// First of `fields` absent from `metadata`, if any.
    pub fn missing_metadata<'a>(&self, fields: &'a [String]) -> Option<&'a str> {
        fields
            .iter()
            .find(|f| self.metadata.get(f.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
    }
}

pub struct DelegateTaskTool {
    kernel: Weak<Kernel>,
}

impl DelegateTaskTool {
    pub fn new(kernel: Weak<Kernel>) -> Self {
        Self { kernel }
    }
}

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL
    }

    fn description(&self) -> &str {
        "Submit a task to another registered agent. Returns the new task id and its status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": {
                    "type": "string",
                    "description": "Id of a registered agent (see list_agents)"
                },
                "payload": {
                    "type": "object",
                    "description": "mission_id, mission_uuid, phase, project_root and a metadata object"
                }
            },
            "required": ["agent_id", "payload"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let agent_id = args["agent_id"].as_str().unwrap_or_default().trim();
        if !crate::util::is_identifier(agent_id) {
            return Err(RuntimeError::validation(format!(
                "agent_id must be a non-empty identifier, got '{}'",
                agent_id
            )));
        }

        let payload = DelegationPayload::from_value(&args["payload"])?;

        let kernel = self
            .kernel
            .upgrade()
            .ok_or_else(|| RuntimeError::internal("kernel is no longer running"))?;

        let target = kernel.agents().registration(agent_id).map_err(|e| {
            tracing::warn!(
                caller = %ctx.caller_agent,
                target = %agent_id,
                "Delegation to unregistered agent rejected"
            );
            RuntimeError::from(e)
        })?;

        if let Some(missing) = payload.missing_metadata(&target.required_metadata) {
            return Err(RuntimeError::validation(format!(
                "payload.metadata is missing '{}' required by {}",
                missing, agent_id
            )));
        }

        let task_id = kernel
            .submit_delegated(ctx.caller_task, NewTask::new(agent_id, payload.to_value()))
            .await?;
        let status = kernel
            .task(task_id)
            .await
            .map(|t| t.status().label())
            .unwrap_or("PENDING");

        Ok(json!({
            "task_id": task_id.to_string(),
            "agent_id": agent_id,
            "status": status,
        }))
    }
}

/// Lists the agents that can be delegated to.
pub struct ListAgentsTool {
    agents: Arc<AgentRegistry>,
}

impl ListAgentsTool {
    pub fn new(agents: Arc<AgentRegistry>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        LIST_AGENTS_TOOL
    }

    fn description(&self) -> &str {
        "List registered agents with their role and required metadata."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value> {
        let agents: Vec<Value> = self
            .agents
            .registrations()
            .map(|r| {
                json!({
                    "id": r.id,
                    "role": r.role,
                    "required_metadata": r.required_metadata,
                })
            })
            .collect();
        Ok(json!({ "agents": agents }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, Ledger, LedgerEventKind, SharedLedger};
    use crate::registry::tests::static_registration;
    use crate::registry::{Agent, AgentContext, AgentRegistration, AgentRole, ToolRegistry};
    use crate::task::{TaskId, TaskStatus};

    /// Operator that forwards its payload to `delegate_task`.
    struct Forwarder;

    #[async_trait]
    impl Agent for Forwarder {
        fn id(&self) -> &str {
            "operator"
        }

        async fn execute(&self, ctx: &AgentContext, payload: Value) -> Result<Value> {
            ctx.call_tool(DELEGATE_TOOL, payload).await
        }
    }

    async fn setup() -> (Arc<Kernel>, Arc<InMemoryLedger>) {
        let mut agents = AgentRegistry::new();
        agents.register(
            AgentRegistration::new(
                "operator",
                AgentRole::Operator,
                Arc::new(|| Arc::new(Forwarder) as Arc<dyn Agent>),
            )
            .with_capabilities([DELEGATE_TOOL]),
        );
        agents.register(
            static_registration("specialist-planning", json!({ "plan": [] }))
                .with_required_metadata(["objective"]),
        );
        let ledger = Arc::new(InMemoryLedger::new());
        let shared: SharedLedger = ledger.clone();
        let tools = Arc::new(ToolRegistry::new());
        let kernel = Arc::new(Kernel::new(Arc::new(agents), tools.clone(), shared));
        tools
            .register_tool("operator", Arc::new(DelegateTaskTool::new(Arc::downgrade(&kernel))))
            .await;
        (kernel, ledger)
    }

    fn payload(metadata: Value) -> Value {
        json!({
            "mission_id": 1,
            "mission_uuid": Uuid::new_v4().to_string(),
            "phase": "PLANNING",
            "project_root": "/tmp/project",
            "metadata": metadata,
        })
    }

    fn ctx() -> ToolContext {
        ToolContext {
            caller_task: TaskId::new(),
            caller_agent: "operator".to_string(),
        }
    }

    #[tokio::test]
    async fn unknown_target_lists_known_ids_and_writes_nothing() {
        let (kernel, ledger) = setup().await;
        let err = kernel
            .tools()
            .execute(
                DELEGATE_TOOL,
                json!({ "agent_id": "nonexistent", "payload": payload(json!({})) }),
                &ctx(),
            )
            .await
            .unwrap_err();
        match err {
            RuntimeError::NotFound { kind, id, known } => {
                assert_eq!(kind, "agent");
                assert_eq!(id, "nonexistent");
                assert_eq!(known, vec!["operator", "specialist-planning"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.head().await.unwrap(), 0);
        assert!(kernel.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_blank_agent_id_before_lookup() {
        let (kernel, _) = setup().await;
        let err = kernel
            .tools()
            .execute(
                DELEGATE_TOOL,
                json!({ "agent_id": "  ", "payload": payload(json!({})) }),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(ref m) if m.contains("agent_id")));
    }

    #[tokio::test]
    async fn payload_missing_base_field_is_named() {
        let (kernel, ledger) = setup().await;
        let mut bad = payload(json!({ "objective": "x" }));
        bad.as_object_mut().unwrap().remove("mission_uuid");
        let err = kernel
            .tools()
            .execute(
                DELEGATE_TOOL,
                json!({ "agent_id": "specialist-planning", "payload": bad }),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(ref m) if m.contains("mission_uuid")));
        assert_eq!(ledger.head().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn target_metadata_contract_is_enforced() {
        let (kernel, _) = setup().await;
        let err = kernel
            .tools()
            .execute(
                DELEGATE_TOOL,
                json!({ "agent_id": "specialist-planning", "payload": payload(json!({})) }),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(ref m) if m.contains("'objective'")));
    }

    #[tokio::test]
    async fn operator_delegates_through_kernel() {
        let (kernel, ledger) = setup().await;
        let root = kernel
            .submit(NewTask::new(
                "operator",
                json!({
                    "agent_id": "specialist-planning",
                    "payload": payload(json!({ "objective": "ship it" })),
                }),
            ))
            .await
            .unwrap();

        let tree = kernel.run_tree(root).await.unwrap();
        assert_eq!(tree.len(), 2);
        let child = &tree[1];
        assert_eq!(child.parent_id(), Some(root));
        assert_eq!(child.agent_id(), "specialist-planning");
        assert_eq!(child.status(), &TaskStatus::Succeeded);
        assert_eq!(child.payload()["mission_id"], json!("1"));

        let reply = tree[0].output().unwrap();
        assert_eq!(reply["task_id"], json!(child.id().to_string()));
        assert_eq!(reply["status"], json!("PENDING"));

        let delegated = ledger
            .entries_for(root)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == LedgerEventKind::Delegated)
            .count();
        assert_eq!(delegated, 1);
    }

    #[test]
    fn payload_round_trips_through_value() {
        let raw = payload(json!({ "objective": "x" }));
        let parsed = DelegationPayload::from_value(&raw).unwrap();
        assert_eq!(parsed.phase, Phase::Planning);
        assert_eq!(DelegationPayload::from_value(&parsed.to_value()).unwrap(), parsed);
    }
}
