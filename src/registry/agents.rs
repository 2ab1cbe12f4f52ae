//! Agent trait, execution context and the frozen agent table.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{RegistryError, ToolContext, ToolInfo, ToolRegistry};
use crate::error::Result;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    Operator,
    Specialist,
}

/// Per-execution handle passed to an agent.
pub struct AgentContext {
    pub task_id: TaskId,
    pub agent_id: String,
    pub parent_id: Option<TaskId>,
    cancel: CancellationToken,
    tools: Arc<ToolRegistry>,
    provider: Mutex<Option<String>>,
}

impl AgentContext {
    pub fn new(
        task_id: TaskId,
        agent_id: impl Into<String>,
        parent_id: Option<TaskId>,
        cancel: CancellationToken,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            parent_id,
            cancel,
            tools,
            provider: Mutex::new(None),
        }
    }

    /// Token that fires when the task is asked to stop.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Invoke one of this agent's tools.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let ctx = ToolContext {
            caller_task: self.task_id,
            caller_agent: self.agent_id.clone(),
        };
        self.tools.execute(name, args, &ctx).await
    }

    pub async fn tools(&self) -> Vec<ToolInfo> {
        self.tools.tools_for(&self.agent_id).await
    }

    /// Remember which backend answered, for the ledger's metrics.
    pub fn note_provider(&self, provider: &str) {
        if let Ok(mut slot) = self.provider.lock() {
            *slot = Some(provider.to_string());
        }
    }

    pub fn provider(&self) -> Option<String> {
        self.provider.lock().ok().and_then(|slot| slot.clone())
    }
}

/// An executable capability.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Run against `payload`. The returned value becomes the task's output.
    async fn execute(&self, ctx: &AgentContext, payload: Value) -> Result<Value>;
}

/// Builds an agent instance on resolution.
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

/// Everything the registry knows about one agent id.
#[derive(Clone)]
pub struct AgentRegistration {
    pub id: String,
    pub role: AgentRole,
    /// Names of tools the agent may invoke.
    pub capabilities: Vec<String>,
    /// Metadata fields a delegated payload must carry for this agent.
    pub required_metadata: Vec<String>,
    factory: AgentFactory,
}

impl AgentRegistration {
    pub fn new(id: impl Into<String>, role: AgentRole, factory: AgentFactory) -> Self {
        Self {
            id: id.into(),
            role,
            capabilities: Vec::new(),
            required_metadata: Vec::new(),
            factory,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_metadata<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_metadata = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn can_use(&self, tool: &str) -> bool {
        self.capabilities.iter().any(|c| c == tool)
    }

    pub fn instantiate(&self) -> Arc<dyn Agent> {
        (self.factory)()
    }
}

impl std::fmt::Debug for AgentRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistration")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("capabilities", &self.capabilities)
            .field("required_metadata", &self.required_metadata)
            .finish()
    }
}

/// Agent table. Mutable while booting, then shared read-only.
#[derive(Default, Debug)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentRegistration>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `registration.id`. Re-registering an id replaces the old binding.
    pub fn register(&mut self, registration: AgentRegistration) {
        let id = registration.id.clone();
        if self.agents.insert(id.clone(), registration).is_some() {
            tracing::debug!(agent = %id, "Replaced agent binding");
        } else {
            tracing::debug!(agent = %id, "Registered agent");
        }
    }

    pub fn registration(&self, id: &str) -> Result<&AgentRegistration, RegistryError> {
        self.agents.get(id).ok_or_else(|| RegistryError::UnknownAgent {
            id: id.to_string(),
            known: self.known_ids(),
        })
    }

    /// Instantiate the agent bound to exactly `id`.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Agent>, RegistryError> {
        self.registration(id).map(AgentRegistration::instantiate)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Registered ids in sorted order.
    pub fn known_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn registrations(&self) -> impl Iterator<Item = &AgentRegistration> {
        self.agents.values()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Agent that returns a fixed value, for registry and kernel tests.
    pub(crate) struct StaticAgent {
        pub id: String,
        pub output: Value,
    }

    #[async_trait]
    impl Agent for StaticAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _ctx: &AgentContext, _payload: Value) -> Result<Value> {
            Ok(self.output.clone())
        }
    }

    pub(crate) fn static_registration(id: &str, output: Value) -> AgentRegistration {
        let agent_id = id.to_string();
        AgentRegistration::new(
            id,
            AgentRole::Specialist,
            Arc::new(move || {
                Arc::new(StaticAgent {
                    id: agent_id.clone(),
                    output: output.clone(),
                }) as Arc<dyn Agent>
            }),
        )
    }

    #[test]
    fn resolve_is_exact_match() {
        let mut registry = AgentRegistry::new();
        registry.register(static_registration("specialist-planning", json!({})));

        assert!(registry.resolve("specialist-planning").is_ok());
        let err = registry.resolve("Specialist-Planning").err().unwrap();
        match err {
            RegistryError::UnknownAgent { id, known } => {
                assert_eq!(id, "Specialist-Planning");
                assert_eq!(known, vec!["specialist-planning".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reregistration_replaces_binding() {
        let mut registry = AgentRegistry::new();
        registry.register(static_registration("a", json!(1)));
        registry.register(
            static_registration("a", json!(2)).with_required_metadata(["objective"]),
        );
        assert_eq!(registry.known_ids(), vec!["a".to_string()]);
        assert_eq!(
            registry.registration("a").unwrap().required_metadata,
            vec!["objective".to_string()]
        );
    }

    #[test]
    fn capabilities_gate_tool_use() {
        let reg = static_registration("operator", json!({})).with_capabilities(["delegate_task"]);
        assert!(reg.can_use("delegate_task"));
        assert!(!reg.can_use("rm_rf"));
    }
}
