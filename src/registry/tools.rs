//! Tool trait and per-agent tool sets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{validate_params, RegistryError};
use crate::error::Result;
use crate::task::TaskId;

/// Who is invoking a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Task whose agent made the call.
    pub caller_task: TaskId,
    pub caller_agent: String,
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool. `args` has already been checked against
    /// [`Tool::parameters_schema`].
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Tools keyed by owning agent, then by tool name.
///
/// Unlike the agent table this one stays writable after boot: kernel-backed
/// tools are attached once the kernel exists.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, BTreeMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `tool` to `owner`'s tool set, replacing any tool of the same name.
    pub async fn register_tool(&self, owner: &str, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        let set = tools.entry(owner.to_string()).or_default();
        if set.insert(name.clone(), tool).is_some() {
            tracing::debug!(agent = %owner, tool = %name, "Replaced tool binding");
        } else {
            tracing::debug!(agent = %owner, tool = %name, "Registered tool");
        }
    }

    /// Tools available to `agent_id`, sorted by name.
    pub async fn tools_for(&self, agent_id: &str) -> Vec<ToolInfo> {
        let tools = self.tools.read().await;
        tools
            .get(agent_id)
            .map(|set| {
                set.values()
                    .map(|t| ToolInfo {
                        name: t.name().to_string(),
                        description: t.description().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up one of `owner`'s tools.
    pub async fn get(&self, owner: &str, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        let tools = self.tools.read().await;
        let set = tools.get(owner);
        match set.and_then(|s| s.get(name)) {
            Some(tool) => Ok(Arc::clone(tool)),
            None => Err(RegistryError::UnknownTool {
                owner: owner.to_string(),
                name: name.to_string(),
                known: set.map(|s| s.keys().cloned().collect()).unwrap_or_default(),
            }),
        }
    }

    /// Validate `args` against the tool's schema, then run it.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value> {
        let tool = self.get(&ctx.caller_agent, name).await?;
        validate_params(name, &tool.parameters_schema(), &args)?;
        tracing::debug!(
            agent = %ctx.caller_agent,
            task_id = %ctx.caller_task,
            tool = %name,
            "Executing tool"
        );
        tool.execute(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Returns its input"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(args)
        }
    }

    fn ctx(agent: &str) -> ToolContext {
        ToolContext {
            caller_task: TaskId::new(),
            caller_agent: agent.to_string(),
        }
    }

    #[tokio::test]
    async fn tools_are_scoped_to_owner() {
        let registry = ToolRegistry::new();
        registry
            .register_tool("operator", Arc::new(Echo { calls: AtomicUsize::new(0) }))
            .await;

        assert_eq!(registry.tools_for("operator").await.len(), 1);
        assert!(registry.tools_for("specialist-coding").await.is_empty());

        let err = registry
            .execute("echo", json!({ "text": "hi" }), &ctx("specialist-coding"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound { kind: "tool", .. }));
    }

    #[tokio::test]
    async fn invalid_params_never_reach_tool_body() {
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        let registry = ToolRegistry::new();
        registry.register_tool("operator", echo.clone()).await;

        let err = registry
            .execute("echo", json!({ "txt": "typo" }), &ctx("operator"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(ref m) if m.contains("'text'")));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);

        let out = registry
            .execute("echo", json!({ "text": "hi" }), &ctx("operator"))
            .await
            .unwrap();
        assert_eq!(out, json!({ "text": "hi" }));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }
}
