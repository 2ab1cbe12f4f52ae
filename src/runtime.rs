//! Two-phase boot.
//!
//! Phase 1 builds everything that does not need a kernel: ledger, provider
//! chain, agents and base tools. Phase 2 builds the kernel, then registers the
//! kernel-dependent `delegate_task` tool into every agent allowed to use it.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{register_builtin, OPERATOR};
use crate::config::{Config, ConfigError};
use crate::delegation::{DelegateTaskTool, ListAgentsTool, DELEGATE_TOOL, LIST_AGENTS_TOOL};
use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::ledger::{create_ledger, Ledger, LedgerBackend};
use crate::mission::{create_manifest_store, GateTable, MissionServices, Orchestrator, PhasePlan};
use crate::registry::{AgentRegistry, ToolRegistry};
use crate::resilience::{HttpProvider, Provider, ProviderChain, TemplateProvider};

/// Which backends the provider chain is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExecutionMode {
    /// Template backend only; no network.
    #[default]
    Offline,
    /// HTTP backend first, template and no-op behind it.
    Live,
}

pub const HTTP_PROVIDER: &str = "http";

/// A booted runtime.
pub struct Runtime {
    config: Config,
    kernel: Arc<Kernel>,
    chain: Arc<ProviderChain>,
    services: MissionServices,
}

impl Runtime {
    pub async fn boot(config: Config, mode: ExecutionMode) -> Result<Self> {
        // Phase 1: everything the kernel depends on.
        tokio::fs::create_dir_all(&config.data_dir).await.map_err(|e| {
            RuntimeError::internal(format!(
                "cannot create data dir {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;
        let ledger = create_ledger(config.ledger_backend, config.data_dir.clone()).await?;
        let chain = Arc::new(build_chain(&config, mode).map_err(config_error)?);

        let mut agents = AgentRegistry::new();
        register_builtin(&mut agents, chain.clone());
        let agents = Arc::new(agents);

        let plan = match &config.phase_plan_path {
            Some(path) => PhasePlan::load(path).await?,
            None => PhasePlan::default(),
        };
        plan.validate(&agents)?;

        let tools = Arc::new(ToolRegistry::new());
        for registration in agents.registrations().filter(|r| r.can_use(LIST_AGENTS_TOOL)) {
            tools
                .register_tool(&registration.id, Arc::new(ListAgentsTool::new(agents.clone())))
                .await;
        }

        // Phase 2: the kernel exists, so kernel-dependent tools can be bound.
        let kernel = Arc::new(Kernel::new(agents.clone(), tools.clone(), ledger.clone()));
        for registration in agents.registrations().filter(|r| r.can_use(DELEGATE_TOOL)) {
            tools
                .register_tool(
                    &registration.id,
                    Arc::new(DelegateTaskTool::new(Arc::downgrade(&kernel))),
                )
                .await;
        }

        let store = create_manifest_store(
            config.ledger_backend != LedgerBackend::Memory,
            config.data_dir.clone(),
        )
        .await?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            ledger = ?config.ledger_backend,
            persistent = ledger.is_persistent(),
            mode = ?mode,
            providers = ?chain.provider_ids(),
            "Runtime booted"
        );

        let services = MissionServices {
            kernel: kernel.clone(),
            store,
            plan: Arc::new(plan),
            gates: Arc::new(GateTable::default()),
            auto_approve: config.auto_approve,
        };
        Ok(Self {
            config,
            kernel,
            chain,
            services,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn chain(&self) -> &Arc<ProviderChain> {
        &self.chain
    }

    pub fn services(&self) -> &MissionServices {
        &self.services
    }

    /// Create a mission owned by a fresh orchestrator.
    pub async fn start_mission(&self, description: &str, project_root: PathBuf) -> Result<Orchestrator> {
        Orchestrator::start(self.services.clone(), description, project_root).await
    }

    pub async fn resume_mission(&self, mission_id: &str) -> Result<Orchestrator> {
        Orchestrator::resume(self.services.clone(), mission_id).await
    }

    /// Start the configured number of kernel workers.
    pub fn spawn_workers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.kernel.spawn_workers(self.config.workers, shutdown)
    }
}

fn build_chain(config: &Config, mode: ExecutionMode) -> std::result::Result<ProviderChain, ConfigError> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    if mode == ExecutionMode::Live {
        let url = config.require_provider_url()?;
        providers.push(Arc::new(HttpProvider::new(
            HTTP_PROVIDER,
            url,
            config.provider.api_key.clone(),
            config.provider.model.clone(),
        )));
    }
    providers.push(Arc::new(TemplateProvider::new()));
    Ok(ProviderChain::new(providers, config.chain))
}

fn config_error(e: ConfigError) -> RuntimeError {
    RuntimeError::validation(e.to_string())
}

/// Agents allowed to delegate, for status output.
pub fn delegating_agents(agents: &AgentRegistry) -> Vec<String> {
    agents
        .registrations()
        .filter(|r| r.can_use(DELEGATE_TOOL))
        .map(|r| r.id.clone())
        .collect()
}
