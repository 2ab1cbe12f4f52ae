//! Built-in agents that drive the default delivery workflow.
//!
//! # Agent Types
//! - **OperatorAgent**: consults the provider chain, then hands the phase to
//!   its specialist through `delegate_task`
//! - **SpecialistAgent**: produces one phase's artifact as a document under
//!   `<project_root>/.mission/artifacts/` and reports it to the orchestrator
//!
//! Agents never hold each other or the kernel; the operator only reaches a
//! specialist through its tools.

mod operator;
mod specialist;

use std::sync::Arc;

pub use operator::OperatorAgent;
pub use specialist::{SpecialistAgent, SpecialistKind};

use crate::delegation::{DELEGATE_TOOL, LIST_AGENTS_TOOL};
use crate::registry::{Agent, AgentRegistration, AgentRegistry, AgentRole};
use crate::resilience::ProviderChain;

pub const OPERATOR: &str = "operator";
pub const SPECIALIST_PLANNING: &str = "specialist-planning";
pub const SPECIALIST_CODING: &str = "specialist-coding";
pub const SPECIALIST_TESTING: &str = "specialist-testing";
pub const SPECIALIST_DEPLOYMENT: &str = "specialist-deployment";

/// Register the operator and the four phase specialists.
pub fn register_builtin(agents: &mut AgentRegistry, chain: Arc<ProviderChain>) {
    let operator_chain = chain.clone();
    agents.register(
        AgentRegistration::new(
            OPERATOR,
            AgentRole::Operator,
            Arc::new(move || Arc::new(OperatorAgent::new(operator_chain.clone())) as Arc<dyn Agent>),
        )
        .with_capabilities([DELEGATE_TOOL, LIST_AGENTS_TOOL]),
    );

    for kind in SpecialistKind::ALL {
        let specialist_chain = chain.clone();
        agents.register(
            AgentRegistration::new(
                kind.agent_id(),
                AgentRole::Specialist,
                Arc::new(move || {
                    Arc::new(SpecialistAgent::new(kind, specialist_chain.clone())) as Arc<dyn Agent>
                }),
            )
            .with_required_metadata(kind.required_metadata().iter().copied()),
        );
    }
}
