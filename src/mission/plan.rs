//! Which agent runs each work phase.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::phase::{Phase, WORK_PHASES};
use super::MissionError;
use crate::agents::{
    OPERATOR, SPECIALIST_CODING, SPECIALIST_DEPLOYMENT, SPECIALIST_PLANNING, SPECIALIST_TESTING,
};
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseBinding {
    /// Agent the orchestrator submits the phase task to.
    pub agent: String,
    /// Specialist the agent is asked to delegate to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_to: Option<String>,
}

impl PhaseBinding {
    pub fn new(agent: impl Into<String>, delegate_to: Option<&str>) -> Self {
        Self {
            agent: agent.into(),
            delegate_to: delegate_to.map(str::to_string),
        }
    }
}

/// Phase to agent bindings.
///
/// Loaded from YAML of the form:
///
/// ```yaml
/// phases:
///   PLANNING:
///     agent: operator
///     delegate_to: specialist-planning
/// ```
///
/// Phases not named in the file keep their default binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseBinding>,
}

impl Default for PhasePlan {
    fn default() -> Self {
        let mut phases = BTreeMap::new();
        phases.insert(Phase::Initializing, PhaseBinding::new(OPERATOR, None));
        phases.insert(Phase::Planning, PhaseBinding::new(OPERATOR, Some(SPECIALIST_PLANNING)));
        phases.insert(Phase::Coding, PhaseBinding::new(OPERATOR, Some(SPECIALIST_CODING)));
        phases.insert(Phase::Testing, PhaseBinding::new(OPERATOR, Some(SPECIALIST_TESTING)));
        phases.insert(
            Phase::Deployment,
            PhaseBinding::new(OPERATOR, Some(SPECIALIST_DEPLOYMENT)),
        );
        Self { phases }
    }
}

impl PhasePlan {
    pub fn from_yaml_str(raw: &str) -> Result<Self, MissionError> {
        let overrides: PhasePlan =
            serde_yaml::from_str(raw).map_err(|e| MissionError::InvalidPlan(e.to_string()))?;
        let mut plan = Self::default();
        for (phase, binding) in overrides.phases {
            if !phase.is_work_phase() {
                return Err(MissionError::InvalidPlan(format!(
                    "{} is not a work phase",
                    phase
                )));
            }
            plan.phases.insert(phase, binding);
        }
        Ok(plan)
    }

    pub async fn load(path: &Path) -> Result<Self, MissionError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            MissionError::InvalidPlan(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn binding(&self, phase: Phase) -> Option<&PhaseBinding> {
        self.phases.get(&phase)
    }

    /// Every work phase is bound, and every named agent is registered.
    pub fn validate(&self, agents: &AgentRegistry) -> Result<(), MissionError> {
        for phase in WORK_PHASES {
            let binding = self.binding(phase).ok_or_else(|| {
                MissionError::InvalidPlan(format!("no agent bound to {}", phase))
            })?;
            for id in std::iter::once(&binding.agent).chain(binding.delegate_to.iter()) {
                if !agents.contains(id) {
                    return Err(MissionError::InvalidPlan(format!(
                        "{} names unknown agent '{}' (known: {})",
                        phase,
                        id,
                        agents.known_ids().join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}
