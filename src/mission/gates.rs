//! Quality gates: pure checks over a mission's artifact map.
//!
//! A gate never touches the filesystem or the manifest; it only reads the
//! artifact attributes the agents reported, so it can be re-run at will.

use std::collections::BTreeMap;

use serde_json::Value;

use super::manifest::ArtifactRef;
use super::phase::Phase;

pub const MISSION_BRIEF: &str = "mission_brief";
pub const PLAN: &str = "plan";
pub const CHANGESET: &str = "changeset";
pub const TEST_REPORT: &str = "test_report";
pub const DEPLOYMENT_RECORD: &str = "deployment_record";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    /// Artifacts are well formed but a human has to sign off.
    NeedsApproval(String),
    /// Required artifact missing or malformed. Unrecoverable.
    Defect(String),
}

impl GateVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Artifact the gate of `phase` inspects.
pub fn required_artifact(phase: Phase) -> Option<&'static str> {
    match phase {
        Phase::Initializing => Some(MISSION_BRIEF),
        Phase::Planning => Some(PLAN),
        Phase::Coding => Some(CHANGESET),
        Phase::Testing => Some(TEST_REPORT),
        Phase::Deployment => Some(DEPLOYMENT_RECORD),
        Phase::Maintenance | Phase::AwaitingApproval | Phase::Failed => None,
    }
}

/// A quality gate: a pure check over the artifact map.
pub type GateFn = fn(&BTreeMap<String, ArtifactRef>) -> GateVerdict;

/// The gate registered for each phase.
#[derive(Debug, Clone)]
pub struct GateTable {
    gates: BTreeMap<Phase, GateFn>,
}

impl Default for GateTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(Phase::Initializing, brief_gate);
        table.register(Phase::Planning, plan_gate);
        table.register(Phase::Coding, changeset_gate);
        table.register(Phase::Testing, test_report_gate);
        table.register(Phase::Deployment, deployment_gate);
        table
    }
}

impl GateTable {
    pub fn empty() -> Self {
        Self {
            gates: BTreeMap::new(),
        }
    }

    /// Register `gate` for `phase`, replacing any earlier one.
    pub fn register(&mut self, phase: Phase, gate: GateFn) {
        self.gates.insert(phase, gate);
    }

    pub fn gate(&self, phase: Phase) -> Option<GateFn> {
        self.gates.get(&phase).copied()
    }

    /// Evaluate the gate registered for `phase`. A phase without one is a defect.
    pub fn evaluate(&self, phase: Phase, artifacts: &BTreeMap<String, ArtifactRef>) -> GateVerdict {
        match self.gate(phase) {
            Some(gate) => gate(artifacts),
            None => GateVerdict::Defect(format!("{} has no quality gate", phase)),
        }
    }
}

/// Evaluate the default gate for `phase`.
pub fn evaluate(phase: Phase, artifacts: &BTreeMap<String, ArtifactRef>) -> GateVerdict {
    GateTable::default().evaluate(phase, artifacts)
}

/// Attributes of a required artifact, or the defect explaining why it is unusable.
fn attributes<'a>(
    artifacts: &'a BTreeMap<String, ArtifactRef>,
    name: &str,
) -> Result<&'a Value, GateVerdict> {
    let Some(artifact) = artifacts.get(name) else {
        return Err(GateVerdict::Defect(format!("required artifact '{}' is missing", name)));
    };
    if artifact.location.trim().is_empty() {
        return Err(GateVerdict::Defect(format!("artifact '{}' has no location", name)));
    }
    Ok(&artifact.attributes)
}

pub fn brief_gate(artifacts: &BTreeMap<String, ArtifactRef>) -> GateVerdict {
    let attrs = match attributes(artifacts, MISSION_BRIEF) {
        Ok(attrs) => attrs,
        Err(verdict) => return verdict,
    };
    match attrs.get("description").and_then(Value::as_str) {
        Some(d) if !d.trim().is_empty() => GateVerdict::Pass,
        _ => GateVerdict::Defect("mission brief has no description".to_string()),
    }
}

pub fn plan_gate(artifacts: &BTreeMap<String, ArtifactRef>) -> GateVerdict {
    match attributes(artifacts, PLAN) {
        Ok(attrs) => non_empty_array(attrs, "steps", PLAN),
        Err(verdict) => verdict,
    }
}

pub fn changeset_gate(artifacts: &BTreeMap<String, ArtifactRef>) -> GateVerdict {
    match attributes(artifacts, CHANGESET) {
        Ok(attrs) => non_empty_array(attrs, "files", CHANGESET),
        Err(verdict) => verdict,
    }
}

/// Failing tests are a judgement call, not a defect.
pub fn test_report_gate(artifacts: &BTreeMap<String, ArtifactRef>) -> GateVerdict {
    let attrs = match attributes(artifacts, TEST_REPORT) {
        Ok(attrs) => attrs,
        Err(verdict) => return verdict,
    };
    match attrs.get("passed").and_then(Value::as_bool) {
        Some(true) => GateVerdict::Pass,
        Some(false) => GateVerdict::NeedsApproval(format!(
            "test report records failures: {}",
            attrs.get("summary").and_then(Value::as_str).unwrap_or("no summary")
        )),
        None => GateVerdict::Defect("test report has no boolean 'passed'".to_string()),
    }
}

pub fn deployment_gate(artifacts: &BTreeMap<String, ArtifactRef>) -> GateVerdict {
    match attributes(artifacts, DEPLOYMENT_RECORD) {
        Ok(attrs) => match attrs.get("approved").and_then(Value::as_bool) {
            Some(true) => GateVerdict::Pass,
            _ => GateVerdict::NeedsApproval("deployment requires sign-off".to_string()),
        },
        Err(verdict) => verdict,
    }
}

fn non_empty_array(attrs: &Value, field: &str, artifact: &str) -> GateVerdict {
    match attrs.get(field).and_then(Value::as_array) {
        Some(items) if !items.is_empty() => GateVerdict::Pass,
        Some(_) => GateVerdict::Defect(format!("artifact '{}' lists no {}", artifact, field)),
        None => GateVerdict::Defect(format!(
            "artifact '{}' is missing array field '{}'",
            artifact, field
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with(name: &str, attributes: Value) -> BTreeMap<String, ArtifactRef> {
        let mut map = BTreeMap::new();
        map.insert(name.to_string(), ArtifactRef::new(format!("{}.md", name), attributes));
        map
    }

    #[test]
    fn missing_artifact_is_a_defect() {
        let verdict = evaluate(Phase::Planning, &BTreeMap::new());
        assert_eq!(
            verdict,
            GateVerdict::Defect("required artifact 'plan' is missing".to_string())
        );
    }

    #[test]
    fn plan_needs_steps() {
        assert!(evaluate(Phase::Planning, &with(PLAN, json!({ "steps": ["a", "b"] }))).is_pass());
        assert!(matches!(
            evaluate(Phase::Planning, &with(PLAN, json!({ "steps": [] }))),
            GateVerdict::Defect(_)
        ));
        assert!(matches!(
            evaluate(Phase::Planning, &with(PLAN, json!({ "steps": "a" }))),
            GateVerdict::Defect(_)
        ));
    }

    #[test]
    fn failing_tests_ask_for_approval() {
        let artifacts = with(TEST_REPORT, json!({ "passed": false, "summary": "1 missing" }));
        assert_eq!(
            evaluate(Phase::Testing, &artifacts),
            GateVerdict::NeedsApproval("test report records failures: 1 missing".to_string())
        );
        assert!(evaluate(Phase::Testing, &with(TEST_REPORT, json!({ "passed": true }))).is_pass());
        assert!(matches!(
            evaluate(Phase::Testing, &with(TEST_REPORT, json!({}))),
            GateVerdict::Defect(_)
        ));
    }

    #[test]
    fn deployment_waits_for_sign_off() {
        assert!(matches!(
            evaluate(Phase::Deployment, &with(DEPLOYMENT_RECORD, json!({ "approved": false }))),
            GateVerdict::NeedsApproval(_)
        ));
        assert!(evaluate(Phase::Deployment, &with(DEPLOYMENT_RECORD, json!({ "approved": true }))).is_pass());
    }

    #[test]
    fn registered_gate_replaces_default() {
        fn always_pass(_: &BTreeMap<String, ArtifactRef>) -> GateVerdict {
            GateVerdict::Pass
        }

        let mut table = GateTable::default();
        assert!(matches!(table.evaluate(Phase::Coding, &BTreeMap::new()), GateVerdict::Defect(_)));
        table.register(Phase::Coding, always_pass);
        assert!(table.evaluate(Phase::Coding, &BTreeMap::new()).is_pass());

        assert_eq!(
            GateTable::empty().evaluate(Phase::Planning, &with(PLAN, json!({ "steps": ["a"] }))),
            GateVerdict::Defect("PLANNING has no quality gate".to_string())
        );
    }

    #[test]
    fn gates_are_repeatable() {
        let artifacts = with(MISSION_BRIEF, json!({ "description": "add login" }));
        assert_eq!(evaluate(Phase::Initializing, &artifacts), evaluate(Phase::Initializing, &artifacts));
        assert!(evaluate(Phase::Initializing, &artifacts).is_pass());
        assert!(matches!(evaluate(Phase::Maintenance, &artifacts), GateVerdict::Defect(_)));
    }
}
