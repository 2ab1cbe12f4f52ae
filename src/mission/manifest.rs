//! The persisted state document of one mission.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::phase::Phase;
use crate::task::TaskId;

/// Opaque pointer to something a phase produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Where the artifact lives (usually a path under the project root).
    pub location: String,
    /// SHA-256 of the artifact's attributes.
    pub digest: String,
    /// Structured facts about the artifact that quality gates inspect.
    #[serde(default)]
    pub attributes: Value,
}

impl ArtifactRef {
    pub fn new(location: impl Into<String>, attributes: Value) -> Self {
        Self {
            location: location.into(),
            digest: crate::util::digest_json(&attributes),
            attributes,
        }
    }
}

/// One entry in a mission's phase history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub reason: String,
    /// Task whose outcome drove the transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub mission_id: String,
    pub mission_uuid: Uuid,
    pub description: String,
    pub project_root: PathBuf,
    pub phase: Phase,
    /// Work phase the mission stopped in while `AWAITING_APPROVAL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_phase: Option<Phase>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRef>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// A fresh manifest in `INITIALIZING`.
    pub fn new(description: impl Into<String>, project_root: PathBuf) -> Self {
        let mission_uuid = Uuid::new_v4();
        let now = Utc::now();
        Self {
            mission_id: mission_uuid.simple().to_string()[..8].to_string(),
            mission_uuid,
            description: description.into(),
            project_root,
            phase: Phase::Initializing,
            paused_phase: None,
            artifacts: BTreeMap::new(),
            metadata: BTreeMap::new(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, appending to the history.
    pub fn record_transition(&mut self, to: Phase, reason: impl Into<String>, task_id: Option<TaskId>) {
        let now = Utc::now();
        self.history.push(TransitionRecord {
            from: self.phase,
            to,
            at: now,
            reason: reason.into(),
            task_id,
        });
        self.phase = to;
        self.updated_at = now;
    }

    pub fn put_artifact(&mut self, name: impl Into<String>, artifact: ArtifactRef) {
        self.artifacts.insert(name.into(), artifact);
        self.updated_at = Utc::now();
    }

    /// Artifacts as JSON, for agent payloads.
    pub fn artifacts_value(&self) -> Value {
        serde_json::to_value(&self.artifacts).unwrap_or(Value::Null)
    }

    /// Directory where built-in agents write their documents.
    pub fn artifact_dir(&self) -> PathBuf {
        artifact_dir(&self.project_root)
    }
}

pub fn artifact_dir(project_root: &std::path::Path) -> PathBuf {
    project_root.join(".mission").join("artifacts")
}
