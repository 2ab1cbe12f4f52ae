//! Drives one mission through its phases.
//!
//! An `Orchestrator` owns its mission's manifest exclusively; every method
//! that can move the phase takes `&mut self`, so two transitions for the same
//! mission are never in flight at once. A transition is prepared on a copy of
//! the manifest and only adopted once the store has saved it, so the manifest
//! held here is always the recorded one. A terminal manifest is archived.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::gates::{GateTable, GateVerdict, MISSION_BRIEF};
use super::manifest::{ArtifactRef, Manifest};
use super::phase::{requestable_targets, Phase};
use super::plan::PhasePlan;
use super::store::SharedManifestStore;
use crate::delegation::DelegationPayload;
use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::task::{NewTask, Task, TaskId, TaskStatus};

/// What every orchestrator in a process shares.
#[derive(Clone)]
pub struct MissionServices {
    pub kernel: Arc<Kernel>,
    pub store: SharedManifestStore,
    pub plan: Arc<PhasePlan>,
    /// Quality gate per phase.
    pub gates: Arc<GateTable>,
    /// Treat "needs approval" gate verdicts as passes.
    pub auto_approve: bool,
}

pub struct Orchestrator {
    services: MissionServices,
    manifest: Manifest,
}

impl Orchestrator {
    /// Create a mission in `INITIALIZING` and persist its manifest.
    ///
    /// Writes the mission brief under `<project_root>/.mission/artifacts/`.
    pub async fn start(
        services: MissionServices,
        description: &str,
        project_root: PathBuf,
    ) -> Result<Self> {
        let description = description.trim();
        if description.is_empty() {
            return Err(RuntimeError::validation("mission description must not be empty"));
        }

        let mut manifest = Manifest::new(description, project_root);
        let dir = manifest.artifact_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RuntimeError::internal(format!("cannot create {}: {}", dir.display(), e)))?;

        let brief_path = dir.join("mission_brief.md");
        let brief = format!(
            "# Mission {}\n\n{}\n\nCreated: {}\n",
            manifest.mission_id,
            description,
            crate::util::now_string()
        );
        tokio::fs::write(&brief_path, brief).await.map_err(|e| {
            RuntimeError::internal(format!("cannot write {}: {}", brief_path.display(), e))
        })?;
        manifest.put_artifact(
            MISSION_BRIEF,
            ArtifactRef::new(
                brief_path.display().to_string(),
                json!({ "description": description }),
            ),
        );

        services.store.save(&manifest).await?;
        tracing::info!(
            mission_id = %manifest.mission_id,
            project_root = %manifest.project_root.display(),
            "Mission started"
        );
        Ok(Self { services, manifest })
    }

    /// Re-open a persisted mission.
    pub async fn resume(services: MissionServices, mission_id: &str) -> Result<Self> {
        match services.store.load(mission_id).await? {
            Some(manifest) => Ok(Self { services, manifest }),
            None => Err(RuntimeError::NotFound {
                kind: "mission",
                id: mission_id.to_string(),
                known: services.store.list().await.unwrap_or_default(),
            }),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn phase(&self) -> Phase {
        self.manifest.phase
    }

    /// Ask to move to `target`.
    ///
    /// `target` must be the declared successor of the recorded phase. The
    /// current phase's gate is evaluated; anything but a pass applies the
    /// verdict (approval pause or failure) and returns `GateFailure`.
    pub async fn request_transition(&mut self, target: Phase) -> Result<Phase> {
        let current = self.manifest.phase;
        let legal = requestable_targets(current, self.manifest.paused_phase);
        if !legal.contains(&target) {
            tracing::warn!(
                mission_id = %self.manifest.mission_id,
                from = %current,
                requested = %target,
                "Rejected illegal transition"
            );
            return Err(illegal(current, target.as_str(), &legal));
        }

        if current == Phase::AwaitingApproval {
            return self.approve("approved by transition request").await;
        }

        let verdict = self.services.gates.evaluate(current, &self.manifest.artifacts);
        let reason = match &verdict {
            GateVerdict::Pass => None,
            GateVerdict::NeedsApproval(r) | GateVerdict::Defect(r) => Some(r.clone()),
        };
        let reached = self
            .apply_verdict(self.manifest.clone(), current, verdict, None)
            .await?;
        match reason {
            Some(reason) if reached != target => Err(RuntimeError::GateFailure {
                phase: current.to_string(),
                reason,
            }),
            _ => Ok(reached),
        }
    }

    /// Run the current phase's task tree, then gate and transition.
    ///
    /// Returns the phase the mission is in afterwards. A mission that is
    /// awaiting approval or terminal is left as is. If the ledger becomes
    /// unavailable the error is returned and the manifest is not touched.
    pub async fn run_phase(&mut self) -> Result<Phase> {
        let phase = self.manifest.phase;
        if !phase.is_work_phase() {
            return Ok(phase);
        }
        let binding = self
            .services
            .plan
            .binding(phase)
            .cloned()
            .ok_or_else(|| RuntimeError::internal(format!("no agent bound to {}", phase)))?;

        let payload = DelegationPayload {
            mission_id: self.manifest.mission_id.clone(),
            mission_uuid: self.manifest.mission_uuid,
            phase,
            project_root: self.manifest.project_root.clone(),
            metadata: self.phase_metadata(binding.delegate_to.as_deref()),
        };

        tracing::info!(
            mission_id = %self.manifest.mission_id,
            phase = %phase,
            agent = %binding.agent,
            "Running phase"
        );
        let kernel = &self.services.kernel;
        let root = kernel
            .submit(NewTask::new(binding.agent.as_str(), payload.to_value()))
            .await?;
        let tree = kernel.run_tree(root).await?;

        let mut next = self.manifest.clone();
        let failures = collect_outputs(&mut next, &tree)?;
        let mut verdict = self.services.gates.evaluate(phase, &next.artifacts);
        if let GateVerdict::Defect(reason) = &verdict {
            if !failures.is_empty() {
                verdict = GateVerdict::Defect(format!("{}; {}", reason, failures.join("; ")));
            }
        }
        self.apply_verdict(next, phase, verdict, Some(root)).await
    }

    /// Run phases until the mission is terminal or waiting for approval.
    pub async fn run_to_end(&mut self) -> Result<Phase> {
        loop {
            let phase = self.run_phase().await?;
            if phase.is_terminal() || phase == Phase::AwaitingApproval {
                return Ok(phase);
            }
        }
    }

    /// Sign off a paused mission; it moves to the paused phase's successor.
    pub async fn approve(&mut self, note: &str) -> Result<Phase> {
        let current = self.manifest.phase;
        if current != Phase::AwaitingApproval {
            return Err(illegal(
                current,
                "APPROVE",
                &requestable_targets(current, self.manifest.paused_phase),
            ));
        }
        let mut next = self.manifest.clone();
        let paused = next
            .paused_phase
            .take()
            .ok_or_else(|| RuntimeError::internal("awaiting approval without a paused phase"))?;
        let to = paused
            .successor()
            .ok_or_else(|| RuntimeError::internal(format!("{} has no successor", paused)))?;
        self.transition(next, to, format!("approved after {}: {}", paused, note), None)
            .await
    }

    /// Refuse a paused mission; it fails.
    pub async fn reject(&mut self, reason: &str) -> Result<Phase> {
        let current = self.manifest.phase;
        if current != Phase::AwaitingApproval {
            return Err(illegal(
                current,
                "REJECT",
                &requestable_targets(current, self.manifest.paused_phase),
            ));
        }
        self.transition(
            self.manifest.clone(),
            Phase::Failed,
            format!("rejected: {}", reason),
            None,
        )
        .await
    }

    fn phase_metadata(&self, delegate_to: Option<&str>) -> Map<String, Value> {
        let mut metadata: Map<String, Value> = self
            .manifest
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        metadata.insert("description".into(), json!(self.manifest.description));
        metadata.insert("objective".into(), json!(self.manifest.description));
        metadata.insert("artifacts".into(), self.manifest.artifacts_value());
        if let Some(target) = delegate_to {
            metadata.insert("delegate_to".into(), json!(target));
        }
        metadata
    }

    async fn apply_verdict(
        &mut self,
        mut next: Manifest,
        phase: Phase,
        verdict: GateVerdict,
        task_id: Option<TaskId>,
    ) -> Result<Phase> {
        let successor = phase
            .successor()
            .ok_or_else(|| RuntimeError::internal(format!("{} has no successor", phase)))?;
        match verdict {
            GateVerdict::Pass => {
                self.transition(next, successor, format!("{} gate passed", phase), task_id)
                    .await
            }
            GateVerdict::NeedsApproval(reason) if self.services.auto_approve => {
                self.transition(next, successor, format!("auto-approved: {}", reason), task_id)
                    .await
            }
            GateVerdict::NeedsApproval(reason) => {
                tracing::warn!(
                    mission_id = %self.manifest.mission_id,
                    phase = %phase,
                    reason = %reason,
                    "Quality gate requires approval"
                );
                next.paused_phase = Some(phase);
                self.transition(next, Phase::AwaitingApproval, reason, task_id)
                    .await
            }
            GateVerdict::Defect(reason) => {
                tracing::warn!(
                    mission_id = %self.manifest.mission_id,
                    phase = %phase,
                    reason = %reason,
                    "Quality gate failed"
                );
                self.transition(next, Phase::Failed, reason, task_id).await
            }
        }
    }

    /// Record `to` on `next`, save it, then adopt it.
    ///
    /// If the save fails the held manifest stays as it was.
    async fn transition(
        &mut self,
        mut next: Manifest,
        to: Phase,
        reason: String,
        task_id: Option<TaskId>,
    ) -> Result<Phase> {
        let from = next.phase;
        next.record_transition(to, reason, task_id);
        self.services.store.save(&next).await?;
        self.manifest = next;
        tracing::info!(
            mission_id = %self.manifest.mission_id,
            from = %from,
            to = %to,
            "Mission phase changed"
        );
        if to.is_terminal() {
            self.services.store.archive(&self.manifest.mission_id).await?;
        }
        Ok(to)
    }
}

/// Merge artifacts reported by succeeded tasks. Returns failure notes.
fn collect_outputs(manifest: &mut Manifest, tree: &[Task]) -> Result<Vec<String>> {
    let mut failures = Vec::new();
    for task in tree {
        match task.status() {
            TaskStatus::Succeeded => {
                let Some(reported) = task.output().and_then(|o| o.get("artifacts")) else {
                    continue;
                };
                let Some(reported) = reported.as_object() else {
                    return Err(RuntimeError::validation(format!(
                        "{} reported artifacts that are not an object",
                        task.agent_id()
                    )));
                };
                for (name, artifact) in reported {
                    let location = artifact["location"].as_str().unwrap_or_default();
                    let attributes = artifact.get("attributes").cloned().unwrap_or(Value::Null);
                    manifest.put_artifact(name.as_str(), ArtifactRef::new(location, attributes));
                }
            }
            TaskStatus::Failed { reason } => {
                failures.push(format!("{} failed: {}", task.agent_id(), reason));
            }
            TaskStatus::Cancelled => {
                failures.push(format!("{} was cancelled", task.agent_id()));
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }
    }
    Ok(failures)
}

fn illegal(from: Phase, requested: &str, legal: &[Phase]) -> RuntimeError {
    RuntimeError::IllegalTransition {
        from: from.to_string(),
        requested: requested.to_string(),
        legal: legal.iter().map(|p| p.to_string()).collect(),
    }
}
