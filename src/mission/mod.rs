//! Mission state machine.
//!
//! - `phase`: the phase enum and transition table
//! - `manifest`: the persisted per-mission document
//! - `store`: manifest persistence (file + memory) with archiving
//! - `gates`: pure quality gates over the artifact map
//! - `plan`: phase to agent bindings
//! - `orchestrator`: drives a mission through the kernel

pub mod gates;
mod manifest;
mod orchestrator;
mod phase;
mod plan;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

pub use gates::{evaluate, GateFn, GateTable, GateVerdict};
pub use manifest::{artifact_dir, ArtifactRef, Manifest, TransitionRecord};
pub use orchestrator::{MissionServices, Orchestrator};
pub use phase::{requestable_targets, Phase, WORK_PHASES};
pub use plan::{PhaseBinding, PhasePlan};
pub use store::{FileManifestStore, InMemoryManifestStore, ManifestStore, SharedManifestStore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum MissionError {
    #[error("mission store error: {0}")]
    Store(String),

    #[error("manifest is corrupt: {0}")]
    Corrupt(String),

    #[error("mission '{0}' not found")]
    NotFound(String),

    #[error("invalid phase plan: {0}")]
    InvalidPlan(String),
}

/// Create a manifest store. `persistent == false` keeps manifests in memory.
pub async fn create_manifest_store(
    persistent: bool,
    base_dir: PathBuf,
) -> Result<SharedManifestStore, MissionError> {
    if persistent {
        Ok(Arc::new(FileManifestStore::new(base_dir).await?))
    } else {
        Ok(Arc::new(InMemoryManifestStore::new()))
    }
}
