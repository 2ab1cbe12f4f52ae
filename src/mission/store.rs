//! Manifest persistence.
//!
//! One JSON document per mission, rewritten wholesale on every transition.
//! Terminal missions are moved to `archive/`; nothing is ever deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::manifest::Manifest;
use super::MissionError;
use crate::util::sanitize_filename;

/// Manifest store trait - implemented by all storage backends.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Write the whole manifest.
    async fn save(&self, manifest: &Manifest) -> Result<(), MissionError>;

    /// Read a manifest, live or archived.
    async fn load(&self, mission_id: &str) -> Result<Option<Manifest>, MissionError>;

    /// Move a manifest out of the live set. Idempotent.
    async fn archive(&self, mission_id: &str) -> Result<(), MissionError>;

    async fn is_archived(&self, mission_id: &str) -> Result<bool, MissionError>;

    /// Ids of all known missions, live and archived, sorted.
    async fn list(&self) -> Result<Vec<String>, MissionError>;
}

pub type SharedManifestStore = Arc<dyn ManifestStore>;

/// JSON file per mission under `<base>/missions/`.
#[derive(Clone)]
pub struct FileManifestStore {
    live_dir: PathBuf,
    archive_dir: PathBuf,
    persist_lock: Arc<Mutex<()>>,
}

impl FileManifestStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, MissionError> {
        let live_dir = base_dir.join("missions");
        let archive_dir = live_dir.join("archive");
        fs::create_dir_all(&archive_dir)
            .await
            .map_err(|e| MissionError::Store(format!("Failed to create mission store dir: {}", e)))?;
        Ok(Self {
            live_dir,
            archive_dir,
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    fn file_name(mission_id: &str) -> String {
        format!("{}.json", sanitize_filename(mission_id))
    }

    fn live_path(&self, mission_id: &str) -> PathBuf {
        self.live_dir.join(Self::file_name(mission_id))
    }

    fn archive_path(&self, mission_id: &str) -> PathBuf {
        self.archive_dir.join(Self::file_name(mission_id))
    }

    async fn read(path: &Path) -> Result<Option<Manifest>, MissionError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<Manifest>(&bytes)
                .map(Some)
                .map_err(|e| MissionError::Corrupt(format!("{}: {}", path.display(), e))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(MissionError::Store(format!(
                "Failed to read manifest {}: {}",
                path.display(),
                err
            ))),
        }
    }

    async fn ids_in(dir: &Path) -> Result<Vec<String>, MissionError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| MissionError::Store(format!("Failed to list {}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MissionError::Store(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl ManifestStore for FileManifestStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn save(&self, manifest: &Manifest) -> Result<(), MissionError> {
        let _guard = self.persist_lock.lock().await;
        let archived = self.archive_path(&manifest.mission_id);
        let path = if fs::try_exists(&archived).await.unwrap_or(false) {
            archived
        } else {
            self.live_path(&manifest.mission_id)
        };

        let data = serde_json::to_vec_pretty(manifest)
            .map_err(|e| MissionError::Store(format!("Failed to serialize manifest: {}", e)))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| MissionError::Store(format!("Failed to write manifest: {}", e)))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| MissionError::Store(format!("Failed to finalize manifest: {}", e)))?;
        Ok(())
    }

    async fn load(&self, mission_id: &str) -> Result<Option<Manifest>, MissionError> {
        if let Some(manifest) = Self::read(&self.live_path(mission_id)).await? {
            return Ok(Some(manifest));
        }
        Self::read(&self.archive_path(mission_id)).await
    }

    async fn archive(&self, mission_id: &str) -> Result<(), MissionError> {
        let _guard = self.persist_lock.lock().await;
        let live = self.live_path(mission_id);
        let archived = self.archive_path(mission_id);
        match fs::rename(&live, &archived).await {
            Ok(()) => {
                tracing::info!(mission_id = %mission_id, "Archived mission manifest");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if fs::try_exists(&archived).await.unwrap_or(false) {
                    Ok(())
                } else {
                    Err(MissionError::NotFound(mission_id.to_string()))
                }
            }
            Err(err) => Err(MissionError::Store(format!(
                "Failed to archive manifest {}: {}",
                mission_id, err
            ))),
        }
    }

    async fn is_archived(&self, mission_id: &str) -> Result<bool, MissionError> {
        fs::try_exists(self.archive_path(mission_id))
            .await
            .map_err(|e| MissionError::Store(e.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, MissionError> {
        let mut ids = Self::ids_in(&self.live_dir).await?;
        ids.extend(Self::ids_in(&self.archive_dir).await?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// In-memory manifest store (non-persistent).
#[derive(Clone, Default)]
pub struct InMemoryManifestStore {
    manifests: Arc<RwLock<HashMap<String, (Manifest, bool)>>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn save(&self, manifest: &Manifest) -> Result<(), MissionError> {
        let mut manifests = self.manifests.write().await;
        let archived = manifests
            .get(&manifest.mission_id)
            .map(|(_, archived)| *archived)
            .unwrap_or(false);
        manifests.insert(manifest.mission_id.clone(), (manifest.clone(), archived));
        Ok(())
    }

    async fn load(&self, mission_id: &str) -> Result<Option<Manifest>, MissionError> {
        Ok(self
            .manifests
            .read()
            .await
            .get(mission_id)
            .map(|(m, _)| m.clone()))
    }

    async fn archive(&self, mission_id: &str) -> Result<(), MissionError> {
        let mut manifests = self.manifests.write().await;
        match manifests.get_mut(mission_id) {
            Some((_, archived)) => {
                *archived = true;
                Ok(())
            }
            None => Err(MissionError::NotFound(mission_id.to_string())),
        }
    }

    async fn is_archived(&self, mission_id: &str) -> Result<bool, MissionError> {
        Ok(self
            .manifests
            .read()
            .await
            .get(mission_id)
            .map(|(_, archived)| *archived)
            .unwrap_or(false))
    }

    async fn list(&self) -> Result<Vec<String>, MissionError> {
        let mut ids: Vec<String> = self.manifests.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::manifest::ArtifactRef;
    use crate::mission::phase::Phase;
    use serde_json::json;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new("add login", PathBuf::from("/tmp/project"));
        manifest.put_artifact("mission_brief", ArtifactRef::new("brief.md", json!({ "description": "add login" })));
        manifest.record_transition(Phase::Planning, "gate passed", None);
        manifest
    }

    async fn exercise(store: &dyn ManifestStore) {
        let manifest = sample();
        store.save(&manifest).await.unwrap();
        let loaded = store.load(&manifest.mission_id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, manifest.phase);
        assert_eq!(loaded.artifacts, manifest.artifacts);
        assert_eq!(loaded.history, manifest.history);
        assert!(store.load("missing").await.unwrap().is_none());

        store.archive(&manifest.mission_id).await.unwrap();
        store.archive(&manifest.mission_id).await.unwrap();
        assert!(store.is_archived(&manifest.mission_id).await.unwrap());
        let archived = store.load(&manifest.mission_id).await.unwrap().unwrap();
        assert_eq!(archived, manifest);
        assert_eq!(store.list().await.unwrap(), vec![manifest.mission_id.clone()]);

        assert!(matches!(
            store.archive("missing").await,
            Err(MissionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_store_conformance() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileManifestStore::new(dir.path().to_path_buf()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn memory_store_conformance() {
        exercise(&InMemoryManifestStore::new()).await;
    }

    #[tokio::test]
    async fn archived_manifest_stays_single_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileManifestStore::new(dir.path().to_path_buf()).await.unwrap();
        let mut manifest = sample();
        store.save(&manifest).await.unwrap();
        store.archive(&manifest.mission_id).await.unwrap();

        manifest.record_transition(Phase::Failed, "late update", None);
        store.save(&manifest).await.unwrap();

        assert!(!store.live_path(&manifest.mission_id).exists());
        let loaded = store.load(&manifest.mission_id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn corrupt_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileManifestStore::new(dir.path().to_path_buf()).await.unwrap();
        std::fs::write(store.live_path("broken"), b"{ not json").unwrap();
        assert!(matches!(store.load("broken").await, Err(MissionError::Corrupt(_))));
    }
}
