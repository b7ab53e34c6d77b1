//! On-disk metadata state of one manager node
//!
//! Every node directory holds a single `meta_state.json` with the last published
//! cluster metadata. The gateway reads these files back after a full restart to
//! elect the metadata the cluster recovers from.

use chrono::{DateTime, Utc};
use cluster_core::Metadata;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const STATE_FILE: &str = "meta_state.json";
const BACKUP_DIR: &str = "backups";
const FORMAT_VERSION: u32 = 1;
/// Older backups are pruned
const MAX_BACKUPS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unsupported state format {found} in {path:?}")]
    UnsupportedFormat { path: PathBuf, found: u32 },
    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

/// Envelope written around the metadata
#[derive(Debug, Serialize, Deserialize)]
struct MetaState {
    format: u32,
    written_at: DateTime<Utc>,
    metadata: Metadata,
}

pub struct FileStorage {
    node_dir: PathBuf,
    state_path: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(node_dir: P) -> Self {
        let node_dir = node_dir.as_ref().to_path_buf();
        let state_path = node_dir.join(STATE_FILE);
        Self { node_dir, state_path }
    }

    /// A missing node directory means the node never ran here
    pub fn exists(&self) -> bool {
        self.node_dir.exists()
    }

    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        if !self.node_dir.exists() {
            fs::create_dir_all(&self.node_dir).await?;
            info!("Created node directory: {:?}", self.node_dir);
        }
        Ok(())
    }

    /// Last persisted metadata; None when nothing was written yet
    pub async fn load(&self) -> Result<Option<Metadata>, StorageError> {
        if !self.state_path.exists() {
            debug!("No metadata state at {:?}", self.state_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.state_path).await?;
        let state: MetaState =
            serde_json::from_str(&content).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if state.format != FORMAT_VERSION {
            return Err(StorageError::UnsupportedFormat {
                path: self.state_path.clone(),
                found: state.format,
            });
        }

        info!(
            "Loaded metadata version {} ({} indices) written at {}",
            state.metadata.version,
            state.metadata.indices.len(),
            state.written_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(Some(state.metadata))
    }

    pub async fn save(&self, metadata: &Metadata) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let state = MetaState {
            format: FORMAT_VERSION,
            written_at: Utc::now(),
            metadata: metadata.clone(),
        };
        let content =
            serde_json::to_string_pretty(&state).map_err(|e| StorageError::Serialization(e.to_string()))?;

        // readers never see a half written file
        let temp_path = self.state_path.with_extension("json.tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.state_path).await?;

        debug!("Persisted metadata version {}", metadata.version);
        Ok(())
    }

    /// Copy the current state file aside, keeping the newest few copies
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let metadata = self
            .load()
            .await?
            .ok_or_else(|| StorageError::NotFound(self.state_path.clone()))?;

        let backup_dir = self.node_dir.join(BACKUP_DIR);
        fs::create_dir_all(&backup_dir).await?;
        let backup_path = backup_dir.join(format!(
            "meta_state_v{}_{}.json",
            metadata.version,
            Utc::now().format("%Y%m%d_%H%M%S%3f")
        ));
        fs::copy(&self.state_path, &backup_path).await?;
        info!("Backed up metadata version {} to {:?}", metadata.version, backup_path);

        self.prune_backups(&backup_dir).await?;
        Ok(backup_path)
    }

    async fn prune_backups(&self, backup_dir: &Path) -> Result<(), StorageError> {
        let mut backups = Vec::new();
        let mut entries = fs::read_dir(backup_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let modified = entry.metadata().await?.modified()?;
            backups.push((modified, entry.path()));
        }
        if backups.len() <= MAX_BACKUPS {
            return Ok(());
        }

        backups.sort();
        let excess = backups.len() - MAX_BACKUPS;
        for (_, path) in backups.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path).await {
                warn!("Failed to prune backup {:?}: {}", path, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::IndexMetadata;

    fn metadata(version: u64) -> Metadata {
        Metadata::builder()
            .version(version)
            .put(IndexMetadata::builder("logs").uuid("u1").build().unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("n1"));
        assert!(!storage.exists());
        assert!(storage.load().await.unwrap().is_none());

        storage.save(&metadata(4)).await.unwrap();
        assert!(storage.exists());
        assert_eq!(storage.load().await.unwrap().unwrap(), metadata(4));

        storage.save(&metadata(5)).await.unwrap();
        assert_eq!(storage.load().await.unwrap().unwrap().version, 5);
    }

    #[tokio::test]
    async fn test_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.save(&metadata(1)).await.unwrap();

        let path = dir.path().join(STATE_FILE);
        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["format"] = serde_json::json!(99);
        std::fs::write(&path, raw.to_string()).unwrap();

        assert!(matches!(
            storage.load().await,
            Err(StorageError::UnsupportedFormat { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_backups_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(matches!(storage.backup().await, Err(StorageError::NotFound(_))));

        for version in 1..=5 {
            storage.save(&metadata(version)).await.unwrap();
            let backup = storage.backup().await.unwrap();
            assert!(backup.exists());
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let kept = std::fs::read_dir(dir.path().join(BACKUP_DIR)).unwrap().count();
        assert_eq!(kept, MAX_BACKUPS);
    }
}
