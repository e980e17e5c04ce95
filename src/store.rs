//! Store collaborators: persist variant bytes and clean up previous runs

use crate::{PipelineError, Result, StoredArtifact};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Write `bytes` to `destination`, replacing any previous content.
    async fn write(&self, destination: &Path, bytes: &[u8]) -> Result<StoredArtifact>;

    /// Remove a single artifact. Removing a missing artifact is not an error.
    async fn remove(&self, destination: &Path) -> Result<()>;

    /// Delete every artifact under `root`, returning how many were removed.
    async fn purge(&self, root: &Path) -> Result<usize>;
}

/// Local filesystem store.
#[derive(Debug, Clone, Default)]
pub struct FileStore;

impl FileStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Store for FileStore {
    async fn write(&self, destination: &Path, bytes: &[u8]) -> Result<StoredArtifact> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::store(destination, e))?;
        }

        fs::write(destination, bytes)
            .await
            .map_err(|e| PipelineError::store(destination, e))?;

        Ok(StoredArtifact::new(destination, bytes.len()))
    }

    async fn remove(&self, destination: &Path) -> Result<()> {
        match fs::remove_file(destination).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::store(destination, e)),
        }
    }

    async fn purge(&self, root: &Path) -> Result<usize> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || purge_tree(&root))
            .await
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?
    }
}

/// Remove every file under `root`, then the directories emptied by that.
/// `root` itself is kept.
fn purge_tree(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.map_err(|e| PipelineError::store(root, e))?;
        let path = entry.path();

        if entry.file_type().is_dir() {
            match std::fs::remove_dir(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("Could not remove directory {}: {}", path.display(), e),
            }
        } else {
            std::fs::remove_file(path).map_err(|e| PipelineError::store(path, e))?;
            removed += 1;
        }
    }

    debug!("Purged {} artifacts under {}", removed, root.display());
    Ok(removed)
}

/// In-memory store keyed by destination path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    artifacts: DashMap<PathBuf, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.artifacts.get(path).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.artifacts.contains_key(path)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.artifacts.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn write(&self, destination: &Path, bytes: &[u8]) -> Result<StoredArtifact> {
        self.artifacts.insert(destination.to_path_buf(), bytes.to_vec());
        Ok(StoredArtifact::new(destination, bytes.len()))
    }

    async fn remove(&self, destination: &Path) -> Result<()> {
        self.artifacts.remove(destination);
        Ok(())
    }

    async fn purge(&self, root: &Path) -> Result<usize> {
        let before = self.artifacts.len();
        self.artifacts.retain(|path, _| !path.starts_with(root));
        Ok(before - self.artifacts.len())
    }
}
