//! Workflow checkpoints
//!
//! A checkpoint records where a workflow stands after a durable step
//! boundary. Stores keep only the latest checkpoint per workflow; `save` is an
//! idempotent overwrite.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use crate::error::CheckpointError;

/// Snapshot of workflow progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: String,
    /// Index of the next step to run
    pub step_index: usize,
    pub step_name: String,
    /// Pattern-specific partial state, opaque to the store
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        workflow_id: impl Into<String>,
        step_index: usize,
        step_name: impl Into<String>,
        state: Value,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_index,
            step_name: step_name.into(),
            state,
            created_at: Utc::now(),
        }
    }
}

/// Pluggable checkpoint persistence
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Save (overwrite) the checkpoint of `checkpoint.workflow_id`
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Latest checkpoint of a workflow
    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Forget a workflow
    async fn clear(&self, workflow_id: &str) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store for tests and short-lived processes
pub struct MemoryCheckpointStore {
    checkpoints: tokio::sync::RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut store = self.checkpoints.write().await;
        store.insert(checkpoint.workflow_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let store = self.checkpoints.read().await;
        Ok(store.get(workflow_id).cloned())
    }

    async fn clear(&self, workflow_id: &str) -> Result<(), CheckpointError> {
        let mut store = self.checkpoints.write().await;
        store.remove(workflow_id);
        Ok(())
    }
}

/// File system checkpoint store
///
/// One JSON document per workflow:
/// ```text
/// {root}/
/// ├── {encoded workflow_id}.json
/// └── ...
/// ```
/// Writes go to a temporary sibling and are renamed into place, so a crash
/// mid-write leaves the previous checkpoint readable.
pub struct FileCheckpointStore {
    root: PathBuf,
    /// Serializes writers per checkpoint file
    locks: parking_lot::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!("FileCheckpointStore initialized at {:?}", root);
        Ok(Self {
            root,
            locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Encode a workflow id as a file stem
    ///
    /// Letters, digits, `-` and `_` are kept; every other byte becomes `%XX`.
    /// Distinct ids always get distinct stems.
    fn file_stem(workflow_id: &str) -> String {
        let mut stem = String::with_capacity(workflow_id.len());
        for byte in workflow_id.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => stem.push(byte as char),
                other => stem.push_str(&format!("%{:02X}", other)),
            }
        }
        stem
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::file_stem(workflow_id)))
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    /// Drop the lock entry of `path` unless another writer still holds it
    fn release(&self, path: &Path, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One reference in the map, one held by the caller
        if Arc::strong_count(lock) <= 2 {
            locks.remove(path);
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.workflow_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(checkpoint)?;

        let written = async {
            fs::write(&tmp, content).await?;
            fs::rename(&tmp, &path).await
        }
        .await;
        self.release(&path, &lock);
        written?;

        debug!(
            workflow_id = %checkpoint.workflow_id,
            step = checkpoint.step_index,
            "Saved checkpoint to {:?}",
            path
        );
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(workflow_id);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&content)?;
        // Case-insensitive file systems can still fold two stems together
        if checkpoint.workflow_id != workflow_id {
            return Err(CheckpointError::InvalidData(format!(
                "{:?} holds workflow '{}', expected '{}'",
                path, checkpoint.workflow_id, workflow_id
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn clear(&self, workflow_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(workflow_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let removed = match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        self.release(&path, &lock);
        removed
    }
}
