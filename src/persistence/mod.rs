//! Persistence hooks for surviving process restarts.
//!
//! The engine calls [`PersistenceHook::persist`] after every node completion
//! and [`PersistenceHook::recover`] once at the start of each execution.
//! Hook failures are logged by the engine but never fail the execution.

use crate::error::{FlowError, FlowResult};
use crate::state::StateSnapshot;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Consumer-supplied persistence backend
#[async_trait]
pub trait PersistenceHook: Send + Sync {
    /// Store a by-value snapshot of the execution state and metadata
    async fn persist(&self, workflow_id: &str, snapshot: StateSnapshot) -> FlowResult<()>;

    /// Load the last persisted snapshot for a workflow, if one exists
    async fn recover(&self, workflow_id: &str) -> FlowResult<Option<StateSnapshot>>;
}

/// In-memory persistence for tests and development
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshots: RwLock<HashMap<String, StateSnapshot>>,
}

impl MemoryPersistence {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

#[async_trait]
impl PersistenceHook for MemoryPersistence {
    async fn persist(&self, workflow_id: &str, snapshot: StateSnapshot) -> FlowResult<()> {
        self.snapshots
            .write()
            .insert(workflow_id.to_string(), snapshot);

        tracing::debug!(workflow_id = %workflow_id, "Persisted snapshot to memory");
        Ok(())
    }

    async fn recover(&self, workflow_id: &str) -> FlowResult<Option<StateSnapshot>> {
        Ok(self.snapshots.read().get(workflow_id).cloned())
    }
}

/// File-based persistence: one JSON file per workflow id
#[derive(Debug, Clone)]
pub struct FilePersistence {
    directory: PathBuf,
}

impl FilePersistence {
    /// Create a store rooted at the given directory
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    fn snapshot_path(&self, workflow_id: &str) -> PathBuf {
        self.directory.join(format!("{workflow_id}.json"))
    }

    async fn ensure_directory(&self) -> FlowResult<()> {
        if !self.directory.exists() {
            fs::create_dir_all(&self.directory).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceHook for FilePersistence {
    async fn persist(&self, workflow_id: &str, snapshot: StateSnapshot) -> FlowResult<()> {
        self.ensure_directory().await?;

        let path = self.snapshot_path(workflow_id);
        let json_data = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&path, json_data)
            .await
            .map_err(|e| FlowError::Persistence(format!("write {}: {e}", path.display())))?;

        tracing::debug!(
            workflow_id = %workflow_id,
            path = %path.display(),
            "Persisted snapshot"
        );
        Ok(())
    }

    async fn recover(&self, workflow_id: &str) -> FlowResult<Option<StateSnapshot>> {
        let path = self.snapshot_path(workflow_id);
        if !path.exists() {
            return Ok(None);
        }

        let json_data = fs::read_to_string(&path)
            .await
            .map_err(|e| FlowError::Persistence(format!("read {}: {e}", path.display())))?;
        let snapshot: StateSnapshot = serde_json::from_str(&json_data)?;

        tracing::debug!(
            workflow_id = %workflow_id,
            path = %path.display(),
            "Recovered snapshot"
        );
        Ok(Some(snapshot))
    }
}
