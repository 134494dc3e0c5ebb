//! Durable snapshots of [`WorkflowState`], keyed by submission id.

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use complyflow_core::WorkflowState;

lazy_static! {
    static ref SUBMISSION_ID: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").unwrap();
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid submission id '{0}'")]
    InvalidId(String),
}

/// Save, load and delete workflow snapshots.
///
/// `save` replaces any previous snapshot for the same submission. A reader
/// sees either the old or the new snapshot, never a mix.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, state: &WorkflowState) -> Result<(), CheckpointError>;

    async fn load(&self, submission_id: &str) -> Result<Option<WorkflowState>, CheckpointError>;

    /// Returns whether a snapshot existed.
    async fn delete(&self, submission_id: &str) -> Result<bool, CheckpointError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    states: RwLock<HashMap<String, WorkflowState>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), CheckpointError> {
        self.states
            .write()
            .insert(state.submission_id().to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, submission_id: &str) -> Result<Option<WorkflowState>, CheckpointError> {
        Ok(self.states.read().get(submission_id).cloned())
    }

    async fn delete(&self, submission_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.states.write().remove(submission_id).is_some())
    }
}

/// One `<submission_id>.json` file per submission under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, submission_id: &str) -> Result<PathBuf, CheckpointError> {
        if !SUBMISSION_ID.is_match(submission_id) {
            return Err(CheckpointError::InvalidId(submission_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", submission_id)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), CheckpointError> {
        let path = self.path_for(state.submission_id())?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(
            submission_id = state.submission_id(),
            status = %state.status(),
            path = %path.display(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, submission_id: &str) -> Result<Option<WorkflowState>, CheckpointError> {
        let path = self.path_for(submission_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, submission_id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(submission_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
