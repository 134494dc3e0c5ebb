//! Execution ledger: one immutable record per evaluation task.
//!
//! Records are written fire-and-forget through [`LedgerWriter`]; a slow or
//! failing ledger never blocks or fails a task. Nothing on the live path
//! reads the ledger back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use complyflow_core::CategoryKey;

use crate::providers::TokenUsage;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger record could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// One evaluation task, as it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub submission_id: String,
    pub agent_category: CategoryKey,
    pub agent_name: String,
    /// Location string of the evaluated unit.
    pub unit_reference: String,
    pub status: ExecutionStatus,
    pub input_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub token_usage: TokenUsage,
    pub attempts: u32,
    pub cached: bool,
    /// Estimated USD cost of the calls behind this record.
    pub estimated_cost: f64,
}

impl ExecutionRecord {
    /// Whether the record belongs to the given submission.
    pub fn is_for(&self, submission_id: &str) -> bool {
        self.submission_id == submission_id
    }
}

/// Append-only sink for execution records.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    async fn append(&self, record: ExecutionRecord) -> Result<(), LedgerError>;

    /// Records for one submission in append order. Audit use only.
    async fn records(&self, submission_id: &str) -> Result<Vec<ExecutionRecord>, LedgerError>;
}

/// Ledger kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: RwLock<Vec<ExecutionRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn all(&self) -> Vec<ExecutionRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn append(&self, record: ExecutionRecord) -> Result<(), LedgerError> {
        self.records.write().push(record);
        Ok(())
    }

    async fn records(&self, submission_id: &str) -> Result<Vec<ExecutionRecord>, LedgerError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.is_for(submission_id))
            .cloned()
            .collect())
    }
}

/// Ledger stored as one JSON object per line.
#[derive(Debug)]
pub struct JsonlLedger {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ExecutionLedger for JsonlLedger {
    async fn append(&self, record: ExecutionRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        // One writer at a time so lines never interleave.
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn records(&self, submission_id: &str) -> Result<Vec<ExecutionRecord>, LedgerError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let record: ExecutionRecord = serde_json::from_str(line)?;
            if record.is_for(submission_id) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Fire-and-forget front of a ledger.
///
/// `submit` never waits on the ledger. `flush` waits for everything submitted
/// so far; write errors are logged, never returned.
#[derive(Clone)]
pub struct LedgerWriter {
    ledger: Arc<dyn ExecutionLedger>,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl LedgerWriter {
    pub fn new(ledger: Arc<dyn ExecutionLedger>) -> Self {
        Self {
            ledger,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn ExecutionLedger> {
        &self.ledger
    }

    pub fn submit(&self, record: ExecutionRecord) {
        let ledger = self.ledger.clone();
        let handle = tokio::spawn(async move {
            let execution_id = record.execution_id;
            if let Err(e) = ledger.append(record).await {
                tracing::error!(%execution_id, error = %e, "Failed to persist execution record");
            }
        });
        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Writes submitted but not yet known to be finished.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn flush(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.pending.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Ledger write task panicked");
            }
        }
    }
}

impl std::fmt::Debug for LedgerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerWriter")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
