//! Workflow engine: the checkpointed state machine around one submission.
//!
//! ```text
//! initialized → segmenting → dispatching_rules → evaluating → scoring
//!     → awaiting_human_review ──resume──▶ finalized
//! any non-terminal state ──error──▶ failed
//! ```
//!
//! Each step runs on a copy of the last checkpoint. The copy replaces the
//! checkpoint only when the step succeeds, so a failed step leaves nothing
//! of itself behind. `awaiting_human_review` is a real suspend: `run`
//! returns, and `resume` continues from the stored snapshot alone.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use complyflow_core::{
    CategoryKey, ConfigError, DocumentInput, ReviewDecision, ScoreResult, ScoringEngine,
    SegmentError, SegmentMode, Segmenter, TransitionError, WorkflowState, WorkflowStatus,
    WorkflowStep,
};

use crate::checkpoint::{CheckpointError, CheckpointStore, InMemoryCheckpointStore};
use crate::config::RuntimeConfig;
use crate::dispatcher::EvaluationDispatcher;
use crate::evaluator::EvaluatorRegistry;
use crate::ledger::{ExecutionLedger, InMemoryLedger, LedgerWriter};
use crate::repository::{RepositoryError, RuleRepository};
use crate::usage::{LlmUsage, UsageTracker};

/// Run-level failures. Task-level failures never show up here.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Segmentation failed: {0}")]
    Segmentation(#[from] SegmentError),

    #[error("Rule repository failed: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Checkpoint store failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Illegal workflow transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("No rule repository configured")]
    MissingRepository,

    #[error("No evaluator registered for categories {0:?}")]
    MissingEvaluator(Vec<CategoryKey>),

    #[error("Evaluators registered for unknown categories {0:?}")]
    UnknownEvaluator(Vec<CategoryKey>),

    #[error("Submission {0} not found")]
    NotFound(String),

    #[error("Submission {0} has already been started")]
    AlreadyStarted(String),

    #[error("Submission {submission_id} is {status}, not awaiting review")]
    NotAwaitingReview {
        submission_id: String,
        status: WorkflowStatus,
    },

    #[error("Submission {0} has no document left to segment")]
    MissingDocument(String),
}

impl WorkflowError {
    /// Message safe to show end users. Detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            WorkflowError::NotFound(_) => "Submission not found",
            WorkflowError::AlreadyStarted(_) => "Analysis has already been started for this submission",
            WorkflowError::NotAwaitingReview { .. } => "Submission is not awaiting review",
            _ => "Compliance analysis failed. Please try again later.",
        }
    }
}

/// Externally visible status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Analyzing,
    AwaitingReview,
    Analyzed,
    Failed,
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionStatus::Analyzing => "analyzing",
            SubmissionStatus::AwaitingReview => "awaiting_review",
            SubmissionStatus::Analyzed => "analyzed",
            SubmissionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Receives submission status changes (e.g. a submissions table).
#[async_trait]
pub trait SubmissionStatusSink: Send + Sync {
    async fn set_status(&self, submission_id: &str, status: SubmissionStatus);
}

/// Default sink: logs the change.
#[derive(Debug, Default)]
pub struct LoggingStatusSink;

#[async_trait]
impl SubmissionStatusSink for LoggingStatusSink {
    async fn set_status(&self, submission_id: &str, status: SubmissionStatus) {
        tracing::info!(submission_id, status = %status, "Submission status changed");
    }
}

pub struct WorkflowEngine {
    pub(crate) config: RuntimeConfig,
    pub(crate) segmenter: Segmenter,
    pub(crate) scoring: ScoringEngine,
    pub(crate) repository: Arc<dyn RuleRepository>,
    pub(crate) dispatcher: EvaluationDispatcher,
    checkpoints: Arc<dyn CheckpointStore>,
    status_sink: Arc<dyn SubmissionStatusSink>,
    usage: Arc<UsageTracker>,
}

impl WorkflowEngine {
    pub fn builder(config: RuntimeConfig) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn ExecutionLedger> {
        self.dispatcher.ledger().ledger()
    }

    /// Wait for ledger writes still in flight. Runs never wait on the
    /// ledger; call this before reading it back or shutting down.
    pub async fn drain(&self) {
        self.dispatcher.ledger().flush().await;
    }

    /// LLM usage accumulated by this engine's evaluators.
    pub fn usage(&self) -> LlmUsage {
        self.usage.total()
    }

    /// Analyze a document in chunk mode, suspending for review.
    pub async fn run(
        &self,
        submission_id: &str,
        project_id: Option<&str>,
        document: impl Into<DocumentInput>,
    ) -> Result<WorkflowState, WorkflowError> {
        self.run_with_mode(submission_id, project_id, document.into(), SegmentMode::Chunk)
            .await
    }

    /// Returns at `awaiting_human_review`, or with the error that failed the run.
    #[instrument(skip(self, document, mode), fields(mode = %mode))]
    pub async fn run_with_mode(
        &self,
        submission_id: &str,
        project_id: Option<&str>,
        document: DocumentInput,
        mode: SegmentMode,
    ) -> Result<WorkflowState, WorkflowError> {
        if let Some(existing) = self.checkpoints.load(submission_id).await? {
            if existing.status() != WorkflowStatus::Failed {
                return Err(WorkflowError::AlreadyStarted(submission_id.to_string()));
            }
            tracing::info!("Restarting previously failed submission");
        }

        let state = WorkflowState::new(
            submission_id,
            project_id.map(str::to_string),
            document,
            mode,
        );
        self.checkpoints.save(&state).await?;
        self.status_sink
            .set_status(submission_id, SubmissionStatus::Analyzing)
            .await;

        self.drive(state).await
    }

    /// Attach the reviewer's decision and finalize. Resuming a finalized run is a no-op.
    #[instrument(skip(self, decision), fields(action = %decision.action))]
    pub async fn resume(
        &self,
        submission_id: &str,
        decision: ReviewDecision,
    ) -> Result<WorkflowState, WorkflowError> {
        let saved = self.load(submission_id).await?;
        match saved.status() {
            WorkflowStatus::Finalized => {
                tracing::info!("Submission already finalized, ignoring resume");
                return Ok(saved);
            }
            WorkflowStatus::AwaitingHumanReview => {}
            status => {
                return Err(WorkflowError::NotAwaitingReview {
                    submission_id: submission_id.to_string(),
                    status,
                })
            }
        }

        let mut state = saved.clone();
        state.record_feedback(&decision);
        state.transition_to(WorkflowStatus::Finalized)?;
        state.set_pending_step(None);

        if let Err(e) = self.checkpoints.save(&state).await {
            return Err(self.abort(saved, e.into()).await);
        }
        self.status_sink
            .set_status(submission_id, SubmissionStatus::Analyzed)
            .await;
        tracing::info!("Submission finalized");
        Ok(state)
    }

    /// Continue a run from its last checkpoint, e.g. after a crash.
    #[instrument(skip(self))]
    pub async fn recover(&self, submission_id: &str) -> Result<WorkflowState, WorkflowError> {
        let state = self.load(submission_id).await?;
        match state.pending_step() {
            None | Some(WorkflowStep::Review) => Ok(state),
            Some(step) => {
                tracing::info!(step = ?step, status = %state.status(), "Recovering run");
                self.drive(state).await
            }
        }
    }

    pub async fn get_snapshot(
        &self,
        submission_id: &str,
    ) -> Result<Option<WorkflowState>, WorkflowError> {
        Ok(self.checkpoints.load(submission_id).await?)
    }

    /// Score the current snapshot without changing it.
    pub async fn preview(&self, submission_id: &str) -> Result<ScoreResult, WorkflowError> {
        let state = self.load(submission_id).await?;
        Ok(state.preview(&self.scoring))
    }

    /// Drop a submission's checkpoint. Ledger records are kept.
    pub async fn discard(&self, submission_id: &str) -> Result<bool, WorkflowError> {
        Ok(self.checkpoints.delete(submission_id).await?)
    }

    async fn load(&self, submission_id: &str) -> Result<WorkflowState, WorkflowError> {
        self.checkpoints
            .load(submission_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(submission_id.to_string()))
    }

    async fn drive(&self, mut state: WorkflowState) -> Result<WorkflowState, WorkflowError> {
        while let Some(step) = state.pending_step() {
            if step == WorkflowStep::Review {
                break;
            }

            let mut working = state.clone();
            let outcome = match self.execute(&mut working, step).await {
                Ok(()) => self.checkpoints.save(&working).await.map_err(Into::into),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                return Err(self.abort(state, e).await);
            }
            state = working;
        }

        if state.status() == WorkflowStatus::AwaitingHumanReview {
            self.status_sink
                .set_status(state.submission_id(), SubmissionStatus::AwaitingReview)
                .await;
        }
        Ok(state)
    }

    async fn execute(
        &self,
        state: &mut WorkflowState,
        step: WorkflowStep,
    ) -> Result<(), WorkflowError> {
        match step {
            WorkflowStep::Segment => {
                state.transition_to(WorkflowStatus::Segmenting)?;
                let document = state
                    .document()
                    .cloned()
                    .ok_or_else(|| WorkflowError::MissingDocument(state.submission_id().into()))?;
                let units = match &document {
                    DocumentInput::Text(text) => self.segmenter.segment(text, state.segment_mode())?,
                    DocumentInput::Pages(pages) => {
                        self.segmenter.segment_pages(pages, state.segment_mode())?
                    }
                };
                tracing::info!(units = units.len(), "Document segmented");
                state.record_segments(units);
                state.set_pending_step(Some(WorkflowStep::LoadRules));
            }
            WorkflowStep::LoadRules => {
                state.transition_to(WorkflowStatus::DispatchingRules)?;
                let rules = self
                    .repository
                    .get_active_rules(state.project_id())
                    .await?;
                tracing::info!(
                    total_rules = rules.total_rules(),
                    active_categories = rules.active_categories().count(),
                    "Active rules loaded"
                );
                state.set_active_rules(rules);
                state.set_pending_step(Some(WorkflowStep::Evaluate));
            }
            WorkflowStep::Evaluate => {
                state.transition_to(WorkflowStatus::Evaluating)?;
                let report = self
                    .dispatcher
                    .dispatch(
                        state.submission_id(),
                        state.content_units(),
                        state.active_rules(),
                    )
                    .await;
                let summary = report.summary();
                state.extend_violations(report.violations);
                state.record_evaluation(summary, report.assessments);
                state.set_pending_step(Some(WorkflowStep::Score));
            }
            WorkflowStep::Score => {
                state.transition_to(WorkflowStatus::Scoring)?;
                state.rescore(&self.scoring);
                if let Some(scores) = state.scores() {
                    tracing::info!(
                        overall = scores.overall,
                        grade = %scores.grade,
                        status = %scores.status,
                        "Scores computed"
                    );
                }
                state.transition_to(WorkflowStatus::AwaitingHumanReview)?;
                state.set_pending_step(Some(WorkflowStep::Review));
            }
            WorkflowStep::Review => {}
        }
        Ok(())
    }

    /// Fail the last saved state and report the error.
    async fn abort(&self, mut state: WorkflowState, error: WorkflowError) -> WorkflowError {
        tracing::error!(
            submission_id = state.submission_id(),
            status = %state.status(),
            error = %error,
            "Workflow step failed"
        );

        match state.fail(error.to_string()) {
            Ok(()) => {
                if let Err(e) = self.checkpoints.save(&state).await {
                    tracing::error!(error = %e, "Failed to persist failed state");
                }
            }
            Err(e) => tracing::error!(error = %e, "Could not mark workflow failed"),
        }

        self.status_sink
            .set_status(state.submission_id(), SubmissionStatus::Failed)
            .await;
        error
    }
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("evaluators", self.dispatcher.evaluators())
            .finish()
    }
}

/// Builder for [`WorkflowEngine`].
///
/// Only the rule repository is required. Evaluators default to keyword
/// evaluators for every configured category; the ledger and checkpoint
/// store default to in-memory ones.
pub struct WorkflowEngineBuilder {
    config: RuntimeConfig,
    repository: Option<Arc<dyn RuleRepository>>,
    evaluators: Option<EvaluatorRegistry>,
    ledger: Option<Arc<dyn ExecutionLedger>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    status_sink: Option<Arc<dyn SubmissionStatusSink>>,
    usage: Option<Arc<UsageTracker>>,
}

impl WorkflowEngineBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            repository: None,
            evaluators: None,
            ledger: None,
            checkpoints: None,
            status_sink: None,
            usage: None,
        }
    }

    pub fn rule_repository(mut self, repository: Arc<dyn RuleRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn evaluators(mut self, evaluators: EvaluatorRegistry) -> Self {
        self.evaluators = Some(evaluators);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn ExecutionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn status_sink(mut self, sink: Arc<dyn SubmissionStatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Share a tracker with LLM evaluators so `WorkflowEngine::usage` sees their calls.
    pub fn usage_tracker(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine, WorkflowError> {
        self.config.validate()?;

        let repository = self.repository.ok_or(WorkflowError::MissingRepository)?;
        let categories = self.config.scoring.registry();
        let evaluators = self
            .evaluators
            .unwrap_or_else(|| EvaluatorRegistry::keyword(&categories));

        let missing = evaluators.missing(&categories);
        if !missing.is_empty() {
            return Err(WorkflowError::MissingEvaluator(missing));
        }
        let unknown = evaluators.unknown(&categories);
        if !unknown.is_empty() {
            return Err(WorkflowError::UnknownEvaluator(unknown));
        }

        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::new()));
        let dispatcher = EvaluationDispatcher::new(
            evaluators,
            LedgerWriter::new(ledger),
            self.config.dispatch.clone(),
            self.config.evaluation.input_preview_chars,
        );

        Ok(WorkflowEngine {
            segmenter: Segmenter::new(self.config.segmenter.clone())?,
            scoring: ScoringEngine::new(self.config.scoring.clone())?,
            repository,
            dispatcher,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            status_sink: self
                .status_sink
                .unwrap_or_else(|| Arc::new(LoggingStatusSink)),
            usage: self.usage.unwrap_or_default(),
            config: self.config,
        })
    }
}
