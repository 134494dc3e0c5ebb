//! # complyflow-runtime
//!
//! Async workflow engine for compliance analysis.
//!
//! A submission goes through segmentation, rule loading, parallel
//! per-category evaluation, scoring and a human review pause. Every step
//! is checkpointed, so a run can be resumed by a different process.
//!
//! The deterministic parts (segmentation, rule grouping, scoring, the
//! state record) live in `complyflow-core`. This crate adds everything
//! that waits on something: evaluators and LLM providers, the dispatcher,
//! the execution ledger, checkpoint stores and rule repositories.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use complyflow_runtime::{RuntimeConfig, WorkflowEngine, YamlRuleRepository};
//! use complyflow_core::ReviewDecision;
//!
//! let config = RuntimeConfig::from_file("complyflow.yaml")?;
//! let rules = YamlRuleRepository::new("rules.yaml", config.scoring.registry());
//! let engine = WorkflowEngine::builder(config)
//!     .rule_repository(Arc::new(rules))
//!     .build()?;
//!
//! let state = engine.run("sub-1", None, document_text).await?;
//! println!("{:?}", state.scores());
//!
//! engine.resume("sub-1", ReviewDecision::approve("ok")).await?;
//! ```

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod evaluator;
pub mod ledger;
pub mod prompts;
pub mod providers;
pub mod repository;
pub mod stream;
pub mod usage;
pub mod workflow;

pub use cache::EvaluationCache;
pub use checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use config::{
    CacheConfig, DeepAnalysisConfig, DispatchConfig, EvaluationConfig, ProviderConfig,
    RuntimeConfig,
};
pub use dispatcher::{DispatchReport, EvaluationDispatcher, EvaluationTask};
pub use evaluator::{
    CategoryEvaluator, EvaluationFailed, EvaluationRequest, EvaluationSuccess, EvaluatorRegistry,
    KeywordEvaluator, LlmCategoryEvaluator, ValidationFailed,
};
pub use ledger::{
    ExecutionLedger, ExecutionRecord, ExecutionStatus, InMemoryLedger, JsonlLedger, LedgerError,
    LedgerWriter,
};
pub use providers::{CompletionConfig, LlmProvider, ProviderError, ProviderRegistry, TokenUsage};
pub use repository::{InMemoryRuleRepository, RepositoryError, RuleRepository, YamlRuleRepository};
pub use stream::{DeepAnalysisEvent, LineResult};
pub use usage::{LlmUsage, UsageTracker};
pub use workflow::{
    LoggingStatusSink, SubmissionStatus, SubmissionStatusSink, WorkflowEngine,
    WorkflowEngineBuilder, WorkflowError,
};
