//! Category evaluators.
//!
//! A category evaluator checks one content unit against the active rules of
//! one category and reports violations. It never raises past its boundary:
//! every outcome is either an [`EvaluationSuccess`] or an [`EvaluationFailed`]
//! value that the dispatcher records and moves on from.

use async_trait::async_trait;
use complyflow_core::{CategoryKey, ContentUnit, EvaluationOutput, RuleDefinition};
use thiserror::Error;

use crate::providers::TokenUsage;

mod keyword;
mod llm;
mod registry;
pub mod validator;

pub use keyword::KeywordEvaluator;
pub use llm::LlmCategoryEvaluator;
pub use registry::EvaluatorRegistry;
pub use validator::OutputValidator;

/// Why a structured reply was rejected. Fed back to the model on retry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationFailed {
    #[error("response is not valid JSON: {0}")]
    NotJson(String),

    #[error("response does not match the output schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("response could not be read as an evaluation result: {0}")]
    Malformed(String),

    #[error("response is inconsistent with the request: {0}")]
    Semantic(String),
}

/// One evaluation: a unit's text against one category's rules.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationRequest<'a> {
    pub submission_id: &'a str,
    pub unit: &'a ContentUnit,
    pub category: &'a CategoryKey,
    pub rules: &'a [RuleDefinition],
}

#[derive(Debug, Clone)]
pub struct EvaluationSuccess {
    pub output: EvaluationOutput,
    pub usage: TokenUsage,
    /// Calls made, including validation retries. Zero for cache hits.
    pub attempts: u32,
    pub cached: bool,
    /// Model that served the final call, when a model was involved.
    pub model: Option<String>,
}

/// A task-level failure. Contributes zero violations and never fails the run.
#[derive(Error, Debug, Clone)]
#[error("Evaluation of unit {unit_id} for category {category} failed: {cause}")]
pub struct EvaluationFailed {
    pub category: CategoryKey,
    pub unit_id: String,
    pub cause: String,
    pub attempts: u32,
    /// Tokens spent before giving up.
    pub usage: TokenUsage,
}

impl EvaluationFailed {
    pub fn new(request: &EvaluationRequest<'_>, cause: impl Into<String>) -> Self {
        Self {
            category: request.category.clone(),
            unit_id: request.unit.id.clone(),
            cause: cause.into(),
            attempts: 0,
            usage: TokenUsage::default(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32, usage: TokenUsage) -> Self {
        self.attempts = attempts;
        self.usage = usage;
        self
    }
}

/// Evaluates content for exactly one category.
///
/// # Isolation Contract
/// - MUST NOT observe other tasks or their results
/// - MUST return `EvaluationFailed` instead of panicking or propagating errors
/// - Violations it reports are re-tagged with [`CategoryEvaluator::category`]
#[async_trait]
pub trait CategoryEvaluator: Send + Sync {
    fn category(&self) -> &CategoryKey;

    /// Name for logs and ledger records.
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        request: EvaluationRequest<'_>,
    ) -> Result<EvaluationSuccess, EvaluationFailed>;
}
