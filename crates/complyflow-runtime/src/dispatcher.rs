//! Evaluation dispatcher: fan-out over (unit × category), fan-in at a barrier.
//!
//! Every task runs independently with bounded, unordered concurrency. A task
//! that fails contributes no violations and is recorded, never propagated.
//! The merge happens here, after all tasks are terminal, in a fixed
//! (unit, category) order so repeated runs produce the same violation list.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use complyflow_core::{
    ActiveRules, CategoryKey, ContentUnit, EvaluationSummary, RuleDefinition, Violation,
};

use crate::config::DispatchConfig;
use crate::evaluator::{EvaluationFailed, EvaluationRequest, EvaluationSuccess, EvaluatorRegistry};
use crate::ledger::{ExecutionRecord, ExecutionStatus, LedgerWriter};
use crate::providers::TokenUsage;
use crate::usage::estimate_cost;

/// One unit of concurrent work.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationTask<'a> {
    pub unit: &'a ContentUnit,
    pub category: &'a CategoryKey,
    pub rules: &'a [RuleDefinition],
}

/// A task in its terminal state.
#[derive(Debug)]
pub(crate) struct TaskOutcome<'a> {
    pub task: EvaluationTask<'a>,
    pub result: Result<EvaluationSuccess, EvaluationFailed>,
}

impl TaskOutcome<'_> {
    /// Violations bound to the originating unit and category. Empty on failure.
    pub fn violations(&self) -> Vec<Violation> {
        match &self.result {
            Ok(success) => success
                .output
                .violations
                .iter()
                .cloned()
                .map(|v| v.into_violation(self.task.category, self.task.unit))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Merged result of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub violations: Vec<Violation>,
    pub completed: usize,
    pub failed: usize,
    /// `"[CATEGORY] text"` for every completed task with an assessment.
    pub assessments: Vec<String>,
    pub usage: TokenUsage,
    pub failures: Vec<EvaluationFailed>,
}

impl DispatchReport {
    pub fn total_tasks(&self) -> usize {
        self.completed + self.failed
    }

    pub fn summary(&self) -> EvaluationSummary {
        EvaluationSummary {
            total_tasks: self.total_tasks(),
            completed: self.completed,
            failed: self.failed,
        }
    }
}

pub struct EvaluationDispatcher {
    evaluators: EvaluatorRegistry,
    ledger: LedgerWriter,
    config: DispatchConfig,
    input_preview_chars: usize,
}

impl EvaluationDispatcher {
    pub fn new(
        evaluators: EvaluatorRegistry,
        ledger: LedgerWriter,
        config: DispatchConfig,
        input_preview_chars: usize,
    ) -> Self {
        Self {
            evaluators,
            ledger,
            config,
            input_preview_chars,
        }
    }

    pub fn evaluators(&self) -> &EvaluatorRegistry {
        &self.evaluators
    }

    pub fn ledger(&self) -> &LedgerWriter {
        &self.ledger
    }

    /// The cross product of units and categories that have rules, unit-major.
    pub fn plan<'a>(units: &'a [ContentUnit], rules: &'a ActiveRules) -> Vec<EvaluationTask<'a>> {
        let categories: Vec<_> = rules.active_categories().collect();
        units
            .iter()
            .flat_map(|unit| {
                categories.iter().map(move |(category, rules)| EvaluationTask {
                    unit,
                    category: *category,
                    rules: *rules,
                })
            })
            .collect()
    }

    /// Run every task to a terminal state and merge the results.
    #[instrument(
        skip_all,
        fields(submission_id = %submission_id, units = units.len(), tasks = tracing::field::Empty)
    )]
    pub async fn dispatch(
        &self,
        submission_id: &str,
        units: &[ContentUnit],
        rules: &ActiveRules,
    ) -> DispatchReport {
        let tasks = Self::plan(units, rules);
        tracing::Span::current().record("tasks", tasks.len());
        let started = Instant::now();

        let mut outcomes: Vec<TaskOutcome<'_>> = stream::iter(tasks)
            .map(|task| self.run_task(submission_id, task))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        outcomes.sort_by(|a, b| {
            (a.task.unit.ordinal_index, a.task.category)
                .cmp(&(b.task.unit.ordinal_index, b.task.category))
        });

        let mut report = DispatchReport::default();
        for outcome in outcomes {
            report.violations.extend(outcome.violations());
            match outcome.result {
                Ok(success) => {
                    report.completed += 1;
                    report.usage += success.usage;
                    let assessment = success.output.overall_assessment.trim();
                    if !assessment.is_empty() {
                        report.assessments.push(format!(
                            "[{}] {}",
                            outcome.task.category.as_str().to_uppercase(),
                            assessment
                        ));
                    }
                }
                Err(failure) => {
                    report.failed += 1;
                    report.usage += failure.usage;
                    report.failures.push(failure);
                }
            }
        }

        tracing::info!(
            completed = report.completed,
            failed = report.failed,
            violations = report.violations.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Dispatch complete"
        );
        report
    }

    /// Run one task and write its ledger record. Never fails.
    pub(crate) async fn run_task<'a>(
        &self,
        submission_id: &str,
        task: EvaluationTask<'a>,
    ) -> TaskOutcome<'a> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let request = EvaluationRequest {
            submission_id,
            unit: task.unit,
            category: task.category,
            rules: task.rules,
        };

        let (agent_name, result) = match self.evaluators.get(task.category) {
            None => (
                "unregistered".to_string(),
                Err(EvaluationFailed::new(
                    &request,
                    format!("no evaluator registered for category '{}'", task.category),
                )),
            ),
            Some(evaluator) => {
                let guarded = AssertUnwindSafe(evaluator.evaluate(request)).catch_unwind();
                let result = match self.config.task_timeout {
                    Some(limit) => match tokio::time::timeout(limit, guarded).await {
                        Ok(result) => result,
                        Err(_) => Ok(Err(EvaluationFailed::new(
                            &request,
                            format!("timed out after {:?}", limit),
                        ))),
                    },
                    None => guarded.await,
                };
                let result = result.unwrap_or_else(|_| {
                    Err(EvaluationFailed::new(&request, "evaluator panicked"))
                });
                (evaluator.name().to_string(), result)
            }
        };

        let duration_ms = clock.elapsed().as_millis() as u64;
        match &result {
            Ok(success) => tracing::debug!(
                category = %task.category,
                unit_index = task.unit.ordinal_index,
                violations = success.output.violations.len(),
                attempts = success.attempts,
                cached = success.cached,
                duration_ms,
                "Task completed"
            ),
            Err(failure) => tracing::warn!(
                category = %task.category,
                unit_index = task.unit.ordinal_index,
                attempts = failure.attempts,
                error = %failure.cause,
                duration_ms,
                "Task failed"
            ),
        }

        self.ledger.submit(self.record(
            submission_id,
            &task,
            agent_name,
            &result,
            started_at,
            duration_ms,
        ));

        TaskOutcome { task, result }
    }

    fn record(
        &self,
        submission_id: &str,
        task: &EvaluationTask<'_>,
        agent_name: String,
        result: &Result<EvaluationSuccess, EvaluationFailed>,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
    ) -> ExecutionRecord {
        let (status, output_payload, error, token_usage, attempts, cached, estimated_cost) =
            match result {
                Ok(success) => (
                    ExecutionStatus::Completed,
                    serde_json::to_value(&success.output).ok(),
                    None,
                    success.usage,
                    success.attempts,
                    success.cached,
                    success
                        .model
                        .as_deref()
                        .map(|model| estimate_cost(&success.usage, model))
                        .unwrap_or(0.0),
                ),
                Err(failure) => (
                    ExecutionStatus::Failed,
                    None,
                    Some(failure.cause.clone()),
                    failure.usage,
                    failure.attempts,
                    false,
                    estimate_cost(&failure.usage, ""),
                ),
            };

        ExecutionRecord {
            execution_id: Uuid::new_v4(),
            submission_id: submission_id.to_string(),
            agent_category: task.category.clone(),
            agent_name,
            unit_reference: task.unit.location(),
            status,
            input_preview: task.unit.preview(self.input_preview_chars),
            output_payload,
            error,
            started_at,
            completed_at: Utc::now(),
            duration_ms,
            token_usage,
            attempts,
            cached,
            estimated_cost,
        }
    }
}
