//! Deep analysis: line-by-line evaluation reported as a lazy event stream.
//!
//! Every line is evaluated against every category with rules. A
//! `processing` event announces each line before its tasks start, one
//! `classified` event is emitted per (line, category) pair as soon as the
//! line's tasks are terminal, and a final `complete` event carries the line
//! score statistics. The stream keeps no checkpoint; a dropped stream can
//! only be restarted from the beginning.

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use complyflow_core::{
    ActiveRules, CategoryKey, ContentUnit, LineScorer, ScoreResult, SegmentMode, Violation,
};

use crate::dispatcher::{EvaluationTask, TaskOutcome};
use crate::workflow::{WorkflowEngine, WorkflowError};

const CONTENT_PREVIEW_CHARS: usize = 150;
const PROCESSING_PREVIEW_CHARS: usize = 100;

/// What happened to one (line, category) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineResult {
    pub unit_index: usize,
    pub line_number: Option<usize>,
    /// Line text, cut to 150 characters.
    pub content: String,
    /// `None` when no category has rules.
    pub category: Option<CategoryKey>,
    pub violations_count: usize,
    /// Score of the whole line across all its categories.
    pub line_score: f64,
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeepAnalysisEvent {
    Started {
        total_units: usize,
        total_tasks: usize,
    },
    /// The line about to be evaluated.
    Processing {
        progress_percent: f64,
        /// 1-based.
        current_unit: usize,
        total_units: usize,
        line_number: Option<usize>,
        /// Line text, cut to 100 characters.
        content_preview: String,
    },
    Classified {
        progress_percent: f64,
        /// 1-based.
        current_unit: usize,
        total_units: usize,
        last_result: LineResult,
    },
    Complete {
        total_units: usize,
        average_score: Option<f64>,
        min_score: Option<f64>,
        max_score: Option<f64>,
        /// Present when line violations feed a document-level score.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_score: Option<ScoreResult>,
    },
    Error {
        message: String,
    },
}

enum Phase {
    Start {
        submission_id: String,
        project_id: Option<String>,
        text: String,
    },
    Running(Box<DeepRun>),
    Done,
}

struct DeepRun {
    submission_id: String,
    units: Vec<ContentUnit>,
    rules: ActiveRules,
    next: usize,
    /// Whether `processing` was already emitted for `next`.
    announced: bool,
    done_tasks: usize,
    total_tasks: usize,
    line_scores: Vec<f64>,
    violations: Vec<Violation>,
}

impl DeepRun {
    fn progress(&self) -> f64 {
        let fraction = if self.total_tasks == 0 {
            self.next as f64 / self.units.len() as f64
        } else {
            self.done_tasks as f64 / self.total_tasks as f64
        };
        round_to(fraction * 100.0, 1)
    }

    fn processing(&self) -> DeepAnalysisEvent {
        let unit = &self.units[self.next];
        DeepAnalysisEvent::Processing {
            progress_percent: self.progress(),
            current_unit: self.next + 1,
            total_units: self.units.len(),
            line_number: unit.position.line_number,
            content_preview: truncate(&unit.text, PROCESSING_PREVIEW_CHARS),
        }
    }
}

impl WorkflowEngine {
    /// Analyze `text` line by line, yielding progress events.
    ///
    /// Nothing runs until the stream is polled.
    pub fn deep_analysis<'a>(
        &'a self,
        submission_id: &str,
        project_id: Option<&str>,
        text: impl Into<String>,
    ) -> impl Stream<Item = DeepAnalysisEvent> + 'a {
        let start = Phase::Start {
            submission_id: submission_id.to_string(),
            project_id: project_id.map(str::to_string),
            text: text.into(),
        };
        stream::unfold(start, move |phase| self.deep_step(phase)).flat_map(stream::iter)
    }

    async fn deep_step(&self, phase: Phase) -> Option<(Vec<DeepAnalysisEvent>, Phase)> {
        match phase {
            Phase::Done => None,
            Phase::Start {
                submission_id,
                project_id,
                text,
            } => match self.deep_prepare(submission_id, project_id.as_deref(), &text).await {
                Ok(run) => {
                    let started = DeepAnalysisEvent::Started {
                        total_units: run.units.len(),
                        total_tasks: run.total_tasks,
                    };
                    Some((vec![started], Phase::Running(Box::new(run))))
                }
                Err(e) => {
                    tracing::error!(error = %e, "Deep analysis could not start");
                    let event = DeepAnalysisEvent::Error {
                        message: e.public_message().to_string(),
                    };
                    Some((vec![event], Phase::Done))
                }
            },
            Phase::Running(mut run) => {
                if run.next >= run.units.len() {
                    let complete = self.deep_complete(&run).await;
                    return Some((vec![complete], Phase::Done));
                }
                if !run.announced {
                    run.announced = true;
                    return Some((vec![run.processing()], Phase::Running(run)));
                }
                let events = self.deep_line(&mut run).await;
                Some((events, Phase::Running(run)))
            }
        }
    }

    async fn deep_prepare(
        &self,
        submission_id: String,
        project_id: Option<&str>,
        text: &str,
    ) -> Result<DeepRun, WorkflowError> {
        let units = self.segmenter.segment(text, SegmentMode::Line)?;
        let rules = self.repository.get_active_rules(project_id).await?;
        let per_unit = rules.active_categories().count();

        tracing::info!(
            submission_id = %submission_id,
            units = units.len(),
            categories = per_unit,
            "Deep analysis started"
        );
        Ok(DeepRun {
            submission_id,
            total_tasks: units.len() * per_unit,
            units,
            rules,
            next: 0,
            announced: false,
            done_tasks: 0,
            line_scores: Vec::new(),
            violations: Vec::new(),
        })
    }

    /// Evaluate the next line and return its events.
    async fn deep_line(&self, run: &mut DeepRun) -> Vec<DeepAnalysisEvent> {
        let index = run.next;
        let total_units = run.units.len();

        let (results, line_violations) = {
            let unit = &run.units[index];
            let tasks: Vec<EvaluationTask<'_>> = run
                .rules
                .active_categories()
                .map(|(category, rules)| EvaluationTask {
                    unit,
                    category,
                    rules,
                })
                .collect();

            let submission_id = run.submission_id.as_str();
            let mut outcomes: Vec<TaskOutcome<'_>> = stream::iter(tasks)
                .map(|task| self.dispatcher.run_task(submission_id, task))
                .buffer_unordered(self.config.dispatch.max_concurrency.max(1))
                .collect()
                .await;
            outcomes.sort_by(|a, b| a.task.category.cmp(b.task.category));

            let mut line_violations = Vec::new();
            let mut results = Vec::with_capacity(outcomes.len());
            for outcome in &outcomes {
                let violations = outcome.violations();
                results.push((
                    Some(outcome.task.category.clone()),
                    violations.len(),
                    outcome.result.is_err(),
                ));
                line_violations.extend(violations);
            }
            if results.is_empty() {
                results.push((None, 0, false));
            }
            (results, line_violations)
        };

        let scorer = LineScorer::new(self.config.scoring.severity_weights, self.config.deep.preset);
        let line_score = scorer.score(line_violations.iter().map(|v| v.severity));
        run.line_scores.push(line_score);
        run.violations.extend(line_violations);
        run.next += 1;
        run.announced = false;

        let unit = &run.units[index];
        let mut events = Vec::with_capacity(results.len());
        for (category, violations_count, failed) in results {
            let progress = if run.total_tasks == 0 {
                run.next as f64 / total_units as f64
            } else {
                run.done_tasks += 1;
                run.done_tasks as f64 / run.total_tasks as f64
            };
            events.push(DeepAnalysisEvent::Classified {
                progress_percent: round_to(progress * 100.0, 1),
                current_unit: index + 1,
                total_units,
                last_result: LineResult {
                    unit_index: unit.ordinal_index,
                    line_number: unit.position.line_number,
                    content: truncate(&unit.text, CONTENT_PREVIEW_CHARS),
                    category,
                    violations_count,
                    line_score,
                    failed,
                },
            });
        }
        events
    }

    async fn deep_complete(&self, run: &DeepRun) -> DeepAnalysisEvent {
        self.dispatcher.ledger().flush().await;

        let scores = &run.line_scores;
        let average = (!scores.is_empty())
            .then(|| round_to(scores.iter().sum::<f64>() / scores.len() as f64, 2));
        let min = scores.iter().copied().reduce(f64::min);
        let max = scores.iter().copied().reduce(f64::max);
        let document_score = self
            .config
            .deep
            .feed_document_scores
            .then(|| self.scoring.score(&run.violations));

        tracing::info!(
            submission_id = %run.submission_id,
            units = run.units.len(),
            violations = run.violations.len(),
            average_score = ?average,
            "Deep analysis complete"
        );
        DeepAnalysisEvent::Complete {
            total_units: run.units.len(),
            average_score: average,
            min_score: min,
            max_score: max,
            document_score,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_marks_cut() {
        assert_eq!(truncate("short", 150), "short");
        let long = "x".repeat(200);
        let cut = truncate(&long, 150);
        assert_eq!(cut.len(), 153);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(33.333, 1), 33.3);
        assert_eq!(round_to(66.666, 2), 66.67);
    }

    #[test]
    fn test_event_tagging() {
        let event = DeepAnalysisEvent::Started {
            total_units: 2,
            total_tasks: 6,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "started");
        assert_eq!(json["total_tasks"], 6);

        let complete = DeepAnalysisEvent::Complete {
            total_units: 0,
            average_score: None,
            min_score: None,
            max_score: None,
            document_score: None,
        };
        let json = serde_json::to_value(&complete).unwrap();
        assert_eq!(json["status"], "complete");
        assert!(json.get("document_score").is_none());

        let processing = DeepAnalysisEvent::Processing {
            progress_percent: 50.0,
            current_unit: 2,
            total_units: 3,
            line_number: Some(4),
            content_preview: "Act now".to_string(),
        };
        let json = serde_json::to_value(&processing).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["content_preview"], "Act now");
    }

    #[test]
    fn test_processing_reports_progress_before_the_line() {
        let units = complyflow_core::Segmenter::default()
            .segment("one\ntwo", SegmentMode::Line)
            .unwrap();
        let run = DeepRun {
            submission_id: "s".to_string(),
            units,
            rules: ActiveRules::default(),
            next: 1,
            announced: false,
            done_tasks: 3,
            total_tasks: 6,
            line_scores: Vec::new(),
            violations: Vec::new(),
        };
        match run.processing() {
            DeepAnalysisEvent::Processing {
                progress_percent,
                current_unit,
                line_number,
                content_preview,
                ..
            } => {
                assert_eq!(progress_percent, 50.0);
                assert_eq!(current_unit, 2);
                assert_eq!(line_number, Some(2));
                assert_eq!(content_preview, "two");
            }
            other => panic!("Expected processing event, got {:?}", other),
        }
    }
}
