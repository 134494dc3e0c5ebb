//! The durable workflow record and its transition table.
//!
//! `WorkflowState` is owned by the workflow engine. Everything here is
//! synchronous bookkeeping; the engine decides when steps run and when a
//! snapshot is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::rules::ActiveRules;
use crate::scoring::{ScoreResult, ScoringEngine};
use crate::segmenter::{ContentUnit, SegmentMode};
use crate::types::Violation;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Illegal workflow transition: {from} -> {to}")]
    IllegalTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
}

/// Where a workflow run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initialized,
    Segmenting,
    DispatchingRules,
    Evaluating,
    Scoring,
    AwaitingHumanReview,
    Finalized,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Initialized => "initialized",
            WorkflowStatus::Segmenting => "segmenting",
            WorkflowStatus::DispatchingRules => "dispatching_rules",
            WorkflowStatus::Evaluating => "evaluating",
            WorkflowStatus::Scoring => "scoring",
            WorkflowStatus::AwaitingHumanReview => "awaiting_human_review",
            WorkflowStatus::Finalized => "finalized",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Finalized | WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States reachable from `from` in one step.
pub fn allowed_transitions(from: WorkflowStatus) -> Vec<WorkflowStatus> {
    use WorkflowStatus::*;
    match from {
        Initialized => vec![Segmenting, Failed],
        Segmenting => vec![DispatchingRules, Failed],
        DispatchingRules => vec![Evaluating, Failed],
        Evaluating => vec![Scoring, Failed],
        Scoring => vec![AwaitingHumanReview, Failed],
        AwaitingHumanReview => vec![Finalized, Failed],
        Finalized => vec![],
        Failed => vec![],
    }
}

pub fn validate_transition(
    from: WorkflowStatus,
    to: WorkflowStatus,
) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalTransition { from, to })
    }
}

/// The next unit of work a checkpointed run has to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Segment,
    LoadRules,
    Evaluate,
    Score,
    /// Suspended until an external resume.
    Review,
}

/// Raw document handed to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum DocumentInput {
    Text(String),
    Pages(Vec<String>),
}

impl DocumentInput {
    pub fn char_len(&self) -> usize {
        match self {
            DocumentInput::Text(t) => t.chars().count(),
            DocumentInput::Pages(pages) => pages.iter().map(|p| p.chars().count()).sum(),
        }
    }
}

impl From<String> for DocumentInput {
    fn from(text: String) -> Self {
        DocumentInput::Text(text)
    }
}

impl From<&str> for DocumentInput {
    fn from(text: &str) -> Self {
        DocumentInput::Text(text.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Approve,
    Reject,
    #[serde(alias = "feedback")]
    Comment,
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReviewAction::Approve => "approve",
            ReviewAction::Reject => "reject",
            ReviewAction::Comment => "comment",
        };
        f.write_str(s)
    }
}

impl FromStr for ReviewAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(ReviewAction::Approve),
            "reject" => Ok(ReviewAction::Reject),
            "comment" | "feedback" => Ok(ReviewAction::Comment),
            other => Err(format!("unknown review action '{}'", other)),
        }
    }
}

/// A reviewer's verdict. Recorded for audit; never alters scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub action: ReviewAction,
    #[serde(default)]
    pub feedback: String,
}

impl ReviewDecision {
    pub fn new(action: ReviewAction, feedback: impl Into<String>) -> Self {
        Self {
            action,
            feedback: feedback.into(),
        }
    }

    pub fn approve(feedback: impl Into<String>) -> Self {
        Self::new(ReviewAction::Approve, feedback)
    }

    /// The string stored on the workflow record.
    pub fn as_record(&self) -> String {
        format!("Action: {}. Feedback: {}", self.action, self.feedback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: WorkflowStatus,
    pub at: DateTime<Utc>,
}

/// Task counts from the last evaluation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
}

/// The durable, resumable record of one submission's analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    submission_id: String,
    project_id: Option<String>,
    segment_mode: SegmentMode,
    status: WorkflowStatus,
    pending_step: Option<WorkflowStep>,
    /// Present until segmentation has produced content units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    document: Option<DocumentInput>,
    content_units: Vec<ContentUnit>,
    active_rules: ActiveRules,
    violations: Vec<Violation>,
    scores: Option<ScoreResult>,
    human_feedback: Option<String>,
    review_action: Option<ReviewAction>,
    assessments: Vec<String>,
    evaluation: EvaluationSummary,
    step_history: Vec<StepRecord>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(
        submission_id: impl Into<String>,
        project_id: Option<String>,
        document: DocumentInput,
        segment_mode: SegmentMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            submission_id: submission_id.into(),
            project_id,
            segment_mode,
            status: WorkflowStatus::Initialized,
            pending_step: Some(WorkflowStep::Segment),
            document: Some(document),
            content_units: Vec::new(),
            active_rules: ActiveRules::default(),
            violations: Vec::new(),
            scores: None,
            human_feedback: None,
            review_action: None,
            assessments: Vec::new(),
            evaluation: EvaluationSummary::default(),
            step_history: vec![StepRecord {
                status: WorkflowStatus::Initialized,
                at: now,
            }],
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn submission_id(&self) -> &str {
        &self.submission_id
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn segment_mode(&self) -> SegmentMode {
        self.segment_mode
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn pending_step(&self) -> Option<WorkflowStep> {
        self.pending_step
    }

    pub fn document(&self) -> Option<&DocumentInput> {
        self.document.as_ref()
    }

    pub fn content_units(&self) -> &[ContentUnit] {
        &self.content_units
    }

    pub fn active_rules(&self) -> &ActiveRules {
        &self.active_rules
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn scores(&self) -> Option<&ScoreResult> {
        self.scores.as_ref()
    }

    pub fn human_feedback(&self) -> Option<&str> {
        self.human_feedback.as_deref()
    }

    pub fn review_action(&self) -> Option<ReviewAction> {
        self.review_action
    }

    pub fn assessments(&self) -> &[String] {
        &self.assessments
    }

    pub fn evaluation(&self) -> EvaluationSummary {
        self.evaluation
    }

    pub fn step_history(&self) -> &[StepRecord] {
        &self.step_history
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, recording the step.
    pub fn transition_to(&mut self, next: WorkflowStatus) -> Result<(), TransitionError> {
        validate_transition(self.status, next)?;
        self.status = next;
        self.touch();
        self.step_history.push(StepRecord {
            status: next,
            at: self.updated_at,
        });
        Ok(())
    }

    pub fn set_pending_step(&mut self, step: Option<WorkflowStep>) {
        self.pending_step = step;
        self.touch();
    }

    /// Store the segmentation result and drop the raw document.
    pub fn record_segments(&mut self, units: Vec<ContentUnit>) {
        self.content_units = units;
        self.document = None;
        self.touch();
    }

    pub fn set_active_rules(&mut self, rules: ActiveRules) {
        self.active_rules = rules;
        self.touch();
    }

    /// Append violations. The collection never shrinks.
    pub fn extend_violations(&mut self, violations: impl IntoIterator<Item = Violation>) {
        self.violations.extend(violations);
        self.touch();
    }

    pub fn record_evaluation(&mut self, summary: EvaluationSummary, assessments: Vec<String>) {
        self.evaluation = summary;
        self.assessments.extend(assessments);
        self.touch();
    }

    /// Recompute scores from the full violation set.
    pub fn rescore(&mut self, engine: &ScoringEngine) {
        self.scores = Some(engine.score(&self.violations));
        self.touch();
    }

    /// Scores for the current violations, without touching the record.
    pub fn preview(&self, engine: &ScoringEngine) -> ScoreResult {
        engine.score(&self.violations)
    }

    pub fn record_feedback(&mut self, decision: &ReviewDecision) {
        self.human_feedback = Some(decision.as_record());
        self.review_action = Some(decision.action);
        self.touch();
    }

    /// Mark the run failed. No-op on an already failed record.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != WorkflowStatus::Failed {
            self.transition_to(WorkflowStatus::Failed)?;
        }
        self.error = Some(message.into());
        self.pending_step = None;
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests::rule;
    use crate::scoring::{ComplianceStatus, ScoringConfig};
    use crate::segmenter::Segmenter;
    use crate::types::{CategoryKey, Severity};

    fn state() -> WorkflowState {
        WorkflowState::new("sub-1", None, "Some text".into(), SegmentMode::Chunk)
    }

    #[test]
    fn test_transition_table() {
        use WorkflowStatus::*;
        assert!(validate_transition(Initialized, Segmenting).is_ok());
        assert!(validate_transition(Scoring, AwaitingHumanReview).is_ok());
        assert!(validate_transition(Initialized, Scoring).is_err());
        assert!(validate_transition(Finalized, Failed).is_err());
        for s in [Initialized, Segmenting, DispatchingRules, Evaluating, Scoring, AwaitingHumanReview] {
            assert!(allowed_transitions(s).contains(&Failed));
        }
        assert!(allowed_transitions(Failed).is_empty());
    }

    #[test]
    fn test_full_happy_path() {
        use WorkflowStatus::*;
        let mut state = state();
        for next in [Segmenting, DispatchingRules, Evaluating, Scoring, AwaitingHumanReview, Finalized] {
            state.transition_to(next).unwrap();
        }
        assert!(state.is_terminal());
        assert_eq!(state.step_history().len(), 7);
        assert_eq!(state.step_history()[0].status, Initialized);
    }

    #[test]
    fn test_illegal_transition_leaves_state_untouched() {
        let mut state = state();
        let err = state.transition_to(WorkflowStatus::Finalized).unwrap_err();
        assert_eq!(
            err,
            TransitionError::IllegalTransition {
                from: WorkflowStatus::Initialized,
                to: WorkflowStatus::Finalized,
            }
        );
        assert_eq!(state.status(), WorkflowStatus::Initialized);
        assert_eq!(state.step_history().len(), 1);
    }

    #[test]
    fn test_fail_records_error() {
        let mut state = state();
        state.transition_to(WorkflowStatus::Segmenting).unwrap();
        state.fail("segmentation crashed").unwrap();
        assert_eq!(state.status(), WorkflowStatus::Failed);
        assert_eq!(state.error(), Some("segmentation crashed"));
        assert_eq!(state.pending_step(), None);

        // Failing twice keeps the state failed.
        state.fail("again").unwrap();
        assert_eq!(state.error(), Some("again"));
    }

    #[test]
    fn test_segments_replace_document() {
        let mut state = state();
        assert!(state.document().is_some());
        let units = Segmenter::default()
            .segment("Some text", SegmentMode::Chunk)
            .unwrap();
        state.record_segments(units);
        assert!(state.document().is_none());
        assert_eq!(state.content_units().len(), 1);
    }

    #[test]
    fn test_rescore_and_preview_agree() {
        let engine = ScoringEngine::default();
        let mut state = state();
        let units = Segmenter::default()
            .segment("Some text", SegmentMode::Chunk)
            .unwrap();
        let reported = crate::types::ReportedViolation {
            category: None,
            severity: Severity::Critical,
            rule_id: Some("R1".to_string()),
            description: "bad".to_string(),
            location: None,
            current_text: None,
            suggested_fix: None,
            auto_fixable: false,
        };
        let violation = reported.into_violation(&CategoryKey::new("brand").unwrap(), &units[0]);
        state.extend_violations([violation]);

        let preview = state.preview(&engine);
        assert!(state.scores().is_none());
        state.rescore(&engine);
        assert_eq!(state.scores(), Some(&preview));
        assert_eq!(preview.status, ComplianceStatus::Failed);
    }

    #[test]
    fn test_review_decision_record() {
        let decision = ReviewDecision::new(ReviewAction::Reject, "Tone is off");
        assert_eq!(decision.as_record(), "Action: reject. Feedback: Tone is off");
        assert_eq!("feedback".parse::<ReviewAction>(), Ok(ReviewAction::Comment));

        let parsed: ReviewDecision =
            serde_json::from_str(r#"{"action":"feedback","feedback":"x"}"#).unwrap();
        assert_eq!(parsed.action, ReviewAction::Comment);
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = state();
        state.transition_to(WorkflowStatus::Segmenting).unwrap();
        let registry = ScoringConfig::default().registry();
        let rules = vec![rule("R1", "seo", Severity::Low)];
        state.set_active_rules(ActiveRules::group(&rules, &registry, None).unwrap());

        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
