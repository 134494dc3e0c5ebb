//! # complyflow-core
//!
//! Deterministic building blocks of the compliance analysis workflow.
//!
//! This crate holds everything that does not need a runtime:
//! - segmenting documents into content units
//! - grouping active rules by category
//! - scoring violation sets
//! - the workflow record and its legal transitions
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: segmentation and scoring give the same output for the same input
//! 2. **Order-independent**: scores do not depend on violation order
//! 3. **No I/O**: apart from reading rule and config files
//!
//! ## Example
//!
//! ```rust
//! use complyflow_core::{ScoringEngine, Segmenter, SegmentMode};
//!
//! let units = Segmenter::default()
//!     .segment("Invest today.\n\nReturns are guaranteed.", SegmentMode::Chunk)
//!     .unwrap();
//! assert_eq!(units.len(), 1);
//!
//! let score = ScoringEngine::default().score(&[]);
//! assert_eq!(score.overall, 100.0);
//! ```

pub mod rules;
pub mod scoring;
pub mod segmenter;
pub mod state;
pub mod types;

pub use rules::{ActiveRules, RuleDefinition, RuleError, RuleFile};
pub use scoring::{
    ComplianceStatus, Grade, LineScorer, ScoreResult, ScoringConfig, ScoringEngine,
    SeverityPreset, SeverityWeights,
};
pub use segmenter::{ContentUnit, PositionMetadata, SegmentError, SegmentMode, Segmenter, SegmenterConfig};
pub use state::{
    DocumentInput, EvaluationSummary, ReviewAction, ReviewDecision, StepRecord, TransitionError,
    WorkflowState, WorkflowStatus, WorkflowStep,
};
pub use types::{
    CategoryError, CategoryKey, CategoryRegistry, EvaluationOutput, ReportedViolation, Severity,
    Violation,
};

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_to_end_scoring_of_segmented_document() {
        let units = Segmenter::default()
            .segment("First.\n\nSecond.", SegmentMode::Line)
            .unwrap();
        assert_eq!(units.len(), 2);

        let reported = ReportedViolation {
            category: Some("anything".to_string()),
            severity: Severity::High,
            rule_id: None,
            description: "Claim without disclaimer".to_string(),
            location: Some("somewhere else".to_string()),
            current_text: Some("Second.".to_string()),
            suggested_fix: None,
            auto_fixable: false,
        };
        let category = CategoryKey::new("regulatory").unwrap();
        let violation = reported.into_violation(&category, &units[1]);
        assert_eq!(violation.category, category);
        assert_eq!(violation.location, units[1].location());
        assert_eq!(violation.unit_index, 1);

        let score = ScoringEngine::default().score(&[violation]);
        assert_eq!(score.per_category[&category], 90.0);
        assert_eq!(score.overall, 95.0);
        assert_eq!(score.status, ComplianceStatus::Passed);
    }

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::invalid("dispatch.max_concurrency", "must be greater than zero");
        assert_eq!(
            err.to_string(),
            "Invalid value for dispatch.max_concurrency: must be greater than zero"
        );
    }
}
