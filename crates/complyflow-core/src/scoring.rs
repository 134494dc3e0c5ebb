//! Scoring Engine: violations → per-category and overall scores.
//!
//! Scoring is a pure function. Violations are first counted per
//! (category, severity) and then summed in a fixed order, so the result
//! does not depend on the order violations were collected in and two
//! calls on the same input are identical down to the last bit.
//!
//! Policy:
//! 1. Every configured category starts at 100 and loses its severity weight
//!    per violation, clamped at 0.
//! 2. Overall = weighted sum of category scores (weights sum to 1.0).
//! 3. Grade: A ≥ 90, B ≥ 80, C ≥ 70, D ≥ 60, else F.
//! 4. Status: failed on any critical violation or overall < 60,
//!    flagged if overall < 80, otherwise passed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{CategoryKey, CategoryRegistry, Severity, Violation};
use crate::ConfigError;

const MAX_SCORE: f64 = 100.0;
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Points deducted per violation of each severity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            critical: 20.0,
            high: 10.0,
            medium: 3.0,
            low: 2.0,
        }
    }
}

impl SeverityWeights {
    pub fn weight(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}

/// Scoring configuration. Category weights double as the category registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub severity_weights: SeverityWeights,
    pub category_weights: BTreeMap<CategoryKey, f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let category_weights = [("regulatory", 0.5), ("brand", 0.3), ("seo", 0.2)]
            .into_iter()
            .filter_map(|(k, w)| CategoryKey::new(k).ok().map(|key| (key, w)))
            .collect();
        Self {
            severity_weights: SeverityWeights::default(),
            category_weights,
        }
    }
}

impl ScoringConfig {
    /// Equal weights over the given categories.
    pub fn with_equal_weights(categories: impl IntoIterator<Item = CategoryKey>) -> Self {
        let keys: Vec<CategoryKey> = categories.into_iter().collect();
        let weight = if keys.is_empty() {
            0.0
        } else {
            1.0 / keys.len() as f64
        };
        Self {
            severity_weights: SeverityWeights::default(),
            category_weights: keys.into_iter().map(|k| (k, weight)).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for severity in Severity::ALL {
            let w = self.severity_weights.weight(severity);
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::invalid(
                    format!("scoring.severity_weights.{}", severity),
                    "must be a non-negative number",
                ));
            }
        }

        if self.category_weights.is_empty() {
            return Err(ConfigError::invalid(
                "scoring.category_weights",
                "at least one category is required",
            ));
        }

        for (key, w) in &self.category_weights {
            if !w.is_finite() || *w < 0.0 {
                return Err(ConfigError::invalid(
                    format!("scoring.category_weights.{}", key),
                    "must be a non-negative number",
                ));
            }
        }

        let sum: f64 = self.category_weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::invalid(
                "scoring.category_weights",
                format!("weights must sum to 1.0, got {}", sum),
            ));
        }

        Ok(())
    }

    /// The categories this configuration knows about.
    pub fn registry(&self) -> CategoryRegistry {
        CategoryRegistry::new(self.category_weights.keys().cloned())
    }
}

/// Letter grade derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Grade::A
        } else if score >= 80.0 {
            Grade::B
        } else if score >= 70.0 {
            Grade::C
        } else if score >= 60.0 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceStatus {
    Passed,
    Flagged,
    Failed,
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComplianceStatus::Passed => "passed",
            ComplianceStatus::Flagged => "flagged",
            ComplianceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Derived score for a violation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub overall: f64,
    pub per_category: BTreeMap<CategoryKey, f64>,
    pub grade: Grade,
    pub status: ComplianceStatus,
}

/// Computes [`ScoreResult`]s.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self {
            config: ScoringConfig::default(),
        }
    }
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, violations: &[Violation]) -> ScoreResult {
        let mut counts: BTreeMap<(&CategoryKey, Severity), usize> = BTreeMap::new();
        let mut has_critical = false;
        for v in violations {
            *counts.entry((&v.category, v.severity)).or_default() += 1;
            has_critical |= v.severity == Severity::Critical;
        }

        let weights = &self.config.severity_weights;
        let mut per_category = BTreeMap::new();
        let mut overall = 0.0;

        for (category, category_weight) in &self.config.category_weights {
            let deduction: f64 = Severity::ALL
                .iter()
                .map(|s| {
                    let n = counts.get(&(category, *s)).copied().unwrap_or(0);
                    n as f64 * weights.weight(*s)
                })
                .sum();
            let score = (MAX_SCORE - deduction).max(0.0);
            overall += score * category_weight;
            per_category.insert(category.clone(), round2(score));
        }

        let overall = round2(overall);
        let grade = Grade::from_score(overall);
        let status = if has_critical || overall < 60.0 {
            ComplianceStatus::Failed
        } else if overall < 80.0 {
            ComplianceStatus::Flagged
        } else {
            ComplianceStatus::Passed
        };

        ScoreResult {
            overall,
            per_category,
            grade,
            status,
        }
    }
}

/// Multipliers applied to severity weights when scoring single lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SeverityPreset {
    Strict,
    #[default]
    Balanced,
    Lenient,
}

impl SeverityPreset {
    pub fn multiplier(&self, severity: Severity) -> f64 {
        let [critical, high, medium, low] = match self {
            SeverityPreset::Strict => [2.0, 1.5, 1.0, 0.5],
            SeverityPreset::Balanced => [1.5, 1.0, 0.5, 0.2],
            SeverityPreset::Lenient => [1.0, 0.5, 0.2, 0.1],
        };
        match severity {
            Severity::Critical => critical,
            Severity::High => high,
            Severity::Medium => medium,
            Severity::Low => low,
        }
    }
}

/// Scores a single line independently: each line starts at 100.
#[derive(Debug, Clone, Copy)]
pub struct LineScorer {
    weights: SeverityWeights,
    preset: SeverityPreset,
}

impl LineScorer {
    pub fn new(weights: SeverityWeights, preset: SeverityPreset) -> Self {
        Self { weights, preset }
    }

    pub fn preset(&self) -> SeverityPreset {
        self.preset
    }

    pub fn score<I>(&self, severities: I) -> f64
    where
        I: IntoIterator<Item = Severity>,
    {
        let mut counts = [0usize; 4];
        for s in severities {
            counts[s as usize] += 1;
        }
        let deduction: f64 = Severity::ALL
            .iter()
            .map(|s| counts[*s as usize] as f64 * self.weights.weight(*s) * self.preset.multiplier(*s))
            .sum();
        round2((MAX_SCORE - deduction).clamp(0.0, MAX_SCORE))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(k: &str) -> CategoryKey {
        CategoryKey::new(k).unwrap()
    }

    fn violation(category: &str, severity: Severity) -> Violation {
        Violation {
            category: key(category),
            severity,
            rule_id: None,
            description: "test".to_string(),
            location: "chunk:x:offset:0".to_string(),
            current_text: None,
            suggested_fix: None,
            auto_fixable: false,
            unit_id: "x".to_string(),
            unit_index: 0,
        }
    }

    fn two_category_engine() -> ScoringEngine {
        ScoringEngine::new(ScoringConfig::with_equal_weights([key("a"), key("b")])).unwrap()
    }

    #[test]
    fn test_no_violations_scores_100() {
        let result = ScoringEngine::default().score(&[]);
        assert_eq!(result.overall, 100.0);
        assert_eq!(result.grade, Grade::A);
        assert_eq!(result.status, ComplianceStatus::Passed);
        assert_eq!(result.per_category.len(), 3);
        assert!(result.per_category.values().all(|s| *s == 100.0));
    }

    #[test]
    fn test_single_critical_forces_failed() {
        let result = two_category_engine().score(&[violation("a", Severity::Critical)]);
        assert_eq!(result.per_category[&key("a")], 80.0);
        assert_eq!(result.per_category[&key("b")], 100.0);
        assert_eq!(result.overall, 90.0);
        assert_eq!(result.grade, Grade::A);
        assert_eq!(result.status, ComplianceStatus::Failed);
    }

    #[test]
    fn test_default_weights() {
        let engine = ScoringEngine::default();
        let violations = vec![
            violation("regulatory", Severity::High),
            violation("regulatory", Severity::High),
            violation("brand", Severity::Medium),
            violation("seo", Severity::Low),
        ];
        let result = engine.score(&violations);
        assert_eq!(result.per_category[&key("regulatory")], 80.0);
        assert_eq!(result.per_category[&key("brand")], 97.0);
        assert_eq!(result.per_category[&key("seo")], 98.0);
        // 0.5*80 + 0.3*97 + 0.2*98
        assert_eq!(result.overall, 88.7);
        assert_eq!(result.grade, Grade::B);
        assert_eq!(result.status, ComplianceStatus::Passed);
    }

    #[test]
    fn test_category_clamped_at_zero() {
        let violations: Vec<Violation> = (0..8).map(|_| violation("a", Severity::High)).collect();
        let result = two_category_engine().score(&violations);
        assert_eq!(result.per_category[&key("a")], 20.0);

        let violations: Vec<Violation> = (0..30).map(|_| violation("a", Severity::High)).collect();
        let result = two_category_engine().score(&violations);
        assert_eq!(result.per_category[&key("a")], 0.0);
        assert_eq!(result.overall, 50.0);
        assert_eq!(result.grade, Grade::F);
        assert_eq!(result.status, ComplianceStatus::Failed);
    }

    #[test]
    fn test_flagged_band() {
        let violations: Vec<Violation> = (0..5).map(|_| violation("a", Severity::High)).collect();
        let result = two_category_engine().score(&violations);
        assert_eq!(result.overall, 75.0);
        assert_eq!(result.grade, Grade::C);
        assert_eq!(result.status, ComplianceStatus::Flagged);
    }

    #[test]
    fn test_unweighted_category_only_affects_status() {
        let result = two_category_engine().score(&[violation("legal", Severity::Critical)]);
        assert_eq!(result.overall, 100.0);
        assert!(!result.per_category.contains_key(&key("legal")));
        assert_eq!(result.status, ComplianceStatus::Failed);
    }

    #[test]
    fn test_grade_thresholds() {
        assert_eq!(Grade::from_score(90.0), Grade::A);
        assert_eq!(Grade::from_score(89.99), Grade::B);
        assert_eq!(Grade::from_score(80.0), Grade::B);
        assert_eq!(Grade::from_score(70.0), Grade::C);
        assert_eq!(Grade::from_score(60.0), Grade::D);
        assert_eq!(Grade::from_score(59.99), Grade::F);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = ScoringConfig::default();
        config.category_weights.insert(key("legal"), 0.1);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = ScoringConfig::default();
        config.severity_weights.low = -1.0;
        assert!(config.validate().is_err());

        assert!(ScoringConfig::default().validate().is_ok());
    }

    #[test]
    fn test_line_scorer_presets() {
        let weights = SeverityWeights::default();
        let balanced = LineScorer::new(weights, SeverityPreset::Balanced);
        assert_eq!(balanced.score(std::iter::empty()), 100.0);
        assert_eq!(balanced.score([Severity::Critical]), 70.0);
        assert_eq!(balanced.score([Severity::Medium, Severity::Low]), 98.1);

        let strict = LineScorer::new(weights, SeverityPreset::Strict);
        assert_eq!(strict.score([Severity::Critical; 3]), 0.0);

        let lenient = LineScorer::new(weights, SeverityPreset::Lenient);
        assert_eq!(lenient.score([Severity::High]), 95.0);
    }

    fn arb_violation() -> impl Strategy<Value = Violation> {
        (
            prop::sample::select(vec!["regulatory", "brand", "seo", "other"]),
            prop::sample::select(Severity::ALL.to_vec()),
        )
            .prop_map(|(c, s)| violation(c, s))
    }

    proptest! {
        #[test]
        fn prop_score_order_independent(
            (original, shuffled) in prop::collection::vec(arb_violation(), 0..40)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            let engine = ScoringEngine::default();
            prop_assert_eq!(engine.score(&original), engine.score(&shuffled));
        }

        #[test]
        fn prop_score_idempotent(violations in prop::collection::vec(arb_violation(), 0..40)) {
            let engine = ScoringEngine::default();
            let first = serde_json::to_string(&engine.score(&violations)).unwrap();
            let second = serde_json::to_string(&engine.score(&violations)).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_scores_in_range(violations in prop::collection::vec(arb_violation(), 0..60)) {
            let result = ScoringEngine::default().score(&violations);
            prop_assert!((0.0..=100.0).contains(&result.overall));
            for score in result.per_category.values() {
                prop_assert!((0.0..=100.0).contains(score));
            }
            if violations.iter().any(|v| v.severity == Severity::Critical) {
                prop_assert_eq!(result.status, ComplianceStatus::Failed);
            }
        }
    }
}
