//! Deterministic evaluator driven by rule keywords and patterns.
//!
//! Needs no model, so it serves offline runs and tests. A rule is reported
//! when its `pattern` matches, or when any of its keywords appears
//! (case-insensitive).
//!
//! Matchers are compiled once per distinct pattern or keyword set and reused
//! across units.

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;

use complyflow_core::{CategoryKey, EvaluationOutput, ReportedViolation, RuleDefinition};

use super::{CategoryEvaluator, EvaluationFailed, EvaluationRequest, EvaluationSuccess};
use crate::providers::TokenUsage;

/// What a rule matches on. Two rules with the same source share a matcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MatcherSource {
    Pattern(String),
    Keywords(Vec<String>),
}

impl MatcherSource {
    fn of(rule: &RuleDefinition) -> Self {
        match &rule.pattern {
            Some(pattern) => MatcherSource::Pattern(pattern.clone()),
            None => MatcherSource::Keywords(rule.keywords.clone()),
        }
    }
}

pub struct KeywordEvaluator {
    category: CategoryKey,
    name: String,
    matchers: RwLock<HashMap<MatcherSource, Option<Regex>>>,
}

impl KeywordEvaluator {
    pub fn new(category: CategoryKey) -> Self {
        let name = format!("{}_keywords", category);
        Self {
            category,
            name,
            matchers: RwLock::new(HashMap::new()),
        }
    }

    /// Number of distinct matchers compiled so far.
    pub fn compiled(&self) -> usize {
        self.matchers.read().len()
    }

    fn matcher(&self, rule: &RuleDefinition) -> Result<Option<Regex>, regex::Error> {
        let source = MatcherSource::of(rule);
        if let Some(found) = self.matchers.read().get(&source) {
            return Ok(found.clone());
        }
        let compiled = Self::compile(rule)?;
        self.matchers.write().insert(source, compiled.clone());
        Ok(compiled)
    }

    fn compile(rule: &RuleDefinition) -> Result<Option<Regex>, regex::Error> {
        if let Some(pattern) = &rule.pattern {
            return Regex::new(pattern).map(Some);
        }

        let alternatives: Vec<String> = rule
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Ok(None);
        }

        RegexBuilder::new(&alternatives.join("|"))
            .case_insensitive(true)
            .build()
            .map(Some)
    }
}

#[async_trait]
impl CategoryEvaluator for KeywordEvaluator {
    fn category(&self) -> &CategoryKey {
        &self.category
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(
        &self,
        request: EvaluationRequest<'_>,
    ) -> Result<EvaluationSuccess, EvaluationFailed> {
        let text = &request.unit.text;
        let mut violations = Vec::new();
        let mut key_issues = Vec::new();

        for rule in request.rules {
            let matcher = self.matcher(rule).map_err(|e| {
                EvaluationFailed::new(&request, format!("rule {} has an invalid pattern: {}", rule.id, e))
            })?;

            let Some(found) = matcher.as_ref().and_then(|re| re.find(text)) else {
                continue;
            };

            violations.push(ReportedViolation {
                category: Some(self.category.to_string()),
                severity: rule.severity,
                rule_id: Some(rule.id.clone()),
                description: rule.text.clone(),
                location: None,
                current_text: Some(found.as_str().to_string()),
                suggested_fix: None,
                auto_fixable: false,
            });
            key_issues.push(format!("{}: \"{}\"", rule.id, found.as_str()));
        }

        let overall_assessment = if violations.is_empty() {
            format!("No {} rules matched.", self.category)
        } else {
            format!(
                "{} of {} {} rules matched.",
                violations.len(),
                request.rules.len(),
                self.category
            )
        };

        Ok(EvaluationSuccess {
            output: EvaluationOutput {
                violations,
                overall_assessment,
                key_issues,
            },
            usage: TokenUsage::default(),
            attempts: 1,
            cached: false,
            model: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyflow_core::{SegmentMode, Segmenter, Severity};

    fn rule(id: &str, keywords: &[&str], pattern: Option<&str>, severity: Severity) -> RuleDefinition {
        RuleDefinition {
            id: id.to_string(),
            category: CategoryKey::new("regulatory").unwrap(),
            text: format!("Rule {}", id),
            severity,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            pattern: pattern.map(str::to_string),
            active: true,
            project_id: None,
        }
    }

    #[tokio::test]
    async fn test_keyword_and_pattern_matches() {
        let unit = Segmenter::default()
            .segment("Our fund is GUARANTEED to return 12% a year.", SegmentMode::Chunk)
            .unwrap()
            .remove(0);
        let category = CategoryKey::new("regulatory").unwrap();
        let rules = vec![
            rule("R1", &["guaranteed"], None, Severity::Critical),
            rule("R2", &[], Some(r"\d+% a year"), Severity::High),
            rule("R3", &["risk-free"], None, Severity::High),
            rule("R4", &[], None, Severity::Low),
        ];

        let success = KeywordEvaluator::new(category.clone())
            .evaluate(EvaluationRequest {
                submission_id: "s",
                unit: &unit,
                category: &category,
                rules: &rules,
            })
            .await
            .unwrap();

        let output = success.output;
        assert_eq!(output.violations.len(), 2);
        assert_eq!(output.violations[0].rule_id.as_deref(), Some("R1"));
        assert_eq!(output.violations[0].current_text.as_deref(), Some("GUARANTEED"));
        assert_eq!(output.violations[1].current_text.as_deref(), Some("12% a year"));
        assert_eq!(output.overall_assessment, "2 of 4 regulatory rules matched.");
        assert_eq!(success.usage.total(), 0);
    }

    #[tokio::test]
    async fn test_matchers_compiled_once_across_units() {
        let units = Segmenter::default()
            .segment("guaranteed\nnothing\n5% a year", SegmentMode::Line)
            .unwrap();
        let category = CategoryKey::new("regulatory").unwrap();
        let rules = vec![
            rule("R1", &["guaranteed"], None, Severity::Critical),
            rule("R2", &[], Some(r"\d+% a year"), Severity::High),
        ];
        let evaluator = KeywordEvaluator::new(category.clone());

        let mut matched = 0;
        for unit in &units {
            let success = evaluator
                .evaluate(EvaluationRequest {
                    submission_id: "s",
                    unit,
                    category: &category,
                    rules: &rules,
                })
                .await
                .unwrap();
            matched += success.output.violations.len();
        }
        assert_eq!(matched, 2);
        assert_eq!(evaluator.compiled(), 2);

        // Same id, new pattern: recompiled, not served stale.
        let edited = vec![rule("R2", &[], Some("nothing"), Severity::High)];
        let success = evaluator
            .evaluate(EvaluationRequest {
                submission_id: "s",
                unit: &units[1],
                category: &category,
                rules: &edited,
            })
            .await
            .unwrap();
        assert_eq!(success.output.violations.len(), 1);
        assert_eq!(evaluator.compiled(), 3);
    }

    #[tokio::test]
    async fn test_bad_pattern_is_a_task_failure() {
        let unit = Segmenter::default()
            .segment("text", SegmentMode::Line)
            .unwrap()
            .remove(0);
        let category = CategoryKey::new("regulatory").unwrap();
        let rules = vec![rule("R1", &[], Some("("), Severity::Low)];

        let failure = KeywordEvaluator::new(category.clone())
            .evaluate(EvaluationRequest {
                submission_id: "s",
                unit: &unit,
                category: &category,
                rules: &rules,
            })
            .await
            .unwrap_err();
        assert!(failure.cause.contains("R1"));
    }
}
