//! Structured output validation for evaluator replies.
//!
//! A reply is accepted only after four checks, in order:
//! 1. Markdown code fences are stripped and the rest parses as JSON
//! 2. The JSON matches `schemas/evaluation_output.schema.json`
//! 3. It deserializes into [`EvaluationOutput`]
//! 4. Semantic checks: claimed categories match, rule ids are known
//!
//! Unknown rule ids are nulled rather than rejected.

use std::collections::HashSet;
use std::sync::OnceLock;

use complyflow_core::{CategoryKey, EvaluationOutput, RuleDefinition};
use lazy_static::lazy_static;
use regex::Regex;

use super::ValidationFailed;

const OUTPUT_SCHEMA_JSON: &str = include_str!("../../schemas/evaluation_output.schema.json");

static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

lazy_static! {
    static ref CODE_FENCE: Regex =
        Regex::new(r"(?s)^\s*```[a-zA-Z0-9_-]*\s*\n?(.*?)\n?\s*```\s*$").unwrap();
}

fn get_validator() -> Result<&'static jsonschema::Validator, ValidationFailed> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(OUTPUT_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;
        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result
        .as_ref()
        .map_err(|e| ValidationFailed::Schema(vec![e.clone()]))
}

/// Remove a surrounding ```` ```json ```` fence, if any.
pub fn strip_code_fences(raw: &str) -> &str {
    match CODE_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => raw.trim(),
    }
}

/// Check a JSON value against the output schema.
pub fn validate_output_schema(value: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validates raw replies for one category and rule set.
pub struct OutputValidator<'a> {
    category: &'a CategoryKey,
    rule_ids: HashSet<&'a str>,
}

impl<'a> OutputValidator<'a> {
    pub fn new(category: &'a CategoryKey, rules: &'a [RuleDefinition]) -> Self {
        Self {
            category,
            rule_ids: rules.iter().map(|r| r.id.as_str()).collect(),
        }
    }

    pub fn validate(&self, raw: &str) -> Result<EvaluationOutput, ValidationFailed> {
        let body = strip_code_fences(raw);
        if body.is_empty() {
            return Err(ValidationFailed::NotJson("empty response".to_string()));
        }

        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| ValidationFailed::NotJson(e.to_string()))?;

        validate_output_schema(&value).map_err(ValidationFailed::Schema)?;

        let mut output: EvaluationOutput =
            serde_json::from_value(value).map_err(|e| ValidationFailed::Malformed(e.to_string()))?;

        for (index, violation) in output.violations.iter_mut().enumerate() {
            if let Some(claimed) = violation.category.as_deref() {
                let matches = CategoryKey::new(claimed)
                    .map(|key| &key == self.category)
                    .unwrap_or(false);
                if !matches {
                    return Err(ValidationFailed::Semantic(format!(
                        "violations[{}].category is '{}', expected '{}'",
                        index, claimed, self.category
                    )));
                }
            }

            if violation.description.trim().is_empty() {
                return Err(ValidationFailed::Semantic(format!(
                    "violations[{}].description is empty",
                    index
                )));
            }

            let unknown = violation
                .rule_id
                .as_deref()
                .is_some_and(|id| !self.rule_ids.contains(id));
            if unknown {
                tracing::debug!(
                    category = %self.category,
                    rule_id = ?violation.rule_id,
                    "Dropping unknown rule id from evaluator output"
                );
                violation.rule_id = None;
            }
        }

        Ok(output)
    }
}
