//! Rule file parsing from YAML/JSON.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::RuleDefinition;
use crate::types::CategoryRegistry;

/// Errors that can occur when loading or grouping rules.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Failed to read rule file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Rule validation failed: {0}")]
    ValidationError(String),

    #[error("Rule '{rule_id}' has unregistered category '{category}'")]
    UnknownCategory { rule_id: String, category: String },

    #[error("Rule '{rule_id}' has an invalid pattern: {source}")]
    InvalidPattern {
        rule_id: String,
        #[source]
        source: regex::Error,
    },
}

/// A set of rules as stored on disk.
///
/// ```yaml
/// rules:
///   - id: REG-001
///     category: regulatory
///     severity: critical
///     text: "Guaranteed returns must not be promised"
///     keywords: [guaranteed, assured]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl RuleFile {
    /// Parse rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, RuleError> {
        let file: RuleFile = serde_yaml::from_str(yaml)?;
        file.validate()?;
        Ok(file)
    }

    /// Parse rules from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, RuleError> {
        let file: RuleFile = serde_json::from_str(json)?;
        file.validate()?;
        Ok(file)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Structural checks: unique ids, non-empty text, compilable patterns.
    pub fn validate(&self) -> Result<(), RuleError> {
        let mut seen = HashSet::new();

        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(RuleError::ValidationError(
                    "Rule with empty id".to_string(),
                ));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(RuleError::ValidationError(format!(
                    "Duplicate rule ID: {}",
                    rule.id
                )));
            }
            if rule.text.trim().is_empty() {
                return Err(RuleError::ValidationError(format!(
                    "Rule {} has empty text",
                    rule.id
                )));
            }
            if let Some(pattern) = &rule.pattern {
                Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
                    rule_id: rule.id.clone(),
                    source,
                })?;
            }
        }

        Ok(())
    }

    /// Check every rule's category against a registry.
    pub fn validate_categories(&self, registry: &CategoryRegistry) -> Result<(), RuleError> {
        match self.rules.iter().find(|r| !registry.contains(&r.category)) {
            Some(rule) => Err(RuleError::UnknownCategory {
                rule_id: rule.id.clone(),
                category: rule.category.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CategoryKey, Severity};

    const VALID_RULES: &str = r#"
rules:
  - id: REG-001
    category: regulatory
    severity: critical
    text: "Guaranteed returns must not be promised"
    keywords: [guaranteed, assured]
  - id: BR-001
    category: Brand
    severity: low
    text: "Use the registered product name"
    active: false
  - id: SEO-001
    category: seo
    severity: medium
    text: "Headings should contain the product keyword"
    project_id: acme
"#;

    #[test]
    fn test_parse_valid_rules() {
        let file = RuleFile::from_yaml(VALID_RULES).unwrap();
        assert_eq!(file.rules.len(), 3);
        assert_eq!(file.rules[0].severity, Severity::Critical);
        assert_eq!(file.rules[0].keywords, vec!["guaranteed", "assured"]);
        assert!(file.rules[0].active);
        assert!(!file.rules[1].active);
        assert_eq!(file.rules[1].category.as_str(), "brand");
        assert_eq!(file.rules[2].project_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_duplicate_rule_ids() {
        let yaml = r#"
rules:
  - { id: R1, category: seo, severity: low, text: "one" }
  - { id: R1, category: seo, severity: low, text: "two" }
"#;
        let result = RuleFile::from_yaml(yaml);
        assert!(matches!(result, Err(RuleError::ValidationError(_))));
    }

    #[test]
    fn test_invalid_pattern() {
        let json = r#"{"rules":[{"id":"R1","category":"seo","severity":"low","text":"t","pattern":"(unclosed"}]}"#;
        let result = RuleFile::from_json(json);
        assert!(matches!(result, Err(RuleError::InvalidPattern { .. })));
    }

    #[test]
    fn test_unknown_severity_is_parse_error() {
        let yaml = r#"
rules:
  - { id: R1, category: seo, severity: urgent, text: "t" }
"#;
        assert!(matches!(
            RuleFile::from_yaml(yaml),
            Err(RuleError::YamlError(_))
        ));
    }

    #[test]
    fn test_validate_categories() {
        let file = RuleFile::from_yaml(VALID_RULES).unwrap();
        let registry = CategoryRegistry::new(
            ["regulatory", "seo"].iter().map(|k| CategoryKey::new(k).unwrap()),
        );
        match file.validate_categories(&registry) {
            Err(RuleError::UnknownCategory { rule_id, .. }) => assert_eq!(rule_id, "BR-001"),
            other => panic!("Expected UnknownCategory, got {:?}", other),
        }
    }
}
