//! Shared domain types: severities, category keys and violations.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::segmenter::ContentUnit;

lazy_static! {
    static ref CATEGORY_KEY_PATTERN: Regex = Regex::new(r"^[a-z][a-z0-9_-]{0,31}$").unwrap();
}

/// Errors raised when constructing or resolving categories.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CategoryError {
    #[error("Invalid category key '{0}': expected lowercase letters, digits, '-' or '_'")]
    InvalidKey(String),

    #[error("Unknown category '{category}'. Registered: {registered:?}")]
    Unknown {
        category: String,
        registered: Vec<String>,
    },
}

/// Ordinal violation importance.
///
/// Declaration order is the severity order, so `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// All severities, most severe first.
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// A validated rule category tag (e.g. `regulatory`, `brand`, `seo`).
///
/// Keys are normalized to lowercase on construction. Whether a key is
/// actually usable is decided by a [`CategoryRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CategoryKey(String);

impl CategoryKey {
    pub fn new(key: impl AsRef<str>) -> Result<Self, CategoryError> {
        let normalized = key.as_ref().trim().to_ascii_lowercase();
        if CATEGORY_KEY_PATTERN.is_match(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(CategoryError::InvalidKey(key.as_ref().to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CategoryKey {
    type Error = CategoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CategoryKey> for String {
    fn from(key: CategoryKey) -> Self {
        key.0
    }
}

impl fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of categories a deployment knows about.
///
/// Built from scoring configuration; anything outside it is rejected when
/// rules are loaded or evaluators are registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryRegistry {
    keys: BTreeSet<CategoryKey>,
}

impl CategoryRegistry {
    pub fn new(keys: impl IntoIterator<Item = CategoryKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn contains(&self, key: &CategoryKey) -> bool {
        self.keys.contains(key)
    }

    /// Resolve a raw tag into a registered key.
    pub fn resolve(&self, raw: &str) -> Result<CategoryKey, CategoryError> {
        let key = CategoryKey::new(raw)?;
        if self.contains(&key) {
            Ok(key)
        } else {
            Err(CategoryError::Unknown {
                category: key.0,
                registered: self.keys.iter().map(|k| k.0.clone()).collect(),
            })
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoryKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A violation as reported by an evaluator, before it is tied to a content unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedViolation {
    /// Category claimed by the evaluator; overwritten with the evaluator's own category.
    #[serde(default)]
    pub category: Option<String>,

    pub severity: Severity,

    #[serde(default)]
    pub rule_id: Option<String>,

    pub description: String,

    /// Free-form location hint from the evaluator. Not trusted for display.
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub current_text: Option<String>,

    #[serde(default)]
    pub suggested_fix: Option<String>,

    #[serde(default)]
    pub auto_fixable: bool,
}

impl ReportedViolation {
    /// Bind this report to the unit and category that produced it.
    pub fn into_violation(self, category: &CategoryKey, unit: &ContentUnit) -> Violation {
        Violation {
            category: category.clone(),
            severity: self.severity,
            rule_id: self.rule_id,
            description: self.description,
            location: unit.location(),
            current_text: self.current_text,
            suggested_fix: self.suggested_fix,
            auto_fixable: self.auto_fixable,
            unit_id: unit.id.clone(),
            unit_index: unit.ordinal_index,
        }
    }
}

/// Structured result of evaluating one content unit against one category.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvaluationOutput {
    #[serde(default)]
    pub violations: Vec<ReportedViolation>,

    pub overall_assessment: String,

    #[serde(default)]
    pub key_issues: Vec<String>,
}

/// A compliance violation anchored to a content unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Always the category of the evaluator that produced it.
    pub category: CategoryKey,
    pub severity: Severity,
    pub rule_id: Option<String>,
    pub description: String,
    /// Stable location string derived from the originating unit.
    pub location: String,
    pub current_text: Option<String>,
    pub suggested_fix: Option<String>,
    pub auto_fixable: bool,
    pub unit_id: String,
    pub unit_index: usize,
}
