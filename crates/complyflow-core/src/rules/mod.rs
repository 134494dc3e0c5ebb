//! Rule definitions and active-rule grouping.

mod parser;

pub use parser::{RuleError, RuleFile};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{CategoryKey, CategoryRegistry, Severity};

/// A single compliance rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Unique identifier (e.g., "REG-001")
    pub id: String,

    pub category: CategoryKey,

    /// The rule text shown to evaluators
    pub text: String,

    pub severity: Severity,

    /// Terms whose presence suggests the rule applies
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Optional regex that flags a likely violation outright
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default = "default_active")]
    pub active: bool,

    /// Owning project. `None` marks a global rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Active rules grouped by category, most severe first.
///
/// Every registered category has an entry, possibly empty. The dispatcher
/// relies on key presence to know a category exists and on emptiness to skip it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveRules {
    by_category: BTreeMap<CategoryKey, Vec<RuleDefinition>>,
}

impl ActiveRules {
    /// Group rules for one project scope.
    ///
    /// Keeps rules that are active and whose `project_id` equals `project_id`
    /// (`None` selects global rules). Within a category rules are ordered
    /// critical → low; ties keep their input order.
    pub fn group<'a>(
        rules: impl IntoIterator<Item = &'a RuleDefinition>,
        registry: &CategoryRegistry,
        project_id: Option<&str>,
    ) -> Result<Self, RuleError> {
        let mut by_category: BTreeMap<CategoryKey, Vec<RuleDefinition>> = registry
            .iter()
            .map(|key| (key.clone(), Vec::new()))
            .collect();

        for rule in rules {
            if !rule.active || rule.project_id.as_deref() != project_id {
                continue;
            }
            let bucket = by_category.get_mut(&rule.category).ok_or_else(|| {
                RuleError::UnknownCategory {
                    rule_id: rule.id.clone(),
                    category: rule.category.to_string(),
                }
            })?;
            bucket.push(rule.clone());
        }

        for bucket in by_category.values_mut() {
            // Vec::sort_by is stable.
            bucket.sort_by(|a, b| b.severity.cmp(&a.severity));
        }

        Ok(Self { by_category })
    }

    pub fn get(&self, category: &CategoryKey) -> Option<&[RuleDefinition]> {
        self.by_category.get(category).map(Vec::as_slice)
    }

    /// Every category present, including those with no rules.
    pub fn categories(&self) -> impl Iterator<Item = &CategoryKey> {
        self.by_category.keys()
    }

    /// Categories with at least one rule, in key order.
    pub fn active_categories(&self) -> impl Iterator<Item = (&CategoryKey, &[RuleDefinition])> {
        self.by_category
            .iter()
            .filter(|(_, rules)| !rules.is_empty())
            .map(|(key, rules)| (key, rules.as_slice()))
    }

    pub fn total_rules(&self) -> usize {
        self.by_category.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_rules() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn rule(id: &str, category: &str, severity: Severity) -> RuleDefinition {
        RuleDefinition {
            id: id.to_string(),
            category: CategoryKey::new(category).unwrap(),
            text: format!("Rule {}", id),
            severity,
            keywords: vec![],
            pattern: None,
            active: true,
            project_id: None,
        }
    }

    fn registry() -> CategoryRegistry {
        CategoryRegistry::new(
            ["regulatory", "brand", "seo"]
                .iter()
                .map(|k| CategoryKey::new(k).unwrap()),
        )
    }

    #[test]
    fn test_group_sorts_by_severity_stably() {
        let rules = vec![
            rule("R1", "regulatory", Severity::Low),
            rule("R2", "regulatory", Severity::Critical),
            rule("R3", "regulatory", Severity::Low),
            rule("R4", "regulatory", Severity::High),
            rule("R5", "regulatory", Severity::Critical),
        ];
        let active = ActiveRules::group(&rules, &registry(), None).unwrap();
        let ids: Vec<&str> = active
            .get(&CategoryKey::new("regulatory").unwrap())
            .unwrap()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["R2", "R5", "R4", "R1", "R3"]);
    }

    #[test]
    fn test_empty_categories_present() {
        let rules = vec![rule("B1", "brand", Severity::Medium)];
        let active = ActiveRules::group(&rules, &registry(), None).unwrap();

        assert_eq!(active.categories().count(), 3);
        assert_eq!(
            active.get(&CategoryKey::new("seo").unwrap()).map(|r| r.len()),
            Some(0)
        );
        let names: Vec<&str> = active.active_categories().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["brand"]);
    }

    #[test]
    fn test_inactive_and_scoped_rules_filtered() {
        let mut inactive = rule("R1", "regulatory", Severity::High);
        inactive.active = false;
        let mut scoped = rule("R2", "regulatory", Severity::High);
        scoped.project_id = Some("acme".to_string());
        let global = rule("R3", "regulatory", Severity::High);
        let rules = vec![inactive, scoped, global];

        let global_set = ActiveRules::group(&rules, &registry(), None).unwrap();
        assert_eq!(global_set.total_rules(), 1);

        let acme = ActiveRules::group(&rules, &registry(), Some("acme")).unwrap();
        assert_eq!(acme.total_rules(), 1);
        assert_eq!(
            acme.get(&CategoryKey::new("regulatory").unwrap()).unwrap()[0].id,
            "R2"
        );
    }

    #[test]
    fn test_unknown_category_rejected() {
        let rules = vec![rule("X1", "legal", Severity::Low)];
        let result = ActiveRules::group(&rules, &registry(), None);
        assert!(matches!(result, Err(RuleError::UnknownCategory { .. })));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let rules = vec![rule("S1", "seo", Severity::Low)];
        let active = ActiveRules::group(&rules, &registry(), None).unwrap();
        let value = serde_json::to_value(&active).unwrap();
        assert!(value["brand"].as_array().unwrap().is_empty());
        assert_eq!(value["seo"][0]["id"], "S1");

        let back: ActiveRules = serde_json::from_value(value).unwrap();
        assert_eq!(back, active);
    }
}
