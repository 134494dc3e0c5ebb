//! In-memory cache of evaluation outputs.
//!
//! Identical (category, rule set, unit text) triples skip the LLM call.

use moka::future::Cache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use complyflow_core::{CategoryKey, EvaluationOutput, RuleDefinition};

use crate::config::CacheConfig;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    category: CategoryKey,
    rules_fingerprint: u64,
    text_hash: u64,
}

impl CacheKey {
    pub fn new(category: &CategoryKey, rules: &[RuleDefinition], text: &str) -> Self {
        Self {
            category: category.clone(),
            rules_fingerprint: fingerprint_rules(rules),
            text_hash: hash_text(text),
        }
    }
}

/// Evaluation cache using moka.
pub struct EvaluationCache {
    cache: Cache<CacheKey, EvaluationOutput>,
}

impl EvaluationCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    /// `None` when caching is disabled.
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.max_entries, config.ttl))
    }

    pub async fn get(&self, key: &CacheKey) -> Option<EvaluationOutput> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: CacheKey, output: EvaluationOutput) {
        self.cache.insert(key, output).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for EvaluationCache {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3600))
    }
}

// Hash helpers

fn fingerprint_rules(rules: &[RuleDefinition]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for rule in rules {
        rule.id.hash(&mut hasher);
        rule.text.hash(&mut hasher);
        rule.severity.hash(&mut hasher);
        rule.keywords.hash(&mut hasher);
        rule.pattern.hash(&mut hasher);
    }
    hasher.finish()
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyflow_core::Severity;

    fn rule(id: &str, text: &str) -> RuleDefinition {
        RuleDefinition {
            id: id.to_string(),
            category: CategoryKey::new("seo").unwrap(),
            text: text.to_string(),
            severity: Severity::Low,
            keywords: vec![],
            pattern: None,
            active: true,
            project_id: None,
        }
    }

    #[test]
    fn test_key_depends_on_rules_and_text() {
        let seo = CategoryKey::new("seo").unwrap();
        let rules = vec![rule("S1", "Title under 60 chars")];
        let a = CacheKey::new(&seo, &rules, "Hello");
        assert_eq!(a, CacheKey::new(&seo, &rules, "Hello"));
        assert_ne!(a, CacheKey::new(&seo, &rules, "Hello!"));
        assert_ne!(a, CacheKey::new(&seo, &[rule("S1", "Title under 70 chars")], "Hello"));
        assert_ne!(a, CacheKey::new(&CategoryKey::new("brand").unwrap(), &rules, "Hello"));
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = EvaluationCache::default();
        let seo = CategoryKey::new("seo").unwrap();
        let key = CacheKey::new(&seo, &[], "text");
        assert!(cache.get(&key).await.is_none());

        let output = EvaluationOutput {
            overall_assessment: "fine".to_string(),
            ..Default::default()
        };
        cache.insert(key.clone(), output.clone()).await;
        assert_eq!(cache.get(&key).await, Some(output));
    }

    #[test]
    fn test_disabled_cache() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(EvaluationCache::from_config(&config).is_none());
        assert!(EvaluationCache::from_config(&CacheConfig::default()).is_some());
    }
}
