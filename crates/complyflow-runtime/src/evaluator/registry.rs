//! Mapping from category to the evaluator that owns it.

use std::collections::BTreeMap;
use std::sync::Arc;

use complyflow_core::{CategoryKey, CategoryRegistry};

use super::{CategoryEvaluator, KeywordEvaluator, LlmCategoryEvaluator};
use crate::cache::EvaluationCache;
use crate::config::RuntimeConfig;
use crate::providers::LlmProvider;
use crate::usage::UsageTracker;

/// Evaluators keyed by category. At most one per category.
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    evaluators: BTreeMap<CategoryKey, Arc<dyn CategoryEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an evaluator under its own category, returning any it replaced.
    pub fn register(
        &mut self,
        evaluator: Arc<dyn CategoryEvaluator>,
    ) -> Option<Arc<dyn CategoryEvaluator>> {
        self.evaluators
            .insert(evaluator.category().clone(), evaluator)
    }

    pub fn get(&self, category: &CategoryKey) -> Option<&Arc<dyn CategoryEvaluator>> {
        self.evaluators.get(category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryKey> {
        self.evaluators.keys()
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    /// Registered categories with no evaluator.
    pub fn missing(&self, categories: &CategoryRegistry) -> Vec<CategoryKey> {
        categories
            .iter()
            .filter(|c| !self.evaluators.contains_key(*c))
            .cloned()
            .collect()
    }

    /// Evaluators whose category is not registered.
    pub fn unknown(&self, categories: &CategoryRegistry) -> Vec<CategoryKey> {
        self.evaluators
            .keys()
            .filter(|c| !categories.contains(c))
            .cloned()
            .collect()
    }

    /// A keyword evaluator for every registered category.
    pub fn keyword(categories: &CategoryRegistry) -> Self {
        let mut registry = Self::new();
        for category in categories.iter() {
            registry.register(Arc::new(KeywordEvaluator::new(category.clone())));
        }
        registry
    }

    /// An LLM evaluator for every registered category, sharing one provider,
    /// cache and usage tracker.
    pub fn llm(
        config: &RuntimeConfig,
        provider: Arc<dyn LlmProvider>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        let cache = EvaluationCache::from_config(&config.cache).map(Arc::new);
        let mut registry = Self::new();
        for category in config.scoring.registry().iter() {
            let mut evaluator = LlmCategoryEvaluator::new(
                category.clone(),
                provider.clone(),
                config.llm.clone(),
                config.evaluation.clone(),
            )
            .with_usage_tracker(usage.clone());
            if let Some(cache) = &cache {
                evaluator = evaluator.with_cache(cache.clone());
            }
            registry.register(Arc::new(evaluator));
        }
        registry
    }
}

impl std::fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.evaluators.iter().map(|(k, v)| (k.as_str(), v.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyflow_core::ScoringConfig;

    #[test]
    fn test_keyword_registry_covers_config() {
        let categories = ScoringConfig::default().registry();
        let registry = EvaluatorRegistry::keyword(&categories);
        assert_eq!(registry.len(), 3);
        assert!(registry.missing(&categories).is_empty());
        assert!(registry.unknown(&categories).is_empty());
        assert_eq!(
            registry.get(&CategoryKey::new("seo").unwrap()).unwrap().name(),
            "seo_keywords"
        );
    }

    #[test]
    fn test_missing_and_unknown() {
        let categories = ScoringConfig::default().registry();
        let mut registry = EvaluatorRegistry::new();
        registry.register(Arc::new(KeywordEvaluator::new(
            CategoryKey::new("brand").unwrap(),
        )));
        registry.register(Arc::new(KeywordEvaluator::new(
            CategoryKey::new("legal").unwrap(),
        )));

        let missing: Vec<_> = registry
            .missing(&categories)
            .into_iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(missing, vec!["regulatory", "seo"]);
        assert_eq!(
            registry.unknown(&categories),
            vec![CategoryKey::new("legal").unwrap()]
        );
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = EvaluatorRegistry::new();
        let brand = CategoryKey::new("brand").unwrap();
        assert!(registry
            .register(Arc::new(KeywordEvaluator::new(brand.clone())))
            .is_none());
        assert!(registry
            .register(Arc::new(KeywordEvaluator::new(brand)))
            .is_some());
        assert_eq!(registry.len(), 1);
    }
}
