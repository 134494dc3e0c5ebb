//! Token and cost accounting for evaluator calls.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use complyflow_core::CategoryKey;

use crate::providers::TokenUsage;

/// Accumulated LLM usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,

    /// Number of LLM calls made
    pub llm_calls: u32,

    /// Evaluations served from the cache
    pub cache_hits: u32,

    /// Estimated cost in USD
    pub estimated_cost: f64,
}

impl LlmUsage {
    /// Add usage from one provider response.
    pub fn add(&mut self, usage: &TokenUsage, model: &str) {
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.total_tokens += u64::from(usage.total());
        self.llm_calls += 1;
        self.estimated_cost += estimate_cost(usage, model);
    }

    pub fn merge(&mut self, other: &LlmUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.llm_calls += other.llm_calls;
        self.cache_hits += other.cache_hits;
        self.estimated_cost += other.estimated_cost;
    }
}

/// Estimated USD cost of one call.
pub fn estimate_cost(usage: &TokenUsage, model: &str) -> f64 {
    // Pricing per million tokens
    let (input_rate, output_rate) = match model {
        m if m.contains("gpt-4o-mini") => (0.15, 0.6),
        m if m.contains("gpt-4o") => (2.5, 10.0),
        m if m.contains("gpt-4.1-mini") => (0.4, 1.6),
        m if m.contains("sonnet-4-5") => (3.0, 15.0),
        m if m.contains("haiku-4-5") => (1.0, 5.0),
        // Local models (ollama, vllm)
        m if m.starts_with("llama") || m.starts_with("qwen") || m.starts_with("mistral") => {
            (0.0, 0.0)
        }
        _ => (3.0, 15.0),
    };

    let input_cost = (usage.prompt_tokens as f64 / 1_000_000.0) * input_rate;
    let output_cost = (usage.completion_tokens as f64 / 1_000_000.0) * output_rate;
    input_cost + output_cost
}

/// Usage across a run, total and per category. Safe to share between tasks.
#[derive(Default)]
pub struct UsageTracker {
    total: RwLock<LlmUsage>,
    per_category: RwLock<BTreeMap<CategoryKey, LlmUsage>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one provider call.
    pub fn record(&self, category: &CategoryKey, usage: &TokenUsage, model: &str) {
        self.total.write().add(usage, model);
        self.per_category
            .write()
            .entry(category.clone())
            .or_default()
            .add(usage, model);
    }

    pub fn record_cache_hit(&self, category: &CategoryKey) {
        self.total.write().cache_hits += 1;
        self.per_category
            .write()
            .entry(category.clone())
            .or_default()
            .cache_hits += 1;
    }

    pub fn total(&self) -> LlmUsage {
        self.total.read().clone()
    }

    pub fn for_category(&self, category: &CategoryKey) -> LlmUsage {
        self.per_category
            .read()
            .get(category)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<CategoryKey, LlmUsage> {
        self.per_category.read().clone()
    }

    pub fn reset(&self) {
        *self.total.write() = LlmUsage::default();
        self.per_category.write().clear();
    }
}

impl std::fmt::Debug for UsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTracker")
            .field("total", &*self.total.read())
            .finish()
    }
}
