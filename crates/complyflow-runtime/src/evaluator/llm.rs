//! LLM-backed category evaluator with retry-with-feedback.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use complyflow_core::CategoryKey;

use super::{
    CategoryEvaluator, EvaluationFailed, EvaluationRequest, EvaluationSuccess, OutputValidator,
};
use crate::cache::{CacheKey, EvaluationCache};
use crate::config::EvaluationConfig;
use crate::prompts;
use crate::providers::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError, TokenUsage,
};
use crate::usage::UsageTracker;

/// Evaluates one category by prompting an [`LlmProvider`].
///
/// Each attempt runs call → parse → validate in order. A reply that fails
/// validation is appended to the conversation together with the error, and
/// the model is asked again, up to `max_attempts` calls in total. Transient
/// transport errors are retried separately with exponential backoff and do
/// not count as attempts.
pub struct LlmCategoryEvaluator {
    category: CategoryKey,
    name: String,
    provider: Arc<dyn LlmProvider>,
    completion: CompletionConfig,
    policy: EvaluationConfig,
    cache: Option<Arc<EvaluationCache>>,
    usage: Option<Arc<UsageTracker>>,
}

impl LlmCategoryEvaluator {
    pub fn new(
        category: CategoryKey,
        provider: Arc<dyn LlmProvider>,
        completion: CompletionConfig,
        policy: EvaluationConfig,
    ) -> Self {
        let name = format!("{}_analysis", category);
        Self {
            category,
            name,
            provider,
            completion,
            policy,
            cache: None,
            usage: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<EvaluationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_usage_tracker(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    async fn call(&self, messages: &[ChatMessage]) -> Result<CompletionResponse, ProviderError> {
        let provider = &self.provider;
        let completion = &self.completion;

        (|| async move { provider.complete(messages.to_vec(), completion).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(self.policy.transport_min_delay)
                    .with_max_times(self.policy.transport_retries),
            )
            .when(ProviderError::is_transient)
            .notify(|err: &ProviderError, delay: Duration| {
                tracing::warn!(
                    category = %self.category,
                    provider = provider.name(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transient provider error, retrying"
                );
            })
            .await
    }
}

#[async_trait]
impl CategoryEvaluator for LlmCategoryEvaluator {
    fn category(&self) -> &CategoryKey {
        &self.category
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        skip(self, request),
        fields(
            submission_id = %request.submission_id,
            category = %self.category,
            unit_index = request.unit.ordinal_index
        )
    )]
    async fn evaluate(
        &self,
        request: EvaluationRequest<'_>,
    ) -> Result<EvaluationSuccess, EvaluationFailed> {
        if request.category != &self.category {
            return Err(EvaluationFailed::new(
                &request,
                format!("evaluator for '{}' received '{}'", self.category, request.category),
            ));
        }

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| CacheKey::new(request.category, request.rules, &request.unit.text));

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(output) = cache.get(key).await {
                tracing::debug!("Serving evaluation from cache");
                if let Some(usage) = &self.usage {
                    usage.record_cache_hit(&self.category);
                }
                return Ok(EvaluationSuccess {
                    output,
                    usage: TokenUsage::default(),
                    attempts: 0,
                    cached: true,
                    model: None,
                });
            }
        }

        let validator = OutputValidator::new(request.category, request.rules);
        let mut messages = vec![
            ChatMessage::system(prompts::system_prompt(&self.category)),
            ChatMessage::user(prompts::build_user_prompt(
                &request.unit.text,
                &self.category,
                request.rules,
            )),
        ];

        let max_attempts = self.policy.max_attempts.max(1);
        let mut spent = TokenUsage::default();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let response = match self.call(&messages).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Provider call failed");
                    return Err(EvaluationFailed::new(&request, e.to_string())
                        .with_attempts(attempt, spent));
                }
            };

            spent += response.usage;
            if let Some(usage) = &self.usage {
                usage.record(&self.category, &response.usage, &response.model);
            }

            match validator.validate(&response.content) {
                Ok(output) => {
                    if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                        cache.insert(key, output.clone()).await;
                    }
                    return Ok(EvaluationSuccess {
                        output,
                        usage: spent,
                        attempts: attempt,
                        cached: false,
                        model: Some(response.model),
                    });
                }
                Err(err) => {
                    tracing::warn!(attempt, max_attempts, error = %err, "Evaluator output rejected");
                    last_error = err.to_string();
                    if attempt < max_attempts {
                        messages.push(ChatMessage::assistant(response.content));
                        messages.push(ChatMessage::user(prompts::validation_feedback(&err)));
                        if !self.policy.retry_delay.is_zero() {
                            tokio::time::sleep(self.policy.retry_delay).await;
                        }
                    }
                }
            }
        }

        Err(EvaluationFailed::new(
            &request,
            format!(
                "no valid output after {} attempts: {}",
                max_attempts, last_error
            ),
        )
        .with_attempts(max_attempts, spent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyflow_core::{
        ContentUnit, RuleDefinition, SegmentMode, Segmenter, Severity,
    };
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned replies and records every conversation it was sent.
    struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<String, ProviderError>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(
            &self,
            messages: Vec<ChatMessage>,
            config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            self.seen.lock().push(messages);
            let next = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::ParseError("script exhausted".into())));
            next.map(|content| CompletionResponse {
                content,
                usage: TokenUsage::new(100, 20),
                model: config.model.clone(),
                stop_reason: Some("stop".into()),
            })
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn fast_policy() -> EvaluationConfig {
        EvaluationConfig {
            retry_delay: Duration::ZERO,
            transport_min_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn fixture() -> (ContentUnit, CategoryKey, Vec<RuleDefinition>) {
        let unit = Segmenter::default()
            .segment("Returns are guaranteed.", SegmentMode::Chunk)
            .unwrap()
            .remove(0);
        let category = CategoryKey::new("regulatory").unwrap();
        let rules = vec![RuleDefinition {
            id: "REG-001".to_string(),
            category: category.clone(),
            text: "No guaranteed returns".to_string(),
            severity: Severity::Critical,
            keywords: vec![],
            pattern: None,
            active: true,
            project_id: None,
        }];
        (unit, category, rules)
    }

    const VALID: &str = r#"{"violations":[{"severity":"critical","rule_id":"REG-001","description":"Guarantee"}],"overall_assessment":"Risky"}"#;

    #[tokio::test]
    async fn test_valid_reply_first_time() {
        let (unit, category, rules) = fixture();
        let provider = ScriptedProvider::new(vec![Ok(format!("```json\n{}\n```", VALID))]);
        let usage = Arc::new(UsageTracker::new());
        let evaluator = LlmCategoryEvaluator::new(
            category.clone(),
            provider.clone(),
            CompletionConfig::default(),
            fast_policy(),
        )
        .with_usage_tracker(usage.clone());

        let success = evaluator
            .evaluate(EvaluationRequest {
                submission_id: "s",
                unit: &unit,
                category: &category,
                rules: &rules,
            })
            .await
            .unwrap();

        assert_eq!(success.attempts, 1);
        assert_eq!(success.output.violations.len(), 1);
        assert_eq!(success.usage.total(), 120);
        assert_eq!(usage.total().llm_calls, 1);

        let first_call = &provider.seen.lock()[0];
        assert_eq!(first_call[0].role, "system");
        assert!(first_call[1].content.contains("REG-001"));
    }

    #[tokio::test]
    async fn test_invalid_reply_is_fed_back() {
        let (unit, category, rules) = fixture();
        let provider = ScriptedProvider::new(vec![
            Ok("not json at all".to_string()),
            Ok(VALID.to_string()),
        ]);
        let evaluator = LlmCategoryEvaluator::new(
            category.clone(),
            provider.clone(),
            CompletionConfig::default(),
            fast_policy(),
        );

        let success = evaluator
            .evaluate(EvaluationRequest {
                submission_id: "s",
                unit: &unit,
                category: &category,
                rules: &rules,
            })
            .await
            .unwrap();
        assert_eq!(success.attempts, 2);
        assert_eq!(success.usage.total(), 240);

        let second_call = &provider.seen.lock()[1];
        assert_eq!(second_call.len(), 4);
        assert_eq!(second_call[2].role, "assistant");
        assert_eq!(second_call[2].content, "not json at all");
        assert!(second_call[3].content.contains("Please CORRECT the JSON output"));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (unit, category, rules) = fixture();
        let provider = ScriptedProvider::new(vec![
            Ok("{}".to_string()),
            Ok("{}".to_string()),
            Ok("{}".to_string()),
            Ok(VALID.to_string()),
        ]);
        let evaluator = LlmCategoryEvaluator::new(
            category.clone(),
            provider.clone(),
            CompletionConfig::default(),
            fast_policy(),
        );

        let failure = evaluator
            .evaluate(EvaluationRequest {
                submission_id: "s",
                unit: &unit,
                category: &category,
                rules: &rules,
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.unit_id, unit.id);
        assert!(failure.cause.contains("no valid output after 3 attempts"));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_with_backoff() {
        let (unit, category, rules) = fixture();
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::RateLimited { retry_after: None }),
            Ok(VALID.to_string()),
        ]);
        let evaluator = LlmCategoryEvaluator::new(
            category.clone(),
            provider.clone(),
            CompletionConfig::default(),
            fast_policy(),
        );

        let success = evaluator
            .evaluate(EvaluationRequest {
                submission_id: "s",
                unit: &unit,
                category: &category,
                rules: &rules,
            })
            .await
            .unwrap();
        assert_eq!(success.attempts, 1);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_without_retry() {
        let (unit, category, rules) = fixture();
        let provider = ScriptedProvider::new(vec![Err(ProviderError::AuthError)]);
        let evaluator = LlmCategoryEvaluator::new(
            category.clone(),
            provider.clone(),
            CompletionConfig::default(),
            fast_policy(),
        );

        let failure = evaluator
            .evaluate(EvaluationRequest {
                submission_id: "s",
                unit: &unit,
                category: &category,
                rules: &rules,
            })
            .await
            .unwrap_err();
        assert_eq!(failure.cause, "Authentication failed");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let (unit, category, rules) = fixture();
        let provider = ScriptedProvider::new(vec![Ok(VALID.to_string())]);
        let usage = Arc::new(UsageTracker::new());
        let evaluator = LlmCategoryEvaluator::new(
            category.clone(),
            provider.clone(),
            CompletionConfig::default(),
            fast_policy(),
        )
        .with_cache(Arc::new(EvaluationCache::default()))
        .with_usage_tracker(usage.clone());

        let request = EvaluationRequest {
            submission_id: "s",
            unit: &unit,
            category: &category,
            rules: &rules,
        };
        let first = evaluator.evaluate(request).await.unwrap();
        let second = evaluator.evaluate(request).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.output, first.output);
        assert_eq!(second.usage.total(), 0);
        assert_eq!(provider.calls(), 1);
        assert_eq!(usage.total().cache_hits, 1);
    }
}
