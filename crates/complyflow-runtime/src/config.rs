//! Runtime configuration.
//!
//! One `RuntimeConfig` carries everything the engine needs. It is loaded
//! from YAML or JSON; durations are written human-readably (`"30s"`, `"2m"`).
//!
//! ```yaml
//! scoring:
//!   category_weights: { regulatory: 0.5, brand: 0.3, seo: 0.2 }
//! dispatch:
//!   max_concurrency: 8
//!   task_timeout: 2m
//! evaluation:
//!   max_attempts: 3
//!   retry_delay: 1s
//! llm:
//!   model: gpt-4o-mini
//! provider:
//!   type: openai
//!   settings: { base_url: "http://localhost:11434/v1" }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use complyflow_core::{ConfigError, ScoringConfig, SegmenterConfig, SeverityPreset};

use crate::providers::CompletionConfig;

/// Fan-out limits for the evaluation dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum evaluation tasks in flight at once.
    pub max_concurrency: usize,

    /// Per-task wall-clock limit. A task exceeding it is recorded as failed.
    #[serde(with = "duration_str::option")]
    pub task_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            task_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Retry policy for a single evaluation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Attempts at producing schema-valid output before the task fails.
    pub max_attempts: u32,

    /// Pause between validation attempts.
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,

    /// Extra attempts for transient provider errors (rate limits, timeouts).
    pub transport_retries: usize,

    #[serde(with = "duration_str")]
    pub transport_min_delay: Duration,

    /// Characters of unit text kept in ledger input previews.
    pub input_preview_chars: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            transport_retries: 2,
            transport_min_delay: Duration::from_millis(500),
            input_preview_chars: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Line-by-line analysis settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepAnalysisConfig {
    pub preset: SeverityPreset,

    /// Also compute a document-level score from all line violations.
    pub feed_document_scores: bool,
}

/// Which provider factory to use, plus its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,

    #[serde(default)]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scoring: ScoringConfig,
    pub segmenter: SegmenterConfig,
    pub dispatch: DispatchConfig,
    pub evaluation: EvaluationConfig,
    pub llm: CompletionConfig,
    pub cache: CacheConfig,
    pub deep: DeepAnalysisConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, choosing the format by extension (`.json`, otherwise YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scoring.validate()?;
        self.segmenter.validate()?;

        if self.dispatch.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "dispatch.max_concurrency",
                "must be greater than zero",
            ));
        }
        if self.dispatch.task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid(
                "dispatch.task_timeout",
                "must be greater than zero when set",
            ));
        }
        if self.evaluation.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "evaluation.max_attempts",
                "must be at least 1",
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::invalid("llm.model", "must not be empty"));
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::invalid(
                "cache.max_entries",
                "must be greater than zero when the cache is enabled",
            ));
        }
        Ok(())
    }
}

/// Serde adapter for human-readable durations.
///
/// Accepts `"1500ms"`, `"30s"`, `"2m"`, or a bare number of seconds.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    fn parse<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(E::custom),
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        parse(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::Raw;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<Raw>::deserialize(deserializer)?
                .map(super::parse)
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyflow_core::CategoryKey;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.evaluation.max_attempts, 3);
        assert_eq!(config.evaluation.retry_delay, Duration::from_secs(1));
        assert_eq!(config.scoring.category_weights.len(), 3);
        assert!(!config.deep.feed_document_scores);
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
scoring:
  category_weights:
    legal: 0.6
    tone: 0.4
dispatch:
  max_concurrency: 2
  task_timeout: 90s
evaluation:
  retry_delay: 250ms
  transport_min_delay: 1
deep:
  preset: strict
  feed_document_scores: true
provider:
  type: openai
  settings:
    base_url: "http://localhost:11434/v1"
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.dispatch.max_concurrency, 2);
        assert_eq!(config.dispatch.task_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.evaluation.retry_delay, Duration::from_millis(250));
        assert_eq!(config.evaluation.transport_min_delay, Duration::from_secs(1));
        assert_eq!(config.evaluation.max_attempts, 3);
        assert_eq!(config.deep.preset, SeverityPreset::Strict);
        assert!(config.scoring.registry().contains(&CategoryKey::new("tone").unwrap()));
        let provider = config.provider.unwrap();
        assert_eq!(provider.provider_type, "openai");
        assert_eq!(provider.settings["base_url"], "http://localhost:11434/v1");
    }

    #[test]
    fn test_timeout_can_be_disabled() {
        let config = RuntimeConfig::from_json(r#"{"dispatch":{"task_timeout":null}}"#).unwrap();
        assert_eq!(config.dispatch.task_timeout, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_weights = r#"
scoring:
  category_weights: { a: 0.5, b: 0.6 }
"#;
        assert!(matches!(
            RuntimeConfig::from_yaml(bad_weights),
            Err(ConfigError::Invalid { .. })
        ));

        assert!(RuntimeConfig::from_yaml("dispatch: { max_concurrency: 0 }").is_err());
        assert!(RuntimeConfig::from_yaml("evaluation: { max_attempts: 0 }").is_err());
        assert!(RuntimeConfig::from_yaml("segmenter: { max_chunk_chars: 0 }").is_err());
        assert!(RuntimeConfig::from_yaml("evaluation: { retry_delay: soon }").is_err());
    }

    #[test]
    fn test_roundtrip_through_yaml() {
        let config = RuntimeConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("retry_delay: 1s"));
        let back = RuntimeConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back, config);
    }
}
