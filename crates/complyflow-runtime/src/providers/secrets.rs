//! Credential handling for LLM providers.
//!
//! Keys are wrapped in `secrecy::SecretString` as soon as they are read.
//! They never appear in `Debug` output or logs and are exposed only where
//! the `Authorization` header is built.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::ProviderError;

/// Where a provider looks for its key: a settings field, then an env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialSpec {
    pub label: &'static str,
    pub settings_key: &'static str,
    pub env_var: &'static str,
}

impl CredentialSpec {
    fn from_settings<'a>(&self, settings: &'a JsonValue) -> Option<&'a str> {
        settings
            .get(self.settings_key)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn from_env(&self) -> Option<String> {
        std::env::var(self.env_var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Whether [`ApiCredential::resolve`] would find a key.
    pub fn is_satisfied(&self, settings: &JsonValue) -> bool {
        self.from_settings(settings).is_some() || self.from_env().is_some()
    }

    fn missing(&self) -> ProviderError {
        ProviderError::NotConfigured(format!(
            "{} missing: set '{}' in provider settings or the {} environment variable",
            self.label, self.settings_key, self.env_var
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Passed in by the embedding application.
    Explicit,
    Settings,
    Environment(&'static str),
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Explicit => f.write_str("explicit value"),
            CredentialSource::Settings => f.write_str("provider settings"),
            CredentialSource::Environment(var) => write!(f, "${}", var),
        }
    }
}

pub struct ApiCredential {
    secret: SecretString,
    source: CredentialSource,
}

impl ApiCredential {
    pub fn explicit(value: impl Into<String>) -> Result<Self, ProviderError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ProviderError::NotConfigured("API key is empty".to_string()));
        }
        Ok(Self::wrap(value, CredentialSource::Explicit))
    }

    /// Settings take precedence over the environment. Blank values count as absent.
    pub fn resolve(settings: &JsonValue, wanted: &CredentialSpec) -> Result<Self, ProviderError> {
        if let Some(value) = wanted.from_settings(settings) {
            return Ok(Self::wrap(value.to_string(), CredentialSource::Settings));
        }
        wanted.from_env()
            .map(|value| Self::wrap(value, CredentialSource::Environment(wanted.env_var)))
            .ok_or_else(|| wanted.missing())
    }

    fn wrap(value: String, source: CredentialSource) -> Self {
        Self {
            secret: SecretString::from(value),
            source,
        }
    }

    /// `Bearer <key>`, for the request being built. Do not keep the result.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.secret.expose_secret())
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiCredential([REDACTED] from {})", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "sk-live-0123456789abcdef";

    fn wanted(env_var: &'static str) -> CredentialSpec {
        CredentialSpec {
            label: "LLM API key",
            settings_key: "api_key",
            env_var,
        }
    }

    #[test]
    fn test_debug_never_shows_key() {
        let cred = ApiCredential::explicit(SECRET).unwrap();
        let debug = format!("{:?}", cred);
        assert!(!debug.contains(SECRET));
        assert_eq!(debug, "ApiCredential([REDACTED] from explicit value)");
        assert_eq!(cred.bearer(), format!("Bearer {}", SECRET));
    }

    #[test]
    fn test_settings_before_environment() {
        std::env::set_var("COMPLYFLOW_TEST_KEY_BOTH", "from-env");
        let settings = serde_json::json!({ "api_key": "from-settings" });
        let cred = ApiCredential::resolve(&settings, &wanted("COMPLYFLOW_TEST_KEY_BOTH")).unwrap();
        assert_eq!(cred.source(), CredentialSource::Settings);
        assert_eq!(cred.bearer(), "Bearer from-settings");
        std::env::remove_var("COMPLYFLOW_TEST_KEY_BOTH");
    }

    #[test]
    fn test_blank_settings_fall_back_to_env() {
        std::env::set_var("COMPLYFLOW_TEST_KEY_FALLBACK", "from-env");
        let settings = serde_json::json!({ "api_key": "   " });
        let cred =
            ApiCredential::resolve(&settings, &wanted("COMPLYFLOW_TEST_KEY_FALLBACK")).unwrap();
        assert_eq!(
            cred.source(),
            CredentialSource::Environment("COMPLYFLOW_TEST_KEY_FALLBACK")
        );
        std::env::remove_var("COMPLYFLOW_TEST_KEY_FALLBACK");
    }

    #[test]
    fn test_missing_key_names_both_places() {
        let wanted = wanted("COMPLYFLOW_TEST_KEY_UNSET");
        let settings = serde_json::json!({});
        assert!(!wanted.is_satisfied(&settings));

        let msg = ApiCredential::resolve(&settings, &wanted)
            .unwrap_err()
            .to_string();
        assert!(msg.contains("'api_key'"));
        assert!(msg.contains("COMPLYFLOW_TEST_KEY_UNSET"));
    }

    #[test]
    fn test_explicit_rejects_empty() {
        assert!(ApiCredential::explicit("  ").is_err());
    }
}
