//! Rule repository adapters.
//!
//! A repository answers one question: which rules are active for this
//! project, grouped by category and ranked by severity.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use complyflow_core::{ActiveRules, CategoryRegistry, RuleDefinition, RuleError, RuleFile};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Rule repository unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid rules: {0}")]
    InvalidRules(#[from] RuleError),
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Active rules for `project_id`, or the global set when `None`.
    ///
    /// Every registered category is present in the result, possibly empty.
    async fn get_active_rules(&self, project_id: Option<&str>)
        -> Result<ActiveRules, RepositoryError>;
}

/// Rules held in memory, validated once at construction.
#[derive(Debug, Clone)]
pub struct InMemoryRuleRepository {
    rules: Vec<RuleDefinition>,
    registry: CategoryRegistry,
}

impl InMemoryRuleRepository {
    pub fn new(
        rules: Vec<RuleDefinition>,
        registry: CategoryRegistry,
    ) -> Result<Self, RepositoryError> {
        let file = RuleFile { rules };
        file.validate()?;
        file.validate_categories(&registry)?;
        Ok(Self {
            rules: file.rules,
            registry,
        })
    }

    pub fn rules(&self) -> &[RuleDefinition] {
        &self.rules
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn get_active_rules(
        &self,
        project_id: Option<&str>,
    ) -> Result<ActiveRules, RepositoryError> {
        Ok(ActiveRules::group(&self.rules, &self.registry, project_id)?)
    }
}

/// Rules read from a YAML file on every call, so edits apply to the next run.
#[derive(Debug, Clone)]
pub struct YamlRuleRepository {
    path: PathBuf,
    registry: CategoryRegistry,
}

impl YamlRuleRepository {
    pub fn new(path: impl Into<PathBuf>, registry: CategoryRegistry) -> Self {
        Self {
            path: path.into(),
            registry,
        }
    }
}

#[async_trait]
impl RuleRepository for YamlRuleRepository {
    async fn get_active_rules(
        &self,
        project_id: Option<&str>,
    ) -> Result<ActiveRules, RepositoryError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RepositoryError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;

        let file = RuleFile::from_yaml(&contents)?;
        file.validate_categories(&self.registry)?;

        let active = ActiveRules::group(&file.rules, &self.registry, project_id)?;
        tracing::debug!(
            path = %self.path.display(),
            project_id = ?project_id,
            total_rules = active.total_rules(),
            "Loaded active rules"
        );
        Ok(active)
    }
}
