//! Review runtime configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (e.g. `FOF_GATEWAY_TIMEOUT_SECS`)
//! 2. Values from the TOML file passed with `--config`
//! 3. Built-in defaults
//!
//! ```toml
//! criteria = ["Overall Impact", "Significance", "Approach"]
//! store_dir = ".fof-sessions"
//!
//! [roles.primary]
//! model = "reviewer-large"
//!
//! [roles.critic]
//! model = "reviewer-small"
//!
//! [limits]
//! max_primary_refinements = 5
//! max_critic_refinements = 3
//! gateway_timeout_secs = 180
//!
//! [templates]
//! reflection = "Answer each point of this critique:\n\n{critique}"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use review_core::review::{
    CriteriaSet, PromptTemplates, RefinementLimits, SessionParams, DEFAULT_CRITERIA,
};

const DEFAULT_MODEL: &str = "default";
const DEFAULT_STORE_DIR: &str = ".fof-sessions";
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 180;
const DEFAULT_MAX_PRIMARY_REFINEMENTS: u32 = 5;
const DEFAULT_MAX_CRITIC_REFINEMENTS: u32 = 3;

const ENV_GATEWAY_TIMEOUT_SECS: &str = "FOF_GATEWAY_TIMEOUT_SECS";
const ENV_STORE_DIR: &str = "FOF_STORE_DIR";
const ENV_PRIMARY_MODEL: &str = "FOF_PRIMARY_MODEL";
const ENV_CRITIC_MODEL: &str = "FOF_CRITIC_MODEL";
const ENV_MAX_PRIMARY_REFINEMENTS: &str = "FOF_MAX_PRIMARY_REFINEMENTS";
const ENV_MAX_CRITIC_REFINEMENTS: &str = "FOF_MAX_CRITIC_REFINEMENTS";

/// Model binding for one role. The id is opaque to the review core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub model: String,
}

impl Default for RoleBinding {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleBindings {
    pub primary: RoleBinding,
    pub critic: RoleBinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_primary_refinements: u32,
    pub max_critic_refinements: u32,
    pub gateway_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_primary_refinements: DEFAULT_MAX_PRIMARY_REFINEMENTS,
            max_critic_refinements: DEFAULT_MAX_CRITIC_REFINEMENTS,
            gateway_timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
        }
    }
}

/// Top-level configuration for review runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Required criteria, in review order.
    pub criteria: Vec<String>,
    pub roles: RoleBindings,
    pub limits: LimitsConfig,
    pub templates: PromptTemplates,
    pub store_dir: PathBuf,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            criteria: DEFAULT_CRITERIA.iter().map(|c| c.to_string()).collect(),
            roles: RoleBindings::default(),
            limits: LimitsConfig::default(),
            templates: PromptTemplates::default(),
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
        }
    }
}

fn parse_positive<T: std::str::FromStr + PartialOrd + Default>(raw: Option<String>) -> Option<T> {
    raw.and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}

impl ReviewConfig {
    /// Load from an optional TOML file, apply environment overrides, and
    /// validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid review config: {e}"))?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse review config TOML")
    }

    /// Apply `FOF_*` overrides read through `lookup`. Unparseable or
    /// non-positive numbers are ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secs) = parse_positive(lookup(ENV_GATEWAY_TIMEOUT_SECS)) {
            self.limits.gateway_timeout_secs = secs;
        }
        if let Some(n) = parse_positive(lookup(ENV_MAX_PRIMARY_REFINEMENTS)) {
            self.limits.max_primary_refinements = n;
        }
        if let Some(n) = parse_positive(lookup(ENV_MAX_CRITIC_REFINEMENTS)) {
            self.limits.max_critic_refinements = n;
        }
        if let Some(dir) = lookup(ENV_STORE_DIR).filter(|d| !d.trim().is_empty()) {
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(model) = lookup(ENV_PRIMARY_MODEL).filter(|m| !m.trim().is_empty()) {
            self.roles.primary.model = model;
        }
        if let Some(model) = lookup(ENV_CRITIC_MODEL).filter(|m| !m.trim().is_empty()) {
            self.roles.critic.model = model;
        }
    }

    /// Validate the config; return an error string if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.criteria_set().map_err(|e| e.to_string())?;
        self.templates.validate().map_err(|e| e.to_string())?;
        if self.limits.gateway_timeout_secs == 0 {
            return Err("gateway_timeout_secs must be > 0".to_string());
        }
        for (role, binding) in [("primary", &self.roles.primary), ("critic", &self.roles.critic)] {
            if binding.model.trim().is_empty() {
                return Err(format!("roles.{role}.model must not be empty"));
            }
        }
        Ok(())
    }

    pub fn criteria_set(&self) -> Result<CriteriaSet, review_core::review::CriteriaError> {
        CriteriaSet::new(self.criteria.iter().cloned())
    }

    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            templates: self.templates.clone(),
            limits: RefinementLimits {
                max_primary: self.limits.max_primary_refinements,
                max_critic: self.limits.max_critic_refinements,
            },
        }
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.gateway_timeout_secs)
    }
}
