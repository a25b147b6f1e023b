// SPDX-License-Identifier: MIT

//! Engine configuration and its YAML loader

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::adk::error::EngineError;
use crate::adk::retry::RetryPolicy;
use crate::plangraph::workflow::graph::builder::DEFAULT_RECURSION_LIMIT;

use super::budget::BudgetConfig;

/// Limits and policies for a plan-execute runtime. Every field is optional
/// in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retries of a failing step before replanning
    pub max_retries: u64,
    /// Replans before giving up
    pub max_replans: u64,
    /// Capabilities offered to the reasoner per step
    pub top_k: usize,
    /// Node executions allowed per `start`/`resume` invocation
    pub recursion_limit: u32,
    pub budget: BudgetConfig,
    /// Backoff for reasoner, planner, and read-only capability calls
    pub retry: RetryPolicy,
    pub reasoner_timeout_secs: u64,
    pub capability_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_replans: 1,
            top_k: 3,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            budget: BudgetConfig::default(),
            retry: RetryPolicy::default(),
            reasoner_timeout_secs: 60,
            capability_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn reasoner_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoner_timeout_secs)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_secs(self.capability_timeout_secs)
    }

    /// Reject values the topology cannot run with
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.top_k == 0 {
            return Err(EngineError::config("top_k must be at least 1"));
        }
        if self.recursion_limit == 0 {
            return Err(EngineError::config("recursion_limit must be at least 1"));
        }
        if self.reasoner_timeout_secs == 0 || self.capability_timeout_secs == 0 {
            return Err(EngineError::config("timeouts must be at least one second"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(EngineError::config(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

/// Loads `EngineConfig` from YAML
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<EngineConfig, EngineError> {
        let path = path.as_ref();
        log::debug!("Loading engine config from {}", path.display());
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    /// Parse and validate a configuration from a YAML string
    pub fn parse_yaml(content: &str) -> Result<EngineConfig, EngineError> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
