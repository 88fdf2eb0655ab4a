//! Orchestrator configuration.
//!
//! Loaded from TOML, then optionally overridden from `CLOUDIFY_*`
//! environment variables. Every field has a default so an empty file is a
//! valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_HISTORY_CAPACITY;
use crate::error::ConfigError;
use crate::router::RoutingTable;

pub const ENV_HISTORY_CAPACITY: &str = "CLOUDIFY_HISTORY_CAPACITY";
pub const ENV_MAX_RETRIES: &str = "CLOUDIFY_MAX_RETRIES";
pub const ENV_AGENT_TIMEOUT_SECS: &str = "CLOUDIFY_AGENT_TIMEOUT_SECS";
pub const ENV_PARALLEL_EXECUTION: &str = "CLOUDIFY_PARALLEL_EXECUTION";

/// Retry, timeout and rollback policy applied to one agent execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPolicy {
    /// Re-invocations after the first failed attempt.
    pub max_retries: u32,
    /// Per-attempt limit; `None` disables the timeout.
    pub timeout_secs: Option<u64>,
    /// Base delay between attempts, doubled after each failure.
    pub retry_backoff_ms: u64,
    pub rollback_on_failure: bool,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            timeout_secs: Some(300),
            retry_backoff_ms: 2000,
            rollback_on_failure: true,
        }
    }
}

impl AgentPolicy {
    /// Policy with no retries, no timeout, no backoff and no rollback.
    pub fn once() -> Self {
        Self {
            max_retries: 0,
            timeout_secs: None,
            retry_backoff_ms: 0,
            rollback_on_failure: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn with_rollback(mut self, rollback_on_failure: bool) -> Self {
        self.rollback_on_failure = rollback_on_failure;
        self
    }

    /// Total number of work attempts one execution may make.
    pub fn attempt_limit(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub history_capacity: usize,
    /// Run a phase's agents concurrently; `false` runs them in declared order.
    pub parallel_execution: bool,
    /// Defaults for every agent; pipeline definitions may override per agent.
    pub agent: AgentPolicy,
    pub routing: RoutingTable,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            parallel_execution: true,
            agent: AgentPolicy::default(),
            routing: RoutingTable::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CLOUDIFY_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` as the variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_HISTORY_CAPACITY) {
            self.history_capacity = parse_env(ENV_HISTORY_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_RETRIES) {
            self.agent.max_retries = parse_env(ENV_MAX_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_AGENT_TIMEOUT_SECS) {
            let secs: u64 = parse_env(ENV_AGENT_TIMEOUT_SECS, &v)?;
            self.agent.timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(v) = lookup(ENV_PARALLEL_EXECUTION) {
            self.parallel_execution = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: ENV_PARALLEL_EXECUTION.to_string(),
                        value: v,
                    })
                }
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}
