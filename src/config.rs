//! Configuration management.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Optional here. Required by the binary's OpenRouter client.
//! - `DEFAULT_MODEL` - Optional. Model used when an agent has no override.
//! - `MAX_CONCURRENT_REQUESTS` - Optional. Model calls in flight at once. Defaults to `3`.
//! - `RATE_LIMIT_COOLDOWN_SECS` - Optional. Global pause after a rate limit. Defaults to `30`.
//! - `MAX_ITERATIONS` - Optional. Iterations per agent before force-completion. Defaults to `15`.
//! - `MAX_TOTAL_AGENTS` / `MAX_DEPTH` / `MAX_SPAWNS_PER_AGENT` / `SOFT_CAP_AGENTS` - Optional. Spawn budget.
//! - `ITERATION_DELAY_MS` - Optional. Sleep between iterations. Defaults to `1000`.
//! - `POLL_INTERVAL_MS` - Optional. Poll period while waiting or paused. Defaults to `500`.
//! - `SPAWN_STAGGER_MS` - Optional. Delay between successive child starts. Defaults to `250`.
//! - `STREAMING` - Optional. Use streaming model calls. Defaults to `true`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::AgentConfig;
use crate::queue::QueueConfig;
use crate::spawn::SpawnBudget;
use crate::util::{env_var_bool, env_var_parse};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to load mission file {path}: {message}")]
    MissionFile { path: PathBuf, message: String },
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: Option<String>,

    /// Default LLM model identifier (OpenRouter format)
    pub default_model: String,

    pub max_concurrent_requests: usize,

    /// Fixed global pause after a rate-limit signal
    pub rate_limit_cooldown: Duration,

    /// Maximum iterations per agent
    pub max_iterations: u32,

    pub spawn_budget: SpawnBudget,

    pub iteration_delay: Duration,

    /// Poll period while an agent is waiting or paused
    pub poll_interval: Duration,

    /// Delay between successive child agent starts
    pub spawn_stagger: Duration,

    pub streaming: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            default_model: "anthropic/claude-sonnet-4.5".to_string(),
            max_concurrent_requests: 3,
            rate_limit_cooldown: Duration::from_secs(30),
            max_iterations: 15,
            spawn_budget: SpawnBudget::default(),
            iteration_delay: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(500),
            spawn_stagger: Duration::from_millis(250),
            streaming: true,
        }
    }
}

fn parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_var_parse(name, default).map_err(|e| ConfigError::InvalidValue(name.to_string(), e))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let default_model = std::env::var("DEFAULT_MODEL").unwrap_or(defaults.default_model);

        let max_concurrent_requests: usize =
            parse("MAX_CONCURRENT_REQUESTS", defaults.max_concurrent_requests)?;
        if max_concurrent_requests == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONCURRENT_REQUESTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let spawn_budget = SpawnBudget {
            max_total_agents: parse("MAX_TOTAL_AGENTS", defaults.spawn_budget.max_total_agents)?,
            max_depth: parse("MAX_DEPTH", defaults.spawn_budget.max_depth)?,
            max_spawns_per_agent: parse(
                "MAX_SPAWNS_PER_AGENT",
                defaults.spawn_budget.max_spawns_per_agent,
            )?,
            soft_cap: parse("SOFT_CAP_AGENTS", defaults.spawn_budget.soft_cap)?,
        };

        Ok(Self {
            api_key,
            default_model,
            max_concurrent_requests,
            rate_limit_cooldown: Duration::from_secs(parse("RATE_LIMIT_COOLDOWN_SECS", 30u64)?),
            max_iterations: parse("MAX_ITERATIONS", defaults.max_iterations)?,
            spawn_budget,
            iteration_delay: Duration::from_millis(parse("ITERATION_DELAY_MS", 1000u64)?),
            poll_interval: Duration::from_millis(parse("POLL_INTERVAL_MS", 500u64)?),
            spawn_stagger: Duration::from_millis(parse("SPAWN_STAGGER_MS", 250u64)?),
            streaming: env_var_bool("STREAMING", defaults.streaming),
        })
    }

    /// Settings for the shared request queue.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent_requests,
            rate_limit_cooldown: self.rate_limit_cooldown,
        }
    }

    /// Require the API key, for callers that talk to OpenRouter.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))
    }
}

/// A mission file: the root of the declarative agent tree plus a title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub root: AgentConfig,
}

impl MissionSpec {
    /// Load a mission from a YAML (or JSON) file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let error = |message: String| ConfigError::MissionFile {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| error(e.to_string()))?;
        serde_yaml::from_str(&text).map_err(|e| error(e.to_string()))
    }
}
