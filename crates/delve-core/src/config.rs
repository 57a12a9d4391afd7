use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::cost::PricingTable;
use crate::logging::{DEFAULT_RETENTION_DAYS, SessionLogSettings};
use crate::{DelveError, SecretValue, optional_env, require_env};

const DEFAULT_CONFIG_PATH: &str = "delve.toml";
const CONFIG_PATH_ENV: &str = "DELVE_CONFIG";
pub const DEFAULT_MODEL: &str = "gpt-4-turbo-preview";

/// Top-level configuration structure. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub pricing: PricingTable,
    pub scheduler: SchedulerConfig,
    pub context: ContextConfig,
    pub summarizer: SummarizerConfig,
    pub tracing: TracingConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Built-in prices overlaid with the configured ones.
    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::builtin().merged(&self.pricing)
    }

    /// Resolve the agent secret value (from environment only).
    pub fn agent_api_key(&self) -> Result<Option<SecretValue>, DelveError> {
        optional_env(self.agent.api_key_env.as_deref())
    }

    pub fn summarizer_api_key(&self) -> Result<Option<SecretValue>, DelveError> {
        optional_env(self.summarizer.api_key_env.as_deref())
    }

    pub fn session_log_settings(&self) -> Option<SessionLogSettings> {
        self.logging.session_log_dir.as_ref().map(|dir| {
            SessionLogSettings::new(dir.clone()).with_retention_days(self.logging.retention_days)
        })
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DELVE_CONFIG` environment variable.
    /// 3. `delve.toml` in the current working directory.
    ///
    /// Only the implicit `delve.toml` may be absent, in which case defaults apply.
    pub fn load(path: Option<PathBuf>) -> Result<Config, DelveError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            let config = Config::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| DelveError::config_io(candidate.clone(), err))?;
        Self::parse(&raw)
    }

    /// Parse and validate TOML text.
    pub fn parse(raw: &str) -> Result<Config, DelveError> {
        let config: Config =
            toml::from_str(raw).map_err(|err| DelveError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), DelveError> {
        let scheduler = &config.scheduler;
        if scheduler.workers == 0 {
            return Err(invalid("scheduler.workers must be at least 1"));
        }
        if scheduler.max_attempts == 0 {
            return Err(invalid("scheduler.max_attempts must be at least 1"));
        }
        if scheduler.queue_capacity == 0 {
            return Err(invalid("scheduler.queue_capacity must be at least 1"));
        }
        if scheduler.max_backoff_ms < scheduler.initial_backoff_ms {
            return Err(invalid(
                "scheduler.max_backoff_ms must not be below initial_backoff_ms",
            ));
        }

        for (model, price) in &config.pricing.models {
            let valid = |value: f64| value.is_finite() && value >= 0.0;
            if !valid(price.input_per_million) || !valid(price.output_per_million) {
                return Err(invalid(&format!(
                    "pricing for `{model}` must be finite and non-negative"
                )));
            }
        }

        let pricing = config.pricing_table();
        pricing.price(&config.agent.model)?;

        if config.agent.provider == AgentProvider::Http {
            if config.agent.endpoint.as_deref().is_none_or(|e| e.trim().is_empty()) {
                return Err(invalid("agent.endpoint is required for the http provider"));
            }
            let key_env = config
                .agent
                .api_key_env
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| {
                    invalid("agent.api_key_env must reference an environment variable")
                })?;
            // Ensure environment variable exists at load time to discourage inline secrets.
            require_env(key_env)?;
        }

        if config.summarizer.provider == SummarizerProvider::Llm {
            if config.summarizer.endpoint.as_deref().is_none_or(|e| e.trim().is_empty()) {
                return Err(invalid("summarizer.endpoint is required for the llm provider"));
            }
            config.summarizer_api_key()?;
        }

        if config.context.summary_max_chars == 0 {
            return Err(invalid("context.summary_max_chars must be positive"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> DelveError {
    DelveError::InvalidConfiguration(message.to_string())
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProvider {
    Http,
    #[default]
    Stub,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub provider: AgentProvider,
    pub endpoint: Option<String>,
    pub model: String,
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub max_reasoning_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: AgentProvider::default(),
            endpoint: None,
            model: DEFAULT_MODEL.to_string(),
            api_key_env: None,
            timeout_secs: 600,
            max_reasoning_steps: 40,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    /// Delay before attempt `next_attempt` (2-based): doubles per retry, capped.
    pub fn backoff_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2).min(31);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub summary_max_chars: usize,
    pub document_wait_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: 1_000,
            document_wait_ms: 30_000,
        }
    }
}

impl ContextConfig {
    pub fn document_wait(&self) -> Duration {
        Duration::from_millis(self.document_wait_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizerProvider {
    #[default]
    Extractive,
    Llm,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub provider: SummarizerProvider,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub trace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub session_log_dir: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            session_log_dir: None,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}
