//! Configuration management for the fan-out orchestrator.
//!
//! Configuration can be set via environment variables:
//! - `PROVIDER_API_KEY` - Required. API key for the image-generation provider.
//! - `PROVIDER_API_URL` - Optional. Base URL of the OpenAI-compatible images API.
//! - `PROVIDER_MODEL` - Optional. Image model. Defaults to `gpt-image-1`.
//! - `OUTPUT_SIZE` - Optional. Requested image size. Defaults to `1024x1024`.
//! - `HOST` / `PORT` - Optional. Server bind address. Defaults to `127.0.0.1:3000`.
//! - `FAN_OUT_WIDTH` - Optional. Default sub-jobs per task. Defaults to `3`.
//! - `MAX_FAN_OUT_WIDTH` - Optional. Upper bound accepted from clients. Defaults to `6`.
//! - `MIN_SUCCESS` - Optional. Successful sub-jobs needed to complete. Defaults to `2`.
//! - `MAX_ATTEMPTS` - Optional. Retry cycles allowed per task. Defaults to `2`.
//! - `SUB_JOB_TIMEOUT_SECS` - Optional. Wall-clock limit per provider call. Defaults to `90`.
//! - `STALL_THRESHOLD_SECS` - Optional. Inactivity before a task counts as stalled. Defaults to `120`.
//!   Must exceed `SUB_JOB_TIMEOUT_SECS`.
//! - `MONITOR_INTERVAL_SECS` - Optional. Stall scan period. Defaults to `30`.
//! - `MONITOR_ENABLED` - Optional. Set to `false` to disable automatic stall retries.
//! - `SWEEP_INTERVAL_SECS` - Optional. Expiry sweep period. Defaults to `300`.
//! - `POLL_INTERVAL_MS` - Optional. Poll interval suggested to clients. Defaults to `5000`.
//! - `TASK_STORE` - Optional. `memory`, `file` or `sqlite`. Defaults to `memory`.
//! - `TASK_STORE_DIR` - Optional. Directory for persisted stores. Defaults to `./.fanout`.
//! - `TASK_TTL_SECS` - Optional. Global task time-to-live. Defaults to `1800`.
//! - `MAX_TASKS` - Optional. Capacity of the in-memory store. Defaults to `1000`.
//! - `CACHE_SOFT_CAP`, `CACHE_HARD_CAP_BYTES`, `CACHE_KEEP_RECENT`,
//!   `COMPLETED_GRACE_SECS`, `FAILED_GRACE_SECS` - Optional. Eviction limits of the file store.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::store::{EvictionPolicy, StoreType};
use crate::util::{env_var_bool, env_var_millis, env_var_parse, env_var_secs};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Image provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the images API (without the `/images/...` suffix)
    pub api_url: String,

    /// Bearer token for the provider
    pub api_key: String,

    /// Image model identifier
    pub model: String,

    /// Output size, e.g. `1024x1024`
    pub output_size: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-image-1".to_string(),
            output_size: "1024x1024".to_string(),
        }
    }
}

/// Orchestration tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Fan-out width used when a request does not specify one
    pub default_fan_out_width: usize,

    /// Largest fan-out width accepted from a request
    pub max_fan_out_width: usize,

    /// Minimum successful sub-jobs (K) for a task to complete; clamped to the width
    pub min_success: usize,

    /// Retry cycles allowed per task
    pub max_attempts: u32,

    /// Wall-clock limit around a single provider call
    pub sub_job_timeout: Duration,

    /// A processing task whose `updated_at` is older than this is stalled
    pub stall_threshold: Duration,

    /// How often the stall monitor scans
    pub monitor_interval: Duration,

    /// Whether the stall monitor runs at all
    pub monitor_enabled: bool,

    /// How often expired tasks are swept from the store
    pub sweep_interval: Duration,

    /// Poll interval handed back to clients on submission
    pub suggested_poll_interval: Duration,

    /// Maximum prompt length in characters
    pub max_prompt_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_fan_out_width: 3,
            max_fan_out_width: 6,
            min_success: 2,
            max_attempts: 2,
            sub_job_timeout: Duration::from_secs(90),
            stall_threshold: Duration::from_secs(120),
            monitor_interval: Duration::from_secs(30),
            monitor_enabled: true,
            sweep_interval: Duration::from_secs(300),
            suggested_poll_interval: Duration::from_millis(5000),
            max_prompt_chars: 1000,
        }
    }
}

/// Task store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Which backend to use
    pub store_type: StoreType,

    /// Directory for the file and sqlite backends
    pub dir: PathBuf,

    /// Tasks older than this are treated as absent
    pub ttl: Duration,

    /// Capacity of the in-memory backend
    pub max_tasks: usize,

    /// Eviction limits applied by the file backend before each write
    pub eviction: EvictionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Memory,
            dir: PathBuf::from(".fanout"),
            ttl: Duration::from_secs(30 * 60),
            max_tasks: 1000,
            eviction: EvictionPolicy::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Image provider settings
    pub provider: ProviderConfig,

    /// Fan-out, retry and monitor settings
    pub orchestrator: OrchestratorConfig,

    /// Task store settings
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `PROVIDER_API_KEY` is not set, and
    /// `ConfigError::InvalidValue` for any variable that is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("PROVIDER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("PROVIDER_API_KEY".to_string()))?;

        let provider_defaults = ProviderConfig::default();
        let provider = ProviderConfig {
            api_url: std::env::var("PROVIDER_API_URL").unwrap_or(provider_defaults.api_url),
            api_key,
            model: std::env::var("PROVIDER_MODEL").unwrap_or(provider_defaults.model),
            output_size: std::env::var("OUTPUT_SIZE").unwrap_or(provider_defaults.output_size),
        };

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_var_parse("PORT", 3000u16)?;

        let d = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            default_fan_out_width: env_var_parse("FAN_OUT_WIDTH", d.default_fan_out_width)?,
            max_fan_out_width: env_var_parse("MAX_FAN_OUT_WIDTH", d.max_fan_out_width)?,
            min_success: env_var_parse("MIN_SUCCESS", d.min_success)?,
            max_attempts: env_var_parse("MAX_ATTEMPTS", d.max_attempts)?,
            sub_job_timeout: env_var_secs("SUB_JOB_TIMEOUT_SECS", d.sub_job_timeout)?,
            stall_threshold: env_var_secs("STALL_THRESHOLD_SECS", d.stall_threshold)?,
            monitor_interval: env_var_secs("MONITOR_INTERVAL_SECS", d.monitor_interval)?,
            monitor_enabled: env_var_bool("MONITOR_ENABLED", d.monitor_enabled),
            sweep_interval: env_var_secs("SWEEP_INTERVAL_SECS", d.sweep_interval)?,
            suggested_poll_interval: env_var_millis(
                "POLL_INTERVAL_MS",
                d.suggested_poll_interval,
            )?,
            max_prompt_chars: d.max_prompt_chars,
        };
        orchestrator.validate()?;

        let s = StoreConfig::default();
        let e = s.eviction.clone();
        let store = StoreConfig {
            store_type: std::env::var("TASK_STORE")
                .map(|v| StoreType::from_str(&v))
                .unwrap_or_default(),
            dir: std::env::var("TASK_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(s.dir),
            ttl: env_var_secs("TASK_TTL_SECS", s.ttl)?,
            max_tasks: env_var_parse("MAX_TASKS", s.max_tasks)?,
            eviction: EvictionPolicy {
                completed_grace: env_var_secs("COMPLETED_GRACE_SECS", e.completed_grace)?,
                failed_grace: env_var_secs("FAILED_GRACE_SECS", e.failed_grace)?,
                soft_cap: env_var_parse("CACHE_SOFT_CAP", e.soft_cap)?,
                hard_cap_bytes: env_var_parse("CACHE_HARD_CAP_BYTES", e.hard_cap_bytes)?,
                keep_recent: env_var_parse("CACHE_KEEP_RECENT", e.keep_recent)?,
            },
        };

        Ok(Self {
            host,
            port,
            provider,
            orchestrator,
            store,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            provider,
            orchestrator: OrchestratorConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject combinations the orchestrator cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_fan_out_width == 0 {
            return Err(ConfigError::InvalidValue(
                "FAN_OUT_WIDTH".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.default_fan_out_width > self.max_fan_out_width {
            return Err(ConfigError::InvalidValue(
                "FAN_OUT_WIDTH".to_string(),
                format!("exceeds MAX_FAN_OUT_WIDTH ({})", self.max_fan_out_width),
            ));
        }
        if self.min_success == 0 {
            return Err(ConfigError::InvalidValue(
                "MIN_SUCCESS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("SUB_JOB_TIMEOUT_SECS", self.sub_job_timeout),
            ("MONITOR_INTERVAL_SECS", self.monitor_interval),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
        }
        // A sub-job that runs into its timeout must not look stalled.
        if self.stall_threshold <= self.sub_job_timeout {
            return Err(ConfigError::InvalidValue(
                "STALL_THRESHOLD_SECS".to_string(),
                format!(
                    "must exceed SUB_JOB_TIMEOUT_SECS ({}s)",
                    self.sub_job_timeout.as_secs()
                ),
            ));
        }
        Ok(())
    }

    /// Effective K for a task of the given width.
    pub fn min_success_for(&self, width: usize) -> usize {
        self.min_success.clamp(1, width.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn min_success_is_clamped_to_width() {
        let config = OrchestratorConfig {
            min_success: 2,
            ..Default::default()
        };
        assert_eq!(config.min_success_for(3), 2);
        assert_eq!(config.min_success_for(1), 1);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = OrchestratorConfig {
            monitor_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(name, _)) if name == "MONITOR_INTERVAL_SECS"
        ));

        let config = OrchestratorConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(name, _)) if name == "SWEEP_INTERVAL_SECS"
        ));
    }

    #[test]
    fn stall_threshold_must_outlast_sub_job_timeout() {
        let defaults = OrchestratorConfig::default();
        assert!(defaults.stall_threshold > defaults.sub_job_timeout);

        let config = OrchestratorConfig {
            sub_job_timeout: Duration::from_secs(120),
            stall_threshold: Duration::from_secs(120),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(name, _)) if name == "STALL_THRESHOLD_SECS"
        ));
    }

    #[test]
    fn zero_width_is_rejected() {
        let config = OrchestratorConfig {
            default_fan_out_width: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(name, _)) if name == "FAN_OUT_WIDTH"
        ));
    }
}
