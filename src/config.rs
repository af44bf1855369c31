//! Validated configuration snapshot for the job queue engine.
//!
//! Mirrors the shape of this codebase's other config types (see
//! `PipelineConfig`/`ConfigError` in the pipeline module this was adapted
//! from): a plain struct with a `Default` impl matching the documented
//! defaults, a builder of `with_*` setters, and a `validate()` that returns a
//! typed error instead of panicking.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::job::Priority;

/// Errors raised while constructing or validating a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Exponential backoff parameters applied before a failed job is republished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter expressed as a fraction of `base`, e.g. `1.0` means the full
    /// `[0, base)` range described in spec §4.3.
    pub jitter_pct: f64,
}

impl RetryBackoff {
    /// Computes the delay before retry `retries` (1-indexed) becomes
    /// eligible: `min(base * 2^(retries-1), cap)` plus jitter in `[0, base)`.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(32);
        let scaled = self.base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        let bounded = scaled.min(self.cap);
        let jitter_span = self.base.mul_f64(self.jitter_pct.clamp(0.0, 1.0));
        let jitter = if jitter_span.is_zero() {
            Duration::ZERO
        } else {
            jitter_span.mul_f64(rand::rng().random::<f64>())
        };
        bounded + jitter
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            cap: Duration::from_secs(30),
            jitter_pct: 1.0,
        }
    }
}

/// Circuit breaker thresholds, one set per worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub trip_window: Duration,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_threshold: 2,
            trip_window: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Validated configuration snapshot for every tunable named in spec §6.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub priorities: Vec<Priority>,
    pub key_prefix: String,
    pub completed_list: Option<String>,
    pub dead_letter_list: String,
    pub worker_count: usize,
    pub brpop_lpush_timeout: Duration,
    pub heartbeat_ttl: Duration,
    pub heartbeat_refresh_interval: Duration,
    pub job_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: RetryBackoff,
    pub reap_interval: Duration,
    pub max_reaps: Option<u32>,
    pub enqueue_rate_per_sec: u64,
    pub rate_limit_key: String,
    pub rate_limit_jitter: Duration,
    pub breaker: BreakerConfig,
    pub shutdown_grace: Duration,
    pub max_job_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let key_prefix = "jobqueue:".to_string();
        Self {
            priorities: vec![Priority::high(), Priority::low()],
            dead_letter_list: format!("{key_prefix}dead_letter"),
            completed_list: Some(format!("{key_prefix}completed")),
            worker_count: 4,
            brpop_lpush_timeout: Duration::from_secs(1),
            heartbeat_ttl: Duration::from_secs(30),
            heartbeat_refresh_interval: Duration::from_secs(10),
            job_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_backoff: RetryBackoff::default(),
            reap_interval: Duration::from_secs(5),
            max_reaps: None,
            enqueue_rate_per_sec: 500,
            rate_limit_key: format!("{key_prefix}rate_limit"),
            rate_limit_jitter: Duration::from_millis(50),
            breaker: BreakerConfig::default(),
            shutdown_grace: Duration::from_secs(30),
            max_job_bytes: 1 << 20,
            key_prefix,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Key for a given priority's backlog list.
    pub fn queue_key(&self, priority: &Priority) -> String {
        format!("{}queue:{}", self.key_prefix, priority.as_str())
    }

    /// Key for a worker's private processing list.
    pub fn processing_key(&self, worker_id: &str) -> String {
        format!("{}worker:{}:processing", self.key_prefix, worker_id)
    }

    /// Key for a worker's heartbeat token.
    pub fn heartbeat_key(&self, worker_id: &str) -> String {
        format!("{}processing:worker:{}", self.key_prefix, worker_id)
    }

    /// Key used for fast worker-roster enumeration.
    pub fn workers_key(&self) -> String {
        // A set at `{prefix}workers`; membership is maintained by workers on
        // start/stop, the registry optimization mentioned in spec §9.
        format!("{}workers", self.key_prefix)
    }

    /// Validates cross-field invariants named in spec §4.9 and §8.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.priorities.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "priorities must not be empty".to_string(),
            ));
        }
        if self.dead_letter_list.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "dead_letter_list".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let min_ttl = self.heartbeat_refresh_interval.saturating_mul(3);
        if self.heartbeat_ttl < min_ttl {
            return Err(ConfigError::ValidationFailed(format!(
                "heartbeat_ttl ({:?}) must be at least 3x heartbeat_refresh_interval ({:?})",
                self.heartbeat_ttl, self.heartbeat_refresh_interval
            )));
        }
        if self.max_job_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_job_bytes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Builds a `Config` from `JOBQUEUE_*`-prefixed environment variables,
    /// falling back to defaults for anything unset. Priority: explicit
    /// environment variable, then the corresponding `Default` field.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(prefix) = std::env::var("JOBQUEUE_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Ok(workers) = std::env::var("JOBQUEUE_WORKER_COUNT") {
            config.worker_count = workers.parse().map_err(|_| ConfigError::InvalidValue {
                key: "JOBQUEUE_WORKER_COUNT".to_string(),
                message: format!("'{workers}' is not a valid integer"),
            })?;
        }
        if let Ok(rate) = std::env::var("JOBQUEUE_ENQUEUE_RATE_PER_SEC") {
            config.enqueue_rate_per_sec = rate.parse().map_err(|_| ConfigError::InvalidValue {
                key: "JOBQUEUE_ENQUEUE_RATE_PER_SEC".to_string(),
                message: format!("'{rate}' is not a valid integer"),
            })?;
        }
        if let Ok(max_retries) = std::env::var("JOBQUEUE_MAX_RETRIES") {
            config.max_retries = max_retries.parse().map_err(|_| ConfigError::InvalidValue {
                key: "JOBQUEUE_MAX_RETRIES".to_string(),
                message: format!("'{max_retries}' is not a valid integer"),
            })?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Builder for [`Config`], following the same `with_*` pattern as this
/// codebase's other config builders (e.g. `WorkerPoolConfig`).
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: ConfigOverride,
}

#[derive(Debug, Clone, Default)]
struct ConfigOverride {
    base: Option<Config>,
}

impl ConfigBuilder {
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.ensure_base().worker_count = n;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.ensure_base().max_retries = n;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ensure_base().key_prefix = prefix.into();
        self
    }

    pub fn with_enqueue_rate_per_sec(mut self, rate: u64) -> Self {
        self.ensure_base().enqueue_rate_per_sec = rate;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.ensure_base().breaker = breaker;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.ensure_base().retry_backoff = backoff;
        self
    }

    fn ensure_base(&mut self) -> &mut Config {
        self.config.base.get_or_insert_with(Config::default)
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let config = self.config.base.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_short_heartbeat_ttl() {
        let mut config = Config::default();
        config.heartbeat_ttl = Duration::from_secs(1);
        config.heartbeat_refresh_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_priorities() {
        let mut config = Config::default();
        config.priorities.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::builder()
            .with_worker_count(8)
            .with_max_retries(5)
            .build()
            .expect("valid config");
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let backoff = RetryBackoff {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(35),
            jitter_pct: 0.0,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(20));
        // 10 * 2^2 = 40, capped to 35
        assert_eq!(backoff.delay_for(3), Duration::from_millis(35));
    }

    #[test]
    fn queue_and_processing_keys_use_prefix() {
        let config = Config::default();
        assert_eq!(config.queue_key(&Priority::high()), "jobqueue:queue:high");
        assert_eq!(
            config.processing_key("worker-0"),
            "jobqueue:worker:worker-0:processing"
        );
    }
}
