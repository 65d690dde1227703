//! Runtime configuration.
//!
//! Every knob has a default; `LikeQueueConfig::from_env` overrides them from
//! `LIKEQUEUE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;
use crate::domain::{DEFAULT_MAX_ATTEMPTS, LikeFlag};

pub const ENV_PREFIX: &str = "LIKEQUEUE_";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("{0}")]
    Rejected(String),
}

/// Names of the two counter fields on the remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterFields {
    pub resolved: String,
    pub unresolved: String,
}

impl Default for CounterFields {
    fn default() -> Self {
        Self {
            resolved: "resolved_count".to_string(),
            unresolved: "unresolved_count".to_string(),
        }
    }
}

impl CounterFields {
    pub fn field(&self, flag: LikeFlag) -> &str {
        match flag {
            LikeFlag::Resolved => &self.resolved,
            LikeFlag::Unresolved => &self.unresolved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikeQueueConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    /// How long one dequeue call may wait before the loop checks for shutdown.
    pub dequeue_timeout_ms: u64,
    /// Sleep after an empty dequeue or a store error.
    pub idle_sleep_ms: u64,
    pub sweep_interval_ms: u64,
    pub dispatcher_workers: usize,
    /// How long a dequeued task stays claimed before recovery may take it.
    pub claim_ttl_ms: u64,
    /// Move tasks whose claim has expired back to pending on start. Tasks
    /// claimed by a live consumer on a shared store are left alone.
    pub recover_on_start: bool,
    /// Namespace for keys in a shared store.
    pub key_prefix: String,
    pub counter_fields: CounterFields,
    pub redis_url: Option<String>,
    pub log_json: bool,
}

impl Default for LikeQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: 2_000,
            retry_multiplier: 2.0,
            dequeue_timeout_ms: 1_000,
            idle_sleep_ms: 100,
            sweep_interval_ms: 100,
            dispatcher_workers: 1,
            claim_ttl_ms: 30_000,
            recover_on_start: true,
            key_prefix: "likequeue".to_string(),
            counter_fields: CounterFields::default(),
            redis_url: None,
            log_json: false,
        }
    }
}

impl LikeQueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (keys include the `LIKEQUEUE_` prefix).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (key, v))
        };

        let mut cfg = Self::default();
        if let Some((k, v)) = get("MAX_ATTEMPTS") {
            cfg.max_attempts = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_BASE_DELAY_MS") {
            cfg.retry_base_delay_ms = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_MULTIPLIER") {
            cfg.retry_multiplier = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("DEQUEUE_TIMEOUT_MS") {
            cfg.dequeue_timeout_ms = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("IDLE_SLEEP_MS") {
            cfg.idle_sleep_ms = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("SWEEP_INTERVAL_MS") {
            cfg.sweep_interval_ms = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("DISPATCHER_WORKERS") {
            cfg.dispatcher_workers = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("CLAIM_TTL_MS") {
            cfg.claim_ttl_ms = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("RECOVER_ON_START") {
            cfg.recover_on_start = parse_bool(&k, &v)?;
        }
        if let Some((_, v)) = get("KEY_PREFIX") {
            cfg.key_prefix = v;
        }
        if let Some((_, v)) = get("RESOLVED_FIELD") {
            cfg.counter_fields.resolved = v;
        }
        if let Some((_, v)) = get("UNRESOLVED_FIELD") {
            cfg.counter_fields.unresolved = v;
        }
        if let Some((_, v)) = get("REDIS_URL") {
            cfg.redis_url = Some(v);
        }
        if let Some((k, v)) = get("LOG_JSON") {
            cfg.log_json = parse_bool(&k, &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Rejected("max_attempts must be at least 1".into()));
        }
        if self.dispatcher_workers == 0 {
            return Err(ConfigError::Rejected(
                "dispatcher_workers must be at least 1".into(),
            ));
        }
        // a zero timeout would block the dequeue forever and never see shutdown
        if self.dequeue_timeout_ms == 0 {
            return Err(ConfigError::Rejected(
                "dequeue_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.claim_ttl_ms == 0 {
            return Err(ConfigError::Rejected(
                "claim_ttl_ms must be greater than 0".into(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Rejected(
                "sweep_interval_ms must be greater than 0".into(),
            ));
        }
        if !(self.retry_multiplier.is_finite() && self.retry_multiplier >= 1.0) {
            return Err(ConfigError::Rejected(
                "retry_multiplier must be a finite number >= 1".into(),
            ));
        }
        if self.counter_fields.resolved == self.counter_fields.unresolved {
            return Err(ConfigError::Rejected(
                "resolved and unresolved counters must be different fields".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_multiplier,
        )
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
