use std::time::Duration;

use serde::Deserialize;

use crate::models::tier::ServiceTier;
use crate::services::processor::ProcessorConfig;
use crate::services::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Provider plan: "free" or "paid".
    #[serde(default)]
    pub service_tier: ServiceTier,

    /// Annotation provider endpoint
    pub generator_url: String,

    /// Bearer token for the annotation provider
    #[serde(default)]
    pub generator_api_token: Option<String>,

    /// Jobs sharing a scope share one provider rate limiter.
    #[serde(default = "default_credential_scope")]
    pub credential_scope: String,

    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Per provider call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Longest wait for a rate-limit token
    #[serde(default = "default_rate_limit_timeout_secs")]
    pub rate_limit_timeout_secs: u64,

    /// Consecutive identical transport failures that fail a job (0 disables)
    #[serde(default = "default_systemic_failure_threshold")]
    pub systemic_failure_threshold: u32,

    /// Finished jobs are kept this long
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_credential_scope() -> String {
    "default".to_string()
}

fn default_max_batch_items() -> usize {
    500
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_rate_limit_timeout_secs() -> u64 {
    120
}

fn default_systemic_failure_threshold() -> u32 {
    5
}

fn default_job_ttl_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("MAX_BATCH_ITEMS", self.max_batch_items as u64),
            ("CALL_TIMEOUT_SECS", self.call_timeout_secs),
            ("RATE_LIMIT_TIMEOUT_SECS", self.rate_limit_timeout_secs),
        ];
        match required.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Zero(*name)),
            None => Ok(()),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            tier: self.service_tier,
            credential_scope: self.credential_scope.clone(),
            max_batch_items: self.max_batch_items,
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
            call_timeout: self.call_timeout(),
            acquire_timeout: Duration::from_secs(self.rate_limit_timeout_secs),
            systemic_failure_threshold: self.systemic_failure_threshold,
        }
    }
}
