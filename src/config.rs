use std::env;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct ConsumerTuning {
    pub count: i64,
    pub block: Option<Duration>,
    pub min_idle: Duration,
    pub max_retry: i64,
    pub cache_limit: usize,
    pub cache_timeout: Duration,
    pub status_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: String,
    pub payment_base_url: String,
    pub report_bucket: String,
    pub aws_region: String,
    pub aws_endpoint_url: Option<String>,
    pub notify_topic: String,
    pub notify_enabled: bool,
    pub consumer: ConsumerTuning,
    pub prepare_config_stream: String,
    pub submit_config_stream: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_url = require_env("REDIS_URL")?;
        validate_url(&redis_url, "REDIS_URL", &["redis://", "rediss://"])?;

        let payment_base_url = require_env("PAYMENT_BASE_URL")?;
        validate_url(&payment_base_url, "PAYMENT_BASE_URL", &["http://", "https://"])?;

        let report_bucket = require_env("REPORT_BUCKET")?;
        let aws_region = require_env("AWS_REGION")?;
        let aws_endpoint_url = env::var("AWS_ENDPOINT_URL").ok().filter(|s| !s.is_empty());

        let notify_topic = env::var("NOTIFY_TOPIC").unwrap_or_else(|_| "payout-complete".into());
        let notify_enabled: bool = parse_env_or("NOTIFY_ENABLED", false)?;

        let consumer_count: i64 = parse_env_or("CONSUMER_COUNT", 20)?;
        let consumer_block_ms: u64 = parse_env_or("CONSUMER_BLOCK_MS", 0)?;
        let consumer_min_idle_ms: u64 = parse_env_or("CONSUMER_MIN_IDLE_MS", 5_000)?;
        let consumer_max_retry: i64 = parse_env_or("CONSUMER_MAX_RETRY", -1)?;
        let consumer_cache_limit: usize = parse_env_or("CONSUMER_CACHE_LIMIT", 10)?;
        if consumer_cache_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "CONSUMER_CACHE_LIMIT",
                reason: "must be > 0".into(),
            });
        }
        let consumer_cache_timeout_ms: u64 = parse_env_or("CONSUMER_CACHE_TIMEOUT_MS", 1_000)?;
        let consumer_status_timeout_ms: u64 = parse_env_or("CONSUMER_STATUS_TIMEOUT_MS", 10_000)?;
        if consumer_status_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "CONSUMER_STATUS_TIMEOUT_MS",
                reason: "must be > 0".into(),
            });
        }

        let prepare_config_stream = env::var("PREPARE_CONFIG_STREAM").unwrap_or_else(|_| "prepare-config".into());
        let submit_config_stream = env::var("SUBMIT_CONFIG_STREAM").unwrap_or_else(|_| "submit-config".into());

        Ok(Self {
            redis_url,
            payment_base_url,
            report_bucket,
            aws_region,
            aws_endpoint_url,
            notify_topic,
            notify_enabled,
            consumer: ConsumerTuning {
                count: consumer_count,
                block: if consumer_block_ms == 0 { None } else { Some(Duration::from_millis(consumer_block_ms)) },
                min_idle: Duration::from_millis(consumer_min_idle_ms),
                max_retry: consumer_max_retry,
                cache_limit: consumer_cache_limit,
                cache_timeout: Duration::from_millis(consumer_cache_timeout_ms),
                status_timeout: Duration::from_millis(consumer_status_timeout_ms),
            },
            prepare_config_stream,
            submit_config_stream,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).ok().filter(|v| !v.is_empty()).ok_or(ConfigError::Missing(name))
}

fn parse_env_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v.parse().map_err(|_| ConfigError::Invalid {
            field: name,
            reason: format!("could not parse '{v}'"),
        }),
        _ => Ok(default),
    }
}

/// Generalizes the teacher's `validate_rpc_url`: accepts any of `schemes`,
/// case-insensitively.
fn validate_url(url: &str, field: &'static str, schemes: &[&str]) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if schemes.iter().any(|s| lower.starts_with(s)) {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        field,
        reason: format!("must start with one of {schemes:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_url_accepts_configured_schemes() {
        assert!(validate_url("redis://localhost:6379", "REDIS_URL", &["redis://", "rediss://"]).is_ok());
        assert!(validate_url("ftp://localhost", "REDIS_URL", &["redis://", "rediss://"]).is_err());
    }

    #[test]
    fn parse_env_or_falls_back_to_default_when_unset() {
        env::remove_var("UPLOADER_TEST_NONEXISTENT_VAR");
        let value: u32 = parse_env_or("UPLOADER_TEST_NONEXISTENT_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }
}
