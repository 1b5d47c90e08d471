//! Process configuration from the environment.
//!
//! `.env` is loaded first (if present), then real environment variables win.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use tradeflow_events::RetryPolicy;

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost:5432/tradeflow";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub redis_url: String,
    /// Concurrent handler invocations per consumer.
    pub consumer_workers: usize,
    pub handler_timeout: Duration,
    /// Deliveries before a message is dead-lettered.
    pub max_deliveries: u32,
    /// Age after which a `Reserved` row is released by the sweeper.
    pub reservation_ttl: Duration,
    pub sweep_interval: Duration,
    pub publish_max_attempts: u32,
    pub publish_base_delay: Duration,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_max_connections: 10,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            consumer_workers: 4,
            handler_timeout: Duration::from_millis(30_000),
            max_deliveries: 5,
            reservation_ttl: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
            publish_max_attempts: 5,
            publish_base_delay: Duration::from_millis(100),
        }
    }
}

impl InfraConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal outside development.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: parse_or(&lookup, "TRADEFLOW_DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            consumer_workers: positive(parse_or(
                &lookup,
                "TRADEFLOW_CONSUMER_WORKERS",
                defaults.consumer_workers,
            )?, "TRADEFLOW_CONSUMER_WORKERS")?,
            handler_timeout: Duration::from_millis(parse_or(
                &lookup,
                "TRADEFLOW_HANDLER_TIMEOUT_MS",
                30_000u64,
            )?),
            max_deliveries: positive(
                parse_or(&lookup, "TRADEFLOW_MAX_DELIVERIES", defaults.max_deliveries)?,
                "TRADEFLOW_MAX_DELIVERIES",
            )?,
            reservation_ttl: Duration::from_secs(parse_or(
                &lookup,
                "TRADEFLOW_RESERVATION_TTL_SECS",
                900u64,
            )?),
            sweep_interval: Duration::from_secs(positive(
                parse_or(&lookup, "TRADEFLOW_SWEEP_INTERVAL_SECS", 60u64)?,
                "TRADEFLOW_SWEEP_INTERVAL_SECS",
            )?),
            publish_max_attempts: positive(
                parse_or(&lookup, "TRADEFLOW_PUBLISH_MAX_ATTEMPTS", defaults.publish_max_attempts)?,
                "TRADEFLOW_PUBLISH_MAX_ATTEMPTS",
            )?,
            publish_base_delay: Duration::from_millis(parse_or(
                &lookup,
                "TRADEFLOW_PUBLISH_BASE_DELAY_MS",
                100u64,
            )?),
        })
    }

    pub fn publish_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.publish_max_attempts,
            self.publish_base_delay,
            Duration::from_secs(10),
        )
    }

    /// The reservation TTL as a chrono duration, for comparing against row timestamps.
    pub fn reservation_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.reservation_ttl).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn positive<T: Default + PartialEq + ToString>(value: T, key: &'static str) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_keys_take_defaults() {
        let config = InfraConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, InfraConfig::default());
        assert_eq!(config.consumer_workers, 4);
        assert_eq!(config.reservation_ttl, Duration::from_secs(900));
    }

    #[test]
    fn values_are_parsed() {
        let config = InfraConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/inventory"),
            ("TRADEFLOW_CONSUMER_WORKERS", "16"),
            ("TRADEFLOW_HANDLER_TIMEOUT_MS", "250"),
            ("TRADEFLOW_RESERVATION_TTL_SECS", " 60 "),
        ]))
        .unwrap();

        assert_eq!(config.database_url, "postgres://db/inventory");
        assert_eq!(config.consumer_workers, 16);
        assert_eq!(config.handler_timeout, Duration::from_millis(250));
        assert_eq!(config.reservation_ttl_chrono(), chrono::Duration::seconds(60));
    }

    #[test]
    fn garbage_is_reported_with_its_key() {
        let err = InfraConfig::from_lookup(lookup(&[("TRADEFLOW_MAX_DELIVERIES", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "TRADEFLOW_MAX_DELIVERIES",
                value: "lots".to_string(),
            }
        );
    }

    #[test]
    fn zero_workers_is_invalid() {
        assert!(InfraConfig::from_lookup(lookup(&[("TRADEFLOW_CONSUMER_WORKERS", "0")])).is_err());
    }
}
