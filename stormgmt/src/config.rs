//! Configuration for stormgmt.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::ConfigError;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LINGER_TIME: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REAP_CYCLE: Duration = Duration::from_secs(60);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for a freshly created volume or snapshot to leave `Creating`.
pub const CREATE_RETRY: Backoff =
    Backoff::new(Duration::from_millis(250), 2.0, Duration::from_secs(2), 8);
/// Wait for a deleted volume or snapshot to disappear.
pub const DELETE_RETRY: Backoff =
    Backoff::new(Duration::from_millis(200), 2.0, Duration::from_secs(1), 15);
/// Optimistic-concurrency update cycle.
pub const UPDATE_RETRY: Backoff =
    Backoff::new(Duration::from_millis(250), 1.5, Duration::from_secs(1), 15);

const _: () = {
    assert!(DEFAULT_REAP_CYCLE.as_millis() <= DEFAULT_LINGER_TIME.as_millis());
    assert!(CREATE_RETRY.retries > 0);
    assert!(DELETE_RETRY.retries > 0);
    assert!(UPDATE_RETRY.retries > 0);
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Connection pool timing. Unset or zero values use the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub dial_timeout_ms: Option<u64>,
    pub linger_time_ms: Option<u64>,
    pub reap_cycle_ms: Option<u64>,
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    match value {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => default,
    }
}

impl PoolConfig {
    pub fn dial_timeout(&self) -> Duration {
        millis_or(self.dial_timeout_ms, DEFAULT_DIAL_TIMEOUT)
    }

    pub fn linger_time(&self) -> Duration {
        millis_or(self.linger_time_ms, DEFAULT_LINGER_TIME)
    }

    pub fn reap_cycle(&self) -> Duration {
        millis_or(self.reap_cycle_ms, DEFAULT_REAP_CYCLE)
    }
}

/// Tuning of a single backoff loop as written in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub delay_ms: Option<u64>,
    pub factor: Option<f64>,
    pub delay_limit_ms: Option<u64>,
    pub retries: Option<u32>,
}

impl BackoffConfig {
    pub fn resolve(&self, default: Backoff) -> Backoff {
        Backoff {
            delay: millis_or(self.delay_ms, default.delay),
            factor: self.factor.unwrap_or(default.factor),
            delay_limit: self.delay_limit_ms.map_or(default.delay_limit, Duration::from_millis),
            retries: self.retries.unwrap_or(default.retries),
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if let Some(factor) = self.factor {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "factor must be a positive number",
                });
            }
        }
        Ok(())
    }
}

/// Per-family retry tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub create: BackoffConfig,
    pub delete: BackoffConfig,
    pub update: BackoffConfig,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.create.validate("retry.create.factor")?;
        self.delete.validate("retry.delete.factor")?;
        self.update.validate("retry.update.factor")
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            create: self.create.resolve(CREATE_RETRY),
            delete: self.delete.resolve(DELETE_RETRY),
            update: self.update.resolve(UPDATE_RETRY),
        }
    }
}

/// Resolved backoff parameters for each lifecycle operation family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub create: Backoff,
    pub delete: Backoff,
    pub update: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            create: CREATE_RETRY,
            delete: DELETE_RETRY,
            update: UPDATE_RETRY,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-call cap applied when the caller's context has no deadline.
    pub call_timeout_ms: Option<u64>,
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Duration {
        millis_or(self.call_timeout_ms, DEFAULT_CALL_TIMEOUT)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.retry.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.dial_timeout(), Duration::from_secs(10));
        assert_eq!(config.linger_time(), Duration::from_secs(600));
        assert_eq!(config.reap_cycle(), Duration::from_secs(60));
    }

    #[test]
    fn pool_config_zero_means_default() {
        let config = PoolConfig {
            dial_timeout_ms: Some(0),
            linger_time_ms: Some(1500),
            reap_cycle_ms: None,
        };
        assert_eq!(config.dial_timeout(), DEFAULT_DIAL_TIMEOUT);
        assert_eq!(config.linger_time(), Duration::from_millis(1500));
    }

    #[test]
    fn retry_policy_defaults_match_constants() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.delete.retries, 15);
        assert_eq!(policy.update.factor, 1.5);
    }

    #[test]
    fn retry_overrides_are_partial() {
        let config = Config::parse(
            r#"
            [retry.update]
            retries = 3
            "#,
        )
        .unwrap();
        let update = config.retry.policy().update;
        assert_eq!(update.retries, 3);
        assert_eq!(update.delay, UPDATE_RETRY.delay);
    }

    #[test]
    fn invalid_factor_rejected() {
        let result = Config::parse(
            r#"
            [retry.create]
            factor = -2.0
            "#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                field: "retry.create.factor",
                ..
            })
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pool]\ndial_timeout_ms = 2500\nreap_cycle_ms = 100\n\n[client]\ncall_timeout_ms = 3000"
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.pool.dial_timeout(), Duration::from_millis(2500));
        assert_eq!(config.pool.reap_cycle(), Duration::from_millis(100));
        assert_eq!(config.client.call_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/stormgmt.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn malformed_toml() {
        assert!(matches!(
            Config::parse("[pool\n"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
