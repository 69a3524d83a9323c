//! Queue configuration
//!
//! Values come from `Default`, a JSON document, or environment variables.
//! Durations are expressed in milliseconds in both external forms.

use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const ENV_LANE_TIMEOUT_MS: &str = "LANEKEEPER_LANE_TIMEOUT_MS";
pub const ENV_OPERATION_TIMEOUT_MS: &str = "LANEKEEPER_OPERATION_TIMEOUT_MS";
pub const ENV_MAX_PENDING: &str = "LANEKEEPER_MAX_PENDING";

/// Errors from loading or validating a configuration
#[derive(Debug)]
pub enum ConfigError {
    /// JSON input could not be parsed
    Parse(String),
    /// A value is out of range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "Failed to parse queue config: {msg}"),
            Self::Invalid(msg) => write!(f, "Invalid queue config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Limits applied by the serialization queue and the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long an operation may wait for all of its lanes to be granted
    pub lane_timeout: Duration,
    /// Budget for the operation body while it holds its lanes
    pub operation_timeout: Duration,
    /// High-water mark of tickets (holder plus waiters) per lane
    pub max_pending_per_lane: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lane_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
            max_pending_per_lane: 1024,
        }
    }
}

/// External form, every field optional
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    lane_timeout_ms: Option<u64>,
    operation_timeout_ms: Option<u64>,
    max_pending_per_lane: Option<usize>,
}

impl QueueConfig {
    /// Parse a JSON object; missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` on malformed JSON or unknown fields, and
    /// `ConfigError::Invalid` if a value is zero.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config = Self::default().apply(raw);
        config.validate()?;
        Ok(config)
    }

    /// Read overrides from the `LANEKEEPER_*` environment variables.
    ///
    /// Malformed and zero values are logged and ignored, so the result always
    /// passes [`QueueConfig::validate`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an explicit variable source
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let raw = RawConfig {
            lane_timeout_ms: parse_var(&lookup, ENV_LANE_TIMEOUT_MS),
            operation_timeout_ms: parse_var(&lookup, ENV_OPERATION_TIMEOUT_MS),
            max_pending_per_lane: parse_var(&lookup, ENV_MAX_PENDING),
        };
        Self::default().apply(raw)
    }

    /// # Errors
    /// Returns `ConfigError::Invalid` if any limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lane_timeout.is_zero() {
            return Err(ConfigError::Invalid("lane_timeout must be positive".into()));
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "operation_timeout must be positive".into(),
            ));
        }
        if self.max_pending_per_lane == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_per_lane must be positive".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_lane_timeout(mut self, timeout: Duration) -> Self {
        self.lane_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending_per_lane = max_pending;
        self
    }

    fn apply(mut self, raw: RawConfig) -> Self {
        if let Some(ms) = raw.lane_timeout_ms {
            self.lane_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.operation_timeout_ms {
            self.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = raw.max_pending_per_lane {
            self.max_pending_per_lane = n;
        }
        self
    }
}

/// Positive number from the variable `name`
fn parse_var<T: std::str::FromStr + Default + PartialEq>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let value = lookup(name)?;
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed == T::default() => {
            log::warn!("config: ignoring {name}={value:?}, must be positive");
            None
        }
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("config: ignoring malformed {name}={value:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lane_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_json_partial() {
        let config = QueueConfig::from_json(r#"{"operation_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.lane_timeout, QueueConfig::default().lane_timeout);
    }

    #[test]
    fn test_from_json_rejects_zero_and_unknown() {
        assert!(matches!(
            QueueConfig::from_json(r#"{"max_pending_per_lane": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            QueueConfig::from_json(r#"{"lane_timeout": 5}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_lookup_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            (ENV_LANE_TIMEOUT_MS, "1500"),
            (ENV_OPERATION_TIMEOUT_MS, "soon"),
            (ENV_MAX_PENDING, " 8 "),
        ]
        .into_iter()
        .collect();
        let config = QueueConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string()));
        assert_eq!(config.lane_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.operation_timeout,
            QueueConfig::default().operation_timeout
        );
        assert_eq!(config.max_pending_per_lane, 8);
    }

    #[test]
    fn test_from_lookup_ignores_zero_values() {
        let vars: HashMap<&str, &str> = [
            (ENV_LANE_TIMEOUT_MS, "0"),
            (ENV_OPERATION_TIMEOUT_MS, "0"),
            (ENV_MAX_PENDING, "0"),
        ]
        .into_iter()
        .collect();
        let config = QueueConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string()));
        assert_eq!(config, QueueConfig::default());
        assert!(config.validate().is_ok());
    }
}
