//! Configuration for agents on the messaging fabric.
//!
//! Defaults match the reference deployment (a local NATS server, 30 second
//! heartbeats, 1 MiB payloads). Every field can be overridden from the
//! environment:
//!
//! | Variable | Default |
//! |---|---|
//! | `NATS_URL` | `nats://localhost:4222` |
//! | `NATS_CONNECT_TIMEOUT_SECS` | `5` |
//! | `NATS_MAX_RECONNECT_ATTEMPTS` | `10` |
//! | `NATS_RECONNECT_INTERVAL_SECS` | `2` |
//! | `AGENT_HEARTBEAT_INTERVAL_SECS` | `30` |
//! | `AGENT_REQUEST_TIMEOUT_SECS` | `30` |
//! | `NATS_MAX_PAYLOAD_BYTES` | `1048576` |
//! | `AGENT_LIVENESS_MISSED_HEARTBEATS` | `3` |

#![warn(missing_docs, clippy::pedantic)]

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Environment variable naming the transport server.
pub const ENV_SERVER_ADDRESS: &str = "NATS_URL";
/// Environment variable for the connection timeout in seconds.
pub const ENV_CONNECT_TIMEOUT: &str = "NATS_CONNECT_TIMEOUT_SECS";
/// Environment variable for the reconnect attempt budget.
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "NATS_MAX_RECONNECT_ATTEMPTS";
/// Environment variable for the spacing between reconnect attempts in seconds.
pub const ENV_RECONNECT_INTERVAL: &str = "NATS_RECONNECT_INTERVAL_SECS";
/// Environment variable for the heartbeat interval in seconds.
pub const ENV_HEARTBEAT_INTERVAL: &str = "AGENT_HEARTBEAT_INTERVAL_SECS";
/// Environment variable for the default request timeout in seconds.
pub const ENV_REQUEST_TIMEOUT: &str = "AGENT_REQUEST_TIMEOUT_SECS";
/// Environment variable for the maximum envelope size in bytes.
pub const ENV_MAX_PAYLOAD: &str = "NATS_MAX_PAYLOAD_BYTES";
/// Environment variable for the number of missed heartbeats before a peer is offline.
pub const ENV_MISSED_HEARTBEATS: &str = "AGENT_LIVENESS_MISSED_HEARTBEATS";

const DEFAULT_SERVER_ADDRESS: &str = "nats://localhost:4222";

/// Errors produced while loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A value could not be parsed or is out of range.
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        /// Setting name (usually the environment variable).
        key: &'static str,
        /// Offending value.
        value: String,
        /// Human-readable reason.
        reason: &'static str,
    },
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings shared by the transport session and the presence manager.
///
/// Serializes with durations in whole seconds, matching the environment
/// variables, so the effective configuration can be logged or printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagingConfig {
    server_address: String,
    #[serde(rename = "connect_timeout_secs", serialize_with = "as_secs")]
    connect_timeout: Duration,
    max_reconnect_attempts: usize,
    #[serde(rename = "reconnect_interval_secs", serialize_with = "as_secs")]
    reconnect_interval: Duration,
    #[serde(rename = "heartbeat_interval_secs", serialize_with = "as_secs")]
    heartbeat_interval: Duration,
    #[serde(rename = "request_timeout_secs", serialize_with = "as_secs")]
    request_timeout: Duration,
    max_payload: usize,
    missed_heartbeats: u32,
}

fn as_secs<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_owned(),
            connect_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            reconnect_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            max_payload: 1_048_576,
            missed_heartbeats: 3,
        }
    }
}

impl MessagingConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a variable is set but cannot be
    /// parsed, or when the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Blank values are treated as unset.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(address) = lookup(ENV_SERVER_ADDRESS) {
            config.server_address = address;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_CONNECT_TIMEOUT)? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse::<usize>(&lookup, ENV_MAX_RECONNECT_ATTEMPTS)? {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_RECONNECT_INTERVAL)? {
            config.reconnect_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_HEARTBEAT_INTERVAL)? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_REQUEST_TIMEOUT)? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse::<usize>(&lookup, ENV_MAX_PAYLOAD)? {
            config.max_payload = bytes;
        }
        if let Some(missed) = parse::<u32>(&lookup, ENV_MISSED_HEARTBEATS)? {
            config.missed_heartbeats = missed;
        }

        config.validate()?;
        debug!(server = %config.server_address, "messaging configuration loaded");
        Ok(config)
    }

    /// Checks that durations and limits are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server_address.trim().is_empty() {
            return Err(invalid(ENV_SERVER_ADDRESS, &self.server_address, "address cannot be empty"));
        }
        let durations = [
            (ENV_CONNECT_TIMEOUT, self.connect_timeout),
            (ENV_RECONNECT_INTERVAL, self.reconnect_interval),
            (ENV_HEARTBEAT_INTERVAL, self.heartbeat_interval),
            (ENV_REQUEST_TIMEOUT, self.request_timeout),
        ];
        for (key, duration) in durations {
            if duration.is_zero() {
                return Err(invalid(key, "0", "must be greater than zero"));
            }
        }
        if self.max_payload == 0 {
            return Err(invalid(ENV_MAX_PAYLOAD, "0", "must be greater than zero"));
        }
        if self.missed_heartbeats == 0 {
            return Err(invalid(ENV_MISSED_HEARTBEATS, "0", "must be greater than zero"));
        }
        Ok(())
    }

    /// Returns the transport server address.
    #[must_use]
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    /// Returns the connection timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns how many reconnects are attempted before the link is given up.
    #[must_use]
    pub const fn max_reconnect_attempts(&self) -> usize {
        self.max_reconnect_attempts
    }

    /// Returns the fixed spacing between reconnect attempts.
    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Returns the default request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the maximum encoded envelope size in bytes.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Returns how many consecutive heartbeats a peer may miss before it is
    /// reported offline.
    #[must_use]
    pub const fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    /// Overrides the server address.
    #[must_use]
    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = address.into();
        self
    }

    /// Overrides the connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the reconnect budget and spacing.
    #[must_use]
    pub const fn with_reconnect(mut self, attempts: usize, interval: Duration) -> Self {
        self.max_reconnect_attempts = attempts;
        self.reconnect_interval = interval;
        self
    }

    /// Overrides the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Overrides the default request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the maximum payload size.
    #[must_use]
    pub const fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Overrides the liveness threshold.
    #[must_use]
    pub const fn with_missed_heartbeats(mut self, missed: u32) -> Self {
        self.missed_heartbeats = missed;
        self
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> ConfigResult<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| invalid(key, &raw, "expected a non-negative integer"))
        })
        .transpose()
}

fn invalid(key: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_owned(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = MessagingConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, MessagingConfig::default());
        assert_eq!(config.server_address(), "nats://localhost:4222");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.max_payload(), 1_048_576);
    }

    #[test]
    fn applies_environment_overrides() {
        let config = MessagingConfig::from_lookup(lookup_from(&[
            (ENV_SERVER_ADDRESS, "nats://mesh:4222"),
            (ENV_CONNECT_TIMEOUT, "9"),
            (ENV_MAX_RECONNECT_ATTEMPTS, "0"),
            (ENV_HEARTBEAT_INTERVAL, " 15 "),
            (ENV_MAX_PAYLOAD, "2048"),
            (ENV_REQUEST_TIMEOUT, ""),
        ]))
        .unwrap();

        assert_eq!(config.server_address(), "nats://mesh:4222");
        assert_eq!(config.connect_timeout(), Duration::from_secs(9));
        assert_eq!(config.max_reconnect_attempts(), 0);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.max_payload(), 2048);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = MessagingConfig::from_lookup(lookup_from(&[(ENV_RECONNECT_INTERVAL, "soon")]))
            .expect_err("should fail");
        assert!(err.to_string().contains(ENV_RECONNECT_INTERVAL));
    }

    #[test]
    fn serializes_durations_as_seconds() {
        let config = MessagingConfig::default().with_request_timeout(Duration::from_millis(1500));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["server_address"], "nats://localhost:4222");
        assert_eq!(value["heartbeat_interval_secs"], 30.0);
        assert_eq!(value["request_timeout_secs"], 1.5);
        assert_eq!(value["missed_heartbeats"], 3);
    }

    #[test]
    fn rejects_zero_durations() {
        let err = MessagingConfig::from_lookup(lookup_from(&[(ENV_HEARTBEAT_INTERVAL, "0")]))
            .expect_err("should fail");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: ENV_HEARTBEAT_INTERVAL,
                ..
            }
        ));

        let config = MessagingConfig::default().with_max_payload(0);
        assert!(config.validate().is_err());
    }
}
