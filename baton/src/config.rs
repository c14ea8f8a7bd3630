//! Client configuration.

use std::time::Duration;

use thiserror::Error;

pub const DRIVER_TIMEOUT_ENV: &str = "BATON_DRIVER_TIMEOUT_MS";
pub const KEEPALIVE_INTERVAL_ENV: &str = "BATON_KEEPALIVE_INTERVAL_MS";
pub const COMMAND_QUEUE_CAPACITY_ENV: &str = "BATON_COMMAND_QUEUE_CAPACITY";
pub const USE_CONDUCTOR_INVOKER_ENV: &str = "BATON_USE_CONDUCTOR_INVOKER";

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Parse { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("keepalive interval ({keepalive_ms} ms) must be shorter than driver timeout ({timeout_ms} ms)")]
    KeepaliveTooLong { keepalive_ms: u128, timeout_ms: u128 },
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Heartbeat age after which the driver is considered dead.
    pub driver_timeout: Duration,
    /// How often the conductor tells the driver this client is alive.
    pub keepalive_interval: Duration,
    /// Slots in the application → conductor command channel.
    pub command_queue_capacity: usize,
    /// Commands forwarded per conductor iteration.
    pub command_batch_limit: usize,
    /// Driver responses handled per conductor iteration.
    pub response_batch_limit: usize,
    /// Conductor sleep when an iteration found nothing to do.
    pub idle_sleep: Duration,
    /// Run no conductor thread; the application calls `Client::invoke`.
    pub use_conductor_invoker: bool,
    pub conductor_thread_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            driver_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_millis(500),
            command_queue_capacity: 1024,
            command_batch_limit: 64,
            response_batch_limit: 64,
            idle_sleep: Duration::from_millis(1),
            use_conductor_invoker: false,
            conductor_thread_name: "baton-conductor".to_owned(),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `BATON_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for a malformed variable, or whatever
    /// [`validate`](Self::validate) rejects.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, DRIVER_TIMEOUT_ENV)? {
            config.driver_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, KEEPALIVE_INTERVAL_ENV)? {
            config.keepalive_interval = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse::<usize>(&lookup, COMMAND_QUEUE_CAPACITY_ENV)? {
            config.command_queue_capacity = capacity;
        }
        if let Some(invoker) = parse::<bool>(&lookup, USE_CONDUCTOR_INVOKER_ENV)? {
            config.use_conductor_invoker = invoker;
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Zero capacities, limits or timeouts, or a keepalive interval that is
    /// not shorter than the driver timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver_timeout.is_zero() {
            return Err(ConfigError::Zero("driver_timeout"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Zero("keepalive_interval"));
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::Zero("command_queue_capacity"));
        }
        if self.command_batch_limit == 0 {
            return Err(ConfigError::Zero("command_batch_limit"));
        }
        if self.response_batch_limit == 0 {
            return Err(ConfigError::Zero("response_batch_limit"));
        }
        if self.keepalive_interval >= self.driver_timeout {
            return Err(ConfigError::KeepaliveTooLong {
                keepalive_ms: self.keepalive_interval.as_millis(),
                timeout_ms: self.driver_timeout.as_millis(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    #[must_use]
    pub fn with_command_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_conductor_invoker(mut self, enabled: bool) -> Self {
        self.use_conductor_invoker = enabled;
        self
    }

    pub(crate) fn driver_timeout_ms(&self) -> i64 {
        i64::try_from(self.driver_timeout.as_millis()).unwrap_or(i64::MAX)
    }

    pub(crate) fn keepalive_interval_ms(&self) -> i64 {
        i64::try_from(self.keepalive_interval.as_millis()).unwrap_or(i64::MAX)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Parse { key, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.driver_timeout_ms(), 10_000);
        assert_eq!(config.conductor_thread_name, "baton-conductor");
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            (DRIVER_TIMEOUT_ENV, "2500"),
            (KEEPALIVE_INTERVAL_ENV, " 100 "),
            (COMMAND_QUEUE_CAPACITY_ENV, "16"),
            (USE_CONDUCTOR_INVOKER_ENV, "true"),
        ]))
        .unwrap();

        assert_eq!(config.driver_timeout, Duration::from_millis(2_500));
        assert_eq!(config.keepalive_interval, Duration::from_millis(100));
        assert_eq!(config.command_queue_capacity, 16);
        assert!(config.use_conductor_invoker);
    }

    #[test]
    fn test_malformed_env_value_is_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[(COMMAND_QUEUE_CAPACITY_ENV, "lots")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                key: COMMAND_QUEUE_CAPACITY_ENV,
                value: "lots".to_owned()
            }
        );
    }

    #[test]
    fn test_validate_rejects_zero_and_inverted_intervals() {
        let zero = ClientConfig::default().with_command_queue_capacity(0);
        assert_eq!(
            zero.validate(),
            Err(ConfigError::Zero("command_queue_capacity"))
        );

        let inverted = ClientConfig::default()
            .with_driver_timeout(Duration::from_millis(100))
            .with_keepalive_interval(Duration::from_millis(100));
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::KeepaliveTooLong { .. })
        ));
    }
}
