//! Pool configuration.

use std::time::Duration;

use kv_connection::config::parse_seconds;
use url::Url;

use crate::error::PoolError;
use crate::lifecycle::ProcessIdSource;

/// Configuration for the connection pool.
///
/// Every limit is optional. By default the pool is unbounded, acquisitions
/// wait without a deadline and idle connections are never reaped.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections, free and checked out (unbounded if unset).
    pub max_connections: Option<u32>,

    /// Time to wait for a connection before timing out (unbounded if unset).
    pub timeout: Option<Duration>,

    /// Time a free connection may sit unused before it is evicted.
    ///
    /// Idle reaping runs only when this and `idle_check_interval` are both set.
    pub max_idle_time: Option<Duration>,

    /// Interval between idle reaper cycles.
    pub idle_check_interval: Option<Duration>,

    /// Source of the current process identifier, used for fork detection.
    pub process_id: ProcessIdSource,
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = Some(count);
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the maximum idle time of a free connection.
    #[must_use]
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = Some(idle);
        self
    }

    /// Set the interval between idle reaper cycles.
    #[must_use]
    pub fn idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = Some(interval);
        self
    }

    /// Set the source of the current process identifier.
    #[must_use]
    pub fn process_id(mut self, source: ProcessIdSource) -> Self {
        self.process_id = source;
        self
    }

    /// The `(max_idle_time, idle_check_interval)` pair, when idle reaping is
    /// enabled.
    #[must_use]
    pub fn idle_reaping(&self) -> Option<(Duration, Duration)> {
        self.max_idle_time.zip(self.idle_check_interval)
    }

    /// Read pool options from a URL query string.
    ///
    /// Recognized keys are `max_connections`, `timeout`, `max_idle_time` and
    /// `idle_check_interval` (durations in seconds, decimals allowed). Other
    /// keys are left to the connection parameters.
    pub fn from_url(url: &str) -> Result<Self, PoolError> {
        let url = Url::parse(url)
            .map_err(|e| PoolError::Configuration(format!("invalid URL {url}: {e}")))?;
        let mut config = Self::default();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "max_connections" => {
                    let count: i64 = value.parse().map_err(|_| {
                        PoolError::Configuration(format!("invalid max_connections: {value}"))
                    })?;
                    let count = u32::try_from(count).map_err(|_| {
                        PoolError::Configuration(format!(
                            "max_connections must be a positive integer, got {count}"
                        ))
                    })?;
                    config.max_connections = Some(count);
                }
                "timeout" => config.timeout = Some(seconds(&key, &value)?),
                "max_idle_time" => config.max_idle_time = Some(seconds(&key, &value)?),
                "idle_check_interval" => {
                    config.idle_check_interval = Some(seconds(&key, &value)?);
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == Some(0) {
            return Err(PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.idle_check_interval == Some(Duration::ZERO) {
            return Err(PoolError::Configuration(
                "idle_check_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn seconds(key: &str, value: &str) -> Result<Duration, PoolError> {
    parse_seconds(key, value).map_err(|err| PoolError::Configuration(err.to_string()))
}
