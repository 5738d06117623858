//! Pool configuration options

use std::time::Duration;

use crate::errors::{PoolError, PoolResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default time-to-live for a pooled service
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(10 * 60);

/// Lower bound for the monitor tick period
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for service pool behavior
///
/// # Examples
///
/// ```
/// use esox_servicepool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_ttl(Duration::from_secs(30))
///     .with_refresh_interval(Duration::from_secs(5));
///
/// assert_eq!(config.time_to_live, Duration::from_secs(30));
/// assert_eq!(config.refresh_interval, Some(Duration::from_secs(5)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolConfiguration {
    /// Base duration used to compute and slide an entry's deadline
    pub time_to_live: Duration,

    /// Tick period of each entry's monitor; `None` means half the TTL
    #[cfg_attr(feature = "serde", serde(default))]
    pub refresh_interval: Option<Duration>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            time_to_live: DEFAULT_TIME_TO_LIVE,
            refresh_interval: None,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time-to-live for pooled services
    ///
    /// A zero duration is ignored and the previous value is kept.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_servicepool::PoolConfiguration;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfiguration::new()
    ///     .with_ttl(Duration::from_secs(10))
    ///     .with_ttl(Duration::ZERO);
    ///
    /// assert_eq!(config.time_to_live, Duration::from_secs(10));
    /// ```
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.time_to_live = ttl;
        }
        self
    }

    /// Set the monitor tick period
    ///
    /// A zero duration is ignored.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.refresh_interval = Some(interval);
        }
        self
    }

    /// Check the configuration for values the monitors cannot work with
    pub fn validate(&self) -> PoolResult<()> {
        if self.time_to_live.is_zero() {
            return Err(PoolError::InvalidConfiguration(
                "time_to_live must be greater than zero".to_string(),
            ));
        }
        if let Some(interval) = self.refresh_interval {
            if interval.is_zero() {
                return Err(PoolError::InvalidConfiguration(
                    "refresh_interval must be greater than zero".to_string(),
                ));
            }
            if interval > self.time_to_live {
                return Err(PoolError::InvalidConfiguration(format!(
                    "refresh_interval ({:?}) must not exceed time_to_live ({:?})",
                    interval, self.time_to_live
                )));
            }
        }
        Ok(())
    }

    /// Settings captured by an entry created with the pool defaults
    pub fn entry_config(&self) -> EntryConfig {
        match self.refresh_interval {
            Some(interval) => EntryConfig::with_interval(self.time_to_live, interval),
            None => EntryConfig::from_ttl(self.time_to_live),
        }
    }

    /// Settings for an entry created with a per-call TTL override
    ///
    /// The override's cadence is always derived from the override itself,
    /// so a pool-level refresh interval cannot outlast a shorter TTL.
    pub fn entry_config_with_ttl(&self, ttl: Duration) -> EntryConfig {
        if ttl.is_zero() {
            self.entry_config()
        } else {
            EntryConfig::from_ttl(ttl)
        }
    }
}

/// TTL and tick cadence captured by one entry at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryConfig {
    pub time_to_live: Duration,
    pub refresh_interval: Duration,
}

impl EntryConfig {
    /// Cadence of half the TTL
    pub fn from_ttl(ttl: Duration) -> Self {
        Self::with_interval(ttl, ttl / 2)
    }

    pub fn with_interval(ttl: Duration, interval: Duration) -> Self {
        Self {
            time_to_live: ttl,
            refresh_interval: interval.max(MIN_REFRESH_INTERVAL),
        }
    }
}
