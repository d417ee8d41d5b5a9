//! Configuration for module supervision.
//!
//! [`BackoffPolicy`] bounds how long a module worker keeps retrying a broken
//! driver before the failure is escalated. [`ModuleManagerConfig`] sets the
//! refresh cadence, the hardware call timeout and the fatal exit code.
//!
//! Both types deserialize with `humantime` durations (`"30s"`, `"1m"`) and
//! offer validated `bon` builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for a single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default interval between configuration refresh ticks.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Default timeout for a single hardware driver call.
pub const DEFAULT_DRIVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code used when a hardware module becomes inoperable.
pub const FATAL_EXIT_CODE: i32 = 71;

/// Retry budget for a module worker.
///
/// A failing attempt is retried at most `max_retries` times. The delay before
/// retry `n` (zero-based) is `min_delay * 2^n` plus up to 50% jitter, never
/// more than `max_delay`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use keyward_signer::BackoffPolicy;
///
/// let policy = BackoffPolicy::builder()
///     .max_retries(2)
///     .min_delay(Duration::from_millis(500))
///     .max_delay(Duration::from_secs(5))
///     .build()?;
/// assert_eq!(policy.max_retries(), 2);
/// # Ok::<(), keyward_signer::ConfigError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffPolicy {
    #[serde(default = "default_max_retries")]
    pub(crate) max_retries: u32,

    #[serde(with = "humantime_serde", default = "default_min_delay")]
    pub(crate) min_delay: Duration,

    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub(crate) max_delay: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_min_delay() -> Duration {
    DEFAULT_MIN_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES, min_delay: DEFAULT_MIN_DELAY, max_delay: DEFAULT_MAX_DELAY }
    }
}

#[bon::bon]
impl BackoffPolicy {
    /// Creates a validated backoff policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `min_delay` is zero or `max_delay` is
    /// shorter than `min_delay`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_MIN_DELAY)] min_delay: Duration,
        #[builder(default = DEFAULT_MAX_DELAY)] max_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let policy = Self { max_retries, min_delay, max_delay };
        policy.validate()?;
        Ok(policy)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// Deserialized policies bypass the builder, so loaders call this
    /// explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay.is_zero() {
            return Err(ConfigError::MustBePositive { field: "min_delay", value: "0s".into() });
        }
        if self.max_delay < self.min_delay {
            return Err(ConfigError::InvalidRange {
                field: "max_delay",
                reason: format!(
                    "{:?} is shorter than min_delay {:?}",
                    self.max_delay, self.min_delay
                ),
            });
        }
        Ok(())
    }

    /// Returns the number of retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the delay before the first retry.
    #[must_use]
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Returns the upper bound for any retry delay.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

/// Settings for [`ModuleManager`](crate::ModuleManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleManagerConfig {
    /// How often module configuration is polled and workers are refreshed.
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    pub(crate) refresh_interval: Duration,

    /// Timeout applied to each blocking hardware driver call.
    #[serde(with = "humantime_serde", default = "default_driver_timeout")]
    pub(crate) driver_timeout: Duration,

    /// Exit code passed to the fatal handler.
    #[serde(default = "default_fatal_exit_code")]
    pub(crate) fatal_exit_code: i32,
}

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

fn default_driver_timeout() -> Duration {
    DEFAULT_DRIVER_TIMEOUT
}

fn default_fatal_exit_code() -> i32 {
    FATAL_EXIT_CODE
}

impl Default for ModuleManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            driver_timeout: DEFAULT_DRIVER_TIMEOUT,
            fatal_exit_code: FATAL_EXIT_CODE,
        }
    }
}

#[bon::bon]
impl ModuleManagerConfig {
    /// Creates a validated manager configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an interval is zero or the exit code is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_REFRESH_INTERVAL)] refresh_interval: Duration,
        #[builder(default = DEFAULT_DRIVER_TIMEOUT)] driver_timeout: Duration,
        #[builder(default = FATAL_EXIT_CODE)] fatal_exit_code: i32,
    ) -> Result<Self, ConfigError> {
        let config = Self { refresh_interval, driver_timeout, fatal_exit_code };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::MustBePositive { field: "refresh_interval", value: "0s".into() });
        }
        if self.driver_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "driver_timeout", value: "0s".into() });
        }
        if self.fatal_exit_code == 0 {
            return Err(ConfigError::InvalidRange {
                field: "fatal_exit_code",
                reason: "0 signals success to the process supervisor".into(),
            });
        }
        Ok(())
    }

    /// Returns the refresh tick interval.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Returns the per-call hardware driver timeout.
    #[must_use]
    pub fn driver_timeout(&self) -> Duration {
        self.driver_timeout
    }

    /// Returns the exit code used on fatal escalation.
    #[must_use]
    pub fn fatal_exit_code(&self) -> i32 {
        self.fatal_exit_code
    }
}
