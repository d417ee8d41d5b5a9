//! Configuration for [`SigningContextCache`](crate::SigningContextCache).

use std::time::Duration;

use keyward_signer::ConfigError;
use serde::{Deserialize, Serialize};

use crate::validity::ValidityPolicy;

/// Default time-to-live of a cached entry.
pub const DEFAULT_SIGNING_INFO_TTL: Duration = Duration::from_secs(300);

/// Default maximum number of cached signing contexts.
pub const DEFAULT_SIGNING_INFO_CAPACITY: u64 = 10_000;

/// Default interval between key-conf change checks.
pub const DEFAULT_CHANGE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Cache sizing, expiry and validity settings.
///
/// The TTL is applied to every entry regardless of its validity window; an
/// entry whose window closes earlier is refetched on the next lookup.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use keyward_keyconf::KeyConfCacheConfig;
///
/// let config = KeyConfCacheConfig::builder()
///     .signing_info_ttl(Duration::from_secs(60))
///     .signing_info_capacity(1_000)
///     .build()?;
/// assert_eq!(config.signing_info_capacity(), 1_000);
/// # Ok::<(), keyward_signer::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfCacheConfig {
    /// Time-to-live of signing contexts and the authentication key.
    #[serde(with = "humantime_serde", default = "default_signing_info_ttl")]
    pub(crate) signing_info_ttl: Duration,

    /// Maximum number of cached signing contexts.
    #[serde(default = "default_signing_info_capacity")]
    pub(crate) signing_info_capacity: u64,

    /// OCSP bounds on validity.
    #[serde(default)]
    pub(crate) validity: ValidityPolicy,

    /// How often the change watcher polls.
    #[serde(with = "humantime_serde", default = "default_change_poll_interval")]
    pub(crate) change_poll_interval: Duration,
}

fn default_signing_info_ttl() -> Duration {
    DEFAULT_SIGNING_INFO_TTL
}

fn default_signing_info_capacity() -> u64 {
    DEFAULT_SIGNING_INFO_CAPACITY
}

fn default_change_poll_interval() -> Duration {
    DEFAULT_CHANGE_POLL_INTERVAL
}

impl Default for KeyConfCacheConfig {
    fn default() -> Self {
        Self {
            signing_info_ttl: DEFAULT_SIGNING_INFO_TTL,
            signing_info_capacity: DEFAULT_SIGNING_INFO_CAPACITY,
            validity: ValidityPolicy::default(),
            change_poll_interval: DEFAULT_CHANGE_POLL_INTERVAL,
        }
    }
}

#[bon::bon]
impl KeyConfCacheConfig {
    /// Creates a validated cache configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a duration or the capacity is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_SIGNING_INFO_TTL)] signing_info_ttl: Duration,
        #[builder(default = DEFAULT_SIGNING_INFO_CAPACITY)] signing_info_capacity: u64,
        #[builder(default)] validity: ValidityPolicy,
        #[builder(default = DEFAULT_CHANGE_POLL_INTERVAL)] change_poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { signing_info_ttl, signing_info_capacity, validity, change_poll_interval };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_info_ttl.is_zero() {
            return Err(ConfigError::MustBePositive { field: "signing_info_ttl", value: "0s".into() });
        }
        if self.signing_info_capacity == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "signing_info_capacity",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.change_poll_interval.is_zero() {
            return Err(ConfigError::MustBePositive { field: "change_poll_interval", value: "0s".into() });
        }
        self.validity.validate()
    }

    /// Returns the entry time-to-live.
    #[must_use]
    pub fn signing_info_ttl(&self) -> Duration {
        self.signing_info_ttl
    }

    /// Returns the signing-context capacity.
    #[must_use]
    pub fn signing_info_capacity(&self) -> u64 {
        self.signing_info_capacity
    }

    /// Returns the OCSP validity policy.
    #[must_use]
    pub fn validity(&self) -> &ValidityPolicy {
        &self.validity
    }

    /// Returns the change watcher's poll interval.
    #[must_use]
    pub fn change_poll_interval(&self) -> Duration {
        self.change_poll_interval
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults() {
        let config: KeyConfCacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, KeyConfCacheConfig::default());
        assert_eq!(config.signing_info_ttl(), Duration::from_secs(300));
        assert_eq!(config.signing_info_capacity(), 10_000);
    }

    #[test]
    fn test_deserialize_nested_validity() {
        let config: KeyConfCacheConfig = serde_json::from_str(
            r#"{"signing_info_ttl":"2m","validity":{"ocsp_freshness":"30m"}}"#,
        )
        .unwrap();
        assert_eq!(config.signing_info_ttl(), Duration::from_secs(120));
        assert_eq!(config.validity().ocsp_freshness(), Duration::from_secs(1800));
        assert!(config.validity().enforce_next_update());
    }

    #[rstest]
    #[case::zero_ttl(Duration::ZERO, 10, Duration::from_secs(5))]
    #[case::zero_capacity(Duration::from_secs(1), 0, Duration::from_secs(5))]
    #[case::zero_poll(Duration::from_secs(1), 10, Duration::ZERO)]
    fn test_rejects(#[case] ttl: Duration, #[case] capacity: u64, #[case] poll: Duration) {
        let result = KeyConfCacheConfig::builder()
            .signing_info_ttl(ttl)
            .signing_info_capacity(capacity)
            .change_poll_interval(poll)
            .build();
        assert!(result.is_err());
    }
}
