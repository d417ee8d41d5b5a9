//! Validity windows for signing contexts.
//!
//! A signing context may be used until the earliest of the certificate's own
//! expiry, the end of the OCSP freshness period and, when enforced, the OCSP
//! response's declared `next_update`.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use keyward_signer::{ConfigError, OcspResponse};
use serde::{Deserialize, Serialize};

/// Default period an OCSP response is considered fresh after `this_update`.
pub const DEFAULT_OCSP_FRESHNESS: Duration = Duration::from_secs(3600);

/// How OCSP responses bound a signing context's validity.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use keyward_keyconf::ValidityPolicy;
///
/// let policy = ValidityPolicy::builder()
///     .ocsp_freshness(Duration::from_secs(600))
///     .enforce_next_update(false)
///     .build()?;
/// assert!(!policy.enforce_next_update());
/// # Ok::<(), keyward_signer::ConfigError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidityPolicy {
    #[serde(with = "humantime_serde", default = "default_ocsp_freshness")]
    pub(crate) ocsp_freshness: Duration,

    #[serde(default = "default_enforce_next_update")]
    pub(crate) enforce_next_update: bool,
}

fn default_ocsp_freshness() -> Duration {
    DEFAULT_OCSP_FRESHNESS
}

fn default_enforce_next_update() -> bool {
    true
}

impl Default for ValidityPolicy {
    fn default() -> Self {
        Self { ocsp_freshness: DEFAULT_OCSP_FRESHNESS, enforce_next_update: true }
    }
}

#[bon::bon]
impl ValidityPolicy {
    /// Creates a validated policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] if `ocsp_freshness` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_OCSP_FRESHNESS)] ocsp_freshness: Duration,
        #[builder(default = true)] enforce_next_update: bool,
    ) -> Result<Self, ConfigError> {
        let policy = Self { ocsp_freshness, enforce_next_update };
        policy.validate()?;
        Ok(policy)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] if `ocsp_freshness` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ocsp_freshness.is_zero() {
            return Err(ConfigError::MustBePositive { field: "ocsp_freshness", value: "0s".into() });
        }
        Ok(())
    }

    /// Returns how long an OCSP response stays fresh.
    #[must_use]
    pub fn ocsp_freshness(&self) -> Duration {
        self.ocsp_freshness
    }

    /// Returns whether `next_update` also bounds validity.
    #[must_use]
    pub fn enforce_next_update(&self) -> bool {
        self.enforce_next_update
    }

    /// Applies this policy to [`compute_not_after`].
    #[must_use]
    pub fn not_after(&self, ocsp_responses: &[OcspResponse], cert_not_after: DateTime<Utc>) -> DateTime<Utc> {
        compute_not_after(ocsp_responses, cert_not_after, self.ocsp_freshness, self.enforce_next_update)
    }
}

/// Returns the tightest end of validity for one certificate.
///
/// Starts from `cert_not_after` and lowers it to `this_update + ocsp_freshness`
/// of every response, and to `next_update` when `enforce_next_update` is set.
/// The result is never later than `cert_not_after`.
///
/// All responses are expected to concern the same certificate.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use bytes::Bytes;
/// use chrono::{TimeDelta, Utc};
/// use keyward_keyconf::compute_not_after;
/// use keyward_signer::OcspResponse;
///
/// let now = Utc::now();
/// let response = OcspResponse { der: Bytes::new(), this_update: now, next_update: None };
/// let cert_not_after = now + TimeDelta::days(365);
///
/// let not_after = compute_not_after(&[response], cert_not_after, Duration::from_secs(3600), true);
/// assert_eq!(not_after, now + TimeDelta::hours(1));
/// ```
#[must_use]
pub fn compute_not_after(
    ocsp_responses: &[OcspResponse],
    cert_not_after: DateTime<Utc>,
    ocsp_freshness: Duration,
    enforce_next_update: bool,
) -> DateTime<Utc> {
    // An unrepresentable freshness period never lowers the bound.
    let freshness = TimeDelta::from_std(ocsp_freshness).ok();

    let mut not_after = cert_not_after;
    for response in ocsp_responses {
        if let Some(fresh_until) = freshness.and_then(|f| response.this_update.checked_add_signed(f))
            && fresh_until < not_after
        {
            not_after = fresh_until;
        }
        if enforce_next_update
            && let Some(next_update) = response.next_update
            && next_update < not_after
        {
            not_after = next_update;
        }
    }
    not_after
}
