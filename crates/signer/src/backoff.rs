//! Retry with exponential backoff for module driver operations.
//!
//! [`with_backoff`] wraps an async operation and retries it while it fails
//! with a transient [`SignerError`]. Non-transient errors are returned
//! immediately. When the budget is spent the last error is wrapped in
//! [`SignerError::RetriesExhausted`], which the module manager treats as the
//! escalation signal.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each retry: `min_delay * 2^retry`
//! - Random jitter of 0–50% of the base is added
//! - The result never exceeds `max_delay`

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;

use crate::{
    config::BackoffPolicy,
    error::{SignerError, SignerResult},
};

/// Executes `operation` with retry on transient errors.
///
/// The operation runs at most `policy.max_retries() + 1` times.
///
/// # Errors
///
/// Returns the first non-transient error unchanged, or
/// [`SignerError::RetriesExhausted`] carrying the last transient error once
/// every attempt has failed.
#[tracing::instrument(skip(policy, operation), fields(max_retries = policy.max_retries()))]
pub(crate) async fn with_backoff<F, Fut, T>(
    policy: &BackoffPolicy,
    module: &str,
    operation_name: &str,
    mut operation: F,
) -> SignerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SignerResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        module,
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < policy.max_retries() => {
                let delay = compute_delay(policy, attempt);
                tracing::warn!(
                    module,
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries() + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient module error, retrying after backoff",
                );
                fail_point!("backoff-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) if err.is_transient() => {
                tracing::error!(
                    module,
                    operation = operation_name,
                    attempts = attempt + 1,
                    error = %err,
                    "retry budget exhausted",
                );
                return Err(SignerError::RetriesExhausted {
                    module: module.to_owned(),
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            },
            Err(err) => return Err(err),
        }
    }
}

/// Computes the delay before retry number `attempt` (zero-based).
///
/// `min(min_delay * 2^attempt + jitter, max_delay)` where jitter is up to
/// half of the exponential base.
pub(crate) fn compute_delay(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let base = policy.min_delay().saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(policy.max_delay());

    let jitter_range = capped.as_millis() as u64 / 2;
    let jittered = if jitter_range > 0 {
        capped + Duration::from_millis(rand::rng().random_range(0..=jitter_range))
    } else {
        capped
    };
    jittered.min(policy.max_delay())
}
