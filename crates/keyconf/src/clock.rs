//! Time source for validity checks.

use chrono::{DateTime, Utc};

/// Supplies the current time to validity checks.
///
/// Cache TTLs run on the cache's own clock; only signing-context validity is
/// evaluated against this one.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
