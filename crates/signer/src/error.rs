//! Signer error types and result alias.
//!
//! Driver and I/O failures are reclassified at the module worker boundary
//! into the variants below. [`SignerError::is_transient`] decides what the
//! backoff loop may retry; everything else is returned immediately.
//!
//! # Error Classes
//!
//! - **Transient**: [`SignerError::ModuleInit`], [`SignerError::NoSlots`],
//!   [`SignerError::Timeout`], [`SignerError::Driver`]
//! - **Fatal**: [`SignerError::Fatal`], produced by the manager when a hardware module exhausts
//!   its retry budget
//! - **Everything else**: storage, serialization and configuration failures
//!
//! # Example
//!
//! ```
//! use keyward_signer::{SignerError, SignerResult};
//!
//! fn open(module: &str) -> SignerResult<()> {
//!     Err(SignerError::module_init(module, "C_Initialize returned CKR_GENERAL_ERROR"))
//! }
//!
//! assert!(open("hsm").unwrap_err().is_transient());
//! ```

use std::{sync::Arc, time::Duration};

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for signer operations.
pub type SignerResult<T> = Result<T, SignerError>;

/// Errors raised by module workers, the module manager and token-conf storage.
///
/// Errors preserve their source chain via `#[source]`.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SignerError {
    /// The module driver could not be opened (library load or initialize call).
    #[error("Module '{module}' failed to initialize: {message}")]
    ModuleInit {
        /// Module type identifier.
        module: String,
        /// Description of the failure.
        message: String,
        /// Underlying driver error.
        #[source]
        source: Option<BoxError>,
    },

    /// The driver reported no slots although slots were known before.
    ///
    /// A silently empty slot list is indistinguishable from "no tokens
    /// configured", so it is surfaced as a transient fault instead.
    #[error("Module '{module}' reported no slots (previously {previously_known})")]
    NoSlots {
        /// Module type identifier.
        module: String,
        /// Number of slots seen on the last successful enumeration.
        previously_known: usize,
    },

    /// A hardware driver call did not return within the configured timeout.
    #[error("Module '{module}' {operation} timed out after {elapsed:?}")]
    Timeout {
        /// Module type identifier.
        module: String,
        /// Driver operation that timed out.
        operation: &'static str,
        /// Configured timeout.
        elapsed: Duration,
    },

    /// Hardware fault reported while enumerating slots or reading token info.
    #[error("Module '{module}' driver error: {message}")]
    Driver {
        /// Module type identifier.
        module: String,
        /// Description of the failure.
        message: String,
        /// Underlying driver error.
        #[source]
        source: Option<BoxError>,
    },

    /// Persisted token configuration could not be read or written.
    #[error("Token configuration error: {message}")]
    TokenConf {
        /// Description of the failure.
        message: String,
        /// Underlying I/O error.
        #[source]
        source: Option<BoxError>,
    },

    /// Token configuration could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
        /// Underlying codec error.
        #[source]
        source: Option<BoxError>,
    },

    /// The backoff budget was spent without a successful attempt.
    #[error("Module '{module}' gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Module type identifier.
        module: String,
        /// Total attempts made, including the first.
        attempts: u32,
        /// The error returned by the final attempt.
        #[source]
        last: Box<SignerError>,
    },

    /// A worker's command channel closed before it answered.
    #[error("Worker for module '{module}' is not running")]
    WorkerStopped {
        /// Module type identifier.
        module: String,
    },

    /// A hardware module could not be recovered; the process must exit.
    #[error("Module '{module}' is inoperable, exiting with code {exit_code}")]
    Fatal {
        /// Module type identifier.
        module: String,
        /// Exit code handed to the fatal handler.
        exit_code: i32,
    },

    /// Invalid configuration value.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SignerError {
    /// Creates a new `ModuleInit` error.
    #[must_use]
    pub fn module_init(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModuleInit { module: module.into(), message: message.into(), source: None }
    }

    /// Creates a new `ModuleInit` error with a source error.
    #[must_use]
    pub fn module_init_with_source(
        module: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ModuleInit {
            module: module.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a new `NoSlots` error.
    #[must_use]
    pub fn no_slots(module: impl Into<String>, previously_known: usize) -> Self {
        Self::NoSlots { module: module.into(), previously_known }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(module: impl Into<String>, operation: &'static str, elapsed: Duration) -> Self {
        Self::Timeout { module: module.into(), operation, elapsed }
    }

    /// Creates a new `Driver` error with a source error.
    #[must_use]
    pub fn driver_with_source(
        module: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Driver { module: module.into(), message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `TokenConf` error.
    #[must_use]
    pub fn token_conf(message: impl Into<String>) -> Self {
        Self::TokenConf { message: message.into(), source: None }
    }

    /// Creates a new `TokenConf` error with a source error.
    #[must_use]
    pub fn token_conf_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TokenConf { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with a source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `WorkerStopped` error.
    #[must_use]
    pub fn worker_stopped(module: impl Into<String>) -> Self {
        Self::WorkerStopped { module: module.into() }
    }

    /// Returns `true` if the error may clear up on a later attempt.
    ///
    /// Initialization failures, missing slots, driver timeouts and driver
    /// faults are retried under the module's backoff policy.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ModuleInit { .. } | Self::NoSlots { .. } | Self::Timeout { .. } | Self::Driver { .. }
        )
    }
}

/// Configuration validation errors.
///
/// Returned by the validated builders in [`config`](crate::config).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Offending field.
        field: &'static str,
        /// Smallest allowed value.
        min: String,
        /// Supplied value.
        value: String,
    },

    /// A duration field must be greater than zero.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Offending field.
        field: &'static str,
        /// Supplied value.
        value: String,
    },

    /// Two related fields are inconsistent.
    #[error("{field} is out of range: {reason}")]
    InvalidRange {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A required string field is empty.
    #[error("{field} cannot be empty")]
    Empty {
        /// Offending field.
        field: &'static str,
    },
}
