//! Key-conf error types and result alias.
//!
//! [`SourceError`] describes what went wrong talking to the remote
//! [`KeyInfoSource`](crate::KeyInfoSource). [`KeyConfError`] is what callers of
//! the [`SigningContextCache`](crate::SigningContextCache) see.
//!
//! Errors are `Clone` because a single fetch result is handed to every caller
//! waiting on it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use keyward_signer::BoxError;
use thiserror::Error;

use crate::types::ClientId;

/// Result type alias for key-conf operations.
pub type KeyConfResult<T> = Result<T, KeyConfError>;

/// Failures reported by a [`KeyInfoSource`](crate::KeyInfoSource).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The signer could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
        /// Underlying transport error.
        #[source]
        source: Option<BoxError>,
    },

    /// The signer did not answer in time.
    #[error("Signer request timed out")]
    Timeout,

    /// The signer has no key for the requested identity.
    #[error("No key found for '{identity}'")]
    NotFound {
        /// Client or server identity that was looked up.
        identity: String,
    },

    /// The signer answered with an error or malformed data.
    #[error("Signer error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl SourceError {
    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(identity: impl Into<String>) -> Self {
        Self::NotFound { identity: identity.into() }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Returns `true` for connection problems and timeouts.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}

/// Errors returned by [`SigningContextCache`](crate::SigningContextCache).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum KeyConfError {
    /// Fetching key information from the signer failed.
    #[error("Failed to fetch key information: {0}")]
    Source(#[from] SourceError),

    /// Freshly fetched signing information is already outside its validity window.
    #[error("Signing information for '{client_id}' is not valid (expired at {not_after})")]
    SigningInfoExpired {
        /// Client the information was fetched for.
        client_id: ClientId,
        /// End of the computed validity window.
        not_after: DateTime<Utc>,
    },

    /// The fetch task ended without producing a result.
    #[error("Fetch for '{identity}' ended without a result")]
    FetchAborted {
        /// Identity being fetched.
        identity: String,
    },

    /// The caller stopped waiting for a fetch.
    #[error("Signing context for '{client_id}' not available within {elapsed:?}")]
    Timeout {
        /// Client being resolved.
        client_id: ClientId,
        /// Caller-supplied timeout.
        elapsed: Duration,
    },
}

impl KeyConfError {
    /// Returns `true` if retrying the lookup may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Source(source) => source.is_transient(),
            Self::FetchAborted { .. } | Self::Timeout { .. } => true,
            Self::SigningInfoExpired { .. } => false,
        }
    }
}
