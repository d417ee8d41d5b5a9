//! # Keyward Key-Conf
//!
//! Cached, validity-bounded signing contexts for the message signing path.
//!
//! This crate provides:
//! - **Signing contexts**: [`SigningContextCache`] resolves a member's signing key once and reuses
//!   it until either the TTL or its validity window ends
//! - **Single-flight fetching**: concurrent misses for the same key share one remote call
//! - **Validity windows**: [`compute_not_after`] bounds a certificate by its OCSP freshness
//! - **Change-driven invalidation**: [`spawn_change_watcher`] drops every cached context when the
//!   signer's key configuration changes
//!
//! ## Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use keyward_keyconf::{
//!     ClientId, FileChecksumDetector, KeyInfoSource, ServerId, SigningContextCache,
//!     spawn_change_watcher,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(source: Arc<dyn KeyInfoSource>) -> keyward_keyconf::KeyConfResult<()> {
//! let cache = Arc::new(
//!     SigningContextCache::builder()
//!         .source(source)
//!         .identity(Arc::new(ServerId::new("EE/COM/1234/ss1")))
//!         .build(),
//! );
//!
//! let detector = FileChecksumDetector::new("/etc/keyward/signer/keyconf.json").await;
//! let interval = cache.config().change_poll_interval();
//! spawn_change_watcher(&cache, Arc::new(detector), interval, CancellationToken::new());
//!
//! let context = cache.get_signing_context(&ClientId::new("EE/GOV/70000001")).await?;
//! let auth_key = cache.get_auth_key().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Signing-context cache.
pub mod cache;
/// Validity time source.
pub mod clock;
/// Cache configuration.
pub mod config;
/// Key-conf error types.
pub mod error;
/// Cached signing and authentication information.
pub mod info;
/// Remote key information source.
pub mod source;
/// Identity newtypes.
pub mod types;
/// Validity window calculation.
pub mod validity;
/// Key-conf change detection.
pub mod watch;

/// Shared test utilities, available with the `testutil` feature.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export key types for convenience
pub use cache::SigningContextCache;
pub use clock::{Clock, SystemClock};
pub use config::KeyConfCacheConfig;
pub use error::{KeyConfError, KeyConfResult, SourceError};
pub use info::{AuthKeyInfo, SigningContext, SigningInfo};
pub use source::{AuthKeyMaterial, CertificateInfo, KeyInfoSource, MemberSigningInfo, ServerIdentityProvider};
pub use types::{ClientId, ServerId};
pub use validity::{ValidityPolicy, compute_not_after};
pub use watch::{ChangeDetector, FileChecksumDetector, spawn_change_watcher};
