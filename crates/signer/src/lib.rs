//! # Keyward Signer
//!
//! Supervision of signing modules and reconciliation of their tokens.
//!
//! This crate provides:
//! - **Module supervision**: one worker task per configured module, restarted or escalated by the
//!   [`ModuleManager`]
//! - **Driver abstraction**: hardware modules behind a blocking [`HardwareModuleDriver`], software
//!   tokens behind [`SoftwareDriver`]
//! - **Token reconciliation**: [`MergeOntoFileTokens`] folds live token state onto the persisted
//!   token configuration
//! - **Bounded retries**: exponential backoff with jitter per hardware module
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────┐
//! ModuleConfSource ─►│  ModuleManager   │──► TokenConfStore::save
//!                    └────────┬─────────┘
//!                  spawn / stop / refresh (JoinSet)
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!       ModuleWorker    ModuleWorker    ModuleWorker
//!        (softToken)       (hsm-a)         (hsm-b)
//!              │              │              │
//!        TokenWorker    TokenWorker ... one per available token
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyward_signer::{
//!     FileTokenConfStore, MemoryModuleConfSource, ModuleDescriptor, ModuleManager,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> keyward_signer::SignerResult<()> {
//! let manager = ModuleManager::builder()
//!     .conf_source(Arc::new(MemoryModuleConfSource::new(vec![ModuleDescriptor::software()])))
//!     .token_conf(Arc::new(FileTokenConfStore::new("/var/lib/keyward/keyconf.json")))
//!     .build();
//!
//! let shutdown = CancellationToken::new();
//! manager.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
/// Manager and backoff configuration.
pub mod config;
/// Module descriptors.
pub mod descriptor;
/// Module driver capability and implementations.
pub mod driver;
/// Signer error types.
pub mod error;
/// Module manager.
pub mod manager;
/// Token reconciliation.
pub mod merge;
/// Token, key and certificate model.
pub mod model;
/// Module configuration sources.
pub mod module_conf;
/// Persisted token configuration.
pub mod token_conf;
/// Per-token worker.
pub mod token_worker;
/// Per-module worker.
pub mod worker;

/// Shared test utilities, available with the `testutil` feature.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export key types for convenience
pub use config::{BackoffPolicy, FATAL_EXIT_CODE, ModuleManagerConfig};
pub use descriptor::{HardwareModuleConf, ModuleDescriptor, ModuleKind, SOFTWARE_MODULE_TYPE};
pub use driver::{
    HardwareDriver, HardwareDriverFactory, HardwareModuleDriver, ModuleDriver, PIN_PER_SIGNING_INFO,
    SOFTWARE_TOKEN_ID, SoftwareDriver,
};
pub use error::{BoxError, ConfigError, SignerError, SignerResult};
pub use manager::{FatalHandler, ModuleManager, ProcessExit};
pub use merge::{MergeOntoFileTokens, MergeResult, TokenMergeStrategy};
pub use model::{Cert, CertRequest, CertStatus, Key, KeyUsage, OcspResponse, Token, TokenStatus};
pub use module_conf::{JsonModuleConfSource, MemoryModuleConfSource, ModuleConfSource};
pub use token_conf::{FileTokenConfStore, MemoryTokenConfStore, TokenConfStore};
pub use worker::{MergeListener, ModuleWorker, ModuleWorkerHandle, WorkerContext};
