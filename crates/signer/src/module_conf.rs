//! Module configuration sources.
//!
//! The manager polls a [`ModuleConfSource`] on every refresh tick and only
//! reloads when the source reports a change.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    descriptor::{ModuleDescriptor, ModuleKind},
    error::{SignerError, SignerResult},
};

/// Pollable provider of module descriptors.
#[async_trait]
pub trait ModuleConfSource: Send + Sync + 'static {
    /// Returns `true` if the configuration changed since the last reload.
    ///
    /// Sources that cannot tell report `true`.
    async fn has_changed(&self) -> bool;

    /// Returns the current module descriptors.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or is invalid.
    async fn reload(&self) -> SignerResult<Vec<ModuleDescriptor>>;
}

/// In-process module configuration.
#[derive(Debug)]
pub struct MemoryModuleConfSource {
    state: Mutex<MemoryState>,
    reloads: AtomicU32,
}

#[derive(Debug)]
struct MemoryState {
    descriptors: Vec<ModuleDescriptor>,
    changed: bool,
}

impl MemoryModuleConfSource {
    /// Creates a source holding `descriptors`, reported as changed.
    #[must_use]
    pub fn new(descriptors: Vec<ModuleDescriptor>) -> Self {
        Self { state: Mutex::new(MemoryState { descriptors, changed: true }), reloads: AtomicU32::new(0) }
    }

    /// Replaces the descriptors and marks the source as changed.
    pub fn set(&self, descriptors: Vec<ModuleDescriptor>) {
        let mut state = self.state.lock();
        state.descriptors = descriptors;
        state.changed = true;
    }

    /// Returns how many times [`reload`](ModuleConfSource::reload) ran.
    #[must_use]
    pub fn reload_count(&self) -> u32 {
        self.reloads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModuleConfSource for MemoryModuleConfSource {
    async fn has_changed(&self) -> bool {
        self.state.lock().changed
    }

    async fn reload(&self) -> SignerResult<Vec<ModuleDescriptor>> {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.changed = false;
        Ok(state.descriptors.clone())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleConfDocument {
    #[serde(default)]
    modules: Vec<ModuleDescriptor>,
}

/// Module configuration kept in a JSON document.
///
/// Change detection compares a SHA-256 checksum of the file content with
/// the checksum seen at the last reload. A file that cannot be read counts
/// as changed so the following reload reports the error.
#[derive(Debug)]
pub struct JsonModuleConfSource {
    path: PathBuf,
    loaded_checksum: Mutex<Option<[u8; 32]>>,
}

impl JsonModuleConfSource {
    /// Creates a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), loaded_checksum: Mutex::new(None) }
    }

    async fn read(&self) -> SignerResult<Vec<u8>> {
        tokio::fs::read(&self.path).await.map_err(|err| {
            SignerError::token_conf_with_source(format!("reading {}", self.path.display()), err)
        })
    }
}

#[async_trait]
impl ModuleConfSource for JsonModuleConfSource {
    async fn has_changed(&self) -> bool {
        match self.read().await {
            Ok(bytes) => {
                let checksum: [u8; 32] = Sha256::digest(&bytes).into();
                *self.loaded_checksum.lock() != Some(checksum)
            },
            Err(err) => {
                tracing::warn!(error = %err, "module configuration unreadable, treating as changed");
                true
            },
        }
    }

    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    async fn reload(&self) -> SignerResult<Vec<ModuleDescriptor>> {
        let bytes = self.read().await?;
        let document: ModuleConfDocument = serde_json::from_slice(&bytes).map_err(|err| {
            SignerError::serialization_with_source(format!("parsing {}", self.path.display()), err)
        })?;

        for descriptor in &document.modules {
            if let ModuleKind::Hardware(conf) = descriptor.kind() {
                conf.backoff.validate()?;
            }
        }

        *self.loaded_checksum.lock() = Some(Sha256::digest(&bytes).into());
        tracing::info!(modules = document.modules.len(), "module configuration loaded");
        Ok(document.modules)
    }
}
