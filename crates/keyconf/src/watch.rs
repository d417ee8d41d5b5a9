//! Key-conf change detection.
//!
//! The signer rewrites its token configuration whenever keys or certificates
//! change. [`spawn_change_watcher`] polls a [`ChangeDetector`] and drops every
//! cached signing context when the configuration changed.

use std::{
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::SigningContextCache;

/// Reports whether the key configuration changed since the last check.
#[async_trait]
pub trait ChangeDetector: Send + Sync + 'static {
    /// Returns `true` once per observed change.
    async fn has_changed(&self) -> bool;
}

/// Detects changes by hashing a file's content with SHA-256.
///
/// A missing file has no checksum, so creating or deleting it counts as a
/// change too.
pub struct FileChecksumDetector {
    path: PathBuf,
    last_checksum: Mutex<Option<[u8; 32]>>,
}

impl FileChecksumDetector {
    /// Creates a detector using the file's current content as the baseline.
    pub async fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let baseline = checksum(&path).await;
        Self { path, last_checksum: Mutex::new(baseline) }
    }
}

async fn checksum(path: &std::path::Path) -> Option<[u8; 32]> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(Sha256::digest(&bytes).into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read key configuration");
            None
        },
    }
}

#[async_trait]
impl ChangeDetector for FileChecksumDetector {
    async fn has_changed(&self) -> bool {
        let current = checksum(&self.path).await;
        let mut last = self.last_checksum.lock();
        if *last == current {
            return false;
        }
        tracing::debug!(
            path = %self.path.display(),
            checksum = %current.map(hex::encode).unwrap_or_default(),
            "key configuration changed"
        );
        *last = current;
        true
    }
}

/// Polls `detector` every `interval` and invalidates `cache` on change.
///
/// The task holds only a weak reference: it ends when the cache is dropped
/// or `cancel` fires.
pub fn spawn_change_watcher(
    cache: &Arc<SigningContextCache>,
    detector: Arc<dyn ChangeDetector>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let cache: Weak<SigningContextCache> = Arc::downgrade(cache);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; consume it so we start
        // with a full interval wait.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("key-conf change watcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(cache) = cache.upgrade() else {
                        tracing::debug!("cache dropped, stopping key-conf change watcher");
                        break;
                    };
                    if detector.has_changed().await {
                        cache.invalidate_all().await;
                    }
                }
            }
        }
    })
}
