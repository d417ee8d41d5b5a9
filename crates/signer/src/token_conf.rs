//! Durable token configuration.
//!
//! The token configuration is read wholesale at the start of every
//! reconciliation and written wholesale after a successful refresh cycle.
//! [`FileTokenConfStore`] keeps it in a JSON file and replaces the file
//! atomically; [`MemoryTokenConfStore`] keeps it in process for embedding
//! and tests.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{SignerError, SignerResult},
    model::Token,
};

/// Storage for the persisted token view.
#[async_trait]
pub trait TokenConfStore: Send + Sync + 'static {
    /// Reads every persisted token.
    ///
    /// A store that was never written returns an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::TokenConf`] on I/O failure and
    /// [`SignerError::Serialization`] on malformed content.
    async fn load(&self) -> SignerResult<Vec<Token>>;

    /// Replaces the persisted tokens.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::TokenConf`] on I/O failure and
    /// [`SignerError::Serialization`] if encoding fails.
    async fn save(&self, tokens: &[Token]) -> SignerResult<()>;
}

/// In-process token configuration.
#[derive(Debug, Default)]
pub struct MemoryTokenConfStore {
    tokens: Mutex<Vec<Token>>,
    saves: Mutex<u64>,
}

impl MemoryTokenConfStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `tokens`.
    #[must_use]
    pub fn with_tokens(tokens: Vec<Token>) -> Self {
        Self { tokens: Mutex::new(tokens), saves: Mutex::new(0) }
    }

    /// Replaces the stored tokens, as an operator editing the file would.
    pub fn replace(&self, tokens: Vec<Token>) {
        *self.tokens.lock() = tokens;
    }

    /// Returns a copy of the stored tokens.
    #[must_use]
    pub fn tokens(&self) -> Vec<Token> {
        self.tokens.lock().clone()
    }

    /// Returns how many times [`save`](TokenConfStore::save) ran.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

#[async_trait]
impl TokenConfStore for MemoryTokenConfStore {
    async fn load(&self) -> SignerResult<Vec<Token>> {
        Ok(self.tokens())
    }

    async fn save(&self, tokens: &[Token]) -> SignerResult<()> {
        *self.tokens.lock() = tokens.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct TokenConfDocument {
    tokens: Vec<Token>,
}

/// JSON file token configuration.
///
/// Writes go to a sibling temporary file that is renamed over the target,
/// so readers never observe a partially written document. A save whose
/// content matches the checksum of the file currently on disk is skipped.
#[derive(Debug)]
pub struct FileTokenConfStore {
    path: PathBuf,
}

impl FileTokenConfStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Checksum of the file as it is now, `None` if it is missing or unreadable.
    async fn on_disk_checksum(&self) -> Option<[u8; 32]> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Some(Sha256::digest(&bytes).into()),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(error = %err, "cannot read token configuration for comparison, rewriting");
                None
            },
        }
    }
}

#[async_trait]
impl TokenConfStore for FileTokenConfStore {
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> SignerResult<Vec<Token>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!("token configuration file does not exist yet");
                return Ok(Vec::new());
            },
            Err(err) => {
                return Err(SignerError::token_conf_with_source(
                    format!("reading {}", self.path.display()),
                    err,
                ));
            },
        };

        let document: TokenConfDocument = serde_json::from_slice(&bytes).map_err(|err| {
            SignerError::serialization_with_source(format!("parsing {}", self.path.display()), err)
        })?;
        Ok(document.tokens)
    }

    #[tracing::instrument(skip(self, tokens), fields(path = %self.path.display(), tokens = tokens.len()))]
    async fn save(&self, tokens: &[Token]) -> SignerResult<()> {
        let document = TokenConfDocument { tokens: tokens.to_vec() };
        let bytes = serde_json::to_vec_pretty(&document).map_err(|err| {
            SignerError::serialization_with_source("encoding token configuration", err)
        })?;

        let checksum: [u8; 32] = Sha256::digest(&bytes).into();
        if self.on_disk_checksum().await == Some(checksum) {
            tracing::trace!("token configuration unchanged on disk, skipping write");
            return Ok(());
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes).await.map_err(|err| {
            SignerError::token_conf_with_source(format!("writing {}", temp.display()), err)
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|err| {
            SignerError::token_conf_with_source(format!("replacing {}", self.path.display()), err)
        })?;

        tracing::debug!(checksum = %hex::encode(checksum), "token configuration saved");
        Ok(())
    }
}
