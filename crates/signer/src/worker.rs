//! Module worker: one task per configured signing module.
//!
//! A module worker owns its driver and its in-memory token view. It is
//! driven by commands from the [`ModuleManager`](crate::ModuleManager)
//! through a [`ModuleWorkerHandle`]:
//!
//! ```text
//! Refresh ──► initialize (idempotent) ──► list_tokens ──► merge with persisted view
//!                  ▲                           │                    │
//!                  └──── deinitialize + ◄──────┘ transient error    ▼
//!                        backoff sleep                    spawn / update / stop
//!                                                             token workers
//! ```
//!
//! Commands are handled one at a time, so a refresh cycle always finishes
//! before the next one starts. The token view is published after every
//! change, so snapshot readers never wait behind a running cycle. When the
//! backoff budget of a cycle is spent
//! the task ends with [`SignerError::RetriesExhausted`]; the manager
//! observes the termination and applies its supervision policy.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use fail::fail_point;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::with_backoff,
    config::BackoffPolicy,
    descriptor::{ModuleDescriptor, ModuleKind},
    driver::{DiscoveredToken, ModuleDriver},
    error::{SignerError, SignerResult},
    merge::TokenMergeStrategy,
    model::{Cert, OcspResponse, Token},
    token_conf::TokenConfStore,
    token_worker::TokenWorkerHandle,
};

const COMMAND_BUFFER: usize = 32;

/// Receives certificates that appeared in the persisted view.
///
/// Implemented by the OCSP refresher, which fetches a response for each
/// certificate before it may be used for signing.
pub trait MergeListener: Send + Sync + 'static {
    /// Called after a merge that introduced certificates from the file view.
    fn certs_added(&self, module_type: &str, certs: &[Cert]);
}

/// Collaborators shared by every module worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub(crate) token_conf: Arc<dyn TokenConfStore>,
    pub(crate) strategy: Arc<dyn TokenMergeStrategy>,
    pub(crate) listener: Option<Arc<dyn MergeListener>>,
}

impl WorkerContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        token_conf: Arc<dyn TokenConfStore>,
        strategy: Arc<dyn TokenMergeStrategy>,
        listener: Option<Arc<dyn MergeListener>>,
    ) -> Self {
        Self { token_conf, strategy, listener }
    }
}

#[derive(Debug)]
enum ModuleCommand {
    Refresh(oneshot::Sender<SignerResult<()>>),
    SetOcspResponses { responses: Vec<(String, OcspResponse)>, reply: oneshot::Sender<usize> },
}

/// Cloneable handle to a running module worker.
#[derive(Debug, Clone)]
pub struct ModuleWorkerHandle {
    descriptor: ModuleDescriptor,
    tx: mpsc::Sender<ModuleCommand>,
    snapshot: watch::Receiver<Vec<Token>>,
    cancel: CancellationToken,
}

impl ModuleWorkerHandle {
    /// Returns the descriptor the worker was started with.
    #[must_use]
    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    /// Returns the module type.
    #[must_use]
    pub fn module_type(&self) -> &str {
        self.descriptor.module_type()
    }

    /// Runs one refresh cycle and waits for it to complete.
    ///
    /// # Errors
    ///
    /// Returns the cycle's error, or [`SignerError::WorkerStopped`] if the
    /// worker is no longer running.
    pub async fn refresh(&self) -> SignerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ModuleCommand::Refresh(reply)).await?;
        rx.await.map_err(|_| SignerError::worker_stopped(self.module_type()))?
    }

    /// Returns the token view published after the worker's last change.
    ///
    /// Does not wait for a refresh cycle in progress.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::WorkerStopped`] if the worker is no longer running.
    pub fn tokens(&self) -> SignerResult<Vec<Token>> {
        if !self.is_running() {
            return Err(SignerError::worker_stopped(self.module_type()));
        }
        Ok(self.snapshot.borrow().clone())
    }

    /// Caches OCSP responses on matching certificates, keyed by certificate id.
    ///
    /// Returns how many certificates were updated.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::WorkerStopped`] if the worker is no longer running.
    pub async fn set_ocsp_responses(&self, responses: Vec<(String, OcspResponse)>) -> SignerResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(ModuleCommand::SetOcspResponses { responses, reply }).await?;
        rx.await.map_err(|_| SignerError::worker_stopped(self.module_type()))
    }

    /// Asks the worker to stop. Completion is observed by the task's owner.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Returns `false` once the worker task has exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Waits until the worker task has exited and released its driver.
    pub async fn stopped(&self) {
        self.tx.closed().await;
    }

    async fn send(&self, command: ModuleCommand) -> SignerResult<()> {
        self.tx.send(command).await.map_err(|_| SignerError::worker_stopped(self.module_type()))
    }
}

/// The module worker task state.
pub struct ModuleWorker {
    descriptor: ModuleDescriptor,
    driver: Arc<dyn ModuleDriver>,
    policy: BackoffPolicy,
    context: WorkerContext,
    tokens: Vec<Token>,
    token_workers: HashMap<String, TokenWorkerHandle>,
    rx: mpsc::Receiver<ModuleCommand>,
    published: watch::Sender<Vec<Token>>,
    cancel: CancellationToken,
}

impl ModuleWorker {
    /// Creates a worker and its handle. The worker does nothing until
    /// [`run`](Self::run) is polled.
    #[must_use]
    pub fn new(
        descriptor: ModuleDescriptor,
        driver: Arc<dyn ModuleDriver>,
        context: WorkerContext,
        parent: &CancellationToken,
    ) -> (Self, ModuleWorkerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (published, snapshot) = watch::channel(Vec::new());
        let cancel = parent.child_token();
        let handle = ModuleWorkerHandle { descriptor: descriptor.clone(), tx, snapshot, cancel: cancel.clone() };
        let worker = Self {
            policy: descriptor.backoff(),
            descriptor,
            driver,
            context,
            tokens: Vec::new(),
            token_workers: HashMap::new(),
            rx,
            published,
            cancel,
        };
        (worker, handle)
    }

    /// Runs the worker until it is stopped or its retry budget is spent.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::RetriesExhausted`] (or another non-transient
    /// error) when the module could not be initialized or reconciled.
    #[tracing::instrument(name = "module_worker", skip(self), fields(module = %self.descriptor.module_type()))]
    pub async fn run(mut self) -> SignerResult<()> {
        let cancel = self.cancel.clone();
        let module = self.descriptor.module_type().to_owned();

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = with_backoff(&self.policy, &module, "initialize", || self.driver.initialize()) => result,
        };
        if let Err(err) = started {
            self.shutdown().await;
            return Err(err);
        }
        tracing::info!("module worker started");

        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = self.rx.recv() => command,
            };
            let Some(command) = command else { break };

            match command {
                ModuleCommand::Refresh(reply) => {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = self.refresh() => result,
                    };
                    if let Err(err) = result {
                        let _ = reply.send(Err(err.clone()));
                        self.shutdown().await;
                        return Err(err);
                    }
                    let _ = reply.send(Ok(()));
                },
                ModuleCommand::SetOcspResponses { responses, reply } => {
                    let applied = self.apply_ocsp_responses(responses);
                    self.publish();
                    let _ = reply.send(applied);
                },
            }
        }

        self.shutdown().await;
        tracing::info!("module worker stopped");
        Ok(())
    }

    /// One refresh cycle: enumerate under backoff, then reconcile.
    async fn refresh(&mut self) -> SignerResult<()> {
        let module = self.descriptor.module_type().to_owned();
        let driver = Arc::clone(&self.driver);
        let reinitialized = Arc::new(AtomicBool::new(false));

        let discovered = with_backoff(&self.policy, &module, "list_tokens", || {
            let driver = Arc::clone(&driver);
            let reinitialized = Arc::clone(&reinitialized);
            async move {
                if !driver.is_initialized() {
                    reinitialized.store(true, Ordering::Relaxed);
                }
                driver.initialize().await?;
                let listed = async {
                    fail_point!("worker-before-list-tokens", |_| {
                        Err(SignerError::module_init(driver.module_type(), "injected enumeration failure"))
                    });
                    driver.list_tokens().await
                }
                .await;
                match listed {
                    Ok(tokens) => Ok(tokens),
                    Err(err) => {
                        if err.is_transient() {
                            driver.deinitialize().await;
                        }
                        Err(err)
                    },
                }
            }
        })
        .await?;

        if reinitialized.load(Ordering::Relaxed) && self.descriptor.is_hardware() {
            self.clear_ocsp_responses();
        }

        let live = self.build_live_tokens(discovered);
        let mut tokens = self.reconcile(live).await;
        self.apply_live_state(&mut tokens);
        self.tokens = tokens;
        self.sync_token_workers().await;
        self.publish();
        Ok(())
    }

    /// Overlays enumeration facts on the current memory view.
    ///
    /// Tokens that were not rediscovered stay in the view as unavailable.
    fn build_live_tokens(&self, discovered: Vec<DiscoveredToken>) -> Vec<Token> {
        let module = self.descriptor.module_type();
        let mut seen = HashSet::new();
        let mut live = Vec::with_capacity(discovered.len());

        for found in discovered {
            if !seen.insert(found.id.clone()) {
                tracing::warn!(token_id = %found.id, slot_index = ?found.slot_index, "duplicate token id, keeping first slot");
                continue;
            }

            let mut token = self
                .tokens
                .iter()
                .find(|token| token.id == found.id)
                .cloned()
                .unwrap_or_else(|| Token::builder().id(found.id.clone()).module_id(module).build());

            token.module_id = module.to_owned();
            token.available = true;
            token.read_only = found.read_only;
            token.batch_signing_enabled = found.batch_signing_enabled;
            token.slot_index = found.slot_index;
            if found.serial_number.is_some() {
                token.serial_number = found.serial_number;
            }
            if found.label.is_some() {
                token.label = found.label;
            }
            token.info.extend(found.info);
            live.push(token);
        }

        for token in &self.tokens {
            if !seen.contains(&token.id) {
                if token.available {
                    tracing::warn!(token_id = %token.id, "token no longer present");
                }
                let mut gone = token.clone();
                gone.available = false;
                gone.active = false;
                live.push(gone);
            }
        }

        live
    }

    /// Merges the live view with this module's persisted tokens.
    ///
    /// If the persisted view cannot be read, the live view is kept as is.
    async fn reconcile(&self, live: Vec<Token>) -> Vec<Token> {
        let module = self.descriptor.module_type();
        let file_tokens: Vec<Token> = match self.context.token_conf.load().await {
            Ok(all) => all.into_iter().filter(|token| token.module_id == module).collect(),
            Err(err) => {
                tracing::error!(error = %err, "failed to load token configuration, keeping memory view");
                return live;
            },
        };

        let result = self.context.strategy.merge(file_tokens, live);
        if !result.added_certs_from_file.is_empty() {
            tracing::info!(count = result.added_certs_from_file.len(), "certificates added from configuration");
            if let Some(listener) = &self.context.listener {
                listener.certs_added(module, &result.added_certs_from_file);
            }
        }
        result.tokens
    }

    /// Applies module facts to the merged view.
    ///
    /// Persisted keys carry no live state, so a key is available exactly
    /// when its token is. Keys on hardware tokens sign with the module's
    /// configured mechanism.
    fn apply_live_state(&self, tokens: &mut [Token]) {
        let mechanism = match self.descriptor.kind() {
            ModuleKind::Hardware(conf) => Some(conf.sign_mechanism.as_str()),
            ModuleKind::Software => None,
        };
        for token in tokens {
            let available = token.available;
            for key in &mut token.keys {
                key.available = available;
                if let Some(mechanism) = mechanism {
                    mechanism.clone_into(&mut key.sign_mechanism);
                }
            }
        }
    }

    fn publish(&self) {
        self.published.send_replace(self.tokens.clone());
    }

    async fn sync_token_workers(&mut self) {
        let wanted: HashSet<&str> =
            self.tokens.iter().filter(|token| token.available).map(|token| token.id.as_str()).collect();

        let stale: Vec<String> =
            self.token_workers.keys().filter(|id| !wanted.contains(id.as_str())).cloned().collect();
        for token_id in stale {
            if let Some(handle) = self.token_workers.remove(&token_id) {
                tracing::debug!(token_id = %token_id, "stopping token worker");
                handle.stop().await;
            }
        }

        for token in self.tokens.iter().filter(|token| token.available) {
            match self.token_workers.get(&token.id) {
                Some(handle) => handle.update(token.clone()).await,
                None => {
                    tracing::debug!(token_id = %token.id, "starting token worker");
                    self.token_workers
                        .insert(token.id.clone(), TokenWorkerHandle::spawn(token.clone(), &self.cancel));
                },
            }
        }
    }

    fn apply_ocsp_responses(&mut self, responses: Vec<(String, OcspResponse)>) -> usize {
        let mut applied = 0;
        for (cert_id, response) in responses {
            if let Some(cert) = self.tokens.iter_mut().find_map(|token| token.cert_mut(&cert_id)) {
                cert.ocsp_response = Some(response);
                applied += 1;
            }
        }
        applied
    }

    fn clear_ocsp_responses(&mut self) {
        for token in &mut self.tokens {
            for key in &mut token.keys {
                for cert in &mut key.certs {
                    cert.ocsp_response = None;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        for (_, handle) in self.token_workers.drain() {
            handle.stop().await;
        }
        self.driver.deinitialize().await;
    }
}
