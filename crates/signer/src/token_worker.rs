//! Per-token worker task.
//!
//! Each available token of a module gets one worker task owning the token's
//! latest reconciled snapshot, reached through a [`TokenWorkerHandle`]. The
//! owning module worker pushes updates after every reconciliation and stops
//! the task when the token disappears or becomes unavailable.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::model::{Token, TokenStatus};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug)]
enum TokenCommand {
    Update(Box<Token>),
    Snapshot(oneshot::Sender<Token>),
}

/// Handle to a running token worker.
#[derive(Debug)]
pub struct TokenWorkerHandle {
    token_id: String,
    tx: mpsc::Sender<TokenCommand>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl TokenWorkerHandle {
    /// Spawns a worker for `token`.
    ///
    /// `parent` is the module worker's cancellation token; cancelling it
    /// stops every child.
    pub(crate) fn spawn(token: Token, parent: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = parent.child_token();
        let token_id = token.id.clone();
        let worker = TokenWorker { token, rx, cancel: cancel.clone() };
        let task = tokio::spawn(worker.run());
        Self { token_id, tx, cancel, task }
    }

    /// Returns the token id.
    #[must_use]
    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    /// Pushes a new reconciled snapshot.
    pub(crate) async fn update(&self, token: Token) {
        if self.tx.send(TokenCommand::Update(Box::new(token))).await.is_err() {
            tracing::warn!(token_id = %self.token_id, "token worker is gone, dropping update");
        }
    }

    /// Returns the worker's current snapshot, or `None` if it has stopped.
    pub async fn snapshot(&self) -> Option<Token> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(TokenCommand::Snapshot(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Stops the worker and waits for it to exit.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(token_id = %self.token_id, error = %err, "token worker panicked");
        }
    }
}

struct TokenWorker {
    token: Token,
    rx: mpsc::Receiver<TokenCommand>,
    cancel: CancellationToken,
}

impl TokenWorker {
    #[tracing::instrument(name = "token_worker", skip(self), fields(token_id = %self.token.id, module = %self.token.module_id))]
    async fn run(mut self) {
        tracing::debug!("token worker started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(TokenCommand::Update(token)) => self.apply(*token),
                    Some(TokenCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.token.clone());
                    },
                    None => break,
                },
            }
        }
        tracing::debug!("token worker stopped");
    }

    fn apply(&mut self, token: Token) {
        if token.active != self.token.active {
            tracing::info!(active = token.active, "token activity changed");
        }
        if token.status != self.token.status && token.status != TokenStatus::Ok {
            tracing::warn!(status = ?token.status, "token status degraded");
        }
        self.token = token;
    }
}
