//! Module manager: keeps module workers in line with configuration.
//!
//! The manager owns the worker registry and is its only writer. [`run`]
//! multiplexes four event sources:
//!
//! ```text
//! shutdown token ─────────────┐
//! refresh interval tick ──────┤
//! JoinSet worker termination ─┼──► ModuleManager ──► start / stop / refresh workers
//! JoinSet refresh completion ─┘                     persist token snapshot
//! ```
//!
//! Refresh cycles run as their own tasks. A module stuck in its backoff
//! loop delays neither shutdown nor the other modules; it is simply skipped
//! by later ticks until its cycle ends.
//!
//! A hardware worker that ends with an error has spent its retry budget; the
//! manager hands the configured exit code to its [`FatalHandler`] and stops.
//! The same happens when no driver can be created for a hardware module.
//! A software worker that ends with an error is restarted on the next tick.
//!
//! [`run`]: ModuleManager::run

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::{
    task::{JoinError, JoinSet},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ModuleManagerConfig,
    descriptor::ModuleDescriptor,
    driver::{HardwareDriverFactory, create_driver},
    error::{SignerError, SignerResult},
    merge::{MergeOntoFileTokens, TokenMergeStrategy},
    model::Token,
    module_conf::ModuleConfSource,
    token_conf::TokenConfStore,
    worker::{MergeListener, ModuleWorker, ModuleWorkerHandle, WorkerContext},
};

/// Receives the decision that a hardware module is inoperable.
pub trait FatalHandler: Send + Sync + 'static {
    /// Escalates the failure of `module_type` with `exit_code`.
    fn escalate(&self, module_type: &str, exit_code: i32);
}

/// Terminates the process with the escalated exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl FatalHandler for ProcessExit {
    fn escalate(&self, module_type: &str, exit_code: i32) {
        tracing::error!(module = %module_type, exit_code, "hardware module inoperable, exiting process");
        std::process::exit(exit_code);
    }
}

/// Module type, worker generation and outcome of a finished task.
type TaskOutcome = (String, u64, SignerResult<()>);

struct RunningWorker {
    handle: ModuleWorkerHandle,
    generation: u64,
}

fn default_strategy() -> Arc<dyn TokenMergeStrategy> {
    Arc::new(MergeOntoFileTokens)
}

fn default_fatal_handler() -> Arc<dyn FatalHandler> {
    Arc::new(ProcessExit)
}

/// Supervisor of every module worker.
pub struct ModuleManager {
    config: ModuleManagerConfig,
    conf_source: Arc<dyn ModuleConfSource>,
    hardware: Option<Arc<dyn HardwareDriverFactory>>,
    context: WorkerContext,
    fatal_handler: Arc<dyn FatalHandler>,
    descriptors: Vec<ModuleDescriptor>,
    workers: HashMap<String, RunningWorker>,
    tasks: JoinSet<TaskOutcome>,
    refreshes: JoinSet<TaskOutcome>,
    refreshing: HashMap<String, u64>,
    restart_pending: HashSet<String>,
    next_generation: u64,
    cancel: CancellationToken,
}

#[bon::bon]
impl ModuleManager {
    /// Creates a manager with no running workers.
    ///
    /// Workers are started by the first [`on_refresh_tick`](Self::on_refresh_tick).
    #[builder]
    pub fn new(
        #[builder(default)] config: ModuleManagerConfig,
        conf_source: Arc<dyn ModuleConfSource>,
        token_conf: Arc<dyn TokenConfStore>,
        hardware: Option<Arc<dyn HardwareDriverFactory>>,
        #[builder(default = default_strategy())] strategy: Arc<dyn TokenMergeStrategy>,
        merge_listener: Option<Arc<dyn MergeListener>>,
        #[builder(default = default_fatal_handler())] fatal_handler: Arc<dyn FatalHandler>,
    ) -> Self {
        Self {
            config,
            conf_source,
            hardware,
            context: WorkerContext::new(token_conf, strategy, merge_listener),
            fatal_handler,
            descriptors: Vec::new(),
            workers: HashMap::new(),
            tasks: JoinSet::new(),
            refreshes: JoinSet::new(),
            refreshing: HashMap::new(),
            restart_pending: HashSet::new(),
            next_generation: 0,
            cancel: CancellationToken::new(),
        }
    }
}

impl ModuleManager {
    /// Returns the configured module types with a running worker, sorted.
    #[must_use]
    pub fn module_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.workers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Returns the handle of the worker for `module_type`.
    #[must_use]
    pub fn worker(&self, module_type: &str) -> Option<ModuleWorkerHandle> {
        self.workers.get(module_type).map(|running| running.handle.clone())
    }

    /// Runs one supervision tick to completion.
    ///
    /// Starts the tick like [`begin_refresh_tick`](Self::begin_refresh_tick),
    /// waits for every refresh cycle it started and persists the combined
    /// token view.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Fatal`] if a hardware module could not be
    /// started, or an error if the token configuration could not be
    /// persisted. Reload and refresh failures are logged.
    #[tracing::instrument(skip(self))]
    pub async fn on_refresh_tick(&mut self) -> SignerResult<()> {
        self.begin_refresh_tick().await?;
        while let Some(joined) = self.refreshes.join_next().await {
            self.on_refresh_finished(joined);
        }
        self.persist().await
    }

    /// Starts one supervision tick without waiting for refresh cycles.
    ///
    /// Reloads configuration if it changed, restarts dead software workers
    /// and sends a refresh to every worker whose previous cycle has ended.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Fatal`] after escalating when no driver can be
    /// created for a hardware module.
    pub async fn begin_refresh_tick(&mut self) -> SignerResult<()> {
        if self.conf_source.has_changed().await {
            match self.conf_source.reload().await {
                Ok(descriptors) => self.apply_descriptors(descriptors).await?,
                Err(err) => {
                    tracing::error!(error = %err, "module configuration reload failed, keeping running modules");
                },
            }
        }

        self.restart_dead_workers()?;
        self.spawn_refreshes();
        Ok(())
    }

    /// Applies the supervision policy to a finished worker.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Fatal`] after escalating when a hardware
    /// worker ended with an error.
    pub fn on_worker_terminated(&mut self, module_type: &str, result: SignerResult<()>) -> SignerResult<()> {
        let Some(running) = self.workers.remove(module_type) else {
            tracing::debug!(module = %module_type, "termination of an unregistered worker");
            return Ok(());
        };

        match result {
            Ok(()) => {
                if !self.cancel.is_cancelled() {
                    tracing::warn!(module = %module_type, "module worker exited unexpectedly, restarting on next tick");
                    self.restart_pending.insert(module_type.to_owned());
                }
                Ok(())
            },
            Err(err) if running.handle.descriptor().is_hardware() => {
                tracing::error!(module = %module_type, error = %err, "hardware module failed beyond its retry budget");
                Err(self.escalate(module_type))
            },
            Err(err) => {
                tracing::warn!(module = %module_type, error = %err, "software module worker failed, restarting on next tick");
                self.restart_pending.insert(module_type.to_owned());
                Ok(())
            },
        }
    }

    /// Drives the manager until `shutdown` is cancelled or a hardware
    /// module becomes inoperable.
    ///
    /// The first refresh tick fires immediately. Cancelling `shutdown`
    /// interrupts refresh cycles in progress, including backoff sleeps.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Fatal`] after a fatal escalation.
    #[tracing::instrument(name = "module_manager", skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) -> SignerResult<()> {
        let mut ticker = tokio::time::interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(refresh_interval = ?self.config.refresh_interval(), "module manager started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = self.tasks.join_next() => {
                    if let Err(err) = self.handle_join(joined) {
                        self.shutdown().await;
                        return Err(err);
                    }
                },
                Some(joined) = self.refreshes.join_next() => {
                    self.on_refresh_finished(joined);
                    if let Err(err) = self.persist().await {
                        tracing::error!(error = %err, "failed to persist token configuration");
                    }
                },
                _ = ticker.tick() => {
                    let started = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        started = self.begin_refresh_tick() => started,
                    };
                    if let Err(err) = started {
                        self.shutdown().await;
                        return Err(err);
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Persists a final snapshot, stops every worker and waits for them.
    pub async fn shutdown(&mut self) {
        if let Err(err) = self.persist().await {
            tracing::warn!(error = %err, "failed to persist token configuration on shutdown");
        }

        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok((module, _, Err(err))) = joined {
                tracing::debug!(module = %module, error = %err, "module worker ended with an error during shutdown");
            }
        }
        self.refreshes.shutdown().await;
        self.refreshing.clear();
        self.workers.clear();
        self.restart_pending.clear();
        tracing::info!("module manager stopped");
    }

    /// Returns the token views of every running worker.
    #[must_use]
    pub fn tokens(&self) -> Vec<Token> {
        let mut tokens = Vec::new();
        for module in self.module_types() {
            let Some(running) = self.workers.get(&module) else { continue };
            match running.handle.tokens() {
                Ok(module_tokens) => tokens.extend(module_tokens),
                Err(err) => tracing::debug!(module = %module, error = %err, "worker snapshot unavailable"),
            }
        }
        tokens
    }

    /// Saves worker snapshots over the persisted token configuration.
    ///
    /// Persisted tokens of modules without a live, non-empty snapshot are
    /// kept untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or saved.
    pub async fn persist(&self) -> SignerResult<()> {
        let mut live_modules = HashSet::new();
        let mut snapshot = Vec::new();
        for (module, running) in &self.workers {
            match running.handle.tokens() {
                Ok(tokens) if !tokens.is_empty() => {
                    live_modules.insert(module.as_str());
                    snapshot.extend(tokens);
                },
                Ok(_) => {},
                Err(err) => tracing::debug!(module = %module, error = %err, "skipping snapshot of stopped worker"),
            }
        }
        if live_modules.is_empty() {
            return Ok(());
        }

        let mut tokens = self.context.token_conf.load().await?;
        tokens.retain(|token| !live_modules.contains(token.module_id.as_str()));
        tokens.extend(snapshot);
        self.context.token_conf.save(&tokens).await
    }

    async fn apply_descriptors(&mut self, descriptors: Vec<ModuleDescriptor>) -> SignerResult<()> {
        let mut seen = HashSet::new();
        let mut desired = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if !seen.insert(descriptor.module_type().to_owned()) {
                tracing::warn!(module = %descriptor.module_type(), "duplicate module type in configuration, skipping");
                continue;
            }
            desired.push(descriptor);
        }

        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, running)| !desired.contains(running.handle.descriptor()))
            .map(|(module, _)| module.clone())
            .collect();
        for module in stale {
            if let Some(running) = self.workers.remove(&module) {
                tracing::info!(module = %module, "stopping module worker");
                running.handle.stop();
                running.handle.stopped().await;
            }
        }

        self.restart_pending.retain(|module| desired.iter().any(|d| d.module_type() == module));
        self.descriptors = desired.clone();
        for descriptor in desired {
            if !self.workers.contains_key(descriptor.module_type()) {
                self.start_worker(descriptor)?;
            }
        }
        Ok(())
    }

    fn restart_dead_workers(&mut self) -> SignerResult<()> {
        let pending: Vec<String> = self.restart_pending.drain().collect();
        for module in pending {
            if self.workers.contains_key(&module) {
                continue;
            }
            if let Some(descriptor) = self.descriptors.iter().find(|d| d.module_type() == module).cloned() {
                tracing::info!(module = %module, "restarting module worker");
                self.start_worker(descriptor)?;
            }
        }
        Ok(())
    }

    fn start_worker(&mut self, descriptor: ModuleDescriptor) -> SignerResult<()> {
        let module = descriptor.module_type().to_owned();
        let driver = match create_driver(&descriptor, self.hardware.as_ref(), self.config.driver_timeout()) {
            Ok(driver) => driver,
            Err(err) if descriptor.is_hardware() => {
                tracing::error!(module = %module, error = %err, "cannot create hardware module driver");
                return Err(self.escalate(&module));
            },
            Err(err) => {
                tracing::error!(module = %module, error = %err, "cannot create module driver, retrying on next tick");
                self.restart_pending.insert(module);
                return Ok(());
            },
        };

        let hardware = descriptor.is_hardware();
        let (worker, handle) = ModuleWorker::new(descriptor, driver, self.context.clone(), &self.cancel);
        self.next_generation += 1;
        let generation = self.next_generation;
        let task_module = module.clone();
        self.tasks.spawn(async move {
            let result = worker.run().await;
            (task_module, generation, result)
        });

        self.restart_pending.remove(&module);
        self.workers.insert(module.clone(), RunningWorker { handle, generation });
        tracing::info!(module = %module, hardware, "module worker spawned");
        Ok(())
    }

    fn spawn_refreshes(&mut self) {
        for (module, running) in &self.workers {
            if self.refreshing.get(module) == Some(&running.generation) {
                tracing::debug!(module = %module, "previous refresh cycle still running, skipping");
                continue;
            }
            self.refreshing.insert(module.clone(), running.generation);

            let handle = running.handle.clone();
            let generation = running.generation;
            self.refreshes.spawn(async move {
                let result = handle.refresh().await;
                (handle.module_type().to_owned(), generation, result)
            });
        }
    }

    fn on_refresh_finished(&mut self, joined: Result<TaskOutcome, JoinError>) {
        match joined {
            Ok((module, generation, result)) => {
                if self.refreshing.get(&module) == Some(&generation) {
                    self.refreshing.remove(&module);
                }
                if let Err(err) = result {
                    tracing::warn!(module = %module, error = %err, "refresh cycle failed");
                }
            },
            Err(err) => tracing::warn!(error = %err, "refresh task did not complete"),
        }
    }

    fn escalate(&self, module_type: &str) -> SignerError {
        let exit_code = self.config.fatal_exit_code();
        tracing::error!(module = %module_type, exit_code, "escalating inoperable hardware module");
        self.fatal_handler.escalate(module_type, exit_code);
        SignerError::Fatal { module: module_type.to_owned(), exit_code }
    }

    fn handle_join(&mut self, joined: Result<TaskOutcome, JoinError>) -> SignerResult<()> {
        match joined {
            Ok((module, generation, result)) => {
                if self.workers.get(&module).map(|running| running.generation) != Some(generation) {
                    tracing::debug!(module = %module, "replaced module worker exited");
                    return Ok(());
                }
                self.on_worker_terminated(&module, result)
            },
            Err(join_err) => {
                let crashed: Vec<String> = self
                    .workers
                    .iter()
                    .filter(|(_, running)| !running.handle.is_running())
                    .map(|(module, _)| module.clone())
                    .collect();
                tracing::error!(error = %join_err, modules = ?crashed, "module worker task panicked");
                for module in crashed {
                    let stopped = SignerError::worker_stopped(&module);
                    self.on_worker_terminated(&module, Err(stopped))?;
                }
                Ok(())
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::FATAL_EXIT_CODE,
        descriptor::SOFTWARE_MODULE_TYPE,
        driver::SOFTWARE_TOKEN_ID,
        module_conf::MemoryModuleConfSource,
        testutil::{MockHardwareDriver, RecordingFatalHandler, StaticHardwareFactory, hardware_conf},
        token_conf::MemoryTokenConfStore,
    };

    struct Fixture {
        manager: ModuleManager,
        source: Arc<MemoryModuleConfSource>,
        store: Arc<MemoryTokenConfStore>,
        fatal: Arc<RecordingFatalHandler>,
    }

    fn fixture(descriptors: Vec<ModuleDescriptor>, mock: &Arc<MockHardwareDriver>) -> Fixture {
        let source = Arc::new(MemoryModuleConfSource::new(descriptors));
        let store = Arc::new(MemoryTokenConfStore::new());
        let fatal = Arc::new(RecordingFatalHandler::default());
        let manager = ModuleManager::builder()
            .conf_source(Arc::clone(&source) as _)
            .token_conf(Arc::clone(&store) as _)
            .hardware(Arc::new(StaticHardwareFactory::new(Arc::clone(mock))) as _)
            .fatal_handler(Arc::clone(&fatal) as _)
            .build();
        Fixture { manager, source, store, fatal }
    }

    #[tokio::test]
    async fn test_tick_starts_workers_and_persists() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let mut f = fixture(
            vec![ModuleDescriptor::software(), ModuleDescriptor::hardware("hsm", hardware_conf())],
            &mock,
        );

        f.manager.on_refresh_tick().await.unwrap();

        assert_eq!(f.manager.module_types(), ["hsm", SOFTWARE_MODULE_TYPE]);
        let ids: Vec<String> = f.store.tokens().into_iter().map(|t| t.id).collect();
        assert!(ids.contains(&SOFTWARE_TOKEN_ID.to_owned()));
        assert!(ids.contains(&"hsm0SN0token0".to_owned()));
        assert_eq!(f.manager.tokens().len(), 2);

        f.manager.shutdown().await;
        assert!(!mock.is_initialized());
    }

    #[tokio::test]
    async fn test_unchanged_configuration_is_not_reloaded() {
        let mock = Arc::new(MockHardwareDriver::with_slots(0));
        let mut f = fixture(vec![ModuleDescriptor::software()], &mock);

        f.manager.on_refresh_tick().await.unwrap();
        f.manager.on_refresh_tick().await.unwrap();

        assert_eq!(f.source.reload_count(), 1);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_module_is_stopped() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let mut f = fixture(
            vec![ModuleDescriptor::software(), ModuleDescriptor::hardware("hsm", hardware_conf())],
            &mock,
        );
        f.manager.on_refresh_tick().await.unwrap();
        assert!(mock.is_initialized());

        f.source.set(vec![ModuleDescriptor::software()]);
        f.manager.on_refresh_tick().await.unwrap();

        assert_eq!(f.manager.module_types(), [SOFTWARE_MODULE_TYPE]);
        assert!(!mock.is_initialized());
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_changed_descriptor_replaces_worker() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let mut f = fixture(vec![ModuleDescriptor::hardware("hsm", hardware_conf())], &mock);
        f.manager.on_refresh_tick().await.unwrap();

        let mut conf = hardware_conf();
        conf.read_only = true;
        f.source.set(vec![ModuleDescriptor::hardware("hsm", conf)]);
        f.manager.on_refresh_tick().await.unwrap();

        assert_eq!(mock.initialize_calls(), 2);
        assert_eq!(mock.deinitialize_calls(), 1);
        let tokens = f.manager.tokens();
        assert!(tokens[0].read_only);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_module_types_keep_first() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let mut read_only = hardware_conf();
        read_only.read_only = true;
        let mut f = fixture(
            vec![
                ModuleDescriptor::hardware("hsm", hardware_conf()),
                ModuleDescriptor::hardware("hsm", read_only),
            ],
            &mock,
        );

        f.manager.on_refresh_tick().await.unwrap();

        assert_eq!(f.manager.module_types(), ["hsm"]);
        assert!(!f.manager.tokens()[0].read_only);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_hardware_termination_escalates() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let mut f = fixture(vec![ModuleDescriptor::hardware("hsm", hardware_conf())], &mock);
        f.manager.on_refresh_tick().await.unwrap();

        let err = f
            .manager
            .on_worker_terminated("hsm", Err(SignerError::no_slots("hsm", 1)))
            .unwrap_err();

        assert!(matches!(err, SignerError::Fatal { exit_code: FATAL_EXIT_CODE, .. }));
        assert_eq!(f.fatal.escalations(), [("hsm".to_owned(), FATAL_EXIT_CODE)]);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_software_termination_restarts_on_next_tick() {
        let mock = Arc::new(MockHardwareDriver::with_slots(0));
        let mut f = fixture(vec![ModuleDescriptor::software()], &mock);
        f.manager.on_refresh_tick().await.unwrap();

        f.manager
            .on_worker_terminated(SOFTWARE_MODULE_TYPE, Err(SignerError::worker_stopped(SOFTWARE_MODULE_TYPE)))
            .unwrap();
        assert!(f.manager.module_types().is_empty());

        f.manager.on_refresh_tick().await.unwrap();

        assert_eq!(f.manager.module_types(), [SOFTWARE_MODULE_TYPE]);
        assert!(f.fatal.escalations().is_empty());
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_persist_keeps_tokens_of_modules_without_workers() {
        let mock = Arc::new(MockHardwareDriver::with_slots(0));
        let mut f = fixture(vec![ModuleDescriptor::software()], &mock);
        f.store.replace(vec![Token::builder().id("legacy").module_id("retired-hsm").build()]);

        f.manager.on_refresh_tick().await.unwrap();

        let modules: Vec<String> = f.store.tokens().into_iter().map(|t| t.module_id).collect();
        assert_eq!(modules, ["retired-hsm", SOFTWARE_MODULE_TYPE]);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let f = fixture(vec![ModuleDescriptor::hardware("hsm", hardware_conf())], &mock);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.manager.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.store.save_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first tick persists");
        shutdown.cancel();

        task.await.unwrap().unwrap();
        assert!(!mock.is_initialized());
    }

    #[tokio::test]
    async fn test_hardware_module_without_driver_escalates() {
        let source = Arc::new(MemoryModuleConfSource::new(vec![
            ModuleDescriptor::software(),
            ModuleDescriptor::hardware("hsm", hardware_conf()),
        ]));
        let fatal = Arc::new(RecordingFatalHandler::default());
        let mut manager = ModuleManager::builder()
            .conf_source(source as _)
            .token_conf(Arc::new(MemoryTokenConfStore::new()))
            .fatal_handler(Arc::clone(&fatal) as _)
            .build();

        let err = manager.on_refresh_tick().await.unwrap_err();

        assert!(matches!(err, SignerError::Fatal { exit_code: FATAL_EXIT_CODE, .. }));
        assert_eq!(fatal.escalations(), [("hsm".to_owned(), FATAL_EXIT_CODE)]);
        assert!(!manager.module_types().contains(&"hsm".to_owned()));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_tick_skips_module_with_refresh_in_progress() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        mock.set_call_delay(Duration::from_millis(200));
        let mut f = fixture(vec![ModuleDescriptor::hardware("hsm", hardware_conf())], &mock);

        f.manager.begin_refresh_tick().await.unwrap();
        f.manager.begin_refresh_tick().await.unwrap();

        assert_eq!(f.manager.refreshes.len(), 1);
        f.manager.shutdown().await;
    }
}
