//! Module driver capability and its hardware and software implementations.
//!
//! The worker tree talks to a module only through [`ModuleDriver`]. Which
//! implementation backs a module is decided once from its
//! [`ModuleKind`](crate::descriptor::ModuleKind):
//!
//! ```text
//! ModuleKind::Hardware(conf) ──► HardwareDriver ──► dyn HardwareModuleDriver (blocking, vendor library)
//! ModuleKind::Software       ──► SoftwareDriver (no-op lifecycle, one fixed token)
//! ```
//!
//! Every call into a [`HardwareModuleDriver`] runs on the blocking thread
//! pool under a timeout, so a wedged vendor library cannot stall the async
//! workers of other modules. A timeout surfaces as [`SignerError::Timeout`]
//! and takes the same retry path as an initialization failure.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    descriptor::{HardwareModuleConf, ModuleDescriptor, ModuleKind, SOFTWARE_MODULE_TYPE},
    error::{BoxError, SignerError, SignerResult},
};

/// Identifier of the single software token.
pub const SOFTWARE_TOKEN_ID: &str = "0";

/// Token info entry telling signers to log in with the PIN before every signature.
pub const PIN_PER_SIGNING_INFO: &str = "pin_verification_per_signing";

/// Opaque slot identifier reported by a hardware driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle(pub u64);

/// Options for opening a hardware driver library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeOptions {
    /// Path of the vendor library.
    pub library: PathBuf,
    /// Library may not create its own OS threads.
    pub cant_create_os_threads: Option<bool>,
    /// Library may use native OS locking.
    pub os_locking_ok: Option<bool>,
}

impl From<&HardwareModuleConf> for InitializeOptions {
    fn from(conf: &HardwareModuleConf) -> Self {
        Self {
            library: conf.library.clone(),
            cant_create_os_threads: conf.library_cant_create_os_threads,
            os_locking_ok: conf.os_locking_ok,
        }
    }
}

/// Token details read from a hardware slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareTokenInfo {
    /// Token serial number.
    pub serial_number: String,
    /// Token label.
    pub label: String,
    /// Token rejects writes.
    pub write_protected: bool,
}

/// Failure reported by a vendor driver call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl DriverError {
    /// Creates a driver error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    /// Creates a driver error with a source error.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { message: message.into(), source: Some(Arc::new(source)) }
    }
}

/// Blocking interface to a vendor hardware-token library.
///
/// Implementations wrap the C-level token interface. Calls may block on
/// hardware I/O; the worker tree always invokes them from
/// [`tokio::task::spawn_blocking`].
pub trait HardwareModuleDriver: Send + Sync + 'static {
    /// Loads and initializes the library.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if the library cannot be loaded or initialized.
    fn initialize(&self, options: &InitializeOptions) -> Result<(), DriverError>;

    /// Finalizes the library.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if finalization fails.
    fn deinitialize(&self) -> Result<(), DriverError>;

    /// Lists slots that currently hold a token.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] on a driver fault.
    fn list_slots(&self) -> Result<Vec<SlotHandle>, DriverError>;

    /// Reads token details from a slot.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] on a driver fault.
    fn token_info(&self, slot: SlotHandle) -> Result<HardwareTokenInfo, DriverError>;
}

/// Produces a [`HardwareModuleDriver`] for a configured hardware module.
pub trait HardwareDriverFactory: Send + Sync + 'static {
    /// Returns the driver for `module_type`.
    fn open(&self, module_type: &str, conf: &HardwareModuleConf) -> Arc<dyn HardwareModuleDriver>;
}

/// A token found during enumeration, before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredToken {
    /// Token identifier.
    pub id: String,
    /// Position of the slot in the driver's slot list.
    pub slot_index: Option<usize>,
    /// Serial number, for hardware tokens.
    pub serial_number: Option<String>,
    /// Label, for hardware tokens.
    pub label: Option<String>,
    /// Token rejects writes.
    pub read_only: bool,
    /// Several hashes may be signed in one call.
    pub batch_signing_enabled: bool,
    /// Driver-provided details.
    pub info: BTreeMap<String, String>,
}

/// Async lifecycle capability every module worker drives.
#[async_trait]
pub trait ModuleDriver: Send + Sync + 'static {
    /// Returns the module type this driver serves.
    fn module_type(&self) -> &str;

    /// Returns `true` once [`initialize`](Self::initialize) has succeeded and
    /// no [`deinitialize`](Self::deinitialize) followed.
    fn is_initialized(&self) -> bool;

    /// Opens the module. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::ModuleInit`] or [`SignerError::Timeout`].
    async fn initialize(&self) -> SignerResult<()>;

    /// Closes the module. Idempotent and best-effort: failures are logged.
    async fn deinitialize(&self);

    /// Enumerates the tokens currently present.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::NoSlots`] when no slots are reported although
    /// slots were seen before, [`SignerError::Timeout`] when a driver call
    /// hangs, and [`SignerError::Driver`] on a driver fault.
    async fn list_tokens(&self) -> SignerResult<Vec<DiscoveredToken>>;
}

/// Builds the driver for a module descriptor.
///
/// # Errors
///
/// Returns [`SignerError::ModuleInit`] if the descriptor is a hardware
/// module and no hardware factory was supplied.
pub fn create_driver(
    descriptor: &ModuleDescriptor,
    hardware: Option<&Arc<dyn HardwareDriverFactory>>,
    driver_timeout: Duration,
) -> SignerResult<Arc<dyn ModuleDriver>> {
    match descriptor.kind() {
        ModuleKind::Hardware(conf) => {
            let Some(factory) = hardware else {
                return Err(SignerError::module_init(
                    descriptor.module_type(),
                    "no hardware driver factory configured",
                ));
            };
            let driver = factory.open(descriptor.module_type(), conf);
            Ok(Arc::new(HardwareDriver::new(descriptor.module_type(), conf.clone(), driver, driver_timeout)))
        },
        ModuleKind::Software => Ok(Arc::new(SoftwareDriver::new())),
    }
}

/// [`ModuleDriver`] adaptor over a blocking [`HardwareModuleDriver`].
pub struct HardwareDriver {
    module_type: String,
    conf: HardwareModuleConf,
    driver: Arc<dyn HardwareModuleDriver>,
    timeout: Duration,
    initialized: AtomicBool,
    /// Slots seen on the last successful enumeration.
    known_slots: AtomicUsize,
}

impl HardwareDriver {
    /// Wraps `driver` for the module `module_type`.
    #[must_use]
    pub fn new(
        module_type: impl Into<String>,
        conf: HardwareModuleConf,
        driver: Arc<dyn HardwareModuleDriver>,
        timeout: Duration,
    ) -> Self {
        Self {
            module_type: module_type.into(),
            conf,
            driver,
            timeout,
            initialized: AtomicBool::new(false),
            known_slots: AtomicUsize::new(0),
        }
    }

    /// Returns the number of slots seen on the last successful enumeration.
    #[must_use]
    pub fn known_slots(&self) -> usize {
        self.known_slots.load(Ordering::Acquire)
    }

    /// Runs one driver call on the blocking pool under the configured timeout.
    ///
    /// The outer error is the timeout or a panicked call; the inner result
    /// is the driver's own answer.
    async fn call<T, F>(&self, operation: &'static str, f: F) -> SignerResult<Result<T, DriverError>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn HardwareModuleDriver) -> Result<T, DriverError> + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        let handle = tokio::task::spawn_blocking(move || f(driver.as_ref()));
        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_err)) => Err(SignerError::driver_with_source(
                &self.module_type,
                format!("{operation} panicked"),
                join_err,
            )),
            Err(_elapsed) => Err(SignerError::timeout(&self.module_type, operation, self.timeout)),
        }
    }

    fn slot_allowed(&self, slot: SlotHandle) -> bool {
        self.conf.slot_ids.as_ref().is_none_or(|ids| ids.contains(&slot.0))
    }
}

#[async_trait]
impl ModuleDriver for HardwareDriver {
    fn module_type(&self) -> &str {
        &self.module_type
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[tracing::instrument(skip(self), fields(module = %self.module_type))]
    async fn initialize(&self) -> SignerResult<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let options = InitializeOptions::from(&self.conf);
        tracing::info!(library = %options.library.display(), "initializing hardware module");
        self.call("initialize", move |driver| driver.initialize(&options)).await?.map_err(|err| {
            SignerError::module_init_with_source(&self.module_type, "driver initialize failed", err)
        })?;

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(module = %self.module_type))]
    async fn deinitialize(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }

        match self.call("deinitialize", |driver| driver.deinitialize()).await {
            Ok(Ok(())) => tracing::info!("hardware module deinitialized"),
            Ok(Err(err)) => tracing::warn!(error = %err, "hardware module deinitialize failed"),
            Err(err) => tracing::warn!(error = %err, "hardware module deinitialize did not complete"),
        }
    }

    #[tracing::instrument(skip(self), fields(module = %self.module_type))]
    async fn list_tokens(&self) -> SignerResult<Vec<DiscoveredToken>> {
        let slots = self.call("list_slots", |driver| driver.list_slots()).await?.map_err(|err| {
            SignerError::driver_with_source(&self.module_type, "slot enumeration failed", err)
        })?;

        let slots: Vec<(usize, SlotHandle)> =
            slots.into_iter().enumerate().filter(|(_, slot)| self.slot_allowed(*slot)).collect();

        let previously_known = self.known_slots();
        if slots.is_empty() && previously_known > 0 {
            return Err(SignerError::no_slots(&self.module_type, previously_known));
        }

        let mut tokens = Vec::with_capacity(slots.len());
        for (slot_index, slot) in &slots {
            let slot = *slot;
            let info =
                self.call("token_info", move |driver| driver.token_info(slot)).await?.map_err(|err| {
                    SignerError::driver_with_source(
                        &self.module_type,
                        format!("reading token info from slot {} failed", slot.0),
                        err,
                    )
                })?;

            let id = self.conf.render_token_id(
                &self.module_type,
                *slot_index,
                &info.serial_number,
                &info.label,
            );
            tracing::debug!(slot = slot.0, token_id = %id, "found token");
            tokens.push(DiscoveredToken {
                id,
                slot_index: Some(*slot_index),
                serial_number: Some(info.serial_number),
                label: Some(info.label),
                read_only: info.write_protected || self.conf.read_only,
                batch_signing_enabled: self.conf.batch_signing_enabled,
                info: BTreeMap::from([
                    ("slot_id".to_owned(), slot.0.to_string()),
                    (PIN_PER_SIGNING_INFO.to_owned(), self.conf.sign_verify_pin.to_string()),
                ]),
            });
        }

        self.known_slots.store(slots.len(), Ordering::Release);
        Ok(tokens)
    }
}

/// [`ModuleDriver`] for the built-in software token store.
#[derive(Debug, Default)]
pub struct SoftwareDriver {
    initialized: AtomicBool,
}

impl SoftwareDriver {
    /// Creates the software driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleDriver for SoftwareDriver {
    fn module_type(&self) -> &str {
        SOFTWARE_MODULE_TYPE
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn initialize(&self) -> SignerResult<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn deinitialize(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    async fn list_tokens(&self) -> SignerResult<Vec<DiscoveredToken>> {
        Ok(vec![DiscoveredToken {
            id: SOFTWARE_TOKEN_ID.to_owned(),
            slot_index: None,
            serial_number: None,
            label: None,
            read_only: false,
            batch_signing_enabled: true,
            info: BTreeMap::new(),
        }])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::testutil::{MockHardwareDriver, StaticHardwareFactory, hardware_conf};

    fn driver(mock: &Arc<MockHardwareDriver>, timeout: Duration) -> HardwareDriver {
        HardwareDriver::new("hsm", hardware_conf(), Arc::clone(mock) as _, timeout)
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let driver = driver(&mock, Duration::from_secs(5));

        driver.initialize().await.unwrap();
        driver.initialize().await.unwrap();

        assert!(driver.is_initialized());
        assert_eq!(mock.initialize_calls(), 1);
    }

    #[tokio::test]
    async fn test_deinitialize_is_idempotent_and_swallows_errors() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        mock.fail_deinitialize(true);
        let driver = driver(&mock, Duration::from_secs(5));

        driver.deinitialize().await;
        assert_eq!(mock.deinitialize_calls(), 0);

        driver.initialize().await.unwrap();
        driver.deinitialize().await;
        driver.deinitialize().await;

        assert!(!driver.is_initialized());
        assert_eq!(mock.deinitialize_calls(), 1);
    }

    #[tokio::test]
    async fn test_initialize_failure_is_module_init() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        mock.fail_next_initializations(1);
        let driver = driver(&mock, Duration::from_secs(5));

        let err = driver.initialize().await.unwrap_err();
        assert!(matches!(err, SignerError::ModuleInit { .. }));
        assert!(!driver.is_initialized());
    }

    #[tokio::test]
    async fn test_list_tokens_renders_ids() {
        let mock = Arc::new(MockHardwareDriver::with_slots(2));
        let driver = driver(&mock, Duration::from_secs(5));

        let tokens = driver.list_tokens().await.unwrap();

        let ids: Vec<_> = tokens.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["hsm0SN0token0", "hsm1SN1token1"]);
        assert_eq!(driver.known_slots(), 2);
    }

    #[tokio::test]
    async fn test_list_tokens_reports_pin_per_signing() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let driver = driver(&mock, Duration::from_secs(5));
        assert_eq!(driver.list_tokens().await.unwrap()[0].info[PIN_PER_SIGNING_INFO], "false");

        let mut conf = hardware_conf();
        conf.sign_verify_pin = true;
        let driver = HardwareDriver::new("hsm", conf, Arc::clone(&mock) as _, Duration::from_secs(5));
        let tokens = driver.list_tokens().await.unwrap();
        assert_eq!(tokens[0].info[PIN_PER_SIGNING_INFO], "true");
        assert_eq!(tokens[0].info["slot_id"], "0");
    }

    #[tokio::test]
    async fn test_stale_slot_drop_is_no_slots() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let driver = driver(&mock, Duration::from_secs(5));
        assert_eq!(driver.list_tokens().await.unwrap().len(), 1);

        mock.set_slots(0);
        let err = driver.list_tokens().await.unwrap_err();

        assert!(matches!(err, SignerError::NoSlots { previously_known: 1, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_module_is_not_an_error_initially() {
        let mock = Arc::new(MockHardwareDriver::with_slots(0));
        let driver = driver(&mock, Duration::from_secs(5));

        assert!(driver.list_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slot_allow_list() {
        let mock = Arc::new(MockHardwareDriver::with_slots(3));
        let mut conf = hardware_conf();
        conf.slot_ids = Some(vec![2]);
        let driver = HardwareDriver::new("hsm", conf, Arc::clone(&mock) as _, Duration::from_secs(5));

        let tokens = driver.list_tokens().await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].slot_index, Some(2));
    }

    #[tokio::test]
    async fn test_write_protected_or_forced_read_only() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        mock.set_write_protected(true);
        let driver = driver(&mock, Duration::from_secs(5));
        assert!(driver.list_tokens().await.unwrap()[0].read_only);

        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        let mut conf = hardware_conf();
        conf.read_only = true;
        let driver = HardwareDriver::new("hsm", conf, Arc::clone(&mock) as _, Duration::from_secs(5));
        assert!(driver.list_tokens().await.unwrap()[0].read_only);
    }

    #[tokio::test]
    async fn test_hung_driver_call_times_out() {
        let mock = Arc::new(MockHardwareDriver::with_slots(1));
        mock.set_call_delay(Duration::from_millis(500));
        let driver = driver(&mock, Duration::from_millis(20));

        let err = driver.list_tokens().await.unwrap_err();
        assert!(matches!(err, SignerError::Timeout { operation: "list_slots", .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_software_driver_single_token() {
        let driver = SoftwareDriver::new();
        driver.initialize().await.unwrap();

        let tokens = driver.list_tokens().await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].id, SOFTWARE_TOKEN_ID);
        assert_eq!(driver.module_type(), SOFTWARE_MODULE_TYPE);
    }

    #[test]
    fn test_create_driver_requires_factory_for_hardware() {
        let descriptor = ModuleDescriptor::hardware("hsm", hardware_conf());
        let Err(err) = create_driver(&descriptor, None, Duration::from_secs(1)) else {
            panic!("expected an error without a hardware factory");
        };
        assert!(matches!(err, SignerError::ModuleInit { .. }));

        let factory: Arc<dyn HardwareDriverFactory> =
            Arc::new(StaticHardwareFactory::new(Arc::new(MockHardwareDriver::with_slots(1))));
        let driver = create_driver(&descriptor, Some(&factory), Duration::from_secs(1)).unwrap();
        assert_eq!(driver.module_type(), "hsm");

        let driver = create_driver(&ModuleDescriptor::software(), None, Duration::from_secs(1)).unwrap();
        assert_eq!(driver.module_type(), SOFTWARE_MODULE_TYPE);
    }
}
