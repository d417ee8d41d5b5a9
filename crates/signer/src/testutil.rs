//! Shared test utilities for module supervision tests.
//!
//! This module provides a scriptable hardware driver, a factory handing it
//! out, and recorders for merge notifications and fatal escalations. It is
//! feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! keyward-signer = { path = "../signer", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use keyward_signer::testutil::{MockHardwareDriver, StaticHardwareFactory, hardware_conf};
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    config::BackoffPolicy,
    descriptor::HardwareModuleConf,
    driver::{
        DriverError, HardwareDriverFactory, HardwareModuleDriver, HardwareTokenInfo, InitializeOptions,
        SlotHandle,
    },
    manager::FatalHandler,
    model::Cert,
    worker::MergeListener,
};

/// Library path used by [`hardware_conf`].
pub const MOCK_LIBRARY: &str = "/usr/lib/libmockhsm.so";

/// Hardware settings with fast retries for tests.
#[must_use]
pub fn hardware_conf() -> HardwareModuleConf {
    hardware_conf_with_backoff(fast_backoff(3))
}

/// Hardware settings with the given retry budget.
#[must_use]
pub fn hardware_conf_with_backoff(backoff: BackoffPolicy) -> HardwareModuleConf {
    HardwareModuleConf::builder().library(MOCK_LIBRARY).backoff(backoff).build()
}

/// Backoff policy with millisecond delays and `max_retries` retries.
#[must_use]
#[allow(clippy::expect_used)]
pub fn fast_backoff(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy::builder()
        .max_retries(max_retries)
        .min_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .build()
        .expect("valid backoff policy")
}

#[derive(Debug, Default)]
struct MockState {
    slots: usize,
    write_protected: bool,
    fail_initializations: u32,
    fail_listings: u32,
    fail_deinitialize: bool,
    call_delay: Option<Duration>,
}

/// Scriptable [`HardwareModuleDriver`].
///
/// Slot `i` holds a token with serial `SN{i}` and label `token{i}`. Every
/// call, failed or not, is counted.
#[derive(Debug, Default)]
pub struct MockHardwareDriver {
    state: Mutex<MockState>,
    initialized: AtomicBool,
    initialize_calls: AtomicU32,
    deinitialize_calls: AtomicU32,
    list_calls: AtomicU32,
}

impl MockHardwareDriver {
    /// Creates a driver reporting `slots` occupied slots.
    #[must_use]
    pub fn with_slots(slots: usize) -> Self {
        Self { state: Mutex::new(MockState { slots, ..MockState::default() }), ..Self::default() }
    }

    /// Changes the number of occupied slots.
    pub fn set_slots(&self, slots: usize) {
        self.state.lock().slots = slots;
    }

    /// Reports every token as write protected.
    pub fn set_write_protected(&self, write_protected: bool) {
        self.state.lock().write_protected = write_protected;
    }

    /// Fails the next `count` initialize calls.
    pub fn fail_next_initializations(&self, count: u32) {
        self.state.lock().fail_initializations = count;
    }

    /// Fails the next `count` slot listings.
    pub fn fail_next_listings(&self, count: u32) {
        self.state.lock().fail_listings = count;
    }

    /// Makes deinitialize report an error.
    pub fn fail_deinitialize(&self, fail: bool) {
        self.state.lock().fail_deinitialize = fail;
    }

    /// Blocks every call for `delay`, simulating a hung library.
    pub fn set_call_delay(&self, delay: Duration) {
        self.state.lock().call_delay = Some(delay);
    }

    /// Returns how many times initialize was called.
    #[must_use]
    pub fn initialize_calls(&self) -> u32 {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Returns how many times deinitialize was called.
    #[must_use]
    pub fn deinitialize_calls(&self) -> u32 {
        self.deinitialize_calls.load(Ordering::SeqCst)
    }

    /// Returns how many times the slots were listed.
    #[must_use]
    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Returns `true` between a successful initialize and the next deinitialize.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn delay(&self) {
        let delay = self.state.lock().call_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

impl HardwareModuleDriver for MockHardwareDriver {
    fn initialize(&self, _options: &InitializeOptions) -> Result<(), DriverError> {
        self.delay();
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if state.fail_initializations > 0 {
                state.fail_initializations -= 1;
                return Err(DriverError::new("CKR_DEVICE_ERROR"));
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deinitialize(&self) -> Result<(), DriverError> {
        self.delay();
        self.deinitialize_calls.fetch_add(1, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        if self.state.lock().fail_deinitialize {
            return Err(DriverError::new("CKR_GENERAL_ERROR"));
        }
        Ok(())
    }

    fn list_slots(&self) -> Result<Vec<SlotHandle>, DriverError> {
        self.delay();
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.fail_listings > 0 {
            state.fail_listings -= 1;
            return Err(DriverError::new("CKR_DEVICE_REMOVED"));
        }
        Ok((0..state.slots as u64).map(SlotHandle).collect())
    }

    fn token_info(&self, slot: SlotHandle) -> Result<HardwareTokenInfo, DriverError> {
        self.delay();
        let state = self.state.lock();
        if slot.0 as usize >= state.slots {
            return Err(DriverError::new(format!("slot {} is empty", slot.0)));
        }
        Ok(HardwareTokenInfo {
            serial_number: format!("SN{}", slot.0),
            label: format!("token{}", slot.0),
            write_protected: state.write_protected,
        })
    }
}

/// Factory handing out pre-built mock drivers.
#[derive(Debug)]
pub struct StaticHardwareFactory {
    fallback: Arc<MockHardwareDriver>,
    by_module: HashMap<String, Arc<MockHardwareDriver>>,
}

impl StaticHardwareFactory {
    /// Returns `driver` for every module.
    #[must_use]
    pub fn new(driver: Arc<MockHardwareDriver>) -> Self {
        Self { fallback: driver, by_module: HashMap::new() }
    }

    /// Returns `driver` for `module_type` instead of the fallback.
    #[must_use]
    pub fn with_module(mut self, module_type: impl Into<String>, driver: Arc<MockHardwareDriver>) -> Self {
        self.by_module.insert(module_type.into(), driver);
        self
    }
}

impl HardwareDriverFactory for StaticHardwareFactory {
    fn open(&self, module_type: &str, _conf: &HardwareModuleConf) -> Arc<dyn HardwareModuleDriver> {
        let driver = self.by_module.get(module_type).unwrap_or(&self.fallback);
        Arc::clone(driver) as Arc<dyn HardwareModuleDriver>
    }
}

/// Records certificates reported by merges.
#[derive(Debug, Default)]
pub struct RecordingMergeListener {
    added: Mutex<Vec<(String, String)>>,
}

impl RecordingMergeListener {
    /// Returns the ids of every reported certificate, in order.
    #[must_use]
    pub fn added_cert_ids(&self) -> Vec<String> {
        self.added.lock().iter().map(|(_, cert_id)| cert_id.clone()).collect()
    }

    /// Returns `(module_type, cert_id)` pairs, in order.
    #[must_use]
    pub fn added(&self) -> Vec<(String, String)> {
        self.added.lock().clone()
    }
}

impl MergeListener for RecordingMergeListener {
    fn certs_added(&self, module_type: &str, certs: &[Cert]) {
        self.added.lock().extend(certs.iter().map(|cert| (module_type.to_owned(), cert.id.clone())));
    }
}

/// Records fatal escalations instead of exiting the process.
#[derive(Debug, Default)]
pub struct RecordingFatalHandler {
    escalations: Mutex<Vec<(String, i32)>>,
}

impl RecordingFatalHandler {
    /// Returns `(module_type, exit_code)` pairs, in order.
    #[must_use]
    pub fn escalations(&self) -> Vec<(String, i32)> {
        self.escalations.lock().clone()
    }
}

impl FatalHandler for RecordingFatalHandler {
    fn escalate(&self, module_type: &str, exit_code: i32) {
        self.escalations.lock().push((module_type.to_owned(), exit_code));
    }
}
