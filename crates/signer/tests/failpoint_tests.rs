#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p keyward-signer --features failpoints,testutil --test failpoint_tests
//! ```

use std::{sync::Arc, time::Duration};

use keyward_signer::{
    HardwareDriver, MemoryTokenConfStore, MergeOntoFileTokens, ModuleDescriptor, ModuleWorker, SignerError,
    WorkerContext,
    testutil::{MockHardwareDriver, fast_backoff, hardware_conf_with_backoff},
};
use tokio_util::sync::CancellationToken;

fn spawn_worker(
    mock: &Arc<MockHardwareDriver>,
    max_retries: u32,
) -> (keyward_signer::ModuleWorkerHandle, tokio::task::JoinHandle<keyward_signer::SignerResult<()>>) {
    let conf = hardware_conf_with_backoff(fast_backoff(max_retries));
    let driver = Arc::new(HardwareDriver::new("hsm", conf.clone(), Arc::clone(mock) as _, Duration::from_secs(2)));
    let context =
        WorkerContext::new(Arc::new(MemoryTokenConfStore::new()), Arc::new(MergeOntoFileTokens), None);
    let (worker, handle) =
        ModuleWorker::new(ModuleDescriptor::hardware("hsm", conf), driver, context, &CancellationToken::new());
    (handle, tokio::spawn(worker.run()))
}

#[tokio::test]
async fn enumeration_failpoint_is_retried() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("worker-before-list-tokens", "1*return").expect("failed to configure fail point");

    let mock = Arc::new(MockHardwareDriver::with_slots(1));
    let (handle, task) = spawn_worker(&mock, 2);

    handle.refresh().await.expect("refresh should recover after one injected failure");

    assert_eq!(handle.tokens().unwrap().len(), 1);
    assert_eq!(mock.initialize_calls(), 2, "transient failure re-initializes the module");
    handle.stop();
    task.await.unwrap().unwrap();

    scenario.teardown();
}

#[tokio::test]
async fn persistent_enumeration_failpoint_exhausts_budget() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("worker-before-list-tokens", "return").expect("failed to configure fail point");

    let mock = Arc::new(MockHardwareDriver::with_slots(1));
    let (handle, task) = spawn_worker(&mock, 2);

    let err = handle.refresh().await.unwrap_err();

    assert!(matches!(err, SignerError::RetriesExhausted { attempts: 3, .. }));
    assert!(task.await.unwrap().is_err());
    assert_eq!(mock.list_calls(), 0, "the driver is never reached");

    scenario.teardown();
}

#[tokio::test]
async fn enumeration_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    // No fail point configured, enumeration succeeds

    let mock = Arc::new(MockHardwareDriver::with_slots(2));
    let (handle, task) = spawn_worker(&mock, 2);

    handle.refresh().await.unwrap();

    assert_eq!(handle.tokens().unwrap().len(), 2);
    assert_eq!(mock.initialize_calls(), 1);
    handle.stop();
    task.await.unwrap().unwrap();

    scenario.teardown();
}
