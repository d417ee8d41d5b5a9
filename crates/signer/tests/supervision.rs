//! End-to-end supervision scenarios driven through `ModuleManager::run`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use keyward_signer::{
    BackoffPolicy, Cert, FATAL_EXIT_CODE, FileTokenConfStore, Key, MemoryModuleConfSource, MemoryTokenConfStore,
    ModuleDescriptor, ModuleManager, ModuleManagerConfig, SOFTWARE_MODULE_TYPE, SOFTWARE_TOKEN_ID, SignerError,
    Token, TokenConfStore,
    testutil::{
        MockHardwareDriver, RecordingFatalHandler, RecordingMergeListener, StaticHardwareFactory, fast_backoff,
        hardware_conf_with_backoff,
    },
};
use tokio_util::sync::CancellationToken;

const SCENARIO_TIMEOUT: Duration = Duration::from_secs(10);

fn manager_config() -> ModuleManagerConfig {
    ModuleManagerConfig::builder()
        .refresh_interval(Duration::from_millis(20))
        .driver_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

fn hardware_manager(
    mock: &Arc<MockHardwareDriver>,
    max_retries: u32,
    store: Arc<dyn TokenConfStore>,
    fatal: &Arc<RecordingFatalHandler>,
) -> ModuleManager {
    let descriptor = ModuleDescriptor::hardware("hsm", hardware_conf_with_backoff(fast_backoff(max_retries)));
    ModuleManager::builder()
        .config(manager_config())
        .conf_source(Arc::new(MemoryModuleConfSource::new(vec![descriptor])))
        .token_conf(store)
        .hardware(Arc::new(StaticHardwareFactory::new(Arc::clone(mock))))
        .fatal_handler(Arc::clone(fatal) as _)
        .build()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(SCENARIO_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn initialize_failures_beyond_budget_are_fatal() {
    let mock = Arc::new(MockHardwareDriver::with_slots(1));
    mock.fail_next_initializations(3);
    let fatal = Arc::new(RecordingFatalHandler::default());
    let manager = hardware_manager(&mock, 2, Arc::new(MemoryTokenConfStore::new()), &fatal);

    let result = tokio::time::timeout(SCENARIO_TIMEOUT, manager.run(CancellationToken::new()))
        .await
        .expect("manager should escalate");

    match result {
        Err(SignerError::Fatal { module, exit_code }) => {
            assert_eq!(module, "hsm");
            assert_eq!(exit_code, FATAL_EXIT_CODE);
        },
        other => panic!("expected fatal escalation, got {other:?}"),
    }
    assert_eq!(fatal.escalations(), [("hsm".to_owned(), FATAL_EXIT_CODE)]);
    assert_eq!(mock.initialize_calls(), 3, "one attempt plus two retries");
}

#[tokio::test]
async fn initialize_failures_within_budget_recover() {
    let mock = Arc::new(MockHardwareDriver::with_slots(1));
    mock.fail_next_initializations(2);
    let fatal = Arc::new(RecordingFatalHandler::default());
    let store = Arc::new(MemoryTokenConfStore::new());
    let manager = hardware_manager(&mock, 2, Arc::clone(&store) as _, &fatal);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(manager.run(shutdown.clone()));

    wait_until(|| store.save_count() > 0).await;
    shutdown.cancel();

    task.await.unwrap().unwrap();
    assert!(fatal.escalations().is_empty());
    assert_eq!(mock.initialize_calls(), 3);
    assert_eq!(store.tokens()[0].id, "hsm0SN0token0");
}

#[tokio::test]
async fn stale_slot_drop_escalates_after_budget() {
    let mock = Arc::new(MockHardwareDriver::with_slots(1));
    let fatal = Arc::new(RecordingFatalHandler::default());
    let store = Arc::new(MemoryTokenConfStore::new());
    let manager = hardware_manager(&mock, 2, Arc::clone(&store) as _, &fatal);
    let task = tokio::spawn(manager.run(CancellationToken::new()));

    wait_until(|| store.save_count() > 0).await;
    mock.set_slots(0);

    let result = tokio::time::timeout(SCENARIO_TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(SignerError::Fatal { exit_code: FATAL_EXIT_CODE, .. })));
    assert!(!mock.is_initialized(), "driver must be released before escalation");
    assert_eq!(store.tokens().len(), 1, "persisted tokens survive the failed module");
}

#[tokio::test]
async fn software_module_reconciles_with_file_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyconf.json");
    let file_store = FileTokenConfStore::new(&path);
    file_store
        .save(&[Token::builder()
            .id(SOFTWARE_TOKEN_ID)
            .module_id(SOFTWARE_MODULE_TYPE)
            .friendly_name("software token")
            .keys(vec![
                Key::builder()
                    .id("sign-1")
                    .public_key("MIIBIjAN")
                    .certs(vec![Cert::builder().id("cert-1").der(Bytes::from_static(b"\x30\x82")).build()])
                    .build(),
            ])
            .build()])
        .await
        .unwrap();

    let listener = Arc::new(RecordingMergeListener::default());
    let mut manager = ModuleManager::builder()
        .config(manager_config())
        .conf_source(Arc::new(MemoryModuleConfSource::new(vec![ModuleDescriptor::software()])))
        .token_conf(Arc::new(FileTokenConfStore::new(&path)))
        .merge_listener(Arc::clone(&listener) as _)
        .fatal_handler(Arc::new(RecordingFatalHandler::default()))
        .build();

    manager.on_refresh_tick().await.unwrap();

    assert_eq!(listener.added(), [(SOFTWARE_MODULE_TYPE.to_owned(), "cert-1".to_owned())]);
    let tokens = manager.tokens();
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].available);
    assert!(tokens[0].keys[0].available);

    manager.shutdown().await;
    let persisted = FileTokenConfStore::new(&path).load().await.unwrap();
    assert_eq!(persisted[0].friendly_name.as_deref(), Some("software token"));
    assert!(!persisted[0].available, "operational state is not persisted");
}

#[tokio::test]
async fn modules_are_supervised_independently() {
    let healthy = Arc::new(MockHardwareDriver::with_slots(2));
    let flaky = Arc::new(MockHardwareDriver::with_slots(1));
    flaky.fail_next_listings(1);
    let factory = StaticHardwareFactory::new(Arc::clone(&healthy)).with_module("hsm-b", Arc::clone(&flaky));
    let store = Arc::new(MemoryTokenConfStore::new());

    let mut manager = ModuleManager::builder()
        .config(manager_config())
        .conf_source(Arc::new(MemoryModuleConfSource::new(vec![
            ModuleDescriptor::hardware("hsm-a", hardware_conf_with_backoff(fast_backoff(2))),
            ModuleDescriptor::hardware("hsm-b", hardware_conf_with_backoff(fast_backoff(2))),
            ModuleDescriptor::software(),
        ])))
        .token_conf(Arc::clone(&store) as _)
        .hardware(Arc::new(factory))
        .fatal_handler(Arc::new(RecordingFatalHandler::default()))
        .build();

    manager.on_refresh_tick().await.unwrap();

    let mut ids: Vec<String> = manager.tokens().into_iter().map(|t| t.id).collect();
    ids.sort();
    assert_eq!(ids, ["0", "hsm-a0SN0token0", "hsm-a1SN1token1", "hsm-b0SN0token0"]);
    assert_eq!(flaky.initialize_calls(), 2, "flaky module re-initialized once");
    assert_eq!(healthy.initialize_calls(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn cancellation_interrupts_hardware_backoff() {
    let mock = Arc::new(MockHardwareDriver::with_slots(1));
    mock.fail_next_listings(4);
    let slow_backoff = BackoffPolicy::builder()
        .max_retries(4)
        .min_delay(Duration::from_millis(500))
        .max_delay(Duration::from_millis(500))
        .build()
        .unwrap();
    let store = Arc::new(MemoryTokenConfStore::new());
    let manager = ModuleManager::builder()
        .config(manager_config())
        .conf_source(Arc::new(MemoryModuleConfSource::new(vec![
            ModuleDescriptor::hardware("hsm", hardware_conf_with_backoff(slow_backoff)),
            ModuleDescriptor::software(),
        ])))
        .token_conf(Arc::clone(&store) as _)
        .hardware(Arc::new(StaticHardwareFactory::new(Arc::clone(&mock))))
        .fatal_handler(Arc::new(RecordingFatalHandler::default()))
        .build();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(manager.run(shutdown.clone()));

    wait_until(|| store.save_count() > 0).await;
    assert_eq!(store.tokens()[0].module_id, SOFTWARE_MODULE_TYPE, "software persisted while hsm backs off");
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_millis(400), task)
        .await
        .expect("run must return without finishing the backoff");
    result.unwrap().unwrap();
    assert!(mock.list_calls() < 5, "backoff loop stopped early");
    assert!(!mock.is_initialized());
}

#[tokio::test]
async fn run_escalates_hardware_module_without_driver() {
    let fatal = Arc::new(RecordingFatalHandler::default());
    let manager = ModuleManager::builder()
        .config(manager_config())
        .conf_source(Arc::new(MemoryModuleConfSource::new(vec![
            ModuleDescriptor::software(),
            ModuleDescriptor::hardware("hsm", hardware_conf_with_backoff(fast_backoff(2))),
        ])))
        .token_conf(Arc::new(MemoryTokenConfStore::new()))
        .fatal_handler(Arc::clone(&fatal) as _)
        .build();

    let result = tokio::time::timeout(SCENARIO_TIMEOUT, manager.run(CancellationToken::new()))
        .await
        .expect("manager should escalate");

    assert!(matches!(result, Err(SignerError::Fatal { exit_code: FATAL_EXIT_CODE, .. })));
    assert_eq!(fatal.escalations(), [("hsm".to_owned(), FATAL_EXIT_CODE)]);
}
