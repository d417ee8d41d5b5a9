//! Concurrency stress tests for module workers.
//!
//! These tests hammer worker handles from many tasks to detect deadlocks and
//! lost updates. They are ignored by default:
//!
//! ```bash
//! cargo test -p keyward-signer --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use keyward_signer::{
    Cert, Key, MemoryModuleConfSource, MemoryTokenConfStore, ModuleDescriptor, ModuleManager, OcspResponse,
    SOFTWARE_MODULE_TYPE, SOFTWARE_TOKEN_ID, Token,
    testutil::{MockHardwareDriver, RecordingFatalHandler, StaticHardwareFactory, hardware_conf},
};
use tokio::task::JoinSet;

/// Number of concurrent tasks.
const CONCURRENCY: usize = 16;

/// Operations each task performs.
const OPS_PER_TASK: usize = 50;

fn persisted_software_token() -> Token {
    let certs = (0..CONCURRENCY)
        .map(|i| Cert::builder().id(format!("cert-{i}")).der(Bytes::from(format!("der-{i}"))).build())
        .collect();
    Token::builder()
        .id(SOFTWARE_TOKEN_ID)
        .module_id(SOFTWARE_MODULE_TYPE)
        .keys(vec![Key::builder().id("k").public_key("p").certs(certs).build()])
        .build()
}

// ---------------------------------------------------------------------------
// Test: Parallel OCSP updates interleaved with refresh cycles
// ---------------------------------------------------------------------------

/// Every task repeatedly stores an OCSP response for its own certificate
/// while the manager keeps refreshing. No update may be lost to a refresh.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Run with --ignored
async fn ocsp_updates_survive_concurrent_refreshes() {
    let store = Arc::new(MemoryTokenConfStore::with_tokens(vec![persisted_software_token()]));
    let mut manager = ModuleManager::builder()
        .conf_source(Arc::new(MemoryModuleConfSource::new(vec![ModuleDescriptor::software()])))
        .token_conf(Arc::clone(&store) as _)
        .fatal_handler(Arc::new(RecordingFatalHandler::default()))
        .build();
    manager.on_refresh_tick().await.expect("initial tick");
    let handle = manager.worker(SOFTWARE_MODULE_TYPE).expect("software worker running");

    let mut set = JoinSet::new();
    for task_id in 0..CONCURRENCY {
        let handle = handle.clone();
        set.spawn(async move {
            for _ in 0..OPS_PER_TASK {
                let response =
                    OcspResponse { der: Bytes::from(format!("ocsp-{task_id}")), this_update: Utc::now(), next_update: None };
                let applied = handle
                    .set_ocsp_responses(vec![(format!("cert-{task_id}"), response)])
                    .await
                    .expect("worker should be running");
                assert_eq!(applied, 1);
            }
        });
    }
    for _ in 0..OPS_PER_TASK {
        manager.on_refresh_tick().await.expect("tick should succeed");
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let tokens = manager.tokens();
    for cert in tokens[0].certs() {
        assert!(cert.ocsp_response.is_some(), "response for {} was lost", cert.id);
    }
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: Snapshot readers during configuration churn
// ---------------------------------------------------------------------------

/// Readers take snapshots while hardware modules are added and removed.
/// Every call must return, either with data or with `WorkerStopped`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Run with --ignored
async fn snapshots_during_configuration_churn() {
    let mock = Arc::new(MockHardwareDriver::with_slots(2));
    let source = Arc::new(MemoryModuleConfSource::new(vec![ModuleDescriptor::software()]));
    let mut manager = ModuleManager::builder()
        .conf_source(Arc::clone(&source) as _)
        .token_conf(Arc::new(MemoryTokenConfStore::new()))
        .hardware(Arc::new(StaticHardwareFactory::new(Arc::clone(&mock))))
        .fatal_handler(Arc::new(RecordingFatalHandler::default()))
        .build();
    manager.on_refresh_tick().await.expect("initial tick");

    for round in 0..OPS_PER_TASK {
        let with_hardware = round % 2 == 0;
        let mut descriptors = vec![ModuleDescriptor::software()];
        if with_hardware {
            descriptors.push(ModuleDescriptor::hardware("hsm", hardware_conf()));
        }
        source.set(descriptors);

        let handles: Vec<_> =
            manager.module_types().iter().filter_map(|module| manager.worker(module)).collect();
        let mut readers = JoinSet::new();
        for handle in handles {
            for _ in 0..CONCURRENCY / 4 {
                let handle = handle.clone();
                readers.spawn(async move { handle.tokens().map(|tokens| tokens.len()) });
            }
        }

        tokio::time::timeout(Duration::from_secs(10), manager.on_refresh_tick())
            .await
            .expect("tick should not deadlock")
            .expect("tick should succeed");
        while let Some(result) = readers.join_next().await {
            let _ = result.expect("reader should not panic");
        }

        let expected = if with_hardware { 2 } else { 1 };
        assert_eq!(manager.module_types().len(), expected);
    }

    manager.shutdown().await;
    assert!(!mock.is_initialized());
}
