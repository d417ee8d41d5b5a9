//! Stress tests for the signing-context cache under concurrent lookups and
//! invalidations.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use keyward_keyconf::{
    ClientId, SigningContextCache,
    testutil::{CountingKeyInfoSource, ManualClock, SwitchableServerIdentity},
};
use tokio::task::JoinSet;

const CLIENTS: usize = 16;
const TASKS: usize = 64;
const LOOKUPS_PER_TASK: usize = 200;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore] // Run with --ignored
async fn lookups_survive_invalidation_churn() {
    let clock = Arc::new(ManualClock::default());
    let source = Arc::new(CountingKeyInfoSource::new(Arc::clone(&clock) as _));
    let cache = Arc::new(
        SigningContextCache::builder()
            .source(Arc::clone(&source) as _)
            .identity(Arc::new(SwitchableServerIdentity::new("EE/COM/1/ss1")))
            .clock(clock as _)
            .build(),
    );

    let invalidator = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_millis(2)).await;
                cache.invalidate_all().await;
            }
        })
    };

    let mut tasks = JoinSet::new();
    for task in 0..TASKS {
        let cache = Arc::clone(&cache);
        tasks.spawn(async move {
            for lookup in 0..LOOKUPS_PER_TASK {
                let client = ClientId::new(format!("EE/GOV/{}", (task + lookup) % CLIENTS));
                let context = cache.get_signing_context(&client).await.unwrap();
                assert_eq!(context.key_id(), format!("sign-{client}"));
                if lookup % 20 == 0 {
                    assert!(cache.get_auth_key().await.is_some());
                }
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }
    invalidator.await.unwrap();

    let calls = source.member_calls() as usize;
    assert!(calls >= CLIENTS, "every client is fetched at least once");
    assert!(calls < TASKS * LOOKUPS_PER_TASK, "lookups are served from cache: {calls} fetches");
}
