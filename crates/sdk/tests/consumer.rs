//! End-to-end consumer tests over real sockets.
//!
//! Each test starts in-process lookupd and nsqd mocks on ephemeral ports and
//! drives a [`Consumer`] with the default TCP connector.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use nsq_sdk::{
    ClientConfig, Consumer, Message, RefreshConfig, ResolveOutcome, SeedRegistry,
    mock::{MockLookupd, MockNsqd},
};
use nsq_test_utils::assert_eventually;

// ============================================================================
// Helpers
// ============================================================================

fn config(seed: &MockLookupd, capacity: u32) -> ClientConfig {
    ClientConfig::builder()
        .with_lookup_address(seed.address().to_string())
        .with_channel("billing")
        .with_worker_pool_size(capacity)
        .with_drain_timeout(Duration::from_millis(500))
        .with_refresh(RefreshConfig::disabled())
        .build()
        .unwrap()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&Message) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    (count, move |_: &Message| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

// ============================================================================
// Discovery and flow control
// ============================================================================

#[tokio::test]
async fn test_cluster_seed_spreads_capacity_across_brokers() {
    let seed = MockLookupd::start().await.unwrap();
    let peer = MockLookupd::start().await.unwrap();
    seed.set_lookupd_nodes(vec![seed.address(), peer.address()]);

    let b1 = MockNsqd::start().await.unwrap();
    let b2 = MockNsqd::start().await.unwrap();
    let brokers = vec![b1.address().clone(), b2.address().clone()];
    seed.set_producers("orders", brokers.clone());
    peer.set_producers("orders", brokers);

    let config = config(&seed, 12);
    let registry = SeedRegistry::from_config(&config).unwrap();
    let (count, handler) = counter();
    let consumer = Consumer::new(config, registry.clone(), handler).unwrap();

    consumer.subscribe("orders").await.unwrap();
    consumer.start().await.unwrap();

    let resolver = &consumer.resolvers()[0];
    assert_eq!(resolver.resolved(), vec![seed.address(), peer.address()]);
    assert_eq!(consumer.manager().connections("orders").await.len(), 2);
    assert!(
        assert_eventually(Duration::from_secs(2), || {
            b1.last_ready() == Some(6) && b2.last_ready() == Some(6)
        })
        .await
    );

    for i in 0..5 {
        b1.publish(format!("b1-{i}"));
        b2.publish(format!("b2-{i}"));
    }
    assert!(
        assert_eventually(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 10).await,
        "every published message should reach the handler"
    );
    assert!(
        assert_eventually(Duration::from_secs(2), || {
            b1.finished().len() == 5 && b2.finished().len() == 5
        })
        .await
    );

    consumer.close().await;
    assert_eq!(registry.resolver_count(), 0);
    assert!(
        assert_eventually(Duration::from_secs(2), || {
            b1.active_sessions() == 0 && b2.active_sessions() == 0
        })
        .await
    );
}

#[tokio::test]
async fn test_legacy_seed_is_its_own_node() {
    let seed = MockLookupd::start().await.unwrap();
    seed.set_legacy(true);
    let b1 = MockNsqd::start().await.unwrap();
    seed.set_producers("orders", vec![b1.address().clone()]);

    let config = config(&seed, 4);
    let registry = SeedRegistry::from_config(&config).unwrap();
    let (_, handler) = counter();
    let consumer = Consumer::new(config, registry.clone(), handler).unwrap();

    let outcome = consumer.resolvers()[0].resolve(false).await;
    assert_eq!(outcome, ResolveOutcome::LegacyFallback);

    consumer.subscribe("orders").await.unwrap();
    consumer.start().await.unwrap();

    assert_eq!(consumer.resolvers()[0].resolved(), vec![seed.address()]);
    assert_eq!(b1.subscriptions(), vec![("orders".to_owned(), "billing".to_owned())]);
    assert!(assert_eventually(Duration::from_secs(2), || b1.last_ready() == Some(4)).await);

    consumer.close().await;
}

#[tokio::test]
async fn test_topology_change_rebalances_ready() {
    let seed = MockLookupd::start().await.unwrap();
    let b1 = MockNsqd::start().await.unwrap();
    let b2 = MockNsqd::start().await.unwrap();
    seed.set_producers("orders", vec![b1.address().clone(), b2.address().clone()]);

    let config = config(&seed, 12);
    let registry = SeedRegistry::from_config(&config).unwrap();
    let (_, handler) = counter();
    let consumer = Consumer::new(config, registry, handler).unwrap();
    consumer.subscribe("orders").await.unwrap();
    consumer.start().await.unwrap();
    assert!(assert_eventually(Duration::from_secs(2), || b1.last_ready() == Some(6)).await);

    seed.set_producers("orders", vec![b1.address().clone()]);
    let reports = consumer.refresh().await;
    let report = reports[0].1.as_ref().unwrap();

    assert!(report.added.is_empty());
    assert_eq!(report.removed, vec![b2.address().clone()]);
    assert_eq!(b1.session_count(), 1, "surviving session must not be reopened");
    assert!(assert_eventually(Duration::from_secs(2), || b1.last_ready() == Some(12)).await);
    assert_eq!(b2.close_count(), 1);

    consumer.close().await;
}

// ============================================================================
// Shared registry
// ============================================================================

#[tokio::test]
async fn test_consumers_share_one_resolver_per_seed() {
    let seed = MockLookupd::start().await.unwrap();
    let config = config(&seed, 4);
    let registry = SeedRegistry::from_config(&config).unwrap();

    let (_, first_handler) = counter();
    let (_, second_handler) = counter();
    let first = Consumer::new(config.clone(), registry.clone(), first_handler).unwrap();
    let second = Consumer::new(config, registry.clone(), second_handler).unwrap();

    assert_eq!(registry.resolver_count(), 1);
    assert!(Arc::ptr_eq(&first.resolvers()[0], &second.resolvers()[0]));

    assert!(matches!(first.resolvers()[0].resolve(false).await, ResolveOutcome::Merged { .. }));
    assert_eq!(second.resolvers()[0].resolve(false).await, ResolveOutcome::Cached);
    assert_eq!(seed.listlookup_count(), 1, "second resolve should hit the cache");

    first.close().await;
    assert!(registry.contains(&seed.address()));
    second.close().await;
    assert!(!registry.contains(&seed.address()));
    assert!(registry.arena().is_empty());
}
