//! Per-topic broker connection sets and ready-count distribution.
//!
//! # Convergence
//!
//! ```text
//!   resolvers ──pick_one──► lookupd node ──/lookup?topic──► broker set
//!                                                               │
//!              current connections ◄── set difference ──────────┘
//!                 add: connect + IDENTIFY + SUB
//!                 remove: CLS + drain
//!                 keep: untouched
//! ```
//!
//! After every convergence the worker capacity is shared across the live
//! connections of the topic and pushed as `RDY` to those whose target
//! changed.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    address::Address,
    config::{ClientConfig, validate_name},
    connection::{BrokerConnection, BrokerConnector, MessageSink, SessionRequest},
    error::Result,
    identity::{ClientIdentity, DEFAULT_MAX_RDY_COUNT, HandshakeOptions},
    lookup::SeedResolver,
    topology::TopologyClient,
};

/// How the worker capacity is split across connections.
///
/// Each of `N` live connections receives `floor(capacity / N)`, at least 1
/// and at most the smallest `max_rdy_count` negotiated on the topic. With no
/// connection the target is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyPolicy {
    capacity: i64,
}

impl ReadyPolicy {
    /// Creates a policy sharing `capacity` in-flight messages.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self { capacity: i64::from(capacity) }
    }

    /// Returns the total capacity.
    #[must_use]
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Returns the ready count for each of `connections` connections.
    #[must_use]
    pub fn per_connection(&self, connections: usize, max_ready: i64) -> i64 {
        let Ok(n) = i64::try_from(connections) else {
            return 1;
        };
        if n == 0 {
            return 0;
        }
        (self.capacity / n).clamp(1, max_ready.max(1))
    }
}

/// What one convergence pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Newly connected brokers.
    pub added: Vec<Address>,
    /// Brokers whose connection was closed.
    pub removed: Vec<Address>,
    /// Brokers that could not be connected; retried next pass.
    pub failed: Vec<Address>,
}

impl ConvergeReport {
    /// Returns true if the pass changed nothing and nothing failed.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct TopicState {
    connections: BTreeMap<Address, BrokerConnection>,
    unsubscribed: bool,
}

#[derive(Debug)]
struct TopicEntry {
    state: tokio::sync::Mutex<TopicState>,
    ready_target: AtomicI64,
}

impl TopicEntry {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(TopicState::default()),
            ready_target: AtomicI64::new(0),
        }
    }
}

/// Keeps each subscribed topic's broker connections in line with lookupd.
///
/// Convergence and redistribution of one topic are serialized by a
/// per-topic async mutex; different topics proceed independently.
#[derive(Debug)]
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    topology: TopologyClient,
    resolvers: Vec<Arc<SeedResolver>>,
    channel: String,
    options: HandshakeOptions,
    connect_timeout: Duration,
    drain_timeout: Duration,
    policy: ReadyPolicy,
    sink: Option<MessageSink>,
    token: CancellationToken,
    topics: Mutex<HashMap<String, Arc<TopicEntry>>>,
}

impl ConnectionManager {
    /// Creates a manager for the config's channel.
    ///
    /// `resolvers` are consulted in order when a topic is looked up; the
    /// caller keeps ownership of their references.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if the client identity cannot be derived.
    pub fn new(
        config: &ClientConfig,
        resolvers: Vec<Arc<SeedResolver>>,
        topology: TopologyClient,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        let identity = ClientIdentity::from_config(config)?;
        Ok(Self {
            connector,
            topology,
            resolvers,
            channel: config.channel().to_owned(),
            options: HandshakeOptions::new(&identity, config),
            connect_timeout: config.connect_timeout(),
            drain_timeout: config.drain_timeout(),
            policy: ReadyPolicy::new(config.worker_pool_size()),
            sink: None,
            token: CancellationToken::new(),
            topics: Mutex::new(HashMap::new()),
        })
    }

    /// Routes delivered messages to `sink`. Without a sink they are requeued.
    #[must_use]
    pub fn with_sink(mut self, sink: MessageSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Ties topology queries to `token`.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Returns the ready policy.
    #[must_use]
    pub fn policy(&self) -> ReadyPolicy {
        self.policy
    }

    /// Returns the subscribed topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Subscribes to `topic` (if not yet) and converges its connections to
    /// the brokers lookupd reports.
    ///
    /// No lookupd node, or an empty broker list, leaves the current
    /// connections as they are and yields an unchanged report.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` for an invalid topic name, and the topic
    /// lookup's error (after retries) or `SdkError::Cancelled`. Connection
    /// failures are not errors; they are listed in the report.
    pub async fn subscribe(&self, topic: &str) -> Result<ConvergeReport> {
        validate_name("topic", topic)?;
        let entry = self.entry(topic);

        let Some(brokers) = self.topology.discover(&self.resolvers, topic, &self.token).await?
        else {
            debug!(topic, "no lookupd node available, keeping current connections");
            return Ok(ConvergeReport::default());
        };

        if brokers.is_empty() {
            debug!(topic, "lookupd reports no broker, keeping current connections");
            return Ok(ConvergeReport::default());
        }

        Ok(self.converge_entry(topic, &entry, &brokers).await)
    }

    /// Converges `topic`'s connections to exactly `brokers`.
    ///
    /// Connections to brokers outside the set are closed, missing ones are
    /// opened, the rest are kept as they are. Connections found closed are
    /// dropped and reopened. Ready counts are redistributed afterwards.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` for an invalid topic name.
    pub async fn converge(&self, topic: &str, brokers: &[Address]) -> Result<ConvergeReport> {
        validate_name("topic", topic)?;
        let entry = self.entry(topic);
        Ok(self.converge_entry(topic, &entry, brokers).await)
    }

    /// Closes every connection of `topic` and forgets it.
    ///
    /// Returns the number of connections closed.
    pub async fn unsubscribe(&self, topic: &str) -> usize {
        let Some(entry) = self.topics.lock().remove(topic) else {
            return 0;
        };

        let mut state = entry.state.lock().await;
        state.unsubscribed = true;
        entry.ready_target.store(0, Ordering::SeqCst);

        let connections: Vec<BrokerConnection> =
            std::mem::take(&mut state.connections).into_values().collect();
        join_all(connections.iter().map(|connection| connection.close())).await;

        info!(topic, closed = connections.len(), "unsubscribed");
        connections.len()
    }

    /// Unsubscribes every topic.
    pub async fn close(&self) {
        self.token.cancel();
        for topic in self.topics() {
            self.unsubscribe(&topic).await;
        }
    }

    /// Returns `topic`'s live connections, sorted by broker address.
    pub async fn connections(&self, topic: &str) -> Vec<BrokerConnection> {
        let Some(entry) = self.topics.lock().get(topic).cloned() else {
            return Vec::new();
        };
        let state = entry.state.lock().await;
        state.connections.values().filter(|connection| !connection.is_closed()).cloned().collect()
    }

    /// Returns the ready count currently assigned to each of `topic`'s
    /// connections; 0 when the topic has none.
    #[must_use]
    pub fn ready_per_connection(&self, topic: &str) -> i64 {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |entry| entry.ready_target.load(Ordering::SeqCst))
    }

    /// Recomputes `topic`'s ready target and sends `RDY` to connections
    /// whose assignment differs.
    ///
    /// Returns the number of connections updated; a second call without
    /// intervening changes returns 0.
    pub async fn redistribute(&self, topic: &str) -> usize {
        let Some(entry) = self.topics.lock().get(topic).cloned() else {
            return 0;
        };
        let state = entry.state.lock().await;
        redistribute_locked(self.policy, topic, &entry, &state)
    }

    fn entry(&self, topic: &str) -> Arc<TopicEntry> {
        let mut topics = self.topics.lock();
        Arc::clone(topics.entry(topic.to_owned()).or_insert_with(|| Arc::new(TopicEntry::new())))
    }

    async fn converge_entry(
        &self,
        topic: &str,
        entry: &Arc<TopicEntry>,
        brokers: &[Address],
    ) -> ConvergeReport {
        let mut state = entry.state.lock().await;
        let mut report = ConvergeReport::default();
        if state.unsubscribed {
            return report;
        }

        let target: BTreeSet<Address> = brokers.iter().cloned().collect();

        drop_closed(topic, &mut state);

        let stale: Vec<Address> = state
            .connections
            .keys()
            .filter(|address| !target.contains(*address))
            .cloned()
            .collect();
        let mut closing = Vec::with_capacity(stale.len());
        for address in &stale {
            if let Some(connection) = state.connections.remove(address) {
                closing.push(connection);
            }
        }
        join_all(closing.iter().map(|connection| connection.close())).await;
        report.removed = stale;

        let missing: Vec<Address> = target
            .iter()
            .filter(|address| !state.connections.contains_key(*address))
            .cloned()
            .collect();
        let attempts = join_all(missing.iter().map(|address| self.connect(topic, address))).await;
        for (address, attempt) in missing.into_iter().zip(attempts) {
            match attempt {
                Ok(connection) => {
                    self.watch(topic, entry, &connection);
                    state.connections.insert(address.clone(), connection);
                    report.added.push(address);
                },
                Err(e) => {
                    warn!(
                        topic,
                        address = %address,
                        error = %e,
                        "failed to open broker connection"
                    );
                    report.failed.push(address);
                },
            }
        }

        redistribute_locked(self.policy, topic, entry, &state);

        if !report.is_unchanged() {
            info!(
                topic,
                added = report.added.len(),
                removed = report.removed.len(),
                failed = report.failed.len(),
                connections = state.connections.len(),
                "topic converged"
            );
        }
        report
    }

    async fn connect(&self, topic: &str, address: &Address) -> Result<BrokerConnection> {
        let request = SessionRequest {
            address: address.clone(),
            topic: topic.to_owned(),
            channel: self.channel.clone(),
            options: self.options.clone(),
            connect_timeout: self.connect_timeout,
            drain_timeout: self.drain_timeout,
            sink: self.sink.clone(),
        };
        self.connector.connect(request).await
    }

    /// Drops `connection` from the topic and redistributes its credit as
    /// soon as it closes on its own.
    fn watch(&self, topic: &str, entry: &Arc<TopicEntry>, connection: &BrokerConnection) {
        let closed = connection.closed_token();
        let entry = Arc::downgrade(entry);
        let policy = self.policy;
        let topic = topic.to_owned();

        tokio::spawn(async move {
            closed.cancelled().await;
            let Some(entry) = entry.upgrade() else { return };

            let mut state = entry.state.lock().await;
            if state.unsubscribed || drop_closed(&topic, &mut state) == 0 {
                return;
            }
            let updated = redistribute_locked(policy, &topic, &entry, &state);
            info!(
                topic = %topic,
                connections = state.connections.len(),
                updated,
                "broker connection lost, ready counts redistributed"
            );
        });
    }
}

/// Removes closed connections; returns how many were removed.
fn drop_closed(topic: &str, state: &mut TopicState) -> usize {
    let before = state.connections.len();
    state.connections.retain(|address, connection| {
        let alive = !connection.is_closed();
        if !alive {
            debug!(
                topic,
                address = %address,
                reason = ?connection.close_reason(),
                "dropping closed connection"
            );
        }
        alive
    });
    before - state.connections.len()
}

fn redistribute_locked(
    policy: ReadyPolicy,
    topic: &str,
    entry: &TopicEntry,
    state: &TopicState,
) -> usize {
    let live: Vec<&BrokerConnection> =
        state.connections.values().filter(|connection| !connection.is_closed()).collect();
    let max_ready = live
        .iter()
        .map(|connection| connection.max_ready())
        .min()
        .unwrap_or(DEFAULT_MAX_RDY_COUNT);
    let target = policy.per_connection(live.len(), max_ready);
    entry.ready_target.store(target, Ordering::SeqCst);

    let mut updated = 0;
    for connection in live {
        if connection.expected_ready() == target {
            continue;
        }
        match connection.set_ready(target) {
            Ok(()) => updated += 1,
            Err(e) => {
                warn!(topic, address = %connection.address(), error = %e, "failed to send RDY");
            },
        }
    }

    if updated > 0 {
        debug!(topic, ready = target, updated, "ready counts redistributed");
    }
    updated
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use nsq_test_utils::{assert_eventually, assert_eventually_async};
    use serde_json::json;

    use super::*;
    use crate::{
        config::{RefreshConfig, RetryPolicy},
        directory::HttpDirectoryClient,
        lookup::SeedRegistry,
        mock::{MemoryConnector, MockLookupd},
    };

    fn config(capacity: u32) -> ClientConfig {
        ClientConfig::builder()
            .with_lookup_address("127.0.0.1:4161")
            .with_channel("billing")
            .with_worker_pool_size(capacity)
            .with_drain_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn manager(
        capacity: u32,
        connector: &MemoryConnector,
        resolvers: Vec<Arc<SeedResolver>>,
    ) -> ConnectionManager {
        let directory = Arc::new(HttpDirectoryClient::new(Duration::from_secs(2)).unwrap());
        let topology = TopologyClient::new(directory, RetryPolicy::no_retry());
        ConnectionManager::new(&config(capacity), resolvers, topology, Arc::new(connector.clone()))
            .unwrap()
    }

    fn broker(name: &str) -> Address {
        Address::new(name, 4150, "")
    }

    #[test]
    fn test_policy_shares_capacity() {
        let policy = ReadyPolicy::new(12);
        assert_eq!(policy.per_connection(0, 2500), 0);
        assert_eq!(policy.per_connection(1, 2500), 12);
        assert_eq!(policy.per_connection(2, 2500), 6);
        assert_eq!(policy.per_connection(5, 2500), 2);
    }

    #[test]
    fn test_policy_never_starves_a_connection() {
        let policy = ReadyPolicy::new(3);
        assert_eq!(policy.per_connection(10, 2500), 1);
    }

    #[test]
    fn test_policy_capped_by_max_ready() {
        let policy = ReadyPolicy::new(10_000);
        assert_eq!(policy.per_connection(1, 2500), 2500);
        assert_eq!(policy.per_connection(1, 0), 1);
    }

    #[tokio::test]
    async fn test_converge_adds_all_brokers_and_distributes() {
        let connector = MemoryConnector::new();
        let b1 = connector.add_broker(broker("b1"));
        let b2 = connector.add_broker(broker("b2"));
        let manager = manager(12, &connector, Vec::new());

        let report = manager.converge("orders", &[broker("b2"), broker("b1")]).await.unwrap();

        assert_eq!(report.added, vec![broker("b1"), broker("b2")]);
        assert!(report.removed.is_empty() && report.failed.is_empty());
        assert_eq!(manager.ready_per_connection("orders"), 6);

        let connections = manager.connections("orders").await;
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].address(), &broker("b1"));
        for connection in &connections {
            assert_eq!(connection.expected_ready(), 6);
            assert_eq!(connection.current_ready(), 6);
        }
        assert!(assert_eventually(Duration::from_secs(1), || b1.last_ready() == Some(6)).await);
        assert!(assert_eventually(Duration::from_secs(1), || b2.last_ready() == Some(6)).await);
        assert_eq!(b1.subscriptions(), vec![("orders".to_owned(), "billing".to_owned())]);
    }

    #[tokio::test]
    async fn test_converge_is_set_difference() {
        let connector = MemoryConnector::new();
        let a = connector.add_broker(broker("a"));
        connector.add_broker(broker("b"));
        connector.add_broker(broker("c"));
        let manager = manager(12, &connector, Vec::new());

        manager.converge("orders", &[broker("a"), broker("b")]).await.unwrap();
        let before = manager.connections("orders").await;
        let b_before = before.iter().find(|c| c.address() == &broker("b")).unwrap().clone();
        let a_before = before.iter().find(|c| c.address() == &broker("a")).unwrap().clone();

        let report = manager.converge("orders", &[broker("b"), broker("c")]).await.unwrap();

        assert_eq!(report.added, vec![broker("c")]);
        assert_eq!(report.removed, vec![broker("a")]);
        assert!(a_before.is_closed());
        assert_eq!(a.close_count(), 1);

        let after = manager.connections("orders").await;
        let addresses: Vec<&Address> = after.iter().map(BrokerConnection::address).collect();
        assert_eq!(addresses, vec![&broker("b"), &broker("c")]);
        assert!(after[0].same_session(&b_before));
    }

    #[tokio::test]
    async fn test_redistribute_is_idempotent() {
        let connector = MemoryConnector::new();
        let b1 = connector.add_broker(broker("b1"));
        connector.add_broker(broker("b2"));
        let manager = manager(12, &connector, Vec::new());
        manager.converge("orders", &[broker("b1"), broker("b2")]).await.unwrap();
        assert!(assert_eventually(Duration::from_secs(1), || b1.ready_history().len() == 1).await);

        assert_eq!(manager.redistribute("orders").await, 0);
        assert_eq!(manager.redistribute("orders").await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b1.ready_history(), vec![6]);
        assert_eq!(manager.ready_per_connection("orders"), 6);
    }

    #[tokio::test]
    async fn test_removal_raises_survivor_share() {
        let connector = MemoryConnector::new();
        let b1 = connector.add_broker(broker("b1"));
        connector.add_broker(broker("b2"));
        let manager = manager(12, &connector, Vec::new());
        manager.converge("orders", &[broker("b1"), broker("b2")]).await.unwrap();

        manager.converge("orders", &[broker("b1")]).await.unwrap();

        assert_eq!(manager.ready_per_connection("orders"), 12);
        assert!(assert_eventually(Duration::from_secs(1), || b1.last_ready() == Some(12)).await);
    }

    #[tokio::test]
    async fn test_failed_handshake_is_reported_and_retried() {
        let connector = MemoryConnector::new();
        connector.add_broker(broker("b1"));
        let b2 = connector.add_broker(broker("b2"));
        b2.reject_subscribe(true);
        let manager = manager(12, &connector, Vec::new());

        let target = [broker("b1"), broker("b2"), broker("gone")];
        let report = manager.converge("orders", &target).await.unwrap();

        assert_eq!(report.added, vec![broker("b1")]);
        assert_eq!(report.failed, vec![broker("b2"), broker("gone")]);
        assert_eq!(manager.ready_per_connection("orders"), 12);

        b2.reject_subscribe(false);
        let report = manager.converge("orders", &target).await.unwrap();
        assert_eq!(report.added, vec![broker("b2")]);
        assert_eq!(report.failed, vec![broker("gone")]);
        assert_eq!(manager.ready_per_connection("orders"), 6);
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let connector = MemoryConnector::new();
        let b1 = connector.add_broker(broker("b1"));
        let manager = manager(4, &connector, Vec::new());
        manager.converge("orders", &[broker("b1")]).await.unwrap();
        let original = manager.connections("orders").await.remove(0);

        b1.shutdown();
        original.closed().await;
        let b1 = connector.add_broker(broker("b1"));

        let report = manager.converge("orders", &[broker("b1")]).await.unwrap();
        assert_eq!(report.added, vec![broker("b1")]);
        let replacement = manager.connections("orders").await.remove(0);
        assert!(!replacement.same_session(&original));
        assert!(assert_eventually(Duration::from_secs(1), || b1.last_ready() == Some(4)).await);
    }

    #[tokio::test]
    async fn test_lost_connection_returns_credit_to_survivors() {
        let connector = MemoryConnector::new();
        let b1 = connector.add_broker(broker("b1"));
        let b2 = connector.add_broker(broker("b2"));
        let manager = manager(12, &connector, Vec::new());
        manager.converge("orders", &[broker("b1"), broker("b2")]).await.unwrap();
        let lost = manager.connections("orders").await.remove(0);
        assert_eq!(lost.address(), &broker("b1"));

        b1.shutdown();
        lost.closed().await;

        let manager = &manager;
        assert!(
            assert_eventually_async(Duration::from_secs(2), || async move {
                manager.connections("orders").await.len() == 1
            })
            .await,
            "closed connection should leave the topic without a convergence pass"
        );
        assert_eq!(manager.ready_per_connection("orders"), 12);
        assert!(assert_eventually(Duration::from_secs(1), || b2.last_ready() == Some(12)).await);
        assert_eq!(manager.redistribute("orders").await, 0);
    }

    #[tokio::test]
    async fn test_ready_capped_by_negotiated_max() {
        let connector = MemoryConnector::new();
        let b1 = connector.add_broker(broker("b1"));
        b1.set_features(json!({"max_rdy_count": 3}));
        let manager = manager(100, &connector, Vec::new());

        manager.converge("orders", &[broker("b1")]).await.unwrap();
        assert_eq!(manager.ready_per_connection("orders"), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_everything() {
        let connector = MemoryConnector::new();
        connector.add_broker(broker("b1"));
        connector.add_broker(broker("b2"));
        let manager = manager(12, &connector, Vec::new());
        manager.converge("orders", &[broker("b1"), broker("b2")]).await.unwrap();
        let connections = manager.connections("orders").await;

        assert_eq!(manager.unsubscribe("orders").await, 2);
        assert!(connections.iter().all(BrokerConnection::is_closed));
        assert!(manager.connections("orders").await.is_empty());
        assert_eq!(manager.ready_per_connection("orders"), 0);
        assert_eq!(manager.unsubscribe("orders").await, 0);
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let connector = MemoryConnector::new();
        connector.add_broker(broker("b1"));
        connector.add_broker(broker("b2"));
        let manager = manager(12, &connector, Vec::new());

        manager.converge("orders", &[broker("b1"), broker("b2")]).await.unwrap();
        manager.converge("refunds", &[broker("b1")]).await.unwrap();

        assert_eq!(manager.ready_per_connection("orders"), 6);
        assert_eq!(manager.ready_per_connection("refunds"), 12);
        assert_eq!(manager.topics(), vec!["orders".to_owned(), "refunds".to_owned()]);
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected() {
        let manager = manager(12, &MemoryConnector::new(), Vec::new());
        assert!(manager.converge("bad topic!", &[]).await.is_err());
        assert!(manager.subscribe("").await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_through_lookupd() {
        let lookupd = MockLookupd::start().await.unwrap();
        lookupd.set_producers("orders", vec![broker("b1"), broker("b2")]);
        let directory = Arc::new(HttpDirectoryClient::new(Duration::from_secs(2)).unwrap());
        let registry = SeedRegistry::new(directory, RefreshConfig::disabled()).unwrap();
        let connector = MemoryConnector::new();
        connector.add_broker(broker("b1"));
        connector.add_broker(broker("b2"));
        let manager = manager(12, &connector, vec![registry.acquire(&lookupd.address())]);

        let report = manager.subscribe("orders").await.unwrap();

        assert_eq!(report.added, vec![broker("b1"), broker("b2")]);
        assert_eq!(manager.ready_per_connection("orders"), 6);
    }

    #[tokio::test]
    async fn test_empty_topology_keeps_connections() {
        let lookupd = MockLookupd::start().await.unwrap();
        lookupd.set_producers("orders", vec![broker("b1")]);
        let directory = Arc::new(HttpDirectoryClient::new(Duration::from_secs(2)).unwrap());
        let registry = SeedRegistry::new(directory, RefreshConfig::disabled()).unwrap();
        let connector = MemoryConnector::new();
        connector.add_broker(broker("b1"));
        let manager = manager(12, &connector, vec![registry.acquire(&lookupd.address())]);
        manager.subscribe("orders").await.unwrap();

        lookupd.remove_topic("orders");
        let report = manager.subscribe("orders").await.unwrap();

        assert!(report.is_unchanged());
        assert_eq!(manager.connections("orders").await.len(), 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Every connection gets at least 1, and the total stays within the
        /// capacity whenever the capacity covers one per connection.
        #[test]
        fn prop_ready_share_bounds(
            capacity in 1u32..10_000,
            n in 1usize..200,
            max_ready in 1i64..5000,
        ) {
            let policy = ReadyPolicy::new(capacity);
            let share = policy.per_connection(n, max_ready);

            prop_assert!(share >= 1);
            prop_assert!(share <= max_ready);
            if i64::from(capacity) >= n as i64 {
                prop_assert!(share * n as i64 <= i64::from(capacity));
            }
        }

        /// The share never grows when connections are added.
        #[test]
        fn prop_ready_share_monotonic(capacity in 1u32..10_000, n in 1usize..200) {
            let policy = ReadyPolicy::new(capacity);
            prop_assert!(policy.per_connection(n + 1, 2500) <= policy.per_connection(n, 2500));
        }
    }
}
