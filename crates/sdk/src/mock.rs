//! In-process lookupd and nsqd doubles for integration testing.
//!
//! - [`MockLookupd`] serves `/listlookup` and `/lookup` over HTTP (axum)
//!   with controllable node lists, producers and failure injection.
//! - [`MockNsqd`] speaks the broker TCP protocol, either on a real listener
//!   or over any in-memory stream, and records every command it receives.
//! - [`MemoryConnector`] is a [`BrokerConnector`] that routes each address
//!   to an in-memory [`MockNsqd`].
//!
//! # Example
//!
//! ```no_run
//! use nsq_sdk::{Address, mock::{MockLookupd, MockNsqd}};
//!
//! #[tokio::test]
//! async fn test_lookup() {
//!     let lookupd = MockLookupd::start().await.unwrap();
//!     let broker = MockNsqd::start().await.unwrap();
//!
//!     lookupd.set_producers("orders", vec![broker.address().clone()]);
//!     broker.publish("hello");
//! }
//! ```

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpListener,
    sync::oneshot,
};
use tokio_util::{
    codec::Framed,
    sync::{CancellationToken, DropGuard},
};

use crate::{
    address::Address,
    connection::{
        BrokerConnection, BrokerConnector, CLOSE_WAIT, Command, CommandCodec, Frame, HEARTBEAT,
        MAGIC_V2, MessageId, RawMessage, SessionRequest,
    },
    error::{ConnectionSnafu, Result, TimeoutSnafu},
};

/// Version reported by mock brokers.
const MOCK_BROKER_VERSION: &str = "1.2.1";

/// How often a mock broker session checks for deliverable messages.
const DELIVERY_POLL: Duration = Duration::from_millis(5);

async fn bind_local() -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|e| {
        ConnectionSnafu { message: format!("Failed to bind: {e}") }.build()
    })?;
    let local_addr = listener.local_addr().map_err(|e| {
        ConnectionSnafu { message: format!("Failed to get local addr: {e}") }.build()
    })?;
    Ok((listener, local_addr))
}

// =============================================================================
// MockLookupd
// =============================================================================

#[derive(Debug)]
struct LookupdState {
    address: Address,
    nodes: RwLock<Option<Vec<Address>>>,
    producers: RwLock<HashMap<String, Vec<Address>>>,
    legacy: AtomicBool,
    omit_nodes: AtomicBool,
    wrap_in_data: AtomicBool,
    /// Status to answer every request with; 0 disables.
    fail_status: AtomicU16,
    delay_ms: AtomicU64,
    listlookup_count: AtomicUsize,
    lookup_count: AtomicUsize,
}

impl LookupdState {
    async fn before_request(&self) -> Option<Response> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let status = self.fail_status.load(Ordering::SeqCst);
        if status == 0 {
            return None;
        }
        let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Some((code, Json(json!({"message": "INJECTED_FAILURE"}))).into_response())
    }
}

/// Mock directory node.
///
/// By default `/listlookup` reports this node as the cluster's only member
/// and `/lookup` answers 404 for every topic.
pub struct MockLookupd {
    state: Arc<LookupdState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockLookupd {
    /// Starts a mock lookupd on an ephemeral localhost port.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Connection` if binding fails.
    pub async fn start() -> Result<Self> {
        let (listener, local_addr) = bind_local().await?;

        let state = Arc::new(LookupdState {
            address: Address::new(local_addr.ip().to_string(), local_addr.port(), ""),
            nodes: RwLock::new(None),
            producers: RwLock::new(HashMap::new()),
            legacy: AtomicBool::new(false),
            omit_nodes: AtomicBool::new(false),
            wrap_in_data: AtomicBool::new(false),
            fail_status: AtomicU16::new(0),
            delay_ms: AtomicU64::new(0),
            listlookup_count: AtomicUsize::new(0),
            lookup_count: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/listlookup", get(list_lookup))
            .route("/lookup", get(lookup))
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!("Mock lookupd error: {}", e);
            }
        });

        Ok(Self { state, shutdown_tx: Some(shutdown_tx) })
    }

    /// Returns the HTTP address of this node.
    #[must_use]
    pub fn address(&self) -> Address {
        self.state.address.clone()
    }

    /// Sets the nodes reported by `/listlookup`.
    pub fn set_lookupd_nodes(&self, nodes: Vec<Address>) {
        *self.state.nodes.write() = Some(nodes);
    }

    /// Makes `/listlookup` answer 404, as seeds without the endpoint do.
    pub fn set_legacy(&self, legacy: bool) {
        self.state.legacy.store(legacy, Ordering::SeqCst);
    }

    /// Makes `/listlookup` answer without a `lookupdnodes` field.
    pub fn set_omit_nodes(&self, omit: bool) {
        self.state.omit_nodes.store(omit, Ordering::SeqCst);
    }

    /// Sets the brokers `/lookup` reports for `topic`.
    pub fn set_producers(&self, topic: &str, brokers: Vec<Address>) {
        self.state.producers.write().insert(topic.to_owned(), brokers);
    }

    /// Forgets `topic`, so `/lookup` answers 404 for it.
    pub fn remove_topic(&self, topic: &str) {
        self.state.producers.write().remove(topic);
    }

    /// Wraps `/lookup` responses in a `data` envelope.
    pub fn set_wrap_in_data(&self, wrap: bool) {
        self.state.wrap_in_data.store(wrap, Ordering::SeqCst);
    }

    /// Answers every request with `status`; `None` restores normal behavior.
    pub fn set_fail_with(&self, status: Option<u16>) {
        self.state.fail_status.store(status.unwrap_or(0), Ordering::SeqCst);
    }

    /// Delays every response.
    ///
    /// Sets to 0 to disable delay.
    pub fn inject_delay(&self, millis: u64) {
        self.state.delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Returns the number of `/listlookup` requests received.
    pub fn listlookup_count(&self) -> usize {
        self.state.listlookup_count.load(Ordering::SeqCst)
    }

    /// Returns the number of `/lookup` requests received.
    pub fn lookup_count(&self) -> usize {
        self.state.lookup_count.load(Ordering::SeqCst)
    }

    /// Shuts down the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockLookupd {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for MockLookupd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockLookupd").field("address", &self.state.address).finish()
    }
}

async fn list_lookup(State(state): State<Arc<LookupdState>>) -> Response {
    state.listlookup_count.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = state.before_request().await {
        return response;
    }

    if state.legacy.load(Ordering::SeqCst) {
        return (StatusCode::NOT_FOUND, "404 page not found").into_response();
    }
    if state.omit_nodes.load(Ordering::SeqCst) {
        return Json(json!({"status": "ok"})).into_response();
    }

    let nodes = state.nodes.read().clone().unwrap_or_else(|| vec![state.address.clone()]);
    let nodes: Vec<Value> = nodes
        .iter()
        .map(|node| {
            json!({
                "ID": node.to_string(),
                "NodeIP": node.host(),
                "TcpPort": node.port().saturating_sub(1).to_string(),
                "HttpPort": node.port().to_string(),
            })
        })
        .collect();

    Json(json!({"lookupdnodes": nodes})).into_response()
}

async fn lookup(
    State(state): State<Arc<LookupdState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.lookup_count.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = state.before_request().await {
        return response;
    }

    let brokers = params.get("topic").and_then(|topic| state.producers.read().get(topic).cloned());
    let Some(brokers) = brokers else {
        return (StatusCode::NOT_FOUND, Json(json!({"message": "TOPIC_NOT_FOUND"}))).into_response();
    };

    let producers: Vec<Value> = brokers
        .iter()
        .map(|broker| {
            json!({
                "remote_address": broker.to_string(),
                "hostname": broker.host(),
                "broadcast_address": broker.host(),
                "tcp_port": broker.port(),
                "http_port": broker.port().saturating_add(1),
                "version": broker.version(),
            })
        })
        .collect();

    if state.wrap_in_data.load(Ordering::SeqCst) {
        Json(json!({
            "status_code": 200,
            "status_txt": "OK",
            "data": {"channels": [], "producers": producers},
        }))
        .into_response()
    } else {
        Json(json!({"channels": [], "producers": producers})).into_response()
    }
}

// =============================================================================
// MockNsqd
// =============================================================================

#[derive(Debug, Default)]
struct BrokerState {
    features: RwLock<Value>,
    reject_subscribe: AtomicBool,
    ignore_close: AtomicBool,
    heartbeat_interval: RwLock<Option<Duration>>,
    pending: Mutex<VecDeque<Bytes>>,
    next_id: AtomicU64,
    identify_bodies: Mutex<Vec<Value>>,
    subscriptions: Mutex<Vec<(String, String)>>,
    ready_history: Mutex<Vec<i64>>,
    finished: Mutex<Vec<MessageId>>,
    requeued: Mutex<Vec<MessageId>>,
    touched: Mutex<Vec<MessageId>>,
    nop_count: AtomicUsize,
    close_count: AtomicUsize,
    session_count: AtomicUsize,
    active_sessions: AtomicUsize,
}

/// Per-session delivery state.
#[derive(Debug, Default)]
struct Session {
    subscribed: bool,
    ready: i64,
    in_flight: HashSet<MessageId>,
}

impl BrokerState {
    fn identify_response(&self, body: &[u8]) -> Frame {
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            self.identify_bodies.lock().push(value);
        }

        let mut response = json!({
            "max_rdy_count": 2500,
            "version": MOCK_BROKER_VERSION,
            "max_msg_timeout": 900_000,
            "msg_timeout": 60_000,
            "tls_v1": false,
            "deflate": false,
            "snappy": false,
            "auth_required": false,
        });
        if let (Some(base), Some(overrides)) =
            (response.as_object_mut(), self.features.read().as_object())
        {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
        }
        Frame::Response(Bytes::from(response.to_string()))
    }

    fn handle(&self, command: Command, session: &mut Session) -> Vec<Frame> {
        match command {
            Command::Identify(body) => vec![self.identify_response(&body)],
            Command::Subscribe { topic, channel } => {
                if self.reject_subscribe.load(Ordering::SeqCst) {
                    return vec![Frame::Error(Bytes::from_static(b"E_INVALID cannot subscribe"))];
                }
                self.subscriptions.lock().push((topic, channel));
                session.subscribed = true;
                vec![Frame::Response(Bytes::from_static(b"OK"))]
            },
            Command::Ready(count) => {
                self.ready_history.lock().push(count);
                session.ready = count;
                self.deliver(session)
            },
            Command::Finish(id) => {
                session.in_flight.remove(&id);
                self.finished.lock().push(id);
                self.deliver(session)
            },
            Command::Requeue { id, .. } => {
                // Requeued messages are recorded, not redelivered.
                session.in_flight.remove(&id);
                self.requeued.lock().push(id);
                self.deliver(session)
            },
            Command::Touch(id) => {
                self.touched.lock().push(id);
                Vec::new()
            },
            Command::Nop => {
                self.nop_count.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            },
            Command::Close => {
                self.close_count.fetch_add(1, Ordering::SeqCst);
                session.ready = 0;
                if self.ignore_close.load(Ordering::SeqCst) {
                    Vec::new()
                } else {
                    vec![Frame::Response(Bytes::from_static(CLOSE_WAIT))]
                }
            },
        }
    }

    fn deliver(&self, session: &mut Session) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !session.subscribed {
            return frames;
        }

        let mut pending = self.pending.lock();
        while (session.in_flight.len() as i64) < session.ready {
            let Some(body) = pending.pop_front() else { break };
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let mut id = [0u8; 16];
            id.copy_from_slice(format!("{n:016x}").as_bytes());
            let id = MessageId::new(id);

            session.in_flight.insert(id);
            frames.push(Frame::Message(RawMessage { timestamp: 0, attempts: 1, id, body }));
        }
        frames
    }
}

async fn serve_session<S>(state: Arc<BrokerState>, mut io: S, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut magic = [0u8; 4];
    if io.read_exact(&mut magic).await.is_err() || &magic != MAGIC_V2 {
        return;
    }

    state.session_count.fetch_add(1, Ordering::SeqCst);
    state.active_sessions.fetch_add(1, Ordering::SeqCst);

    let heartbeat = *state.heartbeat_interval.read();
    let mut heartbeat_tick = tokio::time::interval(heartbeat.unwrap_or(Duration::from_secs(3600)));
    heartbeat_tick.tick().await;
    let mut delivery_tick = tokio::time::interval(DELIVERY_POLL);

    let mut framed = Framed::new(io, CommandCodec);
    let mut session = Session::default();

    'session: loop {
        let outgoing = tokio::select! {
            () = shutdown.cancelled() => break,
            command = framed.next() => match command {
                Some(Ok(command)) => state.handle(command, &mut session),
                _ => break,
            },
            _ = heartbeat_tick.tick(), if heartbeat.is_some() && session.subscribed => {
                vec![Frame::Response(Bytes::from_static(HEARTBEAT))]
            },
            _ = delivery_tick.tick(), if session.subscribed => state.deliver(&mut session),
        };

        for frame in outgoing {
            if framed.send(frame).await.is_err() {
                break 'session;
            }
        }
    }

    state.active_sessions.fetch_sub(1, Ordering::SeqCst);
}

/// Mock broker.
///
/// Clones share state. Messages published with [`publish`](Self::publish)
/// are delivered to subscribed sessions within their ready count. Requeued
/// messages are recorded and not redelivered.
#[derive(Clone)]
pub struct MockNsqd {
    state: Arc<BrokerState>,
    address: Address,
    shutdown: CancellationToken,
    _guard: Arc<DropGuard>,
}

impl MockNsqd {
    /// Creates a broker with no listener; sessions are attached with
    /// [`serve`](Self::serve).
    #[must_use]
    pub fn detached(address: Address) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            state: Arc::new(BrokerState::default()),
            address,
            _guard: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
        }
    }

    /// Starts a broker listening on an ephemeral localhost port.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Connection` if binding fails.
    pub async fn start() -> Result<Self> {
        let (listener, local_addr) = bind_local().await?;
        let broker = Self::detached(Address::new(
            local_addr.ip().to_string(),
            local_addr.port(),
            MOCK_BROKER_VERSION,
        ));

        let state = broker.state.clone();
        let shutdown = broker.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_session(state.clone(), stream, shutdown.clone()));
                    },
                    Err(e) => {
                        tracing::error!("Mock nsqd accept error: {}", e);
                        break;
                    },
                }
            }
        });

        Ok(broker)
    }

    /// Serves one session over `io`.
    pub fn serve<S>(&self, io: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::spawn(serve_session(self.state.clone(), io, self.shutdown.clone()));
    }

    /// Returns the broker address.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Overrides fields of the IDENTIFY response.
    pub fn set_features(&self, features: Value) {
        *self.state.features.write() = features;
    }

    /// Makes `SUB` fail with `E_INVALID`.
    pub fn reject_subscribe(&self, reject: bool) {
        self.state.reject_subscribe.store(reject, Ordering::SeqCst);
    }

    /// Makes `CLS` go unanswered.
    pub fn ignore_close(&self, ignore: bool) {
        self.state.ignore_close.store(ignore, Ordering::SeqCst);
    }

    /// Sets the heartbeat interval for sessions started afterwards; `None`
    /// sends no heartbeats.
    pub fn set_heartbeat_interval(&self, interval: Option<Duration>) {
        *self.state.heartbeat_interval.write() = interval;
    }

    /// Queues a message for delivery.
    pub fn publish(&self, body: impl Into<Bytes>) {
        self.state.pending.lock().push_back(body.into());
    }

    /// Returns the number of messages not yet delivered.
    pub fn pending_count(&self) -> usize {
        self.state.pending.lock().len()
    }

    /// Returns the IDENTIFY bodies received, in order.
    pub fn identify_bodies(&self) -> Vec<Value> {
        self.state.identify_bodies.lock().clone()
    }

    /// Returns the `(topic, channel)` pairs subscribed, in order.
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.state.subscriptions.lock().clone()
    }

    /// Returns every RDY count received, in order.
    pub fn ready_history(&self) -> Vec<i64> {
        self.state.ready_history.lock().clone()
    }

    /// Returns the most recent RDY count received.
    pub fn last_ready(&self) -> Option<i64> {
        self.state.ready_history.lock().last().copied()
    }

    /// Returns the ids finished, in order.
    pub fn finished(&self) -> Vec<MessageId> {
        self.state.finished.lock().clone()
    }

    /// Returns the ids requeued, in order.
    pub fn requeued(&self) -> Vec<MessageId> {
        self.state.requeued.lock().clone()
    }

    /// Returns the ids touched, in order.
    pub fn touched(&self) -> Vec<MessageId> {
        self.state.touched.lock().clone()
    }

    /// Returns the number of NOPs received.
    pub fn nop_count(&self) -> usize {
        self.state.nop_count.load(Ordering::SeqCst)
    }

    /// Returns the number of CLS commands received.
    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    /// Returns the number of sessions ever opened.
    pub fn session_count(&self) -> usize {
        self.state.session_count.load(Ordering::SeqCst)
    }

    /// Returns the number of sessions currently open.
    pub fn active_sessions(&self) -> usize {
        self.state.active_sessions.load(Ordering::SeqCst)
    }

    /// Stops the listener and drops every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for MockNsqd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockNsqd")
            .field("address", &self.address)
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

// =============================================================================
// MemoryConnector
// =============================================================================

/// [`BrokerConnector`] routing addresses to in-memory brokers.
///
/// Connecting to an address without a registered broker fails like a
/// refused TCP connection.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    brokers: Arc<RwLock<HashMap<Address, MockNsqd>>>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Creates a connector with no brokers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a broker at `address` and returns it.
    pub fn add_broker(&self, address: Address) -> MockNsqd {
        let broker = MockNsqd::detached(address.clone());
        self.brokers.write().insert(address, broker.clone());
        broker
    }

    /// Returns the broker at `address`.
    pub fn broker(&self, address: &Address) -> Option<MockNsqd> {
        self.brokers.read().get(address).cloned()
    }

    /// Unregisters and shuts down the broker at `address`.
    pub fn remove_broker(&self, address: &Address) {
        if let Some(broker) = self.brokers.write().remove(address) {
            broker.shutdown();
        }
    }

    /// Returns the number of connect attempts made.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self, request: SessionRequest) -> Result<BrokerConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let Some(broker) = self.broker(&request.address) else {
            return ConnectionSnafu {
                message: format!("connection refused: {}", request.address),
            }
            .fail();
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        broker.serve(server);

        let limit = request.connect_timeout;
        match tokio::time::timeout(limit, BrokerConnection::handshake(client, request)).await {
            Ok(result) => result,
            Err(_) => TimeoutSnafu {
                duration_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }
            .fail(),
        }
    }
}
