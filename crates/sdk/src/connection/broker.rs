//! A single subscribed session to a broker.
//!
//! After the handshake the session runs two tasks: a reader that answers
//! heartbeats, enforces the heartbeat deadline and hands messages to the
//! consumer, and a writer that drains the command queue onto the socket.
//! The public handle is cheap to clone; all clones observe one session.

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use snafu::ensure;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, warn};

use super::protocol::{CLOSE_WAIT, Command, Frame, FrameCodec, MAGIC_V2, MessageId, OK, RawMessage};
use crate::{
    address::Address,
    error::{ConnectionClosedSnafu, HandshakeSnafu, Result, SdkError},
    identity::{HandshakeOptions, NegotiatedFeatures},
    message::Message,
};

/// Where a connection delivers the messages it receives.
pub type MessageSink = mpsc::UnboundedSender<Message>;

/// Lifecycle of a broker session.
///
/// `Connecting → Handshaking → Ready → Draining → Closed`, with direct
/// transitions to `Closed` from `Handshaking` and `Ready` on failure.
///
/// A [`BrokerConnection`] only exists once the handshake succeeded, so its
/// [`state`](BrokerConnection::state) starts at `Ready`. `Connecting` and
/// `Handshaking` are the phases a [`BrokerConnector`](super::BrokerConnector)
/// walks through before that; they show up in its logs, and a failure in
/// either surfaces as the connector's error instead of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect in progress.
    Connecting,
    /// IDENTIFY/SUB exchange in progress.
    Handshaking,
    /// Subscribed; accepts RDY and delivers messages.
    Ready,
    /// `CLS` sent; waiting for `CLOSE_WAIT`.
    Draining,
    /// Terminal.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by its owner.
    Requested,
    /// No frame arrived within twice the heartbeat interval.
    HeartbeatMissed,
    /// The broker closed the socket.
    PeerClosed,
    /// The broker sent something undecodable.
    Protocol(String),
    /// Writing to the socket failed.
    Io(String),
}

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Broker TCP address.
    pub address: Address,
    /// Topic to subscribe to.
    pub topic: String,
    /// Channel to subscribe with.
    pub channel: String,
    /// IDENTIFY payload.
    pub options: HandshakeOptions,
    /// Bound on connect plus handshake.
    pub connect_timeout: Duration,
    /// Bound on waiting for `CLOSE_WAIT` during close.
    pub drain_timeout: Duration,
    /// Receiver of delivered messages; messages are requeued when absent.
    pub sink: Option<MessageSink>,
}

/// Handle to a broker session.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    address: Address,
    topic: String,
    channel: String,
    features: NegotiatedFeatures,
    heartbeat: Duration,
    drain_timeout: Duration,
    state: Mutex<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    current_ready: AtomicI64,
    expected_ready: AtomicI64,
    in_flight: AtomicI64,
    delivered: AtomicU64,
    commands: mpsc::UnboundedSender<Command>,
    closed: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl BrokerConnection {
    /// Performs the handshake over `io` and starts the session tasks.
    ///
    /// Sends the protocol magic, `IDENTIFY` and `SUB`. Fails if the broker
    /// rejects either command or negotiates a stream upgrade (TLS, snappy,
    /// deflate) or authentication, none of which this transport performs.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Handshake`] on rejection, or a transport error if
    /// the socket fails.
    pub async fn handshake<S>(mut io: S, request: SessionRequest) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let address = request.address.to_string();
        debug!(address = %address, topic = %request.topic, "handshaking");

        io.write_all(MAGIC_V2).await?;
        let mut framed = Framed::new(io, FrameCodec::default());

        framed.send(Command::Identify(Bytes::from(request.options.to_json()?))).await?;
        let body = expect_response(&mut framed, &address, "IDENTIFY").await?;
        let features = NegotiatedFeatures::parse(&address, &body)?;

        if let Some(upgrade) = features.required_upgrade() {
            return HandshakeSnafu {
                address,
                message: format!(
                    "broker negotiated {upgrade}, which this transport cannot perform"
                ),
            }
            .fail();
        }
        ensure!(
            !features.auth_required,
            HandshakeSnafu { address: address.clone(), message: "broker requires AUTH" }
        );

        framed
            .send(Command::Subscribe {
                topic: request.topic.clone(),
                channel: request.channel.clone(),
            })
            .await?;
        let body = expect_response(&mut framed, &address, "SUB").await?;
        ensure!(
            body.as_ref() == OK,
            HandshakeSnafu {
                address: address.clone(),
                message: format!("unexpected SUB response {}", String::from_utf8_lossy(&body)),
            }
        );

        let heartbeat = features.effective_heartbeat(request.options.heartbeat());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let connection = Self {
            inner: Arc::new(Inner {
                address: request.address,
                topic: request.topic,
                channel: request.channel,
                features,
                heartbeat,
                drain_timeout: request.drain_timeout,
                state: Mutex::new(ConnectionState::Ready),
                close_reason: Mutex::new(None),
                current_ready: AtomicI64::new(0),
                expected_ready: AtomicI64::new(0),
                in_flight: AtomicI64::new(0),
                delivered: AtomicU64::new(0),
                commands,
                closed: closed.clone(),
            }),
        };

        let (frame_sink, frame_stream) = framed.split();
        let weak = Arc::downgrade(&connection.inner);
        tokio::spawn(write_loop(weak.clone(), frame_sink, command_rx, closed.clone()));
        tokio::spawn(read_loop(weak, frame_stream, closed, heartbeat, request.sink));

        info!(
            address = %connection.inner.address,
            topic = %connection.inner.topic,
            max_rdy_count = connection.inner.features.max_rdy_count,
            heartbeat = ?heartbeat,
            "broker session ready"
        );
        Ok(connection)
    }

    /// Returns the broker address.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Returns the subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Returns the subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Returns what the broker negotiated.
    #[must_use]
    pub fn features(&self) -> &NegotiatedFeatures {
        &self.inner.features
    }

    /// Returns the heartbeat interval in force.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.inner.heartbeat
    }

    /// Returns the largest ready count this broker accepts.
    #[must_use]
    pub fn max_ready(&self) -> i64 {
        self.inner.features.max_rdy_count.max(1)
    }

    /// Returns the current state: one of `Ready`, `Draining` or `Closed`.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Returns why the session ended, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Returns true once the session is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Returns the credit left from the last communicated ready count.
    #[must_use]
    pub fn current_ready(&self) -> i64 {
        self.inner.current_ready.load(Ordering::SeqCst)
    }

    /// Returns the ready target assigned by the manager.
    #[must_use]
    pub fn expected_ready(&self) -> i64 {
        self.inner.expected_ready.load(Ordering::SeqCst)
    }

    /// Returns the number of delivered messages not yet finished or requeued.
    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the number of messages delivered on this session.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Returns true if both handles refer to the same session.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queues a command for the writer.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConnectionClosed`] if the session is closed.
    pub fn send(&self, command: Command) -> Result<()> {
        ensure!(
            !self.is_closed(),
            ConnectionClosedSnafu { address: self.inner.address.to_string() }
        );
        self.inner
            .commands
            .send(command)
            .map_err(|_| ConnectionClosedSnafu { address: self.inner.address.to_string() }.build())
    }

    /// Communicates a new ready count, clamped to `0..=max_ready()`.
    ///
    /// `expected_ready` takes the new value immediately; `current_ready`
    /// only once the writer accepted the `RDY` command.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConnectionClosed`] unless the session is ready.
    pub fn set_ready(&self, count: i64) -> Result<()> {
        ensure!(
            self.state() == ConnectionState::Ready,
            ConnectionClosedSnafu { address: self.inner.address.to_string() }
        );
        let count = count.clamp(0, self.max_ready());
        self.inner.expected_ready.store(count, Ordering::SeqCst);
        self.send(Command::Ready(count))?;
        self.inner.current_ready.store(count, Ordering::SeqCst);
        debug!(address = %self.inner.address, topic = %self.inner.topic, ready = count, "RDY sent");
        Ok(())
    }

    /// Sends `FIN` for a delivered message.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConnectionClosed`] if the session is closed.
    pub fn finish(&self, id: MessageId) -> Result<()> {
        self.send(Command::Finish(id))?;
        self.release_in_flight();
        Ok(())
    }

    /// Sends `REQ` for a delivered message.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConnectionClosed`] if the session is closed.
    pub fn requeue(&self, id: MessageId, delay: Duration) -> Result<()> {
        self.send(Command::Requeue { id, delay })?;
        self.release_in_flight();
        Ok(())
    }

    /// Sends `TOUCH` for a delivered message.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConnectionClosed`] if the session is closed.
    pub fn touch(&self, id: MessageId) -> Result<()> {
        self.send(Command::Touch(id))
    }

    /// Closes the session: sends `CLS`, waits up to the drain timeout for
    /// `CLOSE_WAIT`, then stops both tasks. Idempotent; concurrent callers
    /// all return once the session is closed.
    pub async fn close(&self) {
        let already_closing = {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Draining | ConnectionState::Closed => true,
                _ => {
                    *state = ConnectionState::Draining;
                    false
                },
            }
        };
        if already_closing {
            self.inner.closed.cancelled().await;
            return;
        }

        debug!(address = %self.inner.address, topic = %self.inner.topic, "draining");

        if self.inner.commands.send(Command::Close).is_ok()
            && tokio::time::timeout(self.inner.drain_timeout, self.inner.closed.cancelled())
                .await
                .is_err()
        {
            debug!(address = %self.inner.address, "no CLOSE_WAIT before drain timeout");
        }

        self.mark_closed(CloseReason::Requested);
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Returns a token cancelled once the session is closed or every handle
    /// is gone. Holding it does not keep the session alive.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    fn mark_closed(&self, reason: CloseReason) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        *self.inner.close_reason.lock() = Some(reason.clone());
        self.inner.closed.cancel();

        match reason {
            CloseReason::Requested => {
                info!(
                    address = %self.inner.address,
                    topic = %self.inner.topic,
                    "broker session closed"
                );
            },
            reason => {
                warn!(
                    address = %self.inner.address,
                    topic = %self.inner.topic,
                    reason = ?reason,
                    "broker session lost"
                );
            },
        }
    }

    fn release_in_flight(&self) {
        let _ = self.inner.in_flight.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some((n - 1).max(0))
        });
        self.maybe_replenish();
    }

    /// Re-sends the ready target once credit falls to a quarter of it.
    fn maybe_replenish(&self) {
        if self.state() != ConnectionState::Ready {
            return;
        }
        let expected = self.expected_ready();
        if expected <= 0 || self.current_ready() > expected / 4 {
            return;
        }
        if self.send(Command::Ready(expected)).is_ok() {
            self.inner.current_ready.store(expected, Ordering::SeqCst);
        }
    }

    /// Returns the close reason to apply, if the frame ends the session.
    fn on_frame(&self, frame: Frame, sink: Option<&MessageSink>) -> Option<CloseReason> {
        match frame {
            frame if frame.is_heartbeat() => {
                let _ = self.send(Command::Nop);
                None
            },
            Frame::Response(body) if body.as_ref() == CLOSE_WAIT => Some(CloseReason::Requested),
            Frame::Response(body) => {
                debug!(
                    address = %self.inner.address,
                    response = %String::from_utf8_lossy(&body),
                    "broker response"
                );
                None
            },
            Frame::Error(body) => {
                warn!(
                    address = %self.inner.address,
                    error = %String::from_utf8_lossy(&body),
                    "broker error"
                );
                None
            },
            Frame::Message(raw) => {
                self.on_message(raw, sink);
                None
            },
        }
    }

    fn on_message(&self, raw: RawMessage, sink: Option<&MessageSink>) {
        let _ = self.inner.current_ready.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some((n - 1).max(0))
        });
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);

        let message = Message::new(raw, self.clone());
        let undelivered = match sink {
            Some(sink) => sink.send(message).err().map(|e| e.0),
            None => Some(message),
        };
        if let Some(message) = undelivered {
            let _ = message.requeue(Duration::ZERO);
        }
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("address", &self.inner.address)
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .field("current_ready", &self.current_ready())
            .field("expected_ready", &self.expected_ready())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Reads the next non-heartbeat response during the handshake.
async fn expect_response<S>(
    framed: &mut Framed<S, FrameCodec>,
    address: &str,
    command: &str,
) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match framed.next().await {
            Some(Ok(frame)) if frame.is_heartbeat() => framed.send(Command::Nop).await?,
            Some(Ok(Frame::Response(body))) => return Ok(body),
            Some(Ok(Frame::Error(body))) => {
                return HandshakeSnafu {
                    address,
                    message: format!("{command} rejected: {}", String::from_utf8_lossy(&body)),
                }
                .fail();
            },
            Some(Ok(Frame::Message(_))) => {
                return HandshakeSnafu {
                    address,
                    message: format!("message frame received before {command} completed"),
                }
                .fail();
            },
            Some(Err(e)) => return Err(e),
            None => {
                return HandshakeSnafu {
                    address,
                    message: format!("connection closed during {command}"),
                }
                .fail();
            },
        }
    }
}

async fn read_loop<R>(
    weak: Weak<Inner>,
    mut frames: R,
    closed: CancellationToken,
    heartbeat: Duration,
    sink: Option<MessageSink>,
) where
    R: Stream<Item = Result<Frame>> + Unpin,
{
    let deadline = heartbeat.saturating_mul(2);

    loop {
        let next = tokio::select! {
            () = closed.cancelled() => return,
            next = tokio::time::timeout(deadline, frames.next()) => next,
        };

        let Some(inner) = weak.upgrade() else { return };
        let connection = BrokerConnection { inner };

        let reason = match next {
            Err(_) => Some(CloseReason::HeartbeatMissed),
            Ok(None) => Some(CloseReason::PeerClosed),
            Ok(Some(Err(e))) => Some(CloseReason::Protocol(e.to_string())),
            Ok(Some(Ok(frame))) => connection.on_frame(frame, sink.as_ref()),
        };

        if let Some(reason) = reason {
            connection.mark_closed(reason);
            return;
        }
    }
}

async fn write_loop<W>(
    weak: Weak<Inner>,
    mut frames: W,
    mut commands: mpsc::UnboundedReceiver<Command>,
    closed: CancellationToken,
) where
    W: Sink<Command, Error = SdkError> + Unpin,
{
    loop {
        let command = tokio::select! {
            biased;
            command = commands.recv() => command,
            () = closed.cancelled() => None,
        };
        let Some(command) = command else { break };

        if let Err(e) = frames.send(command).await {
            if let Some(inner) = weak.upgrade() {
                BrokerConnection { inner }.mark_closed(CloseReason::Io(e.to_string()));
            }
            break;
        }
    }
    let _ = frames.close().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use nsq_test_utils::assert_eventually;
    use serde_json::json;

    use super::*;
    use crate::{
        config::ClientConfig,
        identity::ClientIdentity,
        mock::MockNsqd,
    };

    fn request(broker: &MockNsqd, sink: Option<MessageSink>) -> SessionRequest {
        let config = ClientConfig::builder()
            .with_lookup_address("127.0.0.1:4161")
            .with_channel("ch")
            .with_client_id("test")
            .with_hostname("test-host")
            .build()
            .unwrap();
        let identity = ClientIdentity::from_config(&config).unwrap();
        SessionRequest {
            address: broker.address().clone(),
            topic: "orders".to_owned(),
            channel: "ch".to_owned(),
            options: HandshakeOptions::new(&identity, &config),
            connect_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            sink,
        }
    }

    async fn connect(broker: &MockNsqd, sink: Option<MessageSink>) -> Result<BrokerConnection> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        broker.serve(server);
        BrokerConnection::handshake(client, request(broker, sink)).await
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        let conn = connect(&broker, None).await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.current_ready(), 0);
        assert_eq!(conn.expected_ready(), 0);
        assert_eq!(conn.topic(), "orders");

        let identify = broker.identify_bodies();
        assert_eq!(identify.len(), 1);
        assert_eq!(identify[0]["client_id"], "test");
        assert_eq!(identify[0]["feature_negotiation"], true);
        assert_eq!(broker.subscriptions(), vec![("orders".to_owned(), "ch".to_owned())]);
    }

    #[tokio::test]
    async fn test_handshake_honors_negotiated_values() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        broker.set_features(json!({"max_rdy_count": 5, "heartbeat_interval": 1500}));
        let conn = connect(&broker, None).await.unwrap();

        assert_eq!(conn.max_ready(), 5);
        assert_eq!(conn.heartbeat_interval(), Duration::from_millis(1500));

        conn.set_ready(50).unwrap();
        assert_eq!(conn.expected_ready(), 5);
    }

    #[tokio::test]
    async fn test_handshake_rejects_subscribe_error() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        broker.reject_subscribe(true);

        let err = connect(&broker, None).await.unwrap_err();
        assert!(matches!(err, SdkError::Handshake { .. }), "got {err:?}");
        assert!(err.to_string().contains("E_INVALID"));
    }

    #[tokio::test]
    async fn test_handshake_refuses_stream_upgrade() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        broker.set_features(json!({"snappy": true}));

        let err = connect(&broker, None).await.unwrap_err();
        assert!(err.to_string().contains("snappy"));
    }

    #[tokio::test]
    async fn test_set_ready_sends_rdy() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        let conn = connect(&broker, None).await.unwrap();

        conn.set_ready(6).unwrap();
        assert_eq!(conn.current_ready(), 6);
        assert_eq!(conn.expected_ready(), 6);
        assert!(assert_eventually(Duration::from_secs(1), || broker.last_ready() == Some(6)).await);
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered_with_nop() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        broker.set_heartbeat_interval(Some(Duration::from_millis(50)));
        let conn = connect(&broker, None).await.unwrap();

        assert!(assert_eventually(Duration::from_secs(2), || broker.nop_count() >= 2).await);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_missed_heartbeat_closes_connection() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        broker.set_features(json!({"heartbeat_interval": 50}));
        broker.set_heartbeat_interval(None);
        let conn = connect(&broker, None).await.unwrap();

        assert!(assert_eventually(Duration::from_secs(2), || conn.is_closed()).await);
        assert_eq!(conn.close_reason(), Some(CloseReason::HeartbeatMissed));
        assert!(conn.set_ready(1).is_err());
    }

    #[tokio::test]
    async fn test_delivery_tracks_credit_and_replenishes() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = connect(&broker, Some(tx)).await.unwrap();

        conn.set_ready(4).unwrap();
        for i in 0..3 {
            broker.publish(format!("m{i}"));
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(conn.current_ready(), 1);
        assert_eq!(conn.in_flight(), 3);
        assert_eq!(received[0].body(), b"m0");

        received[0].finish().unwrap();
        assert_eq!(conn.in_flight(), 2);
        // 1 <= 4 / 4, so the target is re-sent
        assert_eq!(conn.current_ready(), 4);

        received[1].requeue(Duration::from_secs(1)).unwrap();
        received[2].touch().unwrap();
        assert!(
            assert_eventually(Duration::from_secs(1), || {
                broker.finished().len() == 1 && broker.requeued().len() == 1
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_message_responds_once() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = connect(&broker, Some(tx)).await.unwrap();
        conn.set_ready(1).unwrap();
        broker.publish("once");

        let message = rx.recv().await.unwrap();
        message.finish().unwrap();
        message.finish().unwrap();
        message.requeue(Duration::ZERO).unwrap();

        assert!(assert_eventually(Duration::from_secs(1), || broker.finished().len() == 1).await);
        assert!(broker.requeued().is_empty());
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_messages_without_sink_are_requeued() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        let conn = connect(&broker, None).await.unwrap();
        conn.set_ready(1).unwrap();
        broker.publish("orphan");

        assert!(assert_eventually(Duration::from_secs(1), || broker.requeued().len() == 1).await);
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_and_is_idempotent() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        let conn = connect(&broker, None).await.unwrap();

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::Requested));
        assert_eq!(broker.close_count(), 1);

        conn.close().await;
        assert_eq!(broker.close_count(), 1);
        assert!(conn.send(Command::Nop).is_err());
    }

    #[tokio::test]
    async fn test_close_without_close_wait_times_out() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        broker.ignore_close(true);
        let conn = connect(&broker, None).await.unwrap();

        let closing = conn.clone();
        let started = tokio::time::Instant::now();
        let close = tokio::spawn(async move { closing.close().await });

        assert!(
            assert_eventually(Duration::from_millis(300), || {
                conn.state() == ConnectionState::Draining
            })
            .await
        );
        close.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_shutdown_closes_connection() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        let conn = connect(&broker, None).await.unwrap();

        broker.shutdown();
        assert!(assert_eventually(Duration::from_secs(2), || conn.is_closed()).await);
        assert_eq!(conn.close_reason(), Some(CloseReason::PeerClosed));
    }

    #[tokio::test]
    async fn test_clones_share_session() {
        let broker = MockNsqd::detached(Address::new("b1", 4150, ""));
        let conn = connect(&broker, None).await.unwrap();
        let other = connect(&broker, None).await.unwrap();

        assert!(conn.same_session(&conn.clone()));
        assert!(!conn.same_session(&other));
    }
}
