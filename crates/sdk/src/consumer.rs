//! Consumer facade: seeds, subscriptions, workers and the refresh loop.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use snafu::ensure;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    address::Address,
    config::{ClientConfig, validate_name},
    connection::{BrokerConnector, TcpConnector},
    error::{Result, SdkError, ShutdownSnafu},
    lookup::{SeedRegistry, SeedResolver},
    manager::{ConnectionManager, ConvergeReport},
    message::Message,
    topology::TopologyClient,
};

/// Application callback for delivered messages.
///
/// Runs on a worker task, never on a connection's reader. A message left
/// unanswered when `handle` returns is finished automatically unless
/// auto-finish is disabled.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Processes one message.
    async fn handle(&self, message: &Message);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    async fn handle(&self, message: &Message) {
        self(message);
    }
}

/// Consumes topics on one channel from the brokers lookupd reports.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> nsq_sdk::Result<()> {
/// use nsq_sdk::{ClientConfig, Consumer, Message, SeedRegistry};
///
/// let config = ClientConfig::builder()
///     .with_lookup_address("127.0.0.1:4161")
///     .with_channel("billing")
///     .with_worker_pool_size(12)
///     .build()?;
///
/// let registry = SeedRegistry::from_config(&config)?;
/// let consumer = Consumer::new(config, registry.clone(), |message: &Message| {
///     println!("{} bytes from {}", message.body().len(), message.broker());
/// })?;
///
/// consumer.subscribe("orders").await?;
/// consumer.start().await?;
///
/// // ...
/// consumer.close().await;
/// registry.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    config: ClientConfig,
    registry: SeedRegistry,
    resolvers: Mutex<Vec<Arc<SeedResolver>>>,
    manager: Arc<ConnectionManager>,
    handler: Arc<dyn MessageHandler>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    topics: Arc<Mutex<BTreeSet<String>>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Consumer {
    /// Creates a consumer connecting to brokers over TCP.
    ///
    /// Takes one reference on the registry's resolver for every configured
    /// lookup address; [`close`](Self::close) gives them back.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::InvalidAddress` if a lookup address does not parse,
    /// or `SdkError::Config` if the client identity cannot be derived.
    pub fn new<H: MessageHandler>(
        config: ClientConfig,
        registry: SeedRegistry,
        handler: H,
    ) -> Result<Self> {
        Self::with_connector(config, registry, handler, Arc::new(TcpConnector))
    }

    /// Like [`new`](Self::new), opening broker sessions through `connector`.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::InvalidAddress` if a lookup address does not parse,
    /// or `SdkError::Config` if the client identity cannot be derived. No
    /// resolver reference is kept on failure.
    pub fn with_connector<H: MessageHandler>(
        config: ClientConfig,
        registry: SeedRegistry,
        handler: H,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        let seeds = config
            .lookup_addresses()
            .iter()
            .map(|seed| seed.parse::<Address>())
            .collect::<Result<Vec<_>>>()?;
        let resolvers: Vec<Arc<SeedResolver>> =
            seeds.iter().map(|seed| registry.acquire(seed)).collect();

        let token = CancellationToken::new();
        let (sink, receiver) = mpsc::unbounded_channel();
        let topology = TopologyClient::new(registry.directory(), config.retry_policy().clone());
        let manager = match ConnectionManager::new(&config, resolvers.clone(), topology, connector)
        {
            Ok(manager) => manager.with_sink(sink).with_cancellation(token.child_token()),
            Err(e) => {
                for resolver in &resolvers {
                    registry.release(resolver);
                }
                return Err(e);
            },
        };

        debug!(channel = config.channel(), seeds = resolvers.len(), "consumer created");

        Ok(Self {
            config,
            registry,
            resolvers: Mutex::new(resolvers),
            manager: Arc::new(manager),
            handler: Arc::new(handler),
            receiver: Mutex::new(Some(receiver)),
            topics: Arc::new(Mutex::new(BTreeSet::new())),
            token,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the connection manager.
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Returns the resolvers this consumer holds; empty once closed.
    #[must_use]
    pub fn resolvers(&self) -> Vec<Arc<SeedResolver>> {
        self.resolvers.lock().clone()
    }

    /// Returns the subscribed topics.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Adds `topic` to the subscriptions. After [`start`](Self::start) the
    /// topic is converged at once.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` for an invalid topic name,
    /// `SdkError::Shutdown` once closed, or the first convergence's error.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        ensure!(!self.is_closed(), ShutdownSnafu);
        validate_name("topic", topic)?;

        if !self.topics.lock().insert(topic.to_owned()) {
            return Ok(());
        }
        info!(topic, channel = self.config.channel(), "subscribed");

        if self.started.load(Ordering::SeqCst) {
            self.manager.subscribe(topic).await?;
        }
        Ok(())
    }

    /// Starts the workers, converges every subscribed topic, and spawns the
    /// refresh loop. Calling it again does nothing.
    ///
    /// Convergence failures are logged and retried by the refresh loop.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Shutdown` once closed.
    pub async fn start(&self) -> Result<()> {
        ensure!(!self.is_closed(), ShutdownSnafu);
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(receiver) = self.receiver.lock().take() {
            self.spawn_workers(receiver);
        }

        converge_all(&self.manager, &self.topics()).await;

        if self.config.refresh().is_enabled() {
            self.spawn_refresh_loop();
        }

        info!(
            channel = self.config.channel(),
            workers = self.config.worker_pool_size(),
            "consumer started"
        );
        Ok(())
    }

    /// Re-converges every subscribed topic now.
    pub async fn refresh(&self) -> Vec<(String, Result<ConvergeReport>)> {
        let topics = self.topics();
        let reports = join_all(topics.iter().map(|topic| self.manager.subscribe(topic))).await;
        topics.into_iter().zip(reports).collect()
    }

    /// Stops consuming: cancels pending lookups, closes every connection,
    /// waits for the workers, and releases each resolver once. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(channel = self.config.channel(), "closing consumer");

        self.token.cancel();
        self.manager.close().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drain = self.config.drain_timeout();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(drain, task).await.is_err() {
                warn!("worker did not finish within the drain timeout, aborting");
                abort.abort();
            }
        }

        self.release_resolvers();
    }

    fn release_resolvers(&self) {
        let resolvers: Vec<Arc<SeedResolver>> = std::mem::take(&mut *self.resolvers.lock());
        for resolver in &resolvers {
            let outcome = self.registry.release(resolver);
            debug!(seed = %resolver.seed(), outcome = ?outcome, "resolver released");
        }
    }

    fn spawn_workers(&self, receiver: mpsc::UnboundedReceiver<Message>) {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let auto_finish = self.config.auto_finish();
        let mut tasks = self.tasks.lock();

        for worker in 0..self.config.worker_pool_size() {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&self.handler);
            let token = self.token.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        () = token.cancelled() => break,
                        message = async { receiver.lock().await.recv().await } => message,
                    };
                    let Some(message) = message else { break };

                    handler.handle(&message).await;

                    if auto_finish
                        && !message.is_responded()
                        && let Err(e) = message.finish()
                    {
                        warn!(worker, id = %message.id(), error = %e, "auto-finish failed");
                    }
                }
                debug!(worker, "worker stopped");
            }));
        }
    }

    fn spawn_refresh_loop(&self) {
        let manager = Arc::clone(&self.manager);
        let token = self.token.clone();
        let topics = Arc::clone(&self.topics);
        let refresh_interval = self.config.refresh().refresh_interval();

        let task = tokio::spawn(async move {
            let mut ticker = interval(refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let topics: Vec<String> = topics.lock().iter().cloned().collect();
                        converge_all(&manager, &topics).await;
                    }
                }
            }
            debug!("refresh loop stopped");
        });
        self.tasks.lock().push(task);
    }
}

async fn converge_all(manager: &ConnectionManager, topics: &[String]) {
    for topic in topics {
        match manager.subscribe(topic).await {
            Ok(report) if !report.failed.is_empty() => {
                warn!(
                    topic = %topic,
                    failed = report.failed.len(),
                    "some brokers could not be connected"
                );
            },
            Ok(_) => {},
            Err(SdkError::Cancelled) => return,
            Err(e) => warn!(topic = %topic, error = %e, "topic convergence failed"),
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.token.cancel();
            self.release_resolvers();
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("channel", &self.config.channel())
            .field("topics", &self.topics())
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("closed", &self.is_closed())
            .finish()
    }
}
