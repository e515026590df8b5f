//! Shared, reference-counted cache of seed resolvers.
//!
//! Consumers built from the same seed addresses share one [`SeedResolver`]
//! per seed. The registry is an ordinary value: construct it once, clone it
//! into every consumer, and call [`SeedRegistry::shutdown`] after the last
//! consumer closed.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> nsq_sdk::Result<()> {
//! use nsq_sdk::{ClientConfig, SeedRegistry};
//!
//! let config = ClientConfig::builder()
//!     .with_lookup_address("127.0.0.1:4161")
//!     .with_channel("billing")
//!     .build()?;
//!
//! let registry = SeedRegistry::from_config(&config)?;
//! registry.start_background_refresh();
//!
//! let resolver = registry.acquire_str("127.0.0.1:4161")?;
//! let node = resolver.pick_one().await;
//!
//! registry.release(&resolver);
//! registry.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    io,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use super::{
    node::NodeArena,
    seed::{ResolveOutcome, SeedResolver},
};
use crate::{
    address::Address,
    config::{ClientConfig, RefreshConfig},
    directory::{DirectoryClient, HttpDirectoryClient},
    error::Result,
    identity,
};

/// What a call to [`SeedRegistry::release`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other holders remain.
    Retained {
        /// References still held.
        remaining: i64,
    },
    /// This was the last reference; the resolver was removed and cleaned.
    Removed,
    /// The resolver was not (or no longer) registered. Nothing changed.
    NotRegistered,
}

pub(crate) struct RegistryInner {
    resolvers: Mutex<HashMap<Address, Arc<SeedResolver>>>,
    arena: Arc<NodeArena>,
    directory: Arc<dyn DirectoryClient>,
    local_ip: IpAddr,
    refresh: RefreshConfig,
    running: AtomicBool,
    refresh_notify: Notify,
    shutdown_notify: Notify,
}

impl RegistryInner {
    /// Increments `resolver` if it is still the registered instance.
    pub(crate) fn add_reference(&self, resolver: &Arc<SeedResolver>) -> Option<i64> {
        let resolvers = self.resolvers.lock();
        let registered =
            resolvers.get(resolver.seed()).is_some_and(|current| Arc::ptr_eq(current, resolver));
        registered.then(|| resolver.increment())
    }

    pub(crate) fn release(&self, resolver: &Arc<SeedResolver>) -> ReleaseOutcome {
        let mut resolvers = self.resolvers.lock();

        let registered =
            resolvers.get(resolver.seed()).is_some_and(|current| Arc::ptr_eq(current, resolver));
        if !registered {
            warn!(seed = %resolver.seed(), "release of a seed resolver that is not registered");
            return ReleaseOutcome::NotRegistered;
        }

        let remaining = resolver.decrement();
        if remaining > 0 {
            debug!(seed = %resolver.seed(), remaining, "seed resolver released");
            return ReleaseOutcome::Retained { remaining };
        }

        resolvers.remove(resolver.seed());
        resolver.clean();
        info!(seed = %resolver.seed(), "seed resolver removed");
        ReleaseOutcome::Removed
    }
}

/// Registry of [`SeedResolver`]s keyed by seed address.
///
/// Cloning is cheap; clones share resolvers, the node arena and the
/// background sweep.
#[derive(Clone)]
pub struct SeedRegistry {
    inner: Arc<RegistryInner>,
}

impl SeedRegistry {
    /// Creates a registry whose resolvers query `directory`.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if the local IP address cannot be detected.
    pub fn new(directory: Arc<dyn DirectoryClient>, refresh: RefreshConfig) -> Result<Self> {
        Self::detect_with(directory, refresh, identity::detect_outbound_ip)
    }

    pub(crate) fn detect_with<F>(
        directory: Arc<dyn DirectoryClient>,
        refresh: RefreshConfig,
        detect: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> io::Result<IpAddr>,
    {
        let local_ip = identity::checked(detect())?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                resolvers: Mutex::new(HashMap::new()),
                arena: Arc::new(NodeArena::new()),
                directory,
                local_ip,
                refresh,
                running: AtomicBool::new(false),
                refresh_notify: Notify::new(),
                shutdown_notify: Notify::new(),
            }),
        })
    }

    /// Creates a registry over HTTP, bounded by the config's lookup timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed or the
    /// local IP address cannot be detected.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let directory = HttpDirectoryClient::new(config.lookup_timeout())?;
        Self::new(Arc::new(directory), config.refresh().clone())
    }

    /// Returns the resolver for `seed`, creating it on first use, and takes a
    /// reference on it.
    #[must_use]
    pub fn acquire(&self, seed: &Address) -> Arc<SeedResolver> {
        let mut resolvers = self.inner.resolvers.lock();
        let resolver = resolvers
            .entry(seed.clone())
            .or_insert_with(|| {
                debug!(seed = %seed, "creating seed resolver");
                Arc::new(SeedResolver::new(
                    seed.clone(),
                    Arc::clone(&self.inner.arena),
                    Arc::clone(&self.inner.directory),
                    Arc::downgrade(&self.inner),
                    self.inner.local_ip,
                ))
            })
            .clone();
        resolver.increment();
        resolver
    }

    /// Parses `seed` and [`acquire`](Self::acquire)s its resolver.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::InvalidAddress` if `seed` is not `host:port`.
    pub fn acquire_str(&self, seed: &str) -> Result<Arc<SeedResolver>> {
        let seed: Address = seed.parse()?;
        Ok(self.acquire(&seed))
    }

    /// Drops one reference on `resolver`; the last one removes and cleans it.
    ///
    /// Releasing a resolver that is no longer registered is a logged no-op.
    pub fn release(&self, resolver: &Arc<SeedResolver>) -> ReleaseOutcome {
        self.inner.release(resolver)
    }

    /// Forces a `listlookup` on every registered resolver.
    ///
    /// Seeds are queried concurrently; a failing seed does not affect the
    /// others.
    pub async fn refresh_all(&self) -> Vec<(Address, ResolveOutcome)> {
        let resolvers: Vec<Arc<SeedResolver>> =
            self.inner.resolvers.lock().values().cloned().collect();

        let outcomes = join_all(resolvers.iter().map(|resolver| resolver.resolve(true))).await;

        let results: Vec<(Address, ResolveOutcome)> = resolvers
            .iter()
            .map(|resolver| resolver.seed().clone())
            .zip(outcomes)
            .collect();

        debug!(seeds = results.len(), "refreshed all seed resolvers");
        results
    }

    /// Returns the number of registered resolvers.
    #[must_use]
    pub fn resolver_count(&self) -> usize {
        self.inner.resolvers.lock().len()
    }

    /// Returns true if a resolver is registered for `seed`.
    #[must_use]
    pub fn contains(&self, seed: &Address) -> bool {
        self.inner.resolvers.lock().contains_key(seed)
    }

    /// Returns the node arena shared by this registry's resolvers.
    #[must_use]
    pub fn arena(&self) -> &Arc<NodeArena> {
        &self.inner.arena
    }

    pub(crate) fn directory(&self) -> Arc<dyn DirectoryClient> {
        Arc::clone(&self.inner.directory)
    }

    /// Returns the refresh configuration.
    #[must_use]
    pub fn refresh_config(&self) -> &RefreshConfig {
        &self.inner.refresh
    }

    /// Returns whether the background sweep is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Starts the background sweep calling [`refresh_all`](Self::refresh_all)
    /// every refresh interval.
    ///
    /// Idempotent. Does nothing when refresh is disabled.
    pub fn start_background_refresh(&self) {
        if !self.inner.refresh.is_enabled() {
            debug!("Refresh is disabled, not starting background sweep");
            return;
        }

        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Background sweep already running");
            return;
        }

        let registry = self.clone();
        let refresh_interval = self.inner.refresh.refresh_interval();

        tokio::spawn(async move {
            info!(interval = ?refresh_interval, "Starting seed registry background sweep");

            let mut ticker = interval(refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.refresh_all().await;
                    }
                    () = registry.inner.refresh_notify.notified() => {
                        debug!("Immediate sweep triggered");
                        registry.refresh_all().await;
                    }
                    () = registry.inner.shutdown_notify.notified() => {
                        info!("Stopping seed registry background sweep");
                        registry.inner.running.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });
    }

    /// Signals the background sweep to stop after its current iteration.
    pub fn stop_background_refresh(&self) {
        if self.inner.running.load(Ordering::Relaxed) {
            self.inner.shutdown_notify.notify_one();
        }
    }

    /// Runs a sweep now instead of waiting for the next tick.
    ///
    /// No effect unless the background sweep is running.
    pub fn trigger_refresh(&self) {
        if self.inner.running.load(Ordering::Relaxed) {
            self.inner.refresh_notify.notify_one();
        }
    }

    /// Stops the background sweep. Call after the last consumer closed.
    pub fn shutdown(&self) {
        let remaining = self.resolver_count();
        if remaining > 0 {
            warn!(remaining, "seed registry shut down with resolvers still referenced");
        }
        self.stop_background_refresh();
    }
}

impl fmt::Debug for SeedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedRegistry")
            .field("resolvers", &self.resolver_count())
            .field("nodes", &self.inner.arena.len())
            .field("running", &self.is_running())
            .finish()
    }
}
