//! Client configuration with builder pattern.
//!
//! Provides type-safe configuration for SDK clients including:
//! - Seed lookupd addresses and the consumer channel
//! - Worker-pool capacity used for ready-count distribution
//! - Handshake options (heartbeat, buffering, compression, TLS, sampling)
//! - Timeouts, retry policy and background refresh

use std::time::Duration;

use snafu::ensure;

use crate::{
    address::Address,
    error::{ConfigSnafu, Result},
};

/// Default timeout for lookupd HTTP queries (3 seconds).
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Default broker connect and handshake timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a closing connection waits for `CLOSE_WAIT` (2 seconds).
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default server-side message timeout (60 seconds).
const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_secs(60);

/// Default consumer worker-pool capacity.
const DEFAULT_WORKER_POOL_SIZE: u32 = 10;

/// Longest topic or channel name accepted by brokers.
const MAX_NAME_LEN: usize = 64;

/// Suffix marking an ephemeral topic or channel.
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// IDENTIFY carries whole milliseconds.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Message compression negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression.
    #[default]
    None,
    /// Deflate, with an optional level in `1..=9`.
    Deflate {
        /// Requested deflate level; the broker default applies when `None`.
        level: Option<u8>,
    },
    /// Snappy framing.
    Snappy,
}

/// Configuration for the NSQ SDK client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed lookupd addresses (`host:port`, optionally `http://`-prefixed).
    pub(crate) lookup_addresses: Vec<String>,

    /// Channel name used when subscribing.
    pub(crate) channel: String,

    /// Overrides the client id sent in IDENTIFY.
    pub(crate) client_id: Option<String>,

    /// Overrides the hostname sent in IDENTIFY.
    pub(crate) hostname: Option<String>,

    /// Total consumption capacity shared across connections.
    pub(crate) worker_pool_size: u32,

    /// Server-side message timeout.
    pub(crate) msg_timeout: Duration,

    /// Requested heartbeat interval; derived from `msg_timeout` when unset.
    pub(crate) heartbeat_interval: Option<Duration>,

    /// Broker output buffer size in bytes.
    pub(crate) output_buffer_size: Option<u32>,

    /// Broker output buffer flush timeout.
    pub(crate) output_buffer_timeout: Option<Duration>,

    /// Requested compression mode.
    pub(crate) compression: Compression,

    /// Request TLS during the handshake.
    pub(crate) tls: bool,

    /// Percentage of messages the broker should deliver (0 = all).
    pub(crate) sample_rate: Option<u8>,

    /// Timeout for lookupd HTTP queries.
    pub(crate) lookup_timeout: Duration,

    /// Timeout for broker connect plus handshake.
    pub(crate) connect_timeout: Duration,

    /// How long `close()` waits for the broker to acknowledge `CLS`.
    pub(crate) drain_timeout: Duration,

    /// Retry policy for topology queries.
    pub(crate) retry_policy: RetryPolicy,

    /// Background refresh settings.
    pub(crate) refresh: RefreshConfig,

    /// Finish messages automatically after the handler returns.
    pub(crate) auto_finish: bool,
}

impl ClientConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Returns the seed lookupd addresses.
    #[must_use]
    pub fn lookup_addresses(&self) -> &[String] {
        &self.lookup_addresses
    }

    /// Returns the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns the client id override, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Returns the hostname override, if any.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Returns the worker-pool capacity.
    #[must_use]
    pub fn worker_pool_size(&self) -> u32 {
        self.worker_pool_size
    }

    /// Returns the message timeout.
    #[must_use]
    pub fn msg_timeout(&self) -> Duration {
        self.msg_timeout
    }

    /// Returns the heartbeat interval, defaulting to a third of the message timeout.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(self.msg_timeout / 3)
    }

    /// Returns the output buffer size.
    #[must_use]
    pub fn output_buffer_size(&self) -> Option<u32> {
        self.output_buffer_size
    }

    /// Returns the output buffer timeout.
    #[must_use]
    pub fn output_buffer_timeout(&self) -> Option<Duration> {
        self.output_buffer_timeout
    }

    /// Returns the compression mode.
    #[must_use]
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Returns whether TLS is requested.
    #[must_use]
    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Returns the sample rate.
    #[must_use]
    pub fn sample_rate(&self) -> Option<u8> {
        self.sample_rate
    }

    /// Returns the lookupd query timeout.
    #[must_use]
    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    /// Returns the broker connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the drain timeout.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Returns the background refresh settings.
    #[must_use]
    pub fn refresh(&self) -> &RefreshConfig {
        &self.refresh
    }

    /// Returns whether messages are finished automatically.
    #[must_use]
    pub fn auto_finish(&self) -> bool {
        self.auto_finish
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    lookup_addresses: Vec<String>,
    channel: Option<String>,
    client_id: Option<String>,
    hostname: Option<String>,
    worker_pool_size: Option<u32>,
    msg_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    output_buffer_size: Option<u32>,
    output_buffer_timeout: Option<Duration>,
    compression: Compression,
    tls: bool,
    sample_rate: Option<u8>,
    lookup_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    drain_timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    refresh: Option<RefreshConfig>,
    auto_finish: bool,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            lookup_addresses: Vec::new(),
            channel: None,
            client_id: None,
            hostname: None,
            worker_pool_size: None,
            msg_timeout: None,
            heartbeat_interval: None,
            output_buffer_size: None,
            output_buffer_timeout: None,
            compression: Compression::None,
            tls: false,
            sample_rate: None,
            lookup_timeout: None,
            connect_timeout: None,
            drain_timeout: None,
            retry_policy: None,
            refresh: None,
            auto_finish: true,
        }
    }
}

impl ClientConfigBuilder {
    /// Sets the seed lookupd addresses.
    ///
    /// At least one address must be provided. Each must be `host:port`,
    /// optionally prefixed with `http://`.
    #[must_use]
    pub fn with_lookup_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lookup_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a single seed lookupd address.
    #[must_use]
    pub fn with_lookup_address<S: Into<String>>(mut self, address: S) -> Self {
        self.lookup_addresses.push(address.into());
        self
    }

    /// Sets the channel consumed from each subscribed topic.
    #[must_use]
    pub fn with_channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Overrides the client id sent to brokers.
    ///
    /// Default: `IP:{local ip}, PID:{pid}`.
    #[must_use]
    pub fn with_client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Overrides the hostname sent to brokers.
    ///
    /// Default: the local IP address.
    #[must_use]
    pub fn with_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the total consumption capacity shared across connections.
    ///
    /// Default: 10.
    #[must_use]
    pub fn with_worker_pool_size(mut self, size: u32) -> Self {
        self.worker_pool_size = Some(size);
        self
    }

    /// Sets the server-side message timeout.
    ///
    /// Default: 60 seconds.
    #[must_use]
    pub fn with_msg_timeout(mut self, timeout: Duration) -> Self {
        self.msg_timeout = Some(timeout);
        self
    }

    /// Sets the requested heartbeat interval.
    ///
    /// Default: a third of the message timeout.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the broker output buffer size in bytes.
    #[must_use]
    pub fn with_output_buffer_size(mut self, size: u32) -> Self {
        self.output_buffer_size = Some(size);
        self
    }

    /// Sets the broker output buffer flush timeout.
    #[must_use]
    pub fn with_output_buffer_timeout(mut self, timeout: Duration) -> Self {
        self.output_buffer_timeout = Some(timeout);
        self
    }

    /// Sets the requested compression mode.
    ///
    /// Default: [`Compression::None`].
    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Requests TLS during the handshake.
    ///
    /// Default: disabled.
    #[must_use]
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Sets the delivery sample rate (`0..=99`, 0 delivers everything).
    #[must_use]
    pub fn with_sample_rate(mut self, rate: u8) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    /// Sets the lookupd query timeout.
    ///
    /// Default: 3 seconds.
    #[must_use]
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = Some(timeout);
        self
    }

    /// Sets the broker connect and handshake timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets how long closing connections wait for `CLOSE_WAIT`.
    ///
    /// Default: 2 seconds.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Sets the retry policy for topology queries.
    ///
    /// Default: [`RetryPolicy::default()`].
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the background refresh settings.
    ///
    /// Default: [`RefreshConfig::default()`].
    #[must_use]
    pub fn with_refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// Enables or disables automatic finishing of handled messages.
    ///
    /// Default: enabled.
    #[must_use]
    pub fn with_auto_finish(mut self, enabled: bool) -> Self {
        self.auto_finish = enabled;
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No lookup addresses provided, or one is not `host:port`
    /// - Channel is missing or not a valid name
    /// - Worker-pool size is zero
    /// - Any timeout is zero
    /// - The heartbeat interval, set or derived, is under one millisecond
    /// - Deflate level is outside `1..=9` or sample rate above 99
    pub fn build(self) -> Result<ClientConfig> {
        ensure!(
            !self.lookup_addresses.is_empty(),
            ConfigSnafu { message: "at least one lookup address is required" }
        );

        for address in &self.lookup_addresses {
            address.parse::<Address>()?;
        }

        let channel =
            self.channel.ok_or_else(|| ConfigSnafu { message: "channel is required" }.build())?;
        validate_name("channel", &channel)?;

        if let Some(ref client_id) = self.client_id {
            ensure!(!client_id.is_empty(), ConfigSnafu { message: "client_id cannot be empty" });
        }

        let worker_pool_size = self.worker_pool_size.unwrap_or(DEFAULT_WORKER_POOL_SIZE);
        ensure!(worker_pool_size > 0, ConfigSnafu { message: "worker_pool_size cannot be zero" });

        let msg_timeout = self.msg_timeout.unwrap_or(DEFAULT_MSG_TIMEOUT);
        ensure!(!msg_timeout.is_zero(), ConfigSnafu { message: "msg_timeout cannot be zero" });

        let heartbeat = self.heartbeat_interval.unwrap_or(msg_timeout / 3);
        ensure!(
            heartbeat >= MIN_HEARTBEAT_INTERVAL,
            ConfigSnafu {
                message: format!(
                    "heartbeat_interval {heartbeat:?} is below {MIN_HEARTBEAT_INTERVAL:?}; \
                     without an override it is msg_timeout / 3"
                )
            }
        );

        if let Compression::Deflate { level: Some(level) } = self.compression {
            ensure!(
                (1..=9).contains(&level),
                ConfigSnafu { message: format!("deflate level {level} outside 1..=9") }
            );
        }

        if let Some(rate) = self.sample_rate {
            ensure!(rate <= 99, ConfigSnafu { message: format!("sample rate {rate} above 99") });
        }

        let lookup_timeout = self.lookup_timeout.unwrap_or(DEFAULT_LOOKUP_TIMEOUT);
        ensure!(
            !lookup_timeout.is_zero(),
            ConfigSnafu { message: "lookup_timeout cannot be zero" }
        );

        let connect_timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        ensure!(
            !connect_timeout.is_zero(),
            ConfigSnafu { message: "connect_timeout cannot be zero" }
        );

        Ok(ClientConfig {
            lookup_addresses: self.lookup_addresses,
            channel,
            client_id: self.client_id,
            hostname: self.hostname,
            worker_pool_size,
            msg_timeout,
            heartbeat_interval: self.heartbeat_interval,
            output_buffer_size: self.output_buffer_size,
            output_buffer_timeout: self.output_buffer_timeout,
            compression: self.compression,
            tls: self.tls,
            sample_rate: self.sample_rate,
            lookup_timeout,
            connect_timeout,
            drain_timeout: self.drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT),
            retry_policy: self.retry_policy.unwrap_or_default(),
            refresh: self.refresh.unwrap_or_default(),
            auto_finish: self.auto_finish,
        })
    }
}

/// Validates a topic or channel name.
///
/// Names are 1 to 64 characters of `[.a-zA-Z0-9_-]`, optionally followed by
/// `#ephemeral`.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);

    ensure!(
        !base.is_empty() && name.len() <= MAX_NAME_LEN,
        ConfigSnafu { message: format!("{kind} name must be 1 to {MAX_NAME_LEN} characters") }
    );

    ensure!(
        base.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
        ConfigSnafu { message: format!("{kind} name '{name}' contains invalid characters") }
    );

    Ok(())
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (including initial attempt).
    pub max_attempts: u32,

    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential increase.
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0) for randomizing backoff.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the initial backoff duration.
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    /// Sets the maximum backoff duration.
    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the jitter factor (0.0 to 1.0).
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Builds the retry policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: self.initial_backoff.unwrap_or(defaults.initial_backoff),
            max_backoff: self.max_backoff.unwrap_or(defaults.max_backoff),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

/// Default topology refresh interval (60 seconds).
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for periodic topology refresh.
///
/// Drives both the registry-wide `listlookup` sweep and each consumer's
/// re-convergence loop.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use nsq_sdk::RefreshConfig;
///
/// let config = RefreshConfig::enabled()
///     .with_refresh_interval(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Whether periodic refresh is enabled.
    enabled: bool,

    /// How often to refresh.
    refresh_interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self::enabled()
    }
}

impl RefreshConfig {
    /// Creates a disabled refresh configuration.
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false, refresh_interval: DEFAULT_REFRESH_INTERVAL }
    }

    /// Creates an enabled refresh configuration with default settings.
    #[must_use]
    pub fn enabled() -> Self {
        Self { enabled: true, refresh_interval: DEFAULT_REFRESH_INTERVAL }
    }

    /// Sets the refresh interval.
    ///
    /// Default: 60 seconds.
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Returns whether refresh is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the refresh interval.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }
}
