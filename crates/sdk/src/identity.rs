//! Client identity and the IDENTIFY handshake payload.
//!
//! [`ClientIdentity`] names this process to brokers. [`HandshakeOptions`] is
//! the JSON body sent with `IDENTIFY`, derived once from the configuration,
//! and [`NegotiatedFeatures`] is what the broker answers with.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, UdpSocket},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    config::{ClientConfig, Compression},
    error::{ConfigSnafu, DecodeSnafu, ProtocolSnafu, Result},
};

/// User agent reported to brokers.
pub const USER_AGENT: &str = concat!("nsq-sdk/", env!("CARGO_PKG_VERSION"));

/// Ready-count ceiling assumed when the broker does not report one.
pub const DEFAULT_MAX_RDY_COUNT: i64 = 2500;

/// Non-routable address used to discover the outbound interface.
/// Connecting a UDP socket sends no packets.
const OUTBOUND_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

/// How this process identifies itself to brokers and in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    client_id: String,
    hostname: String,
    local_ip: Option<IpAddr>,
}

impl ClientIdentity {
    /// Derives the identity from configuration overrides and the local host.
    ///
    /// Without overrides the client id is `IP:{ip}, PID:{pid}` and the
    /// hostname is the local IP address.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if the local IP address cannot be detected
    /// and the client id or the hostname is not overridden.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::detect_with(config, detect_outbound_ip)
    }

    pub(crate) fn detect_with<F>(config: &ClientConfig, detect: F) -> Result<Self>
    where
        F: FnOnce() -> io::Result<IpAddr>,
    {
        let (client_id, hostname, local_ip) = match (config.client_id(), config.hostname()) {
            (Some(id), Some(host)) => (id.to_owned(), host.to_owned(), detect().ok()),
            (id, host) => {
                let ip = checked(detect())?;
                let client_id = id.map_or_else(
                    || format!("IP:{ip}, PID:{}", std::process::id()),
                    str::to_owned,
                );
                let hostname = host.map_or_else(|| ip.to_string(), str::to_owned);
                (client_id, hostname, Some(ip))
            },
        };

        Ok(Self { client_id, hostname, local_ip })
    }

    /// Returns the client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the hostname.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the detected local IP address, if detection ran and succeeded.
    #[must_use]
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }
}

/// Maps a failed local IP detection to `SdkError::Config`.
pub(crate) fn checked(detected: io::Result<IpAddr>) -> Result<IpAddr> {
    detected.map_err(|e| {
        ConfigSnafu { message: format!("cannot determine the local IP address: {e}") }.build()
    })
}

/// Detects the IP of the outbound interface.
pub(crate) fn detect_outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(OUTBOUND_TARGET)?;
    let ip = socket.local_addr()?.ip();

    if ip.is_unspecified() {
        return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no outbound interface"));
    }
    Ok(ip)
}

/// JSON body of the `IDENTIFY` command.
///
/// Durations are encoded in milliseconds. Optional fields are omitted so the
/// broker applies its own defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakeOptions {
    /// Client id.
    pub client_id: String,
    /// Client hostname.
    pub hostname: String,
    /// Ask the broker to answer with its negotiated features as JSON.
    pub feature_negotiation: bool,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
    /// Output buffer size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<u32>,
    /// Output buffer timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_timeout: Option<u64>,
    /// Request TLS.
    pub tls_v1: bool,
    /// Request snappy compression.
    pub snappy: bool,
    /// Request deflate compression.
    pub deflate: bool,
    /// Deflate level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deflate_level: Option<u8>,
    /// Delivery sample rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u8>,
    /// Message timeout in milliseconds.
    pub msg_timeout: u64,
    /// User agent string.
    pub user_agent: String,
}

impl HandshakeOptions {
    /// Builds the payload for `identity` from `config`.
    #[must_use]
    pub fn new(identity: &ClientIdentity, config: &ClientConfig) -> Self {
        let (snappy, deflate, deflate_level) = match config.compression() {
            Compression::None => (false, false, None),
            Compression::Snappy => (true, false, None),
            Compression::Deflate { level } => (false, true, level),
        };

        Self {
            client_id: identity.client_id().to_owned(),
            hostname: identity.hostname().to_owned(),
            feature_negotiation: true,
            heartbeat_interval: millis(config.heartbeat_interval()),
            output_buffer_size: config.output_buffer_size(),
            output_buffer_timeout: config.output_buffer_timeout().map(millis),
            tls_v1: config.tls(),
            snappy,
            deflate,
            deflate_level,
            sample_rate: config.sample_rate(),
            msg_timeout: millis(config.msg_timeout()),
            user_agent: USER_AGENT.to_owned(),
        }
    }

    /// Returns the requested heartbeat interval.
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    /// Serializes the payload to JSON.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            ProtocolSnafu { message: format!("failed to encode IDENTIFY body: {e}") }.build()
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Features the broker agreed to in its IDENTIFY response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NegotiatedFeatures {
    /// Largest ready count the broker accepts.
    pub max_rdy_count: i64,
    /// Broker version.
    pub version: String,
    /// Largest message timeout the broker accepts, in milliseconds.
    pub max_msg_timeout: u64,
    /// Effective message timeout, in milliseconds.
    pub msg_timeout: u64,
    /// Heartbeat interval the broker will use, in milliseconds.
    pub heartbeat_interval: Option<i64>,
    /// Broker expects a TLS upgrade.
    pub tls_v1: bool,
    /// Broker expects a snappy upgrade.
    pub snappy: bool,
    /// Broker expects a deflate upgrade.
    pub deflate: bool,
    /// Negotiated deflate level.
    pub deflate_level: u8,
    /// Negotiated sample rate.
    pub sample_rate: u8,
    /// Broker requires AUTH before SUB.
    pub auth_required: bool,
}

impl Default for NegotiatedFeatures {
    fn default() -> Self {
        Self {
            max_rdy_count: DEFAULT_MAX_RDY_COUNT,
            version: String::new(),
            max_msg_timeout: 0,
            msg_timeout: 0,
            heartbeat_interval: None,
            tls_v1: false,
            snappy: false,
            deflate: false,
            deflate_level: 0,
            sample_rate: 0,
            auth_required: false,
        }
    }
}

impl NegotiatedFeatures {
    /// Parses an IDENTIFY response body.
    ///
    /// A bare `OK` means the broker does not negotiate; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the body is neither `OK` nor valid JSON.
    pub fn parse(address: &str, body: &[u8]) -> Result<Self> {
        if body == b"OK" {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).context(DecodeSnafu { url: address })
    }

    /// Returns the heartbeat interval to enforce: the broker's if it reported
    /// a positive one, otherwise `requested`.
    #[must_use]
    pub fn effective_heartbeat(&self, requested: Duration) -> Duration {
        match self.heartbeat_interval {
            Some(ms) if ms > 0 => Duration::from_millis(ms.unsigned_abs()),
            _ => requested,
        }
    }

    /// Names the first stream upgrade the broker expects, if any.
    #[must_use]
    pub fn required_upgrade(&self) -> Option<&'static str> {
        if self.tls_v1 {
            Some("tls_v1")
        } else if self.snappy {
            Some("snappy")
        } else if self.deflate {
            Some("deflate")
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::SdkError;

    fn config() -> ClientConfig {
        ClientConfig::builder()
            .with_lookup_address("127.0.0.1:4161")
            .with_channel("BaseConsumer")
            .build()
            .unwrap()
    }

    #[test]
    fn test_identity_defaults() {
        let identity =
            ClientIdentity::detect_with(&config(), || Ok(IpAddr::from([10, 0, 0, 7]))).unwrap();
        let ip = "10.0.0.7";

        assert_eq!(identity.hostname(), ip);
        assert_eq!(identity.client_id(), format!("IP:{ip}, PID:{}", std::process::id()));
    }

    #[test]
    fn test_identity_overrides() {
        let config = ClientConfig::builder()
            .with_lookup_address("127.0.0.1:4161")
            .with_channel("ch")
            .with_client_id("consumer-7")
            .with_hostname("worker.local")
            .build()
            .unwrap();
        let identity = ClientIdentity::from_config(&config).unwrap();

        assert_eq!(identity.client_id(), "consumer-7");
        assert_eq!(identity.hostname(), "worker.local");
    }

    fn unreachable() -> io::Result<IpAddr> {
        Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "network is unreachable"))
    }

    #[test]
    fn test_undetectable_ip_is_a_config_error() {
        let err = ClientIdentity::detect_with(&config(), unreachable).unwrap_err();

        assert!(matches!(err, SdkError::Config { .. }));
        assert!(err.to_string().contains("local IP"));
    }

    #[test]
    fn test_undetectable_ip_with_partial_override_fails() {
        let config = ClientConfig::builder()
            .with_lookup_address("127.0.0.1:4161")
            .with_channel("ch")
            .with_client_id("consumer-7")
            .build()
            .unwrap();

        let err = ClientIdentity::detect_with(&config, unreachable).unwrap_err();
        assert!(matches!(err, SdkError::Config { .. }));
    }

    #[test]
    fn test_full_override_tolerates_undetectable_ip() {
        let config = ClientConfig::builder()
            .with_lookup_address("127.0.0.1:4161")
            .with_channel("ch")
            .with_client_id("consumer-7")
            .with_hostname("worker.local")
            .build()
            .unwrap();

        let identity = ClientIdentity::detect_with(&config, unreachable).unwrap();
        assert_eq!(identity.hostname(), "worker.local");
        assert_eq!(identity.local_ip(), None);
    }

    #[test]
    fn test_handshake_payload_fields() {
        let config = ClientConfig::builder()
            .with_lookup_address("127.0.0.1:4161")
            .with_channel("ch")
            .with_client_id("c1")
            .with_hostname("h1")
            .with_msg_timeout(Duration::from_secs(30))
            .with_output_buffer_size(16384)
            .with_compression(Compression::Deflate { level: Some(6) })
            .with_sample_rate(10)
            .build()
            .unwrap();
        let identity = ClientIdentity::from_config(&config).unwrap();
        let options = HandshakeOptions::new(&identity, &config);
        let json: serde_json::Value = serde_json::from_slice(&options.to_json().unwrap()).unwrap();

        assert_eq!(json["client_id"], "c1");
        assert_eq!(json["hostname"], "h1");
        assert_eq!(json["feature_negotiation"], true);
        assert_eq!(json["heartbeat_interval"], 10_000);
        assert_eq!(json["msg_timeout"], 30_000);
        assert_eq!(json["output_buffer_size"], 16384);
        assert_eq!(json["deflate"], true);
        assert_eq!(json["deflate_level"], 6);
        assert_eq!(json["snappy"], false);
        assert_eq!(json["tls_v1"], false);
        assert_eq!(json["sample_rate"], 10);
        assert_eq!(json["user_agent"], USER_AGENT);
        assert!(json.get("output_buffer_timeout").is_none());
    }

    #[test]
    fn test_parse_plain_ok() {
        let features = NegotiatedFeatures::parse("b1:4150", b"OK").unwrap();
        assert_eq!(features, NegotiatedFeatures::default());
        assert_eq!(features.max_rdy_count, DEFAULT_MAX_RDY_COUNT);
    }

    #[test]
    fn test_parse_json_response() {
        let body = br#"{
            "max_rdy_count": 100,
            "version": "1.2.1-HA.1",
            "heartbeat_interval": 5000,
            "msg_timeout": 60000
        }"#;
        let features = NegotiatedFeatures::parse("b1:4150", body).unwrap();

        assert_eq!(features.max_rdy_count, 100);
        assert_eq!(features.version, "1.2.1-HA.1");
        assert_eq!(
            features.effective_heartbeat(Duration::from_secs(20)),
            Duration::from_secs(5)
        );
        assert_eq!(features.required_upgrade(), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NegotiatedFeatures::parse("b1:4150", b"E_BAD_BODY").is_err());
    }

    #[test]
    fn test_effective_heartbeat_falls_back() {
        let features = NegotiatedFeatures { heartbeat_interval: Some(-1), ..Default::default() };
        assert_eq!(features.effective_heartbeat(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_required_upgrade() {
        let features = NegotiatedFeatures { snappy: true, ..Default::default() };
        assert_eq!(features.required_upgrade(), Some("snappy"));
        let features = NegotiatedFeatures { tls_v1: true, deflate: true, ..Default::default() };
        assert_eq!(features.required_upgrade(), Some("tls_v1"));
    }
}
