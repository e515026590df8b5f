//! Opening broker sessions.

use std::fmt;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::broker::{BrokerConnection, ConnectionState, SessionRequest};
use crate::error::{ConnectionSnafu, Result, TimeoutSnafu};

/// Opens subscribed sessions to brokers.
///
/// The connection manager only talks to brokers through this trait, so
/// convergence can be exercised against in-memory brokers.
#[async_trait]
pub trait BrokerConnector: Send + Sync + fmt::Debug {
    /// Connects to `request.address`, performs the handshake and subscribes.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the broker is unreachable or the
    /// attempt exceeds `request.connect_timeout`, and
    /// [`SdkError::Handshake`](crate::SdkError::Handshake) if the broker
    /// rejects the session.
    async fn connect(&self, request: SessionRequest) -> Result<BrokerConnection>;
}

/// [`BrokerConnector`] over plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl BrokerConnector for TcpConnector {
    async fn connect(&self, request: SessionRequest) -> Result<BrokerConnection> {
        let address = request.address.clone();
        let limit = request.connect_timeout;

        let attempt = async move {
            debug!(address = %address, state = ?ConnectionState::Connecting, "connecting");
            let stream =
                TcpStream::connect((address.host(), address.port())).await.map_err(|e| {
                    ConnectionSnafu { message: format!("failed to connect to {address}: {e}") }
                        .build()
                })?;
            stream.set_nodelay(true)?;

            debug!(address = %address, state = ?ConnectionState::Handshaking, "connected");
            BrokerConnection::handshake(stream, request).await
        };

        match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => TimeoutSnafu {
                duration_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }
            .fail(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        address::Address,
        config::ClientConfig,
        identity::{ClientIdentity, HandshakeOptions},
        mock::MockNsqd,
    };

    fn request(address: Address) -> SessionRequest {
        let config = ClientConfig::builder()
            .with_lookup_address("127.0.0.1:4161")
            .with_channel("ch")
            .build()
            .unwrap();
        let identity = ClientIdentity::from_config(&config).unwrap();
        SessionRequest {
            address,
            topic: "orders".to_owned(),
            channel: "ch".to_owned(),
            options: HandshakeOptions::new(&identity, &config),
            connect_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(200),
            sink: None,
        }
    }

    #[tokio::test]
    async fn test_tcp_connect_and_subscribe() {
        let broker = MockNsqd::start().await.unwrap();

        let conn = TcpConnector.connect(request(broker.address().clone())).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(broker.session_count(), 1);

        conn.close().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused_is_retryable() {
        let err =
            TcpConnector.connect(request(Address::new("127.0.0.1", 1, ""))).await.unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
    }
}
