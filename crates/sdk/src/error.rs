//! SDK-specific error types with recovery context.
//!
//! Provides a two-tier error model:
//! - **Transport errors**: Directory HTTP failures, broker socket failures, timeouts
//! - **Session errors**: Handshake rejection, protocol violations, missed heartbeats
//!
//! Errors include retryability classification. Topology that is simply empty
//! (no lookupd node, no broker for a topic) is never an error; callers see an
//! absent value or an empty convergence report instead.

use snafu::{Location, Snafu};

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

/// SDK error types with context-rich error messages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SdkError {
    /// Failed to reach a directory node or broker.
    #[snafu(display("Connection error at {location}: {message}"))]
    Connection {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// HTTP request to a lookupd node failed.
    #[snafu(display("HTTP error at {location}: {source}"))]
    Http {
        /// Underlying HTTP client error.
        source: reqwest::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Socket I/O failed on a broker session.
    #[snafu(display("I/O error at {location}: {source}"))]
    Io {
        /// Underlying I/O error.
        source: std::io::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Directory node answered with an unexpected status code.
    #[snafu(display("Unexpected HTTP status {status} from {url}"))]
    HttpStatus {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Response body could not be decoded.
    #[snafu(display("Failed to decode response from {url}: {source}"))]
    Decode {
        /// Request URL.
        url: String,
        /// JSON decoding error.
        source: serde_json::Error,
    },

    /// Broker rejected or failed the IDENTIFY/SUB handshake.
    #[snafu(display("Handshake with {address} failed: {message}"))]
    Handshake {
        /// Broker address (`host:port`).
        address: String,
        /// Failure description.
        message: String,
    },

    /// Broker sent a frame this client cannot interpret.
    #[snafu(display("Protocol error: {message}"))]
    Protocol {
        /// Error description.
        message: String,
    },

    /// No frame arrived within the heartbeat deadline.
    #[snafu(display("Heartbeat deadline missed on {address}"))]
    HeartbeatMissed {
        /// Broker address (`host:port`).
        address: String,
    },

    /// Retry attempts exhausted.
    #[snafu(display("Retry exhausted after {attempts} attempts: {last_error}"))]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last error message before giving up.
        last_error: String,
        /// Per-attempt error descriptions, in order.
        attempt_history: Vec<(u32, String)>,
    },

    /// Configuration validation error.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },

    /// Address string could not be parsed.
    #[snafu(display("Invalid address '{address}': {message}"))]
    InvalidAddress {
        /// The invalid address.
        address: String,
        /// Parse error description.
        message: String,
    },

    /// Operation timed out.
    #[snafu(display("Operation timed out after {duration_ms}ms"))]
    Timeout {
        /// Timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Connection is closed or draining and cannot accept commands.
    #[snafu(display("Connection to {address} is closed"))]
    ConnectionClosed {
        /// Broker address (`host:port`).
        address: String,
    },

    /// Operation was cancelled by its owner.
    #[snafu(display("Operation cancelled"))]
    Cancelled,

    /// Client is shutting down.
    #[snafu(display("Client shutting down"))]
    Shutdown,
}

impl SdkError {
    /// Returns true if the error is transient and the operation should be retried.
    ///
    /// Retryable errors:
    /// - Connection, HTTP and socket failures
    /// - Timeouts
    /// - 5xx responses from a lookupd node
    ///
    /// Non-retryable errors:
    /// - Handshake rejection (retried by the next convergence, not in place)
    /// - Configuration and address errors
    /// - Cancellation and shutdown
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Http { .. } => true,
            Self::Io { .. } => true,
            Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            // Non-retryable
            Self::Decode { .. } => false,
            Self::Handshake { .. } => false,
            Self::Protocol { .. } => false,
            Self::HeartbeatMissed { .. } => false,
            Self::RetryExhausted { .. } => false,
            Self::Config { .. } => false,
            Self::InvalidAddress { .. } => false,
            Self::ConnectionClosed { .. } => false,
            Self::Cancelled => false,
            Self::Shutdown => false,
        }
    }

    /// Returns the HTTP status code if this is a status error.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(source: reqwest::Error) -> Self {
        Self::Http { source, location: Location::default() }
    }
}

impl From<std::io::Error> for SdkError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source, location: Location::default() }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_is_retryable() {
        let err = SdkError::Connection {
            message: "connection refused".to_owned(),
            location: Location::default(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_io_error_is_retryable() {
        let err: SdkError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, SdkError::Io { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(SdkError::Timeout { duration_ms: 1000 }.is_retryable());
    }

    #[test]
    fn test_server_error_status_is_retryable() {
        let err = SdkError::HttpStatus { url: "http://n1:4161/lookup".to_owned(), status: 503 };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_error_status_not_retryable() {
        let err = SdkError::HttpStatus { url: "http://n1:4161/lookup".to_owned(), status: 400 };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_handshake_not_retryable() {
        let err = SdkError::Handshake {
            address: "b1:4150".to_owned(),
            message: "E_BAD_BODY".to_owned(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("b1:4150"));
    }

    #[test]
    fn test_heartbeat_missed_not_retryable() {
        let err = SdkError::HeartbeatMissed { address: "b1:4150".to_owned() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_config_error_not_retryable() {
        let err = SdkError::Config { message: "invalid config".to_owned() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cancelled_not_retryable() {
        assert!(!SdkError::Cancelled.is_retryable());
        assert!(!SdkError::Shutdown.is_retryable());
    }

    #[test]
    fn test_status_accessor() {
        let err = SdkError::HttpStatus { url: "http://n1:4161/listlookup".to_owned(), status: 404 };
        assert_eq!(err.status(), Some(404));

        let err2 = SdkError::Timeout { duration_ms: 1000 };
        assert_eq!(err2.status(), None);
    }
}
