//! Messages delivered to handlers.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use crate::{
    address::Address,
    connection::{BrokerConnection, MessageId, RawMessage},
    error::Result,
};

/// A message received from a broker, bound to the connection that delivered it.
///
/// Exactly one of [`finish`](Self::finish) or [`requeue`](Self::requeue)
/// takes effect; later responses are ignored. [`touch`](Self::touch) may be
/// called any number of times before that.
pub struct Message {
    raw: RawMessage,
    connection: BrokerConnection,
    responded: AtomicBool,
}

impl Message {
    pub(crate) fn new(raw: RawMessage, connection: BrokerConnection) -> Self {
        Self { raw, connection, responded: AtomicBool::new(false) }
    }

    /// Returns the message id.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.raw.id
    }

    /// Returns the payload.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.raw.body
    }

    /// Returns the delivery attempt, starting at 1.
    #[must_use]
    pub fn attempts(&self) -> u16 {
        self.raw.attempts
    }

    /// Returns the broker timestamp in nanoseconds since the epoch.
    #[must_use]
    pub fn timestamp_nanos(&self) -> i64 {
        self.raw.timestamp
    }

    /// Returns the topic the message was consumed from.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.connection.topic()
    }

    /// Returns the broker that delivered the message.
    #[must_use]
    pub fn broker(&self) -> &Address {
        self.connection.address()
    }

    /// Returns true once the message was finished or requeued.
    #[must_use]
    pub fn is_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Acknowledges successful processing.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConnectionClosed`](crate::SdkError::ConnectionClosed)
    /// if the delivering connection is gone.
    pub fn finish(&self) -> Result<()> {
        if self.responded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.connection.finish(self.raw.id)
    }

    /// Returns the message to the broker for redelivery after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConnectionClosed`](crate::SdkError::ConnectionClosed)
    /// if the delivering connection is gone.
    pub fn requeue(&self, delay: Duration) -> Result<()> {
        if self.responded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.connection.requeue(self.raw.id, delay)
    }

    /// Resets the broker-side timeout of this message.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConnectionClosed`](crate::SdkError::ConnectionClosed)
    /// if the delivering connection is gone.
    pub fn touch(&self) -> Result<()> {
        self.connection.touch(self.raw.id)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.raw.id)
            .field("attempts", &self.raw.attempts)
            .field("broker", self.connection.address())
            .field("body_len", &self.raw.body.len())
            .field("responded", &self.is_responded())
            .finish()
    }
}
