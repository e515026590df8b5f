//! Broker sessions: wire protocol, session state machine and the connector seam.

mod broker;
mod connector;
mod protocol;

pub use broker::{BrokerConnection, CloseReason, ConnectionState, MessageSink, SessionRequest};
pub use connector::{BrokerConnector, TcpConnector};
pub use protocol::{
    CLOSE_WAIT, Command, CommandCodec, Frame, FrameCodec, HEARTBEAT, MAGIC_V2, MessageId,
    RawMessage,
};
