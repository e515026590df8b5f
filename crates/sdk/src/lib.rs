//! Rust client SDK for NSQ consumers.
//!
//! This SDK discovers brokers through lookupd, keeps one subscribed session
//! per broker serving a topic, and bounds the number of messages in flight
//! with per-connection ready counts.
//!
//! # Features
//!
//! - **Seed resolution**: a seed lookupd address expands into every lookupd
//!   node of its cluster via `listlookup`, with a fallback for legacy seeds
//! - **Shared caching**: consumers built from the same seeds share one
//!   reference-counted resolver per seed
//! - **Topology convergence**: broker sessions follow `/lookup` by set
//!   difference; surviving sessions are never torn down
//! - **Flow control**: worker capacity is split across a topic's sessions
//!   and pushed to brokers as `RDY`
//!
//! # Quick Start
//!
//! ```no_run
//! use nsq_sdk::{ClientConfig, Consumer, Message, SeedRegistry};
//!
//! #[tokio::main]
//! async fn main() -> nsq_sdk::Result<()> {
//!     let config = ClientConfig::builder()
//!         .with_lookup_address("127.0.0.1:4161")
//!         .with_channel("billing")
//!         .with_worker_pool_size(12)
//!         .build()?;
//!
//!     let registry = SeedRegistry::from_config(&config)?;
//!     registry.start_background_refresh();
//!
//!     let consumer = Consumer::new(config, registry.clone(), |message: &Message| {
//!         println!("received {} bytes", message.body().len());
//!     })?;
//!     consumer.subscribe("orders").await?;
//!     consumer.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     consumer.close().await;
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Consumer (Public API)                    │
//! │   .subscribe() │ .start() │ .close() │ worker pool          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    ConnectionManager                        │
//! │   Per-topic convergence │ Ready-count distribution          │
//! ├─────────────────────────────────────────────────────────────┤
//! │          TopologyClient          │     BrokerConnection     │
//! │   /lookup?topic with retry       │  IDENTIFY │ SUB │ RDY    │
//! ├──────────────────────────────────┤  heartbeat │ FIN │ REQ   │
//! │   SeedRegistry → SeedResolver    │                          │
//! │   /listlookup │ NodeArena        │                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod address;
mod config;
pub mod connection;
mod consumer;
mod directory;
mod error;
mod identity;
mod lookup;
mod manager;
mod message;
pub mod mock;
mod retry;
mod topology;

// Public API exports
pub use address::Address;
pub use config::{
    ClientConfig, ClientConfigBuilder, Compression, RefreshConfig, RetryPolicy, RetryPolicyBuilder,
};
pub use connection::{
    BrokerConnection, BrokerConnector, CloseReason, ConnectionState, MessageSink, SessionRequest,
    TcpConnector,
};
pub use consumer::{Consumer, MessageHandler};
pub use directory::{DirectoryClient, HttpDirectoryClient, ListLookupOutcome};
pub use error::{Result, SdkError};
pub use identity::{
    ClientIdentity, DEFAULT_MAX_RDY_COUNT, HandshakeOptions, NegotiatedFeatures, USER_AGENT,
};
pub use lookup::{
    LookupNode, NodeArena, ReleaseOutcome, ResolveOutcome, SeedRegistry, SeedResolver,
};
pub use manager::{ConnectionManager, ConvergeReport, ReadyPolicy};
pub use message::Message;
pub use retry::with_retry_cancellable;
pub use topology::TopologyClient;
