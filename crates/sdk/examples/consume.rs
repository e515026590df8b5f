//! Consumes a topic until Ctrl-C.
//!
//! Run: `cargo run --example consume -- --lookupd 127.0.0.1:4161 --topic orders --channel billing`
//!
//! This example shows:
//! - Building a configuration from command line flags
//! - Sharing one seed registry with background refresh
//! - Handling messages with a custom [`MessageHandler`]
//! - Requeueing instead of finishing on failure
//! - Graceful shutdown

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use nsq_sdk::{ClientConfig, Consumer, Message, MessageHandler, Result, SeedRegistry};
use tracing_subscriber::EnvFilter;

struct Printer {
    handled: AtomicU64,
}

#[async_trait]
impl MessageHandler for Printer {
    async fn handle(&self, message: &Message) {
        let n = self.handled.fetch_add(1, Ordering::Relaxed) + 1;
        match std::str::from_utf8(message.body()) {
            Ok(text) => println!("#{n} [{}] {text}", message.broker()),
            Err(_) => {
                // Binary payloads go back for another consumer.
                if let Err(e) = message.requeue(Duration::from_secs(5)) {
                    eprintln!("requeue failed: {e}");
                }
            },
        }
    }
}

fn flag<'a>(args: &'a [String], name: &str, default: &'a str) -> &'a str {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map_or(default, String::as_str)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let lookupd = flag(&args, "--lookupd", "127.0.0.1:4161");
    let topic = flag(&args, "--topic", "orders");
    let channel = flag(&args, "--channel", "billing");

    // -------------------------------------------------------------------------
    // 1. Configure and share the seed registry
    // -------------------------------------------------------------------------
    let config = ClientConfig::builder()
        .with_lookup_address(lookupd)
        .with_channel(channel)
        .with_worker_pool_size(8)
        .build()?;

    let registry = SeedRegistry::from_config(&config)?;
    registry.start_background_refresh();

    // -------------------------------------------------------------------------
    // 2. Subscribe and start
    // -------------------------------------------------------------------------
    let consumer = Consumer::new(config, registry.clone(), Printer { handled: AtomicU64::new(0) })?;
    consumer.subscribe(topic).await?;
    consumer.start().await?;
    println!("consuming {topic}/{channel} via {lookupd}, Ctrl-C to stop");

    // -------------------------------------------------------------------------
    // 3. Shut down
    // -------------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    consumer.close().await;
    registry.shutdown();
    Ok(())
}
