//! Topic topology queries against lookupd nodes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    address::Address,
    config::RetryPolicy,
    directory::DirectoryClient,
    error::{Result, SdkError},
    lookup::SeedResolver,
    retry::with_retry_cancellable,
};

/// Asks lookupd nodes which brokers serve a topic.
#[derive(Debug, Clone)]
pub struct TopologyClient {
    directory: Arc<dyn DirectoryClient>,
    retry_policy: RetryPolicy,
}

impl TopologyClient {
    /// Creates a client querying through `directory`.
    #[must_use]
    pub fn new(directory: Arc<dyn DirectoryClient>, retry_policy: RetryPolicy) -> Self {
        Self { directory, retry_policy }
    }

    /// Lists the brokers serving `topic` according to `node`, sorted by
    /// address. Transient failures are retried per the retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Cancelled`] if `token` fires, or the last
    /// transport error once retries are exhausted.
    pub async fn lookup(
        &self,
        node: &Address,
        topic: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Address>> {
        with_retry_cancellable(&self.retry_policy, token, || {
            self.directory.lookup_topic(node, topic)
        })
        .await
    }

    /// Picks a lookupd node from the first resolver that has one and looks
    /// `topic` up on it.
    ///
    /// Returns `Ok(None)` when no resolver yields a node.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Cancelled`] if `token` fires, or the topic
    /// lookup's error.
    pub async fn discover(
        &self,
        resolvers: &[Arc<SeedResolver>],
        topic: &str,
        token: &CancellationToken,
    ) -> Result<Option<Vec<Address>>> {
        for resolver in resolvers {
            let node = tokio::select! {
                biased;
                () = token.cancelled() => return Err(SdkError::Cancelled),
                node = resolver.pick_one() => node,
            };

            let Some(node) = node else {
                debug!(seed = %resolver.seed(), topic, "seed has no live lookupd node");
                continue;
            };

            let brokers = self.lookup(&node, topic, token).await?;
            debug!(node = %node, topic, brokers = brokers.len(), "topic looked up");
            return Ok(Some(brokers));
        }

        Ok(None)
    }
}
