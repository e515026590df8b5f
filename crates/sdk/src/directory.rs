//! HTTP contract of the directory service (lookupd).
//!
//! Two endpoints are consumed:
//! - `GET /listlookup` lists every lookupd node of a cluster. Seeds that
//!   predate the endpoint answer 404.
//! - `GET /lookup?topic=T` lists the brokers (producers) serving a topic.
//!
//! [`DirectoryClient`] is the seam resolvers and the topology client talk
//! through; [`HttpDirectoryClient`] is the production implementation.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use snafu::ResultExt;
use tracing::debug;

use crate::{
    address::Address,
    error::{DecodeSnafu, HttpStatusSnafu, Result, SdkError, TimeoutSnafu},
    identity::USER_AGENT,
};

/// Result of a `listlookup` query against a seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListLookupOutcome {
    /// The seed reported these lookupd nodes.
    Nodes(Vec<Address>),
    /// The seed does not implement `listlookup`; it is its own only node.
    Legacy,
    /// The response carried no `lookupdnodes` field.
    MissingNodes,
}

/// Queries against the directory service.
#[async_trait]
pub trait DirectoryClient: Send + Sync + fmt::Debug {
    /// Lists the lookupd nodes known to `seed`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the seed is unreachable, times out, or
    /// answers with an unexpected status or body.
    async fn list_lookup(&self, seed: &Address) -> Result<ListLookupOutcome>;

    /// Lists the broker TCP addresses serving `topic`, as reported by `node`.
    ///
    /// An unknown topic yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the node is unreachable, times out, or
    /// answers with an unexpected status or body.
    async fn lookup_topic(&self, node: &Address, topic: &str) -> Result<Vec<Address>>;
}

/// [`DirectoryClient`] over HTTP with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpDirectoryClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpDirectoryClient {
    /// Creates a client whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).user_agent(USER_AGENT).build()?;
        Ok(Self { http, timeout })
    }

    /// Issues a GET and returns the status and body. Timeouts surface as
    /// [`SdkError::Timeout`].
    async fn get(&self, url: &str) -> Result<(StatusCode, bytes::Bytes)> {
        let response = self.http.get(url).send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        Ok((status, body))
    }

    fn classify(&self, error: reqwest::Error) -> SdkError {
        if error.is_timeout() {
            let duration_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
            TimeoutSnafu { duration_ms }.build()
        } else {
            SdkError::from(error)
        }
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn list_lookup(&self, seed: &Address) -> Result<ListLookupOutcome> {
        let url = format!("{}/listlookup", seed.http_url());
        let (status, body) = self.get(&url).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(ListLookupOutcome::Legacy);
        }
        if !status.is_success() {
            return HttpStatusSnafu { url, status: status.as_u16() }.fail();
        }

        let parsed: ListLookupResponse =
            serde_json::from_slice(&body).context(DecodeSnafu { url: url.clone() })?;

        let Some(nodes) = parsed.into_nodes() else {
            return Ok(ListLookupOutcome::MissingNodes);
        };

        debug!(url = %url, count = nodes.len(), "listlookup answered");
        Ok(ListLookupOutcome::Nodes(nodes))
    }

    async fn lookup_topic(&self, node: &Address, topic: &str) -> Result<Vec<Address>> {
        let url = format!("{}/lookup?topic={topic}", node.http_url());
        let (status, body) = self.get(&url).await?;

        if status == StatusCode::NOT_FOUND {
            debug!(url = %url, topic, "topic unknown to lookupd");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return HttpStatusSnafu { url, status: status.as_u16() }.fail();
        }

        let parsed: LookupResponse =
            serde_json::from_slice(&body).context(DecodeSnafu { url: url.clone() })?;
        Ok(parsed.into_brokers())
    }
}

/// `listlookup` body, optionally wrapped in `data`.
#[derive(Debug, Deserialize)]
struct ListLookupResponse {
    #[serde(default)]
    lookupdnodes: Option<Vec<NodeDescriptor>>,
    #[serde(default)]
    data: Option<ListLookupData>,
}

#[derive(Debug, Deserialize)]
struct ListLookupData {
    #[serde(default)]
    lookupdnodes: Option<Vec<NodeDescriptor>>,
}

impl ListLookupResponse {
    fn into_nodes(self) -> Option<Vec<Address>> {
        let nodes = self.lookupdnodes.or_else(|| self.data.and_then(|d| d.lookupdnodes))?;
        Some(nodes.into_iter().map(|n| Address::new(n.node_ip, n.http_port.0, "")).collect())
    }
}

#[derive(Debug, Deserialize)]
struct NodeDescriptor {
    #[serde(rename = "NodeIP")]
    node_ip: String,
    #[serde(rename = "HttpPort")]
    http_port: Port,
}

/// `lookup` body: producers at the top level or under `data`.
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Option<Vec<Producer>>,
    #[serde(default)]
    data: Option<LookupData>,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

impl LookupResponse {
    fn into_brokers(self) -> Vec<Address> {
        let producers =
            self.producers.or_else(|| self.data.map(|d| d.producers)).unwrap_or_default();
        let mut brokers: Vec<Address> = producers
            .into_iter()
            .map(|p| Address::new(p.broadcast_address, p.tcp_port.0, p.version))
            .collect();
        brokers.sort();
        brokers.dedup();
        brokers
    }
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: Port,
    #[serde(default)]
    version: String,
}

/// Port encoded either as a JSON number or a numeric string.
#[derive(Debug, Clone, Copy)]
struct Port(u16);

impl<'de> Deserialize<'de> for Port {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(port) => Ok(Self(port)),
            Raw::Text(text) => text.trim().parse().map(Self).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::mock::MockLookupd;

    #[test]
    fn test_parse_listlookup_nodes() {
        let body = br#"{"lookupdnodes": [
            {"NodeIP": "10.0.0.1", "HttpPort": "4161"},
            {"NodeIP": "10.0.0.2", "HttpPort": 4161}
        ]}"#;
        let parsed: ListLookupResponse = serde_json::from_slice(body).unwrap();
        let nodes = parsed.into_nodes().unwrap();
        assert_eq!(
            nodes,
            vec![Address::new("10.0.0.1", 4161, ""), Address::new("10.0.0.2", 4161, "")]
        );
    }

    #[test]
    fn test_parse_listlookup_missing_nodes() {
        let parsed: ListLookupResponse = serde_json::from_slice(br#"{"status":"ok"}"#).unwrap();
        assert!(parsed.into_nodes().is_none());
    }

    #[test]
    fn test_parse_lookup_top_level_producers() {
        let body = br#"{"producers": [
            {"broadcast_address": "b2", "tcp_port": 4150, "version": "1.0"},
            {"broadcast_address": "b1", "tcp_port": 4150}
        ]}"#;
        let parsed: LookupResponse = serde_json::from_slice(body).unwrap();
        let brokers = parsed.into_brokers();
        assert_eq!(brokers, vec![Address::new("b1", 4150, ""), Address::new("b2", 4150, "")]);
        assert_eq!(brokers[1].version(), "1.0");
    }

    #[test]
    fn test_parse_lookup_data_wrapped() {
        let body = br#"{"status_code": 200, "data": {
            "channels": [],
            "producers": [
                {"broadcast_address": "b1", "tcp_port": "4150", "version": "0.3.7-HA.1.5"}
            ]
        }}"#;
        let parsed: LookupResponse = serde_json::from_slice(body).unwrap();
        let brokers = parsed.into_brokers();
        assert_eq!(brokers.len(), 1);
        assert!(brokers[0].is_high_availability());
    }

    #[test]
    fn test_parse_lookup_dedups() {
        let body = br#"{"producers": [
            {"broadcast_address": "b1", "tcp_port": 4150},
            {"broadcast_address": "b1", "tcp_port": 4150, "version": "x"}
        ]}"#;
        let parsed: LookupResponse = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed.into_brokers().len(), 1);
    }

    #[tokio::test]
    async fn test_list_lookup_against_mock() {
        let mock = MockLookupd::start().await.unwrap();
        mock.set_lookupd_nodes(vec![Address::new("n1", 4161, ""), Address::new("n2", 4161, "")]);

        let client = HttpDirectoryClient::new(Duration::from_secs(2)).unwrap();
        let outcome = client.list_lookup(&mock.address()).await.unwrap();

        assert_eq!(
            outcome,
            ListLookupOutcome::Nodes(vec![
                Address::new("n1", 4161, ""),
                Address::new("n2", 4161, "")
            ])
        );
    }

    #[tokio::test]
    async fn test_list_lookup_legacy_on_404() {
        let mock = MockLookupd::start().await.unwrap();
        mock.set_legacy(true);

        let client = HttpDirectoryClient::new(Duration::from_secs(2)).unwrap();
        let outcome = client.list_lookup(&mock.address()).await.unwrap();
        assert_eq!(outcome, ListLookupOutcome::Legacy);
    }

    #[tokio::test]
    async fn test_lookup_topic_against_mock() {
        let mock = MockLookupd::start().await.unwrap();
        mock.set_producers("orders", vec![Address::new("b1", 4150, "1.0")]);

        let client = HttpDirectoryClient::new(Duration::from_secs(2)).unwrap();
        let brokers = client.lookup_topic(&mock.address(), "orders").await.unwrap();
        assert_eq!(brokers, vec![Address::new("b1", 4150, "")]);

        let unknown = client.lookup_topic(&mock.address(), "missing").await.unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_status() {
        let mock = MockLookupd::start().await.unwrap();
        mock.set_fail_with(Some(503));

        let client = HttpDirectoryClient::new(Duration::from_secs(2)).unwrap();
        let err = client.lookup_topic(&mock.address(), "orders").await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transport_error() {
        let client = HttpDirectoryClient::new(Duration::from_millis(500)).unwrap();
        let err = client.list_lookup(&Address::new("127.0.0.1", 1, "")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
