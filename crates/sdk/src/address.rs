//! Host/port identity of a lookupd node or broker.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::OnceLock,
};

use crate::error::{InvalidAddressSnafu, Result, SdkError};

/// Version marker carried by brokers built with high-availability support.
const HA_VERSION_MARKER: &str = "-HA.";

/// Network identity of a directory node or broker.
///
/// Ordering is lexicographic by host, then numeric by port. Equality and
/// hashing consider host and port only; two addresses that differ only in
/// `version` are the same endpoint.
#[derive(Debug, Clone)]
pub struct Address {
    host: String,
    port: u16,
    version: String,
    high_availability: OnceLock<bool>,
}

impl Address {
    /// Creates an address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, version: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            version: version.into(),
            high_availability: OnceLock::new(),
        }
    }

    /// Returns the host name or IP.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the version reported by the directory, empty when unknown.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns whether the endpoint advertises high-availability support.
    ///
    /// True iff the version contains `-HA.`. Computed on first access.
    #[must_use]
    pub fn is_high_availability(&self) -> bool {
        *self.high_availability.get_or_init(|| self.version.contains(HA_VERSION_MARKER))
    }

    /// Returns `http://host:port`.
    #[must_use]
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host.cmp(&other.host).then_with(|| self.port.cmp(&other.port))
    }
}

impl FromStr for Address {
    type Err = SdkError;

    /// Parses `host:port`, tolerating an `http://` or `https://` prefix and a
    /// trailing slash.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let rest = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        let Some((host, port)) = rest.rsplit_once(':') else {
            return InvalidAddressSnafu { address: s, message: "expected host:port" }.fail();
        };

        if host.is_empty() {
            return InvalidAddressSnafu { address: s, message: "host cannot be empty" }.fail();
        }

        let port = port.parse::<u16>().map_err(|e| {
            InvalidAddressSnafu { address: s, message: format!("invalid port: {e}") }.build()
        })?;

        Ok(Self::new(host, port, ""))
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptest_tests {
    use nsq_test_utils::strategies::{arb_host, arb_port, arb_version};
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Property: different hosts order lexicographically regardless of port and version
        #[test]
        fn prop_host_order_dominates(
            h1 in arb_host(),
            h2 in arb_host(),
            p1 in arb_port(),
            p2 in arb_port(),
            v1 in arb_version(),
            v2 in arb_version(),
        ) {
            prop_assume!(h1 != h2);
            let a = Address::new(h1.clone(), p1, v1);
            let b = Address::new(h2.clone(), p2, v2);
            prop_assert_eq!(a.cmp(&b), h1.cmp(&h2));
        }

        /// Property: equal hosts order numerically by port
        #[test]
        fn prop_port_order_for_equal_hosts(
            host in arb_host(),
            p1 in arb_port(),
            p2 in arb_port(),
        ) {
            let a = Address::new(host.clone(), p1, "");
            let b = Address::new(host, p2, "");
            prop_assert_eq!(a.cmp(&b), p1.cmp(&p2));
        }

        /// Property: version never affects equality
        #[test]
        fn prop_version_ignored_by_eq(
            host in arb_host(),
            port in arb_port(),
            v1 in arb_version(),
            v2 in arb_version(),
        ) {
            prop_assert_eq!(Address::new(host.clone(), port, v1), Address::new(host, port, v2));
        }
    }
}
