//! Proptest strategies for NSQ topology values.
//!
//! Generators produce plain values (strings and integers) so that any crate
//! can build its own domain types from them without depending back on the SDK.
//!
//! # Usage
//!
//! ```no_run
//! use nsq_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(host in strategies::arb_host(), port in strategies::arb_port()) {
//!         // build an address from host and port, test an invariant
//!     }
//! }
//! ```

use proptest::prelude::*;

/// Generates a host: either a DNS-style name or a dotted IPv4 literal.
pub fn arb_host() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z][a-z0-9-]{0,15}(\\.[a-z][a-z0-9]{0,7}){0,2}",
        (any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>())
            .prop_map(|(a, b, c, d)| format!("{a}.{b}.{c}.{d}")),
    ]
}

/// Generates any TCP port.
pub fn arb_port() -> impl Strategy<Value = u16> {
    any::<u16>()
}

/// Generates a broker version string, sometimes carrying the `-HA.` marker
/// and sometimes empty.
pub fn arb_version() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        (0u8..2, 0u8..20, 0u8..20).prop_map(|(a, b, c)| format!("{a}.{b}.{c}")),
        (0u8..2, 0u8..20, 0u8..20).prop_map(|(a, b, c)| format!("{a}.{b}.{c}-HA.1.{c}")),
    ]
}

/// Generates a valid topic or channel name of 1-32 characters.
pub fn arb_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,31}"
}

/// Generates a distinct, sorted set of `host:port` broker addresses.
pub fn arb_broker_set() -> impl Strategy<Value = Vec<(String, u16)>> {
    proptest::collection::btree_set(("b[0-9]{1,2}", 4150u16..4160), 0..8)
        .prop_map(|set| set.into_iter().collect())
}
