//! Shared test utilities for the NSQ SDK crates.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`assert_eventually_async`] - Same, for conditions that await
//! - [`strategies`] - Proptest generators for hosts, ports, versions and names

#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod assertions;
pub use assertions::{assert_eventually, assert_eventually_async};

pub mod strategies;
