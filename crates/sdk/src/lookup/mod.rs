//! Seed resolution and the shared resolver registry.
//!
//! A seed lookupd address resolves, through `listlookup`, into the lookupd
//! nodes of its cluster. [`SeedRegistry`] shares one [`SeedResolver`] per
//! seed across consumers and reclaims it when the last holder releases it.
//! Node records live in a [`NodeArena`] owned by the registry.

mod node;
mod registry;
mod seed;

pub use node::{LookupNode, NodeArena};
pub use registry::{ReleaseOutcome, SeedRegistry};
pub use seed::{ResolveOutcome, SeedResolver};
