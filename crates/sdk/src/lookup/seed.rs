//! Resolution of one seed lookupd address into the cluster's lookupd nodes.

use std::{
    collections::HashSet,
    fmt,
    net::IpAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::{
    node::NodeArena,
    registry::{RegistryInner, ReleaseOutcome},
};
use crate::{
    address::Address,
    directory::{DirectoryClient, ListLookupOutcome},
};

/// What a call to [`SeedResolver::resolve`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Not forced and nodes were already known; no query was made.
    Cached,
    /// `listlookup` answered; `added` previously unknown nodes were merged.
    Merged {
        /// Number of nodes new to this resolver.
        added: usize,
    },
    /// The seed predates `listlookup` and was merged as its own node.
    LegacyFallback,
    /// The answer carried no node list. Nothing changed.
    Empty,
    /// The seed could not be reached. Nothing changed.
    Failed,
    /// The resolver was already cleaned; it no longer resolves.
    Retired,
}

#[derive(Debug, Default)]
struct ResolverState {
    /// Node addresses in discovery order.
    resolved: Vec<Address>,
    in_use: HashSet<Address>,
    retired: bool,
}

/// Rotating view of the lookupd nodes behind one seed address.
///
/// Instances are shared through a [`SeedRegistry`](super::SeedRegistry),
/// one per seed. Node records live in the registry's [`NodeArena`]; the
/// resolver only keeps their addresses, and an address whose node has been
/// evicted is skipped by [`pick_one`](Self::pick_one).
pub struct SeedResolver {
    seed: Address,
    cluster_id: String,
    arena: Arc<NodeArena>,
    directory: Arc<dyn DirectoryClient>,
    registry: Weak<RegistryInner>,
    local_ip: IpAddr,
    state: RwLock<ResolverState>,
    rotation: AtomicU64,
    refs: AtomicI64,
}

impl SeedResolver {
    pub(crate) fn new(
        seed: Address,
        arena: Arc<NodeArena>,
        directory: Arc<dyn DirectoryClient>,
        registry: Weak<RegistryInner>,
        local_ip: IpAddr,
    ) -> Self {
        Self {
            cluster_id: seed.to_string(),
            seed,
            arena,
            directory,
            registry,
            local_ip,
            state: RwLock::new(ResolverState::default()),
            rotation: AtomicU64::new(0),
            refs: AtomicI64::new(0),
        }
    }

    /// Returns the seed address.
    #[must_use]
    pub fn seed(&self) -> &Address {
        &self.seed
    }

    /// Returns the cluster id stamped on nodes this resolver discovers.
    #[must_use]
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Returns the resolved node addresses, live or not, in discovery order.
    #[must_use]
    pub fn resolved(&self) -> Vec<Address> {
        self.state.read().resolved.clone()
    }

    /// Returns the resolved addresses whose node is still live.
    #[must_use]
    pub fn live_nodes(&self) -> Vec<Address> {
        let state = self.state.read();
        state.resolved.iter().filter(|addr| self.arena.contains(addr)).cloned().collect()
    }

    /// Returns the number of addresses marked in use.
    #[must_use]
    pub fn in_use_len(&self) -> usize {
        self.state.read().in_use.len()
    }

    /// Returns the resolver's own reference count.
    #[must_use]
    pub fn reference_count(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Returns true once the resolver has been cleaned.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.state.read().retired
    }

    /// Refreshes the node set from the seed's `listlookup` endpoint.
    ///
    /// Unless `force` is set, a resolver that already knows some node answers
    /// [`ResolveOutcome::Cached`] without touching the network. New nodes are
    /// merged; known ones are left alone. Failures are logged and reported
    /// through the outcome, never as an error.
    pub async fn resolve(&self, force: bool) -> ResolveOutcome {
        {
            let state = self.state.read();
            if state.retired {
                return ResolveOutcome::Retired;
            }
            if !force && !state.resolved.is_empty() {
                return ResolveOutcome::Cached;
            }
        }

        debug!(seed = %self.seed, force, "querying listlookup");

        match self.directory.list_lookup(&self.seed).await {
            Ok(ListLookupOutcome::Nodes(nodes)) => match self.merge(&nodes) {
                Some(added) => {
                    debug!(seed = %self.seed, total = nodes.len(), added, "lookupd nodes merged");
                    ResolveOutcome::Merged { added }
                },
                None => ResolveOutcome::Retired,
            },
            Ok(ListLookupOutcome::Legacy) => {
                let seed = self.seed.clone();
                match self.merge(std::slice::from_ref(&seed)) {
                    Some(_) => {
                        info!(
                            seed = %self.seed,
                            "seed lookupd has no listlookup endpoint, using it as the only node"
                        );
                        ResolveOutcome::LegacyFallback
                    },
                    None => ResolveOutcome::Retired,
                }
            },
            Ok(ListLookupOutcome::MissingNodes) => {
                error!(seed = %self.seed, "listlookup response carries no lookupd nodes");
                ResolveOutcome::Empty
            },
            Err(e) => {
                warn!(
                    seed = %self.seed,
                    local_ip = %self.local_ip,
                    error = %e,
                    "failed to reach seed lookupd, will retry on the next round"
                );
                ResolveOutcome::Failed
            },
        }
    }

    /// Returns one live lookupd node, rotating over the live set.
    ///
    /// Performs a non-forced [`resolve`](Self::resolve) first. Returns `None`
    /// when no node is live.
    pub async fn pick_one(&self) -> Option<Address> {
        self.resolve(false).await;

        let state = self.state.read();
        let live: Vec<&Address> =
            state.resolved.iter().filter(|addr| self.arena.contains(addr)).collect();
        if live.is_empty() {
            return None;
        }

        let len = live.len() as u64;
        let previous = self
            .rotation
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| Some((i % len + 1) % len))
            .unwrap_or_else(|i| i);
        let index = usize::try_from(previous % len).ok()?;
        live.get(index).map(|addr| (*addr).clone())
    }

    /// Takes one more reference through the owning registry.
    ///
    /// Returns the new count, or `None` if this resolver is no longer
    /// registered (a fresh one must be acquired instead).
    pub fn acquire_reference(self: &Arc<Self>) -> Option<i64> {
        let registry = self.registry.upgrade()?;
        registry.add_reference(self)
    }

    /// Drops one reference through the owning registry.
    ///
    /// The last release removes the resolver from the registry and cleans it.
    pub fn release_reference(self: &Arc<Self>) -> ReleaseOutcome {
        match self.registry.upgrade() {
            Some(registry) => registry.release(self),
            None => {
                let remaining = self.decrement();
                if remaining > 0 {
                    return ReleaseOutcome::Retained { remaining };
                }
                self.clean();
                ReleaseOutcome::Removed
            },
        }
    }

    /// Adds unknown addresses to the set. Returns `None` once retired.
    fn merge(&self, nodes: &[Address]) -> Option<usize> {
        let mut state = self.state.write();
        if state.retired {
            return None;
        }

        let mut added = 0;
        for node in nodes {
            if state.in_use.contains(node) {
                continue;
            }
            self.arena.adopt(&self.cluster_id, node);
            state.in_use.insert(node.clone());
            state.resolved.push(node.clone());
            added += 1;
        }
        Some(added)
    }

    pub(crate) fn increment(&self) -> i64 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn decrement(&self) -> i64 {
        self.refs.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Releases every held node and retires the resolver. Idempotent.
    pub(crate) fn clean(&self) {
        let mut state = self.state.write();
        if state.retired {
            return;
        }
        for node in state.resolved.drain(..) {
            self.arena.release(&node);
        }
        state.in_use.clear();
        state.retired = true;
        debug!(seed = %self.seed, "seed resolver cleaned");
    }

    #[cfg(test)]
    pub(crate) fn set_rotation(&self, value: u64) {
        self.rotation.store(value, Ordering::Relaxed);
    }
}

impl fmt::Debug for SeedResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SeedResolver")
            .field("seed", &self.seed)
            .field("resolved", &state.resolved.len())
            .field("retired", &state.retired)
            .field("refs", &self.reference_count())
            .finish()
    }
}
