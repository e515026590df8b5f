//! Shared lookupd node records.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::address::Address;

/// A lookupd node discovered through some seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupNode {
    cluster_id: String,
    address: Address,
    ref_count: u64,
}

impl LookupNode {
    /// Returns the id of the cluster (seed) that first discovered this node.
    #[must_use]
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Returns the node's HTTP address.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Returns how many resolvers currently hold this node.
    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.ref_count
    }
}

/// Arena of [`LookupNode`]s shared by every resolver of a registry.
///
/// A node lives while at least one resolver holds it. Resolvers keep only
/// addresses; an address whose node was evicted is simply absent here.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Mutex<HashMap<Address, LookupNode>>,
}

impl NodeArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one more holder of `address`, creating the node if needed.
    ///
    /// Returns the node's reference count after the increment.
    pub fn adopt(&self, cluster_id: &str, address: &Address) -> u64 {
        let mut nodes = self.nodes.lock();
        let node = nodes.entry(address.clone()).or_insert_with(|| LookupNode {
            cluster_id: cluster_id.to_owned(),
            address: address.clone(),
            ref_count: 0,
        });
        node.ref_count += 1;
        node.ref_count
    }

    /// Drops one holder of `address`, evicting the node when none remain.
    ///
    /// Returns the remaining count, or `None` if the node was not present.
    pub fn release(&self, address: &Address) -> Option<u64> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(address)?;
        node.ref_count = node.ref_count.saturating_sub(1);
        let remaining = node.ref_count;
        if remaining == 0 {
            nodes.remove(address);
        }
        Some(remaining)
    }

    /// Returns true while some resolver holds `address`.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.lock().contains_key(address)
    }

    /// Returns a snapshot of the node at `address`.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<LookupNode> {
        self.nodes.lock().get(address).cloned()
    }

    /// Returns the reference count of `address`, 0 when absent.
    #[must_use]
    pub fn ref_count(&self, address: &Address) -> u64 {
        self.nodes.lock().get(address).map_or(0, |node| node.ref_count)
    }

    /// Returns the number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Returns true if no node is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}
