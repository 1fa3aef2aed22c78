//! Immutable routing snapshots and the lock-free holder that publishes them.
//!
//! Discovery builds a complete [`RoutingTable`] off to the side and hands it to
//! [`RouteStore::install`], which swaps the active snapshot in one atomic store.
//! Request handlers call [`RouteStore::snapshot`] once and keep the returned
//! `Arc` for the rest of the request, so a concurrent install never changes the
//! candidates a request is iterating over.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::registry::NodeDescriptor;

/// All nodes able to serve one model, in preference order.
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub model_id: String,
    pub candidates: Vec<Arc<NodeDescriptor>>,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: BTreeMap<String, RoutingEntry>,
    generation: u64,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Candidates for `model_id` in table order; empty when the model is unknown.
    pub fn lookup(&self, model_id: &str) -> &[Arc<NodeDescriptor>] {
        self.entries
            .get(model_id)
            .map(|entry| entry.candidates.as_slice())
            .unwrap_or_default()
    }

    pub fn list_model_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.values()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulates candidates for a table that is not yet visible to readers.
#[derive(Debug, Default)]
pub struct RoutingTableBuilder {
    entries: BTreeMap<String, RoutingEntry>,
}

impl RoutingTableBuilder {
    /// Appends `node` to the candidates for `model_id`.
    ///
    /// Existing candidates are kept; a node already listed for the model is not
    /// added a second time.
    pub fn add_candidate(&mut self, model_id: &str, node: &Arc<NodeDescriptor>) -> bool {
        let entry = self
            .entries
            .entry(model_id.to_string())
            .or_insert_with(|| RoutingEntry {
                model_id: model_id.to_string(),
                candidates: Vec::new(),
            });

        if entry.candidates.iter().any(|c| c.name == node.name) {
            return false;
        }
        entry.candidates.push(Arc::clone(node));
        true
    }

    pub fn build(self) -> RoutingTable {
        RoutingTable {
            entries: self.entries,
            generation: 0,
        }
    }
}

/// Holds the active routing snapshot.
#[derive(Debug)]
pub struct RouteStore {
    current: ArcSwap<RoutingTable>,
}

impl Default for RouteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteStore {
    /// Starts with an empty table at generation 0.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RoutingTable::default()),
        }
    }

    /// The currently installed table. Never blocks and never triggers discovery.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    /// Publishes `table` as the active snapshot and returns its generation.
    ///
    /// The generation is derived from the table being replaced inside the same
    /// compare-and-swap, so concurrent installs still get distinct, increasing
    /// generations.
    pub fn install(&self, table: RoutingTable) -> u64 {
        let previous = self.current.rcu(|current| {
            let mut next = table.clone();
            next.generation = current.generation + 1;
            next
        });
        previous.generation + 1
    }
}
