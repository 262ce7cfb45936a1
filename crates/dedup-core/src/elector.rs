//! Original election.
//!
//! When a key holds several copies, one of them is kept (the "original") and
//! the rest are reconciled against it. Which copy wins depends on the sync
//! situation:
//!
//! - `LocalElector` - lowest local node id; deterministic on one device but
//!   devices do not agree with each other
//! - `SyncElector` - lowest server-assigned sync id, which every device
//!   observes identically; electable only once the server has acknowledged
//!   all candidates
//!
//! A deferred election is the normal waiting state, not an error.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::model::NodeId;
use crate::sync::{NodeSyncState, SyncCatalog, SyncId};

pub trait OriginalElector: Send {
    /// Stage an election over `candidates`. Returning false means the set is
    /// not electable yet; no staged state survives a failed prepare.
    fn prepare_election(&mut self, candidates: &[NodeId]) -> bool;

    /// Total order among prepared candidates; true when `a` outranks `b`.
    fn precedes(&self, a: NodeId, b: NodeId) -> bool;

    /// Drop staged state.
    fn finish_election(&mut self);

    /// Pick the original of `candidates`, or None when the set is empty or
    /// not yet electable.
    fn elect_original(&mut self, candidates: &[NodeId]) -> Option<NodeId> {
        let (&first, rest) = candidates.split_first()?;
        if !self.prepare_election(candidates) {
            return None;
        }
        let mut winner = first;
        for &candidate in rest {
            if self.precedes(candidate, winner) {
                winner = candidate;
            }
        }
        self.finish_election();
        Some(winner)
    }
}

/// Tie-break by local node id.
#[derive(Debug, Default)]
pub struct LocalElector;

impl OriginalElector for LocalElector {
    fn prepare_election(&mut self, _candidates: &[NodeId]) -> bool {
        true
    }

    fn precedes(&self, a: NodeId, b: NodeId) -> bool {
        a < b
    }

    fn finish_election(&mut self) {}
}

/// Tie-break by sync id; defers until every candidate is acknowledged.
pub struct SyncElector {
    catalog: Arc<dyn SyncCatalog>,
    staged: HashMap<NodeId, SyncId>,
}

impl SyncElector {
    pub fn new(catalog: Arc<dyn SyncCatalog>) -> Self {
        Self {
            catalog,
            staged: HashMap::new(),
        }
    }
}

impl OriginalElector for SyncElector {
    fn prepare_election(&mut self, candidates: &[NodeId]) -> bool {
        for &node in candidates {
            let Some(sync_id) = self.catalog.sync_id_for_node(node) else {
                debug!(%node, "election deferred, node has no sync id yet");
                self.staged.clear();
                return false;
            };
            if self.catalog.node_sync_state(sync_id) != NodeSyncState::Synced {
                debug!(%node, %sync_id, "election deferred, sync id not acknowledged");
                self.staged.clear();
                return false;
            }
            self.staged.insert(node, sync_id);
        }
        true
    }

    fn precedes(&self, a: NodeId, b: NodeId) -> bool {
        match (self.staged.get(&a), self.staged.get(&b)) {
            (Some(sa), Some(sb)) => sa < sb,
            _ => {
                debug_assert!(false, "comparing nodes outside a prepared election");
                a < b
            }
        }
    }

    fn finish_election(&mut self) {
        self.staged.clear();
    }
}
