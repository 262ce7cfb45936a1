//! Task values run by the tracker's two queues.
//!
//! Tasks are plain data; the tracker executes their units because a unit
//! touches the index, the expected-change record and the model together.
//! Equality is logical identity (which subtree, which pair), not progress,
//! so a queue can refuse a duplicate post of work already pending.

use crate::model::NodeId;

/// Incremental walk of one subtree, feeding nodes into the duplicate index.
///
/// One unit of work either enqueues a single child walk or, once every child
/// has been enqueued, registers this node and finishes; each unit is O(1) in
/// the subtree size.
#[derive(Debug, Clone)]
pub struct IndexingTask {
    pub node: NodeId,
    /// Next child position to enqueue.
    pub cursor: usize,
    pub finished: bool,
}

impl IndexingTask {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            cursor: 0,
            finished: false,
        }
    }
}

impl PartialEq for IndexingTask {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for IndexingTask {}

/// Reconciliation of one duplicate node against its elected original.
///
/// Units drain the duplicate's children one at a time (merging them into the
/// original or spawning nested tasks) until the duplicate itself can go.
#[derive(Debug, Clone)]
pub struct RemovalTask {
    pub original: NodeId,
    pub duplicate: NodeId,
    pub finished: bool,
}

impl RemovalTask {
    pub fn new(original: NodeId, duplicate: NodeId) -> Self {
        Self {
            original,
            duplicate,
            finished: false,
        }
    }
}

impl PartialEq for RemovalTask {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original && self.duplicate == other.duplicate
    }
}

impl Eq for RemovalTask {}
