//! Scan statistics.
//!
//! Counters the tracker maintains across a scan-and-repair cycle. Flaw and
//! ignored-node counts are not stored here; they are derived from the index
//! when reported.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Debug listeners are refreshed once per this many counter updates, so a
/// full-tree scan does not flood them.
pub const DEBUG_STAT_STEP: u64 = 50;

/// One reported statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatId {
    /// Tree size recorded when a scan starts.
    TotalNodes,
    /// Nodes visited by indexing tasks so far.
    NodesSeen,
    /// Duplicate classes currently present; derived from the index.
    RemainingFlaws,
    /// Redundant copies currently present.
    RemainingDuplicates,
    /// Duplicate classes dissolved since the last reset.
    RemovedFlaws,
    /// Redundant copies dropped since the last reset.
    RemovedDuplicates,
    /// Subtree roots excluded from indexing; derived from the index.
    IgnoredNodes,
    /// Auto-generated speed-dial folders skipped during indexing.
    SpeeddialFolders,
}

/// Counter store. `set` refreshes debug listeners immediately; `inc`/`dec`
/// only on every `DEBUG_STAT_STEP`-th update.
#[derive(Debug, Default)]
pub struct Stats {
    values: BTreeMap<StatId, u64>,
    updates: u64,
}

/// What a counter change obligates the caller to announce. Regular listeners
/// are always notified; `debug` marks the updates that also refresh debug
/// listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatChange {
    pub id: StatId,
    pub value: u64,
    pub debug: bool,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: StatId) -> u64 {
        self.values.get(&id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, id: StatId, value: u64) -> StatChange {
        self.values.insert(id, value);
        StatChange {
            id,
            value,
            debug: true,
        }
    }

    pub fn inc(&mut self, id: StatId) -> StatChange {
        let value = self.get(id) + 1;
        self.values.insert(id, value);
        self.step(id, value)
    }

    pub fn dec(&mut self, id: StatId) -> StatChange {
        let value = self.get(id).saturating_sub(1);
        self.values.insert(id, value);
        self.step(id, value)
    }

    fn step(&mut self, id: StatId, value: u64) -> StatChange {
        self.updates += 1;
        StatChange {
            id,
            value,
            debug: self.updates % DEBUG_STAT_STEP == 0,
        }
    }

    /// Zero every counter; the update cadence restarts as well.
    pub fn clear(&mut self) {
        self.values.clear();
        self.updates = 0;
    }
}
