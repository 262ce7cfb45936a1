//! One-shot scan driver.
//!
//! The tracker is tick-driven and never sleeps on its own; this module owns
//! the clock. It starts the tracker in local mode and advances a virtual
//! clock straight to the next armed deadline until no work remains, so a
//! scan that would spread over minutes of idle-slicing in a browser settles
//! in one call.

use std::sync::Arc;

use tracing::{debug, info, warn};

use dedup_core::model::BookmarkModel;
use dedup_core::prefs::TrackerPrefs;
use dedup_core::stats::StatId;
use dedup_core::sync::SyncTree;
use dedup_core::tracker::{DuplicateTracker, TrackerConfig, TrackerState, TrackerSyncState};
use dedup_core::TrackerEvent;

/// Ticks before the driver gives up on a run that will not settle.
const MAX_STEPS: u64 = 1_000_000;

/// What a finished run looked like.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub state: TrackerState,
    /// Flaws fully reconciled this run.
    pub repaired: u64,
    /// Individual duplicate nodes removed this run.
    pub removed: u64,
    /// Flaws still present (ignored subtrees keep theirs).
    pub remaining: u64,
    /// The run was suppressed because the tree was clean last time.
    pub skipped_clean: bool,
    pub backoff_until: Option<u64>,
    /// Internal state table, one row per line.
    pub internals: Vec<(String, String)>,
    pub finished_at: u64,
}

/// Run the tracker over `model` until it settles.
pub fn run_scan<M: BookmarkModel>(
    model: M,
    prefs: Arc<dyn TrackerPrefs>,
    config: TrackerConfig,
    start_ms: u64,
) -> ScanOutcome {
    let sync = Arc::new(SyncTree::new());
    let mut tracker = DuplicateTracker::new(model, sync, prefs, config);
    let _subscription = tracker.events().subscribe(|event| match event {
        TrackerEvent::FlawProcessingStarted {
            key,
            original,
            duplicate,
        } => {
            info!(%key, %original, %duplicate, "reconciling duplicate");
        }
        TrackerEvent::StateChanged { state } => debug!(%state, "tracker state"),
        _ => {}
    });

    let mut now = start_ms;
    tracker.set_sync_state(TrackerSyncState::Disassociated, now);
    tracker.start(now);

    let mut steps: u64 = 0;
    loop {
        tracker.tick(now);
        if tracker.pending_check() {
            now += 1;
        } else if let Some(deadline) = tracker.next_work_deadline() {
            now = now.max(deadline);
        } else {
            break;
        }
        steps += 1;
        if steps >= MAX_STEPS {
            warn!("stopping after {MAX_STEPS} ticks with work still queued");
            break;
        }
    }

    let backoff_until = tracker.backoff_deadline();
    ScanOutcome {
        state: tracker.state(),
        repaired: tracker.stat(StatId::RemovedFlaws),
        removed: tracker.stat(StatId::RemovedDuplicates),
        remaining: tracker.stat(StatId::RemainingFlaws),
        skipped_clean: tracker.state() == TrackerState::Idle && backoff_until.is_some(),
        backoff_until,
        internals: tracker.internal_stats(now),
        finished_at: now,
    }
}
