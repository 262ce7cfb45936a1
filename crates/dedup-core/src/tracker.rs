//! Duplicate tracker.
//!
//! The orchestrator: owns the index, the electors and both task queues, and
//! runs the scan-reconcile lifecycle as a state machine:
//!
//! ```text
//! Stopped -> Idle -> IndexingScheduled -> Indexing -> IndexingComplete
//!   -> ProcessingScheduled -> Processing (<-> WaitingForSync) -> IndexingComplete
//! ```
//!
//! Everything runs on one logical thread. Time comes in through `tick(now)`
//! and the notification entry points; the tracker never reads a clock. Tree
//! mutations the tracker performs itself are bracketed with an expected-change
//! record so its own observer path routes them to index maintenance instead of
//! scheduling a redundant rescan.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::elector::{LocalElector, OriginalElector, SyncElector};
use crate::events::{EventBus, TrackerEvent};
use crate::index::{DuplicateIndex, IndexContext, IndexEvent};
use crate::keys::{self, FlawId, KeySource};
use crate::model::{BookmarkModel, ModelEvent, NodeId, NodeInfo, SpecialFolder};
use crate::prefs::TrackerPrefs;
use crate::runner::{DEFAULT_SLICE_DELAY_MS, QueueOrder, TaskRunner};
use crate::stats::{StatChange, StatId, Stats};
use crate::sync::{NodeSyncState, SyncCatalog, SyncId};
use crate::tasks::{IndexingTask, RemovalTask};

/// Delay between a scan request and the scan starting.
pub const DEFAULT_SCAN_DELAY_MS: u64 = 5_000;

/// Ceiling for the growing rescan delay under repeated bulk churn.
pub const MAX_SCAN_DELAY_MS: u64 = 180_000;

/// Quiet period after the tree is found clean.
pub const DEFAULT_BACKOFF_PERIOD_MS: u64 = 86_400_000;

/// Unacknowledged local changes tolerated before removal pauses.
pub const WAIT_FOR_SYNC_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackerState {
    Stopped,
    Idle,
    IndexingScheduled,
    Indexing,
    IndexingComplete,
    ProcessingScheduled,
    Processing,
    WaitingForSync,
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackerState::Stopped => "Stopped",
            TrackerState::Idle => "Idle",
            TrackerState::IndexingScheduled => "Indexing scheduled",
            TrackerState::Indexing => "Indexing",
            TrackerState::IndexingComplete => "Indexing complete",
            TrackerState::ProcessingScheduled => "Processing scheduled",
            TrackerState::Processing => "Processing",
            TrackerState::WaitingForSync => "Waiting for sync",
        };
        f.write_str(s)
    }
}

/// Lifecycle of the external sync subsystem, as last reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackerSyncState {
    Unknown,
    Associating,
    Associated,
    Disassociated,
    Error,
}

impl std::fmt::Display for TrackerSyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackerSyncState::Unknown => "Unknown",
            TrackerSyncState::Associating => "Associating",
            TrackerSyncState::Associated => "Associated",
            TrackerSyncState::Disassociated => "Disassociated",
            TrackerSyncState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Why the current (or pending) scan was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanSource {
    Unset,
    ModelChange,
    SyncCycle,
    ModelLoaded,
    SyncEnabled,
    SyncDisabled,
    ExtensiveChangesEnd,
    TrackerStarted,
    BackoffEnd,
}

impl std::fmt::Display for ScanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanSource::Unset => "Unset",
            ScanSource::ModelChange => "Model change",
            ScanSource::SyncCycle => "Sync cycle",
            ScanSource::ModelLoaded => "Model loaded",
            ScanSource::SyncEnabled => "Sync enabled",
            ScanSource::SyncDisabled => "Sync disabled",
            ScanSource::ExtensiveChangesEnd => "Extensive changes end",
            ScanSource::TrackerStarted => "Tracker started",
            ScanSource::BackoffEnd => "Backoff end",
        };
        f.write_str(s)
    }
}

/// What happens to a node judged redundant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemovalPolicy {
    /// Delete from the model.
    Purge,
    /// Move under the trash folder, which indexing ignores.
    Trash,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// GUID of the speed-dial folder owned by this device.
    pub local_device_guid: Option<String>,
    /// Title the host gives generated folders.
    pub default_folder_name: String,
    pub removal_policy: RemovalPolicy,
    pub scan_delay_ms: u64,
    pub backoff_period_ms: u64,
    pub slice_delay_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            local_device_guid: None,
            default_folder_name: "New folder".to_string(),
            removal_policy: RemovalPolicy::Trash,
            scan_delay_ms: DEFAULT_SCAN_DELAY_MS,
            backoff_period_ms: DEFAULT_BACKOFF_PERIOD_MS,
            slice_delay_ms: DEFAULT_SLICE_DELAY_MS,
        }
    }
}

/// A mutation the tracker is about to make itself, matched by equality in the
/// observer path and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ExpectedChange {
    Remove {
        node: NodeId,
        parent: NodeId,
        index: usize,
    },
    Move {
        node: NodeId,
        old_parent: NodeId,
        old_index: usize,
        new_parent: NodeId,
        new_index: usize,
    },
}

/// Short-lived view over one flawed key.
#[derive(Debug, Clone)]
pub struct FlawInfo {
    pub key: FlawId,
    /// None until the duplicate set is electable.
    pub original: Option<NodeId>,
    /// Members in ascending id order.
    pub members: Vec<NodeId>,
    pub folder_flaw: bool,
}

/// The duplicate-detection-and-reconciliation engine.
///
/// Owns its collaboration state outright; the host drives it through the
/// notification entry points and a periodic `tick(now)`.
pub struct DuplicateTracker<M: BookmarkModel> {
    model: M,
    sync: Arc<dyn SyncCatalog>,
    prefs: Arc<dyn TrackerPrefs>,
    config: TrackerConfig,
    bus: Arc<EventBus>,

    state: TrackerState,
    sync_state: TrackerSyncState,
    scan_source: ScanSource,
    associator_ready: bool,
    model_loaded: bool,
    extensive_changes: bool,

    ctx: IndexContext,
    index: DuplicateIndex,
    index_runner: TaskRunner<IndexingTask>,
    remove_runner: TaskRunner<RemovalTask>,
    /// None while the sync subsystem is associating or errored.
    elector: Option<Box<dyn OriginalElector>>,
    stats: Stats,

    expected: Option<ExpectedChange>,
    pending_unsynced: HashSet<SyncId>,

    scan_deadline: Option<u64>,
    next_scan_time_ms: Option<u64>,
    last_scan_delay_ms: u64,
    backoff_deadline: Option<u64>,
    check_pending: bool,
}

impl<M: BookmarkModel> DuplicateTracker<M> {
    pub fn new(
        model: M,
        sync: Arc<dyn SyncCatalog>,
        prefs: Arc<dyn TrackerPrefs>,
        config: TrackerConfig,
    ) -> Self {
        let ctx = IndexContext {
            root: model.root(),
            speed_dial: None,
            local_device_root: None,
            default_folder_name: config.default_folder_name.clone(),
        };
        let slice = config.slice_delay_ms;
        let scan_delay = config.scan_delay_ms;
        let mut tracker = Self {
            model,
            sync,
            prefs,
            config,
            bus: Arc::new(EventBus::new()),
            state: TrackerState::Stopped,
            sync_state: TrackerSyncState::Unknown,
            scan_source: ScanSource::Unset,
            associator_ready: false,
            model_loaded: false,
            extensive_changes: false,
            ctx,
            index: DuplicateIndex::new(),
            index_runner: TaskRunner::new(QueueOrder::Fifo, slice),
            remove_runner: TaskRunner::new(QueueOrder::Lifo, slice),
            elector: None,
            stats: Stats::new(),
            expected: None,
            pending_unsynced: HashSet::new(),
            scan_deadline: None,
            next_scan_time_ms: None,
            last_scan_delay_ms: scan_delay,
            backoff_deadline: None,
            check_pending: false,
        };
        if tracker.model.is_loaded() {
            tracker.model_loaded = true;
            tracker.extensive_changes = tracker.model.extensive_changes_in_progress();
            tracker.resolve_landmarks();
        }
        tracker
    }

    // ==================== Public surface ====================

    /// Begin tracking. Valid only while stopped.
    pub fn start(&mut self, now: u64) {
        debug_assert!(self.state == TrackerState::Stopped, "tracker already started");
        if self.state != TrackerState::Stopped {
            return;
        }
        info!("duplicate tracker starting");
        self.change_state(TrackerState::Idle);
        self.restart_scan(ScanSource::TrackerStarted, now);
    }

    /// Drop all in-flight work and return to `Stopped`. Prefs keep their
    /// persisted values.
    pub fn stop(&mut self) {
        info!("duplicate tracker stopping");
        self.reset_tracker();
        self.pending_unsynced.clear();
        self.change_state(TrackerState::Stopped);
    }

    /// Advance the engine: deliver pending model events, fire due deadlines,
    /// run at most one work slice per queue.
    pub fn tick(&mut self, now: u64) {
        self.pump_model_events(now);

        if self.backoff_deadline.is_some_and(|at| now >= at) {
            self.exit_backoff(now);
        }
        if self.scan_deadline.is_some_and(|at| now >= at) {
            self.scan_deadline = None;
            self.do_start_scan(now);
        }
        if self.check_pending {
            self.check_pending = false;
            self.do_check_and_deduplicate(now);
        }
        self.drive_index_runner(now);
        self.drive_remove_runner(now);
    }

    /// Consume tree-mutation notifications queued in the model, in order.
    /// Called from `tick`, and callable directly for prompt delivery.
    pub fn pump_model_events(&mut self, now: u64) {
        for event in self.model.take_events() {
            match event {
                ModelEvent::Loaded => self.on_model_loaded(now),
                ModelEvent::Added { .. } => self.on_model_change(now),
                ModelEvent::WillRemove {
                    node,
                    meta,
                    parent,
                    index,
                } => {
                    let guid = meta.get(keys::SPEED_DIAL_GUID_KEY).cloned();
                    self.on_will_remove(node, guid, parent, index, now);
                }
                ModelEvent::Moved {
                    node,
                    old_parent,
                    old_index,
                    new_parent,
                    new_index,
                } => self.on_moved(node, old_parent, old_index, new_parent, new_index, now),
                ModelEvent::WillChange { .. } => self.on_model_change(now),
                ModelEvent::WillReorder { .. } => self.on_model_change(now),
                ModelEvent::ExtensiveChangesBegin => {
                    debug!("extensive changes begin, suspending");
                    self.extensive_changes = true;
                    self.reset_tracker();
                }
                ModelEvent::ExtensiveChangesEnd => {
                    debug!("extensive changes end");
                    self.extensive_changes = false;
                    self.restart_scan(ScanSource::ExtensiveChangesEnd, now);
                }
            }
        }
    }

    /// The host's sync subsystem changed state.
    pub fn set_sync_state(&mut self, new: TrackerSyncState, now: u64) {
        if new == self.sync_state {
            return;
        }
        if new == TrackerSyncState::Associated && !self.associator_ready {
            debug!("sync reported associated before association ran, ignoring");
            return;
        }
        info!(from = %self.sync_state, to = %new, "sync state");
        self.sync_state = new;
        match new {
            TrackerSyncState::Associated => {
                self.elector = Some(Box::new(SyncElector::new(Arc::clone(&self.sync))));
                self.restart_scan(ScanSource::SyncEnabled, now);
            }
            TrackerSyncState::Disassociated => {
                self.elector = Some(Box::new(LocalElector));
                self.restart_scan(ScanSource::SyncDisabled, now);
            }
            TrackerSyncState::Unknown | TrackerSyncState::Associating | TrackerSyncState::Error => {
                self.elector = None;
                self.reset_tracker();
            }
        }
        self.bus.emit(TrackerEvent::DebugStatsUpdated);
    }

    /// Whether a model association pass has completed; gates `Associated`.
    pub fn set_associator_ready(&mut self, ready: bool) {
        self.associator_ready = ready;
    }

    /// The sync engine finished a cycle.
    pub fn on_sync_cycle_completed(&mut self, committed_bookmarks: bool, now: u64) {
        if self.sync_state != TrackerSyncState::Associated {
            return;
        }
        self.check_and_clear_wait_for_sync(now);
        if committed_bookmarks && self.state == TrackerState::IndexingComplete {
            // Fresh server state may make deferred elections decidable.
            self.schedule_check();
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn sync_state(&self) -> TrackerSyncState {
        self.sync_state
    }

    pub fn scan_source(&self) -> ScanSource {
        self.scan_source
    }

    pub fn is_model_clean(&self) -> bool {
        self.index.is_clean()
    }

    /// Counter value; flaw and ignored counts are derived from the index.
    pub fn stat(&self, id: StatId) -> u64 {
        match id {
            StatId::RemainingFlaws => self.index.flawed_count(),
            StatId::IgnoredNodes => self.index.ignored_count(),
            _ => self.stats.get(id),
        }
    }

    /// Bus carrying `TrackerEvent`s; clone and subscribe.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Earliest pending work deadline (scan start or a queue slice), if any.
    /// Backoff expiry is reported separately.
    pub fn next_work_deadline(&self) -> Option<u64> {
        [
            self.scan_deadline,
            self.index_runner.next_slice_at(),
            self.remove_runner.next_slice_at(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn backoff_deadline(&self) -> Option<u64> {
        self.backoff_deadline
    }

    /// Whether a processing check will run on the next tick.
    pub fn pending_check(&self) -> bool {
        self.check_pending
    }

    /// Ordered label/value rows for an internals page.
    pub fn internal_stats(&self, now: u64) -> Vec<(String, String)> {
        let next_scan = self
            .next_scan_time_ms
            .map(|t| t.to_string())
            .unwrap_or_else(|| "Not scheduled".to_string());
        let last_clean = self
            .prefs
            .last_clean_run_ms()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let backoff = format!(
            "[{}] {}",
            if self.backoff_deadline.is_some() { "*" } else { " " },
            match self.backoff_until(now) {
                Some(until) => format!("Until {until}"),
                None => "No".to_string(),
            }
        );
        let yes_no = |b: bool| if b { "Yes" } else { "No" }.to_string();

        vec![
            ("Tracker state".into(), self.state.to_string()),
            ("Sync state".into(), self.sync_state.to_string()),
            ("Scan source".into(), self.scan_source.to_string()),
            ("Next scan time".into(), next_scan),
            ("Last model clean time".into(), last_clean),
            ("Backoff".into(), backoff),
            ("Model changed".into(), yes_no(self.prefs.model_changed())),
            ("Total nodes".into(), self.stat(StatId::TotalNodes).to_string()),
            ("Nodes seen".into(), self.stat(StatId::NodesSeen).to_string()),
            ("Flaw count".into(), self.stat(StatId::RemainingFlaws).to_string()),
            (
                "Duplicate count".into(),
                self.stat(StatId::RemainingDuplicates).to_string(),
            ),
            ("Ignored count".into(), self.stat(StatId::IgnoredNodes).to_string()),
            (
                "Ignored SD folders count".into(),
                self.stat(StatId::SpeeddialFolders).to_string(),
            ),
            ("Flaws removed".into(), self.stat(StatId::RemovedFlaws).to_string()),
            (
                "Duplicates removed".into(),
                self.stat(StatId::RemovedDuplicates).to_string(),
            ),
        ]
    }

    // ==================== State machine ====================

    fn change_state(&mut self, new: TrackerState) {
        if self.state == new {
            return;
        }
        if self.state == TrackerState::Stopped && new != TrackerState::Idle {
            debug_assert!(false, "stopped tracker can only move to idle");
            return;
        }
        debug!(from = %self.state, to = %new, "tracker state");
        self.state = new;
        if new == TrackerState::IndexingComplete {
            self.last_scan_delay_ms = self.config.scan_delay_ms;
        }
        self.bus.emit(TrackerEvent::StateChanged { state: new });
        self.bus.emit(TrackerEvent::DebugStatsUpdated);
    }

    /// Request a rescan. Gated; when a gate holds, nothing is scheduled.
    fn restart_scan(&mut self, source: ScanSource, now: u64) {
        if self.is_within_backoff(now) {
            // Remember to come back once the quiet period lapses.
            if let Some(last) = self.prefs.last_clean_run_ms() {
                self.backoff_deadline = Some(last + self.config.backoff_period_ms);
            }
            debug!(%source, "rescan suppressed by backoff");
            return;
        }
        if !self.model_loaded {
            return;
        }
        if self.extensive_changes {
            return;
        }
        if !self.prefs.model_changed() {
            debug!(%source, "model unchanged since last clean run, not scanning");
            return;
        }
        if self.state == TrackerState::Stopped {
            return;
        }
        if !matches!(
            self.sync_state,
            TrackerSyncState::Associated | TrackerSyncState::Disassociated
        ) {
            return;
        }

        let delay = self.current_scan_delay(source);
        self.scan_source = source;
        self.reset_tracker();
        self.scan_deadline = Some(now + delay);
        self.next_scan_time_ms = Some(now + delay);
        self.change_state(TrackerState::IndexingScheduled);
        info!(%source, delay_ms = delay, "scan scheduled");
    }

    /// Scan delay, growing under repeated bulk churn that keeps interrupting
    /// indexing and snapping back to the default otherwise.
    fn current_scan_delay(&mut self, source: ScanSource) -> u64 {
        let churning = source == ScanSource::ExtensiveChangesEnd
            && self.scan_source == ScanSource::ExtensiveChangesEnd
            && matches!(
                self.state,
                TrackerState::Idle | TrackerState::IndexingScheduled | TrackerState::Indexing
            );
        self.last_scan_delay_ms = if churning {
            (self.last_scan_delay_ms + self.last_scan_delay_ms / 2).min(MAX_SCAN_DELAY_MS)
        } else {
            self.config.scan_delay_ms
        };
        self.last_scan_delay_ms
    }

    /// Drop queues, index and counters; keep prefs and the unsynced set.
    fn reset_tracker(&mut self) {
        if self.state == TrackerState::Stopped {
            return;
        }
        self.index_runner.reset();
        self.remove_runner.reset();
        self.index.clear();
        self.scan_deadline = None;
        self.next_scan_time_ms = None;
        self.check_pending = false;
        self.expected = None;
        self.stats.clear();
        self.change_state(TrackerState::Idle);
    }

    fn do_start_scan(&mut self, now: u64) {
        if self.extensive_changes {
            self.change_state(TrackerState::Idle);
            return;
        }
        self.next_scan_time_ms = None;
        self.resolve_landmarks();
        self.change_state(TrackerState::Indexing);

        let total = self.model.total_node_count();
        let change = self.stats.set(StatId::TotalNodes, total);
        self.apply_stat(change);

        if let Some(trash) = self.model.special_folder(SpecialFolder::Trash) {
            self.index.ignore_parent(trash);
        }
        if let Some(speed_dial) = self.ctx.speed_dial {
            self.index.add_speeddial_parent(speed_dial);
        }
        for child in self.model.children(self.ctx.root) {
            if self.index.is_ignored(child) {
                continue;
            }
            self.index_runner.post(IndexingTask::new(child), now);
        }
        info!(total_nodes = total, source = %self.scan_source, "scan started");

        if self.index_runner.is_empty() {
            self.change_state(TrackerState::IndexingComplete);
            self.schedule_check();
        }
    }

    fn schedule_check(&mut self) {
        debug_assert!(self.state == TrackerState::IndexingComplete);
        self.change_state(TrackerState::ProcessingScheduled);
        self.check_pending = true;
    }

    /// Decide what to do now that both queues are empty: start reconciling
    /// the first processable flaw, or conclude the tree is clean.
    fn do_check_and_deduplicate(&mut self, now: u64) {
        if self.state != TrackerState::ProcessingScheduled {
            return;
        }
        debug_assert!(self.index_runner.is_empty() && self.remove_runner.is_empty());
        if self.sync_state == TrackerSyncState::Associating {
            // Elections are impossible right now; a sync-state change will
            // restart the scan.
            return;
        }
        if let Some(flaw) = self.find_first_processable_flaw() {
            self.start_removal(flaw, now);
            return;
        }
        if self.index.is_clean() && !self.is_within_backoff(now) {
            self.prefs.set_model_changed(false);
            self.enter_backoff(now);
        }
        self.change_state(TrackerState::IndexingComplete);
    }

    fn find_first_processable_flaw(&mut self) -> Option<FlawInfo> {
        let keys: Vec<FlawId> = self.index.flawed_ids().cloned().collect();
        for key in keys {
            if let Some(info) = self.flaw_info(&key)
                && info.original.is_some()
            {
                return Some(info);
            }
        }
        None
    }

    fn flaw_info(&mut self, key: &FlawId) -> Option<FlawInfo> {
        let members: Vec<NodeId> = self.index.members(key)?.iter().copied().collect();
        let first = *members.first()?;
        let folder_flaw = self.model.node(first).is_some_and(|n| n.is_folder);
        let original = self
            .elector
            .as_mut()
            .and_then(|e| e.elect_original(&members));
        Some(FlawInfo {
            key: key.clone(),
            original,
            members,
            folder_flaw,
        })
    }

    fn start_removal(&mut self, flaw: FlawInfo, now: u64) {
        let Some(original) = flaw.original else {
            return;
        };
        let Some(&duplicate) = flaw.members.iter().find(|&&m| m != original) else {
            return;
        };
        self.change_state(TrackerState::Processing);
        info!(key = %flaw.key, %original, %duplicate, "processing flaw");
        self.bus.emit(TrackerEvent::FlawProcessingStarted {
            key: flaw.key,
            original,
            duplicate,
        });
        self.remove_runner.post(RemovalTask::new(original, duplicate), now);
    }

    // ==================== Backoff ====================

    fn is_within_backoff(&self, now: u64) -> bool {
        self.backoff_until(now).is_some()
    }

    /// End of the quiet period, or None when not in backoff. A last-clean
    /// timestamp in the future is corrupt and gets cleared.
    fn backoff_until(&self, now: u64) -> Option<u64> {
        let last = self.prefs.last_clean_run_ms()?;
        if last > now {
            warn!(last_clean = last, now, "clean-run timestamp in the future, clearing");
            self.prefs.set_last_clean_run_ms(None);
            return None;
        }
        let until = last + self.config.backoff_period_ms;
        (now < until).then_some(until)
    }

    fn enter_backoff(&mut self, now: u64) {
        self.prefs.set_last_clean_run_ms(Some(now));
        if self.backoff_deadline.is_none() {
            self.backoff_deadline = Some(now + self.config.backoff_period_ms);
        }
        info!(until = now + self.config.backoff_period_ms, "model clean, backoff entered");
    }

    fn exit_backoff(&mut self, now: u64) {
        debug!("backoff lapsed");
        self.backoff_deadline = None;
        self.prefs.set_last_clean_run_ms(None);
        self.restart_scan(ScanSource::BackoffEnd, now);
    }

    // ==================== Model notifications ====================

    fn on_model_loaded(&mut self, now: u64) {
        self.model_loaded = true;
        self.extensive_changes = self.model.extensive_changes_in_progress();
        self.resolve_landmarks();
        self.restart_scan(ScanSource::ModelLoaded, now);
    }

    fn on_model_change(&mut self, now: u64) {
        self.prefs.set_model_changed(true);
        if !self.extensive_changes {
            self.restart_scan(ScanSource::ModelChange, now);
        }
    }

    fn on_will_remove(
        &mut self,
        info: NodeInfo,
        guid: Option<String>,
        parent: NodeId,
        index: usize,
        now: u64,
    ) {
        let record = ExpectedChange::Remove {
            node: info.id,
            parent,
            index,
        };
        if self.expected.as_ref() == Some(&record) {
            self.expected = None;
            let src = KeySource {
                title: &info.title,
                url: info.url.as_deref(),
                is_folder: info.is_folder,
                guid: guid.as_deref(),
            };
            let events = self.index.remove_node(&self.model, &self.ctx, info.id, &src, parent);
            self.apply_index_events(events);
        } else {
            self.clear_mismatched_expectation();
            self.on_model_change(now);
        }
    }

    fn on_moved(
        &mut self,
        node: NodeId,
        old_parent: NodeId,
        old_index: usize,
        new_parent: NodeId,
        new_index: usize,
        now: u64,
    ) {
        let record = ExpectedChange::Move {
            node,
            old_parent,
            old_index,
            new_parent,
            new_index,
        };
        if self.expected.as_ref() == Some(&record) {
            self.expected = None;
            if let Some(info) = self.model.node(node) {
                let guid = if self.ctx.speed_dial == Some(old_parent) {
                    self.model.meta(node, keys::SPEED_DIAL_GUID_KEY)
                } else {
                    None
                };
                let src = KeySource::from_info(&info, guid.as_deref());
                let events = self.index.remove_node(&self.model, &self.ctx, node, &src, old_parent);
                self.apply_index_events(events);
                self.append_node_to_map(node);
            }
        } else {
            self.clear_mismatched_expectation();
            self.on_model_change(now);
        }
    }

    fn clear_mismatched_expectation(&mut self) {
        if self.expected.take().is_some() {
            debug!("external change arrived before the expected one, treating both as external");
        }
    }

    // ==================== Index maintenance ====================

    fn resolve_landmarks(&mut self) {
        self.ctx.root = self.model.root();
        self.ctx.speed_dial = self.model.special_folder(SpecialFolder::SpeedDial);
        self.ctx.local_device_root = self.ctx.speed_dial.and_then(|sd| {
            let guid = self.config.local_device_guid.as_deref()?;
            self.model
                .children(sd)
                .into_iter()
                .find(|c| self.model.meta(*c, keys::SPEED_DIAL_GUID_KEY).as_deref() == Some(guid))
        });
    }

    fn append_node_to_map(&mut self, node: NodeId) {
        let Some(info) = self.model.node(node) else {
            return;
        };
        let events = self.index.insert_node(&self.model, &self.ctx, &info);
        self.apply_index_events(events);
    }

    fn apply_index_events(&mut self, events: Vec<IndexEvent>) {
        for event in events {
            match event {
                IndexEvent::DuplicateAppeared { key, node } => {
                    let change = self.stats.inc(StatId::RemainingDuplicates);
                    self.apply_stat(change);
                    self.bus.emit(TrackerEvent::DuplicateAppeared { key, node });
                }
                IndexEvent::FlawAppeared { key } => {
                    debug!(%key, "flaw appeared");
                    self.emit_flaw_count();
                    self.bus.emit(TrackerEvent::FlawAppeared { key });
                    if self.state == TrackerState::IndexingComplete
                        && self.sync_state == TrackerSyncState::Disassociated
                    {
                        self.schedule_check();
                    }
                }
                IndexEvent::DuplicateDisappeared { key, node } => {
                    let change = self.stats.dec(StatId::RemainingDuplicates);
                    self.apply_stat(change);
                    let change = self.stats.inc(StatId::RemovedDuplicates);
                    self.apply_stat(change);
                    self.bus.emit(TrackerEvent::DuplicateDisappeared { key, node });
                }
                IndexEvent::FlawDisappeared { key } => {
                    debug!(%key, "flaw disappeared");
                    let change = self.stats.inc(StatId::RemovedFlaws);
                    self.apply_stat(change);
                    self.emit_flaw_count();
                    self.bus.emit(TrackerEvent::FlawDisappeared { key });
                }
                IndexEvent::SpeeddialFolderIgnored { node } => {
                    debug!(node = %self.model.describe(node), "generated speed-dial folder skipped");
                    let change = self.stats.inc(StatId::SpeeddialFolders);
                    self.apply_stat(change);
                }
                IndexEvent::SpeeddialFolderDropped { .. } => {
                    let change = self.stats.dec(StatId::SpeeddialFolders);
                    self.apply_stat(change);
                }
            }
        }
    }

    fn emit_flaw_count(&self) {
        self.bus.emit(TrackerEvent::StatisticsUpdated {
            id: StatId::RemainingFlaws,
            value: self.index.flawed_count(),
        });
    }

    fn apply_stat(&self, change: StatChange) {
        self.bus.emit(TrackerEvent::StatisticsUpdated {
            id: change.id,
            value: change.value,
        });
        if change.debug {
            self.bus.emit(TrackerEvent::DebugStatsUpdated);
        }
    }

    // ==================== Queue driving ====================

    fn drive_index_runner(&mut self, now: u64) {
        if !self.index_runner.slice_due(now) {
            return;
        }
        if let Some(mut task) = self.index_runner.take_current() {
            self.run_indexing_unit(&mut task, now);
            self.index_runner.put_back(task);
        }
        while self.index_runner.peek_current().is_some_and(|t| t.finished) {
            self.index_runner.evict_current();
            let change = self.stats.inc(StatId::NodesSeen);
            self.apply_stat(change);
        }
        self.index_runner.schedule_next(now);
        if self.index_runner.is_empty() {
            self.on_index_queue_empty();
        }
    }

    fn run_indexing_unit(&mut self, task: &mut IndexingTask, now: u64) {
        if task.finished {
            return;
        }
        let Some(info) = self.model.node(task.node) else {
            // Node left the tree mid-walk; nothing to do.
            task.finished = true;
            return;
        };
        if info.is_folder {
            let children = self.model.children(task.node);
            if task.cursor < children.len() {
                let child = children[task.cursor];
                task.cursor += 1;
                self.index_runner.post(IndexingTask::new(child), now);
                return;
            }
        }
        self.append_node_to_map(task.node);
        task.finished = true;
    }

    fn on_index_queue_empty(&mut self) {
        if self.state != TrackerState::Indexing {
            return;
        }
        info!(
            nodes_seen = self.stats.get(StatId::NodesSeen),
            flaws = self.index.flawed_count(),
            "indexing complete"
        );
        self.change_state(TrackerState::IndexingComplete);
        self.schedule_check();
    }

    fn drive_remove_runner(&mut self, now: u64) {
        if !self.remove_runner.slice_due(now) {
            return;
        }
        if let Some(mut task) = self.remove_runner.take_current() {
            self.run_removal_unit(&mut task, now);
            self.remove_runner.put_back(task);
        }
        if self.remove_runner.is_paused() {
            // The unit hit the unsynced cap; resume on acknowledgement.
            return;
        }
        while self.remove_runner.peek_current().is_some_and(|t| t.finished) {
            self.remove_runner.evict_current();
        }
        self.remove_runner.schedule_next(now);
        if self.remove_runner.is_empty() {
            self.on_remove_queue_empty();
        }
    }

    /// One reconciliation step for a duplicate against its original.
    fn run_removal_unit(&mut self, task: &mut RemovalTask, now: u64) {
        if task.finished {
            return;
        }
        let Some(dup) = self.model.node(task.duplicate) else {
            task.finished = true;
            return;
        };
        if self.model.node(task.original).is_none() {
            task.finished = true;
            return;
        }

        let children = self.model.children(task.duplicate);
        if !dup.is_folder || children.is_empty() {
            self.remove_or_trash(task.duplicate, now);
            task.finished = true;
            return;
        }

        let child = children[0];
        let Some(child_info) = self.model.node(child) else {
            return;
        };
        match self.find_counterpart(&child_info, task.original) {
            Some(counterpart) if child_info.is_folder => {
                // Merge the nested pair first; this task resumes once the
                // child folder has emptied out and gone.
                self.remove_runner
                    .post(RemovalTask::new(counterpart, child), now);
            }
            Some(_) => self.remove_or_trash(child, now),
            None => {
                // Unique content; preserve it under the original.
                self.move_with_expectation(child, task.original, 0, now);
            }
        }
    }

    /// First member of the child's key under `original_parent`, if any.
    fn find_counterpart(&self, child: &NodeInfo, original_parent: NodeId) -> Option<NodeId> {
        let under_speed_dial = self.ctx.speed_dial == Some(original_parent);
        let guid = if under_speed_dial {
            self.model.meta(child.id, keys::SPEED_DIAL_GUID_KEY)
        } else {
            None
        };
        let src = KeySource::from_info(child, guid.as_deref());
        let key = keys::flaw_id(&src, original_parent, under_speed_dial);
        // Several candidates may share the key; their own deduplication is
        // pending, any of them serves as the merge target.
        self.index.members(&key).and_then(|m| m.iter().next().copied())
    }

    fn on_remove_queue_empty(&mut self) {
        if self.state != TrackerState::Processing {
            debug_assert!(false, "removal queue drained outside processing");
            return;
        }
        self.change_state(TrackerState::IndexingComplete);
        self.schedule_check();
    }

    // ==================== Tracker-initiated mutations ====================

    fn remove_or_trash(&mut self, node: NodeId, now: u64) {
        match self.config.removal_policy {
            RemovalPolicy::Purge => self.remove_with_expectation(node, now),
            RemovalPolicy::Trash => {
                if let Some(trash) = self.model.special_folder(SpecialFolder::Trash) {
                    self.move_with_expectation(node, trash, 0, now);
                } else {
                    self.remove_with_expectation(node, now);
                }
            }
        }
    }

    fn remove_with_expectation(&mut self, node: NodeId, now: u64) {
        let Some(info) = self.model.node(node) else {
            return;
        };
        let Some(parent) = info.parent else {
            return;
        };
        let Some(index) = self.model.children(parent).iter().position(|c| *c == node) else {
            return;
        };
        debug!(node = %self.model.describe(node), "removing duplicate");
        self.register_unsynced(node);
        self.expected = Some(ExpectedChange::Remove { node, parent, index });
        if let Err(err) = self.model.remove(node) {
            warn!(%node, %err, "duplicate removal failed");
            self.expected = None;
        }
        self.pump_model_events(now);
    }

    fn move_with_expectation(&mut self, node: NodeId, new_parent: NodeId, new_index: usize, now: u64) {
        let Some(info) = self.model.node(node) else {
            return;
        };
        let Some(old_parent) = info.parent else {
            return;
        };
        let Some(old_index) = self.model.children(old_parent).iter().position(|c| *c == node)
        else {
            return;
        };
        debug!(
            node = %self.model.describe(node),
            to = %self.model.describe(new_parent),
            "moving node"
        );
        self.register_unsynced(node);
        self.expected = Some(ExpectedChange::Move {
            node,
            old_parent,
            old_index,
            new_parent,
            new_index,
        });
        if let Err(err) = self.model.move_node(node, new_parent, new_index) {
            warn!(%node, %err, "move failed");
            self.expected = None;
        }
        self.pump_model_events(now);
    }

    // ==================== Waiting for sync ====================

    /// Record that a node the tracker is about to mutate will need a commit
    /// round-trip; at the cap, removal pauses until the server catches up.
    fn register_unsynced(&mut self, node: NodeId) {
        if self.sync_state != TrackerSyncState::Associated {
            return;
        }
        let Some(sync_id) = self.sync.sync_id_for_node(node) else {
            debug_assert!(false, "mutated node has no sync id while associated");
            return;
        };
        debug_assert!(
            self.sync.node_sync_state(sync_id) == NodeSyncState::Synced,
            "mutating a node whose sync id is already in flight"
        );
        let inserted = self.pending_unsynced.insert(sync_id);
        debug_assert!(inserted, "sync id already awaiting acknowledgement");
        if self.pending_unsynced.len() >= WAIT_FOR_SYNC_CAP
            && self.state == TrackerState::Processing
        {
            debug!(
                pending = self.pending_unsynced.len(),
                "unsynced cap reached, pausing removal"
            );
            self.change_state(TrackerState::WaitingForSync);
            self.remove_runner.pause();
        }
    }

    fn check_and_clear_wait_for_sync(&mut self, now: u64) {
        let sync = Arc::clone(&self.sync);
        self.pending_unsynced
            .retain(|id| sync.node_sync_state(*id) == NodeSyncState::Unsynced);
        if self.pending_unsynced.len() < WAIT_FOR_SYNC_CAP {
            if self.state == TrackerState::WaitingForSync {
                debug!("sync caught up, resuming removal");
                self.change_state(TrackerState::Processing);
            }
            if self.remove_runner.is_paused() {
                self.remove_runner.unpause(now);
            }
        }
    }
}
