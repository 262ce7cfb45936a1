//! Event infrastructure for the tracker.
//!
//! Provides `TrackerEvent` for observers (internals pages, tests, the CLI)
//! and `EventBus` for subscriptions. Thread-safe behind `Arc` + `RwLock` so
//! the bus can be handed to observers on other threads even though the
//! tracker itself runs on one logical thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;

use crate::keys::FlawId;
use crate::model::NodeId;
use crate::stats::StatId;
use crate::tracker::TrackerState;

/// Events emitted by the tracker as it indexes and reconciles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TrackerEvent {
    /// A key crossed into flawed (two or more members).
    FlawAppeared { key: FlawId },
    /// A key dropped back to a single member.
    FlawDisappeared { key: FlawId },
    /// A key gained a redundant copy.
    DuplicateAppeared { key: FlawId, node: NodeId },
    /// A key lost a redundant copy.
    DuplicateDisappeared { key: FlawId, node: NodeId },
    /// Reconciliation of one duplicate pair began.
    #[serde(rename_all = "camelCase")]
    FlawProcessingStarted {
        key: FlawId,
        original: NodeId,
        duplicate: NodeId,
    },
    /// The tracker state machine moved.
    StateChanged { state: TrackerState },
    /// A counter changed value.
    StatisticsUpdated { id: StatId, value: u64 },
    /// Debug listeners should refresh their view.
    DebugStatsUpdated,
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing tracker events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(TrackerEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(TrackerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: TrackerEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
