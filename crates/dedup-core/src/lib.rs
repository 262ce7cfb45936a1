//! dedup-core: duplicate detection and reconciliation for bookmark trees.
//!
//! This crate provides the core functionality for:
//! - Content-addressed duplicate indexing over a bookmark model
//! - A cooperative, tick-driven tracker that scans and repairs the tree
//! - Original election for local-only and sync-backed configurations
//! - One-shot association of the local tree with a remote sync tree
//! - Model, sync catalog, and preference trait abstractions with in-memory
//!   doubles for testing

pub mod associator;
pub mod elector;
pub mod events;
pub mod index;
pub mod keys;
pub mod model;
pub mod prefs;
pub mod runner;
pub mod stats;
pub mod sync;
pub mod tasks;
pub mod tracker;

pub use associator::{AssociationError, MergeStats, ModelAssociator};
pub use elector::{LocalElector, OriginalElector, SyncElector};
pub use events::{EventBus, Subscription, TrackerEvent};
pub use index::{DuplicateIndex, IndexContext, IndexEvent};
pub use keys::FlawId;
pub use model::{
    BookmarkModel, EditableBookmarkModel, InMemoryModel, ModelError, ModelEvent, NodeId, NodeInfo,
    SpecialFolder,
};
pub use prefs::{InMemoryPrefs, TrackerPrefs};
pub use stats::{StatChange, StatId, Stats};
pub use sync::{NodeSyncState, SyncCatalog, SyncId, SyncModel, SyncTree};
pub use tracker::{
    DuplicateTracker, RemovalPolicy, ScanSource, TrackerConfig, TrackerState, TrackerSyncState,
};
