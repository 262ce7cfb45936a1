//! Sync-side collaborator.
//!
//! The engine consults the host's sync machinery for two things: the mapping
//! between local node ids and server-assigned sync ids, and whether a sync id
//! has survived a commit round-trip ("acknowledged"). `SyncCatalog` is that
//! narrow view; `SyncModel` widens it with the tree navigation and node
//! creation the association pass needs. `SyncTree` is the in-memory stand-in
//! for both: a full remote tree with tagged permanent folders, associations,
//! an acknowledgement bit per node and a delete journal.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::NodeId;

/// Well-known tags of the permanent sync folders.
pub const BOOKMARK_BAR_TAG: &str = "bookmark_bar";
pub const OTHER_BOOKMARKS_TAG: &str = "other_bookmarks";
pub const MOBILE_BOOKMARKS_TAG: &str = "synced_bookmarks";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync node not found: {0}")]
    NotFound(SyncId),

    #[error("Sync node creation refused")]
    CreateRefused,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Server-assigned identifier of a sync-side node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct SyncId(pub u64);

impl SyncId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SyncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit status of one sync id as last reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeSyncState {
    /// Committed and acknowledged.
    Synced,
    /// Local change still in flight.
    Unsynced,
    /// Not a known sync id.
    Unknown,
}

/// The sync facts the engine reads. Implementations are interior-mutable and
/// shared with the host.
pub trait SyncCatalog: Send + Sync {
    /// Sync id currently associated with a local node, if any.
    fn sync_id_for_node(&self, node: NodeId) -> Option<SyncId>;

    fn node_sync_state(&self, id: SyncId) -> NodeSyncState;
}

impl<T: SyncCatalog + Send + Sync> SyncCatalog for std::sync::Arc<T> {
    fn sync_id_for_node(&self, node: NodeId) -> Option<SyncId> {
        (**self).sync_id_for_node(node)
    }
    fn node_sync_state(&self, id: SyncId) -> NodeSyncState {
        (**self).node_sync_state(id)
    }
}

/// Snapshot of one sync-side node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncNodeInfo {
    pub id: SyncId,
    pub parent: Option<SyncId>,
    pub title: String,
    pub url: Option<String>,
    pub is_folder: bool,
    /// Per-device identity of speed-dial folders.
    pub guid: Option<String>,
    /// Local node this sync node was last associated with.
    pub external_id: Option<NodeId>,
}

impl SyncNodeInfo {
    pub fn is_url(&self) -> bool {
        !self.is_folder
    }
}

/// One recorded remote deletion, matched against local nodes by attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub title: String,
    pub url: Option<String>,
    pub is_folder: bool,
}

/// Tree-shaped view of the remote side, consumed by association: navigation
/// plus the two writes a merge performs, creating nodes for local-only
/// content and recording associations.
pub trait SyncModel: SyncCatalog {
    /// Permanent folder for a well-known tag.
    fn root_for_tag(&self, tag: &str) -> Option<SyncId>;

    fn node(&self, id: SyncId) -> Option<SyncNodeInfo>;

    /// Child ids in order; empty for leaves and unknown ids.
    fn children(&self, id: SyncId) -> Vec<SyncId>;

    /// Create a sync node for a local one, at `index` under `parent`.
    /// The new node starts unacknowledged and associated with `external`.
    fn create_node(
        &self,
        parent: SyncId,
        index: usize,
        title: &str,
        url: Option<&str>,
        external: NodeId,
    ) -> Result<SyncId>;

    /// Record the association of a sync node with a local node. A node's
    /// previous association, if any, is dropped.
    fn associate(&self, id: SyncId, node: NodeId);

    /// Drain the delete journal; applied entries are not replayed.
    fn take_journal(&self) -> Vec<JournalEntry>;
}

impl<T: SyncModel + Send + Sync> SyncModel for std::sync::Arc<T> {
    fn root_for_tag(&self, tag: &str) -> Option<SyncId> {
        (**self).root_for_tag(tag)
    }
    fn node(&self, id: SyncId) -> Option<SyncNodeInfo> {
        (**self).node(id)
    }
    fn children(&self, id: SyncId) -> Vec<SyncId> {
        (**self).children(id)
    }
    fn create_node(
        &self,
        parent: SyncId,
        index: usize,
        title: &str,
        url: Option<&str>,
        external: NodeId,
    ) -> Result<SyncId> {
        (**self).create_node(parent, index, title, url, external)
    }
    fn associate(&self, id: SyncId, node: NodeId) {
        (**self).associate(id, node)
    }
    fn take_journal(&self) -> Vec<JournalEntry> {
        (**self).take_journal()
    }
}

struct SyncNodeRec {
    parent: Option<SyncId>,
    children: Vec<SyncId>,
    title: String,
    url: Option<String>,
    is_folder: bool,
    guid: Option<String>,
    external_id: Option<NodeId>,
    acknowledged: bool,
}

struct SyncTreeInner {
    nodes: HashMap<SyncId, SyncNodeRec>,
    tags: HashMap<String, SyncId>,
    by_external: HashMap<NodeId, SyncId>,
    journal: Vec<JournalEntry>,
    next_id: u64,
    refuse_creates: u32,
}

/// In-memory remote tree for tests and the CLI harness.
///
/// Nodes added through the builder methods are acknowledged, as server-origin
/// data is; nodes created through `create_node` start unacknowledged until
/// `acknowledge` flips them, as locally committed data does.
pub struct SyncTree {
    inner: RwLock<SyncTreeInner>,
}

impl SyncTree {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SyncTreeInner {
                nodes: HashMap::new(),
                tags: HashMap::new(),
                by_external: HashMap::new(),
                journal: Vec::new(),
                next_id: 1,
                refuse_creates: 0,
            }),
        }
    }

    pub fn add_permanent(&self, tag: &str) -> SyncId {
        let mut inner = self.inner.write().unwrap();
        let id = SyncId(inner.next_id);
        inner.next_id += 1;
        inner.nodes.insert(
            id,
            SyncNodeRec {
                parent: None,
                children: Vec::new(),
                title: tag.to_string(),
                url: None,
                is_folder: true,
                guid: None,
                external_id: None,
                acknowledged: true,
            },
        );
        inner.tags.insert(tag.to_string(), id);
        id
    }

    pub fn add_folder(&self, parent: SyncId, title: &str) -> SyncId {
        self.add_node(parent, title, None)
    }

    pub fn add_url(&self, parent: SyncId, title: &str, url: &str) -> SyncId {
        self.add_node(parent, title, Some(url.to_string()))
    }

    fn add_node(&self, parent: SyncId, title: &str, url: Option<String>) -> SyncId {
        let mut inner = self.inner.write().unwrap();
        assert!(
            inner.nodes.get(&parent).is_some_and(|p| p.is_folder),
            "parent {parent} must be an existing sync folder"
        );
        let id = SyncId(inner.next_id);
        inner.next_id += 1;
        let is_folder = url.is_none();
        inner.nodes.insert(
            id,
            SyncNodeRec {
                parent: Some(parent),
                children: Vec::new(),
                title: title.to_string(),
                url,
                is_folder,
                guid: None,
                external_id: None,
                acknowledged: true,
            },
        );
        inner.nodes.get_mut(&parent).unwrap().children.push(id);
        id
    }

    /// Make the next `count` calls to `create_node` fail, for error-path
    /// tests.
    pub fn refuse_next_creates(&self, count: u32) {
        self.inner.write().unwrap().refuse_creates = count;
    }

    pub fn set_guid(&self, id: SyncId, guid: &str) {
        if let Some(rec) = self.inner.write().unwrap().nodes.get_mut(&id) {
            rec.guid = Some(guid.to_string());
        }
    }

    pub fn acknowledge(&self, id: SyncId) {
        self.set_acknowledged(id, true);
    }

    pub fn mark_unsynced(&self, id: SyncId) {
        self.set_acknowledged(id, false);
    }

    fn set_acknowledged(&self, id: SyncId, acknowledged: bool) {
        if let Some(rec) = self.inner.write().unwrap().nodes.get_mut(&id) {
            rec.acknowledged = acknowledged;
        }
    }

    pub fn push_journal(&self, entry: JournalEntry) {
        self.inner.write().unwrap().journal.push(entry);
    }
}

impl Default for SyncTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCatalog for SyncTree {
    fn sync_id_for_node(&self, node: NodeId) -> Option<SyncId> {
        self.inner.read().unwrap().by_external.get(&node).copied()
    }

    fn node_sync_state(&self, id: SyncId) -> NodeSyncState {
        match self.inner.read().unwrap().nodes.get(&id) {
            Some(rec) if rec.acknowledged => NodeSyncState::Synced,
            Some(_) => NodeSyncState::Unsynced,
            None => NodeSyncState::Unknown,
        }
    }
}

impl SyncModel for SyncTree {
    fn root_for_tag(&self, tag: &str) -> Option<SyncId> {
        self.inner.read().unwrap().tags.get(tag).copied()
    }

    fn node(&self, id: SyncId) -> Option<SyncNodeInfo> {
        let inner = self.inner.read().unwrap();
        inner.nodes.get(&id).map(|rec| SyncNodeInfo {
            id,
            parent: rec.parent,
            title: rec.title.clone(),
            url: rec.url.clone(),
            is_folder: rec.is_folder,
            guid: rec.guid.clone(),
            external_id: rec.external_id,
        })
    }

    fn children(&self, id: SyncId) -> Vec<SyncId> {
        self.inner
            .read()
            .unwrap()
            .nodes
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn create_node(
        &self,
        parent: SyncId,
        index: usize,
        title: &str,
        url: Option<&str>,
        external: NodeId,
    ) -> Result<SyncId> {
        let mut inner = self.inner.write().unwrap();
        if inner.refuse_creates > 0 {
            inner.refuse_creates -= 1;
            return Err(SyncError::CreateRefused);
        }
        if !inner.nodes.contains_key(&parent) {
            return Err(SyncError::NotFound(parent));
        }
        let id = SyncId(inner.next_id);
        inner.next_id += 1;
        let is_folder = url.is_none();
        inner.nodes.insert(
            id,
            SyncNodeRec {
                parent: Some(parent),
                children: Vec::new(),
                title: title.to_string(),
                url: url.map(str::to_string),
                is_folder,
                guid: None,
                external_id: Some(external),
                acknowledged: false,
            },
        );
        let p = inner.nodes.get_mut(&parent).unwrap();
        let index = index.min(p.children.len());
        p.children.insert(index, id);
        inner.by_external.insert(external, id);
        Ok(id)
    }

    fn associate(&self, id: SyncId, node: NodeId) {
        let mut inner = self.inner.write().unwrap();
        if let Some(rec) = inner.nodes.get(&id)
            && let Some(old) = rec.external_id
        {
            inner.by_external.remove(&old);
        }
        if let Some(rec) = inner.nodes.get_mut(&id) {
            rec.external_id = Some(node);
        } else {
            return;
        }
        inner.by_external.insert(node, id);
    }

    fn take_journal(&self) -> Vec<JournalEntry> {
        std::mem::take(&mut self.inner.write().unwrap().journal)
    }
}
