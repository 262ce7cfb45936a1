//! Bookmark tree collaborator abstraction.
//!
//! The engine never owns the bookmark tree; the host does. `BookmarkModel` is
//! the narrow view the engine consumes: id-based accessors, the two mutation
//! primitives the removal tasks need, and a drainable event log standing in
//! for the host's synchronous observer dispatch.
//!
//! Implementations:
//! - `InMemoryModel` - reference tree for tests and the CLI harness

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Node not found: {0}")]
    NotFound(NodeId),

    #[error("Node is not a folder: {0}")]
    NotAFolder(NodeId),

    #[error("The root node cannot be moved or removed")]
    RootMutation,

    #[error("Index {index} out of bounds for folder {parent} with {len} children")]
    BadIndex {
        parent: NodeId,
        index: usize,
        len: usize,
    },

    #[error("Cannot move {0} into its own subtree")]
    CycleMove(NodeId),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Host-assigned bookmark node id. Stable for the session, unique within the
/// tree. The root always has id 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Point-in-time snapshot of one node's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: NodeId,
    /// None only for the tree root.
    pub parent: Option<NodeId>,
    pub title: String,
    /// Present for url nodes, absent for folders.
    pub url: Option<String>,
    pub is_folder: bool,
}

impl NodeInfo {
    pub fn is_url(&self) -> bool {
        !self.is_folder
    }

    /// Debug rendering: `[URL 12(4) 'title' 'http://x']`.
    pub fn describe(&self) -> String {
        let kind = if self.is_folder { "FOLDER" } else { "URL" };
        let parent = self.parent.map(|p| p.to_string()).unwrap_or_default();
        format!(
            "[{} {}({}) '{}' '{}']",
            kind,
            self.id,
            parent,
            self.title,
            self.url.as_deref().unwrap_or("")
        )
    }
}

/// Distinguished folders the host designates within the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpecialFolder {
    BookmarksBar,
    Other,
    Mobile,
    Trash,
    SpeedDial,
}

/// One tree-mutation notification, delivered in mutation order.
///
/// Removal is announced with a pre-removal snapshot (`WillRemove`) because the
/// node is gone by the time the event is drained; a folder removal produces a
/// single event for the folder, never one per descendant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ModelEvent {
    Loaded,
    #[serde(rename_all = "camelCase")]
    Added {
        node: NodeId,
        parent: NodeId,
        index: usize,
    },
    #[serde(rename_all = "camelCase")]
    WillRemove {
        node: NodeInfo,
        /// Full metadata bag of the node at removal time.
        meta: BTreeMap<String, String>,
        parent: NodeId,
        index: usize,
    },
    #[serde(rename_all = "camelCase")]
    Moved {
        node: NodeId,
        old_parent: NodeId,
        old_index: usize,
        new_parent: NodeId,
        new_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    WillChange {
        node: NodeId,
    },
    #[serde(rename_all = "camelCase")]
    WillReorder {
        parent: NodeId,
    },
    ExtensiveChangesBegin,
    ExtensiveChangesEnd,
}

/// The tree view and mutation surface the engine consumes.
///
/// Mutation methods take `&self`; implementations are interior-mutable so the
/// model can be shared between the host and the engine on one logical thread.
pub trait BookmarkModel: Send + Sync {
    /// Whether the host has finished loading the tree.
    fn is_loaded(&self) -> bool;

    /// Whether the host is inside a bulk-mutation bracket.
    fn extensive_changes_in_progress(&self) -> bool;

    fn root(&self) -> NodeId;

    fn node(&self, id: NodeId) -> Option<NodeInfo>;

    /// Child ids in order; empty for url nodes and unknown ids.
    fn children(&self, id: NodeId) -> Vec<NodeId>;

    fn child_count(&self, id: NodeId) -> usize;

    fn meta(&self, id: NodeId, key: &str) -> Option<String>;

    fn special_folder(&self, kind: SpecialFolder) -> Option<NodeId>;

    /// Total node count including the root.
    fn total_node_count(&self) -> u64;

    /// Move a node under `new_parent` at `index` (position counted after the
    /// node leaves its old slot, as hosts conventionally do).
    fn move_node(&self, id: NodeId, new_parent: NodeId, index: usize) -> Result<()>;

    /// Remove a node and its whole subtree.
    fn remove(&self, id: NodeId) -> Result<()>;

    /// Drain pending mutation events in delivery order.
    fn take_events(&self) -> Vec<ModelEvent>;

    /// Debug rendering of a node, `[?]` for unknown ids.
    fn describe(&self, id: NodeId) -> String {
        self.node(id)
            .map(|n| n.describe())
            .unwrap_or_else(|| "[?]".to_string())
    }
}

impl<T: BookmarkModel + Send + Sync> BookmarkModel for std::sync::Arc<T> {
    fn is_loaded(&self) -> bool {
        (**self).is_loaded()
    }
    fn extensive_changes_in_progress(&self) -> bool {
        (**self).extensive_changes_in_progress()
    }
    fn root(&self) -> NodeId {
        (**self).root()
    }
    fn node(&self, id: NodeId) -> Option<NodeInfo> {
        (**self).node(id)
    }
    fn children(&self, id: NodeId) -> Vec<NodeId> {
        (**self).children(id)
    }
    fn child_count(&self, id: NodeId) -> usize {
        (**self).child_count(id)
    }
    fn meta(&self, id: NodeId, key: &str) -> Option<String> {
        (**self).meta(id, key)
    }
    fn special_folder(&self, kind: SpecialFolder) -> Option<NodeId> {
        (**self).special_folder(kind)
    }
    fn total_node_count(&self) -> u64 {
        (**self).total_node_count()
    }
    fn move_node(&self, id: NodeId, new_parent: NodeId, index: usize) -> Result<()> {
        (**self).move_node(id, new_parent, index)
    }
    fn remove(&self, id: NodeId) -> Result<()> {
        (**self).remove(id)
    }
    fn take_events(&self) -> Vec<ModelEvent> {
        (**self).take_events()
    }
}

/// The wider mutation surface association needs: node creation at a position,
/// attribute updates from sync data, and the bulk-mutation bracket. The
/// tracker itself never creates nodes and stays on `BookmarkModel`.
pub trait EditableBookmarkModel: BookmarkModel {
    fn create_folder(&self, parent: NodeId, index: usize, title: &str) -> Result<NodeId>;

    fn create_url(&self, parent: NodeId, index: usize, title: &str, url: &str) -> Result<NodeId>;

    fn update_title(&self, id: NodeId, title: &str) -> Result<()>;

    /// No effect on folders.
    fn update_url(&self, id: NodeId, url: &str) -> Result<()>;

    /// Bulk-mutation bracket; nests, announcing only the outermost pair.
    fn begin_extensive_changes(&self);

    fn end_extensive_changes(&self);
}

impl<T: EditableBookmarkModel + Send + Sync> EditableBookmarkModel for std::sync::Arc<T> {
    fn create_folder(&self, parent: NodeId, index: usize, title: &str) -> Result<NodeId> {
        (**self).create_folder(parent, index, title)
    }
    fn create_url(&self, parent: NodeId, index: usize, title: &str, url: &str) -> Result<NodeId> {
        (**self).create_url(parent, index, title, url)
    }
    fn update_title(&self, id: NodeId, title: &str) -> Result<()> {
        (**self).update_title(id, title)
    }
    fn update_url(&self, id: NodeId, url: &str) -> Result<()> {
        (**self).update_url(id, url)
    }
    fn begin_extensive_changes(&self) {
        (**self).begin_extensive_changes()
    }
    fn end_extensive_changes(&self) {
        (**self).end_extensive_changes()
    }
}

struct NodeRec {
    parent: Option<NodeId>,
    title: String,
    url: Option<String>,
    is_folder: bool,
    children: Vec<NodeId>,
    meta: BTreeMap<String, String>,
}

struct ModelInner {
    nodes: HashMap<NodeId, NodeRec>,
    special: HashMap<SpecialFolder, NodeId>,
    events: Vec<ModelEvent>,
    next_id: u64,
    loaded: bool,
    extensive_depth: u32,
}

/// In-memory bookmark tree for tests and the CLI harness.
///
/// Mutations append to an internal event log that the driver drains with
/// `take_events()` and feeds to the tracker, mirroring the host's synchronous
/// observer dispatch.
pub struct InMemoryModel {
    inner: RwLock<ModelInner>,
}

impl InMemoryModel {
    pub fn new() -> Self {
        let model = Self::new_unloaded();
        model.inner.write().unwrap().loaded = true;
        model
    }

    /// A model that has not finished loading yet; see `finish_load`.
    pub fn new_unloaded() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::ROOT,
            NodeRec {
                parent: None,
                title: String::new(),
                url: None,
                is_folder: true,
                children: Vec::new(),
                meta: BTreeMap::new(),
            },
        );
        Self {
            inner: RwLock::new(ModelInner {
                nodes,
                special: HashMap::new(),
                events: Vec::new(),
                next_id: 1,
                loaded: false,
                extensive_depth: 0,
            }),
        }
    }

    /// Mark loading complete and announce it.
    pub fn finish_load(&self) {
        let mut inner = self.inner.write().unwrap();
        if !inner.loaded {
            inner.loaded = true;
            inner.events.push(ModelEvent::Loaded);
        }
    }

    pub fn add_folder(&self, parent: NodeId, title: &str) -> NodeId {
        self.add_node(parent, title, None)
    }

    pub fn add_url(&self, parent: NodeId, title: &str, url: &str) -> NodeId {
        self.add_node(parent, title, Some(url.to_string()))
    }

    fn add_node(&self, parent: NodeId, title: &str, url: Option<String>) -> NodeId {
        let index = self.child_count(parent);
        match self.create_at(parent, index, title, url) {
            Ok(id) => id,
            Err(err) => panic!("parent {parent} must be an existing folder: {err}"),
        }
    }

    fn create_at(
        &self,
        parent: NodeId,
        index: usize,
        title: &str,
        url: Option<String>,
    ) -> Result<NodeId> {
        let mut inner = self.inner.write().unwrap();
        let Some(p) = inner.nodes.get(&parent) else {
            return Err(ModelError::NotFound(parent));
        };
        if !p.is_folder {
            return Err(ModelError::NotAFolder(parent));
        }
        let len = p.children.len();
        if index > len {
            return Err(ModelError::BadIndex { parent, index, len });
        }
        let id = NodeId(inner.next_id);
        inner.next_id += 1;
        let is_folder = url.is_none();
        inner.nodes.insert(
            id,
            NodeRec {
                parent: Some(parent),
                title: title.to_string(),
                url,
                is_folder,
                children: Vec::new(),
                meta: BTreeMap::new(),
            },
        );
        inner.nodes.get_mut(&parent).unwrap().children.insert(index, id);
        inner.events.push(ModelEvent::Added {
            node: id,
            parent,
            index,
        });
        Ok(id)
    }

    pub fn set_meta(&self, id: NodeId, key: &str, value: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.meta.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_title(&self, id: NodeId, title: &str) {
        let mut inner = self.inner.write().unwrap();
        if inner.nodes.contains_key(&id) {
            inner.events.push(ModelEvent::WillChange { node: id });
            inner.nodes.get_mut(&id).unwrap().title = title.to_string();
        }
    }

    pub fn set_url(&self, id: NodeId, url: &str) {
        let mut inner = self.inner.write().unwrap();
        if inner.nodes.get(&id).is_some_and(|n| !n.is_folder) {
            inner.events.push(ModelEvent::WillChange { node: id });
            inner.nodes.get_mut(&id).unwrap().url = Some(url.to_string());
        }
    }

    pub fn reorder_children(&self, parent: NodeId, order: Vec<NodeId>) {
        let mut inner = self.inner.write().unwrap();
        let Some(rec) = inner.nodes.get(&parent) else {
            return;
        };
        assert_eq!(
            {
                let mut sorted = rec.children.clone();
                sorted.sort();
                sorted
            },
            {
                let mut sorted = order.clone();
                sorted.sort();
                sorted
            },
            "reorder must permute the existing children"
        );
        inner.events.push(ModelEvent::WillReorder { parent });
        inner.nodes.get_mut(&parent).unwrap().children = order;
    }

    pub fn mark_special(&self, kind: SpecialFolder, id: NodeId) {
        let mut inner = self.inner.write().unwrap();
        assert!(inner.nodes.contains_key(&id));
        inner.special.insert(kind, id);
    }

    fn snapshot(inner: &ModelInner, id: NodeId) -> Option<NodeInfo> {
        inner.nodes.get(&id).map(|rec| NodeInfo {
            id,
            parent: rec.parent,
            title: rec.title.clone(),
            url: rec.url.clone(),
            is_folder: rec.is_folder,
        })
    }

    fn is_descendant(inner: &ModelInner, node: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = inner.nodes.get(&node).and_then(|n| n.parent);
        while let Some(p) = cursor {
            if p == ancestor {
                return true;
            }
            cursor = inner.nodes.get(&p).and_then(|n| n.parent);
        }
        false
    }
}

impl Default for InMemoryModel {
    fn default() -> Self {
        Self::new()
    }
}

impl BookmarkModel for InMemoryModel {
    fn is_loaded(&self) -> bool {
        self.inner.read().unwrap().loaded
    }

    fn extensive_changes_in_progress(&self) -> bool {
        self.inner.read().unwrap().extensive_depth > 0
    }

    fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    fn node(&self, id: NodeId) -> Option<NodeInfo> {
        Self::snapshot(&self.inner.read().unwrap(), id)
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .read()
            .unwrap()
            .nodes
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn child_count(&self, id: NodeId) -> usize {
        self.inner
            .read()
            .unwrap()
            .nodes
            .get(&id)
            .map(|n| n.children.len())
            .unwrap_or(0)
    }

    fn meta(&self, id: NodeId, key: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .nodes
            .get(&id)
            .and_then(|n| n.meta.get(key).cloned())
    }

    fn special_folder(&self, kind: SpecialFolder) -> Option<NodeId> {
        self.inner.read().unwrap().special.get(&kind).copied()
    }

    fn total_node_count(&self) -> u64 {
        self.inner.read().unwrap().nodes.len() as u64
    }

    fn move_node(&self, id: NodeId, new_parent: NodeId, index: usize) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if id == NodeId::ROOT {
            return Err(ModelError::RootMutation);
        }
        let old_parent = inner
            .nodes
            .get(&id)
            .and_then(|n| n.parent)
            .ok_or(ModelError::NotFound(id))?;
        let target = inner
            .nodes
            .get(&new_parent)
            .ok_or(ModelError::NotFound(new_parent))?;
        if !target.is_folder {
            return Err(ModelError::NotAFolder(new_parent));
        }
        if id == new_parent || Self::is_descendant(&inner, new_parent, id) {
            return Err(ModelError::CycleMove(id));
        }

        let old_index = inner.nodes[&old_parent]
            .children
            .iter()
            .position(|c| *c == id)
            .ok_or(ModelError::NotFound(id))?;

        // No-op moves, same convention as host models.
        if old_parent == new_parent && (index == old_index || index == old_index + 1) {
            return Ok(());
        }

        let mut index = index;
        if old_parent == new_parent && old_index < index {
            index -= 1;
        }
        let len = if old_parent == new_parent {
            inner.nodes[&new_parent].children.len() - 1
        } else {
            inner.nodes[&new_parent].children.len()
        };
        if index > len {
            return Err(ModelError::BadIndex {
                parent: new_parent,
                index,
                len,
            });
        }

        inner
            .nodes
            .get_mut(&old_parent)
            .unwrap()
            .children
            .remove(old_index);
        inner
            .nodes
            .get_mut(&new_parent)
            .unwrap()
            .children
            .insert(index, id);
        inner.nodes.get_mut(&id).unwrap().parent = Some(new_parent);

        inner.events.push(ModelEvent::Moved {
            node: id,
            old_parent,
            old_index,
            new_parent,
            new_index: index,
        });
        Ok(())
    }

    fn remove(&self, id: NodeId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if id == NodeId::ROOT {
            return Err(ModelError::RootMutation);
        }
        let snapshot = Self::snapshot(&inner, id).ok_or(ModelError::NotFound(id))?;
        let parent = snapshot.parent.ok_or(ModelError::RootMutation)?;
        let index = inner.nodes[&parent]
            .children
            .iter()
            .position(|c| *c == id)
            .ok_or(ModelError::NotFound(id))?;
        let meta = inner.nodes[&id].meta.clone();

        inner.events.push(ModelEvent::WillRemove {
            node: snapshot,
            meta,
            parent,
            index,
        });

        inner.nodes.get_mut(&parent).unwrap().children.remove(index);
        // Drop the whole subtree; descendants get no events of their own.
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if let Some(rec) = inner.nodes.remove(&n) {
                stack.extend(rec.children);
            }
        }
        Ok(())
    }

    fn take_events(&self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.inner.write().unwrap().events)
    }
}

impl EditableBookmarkModel for InMemoryModel {
    fn create_folder(&self, parent: NodeId, index: usize, title: &str) -> Result<NodeId> {
        self.create_at(parent, index, title, None)
    }

    fn create_url(&self, parent: NodeId, index: usize, title: &str, url: &str) -> Result<NodeId> {
        self.create_at(parent, index, title, Some(url.to_string()))
    }

    fn update_title(&self, id: NodeId, title: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.nodes.contains_key(&id) {
            return Err(ModelError::NotFound(id));
        }
        inner.events.push(ModelEvent::WillChange { node: id });
        inner.nodes.get_mut(&id).unwrap().title = title.to_string();
        Ok(())
    }

    fn update_url(&self, id: NodeId, url: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(rec) = inner.nodes.get(&id) else {
            return Err(ModelError::NotFound(id));
        };
        if rec.is_folder {
            return Ok(());
        }
        inner.events.push(ModelEvent::WillChange { node: id });
        inner.nodes.get_mut(&id).unwrap().url = Some(url.to_string());
        Ok(())
    }

    fn begin_extensive_changes(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.extensive_depth += 1;
        if inner.extensive_depth == 1 {
            inner.events.push(ModelEvent::ExtensiveChangesBegin);
        }
    }

    fn end_extensive_changes(&self) {
        let mut inner = self.inner.write().unwrap();
        assert!(inner.extensive_depth > 0);
        inner.extensive_depth -= 1;
        if inner.extensive_depth == 0 {
            inner.events.push(ModelEvent::ExtensiveChangesEnd);
        }
    }
}
