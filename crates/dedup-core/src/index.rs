//! Duplicate index.
//!
//! Files every indexed node under its `FlawId` and tracks which keys
//! currently hold more than one node (the flawed keys). The index never walks
//! the tree on its own; the indexing tasks feed it one node at a time and
//! removals hand it the last known attributes of the departing node.
//!
//! Ignoring is lazy and downward: when a folder's parent is already ignored
//! the folder joins the ignored set and its subtree is skipped as indexing
//! reaches it. Membership checks are a single set lookup, never an ancestor
//! walk.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::error;

use crate::keys::{self, FlawId, KeySource};
use crate::model::{BookmarkModel, NodeId, NodeInfo};

/// Tree landmarks the index classifies against. Rebuilt by the tracker when a
/// scan starts or the model loads.
#[derive(Debug, Clone)]
pub struct IndexContext {
    pub root: NodeId,
    pub speed_dial: Option<NodeId>,
    /// Speed-dial child owned by this device; folders outside it are treated
    /// as generated.
    pub local_device_root: Option<NodeId>,
    /// Title given to generated folders, in the UI language.
    pub default_folder_name: String,
}

/// Index membership change observed during one insert or remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    /// A key gained a redundant copy.
    DuplicateAppeared { key: FlawId, node: NodeId },
    /// A key crossed from one member to two.
    FlawAppeared { key: FlawId },
    /// A key lost a redundant copy.
    DuplicateDisappeared { key: FlawId, node: NodeId },
    /// A key dropped back to a single member.
    FlawDisappeared { key: FlawId },
    /// A generated speed-dial folder was skipped.
    SpeeddialFolderIgnored { node: NodeId },
    /// A previously skipped speed-dial folder left the tree.
    SpeeddialFolderDropped { node: NodeId },
}

#[derive(Debug, Default)]
pub struct DuplicateIndex {
    buckets: HashMap<FlawId, BTreeSet<NodeId>>,
    flawed: BTreeSet<FlawId>,
    ignored_parents: HashSet<NodeId>,
    speeddial_parents: HashSet<NodeId>,
}

impl DuplicateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an ignored subtree root before indexing reaches it.
    pub fn ignore_parent(&mut self, id: NodeId) {
        self.ignored_parents.insert(id);
    }

    /// Seed the speed-dial root so descendants classify as speed-dial nodes.
    pub fn add_speeddial_parent(&mut self, id: NodeId) {
        self.speeddial_parents.insert(id);
    }

    pub fn insert_node(
        &mut self,
        model: &dyn BookmarkModel,
        ctx: &IndexContext,
        info: &NodeInfo,
    ) -> Vec<IndexEvent> {
        // Permanent folders hang off the root and are never duplicates.
        let Some(parent) = info.parent else {
            return Vec::new();
        };
        if parent == ctx.root {
            return Vec::new();
        }

        if self.ignored_parents.contains(&parent) {
            if info.is_folder {
                self.ignored_parents.insert(info.id);
            }
            return Vec::new();
        }

        if info.is_folder && self.speeddial_parents.contains(&parent) {
            self.speeddial_parents.insert(info.id);
        }

        let guid = if ctx.speed_dial == Some(parent) {
            model.meta(info.id, keys::SPEED_DIAL_GUID_KEY)
        } else {
            None
        };
        let src = KeySource::from_info(info, guid.as_deref());
        if self.is_generated_speeddial_folder(model, ctx, info.id, &src, parent) {
            return vec![IndexEvent::SpeeddialFolderIgnored { node: info.id }];
        }

        let key = keys::flaw_id(&src, parent, ctx.speed_dial == Some(parent));
        let bucket = self.buckets.entry(key.clone()).or_default();
        if !bucket.insert(info.id) {
            error!(node = %info.id, key = %key, "node indexed twice under the same key");
            debug_assert!(false, "node indexed twice under the same key");
            return Vec::new();
        }

        let mut events = Vec::new();
        if bucket.len() >= 2 {
            events.push(IndexEvent::DuplicateAppeared {
                key: key.clone(),
                node: info.id,
            });
            if bucket.len() == 2 {
                self.flawed.insert(key.clone());
                events.push(IndexEvent::FlawAppeared { key });
            }
        }
        events
    }

    /// Drop a node that was indexed under `parent`.
    ///
    /// `parent` is the parent the node was filed under, which after a move is
    /// not the parent it has now. `src` carries the last known attributes so
    /// removed nodes can still be keyed.
    pub fn remove_node(
        &mut self,
        model: &dyn BookmarkModel,
        ctx: &IndexContext,
        node: NodeId,
        src: &KeySource<'_>,
        parent: NodeId,
    ) -> Vec<IndexEvent> {
        if parent == ctx.root {
            return Vec::new();
        }

        self.ignored_parents.remove(&node);
        if self.ignored_parents.contains(&parent) {
            return Vec::new();
        }

        if self.is_generated_speeddial_folder(model, ctx, node, src, parent) {
            self.speeddial_parents.remove(&node);
            return vec![IndexEvent::SpeeddialFolderDropped { node }];
        }
        if src.is_folder {
            self.speeddial_parents.remove(&node);
        }

        let key = keys::flaw_id(src, parent, ctx.speed_dial == Some(parent));
        let Some(bucket) = self.buckets.get_mut(&key) else {
            // Never indexed; scans that have not reached it land here.
            return Vec::new();
        };
        if !bucket.remove(&node) {
            error!(node = %node, key = %key, "indexed node missing from its bucket");
            debug_assert!(false, "indexed node missing from its bucket");
            return Vec::new();
        }

        let remaining = bucket.len();
        if remaining == 0 {
            self.buckets.remove(&key);
        }

        let mut events = Vec::new();
        if remaining >= 1 {
            events.push(IndexEvent::DuplicateDisappeared {
                key: key.clone(),
                node,
            });
            if remaining == 1 {
                self.flawed.remove(&key);
                events.push(IndexEvent::FlawDisappeared { key });
            }
        }
        events
    }

    /// Generated speed-dial folders: inside the speed-dial subtree but not a
    /// direct child of its root, and either untitled, carrying the default
    /// folder title, or outside the local device's own subtree.
    fn is_generated_speeddial_folder(
        &self,
        model: &dyn BookmarkModel,
        ctx: &IndexContext,
        node: NodeId,
        src: &KeySource<'_>,
        parent: NodeId,
    ) -> bool {
        if !src.is_folder {
            return false;
        }
        if !self.speeddial_parents.contains(&node) {
            return false;
        }
        if ctx.speed_dial == Some(parent) {
            return false;
        }
        src.title.is_empty()
            || src.title == ctx.default_folder_name
            || !Self::under_local_device_root(model, ctx, parent)
    }

    fn under_local_device_root(
        model: &dyn BookmarkModel,
        ctx: &IndexContext,
        parent: NodeId,
    ) -> bool {
        let Some(local_root) = ctx.local_device_root else {
            return false;
        };
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == local_root {
                return true;
            }
            cursor = model.node(id).and_then(|n| n.parent);
        }
        false
    }

    /// Flawed keys in ascending key order.
    pub fn flawed_ids(&self) -> impl Iterator<Item = &FlawId> {
        self.flawed.iter()
    }

    /// Members of a key's bucket in ascending node-id order.
    pub fn members(&self, key: &FlawId) -> Option<&BTreeSet<NodeId>> {
        self.buckets.get(key)
    }

    pub fn is_ignored(&self, node: NodeId) -> bool {
        self.ignored_parents.contains(&node)
    }

    pub fn flawed_count(&self) -> u64 {
        self.flawed.len() as u64
    }

    pub fn ignored_count(&self) -> u64 {
        self.ignored_parents.len() as u64
    }

    pub fn is_clean(&self) -> bool {
        self.flawed.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.flawed.clear();
        self.ignored_parents.clear();
        self.speeddial_parents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InMemoryModel;
    use rand::prelude::*;

    const DEFAULT_FOLDER: &str = "New folder";

    struct Fixture {
        model: InMemoryModel,
        ctx: IndexContext,
        bar: NodeId,
        trash: NodeId,
        speed_dial: NodeId,
        local_root: NodeId,
    }

    fn fixture() -> Fixture {
        let model = InMemoryModel::new();
        let bar = model.add_folder(NodeId::ROOT, "Bookmarks bar");
        let trash = model.add_folder(NodeId::ROOT, "Trash");
        let speed_dial = model.add_folder(NodeId::ROOT, "Speed Dial");
        let local_root = model.add_folder(speed_dial, "This device");
        let ctx = IndexContext {
            root: NodeId::ROOT,
            speed_dial: Some(speed_dial),
            local_device_root: Some(local_root),
            default_folder_name: DEFAULT_FOLDER.to_string(),
        };
        Fixture {
            model,
            ctx,
            bar,
            trash,
            speed_dial,
            local_root,
        }
    }

    fn seeded(f: &Fixture) -> DuplicateIndex {
        let mut index = DuplicateIndex::new();
        index.ignore_parent(f.trash);
        index.add_speeddial_parent(f.speed_dial);
        index
    }

    fn insert(index: &mut DuplicateIndex, f: &Fixture, id: NodeId) -> Vec<IndexEvent> {
        let info = f.model.node(id).unwrap();
        index.insert_node(&f.model, &f.ctx, &info)
    }

    fn remove_live(index: &mut DuplicateIndex, f: &Fixture, id: NodeId) -> Vec<IndexEvent> {
        let info = f.model.node(id).unwrap();
        let parent = info.parent.unwrap();
        let guid = f.model.meta(id, keys::SPEED_DIAL_GUID_KEY);
        let src = KeySource::from_info(&info, guid.as_deref());
        index.remove_node(&f.model, &f.ctx, id, &src, parent)
    }

    fn insert_subtree(index: &mut DuplicateIndex, f: &Fixture, id: NodeId) {
        insert(index, f, id);
        for child in f.model.children(id) {
            insert_subtree(index, f, child);
        }
    }

    // ==================== Duplicate bookkeeping ====================

    #[test]
    fn test_second_copy_raises_duplicate_and_flaw() {
        let f = fixture();
        let mut index = seeded(&f);
        let a = f.model.add_url(f.bar, "news", "http://n");
        let b = f.model.add_url(f.bar, "news", "http://n");

        assert!(insert(&mut index, &f, a).is_empty());
        let events = insert(&mut index, &f, b);
        assert!(matches!(events[0], IndexEvent::DuplicateAppeared { node, .. } if node == b));
        assert!(matches!(events[1], IndexEvent::FlawAppeared { .. }));
        assert_eq!(index.flawed_count(), 1);
    }

    #[test]
    fn test_third_copy_raises_duplicate_only() {
        let f = fixture();
        let mut index = seeded(&f);
        for _ in 0..2 {
            let n = f.model.add_url(f.bar, "news", "http://n");
            insert(&mut index, &f, n);
        }
        let c = f.model.add_url(f.bar, "news", "http://n");
        let events = insert(&mut index, &f, c);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], IndexEvent::DuplicateAppeared { .. }));
        assert_eq!(index.flawed_count(), 1);
    }

    #[test]
    fn test_same_attributes_different_parents_are_distinct() {
        let f = fixture();
        let mut index = seeded(&f);
        let other = f.model.add_folder(f.bar, "other");
        let a = f.model.add_url(f.bar, "news", "http://n");
        let b = f.model.add_url(other, "news", "http://n");
        insert(&mut index, &f, other);
        insert(&mut index, &f, a);
        assert!(insert(&mut index, &f, b).is_empty());
        assert_eq!(index.flawed_count(), 0);
    }

    #[test]
    fn test_removal_dissolves_flaw() {
        let f = fixture();
        let mut index = seeded(&f);
        let a = f.model.add_url(f.bar, "news", "http://n");
        let b = f.model.add_url(f.bar, "news", "http://n");
        insert(&mut index, &f, a);
        insert(&mut index, &f, b);

        let events = remove_live(&mut index, &f, b);
        assert!(matches!(events[0], IndexEvent::DuplicateDisappeared { node, .. } if node == b));
        assert!(matches!(events[1], IndexEvent::FlawDisappeared { .. }));
        assert!(index.is_clean());
    }

    #[test]
    fn test_removing_lone_member_is_silent() {
        let f = fixture();
        let mut index = seeded(&f);
        let a = f.model.add_url(f.bar, "news", "http://n");
        insert(&mut index, &f, a);
        assert!(remove_live(&mut index, &f, a).is_empty());
    }

    #[test]
    fn test_removing_unindexed_node_is_silent() {
        let f = fixture();
        let mut index = seeded(&f);
        let a = f.model.add_url(f.bar, "late", "http://l");
        assert!(remove_live(&mut index, &f, a).is_empty());
    }

    #[test]
    fn test_root_children_never_indexed() {
        let f = fixture();
        let mut index = seeded(&f);
        assert!(insert(&mut index, &f, f.bar).is_empty());
        let twin = f.model.add_folder(NodeId::ROOT, "Bookmarks bar");
        assert!(insert(&mut index, &f, twin).is_empty());
        assert_eq!(index.flawed_count(), 0);
    }

    #[test]
    fn test_removal_uses_the_parent_passed_in() {
        let f = fixture();
        let mut index = seeded(&f);
        let other = f.model.add_folder(f.bar, "other");
        let a = f.model.add_url(f.bar, "news", "http://n");
        let b = f.model.add_url(f.bar, "news", "http://n");
        insert(&mut index, &f, other);
        insert(&mut index, &f, a);
        insert(&mut index, &f, b);

        // b moved away; unindexing keys it under the old parent.
        f.model.move_node(b, other, 0).unwrap();
        let info = f.model.node(b).unwrap();
        let src = KeySource::from_info(&info, None);
        let events = index.remove_node(&f.model, &f.ctx, b, &src, f.bar);
        assert_eq!(events.len(), 2);
        assert!(index.is_clean());
    }

    // ==================== Ignored subtrees ====================

    #[test]
    fn test_ignoring_spreads_down_through_folders() {
        let f = fixture();
        let mut index = seeded(&f);
        let folder = f.model.add_folder(f.trash, "old");
        let a = f.model.add_url(folder, "news", "http://n");
        let b = f.model.add_url(folder, "news", "http://n");

        insert_subtree(&mut index, &f, folder);
        let _ = (a, b);
        assert_eq!(index.flawed_count(), 0);
        // Trash plus the folder that joined lazily.
        assert_eq!(index.ignored_count(), 2);
    }

    #[test]
    fn test_removal_under_ignored_parent_is_silent() {
        let f = fixture();
        let mut index = seeded(&f);
        let folder = f.model.add_folder(f.trash, "old");
        insert(&mut index, &f, folder);
        assert_eq!(index.ignored_count(), 2);

        let events = remove_live(&mut index, &f, folder);
        assert!(events.is_empty());
        assert_eq!(index.ignored_count(), 1);
    }

    // ==================== Speed dial ====================

    #[test]
    fn test_speed_dial_children_disambiguated_by_partner_id() {
        let f = fixture();
        let mut index = seeded(&f);
        let a = f.model.add_url(f.speed_dial, "dial", "http://d");
        let b = f.model.add_url(f.speed_dial, "dial", "http://d");
        f.model.set_meta(a, keys::SPEED_DIAL_GUID_KEY, "p1");
        f.model.set_meta(b, keys::SPEED_DIAL_GUID_KEY, "p2");

        insert(&mut index, &f, a);
        assert!(insert(&mut index, &f, b).is_empty());

        let c = f.model.add_url(f.speed_dial, "dial", "http://d");
        f.model.set_meta(c, keys::SPEED_DIAL_GUID_KEY, "p1");
        let events = insert(&mut index, &f, c);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_generated_speeddial_folder_skipped() {
        let f = fixture();
        let mut index = seeded(&f);
        insert(&mut index, &f, f.local_root);
        let generated = f.model.add_folder(f.local_root, DEFAULT_FOLDER);

        let events = insert(&mut index, &f, generated);
        assert_eq!(
            events,
            vec![IndexEvent::SpeeddialFolderIgnored { node: generated }]
        );

        // Its children still index normally.
        let a = f.model.add_url(generated, "dial", "http://d");
        let b = f.model.add_url(generated, "dial", "http://d");
        insert(&mut index, &f, a);
        assert_eq!(insert(&mut index, &f, b).len(), 2);
    }

    #[test]
    fn test_named_folder_outside_local_device_root_skipped() {
        let f = fixture();
        let mut index = seeded(&f);
        let other_device = f.model.add_folder(f.speed_dial, "Phone");
        insert(&mut index, &f, other_device);
        let named = f.model.add_folder(other_device, "Work");

        let events = insert(&mut index, &f, named);
        assert_eq!(
            events,
            vec![IndexEvent::SpeeddialFolderIgnored { node: named }]
        );
    }

    #[test]
    fn test_named_local_folder_indexed() {
        let f = fixture();
        let mut index = seeded(&f);
        insert(&mut index, &f, f.local_root);
        let named = f.model.add_folder(f.local_root, "Work");
        assert!(insert(&mut index, &f, named).is_empty());
        assert_eq!(index.flawed_count(), 0);

        let twin = f.model.add_folder(f.local_root, "Work");
        let events = insert(&mut index, &f, twin);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_direct_speed_dial_child_folder_kept() {
        let f = fixture();
        let mut index = seeded(&f);
        let direct = f.model.add_folder(f.speed_dial, DEFAULT_FOLDER);
        assert!(insert(&mut index, &f, direct).is_empty());
    }

    #[test]
    fn test_dropping_generated_speeddial_folder() {
        let f = fixture();
        let mut index = seeded(&f);
        insert(&mut index, &f, f.local_root);
        let generated = f.model.add_folder(f.local_root, DEFAULT_FOLDER);
        insert(&mut index, &f, generated);

        let events = remove_live(&mut index, &f, generated);
        assert_eq!(
            events,
            vec![IndexEvent::SpeeddialFolderDropped { node: generated }]
        );
    }

    // ==================== Consistency ====================

    #[test]
    fn test_clear_drops_everything() {
        let f = fixture();
        let mut index = seeded(&f);
        let a = f.model.add_url(f.bar, "news", "http://n");
        let b = f.model.add_url(f.bar, "news", "http://n");
        insert(&mut index, &f, a);
        insert(&mut index, &f, b);

        index.clear();
        assert_eq!(index.flawed_count(), 0);
        assert_eq!(index.ignored_count(), 0);
        assert!(index.is_clean());
    }

    #[test]
    fn test_reindexing_after_clear_matches_first_pass() {
        let f = fixture();
        let mut index = seeded(&f);
        for _ in 0..3 {
            let n = f.model.add_url(f.bar, "news", "http://n");
            insert(&mut index, &f, n);
        }
        let first: Vec<FlawId> = index.flawed_ids().cloned().collect();

        index.clear();
        index.ignore_parent(f.trash);
        index.add_speeddial_parent(f.speed_dial);
        insert_subtree(&mut index, &f, f.bar);
        let second: Vec<FlawId> = index.flawed_ids().cloned().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_flawed_set_tracks_bucket_sizes_under_random_churn() {
        let f = fixture();
        let mut index = seeded(&f);
        let mut rng = StdRng::seed_from_u64(7);
        let titles = ["a", "b", "c"];
        let mut live: Vec<NodeId> = Vec::new();

        for _ in 0..200 {
            if live.is_empty() || rng.random_range(0..3) > 0 {
                let title = titles[rng.random_range(0..titles.len())];
                let n = f.model.add_url(f.bar, title, "http://x");
                insert(&mut index, &f, n);
                live.push(n);
            } else {
                let n = live.swap_remove(rng.random_range(0..live.len()));
                remove_live(&mut index, &f, n);
                f.model.remove(n).unwrap();
            }
        }

        for key in index.flawed_ids() {
            assert!(index.members(key).unwrap().len() >= 2);
        }
        let mut duplicates = 0;
        for title in titles {
            let count = live
                .iter()
                .filter(|n| f.model.node(**n).unwrap().title == title)
                .count();
            if count >= 2 {
                duplicates += 1;
            }
        }
        assert_eq!(index.flawed_count(), duplicates);
    }
}
