//! One-shot association of the local bookmark tree with the remote sync tree.
//!
//! Runs when sync turns on or re-associates: walks both trees top-down from
//! the permanent folders, pairing children by content, pulling sync-side
//! content into the local tree and pushing local-only content out. Recorded
//! remote deletions are applied first. A successful pass leaves every node on
//! both sides associated, which is the precondition for the tracker entering
//! its `Associated` mode.
//!
//! Structural problems (a missing permanent folder, a dangling sync id, a
//! refused creation) abort the pass; the caller must not persist association
//! markers and must fall back to a fresh pass later.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::keys;
use crate::model::{EditableBookmarkModel, ModelError, NodeId, SpecialFolder};
use crate::sync::{
    BOOKMARK_BAR_TAG, JournalEntry, MOBILE_BOOKMARKS_TAG, OTHER_BOOKMARKS_TAG, SyncError, SyncId,
    SyncModel, SyncNodeInfo,
};

/// Longest title the local model stores. Sync-side titles may exceed it.
const MAX_TITLE_BYTES: usize = 255;

/// The permanent folders, their local designations, and whether their absence
/// aborts the pass. Mobile bookmarks only exist once a mobile device has
/// synced.
const PERMANENT_FOLDERS: [(&str, SpecialFolder, bool); 3] = [
    (BOOKMARK_BAR_TAG, SpecialFolder::BookmarksBar, true),
    (OTHER_BOOKMARKS_TAG, SpecialFolder::Other, true),
    (MOBILE_BOOKMARKS_TAG, SpecialFolder::Mobile, false),
];

#[derive(Debug, Error)]
pub enum AssociationError {
    #[error("Permanent sync folder '{0}' not found")]
    PermanentNodeMissing(&'static str),

    #[error("No local folder corresponds to sync folder {0}")]
    LocalFolderMissing(SyncId),

    #[error("Sync tree operation failed: {0}")]
    Sync(#[from] SyncError),

    #[error("Local tree operation failed: {0}")]
    Model(#[from] ModelError),
}

pub type Result<T> = std::result::Result<T, AssociationError>;

/// What one association pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub local_added: u64,
    pub local_updated: u64,
    pub local_removed: u64,
    pub sync_created: u64,
    /// Extra local candidates seen while matching, i.e. content the
    /// duplicate tracker will want to look at.
    pub duplicates_seen: u64,
}

/// Merges the local tree with the sync tree, in place, inside one
/// extensive-changes bracket.
pub struct ModelAssociator<'a, M, S> {
    model: &'a M,
    sync: &'a S,
    stats: MergeStats,
}

impl<'a, M: EditableBookmarkModel, S: SyncModel> ModelAssociator<'a, M, S> {
    pub fn new(model: &'a M, sync: &'a S) -> Self {
        Self {
            model,
            sync,
            stats: MergeStats::default(),
        }
    }

    /// Run the full pass. On error the trees may hold partial edits; the
    /// caller must treat the association as failed and run a fresh pass
    /// rather than committing its markers.
    pub fn associate_models(mut self) -> Result<MergeStats> {
        self.model.begin_extensive_changes();
        let outcome = self.run();
        self.model.end_extensive_changes();
        match outcome {
            Ok(()) => {
                info!(
                    added = self.stats.local_added,
                    updated = self.stats.local_updated,
                    removed = self.stats.local_removed,
                    pushed = self.stats.sync_created,
                    duplicates = self.stats.duplicates_seen,
                    "association complete"
                );
                Ok(self.stats)
            }
            Err(err) => {
                warn!(%err, "association aborted");
                Err(err)
            }
        }
    }

    fn run(&mut self) -> Result<()> {
        self.apply_delete_journal()?;

        let mut stack: Vec<(SyncId, NodeId)> = Vec::new();
        for (tag, kind, required) in PERMANENT_FOLDERS {
            match (self.sync.root_for_tag(tag), self.model.special_folder(kind)) {
                (Some(sync_root), Some(local_root)) => {
                    self.sync.associate(sync_root, local_root);
                    stack.push((sync_root, local_root));
                }
                _ if required => return Err(AssociationError::PermanentNodeMissing(tag)),
                _ => debug!(tag, "permanent folder absent, skipping"),
            }
        }

        while let Some((sync_parent, local_parent)) = stack.pop() {
            if self.model.node(local_parent).is_none() {
                return Err(AssociationError::LocalFolderMissing(sync_parent));
            }
            self.merge_children(sync_parent, local_parent, &mut stack)?;
        }
        Ok(())
    }

    /// Merge one folder level. Sync children claim matching local children
    /// and take positions 0..n in order; unclaimed locals end up behind them
    /// and are pushed to sync, keeping their relative order.
    fn merge_children(
        &mut self,
        sync_parent: SyncId,
        local_parent: NodeId,
        stack: &mut Vec<(SyncId, NodeId)>,
    ) -> Result<()> {
        let mut unmatched: Vec<(usize, NodeId)> = self
            .model
            .children(local_parent)
            .into_iter()
            .enumerate()
            .collect();

        let mut position = 0usize;
        for sync_child_id in self.sync.children(sync_parent) {
            let Some(sync_child) = self.sync.node(sync_child_id) else {
                return Err(AssociationError::Sync(SyncError::NotFound(sync_child_id)));
            };
            if sync_child.is_url() && !is_valid_url(sync_child.url.as_deref()) {
                debug!(id = %sync_child_id, "sync leaf without a usable url, skipping");
                continue;
            }
            let local_child = match self.claim_match(&sync_child, &mut unmatched) {
                Some(node) => {
                    self.model.move_node(node, local_parent, position)?;
                    self.update_local(node, &sync_child)?;
                    node
                }
                None => self.create_local(local_parent, position, &sync_child)?,
            };
            self.sync.associate(sync_child_id, local_child);
            if sync_child.is_folder {
                stack.push((sync_child_id, local_child));
            }
            position += 1;
        }

        for &(_, node) in &unmatched {
            let Some(info) = self.model.node(node) else {
                continue;
            };
            let index = self.sync.children(sync_parent).len();
            let sync_id =
                self.sync
                    .create_node(sync_parent, index, &info.title, info.url.as_deref(), node)?;
            self.stats.sync_created += 1;
            debug!(node = %self.model.describe(node), sync = %sync_id, "pushed local node to sync");
            if info.is_folder {
                stack.push((sync_id, node));
            }
        }
        Ok(())
    }

    /// Find and remove the best local match for a sync child from the pool.
    /// With several identical candidates, the one this sync node was
    /// associated with last time wins; otherwise the first in child order.
    fn claim_match(
        &mut self,
        sync_child: &SyncNodeInfo,
        unmatched: &mut Vec<(usize, NodeId)>,
    ) -> Option<NodeId> {
        let candidates: Vec<usize> = unmatched
            .iter()
            .enumerate()
            .filter(|&(_, &(_, node))| self.matches_sync_node(node, sync_child))
            .map(|(i, _)| i)
            .collect();
        if candidates.len() > 1 {
            self.stats.duplicates_seen += candidates.len() as u64 - 1;
        }
        let pick = match candidates.len() {
            0 => return None,
            1 => candidates[0],
            _ => candidates
                .iter()
                .copied()
                .find(|&i| Some(unmatched[i].1) == sync_child.external_id)
                .unwrap_or(candidates[0]),
        };
        Some(unmatched.remove(pick).1)
    }

    fn matches_sync_node(&self, node: NodeId, sync_child: &SyncNodeInfo) -> bool {
        let Some(info) = self.model.node(node) else {
            return false;
        };
        if info.is_folder != sync_child.is_folder {
            return false;
        }
        if !sync_child.is_folder && info.url != sync_child.url {
            return false;
        }
        if legal_title(&info.title) != legal_title(&sync_child.title) {
            return false;
        }
        // A GUID is decisive only when both sides carry one.
        if let Some(sync_guid) = sync_child.guid.as_deref()
            && let Some(local_guid) = self.model.meta(node, keys::SPEED_DIAL_GUID_KEY)
            && local_guid != sync_guid
        {
            return false;
        }
        true
    }

    /// Bring a matched local node up to date with its sync counterpart.
    fn update_local(&mut self, node: NodeId, sync_child: &SyncNodeInfo) -> Result<()> {
        let Some(info) = self.model.node(node) else {
            return Err(AssociationError::Model(ModelError::NotFound(node)));
        };
        let title = legal_title(&sync_child.title);
        let mut touched = false;
        if info.title != title {
            self.model.update_title(node, &title)?;
            touched = true;
        }
        if let Some(url) = sync_child.url.as_deref()
            && info.url.as_deref() != Some(url)
        {
            self.model.update_url(node, url)?;
            touched = true;
        }
        if touched {
            self.stats.local_updated += 1;
        }
        Ok(())
    }

    fn create_local(
        &mut self,
        parent: NodeId,
        position: usize,
        sync_child: &SyncNodeInfo,
    ) -> Result<NodeId> {
        let title = legal_title(&sync_child.title);
        let node = match sync_child.url.as_deref() {
            Some(url) => self.model.create_url(parent, position, &title, url)?,
            None => self.model.create_folder(parent, position, &title)?,
        };
        self.stats.local_added += 1;
        debug!(node = %self.model.describe(node), "created local node from sync");
        Ok(node)
    }

    // ==================== Delete journal ====================

    /// Apply deletions other clients recorded while this one was away.
    /// Mark-then-drop: a folder goes only when its entire subtree is marked,
    /// so unmarked descendants are never orphaned.
    fn apply_delete_journal(&mut self) -> Result<()> {
        let journal = self.sync.take_journal();
        if journal.is_empty() {
            return Ok(());
        }
        let protected: HashSet<NodeId> = [
            SpecialFolder::BookmarksBar,
            SpecialFolder::Other,
            SpecialFolder::Mobile,
            SpecialFolder::Trash,
            SpecialFolder::SpeedDial,
        ]
        .into_iter()
        .filter_map(|kind| self.model.special_folder(kind))
        .collect();

        let mut marked: HashSet<NodeId> = HashSet::new();
        let mut walk = vec![self.model.root()];
        while let Some(id) = walk.pop() {
            walk.extend(self.model.children(id));
            if id == self.model.root() || protected.contains(&id) {
                continue;
            }
            let Some(info) = self.model.node(id) else {
                continue;
            };
            let legal = legal_title(&info.title);
            if journal.iter().any(|entry| {
                entry.is_folder == info.is_folder
                    && entry.url == info.url
                    && legal_title(&entry.title) == legal
            }) {
                marked.insert(id);
            }
        }
        debug!(entries = journal.len(), marked = marked.len(), "applying delete journal");
        self.drop_marked(self.model.root(), &marked)
    }

    fn drop_marked(&mut self, id: NodeId, marked: &HashSet<NodeId>) -> Result<()> {
        for child in self.model.children(id) {
            if marked.contains(&child) && self.subtree_fully_marked(child, marked) {
                debug!(node = %self.model.describe(child), "applying recorded remote deletion");
                let removed = self.subtree_size(child);
                self.model.remove(child)?;
                self.stats.local_removed += removed;
            } else {
                self.drop_marked(child, marked)?;
            }
        }
        Ok(())
    }

    fn subtree_fully_marked(&self, id: NodeId, marked: &HashSet<NodeId>) -> bool {
        marked.contains(&id)
            && self
                .model
                .children(id)
                .into_iter()
                .all(|child| self.subtree_fully_marked(child, marked))
    }

    fn subtree_size(&self, id: NodeId) -> u64 {
        1 + self
            .model
            .children(id)
            .into_iter()
            .map(|child| self.subtree_size(child))
            .sum::<u64>()
    }
}

fn is_valid_url(url: Option<&str>) -> bool {
    url.is_some_and(|u| !u.trim().is_empty())
}

/// The form a title takes once the local model has stored it: truncated to
/// the storage limit on a char boundary, with a space appended to names a
/// filesystem-backed host cannot store verbatim.
fn legal_title(title: &str) -> String {
    let mut legal = title.to_string();
    if legal.len() > MAX_TITLE_BYTES {
        let mut cut = MAX_TITLE_BYTES;
        while !legal.is_char_boundary(cut) {
            cut -= 1;
        }
        legal.truncate(cut);
    }
    if legal == "." || legal == ".." {
        legal.push(' ');
    }
    legal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookmarkModel, InMemoryModel};
    use crate::sync::{NodeSyncState, SyncCatalog, SyncTree};

    fn setup() -> (InMemoryModel, SyncTree, NodeId, SyncId) {
        let model = InMemoryModel::new();
        let bar = model.add_folder(NodeId::ROOT, "Bookmarks bar");
        let other = model.add_folder(NodeId::ROOT, "Other bookmarks");
        model.mark_special(SpecialFolder::BookmarksBar, bar);
        model.mark_special(SpecialFolder::Other, other);

        let sync = SyncTree::new();
        let sync_bar = sync.add_permanent(BOOKMARK_BAR_TAG);
        sync.add_permanent(OTHER_BOOKMARKS_TAG);
        (model, sync, bar, sync_bar)
    }

    fn associate(model: &InMemoryModel, sync: &SyncTree) -> Result<MergeStats> {
        ModelAssociator::new(model, sync).associate_models()
    }

    // ==================== Permanent folders ====================

    #[test]
    fn test_missing_required_root_aborts() {
        let (model, _, _, _) = setup();
        let sync = SyncTree::new();
        sync.add_permanent(BOOKMARK_BAR_TAG);

        let err = associate(&model, &sync).unwrap_err();
        assert!(matches!(
            err,
            AssociationError::PermanentNodeMissing(OTHER_BOOKMARKS_TAG)
        ));
    }

    #[test]
    fn test_missing_mobile_root_is_tolerated() {
        let (model, sync, _, _) = setup();
        assert!(associate(&model, &sync).is_ok());
        assert_eq!(
            sync.sync_id_for_node(model.special_folder(SpecialFolder::BookmarksBar).unwrap()),
            sync.root_for_tag(BOOKMARK_BAR_TAG)
        );
    }

    // ==================== Matching ====================

    #[test]
    fn test_identical_trees_need_no_edits() {
        let (model, sync, bar, sync_bar) = setup();
        let a = model.add_url(bar, "a", "http://a");
        let f = model.add_folder(bar, "f");
        let sa = sync.add_url(sync_bar, "a", "http://a");
        let sf = sync.add_folder(sync_bar, "f");

        let stats = associate(&model, &sync).unwrap();

        assert_eq!(stats, MergeStats::default());
        assert_eq!(sync.sync_id_for_node(a), Some(sa));
        assert_eq!(sync.sync_id_for_node(f), Some(sf));
        assert_eq!(model.children(bar), vec![a, f]);
    }

    #[test]
    fn test_sync_children_dictate_positions() {
        let (model, sync, bar, sync_bar) = setup();
        let a = model.add_url(bar, "a", "http://a");
        let b = model.add_url(bar, "b", "http://b");
        sync.add_url(sync_bar, "b", "http://b");
        sync.add_url(sync_bar, "a", "http://a");

        let stats = associate(&model, &sync).unwrap();

        assert_eq!(model.children(bar), vec![b, a]);
        assert_eq!(stats.local_added, 0);
        assert_eq!(stats.sync_created, 0);
    }

    #[test]
    fn test_sync_only_children_are_created_in_position() {
        let (model, sync, bar, sync_bar) = setup();
        let b = model.add_url(bar, "b", "http://b");
        sync.add_url(sync_bar, "new", "http://new");
        sync.add_url(sync_bar, "b", "http://b");

        let stats = associate(&model, &sync).unwrap();

        let children = model.children(bar);
        assert_eq!(children.len(), 2);
        assert_eq!(children[1], b);
        let created = model.node(children[0]).unwrap();
        assert_eq!(created.title, "new");
        assert_eq!(created.url.as_deref(), Some("http://new"));
        assert_eq!(stats.local_added, 1);
    }

    #[test]
    fn test_local_only_children_are_pushed_to_sync() {
        let (model, sync, bar, sync_bar) = setup();
        let a = model.add_url(bar, "a", "http://a");
        let f = model.add_folder(bar, "f");
        let inner = model.add_url(f, "inner", "http://i");

        let stats = associate(&model, &sync).unwrap();

        assert_eq!(stats.sync_created, 3);
        let sa = sync.sync_id_for_node(a).unwrap();
        let sf = sync.sync_id_for_node(f).unwrap();
        let si = sync.sync_id_for_node(inner).unwrap();
        assert_eq!(sync.children(sync_bar), vec![sa, sf]);
        assert_eq!(sync.children(sf), vec![si]);
        // Pushed nodes await their first commit.
        assert_eq!(sync.node_sync_state(sa), NodeSyncState::Unsynced);
        // Local tree untouched.
        assert_eq!(model.children(bar), vec![a, f]);
    }

    #[test]
    fn test_invalid_sync_url_skipped_without_consuming_position() {
        let (model, sync, bar, sync_bar) = setup();
        sync.add_url(sync_bar, "broken", "  ");
        sync.add_url(sync_bar, "good", "http://g");

        let stats = associate(&model, &sync).unwrap();

        let children = model.children(bar);
        assert_eq!(children.len(), 1);
        assert_eq!(model.node(children[0]).unwrap().title, "good");
        assert_eq!(stats.local_added, 1);
    }

    #[test]
    fn test_recorded_association_breaks_ties_between_duplicates() {
        let (model, sync, bar, sync_bar) = setup();
        let d1 = model.add_url(bar, "dup", "http://d");
        let d2 = model.add_url(bar, "dup", "http://d");
        let s = sync.add_url(sync_bar, "dup", "http://d");
        sync.associate(s, d2);

        let stats = associate(&model, &sync).unwrap();

        assert_eq!(sync.sync_id_for_node(d2), Some(s));
        assert_eq!(stats.duplicates_seen, 1);
        // The unclaimed twin went out to sync.
        assert!(sync.sync_id_for_node(d1).is_some());
        assert_eq!(stats.sync_created, 1);
    }

    #[test]
    fn test_first_candidate_wins_without_a_recorded_association() {
        let (model, sync, bar, sync_bar) = setup();
        let d1 = model.add_url(bar, "dup", "http://d");
        let _d2 = model.add_url(bar, "dup", "http://d");
        let s = sync.add_url(sync_bar, "dup", "http://d");

        associate(&model, &sync).unwrap();
        assert_eq!(sync.sync_id_for_node(d1), Some(s));
    }

    #[test]
    fn test_guid_distinguishes_otherwise_equal_folders() {
        let (model, sync, bar, sync_bar) = setup();
        let f1 = model.add_folder(bar, "device");
        let f2 = model.add_folder(bar, "device");
        model.set_meta(f1, keys::SPEED_DIAL_GUID_KEY, "guid-1");
        model.set_meta(f2, keys::SPEED_DIAL_GUID_KEY, "guid-2");
        let s = sync.add_folder(sync_bar, "device");
        sync.set_guid(s, "guid-2");

        associate(&model, &sync).unwrap();
        assert_eq!(sync.sync_id_for_node(f2), Some(s));
    }

    // ==================== Title legalization ====================

    #[test]
    fn test_legal_title_truncates_on_char_boundary() {
        let title = "é".repeat(130);
        let legal = legal_title(&title);
        assert_eq!(legal.len(), 254);
        assert!(legal.chars().all(|c| c == 'é'));

        assert_eq!(legal_title("."), ". ");
        assert_eq!(legal_title(".."), ".. ");
        assert_eq!(legal_title("plain"), "plain");
    }

    #[test]
    fn test_overlong_sync_title_matches_truncated_local() {
        let (model, sync, bar, sync_bar) = setup();
        let stored = "x".repeat(MAX_TITLE_BYTES);
        let full = "x".repeat(300);
        let a = model.add_url(bar, &stored, "http://a");
        let s = sync.add_url(sync_bar, &full, "http://a");

        let stats = associate(&model, &sync).unwrap();

        assert_eq!(sync.sync_id_for_node(a), Some(s));
        assert_eq!(stats.local_added, 0);
        assert_eq!(stats.local_updated, 0);
    }

    #[test]
    fn test_update_normalizes_local_title() {
        let (model, sync, bar, sync_bar) = setup();
        let a = model.add_url(bar, ".", "http://a");
        sync.add_url(sync_bar, ".", "http://a");

        let stats = associate(&model, &sync).unwrap();

        assert_eq!(model.node(a).unwrap().title, ". ");
        assert_eq!(stats.local_updated, 1);
    }

    // ==================== Delete journal ====================

    #[test]
    fn test_journal_removes_fully_marked_subtree() {
        let (model, sync, bar, _) = setup();
        let f = model.add_folder(bar, "old");
        model.add_url(f, "gone", "http://g");
        let keep = model.add_url(bar, "keep", "http://k");
        sync.push_journal(JournalEntry {
            title: "old".to_string(),
            url: None,
            is_folder: true,
        });
        sync.push_journal(JournalEntry {
            title: "gone".to_string(),
            url: Some("http://g".to_string()),
            is_folder: false,
        });

        let stats = associate(&model, &sync).unwrap();

        assert!(model.node(f).is_none());
        assert!(model.node(keep).is_some());
        assert_eq!(stats.local_removed, 2);
    }

    #[test]
    fn test_journal_keeps_folders_with_surviving_children() {
        let (model, sync, bar, _) = setup();
        let f = model.add_folder(bar, "mixed");
        let doomed = model.add_url(f, "gone", "http://g");
        let survivor = model.add_url(f, "stay", "http://s");
        sync.push_journal(JournalEntry {
            title: "mixed".to_string(),
            url: None,
            is_folder: true,
        });
        sync.push_journal(JournalEntry {
            title: "gone".to_string(),
            url: Some("http://g".to_string()),
            is_folder: false,
        });

        let stats = associate(&model, &sync).unwrap();

        assert!(model.node(f).is_some());
        assert!(model.node(doomed).is_none());
        assert!(model.node(survivor).is_some());
        assert_eq!(stats.local_removed, 1);
    }

    // ==================== Structural errors ====================

    #[test]
    fn test_refused_creation_aborts_the_pass() {
        let (model, sync, bar, _) = setup();
        model.add_url(bar, "local only", "http://l");
        sync.refuse_next_creates(1);

        let err = associate(&model, &sync).unwrap_err();
        assert!(matches!(err, AssociationError::Sync(SyncError::CreateRefused)));
    }
}
