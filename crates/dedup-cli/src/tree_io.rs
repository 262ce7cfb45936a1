//! Bookmark tree file format.
//!
//! Reads and writes the JSON tree the CLI operates on: a list of root
//! folders, each optionally designated as one of the host's special folders,
//! with nested children. Url nodes carry a `url` field; folders carry
//! `children`. Speed-dial device folders keep their GUID in
//! `speedDialGuid`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use dedup_core::keys::SPEED_DIAL_GUID_KEY;
use dedup_core::model::{BookmarkModel, InMemoryModel, NodeId, SpecialFolder};

/// One node in the file. A node with a `url` is a bookmark; without one it
/// is a folder and `children` applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_dial_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// A top-level folder, optionally designated special.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeRoot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special: Option<SpecialFolder>,
    #[serde(flatten)]
    pub node: TreeNode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeFile {
    pub roots: Vec<TreeRoot>,
}

/// Read a tree file and build the in-memory model from it.
pub fn load_model(path: &Path) -> Result<InMemoryModel> {
    build_model(&read_tree(path)?)
}

pub fn read_tree(path: &Path) -> Result<TreeFile> {
    parse_tree(&fs::read_to_string(path)?)
}

pub fn parse_tree(contents: &str) -> Result<TreeFile> {
    Ok(serde_json::from_str(contents)?)
}

pub fn render_tree(tree: &TreeFile) -> Result<String> {
    Ok(serde_json::to_string_pretty(tree)?)
}

pub fn build_model(tree: &TreeFile) -> Result<InMemoryModel> {
    let model = InMemoryModel::new();
    for root in &tree.roots {
        if root.node.url.is_some() {
            bail!("top-level entry '{}' must be a folder", root.node.title);
        }
        let title = match (&root.node.title, root.special) {
            (t, _) if !t.is_empty() => t.clone(),
            (_, Some(kind)) => default_title(kind).to_string(),
            (_, None) => bail!("top-level folder without a title"),
        };
        let id = model.add_folder(NodeId::ROOT, &title);
        if let Some(kind) = root.special {
            model.mark_special(kind, id);
        }
        build_children(&model, id, &root.node.children)?;
    }
    Ok(model)
}

fn build_children(model: &InMemoryModel, parent: NodeId, children: &[TreeNode]) -> Result<()> {
    for child in children {
        let id = match &child.url {
            Some(url) => {
                if !child.children.is_empty() {
                    bail!("url node '{}' cannot have children", child.title);
                }
                model.add_url(parent, &child.title, url)
            }
            None => model.add_folder(parent, &child.title),
        };
        if let Some(guid) = &child.speed_dial_guid {
            model.set_meta(id, SPEED_DIAL_GUID_KEY, guid);
        }
        build_children(model, id, &child.children)?;
    }
    Ok(())
}

/// Capture the model's current tree in file form.
pub fn snapshot(model: &impl BookmarkModel) -> TreeFile {
    let specials: HashMap<NodeId, SpecialFolder> = [
        SpecialFolder::BookmarksBar,
        SpecialFolder::Other,
        SpecialFolder::Mobile,
        SpecialFolder::Trash,
        SpecialFolder::SpeedDial,
    ]
    .into_iter()
    .filter_map(|kind| model.special_folder(kind).map(|id| (id, kind)))
    .collect();

    let roots = model
        .children(model.root())
        .into_iter()
        .filter_map(|id| {
            let node = snapshot_node(model, id)?;
            Some(TreeRoot {
                special: specials.get(&id).copied(),
                node,
            })
        })
        .collect();
    TreeFile { roots }
}

fn snapshot_node(model: &impl BookmarkModel, id: NodeId) -> Option<TreeNode> {
    let info = model.node(id)?;
    Some(TreeNode {
        title: info.title,
        url: info.url,
        speed_dial_guid: model.meta(id, SPEED_DIAL_GUID_KEY),
        children: model
            .children(id)
            .into_iter()
            .filter_map(|child| snapshot_node(model, child))
            .collect(),
    })
}

pub fn write_tree(path: &Path, tree: &TreeFile) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render_tree(tree)?)?;
    Ok(())
}

pub fn save_model(path: &Path, model: &impl BookmarkModel) -> Result<()> {
    write_tree(path, &snapshot(model))
}

fn default_title(kind: SpecialFolder) -> &'static str {
    match kind {
        SpecialFolder::BookmarksBar => "Bookmarks bar",
        SpecialFolder::Other => "Other bookmarks",
        SpecialFolder::Mobile => "Mobile bookmarks",
        SpecialFolder::Trash => "Trash",
        SpecialFolder::SpeedDial => "Speed Dial",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TreeFile {
        serde_json::from_str(
            r#"{
                "roots": [
                    {
                        "special": "bookmarksBar",
                        "children": [
                            {"title": "a", "url": "http://a"},
                            {"title": "f", "children": [
                                {"title": "inner", "url": "http://i"}
                            ]}
                        ]
                    },
                    {"special": "trash", "title": "Trash"},
                    {
                        "special": "speedDial",
                        "title": "Speed Dial",
                        "children": [
                            {"title": "Phone", "speedDialGuid": "guid-1", "children": []}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_model_marks_specials_and_meta() {
        let model = build_model(&sample()).unwrap();

        let bar = model.special_folder(SpecialFolder::BookmarksBar).unwrap();
        assert_eq!(model.node(bar).unwrap().title, "Bookmarks bar");
        assert_eq!(model.child_count(bar), 2);
        assert!(model.special_folder(SpecialFolder::Trash).is_some());

        let sd = model.special_folder(SpecialFolder::SpeedDial).unwrap();
        let phone = model.children(sd)[0];
        assert_eq!(model.meta(phone, SPEED_DIAL_GUID_KEY).as_deref(), Some("guid-1"));
    }

    #[test]
    fn test_url_node_with_children_is_rejected() {
        let tree: TreeFile = serde_json::from_str(
            r#"{"roots": [{"title": "r", "children": [
                {"title": "bad", "url": "http://b", "children": [{"title": "x"}]}
            ]}]}"#,
        )
        .unwrap();
        assert!(build_model(&tree).is_err());
    }

    #[test]
    fn test_top_level_url_is_rejected() {
        let tree: TreeFile = serde_json::from_str(
            r#"{"roots": [{"title": "bad", "url": "http://b"}]}"#,
        )
        .unwrap();
        assert!(build_model(&tree).is_err());
    }

    #[test]
    fn test_snapshot_round_trips() {
        let tree = sample();
        let model = build_model(&tree).unwrap();
        let out = snapshot(&model);

        assert_eq!(out.roots.len(), 3);
        assert_eq!(out.roots[0].special, Some(SpecialFolder::BookmarksBar));
        assert_eq!(out.roots[0].node.children.len(), 2);
        assert_eq!(out.roots[0].node.children[0].url.as_deref(), Some("http://a"));
        assert_eq!(out.roots[2].node.children[0].speed_dial_guid.as_deref(), Some("guid-1"));

        // A rebuilt model snapshots identically.
        let again = snapshot(&build_model(&out).unwrap());
        assert_eq!(out, again);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks.json");

        let model = build_model(&sample()).unwrap();
        save_model(&path, &model).unwrap();

        let reloaded = load_model(&path).unwrap();
        assert_eq!(snapshot(&reloaded), snapshot(&model));
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(read_tree(Path::new("/nonexistent/bookmarks.json")).is_err());
    }
}
