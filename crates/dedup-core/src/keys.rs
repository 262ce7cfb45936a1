//! Duplicate-detection keys.
//!
//! Two nodes are duplicates when they agree on title, url, parent and node
//! kind. The key is a single escaped string so it can double as a map key and
//! a stable sort key; escaping keeps a `&` inside a title from colliding with
//! the field separator.

use serde::{Deserialize, Serialize};

use crate::model::{BookmarkModel, NodeId, NodeInfo};

/// Metadata key carrying the partner id of a speed-dial entry.
pub const SPEED_DIAL_GUID_KEY: &str = "speed_dial_guid";

/// Identity key of one duplicate class.
///
/// Equal keys mean "these nodes are copies of each other"; the tracker files
/// every indexed node under its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlawId(String);

impl FlawId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlawId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The attributes a key is computed from, detached from the tree so removed
/// nodes can be keyed from their last snapshot.
#[derive(Debug, Clone, Copy)]
pub struct KeySource<'a> {
    pub title: &'a str,
    pub url: Option<&'a str>,
    pub is_folder: bool,
    /// Partner id, consulted only for direct speed-dial children.
    pub guid: Option<&'a str>,
}

impl<'a> KeySource<'a> {
    pub fn from_info(info: &'a NodeInfo, guid: Option<&'a str>) -> Self {
        Self {
            title: &info.title,
            url: info.url.as_deref(),
            is_folder: info.is_folder,
            guid,
        }
    }
}

/// Compute the duplicate key of a node under `parent`.
///
/// The parent is always passed explicitly; after a move the node must be
/// keyed under the parent it was indexed under, not the one it has now.
pub fn flaw_id(src: &KeySource<'_>, parent: NodeId, parent_is_speed_dial: bool) -> FlawId {
    let kind = if src.is_folder { "T" } else { "F" };
    let mut id = format!(
        "{}&{}&{}{}",
        escape_html(src.title),
        escape_html(src.url.unwrap_or("")),
        parent,
        kind
    );
    // Speed-dial children with distinct partner ids are not copies of each
    // other even when title and url agree.
    if parent_is_speed_dial && let Some(guid) = src.guid {
        id.insert_str(0, guid);
    }
    FlawId(id)
}

/// Key a live node under an explicit parent.
pub fn key_for_node(
    model: &dyn BookmarkModel,
    info: &NodeInfo,
    parent: NodeId,
    speed_dial: Option<NodeId>,
) -> FlawId {
    let parent_is_speed_dial = speed_dial == Some(parent);
    let guid = if parent_is_speed_dial {
        model.meta(info.id, SPEED_DIAL_GUID_KEY)
    } else {
        None
    };
    flaw_id(
        &KeySource::from_info(info, guid.as_deref()),
        parent,
        parent_is_speed_dial,
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
