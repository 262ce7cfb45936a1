//! Persistence for tracker preferences.
//!
//! Stores the values that survive restarts, the model-changed flag and the
//! last-clean-run timestamp, as a small JSON file next to the tree. A
//! missing or unreadable file yields defaults, so a corrupt prefs file costs
//! one extra scan rather than the run.
//!
//! A browser observes its model continuously; this tool only sees the tree
//! file at startup. The file's digest is stored alongside the prefs so an
//! edit made between runs is detected and flips the model-changed flag.

use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use dedup_core::prefs::{PrefValues, TrackerPrefs};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPrefs {
    #[serde(flatten)]
    values: PrefValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tree_digest: Option<String>,
}

pub struct FilePrefs {
    path: PathBuf,
    stored: RwLock<StoredPrefs>,
}

impl FilePrefs {
    /// Open the prefs at `path`, loading existing values when present.
    pub fn new(path: PathBuf) -> Self {
        let stored = match Self::read(&path) {
            Ok(Some(stored)) => stored,
            Ok(None) => StoredPrefs::default(),
            Err(err) => {
                warn!(path = %path.display(), %err, "unreadable prefs file, starting fresh");
                StoredPrefs::default()
            }
        };
        Self {
            path,
            stored: RwLock::new(stored),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compare the tree file contents against the recorded digest and treat
    /// a mismatch as a model change.
    pub fn check_tree_digest(&self, contents: &str) {
        let digest = digest(contents);
        let mut stored = self.stored.write().unwrap();
        if stored.tree_digest.as_deref() == Some(digest.as_str()) {
            return;
        }
        debug!("tree file differs from the recorded digest");
        stored.values.model_changed = true;
        stored.tree_digest = Some(digest);
        drop(stored);
        self.save();
    }

    /// Record the digest of freshly written tree contents without touching
    /// the model-changed flag.
    pub fn record_tree_digest(&self, contents: &str) {
        self.stored.write().unwrap().tree_digest = Some(digest(contents));
        self.save();
    }

    fn read(path: &Path) -> Result<Option<StoredPrefs>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Best effort: the setters cannot report failure, so a write error is
    /// logged and the value kept in memory.
    fn save(&self) {
        if let Err(err) = self.try_save() {
            warn!(path = %self.path.display(), %err, "failed to persist prefs");
        }
    }

    fn try_save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&*self.stored.read().unwrap())?;
        fs::write(&self.path, contents)?;
        debug!(path = %self.path.display(), "prefs saved");
        Ok(())
    }
}

impl TrackerPrefs for FilePrefs {
    fn model_changed(&self) -> bool {
        self.stored.read().unwrap().values.model_changed
    }

    fn set_model_changed(&self, changed: bool) {
        self.stored.write().unwrap().values.model_changed = changed;
        self.save();
    }

    fn last_clean_run_ms(&self) -> Option<u64> {
        self.stored.read().unwrap().values.last_clean_run_ms
    }

    fn set_last_clean_run_ms(&self, at: Option<u64>) {
        self.stored.write().unwrap().values.last_clean_run_ms = at;
        self.save();
    }
}

/// Not stable across std releases; a digest mismatch only costs a rescan.
fn digest(contents: &str) -> String {
    let mut hasher = DefaultHasher::new();
    contents.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_path_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = FilePrefs::new(dir.path().join("prefs.json"));
        assert!(prefs.model_changed());
        assert_eq!(prefs.last_clean_run_ms(), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let prefs = FilePrefs::new(path.clone());
        prefs.set_model_changed(false);
        prefs.set_last_clean_run_ms(Some(9_000));
        drop(prefs);

        let reopened = FilePrefs::new(path);
        assert!(!reopened.model_changed());
        assert_eq!(reopened.last_clean_run_ms(), Some(9_000));
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, "not json").unwrap();

        let prefs = FilePrefs::new(path);
        assert!(prefs.model_changed());
    }

    #[test]
    fn test_save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("prefs.json");

        let prefs = FilePrefs::new(path.clone());
        prefs.set_model_changed(false);

        assert!(path.exists());
        assert!(!FilePrefs::new(path).model_changed());
    }

    #[test]
    fn test_edited_tree_flips_model_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let prefs = FilePrefs::new(path.clone());
        prefs.record_tree_digest("{\"roots\": []}");
        prefs.set_model_changed(false);
        drop(prefs);

        let reopened = FilePrefs::new(path.clone());
        reopened.check_tree_digest("{\"roots\": []}");
        assert!(!reopened.model_changed());

        reopened.check_tree_digest("{\"roots\": [{}]}");
        assert!(reopened.model_changed());

        // The new digest is remembered together with the flag.
        let third = FilePrefs::new(path);
        assert!(third.model_changed());
        third.check_tree_digest("{\"roots\": [{}]}");
        assert!(third.model_changed());
    }
}
