//! End-to-end tests for dedup-cli.
//!
//! Tests the full pipeline: reading a tree file, running the tracker over
//! it, writing the cleaned tree back, and the prefs-backed scan suppression
//! across runs.

use std::sync::Arc;

use tempfile::TempDir;

use dedup_cli::persistence::FilePrefs;
use dedup_cli::scan::run_scan;
use dedup_cli::tree_io;

use dedup_core::model::{BookmarkModel, SpecialFolder};
use dedup_core::prefs::TrackerPrefs;
use dedup_core::tracker::{RemovalPolicy, TrackerConfig, TrackerState};

const TREE_WITH_DUPLICATES: &str = r#"{
    "roots": [
        {
            "special": "bookmarksBar",
            "children": [
                {"title": "news", "url": "http://news.example"},
                {"title": "news", "url": "http://news.example"},
                {"title": "docs", "children": [
                    {"title": "guide", "url": "http://docs.example/guide"}
                ]},
                {"title": "docs", "children": [
                    {"title": "guide", "url": "http://docs.example/guide"},
                    {"title": "api", "url": "http://docs.example/api"}
                ]}
            ]
        },
        {"special": "trash", "title": "Trash"}
    ]
}"#;

struct Fixture {
    _dir: TempDir,
    tree_path: std::path::PathBuf,
    prefs_path: std::path::PathBuf,
}

impl Fixture {
    fn new(contents: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let tree_path = dir.path().join("bookmarks.json");
        let prefs_path = dir.path().join("bookmarks.prefs.json");
        std::fs::write(&tree_path, contents).unwrap();
        Self {
            _dir: dir,
            tree_path,
            prefs_path,
        }
    }

    /// Load, scan, save: the same sequence the binary runs.
    fn run(&self, policy: RemovalPolicy, start_ms: u64) -> dedup_cli::ScanOutcome {
        let contents = std::fs::read_to_string(&self.tree_path).unwrap();
        let model = Arc::new(tree_io::build_model(&tree_io::parse_tree(&contents).unwrap()).unwrap());
        model.take_events();

        let prefs = Arc::new(FilePrefs::new(self.prefs_path.clone()));
        prefs.check_tree_digest(&contents);

        let config = TrackerConfig {
            removal_policy: policy,
            ..TrackerConfig::default()
        };
        let outcome = run_scan(
            Arc::clone(&model),
            Arc::clone(&prefs) as Arc<dyn TrackerPrefs>,
            config,
            start_ms,
        );
        if !outcome.skipped_clean {
            let cleaned = tree_io::render_tree(&tree_io::snapshot(model.as_ref())).unwrap();
            std::fs::write(&self.tree_path, &cleaned).unwrap();
            prefs.record_tree_digest(&cleaned);
        }
        outcome
    }
}

#[test]
fn test_purge_run_cleans_the_file() {
    let fixture = Fixture::new(TREE_WITH_DUPLICATES);
    let outcome = fixture.run(RemovalPolicy::Purge, 1_000);

    assert_eq!(outcome.state, TrackerState::IndexingComplete);
    assert_eq!(outcome.remaining, 0);
    // One url pair and one folder pair.
    assert_eq!(outcome.repaired, 2);

    let cleaned = tree_io::load_model(&fixture.tree_path).unwrap();
    let bar = cleaned.special_folder(SpecialFolder::BookmarksBar).unwrap();
    let children = cleaned.children(bar);
    assert_eq!(children.len(), 2);

    // The surviving docs folder absorbed the unique child.
    let docs = children
        .into_iter()
        .find(|&id| cleaned.node(id).unwrap().is_folder)
        .unwrap();
    let titles: Vec<String> = cleaned
        .children(docs)
        .into_iter()
        .map(|id| cleaned.node(id).unwrap().title)
        .collect();
    assert!(titles.contains(&"guide".to_string()));
    assert!(titles.contains(&"api".to_string()));
    assert_eq!(titles.len(), 2);
}

#[test]
fn test_trash_run_preserves_duplicates() {
    let fixture = Fixture::new(TREE_WITH_DUPLICATES);
    fixture.run(RemovalPolicy::Trash, 1_000);

    let cleaned = tree_io::load_model(&fixture.tree_path).unwrap();
    let trash = cleaned.special_folder(SpecialFolder::Trash).unwrap();
    assert!(cleaned.child_count(trash) > 0);
}

#[test]
fn test_second_run_skips_a_clean_tree() {
    let fixture = Fixture::new(TREE_WITH_DUPLICATES);
    let first = fixture.run(RemovalPolicy::Purge, 1_000);
    assert!(!first.skipped_clean);

    let second = fixture.run(RemovalPolicy::Purge, first.finished_at + 10);
    assert!(second.skipped_clean);
    assert_eq!(second.removed, 0);
}

#[test]
fn test_external_edit_is_cleaned_after_the_backoff_lapses() {
    let fixture = Fixture::new(TREE_WITH_DUPLICATES);
    let first = fixture.run(RemovalPolicy::Purge, 1_000);
    assert!(!first.skipped_clean);

    // Someone edits the file behind our back and reintroduces a pair.
    std::fs::write(
        &fixture.tree_path,
        r#"{"roots": [{"special": "bookmarksBar", "children": [
            {"title": "again", "url": "http://again.example"},
            {"title": "again", "url": "http://again.example"}
        ]}]}"#,
    )
    .unwrap();

    // Within the backoff window the edit is noticed but the scan still waits.
    let second = fixture.run(RemovalPolicy::Purge, first.finished_at + 10);
    assert!(second.skipped_clean);

    // Once it lapses the persisted change flag lets the scan through.
    let third = fixture.run(RemovalPolicy::Purge, first.finished_at + 90_000_000);
    assert!(!third.skipped_clean);
    assert_eq!(third.removed, 1);

    let cleaned = tree_io::load_model(&fixture.tree_path).unwrap();
    let bar = cleaned.special_folder(SpecialFolder::BookmarksBar).unwrap();
    assert_eq!(cleaned.child_count(bar), 1);
}

#[test]
fn test_clean_tree_scans_once_then_backs_off() {
    let fixture = Fixture::new(
        r#"{"roots": [{"special": "bookmarksBar", "children": [
            {"title": "only", "url": "http://only.example"}
        ]}]}"#,
    );
    let outcome = fixture.run(RemovalPolicy::Purge, 1_000);
    assert!(!outcome.skipped_clean);
    assert_eq!(outcome.removed, 0);
    assert!(outcome.backoff_until.is_some());

    let prefs = FilePrefs::new(fixture.prefs_path.clone());
    assert!(!prefs.model_changed());
    assert!(prefs.last_clean_run_ms().is_some());
}
