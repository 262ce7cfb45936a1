//! dedup-cli library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the CLI components, allowing
//! integration tests to drive the tree format, prefs storage, and scan
//! driver without spawning the binary.

pub mod persistence;
pub mod scan;
pub mod tree_io;

// Re-export key types for convenience
pub use persistence::FilePrefs;
pub use scan::{ScanOutcome, run_scan};
pub use tree_io::{TreeFile, TreeNode, TreeRoot};
