//! dedup: scan a bookmark tree file for duplicates and reconcile them.
//!
//! Loads a JSON bookmark tree, runs the duplicate tracker over it in local
//! mode, and writes the cleaned tree back. Scan suppression state lives in a
//! prefs file next to the tree so an unchanged tree is not rescanned on
//! every invocation.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Use library exports
use dedup_cli::persistence::FilePrefs;
use dedup_cli::scan::run_scan;
use dedup_cli::tree_io;

use dedup_core::model::BookmarkModel;
use dedup_core::prefs::TrackerPrefs;
use dedup_core::tracker::{RemovalPolicy, TrackerConfig};

#[derive(Parser, Debug)]
#[command(name = "dedup")]
#[command(about = "Bookmark tree duplicate scanner and reconciler")]
struct Args {
    /// Path to the bookmark tree file (JSON)
    tree: PathBuf,

    /// Write the cleaned tree here instead of back to the input file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Prefs file location (defaults to <tree>.prefs.json)
    #[arg(long)]
    prefs: Option<PathBuf>,

    /// What happens to a confirmed duplicate
    #[arg(long, value_enum, default_value_t = PolicyArg::Trash)]
    policy: PolicyArg,

    /// Delay before a scheduled scan starts, in milliseconds
    #[arg(long, default_value_t = 5_000)]
    scan_delay_ms: u64,

    /// How long a clean tree suppresses rescans, in seconds
    #[arg(long, default_value_t = 86_400)]
    backoff_seconds: u64,

    /// GUID identifying this device's speed-dial folder
    #[arg(long)]
    device_guid: Option<String>,

    /// Scan even if the tree was clean last run
    #[arg(long)]
    force: bool,

    /// Print the tracker's internal state table after the run
    #[arg(long)]
    stats: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    /// Remove duplicates outright
    Purge,
    /// Move duplicates to the trash folder when the tree has one
    Trash,
}

impl From<PolicyArg> for RemovalPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Purge => RemovalPolicy::Purge,
            PolicyArg::Trash => RemovalPolicy::Trash,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,dedup_core=debug"
    } else {
        "info,dedup_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting dedup");
    info!("Tree file: {:?}", args.tree);

    let contents = fs::read_to_string(&args.tree)?;
    let model = Arc::new(tree_io::build_model(&tree_io::parse_tree(&contents)?)?);
    // Builder notifications are not user edits.
    model.take_events();

    let prefs_path = args
        .prefs
        .clone()
        .unwrap_or_else(|| args.tree.with_extension("prefs.json"));
    let prefs = Arc::new(FilePrefs::new(prefs_path));
    if args.force {
        info!("Forcing a scan");
        prefs.set_model_changed(true);
        prefs.set_last_clean_run_ms(None);
    } else {
        prefs.check_tree_digest(&contents);
    }

    let config = TrackerConfig {
        local_device_guid: args.device_guid.clone(),
        removal_policy: args.policy.into(),
        scan_delay_ms: args.scan_delay_ms,
        backoff_period_ms: args.backoff_seconds.saturating_mul(1_000),
        ..TrackerConfig::default()
    };

    let outcome = run_scan(
        Arc::clone(&model),
        Arc::clone(&prefs) as Arc<dyn TrackerPrefs>,
        config,
        wall_ms(),
    );

    if outcome.skipped_clean {
        info!(
            suppressed_until = outcome.backoff_until,
            "Tree was clean recently; pass --force to rescan now"
        );
        return Ok(());
    }

    if args.stats {
        println!("Internal state:");
        for (name, value) in &outcome.internals {
            println!("  {name:<28} {value}");
        }
    }

    info!(
        repaired = outcome.repaired,
        removed = outcome.removed,
        remaining = outcome.remaining,
        "scan summary"
    );
    if outcome.remaining > 0 {
        warn!(
            "{} flaw(s) left in place (ignored subtrees keep theirs)",
            outcome.remaining
        );
    }

    let out = args.output.as_ref().unwrap_or(&args.tree);
    let cleaned = tree_io::render_tree(&tree_io::snapshot(model.as_ref()))?;
    fs::write(out, &cleaned)?;
    if out == &args.tree {
        prefs.record_tree_digest(&cleaned);
    }
    info!("Wrote cleaned tree to {:?}", out);
    Ok(())
}

fn wall_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
