//! Command-line interface definitions for modcache.
//!
//! Global options (verbosity, color, config file) come first, followed by a
//! subcommand. Root and index paths given on the command line override the
//! config file and `MODCACHE_*` environment variables.
//!
//! # Example
//!
//! ```bash
//! # One full reconciliation with progress bars
//! modcache scan --mod-root ~/mods --cache-root ~/cache
//!
//! # Keep the index current until Ctrl+C
//! modcache -v watch --quota 20GiB
//!
//! # Where is this asset on disk?
//! modcache lookup 3f2a...e9 --output json
//!
//! # Trim the cache to its quota once
//! modcache govern --quota 10GiB
//! ```

use bytesize::ByteSize;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::Config;
use crate::scanner::is_hash_shaped;

/// Content-addressed cache for cosmetic mod assets.
///
/// Maintains an index from content hash to file location across a mod root
/// and a download cache, keeping it consistent with the filesystem.
#[derive(Debug, Parser)]
#[command(name = "modcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Report fatal errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Config file to use instead of the platform default
    #[arg(long, global = true, value_name = "PATH", env = "MODCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one full reconciliation scan of both roots
    Scan(ScanArgs),
    /// Watch both roots and keep the index current until interrupted
    Watch(WatchArgs),
    /// Print the local path holding a content hash
    Lookup(LookupArgs),
    /// Evict least-recently-accessed cache files down to the quota
    Govern(GovernArgs),
    /// Load the index file and report its health
    VerifyIndex(VerifyIndexArgs),
}

/// Root and index overrides shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct RootArgs {
    /// Mod root to index recursively
    #[arg(long, value_name = "DIR")]
    pub mod_root: Option<PathBuf>,

    /// Cache root holding downloaded assets
    #[arg(long, value_name = "DIR")]
    pub cache_root: Option<PathBuf>,

    /// Index file location
    #[arg(long, value_name = "PATH")]
    pub index: Option<PathBuf>,
}

impl RootArgs {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.mod_root {
            config.mod_root = Some(dir.clone());
        }
        if let Some(dir) = &self.cache_root {
            config.cache_root = Some(dir.clone());
        }
        if let Some(path) = &self.index {
            config.index_path = Some(path.clone());
        }
    }
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// Machine-readable JSON on stdout
    Json,
}

/// Arguments for the scan subcommand.
#[derive(Debug, Args)]
pub struct ScanArgs {
    #[command(flatten)]
    pub roots: RootArgs,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Worker threads for hashing (default: half the cores, 2 to 8)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..=64))]
    pub threads: Option<u16>,

    /// Enforce the configured quota after the scan
    #[arg(long)]
    pub govern: bool,
}

/// Arguments for the watch subcommand.
#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub roots: RootArgs,

    /// Cache quota (e.g. 500MB, 20GiB); enables eviction after each full scan
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub quota: Option<u64>,

    /// Seconds between periodic full scans (0 disables them)
    #[arg(long, value_name = "SECS")]
    pub scan_interval: Option<u64>,
}

/// Arguments for the lookup subcommand.
#[derive(Debug, Args)]
pub struct LookupArgs {
    /// Content hash (64 hex characters)
    #[arg(value_name = "HASH", value_parser = parse_hash)]
    pub hash: String,

    #[command(flatten)]
    pub roots: RootArgs,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for the govern subcommand.
#[derive(Debug, Args)]
pub struct GovernArgs {
    #[command(flatten)]
    pub roots: RootArgs,

    /// Cache quota (e.g. 500MB, 20GiB); overrides `quota_bytes`
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub quota: Option<u64>,

    /// Share of the quota to keep free after eviction (0.0 to <1.0)
    #[arg(long, value_name = "RATIO")]
    pub buffer_ratio: Option<f64>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for the verify-index subcommand.
#[derive(Debug, Args)]
pub struct VerifyIndexArgs {
    #[command(flatten)]
    pub roots: RootArgs,

    /// Also re-validate every entry against the filesystem and flush
    #[arg(long)]
    pub deep: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Parse a human-readable size such as `1024`, `1.5 MB` or `20GiB`.
///
/// Decimal suffixes (KB, MB, GB) are powers of 1000; binary suffixes (KiB,
/// MiB, GiB) are powers of 1024.
///
/// # Errors
///
/// Returns a message suitable for clap if the string is not a size.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Size cannot be empty".to_string());
    }
    s.parse::<ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|e| format!("Invalid size '{s}': {e}"))
}

/// Validate and lowercase a content hash.
///
/// # Errors
///
/// Returns a message if `s` is not 64 hex characters.
pub fn parse_hash(s: &str) -> Result<String, String> {
    let hash = s.trim().to_ascii_lowercase();
    if is_hash_shaped(&hash) {
        Ok(hash)
    } else {
        Err(format!("'{s}' is not a 64-character hex content hash"))
    }
}
