//! Machine-readable command output.
//!
//! Every `--output json` result is wrapped in the same envelope:
//!
//! ```json
//! {
//!   "command": "scan",
//!   "generated_at": "2026-01-01T12:00:00Z",
//!   "exit_code": 0,
//!   "exit_code_name": "MC000",
//!   "result": { "candidates": 120, "created": 4, ... }
//! }
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ExitCode;
use crate::governor::EvictionReport;
use crate::index::IndexStats;
use crate::scanner::ScanSummary;

/// Envelope for one command result.
#[derive(Debug, Serialize)]
pub struct JsonReport<T: Serialize> {
    /// Subcommand name.
    pub command: &'static str,
    /// When the result was produced.
    pub generated_at: DateTime<Utc>,
    /// Process exit code.
    pub exit_code: i32,
    /// Machine-readable exit code name (e.g. "MC000").
    pub exit_code_name: &'static str,
    /// Command-specific payload.
    pub result: T,
}

impl<T: Serialize> JsonReport<T> {
    #[must_use]
    pub fn new(command: &'static str, exit_code: ExitCode, result: T) -> Self {
        Self {
            command,
            generated_at: Utc::now(),
            exit_code: exit_code.as_i32(),
            exit_code_name: exit_code.code_prefix(),
            result,
        }
    }

    /// Serialize as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Index size after a command.
#[derive(Debug, Clone, Serialize)]
pub struct JsonIndexStats {
    pub entries: usize,
    pub mod_root_entries: usize,
    pub cache_root_entries: usize,
    pub total_size: u64,
}

impl From<&IndexStats> for JsonIndexStats {
    fn from(stats: &IndexStats) -> Self {
        Self {
            entries: stats.entries,
            mod_root_entries: stats.mod_root_entries,
            cache_root_entries: stats.cache_root_entries,
            total_size: stats.total_size,
        }
    }
}

/// Result of `scan`.
#[derive(Debug, Clone, Serialize)]
pub struct ScanOutput {
    pub candidates: usize,
    pub validated: usize,
    pub updated: usize,
    pub removed: usize,
    pub created: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub index: JsonIndexStats,
    /// Present when the quota was enforced after the scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction: Option<GovernOutput>,
}

impl ScanOutput {
    #[must_use]
    pub fn new(summary: &ScanSummary, stats: &IndexStats, eviction: Option<GovernOutput>) -> Self {
        Self {
            candidates: summary.candidates,
            validated: summary.validated,
            updated: summary.updated,
            removed: summary.removed,
            created: summary.created,
            failed: summary.failed,
            duration_ms: u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
            index: stats.into(),
            eviction,
        }
    }
}

/// Result of `lookup`.
#[derive(Debug, Clone, Serialize)]
pub struct LookupOutput {
    pub hash: String,
    /// Resolved path, or `null` when the hash is not held locally.
    pub path: Option<String>,
    pub size: Option<u64>,
}

/// Result of `govern`.
#[derive(Debug, Clone, Serialize)]
pub struct GovernOutput {
    pub quota: u64,
    pub target: u64,
    pub usage_before: u64,
    pub usage_after: u64,
    pub freed: u64,
    pub evicted: Vec<String>,
}

impl GovernOutput {
    #[must_use]
    pub fn new(quota: u64, target: u64, report: &EvictionReport) -> Self {
        Self {
            quota,
            target,
            usage_before: report.usage_before,
            usage_after: report.usage_after,
            freed: report.freed(),
            evicted: report.evicted.iter().map(|p| display_path(p)).collect(),
        }
    }
}

/// Result of `verify-index`.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutput {
    pub index_path: String,
    pub malformed_lines: usize,
    pub index: JsonIndexStats,
    /// Entries dropped by `--deep` because their file is gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
    /// Entries rehashed by `--deep` because their file changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<usize>,
}

/// Absolute path as a string where possible.
#[must_use]
pub fn display_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .display()
        .to_string()
}
