//! Terminal progress for the `scan` subcommand.
//!
//! [`Progress`] renders the reconciler's [`ProgressCallback`] events with
//! indicatif. With `--no-color` it switches to plain ASCII bars and a slower,
//! glyph-free spinner.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Progress callback for full-scan phases.
///
/// Implement this trait to receive progress updates while the reconciler
/// discovers candidates, validates existing entries and indexes new files.
pub trait ProgressCallback: Send + Sync {
    /// Called when a phase starts.
    ///
    /// # Arguments
    ///
    /// * `phase` - Name of the phase (`"discover"`, `"validate"`, `"index"`)
    /// * `total` - Total number of items to process (0 when unknown)
    fn on_phase_start(&self, phase: &str, total: usize);

    /// Called for each item processed.
    ///
    /// # Arguments
    ///
    /// * `current` - Items processed so far across the whole scan
    /// * `path` - Path being processed
    fn on_progress(&self, current: usize, path: &str);

    /// Called when an item has been processed, providing its size.
    fn on_item_completed(&self, _bytes: u64) {}

    /// Called when a phase completes.
    fn on_phase_end(&self, phase: &str);

    /// Called to update the progress message.
    fn on_message(&self, _message: &str) {}
}

/// Progress reporter using indicatif.
///
/// Shows a spinner while candidates are discovered, then one bar each for
/// validation and indexing.
pub struct Progress {
    multi: MultiProgress,
    discover: Mutex<Option<ProgressBar>>,
    validate: Mutex<Option<ProgressBar>>,
    index: Mutex<Option<ProgressBar>>,
    quiet: bool,
    plain: bool,
}

impl Progress {
    /// Create a new progress reporter.
    ///
    /// # Examples
    ///
    /// ```
    /// use modcache::progress::Progress;
    ///
    /// let progress = Progress::new(false);
    /// ```
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        Self::with_plain(quiet, false)
    }

    /// Progress reporter that draws uncolored ASCII bars when `plain` is set.
    #[must_use]
    pub fn with_plain(quiet: bool, plain: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            discover: Mutex::new(None),
            validate: Mutex::new(None),
            index: Mutex::new(None),
            quiet,
            plain,
        }
    }

    /// Whether bars are drawn without color or glyphs.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.plain
    }

    fn spinner_style(&self) -> ProgressStyle {
        if self.plain {
            ProgressStyle::with_template("{msg} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
        } else {
            ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
        }
    }

    fn bar_style(&self, color: &str) -> ProgressStyle {
        if self.plain {
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40}] {pos}/{len} ({percent}%) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
        } else {
            ProgressStyle::with_template(&format!(
                "[{{elapsed_precise}}] [{{bar:40.{color}/blue}}] {{pos}}/{{len}} ({{percent}}%) {{msg}} (ETA: {{eta}})"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█>-")
        }
    }

    fn slot(&self, phase: &str) -> Option<&Mutex<Option<ProgressBar>>> {
        match phase {
            "discover" => Some(&self.discover),
            "validate" => Some(&self.validate),
            "index" => Some(&self.index),
            _ => None,
        }
    }

    fn active(&self) -> Option<ProgressBar> {
        [&self.index, &self.validate, &self.discover]
            .into_iter()
            .find_map(|slot| lock(slot).clone())
    }
}

impl ProgressCallback for Progress {
    fn on_phase_start(&self, phase: &str, total: usize) {
        if self.quiet {
            return;
        }
        let Some(slot) = self.slot(phase) else {
            return;
        };

        let pb = if phase == "discover" {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(self.spinner_style());
            pb.set_message("Discovering files");
            let tick_rate = if self.plain { 500 } else { 100 };
            pb.enable_steady_tick(Duration::from_millis(tick_rate));
            pb
        } else {
            let pb = self.multi.add(ProgressBar::new(total as u64));
            let color = if phase == "validate" { "cyan" } else { "green" };
            pb.set_style(self.bar_style(color));
            pb.set_message(if phase == "validate" {
                "Validating"
            } else {
                "Indexing"
            });
            pb
        };
        *lock(slot) = Some(pb);
    }

    fn on_progress(&self, _current: usize, path: &str) {
        if self.quiet {
            return;
        }
        if let Some(pb) = self.active() {
            pb.inc(1);
            pb.set_message(truncate_path(path, 30));
        }
    }

    fn on_phase_end(&self, phase: &str) {
        if self.quiet {
            return;
        }
        let Some(slot) = self.slot(phase) else {
            return;
        };
        if let Some(pb) = lock(slot).take() {
            pb.finish_with_message(match phase {
                "discover" => "Discovery complete",
                "validate" => "Validation complete",
                _ => "Indexing complete",
            });
        }
    }

    fn on_message(&self, message: &str) {
        if self.quiet {
            return;
        }
        if let Some(pb) = self.active() {
            pb.set_message(message.to_string());
        }
    }
}

fn lock(slot: &Mutex<Option<ProgressBar>>) -> MutexGuard<'_, Option<ProgressBar>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Truncate a path for display in the progress bar.
fn truncate_path(path: &str, max_len: usize) -> String {
    if path.chars().count() <= max_len {
        return path.to_string();
    }

    let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let count = file_name.chars().count();
    if count >= max_len {
        let tail: String = file_name.chars().skip(count - max_len + 3).collect();
        return format!("...{tail}");
    }

    format!(".../{file_name}")
}
