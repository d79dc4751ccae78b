//! Logging infrastructure for modcache.
//!
//! Uses the `log` facade with an `env_logger` backend. The level is picked by
//! (in priority order):
//!
//! 1. `RUST_LOG` environment variable (if set)
//! 2. CLI flags: `--quiet` (error only) or `--verbose` (debug/trace)
//! 3. Default: info level
//!
//! Flag-derived levels apply to this crate only. Dependencies (the watcher
//! backend, figment, rayon) stay at `warn` unless `-vv` is given, so `-v`
//! shows cache activity without watcher noise.
//!
//! # Example
//!
//! ```rust,no_run
//! use modcache::logging::init_logging;
//!
//! // -v
//! init_logging(1, false, false);
//! log::debug!("Watching mod root");
//! ```

use env_logger::{Builder, WriteStyle};
use log::LevelFilter;
use std::env;
use std::io::Write;

const CRATE_TARGET: &str = "modcache";

/// Initialize logging from the CLI verbosity flags.
///
/// Call once, before any log output. `env_logger` can only be installed once
/// per process; later calls are ignored.
///
/// # Arguments
///
/// * `verbose` - Verbosity count from CLI (0=normal, 1=debug, 2+=trace)
/// * `quiet` - If true, only show errors (overridden by RUST_LOG)
/// * `no_color` - Never emit ANSI styles
pub fn init_logging(verbose: u8, quiet: bool, no_color: bool) {
    let from_env = env::var("RUST_LOG").is_ok();
    let mut builder = Builder::new();

    if from_env {
        builder.parse_default_env();
    } else {
        let (own, deps) = levels(verbose, quiet);
        builder.filter_level(deps).filter_module(CRATE_TARGET, own);
    }

    if no_color {
        builder.write_style(WriteStyle::Never);
    }
    configure_format(&mut builder, verbose);

    if builder.try_init().is_err() {
        return;
    }

    if from_env {
        log::debug!(
            "Logging initialized from RUST_LOG={:?}",
            env::var("RUST_LOG").ok()
        );
    } else {
        log::debug!("Logging initialized at level {:?}", levels(verbose, quiet).0);
    }
}

/// Levels for this crate and for everything else.
fn levels(verbose: u8, quiet: bool) -> (LevelFilter, LevelFilter) {
    if quiet {
        return (LevelFilter::Error, LevelFilter::Error);
    }
    match verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Debug),
    }
}

/// Debug builds get timestamps (and the module path with `-v`); release
/// builds print level and message only.
fn configure_format(builder: &mut Builder, verbose: u8) {
    #[cfg(debug_assertions)]
    {
        builder.format(move |buf, record| {
            let timestamp = buf.timestamp_millis();
            let level = record.level();
            let style = buf.default_level_style(level);
            if verbose >= 1 {
                writeln!(
                    buf,
                    "{timestamp} {style}{level:<5}{style:#} [{}] {}",
                    record.module_path().unwrap_or("unknown"),
                    record.args()
                )
            } else {
                writeln!(buf, "{timestamp} {style}{level:<5}{style:#} {}", record.args())
            }
        });
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = verbose;
        builder.format(|buf, record| {
            let level = record.level();
            let style = buf.default_level_style(level);
            writeln!(buf, "{style}{level:<5}{style:#} {}", record.args())
        });
    }
}
