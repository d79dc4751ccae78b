//! Subcommand execution for the binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytesize::ByteSize;
use serde::Serialize;

use crate::cli::{
    Cli, Commands, GovernArgs, LookupArgs, OutputFormat, ScanArgs, VerifyIndexArgs, WatchArgs,
};
use crate::config::Config;
use crate::error::ExitCode;
use crate::governor::SizeGovernor;
use crate::halt::HaltGate;
use crate::index::{HashIndex, ScanResult};
use crate::logging;
use crate::monitor::CacheMonitor;
use crate::progress::Progress;
use crate::report::{
    display_path, GovernOutput, JsonReport, LookupOutput, ScanOutput, VerifyOutput,
};
use crate::scanner::{Reconciler, ScanError};
use crate::signal::{install_handler, ShutdownHandler};

/// Run the parsed command line and return the process exit code.
///
/// # Errors
///
/// Returns an error for anything that prevents the command from completing:
/// bad configuration, an unreadable index, missing roots, or a cancelled scan.
pub fn run_app(cli: Cli) -> Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet, cli.no_color);

    let config = Config::load_from(
        cli.config
            .clone()
            .or_else(|| Config::config_path().ok())
            .as_deref(),
    )
    .context("Failed to load configuration")?;

    match cli.command {
        Commands::Scan(args) => scan(config, &args, cli.quiet, cli.no_color),
        Commands::Watch(args) => watch(config, &args),
        Commands::Lookup(args) => lookup(config, &args),
        Commands::Govern(args) => govern(config, &args),
        Commands::VerifyIndex(args) => verify_index(config, &args),
    }
}

fn open_index(config: &Config) -> Result<Arc<HashIndex>> {
    let path = config
        .resolved_index_path()
        .context("Failed to locate the index file")?;
    let index = HashIndex::open(&path, config.roots())
        .with_context(|| format!("Failed to open index {}", path.display()))?;
    Ok(Arc::new(index))
}

fn emit<T: Serialize>(command: &'static str, code: ExitCode, result: T) -> Result<()> {
    let report = JsonReport::new(command, code, result);
    println!(
        "{}",
        report
            .to_json_pretty()
            .context("Failed to serialize output")?
    );
    Ok(())
}

fn scan(mut config: Config, args: &ScanArgs, quiet: bool, no_color: bool) -> Result<ExitCode> {
    args.roots.apply(&mut config);
    if let Some(threads) = args.threads {
        config.scan_threads = Some(usize::from(threads));
    }
    let roots = config.roots();
    if !roots.is_complete() {
        bail!("Both --mod-root and --cache-root (or their config values) are required to scan");
    }

    let shutdown = install_handler().context("Failed to install Ctrl+C handler")?;
    let index = open_index(&config)?;
    let reconciler = match config.scan_threads {
        Some(threads) => {
            Reconciler::with_threads(Arc::clone(&index), config.walker_config(), threads)
        }
        None => Reconciler::new(Arc::clone(&index), config.walker_config()),
    }
    .context("Failed to start scan workers")?;
    let show_progress = !quiet && args.output == OutputFormat::Text;
    let reconciler =
        reconciler.with_progress_callback(Arc::new(Progress::with_plain(!show_progress, no_color)));

    let summary = match reconciler.full_scan(&shutdown.token()) {
        Ok(summary) => summary,
        Err(ScanError::Cancelled) if shutdown.is_shutdown_requested() => {
            if let Err(e) = index.flush() {
                log::warn!("Failed to flush index after interrupt: {}", e);
            }
            return Ok(ExitCode::Interrupted);
        }
        Err(e) => return Err(e).context("Full scan failed"),
    };

    let eviction = if args.govern {
        match config.governor() {
            Some(governor) => Some(run_governor(&governor)?),
            None => {
                log::warn!("--govern given but no quota is configured; skipping eviction");
                None
            }
        }
    } else {
        None
    };

    let stats = index.stats();
    let code = ExitCode::from_failures(summary.failed);
    match args.output {
        OutputFormat::Json => emit("scan", code, ScanOutput::new(&summary, &stats, eviction))?,
        OutputFormat::Text => {
            println!(
                "Scanned {} candidates in {:.1}s: {} new, {} updated, {} removed, {} failed",
                summary.candidates,
                summary.duration.as_secs_f64(),
                summary.created,
                summary.updated,
                summary.removed,
                summary.failed
            );
            println!(
                "Index: {} entries ({} mod root, {} cache root), {}",
                stats.entries,
                stats.mod_root_entries,
                stats.cache_root_entries,
                ByteSize(stats.total_size)
            );
            if let Some(eviction) = eviction {
                println!(
                    "Evicted {} file(s), freed {}",
                    eviction.evicted.len(),
                    ByteSize(eviction.freed)
                );
            }
        }
    }
    Ok(code)
}

fn run_governor(governor: &SizeGovernor) -> Result<GovernOutput> {
    let report = governor
        .enforce()
        .context("Failed to enforce cache quota")?;
    Ok(GovernOutput::new(governor.quota(), governor.target(), &report))
}

fn watch(mut config: Config, args: &WatchArgs) -> Result<ExitCode> {
    args.roots.apply(&mut config);
    if let Some(quota) = args.quota {
        config.quota_bytes = Some(quota);
    }
    if let Some(secs) = args.scan_interval {
        config.full_scan_interval_secs = secs;
    }
    if config.mod_root.is_none() && config.cache_root.is_none() {
        bail!("Nothing to watch: configure --mod-root and/or --cache-root");
    }
    if !config.roots().is_complete() {
        log::warn!("Only one root is configured; full scans wait until both are set");
    }

    let shutdown: ShutdownHandler =
        install_handler().context("Failed to install Ctrl+C handler")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("modcache-rt")
        .build()
        .context("Failed to start async runtime")?;

    let index = open_index(&config)?;
    let gate = Arc::new(HaltGate::new());
    let mut monitor = CacheMonitor::new(index, Arc::clone(&gate), config.monitor_settings())
        .context("Failed to create cache monitor")?;
    if let Some(governor) = config.governor() {
        log::info!(
            "Cache quota {} (target {})",
            ByteSize(governor.quota()),
            ByteSize(governor.target())
        );
        monitor = monitor.with_governor(governor.with_halt_gate(gate));
    }

    {
        let _guard = runtime.enter();
        monitor.start().context("Failed to start cache monitor")?;
    }
    log::info!("Watching; press Ctrl+C to stop");
    runtime.block_on(shutdown.wait());

    monitor.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(5));
    Ok(ExitCode::Interrupted)
}

fn lookup(mut config: Config, args: &LookupArgs) -> Result<ExitCode> {
    args.roots.apply(&mut config);
    let index = open_index(&config)?;
    let found = index
        .lookup_by_hash(&args.hash)
        .and_then(|entry| index.resolve(&entry.path).map(|path| (entry, path)));
    let code = if found.is_some() {
        ExitCode::Success
    } else {
        ExitCode::GeneralError
    };

    match args.output {
        OutputFormat::Json => emit(
            "lookup",
            code,
            LookupOutput {
                hash: args.hash.clone(),
                path: found.as_ref().map(|(_, path)| display_path(path)),
                size: found.as_ref().and_then(|(entry, _)| entry.size),
            },
        )?,
        OutputFormat::Text => match &found {
            Some((_, path)) => println!("{}", path.display()),
            None => eprintln!("{} is not held locally", args.hash),
        },
    }
    Ok(code)
}

fn govern(mut config: Config, args: &GovernArgs) -> Result<ExitCode> {
    args.roots.apply(&mut config);
    if let Some(quota) = args.quota {
        config.quota_bytes = Some(quota);
    }
    if let Some(ratio) = args.buffer_ratio {
        config.quota_buffer_ratio = ratio;
    }
    config.validate().context("Invalid quota settings")?;
    if config.cache_root.is_none() {
        bail!("No cache root configured; pass --cache-root");
    }
    let Some(governor) = config.governor() else {
        bail!("No quota configured; pass --quota or set quota_bytes");
    };

    let output = run_governor(&governor)?;
    match args.output {
        OutputFormat::Json => emit("govern", ExitCode::Success, output)?,
        OutputFormat::Text => println!(
            "Cache usage {} -> {} (quota {}, target {}); evicted {} file(s)",
            ByteSize(output.usage_before),
            ByteSize(output.usage_after),
            ByteSize(output.quota),
            ByteSize(output.target),
            output.evicted.len()
        ),
    }
    Ok(ExitCode::Success)
}

fn verify_index(mut config: Config, args: &VerifyIndexArgs) -> Result<ExitCode> {
    args.roots.apply(&mut config);
    let index = open_index(&config)?;
    let malformed = index.malformed_on_load();

    let (mut updated, mut removed) = (0usize, 0usize);
    if args.deep {
        for mut entry in index.entries() {
            match index.validate(&mut entry) {
                ScanResult::Valid => {}
                ScanResult::RequireUpdate => updated += 1,
                ScanResult::RequireDeletion => removed += 1,
            }
        }
        index.flush().context("Failed to flush index")?;
    }

    let stats = index.stats();
    let code = ExitCode::from_failures(malformed);
    match args.output {
        OutputFormat::Json => emit(
            "verify-index",
            code,
            VerifyOutput {
                index_path: display_path(index.file_path()),
                malformed_lines: malformed,
                index: (&stats).into(),
                removed: args.deep.then_some(removed),
                updated: args.deep.then_some(updated),
            },
        )?,
        OutputFormat::Text => {
            println!(
                "{}: {} entries, {} malformed line(s)",
                index.file_path().display(),
                stats.entries,
                malformed
            );
            if args.deep {
                println!("Re-validated: {updated} updated, {removed} removed");
            }
        }
    }
    Ok(code)
}
