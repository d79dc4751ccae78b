use clap::Parser;
use modcache::cli::Cli;
use modcache::error::ExitCode;
use modcache::run_app;
use modcache::scanner::Hasher;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("mods/chara")).unwrap();
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        Self { dir }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Run a subcommand against this workspace's roots and index.
    fn run(&self, command: &str, extra: &[&str]) -> anyhow::Result<ExitCode> {
        let config = self.path("config.toml");
        let mods = self.path("mods");
        let cache = self.path("cache");
        let index = self.path("index.txt");
        let mut args: Vec<String> = vec![
            "modcache".into(),
            "-q".into(),
            "--config".into(),
            config.display().to_string(),
            command.into(),
        ];
        args.extend(extra.iter().map(|s| (*s).to_string()));
        args.extend([
            "--mod-root".into(),
            mods.display().to_string(),
            "--cache-root".into(),
            cache.display().to_string(),
            "--index".into(),
            index.display().to_string(),
        ]);
        run_app(Cli::try_parse_from(args).unwrap())
    }
}

#[test]
fn test_scan_then_lookup() {
    let ws = Workspace::new();
    fs::write(ws.path("mods/chara/body.tex"), b"body").unwrap();

    assert_eq!(ws.run("scan", &["--output", "json"]).unwrap(), ExitCode::Success);
    assert!(ws.path("index.txt").exists());

    let hash = Hasher::hash_bytes(b"body");
    assert_eq!(ws.run("lookup", &[&hash]).unwrap(), ExitCode::Success);
    assert_eq!(
        ws.run("lookup", &[&"0".repeat(64)]).unwrap(),
        ExitCode::GeneralError
    );
}

#[test]
fn test_scan_without_roots_is_an_error() {
    let ws = Workspace::new();
    let config = ws.path("config.toml");
    let cli = Cli::try_parse_from([
        "modcache",
        "-q",
        "--config",
        config.to_str().unwrap(),
        "scan",
        "--index",
        ws.path("index.txt").to_str().unwrap(),
    ])
    .unwrap();
    let err = run_app(cli).unwrap_err();
    assert!(err.to_string().contains("--mod-root"));
}

#[test]
fn test_govern_trims_cache_to_quota() {
    let ws = Workspace::new();
    for seed in 0..4u8 {
        let content = vec![seed; 1_000];
        fs::write(ws.path("cache").join(Hasher::hash_bytes(&content)), &content).unwrap();
    }

    let code = ws
        .run("govern", &["--quota", "2KB", "--buffer-ratio", "0", "--output", "json"])
        .unwrap();
    assert_eq!(code, ExitCode::Success);
    let remaining = fs::read_dir(ws.path("cache")).unwrap().count();
    assert_eq!(remaining, 2);
}

#[test]
fn test_govern_without_quota_is_an_error() {
    let ws = Workspace::new();
    assert!(ws.run("govern", &[]).is_err());
}

#[test]
fn test_verify_index_reports_malformed_lines() {
    let ws = Workspace::new();
    fs::write(
        ws.path("index.txt"),
        format!("{}|{{modroot}}/gone.tex|1\ngarbage\n", "ab".repeat(32)),
    )
    .unwrap();

    let code = ws.run("verify-index", &["--deep", "--output", "json"]).unwrap();
    assert_eq!(code, ExitCode::PartialSuccess);

    // --deep dropped the entry for the missing file and flushed.
    let rewritten = fs::read_to_string(ws.path("index.txt")).unwrap();
    assert!(!rewritten.contains("gone.tex"));
    assert!(ws.root().join("index.txt").exists());
}

#[test]
fn test_config_file_supplies_quota() {
    let ws = Workspace::new();
    fs::write(ws.path("config.toml"), "quota_bytes = 1500\nquota_buffer_ratio = 0.0\n").unwrap();
    for seed in 0..3u8 {
        let content = vec![seed; 1_000];
        fs::write(ws.path("cache").join(Hasher::hash_bytes(&content)), &content).unwrap();
    }

    assert_eq!(ws.run("govern", &[]).unwrap(), ExitCode::Success);
    assert_eq!(fs::read_dir(ws.path("cache")).unwrap().count(), 1);
}
