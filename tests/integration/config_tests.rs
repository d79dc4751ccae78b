use modcache::config::{Config, ConfigError};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::tempdir;

static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Clear every MODCACHE_* variable so tests do not see each other's layers.
fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("MODCACHE_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
fn test_missing_file_yields_defaults() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let dir = tempdir().unwrap();
    let config = Config::load_from(Some(&dir.path().join("absent.toml"))).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_toml_layer_overrides_defaults() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
mod_root = "/games/mods"
cache_root = "/games/cache"
quota_bytes = 1073741824
extensions = ["tex", "mdl"]
mod_debounce_ms = 2500
full_scan_interval_secs = 0
compaction = true
"#,
    )
    .unwrap();

    let config = Config::load_from(Some(&path)).unwrap();
    assert_eq!(config.mod_root, Some(PathBuf::from("/games/mods")));
    assert_eq!(config.quota_bytes, Some(1_073_741_824));
    assert_eq!(config.extensions, vec!["tex", "mdl"]);
    assert!(config.compaction);
    // Untouched keys keep their defaults.
    assert_eq!(config.parallel_downloads, 5);
    assert_eq!(config.cache_debounce_ms, 1_000);

    let settings = config.monitor_settings();
    assert_eq!(settings.mod_debounce, Duration::from_millis(2_500));
    assert!(settings.full_scan_interval.is_none());
    assert!(config.roots().is_complete());
    assert!(config.compaction_hook().is_active());
}

#[test]
fn test_environment_overrides_file() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "parallel_downloads = 3\nverification_window_secs = 60\n").unwrap();

    std::env::set_var("MODCACHE_PARALLEL_DOWNLOADS", "8");
    let config = Config::load_from(Some(&path));
    clear_env();

    let config = config.unwrap();
    assert_eq!(config.parallel_downloads, 8);
    assert_eq!(config.verification_window_secs, 60);
    let transfer = config.transfer_config();
    assert_eq!(transfer.parallel_downloads, 8);
    assert_eq!(transfer.verification_window, Duration::from_secs(60));
}

#[test]
fn test_out_of_range_value_is_rejected() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "quota_buffer_ratio = 1.0\n").unwrap();

    let err = Config::load_from(Some(&path)).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            field: "quota_buffer_ratio",
            ..
        }
    ));
}

#[test]
fn test_wrong_type_is_a_figment_error() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "parallel_downloads = \"many\"\n").unwrap();

    let err = Config::load_from(Some(&path)).unwrap_err();
    assert!(matches!(err, ConfigError::Figment(_)));
    assert!(err.to_string().contains("parallel_downloads"));
}

#[test]
fn test_save_then_load_round_trips() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested/config.toml");
    let config = Config {
        cache_root: Some(PathBuf::from("/srv/cache")),
        quota_bytes: Some(42_000),
        scan_threads: Some(3),
        ..Config::default()
    };

    config.save_to(&path).unwrap();
    assert_eq!(Config::load_from(Some(&path)).unwrap(), config);
}
