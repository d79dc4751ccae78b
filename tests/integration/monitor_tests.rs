use modcache::governor::SizeGovernor;
use modcache::halt::HaltGate;
use modcache::index::{HashIndex, Roots};
use modcache::monitor::{CacheMonitor, MonitorSettings};
use modcache::scanner::Hasher;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

fn settings() -> MonitorSettings {
    MonitorSettings {
        mod_debounce: Duration::from_millis(100),
        cache_debounce: Duration::from_millis(50),
        full_scan_interval: None,
        scan_threads: Some(2),
        ..MonitorSettings::default()
    }
}

fn open(dir: &Path) -> Arc<HashIndex> {
    fs::create_dir_all(dir.join("mods")).unwrap();
    fs::create_dir_all(dir.join("cache")).unwrap();
    Arc::new(
        HashIndex::open(
            &dir.join("index.txt"),
            Roots::new(Some(dir.join("mods")), Some(dir.join("cache"))),
        )
        .unwrap(),
    )
}

fn setup() -> (TempDir, Arc<HashIndex>) {
    let dir = tempdir().unwrap();
    let index = open(dir.path());
    (dir, index)
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scan_stays_halted_until_every_source_resumes() {
    let (dir, index) = setup();
    fs::write(dir.path().join("mods/body.tex"), b"body").unwrap();
    let gate = Arc::new(HaltGate::new());
    let monitor = CacheMonitor::new(Arc::clone(&index), Arc::clone(&gate), settings()).unwrap();

    monitor.halt("A");
    monitor.halt("B");
    monitor.start().unwrap();

    monitor.resume("A");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(monitor.is_halted());
    assert_eq!(monitor.scans_completed(), 0);
    assert!(index.is_empty());

    monitor.resume("B");
    assert!(eventually(|| monitor.scans_completed() == 1).await);
    assert_eq!(index.len(), 1);
    monitor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_batch_waits_for_resume() {
    let (dir, index) = setup();
    let monitor = CacheMonitor::new(Arc::clone(&index), Arc::new(HaltGate::new()), settings())
        .unwrap();
    monitor.start().unwrap();
    assert!(eventually(|| monitor.scans_completed() == 1).await);

    monitor.halt("loading screen");
    fs::write(dir.path().join("mods/new.tex"), b"new").unwrap();
    assert!(eventually(|| monitor.pending_changes().0 > 0).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(index.is_empty());

    monitor.resume("loading screen");
    assert!(eventually(|| index.len() == 1).await);
    assert!(eventually(|| monitor.pending_changes() == (0, 0)).await);
    monitor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_folder_drops_its_entries() {
    let (dir, index) = setup();
    fs::create_dir_all(dir.path().join("mods/outfit")).unwrap();
    fs::write(dir.path().join("mods/outfit/top.tex"), b"top").unwrap();
    fs::write(dir.path().join("mods/outfit/legs.mdl"), b"legs").unwrap();
    fs::write(dir.path().join("mods/keep.tex"), b"keep").unwrap();

    let monitor = CacheMonitor::new(Arc::clone(&index), Arc::new(HaltGate::new()), settings())
        .unwrap();
    monitor.start().unwrap();
    assert!(eventually(|| index.len() == 3).await);

    fs::remove_dir_all(dir.path().join("mods/outfit")).unwrap();
    assert!(eventually(|| index.len() == 1).await);
    assert!(index
        .lookup_by_hash(&Hasher::hash_bytes(b"keep"))
        .is_some());
    monitor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_roots_changed_rescans_new_root() {
    let (dir, index) = setup();
    let monitor = CacheMonitor::new(Arc::clone(&index), Arc::new(HaltGate::new()), settings())
        .unwrap();
    monitor.start().unwrap();
    assert!(eventually(|| monitor.scans_completed() == 1).await);

    let other = dir.path().join("other-mods");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("hat.tex"), b"hat").unwrap();
    monitor
        .roots_changed(Roots::new(Some(other.clone()), Some(dir.path().join("cache"))))
        .unwrap();

    assert!(eventually(|| monitor.scans_completed() == 2).await);
    assert_eq!(
        index.resolve_hash(&Hasher::hash_bytes(b"hat")),
        Some(other.join("hat.tex"))
    );
    monitor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_start_triggers_scan() {
    let (_dir, index) = setup();
    let monitor = CacheMonitor::new(Arc::clone(&index), Arc::new(HaltGate::new()), settings())
        .unwrap();
    monitor.start().unwrap();
    assert!(eventually(|| monitor.scans_completed() == 1).await);

    monitor.session_started();
    assert!(eventually(|| monitor.scans_completed() == 2).await);
    assert!(monitor.last_scan().is_some());
    monitor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quota_enforced_after_full_scan() {
    let (dir, index) = setup();
    let cache = dir.path().join("cache");
    for seed in 0..5u8 {
        let content = vec![seed; 1_000];
        fs::write(cache.join(Hasher::hash_bytes(&content)), &content).unwrap();
    }

    let governor = SizeGovernor::new(&cache, 2_500);
    let target = governor.target();
    let monitor = CacheMonitor::new(Arc::clone(&index), Arc::new(HaltGate::new()), settings())
        .unwrap()
        .with_governor(governor);
    monitor.start().unwrap();

    assert!(eventually(|| monitor.scans_completed() == 1).await);
    let check = SizeGovernor::new(&cache, 2_500);
    assert!(eventually(|| check.usage().unwrap() <= target).await);
    monitor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_persists_index() {
    let (dir, index) = setup();
    fs::write(dir.path().join("mods/body.tex"), b"body").unwrap();
    let monitor = CacheMonitor::new(Arc::clone(&index), Arc::new(HaltGate::new()), settings())
        .unwrap();
    monitor.start().unwrap();
    assert!(eventually(|| monitor.scans_completed() == 1).await);
    monitor.shutdown();
    drop(monitor);

    let reopened = open(dir.path());
    assert_eq!(reopened.len(), 1);
}
