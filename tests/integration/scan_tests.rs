use filetime::{set_file_mtime, FileTime};
use modcache::index::{HashIndex, Roots};
use modcache::progress::ProgressCallback;
use modcache::scanner::{Hasher, Reconciler, ScanError, WalkerConfig};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

struct Setup {
    dir: TempDir,
    index: Arc<HashIndex>,
}

impl Setup {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("mods")).unwrap();
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        let index = HashIndex::open(
            &dir.path().join("index.txt"),
            Roots::new(Some(dir.path().join("mods")), Some(dir.path().join("cache"))),
        )
        .unwrap();
        Self {
            dir,
            index: Arc::new(index),
        }
    }

    fn write(&self, relative: &str, content: &[u8]) -> std::path::PathBuf {
        let path = self.dir.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::with_threads(Arc::clone(&self.index), WalkerConfig::default(), 2).unwrap()
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }
}

#[test]
fn test_empty_index_indexes_untracked_files_once() {
    let setup = Setup::new();
    setup.write("mods/a/body.tex", b"body");
    setup.write("mods/a/hair.mdl", b"hair");
    setup.write("mods/b/skin.mtrl", b"skin");

    let summary = setup
        .reconciler()
        .full_scan(&CancellationToken::new())
        .unwrap();

    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.created, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(setup.index.len(), 3);
    assert_eq!(setup.index.hasher().files_hashed(), 3);
}

#[test]
fn test_unchanged_rescan_hashes_nothing() {
    let setup = Setup::new();
    setup.write("mods/body.tex", b"body");
    let reconciler = setup.reconciler();

    reconciler.full_scan(&CancellationToken::new()).unwrap();
    let second = reconciler.full_scan(&CancellationToken::new()).unwrap();

    assert_eq!(second.validated, 1);
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(setup.index.hasher().files_hashed(), 1);
}

#[test]
fn test_filters_skip_excluded_folders_and_extensions() {
    let setup = Setup::new();
    setup.write("mods/chara/body.tex", b"kept");
    setup.write("mods/backup/body.tex", b"excluded folder");
    setup.write("mods/chara/TEMP/old.tex", b"excluded, case-insensitive");
    setup.write("mods/chara/readme.txt", b"wrong extension");

    let summary = setup
        .reconciler()
        .full_scan(&CancellationToken::new())
        .unwrap();

    assert_eq!(summary.created, 1);
    assert!(setup
        .index
        .lookup_by_hash(&Hasher::hash_bytes(b"kept"))
        .is_some());
}

#[test]
fn test_cache_root_only_accepts_hash_named_files() {
    let setup = Setup::new();
    let hash = Hasher::hash_bytes(b"cached asset");
    setup.write(&format!("cache/{hash}.tex"), b"cached asset");
    setup.write("cache/notes.tex", b"not hash named");
    setup.write(&format!("cache/.incoming/{hash}.part"), b"partial");

    let summary = setup
        .reconciler()
        .full_scan(&CancellationToken::new())
        .unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(setup.index.stats().cache_root_entries, 1);
    assert_eq!(
        setup.index.resolve_hash(&hash),
        Some(setup.root().join(format!("cache/{hash}.tex")))
    );
}

#[test]
fn test_rescan_updates_changed_and_drops_deleted() {
    let setup = Setup::new();
    let changed = setup.write("mods/changed.tex", b"before");
    let deleted = setup.write("mods/deleted.tex", b"deleted");
    let reconciler = setup.reconciler();
    reconciler.full_scan(&CancellationToken::new()).unwrap();

    fs::write(&changed, b"after").unwrap();
    set_file_mtime(&changed, FileTime::from_unix_time(2_000_000_000, 0)).unwrap();
    fs::remove_file(&deleted).unwrap();

    let summary = reconciler.full_scan(&CancellationToken::new()).unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.created, 0);
    assert_eq!(setup.index.len(), 1);

    let reopened = HashIndex::open(&setup.root().join("index.txt"), setup.index.roots()).unwrap();
    assert_eq!(reopened.len(), 1);
    assert!(reopened
        .lookup_by_hash(&Hasher::hash_bytes(b"after"))
        .is_some());
}

#[test]
fn test_cancelled_scan_reports_cancellation() {
    let setup = Setup::new();
    setup.write("mods/body.tex", b"body");
    let token = CancellationToken::new();
    token.cancel();

    let result = setup.reconciler().full_scan(&token);
    assert!(matches!(result, Err(ScanError::Cancelled)));
    assert!(setup.index.is_empty());
}

#[derive(Default)]
struct Recorder {
    phases: Mutex<Vec<String>>,
    bytes: AtomicU64,
}

impl ProgressCallback for Recorder {
    fn on_phase_start(&self, phase: &str, _total: usize) {
        self.phases.lock().unwrap().push(format!("start:{phase}"));
    }

    fn on_progress(&self, _current: usize, _path: &str) {}

    fn on_item_completed(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_message(&self, message: &str) {
        self.phases.lock().unwrap().push(format!("msg:{message}"));
    }

    fn on_phase_end(&self, phase: &str) {
        self.phases.lock().unwrap().push(format!("end:{phase}"));
    }
}

#[test]
fn test_progress_callback_sees_every_phase() {
    let setup = Setup::new();
    setup.write("mods/body.tex", b"body");
    let recorder = Arc::new(Recorder::default());
    let reconciler = setup.reconciler().with_progress_callback(recorder.clone());

    reconciler.full_scan(&CancellationToken::new()).unwrap();

    let phases = recorder.phases.lock().unwrap().clone();
    for phase in ["discover", "validate", "index"] {
        assert!(phases.contains(&format!("start:{phase}")), "{phases:?}");
        assert!(phases.contains(&format!("end:{phase}")), "{phases:?}");
    }
    assert!(phases.contains(&"msg:Discovered 1 mod files".to_string()), "{phases:?}");
    assert_eq!(recorder.bytes.load(Ordering::Relaxed), 4);
    assert!(!reconciler.progress().is_running());
}
