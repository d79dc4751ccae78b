use filetime::{set_file_mtime, FileTime};
use modcache::index::{HashIndex, IndexFile, Roots, ScanResult};
use modcache::scanner::Hasher;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn roots(dir: &Path) -> Roots {
    Roots::new(Some(dir.join("mods")), Some(dir.join("cache")))
}

fn setup() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("mods/chara")).unwrap();
    fs::create_dir_all(dir.path().join("cache")).unwrap();
    let index_path = dir.path().join("index.txt");
    (dir, index_path)
}

#[test]
fn test_stale_mtime_requires_update_and_persists() {
    let (dir, index_path) = setup();
    let file = dir.path().join("mods/chara/body.tex");
    fs::write(&file, b"original").unwrap();

    let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    let mut entry = index.create_entry(&file, None).unwrap();
    index.flush().unwrap();
    let old_hash = entry.hash.clone();
    let old_ticks = entry.last_modified_ticks;

    fs::write(&file, b"edited on disk").unwrap();
    set_file_mtime(&file, FileTime::from_unix_time(2_000_000_000, 0)).unwrap();

    assert_eq!(index.validate(&mut entry), ScanResult::RequireUpdate);
    assert_ne!(entry.hash, old_hash);
    assert_ne!(entry.last_modified_ticks, old_ticks);
    assert_eq!(entry.hash, Hasher::hash_bytes(b"edited on disk"));
    index.flush().unwrap();

    let reopened = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    let stored = reopened.lookup_by_path(&file).unwrap();
    assert_eq!(stored.hash, entry.hash);
    assert_eq!(stored.last_modified_ticks, entry.last_modified_ticks);
}

#[test]
fn test_deleted_file_requires_deletion_and_is_gone_after_reload() {
    let (dir, index_path) = setup();
    let file = dir.path().join("mods/chara/hair.mdl");
    fs::write(&file, b"hair").unwrap();

    let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    let mut entry = index.create_entry(&file, None).unwrap();
    index.flush().unwrap();

    fs::remove_file(&file).unwrap();
    assert_eq!(index.validate(&mut entry), ScanResult::RequireDeletion);
    index.flush().unwrap();

    let reopened = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    assert!(reopened.is_empty());
    assert!(reopened.get(&entry.path).is_none());
}

#[test]
fn test_validate_unchanged_twice_is_idempotent() {
    let (dir, index_path) = setup();
    let file = dir.path().join("mods/chara/eye.mtrl");
    fs::write(&file, b"eye").unwrap();

    let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    let mut entry = index.create_entry(&file, None).unwrap();
    let before = entry.clone();

    assert_eq!(index.validate(&mut entry), ScanResult::Valid);
    assert_eq!(index.validate(&mut entry), ScanResult::Valid);
    assert_eq!(entry, before);
    assert_eq!(index.get(&entry.path).unwrap(), before);
}

#[test]
fn test_appended_entries_survive_without_flush() {
    let (dir, index_path) = setup();
    for name in ["a.tex", "b.tex"] {
        fs::write(dir.path().join("mods").join(name), name.as_bytes()).unwrap();
    }

    {
        let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
        index
            .create_entry(&dir.path().join("mods/a.tex"), None)
            .unwrap();
        index
            .create_entry(&dir.path().join("mods/b.tex"), None)
            .unwrap();
    }

    let reopened = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    assert_eq!(reopened.len(), 2);
    assert!(reopened
        .lookup_by_path(&dir.path().join("mods/a.tex"))
        .is_some());
}

#[test]
fn test_backup_is_promoted_when_primary_missing() {
    let (dir, index_path) = setup();
    let file = dir.path().join("mods/chara/body.tex");
    fs::write(&file, b"body").unwrap();

    let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    index.create_entry(&file, None).unwrap();
    index.flush().unwrap();

    let backup = IndexFile::new(&index_path).backup_path();
    fs::rename(&index_path, &backup).unwrap();

    let recovered = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    assert_eq!(recovered.len(), 1);
    assert!(recovered.lookup_by_path(&file).is_some());
}

#[test]
fn test_malformed_lines_are_skipped() {
    let (dir, index_path) = setup();
    let hash = "ab".repeat(32);
    fs::write(
        &index_path,
        format!(
            "{hash}|{{modroot}}/chara/body.tex|100\n\
             not a record\n\
             {hash}|{{nowhere}}/x.tex|1\n\
             {hash}|{{cache}}/{hash}|200|10|5\n"
        ),
    )
    .unwrap();

    let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    assert_eq!(index.len(), 2);
    assert_eq!(index.malformed_on_load(), 2);
    let stats = index.stats();
    assert_eq!(stats.mod_root_entries, 1);
    assert_eq!(stats.cache_root_entries, 1);
}

#[test]
fn test_shared_hash_resolves_to_one_deterministic_entry() {
    let (dir, index_path) = setup();
    let content = b"same texture";
    let short = dir.path().join("mods/a.tex");
    let long = dir.path().join("mods/chara/longer_name.tex");
    fs::write(&short, content).unwrap();
    fs::write(&long, content).unwrap();

    let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    let hash = index.create_entry(&short, None).unwrap().hash;
    index.create_entry(&long, None).unwrap();

    let first = index.lookup_by_hash(&hash).unwrap();
    let second = index.lookup_by_hash(&hash).unwrap();
    assert_eq!(first.path, second.path);
    assert_eq!(first.path.to_string(), "{modroot}/chara/longer_name.tex");
    assert_eq!(index.resolve_hash(&hash), Some(long.clone()));

    // Winner disappears: the other holder is returned instead.
    fs::remove_file(&long).unwrap();
    assert_eq!(index.resolve_hash(&hash), Some(short));
}

#[test]
fn test_entries_follow_moved_roots() {
    let (dir, index_path) = setup();
    let file = dir.path().join("mods/chara/body.tex");
    fs::write(&file, b"body").unwrap();

    let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    let hash = index.create_entry(&file, None).unwrap().hash;
    index.flush().unwrap();

    fs::rename(dir.path().join("mods"), dir.path().join("mods-moved")).unwrap();
    let moved = Roots::new(
        Some(dir.path().join("mods-moved")),
        Some(dir.path().join("cache")),
    );
    let reopened = HashIndex::open(&index_path, moved).unwrap();
    assert_eq!(
        reopened.resolve_hash(&hash),
        Some(dir.path().join("mods-moved/chara/body.tex"))
    );
}

#[test]
fn test_files_outside_roots_are_not_indexed() {
    let (dir, index_path) = setup();
    let outside = dir.path().join("elsewhere.tex");
    fs::write(&outside, b"x").unwrap();

    let index = HashIndex::open(&index_path, roots(dir.path())).unwrap();
    assert!(index.create_entry(&outside, None).is_none());
    assert!(index
        .create_entry(&dir.path().join("mods/missing.tex"), None)
        .is_none());
    assert!(index.is_empty());
}
