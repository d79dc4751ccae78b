use filetime::{set_file_atime, FileTime};
use modcache::governor::SizeGovernor;
use modcache::halt::HaltGate;
use modcache::index::{HashIndex, Roots};
use modcache::scanner::Hasher;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::tempdir;

/// Write a hash-named cache file of `size` bytes last accessed at `atime`.
fn cached(cache: &Path, seed: u8, size: usize, atime: i64) -> PathBuf {
    let content = vec![seed; size];
    let path = cache.join(format!("{}.tex", Hasher::hash_bytes(&content)));
    fs::write(&path, &content).unwrap();
    set_file_atime(&path, FileTime::from_unix_time(atime, 0)).unwrap();
    path
}

#[test]
fn test_usage_over_quota_evicts_least_recently_accessed() {
    let dir = tempdir().unwrap();
    let oldest = cached(dir.path(), 1, 400, 1_000);
    let middle = cached(dir.path(), 2, 400, 2_000);
    let newer = cached(dir.path(), 3, 400, 3_000);
    let newest = cached(dir.path(), 4, 400, 4_000);

    // 1600 bytes against a 1000 byte quota: target is 950.
    let governor = SizeGovernor::new(dir.path(), 1_000);
    let report = governor.enforce().unwrap();

    assert_eq!(report.usage_before, 1_600);
    assert_eq!(report.evicted, vec![oldest.clone(), middle.clone()]);
    assert_eq!(report.usage_after, 800);
    assert!(report.usage_after <= governor.target());
    assert!(!oldest.exists());
    assert!(!middle.exists());
    assert!(newer.exists());
    assert!(newest.exists());
    assert_eq!(governor.usage().unwrap(), 800);
}

#[test]
fn test_incoming_directory_is_not_counted() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join(".incoming")).unwrap();
    fs::write(dir.path().join(".incoming/partial.part"), vec![0u8; 5_000]).unwrap();
    cached(dir.path(), 1, 100, 1_000);

    let governor = SizeGovernor::new(dir.path(), 1_000);
    assert_eq!(governor.usage().unwrap(), 100);
    assert!(governor.enforce().unwrap().evicted.is_empty());
    assert!(dir.path().join(".incoming/partial.part").exists());
}

#[test]
fn test_unrelated_halt_pauses_eviction_but_transfers_do_not() {
    let dir = tempdir().unwrap();
    for seed in 0..4u8 {
        cached(dir.path(), seed, 300, 1_000 + i64::from(seed));
    }
    let gate = Arc::new(HaltGate::new());
    let governor = SizeGovernor::new(dir.path(), 600).with_halt_gate(Arc::clone(&gate));

    gate.halt("cutscene");
    let paused = governor.enforce().unwrap();
    assert!(paused.evicted.is_empty());
    assert_eq!(paused.usage_after, 1_200);

    gate.resume("cutscene");
    let _transfer = gate.hold("transfer:download");
    let report = governor.enforce().unwrap();
    assert_eq!(report.evicted.len(), 3);
    assert!(report.usage_after <= governor.target());
}

#[test]
fn test_evicted_entries_are_dropped_lazily_from_index() {
    let dir = tempdir().unwrap();
    let cache = dir.path().join("cache");
    fs::create_dir_all(&cache).unwrap();
    let old = cached(&cache, 7, 600, 1_000);
    let recent = cached(&cache, 8, 600, 2_000);

    let index = HashIndex::open(
        &dir.path().join("index.txt"),
        Roots::new(None, Some(cache.clone())),
    )
    .unwrap();
    // Explicit hashes: reading the files would refresh their access times.
    let old_hash = Hasher::hash_bytes(&[7u8; 600]);
    let recent_hash = Hasher::hash_bytes(&[8u8; 600]);
    index.create_entry(&old, Some(&old_hash)).unwrap();
    index.create_entry(&recent, Some(&recent_hash)).unwrap();

    let report = SizeGovernor::new(&cache, 1_000).enforce().unwrap();
    assert_eq!(report.evicted, vec![old]);

    // Eviction does not touch the index; the next lookup corrects it.
    assert_eq!(index.len(), 2);
    assert!(index.lookup_by_hash(&old_hash).is_none());
    assert!(index.lookup_by_hash(&recent_hash).is_some());
    assert_eq!(index.len(), 1);
}

#[test]
fn test_missing_cache_root_has_zero_usage() {
    let dir = tempdir().unwrap();
    let governor = SizeGovernor::new(&dir.path().join("absent"), 10);
    assert_eq!(governor.usage().unwrap(), 0);
    assert!(governor.enforce().unwrap().evicted.is_empty());
}
