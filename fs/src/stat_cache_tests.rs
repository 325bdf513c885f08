// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::{FileStat, FileStatCache, GlobalFileStatCache};

fn old_mtime() -> SystemTime {
    SystemTime::now() - Duration::from_secs(600)
}

#[test]
fn invalid_stat_compares_unequal_to_itself() {
    let invalid = FileStat::default();
    assert!(!invalid.is_valid());
    assert_ne!(invalid, invalid.clone());
}

#[test]
fn equal_stats_compare_equal() {
    let stat = FileStat {
        size: 10,
        mtime: Some(old_mtime()),
        identity: Some((1, 42)),
        is_directory: false,
    };
    assert_eq!(stat, stat.clone());

    let mut other_size = stat.clone();
    other_size.size = 11;
    assert_ne!(stat, other_size);
}

#[test]
fn fresh_mtime_can_be_stale() {
    let now = SystemTime::now();
    let fresh = FileStat {
        size: 1,
        mtime: Some(now),
        identity: None,
        is_directory: false,
    };
    assert!(fresh.can_be_stale_at(now));

    let future = FileStat {
        size: 1,
        mtime: Some(now + Duration::from_secs(5)),
        identity: None,
        is_directory: false,
    };
    assert!(future.can_be_stale_at(now));

    let old = FileStat {
        size: 1,
        mtime: Some(now - Duration::from_secs(10)),
        identity: None,
        is_directory: false,
    };
    assert!(!old.can_be_stale_at(now));
}

#[test]
fn global_cache_does_not_store_directories() {
    let dir = tempfile::TempDir::new().unwrap();
    let global = GlobalFileStatCache::new();

    let stat = global.get(dir.path());
    assert!(stat.is_directory);
    // A second lookup must re-stat: directory stats are never retained.
    global.get(dir.path());
    assert_eq!(global.stats().hits, 0);
    assert_eq!(global.stats().misses, 2);
}

#[test]
fn global_cache_hits_for_settled_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("a.h");
    std::fs::write(&path, b"x").unwrap();
    // Backdate so the stat is outside the staleness window and cacheable.
    backdate(&path);

    let global = GlobalFileStatCache::new();
    let first = global.get(&path);
    let second = global.get(&path);
    assert_eq!(first, second);
    assert_eq!(global.stats().hits, 1);
    assert_eq!(global.stats().misses, 1);
}

#[test]
fn task_cache_caches_missing_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let missing = dir.path().join("missing.h");

    let mut cache = FileStatCache::new(None);
    let first = cache.get(&missing);
    assert!(!first.is_valid());

    // Create the file afterwards: the per-task cache still reports it missing, because a compile
    // task observes a fixed snapshot.
    std::fs::write(&missing, b"late").unwrap();
    let second = cache.get(&missing);
    assert!(!second.is_valid());
}

#[test]
fn possibly_stale_stats_are_never_cached() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("hot.h");
    // Freshly written: the mtime sits inside the staleness window.
    std::fs::write(&path, b"v1").unwrap();

    let global = Arc::new(GlobalFileStatCache::new());
    let mut task_cache = FileStatCache::new(Some(global.clone()));
    let first = task_cache.get(&path);
    assert!(first.can_be_stale());

    // A same-tick rewrite must be visible on the next lookup in both tiers.
    std::fs::write(&path, b"v2 longer").unwrap();
    let second = task_cache.get(&path);
    assert_eq!(second.size, 9);
    assert_eq!(global.stats().hits, 0);
}

#[test]
fn task_cache_consults_global_tier() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("b.h");
    std::fs::write(&path, b"y").unwrap();
    backdate(&path);

    let global = Arc::new(GlobalFileStatCache::new());
    let mut task_cache = FileStatCache::new(Some(global.clone()));
    task_cache.get(&path);
    assert_eq!(global.stats().misses, 1);

    // Second per-task lookup is served locally, without touching the global tier.
    task_cache.get(&path);
    assert_eq!(global.stats().hits, 0);
    assert_eq!(global.stats().misses, 1);
}

fn backdate(path: &std::path::Path) {
    let file = std::fs::File::open(path).unwrap();
    let old = SystemTime::now() - Duration::from_secs(600);
    file.set_modified(old).unwrap();
}
