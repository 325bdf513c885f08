// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::{Duration, SystemTime};

use crate::{FileStat, ListDirCache};

fn backdate(path: &std::path::Path) {
    let file = std::fs::File::open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(600))
        .unwrap();
}

#[test]
fn returns_none_for_non_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, b"x").unwrap();

    let cache = ListDirCache::new(16);
    let stat = FileStat::of_path(&file);
    assert_eq!(cache.get_dir_entries(&file, &stat), None);
}

#[test]
fn caches_listing_until_stat_changes() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.h"), b"").unwrap();
    std::fs::write(dir.path().join("b.h"), b"").unwrap();
    backdate(dir.path());

    let cache = ListDirCache::new(16);
    let stat = FileStat::of_path(dir.path());

    let first = cache.get_dir_entries(dir.path(), &stat).unwrap();
    assert_eq!(
        first.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["a.h", "b.h"]
    );
    assert_eq!(cache.misses(), 1);

    let second = cache.get_dir_entries(dir.path(), &stat).unwrap();
    assert_eq!(second, first);
    assert_eq!(cache.hits(), 1);

    // A different stat forces re-enumeration.
    std::fs::write(dir.path().join("c.h"), b"").unwrap();
    backdate(dir.path());
    let new_stat = FileStat::of_path(dir.path());
    let third = cache.get_dir_entries(dir.path(), &new_stat).unwrap();
    assert_eq!(third.len(), 3);
    assert_eq!(cache.misses(), 2);
}

#[test]
fn stale_listings_are_returned_but_not_cached() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.h"), b"").unwrap();

    let cache = ListDirCache::new(16);
    // Freshly created directory: its mtime is within the staleness window.
    let stat = FileStat::of_path(dir.path());
    assert!(stat.can_be_stale());

    let listed = cache.get_dir_entries(dir.path(), &stat).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(cache.len(), 0);
}

#[test]
fn capacity_evicts_oldest() {
    let parent = tempfile::TempDir::new().unwrap();
    let mut dirs = Vec::new();
    for i in 0..3 {
        let d = parent.path().join(format!("d{i}"));
        std::fs::create_dir(&d).unwrap();
        backdate(&d);
        dirs.push(d);
    }

    let cache = ListDirCache::new(2);
    for d in &dirs {
        let stat = FileStat::of_path(d);
        cache.get_dir_entries(d, &stat).unwrap();
    }
    assert_eq!(cache.len(), 2);

    // The first directory was evicted, so listing it again misses.
    let stat = FileStat::of_path(&dirs[0]);
    cache.get_dir_entries(&dirs[0], &stat).unwrap();
    assert_eq!(cache.misses(), 4);
}
