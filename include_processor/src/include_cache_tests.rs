// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::{Duration, SystemTime};

use fs::FileStat;

use crate::include_cache::IncludeCache;

fn write_backdated(path: &std::path::Path, bytes: &[u8], age_secs: u64) {
    std::fs::write(path, bytes).unwrap();
    let file = std::fs::File::open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
        .unwrap();
}

#[test]
fn second_lookup_hits() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("a.h");
    write_backdated(&path, b"#ifndef A_H\n#define A_H\n#endif\n", 600);

    let cache = IncludeCache::new(16);
    let stat = FileStat::of_path(&path);

    let first = cache.get_include_item(&path, &stat).unwrap();
    assert_eq!(first.include_guard_ident.as_deref(), Some("A_H"));
    assert_eq!(cache.stats().misses, 1);

    let second = cache.get_include_item(&path, &stat).unwrap();
    assert_eq!(cache.stats().hits, 1);
    // The directive list is shared, not reparsed.
    assert!(std::sync::Arc::ptr_eq(&first.directives, &second.directives));
}

#[test]
fn changed_stat_reparses() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("a.h");
    write_backdated(&path, b"#include <x.h>\n", 600);

    let cache = IncludeCache::new(16);
    let stat = FileStat::of_path(&path);
    cache.get_include_item(&path, &stat).unwrap();

    write_backdated(&path, b"#include <y.h>\n#include <z.h>\n", 300);
    let new_stat = FileStat::of_path(&path);
    let item = cache.get_include_item(&path, &new_stat).unwrap();
    assert_eq!(item.directives.len(), 2);
    assert_eq!(cache.stats().misses, 2);
    assert_eq!(cache.stats().updated, 1);
}

#[test]
fn directive_hash_is_stable_for_equal_stat() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("a.h");
    write_backdated(&path, b"#define X 1 // comment\n", 600);

    let cache = IncludeCache::new(16);
    let stat = FileStat::of_path(&path);
    let first = cache.get_directive_hash(&path, &stat).unwrap();
    let second = cache.get_directive_hash(&path, &stat).unwrap();
    assert_eq!(first, second);
}

#[test]
fn directive_hash_ignores_non_directive_changes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path_a = dir.path().join("a.h");
    let path_b = dir.path().join("b.h");
    // Same directives, different comments and code.
    write_backdated(&path_a, b"// one\n#define X 1\nint a;\n", 600);
    write_backdated(&path_b, b"/* two */\n#define X 1\nint b;\n", 600);

    let cache = IncludeCache::new(16);
    let hash_a = cache
        .get_directive_hash(&path_a, &FileStat::of_path(&path_a))
        .unwrap();
    let hash_b = cache
        .get_directive_hash(&path_b, &FileStat::of_path(&path_b))
        .unwrap();
    assert_eq!(hash_a, hash_b);
}

#[test]
fn directive_hash_sees_directive_changes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path_a = dir.path().join("a.h");
    let path_b = dir.path().join("b.h");
    write_backdated(&path_a, b"#include <a>\n", 600);
    write_backdated(&path_b, b"#include <b>\n", 600);

    let cache = IncludeCache::new(16);
    let hash_a = cache
        .get_directive_hash(&path_a, &FileStat::of_path(&path_a))
        .unwrap();
    let hash_b = cache
        .get_directive_hash(&path_b, &FileStat::of_path(&path_b))
        .unwrap();
    assert_ne!(hash_a, hash_b);
}

#[test]
fn empty_file_yields_empty_directive_list() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("empty.h");
    write_backdated(&path, b"", 600);

    let cache = IncludeCache::new(16);
    let item = cache
        .get_include_item(&path, &FileStat::of_path(&path))
        .unwrap();
    assert!(item.directives.is_empty());
    assert_eq!(item.include_guard_ident, None);
}

#[test]
fn unreadable_file_returns_none() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = IncludeCache::new(16);
    let missing = dir.path().join("missing.h");
    assert!(cache
        .get_include_item(&missing, &FileStat::default())
        .is_none());
}

#[test]
fn capacity_evicts_oldest() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = IncludeCache::new(2);
    for index in 0..3 {
        let path = dir.path().join(format!("h{index}.h"));
        write_backdated(&path, b"#define X 1\n", 600);
        cache.get_include_item(&path, &FileStat::of_path(&path));
    }
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().evicted, 1);
}
