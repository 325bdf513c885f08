// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;

use hashing::Digest;
use task_executor::Executor;

use crate::{CachedCompileResult, CachedOutput, LocalOutputCache, LocalOutputCacheOptions};

fn result_with_payload(payload: &[u8]) -> CachedCompileResult {
    CachedCompileResult {
        exit_status: 0,
        stdout: Vec::new(),
        stderr: Vec::new(),
        outputs: vec![CachedOutput {
            filename: "foo.o".to_string(),
            mode: 0o644,
            content: payload.to_vec(),
            hash_key: None,
        }],
    }
}

fn key(salt: u8) -> hashing::Fingerprint {
    Digest::of_bytes(&[salt]).hash
}

#[tokio::test]
async fn save_and_lookup_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = LocalOutputCache::new(
        dir.path().to_path_buf(),
        LocalOutputCacheOptions::default(),
        Executor::new(),
    )
    .unwrap();

    let result = result_with_payload(b"object bytes");
    assert!(cache.save_output(&key(1), &result));
    assert_eq!(cache.lookup(&key(1)), Some(result));
    assert_eq!(cache.lookup(&key(2)), None);

    let stats = cache.stats();
    assert_eq!(stats.save_success, 1);
    assert_eq!(stats.lookup_hit, 1);
    assert_eq!(stats.lookup_miss, 1);
}

#[tokio::test]
async fn entries_fan_out_by_hex_prefix() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = LocalOutputCache::new(
        dir.path().to_path_buf(),
        LocalOutputCacheOptions::default(),
        Executor::new(),
    )
    .unwrap();
    cache.save_output(&key(1), &result_with_payload(b"x"));

    let hex = key(1).to_hex();
    let expected = dir.path().join(&hex[0..2]).join(&hex);
    assert!(expected.exists());
}

#[tokio::test]
async fn entries_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let result = result_with_payload(b"persisted");
    {
        let cache = LocalOutputCache::new(
            dir.path().to_path_buf(),
            LocalOutputCacheOptions::default(),
            Executor::new(),
        )
        .unwrap();
        cache.save_output(&key(1), &result);
    }

    let reopened = LocalOutputCache::new(
        dir.path().to_path_buf(),
        LocalOutputCacheOptions::default(),
        Executor::new(),
    )
    .unwrap();
    assert_eq!(reopened.total_cache_count(), 1);
    assert_eq!(reopened.lookup(&key(1)), Some(result));
}

#[tokio::test]
async fn corrupt_entry_is_dropped_on_lookup() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = LocalOutputCache::new(
        dir.path().to_path_buf(),
        LocalOutputCacheOptions::default(),
        Executor::new(),
    )
    .unwrap();
    cache.save_output(&key(1), &result_with_payload(b"ok"));

    // Corrupt the on-disk entry behind the cache's back.
    let hex = key(1).to_hex();
    std::fs::write(dir.path().join(&hex[0..2]).join(&hex), b"garbage").unwrap();

    assert_eq!(cache.lookup(&key(1)), None);
    assert_eq!(cache.total_cache_count(), 0);
}

#[tokio::test]
async fn gc_trims_to_low_water_marks() {
    let dir = tempfile::TempDir::new().unwrap();
    let options = LocalOutputCacheOptions {
        max_bytes: u64::MAX,
        threshold_bytes: u64::MAX,
        max_items: 100,
        threshold_items: 2,
    };
    let cache =
        LocalOutputCache::new(dir.path().to_path_buf(), options, Executor::new()).unwrap();

    for salt in 0..5 {
        cache.save_output(&key(salt), &result_with_payload(&[salt; 16]));
    }
    assert_eq!(cache.total_cache_count(), 5);

    cache.run_garbage_collection();
    assert_eq!(cache.total_cache_count(), 2);
    // Newest entries survive.
    assert!(cache.lookup(&key(3)).is_some());
    assert!(cache.lookup(&key(4)).is_some());
    assert!(cache.lookup(&key(0)).is_none());
    assert_eq!(cache.stats().gc_removed_items, 3);
}

#[tokio::test]
async fn gc_respects_byte_threshold() {
    let dir = tempfile::TempDir::new().unwrap();
    let entry_size = {
        // Measure one serialized entry so the thresholds bracket a known count.
        let probe = LocalOutputCache::new(
            dir.path().join("probe"),
            LocalOutputCacheOptions::default(),
            Executor::new(),
        )
        .unwrap();
        probe.save_output(&key(9), &result_with_payload(&[9; 64]));
        probe.total_cache_bytes()
    };

    let options = LocalOutputCacheOptions {
        max_bytes: entry_size * 4,
        threshold_bytes: entry_size * 2,
        max_items: usize::MAX,
        threshold_items: usize::MAX,
    };
    let cache = LocalOutputCache::new(dir.path().join("real"), options, Executor::new()).unwrap();
    for salt in 0..6 {
        cache.save_output(&key(salt), &result_with_payload(&[salt; 64]));
    }
    cache.run_garbage_collection();
    assert!(cache.total_cache_bytes() <= entry_size * 2);
}

#[tokio::test]
async fn gc_starts_automatically_past_high_water() {
    let dir = tempfile::TempDir::new().unwrap();
    let options = LocalOutputCacheOptions {
        max_bytes: u64::MAX,
        threshold_bytes: u64::MAX,
        max_items: 3,
        threshold_items: 1,
    };
    let cache =
        LocalOutputCache::new(dir.path().to_path_buf(), options, Executor::new()).unwrap();

    for salt in 0..5 {
        cache.save_output(&key(salt), &result_with_payload(&[salt; 8]));
    }
    // The GC worker runs on the executor; give it a moment.
    for _ in 0..100 {
        if cache.total_cache_count() <= 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(cache.total_cache_count() <= 1);
    assert!(cache.stats().gc_count >= 1);
}

#[test]
fn options_defaults_are_ordered() {
    let options = LocalOutputCacheOptions::default();
    assert!(options.threshold_bytes < options.max_bytes);
    assert!(options.threshold_items < options.max_items);
}

// Arc is part of the save_output receiver type; make sure call sites stay ergonomic.
#[tokio::test]
async fn arc_receiver_is_callable_through_clone() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = LocalOutputCache::new(
        dir.path().to_path_buf(),
        LocalOutputCacheOptions::default(),
        Executor::new(),
    )
    .unwrap();
    let clone: Arc<LocalOutputCache> = cache.clone();
    assert!(clone.save_output(&key(7), &result_with_payload(b"via clone")));
}
