// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The local output cache: request fingerprint → the outputs an identical invocation produced
//! before. Entries live as individual files under a two-hex-digit fan-out so the directory stays
//! flat; a garbage-collection worker trims oldest-first from a high-water mark down to a
//! low-water mark, on both total bytes and entry count.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hashing::Fingerprint;
use indexmap::IndexMap;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use task_executor::Executor;

///
/// One cached output artifact. Small outputs are stored inline; larger ones are referenced by
/// their blob key and re-fetched through the blob service on replay.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    pub filename: String,
    pub mode: u32,
    pub content: Vec<u8>,
    pub hash_key: Option<Fingerprint>,
}

///
/// The replayable result of one compile: what the client would have received from the remote.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCompileResult {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub outputs: Vec<CachedOutput>,
}

#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    mtime: SystemTime,
    amount_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocalOutputCacheStats {
    pub save_success: u64,
    pub save_failure: u64,
    pub lookup_hit: u64,
    pub lookup_miss: u64,
    pub gc_count: u64,
    pub gc_removed_items: u64,
    pub gc_removed_bytes: u64,
}

pub struct LocalOutputCacheOptions {
    pub max_bytes: u64,
    pub threshold_bytes: u64,
    pub max_items: usize,
    pub threshold_items: usize,
}

impl Default for LocalOutputCacheOptions {
    fn default() -> LocalOutputCacheOptions {
        LocalOutputCacheOptions {
            max_bytes: 1024 * 1024 * 1024,
            threshold_bytes: 768 * 1024 * 1024,
            max_items: 16384,
            threshold_items: 12288,
        }
    }
}

pub struct LocalOutputCache {
    cache_dir: PathBuf,
    options: LocalOutputCacheOptions,
    // Oldest entry first; a refreshed entry moves to the back.
    entries: RwLock<IndexMap<Fingerprint, CacheEntry>>,
    total_bytes: AtomicU64,
    gc_running: AtomicBool,
    executor: Executor,
    save_success: AtomicU64,
    save_failure: AtomicU64,
    lookup_hit: AtomicU64,
    lookup_miss: AtomicU64,
    gc_count: AtomicU64,
    gc_removed_items: AtomicU64,
    gc_removed_bytes: AtomicU64,
}

impl LocalOutputCache {
    ///
    /// Opens the cache at `cache_dir`, enumerating existing entry files so byte and item
    /// accounting continue across restarts.
    ///
    pub fn new(
        cache_dir: PathBuf,
        options: LocalOutputCacheOptions,
        executor: Executor,
    ) -> Result<Arc<LocalOutputCache>, String> {
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| format!("create {}: {e}", cache_dir.display()))?;

        let cache = LocalOutputCache {
            cache_dir,
            options,
            entries: RwLock::new(IndexMap::new()),
            total_bytes: AtomicU64::new(0),
            gc_running: AtomicBool::new(false),
            executor,
            save_success: AtomicU64::new(0),
            save_failure: AtomicU64::new(0),
            lookup_hit: AtomicU64::new(0),
            lookup_miss: AtomicU64::new(0),
            gc_count: AtomicU64::new(0),
            gc_removed_items: AtomicU64::new(0),
            gc_removed_bytes: AtomicU64::new(0),
        };
        cache.load_entries();
        Ok(Arc::new(cache))
    }

    ///
    /// Saves `result` under `key`. Returns false (and logs) on failure: a failed save never
    /// fails the compile.
    ///
    pub fn save_output(self: &Arc<LocalOutputCache>, key: &Fingerprint, result: &CachedCompileResult) -> bool {
        let bytes = match bincode::serialize(result) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to serialize cache entry {key}: {err}");
                self.save_failure.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let path = self.entry_path(key);
        if let Err(err) = write_atomically(&path, &bytes) {
            warn!("failed to write cache entry {key}: {err}");
            self.save_failure.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let amount = bytes.len() as u64;
        {
            let mut entries = self.entries.write();
            if let Some(previous) = entries.shift_remove(key) {
                self.total_bytes
                    .fetch_sub(previous.amount_bytes, Ordering::Relaxed);
            }
            entries.insert(
                *key,
                CacheEntry {
                    mtime: SystemTime::now(),
                    amount_bytes: amount,
                },
            );
        }
        self.total_bytes.fetch_add(amount, Ordering::Relaxed);
        self.save_success.fetch_add(1, Ordering::Relaxed);

        self.maybe_start_gc();
        true
    }

    ///
    /// Returns the cached result for `key`, refreshing its position in eviction order.
    ///
    pub fn lookup(&self, key: &Fingerprint) -> Option<CachedCompileResult> {
        let known = self.entries.read().contains_key(key);
        if !known {
            self.lookup_miss.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("cache entry {key} unreadable: {err}");
                self.forget(key);
                self.lookup_miss.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        match bincode::deserialize(&bytes) {
            Ok(result) => {
                self.touch(key);
                self.lookup_hit.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            Err(err) => {
                warn!("cache entry {key} corrupt, dropping: {err}");
                let _ = std::fs::remove_file(&path);
                self.forget(key);
                self.lookup_miss.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn total_cache_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn total_cache_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn stats(&self) -> LocalOutputCacheStats {
        LocalOutputCacheStats {
            save_success: self.save_success.load(Ordering::Relaxed),
            save_failure: self.save_failure.load(Ordering::Relaxed),
            lookup_hit: self.lookup_hit.load(Ordering::Relaxed),
            lookup_miss: self.lookup_miss.load(Ordering::Relaxed),
            gc_count: self.gc_count.load(Ordering::Relaxed),
            gc_removed_items: self.gc_removed_items.load(Ordering::Relaxed),
            gc_removed_bytes: self.gc_removed_bytes.load(Ordering::Relaxed),
        }
    }

    fn should_run_gc(&self) -> bool {
        self.total_bytes.load(Ordering::Relaxed) > self.options.max_bytes
            || self.entries.read().len() > self.options.max_items
    }

    fn below_thresholds(&self) -> bool {
        self.total_bytes.load(Ordering::Relaxed) <= self.options.threshold_bytes
            && self.entries.read().len() <= self.options.threshold_items
    }

    fn maybe_start_gc(self: &Arc<LocalOutputCache>) {
        if !self.should_run_gc() {
            return;
        }
        if self.gc_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = self.clone();
        self.executor.spawn(async move {
            cache.run_garbage_collection();
            cache.gc_running.store(false, Ordering::SeqCst);
        });
    }

    ///
    /// Deletes oldest entries until both byte and item counts sit at or below their low-water
    /// marks. Runs on the GC worker; safe to call directly in tests.
    ///
    pub fn run_garbage_collection(&self) {
        self.gc_count.fetch_add(1, Ordering::Relaxed);
        let mut removed_items = 0_u64;
        let mut removed_bytes = 0_u64;

        while !self.below_thresholds() {
            let oldest = {
                let mut entries = self.entries.write();
                entries.shift_remove_index(0)
            };
            let Some((key, entry)) = oldest else {
                break;
            };
            // A missing file still frees its accounting.
            let _ = std::fs::remove_file(self.entry_path(&key));
            self.total_bytes
                .fetch_sub(entry.amount_bytes, Ordering::Relaxed);
            removed_items += 1;
            removed_bytes += entry.amount_bytes;
        }

        self.gc_removed_items
            .fetch_add(removed_items, Ordering::Relaxed);
        self.gc_removed_bytes
            .fetch_add(removed_bytes, Ordering::Relaxed);
        info!("local output cache gc: removed {removed_items} entries, {removed_bytes} bytes");
    }

    fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        let hex = key.to_hex();
        self.cache_dir.join(&hex[0..2]).join(hex)
    }

    fn touch(&self, key: &Fingerprint) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.shift_remove(key) {
            entries.insert(*key, entry);
        }
    }

    fn forget(&self, key: &Fingerprint) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.shift_remove(key) {
            self.total_bytes
                .fetch_sub(entry.amount_bytes, Ordering::Relaxed);
        }
    }

    fn load_entries(&self) {
        let mut loaded: Vec<(Fingerprint, CacheEntry)> = Vec::new();
        let Ok(fanout_dirs) = std::fs::read_dir(&self.cache_dir) else {
            return;
        };
        for fanout in fanout_dirs.flatten() {
            let Ok(files) = std::fs::read_dir(fanout.path()) else {
                continue;
            };
            for file in files.flatten() {
                let name = file.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let Ok(key) = Fingerprint::from_hex_string(name) else {
                    debug!("ignoring foreign file in cache dir: {name}");
                    continue;
                };
                let Ok(metadata) = file.metadata() else {
                    continue;
                };
                loaded.push((
                    key,
                    CacheEntry {
                        mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
                        amount_bytes: metadata.len(),
                    },
                ));
            }
        }

        loaded.sort_by_key(|(_, entry)| entry.mtime);
        let mut total = 0_u64;
        let mut entries = self.entries.write();
        for (key, entry) in loaded {
            total += entry.amount_bytes;
            entries.insert(key, entry);
        }
        drop(entries);
        self.total_bytes.store(total, Ordering::Relaxed);
        info!(
            "local output cache: loaded {} entries, {total} bytes",
            self.entries.read().len()
        );
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("no parent for {}", path.display()))?;
    std::fs::create_dir_all(parent).map_err(|e| format!("create {}: {e}", parent.display()))?;
    let mut temp =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| format!("temp file: {e}"))?;
    std::io::Write::write_all(&mut temp, bytes).map_err(|e| format!("write: {e}"))?;
    temp.persist(path).map_err(|e| format!("rename: {e}"))?;
    Ok(())
}
