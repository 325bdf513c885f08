// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The file-hash cache: local path → last known content hash, with the upload bookkeeping that
//! lets a compile trust a hash taken inside the mtime granularity window. A separate set of
//! "known" hash keys records which blobs the remote service has confirmed holding.


use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use hashing::Fingerprint;
use parking_lot::RwLock;

use fs::{FileStat, STAT_STALE_WINDOW};

#[derive(Clone, Debug)]
struct FileInfo {
    hash_key: Fingerprint,
    file_stat: FileStat,
    /// When the file's bytes last went to (or came from) the remote service.
    last_uploaded: Option<SystemTime>,
}

///
/// The answer to a cache-key lookup: the hash if one is known, and whether the caller may use it
/// without re-hashing the file.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKeyLookup {
    Unknown,
    /// The stat moved (or sits inside the granularity window without upload cover); the hash is
    /// returned as a guess the caller must verify.
    Unconfirmed(Fingerprint),
    Confirmed(Fingerprint),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileHashCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
}

pub struct FileHashCache {
    file_cache: RwLock<HashMap<PathBuf, FileInfo>>,
    known_hash_keys: RwLock<HashSet<Fingerprint>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
}

impl FileHashCache {
    pub fn new() -> FileHashCache {
        FileHashCache {
            file_cache: RwLock::new(HashMap::new()),
            known_hash_keys: RwLock::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    ///
    /// Looks up the cache key for `path`, whose current stat is `file_stat`.
    ///
    /// The interesting case is a stat whose mtime matches the recorded one only to within the
    /// filesystem's timestamp granularity: the file may have been rewritten in the same tick.
    /// If the server reported the blob missing at `missed_at` and we uploaded at or after that
    /// time, the recorded hash is still what the server holds, so it can be trusted; otherwise
    /// the hash is returned unconfirmed and the caller must re-hash.
    ///
    pub fn get_file_cache_key(
        &self,
        path: &Path,
        missed_at: Option<SystemTime>,
        file_stat: &FileStat,
    ) -> CacheKeyLookup {
        let info = {
            let cache = self.file_cache.read();
            match cache.get(path) {
                Some(info) => info.clone(),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return CacheKeyLookup::Unknown;
                }
            }
        };

        if info.file_stat == *file_stat {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return CacheKeyLookup::Confirmed(info.hash_key);
        }

        if mtime_within_one_tick(&info.file_stat, file_stat) {
            if let (Some(missed_at), Some(last_uploaded)) = (missed_at, info.last_uploaded) {
                if missed_at <= last_uploaded {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return CacheKeyLookup::Confirmed(info.hash_key);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheKeyLookup::Unconfirmed(info.hash_key)
    }

    ///
    /// Records the hash of `path`. An invalid `file_stat` invalidates the entry instead. The
    /// upload timestamp only moves forward; storing without one preserves the previous value.
    ///
    /// Returns true when `hash_key` had never been seen by this process before, meaning the blob
    /// may be new to the remote service as well.
    ///
    pub fn store_file_cache_key(
        &self,
        path: &Path,
        hash_key: Fingerprint,
        upload_time: Option<SystemTime>,
        file_stat: &FileStat,
    ) -> bool {
        if !file_stat.is_valid() {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            self.file_cache.write().remove(path);
            return false;
        }

        self.stores.fetch_add(1, Ordering::Relaxed);
        {
            let mut cache = self.file_cache.write();
            let previous_upload = cache.get(path).and_then(|info| info.last_uploaded);
            let last_uploaded = match (upload_time, previous_upload) {
                (Some(new), Some(old)) => Some(new.max(old)),
                (Some(new), None) => Some(new),
                (None, old) => old,
            };
            cache.insert(
                path.to_path_buf(),
                FileInfo {
                    hash_key,
                    file_stat: file_stat.clone(),
                    last_uploaded,
                },
            );
        }

        self.known_hash_keys.write().insert(hash_key)
    }

    /// True when some file with this hash has passed through this process, so the remote service
    /// probably holds the blob.
    pub fn is_known_hash_key(&self, hash_key: &Fingerprint) -> bool {
        self.known_hash_keys.read().contains(hash_key)
    }

    pub fn stats(&self) -> FileHashCacheStats {
        FileHashCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// True when the two stats' mtimes agree to within one coarse filesystem tick, the window in
/// which a rewrite can hide from stat comparison.
fn mtime_within_one_tick(recorded: &FileStat, current: &FileStat) -> bool {
    match (recorded.mtime, current.mtime) {
        (Some(recorded), Some(current)) => {
            let difference = match current.duration_since(recorded) {
                Ok(d) => d,
                Err(e) => e.duration(),
            };
            difference <= STAT_STALE_WINDOW
        }
        _ => false,
    }
}
