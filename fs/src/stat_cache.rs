// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::FileStat;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatCacheStats {
    pub hits: u64,
    pub misses: u64,
}

///
/// Process-wide memoization of filesystem stats, shared by every compile task.
///
/// Only valid, non-directory stats are retained: directories are cheap to re-stat and their
/// entries are what callers actually care about, while invalid stats would pin "file absent"
/// forever.
///
pub struct GlobalFileStatCache {
    file_stats: RwLock<HashMap<PathBuf, FileStat>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GlobalFileStatCache {
    pub fn new() -> GlobalFileStatCache {
        GlobalFileStatCache {
            file_stats: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, path: &Path) -> FileStat {
        if let Some(stat) = self.file_stats.read().get(path) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return stat.clone();
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let stat = FileStat::of_path(path);
        if stat.is_valid() && !stat.is_directory && !stat.can_be_stale() {
            self.file_stats
                .write()
                .insert(path.to_path_buf(), stat.clone());
        }
        stat
    }

    pub fn stats(&self) -> StatCacheStats {
        StatCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

///
/// Per-task stat memoization. Not thread-safe: each compile task owns one, and ownership moves
/// with the task between workers. Falls through to the process-wide tier on miss.
///
pub struct FileStatCache {
    global: Option<Arc<GlobalFileStatCache>>,
    file_stats: HashMap<PathBuf, FileStat>,
}

impl FileStatCache {
    pub fn new(global: Option<Arc<GlobalFileStatCache>>) -> FileStatCache {
        FileStatCache {
            global,
            file_stats: HashMap::new(),
        }
    }

    pub fn get(&mut self, path: &Path) -> FileStat {
        if let Some(stat) = self.file_stats.get(path) {
            return stat.clone();
        }

        let stat = match self.global {
            Some(ref global) => global.get(path),
            None => FileStat::of_path(path),
        };
        // Invalid stats are cached here (a header that is absent stays absent for the duration of
        // one compile), but a valid-yet-possibly-stale stat must not enter any tier.
        if !stat.is_valid() || !stat.can_be_stale() {
            self.file_stats.insert(path.to_path_buf(), stat.clone());
        }
        stat
    }

    pub fn clear(&mut self) {
        self.file_stats.clear();
    }
}
