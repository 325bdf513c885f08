// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::FileStat;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

///
/// A bounded cache of directory listings keyed by directory path, validated by the directory's
/// own stat. The include-file finder hits the same handful of include roots for every header in
/// a translation unit; this keeps that from being one readdir per lookup.
///
pub struct ListDirCache {
    max_entries: usize,
    // Oldest entry first; refreshed entries move to the back.
    entries: RwLock<IndexMap<PathBuf, (FileStat, Vec<DirEntry>)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ListDirCache {
    pub fn new(max_entries: usize) -> ListDirCache {
        ListDirCache {
            max_entries,
            entries: RwLock::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    ///
    /// Returns the entries of directory `path`, or None if `path` is not a directory.
    /// `stat` must be the caller's current stat of `path`; it decides cache freshness.
    ///
    pub fn get_dir_entries(&self, path: &Path, stat: &FileStat) -> Option<Vec<DirEntry>> {
        if !stat.is_directory {
            return None;
        }

        {
            let entries = self.entries.read();
            if let Some((cached_stat, cached)) = entries.get(path) {
                if cached_stat == stat {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(cached.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let listed = list_directory(path)?;
        // A listing taken while the directory may still be mutating within the current timestamp
        // tick is returned but never cached.
        if !stat.can_be_stale() {
            let mut entries = self.entries.write();
            entries.shift_remove(path);
            entries.insert(path.to_path_buf(), (stat.clone(), listed.clone()));
            while entries.len() > self.max_entries {
                entries.shift_remove_index(0);
            }
        }
        Some(listed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

fn list_directory(path: &Path) -> Option<Vec<DirEntry>> {
    let read_dir = std::fs::read_dir(path).ok()?;
    let mut listed = Vec::new();
    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_directory = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        listed.push(DirEntry { name, is_directory });
    }
    listed.sort_by(|a, b| a.name.cmp(&b.name));
    Some(listed)
}
