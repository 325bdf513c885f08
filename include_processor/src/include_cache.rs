// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use hashing::{Digest, Fingerprint};
use indexmap::IndexMap;
use log::debug;
use parking_lot::RwLock;

use fs::{Content, FileStat};

use crate::directive::IncludeItem;
use crate::directive_filter::filtered_content;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IncludeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub updated: u64,
    pub evicted: u64,
    pub original_size_total: u64,
    pub filtered_size_total: u64,
}

struct Item {
    include_item: IncludeItem,
    file_stat: FileStat,
    directive_hash: Fingerprint,
}

///
/// A process-wide cache of parsed directive lists keyed by path, validated by stat equality.
///
/// The cache is authoritative: every consumer of a header's directives goes through here, so a
/// header shared by hundreds of compiles is read, filtered and parsed once per edit rather than
/// once per compile. The stored `DirectiveList` is handed out by shared handle, never copied.
///
/// Between the "stat unchanged" check and use, the file may be rewritten within the same mtime
/// tick; that race is accepted, because stats taken inside the stale window never enter the
/// stat caches that feed this one.
///
pub struct IncludeCache {
    max_entries: usize,
    // Oldest entry first.
    items: RwLock<IndexMap<PathBuf, Item>>,
    hits: AtomicU64,
    misses: AtomicU64,
    updated: AtomicU64,
    evicted: AtomicU64,
    original_size_total: AtomicU64,
    filtered_size_total: AtomicU64,
}

impl IncludeCache {
    pub fn new(max_entries: usize) -> IncludeCache {
        IncludeCache {
            max_entries,
            items: RwLock::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            original_size_total: AtomicU64::new(0),
            filtered_size_total: AtomicU64::new(0),
        }
    }

    ///
    /// Returns the parsed directives of `path`, reusing the cached parse when the recorded stat
    /// equals `file_stat`. Returns None when the file cannot be read.
    ///
    pub fn get_include_item(&self, path: &Path, file_stat: &FileStat) -> Option<IncludeItem> {
        {
            let items = self.items.read();
            if let Some(item) = items.get(path) {
                if item.file_stat == *file_stat {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(item.include_item.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.parse_and_insert(path, file_stat)
            .map(|item| item.include_item)
    }

    ///
    /// Returns the SHA-256 of `path`'s filtered directive bytes under the same freshness rule.
    ///
    pub fn get_directive_hash(&self, path: &Path, file_stat: &FileStat) -> Option<Fingerprint> {
        {
            let items = self.items.read();
            if let Some(item) = items.get(path) {
                if item.file_stat == *file_stat {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(item.directive_hash);
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.parse_and_insert(path, file_stat)
            .map(|item| item.directive_hash)
    }

    fn parse_and_insert(&self, path: &Path, file_stat: &FileStat) -> Option<Item> {
        let content = match Content::from_file(path) {
            Ok(content) => content,
            Err(err) => {
                debug!("failed to read {path:?}: {err}");
                return None;
            }
        };
        let filtered = filtered_content(&content);
        let include_item = IncludeItem::parse(&filtered);
        let directive_hash = Digest::of_bytes(filtered.as_bytes()).hash;

        self.original_size_total
            .fetch_add(content.len() as u64, Ordering::Relaxed);
        self.filtered_size_total
            .fetch_add(filtered.len() as u64, Ordering::Relaxed);

        let item = Item {
            include_item: include_item.clone(),
            file_stat: file_stat.clone(),
            directive_hash,
        };

        {
            let mut items = self.items.write();
            if items.shift_remove(path).is_some() {
                self.updated.fetch_add(1, Ordering::Relaxed);
            }
            items.insert(path.to_path_buf(), item);
            while items.len() > self.max_entries {
                items.shift_remove_index(0);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }

        Some(Item {
            include_item,
            file_stat: file_stat.clone(),
            directive_hash,
        })
    }

    pub fn stats(&self) -> IncludeCacheStats {
        IncludeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            original_size_total: self.original_size_total.load(Ordering::Relaxed),
            filtered_size_total: self.filtered_size_total.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }
}
