// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The deps cache: a persistent map from a compile-command fingerprint to the exact set of
//! headers that command required last time. A hit skips the include processor entirely; validity
//! is established per header by stat equality, falling back to directive-hash equality, so
//! content-neutral edits (comments, code) do not invalidate an entry.

mod filename_id_table;
#[cfg(test)]
mod filename_id_table_tests;
mod persist;

pub use crate::filename_id_table::{FilenameId, FilenameIdTable};

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use hashing::Fingerprint;
use include_processor::IncludeCache;
use log::{info, warn};
use parking_lot::RwLock;

use fs::{FileStat, FileStatCache};

use crate::persist::{load_image, save_image, PersistedEntry};

/// Gates forward compatibility of the persisted image: a mismatch discards the whole cache.
pub const BUILT_REVISION: &str = env!("CARGO_PKG_VERSION");

///
/// Validation record for one header: either its stat is unchanged, or its directive hash is.
///
#[derive(Clone, Debug)]
pub struct DepsHashId {
    pub filename_id: FilenameId,
    pub file_stat: FileStat,
    pub directive_hash: Fingerprint,
}

#[derive(Clone, Debug)]
struct DepsTableEntry {
    last_used: SystemTime,
    deps: Vec<DepsHashId>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DepsCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub misses_by_updated_file: u64,
}

pub struct DepsCacheOptions {
    /// Entries unused for longer than this are dropped at save time. None keeps them forever.
    pub alive_duration: Option<Duration>,
    /// At save time the table is capped to this many most-recently-used entries.
    pub table_size_threshold: usize,
    /// A persisted image larger than this is rejected (and the cache starts cold).
    pub max_image_bytes: usize,
}

impl Default for DepsCacheOptions {
    fn default() -> DepsCacheOptions {
        DepsCacheOptions {
            alive_duration: Some(Duration::from_secs(3 * 24 * 60 * 60)),
            table_size_threshold: 65536,
            max_image_bytes: 256 * 1024 * 1024,
        }
    }
}

pub struct DepsCache {
    cache_file: Option<PathBuf>,
    options: DepsCacheOptions,
    filename_id_table: FilenameIdTable,
    deps_table: RwLock<HashMap<Fingerprint, DepsTableEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    misses_by_updated_file: AtomicU64,
}

impl DepsCache {
    ///
    /// Creates the cache, loading the persisted image from `cache_file` when one is configured.
    /// Every load failure (missing or corrupt sidecar, oversized or unreadable image, built
    /// revision mismatch) degrades to an empty cache.
    ///
    pub fn new(cache_file: Option<PathBuf>, options: DepsCacheOptions) -> DepsCache {
        let cache = DepsCache {
            cache_file,
            options,
            filename_id_table: FilenameIdTable::new(),
            deps_table: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            misses_by_updated_file: AtomicU64::new(0),
        };
        cache.load();
        cache
    }

    ///
    /// Records that the compile identified by `identifier` required `deps` (plus `input_file`)
    /// last time. Every file must stat cleanly and hash cleanly or the entry is dropped whole:
    /// a partially validated entry would later produce a partially wrong header set.
    ///
    pub fn set_dependencies(
        &self,
        identifier: &Fingerprint,
        cwd: &Path,
        input_file: &Path,
        deps: &BTreeSet<PathBuf>,
        stat_cache: &mut FileStatCache,
        include_cache: &IncludeCache,
    ) -> bool {
        let mut deps_hash_ids = Vec::with_capacity(deps.len() + 1);
        let mut record = |path: &Path| -> bool {
            let absolute = join_respecting_absolute(cwd, path);
            let file_stat = stat_cache.get(&absolute);
            if !file_stat.is_valid() {
                return false;
            }
            let Some(directive_hash) = include_cache.get_directive_hash(&absolute, &file_stat)
            else {
                return false;
            };
            let filename_id = self.filename_id_table.insert(path);
            deps_hash_ids.push(DepsHashId {
                filename_id,
                file_stat,
                directive_hash,
            });
            true
        };

        if !record(input_file) {
            self.remove_dependency(identifier);
            return false;
        }
        for dep in deps {
            if !record(dep) {
                self.remove_dependency(identifier);
                return false;
            }
        }

        self.deps_table.write().insert(
            *identifier,
            DepsTableEntry {
                last_used: SystemTime::now(),
                deps: deps_hash_ids,
            },
        );
        true
    }

    ///
    /// Returns the header set recorded under `identifier` if every recorded file is still valid:
    /// stat equality first, directive-hash equality as the tiebreaker. `input_file` is excluded
    /// from the returned set.
    ///
    pub fn get_dependencies(
        &self,
        identifier: &Fingerprint,
        cwd: &Path,
        input_file: &Path,
        stat_cache: &mut FileStatCache,
        include_cache: &IncludeCache,
    ) -> Option<BTreeSet<PathBuf>> {
        let entry = {
            let table = self.deps_table.read();
            match table.get(identifier) {
                Some(entry) => entry.clone(),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        let mut deps = BTreeSet::new();
        for deps_hash_id in &entry.deps {
            let Some(filename) = self.filename_id_table.lookup(deps_hash_id.filename_id) else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            if self.is_directive_modified(&filename, deps_hash_id, cwd, stat_cache, include_cache)
            {
                self.misses_by_updated_file.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            if filename != input_file {
                deps.insert(filename);
            }
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        self.deps_table
            .write()
            .entry(*identifier)
            .and_modify(|entry| entry.last_used = SystemTime::now());
        Some(deps)
    }

    pub fn remove_dependency(&self, identifier: &Fingerprint) {
        self.deps_table.write().remove(identifier);
    }

    pub fn stats(&self) -> DepsCacheStats {
        DepsCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            misses_by_updated_file: self.misses_by_updated_file.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.deps_table.read().len()
    }

    fn is_directive_modified(
        &self,
        filename: &Path,
        recorded: &DepsHashId,
        cwd: &Path,
        stat_cache: &mut FileStatCache,
        include_cache: &IncludeCache,
    ) -> bool {
        let absolute = join_respecting_absolute(cwd, filename);
        let current_stat = stat_cache.get(&absolute);
        // Comparison is by stored value: an entry recorded while the file could still have been
        // stale is compared like any other.
        if current_stat == recorded.file_stat {
            return false;
        }
        match include_cache.get_directive_hash(&absolute, &current_stat) {
            Some(current_hash) => current_hash != recorded.directive_hash,
            None => true,
        }
    }

    ///
    /// Prunes by age and size, then writes the image via temp-file-and-rename with a `.sha256`
    /// sidecar next to it. Failure to save is logged and ignored.
    ///
    pub fn save(&self) {
        let Some(cache_file) = &self.cache_file else {
            return;
        };

        let now = SystemTime::now();
        let mut entries: Vec<(Fingerprint, DepsTableEntry)> = {
            let mut table = self.deps_table.write();
            if let Some(alive) = self.options.alive_duration {
                table.retain(|_, entry| {
                    now.duration_since(entry.last_used)
                        .map(|age| age <= alive)
                        .unwrap_or(true)
                });
            }
            table.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        if entries.len() > self.options.table_size_threshold {
            entries.sort_by_key(|(_, entry)| std::cmp::Reverse(entry.last_used));
            entries.truncate(self.options.table_size_threshold);
        }

        let persisted: Vec<PersistedEntry> = entries
            .iter()
            .map(|(identifier, entry)| PersistedEntry::from_entry(identifier, entry))
            .collect();

        match save_image(cache_file, &self.filename_id_table, &persisted) {
            Ok(()) => info!(
                "saved deps cache: {} entries to {}",
                persisted.len(),
                cache_file.display()
            ),
            Err(err) => warn!("failed to save deps cache: {err}"),
        }
    }

    fn load(&self) {
        let Some(cache_file) = &self.cache_file else {
            return;
        };
        if !cache_file.exists() {
            return;
        }
        match load_image(cache_file, self.options.max_image_bytes) {
            Ok((filenames, persisted)) => {
                self.filename_id_table.reset(filenames);
                let mut table = self.deps_table.write();
                for entry in persisted {
                    let (identifier, deps_entry) = entry.into_entry();
                    table.insert(identifier, deps_entry);
                }
                info!(
                    "loaded deps cache: {} entries from {}",
                    table.len(),
                    cache_file.display()
                );
            }
            Err(err) => {
                // Cold start beats a wrong cache: wipe whatever was on disk.
                warn!("discarding deps cache: {err}");
                let _ = std::fs::remove_file(cache_file);
                let _ = std::fs::remove_file(persist::sidecar_path(cache_file));
            }
        }
    }
}

fn join_respecting_absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
