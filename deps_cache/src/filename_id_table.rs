// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

pub type FilenameId = u32;

///
/// A bijection between paths and small integers, scoped to the deps cache so its on-disk
/// records stay compact: a header shared by thousands of entries is spelled out once.
///
pub struct FilenameIdTable {
    inner: RwLock<Inner>,
}

struct Inner {
    filenames: Vec<PathBuf>,
    ids: HashMap<PathBuf, FilenameId>,
}

impl FilenameIdTable {
    pub fn new() -> FilenameIdTable {
        FilenameIdTable {
            inner: RwLock::new(Inner {
                filenames: Vec::new(),
                ids: HashMap::new(),
            }),
        }
    }

    /// Returns the id for `path`, allocating the next one on first sight.
    pub fn insert(&self, path: &Path) -> FilenameId {
        {
            let inner = self.inner.read();
            if let Some(id) = inner.ids.get(path) {
                return *id;
            }
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.ids.get(path) {
            return *id;
        }
        let id = inner.filenames.len() as FilenameId;
        inner.filenames.push(path.to_path_buf());
        inner.ids.insert(path.to_path_buf(), id);
        id
    }

    pub fn get(&self, path: &Path) -> Option<FilenameId> {
        self.inner.read().ids.get(path).copied()
    }

    pub fn lookup(&self, id: FilenameId) -> Option<PathBuf> {
        self.inner.read().filenames.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().filenames.len()
    }

    /// Replaces the whole table, preserving ids by position. Used when loading the persisted
    /// image.
    pub fn reset(&self, filenames: Vec<PathBuf>) {
        let mut inner = self.inner.write();
        inner.ids = filenames
            .iter()
            .enumerate()
            .map(|(index, path)| (path.clone(), index as FilenameId))
            .collect();
        inner.filenames = filenames;
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.inner.read().filenames.clone()
    }
}
