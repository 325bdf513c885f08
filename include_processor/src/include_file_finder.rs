// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Resolution of one include operand against the ordered search roots of a compile: quote and
//! bracket chains, header maps, framework directories, and the precompiled-header substitution.
//! Resolution is deterministic: the same operand against unchanged roots always yields the same
//! (path, root index) pair, which is what lets `#include_next` and the deps cache rely on it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use fs::{FileStatCache, ListDirCache};

use crate::hmap::read_header_map;

/// Substitute suffix for precompiled headers: looking up `foo.h` finds `foo.h.gch.goma` when the
/// build has produced one and the hack is enabled.
pub const GCH_SUFFIX: &str = ".gch.goma";

/// Root index reported for hits that did not come from the search path: absolute includes and
/// current-directory quote hits. Directory roots report 1-based positions after it.
pub const CURRENT_DIR_INDEX: usize = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncludeDirKind {
    Directory,
    HeaderMap,
}

#[derive(Clone, Debug)]
pub struct IncludeDir {
    pub path: PathBuf,
    pub kind: IncludeDirKind,
}

impl IncludeDir {
    pub fn new(path: PathBuf) -> IncludeDir {
        let kind = if path.extension().map(|e| e == "hmap").unwrap_or(false) {
            IncludeDirKind::HeaderMap
        } else {
            IncludeDirKind::Directory
        };
        IncludeDir { path, kind }
    }
}

///
/// The ordered include roots of one compile. The quote chain (`#include "x"`) starts at index 0
/// (the `-iquote` roots); the bracket chain (`#include <x>`) starts at `bracket_index`.
/// Framework roots come after all directory roots for root-index purposes.
///
#[derive(Clone, Debug, Default)]
pub struct IncludeSearchPaths {
    pub dirs: Vec<IncludeDir>,
    pub bracket_index: usize,
    pub framework_dirs: Vec<PathBuf>,
}

impl IncludeSearchPaths {
    pub fn new(
        quote_dirs: Vec<PathBuf>,
        bracket_dirs: Vec<PathBuf>,
        framework_dirs: Vec<PathBuf>,
    ) -> IncludeSearchPaths {
        let bracket_index = quote_dirs.len();
        let dirs = quote_dirs
            .into_iter()
            .chain(bracket_dirs)
            .map(IncludeDir::new)
            .collect();
        IncludeSearchPaths {
            dirs,
            bracket_index,
            framework_dirs,
        }
    }
}

pub struct IncludeFileFinder {
    cwd: PathBuf,
    ignore_case: bool,
    gch_hack: bool,
    search: IncludeSearchPaths,
    // Memoized per-root entry name sets; an entry set of None means the root is not listable.
    entry_sets: Vec<Option<Option<HashSet<String>>>>,
    hmaps: Vec<Option<Option<HashMap<String, String>>>>,
    // (operand, effective start index, is quote) -> result.
    lookup_cache: HashMap<(String, usize, bool), Option<(PathBuf, usize)>>,
}

impl IncludeFileFinder {
    pub fn new(
        cwd: PathBuf,
        ignore_case: bool,
        gch_hack: bool,
        search: IncludeSearchPaths,
    ) -> IncludeFileFinder {
        let dir_count = search.dirs.len();
        IncludeFileFinder {
            cwd,
            ignore_case,
            gch_hack,
            search,
            entry_sets: vec![None; dir_count],
            hmaps: vec![None; dir_count],
            lookup_cache: HashMap::new(),
        }
    }

    pub fn search_paths(&self) -> &IncludeSearchPaths {
        &self.search
    }

    ///
    /// Resolves `operand` (the spelled include path, without quotes or angle brackets). For
    /// quote includes, `current_dir` is the including file's directory and is tried first.
    /// `start_index` continues a previous resolution for `#include_next` (pass the originating
    /// root index + 1); ordinary includes pass 0.
    ///
    /// Returns the resolved path and the root index it came from.
    ///
    pub fn lookup(
        &mut self,
        operand: &str,
        is_quote: bool,
        current_dir: Option<&Path>,
        start_index: usize,
        stat_cache: &mut FileStatCache,
        list_dir_cache: &ListDirCache,
    ) -> Option<(PathBuf, usize)> {
        let operand_path = Path::new(operand);
        if operand_path.is_absolute() {
            let found = self.stat_candidate(operand_path, stat_cache)?;
            return Some((found, CURRENT_DIR_INDEX));
        }

        if is_quote && start_index == CURRENT_DIR_INDEX {
            if let Some(dir) = current_dir {
                if let Some(found) = self.stat_candidate(&dir.join(operand_path), stat_cache) {
                    return Some((found, CURRENT_DIR_INDEX));
                }
            }
        }

        let chain_start = if is_quote { 0 } else { self.search.bracket_index };
        let first = chain_start.max(start_index.saturating_sub(1));

        let cache_key = (operand.to_string(), first, is_quote);
        if let Some(cached) = self.lookup_cache.get(&cache_key) {
            return cached.clone();
        }

        let mut result = self.walk_search_path(operand, first, stat_cache, list_dir_cache);
        if result.is_none() {
            result = self.lookup_framework(operand, stat_cache);
        }
        if result.is_none() {
            if let Some(dir) = current_dir {
                result = self.lookup_subframework(operand, dir, stat_cache);
            }
        }
        self.lookup_cache.insert(cache_key, result.clone());
        result
    }

    fn walk_search_path(
        &mut self,
        operand: &str,
        first: usize,
        stat_cache: &mut FileStatCache,
        list_dir_cache: &ListDirCache,
    ) -> Option<(PathBuf, usize)> {
        for index in first..self.search.dirs.len() {
            match self.search.dirs[index].kind {
                IncludeDirKind::HeaderMap => {
                    if let Some(mapped) = self.hmap_lookup(index, operand) {
                        // A key hit is final: the mapped path is the candidate, with no further
                        // search even if it does not exist.
                        let candidate = self.cwd.join(mapped);
                        return self
                            .stat_candidate(&candidate, stat_cache)
                            .map(|found| (found, index + 1));
                    }
                }
                IncludeDirKind::Directory => {
                    if self.root_might_contain(index, operand, stat_cache, list_dir_cache) {
                        let dir = self.search.dirs[index].path.clone();
                        let candidate = self.cwd.join(dir).join(operand);
                        if let Some(found) = self.stat_candidate(&candidate, stat_cache) {
                            return Some((found, index + 1));
                        }
                    }
                }
            }
        }
        None
    }

    ///
    /// Consults the memoized entry set of root `index` by the operand's top path component, so
    /// that includes which cannot exist under a root are skipped without a stat call.
    ///
    fn root_might_contain(
        &mut self,
        index: usize,
        operand: &str,
        stat_cache: &mut FileStatCache,
        list_dir_cache: &ListDirCache,
    ) -> bool {
        let top = top_path_component(operand, self.ignore_case);
        // Relative traversal cannot be answered from the entry set.
        if top == ".." || top == "." {
            return true;
        }

        if self.entry_sets[index].is_none() {
            let dir = self.cwd.join(&self.search.dirs[index].path);
            let stat = stat_cache.get(&dir);
            let set = list_dir_cache.get_dir_entries(&dir, &stat).map(|entries| {
                entries
                    .into_iter()
                    .map(|entry| {
                        if self.ignore_case {
                            entry.name.to_lowercase()
                        } else {
                            entry.name
                        }
                    })
                    .collect::<HashSet<String>>()
            });
            self.entry_sets[index] = Some(set);
        }

        match self.entry_sets[index].as_ref().unwrap_or(&None) {
            Some(set) => set.contains(&top),
            // Unlistable roots fall back to plain stat probing.
            None => true,
        }
    }

    fn hmap_lookup(&mut self, index: usize, operand: &str) -> Option<String> {
        if self.hmaps[index].is_none() {
            let path = self.cwd.join(&self.search.dirs[index].path);
            let ignore_case = self.ignore_case;
            let map = read_header_map(&path).map(|entries| {
                entries
                    .into_iter()
                    .map(|(key, value)| {
                        let key = if ignore_case { key.to_lowercase() } else { key };
                        (key, value)
                    })
                    .collect::<HashMap<String, String>>()
            });
            self.hmaps[index] = Some(map);
        }

        let key = if self.ignore_case {
            operand.to_lowercase()
        } else {
            operand.to_string()
        };
        self.hmaps[index]
            .as_ref()
            .and_then(|map| map.as_ref())
            .and_then(|map| map.get(&key).cloned())
    }

    ///
    /// `<Name/rest.h>` may resolve under `Name.framework/Headers/rest.h` (or PrivateHeaders) in
    /// any framework root.
    ///
    fn lookup_framework(
        &mut self,
        operand: &str,
        stat_cache: &mut FileStatCache,
    ) -> Option<(PathBuf, usize)> {
        let (framework_name, rest) = operand.split_once('/')?;
        let base_index = self.search.dirs.len();
        let framework_dirs = self.search.framework_dirs.clone();

        for (offset, framework_dir) in framework_dirs.iter().enumerate() {
            let framework = self
                .cwd
                .join(framework_dir)
                .join(format!("{framework_name}.framework"));
            for headers in ["Headers", "PrivateHeaders"] {
                let candidate = framework.join(headers).join(rest);
                if let Some(found) = self.stat_candidate(&candidate, stat_cache) {
                    return Some((found, base_index + offset + 1));
                }
            }
        }
        None
    }

    ///
    /// When the including file itself lives inside a framework, `<Sibling/hdr.h>` can refer to a
    /// sibling framework under the same `Frameworks/` directory.
    ///
    fn lookup_subframework(
        &mut self,
        operand: &str,
        current_dir: &Path,
        stat_cache: &mut FileStatCache,
    ) -> Option<(PathBuf, usize)> {
        let (framework_name, rest) = operand.split_once('/')?;
        let framework_dirs = self.search.framework_dirs.clone();
        for framework_dir in &framework_dirs {
            let root = self.cwd.join(framework_dir);
            if !current_dir.starts_with(&root) {
                continue;
            }
            // The directory directly below the framework root names the enclosing framework.
            let relative = current_dir.strip_prefix(&root).ok()?;
            let enclosing = relative.components().next()?;
            let candidate = root
                .join(enclosing)
                .join("Frameworks")
                .join(format!("{framework_name}.framework"))
                .join("Headers")
                .join(rest);
            if let Some(found) = self.stat_candidate(&candidate, stat_cache) {
                return Some((found, CURRENT_DIR_INDEX));
            }
        }
        None
    }

    ///
    /// Stats `candidate`, applying the precompiled-header substitution first when enabled.
    /// Returns the path that actually exists as a file.
    ///
    fn stat_candidate(
        &self,
        candidate: &Path,
        stat_cache: &mut FileStatCache,
    ) -> Option<PathBuf> {
        if self.gch_hack {
            let mut gch_name = candidate.as_os_str().to_owned();
            gch_name.push(GCH_SUFFIX);
            let gch_path = PathBuf::from(gch_name);
            let stat = stat_cache.get(&gch_path);
            if stat.is_valid() && !stat.is_directory {
                return Some(gch_path);
            }
        }
        let stat = stat_cache.get(candidate);
        if stat.is_valid() && !stat.is_directory {
            Some(candidate.to_path_buf())
        } else {
            None
        }
    }
}

///
/// The first path component of an include operand, used to key the per-root entry sets:
/// `foo/bar.h` → `foo`, `bar.h` → `bar.h`, `hoge\fuga.h` → `hoge`.
///
pub fn top_path_component(operand: &str, ignore_case: bool) -> String {
    let end = operand
        .find(|c| c == '/' || c == '\\')
        .unwrap_or(operand.len());
    let top = &operand[..end];
    if ignore_case {
        top.to_lowercase()
    } else {
        top.to_string()
    }
}
