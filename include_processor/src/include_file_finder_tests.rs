// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::PathBuf;

use fs::{FileStatCache, ListDirCache};

use crate::include_file_finder::{
    IncludeFileFinder, IncludeSearchPaths, CURRENT_DIR_INDEX, GCH_SUFFIX,
};

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    stat_cache: FileStatCache,
    list_dir_cache: ListDirCache,
}

impl Fixture {
    fn new() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        Fixture {
            _dir: dir,
            root,
            stat_cache: FileStatCache::new(None),
            list_dir_cache: ListDirCache::new(64),
        }
    }

    fn write(&self, relative: &str, bytes: &[u8]) -> PathBuf {
        let path = self.root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn finder(&self, quote: &[&str], bracket: &[&str], gch: bool) -> IncludeFileFinder {
        let search = IncludeSearchPaths::new(
            quote.iter().map(|d| self.root.join(d)).collect(),
            bracket.iter().map(|d| self.root.join(d)).collect(),
            Vec::new(),
        );
        IncludeFileFinder::new(self.root.clone(), false, gch, search)
    }
}

#[test]
fn absolute_include_skips_search_paths() {
    let mut fixture = Fixture::new();
    let target = fixture.write("somewhere/deep/a.h", b"");

    let mut finder = fixture.finder(&[], &["unrelated"], false);
    let absolute = target.to_str().unwrap();
    let (found, index) = finder
        .lookup(
            absolute,
            false,
            None,
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(found, target);
    assert_eq!(index, CURRENT_DIR_INDEX);
}

#[test]
fn quote_include_prefers_current_directory() {
    let mut fixture = Fixture::new();
    fixture.write("src/a.h", b"current");
    fixture.write("include/a.h", b"root");

    let mut finder = fixture.finder(&[], &["include"], false);
    let current_dir = fixture.root.join("src");
    let (found, index) = finder
        .lookup(
            "a.h",
            true,
            Some(&current_dir),
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(found, fixture.root.join("src/a.h"));
    assert_eq!(index, CURRENT_DIR_INDEX);
}

#[test]
fn bracket_include_skips_quote_roots() {
    let mut fixture = Fixture::new();
    fixture.write("iquote/a.h", b"");
    fixture.write("sys/a.h", b"");

    let mut finder = fixture.finder(&["iquote"], &["sys"], false);
    let (found, index) = finder
        .lookup(
            "a.h",
            false,
            None,
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(found, fixture.root.join("sys/a.h"));
    assert_eq!(index, 2);

    // The quote chain sees the earlier root.
    let (found, index) = finder
        .lookup(
            "a.h",
            true,
            None,
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(found, fixture.root.join("iquote/a.h"));
    assert_eq!(index, 1);
}

#[test]
fn search_order_is_first_root_wins() {
    let mut fixture = Fixture::new();
    fixture.write("one/a.h", b"");
    fixture.write("two/a.h", b"");

    let mut finder = fixture.finder(&[], &["one", "two"], false);
    let (found, index) = finder
        .lookup(
            "a.h",
            false,
            None,
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(found, fixture.root.join("one/a.h"));
    assert_eq!(index, 1);
}

#[test]
fn include_next_continues_after_originating_root() {
    let mut fixture = Fixture::new();
    fixture.write("one/a.h", b"");
    fixture.write("two/a.h", b"");

    let mut finder = fixture.finder(&[], &["one", "two"], false);
    // A file found at root index 1 issues #include_next: search starts after root 1.
    let (found, index) = finder
        .lookup(
            "a.h",
            false,
            None,
            2,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(found, fixture.root.join("two/a.h"));
    assert_eq!(index, 2);
}

#[test]
fn missing_include_is_none_without_stats() {
    let mut fixture = Fixture::new();
    fixture.write("include/real.h", b"");

    let mut finder = fixture.finder(&[], &["include"], false);
    let result = finder.lookup(
        "not_there.h",
        false,
        None,
        CURRENT_DIR_INDEX,
        &mut fixture.stat_cache,
        &fixture.list_dir_cache,
    );
    assert_eq!(result, None);
}

#[test]
fn lookup_is_deterministic() {
    let mut fixture = Fixture::new();
    fixture.write("one/sub/a.h", b"");

    let mut finder = fixture.finder(&[], &["one"], false);
    let first = finder.lookup(
        "sub/a.h",
        false,
        None,
        CURRENT_DIR_INDEX,
        &mut fixture.stat_cache,
        &fixture.list_dir_cache,
    );
    let second = finder.lookup(
        "sub/a.h",
        false,
        None,
        CURRENT_DIR_INDEX,
        &mut fixture.stat_cache,
        &fixture.list_dir_cache,
    );
    assert_eq!(first, second);
    assert!(first.is_some());
}

#[test]
fn gch_substitution_wins_when_enabled() {
    let mut fixture = Fixture::new();
    fixture.write("include/pre.h", b"plain");
    fixture.write(&format!("include/pre.h{GCH_SUFFIX}"), b"precompiled");

    let mut finder = fixture.finder(&[], &["include"], true);
    let (found, _) = finder
        .lookup(
            "pre.h",
            false,
            None,
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(
        found,
        fixture.root.join(format!("include/pre.h{GCH_SUFFIX}"))
    );

    // Disabled: the plain header resolves.
    let mut finder = fixture.finder(&[], &["include"], false);
    let mut stat_cache = FileStatCache::new(None);
    let (found, _) = finder
        .lookup(
            "pre.h",
            false,
            None,
            CURRENT_DIR_INDEX,
            &mut stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(found, fixture.root.join("include/pre.h"));
}

#[test]
fn framework_headers_resolve() {
    let mut fixture = Fixture::new();
    fixture.write("Frameworks/Cocoa.framework/Headers/Cocoa.h", b"");

    let search = IncludeSearchPaths::new(
        Vec::new(),
        Vec::new(),
        vec![fixture.root.join("Frameworks")],
    );
    let mut finder = IncludeFileFinder::new(fixture.root.clone(), false, false, search);
    let (found, _) = finder
        .lookup(
            "Cocoa/Cocoa.h",
            false,
            None,
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(
        found,
        fixture
            .root
            .join("Frameworks/Cocoa.framework/Headers/Cocoa.h")
    );
}

#[test]
fn private_framework_headers_resolve() {
    let mut fixture = Fixture::new();
    fixture.write("Frameworks/Sec.framework/PrivateHeaders/Hidden.h", b"");

    let search = IncludeSearchPaths::new(
        Vec::new(),
        Vec::new(),
        vec![fixture.root.join("Frameworks")],
    );
    let mut finder = IncludeFileFinder::new(fixture.root.clone(), false, false, search);
    let (found, _) = finder
        .lookup(
            "Sec/Hidden.h",
            false,
            None,
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(
        found,
        fixture
            .root
            .join("Frameworks/Sec.framework/PrivateHeaders/Hidden.h")
    );
}

#[test]
fn parent_traversal_bypasses_entry_sets() {
    let mut fixture = Fixture::new();
    fixture.write("a.h", b"");
    fixture.write("include/sub/placeholder.h", b"");

    let mut finder = fixture.finder(&[], &["include/sub"], false);
    let (found, _) = finder
        .lookup(
            "../../a.h",
            false,
            None,
            CURRENT_DIR_INDEX,
            &mut fixture.stat_cache,
            &fixture.list_dir_cache,
        )
        .unwrap();
    assert_eq!(found, fixture.root.join("include/sub/../../a.h"));
}
