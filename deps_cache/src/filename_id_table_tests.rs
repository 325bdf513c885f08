// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};

use crate::filename_id_table::FilenameIdTable;

#[test]
fn insert_is_idempotent() {
    let table = FilenameIdTable::new();
    let first = table.insert(Path::new("/usr/include/stdio.h"));
    let second = table.insert(Path::new("/usr/include/stdio.h"));
    assert_eq!(first, second);
    assert_eq!(table.len(), 1);
}

#[test]
fn ids_are_dense_and_bijective() {
    let table = FilenameIdTable::new();
    let a = table.insert(Path::new("/a.h"));
    let b = table.insert(Path::new("/b.h"));
    assert_ne!(a, b);
    assert_eq!(table.lookup(a), Some(PathBuf::from("/a.h")));
    assert_eq!(table.lookup(b), Some(PathBuf::from("/b.h")));
    assert_eq!(table.get(Path::new("/a.h")), Some(a));
    assert_eq!(table.lookup(999), None);
}

#[test]
fn reset_preserves_positions() {
    let table = FilenameIdTable::new();
    table.insert(Path::new("/old.h"));

    table.reset(vec![PathBuf::from("/x.h"), PathBuf::from("/y.h")]);
    assert_eq!(table.lookup(0), Some(PathBuf::from("/x.h")));
    assert_eq!(table.get(Path::new("/y.h")), Some(1));
    assert_eq!(table.get(Path::new("/old.h")), None);

    // New inserts continue after the loaded entries.
    assert_eq!(table.insert(Path::new("/z.h")), 2);
}
