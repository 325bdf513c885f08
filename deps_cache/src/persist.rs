// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The on-disk image of the deps cache: a bincode-serialized snapshot written via temp file and
//! atomic rename, with a hex SHA-256 sidecar whose mismatch (or absence) invalidates the image.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use hashing::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};

use fs::FileStat;

use crate::filename_id_table::FilenameIdTable;
use crate::{DepsHashId, DepsTableEntry, BUILT_REVISION};

pub fn sidecar_path(cache_file: &Path) -> PathBuf {
    let mut name = cache_file.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

#[derive(Serialize, Deserialize)]
struct Image {
    built_revision: String,
    filenames: Vec<PathBuf>,
    entries: Vec<PersistedEntry>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    identifier: Fingerprint,
    last_used_unix_secs: u64,
    deps: Vec<PersistedDepsHashId>,
}

#[derive(Clone, Serialize, Deserialize)]
struct PersistedDepsHashId {
    filename_id: u32,
    size: u64,
    mtime_unix_nanos: Option<u128>,
    identity: Option<(u64, u64)>,
    is_directory: bool,
    directive_hash: Fingerprint,
}

impl PersistedEntry {
    pub fn from_entry(identifier: &Fingerprint, entry: &DepsTableEntry) -> PersistedEntry {
        PersistedEntry {
            identifier: *identifier,
            last_used_unix_secs: entry
                .last_used
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            deps: entry
                .deps
                .iter()
                .map(|dep| PersistedDepsHashId {
                    filename_id: dep.filename_id,
                    size: dep.file_stat.size,
                    mtime_unix_nanos: dep.file_stat.mtime.and_then(|mtime| {
                        mtime.duration_since(UNIX_EPOCH).ok().map(|d| d.as_nanos())
                    }),
                    identity: dep.file_stat.identity,
                    is_directory: dep.file_stat.is_directory,
                    directive_hash: dep.directive_hash,
                })
                .collect(),
        }
    }

    pub fn into_entry(self) -> (Fingerprint, DepsTableEntry) {
        let entry = DepsTableEntry {
            last_used: UNIX_EPOCH + Duration::from_secs(self.last_used_unix_secs),
            deps: self
                .deps
                .into_iter()
                .map(|dep| DepsHashId {
                    filename_id: dep.filename_id,
                    file_stat: FileStat {
                        size: dep.size,
                        mtime: dep.mtime_unix_nanos.map(|nanos| {
                            UNIX_EPOCH + Duration::from_nanos(nanos as u64)
                        }),
                        identity: dep.identity,
                        is_directory: dep.is_directory,
                    },
                    directive_hash: dep.directive_hash,
                })
                .collect(),
        };
        (self.identifier, entry)
    }
}

pub fn save_image(
    cache_file: &Path,
    filename_id_table: &FilenameIdTable,
    entries: &[PersistedEntry],
) -> Result<(), String> {
    let image = Image {
        built_revision: BUILT_REVISION.to_string(),
        filenames: filename_id_table.snapshot(),
        entries: entries.to_vec(),
    };
    let bytes = bincode::serialize(&image).map_err(|e| format!("serialize: {e}"))?;

    let parent = cache_file
        .parent()
        .ok_or_else(|| format!("no parent directory for {}", cache_file.display()))?;
    std::fs::create_dir_all(parent).map_err(|e| format!("create {}: {e}", parent.display()))?;

    write_atomically(cache_file, &bytes)?;
    let digest_hex = Digest::of_bytes(&bytes).hash.to_hex();
    write_atomically(&sidecar_path(cache_file), digest_hex.as_bytes())?;
    Ok(())
}

pub fn load_image(
    cache_file: &Path,
    max_image_bytes: usize,
) -> Result<(Vec<PathBuf>, Vec<PersistedEntry>), String> {
    let bytes = std::fs::read(cache_file).map_err(|e| format!("read image: {e}"))?;
    if bytes.len() > max_image_bytes {
        return Err(format!(
            "image too large: {} > {max_image_bytes} bytes",
            bytes.len()
        ));
    }

    let sidecar =
        std::fs::read_to_string(sidecar_path(cache_file)).map_err(|e| format!("read sidecar: {e}"))?;
    let expected = Fingerprint::from_hex_string(sidecar.trim())
        .map_err(|e| format!("parse sidecar: {e}"))?;
    let actual = Digest::of_bytes(&bytes).hash;
    if expected != actual {
        return Err("integrity hash mismatch".to_string());
    }

    let image: Image = bincode::deserialize(&bytes).map_err(|e| format!("deserialize: {e}"))?;
    if image.built_revision != BUILT_REVISION {
        return Err(format!(
            "built revision mismatch: image {} vs binary {BUILT_REVISION}",
            image.built_revision
        ));
    }
    Ok((image.filenames, image.entries))
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("no parent directory for {}", path.display()))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| format!("create temp file: {e}"))?;
    std::io::Write::write_all(&mut temp, bytes).map_err(|e| format!("write temp file: {e}"))?;
    temp.persist(path)
        .map_err(|e| format!("rename into {}: {e}", path.display()))?;
    Ok(())
}
