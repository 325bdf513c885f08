// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod content;
mod list_dir_cache;
#[cfg(test)]
mod list_dir_cache_tests;
mod stat_cache;
#[cfg(test)]
mod stat_cache_tests;

pub use crate::content::Content;
pub use crate::list_dir_cache::{DirEntry, ListDirCache};
pub use crate::stat_cache::{FileStatCache, GlobalFileStatCache};

use std::fs::Metadata;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Filesystem timestamps are recorded with one second granularity on the filesystems we care
/// about, so any mtime within this window of "now" may still be rewritten without the stat
/// changing.
pub const STAT_STALE_WINDOW: Duration = Duration::from_secs(1);

///
/// A snapshot of the identity of one file, as cheap to compare as it is to take.
///
/// A FileStat with no mtime is invalid: it compares unequal to every other FileStat, including
/// another invalid one, so stale cache entries guarded by stat equality can never match.
///
#[derive(Clone, Debug, Default)]
pub struct FileStat {
    pub size: u64,
    pub mtime: Option<SystemTime>,
    /// (device, inode) on unix. None when the platform does not expose a cheap identity token.
    pub identity: Option<(u64, u64)>,
    pub is_directory: bool,
}

impl FileStat {
    ///
    /// Stats `path`, following symlinks. Returns an invalid FileStat (rather than an error) when
    /// the path does not exist, to mirror how callers treat unresolvable headers.
    ///
    pub fn of_path<P: AsRef<Path>>(path: P) -> FileStat {
        match std::fs::metadata(path.as_ref()) {
            Ok(metadata) => FileStat::of_metadata(&metadata),
            Err(_) => FileStat::default(),
        }
    }

    pub fn of_metadata(metadata: &Metadata) -> FileStat {
        FileStat {
            size: metadata.len(),
            mtime: metadata.modified().ok(),
            identity: identity_of(metadata),
            is_directory: metadata.is_dir(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.mtime.is_some()
    }

    ///
    /// True if the mtime is so recent that a subsequent write within the same coarse timestamp
    /// tick could go unnoticed by stat comparison. Such stats must not enter any cache.
    ///
    pub fn can_be_stale(&self) -> bool {
        self.can_be_stale_at(SystemTime::now())
    }

    pub fn can_be_stale_at(&self, now: SystemTime) -> bool {
        match self.mtime {
            None => true,
            // An mtime in the future is as suspect as a fresh one.
            Some(mtime) => match now.duration_since(mtime) {
                Ok(age) => age < STAT_STALE_WINDOW,
                Err(_) => true,
            },
        }
    }
}

impl PartialEq for FileStat {
    fn eq(&self, other: &FileStat) -> bool {
        match (self.mtime, other.mtime) {
            (Some(a), Some(b)) => {
                a == b
                    && self.size == other.size
                    && self.identity == other.identity
                    && self.is_directory == other.is_directory
            }
            // Invalid stats compare unequal to everything, themselves included.
            _ => false,
        }
    }
}

#[cfg(unix)]
fn identity_of(metadata: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn identity_of(_metadata: &Metadata) -> Option<(u64, u64)> {
    None
}
