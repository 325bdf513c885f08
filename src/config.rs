// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

///
/// Daemon configuration consumed by the per-task engine. Values are concept-level; the outer
/// daemon maps environment or command-line settings onto this struct at startup and threads it
/// through `TaskContext` (nothing reads configuration from global scope).
///
#[derive(Clone, Debug)]
pub struct ConfigOptions {
    /// Hard cap on concurrent local subprocesses.
    pub max_subprocs: usize,
    /// Cap on low-priority local subprocesses.
    pub max_subprocs_low_priority: usize,
    /// Cap on heavy local subprocesses.
    pub max_subprocs_heavy_weight: usize,

    /// Include cache capacity, in entries.
    pub include_cache_max_entries: usize,
    /// List-dir cache capacity, in entries.
    pub list_dir_cache_max_entries: usize,

    /// Path of the persistent deps cache; None disables persistence.
    pub deps_cache_file: Option<PathBuf>,
    /// Deps entries unused for longer than this are dropped at save. None keeps them forever.
    pub deps_cache_alive_duration: Option<Duration>,
    /// Deps table is capped to this many most-recent entries at save.
    pub deps_cache_size_threshold: usize,
    /// A persisted deps image larger than this is rejected at load.
    pub deps_cache_max_proto_size: usize,

    /// Directory of the local output cache; None disables it.
    pub local_output_cache_dir: Option<PathBuf>,
    /// High-water mark for the local output cache, in bytes.
    pub local_output_cache_max_cache_amount: u64,
    /// Low-water target GC trims to, in bytes.
    pub local_output_cache_threshold_cache_amount: u64,
    /// High/low water marks on entry count.
    pub local_output_cache_max_items: usize,
    pub local_output_cache_threshold_items: usize,
    /// Only compiles whose outputs total at most this many bytes are recorded.
    pub local_output_cache_max_entry_bytes: u64,

    /// Opt into the precompiled-header substitution in include resolution.
    pub gch_hack_enabled: bool,

    /// Never kill local compilers at shutdown.
    pub dont_kill_subprocess: bool,
    /// Program stems exempt from kill-at-shutdown.
    pub dont_kill_commands: HashSet<String>,

    /// Bounded retries for the exec RPC (missing inputs, command-spec mismatch).
    pub exec_retry_count: usize,
    /// Base backoff between exec retries; doubles per attempt.
    pub exec_retry_backoff: Duration,

    /// A file modified within this window counts as "new": its blob probably is not in the
    /// remote cache yet.
    pub new_file_threshold: Duration,
}

impl Default for ConfigOptions {
    fn default() -> ConfigOptions {
        ConfigOptions {
            max_subprocs: 3,
            max_subprocs_low_priority: 1,
            max_subprocs_heavy_weight: 1,
            include_cache_max_entries: 4096,
            list_dir_cache_max_entries: 1024,
            deps_cache_file: None,
            deps_cache_alive_duration: Some(Duration::from_secs(3 * 24 * 60 * 60)),
            deps_cache_size_threshold: 65536,
            deps_cache_max_proto_size: 256 * 1024 * 1024,
            local_output_cache_dir: None,
            local_output_cache_max_cache_amount: 1024 * 1024 * 1024,
            local_output_cache_threshold_cache_amount: 768 * 1024 * 1024,
            local_output_cache_max_items: 16384,
            local_output_cache_threshold_items: 12288,
            local_output_cache_max_entry_bytes: 8 * 1024 * 1024,
            gch_hack_enabled: false,
            dont_kill_subprocess: false,
            dont_kill_commands: HashSet::new(),
            exec_retry_count: 3,
            exec_retry_backoff: Duration::from_millis(100),
            new_file_threshold: Duration::from_secs(60 * 60),
        }
    }
}
