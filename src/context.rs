// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The wiring of one daemon: every process-wide cache and client a compile task consumes,
//! injected through this struct so nothing reaches for global state and tests stay hermetic.

use std::sync::Arc;

use deps_cache::{DepsCache, DepsCacheOptions};
use hash_cache::FileHashCache;
use include_processor::IncludeCache;
use local_output_cache::{LocalOutputCache, LocalOutputCacheOptions};
use store::BlobServiceClient;
use subprocess::ControllerOptions;
use task_executor::Executor;

use fs::{GlobalFileStatCache, ListDirCache};

use crate::compiler_info::{CompilerInfoCache, CompilerInfoProvider};
use crate::config::ConfigOptions;
use crate::input_file_task::InputFileTaskRegistry;
use crate::remote::RemoteExecClient;
use crate::subprocess_broker::SubprocessBroker;

pub struct TaskContext {
    pub config: ConfigOptions,
    pub executor: Executor,
    pub include_cache: Arc<IncludeCache>,
    pub list_dir_cache: Arc<ListDirCache>,
    pub global_stat_cache: Arc<GlobalFileStatCache>,
    pub deps_cache: Arc<DepsCache>,
    pub file_hash_cache: Arc<FileHashCache>,
    pub local_output_cache: Option<Arc<LocalOutputCache>>,
    pub compiler_info_cache: Arc<CompilerInfoCache>,
    pub compiler_info_provider: Arc<dyn CompilerInfoProvider>,
    pub blob_client: Arc<dyn BlobServiceClient>,
    pub exec_client: Arc<dyn RemoteExecClient>,
    pub input_file_tasks: Arc<InputFileTaskRegistry>,
    pub subprocess_broker: Arc<SubprocessBroker>,
}

impl TaskContext {
    ///
    /// Builds a context from configuration plus the externally provided clients. Must run on
    /// the daemon's runtime (the subprocess controller spawns onto it).
    ///
    pub fn new(
        config: ConfigOptions,
        executor: Executor,
        compiler_info_provider: Arc<dyn CompilerInfoProvider>,
        blob_client: Arc<dyn BlobServiceClient>,
        exec_client: Arc<dyn RemoteExecClient>,
    ) -> Result<Arc<TaskContext>, String> {
        let local_output_cache = match &config.local_output_cache_dir {
            Some(dir) => Some(LocalOutputCache::new(
                dir.clone(),
                LocalOutputCacheOptions {
                    max_bytes: config.local_output_cache_max_cache_amount,
                    threshold_bytes: config.local_output_cache_threshold_cache_amount,
                    max_items: config.local_output_cache_max_items,
                    threshold_items: config.local_output_cache_threshold_items,
                },
                executor.clone(),
            )?),
            None => None,
        };

        let deps_cache = Arc::new(DepsCache::new(
            config.deps_cache_file.clone(),
            DepsCacheOptions {
                alive_duration: config.deps_cache_alive_duration,
                table_size_threshold: config.deps_cache_size_threshold,
                max_image_bytes: config.deps_cache_max_proto_size,
            },
        ));

        let subprocess_broker = SubprocessBroker::start(ControllerOptions {
            max_subprocs: config.max_subprocs,
            max_subprocs_low_priority: config.max_subprocs_low_priority,
            max_subprocs_heavy_weight: config.max_subprocs_heavy_weight,
            dont_kill_subprocess: config.dont_kill_subprocess,
            dont_kill_commands: config.dont_kill_commands.clone(),
        });

        Ok(Arc::new(TaskContext {
            include_cache: Arc::new(IncludeCache::new(config.include_cache_max_entries)),
            list_dir_cache: Arc::new(ListDirCache::new(config.list_dir_cache_max_entries)),
            global_stat_cache: Arc::new(GlobalFileStatCache::new()),
            deps_cache,
            file_hash_cache: Arc::new(FileHashCache::new()),
            local_output_cache,
            compiler_info_cache: Arc::new(CompilerInfoCache::new()),
            compiler_info_provider,
            blob_client,
            exec_client,
            input_file_tasks: InputFileTaskRegistry::new(),
            subprocess_broker,
            config,
            executor,
        }))
    }

    ///
    /// Daemon exit: flush persistent caches, stop the subprocess controller.
    ///
    pub fn shutdown(&self) {
        self.deps_cache.save();
        self.subprocess_broker.shutdown();
    }
}
