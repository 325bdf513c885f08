// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};

///
/// Executors come in two flavors:
/// * "borrowed"
///     * Created with `Self::new()`.
///     * A borrowed Executor will not be shut down when all handles are dropped, and shutdown
///       methods will have no impact. Used in unit tests where the Runtime is created by macros.
/// * "owned"
///     * Created with `Self::new_owned()`.
///     * The daemon creates one owned Executor at startup; `shutdown` drains it at exit, after
///       the persistent caches have flushed.
///
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor for an existing tokio Runtime (generally provided by tokio's macros).
    /// The owner of the Runtime must keep it alive longer than all Executor instances.
    ///
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Creates an Executor with an owned Runtime. Worker thread count defaults to the number of
    /// cores when not given.
    ///
    pub fn new_owned(num_worker_threads: Option<usize>) -> Result<Executor, String> {
        let worker_threads = num_worker_threads.unwrap_or_else(num_cpus::get);
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()
            .map_err(|e| format!("failed to start tokio runtime: {e}"))?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    ///
    /// Spawns a Future on the runtime.
    ///
    pub fn spawn<F: Future + Send + 'static>(&self, future: F) -> JoinHandle<F::Output>
    where
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    ///
    /// Runs a blocking function (file I/O, hashing, parsing) on the blocking pool, keeping the
    /// async workers responsive.
    ///
    pub fn spawn_blocking<F, T>(&self, function: F) -> impl Future<Output = Result<T, JoinError>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn_blocking(function)
    }

    ///
    /// Blocks the calling (non-runtime) thread on a Future.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    ///
    /// Shuts down an owned Runtime, waiting up to `timeout` for running tasks. A no-op for
    /// borrowed Executors.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            debug!("shutdown of a borrowed Executor is a no-op");
            return;
        };
        runtime.shutdown_timeout(timeout);
    }
}
