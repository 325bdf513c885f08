// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A per-daemon bridge to the subprocess controller: allocates ids, routes the controller's
//! event stream back to the compile task that owns each subprocess, and collects redirected
//! stdout/stderr afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use subprocess::{
    start_controller, ControllerOptions, Priority, SubProcessController, SubProcessEvent,
    SubProcessId, SubProcessReq, SubProcessTerminated, Weight,
};
use tokio::sync::oneshot;

use crate::error::CompileError;

///
/// One local command a compile task wants run under the controller's caps.
///
#[derive(Clone, Debug)]
pub struct LocalCommand {
    pub trace_id: String,
    pub prog: PathBuf,
    pub argv: Vec<String>,
    pub envs: Vec<String>,
    pub cwd: PathBuf,
    pub priority: Priority,
    pub weight: Weight,
}

#[derive(Clone, Debug)]
pub struct LocalRunResult {
    pub exit_status: Option<i32>,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

pub struct SubprocessBroker {
    controller: SubProcessController,
    next_id: AtomicU32,
    waiters: Arc<Mutex<HashMap<SubProcessId, oneshot::Sender<SubProcessTerminated>>>>,
}

impl SubprocessBroker {
    pub fn start(options: ControllerOptions) -> Arc<SubprocessBroker> {
        let (controller, mut events) = start_controller(options);
        let waiters: Arc<Mutex<HashMap<SubProcessId, oneshot::Sender<SubProcessTerminated>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let router_waiters = waiters.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SubProcessEvent::Started(started) => {
                        debug!("id={} running as pid {}", started.id, started.pid);
                    }
                    SubProcessEvent::Terminated(terminated) => {
                        if let Some(waiter) = router_waiters.lock().remove(&terminated.id) {
                            let _ = waiter.send(terminated);
                        }
                    }
                    SubProcessEvent::Closed => break,
                }
            }
        });

        Arc::new(SubprocessBroker {
            controller,
            next_id: AtomicU32::new(1),
            waiters,
        })
    }

    pub fn shutdown(&self) {
        self.controller.shutdown();
    }

    ///
    /// Registers `command` and raises it runnable. The returned handle waits for termination
    /// (or kills early, for a lost race).
    ///
    pub fn launch(&self, command: LocalCommand) -> Result<LaunchedSubprocess, CompileError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let capture_dir = tempfile::TempDir::new()
            .map_err(|e| CompileError::SubprocSpawnFail(format!("capture dir: {e}")))?;
        let stdout_file = capture_dir.path().join("stdout");
        let stderr_file = capture_dir.path().join("stderr");

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);

        self.controller.register(SubProcessReq {
            id,
            trace_id: command.trace_id,
            prog: command.prog,
            argv: command.argv,
            envs: command.envs,
            cwd: command.cwd,
            stdout_file: Some(stdout_file.clone()),
            stderr_file: Some(stderr_file.clone()),
            priority: command.priority,
            weight: command.weight,
            detach: false,
        });
        self.controller.request_run(id);

        Ok(LaunchedSubprocess {
            id,
            controller: self.controller.clone(),
            rx,
            _capture_dir: capture_dir,
            stdout_file,
            stderr_file,
        })
    }

    ///
    /// Convenience for callers with nothing to race: launch and wait.
    ///
    pub async fn run(&self, command: LocalCommand) -> Result<LocalRunResult, CompileError> {
        let mut launched = self.launch(command)?;
        launched.wait().await
    }
}

pub struct LaunchedSubprocess {
    id: SubProcessId,
    controller: SubProcessController,
    rx: oneshot::Receiver<SubProcessTerminated>,
    // Keeps the redirect files alive until the result has been read.
    _capture_dir: tempfile::TempDir,
    stdout_file: PathBuf,
    stderr_file: PathBuf,
}

impl LaunchedSubprocess {
    /// Best-effort asynchronous kill; the TERMINATED notification still arrives through `wait`.
    pub fn kill(&self) {
        self.controller.kill(self.id);
    }

    pub async fn wait(&mut self) -> Result<LocalRunResult, CompileError> {
        let terminated = (&mut self.rx).await.map_err(|_| {
            CompileError::SubprocSpawnFail("subprocess controller went away".to_string())
        })?;
        if terminated.error.is_some() && terminated.status.is_none() {
            return Err(CompileError::SubprocSpawnFail(format!(
                "local run failed: {:?}",
                terminated.error
            )));
        }

        let stdout = std::fs::read(&self.stdout_file).unwrap_or_default();
        let stderr = std::fs::read(&self.stderr_file).unwrap_or_default();
        Ok(LocalRunResult {
            exit_status: terminated.status,
            stdout: Bytes::from(stdout),
            stderr: Bytes::from(stderr),
        })
    }
}
