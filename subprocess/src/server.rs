// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The subprocess controller: owns every local compiler subprocess, schedules them under the
//! configured caps, and reports lifecycle transitions as events. Reaping is push-based: each
//! spawned child has a watcher task that delivers `(id, status)` to the scheduler when the
//! child exits, replacing signal-handler machinery with an awaitable notifier.

use std::collections::BTreeMap;
use std::process::Stdio;

use log::{info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::types::{
    ControllerOptions, Priority, SubProcessEvent, SubProcessId, SubProcessOp, SubProcessReq,
    SubProcessSetOption, SubProcessStarted, SubProcessTerminated, TerminateError, Weight,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubProcessState {
    Pending,
    Run,
    Signaled,
}

struct Entry {
    req: SubProcessReq,
    state: SubProcessState,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    dont_kill: bool,
}

///
/// Client handle to a running controller. Cloneable; dropping every clone shuts the controller
/// down (non-detached children included).
///
#[derive(Clone)]
pub struct SubProcessController {
    op_tx: mpsc::UnboundedSender<SubProcessOp>,
}

impl SubProcessController {
    pub fn register(&self, req: SubProcessReq) {
        let _ = self.op_tx.send(SubProcessOp::Register(req));
    }

    pub fn request_run(&self, id: SubProcessId) {
        let _ = self.op_tx.send(SubProcessOp::RequestRun(id));
    }

    pub fn kill(&self, id: SubProcessId) {
        let _ = self.op_tx.send(SubProcessOp::Kill(id));
    }

    pub fn set_option(&self, option: SubProcessSetOption) {
        let _ = self.op_tx.send(SubProcessOp::SetOption(option));
    }

    pub fn shutdown(&self) {
        let _ = self.op_tx.send(SubProcessOp::Shutdown);
    }

    pub(crate) fn send_op(&self, op: SubProcessOp) {
        let _ = self.op_tx.send(op);
    }
}

///
/// Starts a controller on the ambient runtime. Returns the handle and the event stream.
///
pub fn start_controller(
    options: ControllerOptions,
) -> (
    SubProcessController,
    mpsc::UnboundedReceiver<SubProcessEvent>,
) {
    let (op_tx, op_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_server(options, op_rx, event_tx));
    (SubProcessController { op_tx }, event_rx)
}

async fn run_server(
    options: ControllerOptions,
    mut op_rx: mpsc::UnboundedReceiver<SubProcessOp>,
    event_tx: mpsc::UnboundedSender<SubProcessEvent>,
) {
    let (term_tx, mut term_rx) = mpsc::unbounded_channel();
    let mut server = Server {
        options,
        subprocs: BTreeMap::new(),
        event_tx,
        term_tx,
    };

    loop {
        tokio::select! {
            op = op_rx.recv() => match op {
                Some(SubProcessOp::Shutdown) | None => break,
                Some(op) => server.handle_op(op),
            },
            termination = term_rx.recv() => {
                if let Some((id, status)) = termination {
                    server.handle_termination(id, status);
                }
            }
        }
    }

    server.drain(&mut term_rx).await;
    let _ = server.event_tx.send(SubProcessEvent::Closed);
    info!("subprocess controller closed");
}

struct Server {
    options: ControllerOptions,
    subprocs: BTreeMap<SubProcessId, Entry>,
    event_tx: mpsc::UnboundedSender<SubProcessEvent>,
    term_tx: mpsc::UnboundedSender<(SubProcessId, Option<i32>)>,
}

impl Server {
    fn handle_op(&mut self, op: SubProcessOp) {
        match op {
            SubProcessOp::Register(req) => self.register(req),
            SubProcessOp::RequestRun(id) => self.request_run(id),
            SubProcessOp::Kill(id) => self.kill(id),
            SubProcessOp::SetOption(option) => self.set_option(option),
            SubProcessOp::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    fn register(&mut self, req: SubProcessReq) {
        info!("id={} register {}", req.id, req.trace_id);
        let dont_kill = self.options.dont_kill_subprocess
            || self
                .options
                .dont_kill_commands
                .contains(&program_stem(&req));
        let id = req.id;
        self.subprocs.insert(
            id,
            Entry {
                req,
                state: SubProcessState::Pending,
                pid: None,
                kill_tx: None,
                dont_kill,
            },
        );
        self.try_spawn_subprocess();
    }

    fn request_run(&mut self, id: SubProcessId) {
        match self.subprocs.get_mut(&id) {
            None => {
                // The subprocess may have terminated while the request was in flight; that is
                // an information gap, not an error, but the caller still needs a TERMINATED.
                warn!("id={id} request run for unknown id (maybe already terminated?)");
                self.error_terminate(id, TerminateError::FailedToLookup);
            }
            Some(entry) => {
                if entry.req.priority == Priority::Low {
                    entry.req.priority = Priority::High;
                }
                self.try_spawn_subprocess();
            }
        }
    }

    fn kill(&mut self, id: SubProcessId) {
        match self.subprocs.get_mut(&id) {
            None => {
                warn!("id={id} kill for unknown id (maybe already terminated?)");
                self.error_terminate(id, TerminateError::FailedToLookup);
            }
            Some(entry) => match entry.state {
                SubProcessState::Pending => {
                    // Never started: report the kill synthetically.
                    self.subprocs.remove(&id);
                    self.send_terminated(SubProcessTerminated {
                        id,
                        status: None,
                        error: Some(TerminateError::Killed),
                    });
                    self.try_spawn_subprocess();
                }
                SubProcessState::Run => {
                    let signaled = entry
                        .kill_tx
                        .take()
                        .map(|kill_tx| kill_tx.send(()).is_ok())
                        .unwrap_or(false);
                    if signaled {
                        entry.state = SubProcessState::Signaled;
                    } else {
                        // The watcher is gone without reporting: synthesize the failure so the
                        // caller is never left waiting.
                        self.subprocs.remove(&id);
                        self.send_terminated(SubProcessTerminated {
                            id,
                            status: None,
                            error: Some(TerminateError::FailedToKill),
                        });
                    }
                }
                SubProcessState::Signaled => {}
            },
        }
    }

    fn set_option(&mut self, option: SubProcessSetOption) {
        if let Some(max_subprocs) = option.max_subprocs {
            if max_subprocs > 0 {
                self.options.max_subprocs = max_subprocs;
                info!("option changed: max_subprocs={max_subprocs}");
            } else {
                warn!("option max_subprocs not changed: must be positive");
            }
        }
        if let Some(max_low) = option.max_subprocs_low_priority {
            if max_low > 0 {
                self.options.max_subprocs_low_priority = max_low;
                info!("option changed: max_subprocs_low_priority={max_low}");
            } else {
                warn!("option max_subprocs_low_priority not changed: must be positive");
            }
        }
        if let Some(max_heavy) = option.max_subprocs_heavy_weight {
            if max_heavy > 0 {
                self.options.max_subprocs_heavy_weight = max_heavy;
                info!("option changed: max_subprocs_heavy_weight={max_heavy}");
            } else {
                warn!("option max_subprocs_heavy_weight not changed: must be positive");
            }
        }
        self.try_spawn_subprocess();
    }

    fn handle_termination(&mut self, id: SubProcessId, status: Option<i32>) {
        let Some(entry) = self.subprocs.remove(&id) else {
            return;
        };
        let error = match entry.state {
            SubProcessState::Signaled if status.is_none() => Some(TerminateError::Killed),
            _ => None,
        };
        self.send_terminated(SubProcessTerminated { id, status, error });
        self.try_spawn_subprocess();
    }

    ///
    /// Picks at most one pending subprocess to spawn. Highest priority wins outright; otherwise
    /// the highest-priority pending entry with the smallest id is the candidate, and the heavy
    /// and low-priority caps are applied after selection. A candidate blocked only by the heavy
    /// cap does not starve lighter pending work: selection reruns with heavy entries excluded.
    ///
    fn try_spawn_subprocess(&mut self) {
        let mut exclude_heavy = false;
        loop {
            let Some((id, running, running_heavy)) = self.select_candidate(exclude_heavy) else {
                return;
            };
            let entry = &self.subprocs[&id];
            if entry.req.weight == Weight::Heavy
                && running_heavy >= self.options.max_subprocs_heavy_weight
            {
                exclude_heavy = true;
                continue;
            }
            if entry.req.priority == Priority::Low
                && running >= self.options.max_subprocs_low_priority
            {
                return;
            }
            self.spawn(id);
            return;
        }
    }

    ///
    /// Returns (candidate id, running count, running heavy count), or None when nothing can
    /// spawn: no pending entry, or the running count already meets `max_subprocs`.
    ///
    fn select_candidate(
        &self,
        exclude_heavy: bool,
    ) -> Option<(SubProcessId, usize, usize)> {
        let mut running = 0_usize;
        let mut running_heavy = 0_usize;
        let mut candidate: Option<(SubProcessId, Priority)> = None;

        for (id, entry) in &self.subprocs {
            if entry.state == SubProcessState::Pending
                && entry.req.priority == Priority::Highest
            {
                candidate = Some((*id, Priority::Highest));
                break;
            }
            if entry.state == SubProcessState::Run || entry.state == SubProcessState::Signaled {
                running += 1;
                if running >= self.options.max_subprocs {
                    return None;
                }
                if entry.req.weight == Weight::Heavy {
                    running_heavy += 1;
                }
            }
            if entry.state != SubProcessState::Pending {
                continue;
            }
            if exclude_heavy && entry.req.weight == Weight::Heavy {
                continue;
            }
            match candidate {
                None => candidate = Some((*id, entry.req.priority)),
                Some((_, current_priority)) => {
                    if current_priority == Priority::Low && entry.req.priority == Priority::High {
                        candidate = Some((*id, entry.req.priority));
                    }
                }
            }
        }

        candidate.map(|(id, _)| (id, running, running_heavy))
    }

    fn spawn(&mut self, id: SubProcessId) {
        let entry = self
            .subprocs
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("candidate taken from the map"));
        match spawn_child(&entry.req) {
            Ok(mut child) => {
                let pid = child.id().unwrap_or(0);
                let (kill_tx, kill_rx) = oneshot::channel();
                entry.state = SubProcessState::Run;
                entry.pid = Some(pid);
                entry.kill_tx = Some(kill_tx);

                let term_tx = self.term_tx.clone();
                tokio::spawn(async move {
                    let status = tokio::select! {
                        status = child.wait() => status,
                        _ = kill_rx => {
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    };
                    let code = status.ok().and_then(|s| s.code());
                    let _ = term_tx.send((id, code));
                });

                info!("id={id} started pid={pid}");
                let _ = self
                    .event_tx
                    .send(SubProcessEvent::Started(SubProcessStarted { id, pid }));
            }
            Err(err) => {
                warn!("id={id} failed to spawn: {err}");
                let detach = entry.req.detach;
                self.subprocs.remove(&id);
                if !detach {
                    self.send_terminated(SubProcessTerminated {
                        id,
                        status: None,
                        error: Some(TerminateError::FailedToSpawn),
                    });
                }
            }
        }
    }

    fn error_terminate(&mut self, id: SubProcessId, error: TerminateError) {
        self.subprocs.remove(&id);
        self.send_terminated(SubProcessTerminated {
            id,
            status: None,
            error: Some(error),
        });
        self.try_spawn_subprocess();
    }

    fn send_terminated(&self, terminated: SubProcessTerminated) {
        let _ = self
            .event_tx
            .send(SubProcessEvent::Terminated(terminated));
    }

    ///
    /// Shutdown: kill every running, killable subprocess and wait for its watcher to report.
    /// Detached and kill-exempt children are left running.
    ///
    async fn drain(&mut self, term_rx: &mut mpsc::UnboundedReceiver<(SubProcessId, Option<i32>)>) {
        let mut waiting = Vec::new();
        let ids: Vec<SubProcessId> = self.subprocs.keys().copied().collect();
        for id in ids {
            let entry = self
                .subprocs
                .get_mut(&id)
                .unwrap_or_else(|| unreachable!("iterating over known ids"));
            if entry.req.detach || entry.dont_kill {
                continue;
            }
            match entry.state {
                SubProcessState::Pending => {
                    self.subprocs.remove(&id);
                }
                SubProcessState::Run | SubProcessState::Signaled => {
                    if let Some(kill_tx) = entry.kill_tx.take() {
                        let _ = kill_tx.send(());
                    }
                    entry.state = SubProcessState::Signaled;
                    waiting.push(id);
                }
            }
        }

        while !waiting.is_empty() {
            match term_rx.recv().await {
                Some((id, status)) => {
                    waiting.retain(|waited| *waited != id);
                    self.handle_termination_during_drain(id, status);
                }
                None => break,
            }
        }
    }

    fn handle_termination_during_drain(&mut self, id: SubProcessId, status: Option<i32>) {
        if let Some(entry) = self.subprocs.remove(&id) {
            let error = match entry.state {
                SubProcessState::Signaled if status.is_none() => Some(TerminateError::Killed),
                _ => None,
            };
            self.send_terminated(SubProcessTerminated { id, status, error });
        }
    }
}

fn program_stem(req: &SubProcessReq) -> String {
    req.prog
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn spawn_child(req: &SubProcessReq) -> Result<tokio::process::Child, String> {
    let mut command = tokio::process::Command::new(&req.prog);
    if req.argv.len() > 1 {
        command.args(&req.argv[1..]);
    }
    command.env_clear();
    for env in &req.envs {
        if let Some((key, value)) = env.split_once('=') {
            command.env(key, value);
        }
    }
    command.current_dir(&req.cwd);
    command.stdin(Stdio::null());
    command.stdout(stdio_for(&req.stdout_file)?);
    command.stderr(stdio_for(&req.stderr_file)?);
    // A dropped watcher must not leak a killable child; detached children survive us.
    command.kill_on_drop(!req.detach);
    command
        .spawn()
        .map_err(|e| format!("spawn {}: {e}", req.prog.display()))
}

fn stdio_for(file: &Option<std::path::PathBuf>) -> Result<Stdio, String> {
    match file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| format!("create {}: {e}", path.display()))?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}
