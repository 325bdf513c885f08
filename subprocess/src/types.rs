// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type SubProcessId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    High,
    /// Reserved for command-output reads the daemon itself blocks on; always light weight.
    Highest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weight {
    Light,
    Heavy,
}

///
/// A request to run one local subprocess under the controller's caps.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubProcessReq {
    pub id: SubProcessId,
    pub trace_id: String,
    pub prog: PathBuf,
    pub argv: Vec<String>,
    pub envs: Vec<String>,
    pub cwd: PathBuf,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
    pub priority: Priority,
    pub weight: Weight,
    /// Detached subprocesses are left alone at shutdown and report nothing on spawn failure.
    pub detach: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminateError {
    FailedToSpawn,
    FailedToKill,
    FailedToLookup,
    Killed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProcessStarted {
    pub id: SubProcessId,
    pub pid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProcessTerminated {
    pub id: SubProcessId,
    /// The exit status; None for synthetic terminations and signal deaths.
    pub status: Option<i32>,
    pub error: Option<TerminateError>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProcessSetOption {
    pub max_subprocs: Option<usize>,
    pub max_subprocs_low_priority: Option<usize>,
    pub max_subprocs_heavy_weight: Option<usize>,
}

///
/// Controller configuration. The caps must stay positive; `SET_OPTION` messages that try to
/// zero them are refused with a log, not an error.
///
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    pub max_subprocs: usize,
    pub max_subprocs_low_priority: usize,
    pub max_subprocs_heavy_weight: usize,
    pub dont_kill_subprocess: bool,
    /// Program stems exempt from kill-at-shutdown even when `dont_kill_subprocess` is unset.
    pub dont_kill_commands: HashSet<String>,
}

impl Default for ControllerOptions {
    fn default() -> ControllerOptions {
        ControllerOptions {
            max_subprocs: 3,
            max_subprocs_low_priority: 1,
            max_subprocs_heavy_weight: 1,
            dont_kill_subprocess: false,
            dont_kill_commands: HashSet::new(),
        }
    }
}

/// Requests into the controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SubProcessOp {
    Register(SubProcessReq),
    RequestRun(SubProcessId),
    Kill(SubProcessId),
    SetOption(SubProcessSetOption),
    Shutdown,
}

/// Notifications out of the controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubProcessEvent {
    Started(SubProcessStarted),
    Terminated(SubProcessTerminated),
    /// The controller has drained and the connection is done.
    Closed,
}
