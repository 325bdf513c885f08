// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Local subprocess management for fallback compiles: a controller that owns every child,
//! schedules under concurrency caps, and reports lifecycle events, plus the framed wire
//! protocol the daemon speaks to it.

mod framing;
#[cfg(test)]
mod framing_tests;
mod server;
#[cfg(test)]
mod server_tests;
mod types;
mod wire;

pub use crate::framing::{
    read_frame, write_frame, OP_CLOSED, OP_KILL, OP_REGISTER, OP_REQUEST_RUN, OP_SET_OPTION,
    OP_SHUTDOWN, OP_STARTED, OP_TERMINATED,
};
pub use crate::server::{start_controller, SubProcessController};
pub use crate::types::{
    ControllerOptions, Priority, SubProcessEvent, SubProcessId, SubProcessOp, SubProcessReq,
    SubProcessSetOption, SubProcessStarted, SubProcessTerminated, TerminateError, Weight,
};
pub use crate::wire::serve_stream;
