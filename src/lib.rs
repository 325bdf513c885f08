// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-task engine of the compile proxy daemon: the compile-task state machine and the
//! pieces it orchestrates, wired together through an injected `TaskContext`.

mod command;
mod compile_task;
mod compiler_info;
mod config;
mod context;
mod error;
mod fingerprint;
#[cfg(test)]
mod fingerprint_tests;
mod input_file_task;
#[cfg(test)]
mod input_file_task_tests;
mod output_file_task;
mod remote;
mod subprocess_broker;
pub mod testing;

pub use crate::command::{
    CompileMode, CompilerFlags, CompilerKind, CompilerLang, CompilerTypeSpecific,
};
pub use crate::compile_task::{
    CompileRequest, CompileResponse, CompileTask, CompileTaskHandle, CompileTaskState,
    RequesterEnv, ResultSource,
};
pub use crate::compiler_info::{CompilerInfo, CompilerInfoCache, CompilerInfoProvider};
pub use crate::config::ConfigOptions;
pub use crate::context::TaskContext;
pub use crate::error::{omit_duration_from_user_error, CompileError};
pub use crate::fingerprint::{make_deps_identifier, make_local_output_key};
pub use crate::input_file_task::{
    InputFileResult, InputFileSpec, InputFileTaskRegistry, LARGE_FILE_THRESHOLD,
    TINY_FILE_THRESHOLD,
};
pub use crate::output_file_task::{run_output_file_task, DownloadedOutput};
pub use crate::remote::{
    CommandSpec, ExecOutputFile, ExecRequest, ExecResponse, RemoteExecClient,
};
pub use crate::subprocess_broker::{
    LaunchedSubprocess, LocalCommand, LocalRunResult, SubprocessBroker,
};
