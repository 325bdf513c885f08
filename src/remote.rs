// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The remote execution API as consumed by the compile task. Transport, authentication and
//! wire format live elsewhere; this is the request/response shape and the client trait.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::Fingerprint;
use store::{ExecInput, FileBlob};

use crate::error::CompileError;

///
/// Identifies the compiler the server should run. When the server's binary under that name
/// differs, it answers with an updated spec the client adopts before retrying.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub version: String,
    pub target: String,
    pub binary_hash: Option<Fingerprint>,
}

#[derive(Clone, Debug)]
pub struct ExecRequest {
    pub command_spec: CommandSpec,
    pub args: Vec<String>,
    pub envs: Vec<String>,
    pub cwd: PathBuf,
    pub inputs: Vec<ExecInput>,
    pub expected_output_files: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct ExecOutputFile {
    pub filename: PathBuf,
    pub mode: u32,
    pub hash_key: Option<hashing::Digest>,
    pub inline_blob: Option<FileBlob>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecResponse {
    pub exit_status: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub outputs: Vec<ExecOutputFile>,
    /// Inputs whose blobs the server could not find; the caller re-uploads exactly these and
    /// retries.
    pub missing_inputs: Vec<PathBuf>,
    /// Set when the server's compiler under `command_spec.name` differs from the requested one.
    pub command_spec_update: Option<CommandSpec>,
    pub cache_hit: bool,
}

impl ExecResponse {
    pub fn needs_retry(&self) -> bool {
        !self.missing_inputs.is_empty() || self.command_spec_update.is_some()
    }
}

#[async_trait]
pub trait RemoteExecClient: Send + Sync {
    async fn exec(&self, request: ExecRequest) -> Result<ExecResponse, CompileError>;
}
