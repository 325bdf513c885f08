// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;
use std::path::PathBuf;

///
/// The failure classes a compile task distinguishes. What matters is the recovery policy each
/// one selects, not the message: transient errors retry locally, missing inputs retry with
/// upload, unsupported flags skip the remote attempt entirely, and corrupt caches degrade to
/// cold without failing anything.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    Transient(String),
    MissingInput(Vec<PathBuf>),
    CompilerNotFound(String),
    FlagUnsupported(String),
    CacheCorrupt(String),
    SubprocSpawnFail(String),
    OutputDownloadFail(String),
    Fatal(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Transient(msg) => write!(f, "transient: {msg}"),
            CompileError::MissingInput(files) => {
                write!(f, "missing inputs: {} files", files.len())
            }
            CompileError::CompilerNotFound(msg) => write!(f, "compiler not found: {msg}"),
            CompileError::FlagUnsupported(msg) => write!(f, "unsupported flags: {msg}"),
            CompileError::CacheCorrupt(msg) => write!(f, "cache corrupt: {msg}"),
            CompileError::SubprocSpawnFail(msg) => write!(f, "subprocess spawn failed: {msg}"),
            CompileError::OutputDownloadFail(msg) => write!(f, "output download failed: {msg}"),
            CompileError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for CompileError {}

///
/// Strips the internal duration annotation from a user-visible error line:
/// `compiler_proxy [173.736822ms]: message` becomes `compiler_proxy: message`.
/// Anything that does not match the expected shape is returned as-is.
///
pub fn omit_duration_from_user_error(message: &str) -> String {
    let Some(rest) = message.strip_prefix("compiler_proxy [") else {
        return message.to_string();
    };
    let Some(close) = rest.find("]:") else {
        return message.to_string();
    };
    let duration = &rest[..close];
    if duration.is_empty() || !duration.starts_with(|c: char| c.is_ascii_digit()) {
        return message.to_string();
    }
    format!("compiler_proxy:{}", &rest[close + 2..])
}
