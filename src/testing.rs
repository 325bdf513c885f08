// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Test doubles for the externally provided services: a scripted exec client and a fixed
//! compiler-info provider. Real transports live outside this workspace.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashing::{Digest, Fingerprint};
use parking_lot::Mutex;

use crate::command::CompilerFlags;
use crate::compiler_info::{CompilerInfo, CompilerInfoProvider};
use crate::error::CompileError;
use crate::remote::{ExecRequest, ExecResponse, RemoteExecClient};

///
/// A provider returning one fixed descriptor, regardless of flags.
///
pub struct FixedCompilerInfoProvider {
    info: CompilerInfo,
}

impl FixedCompilerInfoProvider {
    pub fn new(info: CompilerInfo) -> FixedCompilerInfoProvider {
        FixedCompilerInfoProvider { info }
    }

    /// A plausible gcc-on-linux descriptor rooted under `system_dir`.
    pub fn gcc_like(system_dir: PathBuf) -> FixedCompilerInfoProvider {
        FixedCompilerInfoProvider::new(CompilerInfo {
            name: "gcc".to_string(),
            version: "9.3.0".to_string(),
            target: "x86_64-linux-gnu".to_string(),
            real_compiler_path: PathBuf::from("/usr/bin/gcc"),
            real_compiler_hash: Digest::of_bytes(b"gcc binary stand-in").hash,
            predefined_macros: "#define __GNUC__ 9\n#define __STDC__ 1\n".to_string(),
            system_include_dirs: vec![system_dir],
            system_framework_dirs: Vec::new(),
            capabilities: include_processor::CppCompilerCapabilities::default(),
            additional_flags: Vec::new(),
        })
    }
}

#[async_trait]
impl CompilerInfoProvider for FixedCompilerInfoProvider {
    async fn build(&self, _flags: &CompilerFlags) -> Result<CompilerInfo, String> {
        Ok(self.info.clone())
    }
}

/// A provider that always fails, for COMPILER_NOT_FOUND paths.
pub struct FailingCompilerInfoProvider;

#[async_trait]
impl CompilerInfoProvider for FailingCompilerInfoProvider {
    async fn build(&self, flags: &CompilerFlags) -> Result<CompilerInfo, String> {
        Err(format!("no such compiler: {}", flags.compiler_name))
    }
}

///
/// One scripted reply of the mock exec client.
///
#[derive(Clone, Debug)]
pub enum ScriptedExec {
    Respond(ExecResponse),
    Fail(CompileError),
    /// Respond after a delay, for race tests.
    RespondAfter(Duration, ExecResponse),
}

///
/// A scripted exec client: replies are served in order, and every request is recorded for
/// assertions. An exhausted script fails the call.
///
pub struct MockExecClient {
    script: Mutex<VecDeque<ScriptedExec>>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl MockExecClient {
    pub fn new(script: Vec<ScriptedExec>) -> Arc<MockExecClient> {
        Arc::new(MockExecClient {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl RemoteExecClient for MockExecClient {
    async fn exec(&self, request: ExecRequest) -> Result<ExecResponse, CompileError> {
        self.requests.lock().push(request);
        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(ScriptedExec::Respond(response)) => Ok(response),
            Some(ScriptedExec::Fail(error)) => Err(error),
            Some(ScriptedExec::RespondAfter(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            None => Err(CompileError::Transient("mock script exhausted".to_string())),
        }
    }
}

/// Shorthand for the fingerprint of a byte string, for tests that need distinct keys.
pub fn test_fingerprint(salt: &str) -> Fingerprint {
    Digest::of_bytes(salt.as_bytes()).hash
}
