// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The compiler descriptor the engine consumes, plus its process-wide cache. Discovery (running
//! the real compiler once to learn macros, search paths and target) belongs to an external
//! service behind `CompilerInfoProvider`; here a descriptor is immutable and shared.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use hashing::Fingerprint;
use include_processor::CppCompilerCapabilities;
use log::warn;
use parking_lot::Mutex;

use crate::command::CompilerFlags;
use crate::error::CompileError;

///
/// Everything the engine needs to know about one compiler binary: identity for fingerprints and
/// command specs, predefined macro state and search paths for include processing, capability
/// tables for `__has_*` probes.
///
#[derive(Clone, Debug)]
pub struct CompilerInfo {
    pub name: String,
    pub version: String,
    pub target: String,
    pub real_compiler_path: PathBuf,
    pub real_compiler_hash: Fingerprint,
    /// `-dM`-style dump, parsed once per processor run.
    pub predefined_macros: String,
    pub system_include_dirs: Vec<PathBuf>,
    pub system_framework_dirs: Vec<PathBuf>,
    pub capabilities: CppCompilerCapabilities,
    /// Extra flags the descriptor was built under (e.g. `-std=`), part of the deps fingerprint.
    pub additional_flags: Vec<String>,
}

#[async_trait]
pub trait CompilerInfoProvider: Send + Sync {
    async fn build(&self, flags: &CompilerFlags) -> Result<CompilerInfo, String>;
}

enum CacheState {
    Ready(Arc<CompilerInfo>),
    /// The compiler could not be described; further requests fail fast until daemon restart.
    Disabled(String),
}

///
/// Process-wide descriptor cache keyed by compiler name. A failed build disables the compiler
/// so one broken toolchain does not retry discovery on every compile.
///
pub struct CompilerInfoCache {
    entries: Mutex<HashMap<String, Arc<CacheState>>>,
}

impl CompilerInfoCache {
    pub fn new() -> CompilerInfoCache {
        CompilerInfoCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        provider: &dyn CompilerInfoProvider,
        flags: &CompilerFlags,
    ) -> Result<Arc<CompilerInfo>, CompileError> {
        let key = flags.compiler_name.clone();
        if let Some(state) = self.entries.lock().get(&key).cloned() {
            return match &*state {
                CacheState::Ready(info) => Ok(info.clone()),
                CacheState::Disabled(reason) => {
                    Err(CompileError::CompilerNotFound(reason.clone()))
                }
            };
        }

        // Two racing misses both run discovery; the second insert wins with an equal value.
        match provider.build(flags).await {
            Ok(info) => {
                let info = Arc::new(info);
                self.entries
                    .lock()
                    .insert(key, Arc::new(CacheState::Ready(info.clone())));
                Ok(info)
            }
            Err(reason) => {
                warn!("disabling compiler {key}: {reason}");
                self.entries
                    .lock()
                    .insert(key, Arc::new(CacheState::Disabled(reason.clone())));
                Err(CompileError::CompilerNotFound(reason))
            }
        }
    }

    /// Drops a disabled marker (or a stale descriptor) so the next request re-runs discovery.
    pub fn invalidate(&self, compiler_name: &str) {
        self.entries.lock().remove(compiler_name);
    }
}
