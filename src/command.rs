// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The parsed compile command as handed over by the (external) flag parser, and the per-kind
//! dispatch that decides what the engine can do with it. Flag parsing itself never happens
//! here: this is the value object the rest of the engine consumes.

use std::path::PathBuf;

use include_processor::{
    CommandLineMacro, CppIncludeProcessor, IncludeProcessorCaches, IncludeProcessorInput,
    IncludeProcessorResult, IncludeSearchPaths,
};

use crate::compiler_info::CompilerInfo;
use crate::error::CompileError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileMode {
    Compiling,
    Preprocessing,
    Linking,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompilerLang {
    C,
    Cxx,
    ObjectiveC,
    ObjectiveCxx,
    Java,
    Other,
}

///
/// One parsed compiler invocation. Paths are as spelled on the command line; `cwd` anchors the
/// relative ones.
///
#[derive(Clone, Debug)]
pub struct CompilerFlags {
    pub compiler_name: String,
    pub cwd: PathBuf,
    pub args: Vec<String>,
    pub input_filenames: Vec<PathBuf>,
    pub output_filenames: Vec<PathBuf>,
    /// `-iquote` roots, then `-I` roots, then `-isystem` roots, in command-line order within
    /// each group.
    pub quote_include_dirs: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub system_include_dirs: Vec<PathBuf>,
    pub framework_dirs: Vec<PathBuf>,
    pub commandline_macros: Vec<CommandLineMacro>,
    /// `-include` operands, in order.
    pub forced_includes: Vec<String>,
    pub mode: CompileMode,
    pub lang: CompilerLang,
    /// The invocation reads from stdin (`-` input); remote compilation cannot reproduce it.
    pub uses_stdin: bool,
    /// `-wrapper` or an equivalent escape hatch is present.
    pub has_wrapper: bool,
    /// The command produces a precompiled header.
    pub creates_precompiled_header: bool,
}

impl CompilerFlags {
    ///
    /// True when this invocation must run locally without a remote attempt: preprocessing,
    /// stdin input, wrapper games, or PCH creation.
    ///
    pub fn requires_local_run(&self) -> bool {
        self.mode == CompileMode::Preprocessing
            || self.uses_stdin
            || self.has_wrapper
            || self.creates_precompiled_header
    }
}

///
/// The compiler families the engine knows. Each maps to a `CompilerTypeSpecific` deciding
/// deps-cache participation, remote support and include processing. A name that maps to no
/// kind is reported unsupported and runs locally.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompilerKind {
    Gcc,
    Clexe,
    ClangTidy,
    Javac,
    Java,
    Fake,
}

impl CompilerKind {
    pub fn from_compiler_name(name: &str) -> Option<CompilerKind> {
        let stem = name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(name)
            .trim_end_matches(".exe");
        match stem {
            _ if stem.ends_with("gcc") || stem.ends_with("g++") => Some(CompilerKind::Gcc),
            _ if stem.ends_with("clang") || stem.ends_with("clang++") => Some(CompilerKind::Gcc),
            "cl" => Some(CompilerKind::Clexe),
            "clang-cl" => Some(CompilerKind::Clexe),
            "clang-tidy" => Some(CompilerKind::ClangTidy),
            "javac" => Some(CompilerKind::Javac),
            "java" => Some(CompilerKind::Java),
            "fake" => Some(CompilerKind::Fake),
            _ => None,
        }
    }

    pub fn type_specific(&self) -> &'static dyn CompilerTypeSpecific {
        match self {
            CompilerKind::Gcc => &GccTypeSpecific,
            CompilerKind::Clexe => &ClexeTypeSpecific,
            CompilerKind::ClangTidy => &ClangTidyTypeSpecific,
            CompilerKind::Javac => &JavacTypeSpecific,
            CompilerKind::Java => &JavaTypeSpecific,
            CompilerKind::Fake => &FakeTypeSpecific,
        }
    }
}

///
/// Per-kind behavior. Implementations are stateless; everything they need arrives as
/// arguments.
///
pub trait CompilerTypeSpecific: Send + Sync {
    fn supports_deps_cache(&self, flags: &CompilerFlags) -> bool;

    fn remote_compile_supported(&self, flags: &CompilerFlags) -> bool;

    fn run_include_processor(
        &self,
        flags: &CompilerFlags,
        compiler_info: &CompilerInfo,
        caches: &mut IncludeProcessorCaches<'_>,
        gch_hack: bool,
    ) -> Result<IncludeProcessorResult, CompileError>;
}

fn run_cpp_include_processor(
    flags: &CompilerFlags,
    compiler_info: &CompilerInfo,
    caches: &mut IncludeProcessorCaches<'_>,
    gch_hack: bool,
) -> Result<IncludeProcessorResult, CompileError> {
    let mut bracket_dirs = flags.include_dirs.clone();
    bracket_dirs.extend(flags.system_include_dirs.iter().cloned());
    bracket_dirs.extend(compiler_info.system_include_dirs.iter().cloned());
    let mut framework_dirs = flags.framework_dirs.clone();
    framework_dirs.extend(compiler_info.system_framework_dirs.iter().cloned());

    let input = IncludeProcessorInput {
        cwd: flags.cwd.clone(),
        input_files: flags.input_filenames.clone(),
        forced_includes: flags.forced_includes.clone(),
        predefined_macros: compiler_info.predefined_macros.clone(),
        commandline_macros: flags.commandline_macros.clone(),
        capabilities: compiler_info.capabilities.clone(),
        search: IncludeSearchPaths::new(
            flags.quote_include_dirs.clone(),
            bracket_dirs,
            framework_dirs,
        ),
        ignore_case: cfg!(any(target_os = "windows", target_os = "macos")),
        gch_hack,
    };
    CppIncludeProcessor::run(&input, caches).map_err(CompileError::Transient)
}

struct GccTypeSpecific;

impl CompilerTypeSpecific for GccTypeSpecific {
    fn supports_deps_cache(&self, flags: &CompilerFlags) -> bool {
        flags.mode == CompileMode::Compiling
    }

    fn remote_compile_supported(&self, flags: &CompilerFlags) -> bool {
        !flags.requires_local_run() && flags.mode != CompileMode::Linking
    }

    fn run_include_processor(
        &self,
        flags: &CompilerFlags,
        compiler_info: &CompilerInfo,
        caches: &mut IncludeProcessorCaches<'_>,
        gch_hack: bool,
    ) -> Result<IncludeProcessorResult, CompileError> {
        run_cpp_include_processor(flags, compiler_info, caches, gch_hack)
    }
}

struct ClexeTypeSpecific;

impl CompilerTypeSpecific for ClexeTypeSpecific {
    fn supports_deps_cache(&self, flags: &CompilerFlags) -> bool {
        flags.mode == CompileMode::Compiling
    }

    fn remote_compile_supported(&self, flags: &CompilerFlags) -> bool {
        !flags.requires_local_run() && flags.mode == CompileMode::Compiling
    }

    fn run_include_processor(
        &self,
        flags: &CompilerFlags,
        compiler_info: &CompilerInfo,
        caches: &mut IncludeProcessorCaches<'_>,
        _gch_hack: bool,
    ) -> Result<IncludeProcessorResult, CompileError> {
        // cl.exe has no precompiled-header substitution on the search path.
        run_cpp_include_processor(flags, compiler_info, caches, false)
    }
}

struct ClangTidyTypeSpecific;

impl CompilerTypeSpecific for ClangTidyTypeSpecific {
    fn supports_deps_cache(&self, _flags: &CompilerFlags) -> bool {
        false
    }

    fn remote_compile_supported(&self, flags: &CompilerFlags) -> bool {
        !flags.requires_local_run()
    }

    fn run_include_processor(
        &self,
        flags: &CompilerFlags,
        compiler_info: &CompilerInfo,
        caches: &mut IncludeProcessorCaches<'_>,
        gch_hack: bool,
    ) -> Result<IncludeProcessorResult, CompileError> {
        run_cpp_include_processor(flags, compiler_info, caches, gch_hack)
    }
}

struct JavacTypeSpecific;

impl CompilerTypeSpecific for JavacTypeSpecific {
    fn supports_deps_cache(&self, _flags: &CompilerFlags) -> bool {
        false
    }

    fn remote_compile_supported(&self, _flags: &CompilerFlags) -> bool {
        true
    }

    fn run_include_processor(
        &self,
        _flags: &CompilerFlags,
        _compiler_info: &CompilerInfo,
        _caches: &mut IncludeProcessorCaches<'_>,
        _gch_hack: bool,
    ) -> Result<IncludeProcessorResult, CompileError> {
        // Java inputs carry no headers; the classpath entries are already explicit inputs.
        Ok(IncludeProcessorResult::default())
    }
}

struct JavaTypeSpecific;

impl CompilerTypeSpecific for JavaTypeSpecific {
    fn supports_deps_cache(&self, _flags: &CompilerFlags) -> bool {
        false
    }

    fn remote_compile_supported(&self, _flags: &CompilerFlags) -> bool {
        false
    }

    fn run_include_processor(
        &self,
        _flags: &CompilerFlags,
        _compiler_info: &CompilerInfo,
        _caches: &mut IncludeProcessorCaches<'_>,
        _gch_hack: bool,
    ) -> Result<IncludeProcessorResult, CompileError> {
        Ok(IncludeProcessorResult::default())
    }
}

struct FakeTypeSpecific;

impl CompilerTypeSpecific for FakeTypeSpecific {
    fn supports_deps_cache(&self, _flags: &CompilerFlags) -> bool {
        false
    }

    fn remote_compile_supported(&self, _flags: &CompilerFlags) -> bool {
        true
    }

    fn run_include_processor(
        &self,
        _flags: &CompilerFlags,
        _compiler_info: &CompilerInfo,
        _caches: &mut IncludeProcessorCaches<'_>,
        _gch_hack: bool,
    ) -> Result<IncludeProcessorResult, CompileError> {
        Ok(IncludeProcessorResult::default())
    }
}
