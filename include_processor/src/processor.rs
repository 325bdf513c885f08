// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The include processor: walks a translation unit's directives, tracking macro state and
//! conditional branches, resolving includes through the finder, and recursing into each header
//! once. It enumerates the transitive header closure without running the real preprocessor.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use fs::{FileStatCache, ListDirCache};

use crate::cond_expr::{evaluate, Probe};
use crate::directive::{Directive, Token};
use crate::include_cache::IncludeCache;
use crate::include_file_finder::{IncludeFileFinder, IncludeSearchPaths, CURRENT_DIR_INDEX};
use crate::macro_env::{spell_tight, MacroEnv};

/// Cycles between unguarded headers are rare and always a bug; cap recursion rather than spin.
const MAX_INCLUDE_DEPTH: usize = 1024;

///
/// Capability tables from the compiler descriptor, consulted by `__has_feature` and friends.
/// Values are what the probe evaluates to; absent names evaluate to 0.
///
#[derive(Clone, Debug, Default)]
pub struct CppCompilerCapabilities {
    pub features: HashMap<String, i64>,
    pub extensions: HashMap<String, i64>,
    pub attributes: HashMap<String, i64>,
    pub cpp_attributes: HashMap<String, i64>,
    pub declspec_attributes: HashMap<String, i64>,
    pub builtins: HashMap<String, i64>,
}

impl CppCompilerCapabilities {
    fn lookup(&self, function: &str, name: &str) -> i64 {
        let table = match function {
            "__has_feature" => &self.features,
            "__has_extension" => &self.extensions,
            "__has_attribute" => &self.attributes,
            "__has_cpp_attribute" => &self.cpp_attributes,
            "__has_declspec_attribute" => &self.declspec_attributes,
            "__has_builtin" => &self.builtins,
            _ => return 0,
        };
        table.get(name).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub enum CommandLineMacro {
    Define(String, Option<String>),
    Undef(String),
}

///
/// Everything one run needs to know about the compile, already digested by the flag parser and
/// compiler-info service.
///
pub struct IncludeProcessorInput {
    pub cwd: PathBuf,
    pub input_files: Vec<PathBuf>,
    /// `-include` operands, expanded before each primary input.
    pub forced_includes: Vec<String>,
    /// `-dM`-style dump of the compiler's predefined macros.
    pub predefined_macros: String,
    pub commandline_macros: Vec<CommandLineMacro>,
    pub capabilities: CppCompilerCapabilities,
    pub search: IncludeSearchPaths,
    pub ignore_case: bool,
    pub gch_hack: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IncludeProcessorResult {
    /// Every header the compiler would read, as resolved paths. Excludes the primary inputs.
    pub required_files: BTreeSet<PathBuf>,
    pub total_files: u64,
    pub skipped_files: u64,
}

/// The shared caches a run reads through. The stat cache is the task's own; the others are
/// process-wide.
pub struct IncludeProcessorCaches<'a> {
    pub include_cache: &'a IncludeCache,
    pub list_dir_cache: &'a ListDirCache,
    pub stat_cache: &'a mut FileStatCache,
}

struct CondFrame {
    parent_active: bool,
    active: bool,
    taken: bool,
}

pub struct CppIncludeProcessor {
    cwd: PathBuf,
    macros: MacroEnv,
    capabilities: CppCompilerCapabilities,
    finder: IncludeFileFinder,
    included_once: HashSet<PathBuf>,
    required_files: BTreeSet<PathBuf>,
    total_files: u64,
    skipped_files: u64,
}

impl CppIncludeProcessor {
    pub fn new(input: &IncludeProcessorInput) -> CppIncludeProcessor {
        let mut macros = MacroEnv::new();
        macros.add_predefined_macros(&input.predefined_macros);
        for commandline_macro in &input.commandline_macros {
            match commandline_macro {
                CommandLineMacro::Define(name, value) => {
                    macros.define_object(name, value.as_deref().unwrap_or("1"));
                }
                CommandLineMacro::Undef(name) => macros.undef(name),
            }
        }

        let finder = IncludeFileFinder::new(
            input.cwd.clone(),
            input.ignore_case,
            input.gch_hack,
            input.search.clone(),
        );

        CppIncludeProcessor {
            cwd: input.cwd.clone(),
            macros,
            capabilities: input.capabilities.clone(),
            finder,
            included_once: HashSet::new(),
            required_files: BTreeSet::new(),
            total_files: 0,
            skipped_files: 0,
        }
    }

    ///
    /// Runs the processor over every forced include and primary input of `input`. A failure to
    /// read or parse a primary input fails the run; failures inside headers are logged and
    /// tolerated, matching how the real preprocessor's include probes behave.
    ///
    pub fn run(
        input: &IncludeProcessorInput,
        caches: &mut IncludeProcessorCaches<'_>,
    ) -> Result<IncludeProcessorResult, String> {
        let mut processor = CppIncludeProcessor::new(input);

        for forced in &input.forced_includes {
            let cwd = processor.cwd.clone();
            match processor.finder.lookup(
                forced,
                true,
                Some(&cwd),
                CURRENT_DIR_INDEX,
                caches.stat_cache,
                caches.list_dir_cache,
            ) {
                Some((path, root_index)) => {
                    processor.required_files.insert(path.clone());
                    processor.expand_file(&path, root_index, 0, caches);
                }
                None => {
                    return Err(format!("forced include not found: {forced}"));
                }
            }
        }

        for input_file in &input.input_files {
            let path = processor.cwd.join(input_file);
            if !processor.expand_file(&path, CURRENT_DIR_INDEX, 0, caches) {
                return Err(format!("failed to process input: {}", path.display()));
            }
        }

        Ok(IncludeProcessorResult {
            required_files: processor.required_files,
            total_files: processor.total_files,
            skipped_files: processor.skipped_files,
        })
    }

    ///
    /// Expands one file. Returns false only when the file could not be read or parsed; a
    /// skipped-by-guard file is a successful expansion.
    ///
    fn expand_file(
        &mut self,
        path: &Path,
        root_index: usize,
        depth: usize,
        caches: &mut IncludeProcessorCaches<'_>,
    ) -> bool {
        if depth > MAX_INCLUDE_DEPTH {
            warn!("include depth limit reached at {}", path.display());
            return true;
        }
        self.total_files += 1;

        if self.included_once.contains(path) {
            self.skipped_files += 1;
            return true;
        }

        let file_stat = caches.stat_cache.get(path);
        if !file_stat.is_valid() {
            debug!("cannot stat {}", path.display());
            return false;
        }
        let Some(item) = caches.include_cache.get_include_item(path, &file_stat) else {
            debug!("cannot parse {}", path.display());
            return false;
        };

        // Include-guard fast path: when the guard macro is already defined, walking the
        // directives again cannot change anything.
        if let Some(guard) = &item.include_guard_ident {
            if self.macros.is_defined(guard) {
                self.skipped_files += 1;
                return true;
            }
        }

        let current_dir = path.parent().map(Path::to_path_buf);
        let mut cond_stack: Vec<CondFrame> = Vec::new();

        for directive in item.directives.iter() {
            let active = cond_stack.iter().all(|frame| frame.active);
            match directive {
                Directive::If(tokens) => {
                    let taken = active
                        && self.eval_condition(tokens, current_dir.as_deref(), root_index, caches)
                            != 0;
                    cond_stack.push(CondFrame {
                        parent_active: active,
                        active: taken,
                        taken,
                    });
                }
                Directive::Ifdef(name) => {
                    let taken = active && self.macros.is_defined(name);
                    cond_stack.push(CondFrame {
                        parent_active: active,
                        active: taken,
                        taken,
                    });
                }
                Directive::Ifndef(name) => {
                    let taken = active && !self.macros.is_defined(name);
                    cond_stack.push(CondFrame {
                        parent_active: active,
                        active: taken,
                        taken,
                    });
                }
                Directive::Elif(tokens) => {
                    let evaluated = match cond_stack.last() {
                        Some(frame) if frame.taken => Some(false),
                        Some(frame) if frame.parent_active => Some(
                            self.eval_condition(tokens, current_dir.as_deref(), root_index, caches)
                                != 0,
                        ),
                        Some(_) => Some(false),
                        None => None,
                    };
                    if let (Some(value), Some(frame)) = (evaluated, cond_stack.last_mut()) {
                        if frame.taken {
                            frame.active = false;
                        } else {
                            frame.active = value;
                            frame.taken = value;
                        }
                    }
                }
                Directive::Else => {
                    if let Some(frame) = cond_stack.last_mut() {
                        frame.active = frame.parent_active && !frame.taken;
                        frame.taken = true;
                    }
                }
                Directive::Endif => {
                    cond_stack.pop();
                }
                Directive::Define(name, def) if active => {
                    self.macros.define(name, def.clone());
                }
                Directive::Undef(name) if active => {
                    self.macros.undef(name);
                }
                Directive::PragmaOnce if active => {
                    self.included_once.insert(path.to_path_buf());
                }
                Directive::Include(tokens) | Directive::Import(tokens) if active => {
                    let mark_once = matches!(directive, Directive::Import(_));
                    self.process_include(
                        tokens,
                        current_dir.as_deref(),
                        CURRENT_DIR_INDEX,
                        mark_once,
                        depth,
                        caches,
                    );
                }
                Directive::IncludeNext(tokens) if active => {
                    self.process_include(
                        tokens,
                        current_dir.as_deref(),
                        root_index + 1,
                        false,
                        depth,
                        caches,
                    );
                }
                _ => {}
            }
        }
        true
    }

    fn process_include(
        &mut self,
        tokens: &[Token],
        current_dir: Option<&Path>,
        start_index: usize,
        mark_once: bool,
        depth: usize,
        caches: &mut IncludeProcessorCaches<'_>,
    ) {
        let Some((operand, is_quote)) = self.include_operand(tokens) else {
            debug!("unintelligible include operand: {tokens:?}");
            return;
        };
        let resolved = self.finder.lookup(
            &operand,
            is_quote,
            current_dir,
            start_index,
            caches.stat_cache,
            caches.list_dir_cache,
        );
        let Some((path, root_index)) = resolved else {
            // Not found: the real compiler would error out later (or the include sits behind a
            // probe); either way it is not this engine's error to report.
            debug!("include not found: {operand}");
            return;
        };

        self.required_files.insert(path.clone());
        if mark_once {
            self.included_once.insert(path.clone());
        }
        self.expand_file(&path, root_index, depth + 1, caches);
    }

    ///
    /// Interprets the token stream after `#include`: a string literal, an angle-bracketed
    /// sequence, or macros that expand to either.
    ///
    fn include_operand(&self, tokens: &[Token]) -> Option<(String, bool)> {
        match tokens.first() {
            Some(Token::Str(operand)) => return Some((operand.clone(), true)),
            Some(Token::Punct("<")) => return Some((angle_operand(&tokens[1..]), false)),
            _ => {}
        }
        let expanded = self.macros.expand(tokens);
        match expanded.first() {
            Some(Token::Str(operand)) => Some((operand.clone(), true)),
            Some(Token::Punct("<")) => Some((angle_operand(&expanded[1..]), false)),
            _ => None,
        }
    }

    fn eval_condition(
        &mut self,
        tokens: &[Token],
        current_dir: Option<&Path>,
        root_index: usize,
        caches: &mut IncludeProcessorCaches<'_>,
    ) -> i64 {
        let macros = &self.macros;
        let capabilities = &self.capabilities;
        let finder = &mut self.finder;
        let stat_cache = &mut *caches.stat_cache;
        let list_dir_cache = caches.list_dir_cache;

        let mut probe = |probe: Probe<'_>| -> i64 {
            match probe {
                Probe::HasInclude {
                    tokens,
                    include_next,
                } => {
                    let operand = match tokens.first() {
                        Some(Token::Str(operand)) => Some((operand.clone(), true)),
                        Some(Token::Punct("<")) => Some((angle_operand(&tokens[1..]), false)),
                        _ => {
                            let expanded = macros.expand(tokens);
                            match expanded.first() {
                                Some(Token::Str(operand)) => Some((operand.clone(), true)),
                                Some(Token::Punct("<")) => {
                                    Some((angle_operand(&expanded[1..]), false))
                                }
                                _ => None,
                            }
                        }
                    };
                    let Some((operand, is_quote)) = operand else {
                        return 0;
                    };
                    let start_index = if include_next { root_index + 1 } else { 0 };
                    let found = finder
                        .lookup(
                            &operand,
                            is_quote,
                            current_dir,
                            start_index,
                            stat_cache,
                            list_dir_cache,
                        )
                        .is_some();
                    i64::from(found)
                }
                Probe::Capability { function, name } => capabilities.lookup(function, name),
            }
        };
        evaluate(tokens, macros, &mut probe)
    }
}

/// Joins the tokens of an angle include up to (not including) the closing `>`.
fn angle_operand(tokens: &[Token]) -> String {
    let end = tokens
        .iter()
        .position(|t| matches!(t, Token::Punct(">")))
        .unwrap_or(tokens.len());
    spell_tight(&tokens[..end])
}
