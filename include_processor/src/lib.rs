// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod cond_expr;
#[cfg(test)]
mod cond_expr_tests;
mod directive;
mod directive_filter;
mod hmap;
mod include_cache;
#[cfg(test)]
mod include_cache_tests;
mod include_file_finder;
#[cfg(test)]
mod include_file_finder_tests;
mod macro_env;
mod processor;

pub use crate::directive::{Directive, DirectiveList, IncludeItem, MacroDef, Token};
pub use crate::directive_filter::filtered_content;
pub use crate::include_cache::{IncludeCache, IncludeCacheStats};
pub use crate::include_file_finder::{
    IncludeDir, IncludeDirKind, IncludeFileFinder, IncludeSearchPaths, CURRENT_DIR_INDEX,
    GCH_SUFFIX,
};
pub use crate::macro_env::MacroEnv;
pub use crate::processor::{
    CommandLineMacro, CppCompilerCapabilities, CppIncludeProcessor, IncludeProcessorCaches,
    IncludeProcessorInput, IncludeProcessorResult,
};
