// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Fingerprint construction: the canonical strings whose SHA-256 keys the deps cache and the
//! local output cache. Two invocations with equal fingerprints are interchangeable for the
//! purpose the respective cache serves.

use hashing::{Digest, Fingerprint};
use include_processor::CommandLineMacro;

use crate::command::CompilerFlags;
use crate::compiler_info::CompilerInfo;

///
/// The deps-cache identifier: everything that can change which headers an invocation reads.
/// Output paths and codegen flags deliberately do not participate.
///
pub fn make_deps_identifier(
    compiler_info: &CompilerInfo,
    flags: &CompilerFlags,
) -> Fingerprint {
    let mut canonical = String::new();
    push_field(&mut canonical, "compiler_name", &compiler_info.name);
    push_field(
        &mut canonical,
        "real_compiler_path",
        &compiler_info.real_compiler_path.display().to_string(),
    );
    push_field(
        &mut canonical,
        "compiler_hash",
        &compiler_info.real_compiler_hash.to_hex(),
    );
    push_field(&mut canonical, "cwd", &flags.cwd.display().to_string());
    push_list(
        &mut canonical,
        "input",
        flags.input_filenames.iter().map(|p| p.display().to_string()),
    );
    push_list(
        &mut canonical,
        "system_include_paths",
        compiler_info
            .system_include_dirs
            .iter()
            .chain(&compiler_info.system_framework_dirs)
            .map(|p| p.display().to_string()),
    );
    push_field(
        &mut canonical,
        "predefined_macros",
        &compiler_info.predefined_macros,
    );
    push_list(
        &mut canonical,
        "include_dirs",
        flags
            .quote_include_dirs
            .iter()
            .chain(&flags.include_dirs)
            .chain(&flags.system_include_dirs)
            .chain(&flags.framework_dirs)
            .map(|p| p.display().to_string()),
    );
    push_list(
        &mut canonical,
        "commandline_macros",
        flags.commandline_macros.iter().map(spell_macro),
    );
    push_list(
        &mut canonical,
        "compiler_info_flags",
        compiler_info.additional_flags.iter().cloned(),
    );
    Digest::of_bytes(canonical.as_bytes()).hash
}

///
/// The local-output-cache key: the deps identifier's ingredients plus the full argument vector
/// and the content hash of every input the compile reads. Equal keys mean byte-identical
/// outputs are acceptable.
///
pub fn make_local_output_key(
    compiler_info: &CompilerInfo,
    flags: &CompilerFlags,
    input_content_hashes: &[(String, Fingerprint)],
) -> Fingerprint {
    let mut canonical = String::new();
    push_field(
        &mut canonical,
        "deps_identifier",
        &make_deps_identifier(compiler_info, flags).to_hex(),
    );
    push_list(&mut canonical, "args", flags.args.iter().cloned());
    push_list(
        &mut canonical,
        "inputs",
        input_content_hashes
            .iter()
            .map(|(path, hash)| format!("{path}={}", hash.to_hex())),
    );
    Digest::of_bytes(canonical.as_bytes()).hash
}

fn push_field(canonical: &mut String, key: &str, value: &str) {
    canonical.push_str(key);
    canonical.push('=');
    canonical.push_str(value);
    canonical.push(':');
}

fn push_list<I: Iterator<Item = String>>(canonical: &mut String, key: &str, values: I) {
    canonical.push_str(key);
    canonical.push('=');
    for value in values {
        canonical.push_str(&value);
        canonical.push(',');
    }
    canonical.push(':');
}

fn spell_macro(commandline_macro: &CommandLineMacro) -> String {
    match commandline_macro {
        CommandLineMacro::Define(name, None) => format!("-D{name}"),
        CommandLineMacro::Define(name, Some(value)) => format!("-D{name}={value}"),
        CommandLineMacro::Undef(name) => format!("-U{name}"),
    }
}
