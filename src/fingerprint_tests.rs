// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::PathBuf;

use include_processor::CommandLineMacro;

use crate::command_tests::minimal_flags;
use crate::compiler_info::CompilerInfo;
use crate::fingerprint::{make_deps_identifier, make_local_output_key};
use crate::testing::test_fingerprint;

fn info() -> CompilerInfo {
    CompilerInfo {
        name: "gcc".to_string(),
        version: "9.3.0".to_string(),
        target: "x86_64-linux-gnu".to_string(),
        real_compiler_path: PathBuf::from("/usr/bin/gcc"),
        real_compiler_hash: test_fingerprint("gcc"),
        predefined_macros: "#define __GNUC__ 9\n".to_string(),
        system_include_dirs: vec![PathBuf::from("/usr/include")],
        system_framework_dirs: Vec::new(),
        capabilities: include_processor::CppCompilerCapabilities::default(),
        additional_flags: vec!["-std=c++17".to_string()],
    }
}

#[test]
fn identical_inputs_are_interchangeable() {
    let mut flags = minimal_flags("gcc", PathBuf::from("/build"));
    flags.input_filenames = vec![PathBuf::from("foo.c")];
    assert_eq!(
        make_deps_identifier(&info(), &flags),
        make_deps_identifier(&info(), &flags)
    );
}

#[test]
fn identifier_depends_on_each_ingredient() {
    let mut base_flags = minimal_flags("gcc", PathBuf::from("/build"));
    base_flags.input_filenames = vec![PathBuf::from("foo.c")];
    let base = make_deps_identifier(&info(), &base_flags);

    let mut other_cwd = base_flags.clone();
    other_cwd.cwd = PathBuf::from("/elsewhere");
    assert_ne!(base, make_deps_identifier(&info(), &other_cwd));

    let mut other_input = base_flags.clone();
    other_input.input_filenames = vec![PathBuf::from("bar.c")];
    assert_ne!(base, make_deps_identifier(&info(), &other_input));

    let mut other_macros = base_flags.clone();
    other_macros.commandline_macros =
        vec![CommandLineMacro::Define("NDEBUG".to_string(), None)];
    assert_ne!(base, make_deps_identifier(&info(), &other_macros));

    let mut other_includes = base_flags.clone();
    other_includes.include_dirs = vec![PathBuf::from("include")];
    assert_ne!(base, make_deps_identifier(&info(), &other_includes));

    let mut other_compiler = info();
    other_compiler.real_compiler_hash = test_fingerprint("different binary");
    assert_ne!(base, make_deps_identifier(&other_compiler, &base_flags));

    let mut other_predefined = info();
    other_predefined.predefined_macros.push_str("#define X 1\n");
    assert_ne!(base, make_deps_identifier(&other_predefined, &base_flags));
}

#[test]
fn identifier_ignores_output_paths() {
    let mut base_flags = minimal_flags("gcc", PathBuf::from("/build"));
    base_flags.input_filenames = vec![PathBuf::from("foo.c")];
    let base = make_deps_identifier(&info(), &base_flags);

    let mut other_output = base_flags.clone();
    other_output.output_filenames = vec![PathBuf::from("different.o")];
    assert_eq!(base, make_deps_identifier(&info(), &other_output));
}

#[test]
fn local_output_key_sees_args_and_contents() {
    let mut flags = minimal_flags("gcc", PathBuf::from("/build"));
    flags.input_filenames = vec![PathBuf::from("foo.c")];
    let hashes = vec![("foo.c".to_string(), test_fingerprint("contents-v1"))];
    let base = make_local_output_key(&info(), &flags, &hashes);

    let changed_contents = vec![("foo.c".to_string(), test_fingerprint("contents-v2"))];
    assert_ne!(base, make_local_output_key(&info(), &flags, &changed_contents));

    let mut changed_args = flags.clone();
    changed_args.args.push("-O2".to_string());
    assert_ne!(base, make_local_output_key(&info(), &changed_args, &hashes));

    assert_eq!(base, make_local_output_key(&info(), &flags, &hashes));
}
