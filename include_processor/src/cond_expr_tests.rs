// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::cond_expr::{evaluate, Probe};
use crate::directive::tokenize;
use crate::macro_env::MacroEnv;

fn eval(expression: &str, macros: &MacroEnv) -> i64 {
    evaluate(&tokenize(expression), macros, &mut |_| 0)
}

fn eval_plain(expression: &str) -> i64 {
    eval(expression, &MacroEnv::new())
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(eval_plain("1 + 2 * 3"), 7);
    assert_eq!(eval_plain("(1 + 2) * 3"), 9);
    assert_eq!(eval_plain("10 / 2 - 3"), 2);
    assert_eq!(eval_plain("7 % 4"), 3);
}

#[test]
fn shifts_and_bitwise() {
    assert_eq!(eval_plain("1 << 4"), 16);
    assert_eq!(eval_plain("0xf0 >> 4"), 0xf);
    assert_eq!(eval_plain("0xf0 | 0x0f"), 0xff);
    assert_eq!(eval_plain("0xf0 & 0x1f"), 0x10);
    assert_eq!(eval_plain("1 ^ 3"), 2);
    assert_eq!(eval_plain("~0"), -1);
}

#[test]
fn comparisons_and_logic() {
    assert_eq!(eval_plain("1 < 2 && 3 >= 3"), 1);
    assert_eq!(eval_plain("1 == 2 || 2 != 3"), 1);
    assert_eq!(eval_plain("!1"), 0);
    assert_eq!(eval_plain("!0"), 1);
}

#[test]
fn ternary() {
    assert_eq!(eval_plain("1 ? 10 : 20"), 10);
    assert_eq!(eval_plain("0 ? 10 : 20"), 20);
}

#[test]
fn number_forms() {
    assert_eq!(eval_plain("0x10"), 16);
    assert_eq!(eval_plain("010"), 8);
    assert_eq!(eval_plain("0b101"), 5);
    assert_eq!(eval_plain("42L"), 42);
    assert_eq!(eval_plain("42UL"), 42);
    assert_eq!(eval_plain("'A'"), 65);
    assert_eq!(eval_plain("'\\n'"), 10);
}

#[test]
fn division_by_zero_is_zero() {
    assert_eq!(eval_plain("1 / 0"), 0);
    assert_eq!(eval_plain("1 % 0"), 0);
}

#[test]
fn unknown_identifier_is_zero() {
    assert_eq!(eval_plain("SOME_UNDEFINED_MACRO"), 0);
    assert_eq!(eval_plain("SOME_UNDEFINED_MACRO + 1"), 1);
}

#[test]
fn defined_operator() {
    let mut macros = MacroEnv::new();
    macros.define_object("FOO", "1");
    assert_eq!(eval("defined(FOO)", &macros), 1);
    assert_eq!(eval("defined FOO", &macros), 1);
    assert_eq!(eval("defined(BAR)", &macros), 0);
    assert_eq!(eval("!defined(BAR)", &macros), 1);
}

#[test]
fn defined_operand_survives_macro_valued_condition() {
    // `#define HAVE defined(FOO)` then `#if HAVE`.
    let mut macros = MacroEnv::new();
    macros.define_object("FOO", "1");
    macros.define_object("HAVE", "defined(FOO)");
    assert_eq!(eval("HAVE", &macros), 1);
}

#[test]
fn macro_expansion_in_condition() {
    let mut macros = MacroEnv::new();
    macros.define_object("VERSION", "40800");
    assert_eq!(eval("VERSION >= 40000", &macros), 1);
    assert_eq!(eval("VERSION >= 50000", &macros), 0);
}

#[test]
fn function_macro_in_condition() {
    let mut macros = MacroEnv::new();
    macros.add_predefined_macros(
        "#define GCC_VERSION(major, minor) ((major) * 1000 + (minor))\n",
    );
    assert_eq!(eval("GCC_VERSION(4, 8) == 4008", &macros), 1);
}

#[test]
fn has_include_goes_through_probe() {
    let macros = MacroEnv::new();
    let mut seen = Vec::new();
    let value = evaluate(
        &tokenize("__has_include(<stddef.h>)"),
        &macros,
        &mut |probe| match probe {
            Probe::HasInclude { include_next, .. } => {
                seen.push(include_next);
                1
            }
            Probe::Capability { .. } => panic!("unexpected capability probe"),
        },
    );
    assert_eq!(value, 1);
    assert_eq!(seen, vec![false]);
}

#[test]
fn has_include_next_is_distinguished() {
    let macros = MacroEnv::new();
    let value = evaluate(
        &tokenize("__has_include_next(\"x.h\")"),
        &macros,
        &mut |probe| match probe {
            Probe::HasInclude { include_next, .. } => i64::from(include_next),
            Probe::Capability { .. } => 0,
        },
    );
    assert_eq!(value, 1);
}

#[test]
fn capability_names_are_normalized() {
    let macros = MacroEnv::new();
    let mut names = Vec::new();
    evaluate(
        &tokenize("__has_feature(__cxx_rvalue_references__)"),
        &macros,
        &mut |probe| match probe {
            Probe::Capability { function, name } => {
                names.push((function.to_string(), name.to_string()));
                1
            }
            Probe::HasInclude { .. } => 0,
        },
    );
    assert_eq!(
        names,
        vec![(
            "__has_feature".to_string(),
            "cxx_rvalue_references".to_string()
        )]
    );
}

#[test]
fn missing_parenthesis_on_probe_is_zero() {
    let macros = MacroEnv::new();
    assert_eq!(
        evaluate(&tokenize("__has_include"), &macros, &mut |_| 1),
        0
    );
}

#[test]
fn true_keyword_is_one() {
    assert_eq!(eval_plain("true"), 1);
    assert_eq!(eval_plain("false"), 0);
}
