// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Evaluation of `#if`/`#elif` controlling expressions: signed 64-bit arithmetic with C
//! preprocessor operator precedence, `defined`, and the `__has_*` probe family. Probes are
//! answered by the caller so this module stays free of filesystem and compiler-info knowledge.

use log::debug;

use crate::directive::Token;
use crate::macro_env::{spell_tight, MacroEnv};

///
/// A question the evaluator cannot answer on its own. `HasInclude` resolves through the
/// include-file finder without side effects; `Capability` consults the compiler descriptor's
/// feature/extension/attribute/builtin tables.
///
pub enum Probe<'a> {
    HasInclude {
        tokens: &'a [Token],
        include_next: bool,
    },
    Capability {
        function: &'a str,
        name: &'a str,
    },
}

const CAPABILITY_FUNCTIONS: &[&str] = &[
    "__has_feature",
    "__has_extension",
    "__has_attribute",
    "__has_cpp_attribute",
    "__has_declspec_attribute",
    "__has_builtin",
];

///
/// Evaluates a controlling expression. Unknown identifiers evaluate to 0, like the real
/// preprocessor; malformed expressions evaluate to 0 with a debug log rather than failing the
/// compile.
///
pub fn evaluate(
    tokens: &[Token],
    macros: &MacroEnv,
    probe: &mut dyn FnMut(Probe) -> i64,
) -> i64 {
    let resolved = resolve_defined(tokens, macros);
    let expanded = macros.expand(&resolved);
    let resolved = resolve_defined(&expanded, macros);
    let resolved = resolve_probes(&resolved, probe);

    let mut parser = Parser {
        tokens: &resolved,
        pos: 0,
    };
    let value = parser.ternary();
    if parser.pos < parser.tokens.len() {
        debug!("trailing tokens in conditional expression: {:?}", &parser.tokens[parser.pos..]);
    }
    value
}

/// Replaces `defined X` / `defined(X)` with 1 or 0. Runs both before and after expansion, since
/// macro bodies commonly contain `defined`.
fn resolve_defined(tokens: &[Token], macros: &MacroEnv) -> Vec<Token> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < tokens.len() {
        match &tokens[pos] {
            Token::Ident(name) if name == "defined" => {
                pos += 1;
                let parenthesized = matches!(tokens.get(pos), Some(Token::Punct("(")));
                if parenthesized {
                    pos += 1;
                }
                let value = match tokens.get(pos) {
                    Some(Token::Ident(operand)) => {
                        pos += 1;
                        i64::from(macros.is_defined(operand))
                    }
                    _ => 0,
                };
                if parenthesized && matches!(tokens.get(pos), Some(Token::Punct(")"))) {
                    pos += 1;
                }
                out.push(Token::Number(value.to_string()));
            }
            other => {
                out.push(other.clone());
                pos += 1;
            }
        }
    }
    out
}

/// Replaces `__has_include(...)` and the capability probes with numeric tokens.
fn resolve_probes(tokens: &[Token], probe: &mut dyn FnMut(Probe) -> i64) -> Vec<Token> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < tokens.len() {
        let function = match &tokens[pos] {
            Token::Ident(name)
                if name == "__has_include"
                    || name == "__has_include_next"
                    || CAPABILITY_FUNCTIONS.contains(&name.as_str()) =>
            {
                name.clone()
            }
            other => {
                out.push(other.clone());
                pos += 1;
                continue;
            }
        };
        pos += 1;
        if !matches!(tokens.get(pos), Some(Token::Punct("("))) {
            out.push(Token::Number("0".to_string()));
            continue;
        }
        let mut depth = 0_usize;
        let start = pos + 1;
        let mut end = start;
        while pos < tokens.len() {
            match tokens[pos] {
                Token::Punct("(") => depth += 1,
                Token::Punct(")") => {
                    depth -= 1;
                    if depth == 0 {
                        end = pos;
                        pos += 1;
                        break;
                    }
                }
                _ => {}
            }
            pos += 1;
        }
        let operand = &tokens[start..end.max(start)];
        let value = if function.starts_with("__has_include") {
            probe(Probe::HasInclude {
                tokens: operand,
                include_next: function == "__has_include_next",
            })
        } else {
            probe(Probe::Capability {
                function: &function,
                name: &normalize_capability_name(operand),
            })
        };
        out.push(Token::Number(value.to_string()));
    }
    out
}

/// `__X__` and `X` name the same capability.
fn normalize_capability_name(tokens: &[Token]) -> String {
    let spelled = spell_tight(tokens);
    match spelled.strip_prefix("__").and_then(|s| s.strip_suffix("__")) {
        Some(inner) if !inner.is_empty() => inner.to_string(),
        _ => spelled,
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ternary(&mut self) -> i64 {
        let condition = self.logical_or();
        if self.eat_punct("?") {
            let then_value = self.ternary();
            let else_value = if self.eat_punct(":") { self.ternary() } else { 0 };
            return if condition != 0 { then_value } else { else_value };
        }
        condition
    }

    fn logical_or(&mut self) -> i64 {
        let mut value = self.logical_and();
        while self.eat_punct("||") {
            let rhs = self.logical_and();
            value = i64::from(value != 0 || rhs != 0);
        }
        value
    }

    fn logical_and(&mut self) -> i64 {
        let mut value = self.bit_or();
        while self.eat_punct("&&") {
            let rhs = self.bit_or();
            value = i64::from(value != 0 && rhs != 0);
        }
        value
    }

    fn bit_or(&mut self) -> i64 {
        let mut value = self.bit_xor();
        loop {
            // `||` is consumed by logical_or; a lone `|` is this level.
            if matches!(self.peek(), Some(Token::Punct("|"))) {
                self.pos += 1;
                value |= self.bit_xor();
            } else {
                return value;
            }
        }
    }

    fn bit_xor(&mut self) -> i64 {
        let mut value = self.bit_and();
        while self.eat_punct("^") {
            value ^= self.bit_and();
        }
        value
    }

    fn bit_and(&mut self) -> i64 {
        let mut value = self.equality();
        while matches!(self.peek(), Some(Token::Punct("&"))) {
            self.pos += 1;
            value &= self.equality();
        }
        value
    }

    fn equality(&mut self) -> i64 {
        let mut value = self.relational();
        loop {
            if self.eat_punct("==") {
                value = i64::from(value == self.relational());
            } else if self.eat_punct("!=") {
                value = i64::from(value != self.relational());
            } else {
                return value;
            }
        }
    }

    fn relational(&mut self) -> i64 {
        let mut value = self.shift();
        loop {
            if self.eat_punct("<=") {
                value = i64::from(value <= self.shift());
            } else if self.eat_punct(">=") {
                value = i64::from(value >= self.shift());
            } else if self.eat_punct("<") {
                value = i64::from(value < self.shift());
            } else if self.eat_punct(">") {
                value = i64::from(value > self.shift());
            } else {
                return value;
            }
        }
    }

    fn shift(&mut self) -> i64 {
        let mut value = self.additive();
        loop {
            if self.eat_punct("<<") {
                value = value.wrapping_shl(self.additive() as u32);
            } else if self.eat_punct(">>") {
                value = value.wrapping_shr(self.additive() as u32);
            } else {
                return value;
            }
        }
    }

    fn additive(&mut self) -> i64 {
        let mut value = self.multiplicative();
        loop {
            if self.eat_punct("+") {
                value = value.wrapping_add(self.multiplicative());
            } else if self.eat_punct("-") {
                value = value.wrapping_sub(self.multiplicative());
            } else {
                return value;
            }
        }
    }

    fn multiplicative(&mut self) -> i64 {
        let mut value = self.unary();
        loop {
            if self.eat_punct("*") {
                value = value.wrapping_mul(self.unary());
            } else if self.eat_punct("/") {
                let rhs = self.unary();
                value = if rhs == 0 {
                    debug!("division by zero in conditional expression");
                    0
                } else {
                    value.wrapping_div(rhs)
                };
            } else if self.eat_punct("%") {
                let rhs = self.unary();
                value = if rhs == 0 { 0 } else { value.wrapping_rem(rhs) };
            } else {
                return value;
            }
        }
    }

    fn unary(&mut self) -> i64 {
        if self.eat_punct("!") {
            return i64::from(self.unary() == 0);
        }
        if self.eat_punct("~") {
            return !self.unary();
        }
        if self.eat_punct("-") {
            return self.unary().wrapping_neg();
        }
        if self.eat_punct("+") {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> i64 {
        match self.peek() {
            Some(Token::Punct("(")) => {
                self.pos += 1;
                let value = self.ternary();
                self.eat_punct(")");
                value
            }
            Some(Token::Number(text)) => {
                self.pos += 1;
                parse_pp_number(text)
            }
            Some(Token::Char(text)) => {
                self.pos += 1;
                char_literal_value(text)
            }
            Some(Token::Ident(name)) => {
                let value = match name.as_str() {
                    "true" => 1,
                    // Any identifier that survives expansion evaluates to 0.
                    _ => 0,
                };
                self.pos += 1;
                value
            }
            _ => {
                self.pos += 1;
                0
            }
        }
    }
}

fn parse_pp_number(text: &str) -> i64 {
    let trimmed = text
        .trim_end_matches(|c: char| matches!(c, 'u' | 'U' | 'l' | 'L'))
        .replace('\'', "");

    let (digits, radix) = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(bin) = trimmed.strip_prefix("0b").or_else(|| trimmed.strip_prefix("0B")) {
        (bin, 2)
    } else if trimmed.len() > 1 && trimmed.starts_with('0') && trimmed.chars().all(|c| c.is_ascii_digit()) {
        (&trimmed[1..], 8)
    } else {
        (trimmed.as_str(), 10)
    };

    // Preprocessor arithmetic wraps at 64 bits: parse as unsigned first so values with the high
    // bit set (e.g. 0xffffffffffffffff) land as their two's-complement selves.
    u64::from_str_radix(digits, radix)
        .map(|v| v as i64)
        .or_else(|_| i64::from_str_radix(digits, radix))
        .unwrap_or(0)
}

fn char_literal_value(text: &str) -> i64 {
    let mut chars = text.chars();
    match chars.next() {
        Some('\\') => match chars.next() {
            Some('n') => 10,
            Some('t') => 9,
            Some('r') => 13,
            Some('0') => 0,
            Some('\\') => 92,
            Some('\'') => 39,
            Some(other) => other as i64,
            None => 0,
        },
        Some(other) => other as i64,
        None => 0,
    }
}
