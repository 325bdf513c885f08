// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The macro table for one include-processor run, with enough expansion machinery to resolve
//! macro-valued includes and conditional expressions: parameter substitution, `__VA_ARGS__`,
//! stringizing and token pasting, with recursion cut off by an expanding-name set.

use std::collections::HashMap;

use crate::directive::{tokenize, MacroDef, Token};

pub struct MacroEnv {
    macros: HashMap<String, MacroDef>,
}

impl MacroEnv {
    pub fn new() -> MacroEnv {
        MacroEnv {
            macros: HashMap::new(),
        }
    }

    pub fn define(&mut self, name: &str, def: MacroDef) {
        self.macros.insert(name.to_string(), def);
    }

    pub fn define_object(&mut self, name: &str, body: &str) {
        self.define(
            name,
            MacroDef {
                params: None,
                variadic: false,
                body: tokenize(body),
            },
        );
    }

    pub fn undef(&mut self, name: &str) {
        self.macros.remove(name);
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&MacroDef> {
        self.macros.get(name)
    }

    ///
    /// Seeds definitions from a `-dM`-style dump: one `#define NAME BODY` per line. Lines that
    /// do not look like object- or function-like definitions are skipped.
    ///
    pub fn add_predefined_macros(&mut self, dump: &str) {
        for line in dump.lines() {
            let Some(rest) = line.trim_start().strip_prefix("#define") else {
                continue;
            };
            let rest = rest.trim_start();
            let name_end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            if name_end == 0 {
                continue;
            }
            let name = &rest[..name_end];
            let after = &rest[name_end..];
            if let Some(params) = after.strip_prefix('(') {
                let Some(close) = params.find(')') else {
                    continue;
                };
                let mut names = Vec::new();
                let mut variadic = false;
                for param in params[..close].split(',') {
                    let param = param.trim();
                    if param == "..." {
                        variadic = true;
                    } else if !param.is_empty() {
                        names.push(param.trim_end_matches("...").trim().to_string());
                    }
                }
                self.define(
                    name,
                    MacroDef {
                        params: Some(names),
                        variadic,
                        body: tokenize(&params[close + 1..]),
                    },
                );
            } else {
                self.define(
                    name,
                    MacroDef {
                        params: None,
                        variadic: false,
                        body: tokenize(after),
                    },
                );
            }
        }
    }

    ///
    /// Fully macro-expands `tokens`. `defined` operands are left untouched so conditional
    /// evaluation can inspect them afterwards.
    ///
    pub fn expand(&self, tokens: &[Token]) -> Vec<Token> {
        let mut hide = Vec::new();
        self.expand_with_hide(tokens, &mut hide)
    }

    fn expand_with_hide(&self, tokens: &[Token], hide: &mut Vec<String>) -> Vec<Token> {
        let mut out = Vec::new();
        let mut pos = 0;

        while pos < tokens.len() {
            match &tokens[pos] {
                Token::Ident(name) if name == "defined" => {
                    // Copy `defined X` / `defined(X)` verbatim.
                    out.push(tokens[pos].clone());
                    pos += 1;
                    if matches!(tokens.get(pos), Some(Token::Punct("("))) {
                        while pos < tokens.len() {
                            out.push(tokens[pos].clone());
                            let done = matches!(tokens[pos], Token::Punct(")"));
                            pos += 1;
                            if done {
                                break;
                            }
                        }
                    } else if pos < tokens.len() {
                        out.push(tokens[pos].clone());
                        pos += 1;
                    }
                }
                Token::Ident(name) if !hide.contains(name) => {
                    match self.macros.get(name) {
                        Some(def) if def.params.is_none() => {
                            hide.push(name.clone());
                            out.extend(self.expand_with_hide(&def.body, hide));
                            hide.pop();
                            pos += 1;
                        }
                        Some(def) if matches!(tokens.get(pos + 1), Some(Token::Punct("("))) => {
                            let (args, consumed) = collect_arguments(&tokens[pos + 1..]);
                            let substituted = self.substitute(def, &args, hide);
                            hide.push(name.clone());
                            out.extend(self.expand_with_hide(&substituted, hide));
                            hide.pop();
                            pos += 1 + consumed;
                        }
                        _ => {
                            out.push(tokens[pos].clone());
                            pos += 1;
                        }
                    }
                }
                other => {
                    out.push(other.clone());
                    pos += 1;
                }
            }
        }
        out
    }

    fn substitute(
        &self,
        def: &MacroDef,
        args: &[Vec<Token>],
        hide: &mut Vec<String>,
    ) -> Vec<Token> {
        let params = def.params.as_deref().unwrap_or(&[]);
        let lookup = |name: &str| -> Option<Vec<Token>> {
            if let Some(index) = params.iter().position(|p| p == name) {
                return Some(args.get(index).cloned().unwrap_or_default());
            }
            if def.variadic && name == "__VA_ARGS__" {
                let mut rest = Vec::new();
                for (index, arg) in args.iter().enumerate().skip(params.len()) {
                    if index > params.len() {
                        rest.push(Token::Punct(","));
                    }
                    rest.extend(arg.iter().cloned());
                }
                return Some(rest);
            }
            None
        };

        let mut out: Vec<Token> = Vec::new();
        let mut pos = 0;
        while pos < def.body.len() {
            match &def.body[pos] {
                Token::Punct("#") => {
                    // Stringize the next parameter.
                    if let Some(Token::Ident(name)) = def.body.get(pos + 1) {
                        if let Some(arg) = lookup(name) {
                            out.push(Token::Str(spell(&arg)));
                            pos += 2;
                            continue;
                        }
                    }
                    out.push(Token::Punct("#"));
                    pos += 1;
                }
                Token::Punct("##") => {
                    // Paste the previous output token with the next substituted token.
                    let next = match def.body.get(pos + 1) {
                        Some(Token::Ident(name)) => lookup(name)
                            .unwrap_or_else(|| vec![def.body[pos + 1].clone()]),
                        Some(other) => vec![other.clone()],
                        None => Vec::new(),
                    };
                    if let (Some(left), Some(right)) = (out.pop(), next.first()) {
                        let pasted = format!("{}{}", left.lexeme(), right.lexeme());
                        out.extend(tokenize(&pasted));
                        out.extend(next.iter().skip(1).cloned());
                    } else {
                        out.extend(next);
                    }
                    pos += 2;
                }
                Token::Ident(name) => {
                    if let Some(arg) = lookup(name) {
                        // Arguments are expanded before substitution, except when adjacent to
                        // a paste.
                        if matches!(def.body.get(pos + 1), Some(Token::Punct("##"))) {
                            out.extend(arg);
                        } else {
                            out.extend(self.expand_with_hide(&arg, hide));
                        }
                    } else {
                        out.push(def.body[pos].clone());
                    }
                    pos += 1;
                }
                other => {
                    out.push(other.clone());
                    pos += 1;
                }
            }
        }
        out
    }
}

/// Collects the parenthesized argument list starting at a `(` token. Returns the arguments and
/// the number of tokens consumed (including both parentheses).
fn collect_arguments(tokens: &[Token]) -> (Vec<Vec<Token>>, usize) {
    debug_assert!(matches!(tokens.first(), Some(Token::Punct("("))));
    let mut args = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0_usize;
    let mut pos = 0;

    while pos < tokens.len() {
        match &tokens[pos] {
            Token::Punct("(") => {
                if depth > 0 {
                    current.push(tokens[pos].clone());
                }
                depth += 1;
            }
            Token::Punct(")") => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if !current.is_empty() || !args.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                    return (args, pos + 1);
                }
                current.push(tokens[pos].clone());
            }
            Token::Punct(",") if depth == 1 => {
                args.push(std::mem::take(&mut current));
            }
            other => current.push(other.clone()),
        }
        pos += 1;
    }
    (args, pos)
}

/// Re-spells a token sequence as source text, with single spaces between tokens.
pub fn spell(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(Token::lexeme)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Re-spells a token sequence with no separation, for reassembling `<...>` include operands.
pub fn spell_tight(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.lexeme()).collect()
}
