// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Typed directive records parsed from filtered content, plus the preprocessor tokenizer they are
//! built from. A file's parsed form is shared between the include cache, the deps cache and the
//! include processor under one `DirectiveList` handle.

use std::sync::Arc;

use fs::Content;

///
/// One preprocessor token. The tokenizer follows pp-token rules closely enough for include
/// resolution: identifiers, pp-numbers, string/char literals and (possibly multi-byte)
/// punctuators. Whitespace is not represented; adjacency that matters (function-like macro
/// detection) is handled during directive parsing.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Char(String),
    Punct(&'static str),
    Other(char),
}

impl Token {
    /// The token's spelling, as it would appear in source.
    pub fn lexeme(&self) -> String {
        match self {
            Token::Ident(s) | Token::Number(s) => s.clone(),
            Token::Str(s) => format!("\"{s}\""),
            Token::Char(s) => format!("'{s}'"),
            Token::Punct(p) => (*p).to_string(),
            Token::Other(c) => c.to_string(),
        }
    }
}

const PUNCTUATORS: &[&str] = &[
    "...", "<<=", ">>=", "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "##",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "::", "#", "(", ")", "[", "]", "{", "}", "<",
    ">", ",", ";", ":", "?", "+", "-", "*", "/", "%", "&", "|", "^", "!", "~", "=", ".",
];

pub fn tokenize(text: &str) -> Vec<Token> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let b = bytes[pos];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => pos += 1,
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                let start = pos;
                while pos < bytes.len() && is_ident_byte(bytes[pos]) {
                    pos += 1;
                }
                tokens.push(Token::Ident(text[start..pos].to_string()));
            }
            b'0'..=b'9' => {
                pos = lex_pp_number(text, pos, &mut tokens);
            }
            b'.' if bytes.get(pos + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                pos = lex_pp_number(text, pos, &mut tokens);
            }
            b'"' => {
                pos = lex_quoted(text, pos, b'"', &mut tokens);
            }
            b'\'' => {
                pos = lex_quoted(text, pos, b'\'', &mut tokens);
            }
            _ => {
                if let Some(punct) = PUNCTUATORS
                    .iter()
                    .copied()
                    .find(|p| text[pos..].starts_with(p))
                {
                    tokens.push(Token::Punct(punct));
                    pos += punct.len();
                } else {
                    tokens.push(Token::Other(text[pos..].chars().next().unwrap_or('\0')));
                    pos += text[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
                }
            }
        }
    }
    tokens
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn lex_pp_number(text: &str, start: usize, tokens: &mut Vec<Token>) -> usize {
    let bytes = text.as_bytes();
    let mut pos = start + 1;
    while pos < bytes.len() {
        let b = bytes[pos];
        // pp-numbers absorb digits, identifier characters, '.' and exponent signs.
        if is_ident_byte(b) || b == b'.' {
            pos += 1;
        } else if (b == b'+' || b == b'-')
            && matches!(bytes[pos - 1], b'e' | b'E' | b'p' | b'P')
        {
            pos += 1;
        } else {
            break;
        }
    }
    tokens.push(Token::Number(text[start..pos].to_string()));
    pos
}

fn lex_quoted(text: &str, start: usize, quote: u8, tokens: &mut Vec<Token>) -> usize {
    let bytes = text.as_bytes();
    let mut pos = start + 1;
    while pos < bytes.len() && bytes[pos] != quote {
        if bytes[pos] == b'\\' && pos + 1 < bytes.len() {
            pos += 2;
        } else {
            pos += 1;
        }
    }
    let inner = text[start + 1..pos.min(bytes.len())].to_string();
    let token = if quote == b'"' {
        Token::Str(inner)
    } else {
        Token::Char(inner)
    };
    tokens.push(token);
    if pos < bytes.len() {
        pos += 1;
    }
    pos
}

///
/// A macro definition: object-like (`params == None`) or function-like, possibly variadic.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacroDef {
    pub params: Option<Vec<String>>,
    pub variadic: bool,
    pub body: Vec<Token>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    Include(Vec<Token>),
    IncludeNext(Vec<Token>),
    Import(Vec<Token>),
    Define(String, MacroDef),
    Undef(String),
    If(Vec<Token>),
    Ifdef(String),
    Ifndef(String),
    Elif(Vec<Token>),
    Else,
    Endif,
    PragmaOnce,
}

/// Parsed directives of one file, shared without copying between caches and processor runs.
pub type DirectiveList = Arc<Vec<Directive>>;

///
/// A DirectiveList plus the file's include-guard identifier when the whole file is wrapped in
/// the `#ifndef G` / `#define G` / ... / `#endif` idiom. A file whose guard macro is already
/// defined can be skipped without walking its directives again.
///
#[derive(Clone, Debug)]
pub struct IncludeItem {
    pub directives: DirectiveList,
    pub include_guard_ident: Option<String>,
}

impl IncludeItem {
    pub fn parse(filtered: &Content) -> IncludeItem {
        let directives = parse_directives(filtered);
        let include_guard_ident = detect_include_guard(&directives);
        IncludeItem {
            directives: Arc::new(directives),
            include_guard_ident,
        }
    }
}

pub fn parse_directives(filtered: &Content) -> Vec<Directive> {
    let text = filtered.to_string_lossy();
    text.lines().filter_map(parse_directive_line).collect()
}

fn parse_directive_line(line: &str) -> Option<Directive> {
    let rest = line.strip_prefix('#')?.trim_start();
    let name_end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let (name, rest) = rest.split_at(name_end);

    match name {
        "include" => Some(Directive::Include(tokenize(rest))),
        "include_next" => Some(Directive::IncludeNext(tokenize(rest))),
        "import" => Some(Directive::Import(tokenize(rest))),
        "define" => parse_define(rest),
        "undef" => first_ident(rest).map(Directive::Undef),
        "if" => Some(Directive::If(tokenize(rest))),
        "ifdef" => first_ident(rest).map(Directive::Ifdef),
        "ifndef" => first_ident(rest).map(Directive::Ifndef),
        "elif" => Some(Directive::Elif(tokenize(rest))),
        "else" => Some(Directive::Else),
        "endif" => Some(Directive::Endif),
        "pragma" => {
            if rest.split_whitespace().next() == Some("once") {
                Some(Directive::PragmaOnce)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn first_ident(text: &str) -> Option<String> {
    match tokenize(text).into_iter().next() {
        Some(Token::Ident(name)) => Some(name),
        _ => None,
    }
}

fn parse_define(rest: &str) -> Option<Directive> {
    let rest = rest.trim_start();
    let name_end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(rest.len());
    if name_end == 0 {
        return None;
    }
    let name = rest[..name_end].to_string();
    let after_name = &rest[name_end..];

    // Function-like only when the open parenthesis is immediately adjacent to the name.
    if let Some(params_text) = after_name.strip_prefix('(') {
        let close = params_text.find(')')?;
        let (params_text, body_text) = (&params_text[..close], &params_text[close + 1..]);

        let mut params = Vec::new();
        let mut variadic = false;
        for param in params_text.split(',') {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if param == "..." {
                variadic = true;
            } else if let Some(named) = param.strip_suffix("...") {
                // GNU named variadic: `args...`.
                params.push(named.trim().to_string());
                variadic = true;
            } else {
                params.push(param.to_string());
            }
        }
        Some(Directive::Define(
            name,
            MacroDef {
                params: Some(params),
                variadic,
                body: tokenize(body_text),
            },
        ))
    } else {
        Some(Directive::Define(
            name,
            MacroDef {
                params: None,
                variadic: false,
                body: tokenize(after_name),
            },
        ))
    }
}

///
/// Detects the include-guard idiom over a parsed directive list: the first directive is
/// `#ifndef G`, the second defines G, the last is the matching `#endif`, and no directive sits
/// outside that conditional.
///
pub fn detect_include_guard(directives: &[Directive]) -> Option<String> {
    let guard = match directives.first()? {
        Directive::Ifndef(name) => name.clone(),
        _ => return None,
    };
    match directives.get(1)? {
        Directive::Define(name, _) if *name == guard => {}
        _ => return None,
    }
    if !matches!(directives.last()?, Directive::Endif) {
        return None;
    }

    // The opening #ifndef must only be closed by the final #endif.
    let mut depth = 0_i64;
    for (index, directive) in directives.iter().enumerate() {
        match directive {
            Directive::If(_) | Directive::Ifdef(_) | Directive::Ifndef(_) => depth += 1,
            Directive::Endif => {
                depth -= 1;
                if depth == 0 && index + 1 != directives.len() {
                    return None;
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    Some(guard)
}
