// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Reduces a translation unit to the bytes that can influence which files it includes: comments
//! and non-directive lines are dropped, escaped newlines erased, and conditional branches that
//! cannot change include resolution removed. Two files with equal filtered output are
//! indistinguishable to the include processor, which is what makes the filtered bytes a sound
//! basis for directive hashes.

use fs::Content;

///
/// Runs all four passes over `content` and returns the filtered bytes as a new Content.
///
pub fn filtered_content(content: &Content) -> Content {
    let mut buffer = Vec::with_capacity(content.len());
    let len = remove_comments(content.as_bytes(), &mut buffer);
    let len = keep_directive_lines_in_place(&mut buffer, len);
    let len = remove_escaped_newlines_in_place(&mut buffer, len);
    let len = remove_dead_directives_in_place(&mut buffer, len);
    buffer.truncate(len);
    Content::from_buffer(&buffer)
}

fn is_escaped_newline(src: &[u8], pos: usize) -> usize {
    if src.get(pos) != Some(&b'\\') {
        return 0;
    }
    match (src.get(pos + 1), src.get(pos + 2)) {
        (Some(b'\n'), _) => 2,
        (Some(b'\r'), Some(b'\n')) => 3,
        _ => 0,
    }
}

fn skip_spaces(src: &[u8], mut pos: usize) -> usize {
    while pos < src.len() {
        match src[pos] {
            b' ' | b'\t' => pos += 1,
            _ => {
                let escaped = is_escaped_newline(src, pos);
                if escaped == 0 {
                    return pos;
                }
                pos += escaped;
            }
        }
    }
    pos
}

/// Position one past the end of the current (possibly backslash-continued) line.
fn next_line_head(src: &[u8], mut pos: usize) -> usize {
    while pos < src.len() {
        if src[pos] == b'\n' {
            return pos + 1;
        }
        let escaped = is_escaped_newline(src, pos);
        pos += if escaped == 0 { 1 } else { escaped };
    }
    pos
}

/// Copies a string literal starting at `pos` (which must be a '"'), returning the number of bytes
/// consumed. An unterminated literal is copied through the end of its line as-is.
fn copy_string_literal(src: &[u8], mut pos: usize, dst: &mut Vec<u8>) -> usize {
    let start = pos;
    dst.push(src[pos]);
    pos += 1;

    while pos < src.len() {
        match src[pos] {
            b'"' | b'\n' => {
                // Either the literal ends, or it never will on this line; keep the byte as-is.
                dst.push(src[pos]);
                pos += 1;
                break;
            }
            b'\\' => {
                let escaped = is_escaped_newline(src, pos);
                if escaped > 0 {
                    // A line continuation inside a string literal is preserved here; the escaped
                    // newline pass runs on directive lines only after this one.
                    dst.extend_from_slice(&src[pos..pos + escaped]);
                    pos += escaped;
                } else if src.get(pos + 1) == Some(&b'"') {
                    dst.extend_from_slice(&src[pos..pos + 2]);
                    pos += 2;
                } else {
                    dst.push(src[pos]);
                    pos += 1;
                }
            }
            other => {
                dst.push(other);
                pos += 1;
            }
        }
    }
    pos - start
}

/// Pass 1: removes comments while respecting string literals. Block comments collapse to a single
/// space, line comments to a newline, and an unterminated block comment is preserved verbatim.
fn remove_comments(src: &[u8], out: &mut Vec<u8>) -> usize {
    out.clear();
    let mut pos = 0;

    while pos < src.len() {
        match src[pos] {
            b'"' => {
                pos += copy_string_literal(src, pos, out);
            }
            b'/' if pos + 1 < src.len() && src[pos + 1] == b'*' => {
                match find_block_comment_end(src, pos + 2) {
                    Some(end) => {
                        pos = end;
                        out.push(b' ');
                    }
                    None => {
                        // No terminator: keep the remainder untouched.
                        out.extend_from_slice(&src[pos..]);
                        pos = src.len();
                    }
                }
            }
            b'/' if pos + 1 < src.len() && src[pos + 1] == b'/' => {
                pos = next_line_head(src, pos + 2);
                out.push(b'\n');
            }
            other => {
                out.push(other);
                pos += 1;
            }
        }
    }
    out.len()
}

fn find_block_comment_end(src: &[u8], mut pos: usize) -> Option<usize> {
    while pos + 2 <= src.len() {
        if src[pos] == b'*' && src[pos + 1] == b'/' {
            return Some(pos + 2);
        }
        pos += 1;
    }
    None
}

/// Pass 2: keeps only lines whose first non-whitespace byte is '#', dropping the whitespace that
/// follows the '#' so later passes can match directives by prefix.
fn keep_directive_lines_in_place(buffer: &mut Vec<u8>, len: usize) -> usize {
    let src = buffer[..len].to_vec();
    buffer.clear();
    let mut pos = 0;

    while pos < src.len() {
        pos = skip_spaces(&src, pos);
        if pos < src.len() && src[pos] == b'#' {
            buffer.push(b'#');
            pos = skip_spaces(&src, pos + 1);
            let line_end = next_line_head(&src, pos);
            buffer.extend_from_slice(&src[pos..line_end]);
            pos = line_end;
        } else {
            pos = next_line_head(&src, pos);
        }
    }
    buffer.len()
}

/// Pass 3: drops `\`-newline splices so every directive occupies exactly one line.
fn remove_escaped_newlines_in_place(buffer: &mut Vec<u8>, len: usize) -> usize {
    let src = buffer[..len].to_vec();
    buffer.clear();
    let mut pos = 0;

    while pos < src.len() {
        let escaped = is_escaped_newline(&src, pos);
        if escaped == 0 {
            buffer.push(src[pos]);
            pos += 1;
        } else {
            pos += escaped;
        }
    }
    buffer.len()
}

/// Pass 4: drops directives that cannot influence include resolution: every `#error`, every
/// `#pragma` other than `#pragma once`, and `#else`/`#elif` arms that close out an empty
/// conditional (together with the `#if`/`#endif` pair around them when nothing else remains).
fn remove_dead_directives_in_place(buffer: &mut Vec<u8>, len: usize) -> usize {
    let src = buffer[..len].to_vec();
    buffer.clear();

    let mut stack: Vec<&[u8]> = Vec::new();
    let mut pos = 0;
    while pos < src.len() {
        let line_end = next_line_head(&src, pos);
        let line = &src[pos..line_end];
        pos = line_end;

        if line.starts_with(b"#error") {
            continue;
        }
        if line.starts_with(b"#pragma") && !contains(line, b"once") {
            continue;
        }

        if line.starts_with(b"#endif") {
            while stack
                .last()
                .map(|top| top.starts_with(b"#else") || top.starts_with(b"#elif"))
                .unwrap_or(false)
            {
                stack.pop();
            }
            if stack.last().map(|top| top.starts_with(b"#if")).unwrap_or(false) {
                stack.pop();
            } else {
                stack.push(line);
            }
        } else {
            stack.push(line);
        }
    }

    for line in stack {
        buffer.extend_from_slice(line);
    }
    buffer.len()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
