// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;
use std::io;
use std::path::Path;

///
/// An owned, immutable byte range holding one file's bytes.
///
/// The backing buffer is always NUL terminated one past the end so byte-at-a-time scanners can
/// use sentinel reads, but the NUL is not part of `len`.
///
pub struct Content {
    // Invariant: buf.len() == len + 1 and buf[len] == 0.
    buf: Box<[u8]>,
    len: usize,
}

impl Content {
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Content> {
        let bytes = std::fs::read(path)?;
        Ok(Content::from_vec(bytes))
    }

    pub fn from_buffer(bytes: &[u8]) -> Content {
        Content::from_vec(bytes.to_vec())
    }

    pub fn from_content(other: &Content) -> Content {
        Content::from_buffer(other.as_bytes())
    }

    fn from_vec(mut bytes: Vec<u8>) -> Content {
        let len = bytes.len();
        bytes.push(0);
        Content {
            buf: bytes.into_boxed_slice(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The content bytes, excluding the NUL sentinel.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The content bytes including the NUL sentinel, for scanners that read one past the end.
    pub fn with_sentinel(&self) -> &[u8] {
        &self.buf
    }

    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Content<{} bytes>", self.len)
    }
}
