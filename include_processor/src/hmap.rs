// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Parsing of Apple-style header map (`.hmap`) files: a little-endian hash table of
//! (key → prefix + suffix) string triples. Build systems pass these as include roots; a key hit
//! replaces path search entirely.

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use fs::Content;

const HEADER_LEN: usize = 24;
const BUCKET_LEN: usize = 12;
const MAGIC: &[u8; 4] = b"pamh";

///
/// Reads `(key, prefix + suffix)` pairs out of an hmap file. Returns None (with a warning) for
/// anything malformed; a broken hmap degrades to "no mappings", never to an error.
///
pub fn read_header_map(path: &std::path::Path) -> Option<Vec<(String, String)>> {
    let content = match Content::from_file(path) {
        Ok(content) => content,
        Err(err) => {
            warn!("hmap file not readable: {path:?}: {err}");
            return None;
        }
    };
    let bytes = content.as_bytes();

    if bytes.len() < HEADER_LEN {
        warn!("hmap file shorter than its header: {path:?}");
        return None;
    }
    if &bytes[0..4] != MAGIC {
        warn!("invalid hmap magic: {path:?}");
        return None;
    }
    let version = LittleEndian::read_u16(&bytes[4..6]);
    if version != 1 {
        warn!("unknown hmap version ({version}): {path:?}");
        return None;
    }

    let string_offset = LittleEndian::read_u32(&bytes[8..12]) as usize;
    let hash_capacity = LittleEndian::read_u32(&bytes[16..20]) as usize;

    if string_offset >= bytes.len() {
        warn!("invalid hmap string offset: {path:?}");
        return None;
    }
    let buckets_end = HEADER_LEN.checked_add(hash_capacity.checked_mul(BUCKET_LEN)?)?;
    if buckets_end > bytes.len() {
        warn!("hmap bucket table exceeds file size: {path:?}");
        return None;
    }

    let strings = &bytes[string_offset..];
    let mut entries = Vec::new();
    for bucket_index in 0..hash_capacity {
        let bucket = &bytes[HEADER_LEN + bucket_index * BUCKET_LEN..];
        let key_offset = LittleEndian::read_u32(&bucket[0..4]) as usize;
        if key_offset == 0 {
            continue;
        }
        let prefix_offset = LittleEndian::read_u32(&bucket[4..8]) as usize;
        let suffix_offset = LittleEndian::read_u32(&bucket[8..12]) as usize;

        let (Some(key), Some(prefix), Some(suffix)) = (
            read_nul_terminated(strings, key_offset),
            read_nul_terminated(strings, prefix_offset),
            read_nul_terminated(strings, suffix_offset),
        ) else {
            warn!("invalid hmap string reference: {path:?}");
            return None;
        };
        entries.push((key.to_string(), format!("{prefix}{suffix}")));
    }
    Some(entries)
}

fn read_nul_terminated(strings: &[u8], offset: usize) -> Option<&str> {
    let tail = strings.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}
