// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use bytes::Bytes;
use hashing::Digest;

/// Files above this size travel as FILE_META plus FILE_CHUNK blobs instead of one FILE blob.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileBlobKind {
    /// Whole content inline; at most one chunk's worth.
    File,
    /// A list of chunk digests and the total size, no content of its own.
    FileMeta,
    /// One chunk: an offset plus content.
    FileChunk,
}

///
/// The wire shape of file bytes. The three kinds are mutually exclusive and each has a strict
/// shape; `is_valid` is the gate every received blob must pass before its bytes are trusted.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileBlob {
    pub kind: FileBlobKind,
    pub file_size: u64,
    pub content: Option<Bytes>,
    pub chunk_hash_keys: Vec<Digest>,
    pub offset: Option<u64>,
}

impl FileBlob {
    pub fn file(content: Bytes) -> FileBlob {
        FileBlob {
            kind: FileBlobKind::File,
            file_size: content.len() as u64,
            content: Some(content),
            chunk_hash_keys: Vec::new(),
            offset: None,
        }
    }

    pub fn meta(chunk_hash_keys: Vec<Digest>, file_size: u64) -> FileBlob {
        FileBlob {
            kind: FileBlobKind::FileMeta,
            file_size,
            content: None,
            chunk_hash_keys,
            offset: None,
        }
    }

    pub fn chunk(offset: u64, content: Bytes, file_size: u64) -> FileBlob {
        FileBlob {
            kind: FileBlobKind::FileChunk,
            file_size,
            content: Some(content),
            chunk_hash_keys: Vec::new(),
            offset: Some(offset),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.kind {
            FileBlobKind::File => {
                self.content.is_some() && self.chunk_hash_keys.is_empty() && self.offset.is_none()
            }
            FileBlobKind::FileMeta => self.content.is_none() && self.chunk_hash_keys.len() >= 2,
            FileBlobKind::FileChunk => self.offset.is_some() && self.content.is_some(),
        }
    }
}
