// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Content-addressed blob plumbing between the local filesystem and the remote file service:
//! the blob shapes the wire understands, per-file upload with embed/side-channel choice, and
//! download with atomic materialization.

mod blob;
mod downloader;
pub mod testing;
mod uploader;

pub use crate::blob::{FileBlob, FileBlobKind, CHUNK_SIZE};
pub use crate::downloader::{BlobDownloader, OutputDestination, OutputFileInfo};
pub use crate::uploader::{BlobUploader, ExecInput};

use std::fmt;

use async_trait::async_trait;
use hashing::Digest;

///
/// Errors from blob operations. `MissingBlob` is the one callers branch on: it drives the
/// missing-inputs retry in the compile task.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    MissingBlob(Digest),
    InvalidBlob(String),
    Io(String),
    Client(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::MissingBlob(digest) => write!(f, "blob not found: {digest:?}"),
            StoreError::InvalidBlob(msg) => write!(f, "invalid blob: {msg}"),
            StoreError::Io(msg) => write!(f, "io error: {msg}"),
            StoreError::Client(msg) => write!(f, "client error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> StoreError {
        StoreError::Io(err.to_string())
    }
}

///
/// The blob half of the remote API, as consumed by this engine. The real implementation speaks
/// HTTP to the service; tests use `testing::InMemoryBlobService`.
///
#[async_trait]
pub trait BlobServiceClient: Send + Sync {
    async fn store_blob(&self, digest: Digest, blob: FileBlob) -> Result<(), StoreError>;

    async fn get_blob(&self, digest: Digest) -> Result<Option<FileBlob>, StoreError>;

    /// Returns the subset of `digests` the service does not hold.
    async fn lookup_missing(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, StoreError>;
}
