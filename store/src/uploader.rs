// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use hashing::Digest;
use log::debug;

use crate::blob::{FileBlob, CHUNK_SIZE};
use crate::{BlobServiceClient, StoreError};

///
/// One input slot of an exec request: the filename the compiler will open, the content hash, and
/// optionally the bytes themselves when the blob is small enough to ride along inline.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecInput {
    pub filename: PathBuf,
    pub hash_key: Option<Digest>,
    pub inline_blob: Option<FileBlob>,
}

impl ExecInput {
    pub fn new(filename: PathBuf) -> ExecInput {
        ExecInput {
            filename,
            hash_key: None,
            inline_blob: None,
        }
    }
}

///
/// Per-file upload operations against the blob service. One uploader is created per input file
/// task; after one of the operations has run, `hash_key` and `get_input` describe the outcome.
///
pub struct BlobUploader {
    filename: PathBuf,
    client: Arc<dyn BlobServiceClient>,
    hash_key: Option<Digest>,
    embedded_blob: Option<FileBlob>,
}

impl BlobUploader {
    pub fn new(filename: PathBuf, client: Arc<dyn BlobServiceClient>) -> BlobUploader {
        BlobUploader {
            filename,
            client,
            hash_key: None,
            embedded_blob: None,
        }
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// The content-addressed key established by the last successful operation.
    pub fn hash_key(&self) -> Option<Digest> {
        self.hash_key
    }

    /// The inline blob retained by `embed`, if that is how this file traveled.
    pub fn embedded_blob(&self) -> Option<&FileBlob> {
        self.embedded_blob.as_ref()
    }

    ///
    /// Hash-only: computes the content key without transferring anything.
    ///
    pub async fn compute_key(&mut self) -> Result<Digest, StoreError> {
        let bytes = self.read_file().await?;
        let digest = Digest::of_bytes(&bytes);
        self.hash_key = Some(digest);
        Ok(digest)
    }

    ///
    /// Side-channel upload: pushes the bytes to the blob service (chunked when large) and
    /// returns the key.
    ///
    pub async fn upload(&mut self) -> Result<Digest, StoreError> {
        let bytes = self.read_file().await?;
        let digest = self.store_bytes(bytes).await?;
        self.hash_key = Some(digest);
        Ok(digest)
    }

    ///
    /// Computes the key and keeps a blob small enough to inline in the request. The caller
    /// remains responsible for actually sending the request that carries it.
    ///
    pub async fn embed(&mut self) -> Result<Digest, StoreError> {
        let bytes = self.read_file().await?;
        if bytes.len() > CHUNK_SIZE {
            return Err(StoreError::InvalidBlob(format!(
                "cannot embed {} bytes (chunk limit {CHUNK_SIZE})",
                bytes.len()
            )));
        }
        let digest = Digest::of_bytes(&bytes);
        self.hash_key = Some(digest);
        self.embedded_blob = Some(FileBlob::file(bytes));
        Ok(digest)
    }

    ///
    /// Persists a locally produced blob server-side, seeding the cache for peers that run the
    /// same compile remotely.
    ///
    pub async fn store(&mut self, bytes: Bytes) -> Result<Digest, StoreError> {
        let digest = self.store_bytes(bytes).await?;
        self.hash_key = Some(digest);
        Ok(digest)
    }

    ///
    /// Populates the request slot: filename plus hash key, with the inline content attached when
    /// `embed` ran. Returns false when no operation has established a key yet.
    ///
    pub fn get_input(&self, input: &mut ExecInput) -> bool {
        let Some(hash_key) = self.hash_key else {
            return false;
        };
        input.hash_key = Some(hash_key);
        input.inline_blob = self.embedded_blob.clone();
        true
    }

    async fn read_file(&self) -> Result<Bytes, StoreError> {
        let bytes = tokio::fs::read(&self.filename)
            .await
            .map_err(|e| StoreError::Io(format!("read {}: {e}", self.filename.display())))?;
        Ok(Bytes::from(bytes))
    }

    async fn store_bytes(&self, bytes: Bytes) -> Result<Digest, StoreError> {
        let digest = Digest::of_bytes(&bytes);
        if bytes.len() <= CHUNK_SIZE {
            self.client
                .store_blob(digest, FileBlob::file(bytes))
                .await?;
            return Ok(digest);
        }

        // Large file: one chunk blob per CHUNK_SIZE slice, then a meta blob listing them.
        let file_size = bytes.len() as u64;
        let mut chunk_hash_keys = Vec::new();
        let mut offset = 0_usize;
        while offset < bytes.len() {
            let end = (offset + CHUNK_SIZE).min(bytes.len());
            let chunk = bytes.slice(offset..end);
            let chunk_digest = Digest::of_bytes(&chunk);
            self.client
                .store_blob(
                    chunk_digest,
                    FileBlob::chunk(offset as u64, chunk, file_size),
                )
                .await?;
            chunk_hash_keys.push(chunk_digest);
            offset = end;
        }
        debug!(
            "stored {} in {} chunks",
            self.filename.display(),
            chunk_hash_keys.len()
        );
        self.client
            .store_blob(digest, FileBlob::meta(chunk_hash_keys, file_size))
            .await?;
        Ok(digest)
    }
}
