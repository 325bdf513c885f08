// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hashing::Digest;
use log::debug;

use crate::blob::{FileBlob, FileBlobKind};
use crate::{BlobServiceClient, StoreError};

///
/// Where one output artifact goes: to a temp path on disk (later renamed into place by the
/// compile task) or into memory for in-response delivery.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputDestination {
    TmpFile(PathBuf),
    Memory,
}

///
/// One output artifact of a remote compile. `hash_key` or `inline_blob` identifies the bytes;
/// after `BlobDownloader::download`, `buffer` holds them for Memory destinations.
///
#[derive(Clone, Debug)]
pub struct OutputFileInfo {
    pub final_filename: PathBuf,
    pub destination: OutputDestination,
    pub mode: u32,
    pub hash_key: Option<Digest>,
    pub inline_blob: Option<FileBlob>,
    pub buffer: Bytes,
}

impl OutputFileInfo {
    pub fn to_tmp_file(final_filename: PathBuf, tmp_filename: PathBuf, mode: u32) -> OutputFileInfo {
        OutputFileInfo {
            final_filename,
            destination: OutputDestination::TmpFile(tmp_filename),
            mode,
            hash_key: None,
            inline_blob: None,
            buffer: Bytes::new(),
        }
    }

    pub fn to_memory(final_filename: PathBuf) -> OutputFileInfo {
        OutputFileInfo {
            final_filename,
            destination: OutputDestination::Memory,
            mode: 0o644,
            hash_key: None,
            inline_blob: None,
            buffer: Bytes::new(),
        }
    }
}

pub struct BlobDownloader {
    client: Arc<dyn BlobServiceClient>,
}

impl BlobDownloader {
    pub fn new(client: Arc<dyn BlobServiceClient>) -> BlobDownloader {
        BlobDownloader { client }
    }

    ///
    /// Fetches the blob named by `info` and materializes it: remove-and-write to the temp path,
    /// or into `info.buffer`. Every received blob shape is validated before its bytes are used.
    ///
    pub async fn download(&self, info: &mut OutputFileInfo) -> Result<(), StoreError> {
        let blob = match info.inline_blob.take() {
            Some(blob) => blob,
            None => {
                let digest = info.hash_key.ok_or_else(|| {
                    StoreError::InvalidBlob("output carries neither content nor hash".to_string())
                })?;
                self.client
                    .get_blob(digest)
                    .await?
                    .ok_or(StoreError::MissingBlob(digest))?
            }
        };
        let bytes = self.assemble(blob).await?;

        match &info.destination {
            OutputDestination::TmpFile(tmp_filename) => {
                debug!(
                    "materializing {} bytes to {}",
                    bytes.len(),
                    tmp_filename.display()
                );
                match tokio::fs::remove_file(tmp_filename).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(StoreError::Io(format!(
                            "remove {}: {err}",
                            tmp_filename.display()
                        )))
                    }
                }
                tokio::fs::write(tmp_filename, &bytes).await.map_err(|e| {
                    StoreError::Io(format!("write {}: {e}", tmp_filename.display()))
                })?;
                set_mode(tmp_filename, info.mode).await?;
            }
            OutputDestination::Memory => {
                info.buffer = bytes;
            }
        }
        Ok(())
    }

    /// Reassembles blob content, chasing chunk digests for FILE_META blobs.
    async fn assemble(&self, blob: FileBlob) -> Result<Bytes, StoreError> {
        if !blob.is_valid() {
            return Err(StoreError::InvalidBlob(format!(
                "malformed {:?} blob",
                blob.kind
            )));
        }
        match blob.kind {
            FileBlobKind::File => Ok(blob.content.unwrap_or_default()),
            FileBlobKind::FileChunk => Err(StoreError::InvalidBlob(
                "bare chunk is not a downloadable output".to_string(),
            )),
            FileBlobKind::FileMeta => {
                let mut assembled = BytesMut::with_capacity(blob.file_size as usize);
                for chunk_digest in &blob.chunk_hash_keys {
                    let chunk = self
                        .client
                        .get_blob(*chunk_digest)
                        .await?
                        .ok_or(StoreError::MissingBlob(*chunk_digest))?;
                    if chunk.kind != FileBlobKind::FileChunk || !chunk.is_valid() {
                        return Err(StoreError::InvalidBlob(
                            "meta blob references a non-chunk".to_string(),
                        ));
                    }
                    if chunk.offset != Some(assembled.len() as u64) {
                        return Err(StoreError::InvalidBlob(format!(
                            "chunk at offset {:?}, expected {}",
                            chunk.offset,
                            assembled.len()
                        )));
                    }
                    assembled.extend_from_slice(&chunk.content.unwrap_or_default());
                }
                if assembled.len() as u64 != blob.file_size {
                    return Err(StoreError::InvalidBlob(format!(
                        "assembled {} bytes, meta says {}",
                        assembled.len(),
                        blob.file_size
                    )));
                }
                Ok(assembled.freeze())
            }
        }
    }
}

#[cfg(unix)]
async fn set_mode(path: &std::path::Path, mode: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| StoreError::Io(format!("chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
async fn set_mode(_path: &std::path::Path, _mode: u32) -> Result<(), StoreError> {
    Ok(())
}
