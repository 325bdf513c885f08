// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-input-file task: decides between hash-only, embedded and side-channel transfer for
//! one file, updates the file-hash cache, and deduplicates across compile tasks so concurrent
//! compiles sharing a header do the work once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::{BoxFuture, FutureExt, Shared};
use hash_cache::{CacheKeyLookup, FileHashCache};
use hashing::Digest;
use log::{debug, info, warn};
use parking_lot::Mutex;
use store::{BlobServiceClient, BlobUploader, FileBlob};

use fs::FileStat;

/// For file sizes no larger than this, embed the content in the request instead of uploading
/// separately.
pub const LARGE_FILE_THRESHOLD: u64 = 2 * 1024 * 1024;

/// For file sizes smaller than this, embed the content even if only the hash was requested.
pub const TINY_FILE_THRESHOLD: u64 = 512;

///
/// Everything the compile task knows about one input before the task runs.
///
#[derive(Clone, Debug)]
pub struct InputFileSpec {
    /// Absolute path of the input.
    pub filename: PathBuf,
    pub file_stat: FileStat,
    /// When the server last reported this input missing, if it did.
    pub missed_at: Option<SystemTime>,
    /// The server reported the content missing: it must be re-transferred.
    pub missed_content: bool,
    /// Hash-only is acceptable (linking-style requests with many large inputs).
    pub linking: bool,
    /// Recently modified: the blob probably is not in the remote cache yet.
    pub is_new_file: bool,
}

#[derive(Clone, Debug)]
pub struct InputFileResult {
    pub filename: PathBuf,
    pub hash_key: Option<Digest>,
    pub inline_blob: Option<FileBlob>,
    pub success: bool,
    pub uploaded_in_side_channel: bool,
    pub new_cache_key: bool,
    /// Why the transfer decision fell the way it did, for logs.
    pub reason: &'static str,
}

type SharedInputFuture = Shared<BoxFuture<'static, InputFileResult>>;

///
/// Process-wide deduplication of input-file work by absolute path. The first compile task to
/// ask for a path runs the task; the rest attach to the same future and wake together with the
/// same result.
///
pub struct InputFileTaskRegistry {
    tasks: Mutex<HashMap<PathBuf, SharedInputFuture>>,
}

impl InputFileTaskRegistry {
    pub fn new() -> Arc<InputFileTaskRegistry> {
        Arc::new(InputFileTaskRegistry {
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(
        self: &Arc<InputFileTaskRegistry>,
        spec: InputFileSpec,
        blob_client: Arc<dyn BlobServiceClient>,
        file_hash_cache: Arc<FileHashCache>,
    ) -> InputFileResult {
        debug_assert!(spec.filename.is_absolute(), "{:?}", spec.filename);
        let shared = {
            let mut tasks = self.tasks.lock();
            if let Some(existing) = tasks.get(&spec.filename) {
                debug!("attaching to input task for {}", spec.filename.display());
                existing.clone()
            } else {
                let registry = self.clone();
                let filename = spec.filename.clone();
                let insert_key = filename.clone();
                let future = async move {
                    let result = execute(spec, blob_client, file_hash_cache).await;
                    registry.tasks.lock().remove(&filename);
                    result
                }
                .boxed()
                .shared();
                tasks.insert(insert_key, future.clone());
                future
            }
        };
        shared.await
    }

    pub fn outstanding(&self) -> usize {
        self.tasks.lock().len()
    }
}

fn need_to_upload_content(spec: &InputFileSpec, hash_key: Option<Digest>, new_cache_key: bool) -> Option<&'static str> {
    if spec.missed_content {
        return Some("missed content");
    }
    if spec.filename.extension().map(|e| e == "rsp").unwrap_or(false) {
        return Some("rsp file");
    }
    if spec.is_new_file && new_cache_key {
        return Some("new file, new key");
    }
    if hash_key.is_none() {
        return Some("no hash key");
    }
    None
}

async fn execute(
    spec: InputFileSpec,
    blob_client: Arc<dyn BlobServiceClient>,
    file_hash_cache: Arc<FileHashCache>,
) -> InputFileResult {
    let (old_hash, confident) = match file_hash_cache.get_file_cache_key(
        &spec.filename,
        spec.missed_at,
        &spec.file_stat,
    ) {
        CacheKeyLookup::Confirmed(hash) => {
            (Some(Digest::new(hash, spec.file_stat.size as usize)), true)
        }
        // The recorded hash may no longer match the bytes; usable as a guess only.
        CacheKeyLookup::Unconfirmed(hash) => {
            (Some(Digest::new(hash, spec.file_stat.size as usize)), false)
        }
        CacheKeyLookup::Unknown => (None, false),
    };

    let mut uploader = BlobUploader::new(spec.filename.clone(), blob_client);
    let mut hash_key = old_hash;
    let mut new_cache_key = false;
    let mut inline_blob = None;
    let mut uploaded_in_side_channel = false;
    let mut success = true;
    let mut reason = "hash only";

    // When the content will be uploaded anyway, the key falls out of the transfer; otherwise an
    // unconfirmed key is re-established from the bytes for everything but tiny files (which get
    // embedded below and hashed along the way).
    if need_to_upload_content(&spec, hash_key, new_cache_key).is_none()
        && !confident
        && spec.file_stat.size >= TINY_FILE_THRESHOLD
    {
        match uploader.compute_key().await {
            Ok(digest) => {
                hash_key = Some(digest);
                new_cache_key = !file_hash_cache.is_known_hash_key(&digest.hash);
            }
            Err(err) => {
                warn!("input {} hash failed: {err}", spec.filename.display());
                success = false;
            }
        }
    }

    if success {
        if let Some(upload_reason) = need_to_upload_content(&spec, hash_key, new_cache_key) {
            reason = upload_reason;
            let need_hash_only = spec.linking;
            if need_hash_only || spec.file_stat.size > LARGE_FILE_THRESHOLD {
                info!(
                    "upload {} size={} reason: {reason}",
                    spec.filename.display(),
                    spec.file_stat.size
                );
                match uploader.upload().await {
                    Ok(digest) => {
                        hash_key = Some(digest);
                        uploaded_in_side_channel = true;
                    }
                    Err(err) => {
                        warn!("input {} upload failed: {err}", spec.filename.display());
                        success = false;
                    }
                }
            } else {
                info!(
                    "embed {} size={} reason: {reason}",
                    spec.filename.display(),
                    spec.file_stat.size
                );
                match uploader.embed().await {
                    Ok(digest) => {
                        hash_key = Some(digest);
                        inline_blob = uploader.embedded_blob().cloned();
                    }
                    Err(err) => {
                        warn!("input {} embed failed: {err}", spec.filename.display());
                        success = false;
                    }
                }
            }
        } else if spec.file_stat.size < TINY_FILE_THRESHOLD {
            // Tiny files ride along even when only the hash was asked for.
            reason = "small";
            match uploader.embed().await {
                Ok(digest) => {
                    hash_key = Some(digest);
                    inline_blob = uploader.embedded_blob().cloned();
                }
                Err(err) => {
                    warn!("input {} embed failed: {err}", spec.filename.display());
                    success = false;
                }
            }
        }
    }

    if success {
        if let Some(digest) = hash_key {
            // Record the key only when the bytes were actually transferred, or the file is old
            // enough that someone must have uploaded them before. An embedded blob's key is
            // recorded without an upload timestamp: if the request it rides on hits a missing
            // inputs error, the safe reaction is to re-send the bytes.
            if uploaded_in_side_channel || !spec.is_new_file {
                let upload_time = uploaded_in_side_channel.then(SystemTime::now);
                new_cache_key = file_hash_cache.store_file_cache_key(
                    &spec.filename,
                    digest.hash,
                    upload_time,
                    &spec.file_stat,
                );
            }
        }
    }

    InputFileResult {
        filename: spec.filename,
        hash_key,
        inline_blob,
        success,
        uploaded_in_side_channel,
        new_cache_key,
        reason,
    }
}
