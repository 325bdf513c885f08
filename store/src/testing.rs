// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An in-memory blob service for tests: byte-for-byte faithful to the trait contract, with
//! call counters so tests can assert how many transfers actually happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashing::Digest;
use parking_lot::Mutex;

use crate::blob::FileBlob;
use crate::{BlobServiceClient, StoreError};

pub struct InMemoryBlobService {
    blobs: Mutex<HashMap<Digest, FileBlob>>,
    store_calls: AtomicU64,
    get_calls: AtomicU64,
}

impl InMemoryBlobService {
    pub fn new() -> InMemoryBlobService {
        InMemoryBlobService {
            blobs: Mutex::new(HashMap::new()),
            store_calls: AtomicU64::new(0),
            get_calls: AtomicU64::new(0),
        }
    }

    pub fn store_calls(&self) -> u64 {
        self.store_calls.load(Ordering::Relaxed)
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.lock().contains_key(digest)
    }

    pub fn insert(&self, digest: Digest, blob: FileBlob) {
        self.blobs.lock().insert(digest, blob);
    }

    /// Simulates server-side cache eviction.
    pub fn evict(&self, digest: &Digest) {
        self.blobs.lock().remove(digest);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }
}

#[async_trait]
impl BlobServiceClient for InMemoryBlobService {
    async fn store_blob(&self, digest: Digest, blob: FileBlob) -> Result<(), StoreError> {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        if !blob.is_valid() {
            return Err(StoreError::InvalidBlob(format!(
                "refusing malformed {:?} blob",
                blob.kind
            )));
        }
        self.blobs.lock().insert(digest, blob);
        Ok(())
    }

    async fn get_blob(&self, digest: Digest) -> Result<Option<FileBlob>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.blobs.lock().get(&digest).cloned())
    }

    async fn lookup_missing(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, StoreError> {
        let blobs = self.blobs.lock();
        Ok(digests
            .into_iter()
            .filter(|digest| !blobs.contains_key(digest))
            .collect())
    }
}
