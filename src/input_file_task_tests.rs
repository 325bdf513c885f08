// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hash_cache::FileHashCache;
use hashing::Digest;
use store::testing::InMemoryBlobService;

use fs::FileStat;

use crate::input_file_task::{
    InputFileSpec, InputFileTaskRegistry, LARGE_FILE_THRESHOLD, TINY_FILE_THRESHOLD,
};

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    registry: Arc<InputFileTaskRegistry>,
    blob_service: Arc<InMemoryBlobService>,
    hash_cache: Arc<FileHashCache>,
}

impl Fixture {
    fn new() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        Fixture {
            root: dir.path().to_path_buf(),
            _dir: dir,
            registry: InputFileTaskRegistry::new(),
            blob_service: Arc::new(InMemoryBlobService::new()),
            hash_cache: Arc::new(FileHashCache::new()),
        }
    }

    fn write(&self, name: &str, bytes: &[u8], age_secs: u64) -> PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, bytes).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    fn spec(&self, path: &PathBuf) -> InputFileSpec {
        let file_stat = FileStat::of_path(path);
        let is_new_file = file_stat
            .mtime
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .map(|age| age < Duration::from_secs(3600))
            .unwrap_or(true);
        InputFileSpec {
            filename: path.clone(),
            file_stat,
            missed_at: None,
            missed_content: false,
            linking: false,
            is_new_file,
        }
    }

    async fn run(&self, spec: InputFileSpec) -> crate::input_file_task::InputFileResult {
        self.registry
            .run(spec, self.blob_service.clone(), self.hash_cache.clone())
            .await
    }
}

#[tokio::test]
async fn tiny_file_is_embedded() {
    let fixture = Fixture::new();
    let path = fixture.write("tiny.h", b"#define T 1\n", 7200);

    let result = fixture.run(fixture.spec(&path)).await;
    assert!(result.success);
    assert!(result.inline_blob.is_some());
    assert!(!result.uploaded_in_side_channel);
    assert_eq!(result.reason, "small");
    // Nothing hits the side channel for an embed.
    assert_eq!(fixture.blob_service.store_calls(), 0);
}

#[tokio::test]
async fn new_file_with_new_key_is_transferred() {
    let fixture = Fixture::new();
    let bytes = vec![b'x'; TINY_FILE_THRESHOLD as usize * 2];
    // Age 0: the file was just written, so its blob is presumed unknown remotely.
    let path = fixture.write("fresh.o", &bytes, 0);

    let result = fixture.run(fixture.spec(&path)).await;
    assert!(result.success);
    assert_eq!(result.reason, "no hash key");
    assert!(result.inline_blob.is_some());
}

#[tokio::test]
async fn large_file_goes_side_channel() {
    let fixture = Fixture::new();
    let bytes = vec![b'x'; LARGE_FILE_THRESHOLD as usize + 1];
    let path = fixture.write("big.bin", &bytes, 0);

    let result = fixture.run(fixture.spec(&path)).await;
    assert!(result.success);
    assert!(result.uploaded_in_side_channel);
    assert!(result.inline_blob.is_none());
    assert!(fixture.blob_service.store_calls() > 0);
    assert_eq!(result.hash_key.unwrap(), Digest::of_bytes(&bytes));
}

#[tokio::test]
async fn missed_content_forces_transfer() {
    let fixture = Fixture::new();
    let path = fixture.write("seen.h", &vec![b'y'; 4096], 7200);

    // First sighting: no recorded hash yet, so the content is embedded.
    let first = fixture.run(fixture.spec(&path)).await;
    assert!(first.success);
    assert_eq!(first.reason, "no hash key");
    assert!(first.inline_blob.is_some());

    // The server then reports it missing: the retry must carry bytes.
    let mut spec = fixture.spec(&path);
    spec.missed_content = true;
    spec.missed_at = Some(SystemTime::now());
    let second = fixture.run(spec).await;
    assert!(second.success);
    assert_eq!(second.reason, "missed content");
    assert!(second.inline_blob.is_some() || second.uploaded_in_side_channel);
}

#[tokio::test]
async fn rsp_file_always_carries_content() {
    let fixture = Fixture::new();
    let path = fixture.write("link.rsp", &vec![b'a'; 4096], 7200);

    let result = fixture.run(fixture.spec(&path)).await;
    assert!(result.success);
    assert_eq!(result.reason, "rsp file");
    assert!(result.inline_blob.is_some());
}

#[tokio::test]
async fn linking_input_uploads_side_channel_then_goes_hash_only() {
    let fixture = Fixture::new();
    let bytes = vec![b'z'; 4096];
    let path = fixture.write("lib.o", &bytes, 7200);

    // First sighting under linking: hash-only is wanted, so the content goes side channel.
    let mut spec = fixture.spec(&path);
    spec.linking = true;
    let result = fixture.run(spec).await;
    assert!(result.success);
    assert!(result.uploaded_in_side_channel);
    assert!(result.inline_blob.is_none());
    assert_eq!(result.hash_key.unwrap(), Digest::of_bytes(&bytes));

    // With the upload recorded, the next compile sends the key alone.
    let mut spec = fixture.spec(&path);
    spec.linking = true;
    let second = fixture.run(spec).await;
    assert!(second.success);
    assert_eq!(second.reason, "hash only");
    assert!(!second.uploaded_in_side_channel);
    assert!(second.inline_blob.is_none());
}

#[tokio::test]
async fn second_compile_reuses_recorded_hash() {
    let fixture = Fixture::new();
    let bytes = vec![b'q'; 4096];
    let path = fixture.write("stable.h", &bytes, 7200);

    let first = fixture.run(fixture.spec(&path)).await;
    assert!(first.success);

    // The first run recorded the hash; a second lookup with the same stat is confident, so no
    // further hashing or transfer happens.
    let second = fixture.run(fixture.spec(&path)).await;
    assert!(second.success);
    assert_eq!(second.reason, "hash only");
    assert_eq!(second.hash_key, first.hash_key);
}

#[tokio::test]
async fn concurrent_requests_for_same_path_run_once() {
    let fixture = Fixture::new();
    let bytes = vec![b'w'; LARGE_FILE_THRESHOLD as usize + 1];
    let path = fixture.write("shared.h", &bytes, 0);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = fixture.registry.clone();
        let spec = fixture.spec(&path);
        let blob_service = fixture.blob_service.clone();
        let hash_cache = fixture.hash_cache.clone();
        tasks.push(tokio::spawn(async move {
            registry.run(spec, blob_service, hash_cache).await
        }));
    }
    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let expected = Digest::of_bytes(&bytes);
    for result in &results {
        assert!(result.success);
        assert_eq!(result.hash_key.unwrap(), expected);
    }
    // One upload: a >2 MiB file stores its two chunks plus one meta blob, exactly once.
    assert_eq!(fixture.blob_service.store_calls(), 3);
    assert_eq!(fixture.registry.outstanding(), 0);
}

#[tokio::test]
async fn missing_file_fails_cleanly() {
    let fixture = Fixture::new();
    let path = fixture.root.join("never-existed.h");
    let spec = InputFileSpec {
        filename: path.clone(),
        file_stat: FileStat::default(),
        missed_at: None,
        missed_content: false,
        linking: false,
        is_new_file: true,
    };
    let result = fixture.run(spec).await;
    assert!(!result.success);
    assert_eq!(fixture.registry.outstanding(), 0);
}
