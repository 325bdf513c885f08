// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::Duration;

use crate::Executor;

#[tokio::test]
async fn spawn_runs_future() {
    let executor = Executor::new();
    let value = executor.spawn(async { 21 * 2 }).await.unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn spawn_blocking_runs_off_worker() {
    let executor = Executor::new();
    let value = executor
        .spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(5));
            "done"
        })
        .await
        .unwrap();
    assert_eq!(value, "done");
}

#[tokio::test]
async fn shutdown_of_borrowed_executor_is_noop() {
    let executor = Executor::new();
    executor.shutdown(Duration::from_millis(10));
    // Still usable afterwards.
    let value = executor.spawn(async { 1 }).await.unwrap();
    assert_eq!(value, 1);
}

#[test]
fn owned_executor_runs_and_shuts_down() {
    let executor = Executor::new_owned(Some(2)).unwrap();
    let value = executor.block_on(async { 7 });
    assert_eq!(value, 7);
    executor.shutdown(Duration::from_millis(100));
}
