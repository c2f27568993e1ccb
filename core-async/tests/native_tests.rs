//! Integration tests for the runtime layer.
//!
//! These exercise the primitives the cache crates actually lean on: spawned
//! fetch tasks, timeouts around network calls, cancellation of preloads and
//! watch channels used to coalesce in-flight segment fetches.

use core_async::sync::{CancellationToken, Mutex, Semaphore};
use core_async::{fs, io::AsyncWriteExt, sync, task, time};
use std::sync::Arc;

#[tokio::test]
async fn test_task_spawn() {
    let handle = task::spawn(async { 42 });
    assert_eq!(handle.await.unwrap(), 42);
}

#[tokio::test]
async fn test_timeout_failure() {
    let result = time::timeout(time::Duration::from_millis(10), async {
        time::sleep(time::Duration::from_millis(200)).await;
        42
    })
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_cancellation_token_wakes_waiter() {
    let token = CancellationToken::new();
    let child = token.child_token();

    let waiter = task::spawn(async move {
        child.cancelled().await;
        "stopped"
    });

    token.cancel();
    assert_eq!(waiter.await.unwrap(), "stopped");
}

#[tokio::test]
async fn test_watch_channel_wait_for() {
    let (tx, mut rx) = sync::watch::channel(false);

    let waiter = task::spawn(async move {
        rx.wait_for(|ready| *ready).await.is_ok()
    });

    time::sleep(time::Duration::from_millis(5)).await;
    tx.send(true).unwrap();
    assert!(waiter.await.unwrap());
}

#[tokio::test]
async fn test_semaphore_limits_concurrency() {
    let semaphore = Arc::new(Semaphore::new(1));
    let counter = Arc::new(Mutex::new(0usize));
    let peak = Arc::new(Mutex::new(0usize));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let semaphore = semaphore.clone();
        let counter = counter.clone();
        let peak = peak.clone();
        handles.push(task::spawn(async move {
            let _permit = semaphore.acquire().await.unwrap();
            {
                let mut current = counter.lock().await;
                *current += 1;
                let mut max = peak.lock().await;
                *max = (*max).max(*current);
            }
            time::sleep(time::Duration::from_millis(2)).await;
            *counter.lock().await -= 1;
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*peak.lock().await, 1);
}

#[tokio::test]
async fn test_fs_append_and_rename() {
    let dir = std::env::temp_dir().join(format!("core-async-fs-{}", std::process::id()));
    fs::create_dir_all(&dir).await.unwrap();

    let source = dir.join("a.tmp");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&source)
        .await
        .unwrap();
    file.write_all(b"hello ").await.unwrap();
    file.write_all(b"world").await.unwrap();
    file.flush().await.unwrap();
    drop(file);

    let target = dir.join("a.bin");
    fs::rename(&source, &target).await.unwrap();

    assert_eq!(fs::read(&target).await.unwrap(), b"hello world");
    fs::remove_dir_all(&dir).await.unwrap();
}
