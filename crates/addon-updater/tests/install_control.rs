//! Integration tests for install pause, resume and cancellation.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use addon_updater::{InstallControl, InstallState, Options, UpdateError};
use common::{engine, hypermedia_profile, read_tree, write_tree, HyperFile, MockServer};
use tempfile::TempDir;

async fn wait_for_state(control: &InstallControl, wanted: InstallState) {
    let mut states = control.subscribe_state();
    tokio::time::timeout(Duration::from_secs(10), async {
        while *states.borrow_and_update() != wanted {
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("state not reached in time");
}

fn files() -> Vec<HyperFile> {
    vec![
        HyperFile::new("a.txt", "UPDATE", b"alpha v2"),
        HyperFile::new("b.txt", "ADD", b"bravo"),
    ]
}

/// Test: Cancelling before start leaves the tree and the plan untouched
#[tokio::test]
async fn cancel_before_start() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(files());

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha v1")]);
    let before = read_tree(&root);

    let engine = engine(&temp);
    let profile = hypermedia_profile(&server, &root);
    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();

    let control = InstallControl::new();
    control.cancel();
    let result = engine.install(&profile, &plan.plan_id, None, &control).await;
    assert!(matches!(result, Err(UpdateError::Cancelled)));
    assert_eq!(control.state(), InstallState::Cancelled);
    assert_eq!(read_tree(&root), before);
    assert!(!engine.rollback_info(&profile).await.available);

    // The plan survives a cancelled run.
    let retry = engine
        .install(&profile, &plan.plan_id, None, &InstallControl::new())
        .await
        .unwrap();
    assert_eq!(retry.updated, 2);
}

/// Test: A paused install parks until resumed, then completes
#[tokio::test]
async fn pause_then_resume_completes() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(files());

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha v1")]);

    let engine = Arc::new(engine(&temp));
    let profile = hypermedia_profile(&server, &root);
    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();

    let control = InstallControl::new();
    control.pause();
    let job = {
        let engine = Arc::clone(&engine);
        let profile = profile.clone();
        let control = control.clone();
        let plan_id = plan.plan_id.clone();
        tokio::spawn(async move { engine.install(&profile, &plan_id, None, &control).await })
    };

    wait_for_state(&control, InstallState::Paused).await;
    assert_eq!(read_tree(&root), vec![("a.txt".to_string(), b"alpha v1".to_vec())]);

    control.resume();
    let result = job.await.unwrap().unwrap();
    assert_eq!(result.updated, 2);
    assert_eq!(control.state(), InstallState::Completed);
    assert_eq!(
        read_tree(&root),
        vec![
            ("a.txt".to_string(), b"alpha v2".to_vec()),
            ("b.txt".to_string(), b"bravo".to_vec()),
        ]
    );
}

/// Test: Cancelling while paused stops the job without changes
#[tokio::test]
async fn cancel_while_paused() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(files());

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha v1")]);
    let before = read_tree(&root);

    let engine = Arc::new(engine(&temp));
    let profile = hypermedia_profile(&server, &root);
    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();

    let control = InstallControl::new();
    control.pause();
    let job = {
        let engine = Arc::clone(&engine);
        let profile = profile.clone();
        let control = control.clone();
        let plan_id = plan.plan_id.clone();
        tokio::spawn(async move { engine.install(&profile, &plan_id, None, &control).await })
    };

    wait_for_state(&control, InstallState::Paused).await;
    control.cancel();
    let result = job.await.unwrap();
    assert!(matches!(result, Err(UpdateError::Cancelled)));
    assert_eq!(control.state(), InstallState::Cancelled);
    assert_eq!(read_tree(&root), before);
    assert_eq!(server.state.data_requests.load(std::sync::atomic::Ordering::SeqCst), 0);
}

/// Bytes written so far to in-flight `.part` downloads under `dir`.
fn partial_bytes(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                partial_bytes(&path)
            } else if path.extension().is_some_and(|ext| ext == "part") {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            } else {
                0
            }
        })
        .sum()
}

/// Test: Pausing during a streamed download stops the transfer mid-body
#[tokio::test]
async fn pause_mid_download_holds_transfer() {
    let body: Vec<u8> = (0u8..20).collect();
    let server = MockServer::start().await;
    server
        .state
        .set_hyper_files(vec![HyperFile::new("slow.bin", "ADD", &body)]);
    server.state.set_chunk_delay(Duration::from_millis(200));

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    std::fs::create_dir_all(&root).unwrap();
    let downloads = temp.path().join("tmp");

    let engine = Arc::new(engine(&temp));
    let profile = hypermedia_profile(&server, &root);
    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();

    let control = InstallControl::new();
    let job = {
        let engine = Arc::clone(&engine);
        let profile = profile.clone();
        let control = control.clone();
        let plan_id = plan.plan_id.clone();
        tokio::spawn(async move { engine.install(&profile, &plan_id, None, &control).await })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while partial_bytes(&downloads) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("download never started");
    control.pause();
    wait_for_state(&control, InstallState::Paused).await;

    let held = partial_bytes(&downloads);
    assert!(held > 0 && held < body.len() as u64, "held {held} bytes");
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(partial_bytes(&downloads), held);
    assert!(!job.is_finished());

    control.resume();
    let result = job.await.unwrap().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(read_tree(&root), vec![("slow.bin".to_string(), body)]);
}
