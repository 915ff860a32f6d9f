//! Integration tests for the hypermedia provider.
//!
//! These tests run plan, install and rollback against an in-process
//! catalog server:
//! - Manifest-driven delete detection alongside state-driven updates
//! - Idempotent re-planning after an install
//! - Byte-identical rollback with manifest restore
//! - Fresh installs deleting unclaimed local files
//! - Auth handshake retries and rejections

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use addon_updater::{ActionKind, InstallControl, InstallManifest, Options, ProviderKind, UpdateError};
use common::{engine, hypermedia_profile, read_tree, write_tree, HyperFile, MockServer};
use tempfile::TempDir;

fn kinds(plan: &addon_updater::Plan) -> Vec<(ActionKind, String)> {
    plan.actions
        .iter()
        .map(|a| (a.kind, a.relative_path.clone()))
        .collect()
}

/// Server listing for the basic scenario: `a.txt` changed, `b.txt` new,
/// `d.txt` unchanged. `c.txt` is gone from the listing.
fn scenario_files() -> Vec<HyperFile> {
    vec![
        HyperFile::new("a.txt", "UPDATE", b"alpha v2"),
        HyperFile::new("b.txt", "ADD", b"bravo"),
        HyperFile::new("d.txt", "NONE", b"delta"),
    ]
}

/// Test: Plan deletes manifest files the listing dropped, then updates
#[tokio::test]
async fn hypermedia_plan_scenario() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(scenario_files());

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha v1"), ("c.txt", b"charlie"), ("d.txt", b"delta")]);

    let engine = engine(&temp);
    let profile = hypermedia_profile(&server, &root);
    engine
        .services()
        .snapshot_manager(ProviderKind::Hypermedia)
        .manifest_store(&profile.id)
        .save(&InstallManifest::new(
            ProviderKind::Hypermedia,
            None,
            "",
            vec!["a.txt".into(), "c.txt".into(), "d.txt".into()],
        ))
        .unwrap();

    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();
    assert_eq!(
        kinds(&plan),
        vec![
            (ActionKind::Delete, "c.txt".to_string()),
            (ActionKind::Update, "a.txt".to_string()),
            (ActionKind::Update, "b.txt".to_string()),
        ]
    );
    assert_eq!(plan.summary.delete_count, 1);
    assert_eq!(plan.summary.file_count, 3);
    assert_eq!(plan.summary.snapshot_type, "release");
    assert_eq!(plan.summary.snapshot_number, 3);
}

/// Test: Install applies the plan and a second plan finds nothing to do
#[tokio::test]
async fn hypermedia_install_then_replan_is_empty() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(scenario_files());

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha v1"), ("c.txt", b"charlie"), ("d.txt", b"delta")]);

    let engine = engine(&temp);
    let profile = hypermedia_profile(&server, &root);
    let store = engine
        .services()
        .snapshot_manager(ProviderKind::Hypermedia)
        .manifest_store(&profile.id);
    store
        .save(&InstallManifest::new(
            ProviderKind::Hypermedia,
            None,
            "",
            vec!["a.txt".into(), "c.txt".into(), "d.txt".into()],
        ))
        .unwrap();

    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();
    let control = InstallControl::new();
    let result = engine.install(&profile, &plan.plan_id, None, &control).await.unwrap();
    assert_eq!(result.updated, 2);
    assert_eq!(result.deleted, 1);
    assert_eq!(result.snapshot_number, 3);

    assert_eq!(
        read_tree(&root),
        vec![
            ("a.txt".to_string(), b"alpha v2".to_vec()),
            ("b.txt".to_string(), b"bravo".to_vec()),
            ("d.txt".to_string(), b"delta".to_vec()),
        ]
    );
    let manifest = store.load().unwrap();
    assert_eq!(manifest.files, vec!["a.txt", "b.txt", "d.txt"]);

    // The plan is retired after a successful install.
    let again = engine.install(&profile, &plan.plan_id, None, &control).await;
    assert!(matches!(again, Err(UpdateError::PlanNotFound)));

    let replan = engine.create_plan(&profile, &Options::default()).await.unwrap();
    assert!(replan.is_empty());
}

/// Test: Rollback restores bytes and the previous manifest
#[tokio::test]
async fn hypermedia_rollback_restores_tree() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(scenario_files());

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha v1"), ("c.txt", b"charlie"), ("d.txt", b"delta")]);
    let before = read_tree(&root);

    let engine = engine(&temp);
    let profile = hypermedia_profile(&server, &root);
    let store = engine
        .services()
        .snapshot_manager(ProviderKind::Hypermedia)
        .manifest_store(&profile.id);
    let previous = InstallManifest::new(
        ProviderKind::Hypermedia,
        None,
        "",
        vec!["a.txt".into(), "c.txt".into(), "d.txt".into()],
    );
    store.save(&previous).unwrap();

    assert!(!engine.rollback_info(&profile).await.available);

    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();
    engine
        .install(&profile, &plan.plan_id, None, &InstallControl::new())
        .await
        .unwrap();

    let info = engine.rollback_info(&profile).await;
    assert!(info.available);
    assert_eq!(info.entry_count, 3);

    let result = engine.rollback(&profile).await.unwrap();
    assert_eq!(result.restored, 2);
    assert_eq!(result.removed, 1);
    assert_eq!(read_tree(&root), before);
    assert_eq!(store.load().unwrap().files, previous.files);

    assert!(!engine.rollback_info(&profile).await.available);
    assert!(matches!(engine.rollback(&profile).await, Err(UpdateError::NoSnapshot)));
}

/// Test: Fresh mode reinstalls every listed file and removes strays
#[tokio::test]
async fn hypermedia_fresh_deletes_strays() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(vec![
        HyperFile::new("a.txt", "NONE", b"alpha"),
        HyperFile::new("sub/b.txt", "NONE", b"bravo"),
    ]);

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha"), ("stray.txt", b"junk"), ("sub/old.txt", b"old")]);

    let engine = engine(&temp);
    let profile = hypermedia_profile(&server, &root);
    let options = Options {
        fresh: true,
        ..Options::default()
    };

    let plan = engine.create_plan(&profile, &options).await.unwrap();
    let deletes: Vec<&str> = plan
        .actions
        .iter()
        .filter(|a| a.is_delete())
        .map(|a| a.relative_path.as_str())
        .collect();
    assert_eq!(deletes, vec!["stray.txt", "sub/old.txt"]);
    assert!(plan.actions.iter().filter(|a| a.is_delete()).all(|a| a.fresh_deletion));
    assert_eq!(plan.update_count(), 2);

    engine
        .install(&profile, &plan.plan_id, None, &InstallControl::new())
        .await
        .unwrap();
    assert_eq!(
        read_tree(&root),
        vec![
            ("a.txt".to_string(), b"alpha".to_vec()),
            ("sub/b.txt".to_string(), b"bravo".to_vec()),
        ]
    );
}

/// Test: Ignore list drops matching actions and counts them
#[tokio::test]
async fn hypermedia_ignore_list() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(vec![
        HyperFile::new("a.txt", "ADD", b"alpha"),
        HyperFile::new("liveries/custom.png", "ADD", b"png"),
    ]);

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    std::fs::create_dir_all(&root).unwrap();

    let engine = engine(&temp);
    let mut profile = hypermedia_profile(&server, &root);
    profile.ignore_list = vec!["liveries/".to_string()];

    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();
    assert_eq!(kinds(&plan), vec![(ActionKind::Update, "a.txt".to_string())]);
    assert_eq!(plan.summary.ignored_count, 1);
    assert!(plan.warnings.iter().any(|w| w == "Ignore list skipped 1 action(s)."));
}

/// Test: Auth retries through 202 and 429, honouring the minimum wait
#[tokio::test]
async fn hypermedia_auth_retries_until_token() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(scenario_files());
    server.state.script_auth(&[202, 429]);

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha v1")]);

    let engine = engine(&temp);
    let profile = hypermedia_profile(&server, &root);
    let started = Instant::now();
    let plan = engine.create_plan(&profile, &Options::default()).await.unwrap();

    assert_eq!(server.state.auth_requests.load(Ordering::SeqCst), 3);
    // `Retry-After: 0` is raised to the one-second floor on each retry.
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(plan.summary.snapshot_number, 3);
    assert!(!plan.is_empty());
}

/// Test: A rejected handshake fails at once without touching the catalog
#[tokio::test]
async fn hypermedia_auth_rejection_stops() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(scenario_files());
    server.state.script_auth(&[401]);

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write_tree(&root, &[("a.txt", b"alpha v1")]);

    let engine = engine(&temp);
    let profile = hypermedia_profile(&server, &root);
    let result = engine.create_plan(&profile, &Options::default()).await;

    assert!(matches!(result, Err(UpdateError::Http { status: 401, .. })));
    assert_eq!(server.state.auth_requests.load(Ordering::SeqCst), 1);
    assert_eq!(server.state.catalog_requests.load(Ordering::SeqCst), 0);
}

/// Test: Exhausting the retry budget reports the last throttling status
#[tokio::test]
async fn hypermedia_auth_retry_budget_exhausted() {
    let server = MockServer::start().await;
    server.state.set_hyper_files(scenario_files());
    server.state.script_auth(&[429, 429]);

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    std::fs::create_dir_all(&root).unwrap();

    let engine = common::engine_with(&temp, |config| config.hypermedia.max_auth_attempts = 2);
    let profile = hypermedia_profile(&server, &root);
    let result = engine.create_plan(&profile, &Options::default()).await;

    assert!(matches!(result, Err(UpdateError::Http { status: 429, .. })));
    assert_eq!(server.state.auth_requests.load(Ordering::SeqCst), 2);
    assert_eq!(server.state.catalog_requests.load(Ordering::SeqCst), 0);
}
