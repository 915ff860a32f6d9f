//! Property-based tests for addon-updater.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Property 1: Root Confinement
//! - Property 2: Delete-Before-Update Ordering
//! - Property 3: Central Directory Parity (local file vs in-memory bytes)
//! - Property 4: Single-Byte Corruption Detection
//! - Property 5: Snapshot Rollback Restores Bytes

#![cfg(test)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use tempfile::TempDir;

use crate::error::UpdateError;
use crate::paths::{collect_files, normalize_rel_path, normalize_zip_rel_path, resolve_within_root};
use crate::plan::{order_actions, Action, ActionKind, FileState, Plan, PlanSummary};
use crate::profile::{Profile, ProviderKind};
use crate::snapshot::SnapshotManager;
use crate::verify::{md5_bytes, ContentVerifier};
use crate::zip_index::test_support::build_zip;
use crate::zip_index::{list_entries, ByteSource, LocalZipFile, Tail};

// =============================================================================
// Generators
// =============================================================================

/// Path segments, hostile ones included.
fn arb_segment() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[a-zA-Z0-9_]{1,8}",
        1 => Just("..".to_string()),
        1 => Just(".".to_string()),
        1 => Just("".to_string()),
        1 => Just("C:".to_string()),
    ]
}

/// Relative paths joined with either separator, possibly rooted.
fn arb_raw_path() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(arb_segment(), 1..6),
        prop::bool::ANY,
        prop::bool::ANY,
    )
        .prop_map(|(segments, backslash, rooted)| {
            let sep = if backslash { "\\" } else { "/" };
            let joined = segments.join(sep);
            if rooted {
                format!("{}{}", sep, joined)
            } else {
                joined
            }
        })
}

/// Actions with a random kind.
fn arb_actions() -> impl Strategy<Value = Vec<Action>> {
    prop::collection::vec(("[a-z]{1,6}", prop::bool::ANY), 0..30).prop_map(|items| {
        items
            .into_iter()
            .map(|(name, delete)| {
                if delete {
                    Action::delete(name, "pkg", "")
                } else {
                    update_action(&name)
                }
            })
            .collect()
    })
}

/// Archive contents: unique names, arbitrary bytes, mixed methods.
fn arb_zip_files() -> impl Strategy<Value = BTreeMap<String, (Vec<u8>, bool)>> {
    prop::collection::btree_map(
        "[a-z]{1,4}(/[a-z]{1,4})?\\.bin",
        (prop::collection::vec(any::<u8>(), 0..2048), prop::bool::ANY),
        1..12,
    )
}

/// Random payload and a byte position within it.
fn arb_payload_and_index() -> impl Strategy<Value = (Vec<u8>, usize)> {
    prop::collection::vec(any::<u8>(), 1..4096)
        .prop_flat_map(|payload| {
            let len = payload.len();
            (Just(payload), 0..len)
        })
}

/// Flat install tree: file name to content.
fn arb_tree() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map("[a-f]{1,3}\\.txt", prop::collection::vec(any::<u8>(), 0..256), 0..8)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn update_action(path: &str) -> Action {
    Action {
        kind: ActionKind::Update,
        relative_path: path.to_string(),
        package_name: "pkg".to_string(),
        package_dir: String::new(),
        state: Some(FileState::Update),
        compressed_size: 0,
        real_size: 0,
        hash: None,
        locator: None,
        fresh_deletion: false,
        repair_update: false,
    }
}

fn plan_for(actions: Vec<Action>) -> Plan {
    Plan {
        plan_id: "plan".to_string(),
        provider: ProviderKind::Archive,
        profile_id: "p1".to_string(),
        created_at: Utc::now(),
        summary: PlanSummary::default(),
        actions,
        warnings: Vec::new(),
        optional_packages: Vec::new(),
        diagnostics: None,
    }
}

/// Archive bytes held in memory.
struct MemoryZip(Vec<u8>);

#[async_trait]
impl ByteSource for MemoryZip {
    async fn tail(&self, max_len: u64) -> Result<Tail, UpdateError> {
        let total = self.0.len() as u64;
        let start = total.saturating_sub(max_len) as usize;
        Ok(Tail {
            bytes: self.0[start..].to_vec(),
            total_size: total,
        })
    }

    async fn range(&self, start: u64, end: u64) -> Result<Vec<u8>, UpdateError> {
        let end = (end as usize).min(self.0.len().saturating_sub(1));
        Ok(self.0[start as usize..=end].to_vec())
    }
}

fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    collect_files(root)
        .unwrap()
        .into_iter()
        .map(|rel| {
            let bytes = fs::read(root.join(&rel)).unwrap();
            (rel, bytes)
        })
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Property 1: Root Confinement
//
// *For any* raw catalog or archive path, normalization either rejects it
// or yields a path that resolves inside the install root.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_normalized_paths_stay_within_root(raw in arb_raw_path()) {
        let root = Path::new("/install/root");
        if let Ok(rel) = normalize_rel_path(&raw) {
            prop_assert!(!rel.split('/').any(|s| s == ".." || s.is_empty()));
            let resolved = resolve_within_root(root, &rel).unwrap();
            prop_assert!(resolved.starts_with(root));
            prop_assert!(resolved != root);
        }
    }

    #[test]
    fn prop_zip_names_with_parent_segments_are_rejected(raw in arb_raw_path()) {
        let normalized = raw.replace('\\', "/");
        let result = normalize_zip_rel_path(&raw);
        if normalized.split('/').any(|s| s == "..") || normalized.starts_with('/') {
            prop_assert!(result.is_err());
        }
        if let Ok(rel) = result {
            prop_assert!(resolve_within_root(Path::new("/install/root"), &rel).is_ok());
        }
    }
}

// =============================================================================
// Property 2: Delete-Before-Update Ordering
//
// *For any* action list, ordering places every delete before every update
// and keeps the relative order within each group.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_deletes_precede_updates(actions in arb_actions()) {
        let deletes: Vec<String> = actions.iter().filter(|a| a.is_delete()).map(|a| a.relative_path.clone()).collect();
        let updates: Vec<String> = actions.iter().filter(|a| a.is_update()).map(|a| a.relative_path.clone()).collect();

        let ordered = order_actions(actions);
        let first_update = ordered.iter().position(Action::is_update).unwrap_or(ordered.len());
        prop_assert!(ordered[first_update..].iter().all(Action::is_update));

        let ordered_deletes: Vec<String> = ordered[..first_update].iter().map(|a| a.relative_path.clone()).collect();
        let ordered_updates: Vec<String> = ordered[first_update..].iter().map(|a| a.relative_path.clone()).collect();
        prop_assert_eq!(ordered_deletes, deletes);
        prop_assert_eq!(ordered_updates, updates);
    }
}

// =============================================================================
// Property 3: Central Directory Parity
//
// *For any* archive, parsing the central directory from a local file and
// from in-memory bytes yields the same entries, and those entries agree
// with an independent ZIP reader.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_local_and_memory_listings_agree(files in arb_zip_files()) {
        let contents: Vec<(&str, &[u8], bool)> = files
            .iter()
            .map(|(name, (bytes, deflate))| (name.as_str(), bytes.as_slice(), *deflate))
            .collect();
        let bytes = build_zip(&contents);

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pkg.zip");
        fs::write(&path, &bytes).unwrap();

        let rt = runtime();
        let local = rt.block_on(list_entries(&LocalZipFile::new(&path))).unwrap();
        let memory = rt.block_on(list_entries(&MemoryZip(bytes.clone()))).unwrap();
        prop_assert_eq!(&local, &memory);
        prop_assert_eq!(local.len(), files.len());

        let mut reader = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        for entry in &local {
            let file = reader.by_name(&entry.file_name).unwrap();
            prop_assert_eq!(file.crc32(), entry.crc32);
            prop_assert_eq!(file.size(), entry.uncompressed_size);
            prop_assert_eq!(file.compressed_size(), entry.compressed_size);
            prop_assert_eq!(file.header_start(), entry.local_header_offset);
        }
    }
}

// =============================================================================
// Property 4: Single-Byte Corruption Detection
//
// *For any* payload, flipping one byte makes MD5 verification fail.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_single_byte_flip_fails_verification((payload, index) in arb_payload_and_index()) {
        let expected = md5_bytes(&payload);
        let mut corrupted = payload.clone();
        corrupted[index] ^= 0xff;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("payload.bin");
        fs::write(&path, &corrupted).unwrap();

        let verifier = ContentVerifier::new(true);
        let result = verifier.verify_md5(&path, &expected, "payload.bin");
        let is_mismatch = matches!(result, Err(UpdateError::ChecksumMismatch { .. }));
        prop_assert!(is_mismatch);

        fs::write(&path, &payload).unwrap();
        prop_assert!(verifier.verify_md5(&path, &expected, "payload.bin").is_ok());
    }
}

// =============================================================================
// Property 5: Snapshot Rollback Restores Bytes
//
// *For any* install tree and set of touched paths, snapshot then mutate
// then rollback leaves the tree byte-identical to its starting state.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_rollback_restores_tree(
        tree in arb_tree(),
        touched in prop::collection::btree_map("[a-f]{1,3}\\.txt", prop::bool::ANY, 1..8),
    ) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        for (name, bytes) in &tree {
            fs::write(root.join(name), bytes).unwrap();
        }
        let before = read_tree(&root);

        let profile = Profile {
            id: "p1".to_string(),
            product_dir: root.clone(),
            ..Profile::default()
        };
        let actions: Vec<Action> = touched
            .iter()
            .map(|(name, delete)| {
                if *delete {
                    Action::delete(name.clone(), "pkg", "")
                } else {
                    update_action(name)
                }
            })
            .collect();
        let plan = plan_for(order_actions(actions));

        let snapshots = SnapshotManager::new(&temp.path().join("state"), ProviderKind::Archive, 5);
        runtime().block_on(snapshots.create(&profile, &root, &plan, None)).unwrap();

        for action in &plan.actions {
            let target = root.join(&action.relative_path);
            if action.is_delete() {
                let _ = fs::remove_file(&target);
            } else {
                fs::write(&target, b"replaced").unwrap();
            }
        }

        snapshots.rollback(&profile).unwrap();
        prop_assert_eq!(read_tree(&root), before);
        prop_assert!(!snapshots.rollback_info("p1").available);
    }
}
