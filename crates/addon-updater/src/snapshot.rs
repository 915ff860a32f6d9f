//! Snapshot and rollback management.
//!
//! Before an install mutates anything, every path the plan touches is
//! backed up into a snapshot directory. Rollback replays the snapshot in
//! reverse and restores the install manifest that was current before.
//!
//! ## State layout
//!
//! ```text
//! state_dir/
//! └── <provider>/
//!     └── <profile>/
//!         ├── manifest.json           # Current install manifest
//!         ├── latest-snapshot.json    # Pointer to the newest snapshot
//!         └── snapshots/
//!             └── snap-1704067200000-a1b2c3/
//!                 ├── meta.json       # Entries, labels, previous manifest
//!                 └── files/          # Backed up bytes by relative path
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::install::InstallControl;
use crate::manifest::{InstallManifest, ManifestStore};
use crate::paths::{
    commit_copy, normalize_rel_path, remove_file_and_empty_parents, resolve_within_root,
    safe_id_segment, write_atomic,
};
use crate::plan::{ActionKind, Plan};
use crate::profile::{Profile, ProviderKind};

/// Metadata file name within snapshot directories.
const META_FILE: &str = "meta.json";
/// Backed up file tree within snapshot directories.
const FILES_DIR: &str = "files";
/// Latest snapshot pointer within the profile state directory.
const POINTER_FILE: &str = "latest-snapshot.json";
const SNAPSHOTS_DIR: &str = "snapshots";

const SNAPSHOT_VERSION: u32 = 1;

/// One backed up path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub relative_path: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// Whether a regular file existed before the install
    pub had_original: bool,
    /// Backup location relative to the snapshot `files/` directory
    #[serde(default)]
    pub backup_path: Option<String>,
}

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub version: u32,
    pub snapshot_id: String,
    pub provider: ProviderKind,
    pub profile_id: String,
    #[serde(default)]
    pub profile_name: String,
    #[serde(default)]
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub root_dir: PathBuf,
    #[serde(default)]
    pub source_snapshot_type: String,
    #[serde(default)]
    pub source_snapshot_number: u64,
    #[serde(default)]
    pub target_snapshot_type: String,
    #[serde(default)]
    pub target_snapshot_number: u64,
    pub entries: Vec<SnapshotEntry>,
    /// Manifest current before the install; `None` when there was none
    #[serde(default)]
    pub previous_manifest: Option<InstallManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotPointer {
    version: u32,
    provider: ProviderKind,
    profile_id: String,
    snapshot_id: String,
    created_at: DateTime<Utc>,
}

/// A snapshot on disk.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    pub dir: PathBuf,
    pub meta: SnapshotMeta,
}

impl SnapshotHandle {
    pub fn snapshot_id(&self) -> &str {
        &self.meta.snapshot_id
    }

    fn files_dir(&self) -> PathBuf {
        self.dir.join(FILES_DIR)
    }
}

/// Whether a rollback is available and what it would restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackInfo {
    pub available: bool,
    pub snapshot_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub source_snapshot_type: String,
    pub source_snapshot_number: u64,
    pub target_snapshot_type: String,
    pub target_snapshot_number: u64,
    pub entry_count: usize,
    /// Why no rollback is available
    pub reason: Option<String>,
}

impl RollbackInfo {
    fn unavailable(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

/// Outcome of a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub snapshot_id: String,
    pub restored: usize,
    pub removed: usize,
    pub source_snapshot_type: String,
    pub source_snapshot_number: u64,
    pub target_snapshot_type: String,
    pub target_snapshot_number: u64,
    pub completed_at: DateTime<Utc>,
}

/// Per-provider snapshot store.
pub struct SnapshotManager {
    /// `<state_dir>/<provider>`
    base_dir: PathBuf,
    provider: ProviderKind,
    /// Maximum number of snapshots kept per profile
    retention: usize,
}

impl SnapshotManager {
    /// Create a manager rooted at `state_dir`.
    ///
    /// # Arguments
    ///
    /// * `state_dir` - Engine state root; the provider segment is appended
    /// * `provider` - Provider whose snapshots this manager owns
    /// * `retention` - Snapshots kept per profile (at least one)
    pub fn new(state_dir: &Path, provider: ProviderKind, retention: usize) -> Self {
        Self {
            base_dir: state_dir.join(provider.state_segment()),
            provider,
            retention: retention.max(1),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// State directory of one profile.
    pub fn profile_dir(&self, profile_id: &str) -> PathBuf {
        self.base_dir.join(safe_id_segment(profile_id))
    }

    pub fn manifest_store(&self, profile_id: &str) -> ManifestStore {
        ManifestStore::new(&self.profile_dir(profile_id))
    }

    fn snapshots_dir(&self, profile_id: &str) -> PathBuf {
        self.profile_dir(profile_id).join(SNAPSHOTS_DIR)
    }

    fn pointer_path(&self, profile_id: &str) -> PathBuf {
        self.profile_dir(profile_id).join(POINTER_FILE)
    }

    /// Back up every distinct path the plan touches.
    ///
    /// Honours pause and cancellation between entries; a cancelled or
    /// failed snapshot leaves no directory behind.
    ///
    /// # Errors
    ///
    /// `Cancelled` when stopped, `PathSafety` for paths outside `root`,
    /// `Io` when a backup copy fails.
    pub async fn create(
        &self,
        profile: &Profile,
        root: &Path,
        plan: &Plan,
        control: Option<&InstallControl>,
    ) -> Result<SnapshotHandle, UpdateError> {
        let profile_id = profile.require_id()?;
        let created_at = Utc::now();
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let snapshot_id = format!("snap-{}-{}", created_at.timestamp_millis(), &tag[..6]);
        let dir = self.snapshots_dir(profile_id).join(&snapshot_id);

        match self
            .write_snapshot(profile, root, plan, control, &snapshot_id, created_at, &dir)
            .await
        {
            Ok(handle) => {
                self.prune(profile_id)?;
                Ok(handle)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_snapshot(
        &self,
        profile: &Profile,
        root: &Path,
        plan: &Plan,
        control: Option<&InstallControl>,
        snapshot_id: &str,
        created_at: DateTime<Utc>,
        dir: &Path,
    ) -> Result<SnapshotHandle, UpdateError> {
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        let previous_manifest = self.manifest_store(&profile.id).load();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for action in &plan.actions {
            if let Some(control) = control {
                control.checkpoint().await?;
            }
            let relative_path = normalize_rel_path(&action.relative_path)?;
            if !seen.insert(relative_path.clone()) {
                continue;
            }
            let live = resolve_within_root(root, &relative_path)?;

            let had_original = fs::metadata(&live).map(|m| m.is_file()).unwrap_or(false);
            let backup_path = if had_original {
                let backup = resolve_within_root(&files_dir, &relative_path)?;
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&live, &backup)?;
                Some(relative_path.clone())
            } else {
                None
            };

            entries.push(SnapshotEntry {
                relative_path,
                kind: action.kind,
                had_original,
                backup_path,
            });
        }

        let meta = SnapshotMeta {
            version: SNAPSHOT_VERSION,
            snapshot_id: snapshot_id.to_string(),
            provider: self.provider,
            profile_id: profile.id.clone(),
            profile_name: profile.name.clone(),
            plan_id: plan.plan_id.clone(),
            created_at,
            root_dir: root.to_path_buf(),
            source_snapshot_type: "current".to_string(),
            source_snapshot_number: profile.package_version,
            target_snapshot_type: plan.summary.snapshot_type.clone(),
            target_snapshot_number: plan.summary.snapshot_number,
            entries,
            previous_manifest,
        };
        write_atomic(&dir.join(META_FILE), &serde_json::to_vec_pretty(&meta)?)?;

        let pointer = SnapshotPointer {
            version: SNAPSHOT_VERSION,
            provider: self.provider,
            profile_id: profile.id.clone(),
            snapshot_id: snapshot_id.to_string(),
            created_at,
        };
        write_atomic(
            &self.pointer_path(&profile.id),
            &serde_json::to_vec_pretty(&pointer)?,
        )?;

        info!(
            snapshot_id,
            profile_id = %profile.id,
            entries = meta.entries.len(),
            had_original = meta.entries.iter().filter(|e| e.had_original).count(),
            "Install snapshot created"
        );

        Ok(SnapshotHandle {
            dir: dir.to_path_buf(),
            meta,
        })
    }

    fn read_meta(&self, dir: &Path) -> Result<SnapshotMeta, UpdateError> {
        let content = fs::read_to_string(dir.join(META_FILE))
            .map_err(|e| UpdateError::SnapshotCorrupted(format!("{}: {}", dir.display(), e)))?;
        let meta: SnapshotMeta = serde_json::from_str(&content)
            .map_err(|e| UpdateError::SnapshotCorrupted(format!("{}: {}", dir.display(), e)))?;
        if meta.provider != self.provider {
            return Err(UpdateError::SnapshotCorrupted(format!(
                "{} belongs to provider {}",
                dir.display(),
                meta.provider
            )));
        }
        Ok(meta)
    }

    /// List valid snapshots for a profile, newest first.
    ///
    /// Directories with missing or invalid metadata are skipped with a warning.
    pub fn list(&self, profile_id: &str) -> Result<Vec<SnapshotHandle>, UpdateError> {
        let dir = self.snapshots_dir(profile_id);
        let mut snapshots = Vec::new();
        let read = match fs::read_dir(&dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };

        for entry in read {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match self.read_meta(&path) {
                Ok(meta) => snapshots.push(SnapshotHandle { dir: path, meta }),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid snapshot"),
            }
        }

        snapshots.sort_by(|a, b| {
            b.meta
                .created_at
                .cmp(&a.meta.created_at)
                .then_with(|| b.meta.snapshot_id.cmp(&a.meta.snapshot_id))
        });
        Ok(snapshots)
    }

    /// Remove snapshots beyond the retention limit, oldest first.
    pub fn prune(&self, profile_id: &str) -> Result<usize, UpdateError> {
        let snapshots = self.list(profile_id)?;
        let mut removed = 0;
        for snapshot in snapshots.iter().skip(self.retention) {
            info!(snapshot_id = %snapshot.meta.snapshot_id, "Removing old snapshot");
            match fs::remove_dir_all(&snapshot.dir) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %snapshot.dir.display(), error = %e, "Failed to remove old snapshot"),
            }
        }
        Ok(removed)
    }

    /// The snapshot a rollback would consume.
    ///
    /// Follows the latest pointer and falls back to the newest valid
    /// snapshot when the pointer is missing or dangling.
    ///
    /// # Errors
    ///
    /// `SnapshotCorrupted` when the pointer names a snapshot whose
    /// directory exists but whose metadata cannot be read.
    pub fn latest(&self, profile_id: &str) -> Result<Option<SnapshotHandle>, UpdateError> {
        let pointer_path = self.pointer_path(profile_id);
        if let Ok(content) = fs::read_to_string(&pointer_path) {
            match serde_json::from_str::<SnapshotPointer>(&content) {
                Ok(pointer) => {
                    let dir = self
                        .snapshots_dir(profile_id)
                        .join(safe_id_segment(&pointer.snapshot_id));
                    if dir.is_dir() {
                        let meta = self.read_meta(&dir)?;
                        return Ok(Some(SnapshotHandle { dir, meta }));
                    }
                    debug!(snapshot_id = %pointer.snapshot_id, "Latest pointer is dangling");
                }
                Err(e) => warn!(error = %e, "Ignoring invalid snapshot pointer"),
            }
        }
        Ok(self.list(profile_id)?.into_iter().next())
    }

    /// Describe the rollback that [`rollback`](Self::rollback) would perform.
    pub fn rollback_info(&self, profile_id: &str) -> RollbackInfo {
        if profile_id.trim().is_empty() {
            return RollbackInfo::unavailable("missing profile id");
        }
        match self.latest(profile_id) {
            Ok(Some(snapshot)) => {
                let meta = snapshot.meta;
                RollbackInfo {
                    available: true,
                    entry_count: meta.entries.len(),
                    snapshot_id: Some(meta.snapshot_id),
                    created_at: Some(meta.created_at),
                    source_snapshot_type: meta.source_snapshot_type,
                    source_snapshot_number: meta.source_snapshot_number,
                    target_snapshot_type: meta.target_snapshot_type,
                    target_snapshot_number: meta.target_snapshot_number,
                    reason: None,
                }
            }
            Ok(None) => RollbackInfo::unavailable("no local rollback snapshot available"),
            Err(e) => RollbackInfo::unavailable(&e.to_string()),
        }
    }

    /// Restore the latest snapshot into the profile's install root.
    ///
    /// Entries are replayed in reverse: backed up files are restored, files
    /// that did not exist before are removed together with any directories
    /// that become empty. The previous manifest is written back (or the
    /// manifest deleted), then the snapshot and pointer are removed.
    ///
    /// # Errors
    ///
    /// `NoSnapshot` when nothing can be rolled back, `SnapshotCorrupted`
    /// for unreadable metadata or a missing backup file.
    pub fn rollback(&self, profile: &Profile) -> Result<RollbackResult, UpdateError> {
        let profile_id = profile.require_id()?;
        let root = profile.require_product_dir()?;
        let snapshot = self.latest(profile_id)?.ok_or(UpdateError::NoSnapshot)?;
        let files_dir = snapshot.files_dir();

        info!(
            profile_id,
            snapshot_id = %snapshot.meta.snapshot_id,
            entries = snapshot.meta.entries.len(),
            "Starting rollback"
        );

        let mut restored = 0;
        let mut removed = 0;
        for entry in snapshot.meta.entries.iter().rev() {
            let relative_path = normalize_rel_path(&entry.relative_path)?;
            let target = resolve_within_root(root, &relative_path)?;

            if entry.had_original {
                let backup_rel = match &entry.backup_path {
                    Some(path) => normalize_rel_path(path)?,
                    None => relative_path.clone(),
                };
                let backup = resolve_within_root(&files_dir, &backup_rel)?;
                if !backup.is_file() {
                    return Err(UpdateError::SnapshotCorrupted(format!(
                        "backup for {} is missing",
                        relative_path
                    )));
                }
                if target.is_dir() {
                    fs::remove_dir_all(&target)?;
                }
                commit_copy(&backup, &target)?;
                restored += 1;
            } else if remove_file_and_empty_parents(root, &target)? {
                removed += 1;
            }
        }

        self.manifest_store(profile_id)
            .restore(snapshot.meta.previous_manifest.as_ref())?;

        if let Err(e) = fs::remove_dir_all(&snapshot.dir) {
            warn!(path = %snapshot.dir.display(), error = %e, "Failed to remove consumed snapshot");
        }
        let _ = fs::remove_file(self.pointer_path(profile_id));

        info!(profile_id, restored, removed, "Rollback completed");

        let meta = snapshot.meta;
        Ok(RollbackResult {
            snapshot_id: meta.snapshot_id,
            restored,
            removed,
            source_snapshot_type: meta.source_snapshot_type,
            source_snapshot_number: meta.source_snapshot_number,
            target_snapshot_type: meta.target_snapshot_type,
            target_snapshot_number: meta.target_snapshot_number,
            completed_at: Utc::now(),
        })
    }
}
