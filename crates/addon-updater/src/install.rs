//! Install orchestration.
//!
//! Executes a cached plan as a single job:
//! - Optional provider preparation (e.g. fetching and verifying a package)
//! - Pre-install snapshot of every touched path
//! - Deletes, then updates, in plan order
//! - Manifest persistence on success
//!
//! Pause and cancel are cooperative. They are observed before each action,
//! while the snapshot is being taken and around every network read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::UpdateError;
use crate::http::ByteProgress;
use crate::manifest::InstallManifest;
use crate::paths::{remove_file_and_empty_parents, resolve_within_root};
use crate::plan::{Action, ActionKind, Plan};
use crate::profile::Profile;
use crate::snapshot::SnapshotManager;

/// Lifecycle of an install job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl InstallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallState::Completed | InstallState::Cancelled | InstallState::Failed
        )
    }
}

/// Pause/cancel handle shared between the shell and a running install.
///
/// Cloning yields another handle to the same job.
#[derive(Clone)]
pub struct InstallControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<InstallState>>,
}

impl Default for InstallControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InstallControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallControl")
            .field("cancelled", &self.is_cancelled())
            .field("paused", &self.is_paused())
            .field("state", &self.state())
            .finish()
    }
}

impl InstallControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        let (state, _) = watch::channel(InstallState::Idle);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
            state: Arc::new(state),
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Request a stop. Also observed while paused.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that aborts in-flight requests when the job is cancelled.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> InstallState {
        *self.state.borrow()
    }

    /// Receiver that observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<InstallState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: InstallState) {
        self.state.send_if_modified(|current| {
            if *current == next || current.is_terminal() && next != InstallState::Running {
                return false;
            }
            debug!(from = ?*current, to = ?next, "Install state");
            *current = next;
            true
        });
    }

    /// Suspension point: fail if cancelled, park while paused.
    ///
    /// # Errors
    ///
    /// `UpdateError::Cancelled` when the job was cancelled before or
    /// during the wait.
    pub async fn checkpoint(&self) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let mut paused = self.paused.subscribe();
        if !*paused.borrow_and_update() {
            return Ok(());
        }

        let previous = self.state();
        self.set_state(InstallState::Paused);
        info!("Install paused");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(UpdateError::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() || !*paused.borrow_and_update() {
                        break;
                    }
                }
            }
        }
        if previous == InstallState::Running {
            self.set_state(InstallState::Running);
        }
        info!("Install resumed");

        if self.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }
}

/// Progress event emitted during an install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// 1-based action index; 0 for package-level phases
    pub index: usize,
    pub total: usize,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub package_name: String,
    pub path: String,
    pub message: String,
    #[serde(default)]
    pub bytes_downloaded: Option<u64>,
    #[serde(default)]
    pub bytes_total: Option<u64>,
}

/// Ordered, bounded progress channel.
///
/// A closed receiver is not an error; the install keeps going.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    sender: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(sender: Option<mpsc::Sender<ProgressEvent>>) -> Self {
        Self { sender }
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).await.is_err() {
                debug!("Progress receiver dropped");
            }
        }
    }
}

/// Byte-level progress for one phase, forwarded as `ProgressEvent`s.
pub struct PhaseProgress<'a> {
    pub sink: &'a ProgressSink,
    pub template: ProgressEvent,
}

#[async_trait]
impl<'a> ByteProgress for PhaseProgress<'a> {
    async fn on_bytes(&self, downloaded: u64, total: Option<u64>) {
        let mut event = self.template.clone();
        event.bytes_downloaded = Some(downloaded);
        event.bytes_total = total;
        self.sink.emit(event).await;
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub updated: usize,
    pub deleted: usize,
    pub total: usize,
    pub snapshot_id: String,
    pub snapshot_type: String,
    pub snapshot_number: u64,
    pub completed_at: DateTime<Utc>,
}

/// Everything an applier may need while the job runs.
pub struct InstallContext<'a> {
    pub plan: &'a Plan,
    pub root: &'a Path,
    pub control: &'a InstallControl,
    pub progress: &'a ProgressSink,
}

/// Provider-specific half of an install.
#[async_trait]
pub trait ActionApplier: Send {
    /// Runs once before the snapshot; nothing on disk may change here.
    async fn prepare(&mut self, _ctx: &InstallContext<'_>) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Materialize one update action at `dest` (already root-confined).
    async fn apply_update(
        &mut self,
        ctx: &InstallContext<'_>,
        action: &Action,
        dest: &Path,
    ) -> Result<(), UpdateError>;

    /// Verb used in progress messages for update actions.
    fn update_label(&self) -> &'static str {
        ActionKind::Update.label()
    }

    /// Manifest to persist once every action succeeded.
    fn manifest(&self, plan: &Plan) -> Option<InstallManifest>;

    /// Release temp files; called on success and failure alike.
    fn cleanup(&mut self) {}
}

/// Runs one plan against one install root.
pub struct InstallOrchestrator<'a> {
    pub profile: &'a Profile,
    pub snapshots: &'a SnapshotManager,
    pub control: &'a InstallControl,
    pub progress: ProgressSink,
}

impl<'a> InstallOrchestrator<'a> {
    /// Execute `plan`.
    ///
    /// A failure after the snapshot leaves it in place for rollback. The
    /// control's state ends as `Completed`, `Cancelled` or `Failed`.
    ///
    /// # Errors
    ///
    /// `EmptyPlan` for a plan without actions, `Cancelled` on user stop,
    /// otherwise the first download, verification or filesystem error.
    pub async fn run(
        &self,
        plan: &Plan,
        applier: &mut dyn ActionApplier,
    ) -> Result<InstallResult, UpdateError> {
        if plan.actions.is_empty() {
            return Err(UpdateError::EmptyPlan);
        }

        self.control.set_state(InstallState::Running);
        let started = std::time::Instant::now();
        info!(
            plan_id = %plan.plan_id,
            profile_id = %self.profile.id,
            actions = plan.actions.len(),
            "Starting installation"
        );

        let outcome = self.execute(plan, applier).await;
        applier.cleanup();

        match &outcome {
            Ok(result) => {
                self.control.set_state(InstallState::Completed);
                info!(
                    plan_id = %plan.plan_id,
                    updated = result.updated,
                    deleted = result.deleted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Installation completed"
                );
            }
            Err(e) if e.is_cancelled() => {
                self.control.set_state(InstallState::Cancelled);
                warn!(plan_id = %plan.plan_id, "Installation cancelled by user");
            }
            Err(e) => {
                self.control.set_state(InstallState::Failed);
                error!(plan_id = %plan.plan_id, error = %e, "Installation failed");
            }
        }
        outcome
    }

    async fn execute(
        &self,
        plan: &Plan,
        applier: &mut dyn ActionApplier,
    ) -> Result<InstallResult, UpdateError> {
        let root = self.profile.require_product_dir()?;
        let ctx = InstallContext {
            plan,
            root,
            control: self.control,
            progress: &self.progress,
        };

        self.control.checkpoint().await?;
        applier.prepare(&ctx).await?;

        let snapshot = self
            .snapshots
            .create(self.profile, root, plan, Some(self.control))
            .await?;
        debug!(snapshot_id = %snapshot.snapshot_id(), "Snapshot ready for installation");

        let total = plan.actions.len();
        let mut updated = 0;
        let mut deleted = 0;

        for (i, action) in plan.actions.iter().enumerate() {
            self.control.checkpoint().await?;
            let dest = resolve_within_root(root, &action.relative_path)?;
            let label = match action.kind {
                ActionKind::Delete => action.kind.label(),
                ActionKind::Update => applier.update_label(),
            };

            self.progress
                .emit(ProgressEvent {
                    index: i + 1,
                    total,
                    kind: action.kind,
                    package_name: action.package_name.clone(),
                    path: action.relative_path.clone(),
                    message: format!("{} {}", label, action.relative_path),
                    bytes_downloaded: None,
                    bytes_total: None,
                })
                .await;

            match action.kind {
                ActionKind::Delete => {
                    let prune_root = package_root(root, &action.package_dir)?;
                    remove_file_and_empty_parents(&prune_root, &dest)?;
                    deleted += 1;
                }
                ActionKind::Update => {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    applier.apply_update(&ctx, action, &dest).await?;
                    updated += 1;
                }
            }
        }

        if let Some(manifest) = applier.manifest(plan) {
            self.snapshots.manifest_store(&self.profile.id).save(&manifest)?;
        }

        Ok(InstallResult {
            updated,
            deleted,
            total,
            snapshot_id: snapshot.meta.snapshot_id,
            snapshot_type: plan.summary.snapshot_type.clone(),
            snapshot_number: plan.summary.snapshot_number,
            completed_at: Utc::now(),
        })
    }
}

/// Directory empty-parent pruning stops at for a package.
fn package_root(root: &Path, package_dir: &str) -> Result<PathBuf, UpdateError> {
    if package_dir.is_empty() {
        Ok(root.to_path_buf())
    } else {
        resolve_within_root(root, package_dir)
    }
}
