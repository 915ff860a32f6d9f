//! Provider contract and the engine that dispatches to it.
//!
//! Both providers implement [`UpdateProvider`] and share one
//! [`ProviderServices`]: configuration, the HTTP client and the plan cache.
//! Snapshot handling, verification and the install job are composed in
//! from the shared modules rather than re-implemented per provider.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::archive::ArchiveProvider;
use crate::config::EngineConfig;
use crate::error::UpdateError;
use crate::http::HttpClient;
use crate::hypermedia::HypermediaProvider;
use crate::install::{ActionApplier, InstallControl, InstallOrchestrator, InstallResult, ProgressEvent, ProgressSink};
use crate::plan::Plan;
use crate::plan_cache::{CachedPlan, PlanCache};
use crate::profile::{Options, Profile, ProviderKind};
use crate::snapshot::{RollbackInfo, RollbackResult, SnapshotManager};
use crate::verify::ContentVerifier;

/// Contract shared by every update provider.
#[async_trait]
pub trait UpdateProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Compute and cache a plan for `profile`.
    async fn create_plan(&self, profile: &Profile, options: &Options) -> Result<Plan, UpdateError>;

    /// Execute a cached plan. The plan is dropped from the cache on success.
    async fn install(
        &self,
        profile: &Profile,
        plan_id: &str,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        control: &InstallControl,
    ) -> Result<InstallResult, UpdateError>;

    async fn rollback_info(&self, profile_id: &str) -> RollbackInfo;

    async fn rollback(&self, profile: &Profile) -> Result<RollbackResult, UpdateError>;
}

/// Dependencies shared by the providers.
pub struct ProviderServices {
    pub config: EngineConfig,
    pub http: HttpClient,
    pub plans: Arc<PlanCache>,
}

impl ProviderServices {
    pub fn new(config: EngineConfig) -> Result<Self, UpdateError> {
        let http = HttpClient::new(
            &config.network,
            Duration::from_millis(config.install.progress_interval_ms),
        )?;
        let plans = Arc::new(PlanCache::new(
            config.plan_cache.ttl(),
            config.plan_cache.sweep_interval(),
        ));
        Ok(Self { config, http, plans })
    }

    pub fn snapshot_manager(&self, kind: ProviderKind) -> SnapshotManager {
        SnapshotManager::new(&self.config.state_dir(), kind, self.config.snapshots.retention)
    }

    pub fn verifier(&self) -> ContentVerifier {
        ContentVerifier::new(self.config.integrity.gzip_fallback)
    }

    /// Per-provider download directory.
    pub fn temp_dir(&self, kind: ProviderKind) -> PathBuf {
        self.config.temp_dir().join(kind.state_segment())
    }

    /// Run the install job for a checked-out plan and retire the plan on success.
    pub(crate) async fn execute(
        &self,
        profile: &Profile,
        cached: &CachedPlan,
        applier: &mut dyn ActionApplier,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        control: &InstallControl,
    ) -> Result<InstallResult, UpdateError> {
        let snapshots = self.snapshot_manager(cached.plan.provider);
        let orchestrator = InstallOrchestrator {
            profile,
            snapshots: &snapshots,
            control,
            progress: ProgressSink::new(progress),
        };
        let result = orchestrator.run(&cached.plan, applier).await?;
        self.plans.remove(&cached.plan.plan_id).await;
        debug!(plan_id = %cached.plan.plan_id, "Plan retired after install");
        Ok(result)
    }
}

/// Entry point for the shell: one engine, both providers.
pub struct UpdateEngine {
    services: Arc<ProviderServices>,
    hypermedia: HypermediaProvider,
    archive: ArchiveProvider,
}

impl UpdateEngine {
    /// Create an engine from configuration.
    ///
    /// The plan-cache sweeper is not running until [`UpdateEngine::start`].
    pub fn new(config: EngineConfig) -> Result<Self, UpdateError> {
        let services = Arc::new(ProviderServices::new(config)?);
        Ok(Self {
            hypermedia: HypermediaProvider::new(Arc::clone(&services)),
            archive: ArchiveProvider::new(Arc::clone(&services)),
            services,
        })
    }

    pub fn start(&self) {
        self.services.plans.start();
        info!(ttl_secs = self.services.plans.ttl().as_secs(), "Update engine started");
    }

    pub fn stop(&self) {
        self.services.plans.stop();
    }

    pub fn services(&self) -> &Arc<ProviderServices> {
        &self.services
    }

    pub fn provider(&self, kind: ProviderKind) -> &dyn UpdateProvider {
        match kind {
            ProviderKind::Hypermedia => &self.hypermedia,
            ProviderKind::Archive => &self.archive,
        }
    }

    pub async fn create_plan(&self, profile: &Profile, options: &Options) -> Result<Plan, UpdateError> {
        self.provider(profile.provider).create_plan(profile, options).await
    }

    pub async fn install(
        &self,
        profile: &Profile,
        plan_id: &str,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        control: &InstallControl,
    ) -> Result<InstallResult, UpdateError> {
        self.provider(profile.provider)
            .install(profile, plan_id, progress, control)
            .await
    }

    pub async fn rollback_info(&self, profile: &Profile) -> RollbackInfo {
        self.provider(profile.provider).rollback_info(&profile.id).await
    }

    pub async fn rollback(&self, profile: &Profile) -> Result<RollbackResult, UpdateError> {
        self.provider(profile.provider).rollback(profile).await
    }
}
