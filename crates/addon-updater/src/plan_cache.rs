//! In-process plan cache with TTL expiry.
//!
//! The cache owns its sweeper task (`start`/`stop`). The sweep itself takes
//! the current instant as an argument so expiry can be driven by tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::HeaderPairs;
use crate::error::UpdateError;
use crate::plan::{ListingMode, Plan};

/// Provider state needed to execute a plan.
#[derive(Debug, Clone)]
pub enum PlanContext {
    Hypermedia {
        host: String,
        auth_headers: HeaderPairs,
        /// Paths the next install manifest should contain
        manifest_files: Vec<String>,
    },
    Archive {
        base_url: String,
        download_url: String,
        filename: String,
        /// Normalized package MD5, when the server declared one
        package_md5: Option<String>,
        product_id: u64,
        package_size: Option<u64>,
        /// Archive downloaded during planning, reusable if it re-verifies
        temp_zip: Option<PathBuf>,
        listing_mode: ListingMode,
        /// Sorted unique file paths of the package
        manifest_files: Vec<String>,
    },
}

/// Cached plan plus its execution context.
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub plan: Plan,
    pub context: PlanContext,
    pub inserted_at: Instant,
}

impl CachedPlan {
    /// Delete scratch files the plan owns. Called when the plan leaves the cache.
    fn discard_scratch(&self) {
        if let PlanContext::Archive {
            temp_zip: Some(path),
            ..
        } = &self.context
        {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(plan_id = %self.plan.plan_id, path = %path.display(), "Planning archive removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Could not remove planning archive"),
            }
        }
    }
}

/// TTL-bounded plan store shared by all providers.
pub struct PlanCache {
    entries: Mutex<HashMap<String, CachedPlan>>,
    ttl: Duration,
    sweep_interval: Duration,
    sweeper: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PlanCache {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            sweep_interval,
            sweeper: StdMutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn insert(&self, plan: Plan, context: PlanContext) {
        let plan_id = plan.plan_id.clone();
        let mut entries = self.entries.lock().await;
        let replaced = entries.insert(
            plan_id.clone(),
            CachedPlan {
                plan,
                context,
                inserted_at: Instant::now(),
            },
        );
        debug!(plan_id = %plan_id, cached = entries.len(), "Plan cached");
        drop(entries);
        if let Some(old) = replaced {
            old.discard_scratch();
        }
    }

    /// Fetch a plan for execution by `profile_id`.
    ///
    /// # Errors
    ///
    /// `PlanNotFound` for unknown or expired ids, `PlanProfileMismatch`
    /// when the plan was built for another profile.
    pub async fn checkout(&self, plan_id: &str, profile_id: &str) -> Result<CachedPlan, UpdateError> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(plan_id) {
            None => return Err(UpdateError::PlanNotFound),
            Some(cached) => cached.inserted_at.elapsed() > self.ttl,
        };
        if expired {
            if let Some(stale) = entries.remove(plan_id) {
                stale.discard_scratch();
            }
            return Err(UpdateError::PlanNotFound);
        }
        let cached = entries.get(plan_id).ok_or(UpdateError::PlanNotFound)?;
        if cached.plan.profile_id != profile_id {
            return Err(UpdateError::PlanProfileMismatch);
        }
        Ok(cached.clone())
    }

    pub async fn remove(&self, plan_id: &str) -> bool {
        let removed = self.entries.lock().await.remove(plan_id);
        match removed {
            Some(cached) => {
                cached.discard_scratch();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every plan older than the TTL at `now`; returns the count.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, cached)| now.saturating_duration_since(cached.inserted_at) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        let evicted: Vec<CachedPlan> = expired.iter().filter_map(|id| entries.remove(id)).collect();
        let remaining = entries.len();
        drop(entries);

        for cached in &evicted {
            cached.discard_scratch();
        }
        if !evicted.is_empty() {
            info!(removed = evicted.len(), remaining, "Plan cache sweep completed");
        }
        evicted.len()
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    /// Spawn the periodic sweeper. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut guard) = self.sweeper.lock() else {
            return;
        };
        if guard.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let stop = token.clone();
        let cache = Arc::downgrade(self);
        let period = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.sweep().await;
                    }
                }
            }
        });
        *guard = Some((token, handle));
    }

    /// Stop the sweeper task if it is running.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some((token, handle)) = guard.take() {
                token.cancel();
                handle.abort();
            }
        }
    }
}

impl Drop for PlanCache {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanSummary;
    use crate::profile::ProviderKind;

    fn plan(id: &str, profile: &str) -> Plan {
        Plan {
            plan_id: id.to_string(),
            provider: ProviderKind::Hypermedia,
            profile_id: profile.to_string(),
            created_at: chrono::Utc::now(),
            summary: PlanSummary::default(),
            actions: Vec::new(),
            warnings: Vec::new(),
            optional_packages: Vec::new(),
            diagnostics: None,
        }
    }

    fn context() -> PlanContext {
        PlanContext::Hypermedia {
            host: "https://api.example".to_string(),
            auth_headers: Vec::new(),
            manifest_files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_checkout_validates_profile() {
        let cache = PlanCache::new(Duration::from_secs(60), Duration::from_secs(10));
        cache.insert(plan("p1", "alice"), context()).await;

        assert!(cache.checkout("p1", "alice").await.is_ok());
        assert!(matches!(
            cache.checkout("p1", "bob").await,
            Err(UpdateError::PlanProfileMismatch)
        ));
        assert!(matches!(
            cache.checkout("nope", "alice").await,
            Err(UpdateError::PlanNotFound)
        ));
        assert!(cache.remove("p1").await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_at_removes_expired() {
        let cache = PlanCache::new(Duration::from_secs(1800), Duration::from_secs(300));
        cache.insert(plan("old", "a"), context()).await;
        tokio::time::advance(Duration::from_secs(1000)).await;
        cache.insert(plan("new", "a"), context()).await;

        let later = Instant::now() + Duration::from_secs(900);
        assert_eq!(cache.sweep_at(later).await, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.checkout("new", "a").await.is_ok());
    }

    fn archive_context(temp_zip: PathBuf) -> PlanContext {
        PlanContext::Archive {
            base_url: "https://store.example".to_string(),
            download_url: "https://cdn.example/jet.zip".to_string(),
            filename: "jet.zip".to_string(),
            package_md5: None,
            product_id: 42,
            package_size: Some(3),
            temp_zip: Some(temp_zip),
            listing_mode: ListingMode::Download,
            manifest_files: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_plans_delete_planning_archive() {
        let temp = tempfile::TempDir::new().unwrap();
        let swept = temp.path().join("plan-swept.zip");
        let removed = temp.path().join("plan-removed.zip");
        std::fs::write(&swept, b"PK\x03").unwrap();
        std::fs::write(&removed, b"PK\x03").unwrap();

        let cache = PlanCache::new(Duration::from_secs(60), Duration::from_secs(10));
        cache.insert(plan("swept", "a"), archive_context(swept.clone())).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert(plan("removed", "a"), archive_context(removed.clone())).await;

        assert_eq!(cache.sweep_at(Instant::now() + Duration::from_secs(40)).await, 1);
        assert!(!swept.exists());
        assert!(removed.exists());

        assert!(cache.remove("removed").await);
        assert!(!removed.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_plan_is_not_found() {
        let cache = PlanCache::new(Duration::from_secs(60), Duration::from_secs(10));
        cache.insert(plan("p", "a"), context()).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            cache.checkout("p", "a").await,
            Err(UpdateError::PlanNotFound)
        ));
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts_on_interval() {
        let cache = Arc::new(PlanCache::new(Duration::from_secs(30), Duration::from_secs(10)));
        cache.start();
        cache.insert(plan("p", "a"), context()).await;

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(cache.is_empty().await);
        cache.stop();
    }
}
