//! Configuration structures for the update engine.
//!
//! Defines where per-profile state and downloads live, network timeouts,
//! provider endpoints, and the integrity policy applied during installs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root for per-profile manifests and snapshots (empty = default location)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Root for temporary downloads (empty = system temp dir)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Snapshot retention
    #[serde(default)]
    pub snapshots: SnapshotConfig,

    /// Plan cache lifetime
    #[serde(default)]
    pub plan_cache: PlanCacheConfig,

    /// Install loop tuning
    #[serde(default)]
    pub install: InstallConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Hypermedia catalog endpoints
    #[serde(default)]
    pub hypermedia: HypermediaConfig,

    /// ZIP archive provider endpoints
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Integrity policy
    #[serde(default)]
    pub integrity: IntegrityConfig,

    /// Default log filter used by front ends
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            temp_dir: None,
            snapshots: SnapshotConfig::default(),
            plan_cache: PlanCacheConfig::default(),
            install: InstallConfig::default(),
            network: NetworkConfig::default(),
            hypermedia: HypermediaConfig::default(),
            archive: ArchiveConfig::default(),
            integrity: IntegrityConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the state directory, using the platform default if not specified.
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs_default_state_dir(),
        }
    }

    /// Get the temp directory, using the system temp dir if not specified.
    pub fn temp_dir(&self) -> PathBuf {
        match &self.temp_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("addon-updater"),
        }
    }
}

/// Snapshot retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Maximum number of snapshots to retain per profile
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

/// Plan cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCacheConfig {
    /// Time-to-live of a cached plan in seconds
    #[serde(default = "default_plan_ttl")]
    pub ttl_secs: u64,

    /// Interval between expiry sweeps in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_plan_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl PlanCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Install loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Minimum spacing between byte-progress events in milliseconds
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Capacity of the progress channel handed out by front ends
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval(),
            progress_capacity: default_progress_capacity(),
        }
    }
}

/// Network configuration for API calls, range reads and downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Catalog API timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    /// File list timeout in seconds
    #[serde(default = "default_file_list_timeout")]
    pub file_list_timeout_secs: u64,

    /// Auth endpoint timeout in seconds
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Per-file and full-archive download timeout in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Archive provider request timeout in milliseconds (minimum 2000)
    #[serde(default = "default_archive_timeout")]
    pub archive_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            api_timeout_secs: default_api_timeout(),
            file_list_timeout_secs: default_file_list_timeout(),
            auth_timeout_secs: default_auth_timeout(),
            download_timeout_secs: default_download_timeout(),
            archive_timeout_ms: default_archive_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn file_list_timeout(&self) -> Duration {
        Duration::from_secs(self.file_list_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_millis(self.archive_timeout_ms.max(2000))
    }

    /// Timeout for the `bytes=0-0` download probe, clamped to 2-8 seconds.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.archive_timeout_ms.clamp(2000, 8000))
    }
}

/// Hypermedia catalog endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypermediaConfig {
    #[serde(default = "default_hypermedia_auth_path")]
    pub auth_path: String,

    #[serde(default = "default_hypermedia_updates_path")]
    pub updates_path: String,

    /// Maximum auth attempts when the server answers 202/429
    #[serde(default = "default_auth_attempts")]
    pub max_auth_attempts: u32,
}

impl Default for HypermediaConfig {
    fn default() -> Self {
        Self {
            auth_path: default_hypermedia_auth_path(),
            updates_path: default_hypermedia_updates_path(),
            max_auth_attempts: default_auth_attempts(),
        }
    }
}

/// ZIP archive provider endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_auth_path")]
    pub auth_path: String,

    #[serde(default = "default_archive_products_path")]
    pub products_path: String,

    #[serde(default = "default_archive_files_url_path")]
    pub files_url_path: String,

    /// Storefront GraphQL endpoint used for the first auth stage
    #[serde(default)]
    pub storefront_url: Option<String>,

    /// Public storefront access token sent with the GraphQL call
    #[serde(default)]
    pub storefront_token: Option<String>,

    /// Simulator names tried after the profile hint
    #[serde(default = "default_simulators")]
    pub simulator_candidates: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            auth_path: default_archive_auth_path(),
            products_path: default_archive_products_path(),
            files_url_path: default_archive_files_url_path(),
            storefront_url: None,
            storefront_token: None,
            simulator_candidates: default_simulators(),
        }
    }
}

/// Integrity policy.
///
/// Both relaxations default to enabled. Each time one is used the engine
/// emits a `warn!` record with the digests involved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Re-hash a gunzipped copy when the raw MD5 mismatches
    #[serde(default = "default_true")]
    pub gzip_fallback: bool,

    /// Accept a ZIP package with a mismatched MD5 when its central
    /// directory matches every planned entry (offset, method, CRC32)
    #[serde(default = "default_true")]
    pub accept_crc_validated_package: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            gzip_fallback: true,
            accept_crc_validated_package: true,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_retention() -> usize {
    5
}

fn default_plan_ttl() -> u64 {
    30 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

fn default_progress_interval() -> u64 {
    250
}

fn default_progress_capacity() -> usize {
    64
}

fn default_user_agent() -> String {
    format!("addon-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_api_timeout() -> u64 {
    45
}

fn default_file_list_timeout() -> u64 {
    60
}

fn default_auth_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    180
}

fn default_archive_timeout() -> u64 {
    15_000
}

fn default_hypermedia_auth_path() -> String {
    "/api/v2/service/auth/consumers".to_string()
}

fn default_hypermedia_updates_path() -> String {
    "/api/v2/experimental/updates".to_string()
}

fn default_auth_attempts() -> u32 {
    4
}

fn default_archive_auth_path() -> String {
    "/api/v4/login".to_string()
}

fn default_archive_products_path() -> String {
    "/api/v4/companies".to_string()
}

fn default_archive_files_url_path() -> String {
    "/api/v4/filesUrl".to_string()
}

fn default_simulators() -> Vec<String> {
    vec!["XPlane12".to_string(), "XPlane11".to_string()]
}

/// Get the default state directory.
fn dirs_default_state_dir() -> PathBuf {
    // Use platform-appropriate data directory
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("AddonUpdater").join("state");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("AddonUpdater")
                .join("state");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(data_home).join("addon-updater").join("state");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("addon-updater")
                .join("state");
        }
    }

    // Fallback
    PathBuf::from(".").join("state")
}
