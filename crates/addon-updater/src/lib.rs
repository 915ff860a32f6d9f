//! # addon-updater
//!
//! Update engine for addon installations.
//!
//! This crate handles:
//! - Plan building against a hypermedia product catalog or a signed ZIP package
//! - Central-directory indexing of remote ZIPs over HTTP range requests
//! - MD5 and CRC32 verification, with a gzip fallback for transfer-encoded payloads
//! - Pausable, cancellable installs with atomic file replacement
//! - Pre-install snapshots and manifest-aware rollback
//!
//! ## Safety
//!
//! Every relative path that reaches the filesystem passes through
//! [`paths::resolve_within_root`]. Nothing is written outside the profile's
//! install root, and nothing is written before a snapshot exists.

pub mod archive;
pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod hypermedia;
pub mod install;
pub mod manifest;
pub mod paths;
pub mod plan;
pub mod plan_cache;
pub mod profile;
#[cfg(test)]
mod proptests;
pub mod provider;
pub mod snapshot;
pub mod verify;
pub mod zip_index;

// Re-export main types for convenience
pub use archive::ArchiveProvider;
pub use config::{EngineConfig, IntegrityConfig, NetworkConfig};
pub use error::UpdateError;
pub use hypermedia::HypermediaProvider;
pub use install::{InstallControl, InstallResult, InstallState, ProgressEvent};
pub use manifest::{InstallManifest, ManifestStore};
pub use plan::{Action, ActionKind, Plan, PlanDiagnostics, PlanSummary};
pub use profile::{Channel, OptionalPackageAction, Options, Profile, ProviderKind};
pub use provider::{UpdateEngine, UpdateProvider};
pub use snapshot::{RollbackInfo, RollbackResult, SnapshotManager};
