//! Install manifest persistence.
//!
//! The manifest records which relative paths make up the current install
//! of a profile. It is written only after an install fully succeeds and is
//! read back on the next check to derive delete actions.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::UpdateError;
use crate::paths::{normalize_rel_path, write_atomic};
use crate::profile::ProviderKind;

/// Manifest file name within a profile state directory.
pub const MANIFEST_FILE: &str = "manifest.json";

const MANIFEST_VERSION: u32 = 1;

/// Persisted record of the installed file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallManifest {
    #[serde(default = "default_version")]
    pub version: u32,
    pub provider: ProviderKind,
    #[serde(default)]
    pub product_id: Option<u64>,
    /// Lowercase content hash of the source package (empty when unknown)
    #[serde(default)]
    pub package_hash: String,
    pub installed_at: DateTime<Utc>,
    /// Sorted, normalized relative paths
    #[serde(default)]
    pub files: Vec<String>,
}

fn default_version() -> u32 {
    MANIFEST_VERSION
}

impl InstallManifest {
    pub fn new(
        provider: ProviderKind,
        product_id: Option<u64>,
        package_hash: &str,
        files: Vec<String>,
    ) -> Self {
        let mut manifest = Self {
            version: MANIFEST_VERSION,
            provider,
            product_id,
            package_hash: package_hash.trim().to_ascii_lowercase(),
            installed_at: Utc::now(),
            files,
        };
        manifest.normalize();
        manifest
    }

    /// Normalize paths, dropping unsafe ones, then sort and dedupe.
    fn normalize(&mut self) {
        let mut files: Vec<String> = self
            .files
            .iter()
            .filter_map(|raw| normalize_rel_path(raw).ok())
            .collect();
        files.sort();
        files.dedup();
        self.files = files;
        self.package_hash = self.package_hash.trim().to_ascii_lowercase();
    }

    pub fn contains(&self, rel_path: &str) -> bool {
        self.files.binary_search_by(|f| f.as_str().cmp(rel_path)).is_ok()
    }
}

/// Reads and writes one profile's manifest file.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    /// Store for the manifest inside `profile_state_dir`.
    pub fn new(profile_state_dir: &Path) -> Self {
        Self {
            path: profile_state_dir.join(MANIFEST_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest.
    ///
    /// A missing file yields `None`. An unreadable or malformed file is
    /// logged and also treated as absent, so a damaged manifest degrades
    /// to "no previous install" instead of blocking every check.
    pub fn load(&self) -> Option<InstallManifest> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read install manifest");
                return None;
            }
        };
        match serde_json::from_str::<InstallManifest>(&content) {
            Ok(mut manifest) => {
                manifest.normalize();
                debug!(files = manifest.files.len(), "Loaded install manifest");
                Some(manifest)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring invalid install manifest");
                None
            }
        }
    }

    pub fn save(&self, manifest: &InstallManifest) -> Result<(), UpdateError> {
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.path, &json)?;
        debug!(path = %self.path.display(), files = manifest.files.len(), "Saved install manifest");
        Ok(())
    }

    /// Delete the manifest; a missing file is not an error.
    pub fn remove(&self) -> Result<(), UpdateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `previous` back, or delete the manifest when there was none.
    pub fn restore(&self, previous: Option<&InstallManifest>) -> Result<(), UpdateError> {
        match previous {
            Some(manifest) => self.save(manifest),
            None => self.remove(),
        }
    }
}
