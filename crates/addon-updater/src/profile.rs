//! Profile and per-check options supplied by the shell.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Release channel preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Release,
    Beta,
    Alpha,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Release => write!(f, "release"),
            Channel::Beta => write!(f, "beta"),
            Channel::Alpha => write!(f, "alpha"),
        }
    }
}

/// Which update provider serves a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Product/snapshot/file tree with per-file hashes
    #[default]
    Hypermedia,
    /// Single ZIP package diffed through its central directory
    Archive,
}

impl ProviderKind {
    /// Directory segment used for this provider's persisted state.
    pub fn state_segment(&self) -> &'static str {
        match self {
            ProviderKind::Hypermedia => "hypermedia",
            ProviderKind::Archive => "archive",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.state_segment())
    }
}

/// User-level update profile.
///
/// Owned by the shell; the engine only ever reads a snapshot of it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    /// Installation root
    pub product_dir: PathBuf,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub license_key: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub channel: Channel,
    /// Glob-like path rules excluded from every plan
    #[serde(default)]
    pub ignore_list: Vec<String>,
    /// Last installed catalog revision
    #[serde(default)]
    pub package_version: u64,
    #[serde(default)]
    pub provider: ProviderKind,
    /// Archive provider: product to diff against
    #[serde(default)]
    pub product_id: Option<u64>,
    /// Archive provider: display label for the chosen product
    #[serde(default)]
    pub product_name: Option<String>,
    /// Archive provider: simulator hint for the files-URL request
    #[serde(default)]
    pub simulator: Option<String>,
    /// Archive provider: platform override for the files-URL request
    #[serde(default)]
    pub platform: Option<String>,
}

impl Profile {
    /// Apply one-shot credential overrides, returning a new profile.
    pub fn with_overrides(&self, overrides: &CredentialOverrides) -> Profile {
        let mut profile = self.clone();
        if let Some(login) = &overrides.login {
            profile.login = login.clone();
        }
        if let Some(key) = &overrides.license_key {
            profile.license_key = key.clone();
        }
        if let Some(password) = &overrides.password {
            profile.password = password.clone();
        }
        profile
    }

    /// Host without surrounding whitespace or a trailing slash.
    pub fn normalized_host(&self) -> Result<String, UpdateError> {
        let raw = self.host.trim();
        if raw.is_empty() {
            return Err(UpdateError::Config("missing update host".to_string()));
        }
        Ok(raw.trim_end_matches('/').to_string())
    }

    /// Secret used for login flows that accept either a password or a key.
    pub fn secret(&self) -> &str {
        let password = self.password.trim();
        if password.is_empty() {
            self.license_key.trim()
        } else {
            password
        }
    }

    pub fn require_id(&self) -> Result<&str, UpdateError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(UpdateError::Config("missing profile id".to_string()));
        }
        Ok(id)
    }

    pub fn require_product_dir(&self) -> Result<&std::path::Path, UpdateError> {
        if self.product_dir.as_os_str().is_empty() {
            return Err(UpdateError::Config("profile productDir is missing".to_string()));
        }
        Ok(&self.product_dir)
    }
}

/// Credentials supplied for a single call without touching the stored profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialOverrides {
    pub login: Option<String>,
    pub license_key: Option<String>,
    pub password: Option<String>,
}

/// Selection for a product that carries detection markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionalPackageAction {
    Install,
    Ignore,
}

/// Per-check options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    #[serde(default)]
    pub alpha: bool,
    #[serde(default)]
    pub beta: bool,
    /// Reinstall everything and delete local files the remote set does not claim
    #[serde(default)]
    pub fresh: bool,
    /// Re-hash every known file and re-download mismatches
    #[serde(default)]
    pub repair: bool,
    #[serde(default)]
    pub optional_packages: HashMap<String, OptionalPackageAction>,
}

impl Options {
    /// Options preselected from a channel.
    pub fn for_channel(channel: Channel) -> Self {
        Self {
            alpha: channel == Channel::Alpha,
            beta: channel == Channel::Beta,
            ..Self::default()
        }
    }

    /// Merge the profile channel in and apply the repair-disables-fresh rule.
    pub fn effective(&self, channel: Channel) -> Options {
        let mut picked = self.clone();
        picked.alpha |= channel == Channel::Alpha;
        picked.beta |= channel == Channel::Beta;
        if picked.repair {
            picked.fresh = false;
        }
        picked
    }
}
