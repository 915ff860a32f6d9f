//! Plan data model.
//!
//! A plan is the immutable outcome of one update check: ordered actions,
//! a summary, warnings and provider diagnostics.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::{OptionalPackageAction, ProviderKind};
use crate::zip_index::ZipEntry;

/// Kind of file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Update,
    Delete,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Update => "UPDATE",
            ActionKind::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Update => write!(f, "update"),
            ActionKind::Delete => write!(f, "delete"),
        }
    }
}

/// Server-reported state of a catalog file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileState {
    None,
    Add,
    Update,
    Delete,
}

/// Where the bytes for an update come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum ActionLocator {
    /// Per-file download link
    #[serde(rename_all = "camelCase")]
    Download { href: String },
    /// Entry inside the package archive
    #[serde(rename_all = "camelCase")]
    ZipEntry {
        entry_name: String,
        method: u16,
        local_header_offset: u64,
    },
}

/// One file operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// Path relative to the installation root, `/`-separated
    pub relative_path: String,
    pub package_name: String,
    /// Package directory relative to the installation root (empty for the root)
    #[serde(default)]
    pub package_dir: String,
    #[serde(default)]
    pub state: Option<FileState>,
    #[serde(default)]
    pub compressed_size: u64,
    #[serde(default)]
    pub real_size: u64,
    /// MD5 hex or `crc32:xxxxxxxx`
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub locator: Option<ActionLocator>,
    #[serde(default)]
    pub fresh_deletion: bool,
    #[serde(default)]
    pub repair_update: bool,
}

impl Action {
    pub fn delete(relative_path: String, package_name: &str, package_dir: &str) -> Self {
        Self {
            kind: ActionKind::Delete,
            relative_path,
            package_name: package_name.to_string(),
            package_dir: package_dir.to_string(),
            state: Some(FileState::Delete),
            compressed_size: 0,
            real_size: 0,
            hash: None,
            locator: None,
            fresh_deletion: false,
            repair_update: false,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ActionKind::Delete
    }

    pub fn is_update(&self) -> bool {
        self.kind == ActionKind::Update
    }
}

/// Optional package decision recorded in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionalPackage {
    pub id: String,
    pub name: String,
    pub detected: bool,
    pub default_action: OptionalPackageAction,
    pub selected_action: OptionalPackageAction,
}

/// Plan summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub product_name: String,
    pub distributor: String,
    pub snapshot_type: String,
    pub snapshot_number: u64,
    pub package_count: usize,
    pub optional_package_count: usize,
    pub optional_ignored_count: usize,
    pub optional_forced_install_count: usize,
    pub file_count: usize,
    pub delete_count: usize,
    pub ignored_count: usize,
    pub warning_count: usize,
    pub repair_mode: bool,
    pub download_size: u64,
    pub download_size_known: u64,
    pub download_size_estimated_max: u64,
    pub download_size_unknown_count: usize,
    pub disk_size: u64,
}

/// How the archive listing was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingMode {
    Range,
    Download,
}

/// Owned product reported when none was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductChoice {
    pub id: String,
    pub name: String,
}

/// Provider-specific plan diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum PlanDiagnostics {
    #[serde(rename_all = "camelCase")]
    Hypermedia {
        strategy: String,
        since: u64,
        listed_file_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    Archive {
        product_id: Option<u64>,
        listing_mode: Option<ListingMode>,
        listing_error: Option<String>,
        entry_count: usize,
        compared_file_count: usize,
        package_size: Option<u64>,
        owned_products: Vec<ProductChoice>,
    },
}

/// One update decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub plan_id: String,
    pub provider: ProviderKind,
    pub profile_id: String,
    pub created_at: DateTime<Utc>,
    pub summary: PlanSummary,
    pub actions: Vec<Action>,
    pub warnings: Vec<String>,
    #[serde(default)]
    pub optional_packages: Vec<OptionalPackage>,
    #[serde(default)]
    pub diagnostics: Option<PlanDiagnostics>,
}

impl Plan {
    pub fn update_count(&self) -> usize {
        self.actions.iter().filter(|a| a.is_update()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Stable reorder: every delete before every update.
pub fn order_actions(actions: Vec<Action>) -> Vec<Action> {
    let (deletes, updates): (Vec<Action>, Vec<Action>) =
        actions.into_iter().partition(Action::is_delete);
    deletes.into_iter().chain(updates).collect()
}

/// Drop repeated warnings, keeping first occurrences in order.
pub fn dedupe_warnings(warnings: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    warnings
        .into_iter()
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Fill the action-derived summary fields.
///
/// Download size sums compressed sizes where known and falls back to the
/// real size; disk size sums real sizes of updates.
pub fn summarize(summary: &mut PlanSummary, actions: &[Action], warnings: &[String]) {
    let updates: Vec<&Action> = actions.iter().filter(|a| a.is_update()).collect();
    summary.file_count = actions.len();
    summary.delete_count = actions.len() - updates.len();
    summary.warning_count = warnings.len();
    summary.download_size_known = updates
        .iter()
        .map(|a| a.compressed_size)
        .filter(|size| *size > 0)
        .sum();
    summary.download_size_estimated_max = updates
        .iter()
        .map(|a| {
            if a.compressed_size > 0 {
                a.compressed_size
            } else {
                a.real_size
            }
        })
        .sum();
    summary.download_size = summary.download_size_estimated_max;
    summary.download_size_unknown_count = updates.iter().filter(|a| a.compressed_size == 0).count();
    summary.disk_size = updates.iter().map(|a| a.real_size).sum();
}

/// Update action for an archive entry.
pub fn zip_update_action(relative_path: String, entry: &ZipEntry, package_name: &str, hash: String) -> Action {
    Action {
        kind: ActionKind::Update,
        relative_path,
        package_name: package_name.to_string(),
        package_dir: String::new(),
        state: None,
        compressed_size: entry.compressed_size,
        real_size: entry.uncompressed_size,
        hash: Some(hash),
        locator: Some(ActionLocator::ZipEntry {
            entry_name: entry.file_name.clone(),
            method: entry.method,
            local_header_offset: entry.local_header_offset,
        }),
        fresh_deletion: false,
        repair_update: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(path: &str, compressed: u64, real: u64) -> Action {
        Action {
            kind: ActionKind::Update,
            relative_path: path.to_string(),
            package_name: "pkg".to_string(),
            package_dir: String::new(),
            state: Some(FileState::Add),
            compressed_size: compressed,
            real_size: real,
            hash: None,
            locator: None,
            fresh_deletion: false,
            repair_update: false,
        }
    }

    #[test]
    fn test_order_actions_is_stable() {
        let ordered = order_actions(vec![
            update("a", 0, 0),
            Action::delete("x".to_string(), "pkg", ""),
            update("b", 0, 0),
            Action::delete("y".to_string(), "pkg", ""),
        ]);
        let paths: Vec<&str> = ordered.iter().map(|a| a.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["x", "y", "a", "b"]);
    }

    #[test]
    fn test_summarize_sizes() {
        let actions = vec![
            Action::delete("gone".to_string(), "pkg", ""),
            update("a", 10, 100),
            update("b", 0, 50),
        ];
        let mut summary = PlanSummary::default();
        summarize(&mut summary, &actions, &["w".to_string()]);
        assert_eq!(summary.file_count, 3);
        assert_eq!(summary.delete_count, 1);
        assert_eq!(summary.download_size_known, 10);
        assert_eq!(summary.download_size_estimated_max, 60);
        assert_eq!(summary.download_size, 60);
        assert_eq!(summary.download_size_unknown_count, 1);
        assert_eq!(summary.disk_size, 150);
        assert_eq!(summary.warning_count, 1);
    }

    #[test]
    fn test_dedupe_warnings() {
        let warnings = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(dedupe_warnings(warnings), vec!["a", "b"]);
    }

    #[test]
    fn test_action_json_shape() {
        let value = serde_json::to_value(Action::delete("c.txt".to_string(), "pkg", "")).unwrap();
        assert_eq!(value["type"], "delete");
        assert_eq!(value["relativePath"], "c.txt");
        assert_eq!(value["state"], "DELETE");
        assert_eq!(value["freshDeletion"], false);
    }
}
