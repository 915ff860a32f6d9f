//! Hypermedia update provider.
//!
//! Planning walks the product tree, picks one snapshot per product and
//! diffs each product's file list against the local directory by server
//! state and MD5. Installing downloads every update action through its
//! `xu:data` link, verifies it and commits it atomically.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{authorize_hypermedia, catalog_strategies, query_headers, resolve_absolute_url, to_header_map};
use crate::error::UpdateError;
use crate::http::{DownloadRequest, HttpClient};
use crate::hypermedia::catalog::{
    append_since_if_template, fetch_file_list, fetch_product_info, resolve_product_dir, RemoteFile,
};
use crate::install::{
    ActionApplier, InstallContext, InstallControl, InstallResult, PhaseProgress, ProgressEvent,
};
use crate::manifest::InstallManifest;
use crate::paths::{collect_files, commit_copy, normalize_rel_path, resolve_within_root, to_rel_string, write_atomic, IgnoreRules};
use crate::plan::{
    dedupe_warnings, order_actions, summarize, Action, ActionKind, ActionLocator, FileState,
    OptionalPackage, Plan, PlanDiagnostics, PlanSummary,
};
use crate::plan_cache::PlanContext;
use crate::profile::{OptionalPackageAction, Options, Profile, ProviderKind};
use crate::provider::{ProviderServices, UpdateProvider};
use crate::snapshot::{RollbackInfo, RollbackResult, SnapshotManager};
use crate::verify::{digests_equal, md5_file, ContentVerifier, Verified, EMPTY_MD5};

/// Provider for the product/snapshot/file catalog API.
pub struct HypermediaProvider {
    services: Arc<ProviderServices>,
}

/// One product's file list, ready to diff.
#[derive(Debug, Clone)]
struct PackageListing {
    name: String,
    dir: PathBuf,
    /// Product directory relative to the install root, empty for the root
    dir_rel: String,
    files: Vec<RemoteFile>,
}

/// Actions for one package plus what it lists.
#[derive(Debug, Default)]
struct PackageActions {
    actions: Vec<Action>,
    /// Root-relative paths of every listed file, deletes included
    listed: HashSet<String>,
    /// Root-relative paths the package provides after install
    provided: Vec<String>,
}

fn join_rel(dir_rel: &str, rel: &str) -> String {
    if dir_rel.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", dir_rel, rel)
    }
}

fn is_under(dir_rel: &str, rel: &str) -> bool {
    dir_rel.is_empty()
        || rel == dir_rel
        || (rel.starts_with(dir_rel) && rel.as_bytes().get(dir_rel.len()) == Some(&b'/'))
}

fn local_differs(path: &Path, expected: &str) -> Result<bool, UpdateError> {
    let actual = md5_file(path)?;
    Ok(!digests_equal(&actual, expected))
}

/// Diff one package against its directory.
///
/// Files the server marks `DELETE` are removed when present (never in
/// repair mode). Repair re-hashes every listed file. Otherwise only `ADD`
/// and `UPDATE` files are considered, or every file when `fresh`, and an
/// MD5 match on disk skips the download. With `fresh`, local files the
/// listing does not claim become deletions.
fn build_package_actions(
    package: &PackageListing,
    options: &Options,
    warnings: &mut Vec<String>,
) -> Result<PackageActions, UpdateError> {
    let fresh = options.fresh && !options.repair;
    let repair = options.repair;
    let mut out = PackageActions::default();
    let mut server_rel: HashSet<String> = HashSet::new();

    for item in &package.files {
        let resolved = normalize_rel_path(&item.location)
            .and_then(|rel| resolve_within_root(&package.dir, &rel).map(|target| (rel, target)));
        let (safe_rel, target) = match resolved {
            Ok(pair) => pair,
            Err(e) => {
                warn!(location = %item.location, package = %package.name, error = %e, "Skipping unsafe catalog path");
                warnings.push(format!(
                    "Skipped unsafe path {} ({}).",
                    item.location, package.name
                ));
                continue;
            }
        };
        server_rel.insert(safe_rel.clone());
        let relative_path = join_rel(&package.dir_rel, &safe_rel);
        out.listed.insert(relative_path.clone());
        let present = target.is_file();

        if item.state == FileState::Delete {
            if !repair && present {
                out.actions
                    .push(Action::delete(relative_path, &package.name, &package.dir_rel));
            }
            continue;
        }
        out.provided.push(relative_path.clone());

        let must_update = if repair {
            !present || local_differs(&target, &item.hash)?
        } else {
            if !fresh && !matches!(item.state, FileState::Add | FileState::Update) {
                continue;
            }
            fresh || !present || local_differs(&target, &item.hash)?
        };
        if !must_update {
            continue;
        }

        let Some(data) = item.data_link() else {
            return Err(UpdateError::Catalog(format!(
                "Missing xu:data link for {} ({})",
                safe_rel, package.name
            )));
        };

        out.actions.push(Action {
            kind: ActionKind::Update,
            relative_path,
            package_name: package.name.clone(),
            package_dir: package.dir_rel.clone(),
            state: Some(item.state),
            compressed_size: item.compressed_size,
            real_size: item.real_size,
            hash: Some(item.hash.clone()),
            locator: Some(ActionLocator::Download {
                href: data.href.clone(),
            }),
            fresh_deletion: false,
            repair_update: repair,
        });
    }

    if fresh {
        for rel in collect_files(&package.dir)? {
            if server_rel.contains(&rel) {
                continue;
            }
            let mut action = Action::delete(join_rel(&package.dir_rel, &rel), &package.name, &package.dir_rel);
            action.fresh_deletion = true;
            out.actions.push(action);
        }
    }

    Ok(out)
}

impl HypermediaProvider {
    pub fn new(services: Arc<ProviderServices>) -> Self {
        Self { services }
    }

    fn snapshots(&self) -> SnapshotManager {
        self.services.snapshot_manager(ProviderKind::Hypermedia)
    }
}

#[async_trait]
impl UpdateProvider for HypermediaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hypermedia
    }

    async fn create_plan(&self, profile: &Profile, options: &Options) -> Result<Plan, UpdateError> {
        let profile_id = profile.require_id()?;
        let root = profile.require_product_dir()?;
        let host = profile.normalized_host()?;
        let options = options.effective(profile.channel);
        let config = &self.services.config;
        let http = &self.services.http;

        info!(
            profile_id,
            channel = %profile.channel,
            fresh = options.fresh,
            repair = options.repair,
            "Creating hypermedia update plan"
        );

        let auth = authorize_hypermedia(
            http,
            &host,
            profile,
            &config.hypermedia,
            config.network.auth_timeout(),
        )
        .await?;
        let strategies = catalog_strategies(&auth, profile);
        let updates_url = format!("{}{}", host, config.hypermedia.updates_path);
        let product_info =
            fetch_product_info(http, &updates_url, &strategies, config.network.api_timeout()).await?;
        let root_product = &product_info.root;
        let products = root_product.flatten();
        debug!(products = products.len(), strategy = %product_info.strategy.name, "Product tree fetched");

        let mut warnings: Vec<String> = Vec::new();
        if options.repair {
            warnings.push("Repair/verify mode enabled: all known files will be hash-checked.".to_string());
        }
        let root_note = root_product.blocked.trim();
        if !root_note.is_empty() {
            warnings.push(format!("Product note ({}): {}", root_product.name, root_note));
        }

        let since = if options.fresh || options.repair {
            0
        } else {
            profile.package_version
        };
        let mut optional_packages: Vec<OptionalPackage> = Vec::new();
        let mut packages: Vec<PackageListing> = Vec::new();
        let mut snapshot_type = "release".to_string();
        let mut snapshot_number = 0;

        for product in products {
            let note = product.blocked.trim();
            if !note.is_empty() {
                warnings.push(format!("Product note ({}): {}", product.name, note));
            }

            let resolved = match resolve_product_dir(root, &product.location) {
                Ok(resolved) => resolved,
                Err(e @ UpdateError::PathSafety(_)) => {
                    warn!(product = %product.name, error = %e, "Skipping product with unsafe location");
                    warnings.push(format!("Skipped {}: unsafe product location.", product.name));
                    continue;
                }
                Err(e) => return Err(e),
            };
            let has_markers = product.location.has_markers();
            let default_action = if resolved.detected {
                OptionalPackageAction::Install
            } else {
                OptionalPackageAction::Ignore
            };
            let selected_action = if has_markers {
                options
                    .optional_packages
                    .get(product.id.trim())
                    .copied()
                    .unwrap_or(default_action)
            } else {
                OptionalPackageAction::Install
            };

            if has_markers {
                optional_packages.push(OptionalPackage {
                    id: product.id.clone(),
                    name: product.name.clone(),
                    detected: resolved.detected,
                    default_action,
                    selected_action,
                });
            }

            if selected_action == OptionalPackageAction::Ignore {
                if has_markers && !resolved.detected {
                    warnings.push(format!(
                        "Optional package \"{}\" is not relevant for this installation and was skipped.",
                        product.name
                    ));
                } else if has_markers {
                    warnings.push(format!(
                        "Optional package \"{}\" was set to ignore and was skipped.",
                        product.name
                    ));
                }
                continue;
            }
            if has_markers && !resolved.detected {
                warnings.push(format!(
                    "Optional package \"{}\" was selected for install without detection markers.",
                    product.name
                ));
            }

            let snapshot = product.pick_snapshot(&options, &mut warnings)?;
            if snapshot.number > snapshot_number {
                snapshot_number = snapshot.number;
                snapshot_type = snapshot.kind.clone();
            }
            let Some(link) = snapshot.files_link() else {
                return Err(UpdateError::Catalog(format!(
                    "Missing xu:files link for {}.",
                    product.name
                )));
            };
            let files_url = append_since_if_template(
                &resolve_absolute_url(&host, &link.href),
                link.template,
                since,
            )?;
            let files = fetch_file_list(
                http,
                &files_url,
                &product_info.strategy.headers,
                config.network.file_list_timeout(),
            )
            .await?;
            debug!(product = %product.name, files = files.len(), since, "File list fetched");

            packages.push(PackageListing {
                name: product.name.clone(),
                dir_rel: to_rel_string(root, &resolved.dir).unwrap_or_default(),
                dir: resolved.dir,
                files,
            });
        }

        let mut actions: Vec<Action> = Vec::new();
        let mut listed: HashSet<String> = HashSet::new();
        let mut provided: Vec<String> = Vec::new();
        for package in &packages {
            let part = build_package_actions(package, &options, &mut warnings)?;
            actions.extend(part.actions);
            listed.extend(part.listed);
            provided.extend(part.provided);
        }
        // A nested product's files are never fresh-deleted by its parent.
        actions.retain(|a| !(a.fresh_deletion && listed.contains(&a.relative_path)));

        let store = self.snapshots().manifest_store(profile_id);
        let previous = store.load();
        let full_listing = since == 0 && !options.repair;
        let covered = |rel: &str| packages.iter().any(|p| is_under(&p.dir_rel, rel));

        if full_listing && !options.fresh {
            if let Some(previous) = &previous {
                let mut seen: HashSet<String> =
                    actions.iter().map(|a| a.relative_path.clone()).collect();
                for rel in &previous.files {
                    if listed.contains(rel) || !covered(rel) || seen.contains(rel) {
                        continue;
                    }
                    let Ok(target) = resolve_within_root(root, rel) else {
                        continue;
                    };
                    if !target.is_file() {
                        continue;
                    }
                    let owner = packages
                        .iter()
                        .filter(|p| is_under(&p.dir_rel, rel))
                        .max_by_key(|p| p.dir_rel.len());
                    if let Some(owner) = owner {
                        actions.push(Action::delete(rel.clone(), &owner.name, &owner.dir_rel));
                        seen.insert(rel.clone());
                    }
                }
            }
        }

        let ignore = IgnoreRules::compile(&profile.ignore_list);
        let mut ignored_count = 0;
        if !ignore.is_empty() {
            let package_rel = |action: &Action| -> String {
                action
                    .relative_path
                    .strip_prefix(&action.package_dir)
                    .map(|rest| rest.trim_start_matches('/').to_string())
                    .filter(|rest| !action.package_dir.is_empty() && !rest.is_empty())
                    .unwrap_or_else(|| action.relative_path.clone())
            };
            let before = actions.len();
            actions.retain(|a| !(ignore.matches(&a.relative_path) || ignore.matches(&package_rel(a))));
            ignored_count = before - actions.len();
            if ignored_count > 0 {
                warnings.push(format!("Ignore list skipped {} action(s).", ignored_count));
            }
        }

        let actions = order_actions(actions);
        let deleted: HashSet<&str> = actions
            .iter()
            .filter(|a| a.is_delete())
            .map(|a| a.relative_path.as_str())
            .collect();
        let mut manifest_files: Vec<String> = previous
            .map(|m| m.files)
            .unwrap_or_default()
            .into_iter()
            .filter(|rel| !(full_listing && covered(rel) && !listed.contains(rel)))
            .chain(provided)
            .filter(|rel| !deleted.contains(rel.as_str()))
            .collect();
        manifest_files.sort();
        manifest_files.dedup();

        let warnings = dedupe_warnings(warnings);
        let mut summary = PlanSummary {
            product_name: root_product.name.clone(),
            distributor: root_product.distributor.clone(),
            snapshot_type,
            snapshot_number,
            package_count: packages.len(),
            optional_package_count: optional_packages.len(),
            optional_ignored_count: optional_packages
                .iter()
                .filter(|p| p.selected_action == OptionalPackageAction::Ignore)
                .count(),
            optional_forced_install_count: optional_packages
                .iter()
                .filter(|p| p.selected_action == OptionalPackageAction::Install && !p.detected)
                .count(),
            ignored_count,
            repair_mode: options.repair,
            ..PlanSummary::default()
        };
        summarize(&mut summary, &actions, &warnings);

        let listed_file_count = packages.iter().map(|p| p.files.len()).sum();
        let plan = Plan {
            plan_id: uuid::Uuid::new_v4().to_string(),
            provider: ProviderKind::Hypermedia,
            profile_id: profile_id.to_string(),
            created_at: Utc::now(),
            summary,
            actions,
            warnings,
            optional_packages,
            diagnostics: Some(PlanDiagnostics::Hypermedia {
                strategy: product_info.strategy.name.clone(),
                since,
                listed_file_count,
            }),
        };

        info!(
            plan_id = %plan.plan_id,
            updates = plan.update_count(),
            deletes = plan.summary.delete_count,
            ignored = plan.summary.ignored_count,
            download_bytes = plan.summary.download_size,
            warnings = plan.warnings.len(),
            "Update plan created"
        );

        self.services
            .plans
            .insert(
                plan.clone(),
                PlanContext::Hypermedia {
                    host,
                    auth_headers: product_info.strategy.headers.clone(),
                    manifest_files,
                },
            )
            .await;
        Ok(plan)
    }

    async fn install(
        &self,
        profile: &Profile,
        plan_id: &str,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        control: &InstallControl,
    ) -> Result<InstallResult, UpdateError> {
        let profile_id = profile.require_id()?;
        let cached = self.services.plans.checkout(plan_id, profile_id).await?;
        let PlanContext::Hypermedia {
            host,
            auth_headers,
            manifest_files,
        } = &cached.context
        else {
            return Err(UpdateError::PlanNotFound);
        };

        let mut headers = query_headers();
        headers.extend(to_header_map(auth_headers));
        let mut applier = HypermediaApplier {
            http: &self.services.http,
            host,
            headers,
            temp_dir: self.services.temp_dir(ProviderKind::Hypermedia),
            verifier: self.services.verifier(),
            timeout: self.services.config.network.download_timeout(),
            manifest_files,
            temps: Vec::new(),
        };
        self.services
            .execute(profile, &cached, &mut applier, progress, control)
            .await
    }

    async fn rollback_info(&self, profile_id: &str) -> RollbackInfo {
        self.snapshots().rollback_info(profile_id)
    }

    async fn rollback(&self, profile: &Profile) -> Result<RollbackResult, UpdateError> {
        self.snapshots().rollback(profile)
    }
}

/// Downloads, verifies and commits one file per update action.
struct HypermediaApplier<'a> {
    http: &'a HttpClient,
    host: &'a str,
    headers: HeaderMap,
    temp_dir: PathBuf,
    verifier: ContentVerifier,
    timeout: Duration,
    manifest_files: &'a [String],
    temps: Vec<PathBuf>,
}

#[async_trait]
impl<'a> ActionApplier for HypermediaApplier<'a> {
    async fn apply_update(
        &mut self,
        ctx: &InstallContext<'_>,
        action: &Action,
        dest: &Path,
    ) -> Result<(), UpdateError> {
        let hash = action.hash.as_deref().unwrap_or("");
        if action.real_size == 0 && digests_equal(hash, EMPTY_MD5) {
            write_atomic(dest, b"")?;
            debug!(path = %action.relative_path, "Created empty file");
            return Ok(());
        }

        let Some(ActionLocator::Download { href }) = &action.locator else {
            return Err(UpdateError::Catalog(format!(
                "Missing xu:data link for {} ({})",
                action.relative_path, action.package_name
            )));
        };
        let url = resolve_absolute_url(self.host, href);
        let temp = self
            .temp_dir
            .join(format!("{}.part", uuid::Uuid::new_v4().simple()));
        self.temps.push(temp.clone());

        let index = ctx
            .plan
            .actions
            .iter()
            .position(|a| std::ptr::eq(a, action))
            .map(|i| i + 1)
            .unwrap_or(0);
        let phase = PhaseProgress {
            sink: ctx.progress,
            template: ProgressEvent {
                index,
                total: ctx.plan.actions.len(),
                kind: action.kind,
                package_name: action.package_name.clone(),
                path: action.relative_path.clone(),
                message: format!("{} {}", action.kind.label(), action.relative_path),
                bytes_downloaded: None,
                bytes_total: None,
            },
        };

        self.http
            .download_to_file(DownloadRequest {
                url: &url,
                dest: &temp,
                headers: self.headers.clone(),
                timeout: self.timeout,
                control: Some(ctx.control),
                progress: Some(&phase),
            })
            .await?;
        ctx.control.checkpoint().await?;

        let source = if hash.is_empty() {
            warn!(path = %action.relative_path, "No hash published, installing unverified");
            temp
        } else {
            match self.verifier.verify_md5(&temp, hash, &action.relative_path)? {
                Verified::Raw => temp,
                Verified::Unpacked(unpacked) => {
                    self.temps.push(unpacked.clone());
                    unpacked
                }
            }
        };
        commit_copy(&source, dest)?;
        Ok(())
    }

    fn manifest(&self, _plan: &Plan) -> Option<InstallManifest> {
        Some(InstallManifest::new(
            ProviderKind::Hypermedia,
            None,
            "",
            self.manifest_files.to_vec(),
        ))
    }

    fn cleanup(&mut self) {
        for temp in self.temps.drain(..) {
            if let Err(e) = fs::remove_file(&temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %temp.display(), error = %e, "Failed to remove temp download");
                }
            }
        }
    }
}
