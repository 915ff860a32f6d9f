//! ZIP-archive update provider.
//!
//! Planning reads the package's central directory over HTTP range
//! requests and compares every entry with the local file by size and a
//! full CRC32 scan. When the server refuses ranges the whole archive is
//! downloaded, MD5-verified and indexed locally instead. Installing
//! fetches the package once and extracts each planned entry from it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::archive::discovery::{fetch_companies, FilesUrlProbe, FilesUrlResolver};
use crate::auth::ArchiveAuthenticator;
use crate::error::{MismatchDetail, UpdateError};
use crate::http::{ByteProgress, DownloadRequest, HttpClient};
use crate::install::{
    ActionApplier, InstallContext, InstallControl, InstallResult, PhaseProgress, ProgressEvent,
};
use crate::manifest::InstallManifest;
use crate::paths::{normalize_zip_rel_path, replace_file, resolve_within_root, temp_sibling, IgnoreRules};
use crate::plan::{
    dedupe_warnings, order_actions, summarize, zip_update_action, Action, ActionKind, ActionLocator,
    ListingMode, Plan, PlanDiagnostics, PlanSummary,
};
use crate::plan_cache::PlanContext;
use crate::profile::{Options, Profile, ProviderKind};
use crate::provider::{ProviderServices, UpdateProvider};
use crate::snapshot::{RollbackInfo, RollbackResult, SnapshotManager};
use crate::verify::{
    crc32_file, digests_equal, format_crc32, is_gzip_header, is_zip_header, md5_file,
    parse_crc32_token, read_header, Verified,
};
use crate::zip_index::{
    extract_entry, list_entries, validate_entries_match, EntryLocation, ExpectedEntry, LocalZipFile,
    RemoteZip, ZipEntry,
};

/// Provider for products shipped as one signed ZIP package.
pub struct ArchiveProvider {
    services: Arc<ProviderServices>,
}

/// Header sets tried for package requests: signed URLs need none.
fn header_candidates(token: Option<&str>) -> Vec<HeaderMap> {
    let mut out = vec![HeaderMap::new()];
    if let Some(value) = token.and_then(|t| HeaderValue::from_str(t).ok()) {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        out.push(headers);
    }
    out
}

/// Download `url` with each header set in turn.
async fn download_package(
    http: &HttpClient,
    url: &str,
    dest: &Path,
    candidates: &[HeaderMap],
    timeout: std::time::Duration,
    control: Option<&InstallControl>,
    progress: Option<&PhaseProgress<'_>>,
) -> Result<(), UpdateError> {
    let mut last_error = None;
    for headers in candidates {
        let outcome = http
            .download_to_file(DownloadRequest {
                url,
                dest,
                headers: headers.clone(),
                timeout,
                control,
                progress: progress.map(|p| p as &dyn ByteProgress),
            })
            .await;
        match outcome {
            Ok(outcome) => {
                debug!(url, bytes = outcome.bytes, "Package downloaded");
                return Ok(());
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(url, error = %e, "Package download attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| UpdateError::Network("no download attempted".to_string())))
}

/// Local-vs-archive comparison inputs.
struct EntryComparison<'a> {
    root: &'a Path,
    package_name: &'a str,
    fresh: bool,
    ignore: &'a IgnoreRules,
    /// Files of the previous install, when it belongs to this product
    previous_files: Option<&'a [String]>,
}

#[derive(Debug, Default)]
struct ComparisonOutcome {
    actions: Vec<Action>,
    /// Sorted unique package paths, ignored ones excluded
    manifest_files: Vec<String>,
    compared: usize,
    ignored: usize,
}

impl<'a> EntryComparison<'a> {
    /// Whether the local file differs from the entry.
    fn needs_update(&self, target: &Path, entry: &ZipEntry) -> Result<bool, UpdateError> {
        if self.fresh || !target.is_file() {
            return Ok(true);
        }
        let len = fs::metadata(target)?.len();
        if entry.uncompressed_size > 0 && len != entry.uncompressed_size {
            return Ok(true);
        }
        Ok(crc32_file(target)? != entry.crc32)
    }

    fn run(&self, entries: &[ZipEntry], warnings: &mut Vec<String>) -> Result<ComparisonOutcome, UpdateError> {
        let mut out = ComparisonOutcome::default();
        let mut in_package: HashSet<String> = HashSet::new();
        let mut updates = Vec::new();

        for entry in entries {
            if entry.is_dir() {
                continue;
            }
            let resolved = normalize_zip_rel_path(&entry.file_name)
                .and_then(|rel| resolve_within_root(self.root, &rel).map(|target| (rel, target)));
            let (rel, target) = match resolved {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(entry = %entry.file_name, error = %e, "Skipping unsafe archive entry");
                    warnings.push(format!("Skipped unsafe path {} ({}).", entry.file_name, self.package_name));
                    continue;
                }
            };
            if self.ignore.matches(&rel) {
                out.ignored += 1;
                continue;
            }
            if !in_package.insert(rel.clone()) {
                continue;
            }
            out.manifest_files.push(rel.clone());
            out.compared += 1;

            if self.needs_update(&target, entry)? {
                updates.push(zip_update_action(rel, entry, self.package_name, format_crc32(entry.crc32)));
            }
        }

        let mut deletes = Vec::new();
        if let Some(previous) = self.previous_files {
            for raw in previous {
                let Ok(rel) = normalize_zip_rel_path(raw) else {
                    continue;
                };
                if in_package.contains(&rel) || self.ignore.matches(&rel) {
                    continue;
                }
                if resolve_within_root(self.root, &rel).is_err() {
                    continue;
                }
                if deletes.iter().any(|a: &Action| a.relative_path == rel) {
                    continue;
                }
                deletes.push(Action::delete(rel, self.package_name, ""));
            }
        }

        deletes.extend(updates);
        out.actions = order_actions(deletes);
        out.manifest_files.sort();
        Ok(out)
    }
}

/// Central directory and where it came from.
struct PackageListing {
    entries: Vec<ZipEntry>,
    mode: ListingMode,
    temp_zip: Option<PathBuf>,
    listing_error: Option<String>,
}

impl ArchiveProvider {
    pub fn new(services: Arc<ProviderServices>) -> Self {
        Self { services }
    }

    fn snapshots(&self) -> SnapshotManager {
        self.services.snapshot_manager(ProviderKind::Archive)
    }

    fn resolver<'a>(&'a self, base_url: &'a str) -> FilesUrlResolver<'a> {
        let config = &self.services.config;
        FilesUrlResolver {
            http: &self.services.http,
            base_url,
            config: &config.archive,
            api_timeout: config.network.archive_timeout(),
            probe_timeout: config.network.probe_timeout(),
        }
    }

    async fn authenticate(&self, base_url: &str, profile: &Profile) -> Result<String, UpdateError> {
        let config = &self.services.config;
        ArchiveAuthenticator {
            http: &self.services.http,
            config: &config.archive,
            base_url,
            timeout: config.network.auth_timeout(),
        }
        .authenticate(profile)
        .await
    }

    /// List the package, by range requests or by a verified full download.
    async fn list_package(
        &self,
        plan_id: &str,
        probe: &FilesUrlProbe,
        token: &str,
        warnings: &mut Vec<String>,
    ) -> Result<PackageListing, UpdateError> {
        let http = &self.services.http;
        let network = &self.services.config.network;
        let candidates = header_candidates(Some(token));

        let remote = RemoteZip {
            http,
            url: &probe.url,
            known_size: probe.size,
            header_candidates: candidates.clone(),
            timeout: network.archive_timeout(),
            cancel: None,
        };
        let range_error = match list_entries(&remote).await {
            Ok(entries) => {
                return Ok(PackageListing {
                    entries,
                    mode: ListingMode::Range,
                    temp_zip: None,
                    listing_error: None,
                })
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e.to_string(),
        };

        warn!(url = %probe.url, reason = %range_error, "Range listing unavailable, downloading package");
        warnings.push(format!(
            "ZIP listing via HTTP range unavailable ({}). Trying full download for file compare ...",
            range_error
        ));

        let Some(expected) = probe.md5.as_deref() else {
            return Err(UpdateError::Catalog(format!(
                "ZIP listing failed ({}); missing filesIntegrityHash, cannot safely download for compare.",
                range_error
            )));
        };

        let temp_dir = self.services.temp_dir(ProviderKind::Archive);
        fs::create_dir_all(&temp_dir)?;
        let dest = temp_dir.join(format!("plan-{}.zip", plan_id));
        download_package(http, &probe.url, &dest, &candidates, network.download_timeout(), None, None).await?;

        let zip = match self.services.verifier().verify_md5(&dest, expected, "package") {
            Ok(Verified::Raw) => dest,
            Ok(Verified::Unpacked(unpacked)) => {
                let _ = fs::remove_file(&dest);
                unpacked
            }
            Err(e) => {
                let _ = fs::remove_file(&dest);
                return Err(e);
            }
        };
        let entries = match list_entries(&LocalZipFile::new(&zip)).await {
            Ok(entries) => entries,
            Err(e) => {
                let _ = fs::remove_file(&zip);
                return Err(e);
            }
        };
        warnings.push("plan: built via downloaded ZIP (range unsupported).".to_string());
        Ok(PackageListing {
            entries,
            mode: ListingMode::Download,
            temp_zip: Some(zip),
            listing_error: Some(range_error),
        })
    }
}

#[async_trait]
impl UpdateProvider for ArchiveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Archive
    }

    async fn create_plan(&self, profile: &Profile, options: &Options) -> Result<Plan, UpdateError> {
        let profile_id = profile.require_id()?;
        let root = profile.require_product_dir()?;
        let base_url = profile.normalized_host()?;
        let options = options.effective(profile.channel);
        let config = &self.services.config;
        let plan_id = uuid::Uuid::new_v4().to_string();

        info!(
            profile_id,
            product_id = ?profile.product_id,
            fresh = options.fresh,
            repair = options.repair,
            "Creating archive update plan"
        );

        let token = self.authenticate(&base_url, profile).await?;
        let listing = fetch_companies(
            &self.services.http,
            &base_url,
            &config.archive,
            &token,
            config.network.archive_timeout(),
        )
        .await;

        let mut warnings = vec![listing.connection_summary()];
        if !listing.warnings.is_empty() {
            warnings.push(format!("Product list probe warning: {}", listing.warnings.join("; ")));
        }

        let Some(product_id) = profile.product_id.filter(|id| *id > 0) else {
            warnings.push("No product selected. Choose one of the owned products and check again.".to_string());
            let warnings = dedupe_warnings(warnings);
            let mut summary = PlanSummary {
                snapshot_type: "package".to_string(),
                ..PlanSummary::default()
            };
            summarize(&mut summary, &[], &warnings);
            let plan = Plan {
                plan_id,
                provider: ProviderKind::Archive,
                profile_id: profile_id.to_string(),
                created_at: Utc::now(),
                summary,
                actions: Vec::new(),
                warnings,
                optional_packages: Vec::new(),
                diagnostics: Some(PlanDiagnostics::Archive {
                    product_id: None,
                    listing_mode: None,
                    listing_error: None,
                    entry_count: 0,
                    compared_file_count: 0,
                    package_size: None,
                    owned_products: listing.owned,
                }),
            };
            info!(plan_id = %plan.plan_id, "No product selected, empty plan");
            return Ok(plan);
        };

        let probe = self.resolver(&base_url).resolve(profile, &token, product_id).await?;
        warnings.extend(probe.warnings());

        let package_name = listing
            .name_of(product_id)
            .map(str::to_string)
            .or_else(|| profile.product_name.clone().filter(|n| !n.trim().is_empty()))
            .unwrap_or_else(|| format!("Product {}", product_id));

        let package = self.list_package(&plan_id, &probe, &token, &mut warnings).await?;
        debug!(entries = package.entries.len(), mode = ?package.mode, "Package listed");

        let previous = self.snapshots().manifest_store(profile_id).load();
        let previous_files = previous
            .as_ref()
            .filter(|m| !m.files.is_empty())
            .filter(|m| m.product_id.map(|id| id == 0 || id == product_id).unwrap_or(true))
            .map(|m| m.files.as_slice());

        let ignore = IgnoreRules::compile(&profile.ignore_list);
        let comparison = EntryComparison {
            root,
            package_name: &package_name,
            fresh: options.fresh && !options.repair,
            ignore: &ignore,
            previous_files,
        };
        let outcome = comparison.run(&package.entries, &mut warnings)?;

        warnings.push(if comparison.fresh {
            "Fresh install: every package file will be extracted.".to_string()
        } else if options.repair {
            "Repair/verify mode: files are compared via ZIP CRC32 and size.".to_string()
        } else {
            "Archive package: files are compared via ZIP CRC32 and size.".to_string()
        });
        warnings.push(if previous_files.is_some() {
            "Delete detection enabled (previous install manifest found).".to_string()
        } else {
            "Delete detection unavailable (no previous install manifest for this product).".to_string()
        });
        if outcome.ignored > 0 {
            warnings.push(format!("Ignore list skipped {} file(s).", outcome.ignored));
        }
        if outcome.actions.is_empty() {
            warnings.push("plan: no changes detected (all files match).".to_string());
        }

        let warnings = dedupe_warnings(warnings);
        let mut summary = PlanSummary {
            product_name: package_name.clone(),
            snapshot_type: "package".to_string(),
            package_count: 1,
            ignored_count: outcome.ignored,
            repair_mode: options.repair,
            ..PlanSummary::default()
        };
        summarize(&mut summary, &outcome.actions, &warnings);
        // The install fetches the whole package once, whatever the entry count.
        if outcome.actions.iter().any(Action::is_update) {
            match probe.size {
                Some(size) => {
                    summary.download_size = size;
                    summary.download_size_known = size;
                    summary.download_size_estimated_max = size;
                    summary.download_size_unknown_count = 0;
                }
                None => {
                    summary.download_size_known = 0;
                    summary.download_size_unknown_count = 1;
                }
            }
        }

        let plan = Plan {
            plan_id,
            provider: ProviderKind::Archive,
            profile_id: profile_id.to_string(),
            created_at: Utc::now(),
            summary,
            actions: outcome.actions,
            warnings,
            optional_packages: Vec::new(),
            diagnostics: Some(PlanDiagnostics::Archive {
                product_id: Some(product_id),
                listing_mode: Some(package.mode),
                listing_error: package.listing_error.clone(),
                entry_count: package.entries.len(),
                compared_file_count: outcome.compared,
                package_size: probe.size,
                owned_products: Vec::new(),
            }),
        };

        info!(
            plan_id = %plan.plan_id,
            updates = plan.update_count(),
            deletes = plan.summary.delete_count,
            ignored = plan.summary.ignored_count,
            listing = ?package.mode,
            warnings = plan.warnings.len(),
            "Update plan created"
        );

        self.services
            .plans
            .insert(
                plan.clone(),
                PlanContext::Archive {
                    base_url,
                    download_url: probe.url,
                    filename: probe.filename,
                    package_md5: probe.md5,
                    product_id,
                    package_size: probe.size,
                    temp_zip: package.temp_zip,
                    listing_mode: package.mode,
                    manifest_files: outcome.manifest_files,
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
        let PlanContext::Archive {
            base_url,
            download_url,
            filename,
            package_md5,
            product_id,
            temp_zip,
            manifest_files,
            ..
        } = &cached.context
        else {
            return Err(UpdateError::PlanNotFound);
        };

        let manifest_files = if manifest_files.is_empty() {
            let deleted: HashSet<&str> = cached
                .plan
                .actions
                .iter()
                .filter(|a| a.is_delete())
                .map(|a| a.relative_path.as_str())
                .collect();
            self.snapshots()
                .manifest_store(profile_id)
                .load()
                .map(|m| m.files)
                .unwrap_or_default()
                .into_iter()
                .filter(|rel| !deleted.contains(rel.as_str()))
                .collect()
        } else {
            manifest_files.clone()
        };

        let mut applier = ArchiveApplier {
            provider: self,
            profile,
            base_url,
            product_id: *product_id,
            label: if filename.is_empty() {
                cached.plan.summary.product_name.clone()
            } else {
                filename.clone()
            },
            download_url: download_url.clone(),
            package_md5: package_md5.clone(),
            planned_zip: temp_zip.clone(),
            manifest_files,
            zip_path: None,
            temps: temp_zip.iter().cloned().collect(),
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

/// Fetches and verifies the package once, then extracts entry by entry.
struct ArchiveApplier<'a> {
    provider: &'a ArchiveProvider,
    profile: &'a Profile,
    base_url: &'a str,
    product_id: u64,
    label: String,
    download_url: String,
    package_md5: Option<String>,
    /// Archive downloaded while planning, if any
    planned_zip: Option<PathBuf>,
    manifest_files: Vec<String>,
    zip_path: Option<PathBuf>,
    temps: Vec<PathBuf>,
}

impl<'a> ArchiveApplier<'a> {
    /// Re-authenticate and re-resolve the signed URL. Failures only warn:
    /// the planned URL may still be valid.
    async fn refresh(&mut self) -> Option<String> {
        let token = match self.provider.authenticate(self.base_url, self.profile).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Re-authentication failed, continuing without token");
                return None;
            }
        };
        match self
            .provider
            .resolver(self.base_url)
            .resolve(self.profile, &token, self.product_id)
            .await
        {
            Ok(probe) => {
                self.download_url = probe.url;
                if probe.md5.is_some() {
                    self.package_md5 = probe.md5;
                }
            }
            Err(e) => warn!(error = %e, "Could not refresh package URL, using the planned one"),
        }
        Some(token)
    }

    /// The planning download, when it still matches the declared MD5.
    fn reusable_zip(&self) -> Option<PathBuf> {
        let path = self.planned_zip.as_ref()?;
        let expected = self.package_md5.as_deref()?;
        let actual = md5_file(path).ok()?;
        digests_equal(&actual, expected).then(|| path.clone())
    }

    /// Verify the package MD5, falling back to gunzip or entry validation.
    async fn verify_package(&mut self, path: &Path, plan: &Plan) -> Result<PathBuf, UpdateError> {
        let header = read_header(path, 4)?;
        if is_gzip_header(&header) {
            let expected = self.package_md5.clone().unwrap_or_default();
            return match self.provider.services.verifier().verify_md5(path, &expected, &self.label)? {
                Verified::Raw => Ok(path.to_path_buf()),
                Verified::Unpacked(unpacked) => {
                    self.temps.push(unpacked.clone());
                    Ok(unpacked)
                }
            };
        }
        if !is_zip_header(&header) {
            return Err(UpdateError::ZipFormat(format!(
                "downloaded package is not a ZIP (header {})",
                hex::encode(&header)
            )));
        }

        let raw = md5_file(path)?;
        let expected = self.package_md5.clone().unwrap_or_default();
        if !expected.is_empty() && digests_equal(&raw, &expected) {
            debug!(package = %self.label, digest = %raw, "Package MD5 verified");
            return Ok(path.to_path_buf());
        }
        let mismatch = UpdateError::ChecksumMismatch {
            subject: self.label.clone(),
            expected: expected.clone(),
            raw: raw.clone(),
            detail: MismatchDetail::None,
        };
        if !self.provider.services.config.integrity.accept_crc_validated_package {
            return Err(mismatch);
        }

        let entries = list_entries(&LocalZipFile::new(path)).await?;
        let wanted: Vec<ExpectedEntry<'_>> = plan
            .actions
            .iter()
            .filter_map(|action| match (&action.locator, action.hash.as_deref().and_then(parse_crc32_token)) {
                (
                    Some(ActionLocator::ZipEntry {
                        entry_name,
                        method,
                        local_header_offset,
                    }),
                    Some(crc32),
                ) => Some(ExpectedEntry {
                    entry_name,
                    method: *method,
                    local_header_offset: *local_header_offset,
                    crc32,
                }),
                _ => None,
            })
            .collect();
        validate_entries_match(&entries, &wanted)?;
        warn!(
            package = %self.label,
            expected = %expected,
            raw = %raw,
            checked_entries = wanted.len(),
            "Package MD5 mismatch accepted: archive matches plan, extraction stays CRC32-verified"
        );
        Ok(path.to_path_buf())
    }
}

#[async_trait]
impl<'a> ActionApplier for ArchiveApplier<'a> {
    async fn prepare(&mut self, ctx: &InstallContext<'_>) -> Result<(), UpdateError> {
        if !ctx.plan.actions.iter().any(Action::is_update) {
            return Ok(());
        }
        let token = self.refresh().await;
        ctx.control.checkpoint().await?;

        let template = ProgressEvent {
            index: 0,
            total: ctx.plan.actions.len(),
            kind: ActionKind::Update,
            package_name: ctx.plan.summary.product_name.clone(),
            path: self.label.clone(),
            message: format!("DOWNLOAD {}", self.label),
            bytes_downloaded: None,
            bytes_total: None,
        };
        ctx.progress.emit(template.clone()).await;

        let zip = match self.reusable_zip() {
            Some(path) => {
                debug!(path = %path.display(), "Reusing package downloaded during planning");
                path
            }
            None => {
                let services = &self.provider.services;
                let temp_dir = services.temp_dir(ProviderKind::Archive);
                fs::create_dir_all(&temp_dir)?;
                let dest = temp_dir.join(format!("pkg-{}.zip", uuid::Uuid::new_v4().simple()));
                self.temps.push(dest.clone());
                let phase = PhaseProgress {
                    sink: ctx.progress,
                    template: template.clone(),
                };
                download_package(
                    &services.http,
                    &self.download_url,
                    &dest,
                    &header_candidates(token.as_deref()),
                    services.config.network.download_timeout(),
                    Some(ctx.control),
                    Some(&phase),
                )
                .await?;
                dest
            }
        };
        ctx.control.checkpoint().await?;

        ctx.progress
            .emit(ProgressEvent {
                message: format!("VERIFY {}", self.label),
                ..template
            })
            .await;
        let verified = self.verify_package(&zip, ctx.plan).await?;
        self.zip_path = Some(verified);
        Ok(())
    }

    async fn apply_update(
        &mut self,
        _ctx: &InstallContext<'_>,
        action: &Action,
        dest: &Path,
    ) -> Result<(), UpdateError> {
        let Some(zip) = &self.zip_path else {
            return Err(UpdateError::ZipFormat("package was not prepared".to_string()));
        };
        let Some(ActionLocator::ZipEntry {
            method,
            local_header_offset,
            ..
        }) = &action.locator
        else {
            return Err(UpdateError::Catalog(format!(
                "Missing ZIP entry for {} ({})",
                action.relative_path, action.package_name
            )));
        };

        let temp = temp_sibling(dest);
        let location = EntryLocation {
            method: *method,
            local_header_offset: *local_header_offset,
            compressed_size: action.compressed_size,
        };
        let crc = match extract_entry(zip, location, &temp) {
            Ok(crc) => crc,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e);
            }
        };
        if let Some(expected) = action.hash.as_deref().and_then(parse_crc32_token) {
            if crc != expected {
                let _ = fs::remove_file(&temp);
                return Err(UpdateError::Crc32Mismatch {
                    path: action.relative_path.clone(),
                    expected: format_crc32(expected),
                    actual: format_crc32(crc),
                });
            }
        }
        replace_file(&temp, dest)?;
        Ok(())
    }

    fn update_label(&self) -> &'static str {
        "EXTRACT"
    }

    fn manifest(&self, _plan: &Plan) -> Option<InstallManifest> {
        Some(InstallManifest::new(
            ProviderKind::Archive,
            Some(self.product_id),
            self.package_md5.as_deref().unwrap_or(""),
            self.manifest_files.clone(),
        ))
    }

    fn cleanup(&mut self) {
        for temp in self.temps.drain(..) {
            if let Err(e) = fs::remove_file(&temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %temp.display(), error = %e, "Failed to remove temp package");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip_index::test_support::build_zip;
    use tempfile::TempDir;

    fn entries(files: &[(&str, &[u8], bool)]) -> Vec<ZipEntry> {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pkg.zip");
        fs::write(&path, build_zip(files)).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(list_entries(&LocalZipFile::new(&path))).unwrap()
    }

    fn paths(actions: &[Action]) -> Vec<(ActionKind, &str)> {
        actions
            .iter()
            .map(|a| (a.kind, a.relative_path.as_str()))
            .collect()
    }

    #[test]
    fn test_compare_scenario() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::write(root.join("a.txt"), b"old").unwrap();
        fs::write(root.join("c.txt"), b"c").unwrap();

        let listed = entries(&[("a.txt", &b"new"[..], true), ("b.txt", &b"b"[..], false)]);
        let previous = vec!["a.txt".to_string(), "c.txt".to_string()];
        let ignore = IgnoreRules::compile::<&str>(&[]);
        let comparison = EntryComparison {
            root,
            package_name: "Plane",
            fresh: false,
            ignore: &ignore,
            previous_files: Some(&previous),
        };
        let mut warnings = Vec::new();
        let outcome = comparison.run(&listed, &mut warnings).unwrap();

        assert_eq!(
            paths(&outcome.actions),
            vec![
                (ActionKind::Delete, "c.txt"),
                (ActionKind::Update, "a.txt"),
                (ActionKind::Update, "b.txt"),
            ]
        );
        assert_eq!(outcome.manifest_files, vec!["a.txt", "b.txt"]);
        assert_eq!(outcome.compared, 2);
        let update = &outcome.actions[1];
        assert_eq!(update.hash.as_deref(), Some(format_crc32(crc32fast::hash(b"new")).as_str()));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_matching_files_produce_no_actions() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("dir")).unwrap();
        fs::write(root.join("dir/a.txt"), b"same").unwrap();

        let listed = entries(&[("dir/", &b""[..], false), ("dir/a.txt", &b"same"[..], true)]);
        let ignore = IgnoreRules::compile::<&str>(&[]);
        let comparison = EntryComparison {
            root,
            package_name: "Plane",
            fresh: false,
            ignore: &ignore,
            previous_files: None,
        };
        let outcome = comparison.run(&listed, &mut Vec::new()).unwrap();
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.manifest_files, vec!["dir/a.txt"]);

        let fresh = EntryComparison {
            fresh: true,
            ..comparison
        };
        let outcome = fresh.run(&listed, &mut Vec::new()).unwrap();
        assert_eq!(paths(&outcome.actions), vec![(ActionKind::Update, "dir/a.txt")]);
    }

    #[test]
    fn test_ignore_rules_skip_updates_and_deletes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let listed = entries(&[("liveries/a.png", &b"a"[..], false), ("b.txt", &b"b"[..], false)]);
        let previous = vec!["liveries/old.png".to_string()];
        let ignore = IgnoreRules::compile(&["liveries/"]);
        let comparison = EntryComparison {
            root,
            package_name: "Plane",
            fresh: false,
            ignore: &ignore,
            previous_files: Some(&previous),
        };
        let outcome = comparison.run(&listed, &mut Vec::new()).unwrap();
        assert_eq!(paths(&outcome.actions), vec![(ActionKind::Update, "b.txt")]);
        assert_eq!(outcome.ignored, 1);
        assert_eq!(outcome.manifest_files, vec!["b.txt"]);
    }

    #[test]
    fn test_unsafe_entries_are_skipped() {
        let temp = TempDir::new().unwrap();
        let listed = entries(&[("../evil.txt", &b"x"[..], false), ("ok.txt", &b"ok"[..], false)]);
        let ignore = IgnoreRules::compile::<&str>(&[]);
        let comparison = EntryComparison {
            root: temp.path(),
            package_name: "Plane",
            fresh: false,
            ignore: &ignore,
            previous_files: None,
        };
        let mut warnings = Vec::new();
        let outcome = comparison.run(&listed, &mut warnings).unwrap();
        assert_eq!(paths(&outcome.actions), vec![(ActionKind::Update, "ok.txt")]);
        assert_eq!(warnings.len(), 1);
        assert!(!temp.path().parent().unwrap().join("evil.txt").exists());
    }

    #[test]
    fn test_header_candidates() {
        assert_eq!(header_candidates(None).len(), 1);
        let with_token = header_candidates(Some("tok"));
        assert_eq!(with_token.len(), 2);
        assert_eq!(with_token[1].get(AUTHORIZATION).unwrap(), "tok");
    }
}
