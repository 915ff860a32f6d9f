//! Archive product discovery.
//!
//! Reads the company/product listing to find owned products and resolves
//! the signed package URL for one product by walking simulator and
//! platform candidates until the files endpoint returns a reachable URL.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::{extract_error_message, join_url};
use crate::config::ArchiveConfig;
use crate::error::UpdateError;
use crate::http::{HttpClient, HttpResponse};
use crate::plan::ProductChoice;
use crate::profile::Profile;
use crate::verify::normalize_integrity_hash_to_md5;

/// Below this many owned products the full (non-static) listing is fetched too.
const FULL_LISTING_THRESHOLD: usize = 10;

const OWNERSHIP_FLAGS: &[&str] = &["purchased", "owned", "isPurchased", "hasAccess", "has_access"];
const ORDER_KEYS: &[&str] = &["orders", "order", "userOrders", "user_orders"];
const NAME_KEYS: &[&str] = &["name", "title", "product_name", "productName", "dir_name", "dirName", "slug"];
const ID_KEYS: &[&str] = &["id", "productId", "product_id"];

/// Product listing as seen by the account.
#[derive(Debug, Clone, Default)]
pub struct CompanyListing {
    pub company_count: usize,
    pub product_count: usize,
    /// Owned products sorted by display name
    pub owned: Vec<ProductChoice>,
    /// Request failures worth surfacing as a plan warning
    pub warnings: Vec<String>,
}

impl CompanyListing {
    /// Display name of an owned product.
    pub fn name_of(&self, product_id: u64) -> Option<&str> {
        let id = product_id.to_string();
        self.owned
            .iter()
            .find(|choice| choice.id == id)
            .map(|choice| choice.name.as_str())
    }

    /// Plan warning describing the listing.
    pub fn connection_summary(&self) -> String {
        format!(
            "Archive API connection successful ({} {}, {} product(s), {} owned product(s)).",
            self.company_count,
            if self.company_count == 1 { "company" } else { "companies" },
            self.product_count,
            self.owned.len()
        )
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f > 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

fn positive(value: Option<&Value>) -> bool {
    value
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .map(|n| n > 0.0)
        .unwrap_or(false)
}

fn first_text<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Company array from any of the known response shapes.
pub fn extract_companies(payload: &Value) -> Vec<&Value> {
    if let Some(items) = payload.as_array() {
        return items.iter().filter(|c| c.is_object()).collect();
    }
    for key in ["companies", "company", "data", "result", "items"] {
        match payload.get(key) {
            Some(Value::Array(items)) => return items.iter().filter(|c| c.is_object()).collect(),
            Some(nested @ Value::Object(_)) => {
                let inner = extract_companies(nested);
                if !inner.is_empty() {
                    return inner;
                }
            }
            _ => {}
        }
    }
    Vec::new()
}

/// Positive numeric product id.
pub fn product_id(product: &Value) -> Option<u64> {
    ID_KEYS.iter().find_map(|key| {
        let value = product.get(*key)?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|id| *id > 0)
    })
}

/// Whether the account owns a product entry.
pub fn is_owned(product: &Value) -> bool {
    if OWNERSHIP_FLAGS
        .iter()
        .any(|flag| product.get(*flag).map(truthy).unwrap_or(false))
    {
        return true;
    }
    ORDER_KEYS.iter().any(|key| match product.get(*key) {
        Some(Value::Array(items)) => !items.is_empty(),
        Some(orders @ Value::Object(_)) => {
            orders
                .get("edges")
                .and_then(Value::as_array)
                .map(|edges| !edges.is_empty())
                .unwrap_or(false)
                || positive(orders.get("count"))
                || positive(orders.get("total"))
        }
        _ => false,
    })
}

/// `Company – Name (sim)` with whatever parts are present.
pub fn display_name(company: &Value, product: &Value) -> String {
    let name = first_text(product, NAME_KEYS).unwrap_or("");
    let company_name = first_text(company, &["name", "title"]).unwrap_or("");
    let simulator = first_text(product, &["simulator", "sim"]).unwrap_or("");

    let mut out = match (company_name.is_empty(), name.is_empty()) {
        (false, false) => format!("{} – {}", company_name, name),
        (true, false) => name.to_string(),
        (false, true) => company_name.to_string(),
        (true, true) => String::new(),
    };
    if !simulator.is_empty() {
        out = format!("{} ({})", out, simulator).trim().to_string();
    }
    out
}

/// Owned products across every payload, deduplicated by id.
pub fn owned_products(payloads: &[Value]) -> (usize, usize, Vec<ProductChoice>) {
    let mut by_id: HashMap<u64, String> = HashMap::new();
    let mut company_count = 0;
    let mut product_count = 0;

    for (i, payload) in payloads.iter().enumerate() {
        let companies = extract_companies(payload);
        if i == 0 {
            company_count = companies.len();
        }
        for company in companies {
            let Some(products) = company.get("products").and_then(Value::as_array) else {
                continue;
            };
            if i == 0 {
                product_count += products.len();
            }
            for product in products {
                let Some(id) = product_id(product) else {
                    continue;
                };
                if !is_owned(product) {
                    continue;
                }
                let name = display_name(company, product);
                let entry = by_id.entry(id).or_default();
                if entry.is_empty() {
                    *entry = name;
                }
            }
        }
    }

    let mut owned: Vec<ProductChoice> = by_id
        .into_iter()
        .map(|(id, name)| ProductChoice {
            id: id.to_string(),
            name,
        })
        .collect();
    owned.sort_by(|a, b| {
        let left = if a.name.is_empty() { &a.id } else { &a.name };
        let right = if b.name.is_empty() { &b.id } else { &b.name };
        left.to_lowercase().cmp(&right.to_lowercase())
    });
    (company_count, product_count, owned)
}

fn describe(response: &HttpResponse) -> String {
    let detail = extract_error_message(response);
    if detail.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        format!("HTTP {} ({})", response.status, detail)
    }
}

async fn post_authorized(
    http: &HttpClient,
    url: &str,
    authorization: &str,
    body: &Value,
    timeout: Duration,
) -> Result<HttpResponse, UpdateError> {
    let request = http
        .client()
        .post(url)
        .header("accept", "application/json")
        .header("authorization", authorization)
        .json(body);
    http.send(request, url, timeout, None).await
}

async fn fetch_company_payloads(
    http: &HttpClient,
    url: &str,
    token: &str,
    static_paths: bool,
    timeout: Duration,
) -> (Option<Value>, Vec<String>) {
    let label = if static_paths { "static" } else { "full" };
    let body = json!({ "staticPathProducts": static_paths });
    let mut warnings = Vec::new();

    let attempts = [(token.to_string(), ""), (format!("Bearer {}", token), ",bearer")];
    for (authorization, suffix) in &attempts {
        match post_authorized(http, url, authorization, &body, timeout).await {
            Ok(response) if response.is_success() => {
                if let Some(payload) = response.json_value() {
                    return (Some(payload), warnings);
                }
                warnings.push(format!("companies({}{}): invalid JSON", label, suffix));
            }
            Ok(response) => {
                warnings.push(format!("companies({}{}): {}", label, suffix, describe(&response)));
            }
            Err(e) => warnings.push(format!("companies({}{}): {}", label, suffix, e)),
        }
    }
    (None, warnings)
}

/// Fetch the company listing and collect owned products.
///
/// Listing failures are not fatal: they end up in `warnings` and the
/// listing is simply empty.
pub async fn fetch_companies(
    http: &HttpClient,
    base_url: &str,
    config: &ArchiveConfig,
    token: &str,
    timeout: Duration,
) -> CompanyListing {
    let url = join_url(base_url, &config.products_path);
    let mut payloads = Vec::new();
    let mut warnings = Vec::new();

    let (primary, primary_warnings) = fetch_company_payloads(http, &url, token, true, timeout).await;
    payloads.extend(primary);
    warnings.extend(primary_warnings);

    let (_, _, owned) = owned_products(&payloads);
    if owned.len() < FULL_LISTING_THRESHOLD {
        let (full, full_warnings) = fetch_company_payloads(http, &url, token, false, timeout).await;
        payloads.extend(full);
        warnings.extend(full_warnings);
    }

    let (company_count, product_count, owned) = owned_products(&payloads);
    debug!(company_count, product_count, owned = owned.len(), "Company listing fetched");
    CompanyListing {
        company_count,
        product_count,
        owned,
        warnings,
    }
}

/// Signed package location for one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesUrlProbe {
    pub url: String,
    pub filename: String,
    pub product_id: u64,
    /// Integrity hash exactly as the server sent it
    pub integrity_raw: String,
    /// Integrity hash normalized to MD5 hex, when recognizable
    pub md5: Option<String>,
    pub simulator: String,
    pub platform: String,
    pub size: Option<u64>,
}

impl FilesUrlProbe {
    /// Plan warnings describing the probe.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = vec![format!(
            "filesUrl probe successful for product {} ({}).",
            self.product_id,
            if self.filename.is_empty() { "package" } else { &self.filename }
        )];
        if !self.integrity_raw.is_empty() {
            match &self.md5 {
                Some(md5) => out.push(format!("Package integrity hash detected (MD5 {}).", md5)),
                None => out.push(format!(
                    "Package integrity hash could not be normalized to MD5 ({}).",
                    self.integrity_raw
                )),
            }
        }
        out
    }
}

/// Simulator named in a product name, e.g. `XPlane12`.
fn simulator_from_name(name: &str) -> Option<String> {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(|word| match word.to_ascii_lowercase().as_str() {
            "xplane12" => Some("XPlane12".to_string()),
            "xplane11" => Some("XPlane11".to_string()),
            _ => None,
        })
}

/// Simulators to try: the profile hint, then the configured list.
///
/// Always yields at least one entry; an empty string means "unspecified".
pub fn simulator_candidates(profile: &Profile, config: &ArchiveConfig) -> Vec<String> {
    let hint = profile
        .simulator
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| profile.product_name.as_deref().and_then(simulator_from_name));

    let mut out: Vec<String> = Vec::new();
    for candidate in hint.into_iter().chain(config.simulator_candidates.iter().cloned()) {
        let candidate = candidate.trim().to_string();
        if !candidate.is_empty() && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

fn host_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "linux"
    }
}

/// Platforms to try: profile or host first, then the standard list.
pub fn platform_candidates(profile: &Profile) -> Vec<String> {
    let preferred = profile
        .platform
        .as_deref()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| host_platform().to_string());

    let mut out = vec![preferred];
    for platform in ["win", "mac", "linux"] {
        if !out.iter().any(|p| p == platform) {
            out.push(platform.to_string());
        }
    }
    out
}

/// Request body for the files endpoint.
pub fn files_url_payload(
    profile: &Profile,
    token: &str,
    product_id: u64,
    simulator: &str,
    platform: &str,
) -> Value {
    let install_path = profile.product_dir.to_string_lossy().trim().to_string();
    json!({
        "token": token,
        "productId": product_id,
        "platform": platform,
        "simulator": simulator,
        "full": true,
        "is_executable": false,
        "custom_location": !install_path.is_empty(),
        "installPath": install_path,
    })
}

async fn request_files_url(
    http: &HttpClient,
    url: &str,
    payload: &Value,
    token: &str,
    timeout: Duration,
) -> Result<Value, String> {
    let mut last_error = String::new();
    for authorization in [token.to_string(), format!("Bearer {}", token)] {
        match post_authorized(http, url, &authorization, payload, timeout).await {
            Ok(response) if response.is_success() => {
                return Ok(response.json_value().unwrap_or(Value::Null));
            }
            Ok(response) => last_error = describe(&response),
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(if last_error.is_empty() {
        "filesUrl probe failed.".to_string()
    } else {
        last_error
    })
}

/// Resolves signed package URLs through the files endpoint.
pub struct FilesUrlResolver<'a> {
    pub http: &'a HttpClient,
    pub base_url: &'a str,
    pub config: &'a ArchiveConfig,
    pub api_timeout: Duration,
    pub probe_timeout: Duration,
}

impl<'a> FilesUrlResolver<'a> {
    /// Resolve a reachable package URL for `product_id`.
    ///
    /// # Errors
    ///
    /// `UpdateError::Catalog` naming the last failure when no simulator and
    /// platform combination yields an accessible URL.
    pub async fn resolve(
        &self,
        profile: &Profile,
        token: &str,
        product_id: u64,
    ) -> Result<FilesUrlProbe, UpdateError> {
        let http = self.http;
        let url = join_url(self.base_url, &self.config.files_url_path);
        let mut last_error = String::new();

        for simulator in simulator_candidates(profile, self.config) {
            for platform in platform_candidates(profile) {
                let payload = files_url_payload(profile, token, product_id, &simulator, &platform);
                let data = match request_files_url(http, &url, &payload, token, self.api_timeout).await {
                    Ok(data) => data,
                    Err(e) => {
                        debug!(product_id, simulator = %simulator, platform = %platform, error = %e, "filesUrl request failed");
                        last_error = e;
                        continue;
                    }
                };

                let text = |key: &str| {
                    data.get(key)
                        .and_then(Value::as_str)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default()
                };
                let download_url = text("url");
                if download_url.is_empty() {
                    last_error = "filesUrl returned no download URL.".to_string();
                    continue;
                }
                if !http.probe_url_ok(&download_url, self.probe_timeout, None).await {
                    last_error = "Download URL not accessible".to_string();
                    continue;
                }

                let integrity_raw = text("filesIntegrityHash");
                let md5 = normalize_integrity_hash_to_md5(&integrity_raw);
                if !integrity_raw.is_empty() && md5.is_none() {
                    warn!(product_id, hash = %integrity_raw, "Integrity hash is not an MD5 digest");
                }
                let size = http
                    .probe_download_size(&download_url, &HeaderMap::new(), self.probe_timeout, None)
                    .await;
                let probe = FilesUrlProbe {
                    filename: text("filename"),
                    product_id: data
                        .get("productId")
                        .and_then(Value::as_u64)
                        .filter(|id| *id > 0)
                        .unwrap_or(product_id),
                    url: download_url,
                    integrity_raw,
                    md5,
                    simulator,
                    platform,
                    size,
                };
                info!(
                    product_id = probe.product_id,
                    filename = %probe.filename,
                    simulator = %probe.simulator,
                    platform = %probe.platform,
                    size = ?probe.size,
                    "Package URL resolved"
                );
                return Ok(probe);
            }
        }

        Err(UpdateError::Catalog(if last_error.is_empty() {
            "filesUrl probe failed.".to_string()
        } else {
            last_error
        }))
    }
}
