//! Hypermedia catalog model and normalisation.
//!
//! The catalog API has shipped several payload generations. Every field is
//! accepted both plain and with an `m` prefix (`href`/`mHref`,
//! `_links`/`mLinks`), and file states arrive as numbers or text.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::{query_headers, to_header_map, CatalogStrategy};
use crate::error::UpdateError;
use crate::http::HttpClient;
use crate::paths::{is_within_root, normalize_rel_path, resolve_within_root};
use crate::plan::FileState;
use crate::profile::Options;

/// Link relation carrying a file's download URL.
pub const DATA_REL: &str = "xu:data";
/// Link relation carrying a snapshot's file list.
pub const FILES_REL: &str = "xu:files";

/// Hypermedia link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub href: String,
    /// Whether the href accepts a `since` parameter
    pub template: bool,
    pub method: String,
}

impl Link {
    fn from_value(value: &Value) -> Self {
        if !value.is_object() {
            return Self {
                method: "GET".to_string(),
                ..Self::default()
            };
        }
        let method = text(value, &["method", "mMethod"]);
        Self {
            href: text(value, &["href", "mHref"]),
            template: first(value, &["template", "mTemplate"]).is_some(),
            method: if method.is_empty() {
                "GET".to_string()
            } else {
                method.to_ascii_uppercase()
            },
        }
    }
}

pub type Links = HashMap<String, Link>;

fn links(value: &Value) -> Links {
    first(value, &["_links", "mLinks"])
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(rel, link)| (rel.clone(), Link::from_value(link)))
                .collect()
        })
        .unwrap_or_default()
}

/// One file in a snapshot listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub location: String,
    pub compressed_size: u64,
    pub real_size: u64,
    pub state: FileState,
    /// Lowercase MD5 hex
    pub hash: String,
    pub links: Links,
}

impl RemoteFile {
    pub fn from_value(value: &Value) -> Self {
        Self {
            location: text(value, &["location", "mLocation"]),
            compressed_size: number(value, &["compressedSize", "mCompressedSize"]),
            real_size: number(value, &["size", "mRealSize"]),
            state: parse_file_state(present(value, &["state", "mState"])),
            hash: text(value, &["hash", "mHash"]).to_ascii_lowercase(),
            links: links(value),
        }
    }

    pub fn data_link(&self) -> Option<&Link> {
        self.links.get(DATA_REL).filter(|link| !link.href.is_empty())
    }
}

/// Map a numeric or textual state; unknown values count as `NONE`.
pub fn parse_file_state(raw: Option<&Value>) -> FileState {
    let from_code = |code: u64| match code {
        0 => Some(FileState::None),
        1 => Some(FileState::Add),
        2 => Some(FileState::Update),
        3 => Some(FileState::Delete),
        _ => None,
    };
    let parsed = match raw {
        None | Some(Value::Null) => Some(FileState::None),
        Some(Value::Number(n)) => n.as_u64().and_then(from_code),
        Some(Value::String(s)) => {
            let upper = s.trim().to_ascii_uppercase();
            match upper.as_str() {
                "" | "NONE" => Some(FileState::None),
                "ADD" => Some(FileState::Add),
                "UPDATE" => Some(FileState::Update),
                "DELETE" => Some(FileState::Delete),
                other => other.parse::<u64>().ok().and_then(from_code),
            }
        }
        Some(_) => None,
    };
    parsed.unwrap_or_else(|| {
        debug!(state = ?raw, "Unknown file state, treating as NONE");
        FileState::None
    })
}

/// Where a product lives relative to the install root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductLocation {
    pub path: String,
    /// Marker paths whose presence detects the product
    pub detection: Vec<String>,
}

impl ProductLocation {
    fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        let detection = array(value, &["detection", "mDetection"])
            .iter()
            .map(value_to_string)
            .collect();
        Self {
            path: text(value, &["path", "mPath"]),
            detection,
        }
    }

    /// Non-blank detection markers.
    pub fn markers(&self) -> Vec<&str> {
        self.detection
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .collect()
    }

    pub fn has_markers(&self) -> bool {
        !self.markers().is_empty()
    }
}

/// A published revision of a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSnapshot {
    /// `release`, `beta`, `alpha` or a server-specific label
    pub kind: String,
    pub number: u64,
    pub short_desc: String,
    pub full_desc: String,
    pub links: Links,
}

impl CatalogSnapshot {
    fn from_value(value: &Value) -> Self {
        Self {
            kind: text(value, &["type", "mType"]).to_ascii_lowercase(),
            number: number(value, &["number", "mNumber"]),
            short_desc: text(value, &["shortDesc", "mShortDesc"]),
            full_desc: text(value, &["fullDesc", "mFullDesc"]),
            links: links(value),
        }
    }

    pub fn files_link(&self) -> Option<&Link> {
        self.links.get(FILES_REL).filter(|link| !link.href.is_empty())
    }
}

/// Catalog product with nested sub-products.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub distributor: String,
    /// Server note shown to the user (`blockMessage`)
    pub blocked: String,
    pub location: ProductLocation,
    pub snapshots: Vec<CatalogSnapshot>,
    pub sub_products: Vec<Product>,
    pub links: Links,
}

impl Product {
    pub fn from_value(value: &Value) -> Self {
        let name = text(value, &["name", "mName"]);
        Self {
            id: text(value, &["id", "mId"]),
            name: if name.is_empty() {
                "Unknown Product".to_string()
            } else {
                name
            },
            distributor: text(value, &["distributor", "mDistributor"]),
            blocked: text(value, &["blockMessage", "mBlocked"]),
            location: ProductLocation::from_value(first(value, &["location", "mLocation"])),
            snapshots: array(value, &["snapshots", "mSnapshots"])
                .iter()
                .map(CatalogSnapshot::from_value)
                .collect(),
            sub_products: array(value, &["subProducts", "mSubProducts"])
                .iter()
                .map(Product::from_value)
                .collect(),
            links: links(value),
        }
    }

    /// This product followed by every descendant, depth first.
    pub fn flatten(&self) -> Vec<&Product> {
        let mut out = Vec::new();
        let mut pending = vec![self];
        while let Some(product) = pending.pop() {
            out.push(product);
            pending.extend(product.sub_products.iter().rev());
        }
        out
    }

    /// Pick the snapshot for the requested channel.
    ///
    /// Alpha falls back to beta, beta to release, and release to the first
    /// listed snapshot. Every degradation adds a warning.
    ///
    /// # Errors
    ///
    /// `Catalog` when the product has no snapshots at all.
    pub fn pick_snapshot(
        &self,
        options: &Options,
        warnings: &mut Vec<String>,
    ) -> Result<&CatalogSnapshot, UpdateError> {
        let Some(first_listed) = self.snapshots.first() else {
            return Err(UpdateError::Catalog(format!("{} has no snapshots.", self.name)));
        };
        let by_kind = |kind: &str| self.snapshots.iter().find(|s| s.kind == kind);
        let beta = by_kind("beta");

        if options.alpha {
            if let Some(alpha) = by_kind("alpha") {
                return Ok(alpha);
            }
            warnings.push(format!(
                "Alpha requested but unavailable for {}. Using fallback.",
                self.name
            ));
            if let Some(beta) = beta {
                return Ok(beta);
            }
        }

        if options.beta {
            if let Some(beta) = beta {
                return Ok(beta);
            }
        }

        if let Some(release) = by_kind("release") {
            if options.beta {
                warnings.push(format!(
                    "Beta requested but unavailable for {}. Using release.",
                    self.name
                ));
            }
            return Ok(release);
        }

        if options.beta {
            warnings.push(format!(
                "Beta requested but unavailable for {}. Using first available snapshot.",
                self.name
            ));
        }
        warnings.push(format!(
            "Release missing for {}. Using first available snapshot.",
            self.name
        ));
        Ok(first_listed)
    }
}

/// On-disk directory for a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProductDir {
    pub dir: PathBuf,
    /// `false` when markers exist but none was found
    pub detected: bool,
}

fn resolve_optional(root: &Path, raw: &str) -> Result<PathBuf, UpdateError> {
    if raw.trim().is_empty() {
        return Ok(root.to_path_buf());
    }
    let rel = normalize_rel_path(raw)?;
    resolve_within_root(root, &rel)
}

/// Resolve a product's directory, auto-detecting it through its markers.
///
/// Without markers the configured location is used as-is. With markers,
/// each marker (and, for multi-entry lists, their joined path) is probed
/// below the configured location and then below every ancestor up to the
/// root. A found directory marker is the product dir itself; a found file
/// marker yields its parent.
pub fn resolve_product_dir(
    root: &Path,
    location: &ProductLocation,
) -> Result<ResolvedProductDir, UpdateError> {
    let base = resolve_optional(root, &location.path)?;
    let markers: Vec<String> = location
        .markers()
        .into_iter()
        .map(normalize_rel_path)
        .collect::<Result<_, _>>()?;

    if markers.is_empty() {
        return Ok(ResolvedProductDir {
            dir: base,
            detected: true,
        });
    }

    let mut candidates: Vec<String> = markers.clone();
    if markers.len() > 1 {
        candidates.push(markers.join("/"));
    }

    let find_anchor = |anchor_base: &Path| -> Result<Option<PathBuf>, UpdateError> {
        if !is_within_root(root, anchor_base) {
            return Ok(None);
        }
        for marker in &candidates {
            let candidate = resolve_within_root(anchor_base, marker)?;
            let anchor = match std::fs::metadata(&candidate) {
                Ok(meta) if meta.is_dir() => Some(candidate),
                Ok(meta) if meta.is_file() => candidate.parent().map(Path::to_path_buf),
                _ => None,
            };
            if let Some(anchor) = anchor.filter(|a| is_within_root(root, a)) {
                return Ok(Some(anchor));
            }
        }
        Ok(None)
    };

    let mut cursor = Some(base.clone());
    while let Some(dir) = cursor {
        if !is_within_root(root, &dir) {
            break;
        }
        if let Some(anchor) = find_anchor(&dir)? {
            debug!(dir = %anchor.display(), "Detected product directory");
            return Ok(ResolvedProductDir {
                dir: anchor,
                detected: true,
            });
        }
        if dir.as_path() == root {
            break;
        }
        cursor = dir.parent().map(Path::to_path_buf);
    }

    Ok(ResolvedProductDir {
        dir: base,
        detected: false,
    })
}

/// Add `since=<n>` to a templated link; untemplated links and `n == 0` pass through.
///
/// Any `{...}` URI-template expression is dropped first.
pub fn append_since_if_template(url: &str, template: bool, since: u64) -> Result<String, UpdateError> {
    if !template || since == 0 {
        return Ok(url.to_string());
    }
    let stripped = strip_template_expressions(url);
    let mut parsed = url::Url::parse(&stripped)
        .map_err(|e| UpdateError::Catalog(format!("invalid file list URL {}: {}", url, e)))?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "since")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("since", &since.to_string());
    Ok(parsed.to_string())
}

fn strip_template_expressions(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut depth = 0usize;
    for c in url.chars() {
        match c {
            '{' => depth += 1,
            '}' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Root product plus the strategy that fetched it.
#[derive(Debug, Clone)]
pub struct ProductInfo {
    pub strategy: CatalogStrategy,
    pub root: Product,
}

/// Products from a top-level array, `products` or `mProductsInfo`.
pub fn products_from_payload(payload: &Value) -> Vec<Product> {
    let list = match payload {
        Value::Array(items) => items.as_slice(),
        other => array(other, &["products", "mProductsInfo"]),
    };
    list.iter().map(Product::from_value).collect()
}

/// Fetch the product tree, trying each strategy in order.
///
/// # Errors
///
/// `Auth` listing `strategy:status` for every attempt (`ERR` for
/// transport or payload failures) when none succeeds.
pub async fn fetch_product_info(
    http: &HttpClient,
    url: &str,
    strategies: &[CatalogStrategy],
    timeout: Duration,
) -> Result<ProductInfo, UpdateError> {
    let mut results: Vec<String> = Vec::new();

    for strategy in strategies {
        let mut headers = query_headers();
        headers.extend(to_header_map(&strategy.headers));
        let attempt = async {
            let payload = http.get_json(url, headers, timeout, None).await?;
            products_from_payload(&payload)
                .into_iter()
                .next()
                .ok_or_else(|| UpdateError::Catalog("No products returned for this account.".to_string()))
        };
        match attempt.await {
            Ok(root) => {
                debug!(strategy = %strategy.name, product = %root.name, "Product info fetched");
                return Ok(ProductInfo {
                    strategy: strategy.clone(),
                    root,
                });
            }
            Err(e) => {
                let status = e
                    .status()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "ERR".to_string());
                debug!(strategy = %strategy.name, error = %e, "Catalog strategy failed");
                results.push(format!("{}:{}", strategy.name, status));
            }
        }
    }

    warn!(attempts = results.len(), "All catalog strategies failed");
    Err(UpdateError::Auth(format!(
        "Could not fetch product info. Tried {} auth strategies. Results: {}",
        results.len(),
        results.join(", ")
    )))
}

/// Fetch a snapshot's file list.
pub async fn fetch_file_list(
    http: &HttpClient,
    url: &str,
    auth_headers: &[(String, String)],
    timeout: Duration,
) -> Result<Vec<RemoteFile>, UpdateError> {
    let mut headers = query_headers();
    headers.extend(to_header_map(auth_headers));
    let payload = http.get_json(url, headers, timeout, None).await?;
    let items = match &payload {
        Value::Array(items) => items.as_slice(),
        other => {
            let Some(items) = ["files", "items", "mFiles"]
                .iter()
                .find_map(|key| other.get(*key).and_then(Value::as_array))
            else {
                return Err(UpdateError::Catalog(format!(
                    "Unexpected file list payload from {}",
                    url
                )));
            };
            items.as_slice()
        }
    };
    Ok(items.iter().map(RemoteFile::from_value).collect())
}

// Field access with loose truthiness, matching how the payloads use
// empty strings and zeros as "absent".

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn first<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| truthy(v))
}

/// First key that is present and not null.
fn present<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text(value: &Value, keys: &[&str]) -> String {
    first(value, keys).map(value_to_string).unwrap_or_default()
}

fn number(value: &Value, keys: &[&str]) -> u64 {
    match present(value, keys) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn array<'a>(value: &'a Value, keys: &[&str]) -> &'a [Value] {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
