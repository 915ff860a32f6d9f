//! Session negotiation against the identity endpoints.
//!
//! Neither remote API documents its auth contract precisely, so both flows
//! probe a fixed, ordered set of request shapes and header conventions and
//! stop at the first response that yields a usable credential.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{ArchiveConfig, HypermediaConfig};
use crate::error::UpdateError;
use crate::http::{truncate_body, HttpClient, HttpResponse};
use crate::profile::Profile;

/// Longest verbatim body accepted as a token.
const MAX_BODY_TOKEN_LEN: usize = 1024;

/// Bounds for `Retry-After` waits, in seconds.
const MIN_RETRY_SECS: u64 = 1;
const MAX_RETRY_SECS: u64 = 10;

/// Ordered header list used for one catalog request strategy.
pub type HeaderPairs = Vec<(String, String)>;

/// Build a `HeaderMap` from pairs, skipping values that are not valid headers.
pub fn to_header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => debug!(header = %name, "Skipping invalid header value"),
        }
    }
    map
}

/// Diagnostic headers sent with every catalog request.
pub fn query_headers() -> HeaderMap {
    let mut map = HeaderMap::new();
    let os = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);
    if let Ok(value) = HeaderValue::from_str(&os) {
        map.insert("x-addon-updater-os", value);
    }
    map
}

/// First non-empty token among the known response shapes.
pub fn extract_token(payload: &Value) -> Option<String> {
    const PATHS: [&[&str]; 9] = [
        &["token"],
        &["accessToken"],
        &["jwt"],
        &["data", "token"],
        &["data", "accessToken"],
        &["user", "token"],
        &["user", "accessToken"],
        &["result", "token"],
        &["result", "accessToken"],
    ];
    PATHS
        .iter()
        .filter_map(|path| lookup(payload, path))
        .map(value_to_trimmed)
        .find(|token| !token.is_empty())
}

/// Human-readable error detail from a failed response, at most 400 chars.
pub fn extract_error_message(response: &HttpResponse) -> String {
    match response.json_value() {
        Some(Value::Object(_)) => {
            let payload = response.json_value().unwrap_or(Value::Null);
            let candidates = [
                lookup(&payload, &["message"]),
                lookup(&payload, &["error"]).filter(|v| !v.is_object()),
                lookup(&payload, &["detail"]),
                payload
                    .get("errors")
                    .and_then(|errors| errors.get(0))
                    .and_then(|first| first.get("message")),
                lookup(&payload, &["error", "message"]),
                lookup(&payload, &["data", "message"]),
            ];
            let message = candidates
                .into_iter()
                .flatten()
                .map(value_to_trimmed)
                .find(|text| !text.is_empty())
                .map(|text| truncate_body(&text))
                .unwrap_or_default();
            message
        }
        Some(Value::String(text)) => truncate_body(&text),
        Some(_) => String::new(),
        None => truncate_body(&response.text),
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |node, key| node.get(*key))
}

fn value_to_trimmed(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn describe_failure(response: &HttpResponse) -> String {
    let detail = extract_error_message(response);
    if detail.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        format!("HTTP {} ({})", response.status, detail)
    }
}

// ============================================================================
// Hypermedia catalog
// ============================================================================

/// Outcome of the hypermedia auth handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypermediaAuth {
    /// Authorization values to try, most specific first, Basic last
    pub candidates: Vec<String>,
    pub basic: String,
}

/// `Basic base64(login:key)`.
pub fn basic_header(login: &str, key: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", login, key)))
}

fn has_scheme_prefix(raw: &str) -> bool {
    let lower = raw.to_ascii_lowercase();
    ["bearer ", "basic ", "token "]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

fn last_segment(path: &str) -> Option<&str> {
    path.split('/').filter(|s| !s.is_empty()).last()
}

/// Expand one raw credential into the header values worth trying.
///
/// - A URL yields itself, its path, its last segment, `Bearer x` and `Token x`
/// - A root-relative path yields itself, the absolute URL, and the same segment forms
/// - A bare token yields itself, `Bearer x` and `Token x`
pub fn expand_candidate(raw: &str, host: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let mut out = vec![raw.to_string()];
    let lower = raw.to_ascii_lowercase();

    let push_segment_forms = |out: &mut Vec<String>, path: &str| {
        if let Some(segment) = last_segment(path) {
            out.push(segment.to_string());
            out.push(format!("Bearer {}", segment));
            out.push(format!("Token {}", segment));
        }
    };

    if lower.starts_with("http://") || lower.starts_with("https://") {
        if let Ok(parsed) = url::Url::parse(raw) {
            let path = parsed.path().to_string();
            out.push(path.clone());
            push_segment_forms(&mut out, &path);
        }
    } else if raw.starts_with('/') {
        out.push(resolve_absolute_url(host, raw));
        push_segment_forms(&mut out, raw);
    } else if !has_scheme_prefix(raw) {
        out.push(format!("Bearer {}", raw));
        out.push(format!("Token {}", raw));
    }
    out
}

/// Resolve a catalog link against the host.
///
/// Protocol-relative links get `https:`, absolute links pass through,
/// host-like links get `https://`, anything else is appended to `host`.
pub fn resolve_absolute_url(host: &str, href: &str) -> String {
    let href = href.trim();
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{}", rest);
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return href.to_string();
    }
    if looks_like_host_path(href) {
        return format!("https://{}", href);
    }
    if href.starts_with('/') {
        format!("{}{}", host, href)
    } else {
        format!("{}/{}", host, href)
    }
}

/// `example.com/...`: a dotted host with an alphabetic TLD, then a path.
fn looks_like_host_path(href: &str) -> bool {
    let Some((host, rest)) = href.split_once('/') else {
        return false;
    };
    if rest.is_empty() || host.is_empty() {
        return false;
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return false;
    }
    match host.rsplit_once('.') {
        Some((name, tld)) => {
            !name.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
        }
        None => false,
    }
}

fn retry_after_secs(response: &HttpResponse) -> u64 {
    response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(MIN_RETRY_SECS)
        .clamp(MIN_RETRY_SECS, MAX_RETRY_SECS)
}

fn token_candidates(response: &HttpResponse) -> Vec<String> {
    let mut raw: Vec<String> = Vec::new();
    for name in ["authorization", "location"] {
        if let Some(value) = response.header(name) {
            raw.push(value.to_string());
        }
    }
    if let Some(payload @ Value::Object(_)) = response.json_value() {
        for key in ["token", "access_token", "authorization", "location"] {
            if let Some(value) = payload.get(key) {
                raw.push(value_to_trimmed(value));
            }
        }
    }
    let body = response.text.trim();
    if !body.is_empty()
        && body.len() <= MAX_BODY_TOKEN_LEN
        && !body.starts_with('{')
        && !body.starts_with('[')
        && !body.starts_with('<')
    {
        raw.push(body.to_string());
    }
    raw
}

/// Obtain credential candidates from the hypermedia auth endpoint.
///
/// The POST carries Basic credentials plus `UserName`/`Key` headers and
/// does not follow redirects. 202 and 429 are retried up to the configured
/// attempt count, honouring `Retry-After` clamped to 1-10 seconds. Any
/// other status of 400 or above is fatal.
///
/// # Errors
///
/// `UpdateError::Http` for a rejected or exhausted handshake,
/// `UpdateError::Auth` when no attempt was made.
pub async fn authorize_hypermedia(
    http: &HttpClient,
    host: &str,
    profile: &Profile,
    config: &HypermediaConfig,
    timeout: Duration,
) -> Result<HypermediaAuth, UpdateError> {
    let basic = basic_header(&profile.login, &profile.license_key);
    let url = format!("{}{}", host, config.auth_path);
    let max_attempts = config.max_auth_attempts.max(1);
    let mut statuses: Vec<u16> = Vec::new();
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let mut headers = query_headers();
        headers.extend(to_header_map(&[
            ("authorization".to_string(), basic.clone()),
            ("username".to_string(), profile.login.clone()),
            ("key".to_string(), profile.license_key.clone()),
        ]));
        let request = http.no_redirect().post(&url).headers(headers);
        let response = http.send(request, &url, timeout, None).await?;
        statuses.push(response.status);
        debug!(attempt, status = response.status, "Auth attempt");

        if response.status >= 400 && response.status != 429 {
            return Err(UpdateError::Http {
                status: response.status,
                body: truncate_body(&response.text),
            });
        }

        let mut candidates: Vec<String> = Vec::new();
        for raw in token_candidates(&response) {
            for expanded in expand_candidate(&raw, host) {
                if !candidates.contains(&expanded) {
                    candidates.push(expanded);
                }
            }
        }
        if !candidates.contains(&basic) {
            candidates.push(basic.clone());
        }

        if response.status < 400 && response.status != 202 {
            info!(
                attempts = attempt,
                candidates = candidates.len(),
                "Hypermedia authorization complete"
            );
            return Ok(HypermediaAuth { candidates, basic });
        }

        let wait = retry_after_secs(&response);
        last_error = Some(UpdateError::Http {
            status: response.status,
            body: truncate_body(&response.text),
        });
        if attempt < max_attempts {
            warn!(status = response.status, wait_secs = wait, "Auth endpoint asked to retry");
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| {
        UpdateError::Auth(format!(
            "authorization failed, status attempts: {:?}",
            statuses
        ))
    }))
}

/// One way of authenticating a catalog request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStrategy {
    pub name: String,
    pub headers: HeaderPairs,
}

/// Every candidate alone and with `UserName`/`Key`, then Basic both ways.
pub fn catalog_strategies(auth: &HypermediaAuth, profile: &Profile) -> Vec<CatalogStrategy> {
    let user_key = |value: &str| -> HeaderPairs {
        vec![
            ("authorization".to_string(), value.to_string()),
            ("username".to_string(), profile.login.clone()),
            ("key".to_string(), profile.license_key.clone()),
        ]
    };

    let mut all = Vec::new();
    for candidate in &auth.candidates {
        all.push(CatalogStrategy {
            name: "authorization-only".to_string(),
            headers: vec![("authorization".to_string(), candidate.clone())],
        });
        all.push(CatalogStrategy {
            name: "authorization-plus-userkey".to_string(),
            headers: user_key(candidate),
        });
    }
    all.push(CatalogStrategy {
        name: "basic-only".to_string(),
        headers: vec![("authorization".to_string(), auth.basic.clone())],
    });
    all.push(CatalogStrategy {
        name: "basic-plus-userkey".to_string(),
        headers: user_key(&auth.basic),
    });

    let mut unique: Vec<CatalogStrategy> = Vec::new();
    for strategy in all {
        if !unique.iter().any(|seen| seen.headers == strategy.headers) {
            unique.push(strategy);
        }
    }
    unique
}

// ============================================================================
// Archive provider
// ============================================================================

const STOREFRONT_MUTATION: &str = "mutation customerAccessTokenCreate($input: CustomerAccessTokenCreateInput!) {\n  customerAccessTokenCreate(input: $input) {\n    customerAccessToken {\n      accessToken\n      expiresAt\n    }\n    customerUserErrors {\n      code\n      field\n      message\n    }\n  }\n}";

/// Join an endpoint path onto a base URL unless it is already absolute.
pub fn join_url(base: &str, endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return endpoint.to_string();
    }
    if endpoint.starts_with('/') {
        format!("{}{}", base, endpoint)
    } else {
        format!("{}/{}", base, endpoint)
    }
}

/// Configured storefront endpoint followed by the well-known GraphQL paths on its origin.
pub fn storefront_endpoint_candidates(endpoint: &str) -> Vec<String> {
    let raw = endpoint.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let mut out = vec![raw.to_string()];
    if let Ok(parsed) = url::Url::parse(raw) {
        let origin = parsed.origin().ascii_serialization();
        for suffix in [
            "/api/graphql",
            "/api/graphql.json",
            "/api/2024-01/graphql.json",
            "/api/2025-01/graphql.json",
            "/api/unstable/graphql.json",
        ] {
            let candidate = format!("{}{}", origin, suffix);
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
    }
    out
}

/// Client for the archive provider's identity endpoints.
pub struct ArchiveAuthenticator<'a> {
    pub http: &'a HttpClient,
    pub config: &'a ArchiveConfig,
    pub base_url: &'a str,
    pub timeout: Duration,
}

impl<'a> ArchiveAuthenticator<'a> {
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        extra: &[(String, String)],
    ) -> Result<HttpResponse, UpdateError> {
        let request = self
            .http
            .client()
            .post(url)
            .header("accept", "application/json")
            .headers(to_header_map(extra))
            .json(body);
        self.http.send(request, url, self.timeout, None).await
    }

    /// Obtain an API token.
    ///
    /// Tries the storefront token plus login exchange when a storefront is
    /// configured, then the direct login payload shapes.
    ///
    /// # Errors
    ///
    /// `UpdateError::Auth` naming the last failure when no path yields a token.
    pub async fn authenticate(&self, profile: &Profile) -> Result<String, UpdateError> {
        let login = profile.login.trim();
        let secret = profile.secret();
        if login.is_empty() || secret.is_empty() {
            return Err(UpdateError::Auth(
                "credentials are missing (login/password)".to_string(),
            ));
        }

        let mut failures: Vec<String> = Vec::new();
        if let (Some(endpoint), Some(token)) = (
            self.config.storefront_url.as_deref(),
            self.config.storefront_token.as_deref(),
        ) {
            let staged = async {
                let access = self.storefront_token(endpoint, token, login, secret).await?;
                self.exchange_access_token(&access).await
            };
            match staged.await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    warn!(reason = %e, "Storefront exchange failed, trying direct login payloads");
                    failures.push(format!("storefront+exchange: {}", e));
                }
            }
        }

        let auth_url = join_url(self.base_url, &self.config.auth_path);
        let payloads = [
            json!({ "email": login, "password": secret }),
            json!({ "login": login, "password": secret }),
            json!({ "username": login, "password": secret }),
            json!({ "email": login, "licenseKey": secret }),
            json!({ "accessToken": secret }),
        ];
        for payload in &payloads {
            let response = self.post_json(&auth_url, payload, &[]).await?;
            if !response.is_success() {
                failures.push(format!("direct-auth: {}", describe_failure(&response)));
                continue;
            }
            if let Some(token) = response.json_value().as_ref().and_then(extract_token) {
                info!("Direct login accepted");
                return Ok(token);
            }
            failures.push("direct-auth: no access token returned".to_string());
        }

        let reason = failures
            .last()
            .cloned()
            .unwrap_or_else(|| "unknown error".to_string());
        Err(UpdateError::Auth(reason))
    }

    async fn storefront_token(
        &self,
        endpoint: &str,
        storefront_token: &str,
        email: &str,
        password: &str,
    ) -> Result<String, UpdateError> {
        let body = json!({
            "query": STOREFRONT_MUTATION,
            "variables": { "input": { "email": email, "password": password } }
        });
        let extra = vec![(
            "x-shopify-storefront-access-token".to_string(),
            storefront_token.to_string(),
        )];

        let mut last_error = String::new();
        for candidate in storefront_endpoint_candidates(endpoint) {
            let response = self.post_json(&candidate, &body, &extra).await?;
            if !response.is_success() {
                last_error = format!("{} via {}", describe_failure(&response), candidate);
                continue;
            }
            let payload = response.json_value().unwrap_or(Value::Null);
            let created = lookup(&payload, &["data", "customerAccessTokenCreate"]);
            if let Some(token) = created
                .and_then(|c| lookup(c, &["customerAccessToken", "accessToken"]))
                .map(value_to_trimmed)
                .filter(|t| !t.is_empty())
            {
                debug!(endpoint = %candidate, "Storefront token issued");
                return Ok(token);
            }
            let user_error = created
                .and_then(|c| c.get("customerUserErrors"))
                .and_then(|errors| errors.get(0))
                .and_then(|first| first.get("message"))
                .map(value_to_trimmed)
                .filter(|m| !m.is_empty());
            if let Some(message) = user_error {
                return Err(UpdateError::Auth(format!(
                    "storefront returned no token ({})",
                    message
                )));
            }
            last_error = format!("storefront returned no token via {}", candidate);
        }
        Err(UpdateError::Auth(if last_error.is_empty() {
            "storefront returned no token".to_string()
        } else {
            last_error
        }))
    }

    async fn exchange_access_token(&self, access_token: &str) -> Result<String, UpdateError> {
        let auth_url = join_url(self.base_url, &self.config.auth_path);

        let primary = self
            .post_json(&auth_url, &json!({ "accessToken": access_token }), &[])
            .await?;
        if primary.is_success() {
            if let Some(token) = primary.json_value().as_ref().and_then(extract_token) {
                return Ok(token);
            }
        }
        let mut last_error = if primary.is_success() {
            "no access token returned by login exchange".to_string()
        } else {
            describe_failure(&primary)
        };

        let payloads = [
            json!({ "accessToken": access_token }),
            json!({ "token": access_token }),
            json!({ "customerAccessToken": access_token }),
            json!({ "shopifyAccessToken": access_token }),
        ];
        let auth_values = [access_token.to_string(), format!("Bearer {}", access_token)];
        for payload in &payloads {
            for auth in &auth_values {
                let extra = vec![("authorization".to_string(), auth.clone())];
                let response = self.post_json(&auth_url, payload, &extra).await?;
                if !response.is_success() {
                    last_error = describe_failure(&response);
                    continue;
                }
                if let Some(token) = response.json_value().as_ref().and_then(extract_token) {
                    return Ok(token);
                }
                last_error = "no access token returned by login exchange".to_string();
            }
        }
        Err(UpdateError::Auth(last_error))
    }
}
