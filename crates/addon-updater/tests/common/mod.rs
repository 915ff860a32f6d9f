//! Shared fixtures for integration tests: an in-process catalog server
//! speaking both provider protocols, plus engine and profile builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use addon_updater::verify::md5_bytes;
use addon_updater::{EngineConfig, Profile, ProviderKind, UpdateEngine};

pub const ARCHIVE_PRODUCT_ID: u64 = 42;
pub const PACKAGE_FILENAME: &str = "jet.zip";

/// One file served by the hypermedia catalog.
#[derive(Debug, Clone)]
pub struct HyperFile {
    pub location: String,
    pub state: String,
    pub content: Vec<u8>,
}

impl HyperFile {
    pub fn new(location: &str, state: &str, content: &[u8]) -> Self {
        Self {
            location: location.to_string(),
            state: state.to_string(),
            content: content.to_vec(),
        }
    }
}

/// Mutable server behaviour shared with the handlers.
pub struct MockState {
    pub hyper_files: Mutex<Vec<HyperFile>>,
    pub package: Mutex<Vec<u8>>,
    /// Declared package MD5; `None` declares the real digest
    pub declared_md5: Mutex<Option<String>>,
    /// Whether `/package.zip` honours `Range`
    pub ranges: AtomicBool,
    pub range_requests: AtomicUsize,
    pub full_downloads: AtomicUsize,
    pub data_requests: AtomicUsize,
    /// When non-zero, `/data` bodies are streamed in small chunks this far apart
    pub chunk_delay_ms: AtomicU64,
    /// Statuses returned by the hypermedia auth endpoint before it issues a token
    pub auth_script: Mutex<VecDeque<u16>>,
    pub auth_requests: AtomicUsize,
    pub catalog_requests: AtomicUsize,
    base_url: Mutex<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            hyper_files: Mutex::new(Vec::new()),
            package: Mutex::new(Vec::new()),
            declared_md5: Mutex::new(None),
            ranges: AtomicBool::new(true),
            range_requests: AtomicUsize::new(0),
            full_downloads: AtomicUsize::new(0),
            data_requests: AtomicUsize::new(0),
            chunk_delay_ms: AtomicU64::new(0),
            auth_script: Mutex::new(VecDeque::new()),
            auth_requests: AtomicUsize::new(0),
            catalog_requests: AtomicUsize::new(0),
            base_url: Mutex::new(String::new()),
        }
    }
}

impl MockState {
    pub fn set_hyper_files(&self, files: Vec<HyperFile>) {
        *self.hyper_files.lock().unwrap() = files;
    }

    pub fn set_package(&self, bytes: Vec<u8>) {
        *self.package.lock().unwrap() = bytes;
    }

    pub fn set_ranges(&self, enabled: bool) {
        self.ranges.store(enabled, Ordering::SeqCst);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        self.chunk_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn script_auth(&self, statuses: &[u16]) {
        *self.auth_script.lock().unwrap() = statuses.iter().copied().collect();
    }

    pub fn declare_md5(&self, md5: Option<&str>) {
        *self.declared_md5.lock().unwrap() = md5.map(str::to_string);
    }
}

/// Running mock server.
pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);
        *state.base_url.lock().unwrap() = base_url.clone();

        let app = Router::new()
            .route("/api/v2/service/auth/consumers", post(hyper_auth))
            .route("/api/v2/experimental/updates", get(hyper_products))
            .route("/files", get(hyper_file_list))
            .route("/data/*path", get(hyper_data))
            .route("/api/v4/login", post(archive_login))
            .route("/api/v4/companies", post(archive_companies))
            .route("/api/v4/filesUrl", post(archive_files_url))
            .route("/package.zip", get(archive_package))
            .with_state(Arc::clone(&state));

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url,
            state,
            handle,
        }
    }
}

async fn hyper_auth(State(state): State<Arc<MockState>>) -> Response {
    state.auth_requests.fetch_add(1, Ordering::SeqCst);
    let scripted = state.auth_script.lock().unwrap().pop_front();
    match scripted {
        None | Some(200) => Json(json!({ "token": "tok-123" })).into_response(),
        Some(202) => StatusCode::ACCEPTED.into_response(),
        Some(429) => (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "0")]).into_response(),
        Some(code) => {
            let status = StatusCode::from_u16(code).unwrap();
            (status, Json(json!({ "message": "denied" }))).into_response()
        }
    }
}

async fn hyper_products(State(state): State<Arc<MockState>>) -> Json<Value> {
    state.catalog_requests.fetch_add(1, Ordering::SeqCst);
    Json(json!([{
        "id": "plane",
        "name": "Plane",
        "distributor": "Studio",
        "location": { "path": "" },
        "snapshots": [
            { "type": "release", "number": 3, "_links": { "xu:files": { "href": "/files" } } }
        ]
    }]))
}

async fn hyper_file_list(State(state): State<Arc<MockState>>) -> Json<Value> {
    let files: Vec<Value> = state
        .hyper_files
        .lock()
        .unwrap()
        .iter()
        .map(|file| {
            json!({
                "location": file.location,
                "size": file.content.len(),
                "compressedSize": 0,
                "state": file.state,
                "hash": md5_bytes(&file.content),
                "_links": { "xu:data": { "href": format!("/data/{}", file.location) } }
            })
        })
        .collect();
    Json(json!({ "files": files }))
}

/// Bytes per chunk of a slow `/data` body.
const SLOW_CHUNK: usize = 4;

async fn hyper_data(State(state): State<Arc<MockState>>, UrlPath(path): UrlPath<String>) -> Response {
    state.data_requests.fetch_add(1, Ordering::SeqCst);
    let content = {
        let files = state.hyper_files.lock().unwrap();
        match files.iter().find(|f| f.location == path) {
            Some(file) => file.content.clone(),
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    };
    let delay = state.chunk_delay_ms.load(Ordering::SeqCst);
    if delay == 0 {
        return (StatusCode::OK, content).into_response();
    }

    let chunks: Vec<Vec<u8>> = content.chunks(SLOW_CHUNK).map(<[u8]>::to_vec).collect();
    let body = futures_util::stream::unfold(chunks.into_iter(), move |mut chunks| async move {
        let chunk = chunks.next()?;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Some((Ok::<_, std::io::Error>(chunk), chunks))
    });
    (StatusCode::OK, Body::from_stream(body)).into_response()
}

async fn archive_login(Json(body): Json<Value>) -> Response {
    if body.get("password").and_then(Value::as_str) == Some("secret") {
        Json(json!({ "token": "arch-token" })).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "message": "bad credentials" }))).into_response()
    }
}

async fn archive_companies() -> Json<Value> {
    Json(json!({
        "companies": [{
            "name": "Studio",
            "products": [
                { "id": ARCHIVE_PRODUCT_ID, "name": "Jet", "purchased": true },
                { "id": 7, "name": "Glider" }
            ]
        }]
    }))
}

async fn archive_files_url(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if body.get("productId").and_then(Value::as_u64) != Some(ARCHIVE_PRODUCT_ID) {
        return (StatusCode::FORBIDDEN, Json(json!({ "message": "not owned" }))).into_response();
    }
    let base_url = state.base_url.lock().unwrap().clone();
    let md5 = state
        .declared_md5
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| md5_bytes(&state.package.lock().unwrap()));
    Json(json!({
        "url": format!("{}/package.zip", base_url),
        "filename": PACKAGE_FILENAME,
        "productId": ARCHIVE_PRODUCT_ID,
        "filesIntegrityHash": md5,
    }))
    .into_response()
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    if total == 0 {
        return None;
    }
    if start.is_empty() {
        let len: u64 = end.parse().ok()?;
        return Some((total.saturating_sub(len), total - 1));
    }
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        total - 1
    } else {
        end.parse::<u64>().ok()?.min(total - 1)
    };
    (start <= end).then_some((start, end))
}

async fn archive_package(
    State(state): State<Arc<MockState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let body = state.package.lock().unwrap().clone();
    let total = body.len() as u64;
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    if let Some(range) = range {
        if state.ranges.load(Ordering::SeqCst) {
            state.range_requests.fetch_add(1, Ordering::SeqCst);
            return match parse_range(range, total) {
                Some((start, end)) => (
                    StatusCode::PARTIAL_CONTENT,
                    [(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))],
                    body[start as usize..=end as usize].to_vec(),
                )
                    .into_response(),
                None => (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", total))],
                )
                    .into_response(),
            };
        }
    } else if method != Method::HEAD {
        state.full_downloads.fetch_add(1, Ordering::SeqCst);
    }
    (StatusCode::OK, body).into_response()
}

/// Build a ZIP package; `true` entries are deflated.
pub fn build_zip(files: &[(&str, &[u8], bool)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents, deflate) in files {
        let method = if *deflate {
            zip::CompressionMethod::Deflated
        } else {
            zip::CompressionMethod::Stored
        };
        writer
            .start_file(*name, zip::write::FileOptions::default().compression_method(method))
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Engine with state and temp dirs inside `temp`.
pub fn engine(temp: &TempDir) -> UpdateEngine {
    engine_with(temp, |_| {})
}

pub fn engine_with(temp: &TempDir, tweak: impl FnOnce(&mut EngineConfig)) -> UpdateEngine {
    let mut config = EngineConfig {
        state_dir: Some(temp.path().join("state")),
        temp_dir: Some(temp.path().join("tmp")),
        ..EngineConfig::default()
    };
    config.network.auth_timeout_secs = 5;
    tweak(&mut config);
    UpdateEngine::new(config).unwrap()
}

pub fn hypermedia_profile(server: &MockServer, root: &Path) -> Profile {
    Profile {
        id: "hyper-profile".to_string(),
        name: "Plane".to_string(),
        host: server.base_url.clone(),
        product_dir: root.to_path_buf(),
        login: "pilot".to_string(),
        license_key: "KEY-1".to_string(),
        provider: ProviderKind::Hypermedia,
        ..Profile::default()
    }
}

pub fn archive_profile(server: &MockServer, root: &Path) -> Profile {
    Profile {
        id: "archive-profile".to_string(),
        name: "Jet".to_string(),
        host: server.base_url.clone(),
        product_dir: root.to_path_buf(),
        login: "pilot@example.com".to_string(),
        password: "secret".to_string(),
        provider: ProviderKind::Archive,
        product_id: Some(ARCHIVE_PRODUCT_ID),
        ..Profile::default()
    }
}

/// Write `files` under `root`, creating parents.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, bytes) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }
}

/// Relative path and bytes of every file under `root`.
pub fn read_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    addon_updater::paths::collect_files(root)
        .unwrap()
        .into_iter()
        .map(|rel| {
            let bytes = std::fs::read(root.join(&rel)).unwrap();
            (rel, bytes)
        })
        .collect()
}
