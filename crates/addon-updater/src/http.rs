//! HTTP plumbing shared by both providers.
//!
//! Wraps a `reqwest` client with:
//! - Per-call deadlines composed with the caller's cancellation token
//! - Byte-range and suffix-range reads that insist on `206 Partial Content`
//! - Streaming downloads that hash while writing and report throttled progress

use std::fs::File;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_RANGE, RANGE};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::error::UpdateError;
use crate::install::InstallControl;

/// Longest response body kept in an `Http` error.
const ERROR_BODY_LIMIT: usize = 400;

/// Run `fut` under a deadline, aborting early if `cancel` fires.
pub async fn guarded<F, T>(
    fut: F,
    url: &str,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<T, UpdateError>
where
    F: Future<Output = Result<T, UpdateError>>,
{
    guarded_until(fut, url, TokioInstant::now() + timeout, timeout, cancel).await
}

/// [`guarded`] against an absolute deadline; `timeout` is only reported.
async fn guarded_until<F, T>(
    fut: F,
    url: &str,
    deadline: TokioInstant,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<T, UpdateError>
where
    F: Future<Output = Result<T, UpdateError>>,
{
    let timed = tokio::time::timeout_at(deadline, fut);
    let outcome = match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => return Err(UpdateError::Cancelled),
                outcome = timed => outcome,
            }
        }
        None => timed.await,
    };
    match outcome {
        Ok(result) => result,
        Err(_) => Err(UpdateError::Timeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub text: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body parsed as JSON, or `None` for empty or non-JSON bodies.
    pub fn json_value(&self) -> Option<serde_json::Value> {
        if self.text.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&self.text).ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, UpdateError> {
        Ok(serde_json::from_str(&self.text)?)
    }

    /// Convert a non-2xx response into an `Http` error.
    pub fn error_for_status(self) -> Result<Self, UpdateError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(UpdateError::Http {
                status: self.status,
                body: truncate_body(&self.text),
            })
        }
    }
}

pub fn truncate_body(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= ERROR_BODY_LIMIT {
        return trimmed.to_string();
    }
    let mut end = ERROR_BODY_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// Receiver of byte-level download progress.
#[async_trait]
pub trait ByteProgress: Send + Sync {
    async fn on_bytes(&self, downloaded: u64, total: Option<u64>);
}

/// Result of a streamed download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub bytes: u64,
    /// MD5 computed while streaming
    pub md5: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

/// Parameters for [`HttpClient::download_to_file`].
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub headers: HeaderMap,
    /// Overall deadline; time spent paused does not count against it
    pub timeout: Duration,
    /// Cancellation and pause between chunks
    pub control: Option<&'a InstallControl>,
    pub progress: Option<&'a dyn ByteProgress>,
}

/// Shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// Client that surfaces redirects instead of following them
    no_redirect: reqwest::Client,
    progress_interval: Duration,
}

impl HttpClient {
    /// Build the client pair from network settings.
    pub fn new(config: &NetworkConfig, progress_interval: Duration) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(&config.user_agent)
            .build()?;
        let no_redirect = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            no_redirect,
            progress_interval,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn no_redirect(&self) -> &reqwest::Client {
        &self.no_redirect
    }

    /// Send a request and read the whole body as text.
    ///
    /// Non-2xx statuses are returned, not raised; callers decide.
    pub async fn send(
        &self,
        request: RequestBuilder,
        url: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<HttpResponse, UpdateError> {
        guarded(
            async {
                let response = request.send().await?;
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                let text = response.text().await?;
                Ok(HttpResponse {
                    status,
                    headers,
                    text,
                })
            },
            url,
            timeout,
            cancel,
        )
        .await
    }

    /// GET a URL and parse a successful JSON body.
    pub async fn get_json(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<serde_json::Value, UpdateError> {
        let request = self.client.get(url).headers(headers);
        let response = self
            .send(request, url, timeout, cancel)
            .await?
            .error_for_status()?;
        response.json()
    }

    /// Fetch `bytes=start-end` (inclusive).
    ///
    /// # Errors
    ///
    /// `RangeUnsupported` when the server answers anything but 206.
    pub async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        headers: &HeaderMap,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Bytes, UpdateError> {
        let (bytes, _) = self
            .range_request(url, format!("bytes={}-{}", start, end), headers, timeout, cancel)
            .await?;
        Ok(bytes)
    }

    /// Fetch the last `len` bytes (`bytes=-len`, at least 1024).
    ///
    /// Returns the bytes and the total object size from `Content-Range`.
    pub async fn fetch_suffix_range(
        &self,
        url: &str,
        len: u64,
        headers: &HeaderMap,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(Bytes, Option<u64>), UpdateError> {
        let len = len.max(1024);
        self.range_request(url, format!("bytes=-{}", len), headers, timeout, cancel)
            .await
    }

    async fn range_request(
        &self,
        url: &str,
        range: String,
        headers: &HeaderMap,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(Bytes, Option<u64>), UpdateError> {
        debug!(url, range = %range, "Range request");
        let request = self
            .client
            .get(url)
            .headers(headers.clone())
            .header(RANGE, range)
            .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        guarded(
            async {
                let response = request.send().await?;
                let status = response.status();
                if status != StatusCode::PARTIAL_CONTENT {
                    return Err(UpdateError::RangeUnsupported {
                        status: status.as_u16(),
                    });
                }
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total);
                let bytes = response.bytes().await?;
                Ok((bytes, total))
            },
            url,
            timeout,
            cancel,
        )
        .await
    }

    /// Total object size via `HEAD` Content-Length, else a `bytes=0-0` probe.
    pub async fn probe_download_size(
        &self,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Option<u64> {
        let head = self.client.head(url).headers(headers.clone());
        if let Ok(response) = self.send(head, url, timeout, cancel).await {
            if response.is_success() {
                if let Some(len) = response
                    .header("content-length")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .filter(|len| *len > 0)
                {
                    return Some(len);
                }
            }
        }
        self.range_request(url, "bytes=0-0".to_string(), headers, timeout, cancel)
            .await
            .ok()
            .and_then(|(_, total)| total)
    }

    /// Whether a download URL answers a `bytes=0-0` probe with 200, 206 or 3xx.
    pub async fn probe_url_ok(
        &self,
        url: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        let request = self
            .no_redirect
            .get(url)
            .header(RANGE, "bytes=0-0")
            .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        let probe = guarded(
            async {
                let response = request.send().await?;
                Ok(response.status().as_u16())
            },
            url,
            timeout,
            cancel,
        )
        .await;
        match probe {
            Ok(status) => status == 200 || status == 206 || (300..400).contains(&status),
            Err(e) => {
                debug!(url, error = %e, "Download probe failed");
                false
            }
        }
    }

    /// Stream a URL to `dest`, hashing as it goes.
    ///
    /// The job's control is checked between chunks, so a pause parks the
    /// transfer mid-body. The partial file is removed on any failure,
    /// including cancellation.
    pub async fn download_to_file(
        &self,
        request: DownloadRequest<'_>,
    ) -> Result<DownloadOutcome, UpdateError> {
        let dest = request.dest;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let started = Instant::now();
        let url = request.url;
        match self.stream_to_file(request).await {
            Ok(outcome) => {
                info!(
                    url,
                    bytes = outcome.bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Download complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                let _ = std::fs::remove_file(dest);
                Err(e)
            }
        }
    }

    async fn stream_to_file(&self, request: DownloadRequest<'_>) -> Result<DownloadOutcome, UpdateError> {
        let DownloadRequest {
            url,
            dest,
            headers,
            timeout,
            control,
            progress,
        } = request;
        let cancel = control.map(InstallControl::token);
        let mut deadline = TokioInstant::now() + timeout;

        let send = self
            .client
            .get(url)
            .headers(headers)
            .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"))
            .send();
        let response =
            guarded_until(async { send.await.map_err(UpdateError::from) }, url, deadline, timeout, cancel)
                .await?;

        let status = response.status();
        if !status.is_success() {
            let body = guarded_until(
                async { Ok(response.text().await.unwrap_or_default()) },
                url,
                deadline,
                timeout,
                cancel,
            )
            .await?;
            return Err(UpdateError::Http {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let total = response.content_length().filter(|len| *len > 0);
        let content_type = header_string(response.headers(), "content-type");
        let content_encoding = header_string(response.headers(), "content-encoding");

        let mut file = File::create(dest)?;
        let mut hasher = Md5::new();
        let mut downloaded: u64 = 0;
        let mut last_report: Option<Instant> = None;

        let mut stream = response.bytes_stream();
        loop {
            let next = guarded_until(
                async { Ok::<_, UpdateError>(stream.next().await) },
                url,
                deadline,
                timeout,
                cancel,
            )
            .await?;
            let Some(chunk_result) = next else {
                break;
            };
            let chunk = chunk_result.map_err(|e| UpdateError::Network(e.to_string()))?;
            file.write_all(&chunk)?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if let Some(progress) = progress {
                let due = last_report
                    .map(|at| at.elapsed() >= self.progress_interval)
                    .unwrap_or(true);
                if due {
                    progress.on_bytes(downloaded, total).await;
                    last_report = Some(Instant::now());
                }
            }

            if let Some(control) = control {
                let parked = TokioInstant::now();
                control.checkpoint().await?;
                deadline += parked.elapsed();
            }
        }
        file.flush()?;

        if let Some(progress) = progress {
            progress.on_bytes(downloaded, total.or(Some(downloaded))).await;
        }

        Ok(DownloadOutcome {
            bytes: downloaded,
            md5: hex::encode(hasher.finalize()),
            content_type,
            content_encoding,
        })
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total size from a `Content-Range: bytes a-b/total` value.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}
