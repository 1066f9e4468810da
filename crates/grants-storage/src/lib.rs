//! Export file storage + HTTP fetch utilities for the grants exporter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, ORIGIN, REFERER, RETRY_AFTER, USER_AGENT,
};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grants-storage";

pub const RAW_INDENT: usize = 2;
pub const CLEANED_INDENT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    pub stamp: String,
    pub raw: PathBuf,
    pub cleaned: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredExport {
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Output directory holding `grants_<stamp>.json` and `grants_<stamp>_cleaned.json` pairs.
#[derive(Debug, Clone)]
pub struct ExportStore {
    root: PathBuf,
}

impl ExportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn export_stamp(at: DateTime<Utc>) -> String {
        at.format("%Y%m%dT%H%M%SZ").to_string()
    }

    pub fn export_paths(&self, at: DateTime<Utc>) -> ExportPaths {
        let stamp = Self::export_stamp(at);
        ExportPaths {
            raw: self.root.join(format!("grants_{stamp}.json")),
            cleaned: self.root.join(format!("grants_{stamp}_cleaned.json")),
            stamp,
        }
    }

    /// Pretty-print `value` and write it to `path`.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
        indent_width: usize,
    ) -> anyhow::Result<StoredExport> {
        let bytes = grants_core::to_pretty_json(value, indent_width)
            .with_context(|| format!("serializing {}", path.display()))?;
        self.write_bytes(path, &bytes).await
    }

    /// Write bytes through a temp file in the target directory, then rename into place.
    pub async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<StoredExport> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating export directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
        let written = write_temp_file(&mut file, &temp_path, bytes).await;
        drop(file);
        discard_temp_on_error(&temp_path, written).await?;

        let renamed = fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "renaming temp export {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
        discard_temp_on_error(&temp_path, renamed).await?;

        Ok(StoredExport {
            path: path.to_path_buf(),
            byte_size: bytes.len(),
        })
    }
}

async fn write_temp_file(
    file: &mut fs::File,
    temp_path: &Path,
    bytes: &[u8],
) -> anyhow::Result<()> {
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp export file {}", temp_path.display()))
}

/// Removes the temp file when `result` is an error, so failed writes leave nothing behind.
async fn discard_temp_on_error<T>(
    temp_path: &Path,
    result: anyhow::Result<T>,
) -> anyhow::Result<T> {
    if result.is_err() {
        let _ = fs::remove_file(temp_path).await;
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Transport-level retry configuration applied to every POST.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt, shared by connect, read and status failures.
    pub max_retries: usize,
    /// Seconds; retry `n` (0-based) waits `backoff_factor * 2^n`.
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub retry_statuses: Vec<StatusCode>,
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 1.0)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_factor,
            max_backoff: Duration::from_secs(120),
            retry_statuses: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
            respect_retry_after: true,
        }
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retry_statuses.contains(&status)
    }

    pub fn delay_for_retry(&self, retry_index: usize) -> Duration {
        if self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let secs = self.backoff_factor * 2f64.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }

    /// Backoff for a retryable response. The server's `Retry-After` hint wins, but only
    /// on 413, 429 and 503.
    pub fn delay_for_response(
        &self,
        retry_index: usize,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Duration {
        if self.respect_retry_after && RETRY_AFTER_STATUSES.contains(&status) {
            if let Some(hint) = parse_retry_after(headers, Utc::now()) {
                return hint.min(self.max_backoff);
            }
        }
        self.delay_for_retry(retry_index)
    }
}

pub const RETRY_AFTER_STATUSES: [StatusCode; 3] = [
    StatusCode::PAYLOAD_TOO_LARGE,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::SERVICE_UNAVAILABLE,
];

/// `Retry-After` as delta-seconds or an HTTP-date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    pub connect: Duration,
    /// The export endpoint is slow for large row counts.
    pub read: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            read: Duration::from_secs(500),
        }
    }
}

/// One candidate header set for the search POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderVariant {
    pub name: &'static str,
    pub accept: &'static str,
    pub origin: Option<&'static str>,
    pub referer: Option<&'static str>,
}

impl HeaderVariant {
    fn header_map(&self, user_agent: &HeaderValue) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(self.accept));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, user_agent.clone());
        if let Some(origin) = self.origin {
            headers.insert(ORIGIN, HeaderValue::from_static(origin));
        }
        if let Some(referer) = self.referer {
            headers.insert(REFERER, HeaderValue::from_static(referer));
        }
        headers
    }
}

/// Tried in order; a later variant is used only when the previous one was rejected.
pub const HEADER_VARIANTS: [HeaderVariant; 2] = [
    HeaderVariant {
        name: "minimal",
        accept: "application/json",
        origin: None,
        referer: None,
    },
    HeaderVariant {
        name: "browser",
        accept: "application/json, text/plain, */*",
        origin: Some("https://www.grants.gov"),
        referer: Some("https://www.grants.gov/"),
    },
];

/// Statuses meaning the server refused our headers rather than the request.
pub const HEADER_REJECTION_STATUSES: [StatusCode; 3] = [
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
    StatusCode::UNSUPPORTED_MEDIA_TYPE,
];

pub const ERROR_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeouts: RequestTimeouts,
    pub user_agent: String,
    pub pool_max_idle_per_host: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeouts: RequestTimeouts::default(),
            user_agent: "grants-exporter/0.1 (data-fetcher)".to_string(),
            pool_max_idle_per_host: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn with_retries(max_retries: usize, backoff_factor: f64) -> Self {
        Self {
            retry: RetryPolicy::new(max_retries, backoff_factor),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http {status} with {variant} headers; no header variants left")]
    HeadersRejected { status: u16, variant: &'static str },
    #[error("http {status} error from server: {snippet}")]
    HttpStatus { status: u16, snippet: String },
    #[error("response was not valid JSON: {0}")]
    InvalidResponse(#[source] serde_json::Error),
    #[error("no header variants configured")]
    NoHeaderVariants,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: HeaderValue,
    variants: Vec<HeaderVariant>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    /// Connect and read timeouts come from `config.timeouts` and apply to every request
    /// this fetcher sends, across all header variants and retries.
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.timeouts.connect)
            .read_timeout(config.timeouts.read)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .context("building reqwest client")?;
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .with_context(|| format!("invalid user agent {:?}", config.user_agent))?;

        Ok(Self {
            client,
            user_agent,
            variants: HEADER_VARIANTS.to_vec(),
            retry: config.retry,
        })
    }

    pub fn with_variants(mut self, variants: Vec<HeaderVariant>) -> Self {
        self.variants = variants;
        self
    }

    /// POST the payload and return the parsed JSON body of a successful response.
    pub async fn fetch_grants<P: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &P,
    ) -> Result<JsonValue, FetchError> {
        let resp = self.post_with_fallback(url, payload).await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                snippet: body.chars().take(ERROR_SNIPPET_CHARS).collect(),
            });
        }

        let value = serde_json::from_str(&body).map_err(FetchError::InvalidResponse)?;
        info!(bytes = body.len(), "parsed search response");
        Ok(value)
    }

    /// Try each header variant until one is not rejected; return that response as-is.
    pub async fn post_with_fallback<P: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &P,
    ) -> Result<Response, FetchError> {
        let mut last_error = None;

        for variant in &self.variants {
            let span = info_span!("http_fetch", url, variant = variant.name);
            match self.send_with_retry(url, payload, variant).instrument(span).await {
                Ok(resp) if HEADER_REJECTION_STATUSES.contains(&resp.status()) => {
                    let status = resp.status().as_u16();
                    warn!(
                        status,
                        variant = variant.name,
                        "headers rejected, trying next variant"
                    );
                    last_error = Some(FetchError::HeadersRejected {
                        status,
                        variant: variant.name,
                    });
                }
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    warn!(
                        error = %err,
                        variant = variant.name,
                        "request failed, trying next variant"
                    );
                    last_error = Some(FetchError::Transport(err));
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::NoHeaderVariants))
    }

    async fn send_with_retry<P: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &P,
        variant: &HeaderVariant,
    ) -> Result<Response, reqwest::Error> {
        let headers = variant.header_map(&self.user_agent);
        let mut retry = 0;

        loop {
            let retries_left = retry < self.retry.max_retries;
            let result = self
                .client
                .post(url)
                .headers(headers.clone())
                .json(payload)
                .send()
                .await;

            let delay = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if !(retries_left && self.retry.is_retryable_status(status)) {
                        return Ok(resp);
                    }
                    let delay = self.retry.delay_for_response(retry, status, resp.headers());
                    warn!(status = status.as_u16(), retry, ?delay, "retryable status");
                    delay
                }
                Err(err) => {
                    if !(retries_left
                        && classify_reqwest_error(&err) == RetryDisposition::Retryable)
                    {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for_retry(retry);
                    warn!(error = %err, retry, ?delay, "transport error");
                    delay
                }
            };

            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use mockito::Matcher;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::with_retries(max_retries, 0.0)).expect("fetcher")
    }

    fn payload() -> JsonValue {
        json!({"keyword": null, "rows": 10})
    }

    #[test]
    fn export_paths_share_one_utc_stamp() {
        let store = ExportStore::new("/tmp/exports");
        let at = DateTime::parse_from_rfc3339("2026-02-24T12:03:09Z")
            .expect("ts")
            .with_timezone(&Utc);
        let paths = store.export_paths(at);
        assert_eq!(paths.stamp, "20260224T120309Z");
        assert_eq!(paths.raw, PathBuf::from("/tmp/exports/grants_20260224T120309Z.json"));
        assert_eq!(
            paths.cleaned,
            PathBuf::from("/tmp/exports/grants_20260224T120309Z_cleaned.json")
        );
    }

    #[tokio::test]
    async fn write_json_creates_directory_and_uses_indent() {
        let dir = tempdir().expect("tempdir");
        let store = ExportStore::new(dir.path().join("nested/out"));
        let path = store.root().join("grants_x.json");

        let stored = store
            .write_json(&path, &json!({"records": ["Ünïcode"]}), RAW_INDENT)
            .await
            .expect("write");

        let text = std::fs::read_to_string(&stored.path).expect("read back");
        assert_eq!(text, "{\n  \"records\": [\n    \"Ünïcode\"\n  ]\n}");
        assert_eq!(stored.byte_size, text.len());
        let leftovers = std::fs::read_dir(store.root())
            .expect("list")
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let mut policy = RetryPolicy::new(5, 0.5);
        policy.max_backoff = Duration::from_secs(3);

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for_retry(400), Duration::from_secs(3));
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Tue, 24 Feb 2026 12:00:30 GMT"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(30)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Tue, 24 Feb 2026 11:00:00 GMT"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::ZERO));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let mut policy = RetryPolicy::new(2, 0.0);
        policy.max_backoff = Duration::from_secs(5);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3600"));
        assert_eq!(
            policy.delay_for_response(0, StatusCode::SERVICE_UNAVAILABLE, &headers),
            Duration::from_secs(5)
        );

        policy.respect_retry_after = false;
        assert_eq!(
            policy.delay_for_response(0, StatusCode::SERVICE_UNAVAILABLE, &headers),
            Duration::ZERO
        );
    }

    #[test]
    fn retry_after_hint_only_applies_to_throttling_statuses() {
        let policy = RetryPolicy::new(2, 0.25);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("9"));

        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE] {
            assert_eq!(
                policy.delay_for_response(1, status, &headers),
                Duration::from_secs(9)
            );
        }
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert_eq!(
                policy.delay_for_response(1, status, &headers),
                Duration::from_millis(500)
            );
        }
    }

    fn temp_files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    #[tokio::test]
    async fn failed_write_discards_temp_file() {
        let dir = tempdir().expect("tempdir");
        let temp_path = dir.path().join(".partial.tmp");
        std::fs::write(&temp_path, b"half").expect("seed temp file");

        let result: anyhow::Result<()> =
            discard_temp_on_error(&temp_path, Err(anyhow::anyhow!("disk full"))).await;

        assert!(result.is_err());
        assert!(!temp_path.exists());

        std::fs::write(&temp_path, b"whole").expect("seed temp file");
        discard_temp_on_error(&temp_path, Ok(())).await.expect("ok passes through");
        assert!(temp_path.exists());
    }

    #[tokio::test]
    async fn failed_rename_leaves_no_temp_file() {
        let dir = tempdir().expect("tempdir");
        let store = ExportStore::new(dir.path());
        let target = dir.path().join("grants_x.json");
        std::fs::create_dir(&target).expect("occupy target with a directory");
        std::fs::write(target.join("keep"), b"x").expect("non-empty dir");

        let err = store
            .write_bytes(&target, b"[]")
            .await
            .expect_err("rename onto a non-empty directory fails");

        assert!(format!("{err:#}").contains("renaming temp export"));
        assert_eq!(temp_files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn retries_transient_statuses_until_success() {
        let mut server = mockito::Server::new_async().await;
        let unavailable = server
            .mock("POST", "/search")
            .with_status(503)
            .with_header("retry-after", "0")
            .expect(2)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/search")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"oppHits":[{"OPPORTUNITY_ID":"3"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/search", server.url());
        let value = fast_fetcher(5).fetch_grants(&url, &payload()).await.expect("fetch");

        assert_eq!(value, json!({"oppHits": [{"OPPORTUNITY_ID": "3"}]}));
        unavailable.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn falls_back_to_browser_headers_when_minimal_is_forbidden() {
        let mut server = mockito::Server::new_async().await;
        let forbidden = server
            .mock("POST", "/search")
            .match_header("origin", Matcher::Missing)
            .with_status(403)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", "/search")
            .match_header("origin", "https://www.grants.gov")
            .match_header("referer", "https://www.grants.gov/")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(payload()))
            .with_status(200)
            .with_body(r#"{"oppHits":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/search", server.url());
        let value = fast_fetcher(0).fetch_grants(&url, &payload()).await.expect("fetch");

        assert_eq!(value, json!({"oppHits": []}));
        forbidden.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn every_variant_rejected_surfaces_last_rejection() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/search")
            .with_status(415)
            .expect(2)
            .create_async()
            .await;

        let url = format!("{}/search", server.url());
        let err = fast_fetcher(3).fetch_grants(&url, &payload()).await.unwrap_err();

        assert!(matches!(
            err,
            FetchError::HeadersRejected { status: 415, variant: "browser" }
        ));
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_carries_truncated_body_snippet() {
        let mut server = mockito::Server::new_async().await;
        let body = "x".repeat(ERROR_SNIPPET_CHARS + 100);
        server
            .mock("POST", "/search")
            .with_status(404)
            .with_body(&body)
            .create_async()
            .await;

        let url = format!("{}/search", server.url());
        let err = fast_fetcher(2).fetch_grants(&url, &payload()).await.unwrap_err();

        match err {
            FetchError::HttpStatus { status, snippet } => {
                assert_eq!(status, 404);
                assert_eq!(snippet.chars().count(), ERROR_SNIPPET_CHARS);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_status_as_error() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/search")
            .with_status(502)
            .with_body("bad gateway")
            .expect(2)
            .create_async()
            .await;

        let url = format!("{}/search", server.url());
        let err = fast_fetcher(1).fetch_grants(&url, &payload()).await.unwrap_err();

        assert!(matches!(
            err,
            FetchError::HttpStatus { status: 502, ref snippet } if snippet == "bad gateway"
        ));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn non_json_body_is_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/search")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let url = format!("{}/search", server.url());
        let err = fast_fetcher(0).fetch_grants(&url, &payload()).await.unwrap_err();

        assert!(matches!(err, FetchError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let err = fast_fetcher(0)
            .fetch_grants("http://127.0.0.1:9/search", &payload())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Transport(_)));
    }

    #[tokio::test]
    async fn empty_variant_list_is_an_error() {
        let fetcher = fast_fetcher(0).with_variants(Vec::new());
        let err = fetcher
            .post_with_fallback("http://127.0.0.1:9/search", &payload())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NoHeaderVariants));
    }

    enum Scripted {
        Hangup,
        Respond(u16, &'static str),
    }

    /// Plain TCP server that answers one connection per script step, in order.
    async fn scripted_server(script: Vec<Scripted>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);

        tokio::spawn(async move {
            for step in script {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut socket).await;
                log.lock().expect("request log").push(request);
                match step {
                    Scripted::Hangup => drop(socket),
                    Scripted::Respond(status, body) => {
                        let response = format!(
                            "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                            body.len()
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    }
                }
            }
        });

        (format!("http://{addr}/search"), requests)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_ascii_lowercase()
    }

    #[tokio::test]
    async fn transport_failure_moves_on_to_next_variant() {
        let (url, requests) = scripted_server(vec![
            Scripted::Hangup,
            Scripted::Respond(200, r#"{"oppHits":[]}"#),
        ])
        .await;
        let fetcher = fast_fetcher(0).with_variants(vec![
            HeaderVariant {
                name: "first",
                accept: "application/json",
                origin: None,
                referer: None,
            },
            HeaderVariant {
                name: "second",
                accept: "application/json",
                origin: Some("https://second.example"),
                referer: None,
            },
        ]);

        let value = fetcher.fetch_grants(&url, &payload()).await.expect("fetch");

        assert_eq!(value, json!({"oppHits": []}));
        let requests = requests.lock().expect("request log");
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].contains("origin:"));
        assert!(requests[1].contains("origin: https://second.example"));
    }

    #[tokio::test]
    async fn transport_and_status_failures_share_one_retry_budget() {
        let script = || {
            vec![
                Scripted::Hangup,
                Scripted::Respond(503, "busy"),
                Scripted::Respond(200, r#"{"oppHits":[{"OPPORTUNITY_ID":"9"}]}"#),
            ]
        };

        let (url, requests) = scripted_server(script()).await;
        let value = fast_fetcher(2)
            .with_variants(vec![HEADER_VARIANTS[0]])
            .fetch_grants(&url, &payload())
            .await
            .expect("two retries cover one hangup and one 503");
        assert_eq!(value, json!({"oppHits": [{"OPPORTUNITY_ID": "9"}]}));
        assert_eq!(requests.lock().expect("request log").len(), 3);

        let (url, requests) = scripted_server(script()).await;
        let err = fast_fetcher(1)
            .with_variants(vec![HEADER_VARIANTS[0]])
            .fetch_grants(&url, &payload())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(requests.lock().expect("request log").len(), 2);
    }
}
