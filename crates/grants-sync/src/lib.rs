//! One-shot export pipeline: fetch, store raw, clean, store cleaned.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use grants_clean::{clean_export_file, clean_records, extract_records, CleanReport};
use grants_core::{SearchPayload, DEFAULT_SEARCH_URL};
use grants_storage::{
    ExportPaths, ExportStore, HttpClientConfig, HttpFetcher, RequestTimeouts, RetryPolicy,
    CLEANED_INDENT, RAW_INDENT,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "grants-sync";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_url: String,
    pub out_dir: PathBuf,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_retries: usize,
    pub backoff_factor: f64,
    pub rows: u32,
    pub opp_statuses: String,
    pub keyword: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_url: lookup("GRANTS_API_URL").unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            out_dir: lookup("GRANTS_OUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("grants_exports")),
            user_agent: lookup("GRANTS_USER_AGENT")
                .unwrap_or_else(|| "grants-exporter/0.1 (data-fetcher)".to_string()),
            connect_timeout_secs: parse_var(&lookup, "GRANTS_HTTP_CONNECT_TIMEOUT_SECS")
                .unwrap_or(15),
            read_timeout_secs: parse_var(&lookup, "GRANTS_HTTP_READ_TIMEOUT_SECS").unwrap_or(500),
            max_retries: parse_var(&lookup, "GRANTS_MAX_RETRIES").unwrap_or(5),
            backoff_factor: parse_var(&lookup, "GRANTS_BACKOFF_FACTOR").unwrap_or(1.0),
            rows: parse_var(&lookup, "GRANTS_ROWS").unwrap_or(5000),
            opp_statuses: lookup("GRANTS_OPP_STATUSES")
                .unwrap_or_else(|| "forecasted|posted".to_string()),
            keyword: lookup("GRANTS_KEYWORD").filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeouts: RequestTimeouts {
                connect: Duration::from_secs(self.connect_timeout_secs),
                read: Duration::from_secs(self.read_timeout_secs),
            },
            user_agent: self.user_agent.clone(),
            retry: RetryPolicy::new(self.max_retries, self.backoff_factor),
            ..HttpClientConfig::default()
        }
    }

    pub fn search_payload(&self) -> SearchPayload {
        SearchPayload {
            keyword: self.keyword.clone(),
            rows: Some(self.rows),
            opp_statuses: Some(self.opp_statuses.clone()),
            ..SearchPayload::default()
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_path: PathBuf,
    pub cleaned_path: PathBuf,
    pub raw_bytes: usize,
    pub cleaned_bytes: usize,
    pub report: CleanReport,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: ExportStore,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = ExportStore::new(config.out_dir.clone());
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            store,
            http,
        })
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let paths = self.store.export_paths(started_at);
        let span = info_span!("sync_run", stamp = %paths.stamp);
        self.export(started_at, &paths).instrument(span).await
    }

    async fn export(
        &self,
        started_at: DateTime<Utc>,
        paths: &ExportPaths,
    ) -> Result<SyncRunSummary> {
        let payload = self.config.search_payload();
        info!(url = %self.config.api_url, rows = self.config.rows, "fetching grants");
        let response = self
            .http
            .fetch_grants(&self.config.api_url, &payload)
            .await
            .with_context(|| format!("fetching grants from {}", self.config.api_url))?;

        let raw = self
            .store
            .write_json(&paths.raw, &response, RAW_INDENT)
            .await?;
        info!(path = %raw.path.display(), bytes = raw.byte_size, "saved raw export");

        let records = extract_records(&response).context("reading search response")?;
        let cleaned = clean_records(&JsonValue::Array(records.clone()))
            .context("cleaning search response")?;
        let stored = self
            .store
            .write_json(&paths.cleaned, &cleaned.records, CLEANED_INDENT)
            .await?;
        info!(path = %stored.path.display(), bytes = stored.byte_size, "saved cleaned export");

        Ok(SyncRunSummary {
            started_at,
            finished_at: Utc::now(),
            raw_path: raw.path,
            cleaned_path: stored.path,
            raw_bytes: raw.byte_size,
            cleaned_bytes: stored.byte_size,
            report: cleaned.report,
        })
    }
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    SyncPipeline::new(config)?.run_once().await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env()).await
}

/// `raw.json` → `raw_cleaned.json`, beside the input.
pub fn default_cleaned_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "grants".to_string());
    input.with_file_name(format!("{stem}_cleaned.json"))
}

/// Clean an existing raw export file into `output` (or the default sibling path).
pub async fn clean_export(
    input: &Path,
    output: Option<PathBuf>,
) -> Result<(PathBuf, CleanReport)> {
    let output = output.unwrap_or_else(|| default_cleaned_path(input));
    let cleaned = clean_export_file(input)?;
    let store = ExportStore::new(
        output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    );
    let stored = store
        .write_json(&output, &cleaned.records, CLEANED_INDENT)
        .await?;
    Ok((stored.path, cleaned.report))
}
