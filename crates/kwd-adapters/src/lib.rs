//! Volume resolver contracts + live and fixture-backed implementations.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use kwd_core::{normalize_keyword, VolumeRow};
use kwd_storage::{BasicAuth, FetchError, HttpClient, HttpClientConfig, RetryDisposition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "kwd-adapters";

/// Hard per-request keyword limit of the search-volume endpoint.
pub const DATAFORSEO_MAX_BATCH: usize = 1000;
/// Per-request seed limit of the keyword-discovery endpoint.
pub const DATAFORSEO_MAX_DISCOVERY_SEEDS: usize = 20;

const DFS_OK: u64 = 20000;
const SEARCH_VOLUME_PATH: &str = "/v3/keywords_data/google_ads/search_volume/live";
const KEYWORDS_FOR_KEYWORDS_PATH: &str = "/v3/keywords_data/google_ads/keywords_for_keywords/live";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveContext {
    pub category_id: String,
    pub location_code: u32,
    pub language_code: String,
}

/// Rows from one resolver call. `incomplete` carries the provider's complaint when
/// some tasks in the call failed but others returned data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedBatch {
    pub rows: Vec<VolumeRow>,
    pub incomplete: Option<String>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// No login/password pair available for a live resolver.
    #[error("volume resolver credentials missing: {0}")]
    MissingCredentials(String),
    /// Provider rejected the credentials.
    #[error("volume resolver rejected credentials (status {status})")]
    Unauthorized { status: u64 },
    #[error("volume resolver call timed out")]
    Timeout,
    #[error("transient volume resolver failure: {0}")]
    Transient(String),
    /// Malformed or unexpected response; retrying will not help.
    #[error("volume resolver protocol error: {0}")]
    Protocol(String),
}

impl ResolveError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ResolveError::MissingCredentials(_) | ResolveError::Unauthorized { .. }
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::Timeout | ResolveError::Transient(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::MissingCredentials(_) => "CREDENTIALS_MISSING",
            ResolveError::Unauthorized { .. } => "UNAUTHORIZED",
            ResolveError::Timeout => "TIMEOUT",
            ResolveError::Transient(_) => "TRANSIENT",
            ResolveError::Protocol(_) => "PROTOCOL",
        }
    }
}

impl From<FetchError> for ResolveError {
    fn from(err: FetchError) -> Self {
        if let FetchError::HttpStatus { status, .. } = &err {
            if err.is_auth_failure() {
                return ResolveError::Unauthorized {
                    status: u64::from(*status),
                };
            }
        }
        if err.is_timeout() {
            return ResolveError::Timeout;
        }
        match err.disposition() {
            RetryDisposition::Retryable => ResolveError::Transient(err.to_string()),
            RetryDisposition::NonRetryable => ResolveError::Protocol(err.to_string()),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    /// Reads `KWD_DFS_LOGIN` / `KWD_DFS_PASSWORD`; blank values count as absent.
    pub fn from_env() -> Option<Self> {
        let login = std::env::var("KWD_DFS_LOGIN").ok()?;
        let password = std::env::var("KWD_DFS_PASSWORD").ok()?;
        if login.trim().is_empty() || password.trim().is_empty() {
            return None;
        }
        Some(Self { login, password })
    }

    fn basic_auth(&self) -> BasicAuth {
        BasicAuth {
            login: self.login.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait VolumeResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upper bound on keywords per `resolve_batch` call.
    fn max_batch_size(&self) -> usize;

    async fn check_credentials(&self) -> Result<(), ResolveError> {
        Ok(())
    }

    async fn resolve_batch(
        &self,
        keywords: &[String],
        ctx: &ResolveContext,
    ) -> Result<ResolvedBatch, ResolveError>;

    /// Related keywords for the given seeds. Resolvers without a discovery endpoint return nothing.
    async fn discover(
        &self,
        _seeds: &[String],
        _ctx: &ResolveContext,
    ) -> Result<Vec<VolumeRow>, ResolveError> {
        Ok(Vec::new())
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(JsonValue::as_str)
}

fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(JsonValue::as_u64)
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(JsonValue::as_f64)
}

fn volume_row_from_json(item: &JsonValue) -> Option<VolumeRow> {
    let keyword = json_str(item, &["keyword"])?.trim();
    if keyword.is_empty() {
        return None;
    }
    Some(VolumeRow {
        keyword: keyword.to_string(),
        volume: json_u64(item, &["search_volume"]),
        cpc: json_f64(item, &["cpc"]),
        competition_index: json_f64(item, &["competition_index"]),
    })
}

fn status_error(code: u64, message: &str) -> ResolveError {
    match code {
        40202 | 50000..=59999 => ResolveError::Transient(format!("{code}: {message}")),
        40100..=40399 => ResolveError::Unauthorized { status: code },
        _ => ResolveError::Protocol(format!("{code}: {message}")),
    }
}

/// Extract volume rows from a keywords-data response.
///
/// Rows sit either directly under `tasks[].result[]` (search volume) or under
/// `tasks[].result[].items[]` (discovery).
pub fn parse_volume_response(value: &JsonValue) -> Result<ResolvedBatch, ResolveError> {
    if let Some(code) = json_u64(value, &["status_code"]) {
        if code != DFS_OK {
            let message = json_str(value, &["status_message"]).unwrap_or("unknown error");
            return Err(status_error(code, message));
        }
    }

    let tasks = value
        .get("tasks")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ResolveError::Protocol("response has no tasks array".into()))?;

    let mut batch = ResolvedBatch::default();
    let mut task_errors = Vec::new();
    for task in tasks {
        if let Some(code) = json_u64(task, &["status_code"]) {
            if code != DFS_OK {
                let message = json_str(task, &["status_message"]).unwrap_or("task failed");
                task_errors.push(format!("{code}: {message}"));
                continue;
            }
        }
        let Some(results) = task.get("result").and_then(JsonValue::as_array) else {
            continue;
        };
        for result in results {
            if let Some(items) = result.get("items").and_then(JsonValue::as_array) {
                batch
                    .rows
                    .extend(items.iter().filter_map(volume_row_from_json));
            } else if let Some(row) = volume_row_from_json(result) {
                batch.rows.push(row);
            }
        }
    }

    if !task_errors.is_empty() {
        if batch.rows.is_empty() && task_errors.len() == tasks.len() {
            return Err(ResolveError::Transient(task_errors.join("; ")));
        }
        batch.incomplete = Some(task_errors.join("; "));
    }
    Ok(batch)
}

#[derive(Debug, Clone)]
pub struct DataForSeoConfig {
    pub base_url: String,
    pub credentials: Option<Credentials>,
    pub max_batch_size: usize,
}

impl Default for DataForSeoConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dataforseo.com".to_string(),
            credentials: None,
            max_batch_size: DATAFORSEO_MAX_BATCH,
        }
    }
}

/// Live resolver backed by the Google Ads keywords-data endpoints.
#[derive(Debug)]
pub struct DataForSeoResolver {
    http: Arc<HttpClient>,
    config: DataForSeoConfig,
}

impl DataForSeoResolver {
    pub fn new(http: Arc<HttpClient>, config: DataForSeoConfig) -> Self {
        Self { http, config }
    }

    fn credentials(&self) -> Result<&Credentials, ResolveError> {
        self.config.credentials.as_ref().ok_or_else(|| {
            ResolveError::MissingCredentials(
                "set KWD_DFS_LOGIN and KWD_DFS_PASSWORD".to_string(),
            )
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: &JsonValue) -> Result<JsonValue, ResolveError> {
        let auth = self.credentials()?.basic_auth();
        let response = self.http.post_json(&self.url(path), body, Some(&auth)).await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| ResolveError::Protocol(format!("invalid json: {e}")))
    }
}

#[async_trait]
impl VolumeResolver for DataForSeoResolver {
    fn name(&self) -> &'static str {
        "dataforseo"
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size.clamp(1, DATAFORSEO_MAX_BATCH)
    }

    async fn check_credentials(&self) -> Result<(), ResolveError> {
        self.credentials().map(|_| ())
    }

    async fn resolve_batch(
        &self,
        keywords: &[String],
        ctx: &ResolveContext,
    ) -> Result<ResolvedBatch, ResolveError> {
        if keywords.is_empty() {
            return Ok(ResolvedBatch::default());
        }
        if keywords.len() > self.max_batch_size() {
            return Err(ResolveError::Protocol(format!(
                "batch of {} exceeds limit {}",
                keywords.len(),
                self.max_batch_size()
            )));
        }
        let body = json!([{
            "keywords": keywords,
            "location_code": ctx.location_code,
            "language_code": ctx.language_code,
        }]);
        let value = self.post(SEARCH_VOLUME_PATH, &body).await?;
        let batch = parse_volume_response(&value)?;
        debug!(
            category_id = %ctx.category_id,
            requested = keywords.len(),
            returned = batch.rows.len(),
            "search volume batch resolved"
        );
        Ok(batch)
    }

    async fn discover(
        &self,
        seeds: &[String],
        ctx: &ResolveContext,
    ) -> Result<Vec<VolumeRow>, ResolveError> {
        let mut rows = Vec::new();
        for chunk in seeds.chunks(DATAFORSEO_MAX_DISCOVERY_SEEDS) {
            let body = json!([{
                "keys": chunk,
                "location_code": ctx.location_code,
                "language_code": ctx.language_code,
            }]);
            let value = self.post(KEYWORDS_FOR_KEYWORDS_PATH, &body).await?;
            let batch = parse_volume_response(&value)?;
            if let Some(note) = &batch.incomplete {
                warn!(category_id = %ctx.category_id, note = %note, "discovery batch incomplete");
            }
            rows.extend(batch.rows);
        }
        Ok(rows)
    }
}

/// Offline volume table used for development runs and tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeFixture {
    #[serde(default)]
    pub volumes: Vec<VolumeRow>,
    /// Seed keyword -> related keywords returned by `discover`.
    #[serde(default)]
    pub discovery: HashMap<String, Vec<String>>,
}

pub fn load_volume_fixture(path: impl AsRef<Path>) -> Result<VolumeFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureResolver {
    volumes: HashMap<String, VolumeRow>,
    discovery: HashMap<String, Vec<String>>,
    max_batch_size: usize,
}

impl FixtureResolver {
    pub fn new(fixture: VolumeFixture) -> Self {
        let volumes = fixture
            .volumes
            .into_iter()
            .map(|row| (normalize_keyword(&row.keyword), row))
            .collect();
        let discovery = fixture
            .discovery
            .into_iter()
            .map(|(seed, related)| (normalize_keyword(&seed), related))
            .collect();
        Self {
            volumes,
            discovery,
            max_batch_size: DATAFORSEO_MAX_BATCH,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_volume_fixture(path)?))
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }
}

#[async_trait]
impl VolumeResolver for FixtureResolver {
    fn name(&self) -> &'static str {
        "fixture"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn resolve_batch(
        &self,
        keywords: &[String],
        _ctx: &ResolveContext,
    ) -> Result<ResolvedBatch, ResolveError> {
        let rows = keywords
            .iter()
            .filter_map(|k| self.volumes.get(&normalize_keyword(k)).cloned())
            .collect();
        Ok(ResolvedBatch {
            rows,
            incomplete: None,
        })
    }

    async fn discover(
        &self,
        seeds: &[String],
        _ctx: &ResolveContext,
    ) -> Result<Vec<VolumeRow>, ResolveError> {
        let mut rows = Vec::new();
        for seed in seeds {
            let Some(related) = self.discovery.get(&normalize_keyword(seed)) else {
                continue;
            };
            for keyword in related {
                let row = self
                    .volumes
                    .get(&normalize_keyword(keyword))
                    .cloned()
                    .unwrap_or_else(|| VolumeRow {
                        keyword: keyword.clone(),
                        volume: None,
                        cpc: None,
                        competition_index: None,
                    });
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    DataForSeo,
    Fixture,
}

impl ResolverKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dataforseo" | "dfs" => Some(ResolverKind::DataForSeo),
            "fixture" => Some(ResolverKind::Fixture),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub kind: ResolverKind,
    pub base_url: String,
    pub credentials: Option<Credentials>,
    pub fixture_path: PathBuf,
    pub http: HttpClientConfig,
}

/// Build the resolver selected by configuration.
pub fn resolver_for(settings: &ResolverSettings) -> Result<Arc<dyn VolumeResolver>> {
    match settings.kind {
        ResolverKind::DataForSeo => {
            let http = Arc::new(HttpClient::new(settings.http.clone())?);
            Ok(Arc::new(DataForSeoResolver::new(
                http,
                DataForSeoConfig {
                    base_url: settings.base_url.clone(),
                    credentials: settings.credentials.clone(),
                    max_batch_size: DATAFORSEO_MAX_BATCH,
                },
            )))
        }
        ResolverKind::Fixture => {
            if !settings.fixture_path.exists() {
                bail!(
                    "volume fixture {} does not exist",
                    settings.fixture_path.display()
                );
            }
            Ok(Arc::new(FixtureResolver::from_path(&settings.fixture_path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolveContext {
        ResolveContext {
            category_id: "shaving".into(),
            location_code: 2356,
            language_code: "en".into(),
        }
    }

    #[test]
    fn search_volume_rows_parse_from_task_results() {
        let value = json!({
            "status_code": 20000,
            "tasks": [{
                "status_code": 20000,
                "result": [
                    {"keyword": "razor", "search_volume": 1000, "cpc": 0.42, "competition_index": 61},
                    {"keyword": "trimmer", "search_volume": 500, "cpc": null, "competition_index": null},
                    {"keyword": "gillette razor", "search_volume": null}
                ]
            }]
        });
        let batch = parse_volume_response(&value).expect("parse");
        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.rows[0].volume, Some(1000));
        assert_eq!(batch.rows[0].competition_index, Some(61.0));
        assert_eq!(batch.rows[2].volume, None);
        assert!(batch.incomplete.is_none());
    }

    #[test]
    fn discovery_rows_parse_from_nested_items() {
        let value = json!({
            "status_code": 20000,
            "tasks": [{
                "status_code": 20000,
                "result": [{"items": [
                    {"keyword": "beard oil for growth", "search_volume": 2400},
                    {"keyword": "", "search_volume": 10}
                ]}]
            }]
        });
        let batch = parse_volume_response(&value).expect("parse");
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].keyword, "beard oil for growth");
    }

    #[test]
    fn failed_tasks_mark_batch_incomplete_without_dropping_rows() {
        let value = json!({
            "status_code": 20000,
            "tasks": [
                {"status_code": 20000, "result": [{"keyword": "razor", "search_volume": 90}]},
                {"status_code": 50000, "status_message": "Internal Error."}
            ]
        });
        let batch = parse_volume_response(&value).expect("parse");
        assert_eq!(batch.rows.len(), 1);
        assert!(batch.incomplete.as_deref().unwrap_or_default().contains("50000"));
    }

    #[test]
    fn top_level_status_codes_are_classified() {
        let auth = parse_volume_response(&json!({"status_code": 40100, "status_message": "auth"}))
            .expect_err("auth");
        assert!(auth.is_fatal());
        let busy = parse_volume_response(&json!({"status_code": 50301, "status_message": "busy"}))
            .expect_err("busy");
        assert!(busy.is_transient());
        let shape = parse_volume_response(&json!({"status_code": 20000})).expect_err("shape");
        assert_eq!(shape.code(), "PROTOCOL");
    }

    #[test]
    fn http_failures_map_onto_resolve_errors() {
        let unauthorized: ResolveError = FetchError::HttpStatus {
            status: 401,
            url: "https://api.test".into(),
        }
        .into();
        assert!(unauthorized.is_fatal());

        let overloaded: ResolveError = FetchError::HttpStatus {
            status: 503,
            url: "https://api.test".into(),
        }
        .into();
        assert!(overloaded.is_transient());

        let bad_request: ResolveError = FetchError::HttpStatus {
            status: 400,
            url: "https://api.test".into(),
        }
        .into();
        assert!(!bad_request.is_transient() && !bad_request.is_fatal());
    }

    #[tokio::test]
    async fn live_resolver_without_credentials_fails_before_any_request() {
        let http = Arc::new(HttpClient::new(HttpClientConfig::default()).expect("client"));
        let resolver = DataForSeoResolver::new(http, DataForSeoConfig::default());
        let err = resolver.check_credentials().await.expect_err("missing");
        assert!(matches!(err, ResolveError::MissingCredentials(_)));
        let err = resolver
            .resolve_batch(&["razor".to_string()], &ctx())
            .await
            .expect_err("missing");
        assert!(err.is_fatal());
    }

    #[test]
    fn credentials_debug_output_hides_password() {
        let creds = Credentials {
            login: "ops@example.test".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("ops@example.test"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn fixture_resolver_returns_known_rows_only() {
        let resolver = FixtureResolver::new(VolumeFixture {
            volumes: vec![VolumeRow {
                keyword: "Razor".into(),
                volume: Some(1000),
                cpc: None,
                competition_index: None,
            }],
            discovery: HashMap::from([(
                "razor".to_string(),
                vec!["razor".to_string(), "razor for sensitive skin".to_string()],
            )]),
        });
        let batch = resolver
            .resolve_batch(&["razor".to_string(), "unknown".to_string()], &ctx())
            .await
            .expect("batch");
        assert_eq!(batch.rows.len(), 1);

        let discovered = resolver
            .discover(&["Razor".to_string()], &ctx())
            .await
            .expect("discover");
        assert_eq!(discovered.len(), 2);
        assert_eq!(discovered[0].volume, Some(1000));
        assert_eq!(discovered[1].volume, None);
    }

    #[test]
    fn resolver_kind_parses_config_strings() {
        assert_eq!(ResolverKind::parse("DataForSEO"), Some(ResolverKind::DataForSeo));
        assert_eq!(ResolverKind::parse(" fixture "), Some(ResolverKind::Fixture));
        assert_eq!(ResolverKind::parse("bing"), None);
    }
}
