//! Keyword demand pipeline: grow category snapshots, certify them, score them and report.

pub mod anchoring;
pub mod calibration;
pub mod catalog;
pub mod certification;
pub mod gateway;
pub mod growth;
pub mod guard;
pub mod metrics;
pub mod reports;
pub mod seeds;
pub mod stop;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kwd_adapters::{
    resolver_for, Credentials, ResolveContext, ResolverKind, ResolverSettings, VolumeResolver,
};
use kwd_core::{CategoryConfig, CategorySnapshot, Lifecycle};
use kwd_storage::{BackoffPolicy, HttpClientConfig, SimpleTokenBucket, SnapshotStore};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use calibration::{calibrate, calibrator_for, CalibratedMetrics, CalibrationPolicy, Calibrator};
pub use catalog::{CatalogError, CategoryCatalog, PipelineSettings};
pub use certification::{certify, evaluate_snapshot, CertificationPolicy, CertificationReport};
pub use gateway::{GatewayConfig, VolumeGateway};
pub use growth::{GrowthEngine, GrowthError, GrowthSettings, LifecyclePolicy, Termination};
pub use guard::{GuardFilter, GuardTables, GuardVerdict};
pub use metrics::{compute_metrics, CategoryMetrics, MetricsConfig, TrendInput};
pub use seeds::SeedGenerator;
pub use stop::{StopRegistry, StopSignal};

pub const CRATE_NAME: &str = "kwd-sync";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub resolver: ResolverKind,
    pub dfs_base_url: String,
    pub credentials: Option<Credentials>,
    pub fixture_path: PathBuf,
    pub location_code: u32,
    pub language_code: String,
    pub http_timeout_secs: u64,
    pub resolver_interval_ms: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub grow_cron: String,
    pub web_port: u16,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let resolver_raw = env_or("KWD_RESOLVER", "fixture");
        let resolver = ResolverKind::parse(&resolver_raw).unwrap_or_else(|| {
            warn!(resolver = %resolver_raw, "unknown KWD_RESOLVER; using fixture");
            ResolverKind::Fixture
        });
        Self {
            workspace_root: PathBuf::from(env_or("KWD_WORKSPACE_ROOT", ".")),
            data_dir: PathBuf::from(env_or("KWD_DATA_DIR", "./data/snapshots")),
            resolver,
            dfs_base_url: env_or("KWD_DFS_BASE_URL", "https://api.dataforseo.com"),
            credentials: Credentials::from_env(),
            fixture_path: PathBuf::from(env_or("KWD_FIXTURE_PATH", "fixtures/volumes/sample.json")),
            location_code: env_parse("KWD_LOCATION_CODE", 2356),
            language_code: env_or("KWD_LANGUAGE_CODE", "en"),
            http_timeout_secs: env_parse("KWD_HTTP_TIMEOUT_SECS", 60),
            resolver_interval_ms: env_parse("KWD_RESOLVER_INTERVAL_MS", 500),
            user_agent: env_or("KWD_USER_AGENT", "kwd-bot/0.1"),
            scheduler_enabled: std::env::var("KWD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            grow_cron: env_or("KWD_GROW_CRON", "0 0 3 * * *"),
            web_port: env_parse("KWD_WEB_PORT", 8000),
        }
    }

    /// Relative fixture paths resolve against the workspace root.
    pub fn resolver_settings(&self) -> ResolverSettings {
        let fixture_path = if self.fixture_path.is_absolute() {
            self.fixture_path.clone()
        } else {
            self.workspace_root.join(&self.fixture_path)
        };
        ResolverSettings {
            kind: self.resolver,
            base_url: self.dfs_base_url.clone(),
            credentials: self.credentials.clone(),
            fixture_path,
            http: HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
                user_agent: Some(self.user_agent.clone()),
                ..Default::default()
            },
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            backoff: BackoffPolicy::default(),
            batch_size: None,
        }
    }

    pub fn resolve_context(&self, category_id: &str) -> ResolveContext {
        ResolveContext {
            category_id: category_id.to_string(),
            location_code: self.location_code,
            language_code: self.language_code.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CategoryRunStatus {
    Completed,
    Stopped,
    Failed,
    /// Certified snapshot without a downgrade, or a category that already has a live run.
    Refused,
}

impl CategoryRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CategoryRunStatus::Completed => "COMPLETED",
            CategoryRunStatus::Stopped => "STOPPED",
            CategoryRunStatus::Failed => "FAILED",
            CategoryRunStatus::Refused => "REFUSED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRunReport {
    pub category_id: String,
    pub status: CategoryRunStatus,
    pub snapshot_id: Option<Uuid>,
    pub lifecycle: Option<Lifecycle>,
    pub termination: Option<Termination>,
    #[serde(default)]
    pub passes: Vec<growth::PassReport>,
    pub certification: Option<CertificationReport>,
    pub metrics: Option<CalibratedMetrics>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl CategoryRunReport {
    fn failed(category_id: &str, code: &str, error: String) -> Self {
        Self {
            category_id: category_id.to_string(),
            status: CategoryRunStatus::Failed,
            snapshot_id: None,
            lifecycle: None,
            termination: None,
            passes: Vec::new(),
            certification: None,
            metrics: None,
            error: Some(error),
            error_code: Some(code.to_string()),
        }
    }

    fn already_running(category_id: &str) -> Self {
        Self {
            status: CategoryRunStatus::Refused,
            ..Self::failed(
                category_id,
                "ALREADY_RUNNING",
                format!("category {category_id} already has a live run"),
            )
        }
    }
}

/// Batch slot kept in input order until every spawned task is joined.
enum Pending {
    Refused(CategoryRunReport),
    Spawned(
        String,
        tokio::task::JoinHandle<(CategoryRunReport, Option<CategorySnapshot>)>,
    ),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resolver: String,
    pub categories: Vec<CategoryRunReport>,
    #[serde(default)]
    pub reports_dir: Option<String>,
    #[serde(default)]
    pub parquet_manifest: Option<String>,
}

impl BatchReport {
    pub fn category(&self, category_id: &str) -> Option<&CategoryRunReport> {
        self.categories.iter().find(|c| c.category_id == category_id)
    }

    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for category in &self.categories {
            *counts.entry(category.status.as_str()).or_default() += 1;
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub report: BatchReport,
    pub snapshots: Vec<CategorySnapshot>,
}

/// Trend input from the category's benchmark, flat when none is configured.
pub fn default_trend(category: &CategoryConfig) -> TrendInput {
    TrendInput {
        percent: category
            .benchmark
            .and_then(|b| b.trend_5y)
            .unwrap_or(0.0),
        label: None,
    }
}

/// Raw metrics for `snapshot` and the calibrated view configured in `settings`.
pub fn calibrated_metrics(
    category: &CategoryConfig,
    snapshot: &CategorySnapshot,
    trend: &TrendInput,
    settings: &PipelineSettings,
) -> CalibratedMetrics {
    let raw = compute_metrics(snapshot, trend, &settings.metrics);
    let calibrator = calibrator_for(settings.calibration);
    calibrate(
        &raw,
        category.benchmark.as_ref(),
        calibrator.as_ref(),
        &settings.metrics,
    )
}

/// Shared pipeline state for batch runs. Cheap to share behind an `Arc`.
pub struct Engine {
    config: EngineConfig,
    catalog: Arc<CategoryCatalog>,
    settings: PipelineSettings,
    growth: GrowthEngine,
    stops: StopRegistry,
    resolver_name: &'static str,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        catalog: CategoryCatalog,
        settings: PipelineSettings,
        resolver: Arc<dyn VolumeResolver>,
    ) -> Self {
        let resolver_name = resolver.name();
        let gate = Arc::new(SimpleTokenBucket::new(
            1,
            Duration::from_millis(config.resolver_interval_ms),
        ));
        let gateway = Arc::new(VolumeGateway::new(resolver, gate, config.gateway_config()));
        let growth = GrowthEngine::new(
            Arc::new(catalog.guard_filter()),
            Arc::new(catalog.seed_generator()),
            gateway,
            SnapshotStore::new(config.data_dir.clone()),
            settings.growth.clone(),
            settings.hydration,
        );
        Self {
            config,
            catalog: Arc::new(catalog),
            settings,
            growth,
            stops: StopRegistry::default(),
            resolver_name,
        }
    }

    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let catalog = CategoryCatalog::from_workspace_root(&config.workspace_root)?;
        let settings = PipelineSettings::from_workspace_root(&config.workspace_root)?;
        let resolver = resolver_for(&config.resolver_settings())
            .with_context(|| format!("building {:?} resolver", config.resolver))?;
        Ok(Self::new(config, catalog, settings, resolver))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &CategoryCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &SnapshotStore {
        self.growth.store()
    }

    pub fn stops(&self) -> &StopRegistry {
        &self.stops
    }

    fn category(&self, category_id: &str) -> Result<&CategoryConfig> {
        self.catalog
            .category(category_id)
            .with_context(|| format!("unknown category {category_id}"))
    }

    /// Latest stored snapshot for the category, or a fresh `DRAFT`.
    pub async fn load_or_create(&self, category_id: &str) -> Result<CategorySnapshot> {
        let category = self.category(category_id)?;
        match self.store().latest(category_id).await? {
            Some(snapshot) => Ok(snapshot),
            None => self.store().create_draft(category, Utc::now()).await,
        }
    }

    /// Certify the latest snapshot and persist any promotion.
    pub async fn certify_category(
        &self,
        category_id: &str,
    ) -> Result<Option<(CertificationReport, CategorySnapshot)>> {
        self.category(category_id)?;
        let Some(mut snapshot) = self.store().latest(category_id).await? else {
            return Ok(None);
        };
        let report = certify(&mut snapshot, &self.settings.certification, Utc::now());
        self.store().save(&snapshot).await?;
        Ok(Some((report, snapshot)))
    }

    pub async fn metrics_for(
        &self,
        category_id: &str,
        trend: Option<TrendInput>,
    ) -> Result<Option<CalibratedMetrics>> {
        let category = self.category(category_id)?;
        let Some(snapshot) = self.store().latest(category_id).await? else {
            return Ok(None);
        };
        let trend = trend.unwrap_or_else(|| default_trend(category));
        Ok(Some(calibrated_metrics(
            category,
            &snapshot,
            &trend,
            &self.settings,
        )))
    }

    async fn run_category(
        &self,
        category_id: &str,
        policy: LifecyclePolicy,
        stop: StopSignal,
    ) -> (CategoryRunReport, Option<CategorySnapshot>) {
        let category = match self.category(category_id) {
            Ok(category) => category,
            Err(err) => {
                return (
                    CategoryRunReport::failed(category_id, "UNKNOWN_CATEGORY", err.to_string()),
                    None,
                )
            }
        };
        let snapshot = match self.load_or_create(category_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(category_id, error = %format!("{err:#}"), "loading snapshot failed");
                return (
                    CategoryRunReport::failed(category_id, "STORAGE", format!("{err:#}")),
                    None,
                );
            }
        };

        let ctx = self.config.resolve_context(category_id);
        let existing = snapshot.clone();
        match self.growth.grow(category, snapshot, policy, &ctx, &stop).await {
            Ok(outcome) => {
                let mut snapshot = outcome.snapshot;
                let stopped = outcome.termination == Termination::Stopped;
                let certification = if stopped {
                    None
                } else {
                    let report = certify(&mut snapshot, &self.settings.certification, Utc::now());
                    if let Err(err) = self.store().save(&snapshot).await {
                        error!(category_id, error = %format!("{err:#}"), "saving certified snapshot failed");
                        return (
                            CategoryRunReport::failed(category_id, "STORAGE", format!("{err:#}")),
                            Some(snapshot),
                        );
                    }
                    Some(report)
                };
                let metrics =
                    calibrated_metrics(category, &snapshot, &default_trend(category), &self.settings);
                let report = CategoryRunReport {
                    category_id: category_id.to_string(),
                    status: if stopped {
                        CategoryRunStatus::Stopped
                    } else {
                        CategoryRunStatus::Completed
                    },
                    snapshot_id: Some(snapshot.snapshot_id),
                    lifecycle: Some(snapshot.lifecycle),
                    termination: Some(outcome.termination),
                    passes: outcome.passes,
                    certification,
                    metrics: Some(metrics),
                    error: None,
                    error_code: None,
                };
                (report, Some(snapshot))
            }
            Err(GrowthError::Certified { lifecycle, .. }) => {
                info!(category_id, lifecycle, "growth refused for certified snapshot");
                let metrics =
                    calibrated_metrics(category, &existing, &default_trend(category), &self.settings);
                let report = CategoryRunReport {
                    category_id: category_id.to_string(),
                    status: CategoryRunStatus::Refused,
                    snapshot_id: Some(existing.snapshot_id),
                    lifecycle: Some(existing.lifecycle),
                    termination: None,
                    passes: Vec::new(),
                    certification: None,
                    metrics: Some(metrics),
                    error: Some(format!("snapshot is {lifecycle}; rerun with a downgrade to grow")),
                    error_code: Some("CERTIFIED".to_string()),
                };
                (report, Some(existing))
            }
            Err(GrowthError::Fatal { source, .. }) => {
                error!(category_id, code = source.code(), error = %source, "category run aborted");
                (
                    CategoryRunReport::failed(category_id, source.code(), source.to_string()),
                    None,
                )
            }
            Err(GrowthError::Storage(err)) => {
                error!(category_id, error = %format!("{err:#}"), "category run storage failure");
                (
                    CategoryRunReport::failed(category_id, "STORAGE", format!("{err:#}")),
                    None,
                )
            }
        }
    }

    /// Run every category in its own task. A failure, stop or panic in one task
    /// only affects that category's report. Duplicate ids run once, and a category
    /// that already has a live run elsewhere is refused with `ALREADY_RUNNING`.
    pub async fn run_batch(
        self: &Arc<Self>,
        category_ids: &[String],
        policy: LifecyclePolicy,
    ) -> BatchOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, categories = category_ids.len(), resolver = self.resolver_name, "batch run started");

        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(category_ids.len());
        for category_id in category_ids {
            if !seen.insert(category_id.as_str()) {
                warn!(%run_id, category_id = %category_id, "duplicate category id in batch ignored");
                continue;
            }
            let Some(lease) = self.stops.arm(category_id) else {
                warn!(%run_id, category_id = %category_id, "category already has a live run");
                pending.push(Pending::Refused(CategoryRunReport::already_running(category_id)));
                continue;
            };
            let engine = Arc::clone(self);
            let id = category_id.clone();
            let span = info_span!("category_run", %run_id, category_id = %id);
            let handle = tokio::spawn(
                async move {
                    let outcome = engine.run_category(&id, policy, lease.signal().clone()).await;
                    drop(lease);
                    outcome
                }
                .instrument(span),
            );
            pending.push(Pending::Spawned(category_id.clone(), handle));
        }

        let mut categories = Vec::with_capacity(pending.len());
        let mut snapshots = Vec::new();
        for entry in pending {
            let (category_id, handle) = match entry {
                Pending::Refused(report) => {
                    categories.push(report);
                    continue;
                }
                Pending::Spawned(category_id, handle) => (category_id, handle),
            };
            match handle.await {
                Ok((report, snapshot)) => {
                    categories.push(report);
                    snapshots.extend(snapshot);
                }
                Err(join_err) => {
                    error!(category_id = %category_id, error = %join_err, "category task did not finish");
                    categories.push(CategoryRunReport::failed(
                        &category_id,
                        "TASK_ABORTED",
                        join_err.to_string(),
                    ));
                }
            }
        }

        let report = BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            resolver: self.resolver_name.to_string(),
            categories,
            reports_dir: None,
            parquet_manifest: None,
        };
        info!(%run_id, counts = ?report.status_counts(), "batch run finished");
        BatchOutcome { report, snapshots }
    }

    /// Run a batch and write its report directory.
    pub async fn run_and_report(
        self: &Arc<Self>,
        category_ids: &[String],
        policy: LifecyclePolicy,
    ) -> Result<BatchOutcome> {
        let mut outcome = self.run_batch(category_ids, policy).await;
        let paths =
            reports::write_reports(&self.config.workspace_root, &outcome.report, &outcome.snapshots)
                .await?;
        outcome.report.reports_dir = Some(paths.reports_dir.display().to_string());
        outcome.report.parquet_manifest = Some(paths.manifest.display().to_string());
        Ok(outcome)
    }
}

/// Cron-driven batch runs over every configured category, when enabled.
pub async fn maybe_build_scheduler(engine: Arc<Engine>) -> Result<Option<JobScheduler>> {
    if !engine.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = engine.config.grow_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            let ids = engine.catalog().ids();
            match engine.run_and_report(&ids, LifecyclePolicy::RefuseCertified).await {
                Ok(outcome) => info!(run_id = %outcome.report.run_id, "scheduled batch finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled batch failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Build the engine from the environment and run the requested categories (all when empty).
pub async fn run_batch_from_env(
    categories: Vec<String>,
    policy: LifecyclePolicy,
) -> Result<BatchOutcome> {
    let engine = Arc::new(Engine::from_config(EngineConfig::from_env())?);
    let ids = if categories.is_empty() {
        engine.catalog().ids()
    } else {
        categories
    };
    engine.run_and_report(&ids, policy).await
}
