//! Read-only JSON API over stored snapshots, metrics and run reports.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use kwd_core::{CategoryConfig, CategorySnapshot, Lifecycle};
use kwd_storage::SnapshotStore;
use kwd_sync::{
    calibrated_metrics, default_trend, evaluate_snapshot, reports, BatchReport, CalibratedMetrics,
    CategoryCatalog, CertificationReport, EngineConfig, PipelineSettings, TrendInput,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kwd-web";

const DEFAULT_REPORT_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub workspace_root: PathBuf,
    pub catalog: Arc<CategoryCatalog>,
    pub settings: Arc<PipelineSettings>,
    pub store: SnapshotStore,
}

impl AppState {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        catalog: CategoryCatalog,
        settings: PipelineSettings,
        store: SnapshotStore,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            catalog: Arc::new(catalog),
            settings: Arc::new(settings),
            store,
        }
    }

    /// Load both YAML files from the configured workspace root.
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let catalog = CategoryCatalog::from_workspace_root(&config.workspace_root)?;
        let settings = PipelineSettings::from_workspace_root(&config.workspace_root)?;
        Ok(Self::new(
            config.workspace_root.clone(),
            catalog,
            settings,
            SnapshotStore::new(config.data_dir.clone()),
        ))
    }

    fn category(&self, category_id: &str) -> Result<&CategoryConfig, ApiError> {
        self.catalog
            .category(category_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown category {category_id}")))
    }

    async fn latest(&self, category_id: &str) -> Result<CategorySnapshot, ApiError> {
        self.store
            .latest(category_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no snapshot stored for {category_id}")))
    }
}

/// Handler failures, rendered as `{"error": "..."}` with a matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(err) => {
                error!(error = %format!("{err:#}"), "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub id: String,
    pub display_name: String,
    pub anchors: Vec<String>,
    pub latest_snapshot_id: Option<Uuid>,
    pub lifecycle: Option<Lifecycle>,
    pub keyword_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificationView {
    pub category_id: String,
    pub snapshot_id: Uuid,
    pub lifecycle: Lifecycle,
    pub report: CertificationReport,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    trend: Option<String>,
    label: Option<String>,
}

impl MetricsQuery {
    /// An explicit `trend` overrides the benchmark trend; an empty one means "not supplied".
    fn trend_input(&self, category: &CategoryConfig) -> Result<TrendInput, ApiError> {
        let mut trend = default_trend(category);
        if let Some(raw) = self.trend.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let percent: f64 = raw
                .trim_end_matches('%')
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("trend must be a percentage, got {raw:?}")))?;
            if !percent.is_finite() {
                return Err(ApiError::BadRequest("trend must be finite".into()));
            }
            trend.percent = percent;
        }
        if let Some(label) = self.label.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            trend.label = Some(label.to_string());
        }
        Ok(trend)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReportsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/categories", get(categories_handler))
        .route("/categories/{id}/metrics", get(metrics_handler))
        .route("/categories/{id}/certification", get(certification_handler))
        .route("/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    let state = AppState::from_config(&config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, root = %config.workspace_root.display(), "serving keyword demand API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn categories_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CategorySummary>>, ApiError> {
    let mut out = Vec::with_capacity(state.catalog.categories.len());
    for category in &state.catalog.categories {
        let latest = state.store.list(&category.id).await?.pop();
        out.push(CategorySummary {
            id: category.id.clone(),
            display_name: category.display_name.clone(),
            anchors: category.anchors.iter().map(|a| a.anchor_id.clone()).collect(),
            latest_snapshot_id: latest.as_ref().map(|s| s.snapshot_id),
            lifecycle: latest.as_ref().map(|s| s.lifecycle),
            keyword_count: latest.map(|s| s.row_count).unwrap_or(0),
        });
    }
    Ok(Json(out))
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<CalibratedMetrics>, ApiError> {
    let category = state.category(&id)?;
    let trend = query.trend_input(category)?;
    let snapshot = state.latest(&id).await?;
    Ok(Json(calibrated_metrics(
        category,
        &snapshot,
        &trend,
        &state.settings,
    )))
}

async fn certification_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<CertificationView>, ApiError> {
    state.category(&id)?;
    let snapshot = state.latest(&id).await?;
    let report = evaluate_snapshot(&snapshot, &state.settings.certification);
    Ok(Json(CertificationView {
        category_id: id,
        snapshot_id: snapshot.snapshot_id,
        lifecycle: snapshot.lifecycle,
        report,
    }))
}

async fn reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportsQuery>,
) -> Result<Json<Vec<BatchReport>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_REPORT_LIMIT);
    Ok(Json(reports::recent_runs(&state.workspace_root, limit)?))
}
