use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::extract::ExtractionError;
use crate::ingest::{IngestError, IngestOutcome, Ingestor};
use crate::ingest_stats::{IngestSnapshot, INGEST_STATS};
use crate::models::{Alert, AlertDirection, AlertNotification, ChartSeries, TimeRange, WhaleSummary};
use crate::series::{AggregationError, LiveSeries, SeriesAggregator};
use crate::storage::{self, BlockDataRow, DbPool};

const MAX_PAGE_SIZE: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub ingestor: Ingestor,
    pub aggregator: SeriesAggregator,
    pub live: Option<LiveSeries>,
}

impl AppState {
    pub fn new(ingestor: Ingestor, aggregator: SeriesAggregator) -> Self {
        Self {
            pool: ingestor.pool().clone(),
            ingestor,
            aggregator,
            live: None,
        }
    }

    /// Serves `/series` for the live range from the background refresh.
    pub fn with_live_series(mut self, live: LiveSeries) -> Self {
        self.live = Some(live);
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Extraction(err) => ApiError::Extraction(err),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Aggregation(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("request failed: {}", error_chain(&self));
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn ingest_block(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<IngestOutcome>)> {
    let outcome = state.ingestor.ingest_payload(payload).await?;
    let status = match outcome {
        IngestOutcome::Stored { .. } => StatusCode::CREATED,
        IngestOutcome::Duplicate { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn latest_block(State(state): State<AppState>) -> ApiResult<Json<BlockDataRow>> {
    storage::latest_block_data(&state.pool)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("block".to_string()))
}

#[derive(Deserialize)]
struct SeriesQuery {
    #[serde(default)]
    range: TimeRange,
    max_points: Option<usize>,
}

async fn series(
    State(state): State<AppState>,
    Query(params): Query<SeriesQuery>,
) -> ApiResult<Json<ChartSeries>> {
    let aggregator = match params.max_points {
        Some(0) => return Err(ApiError::BadRequest("max_points must be positive".to_string())),
        Some(max_points) => SeriesAggregator::new(state.pool.clone(), max_points),
        None => {
            if let Some(live) = &state.live {
                if let Some(series) = live.published(params.range) {
                    return Ok(Json(series));
                }
                // Keep the refresh on whatever range clients last asked for.
                live.follow(params.range);
            }
            state.aggregator.clone()
        }
    };
    Ok(Json(aggregator.query(params.range).await?))
}

#[derive(Deserialize)]
struct GasStatsQuery {
    blocks: Option<i64>,
}

async fn gas_stats(
    State(state): State<AppState>,
    Query(params): Query<GasStatsQuery>,
) -> ApiResult<Json<Value>> {
    let blocks = params.blocks.unwrap_or(10).clamp(1, 10_000);
    let stats = storage::get_gas_stats(&state.pool, blocks).await?;
    Ok(Json(match stats {
        Some(stats) => serde_json::to_value(stats).map_err(anyhow::Error::from)?,
        None => json!({ "min": null, "max": null, "avg": null, "blocks": 0 }),
    }))
}

async fn ingest_stats() -> Json<IngestSnapshot> {
    Json(INGEST_STATS.snapshot())
}

#[derive(Deserialize)]
struct WhalesQuery {
    limit: Option<i64>,
    page: Option<i64>,
}

#[derive(Serialize)]
struct WhalesResponse {
    whales: Vec<WhaleSummary>,
    page: i64,
    limit: i64,
}

async fn top_whales(
    State(state): State<AppState>,
    Query(params): Query<WhalesQuery>,
) -> ApiResult<Json<WhalesResponse>> {
    let limit = params.limit.unwrap_or(10).clamp(1, MAX_PAGE_SIZE);
    let page = params.page.unwrap_or(1).max(1);
    let whales = storage::get_top_whales(&state.pool, limit, (page - 1) * limit).await?;
    Ok(Json(WhalesResponse {
        whales,
        page,
        limit,
    }))
}

#[derive(Serialize)]
struct AlertsResponse {
    alerts: Vec<Alert>,
}

async fn list_alerts(State(state): State<AppState>) -> ApiResult<Json<AlertsResponse>> {
    let alerts = storage::list_alerts(&state.pool).await?;
    Ok(Json(AlertsResponse { alerts }))
}

#[derive(Deserialize)]
struct NewAlert {
    name: String,
    threshold: f64,
    #[serde(rename = "type")]
    direction: AlertDirection,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

async fn create_alert(
    State(state): State<AppState>,
    Json(body): Json<NewAlert>,
) -> ApiResult<(StatusCode, Json<Alert>)> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    if !body.threshold.is_finite() || body.threshold < 0.0 {
        return Err(ApiError::BadRequest(
            "threshold must be a non-negative number".to_string(),
        ));
    }

    let id = storage::create_alert(&state.pool, name, body.threshold, body.direction, body.enabled)
        .await?;
    let alert = find_alert(&state.pool, &id).await?;
    info!("created alert {} ({})", alert.id, alert.name);
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn toggle_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Alert>> {
    let alert = find_alert(&state.pool, &id).await?;
    storage::set_alert_enabled(&state.pool, &id, !alert.enabled).await?;
    Ok(Json(find_alert(&state.pool, &id).await?))
}

async fn delete_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if storage::delete_alert(&state.pool, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("alert {}", id)))
    }
}

#[derive(Deserialize)]
struct NotificationsQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct NotificationsResponse {
    notifications: Vec<AlertNotification>,
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(params): Query<NotificationsQuery>,
) -> ApiResult<Json<NotificationsResponse>> {
    let limit = params.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
    let notifications = storage::list_notifications(&state.pool, limit).await?;
    Ok(Json(NotificationsResponse { notifications }))
}

async fn find_alert(pool: &DbPool, id: &str) -> ApiResult<Alert> {
    storage::list_alerts(pool)
        .await?
        .into_iter()
        .find(|alert| alert.id == id)
        .ok_or_else(|| ApiError::NotFound(format!("alert {}", id)))
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/blocks", post(ingest_block))
        .route("/blocks/latest", get(latest_block))
        .route("/series", get(series))
        .route("/stats/gas", get(gas_stats))
        .route("/stats/ingest", get(ingest_stats))
        .route("/stats/whales", get(top_whales))
        .route("/alerts", get(list_alerts).post(create_alert))
        .route("/alerts/notifications", get(list_notifications))
        .route("/alerts/:id/toggle", post(toggle_alert))
        .route("/alerts/:id", axum::routing::delete(delete_alert))
        .with_state(state)
}

pub async fn run_http_server(addr: &str, state: AppState) -> Result<()> {
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
