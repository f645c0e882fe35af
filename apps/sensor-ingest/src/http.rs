use crate::buffer::IngestBuffer;
use crate::pipeline::{IngestStats, StatsSnapshot};
use crate::reading::{format_timestamp, local_now, SensorType};
use crate::snapshot::SnapshotStore;
use crate::store::{HistoryRow, HistoryWindow, RangeQuery, Store};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub store: Store,
    pub buffer: Arc<IngestBuffer>,
    pub stats: Arc<IngestStats>,
    pub snapshots: SnapshotStore,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    #[serde(default)]
    range: Option<String>,
    #[serde(default)]
    sensor_type: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    sensor_type: String,
    location: String,
}

#[derive(Debug, Serialize)]
struct LatestResponse {
    sensor_type: String,
    location: String,
    value: f64,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    buffered: usize,
    stored_rows: i64,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn internal_error(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "history query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Result<Json<StatusResponse>, ApiError> {
    let stored_rows = state.store.count_rows().await.map_err(internal_error)?;
    Ok(Json(StatusResponse {
        buffered: state.buffer.len(),
        stored_rows,
        stats: state.stats.snapshot(),
    }))
}

async fn get_history(
    State(state): State<HttpState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryRow>>, ApiError> {
    let window = params
        .range
        .as_deref()
        .and_then(HistoryWindow::parse)
        .unwrap_or_default();
    let query = RangeQuery::for_window(window, local_now())
        .sensor_type(params.sensor_type)
        .location(params.location);
    let rows = state.store.query_range(&query).await.map_err(internal_error)?;
    Ok(Json(rows))
}

async fn get_latest(
    State(state): State<HttpState>,
    Query(params): Query<LatestParams>,
) -> Result<Json<LatestResponse>, ApiError> {
    let sensor_type = params
        .sensor_type
        .parse::<SensorType>()
        .unwrap_or_else(|never| match never {});
    let snapshot = state
        .snapshots
        .get(&sensor_type, &params.location)
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "no reading recorded for this sensor" })),
            )
        })?;
    Ok(Json(LatestResponse {
        sensor_type: sensor_type.to_string(),
        location: params.location,
        value: snapshot.value,
        timestamp: format_timestamp(snapshot.timestamp),
    }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/sensor_data/history", get(get_history))
        .route("/sensor_data/latest", get(get_latest))
        .with_state(state)
}
