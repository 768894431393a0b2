//! Axum JSON API over the deduplication engine. Actor identity arrives as
//! an opaque `x-uid` header; admin classification happens in the engine.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ddm_core::{DemandHints, SimilarityRule};
use ddm_engine::{ConfigPatch, DedupEngine, EngineError};
use ddm_storage::{RecencyField, SortOrder};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ddm-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DedupEngine>,
}

impl AppState {
    pub fn new(engine: Arc<DedupEngine>) -> Self {
        Self { engine }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/demands/ingest", post(ingest_handler))
        .route("/demands/check_similar", post(check_similar_handler))
        .route("/unique_demands/count", get(count_handler))
        .route("/unique_demands/range", get(range_handler))
        .route("/unique_demands/{id}", get(demand_detail_handler))
        .route("/admin/config", get(config_get_handler).post(config_update_handler))
        .route("/admin/raw/{id}/link", post(admin_link_handler))
        .route("/admin/raw/{id}/unlink", post(admin_unlink_handler))
        .route(
            "/admin/unique_demands/{id}/canonical_raw",
            post(admin_canonical_raw_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Uniform failure body: `{"ok": false, "error": "CODE"}`.
struct ApiError {
    status: StatusCode,
    code: &'static str,
}

impl ApiError {
    const MISSING_UID: ApiError = ApiError {
        status: StatusCode::UNAUTHORIZED,
        code: "MISSING_UID",
    };
    const INVALID_FIELD: ApiError = ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "INVALID_FIELD",
    };
    const INVALID_ORDER: ApiError = ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "INVALID_ORDER",
    };
    const INVALID_ID: ApiError = ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "INVALID_ID",
    };
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(_) => ApiError {
                status: StatusCode::BAD_REQUEST,
                code: "INVALID_INPUT",
            },
            EngineError::Unauthorized => ApiError {
                status: StatusCode::FORBIDDEN,
                code: "FORBIDDEN",
            },
            EngineError::NotFound(_) => ApiError {
                status: StatusCode::NOT_FOUND,
                code: "NOT_FOUND",
            },
            EngineError::Storage(_) => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "STORAGE_ERROR",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "ok": false, "error": self.code }))).into_response()
    }
}

fn uid(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-uid")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn require_uid(headers: &HeaderMap) -> Result<String, ApiError> {
    uid(headers).ok_or(ApiError::MISSING_UID)
}

fn parse_raw_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::INVALID_ID)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct IngestBody {
    raw_text: String,
    #[serde(default)]
    hints: DemandHints,
    #[serde(default)]
    source: Option<String>,
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IngestBody>,
) -> Result<Response, ApiError> {
    let receipt = state
        .engine
        .ingest(
            &body.raw_text,
            body.hints,
            uid(&headers),
            body.source.as_deref().unwrap_or("api"),
        )
        .await?;
    Ok(Json(json!({ "ok": true, "receipt": receipt })).into_response())
}

#[derive(Debug, Deserialize)]
struct CheckSimilarBody {
    raw_text: String,
    #[serde(default)]
    hints: DemandHints,
    #[serde(default)]
    since_days: Option<i64>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    rule: Option<SimilarityRule>,
}

async fn check_similar_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckSimilarBody>,
) -> Result<Response, ApiError> {
    let report = state
        .engine
        .check_similar(
            &body.raw_text,
            &body.hints,
            body.since_days,
            body.limit,
            body.threshold,
            body.rule,
        )
        .await?;
    Ok(Json(json!({ "ok": true, "report": report })).into_response())
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    start_ts: Option<i64>,
    #[serde(default)]
    end_ts: Option<i64>,
    #[serde(default)]
    only_valid: Option<bool>,
    #[serde(default)]
    order: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

impl RangeQuery {
    fn field(&self) -> Result<RecencyField, ApiError> {
        match &self.field {
            None => Ok(RecencyField::LastUpdatedTs),
            Some(name) => RecencyField::parse(name).ok_or(ApiError::INVALID_FIELD),
        }
    }

    fn order(&self) -> Result<SortOrder, ApiError> {
        match self.order.as_deref() {
            None | Some("desc") => Ok(SortOrder::Desc),
            Some("asc") => Ok(SortOrder::Asc),
            Some(_) => Err(ApiError::INVALID_ORDER),
        }
    }

    fn bounds(&self) -> (i64, i64) {
        (self.start_ts.unwrap_or(0), self.end_ts.unwrap_or(i64::MAX))
    }
}

async fn count_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let field = query.field()?;
    let (start_ts, end_ts) = query.bounds();
    let count = state
        .engine
        .count_demands(field, start_ts, end_ts, query.only_valid.unwrap_or(false))
        .await?;
    Ok(Json(json!({ "ok": true, "count": count })).into_response())
}

async fn range_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let field = query.field()?;
    let order = query.order()?;
    let (start_ts, end_ts) = query.bounds();
    let demands = state
        .engine
        .range_demands(
            field,
            start_ts,
            end_ts,
            query.only_valid.unwrap_or(false),
            order,
            query.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(json!({ "ok": true, "demands": demands })).into_response())
}

async fn demand_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let demand = state.engine.get_demand(&id).await?;
    Ok(Json(json!({ "ok": true, "demand": demand })).into_response())
}

async fn config_get_handler(State(state): State<Arc<AppState>>) -> Response {
    let config = state.engine.get_config().await;
    Json(json!({ "ok": true, "config": config })).into_response()
}

async fn config_update_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<ConfigPatch>,
) -> Result<Response, ApiError> {
    let actor = require_uid(&headers)?;
    let config = state.engine.update_config(patch, &actor).await?;
    Ok(Json(json!({ "ok": true, "config": config })).into_response())
}

#[derive(Debug, Deserialize)]
struct LinkBody {
    canonical_id: String,
}

async fn admin_link_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Json(body): Json<LinkBody>,
) -> Result<Response, ApiError> {
    let actor = require_uid(&headers)?;
    let raw_id = parse_raw_id(&id)?;
    state
        .engine
        .admin_link_raw(raw_id, &body.canonical_id, &actor)
        .await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn admin_unlink_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let actor = require_uid(&headers)?;
    let raw_id = parse_raw_id(&id)?;
    state.engine.admin_unlink_raw(raw_id, &actor).await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

#[derive(Debug, Deserialize)]
struct CanonicalRawBody {
    raw_id: Uuid,
}

async fn admin_canonical_raw_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Json(body): Json<CanonicalRawBody>,
) -> Result<Response, ApiError> {
    let actor = require_uid(&headers)?;
    state
        .engine
        .admin_set_canonical_raw(&id, body.raw_id, &actor)
        .await?;
    Ok(Json(json!({ "ok": true })).into_response())
}
