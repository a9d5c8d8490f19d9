//! HTTP API.
//!
//! The inbound surface mirrors the upstream dialect so dashboards can point
//! at the proxy unchanged:
//! - POST /api/v1/datapoints/query (body) or GET with a `query` URL parameter
//! - GET / health check

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::error::CacheError;
use crate::orchestrator::{CacheResponse, Orchestrator};

/// Application state shared across handlers.
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/datapoints/query",
            post(query_post).get(query_get),
        )
        .route("/", get(root))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "tscached"
}

type ApiError = (StatusCode, Json<Value>);

async fn query_post(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<CacheResponse>, ApiError> {
    run_query(&state, &body).await
}

async fn query_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<CacheResponse>, ApiError> {
    let raw = params.get("query").ok_or_else(|| {
        bad_request("missing query parameter".to_string())
    })?;
    let body: Value =
        serde_json::from_str(raw).map_err(|e| bad_request(format!("bad query parameter: {e}")))?;
    run_query(&state, &body).await
}

async fn run_query(state: &AppState, body: &Value) -> Result<Json<CacheResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let metric_count = body
        .get("metrics")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    info!(request_id, metric_count, "Query request");

    match state.orchestrator.handle_request(body).await {
        Ok(response) => Ok(Json(response)),
        Err(CacheError::BadRequest(message)) => Err(bad_request(message)),
        Err(error) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": error.to_string()})),
        )),
    }
}

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}
