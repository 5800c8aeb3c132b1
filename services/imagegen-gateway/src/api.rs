//! Public JSON API: `/api/generate`, `/api/upscale`, `/api/optimize`

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::upstream::{Completed, GenerateRequest, OptimizeRequest, UpscaleRequest};

pub async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let request_id = new_request_id();
    let result = run_generate(&state, body, &request_id).await;
    finish(&state, "generate", &request_id, started, result)
}

pub async fn upscale(
    State(state): State<AppState>,
    body: Result<Json<UpscaleRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let request_id = new_request_id();
    let result = run_upscale(&state, body, &request_id).await;
    finish(&state, "upscale", &request_id, started, result)
}

pub async fn optimize(
    State(state): State<AppState>,
    body: Result<Json<OptimizeRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let request_id = new_request_id();
    let result = run_optimize(&state, body, &request_id).await;
    finish(&state, "optimize", &request_id, started, result)
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn run_generate(
    state: &AppState,
    body: Result<Json<GenerateRequest>, JsonRejection>,
    request_id: &str,
) -> Result<Completed<serde_json::Value>, ApiError> {
    let Json(request) = body.map_err(rejection)?;
    state.gateway.generate(&request).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn run_upscale(
    state: &AppState,
    body: Result<Json<UpscaleRequest>, JsonRejection>,
    request_id: &str,
) -> Result<Completed<serde_json::Value>, ApiError> {
    let Json(request) = body.map_err(rejection)?;
    state.gateway.upscale(&request).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn run_optimize(
    state: &AppState,
    body: Result<Json<OptimizeRequest>, JsonRejection>,
    request_id: &str,
) -> Result<Completed<String>, ApiError> {
    let Json(request) = body.map_err(rejection)?;
    state.gateway.optimize(&request).await
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn rejection(err: JsonRejection) -> ApiError {
    ApiError::InvalidRequest(err.body_text())
}

/// Count, log and render the outcome of one API call.
fn finish<T: Serialize>(
    state: &AppState,
    route: &'static str,
    request_id: &str,
    started: Instant,
    result: Result<Completed<T>, ApiError>,
) -> Response {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match result {
        Ok(done) => {
            info!(
                request_id,
                route,
                provider = %done.provider,
                anonymous = done.anonymous,
                token_index = ?done.token_index,
                "request completed"
            );
            let mut body = serde_json::json!(done);
            body["request_id"] = serde_json::Value::String(request_id.to_string());
            (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                body.to_string(),
            )
                .into_response()
        }
        Err(err) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id,
                route,
                error_type = err.error_type(),
                error = %err,
                "request failed"
            );
            err.to_response(request_id)
        }
    };

    crate::metrics::record_request(
        route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
