//! Admin API for token status
//!
//! Runs on a separate listener (`server.admin_addr`) so it can stay off the
//! public interface.
//!
//! Endpoints:
//! - GET  /admin/tokens                   per-provider token counts for today
//! - POST /admin/tokens/reset             clear every exhaustion flag
//! - POST /admin/tokens/{provider}/reset  clear one provider's flags

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use provider::ProviderId;
use tracing::{info, warn};

use crate::upstream::Gateway;

#[derive(Clone)]
pub struct AdminState {
    gateway: Arc<Gateway>,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/tokens", get(token_stats))
        .route("/admin/tokens/reset", post(reset_all))
        .route("/admin/tokens/{provider}/reset", post(reset_provider))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /admin/tokens: `{date, providers: {id: {total, active, exhausted}}}`.
async fn token_stats(State(state): State<AdminState>) -> Response {
    let tracker = state.gateway.tracker();
    let date = tracker.snapshot().await.date;

    let mut providers = serde_json::Map::new();
    for (id, settings) in state.gateway.providers() {
        let stats = tracker.stats(*id, &settings.tokens).await;
        providers.insert(id.to_string(), serde_json::json!(stats));
    }

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "date": date.to_string(),
            "providers": providers,
        }),
    )
}

/// POST /admin/tokens/reset, the user's "retry now".
async fn reset_all(State(state): State<AdminState>) -> Response {
    match state.gateway.tracker().reset_all().await {
        Ok(()) => {
            info!("all token exhaustion flags cleared");
            json_response(StatusCode::OK, serde_json::json!({ "reset": "all" }))
        }
        Err(e) => {
            warn!(error = %e, "failed to reset token status");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("failed to reset token status: {e}") }),
            )
        }
    }
}

/// POST /admin/tokens/{provider}/reset
async fn reset_provider(
    State(state): State<AdminState>,
    Path(provider): Path<String>,
) -> Response {
    let provider: ProviderId = match provider.parse() {
        Ok(id) => id,
        Err(e) => {
            return json_response(
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": format!("{e}") }),
            );
        }
    };

    match state.gateway.tracker().reset_provider(provider).await {
        Ok(()) => {
            info!(%provider, "provider token exhaustion flags cleared");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "reset": provider.as_str() }),
            )
        }
        Err(e) => {
            warn!(%provider, error = %e, "failed to reset provider token status");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("failed to reset token status: {e}") }),
            )
        }
    }
}
