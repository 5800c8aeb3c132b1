//! Image generation gateway
//!
//! Single-binary Rust service that:
//! 1. Accepts generate / upscale / optimize requests as JSON
//! 2. Forwards each to the configured provider endpoint
//! 3. Spends provider tokens in list order, skipping ones that hit their
//!    daily quota, and falls back to anonymous access where allowed
//! 4. Persists the per-day exhaustion state so restarts keep skipping them

mod admin;
mod api;
mod config;
mod error;
mod metrics;
mod upstream;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use token_pool::{FileBackend, MemoryBackend, StatusBackend, SystemClock, TokenTracker};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::upstream::Gateway;

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the public router, capped at `max_connections` concurrent requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/generate", post(api::generate))
        .route("/api/upscale", post(api::upscale))
        .route("/api/optimize", post(api::optimize))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting imagegen-gateway");

    // Install before any metric is emitted
    let prometheus_handle = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let providers = config.provider_settings();
    for (id, settings) in &providers {
        info!(
            provider = %id,
            tokens = settings.tokens.len(),
            allow_anonymous = settings.allow_anonymous,
            "provider configured"
        );
    }

    let backend: Arc<dyn StatusBackend> = match &config.store.path {
        Some(path) => {
            info!(path = %path.display(), "persisting token status to file");
            Arc::new(FileBackend::new(path.clone()))
        }
        None => {
            warn!("no store.path configured, token status will not survive restarts");
            Arc::new(MemoryBackend::new())
        }
    };
    let tracker = TokenTracker::new(backend, Arc::new(SystemClock));

    let gateway = Arc::new(Gateway::new(
        reqwest::Client::new(),
        tracker,
        providers,
        Duration::from_secs(config.server.timeout_secs),
        config.optimize.clone(),
    ));

    let app_state = AppState {
        gateway: gateway.clone(),
        metrics: ServiceMetrics::new(),
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    if let Some(admin_addr) = config.server.admin_addr {
        let admin_app = admin::build_admin_router(admin::AdminState::new(gateway));
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
        info!(addr = %admin_addr, "admin API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin_app).await {
                error!(error = %e, "admin server error");
            }
        });
    }

    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts when the signal fires, not when the server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: overall status, uptime, request counters and per-provider
/// token availability.
///
/// A provider is `healthy` while it has an active token or may be called
/// anonymously. The service is `healthy` when every provider is, `degraded`
/// when only some are, and `unhealthy` (503) when none are.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let tracker = state.gateway.tracker();
    let mut providers = serde_json::Map::new();
    let mut usable = 0;
    for (id, settings) in state.gateway.providers() {
        let stats = tracker.stats(*id, &settings.tokens).await;
        let healthy = stats.active > 0 || settings.allow_anonymous;
        if healthy {
            usable += 1;
        }
        providers.insert(
            id.to_string(),
            serde_json::json!({
                "status": if healthy { "healthy" } else { "degraded" },
                "tokens": stats,
                "allow_anonymous": settings.allow_anonymous,
            }),
        );
    }

    let (status_code, status) = if usable > 0 && usable == providers.len() {
        (axum::http::StatusCode::OK, "healthy")
    } else if usable > 0 {
        (axum::http::StatusCode::OK, "degraded")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "providers": providers,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizeConfig;
    use crate::upstream::ProviderSettings;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use provider::ProviderId;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// `build_recorder()` avoids the "recorder already installed" panic when
    /// several tests run in one process.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_app_state(providers: Vec<(ProviderId, ProviderSettings)>) -> AppState {
        AppState {
            gateway: Arc::new(Gateway::new(
                reqwest::Client::new(),
                TokenTracker::in_memory(),
                providers.into_iter().collect(),
                Duration::from_secs(5),
                OptimizeConfig::default(),
            )),
            metrics: ServiceMetrics::new(),
            prometheus: test_prometheus_handle(),
        }
    }

    fn provider_at(url: &str, tokens: &[&str], allow_anonymous: bool) -> ProviderSettings {
        ProviderSettings {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            allow_anonymous,
            generate_url: Some(format!("{url}/v1/images/generations")),
            upscale_url: Some(format!("{url}/upscale")),
            optimize_url: Some(format!("{url}/v1/chat/completions")),
            image_model: None,
            text_model: None,
        }
    }

    /// Mock provider: answers 429 for token "t1", 200 for anything else.
    /// Records the bearer token of every call.
    async fn start_mock_provider() -> (String, Arc<Mutex<Vec<Option<String>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let recorded = seen.clone();
        let app = axum::Router::new().fallback(move |request: Request<Body>| {
            let recorded = recorded.clone();
            async move {
                let token = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim_start_matches("Bearer ").to_string());
                recorded.lock().unwrap().push(token.clone());
                if token.as_deref() == Some("t1") {
                    return (
                        StatusCode::TOO_MANY_REQUESTS,
                        r#"{"error":{"message":"Too Many Requests"}}"#.to_string(),
                    );
                }
                (
                    StatusCode::OK,
                    serde_json::json!({
                        "data": [{"url": "https://img.example/1.png"}],
                        "choices": [{"message": {"content": "improved"}}],
                    })
                    .to_string(),
                )
            }
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, seen)
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn generate_rotates_and_hides_token() {
        let (url, seen) = start_mock_provider().await;
        let state = test_app_state(vec![(ProviderId::Gitee, provider_at(&url, &["t1", "t2"], false))]);
        let app = build_router(state.clone(), 10);

        let (status, json) = post_json(
            app,
            "/api/generate",
            r#"{"provider":"gitee","prompt":"a lighthouse at dusk","width":512,"height":512}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["provider"], "gitee");
        assert_eq!(json["token_index"], 1);
        assert_eq!(json["anonymous"], false);
        assert!(json["request_id"].as_str().unwrap().starts_with("req_"));
        assert!(!json.to_string().contains("\"t2\""));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(state.metrics.requests_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausted_tokens_return_429() {
        let (url, seen) = start_mock_provider().await;
        let state = test_app_state(vec![(ProviderId::Gitee, provider_at(&url, &["t1"], false))]);

        let body = r#"{"provider":"gitee","prompt":"fox"}"#;
        let (status, json) = post_json(build_router(state.clone(), 10), "/api/generate", body).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["error"]["type"], "tokens_exhausted");

        // Second request is refused without calling upstream again
        let (status, _) = post_json(build_router(state.clone(), 10), "/api/generate", body).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(state.metrics.errors_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let state = test_app_state(vec![]);
        let (status, json) =
            post_json(build_router(state, 10), "/api/generate", r#"{"provider":"nope"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
    }

    #[tokio::test]
    async fn optimize_returns_rewritten_prompt() {
        let (url, _) = start_mock_provider().await;
        let state = test_app_state(vec![(ProviderId::DeepSeek, provider_at(&url, &["d1"], false))]);

        let (status, json) = post_json(
            build_router(state, 10),
            "/api/optimize",
            r#"{"prompt":"fox"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"], "improved");
        assert_eq!(json["token_index"], 0);
    }

    #[tokio::test]
    async fn upscale_without_endpoint_is_unsupported() {
        let state = test_app_state(vec![]);
        let (status, json) = post_json(
            build_router(state, 10),
            "/api/upscale",
            r#"{"image":"https://img.example/in.png"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "provider_unsupported");
    }

    #[tokio::test]
    async fn health_reports_provider_availability() {
        let state = test_app_state(vec![
            (ProviderId::Gitee, provider_at("http://unused", &["t1"], false)),
            (ProviderId::ModelScope, provider_at("http://unused", &[], false)),
        ]);
        let app = build_router(state, 10);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["providers"]["gitee"]["status"], "healthy");
        assert_eq!(json["providers"]["modelscope"]["status"], "degraded");
        assert_eq!(json["providers"]["gitee"]["tokens"]["active"], 1);
    }

    #[tokio::test]
    async fn health_unhealthy_when_no_provider_usable() {
        let state = test_app_state(vec![]);
        let response = build_router(state, 10)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let state = test_app_state(vec![]);
        let response = build_router(state, 10)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
