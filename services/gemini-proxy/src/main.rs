//! Gemini key-pool proxy
//!
//! Single-binary service that:
//! 1. Loads a pool of Gemini API keys
//! 2. Leases one key per `POST /api/gemini` request, round-robin
//! 3. Calls `generateContent` upstream with the leased key
//! 4. Cools keys down after rate-limit or auth failures
//!
//! When every key is busy the caller gets a 503 with a queue position and a
//! `Retry-After` hint instead of waiting.

mod config;
mod error;
mod handler;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::{KeyPool, PoolHealth};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::GeminiProvider;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::ApiError;
use crate::handler::GenerateState;

/// Maximum time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    generate: GenerateState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Router limits taken from `[proxy]`.
#[derive(Debug, Clone, Copy)]
struct Limits {
    /// Concurrent in-flight requests across all routes
    max_connections: usize,
    /// Largest accepted request body
    max_body_bytes: usize,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, limits: Limits) -> Router {
    Router::new()
        .route(
            "/api/gemini",
            post(generate_handler).layer(DefaultBodyLimit::max(limits.max_body_bytes)),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(limits.max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        default_model = %config.proxy.default_model,
        keys = config.pool.keys.len(),
        "configuration loaded"
    );

    let pool = KeyPool::new(std::mem::take(&mut config.pool.keys));
    let sweep_handle = key_pool::spawn_sweep_task(pool.clone(), config.pool.sweep_interval());

    let provider = GeminiProvider::new(
        reqwest::Client::new(),
        config.proxy.upstream_url.clone(),
        Duration::from_secs(config.proxy.timeout_secs),
    );

    let app_state = AppState {
        generate: GenerateState {
            pool,
            provider: Arc::new(provider),
            default_model: config.proxy.default_model.clone(),
        },
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(
        app_state,
        Limits {
            max_connections: config.proxy.max_connections,
            max_body_bytes: config.proxy.max_body_bytes,
        },
    );

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the timer.
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

    sweep_handle.abort();
    info!("shutdown complete");
    Ok(())
}

/// `POST /api/gemini`: one leased key, one upstream call.
async fn generate_handler(
    State(state): State<AppState>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    handler::generate(&state.generate, body.map_err(ApiError::from), request_id).await
}

/// Health endpoint: pool snapshot plus uptime.
/// Returns 200 while at least one key can serve, 503 when none can.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.generate.pool.status();
    let status_code = match pool.status {
        PoolHealth::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        PoolHealth::Healthy | PoolHealth::Degraded => StatusCode::OK,
    };

    let body = serde_json::json!({
        "status": pool.status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "pool": pool,
    });

    (status_code, axum::Json(body))
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({ "ok": false, "error": "not found" })),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// If a handler cannot be installed that branch never fires; the other one
/// still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
