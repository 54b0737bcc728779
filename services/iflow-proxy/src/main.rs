//! iFlow gateway
//!
//! Single-binary Rust service that:
//! 1. Loads the account pool from the JSON account store
//! 2. Listens for OpenAI-compatible requests on `listen_addr`
//! 3. Forwards each request through the dispatcher, which rotates accounts,
//!    refreshes expired OAuth tokens and fails over on 429/401/403/5xx
//! 4. Serves the account admin API on `admin_addr` when configured

mod admin;
mod config;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use iflow_auth::{AccountStore, HttpTokenExchange};
use iflow_pool::{Dispatcher, Pool, ReqwestTransport, SystemClock};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::IflowProvider;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::proxy::ProxyState;

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the gateway router. `max_connections` caps concurrent requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs; LOG_LEVEL wins over RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting iflow-proxy");

    let prometheus_handle = metrics::install_recorder();

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

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        accounts_path = %config.pool.accounts_path.display(),
        strategy = config.pool.selection_strategy.label(),
        max_request_iterations = config.pool.max_request_iterations,
        request_timeout_ms = config.pool.request_timeout_ms,
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let store = Arc::new(AccountStore::new(config.pool.accounts_path.clone()));
    let pool = Pool::load(store, config.pool.selection_strategy, Arc::new(SystemClock))
        .await
        .with_context(|| {
            format!(
                "failed to load accounts from {}",
                config.pool.accounts_path.display()
            )
        })?;
    let pool = Arc::new(pool);
    if pool.is_empty().await {
        warn!("account pool is empty, requests will fail until an account is added");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        Arc::new(ReqwestTransport::new(
            client.clone(),
            Duration::from_secs(config.proxy.attempt_timeout_secs),
        )),
        Arc::new(HttpTokenExchange::new(client)),
        Arc::new(IflowProvider::new()),
        config.dispatch_config(),
    ));

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        proxy: ProxyState {
            dispatcher,
            upstream_url: config.proxy.upstream_url.clone(),
            metrics: metrics.clone(),
        },
        metrics,
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.proxy.max_connections);

    let admin_handle = match config.proxy.admin_addr {
        Some(admin_addr) => {
            let admin_listener = TcpListener::bind(admin_addr)
                .await
                .with_context(|| format!("failed to bind admin API to {admin_addr}"))?;
            info!(addr = %admin_addr, "admin API listening");
            let admin_app = build_admin_router(AdminState::new(pool.clone()));
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(admin_listener, admin_app).await {
                    error!(error = %e, "admin API server failed");
                }
            }))
        }
        None => None,
    };

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, accounts = pool.count().await, "accepting requests");

    // The drain timer starts at signal receipt, not at server start.
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
    if let Some(handle) = admin_handle {
        handle.abort();
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    if let Err(e) = pool.save().await {
        warn!(error = %e, "failed to persist account pool on shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

/// Pool health plus process counters. 200 while at least one account is
/// available, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.proxy.dispatcher.pool().health().await;
    let available = body["accounts_available"].as_u64().unwrap_or(0);

    body["uptime_seconds"] = state.metrics.started_at.elapsed().as_secs().into();
    body["requests_served"] = state.metrics.requests_total.load(Ordering::Relaxed).into();
    body["errors_total"] = state.metrics.errors_total.load(Ordering::Relaxed).into();

    let status = if available > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Catch-all handler that forwards every other request upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
