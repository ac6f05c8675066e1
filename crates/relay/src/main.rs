mod auth;
mod config;
mod db;
mod error;
mod metrics;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::{access::PictureAccessStore, jwt::JwtIdentityService};
use crate::config::RelayConfig;
use crate::db::pool::{check_pool_health, create_pg_pool, PoolConfig};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::metrics::RelayMetrics;
use crate::ws::{heartbeat::HeartbeatMonitor, CollabState};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set PICSYNC_RELAY_JWT_SECRET in production");
    }

    let identity = Arc::new(
        JwtIdentityService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );
    let access = build_access_store(&config).await?;
    metrics::set_global_metrics(Arc::new(RelayMetrics::default()));

    let state = CollabState::new(identity, access, config.collab.clone());
    HeartbeatMonitor::new(Arc::clone(&state.registry), &config.collab).spawn();
    let app = build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

async fn build_access_store(config: &RelayConfig) -> anyhow::Result<PictureAccessStore> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("PICSYNC_RELAY_DATABASE_URL is not set; using the in-memory access store");
        let store = PictureAccessStore::in_memory();
        for picture_id in &config.dev_public_pictures {
            store.insert_public_picture(*picture_id).await;
        }
        return Ok(store);
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to the picture database")?;
    check_pool_health(&pool).await.context("picture database health check failed")?;
    info!("picture access store connected to PostgreSQL");

    Ok(PictureAccessStore::Postgres(pool))
}

fn build_router(state: CollabState) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_endpoint))
            .merge(ws::router(state)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_endpoint() -> Response {
    let body = metrics::global_metrics().map(|metrics| metrics.render_prometheus());
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        body.unwrap_or_default(),
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
