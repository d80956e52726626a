//! HTTP surface of a registry node, plus the background loops that keep it
//! honest: eviction sweeps, cache rebuilds, the renewal-rate minute tick,
//! and per-peer replication drains.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cache::{PayloadEncoding, PayloadFormat, ResponseCache};
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::eviction::EvictionController;
use crate::instance::{InstanceRecord, InstanceStatus};
use crate::preservation::SelfPreservationMonitor;
use crate::registry::{Origin, Registry};
use crate::replication::{BatchResponse, ReplicationBatch, ReplicationDispatcher};
use crate::store::InstanceStore;

/// Initialize tracing subscriber. Uses RUST_LOG env var for filtering
/// (defaults to info).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(filter)
        .init();
}

pub struct AppState {
    pub registry: Arc<Registry>,
    pub started_at: DateTime<Utc>,
}

pub fn build_registry(config: &RegistryConfig) -> Arc<Registry> {
    let store = Arc::new(InstanceStore::new());
    let monitor = SelfPreservationMonitor::new(
        config.preservation.enabled,
        config.lease.renewal_interval_secs,
        config.preservation.renewal_percent_threshold,
    );
    let cache = ResponseCache::new(
        config.cache.changelog_capacity,
        config.delta_retention_ms(),
        config.cache.delta_entry_cap,
    );
    let dispatcher = ReplicationDispatcher::new(config.replication_options());
    Arc::new(Registry::new(
        store,
        cache,
        monitor,
        dispatcher,
        config.lease_duration_ms(),
    ))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/apps", get(get_applications))
        .route("/v1/apps/delta", get(get_delta))
        .route("/v1/apps/:app", post(register_instance).get(get_application))
        .route("/v1/apps/:app/:id", delete(cancel_instance))
        .route("/v1/apps/:app/:id/renew", put(renew_instance))
        .route("/v1/apps/:app/:id/status", put(update_status))
        .route("/v1/peer/batch", post(apply_peer_batch))
        .route("/v1/status", get(get_status))
        .route("/v1/peers", get(get_peers))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Run a registry node until `signal` resolves. Spawns the eviction,
/// cache-rebuild, minute-tick, and replication tasks; all of them stop
/// through one watch channel once the server exits.
pub async fn serve_with_shutdown(
    config: RegistryConfig,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let registry = build_registry(&config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    registry
        .dispatcher()
        .spawn(Arc::clone(registry.store()), shutdown_rx.clone())
        .map_err(anyhow::Error::msg)?;

    let eviction = EvictionController::new(
        Arc::clone(&registry),
        config.eviction_interval(),
        config.lease.eviction_jitter_ms,
    );
    tokio::spawn(eviction.run(shutdown_rx.clone()));
    tokio::spawn(cache_rebuild_loop(
        Arc::clone(&registry),
        config.rebuild_interval(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(minute_tick_loop(Arc::clone(&registry), shutdown_rx));

    let state = Arc::new(AppState {
        registry,
        started_at: Utc::now(),
    });
    let app = build_router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, node = %config.node_name, peers = config.peers.len(), "registry listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await?;

    info!("server stopped, shutting down background tasks");
    let _ = shutdown_tx.send(true);
    Ok(())
}

pub async fn serve(config: RegistryConfig) -> anyhow::Result<()> {
    serve_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
}

async fn cache_rebuild_loop(
    registry: Arc<Registry>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(interval) => {
                if let Err(err) = registry.rebuild_cache(current_time_ms()) {
                    warn!(error = %err, "cache rebuild failed");
                }
            }
            _ = shutdown.changed() => {
                debug!("cache rebuild loop stopping");
                break;
            }
        }
    }
}

async fn minute_tick_loop(registry: Arc<Registry>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = sleep(std::time::Duration::from_secs(60)) => {
                registry.monitor().tick_minute();
                registry.monitor().log_state();
            }
            _ = shutdown.changed() => {
                debug!("minute tick loop stopping");
                break;
            }
        }
    }
}

#[derive(Deserialize)]
struct FormatQuery {
    format: Option<String>,
}

#[derive(Deserialize)]
struct StatusValueQuery {
    value: String,
}

#[derive(Deserialize)]
struct DeltaQuery {
    since: u64,
}

#[derive(Serialize)]
struct NodeStatusResponse {
    node_name: String,
    started_at: String,
    uptime_secs: u64,
    instance_count: usize,
    application_count: usize,
    generation: u64,
    cache_entries: usize,
    cache_recomputes: u64,
    renewals_last_minute: u64,
    renewal_threshold: f64,
    self_preservation_active: bool,
    peer_count: usize,
}

async fn register_instance(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    Json(record): Json<InstanceRecord>,
) -> Response {
    if !record.app_name.eq_ignore_ascii_case(&app) {
        return (
            StatusCode::BAD_REQUEST,
            format!(
                "app name mismatch: path '{}' vs record '{}'",
                app, record.app_name
            ),
        )
            .into_response();
    }
    match state
        .registry
        .register(record, Origin::Local, current_time_ms())
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn renew_instance(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
) -> Response {
    match state
        .registry
        .renew(&app, &id, Origin::Local, current_time_ms())
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn cancel_instance(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
) -> Response {
    match state
        .registry
        .cancel(&app, &id, Origin::Local, current_time_ms())
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    Query(query): Query<StatusValueQuery>,
) -> Response {
    let status = match InstanceStatus::from_name(&query.value) {
        Some(status) => status,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unknown status '{}'", query.value),
            )
                .into_response()
        }
    };
    let now_ms = current_time_ms();
    match state
        .registry
        .status_update(&app, &id, status, now_ms, Origin::Local, now_ms)
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn get_applications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FormatQuery>,
    headers: HeaderMap,
) -> Response {
    let format = match PayloadFormat::parse(query.format.as_deref()) {
        Some(format) => format,
        None => return unknown_format(query.format),
    };
    let encoding = negotiate_encoding(&headers);
    match state
        .registry
        .applications(format, encoding, current_time_ms())
    {
        Ok(body) => payload_response(body, encoding),
        Err(err) => error_response(err).into_response(),
    }
}

async fn get_application(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    Query(query): Query<FormatQuery>,
    headers: HeaderMap,
) -> Response {
    let format = match PayloadFormat::parse(query.format.as_deref()) {
        Some(format) => format,
        None => return unknown_format(query.format),
    };
    let encoding = negotiate_encoding(&headers);
    match state
        .registry
        .application(&app, format, encoding, current_time_ms())
    {
        Ok(body) => payload_response(body, encoding),
        Err(err) => error_response(err).into_response(),
    }
}

async fn get_delta(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeltaQuery>,
    headers: HeaderMap,
) -> Response {
    let encoding = negotiate_encoding(&headers);
    match state.registry.delta(query.since, encoding) {
        Ok(body) => payload_response(body, encoding),
        Err(err) => error_response(err).into_response(),
    }
}

async fn apply_peer_batch(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<ReplicationBatch>,
) -> Json<BatchResponse> {
    Json(state.registry.apply_batch(batch, current_time_ms()))
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<NodeStatusResponse> {
    let registry = &state.registry;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;
    Json(NodeStatusResponse {
        node_name: registry.dispatcher().node_name().to_string(),
        started_at: state.started_at.to_rfc3339(),
        uptime_secs,
        instance_count: registry.store().instance_count(),
        application_count: registry.store().app_count(),
        generation: registry.cache().generation(),
        cache_entries: registry.cache().entry_count(),
        cache_recomputes: registry.cache().recompute_count(),
        renewals_last_minute: registry.monitor().renewals_last_minute(),
        renewal_threshold: registry.monitor().renewal_threshold(),
        self_preservation_active: registry.monitor().is_active(),
        peer_count: registry.dispatcher().status().len(),
    })
}

async fn get_peers(State(state): State<Arc<AppState>>) -> Response {
    Json(state.registry.dispatcher().status()).into_response()
}

fn negotiate_encoding(headers: &HeaderMap) -> PayloadEncoding {
    let accepts_gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().starts_with("gzip"))
        })
        .unwrap_or(false);
    if accepts_gzip {
        PayloadEncoding::Gzip
    } else {
        PayloadEncoding::Identity
    }
}

fn payload_response(body: bytes::Bytes, encoding: PayloadEncoding) -> Response {
    match encoding {
        PayloadEncoding::Identity => (
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        PayloadEncoding::Gzip => (
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CONTENT_ENCODING, "gzip"),
            ],
            body,
        )
            .into_response(),
    }
}

fn unknown_format(format: Option<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!(
            "unknown format '{}', expected 'full' or 'compact'",
            format.unwrap_or_default()
        ),
    )
        .into_response()
}

fn error_response(err: RegistryError) -> (StatusCode, String) {
    let status = match &err {
        RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
        RegistryError::InstanceIdConflict { .. } => StatusCode::CONFLICT,
        RegistryError::FullSnapshotRequired { .. } => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn current_time_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
