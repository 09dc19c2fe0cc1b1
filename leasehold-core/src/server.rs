//! HTTP front end for the [`LeaseRegistry`].
//!
//! | Route | Answer |
//! |---|---|
//! | `POST /lease/{name}?owner=` | `201` grant or renewal, or a parked request answered at termination with `200` + payload or `408` |
//! | `PUT /lease/{name}?owner=` | `200` released, `409` not the owner, `404` not held |
//! | `GET /status` | `200` + [`StatusBody`] |
//!
//! Every request body is checked before routing: oversized is `413`, non-JSON
//! is `400`. A malformed `owner` query is also `400`.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http_body_util::LengthLimitError;
use serde_json::Value;
use sysinfo::System;
use tokio::{net::TcpListener, sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    proto::{ErrorBody, GrantBody, MemoryUsage, OwnerQuery, StatusBody, MALFORMED_BODY_MESSAGE},
    registry::{self, Acquired, LeaseRegistry, RegistryConfig, Termination, DEFAULT_TTL},
    Result,
};

/// Largest request body accepted when none is configured
pub const DEFAULT_MAX_BODY: usize = 10 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Lease TTL handed to the registry
    pub ttl: Duration,

    /// Request bodies longer than this many bytes are refused with `413`
    pub max_body: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

#[derive(Clone)]
struct AppState {
    registry: LeaseRegistry,
    max_body: usize,
    started: Instant,
    system: Arc<Mutex<System>>,
}

/// Build the lease routes over `registry`.
pub fn router(registry: LeaseRegistry, max_body: usize) -> Router {
    let state = AppState {
        registry,
        max_body,
        started: Instant::now(),
        system: Arc::new(Mutex::new(System::new())),
    };
    Router::new()
        .route(
            "/lease/{name}",
            post(acquire).put(release).fallback(not_found),
        )
        .route("/status", get(status).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

/// Bind the listening socket for [`serve`].
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let address = format!("{}:{}", host, port);
    match TcpListener::bind(&address).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            error!("failed to bind to address {}: {}", address, e);
            Err(anyhow::anyhow!("failed to bind to address {}: {}", address, e))
        }
    }
}

/// Serve leases on `listener` until `cancel` fires.
///
/// On cancellation the registry is closed so that parked acquirers are
/// answered and the server can drain.
#[tracing::instrument(skip_all, err)]
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let registry = LeaseRegistry::new(RegistryConfig { ttl: config.ttl });
    let addr = listener.local_addr()?;
    let ttl = registry.ttl().await;
    info!(%addr, ttl = ttl.as_millis() as u64, "leasehold server started");

    let app = router(registry.clone(), config.max_body);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            let dropped = registry.close().await;
            info!(dropped, "leasehold server shutting down");
        })
        .await
        .context("serving leases")?;
    Ok(())
}

async fn acquire(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: std::result::Result<Query<OwnerQuery>, QueryRejection>,
    body: Body,
) -> Response {
    // Acquire carries no body, but a broken one is still refused.
    let (query, _) = match read_request(query, body, state.max_body).await {
        Ok(request) => request,
        Err(rejection) => return rejection.into_response(),
    };
    debug!(lease = %name, owner = %query.owner, "acquire");
    match state.registry.acquire(&name, &query.owner).await {
        Acquired::Granted(grant) | Acquired::Renewed(grant) => {
            (StatusCode::CREATED, Json(GrantBody::from(&grant))).into_response()
        }
        Acquired::Queued(waiter) => match waiter.outcome().await {
            Some(Termination::Released(payload)) => (StatusCode::OK, Json(payload)).into_response(),
            Some(Termination::Expired) => StatusCode::REQUEST_TIMEOUT.into_response(),
            None => {
                debug!("registry closed while waiting");
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        },
    }
}

async fn release(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: std::result::Result<Query<OwnerQuery>, QueryRejection>,
    body: Body,
) -> Response {
    let (query, payload) = match read_request(query, body, state.max_body).await {
        Ok(request) => request,
        Err(rejection) => return rejection.into_response(),
    };
    debug!(lease = %name, owner = %query.owner, "release");
    match state.registry.release(&name, &query.owner, payload).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(registry::Error::OwnershipConflict { .. }) => StatusCode::CONFLICT.into_response(),
        Err(registry::Error::LeaseNotFound) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let snapshot = state.registry.snapshot().await;
    let memory = memory_usage(&mut *state.system.lock().await);
    Json(StatusBody {
        lease: snapshot.leases,
        lease_stats: snapshot.stats,
        uptime: state.started.elapsed().as_secs_f64(),
        memory,
    })
}

/// Unrouted requests still have their body checked first.
async fn not_found(State(state): State<AppState>, body: Body) -> Response {
    match read_json_body(body, state.max_body).await {
        Ok(_) => StatusCode::NOT_FOUND.into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

fn memory_usage(system: &mut System) -> Option<MemoryUsage> {
    let pid = sysinfo::get_current_pid().ok()?;
    if !system.refresh_process(pid) {
        return None;
    }
    let process = system.process(pid)?;
    Some(MemoryUsage {
        rss: process.memory(),
        virtual_memory: process.virtual_memory(),
    })
}

#[derive(Debug, PartialEq)]
enum Rejection {
    TooLarge,
    Malformed,
    Query(String),
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::TooLarge => StatusCode::PAYLOAD_TOO_LARGE.into_response(),
            Rejection::Malformed => bad_request(MALFORMED_BODY_MESSAGE.to_owned()),
            Rejection::Query(error) => bad_request(error),
        }
    }
}

fn bad_request(error: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            code: StatusCode::BAD_REQUEST.as_u16(),
            error,
        }),
    )
        .into_response()
}

/// Check the body, then the owner query.
async fn read_request(
    query: std::result::Result<Query<OwnerQuery>, QueryRejection>,
    body: Body,
    limit: usize,
) -> std::result::Result<(OwnerQuery, Option<Value>), Rejection> {
    let payload = read_json_body(body, limit).await?;
    let Query(query) = query.map_err(|rejection| Rejection::Query(rejection.body_text()))?;
    Ok((query, payload))
}

/// Read at most `limit` bytes of JSON. An empty body is `None`.
async fn read_json_body(
    body: Body,
    limit: usize,
) -> std::result::Result<Option<Value>, Rejection> {
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(err) if is_length_limit(&err) => return Err(Rejection::TooLarge),
        Err(err) => {
            debug!(?err, "reading request body");
            return Err(Rejection::Malformed);
        }
    };
    if bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|_| Rejection::Malformed)
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}
