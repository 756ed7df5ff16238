// src/daemon/routes.rs

//! Axum router configuration for pkgworker
//!
//! Defines all HTTP routes for the daemon REST API:
//! - `/health` - Health check endpoint
//! - `/v1/version` - API version info
//! - `/v1/transactions` - Transaction creation and control
//! - `/v1/queue` - Queue snapshot and change stream
//!
//! Mutating routes check ownership before touching the transaction. A
//! non-owner gets a 403 `access_denied` problem and the attempt is audited.

use crate::daemon::{DaemonError, DaemonState, PeerCredentials};
use crate::transaction::{
    ExitStatus, PropertyChange, QueueChange, Role, Status, Transaction, TransactionRequest,
};
use crate::Error;
use axum::{
    Extension, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post, put},
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Shared daemon state type
pub type SharedState = Arc<DaemonState>;

/// API version reported by `/v1/version`
pub const API_VERSION: &str = "1";

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
    /// Transaction currently executing
    pub active: Option<String>,
    pub queued: usize,
    /// Open property and queue streams
    pub streams: u64,
}

/// Version information response
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub api_version: String,
}

/// Short description of a transaction, returned by control routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub id: String,
    pub role: Role,
    pub status: Status,
    pub exit_status: ExitStatus,
}

impl From<&Transaction> for TransactionSummary {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id().to_string(),
            role: tx.role(),
            status: tx.status(),
            exit_status: tx.exit_status(),
        }
    }
}

/// Body of `POST /v1/transactions/:id/medium`
#[derive(Debug, Serialize, Deserialize)]
pub struct MediumReply {
    pub mount_point: String,
}

/// Body of `POST /v1/transactions/:id/untrusted`
#[derive(Debug, Serialize, Deserialize)]
pub struct UntrustedReply {
    pub approved: bool,
}

/// Body of `POST /v1/transactions/:id/conffile`
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFileReply {
    pub path: String,
    pub replace: bool,
}

/// Error response wrapper for RFC 7807 format
pub struct ApiError(DaemonError);

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        ApiError(err)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(DaemonError::from(&err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = Json(&self.0);

        (status, [("content-type", "application/problem+json")], body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Build the router
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/version", get(version_handler))
        .route("/v1/transactions", post(create_transaction_handler))
        .route("/v1/transactions/:id", get(get_transaction_handler))
        .route("/v1/transactions/:id/properties", put(set_property_handler))
        .route("/v1/transactions/:id/run", post(run_handler))
        .route("/v1/transactions/:id/cancel", post(cancel_handler))
        .route("/v1/transactions/:id/medium", post(medium_handler))
        .route("/v1/transactions/:id/untrusted", post(untrusted_handler))
        .route("/v1/transactions/:id/conffile", post(conffile_handler))
        .route("/v1/transactions/:id/stream", get(transaction_stream_handler))
        .route("/v1/transactions/:id/output", get(output_handler))
        .route("/v1/queue", get(queue_handler))
        .route("/v1/queue/stream", get(queue_stream_handler))
        .with_state(state)
}

// =============================================================================
// Helpers
// =============================================================================

async fn lookup(state: &SharedState, id: &str) -> ApiResult<Arc<Transaction>> {
    state
        .queue
        .get(id)
        .await
        .ok_or_else(|| ApiError(DaemonError::not_found(&format!("transaction '{}'", id))))
}

/// Reject non-owners before any transaction logic runs
fn require_owner(
    state: &SharedState,
    tx: &Transaction,
    creds: PeerCredentials,
    action: &str,
) -> ApiResult<()> {
    if let Err(e) = tx.check_owner(creds.uid) {
        state.audit.log_action(creds, action, false, &e.to_string());
        return Err(e.into());
    }
    Ok(())
}

/// Decrements the SSE counter when a stream is dropped
struct StreamGuard(SharedState);

impl StreamGuard {
    fn new(state: SharedState) -> Self {
        state.sse_connections.fetch_add(1, Ordering::Relaxed);
        Self(state)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.sse_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

fn lagged_event(what: &str, n: u64) -> Event {
    log::warn!("SSE client ({}) lagged {} events", what, n);
    Event::default()
        .event("warning")
        .data(format!(r#"{{"lagged": {}}}"#, n))
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(30))
        .text("keepalive")
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /health
async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let snapshot = state.queue.snapshot().await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pid: std::process::id(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        active: snapshot.active,
        queued: snapshot.queued.len(),
        streams: state.sse_connections.load(Ordering::Relaxed),
    })
}

/// GET /v1/version
async fn version_handler() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: API_VERSION.to_string(),
    })
}

/// Create a pending transaction owned by the caller
///
/// POST /v1/transactions
async fn create_transaction_handler(
    State(state): State<SharedState>,
    Extension(creds): Extension<PeerCredentials>,
    Json(request): Json<TransactionRequest>,
) -> ApiResult<impl IntoResponse> {
    let tx = Transaction::from_request(request, creds.uid);
    state.queue.add_pending(tx.clone()).await;
    state.audit.log_action(
        creds,
        "create",
        true,
        &format!("transaction {} ({})", tx.id(), tx.role()),
    );

    let location = format!("/v1/transactions/{}", tx.id());
    Ok((
        StatusCode::CREATED,
        [(axum::http::header::LOCATION, location)],
        Json(TransactionSummary::from(tx.as_ref())),
    ))
}

/// Full property map, in wire order
///
/// GET /v1/transactions/:id
async fn get_transaction_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<PropertyChange>>> {
    let tx = lookup(&state, &id).await?;
    let properties = tx.properties().iter().map(PropertyChange::from).collect();
    Ok(Json(properties))
}

/// Recent terminal output of the install child
///
/// GET /v1/transactions/:id/output
async fn output_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    let tx = lookup(&state, &id).await?;
    Ok(Json(tx.terminal_output()))
}

/// Set a client-writable session property
///
/// PUT /v1/transactions/:id/properties
async fn set_property_handler(
    State(state): State<SharedState>,
    Extension(creds): Extension<PeerCredentials>,
    Path(id): Path<String>,
    Json(change): Json<PropertyChange>,
) -> ApiResult<StatusCode> {
    let tx = lookup(&state, &id).await?;
    require_owner(&state, &tx, creds, "set-property")?;
    let property = change.decode()?;
    tx.set_property(creds.uid, property)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Authorize the transaction and queue it
///
/// POST /v1/transactions/:id/run
async fn run_handler(
    State(state): State<SharedState>,
    Extension(creds): Extension<PeerCredentials>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<TransactionSummary>)> {
    let tx = lookup(&state, &id).await?;
    require_owner(&state, &tx, creds, "run")?;

    let auth = state.auth.clone();
    let result = tx
        .run(creds.uid, &state.queue, move |privilege| {
            auth.authorize(&creds, privilege)
        })
        .await;

    let allowed = !matches!(result, Err(Error::AuthError(_)));
    state.audit.log_action(
        creds,
        "run",
        allowed,
        &format!("transaction {} ({})", id, tx.role().privilege()),
    );
    result?;

    Ok((StatusCode::ACCEPTED, Json(TransactionSummary::from(tx.as_ref()))))
}

/// POST /v1/transactions/:id/cancel
async fn cancel_handler(
    State(state): State<SharedState>,
    Extension(creds): Extension<PeerCredentials>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransactionSummary>> {
    let tx = lookup(&state, &id).await?;
    require_owner(&state, &tx, creds, "cancel")?;
    tx.cancel(creds.uid)?;
    state
        .audit
        .log_action(creds, "cancel", true, &format!("transaction {}", id));

    // Never-run transactions finish immediately and leave the pending set
    if tx.is_finished() {
        state.queue.remove(&id).await;
    }
    Ok(Json(TransactionSummary::from(tx.as_ref())))
}

/// POST /v1/transactions/:id/medium
async fn medium_handler(
    State(state): State<SharedState>,
    Extension(creds): Extension<PeerCredentials>,
    Path(id): Path<String>,
    Json(reply): Json<MediumReply>,
) -> ApiResult<StatusCode> {
    let tx = lookup(&state, &id).await?;
    require_owner(&state, &tx, creds, "provide-medium")?;
    tx.provide_medium(creds.uid, &reply.mount_point)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/transactions/:id/untrusted
async fn untrusted_handler(
    State(state): State<SharedState>,
    Extension(creds): Extension<PeerCredentials>,
    Path(id): Path<String>,
    Json(reply): Json<UntrustedReply>,
) -> ApiResult<StatusCode> {
    let tx = lookup(&state, &id).await?;
    require_owner(&state, &tx, creds, "reply-untrusted")?;
    tx.reply_untrusted_prompt(creds.uid, reply.approved)?;
    state.audit.log_action(
        creds,
        "reply-untrusted",
        true,
        &format!("transaction {} approved={}", id, reply.approved),
    );
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/transactions/:id/conffile
async fn conffile_handler(
    State(state): State<SharedState>,
    Extension(creds): Extension<PeerCredentials>,
    Path(id): Path<String>,
    Json(reply): Json<ConfigFileReply>,
) -> ApiResult<StatusCode> {
    let tx = lookup(&state, &id).await?;
    require_owner(&state, &tx, creds, "resolve-conffile")?;
    tx.resolve_config_file_conflict(creds.uid, &reply.path, reply.replace)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Property change stream (SSE)
///
/// GET /v1/transactions/:id/stream
///
/// The stream will:
/// - Send every property as a "property" event
/// - Stream each change as a "property" event
/// - End when the transaction is destroyed
///
/// The subscription is taken before the snapshot, so a change racing the
/// snapshot may be sent twice but is never lost.
async fn transaction_stream_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let tx = lookup(&state, &id).await?;
    let rx = tx.subscribe();
    let snapshot: Vec<PropertyChange> = tx.properties().iter().map(PropertyChange::from).collect();
    // The stream must not keep the transaction alive
    drop(tx);

    let guard = StreamGuard::new(state);
    let initial = stream::iter(snapshot).filter_map(|change| {
        serde_json::to_string(&change)
            .ok()
            .map(|json| Ok(Event::default().event("property").data(json)))
    });

    let changes = BroadcastStream::new(rx).filter_map(move |result| {
        let _guard = &guard;
        match result {
            Ok(change) => serde_json::to_string(&change)
                .ok()
                .map(|json| Ok(Event::default().event("property").data(json))),
            Err(BroadcastStreamRecvError::Lagged(n)) => Some(Ok(lagged_event(&id, n))),
        }
    });

    Ok(Sse::new(initial.chain(changes)).keep_alive(keep_alive()))
}

/// GET /v1/queue
async fn queue_handler(State(state): State<SharedState>) -> Json<QueueChange> {
    Json(state.queue.snapshot().await)
}

/// Queue change stream (SSE)
///
/// GET /v1/queue/stream
///
/// Sends the current queue as a "queue" event, then one per change.
async fn queue_stream_handler(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.queue.subscribe();
    let current = state.queue.snapshot().await;
    let guard = StreamGuard::new(state);

    let initial = stream::once(async move {
        Ok(Event::default()
            .event("queue")
            .data(serde_json::to_string(&current).unwrap_or_default()))
    });

    let changes = BroadcastStream::new(rx).filter_map(move |result| {
        let _guard = &guard;
        match result {
            Ok(change) => serde_json::to_string(&change)
                .ok()
                .map(|json| Ok(Event::default().event("queue").data(json))),
            Err(BroadcastStreamRecvError::Lagged(n)) => Some(Ok(lagged_event("queue", n))),
        }
    });

    Sse::new(initial.chain(changes)).keep_alive(keep_alive())
}
