// src/daemon/mod.rs

//! pkgworker daemon - transaction API over a Unix socket
//!
//! The daemon provides:
//! - Creation, authorization and control of transactions
//! - Strict one-at-a-time execution on a dedicated worker thread
//! - SSE streams of property changes and queue changes
//!
//! # Architecture
//!
//! ```text
//! client                          pkgworker daemon
//!   │                                   │
//!   ├─ POST /v1/transactions ──────────►│ Transaction (Setup), pending
//!   │◄── 201 {id} ──────────────────────┤
//!   ├─ GET /v1/transactions/X/stream ──►│
//!   ├─ POST /v1/transactions/X/run ────►│ authorize, enqueue
//!   │                                   │        │
//!   │                                   │   worker thread executes
//!   │◄─────── SSE property changes ─────┤        │
//! ```
//!
//! # Module Structure
//!
//! - `auth` - Peer credentials, privilege checks and the audit trail
//! - `routes` - HTTP handlers
//! - `socket` - Unix socket listener
//! - `systemd` - Readiness, watchdog and idle tracking

pub mod auth;
pub mod routes;
pub mod socket;
pub mod systemd;

use crate::lock::FileLock;
use crate::transaction::{QueueHandle, QueueSettings, TransactionQueue};
use crate::worker::Worker;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::net::UnixListener;

pub use auth::{AuditEntry, AuditLogger, AuthChecker, PeerCredentials, Permission};
pub use systemd::{IdleTracker, SystemdManager, WatchdogTask};

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to Unix socket (default: /run/pkgworker/pkgworker.sock)
    pub socket_path: PathBuf,
    /// Socket file mode (default: 0o666; access is decided per request)
    pub socket_mode: u32,
    /// Socket group
    pub socket_group: Option<String>,
    /// Path to daemon lock file
    pub lock_path: PathBuf,
    /// Require PolicyKit for callers that are not root or trusted
    pub require_polkit: bool,
    /// Primary gids authorized without PolicyKit
    pub trusted_gids: Vec<u32>,
    /// Exit after idle timeout (for socket activation)
    pub idle_timeout_secs: Option<u64>,
    /// Queue timers
    pub queue: QueueSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/pkgworker/pkgworker.sock"),
            socket_mode: 0o666,
            socket_group: None,
            lock_path: PathBuf::from("/run/pkgworker/pkgworker.lock"),
            require_polkit: true,
            trusted_gids: Vec::new(),
            idle_timeout_secs: None,
            queue: QueueSettings::default(),
        }
    }
}

impl DaemonConfig {
    /// Set the socket path
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set the daemon lock path
    pub fn with_lock_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.lock_path = path.into();
        self
    }

    /// Set idle timeout for socket activation
    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }

    /// Grant every caller without PolicyKit (tests, single-user systems)
    pub fn without_polkit(mut self) -> Self {
        self.require_polkit = false;
        self
    }

    fn auth_checker(&self) -> AuthChecker {
        let checker = AuthChecker::new().with_trusted_gids(self.trusted_gids.iter().copied());
        if self.require_polkit {
            checker
        } else {
            checker.disable_polkit()
        }
    }
}

/// Error response format (RFC 7807)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonError {
    /// Error type URI
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable title
    pub title: String,
    /// HTTP status code
    pub status: u16,
    /// Detailed description
    pub detail: String,
    /// Instance URI (the request that caused the error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl DaemonError {
    pub fn new(error_type: &str, title: &str, status: u16, detail: &str) -> Self {
        Self {
            error_type: format!("urn:pkgworker:error:{}", error_type),
            title: title.to_string(),
            status,
            detail: detail.to_string(),
            instance: None,
        }
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new("not_found", "Not Found", 404, &format!("{} not found", resource))
    }

    /// Operation not valid in the transaction's current state
    pub fn conflict(detail: &str) -> Self {
        Self::new("conflict", "Conflict", 409, detail)
    }

    pub fn internal(detail: &str) -> Self {
        Self::new("internal", "Internal Error", 500, detail)
    }

    pub fn bad_request(detail: &str) -> Self {
        Self::new("bad_request", "Bad Request", 400, detail)
    }

    /// Caller does not own the transaction
    pub fn access_denied(detail: &str) -> Self {
        Self::new("access_denied", "Forbidden", 403, detail)
    }

    /// Caller lacks the privilege for the transaction's role
    pub fn not_authorized(detail: &str) -> Self {
        Self::new("not_authorized", "Forbidden", 403, detail)
    }

    pub fn with_instance(mut self, instance: String) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Whether this is the ownership fault
    pub fn is_access_denied(&self) -> bool {
        self.error_type.ends_with(":access_denied")
    }
}

impl From<&Error> for DaemonError {
    fn from(err: &Error) -> Self {
        match err {
            Error::AccessDenied(msg) => DaemonError::access_denied(msg),
            Error::AuthError(msg) => DaemonError::not_authorized(msg),
            Error::NotFoundError(msg) => DaemonError::not_found(msg),
            Error::InvalidState(msg) => DaemonError::conflict(msg),
            Error::ParseError(msg) => DaemonError::bad_request(msg),
            other => DaemonError::internal(&other.to_string()),
        }
    }
}

/// Daemon state (shared across handlers)
pub struct DaemonState {
    pub config: DaemonConfig,
    /// Handle to the queue actor
    pub queue: QueueHandle,
    pub auth: AuthChecker,
    pub audit: AuditLogger,
    pub started_at: Instant,
    /// Open SSE streams
    pub sse_connections: AtomicU64,
}

impl DaemonState {
    /// Start the queue actor and the worker thread
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: DaemonConfig, worker: Worker) -> Result<Arc<Self>> {
        let (queue, jobs) = TransactionQueue::spawn(config.queue.clone());
        worker
            .spawn(jobs, queue.clone())
            .map_err(|e| Error::DaemonError(format!("Failed to start worker thread: {}", e)))?;

        Ok(Arc::new(Self {
            auth: config.auth_checker(),
            config,
            queue,
            audit: AuditLogger::new(),
            started_at: Instant::now(),
            sse_connections: AtomicU64::new(0),
        }))
    }
}

/// Check if a daemon holds the lock at `lock_path`
pub fn is_daemon_running(lock_path: &std::path::Path) -> bool {
    FileLock::is_held(lock_path)
}

/// Serve one accepted connection
fn spawn_connection(app: &axum::Router, stream: tokio::net::UnixStream, connections: Arc<AtomicU64>) {
    use hyper::server::conn::http1;
    use hyper_util::rt::TokioIo;
    use hyper_util::service::TowerToHyperService;

    let creds = match PeerCredentials::from_socket(&stream) {
        Ok(creds) => creds,
        Err(e) => {
            log::warn!("Rejecting connection without peer credentials: {}", e);
            return;
        }
    };
    let app = app.clone().layer(axum::Extension(creds));

    connections.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let service = TowerToHyperService::new(app);
        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            log::debug!("Error serving connection: {:?}", err);
        }
        connections.fetch_sub(1, Ordering::Relaxed);
    });
}

/// Accept connections on `listener` until the task is dropped
///
/// No idle or watchdog handling; [`run_daemon`] adds those.
pub async fn serve(listener: UnixListener, state: Arc<DaemonState>) {
    let app = routes::build_router(state);
    let connections = Arc::new(AtomicU64::new(0));
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => spawn_connection(&app, stream, connections.clone()),
            Err(e) => log::error!("Failed to accept connection: {}", e),
        }
    }
}

/// Run the daemon
///
/// This is the main entry point for the daemon. It:
/// 1. Acquires the daemon lock
/// 2. Starts the queue and the worker thread
/// 3. Binds the Unix socket (or takes it from systemd)
/// 4. Serves until a shutdown signal or the idle timeout
pub async fn run_daemon(config: DaemonConfig, worker: Worker) -> Result<()> {
    use std::time::Duration;

    log::info!("Starting pkgworker daemon version {}", env!("CARGO_PKG_VERSION"));

    let idle_timeout = config.idle_timeout_secs.map(Duration::from_secs);
    let mut systemd_manager = SystemdManager::new(idle_timeout);
    if systemd_manager.is_systemd() {
        log::info!("Running under systemd supervision");
    }

    let mut daemon_lock = FileLock::try_acquire(&config.lock_path)?
        .ok_or_else(|| Error::DaemonError("Another daemon instance is already running".to_string()))?;
    daemon_lock.write_pid()?;
    log::info!("Daemon PID: {}", std::process::id());

    let state = DaemonState::start(config.clone(), worker)?;
    let app = routes::build_router(state.clone());

    let mut socket_manager = socket::SocketManager::new(socket::SocketConfig {
        path: config.socket_path.clone(),
        mode: config.socket_mode,
        group: config.socket_group.clone(),
    });
    let listener = socket_manager.bind()?;

    systemd_manager.notify_ready(Some("pkgworker ready for connections"));
    log::info!("Daemon ready, accepting connections");

    let active_connections = Arc::new(AtomicU64::new(0));
    let mut queue_changes = state.queue.subscribe();
    let shutdown = tokio::signal::ctrl_c();

    tokio::select! {
        _ = async {
            loop {
                let tick_interval = systemd_manager.tick_interval();
                match tokio::time::timeout(tick_interval, listener.accept()).await {
                    Ok(Ok((stream, _addr))) => {
                        systemd_manager.activity();
                        spawn_connection(&app, stream, active_connections.clone());
                    }
                    Ok(Err(e)) => {
                        log::error!("Failed to accept connection: {}", e);
                    }
                    Err(_) => {
                        systemd_manager.watchdog_tick();

                        let mut changed = false;
                        while queue_changes.try_recv().is_ok() {
                            changed = true;
                        }
                        if changed {
                            let snapshot = state.queue.snapshot().await;
                            systemd_manager.notify_status(&systemd::describe_queue(&snapshot));
                        }

                        if !state.queue.is_idle().await
                            || active_connections.load(Ordering::Relaxed) > 0
                        {
                            systemd_manager.activity();
                        } else if systemd_manager.is_idle_expired() {
                            log::info!("Idle timeout expired, shutting down");
                            break;
                        }
                    }
                }
            }
        } => {}
        _ = shutdown => {
            log::info!("Received shutdown signal");
        }
    }

    systemd_manager.notify_stopping();
    log::info!("Daemon shutting down");
    drop(socket_manager);
    drop(daemon_lock);
    Ok(())
}
