//! HTTP Server
//!
//! The relay's one listening socket: the viewer WebSocket plus health,
//! metrics and the two placeholder pages.
//!
//! # Endpoints
//!
//! - `GET /` - `{"hello": "index page"}`
//! - `GET /api/{name}` - echoes the name as text
//! - `GET /risk/` - viewer WebSocket upgrade
//! - `GET /health` - JSON health status
//! - `GET /healthz` - liveness probe
//! - `GET /readyz` - readiness probe (upstream login accepted)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::upstream::LinkState;
use crate::infrastructure::viewer::{SessionContext, run_session};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream link status.
    pub upstream: UpstreamStatus,
    /// Live viewer sessions.
    pub sessions: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream connected and logged in.
    Healthy,
    /// Connected, login pending.
    Degraded,
    /// No upstream connection.
    Unhealthy,
}

/// Upstream link status.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    /// Transport is up.
    pub connected: bool,
    /// Login accepted.
    pub logged_in: bool,
    /// Frames received since startup.
    pub frames_received: u64,
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    version: String,
    started_at: Instant,
    link: Arc<LinkState>,
    sessions: Arc<SessionContext>,
}

impl AppState {
    /// Create handler state.
    #[must_use]
    pub fn new(version: String, link: Arc<LinkState>, sessions: Arc<SessionContext>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            link,
            sessions,
        }
    }
}

/// Build the relay's router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/{name}", get(api_handler))
        .route("/risk/", get(risk_socket_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// Bound HTTP server.
#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError::BindFailed` if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<AppState>,
        cancel: CancellationToken,
    ) -> Result<Self, HttpServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(addr, e.to_string()))?;
        Ok(Self {
            listener,
            state,
            cancel,
        })
    }

    /// Address actually bound (resolves port 0).
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError::ServerFailed` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, HttpServerError> {
        self.listener
            .local_addr()
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError::ServerFailed` if the server stops with an error.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "HTTP server listening");

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn index_handler() -> impl IntoResponse {
    Json(json!({"hello": "index page"}))
}

async fn api_handler(Path(name): Path<String>) -> impl IntoResponse {
    format!("api: {name}\n")
}

async fn risk_socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let sessions = Arc::clone(&state.sessions);
    ws.on_upgrade(move |socket| run_session(socket, sessions))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.link.is_logged_in() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let upstream = UpstreamStatus {
        connected: state.link.is_connected(),
        logged_in: state.link.is_logged_in(),
        frames_received: state.link.frames_received(),
    };

    HealthResponse {
        status: determine_health_status(&upstream),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream,
        sessions: state.sessions.registry.len(),
    }
}

const fn determine_health_status(upstream: &UpstreamStatus) -> HealthStatus {
    match (upstream.connected, upstream.logged_in) {
        (true, true) => HealthStatus::Healthy,
        (true, false) => HealthStatus::Degraded,
        (false, _) => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind the address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
