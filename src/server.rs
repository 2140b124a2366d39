//! HTTP surface: query submission, SSE streaming, cancellation, health
//! and debug endpoints, plus HTTP Basic authentication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Path, Request, State},
    http::header,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::orchestrator::Orchestrator;
use crate::session::SessionStore;
use crate::sse::sse_response;

/// Maximum accepted message size, bytes.
const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Time allowed for in-flight generations to commit during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: SessionStore,
    pub orchestrator: Arc<Orchestrator>,
    /// Cleared on SIGTERM so new queries are refused while draining.
    pub accepting: Arc<AtomicBool>,
}

/// Start the server and block until shutdown completes.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    let shutdown = shutdown_signal(state.clone());
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/query", post(api_query))
        .route("/api/stream/{session_id}", get(api_stream))
        .route("/api/cancel/{session_id}", post(api_cancel))
        .route("/debug/memory", get(debug_memory))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(state: AppState) {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested, draining active generations");
    state.accepting.store(false, Ordering::Relaxed);

    let handles: Vec<_> = state
        .sessions
        .snapshot()
        .iter()
        .filter_map(crate::session::Session::active_generation)
        .collect();
    for handle in &handles {
        handle.cancel();
    }
    let drain = async {
        for handle in handles {
            handle.done().await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("shutdown grace period elapsed with generations still live");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authentication
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP Basic auth. Absent password configuration disables auth entirely
/// (dev only); credentials are compared in constant time.
async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected_password) = &state.config.auth_password else {
        return Ok(next.run(request).await);
    };

    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Basic "))
        .ok_or(ApiError::Auth)?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(header_value)
        .map_err(|_| ApiError::Auth)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ApiError::Auth)?;
    let (username, password) = decoded.split_once(':').ok_or(ApiError::Auth)?;

    let username_ok = constant_time_eq(username.as_bytes(), state.config.auth_username.as_bytes());
    let password_ok = constant_time_eq(password.as_bytes(), expected_password.as_bytes());
    if !(username_ok && password_ok) {
        return Err(ApiError::Auth);
    }

    Ok(next.run(request).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for query submission.
#[derive(Debug, Deserialize)]
struct QueryRequest {
    message: String,
    /// Continue an existing session instead of creating one.
    #[serde(default)]
    session_id: Option<String>,
}

/// Response carrying the session to stream from.
#[derive(Debug, Serialize)]
struct QueryResponse {
    session_id: String,
}

/// POST /api/query - submit a message and get a session id to stream.
async fn api_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    if !state.accepting.load(Ordering::Relaxed) {
        return Err(ApiError::ShuttingDown);
    }

    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::Input("message must not be empty".to_string()));
    }
    if message.len() > MAX_MESSAGE_BYTES {
        return Err(ApiError::Input(format!(
            "message exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }

    let session = match &req.session_id {
        Some(id) if !id.is_empty() => state.sessions.get(id).ok_or(ApiError::NotFound)?,
        _ => state.sessions.create()?,
    };
    if session.is_busy() {
        return Err(ApiError::BusySession);
    }

    session.append_user(message);

    info!(
        session_id = %session.id(),
        message_len = message.len(),
        "query submitted"
    );

    Ok(Json(QueryResponse {
        session_id: session.id().to_string(),
    }))
}

/// GET /api/stream/{session_id} - stream all model responses via SSE.
async fn api_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.sessions.get(&session_id).ok_or(ApiError::NotFound)?;

    let (handle, events) = state.orchestrator.begin(&session)?;

    info!(session_id = %session_id, "SSE stream started");
    Ok(sse_response(events, handle))
}

/// POST /api/cancel/{session_id} - cancel the active generation.
async fn api_cancel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.get(&session_id).ok_or(ApiError::NotFound)?;

    if state.orchestrator.cancel(&session).await {
        info!(session_id = %session_id, "generation cancelled");
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

/// GET /health - platform health check, unauthenticated.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /debug/memory - process RSS and session count.
async fn debug_memory(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "rss_bytes": read_rss_bytes().await,
        "session_count": state.sessions.count(),
    }))
}

/// Resident set size from procfs; zero where unavailable.
async fn read_rss_bytes() -> u64 {
    let Ok(statm) = tokio::fs::read_to_string("/proc/self/statm").await else {
        return 0;
    };
    let rss_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    rss_pages * 4096
}
