//! Loopback HTTP surface: `GET /health`, `POST /rpc`, `POST /shutdown`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;

use crate::dispatcher::Dispatcher;
use crate::envelope::HealthBody;
use crate::error::{AppError, ErrorCode};

struct ApiContext {
    dispatcher: Dispatcher,
    shutdown: Arc<Notify>,
}

/// HTTP status for an envelope. The body is the envelope either way.
pub fn status_for(code: Option<ErrorCode>) -> StatusCode {
    match code {
        None => StatusCode::OK,
        Some(ErrorCode::InvalidInput | ErrorCode::ValidationFailed) => StatusCode::BAD_REQUEST,
        Some(ErrorCode::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorCode::BridgeUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        Some(ErrorCode::Error) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Handlers ─────────────────────────────────────────────────────

async fn get_health() -> impl IntoResponse {
    Json(HealthBody::ok())
}

async fn post_rpc(Extension(ctx): Extension<Arc<ApiContext>>, body: Bytes) -> impl IntoResponse {
    let response = ctx.dispatcher.handle_bytes(&body).await;
    (status_for(response.error_code()), Json(response))
}

async fn post_shutdown(Extension(ctx): Extension<Arc<ApiContext>>) -> impl IntoResponse {
    tracing::info!("shutdown requested over http");
    ctx.shutdown.notify_one();
    Json(json!({ "ok": true, "status": "shutting down" }))
}

// ── Server ───────────────────────────────────────────────────────

pub fn router(dispatcher: Dispatcher, shutdown: Arc<Notify>) -> Router {
    let ctx = Arc::new(ApiContext {
        dispatcher,
        shutdown,
    });
    Router::new()
        .route("/health", get(get_health))
        .route("/rpc", post(post_rpc))
        .route("/shutdown", post(post_shutdown))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(ctx))
}

/// Bind a listener. Only loopback addresses are accepted.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, AppError> {
    if !addr.ip().is_loopback() {
        return Err(AppError::invalid_input(format!(
            "refusing to bind non-loopback address {addr}"
        )));
    }
    TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::unavailable(format!("failed to bind {addr}: {e}")))
}

/// Serve until `shutdown` is notified or the process receives Ctrl-C.
/// In-flight requests are drained before this returns.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Dispatcher,
    shutdown: Arc<Notify>,
) -> Result<(), AppError> {
    let app = router(dispatcher, Arc::clone(&shutdown));
    let signal = async move {
        tokio::select! {
            () = shutdown.notified() => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| AppError::generic(format!("http server error: {e}")))
}
