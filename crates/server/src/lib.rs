//! Chakrator HTTP surface.
//!
//! `build_router` wires the routes to an edit gateway; `with_middleware`
//! adds CORS, request tracing and the optional static directory. Tests drive
//! the bare router in-process.

#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use chakrator_api::{ChakraApi, ChakraError};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};

mod ws;

#[derive(Clone)]
pub struct AppState {
    pub api: Arc<dyn ChakraApi>,
}

impl AppState {
    pub fn new(api: Arc<dyn ChakraApi>) -> Self { Self { api } }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CodeResponse {
    pub code: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CodeUpdate {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SavedResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub subscribers: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/code", get(get_code).post(post_code))
        .route("/api/logs", get(logs_sse))
        .route("/api/ws", get(ws::websocket_handler))
        .route("/api/health", get(health))
        .with_state(state)
}

/// CORS (any origin, GET/POST), request tracing, and static files at `/`.
pub fn with_middleware(router: Router, public_dir: Option<PathBuf>) -> Router {
    let router = match public_dir {
        Some(dir) => {
            info!("Serving static files from: {}", dir.display());
            router.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true))
        }
        None => router,
    };
    router
        .layer(CorsLayer::new().allow_origin(Any).allow_methods([Method::GET, Method::POST]).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port = listener.local_addr()?.port();
    info!("Server running on port {}", port);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

// ---------------------------------------------------------------------------
// /api/code
// ---------------------------------------------------------------------------

async fn get_code(State(st): State<AppState>) -> Json<CodeResponse> {
    Json(CodeResponse { code: st.api.get_current_source().await })
}

async fn post_code(State(st): State<AppState>, Json(body): Json<CodeUpdate>) -> Response {
    let code = body.code.unwrap_or_default();
    match st.api.update_source(&code).await {
        Ok(()) => (StatusCode::OK, Json(SavedResponse { success: true })).into_response(),
        Err(ChakraError::Validation(_)) => error_response(StatusCode::BAD_REQUEST, "Code is required"),
        Err(e) => {
            warn!(error = %e, "POST /api/code failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save code")
        }
    }
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    (status, Json(ErrorResponse { error: msg.to_string() })).into_response()
}

// ---------------------------------------------------------------------------
// /api/logs (SSE)
// ---------------------------------------------------------------------------

async fn logs_sse(State(st): State<AppState>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));

    let events = log_events(st.api.as_ref());
    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn log_events(api: &dyn ChakraApi) -> impl Stream<Item = Result<Event, Infallible>> {
    api.subscribe_logs()
        .into_stream()
        .map(|record| Ok(Event::default().event("log").data(sse_data(&record.render()))))
}

/// SSE fields may not carry `\r`; fold CRLF and lone CR into `\n`.
fn sse_data(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

// ---------------------------------------------------------------------------
// /api/health
// ---------------------------------------------------------------------------

async fn health(State(st): State<AppState>) -> Json<HealthResponse> {
    let h = st.api.health();
    Json(HealthResponse { ok: true, service: h.service, version: h.version, subscribers: h.subscribers })
}
