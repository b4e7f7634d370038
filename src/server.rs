//! Local comparison server
//!
//! A long-lived axum process on a fixed configured port. Test runners POST
//! screenshots, the orchestrator classifies them, and every verdict is
//! pushed to the dashboard's SSE feed. While running, the server advertises
//! itself through the workspace sentinel so capture producers pick tdd
//! mode. Stored artifacts are served read-only under `/artifacts` for the
//! dashboard.

use crate::events::{EventBus, VizzlyEvent};
use crate::input::resolve_image_input;
use crate::mode::{remove_sentinel, write_sentinel, ServerSentinel};
use crate::orchestrator::{ComparisonOrchestrator, ScreenshotSubmission};
use crate::{compare, Config, VizzlyError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::services::ServeDir;
use tracing::{info, warn};

pub struct ServerState {
    pub orchestrator: Arc<ComparisonOrchestrator>,
    pub events: EventBus,
    pub config: Mutex<Config>,
    pub request_timeout: Duration,
    build_complete: AtomicBool,
}

impl ServerState {
    pub fn new(orchestrator: Arc<ComparisonOrchestrator>, events: EventBus, config: Config) -> Self {
        let request_timeout = Duration::from_millis(config.server.timeout);
        Self {
            orchestrator,
            events,
            config: Mutex::new(config),
            request_timeout,
            build_complete: AtomicBool::new(false),
        }
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    let artifacts = ServeDir::new(state.orchestrator.store().vizzly_dir());
    Router::new()
        .route("/screenshot", post(submit_screenshot))
        .route("/build/complete", post(complete_build))
        .route("/comparisons/{id}/accept", post(accept_comparison))
        .route("/api/config", get(read_config))
        .route("/api/config/{scope}", post(write_config))
        .route("/events", get(event_stream))
        .nest_service("/artifacts", artifacts)
        .with_state(state)
}

/// Binds the configured port, writes the sentinel, and serves until the
/// shutdown future resolves. The sentinel is removed on the way out.
pub async fn serve(
    state: Arc<ServerState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), VizzlyError> {
    let port = state.config.lock().await.server.port;
    let workspace = state.orchestrator.store().workspace().to_path_buf();

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| VizzlyError::Configuration(format!("cannot bind port {}: {}", port, e)))?;
    let addr = listener.local_addr()?;
    let url = format!("http://{}", addr);

    write_sentinel(
        &workspace,
        &ServerSentinel {
            url: url.clone(),
            pid: std::process::id(),
            port: addr.port(),
        },
    )?;
    info!("Local comparison server listening at {}", url);

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| VizzlyError::Io(e.to_string()));

    remove_sentinel(&workspace)?;
    info!("Local comparison server stopped");
    result
}

#[derive(Debug, Deserialize)]
struct ScreenshotBody {
    name: String,
    image: String,
    #[serde(rename = "type")]
    image_type: Option<String>,
    #[serde(rename = "buildId")]
    build_id: Option<String>,
    threshold: Option<f64>,
    #[serde(rename = "fullPage")]
    full_page: Option<bool>,
    #[serde(default)]
    properties: BTreeMap<String, Value>,
}

async fn submit_screenshot(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ScreenshotBody>,
) -> impl IntoResponse {
    let result = tokio::time::timeout(state.request_timeout, async {
        let input = resolve_image_input(&body.image, body.image_type.as_deref())?;
        let image = input.read_bytes().await?;
        compare::validate_png(&image)?;
        state
            .orchestrator
            .process(ScreenshotSubmission {
                name: body.name,
                image,
                properties: body.properties,
                threshold: body.threshold,
                full_page: body.full_page,
                build_id: body.build_id,
            })
            .await
    })
    .await;

    match result {
        Ok(Ok(record)) => (
            StatusCode::OK,
            Json(json!({ "success": true, "comparison": record })),
        ),
        Ok(Err(e)) => error_response(e),
        Err(_) => error_response(VizzlyError::timeout("screenshot", state.request_timeout)),
    }
}

async fn complete_build(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    // Idempotent: repeated completes return success without side effects.
    if !state.build_complete.swap(true, Ordering::SeqCst) {
        info!("Build marked complete");
    }
    (StatusCode::OK, Json(json!({ "success": true })))
}

async fn accept_comparison(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.accept(&id).await {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({ "success": true, "comparison": record })),
        ),
        Err(e) => error_response(e),
    }
}

async fn read_config(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let config = state.config.lock().await;
    Json(serde_json::to_value(&*config).unwrap_or_else(|_| json!({})))
}

async fn write_config(
    State(state): State<Arc<ServerState>>,
    Path(scope): Path<String>,
    Json(value): Json<Value>,
) -> impl IntoResponse {
    let mut config = state.config.lock().await;
    match config.apply_scope(&scope, value) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "config": serde_json::to_value(&*config).unwrap_or_default() })),
        ),
        Err(e) => error_response(e),
    }
}

async fn event_stream(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => match Event::default().json_data(&event) {
            Ok(sse_event) => Some(Ok(sse_event)),
            Err(e) => {
                warn!("Dropping unserializable event: {}", e);
                None
            }
        },
        // A lagged consumer skips coalesced progress and picks back up.
        Err(_lagged) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn error_response(error: VizzlyError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
}

/// Emits a terminal error event onto the bus; used by callers that fail
/// outside a request context.
pub fn emit_error(events: &EventBus, error: &VizzlyError) {
    events.emit(VizzlyEvent::Error {
        message: error.to_string(),
        code: Some(error.status_code().to_string()),
        context: None,
    });
}
