//! HTTP and WebSocket front end.
//!
//! `/ws` owns one session per connection; `/ws/sessions/:id` attaches a
//! non-owning listener. The plain routes cover the REST build endpoint,
//! status, cancellation, artifact retrieval and health.

pub mod protocol;
pub mod ws;

pub use protocol::{ClientEvent, ServerEvent};

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::error::BuildError;
use crate::models::{BuildRequest, SessionId};
use crate::orchestrator::Orchestrator;

/// Shared router state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub cancel_on_disconnect: bool,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let cancel_on_disconnect = orchestrator.context().config.server.cancel_on_disconnect;
        AppState {
            orchestrator,
            cancel_on_disconnect,
        }
    }
}

/// JSON error body `{"error": <kind>, "message": <text>}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError {
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    fn session_not_found(raw: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "session_not_found",
            format!("no active session {}", raw),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        let status = match &err {
            BuildError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            BuildError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            BuildError::ArtifactExpired(_) => StatusCode::GONE,
            BuildError::InternalError(detail) => {
                log::error!("[Server] Internal error: {}", detail);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.kind(), err.user_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.error, "message": self.message })),
        )
            .into_response()
    }
}

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/ws", get(ws::owner_socket))
        .route("/ws/sessions/:id", get(ws::attach_socket))
        .route("/builds", post(create_build))
        .route("/sessions/:id", get(session_status))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/artifacts/:id/:file", get(download_artifact))
        .route("/healthz", get(healthz))
        .with_state(AppState::new(orchestrator))
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, orchestrator: Orchestrator, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("[Server] Listening on {}", addr);
    }
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await
}

/// `POST /builds`
pub async fn create_build(
    State(app): State<AppState>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|e| BuildError::InvalidInput(e.body_text()))?;
    let session_id = app.orchestrator.start_build(&request)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "session_id": session_id }))))
}

/// `GET /sessions/:id`
pub async fn session_status(
    State(app): State<AppState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    raw.parse::<SessionId>()
        .ok()
        .and_then(|id| app.orchestrator.snapshot(id))
        .map(Json)
        .ok_or_else(|| ApiError::session_not_found(&raw))
}

/// `POST /sessions/:id/cancel`
pub async fn cancel_session(
    State(app): State<AppState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = raw
        .parse::<SessionId>()
        .map_err(|_| ApiError::session_not_found(&raw))?;
    let snapshot = app
        .orchestrator
        .snapshot(id)
        .ok_or_else(|| ApiError::session_not_found(&raw))?;
    if app.orchestrator.cancel(id) {
        Ok((StatusCode::ACCEPTED, Json(json!({ "session_id": id, "cancelling": true }))))
    } else {
        Err(ApiError::new(
            StatusCode::CONFLICT,
            "session_finished",
            format!("session already {}", snapshot.state),
        ))
    }
}

/// `GET /artifacts/:id/:file`
pub async fn download_artifact(
    State(app): State<AppState>,
    Path((raw, file_name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let id = raw
        .parse::<SessionId>()
        .map_err(|_| BuildError::ArtifactNotFound(format!("{}/{}", raw, file_name)))?;
    let path = app.orchestrator.store().resolve(id, &file_name)?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        // reaped between lookup and open
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BuildError::ArtifactExpired(format!("{}/{}", id, file_name)).into())
        }
        Err(e) => return Err(BuildError::from(e).into()),
    };
    let size = file.metadata().await.map_err(BuildError::from)?.len();
    log::info!("[Server] Serving {}/{} ({} bytes)", id, file_name, size);

    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// `GET /healthz`
pub async fn healthz(State(app): State<AppState>) -> impl IntoResponse {
    let counts = app.orchestrator.counts();
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "active": counts.active,
        "queued": counts.queued,
        "finished": counts.finished,
    }))
}
