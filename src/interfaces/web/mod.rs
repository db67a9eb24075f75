pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::{Context, Result};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use std::future::Future;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};

use crate::core::error::CoreError;
use crate::core::runtime::Runtime;
use crate::core::tracker::ExecutionEvent;

pub use router::build_api_router;

pub struct ApiServerConfig {
    pub runtime: Runtime,
    pub log_tx: broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) runtime: Runtime,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    pub(crate) api_token: Option<String>,
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        let api_token = config
            .runtime
            .config
            .api
            .token
            .clone()
            .filter(|t| !t.trim().is_empty());
        Self {
            state: AppState {
                runtime: config.runtime,
                log_tx: config.log_tx,
                api_host: config.api_host,
                api_port: config.api_port,
                api_token,
            },
        }
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.state.api_host, self.state.api_port);
        let app = build_api_router(self.state);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind API server to {}", addr))?;
        info!("API Server running at http://{addr}");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("API server crashed")?;
        info!("API Server shut down");
        Ok(())
    }
}

/// Error body shared by every handler: `{ success, kind, error }`.
pub(crate) enum ApiError {
    Core(CoreError),
    BadRequest(String),
}

pub(crate) type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Core(err)
    }
}

pub(crate) fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::AgentNotFound(_)
        | CoreError::ExecutionNotFound(_)
        | CoreError::CredentialNotFound(_)
        | CoreError::UnknownProvider(_) => StatusCode::NOT_FOUND,
        CoreError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        CoreError::NoEscalationTarget { .. }
        | CoreError::HierarchyCycle { .. }
        | CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
        CoreError::OAuthStateExpired | CoreError::Config(_) => StatusCode::BAD_REQUEST,
        CoreError::AccountsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::OAuthExchange(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Core(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!("API request failed: {}", err);
                }
                (status, err.kind(), err.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
        };
        (
            status,
            Json(serde_json::json!({ "success": false, "kind": kind, "error": message })),
        )
            .into_response()
    }
}

/// One SSE message per execution event, named after the event type.
pub(crate) fn event_sse<S>(events: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = ExecutionEvent> + Send + 'static,
{
    let stream = events.map(|event| {
        let name = serde_json::to_value(&event.kind)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| "event".to_string());
        let sse = Event::default()
            .id(event.seq.to_string())
            .event(name)
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("unserializable event"));
        Ok(sse)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });
    Sse::new(stream)
}
