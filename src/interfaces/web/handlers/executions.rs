use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use tokio_stream::StreamExt;

use super::super::{ApiError, ApiResult, AppState, event_sse};
use crate::core::supervisor::{ExecutionHandle, SubmitRequest};
use crate::core::tracker::Scope;

const DEFAULT_EVENT_PAGE: usize = 500;
const MAX_EVENT_PAGE: usize = 5_000;

#[derive(Deserialize)]
pub struct SubmitBody {
    task: String,
    #[serde(default)]
    parent_id: Option<String>,
}

#[derive(Deserialize)]
pub struct DelegateBody {
    to: String,
    task: String,
}

#[derive(Deserialize)]
pub struct EscalateBody {
    task: String,
    reason: String,
    /// Failed execution being handed up, if any.
    #[serde(default)]
    execution_id: Option<String>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    after: i64,
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
}

fn non_empty(task: &str) -> ApiResult<()> {
    if task.trim().is_empty() {
        return Err(ApiError::BadRequest("task must not be empty".into()));
    }
    Ok(())
}

fn accepted(handle: ExecutionHandle) -> (StatusCode, Json<serde_json::Value>) {
    // The pipeline keeps running after the handle is dropped.
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "success": true, "execution_id": handle.execution_id })),
    )
}

pub async fn submit_execution(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<impl IntoResponse> {
    non_empty(&body.task)?;
    let handle = state
        .runtime
        .supervisor
        .submit(SubmitRequest {
            agent_id: agent,
            task: body.task,
            parent_id: body.parent_id,
        })
        .await?;
    Ok(accepted(handle))
}

pub async fn delegate_execution(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(body): Json<DelegateBody>,
) -> ApiResult<impl IntoResponse> {
    non_empty(&body.task)?;
    let handle = state
        .runtime
        .supervisor
        .delegate(&agent, &body.to, &body.task)
        .await?;
    Ok(accepted(handle))
}

pub async fn escalate_execution(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(body): Json<EscalateBody>,
) -> ApiResult<impl IntoResponse> {
    non_empty(&body.task)?;
    let handle = state
        .runtime
        .supervisor
        .escalate(&agent, &body.task, &body.reason, body.execution_id.as_deref())
        .await?;
    Ok(accepted(handle))
}

pub async fn list_agent_executions(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.agents.get(&agent).await?;
    let executions = state
        .runtime
        .tracker
        .list_for_agent(&agent, query.limit.unwrap_or(50).min(500))
        .await?;
    Ok(Json(serde_json::json!({ "executions": executions })))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let execution = state.runtime.supervisor.get_execution(&id).await?;
    Ok(Json(serde_json::json!({ "execution": execution })))
}

pub async fn get_execution_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.tracker.get(&id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_PAGE).min(MAX_EVENT_PAGE);
    let events = state
        .runtime
        .tracker
        .events(&id, query.after, limit)
        .await?;
    Ok(Json(serde_json::json!({ "events": events })))
}

pub async fn get_execution_transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let transcript = state.runtime.tracker.transcript(&id).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        transcript,
    ))
}

/// Replays stored events after `after`, then follows live ones.
pub async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    let tracker = state.runtime.tracker.clone();
    tracker.get(&id).await?;
    // subscribe before reading the log so nothing falls in between
    let live = tracker.subscribe(Scope::Execution(id.clone()));
    let past = tracker.events(&id, query.after, usize::MAX).await?;
    let last_seq = past.last().map(|e| e.seq).unwrap_or(query.after);
    let stream = tokio_stream::iter(past).chain(live.filter(move |e| e.seq > last_seq));
    Ok(event_sse(stream))
}

pub async fn stream_agent_events(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.runtime.agents.get(&agent).await?;
    Ok(event_sse(state.runtime.tracker.subscribe(Scope::Agent(agent))))
}

pub async fn stream_organization_events(
    State(state): State<AppState>,
    Path(org): Path<String>,
) -> impl IntoResponse {
    event_sse(state.runtime.tracker.subscribe(Scope::Organization(org)))
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancelled = state.runtime.supervisor.cancel(&id).await?;
    Ok(Json(serde_json::json!({ "success": true, "cancelled": cancelled })))
}
