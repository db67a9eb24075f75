use axum::{
    Json,
    extract::{Path, State},
};

use super::super::{ApiError, ApiResult, AppState};
use crate::core::agent::{Agent, SelfConfigUpdate};

#[derive(serde::Deserialize)]
pub struct ManagerBody {
    manager_id: Option<String>,
}

pub async fn list_agents(
    State(state): State<AppState>,
    Path(org): Path<String>,
) -> Json<serde_json::Value> {
    let agents = state.runtime.agents.list(&org).await;
    Json(serde_json::json!({ "agents": agents }))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = state.runtime.agents.get(&agent).await?;
    Ok(Json(serde_json::json!({ "agent": agent })))
}

/// Create or replace. The id in the path wins over the body.
pub async fn upsert_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(mut agent): Json<Agent>,
) -> ApiResult<Json<serde_json::Value>> {
    if agent.organization_id.trim().is_empty() {
        return Err(ApiError::BadRequest("organization_id is required".into()));
    }
    agent.id = agent_id;
    let agent = state.runtime.agents.upsert(agent).await?;
    Ok(Json(serde_json::json!({ "success": true, "agent": agent })))
}

pub async fn archive_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.agents.archive(&agent).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn reassign_manager(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(body): Json<ManagerBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = state
        .runtime
        .agents
        .reassign_manager(&agent, body.manager_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "agent": agent })))
}

pub async fn update_self_config(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(update): Json<SelfConfigUpdate>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = state
        .runtime
        .agents
        .update_self_config(&agent, update)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "agent": agent })))
}

pub async fn get_permissions(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let permissions = state.runtime.supervisor.resolve_permissions(&agent).await?;
    Ok(Json(serde_json::json!({ "permissions": permissions })))
}
