use axum::{
    Json,
    extract::{Path, Query, State},
};
use tracing::{info, warn};

use super::super::{ApiError, ApiResult, AppState};

#[derive(serde::Deserialize)]
pub struct CallbackQuery {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
}

pub async fn begin_oauth(
    State(state): State<AppState>,
    Path((agent, provider)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state.runtime.agents.get(&agent).await?;
    let url = state
        .runtime
        .oauth
        .begin(&record.organization_id, &agent, &provider)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "authorize_url": url })))
}

/// Shared redirect target for every provider. Unauthenticated: the opaque
/// state token is the only thing tying the request to an agent.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(error) = query.error {
        warn!("OAuth provider returned an error: {}", error);
        return Err(ApiError::BadRequest(format!(
            "authorization was not granted: {}",
            error
        )));
    }
    let (Some(state_token), Some(code)) = (query.state, query.code) else {
        return Err(ApiError::BadRequest(
            "both 'state' and 'code' are required".into(),
        ));
    };
    let credential_id = state.runtime.oauth.complete(&state_token, &code).await?;
    info!("OAuth flow completed, stored credential [{}]", credential_id);
    Ok(Json(
        serde_json::json!({ "success": true, "credential_id": credential_id }),
    ))
}
