use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};

use super::super::{ApiResult, AppState};
use crate::core::vault::{CredentialPayload, NewCredential};

#[derive(serde::Deserialize)]
pub struct CredentialBody {
    payload: CredentialPayload,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(serde::Deserialize)]
pub struct StoreBody {
    provider: String,
    #[serde(flatten)]
    credential: CredentialBody,
}

impl CredentialBody {
    fn into_new(self) -> NewCredential {
        let mut credential = NewCredential::new(self.payload);
        credential.scopes = self.scopes;
        credential.expires_at = self.expires_at;
        credential
    }
}

/// Metadata only; plaintext never leaves the vault over HTTP.
pub async fn list_credentials(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.agents.get(&agent).await?;
    let credentials = state.runtime.vault.list_for_agent(&agent).await?;
    Ok(Json(serde_json::json!({ "credentials": credentials })))
}

pub async fn store_credential(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(body): Json<StoreBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    state.runtime.agents.get(&agent).await?;
    let id = state
        .runtime
        .vault
        .store(&agent, &body.provider, body.credential.into_new())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "credential_id": id })),
    ))
}

pub async fn rotate_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CredentialBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.vault.rotate(&id, body.into_new()).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn revoke_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.vault.revoke(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}
