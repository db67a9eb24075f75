use axum::{
    Json,
    extract::{Path, State},
};

use super::super::AppState;

pub async fn get_pool(
    State(state): State<AppState>,
    Path(org): Path<String>,
) -> Json<serde_json::Value> {
    let accounts = state.runtime.pool.snapshot(&org);
    let in_flight: usize = accounts.iter().map(|a| a.in_flight).sum();
    let capacity: usize = accounts.iter().map(|a| a.max_concurrency).sum();
    Json(serde_json::json!({
        "organization_id": org,
        "in_flight": in_flight,
        "capacity": capacity,
        "accounts": accounts,
    }))
}
