use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use super::AppState;

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        // No token configured: open access only on loopback.
        if is_loopback(&state.api_host) {
            return next.run(req).await;
        }
        return unauthorized(
            "No API token configured. Set [api].token before exposing the API on a non-loopback address.",
        );
    };

    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match presented {
        None => unauthorized("Missing or invalid Authorization header. Use: Bearer <token>"),
        Some(token) if tokens_match(expected, token) => next.run(req).await,
        Some(_) => unauthorized("Invalid API token"),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "success": false, "kind": "unauthorized", "error": message })),
    )
        .into_response()
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
}

/// Compare digests so the comparison time does not depend on the prefix
/// the caller got right.
fn tokens_match(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}
