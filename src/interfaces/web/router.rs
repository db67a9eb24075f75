use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post, put},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{agents, credentials, executions, oauth, pool};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // The OAuth redirect is authenticated by its single-use state token.
    let public_routes = Router::new()
        .route("/api/oauth/callback", get(oauth::oauth_callback))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route("/api/logs", get(super::sse_logs_endpoint))
        .route("/api/organizations/{org}/agents", get(agents::list_agents))
        .route("/api/organizations/{org}/pool", get(pool::get_pool))
        .route(
            "/api/organizations/{org}/events",
            get(executions::stream_organization_events),
        )
        .route(
            "/api/agents/{agent}",
            get(agents::get_agent)
                .put(agents::upsert_agent)
                .delete(agents::archive_agent),
        )
        .route("/api/agents/{agent}/manager", put(agents::reassign_manager))
        .route(
            "/api/agents/{agent}/config",
            axum::routing::patch(agents::update_self_config),
        )
        .route(
            "/api/agents/{agent}/permissions",
            get(agents::get_permissions),
        )
        .route(
            "/api/agents/{agent}/executions",
            get(executions::list_agent_executions).post(executions::submit_execution),
        )
        .route(
            "/api/agents/{agent}/delegate",
            post(executions::delegate_execution),
        )
        .route(
            "/api/agents/{agent}/escalate",
            post(executions::escalate_execution),
        )
        .route(
            "/api/agents/{agent}/events",
            get(executions::stream_agent_events),
        )
        .route(
            "/api/agents/{agent}/credentials",
            get(credentials::list_credentials).post(credentials::store_credential),
        )
        .route(
            "/api/agents/{agent}/oauth/{provider}",
            post(oauth::begin_oauth),
        )
        .route(
            "/api/credentials/{id}",
            put(credentials::rotate_credential).delete(credentials::revoke_credential),
        )
        .route("/api/executions/{id}", get(executions::get_execution))
        .route(
            "/api/executions/{id}/events",
            get(executions::get_execution_events),
        )
        .route(
            "/api/executions/{id}/transcript",
            get(executions::get_execution_transcript),
        )
        .route(
            "/api/executions/{id}/stream",
            get(executions::stream_execution),
        )
        .route(
            "/api/executions/{id}/cancel",
            post(executions::cancel_execution),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state);

    public_routes.merge(authed_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::web::test_support::test_state;
    use axum::http::StatusCode;
    use std::time::Duration;
    use tower::util::ServiceExt;

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    async fn wait_until_finished(app: &Router, id: &str) -> serde_json::Value {
        for _ in 0..250 {
            let (_, json) = json_request(
                app.clone(),
                Method::GET,
                &format!("/api/executions/{}", id),
                None,
            )
            .await;
            let status = json["execution"]["status"].as_str().unwrap_or_default();
            if matches!(status, "completed" | "failed" | "cancelled") {
                return json["execution"].clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {} never finished", id);
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let (_tmp, state) = test_state("127.0.0.1", None).await;
        let app = build_api_router(state);

        for path in ["/api/organizations/org/pool", "/api/oauth/callback"] {
            let req = Request::builder()
                .uri(path)
                .body(Body::empty())
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(
                resp.headers().get("x-content-type-options").unwrap(),
                "nosniff"
            );
            assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
            assert!(resp.headers().get("content-security-policy").is_some());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn submitted_execution_completes_and_replays_events() {
        let (_tmp, state) = test_state("127.0.0.1", None).await;
        let app = build_api_router(state);

        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            "/api/agents/eng/executions",
            Some(serde_json::json!({ "task": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = json["execution_id"].as_str().unwrap().to_string();

        let execution = wait_until_finished(&app, &id).await;
        assert_eq!(execution["status"], "completed");
        assert_eq!(execution["output"], "done: hello");
        assert_eq!(execution["account_id"], "acct-1");

        let (status, json) = json_request(
            app.clone(),
            Method::GET,
            &format!("/api/executions/{}/events?after=0", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let events = json["events"].as_array().unwrap();
        assert!(events.iter().any(|e| e["type"] == "output"));
        let seqs: Vec<i64> = events.iter().map(|e| e["seq"].as_i64().unwrap()).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));

        let (_, pool) = json_request(app, Method::GET, "/api/organizations/org/pool", None).await;
        assert_eq!(pool["in_flight"], 0);
        assert_eq!(pool["capacity"], 2);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (_tmp, state) = test_state("127.0.0.1", None).await;
        let app = build_api_router(state);

        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            "/api/agents/ghost/executions",
            Some(serde_json::json!({ "task": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "agent_not_found");

        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            "/api/agents/ceo/escalate",
            Some(serde_json::json!({ "task": "help", "reason": "stuck" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["kind"], "no_escalation_target");

        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            "/api/agents/eng/delegate",
            Some(serde_json::json!({ "to": "ceo", "task": "do it" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["kind"], "permission_denied");

        let (status, _) = json_request(
            app.clone(),
            Method::POST,
            "/api/agents/eng/executions",
            Some(serde_json::json!({ "task": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/executions/nope/cancel",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "execution_not_found");
    }

    #[tokio::test]
    async fn manager_reassignment_rejects_cycles() {
        let (_tmp, state) = test_state("127.0.0.1", None).await;
        let app = build_api_router(state);

        let (status, json) = json_request(
            app.clone(),
            Method::PUT,
            "/api/agents/ceo/manager",
            Some(serde_json::json!({ "manager_id": "eng" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["kind"], "hierarchy_cycle");

        let (status, json) = json_request(
            app.clone(),
            Method::PUT,
            "/api/agents/intern",
            Some(serde_json::json!({
                "id": "ignored",
                "organization_id": "org",
                "manager_id": "eng"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["agent"]["id"], "intern");

        let (_, json) =
            json_request(app, Method::GET, "/api/organizations/org/agents", None).await;
        assert_eq!(json["agents"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn self_config_requires_permission() {
        let (_tmp, state) = test_state("127.0.0.1", None).await;
        let app = build_api_router(state);

        let (status, _) = json_request(
            app.clone(),
            Method::PATCH,
            "/api/agents/eng/config",
            Some(serde_json::json!({ "instructions_override": "be brief" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, json) = json_request(
            app,
            Method::PATCH,
            "/api/agents/ceo/config",
            Some(serde_json::json!({ "instructions_override": "be brief" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["agent"]["instructions_override"], "be brief");
    }

    #[tokio::test]
    async fn credentials_are_listed_without_plaintext() {
        let (_tmp, state) = test_state("127.0.0.1", None).await;
        let app = build_api_router(state);

        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            "/api/agents/eng/credentials",
            Some(serde_json::json!({
                "provider": "github",
                "payload": { "kind": "api_key", "key": "tok_abc123" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["credential_id"].as_str().unwrap().to_string();

        let (_, json) = json_request(
            app.clone(),
            Method::GET,
            "/api/agents/eng/credentials",
            None,
        )
        .await;
        assert!(!json.to_string().contains("tok_abc123"));
        assert_eq!(json["credentials"][0]["kind"], "api_key");

        let (status, _) = json_request(
            app.clone(),
            Method::DELETE,
            &format!("/api/credentials/{}", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, json) =
            json_request(app, Method::GET, "/api/agents/eng/credentials", None).await;
        assert_eq!(json["credentials"][0]["revoked"], true);
    }

    #[tokio::test]
    async fn oauth_callback_is_single_use_and_public() {
        let (_tmp, state) = test_state("127.0.0.1", Some("api-token")).await;
        let app = build_api_router(state);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/agents/eng/oauth/github")
            .header("authorization", "Bearer api-token")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let authorize = url::Url::parse(json["authorize_url"].as_str().unwrap()).unwrap();
        let state_token = authorize
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let callback = format!(
            "/api/oauth/callback?state={}&code=abc",
            urlencoding::encode(&state_token)
        );
        let (status, json) = json_request(app.clone(), Method::GET, &callback, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["credential_id"].as_str().is_some());
        assert!(!json.to_string().contains("access-abc"));

        let (status, json) = json_request(app.clone(), Method::GET, &callback, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["kind"], "oauth_state_expired");

        let (status, _) = json_request(
            app,
            Method::POST,
            "/api/agents/eng/oauth/github",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_oauth_provider_is_not_found() {
        let (_tmp, state) = test_state("127.0.0.1", None).await;
        let app = build_api_router(state);
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/agents/eng/oauth/gitlab",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "unknown_provider");
    }

    #[tokio::test]
    async fn method_not_allowed_returns_405() {
        let (_tmp, state) = test_state("127.0.0.1", None).await;
        let app = build_api_router(state);
        let (status, _) =
            json_request(app, Method::DELETE, "/api/executions/abc/events", None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
