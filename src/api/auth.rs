//! Master-key authentication middleware.
//!
//! A single shared `masterKey` (not per-client, unlike the teacher's
//! `[[clients]]` key map in `client_auth.rs`) gates every request when
//! configured. Accepted as `Authorization: Bearer <key>` or `x-api-key:
//! <key>`, mirroring the teacher's admin-token check in `admin_auth.rs`.
//! When no master key is configured, the middleware is a no-op.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::handler::AppState;

pub async fn auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(master_key) = state.config().master_key.clone() else {
        return next.run(req).await;
    };

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key_header = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());

    if bearer == Some(master_key.as_str()) || api_key_header == Some(master_key.as_str()) {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"llm-router\"")],
        axum::Json(serde_json::json!({
            "type": "error",
            "error": { "type": "unauthorized", "message": "a valid master key is required" }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use axum::{body::Body, http::Request, middleware, routing::get, Router};
    use tower::ServiceExt;

    fn state_with_key(key: Option<&str>) -> Arc<AppState> {
        let mut config = crate::config::RuntimeConfig {
            version: 1,
            default_model: "smart".into(),
            master_key: key.map(String::from),
            providers: vec![],
            model_aliases: Default::default(),
            amp_routing: None,
        };
        config.sanitize();
        Arc::new(AppState::new(config, StateStore::Memory(crate::state::memory::MemoryStore::new())))
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn no_master_key_configured_passes_through() {
        let resp = app(state_with_key(None)).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_bearer_token_is_accepted() {
        let resp = app(state_with_key(Some("secret")))
            .oneshot(Request::get("/").header("authorization", "Bearer secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_api_key_header_is_accepted() {
        let resp = app(state_with_key(Some("secret")))
            .oneshot(Request::get("/").header("x-api-key", "secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let resp = app(state_with_key(Some("secret"))).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let resp = app(state_with_key(Some("secret")))
            .oneshot(Request::get("/").header("authorization", "Bearer wrong").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
