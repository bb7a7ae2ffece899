//! Liveness probe and service banner endpoints.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::handler::AppState;

/// `GET /health` → `200 {status, timestamp, providers}`.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let providers = state.config().providers.iter().filter(|p| p.enabled).count();
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "providers": providers,
    }))
}

/// `GET /` → service banner with the list of routable endpoints.
pub async fn banner() -> Json<Value> {
    Json(json!({
        "service": "llm-router",
        "endpoints": [
            "GET /health",
            "GET /metrics",
            "GET /v1/models",
            "GET /openai/v1/models",
            "GET /anthropic/v1/models",
            "POST /",
            "POST /route",
            "POST /v1/chat/completions",
            "POST /openai/v1/chat/completions",
            "POST /v1/messages",
            "POST /anthropic/v1/messages",
        ],
    }))
}
