//! Assembles every endpoint into a single axum [`Router`], mirroring the
//! teacher's `api::client::router`/`api::admin::router` split except unified
//! behind one HTTP surface per spec §6.

pub mod auth;
pub mod completions;
pub mod health;
pub mod metrics;
pub mod models;
pub mod request_id;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handler::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(completions::openai_completions))
        .route("/openai/v1/chat/completions", post(completions::openai_completions))
        .route("/v1/messages", post(completions::claude_messages))
        .route("/anthropic/v1/messages", post(completions::claude_messages))
        .route("/", post(completions::auto_route))
        .route("/route", post(completions::auto_route))
        .route("/v1/models", get(models::list_openai))
        .route("/openai/v1/models", get(models::list_openai))
        .route("/anthropic/v1/models", get(models::list_claude))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), auth::auth_middleware));

    Router::new()
        .route("/", get(health::banner))
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .merge(protected)
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .with_state(state)
}
