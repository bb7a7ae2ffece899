//! `GET /metrics` — Prometheus text-exposition of [`crate::metrics::Metrics`].

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse};

use crate::handler::AppState;

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{memory::MemoryStore, StateStore};
    use axum::body::to_bytes;

    fn empty_config() -> crate::config::RuntimeConfig {
        crate::config::RuntimeConfig { version: 1, default_model: "smart".into(), master_key: None, providers: vec![], model_aliases: Default::default(), amp_routing: None }
    }

    #[tokio::test]
    async fn renders_prometheus_text() {
        let state = Arc::new(AppState::new(empty_config(), StateStore::Memory(MemoryStore::new())));
        state.metrics.record_resolution(true);
        let response = metrics(State(state)).await.into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("llm_router_route_resolutions_total 1"));
    }
}
