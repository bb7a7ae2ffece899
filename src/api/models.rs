//! `GET /v1/models` (and format-prefixed variants) — list configured models
//! in the requested format's shape.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::config::Format;
use crate::handler::AppState;

pub async fn list_openai(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(list(&state, Format::OpenAI))
}

pub async fn list_claude(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(list(&state, Format::Claude))
}

fn list(state: &AppState, format: Format) -> Value {
    let config = state.config();
    let mut entries = Vec::new();
    for provider in config.providers.iter().filter(|p| p.enabled) {
        for model in provider.models.iter().filter(|m| m.enabled) {
            entries.push(format!("{}/{}", provider.id, model.id));
        }
    }
    entries.extend(config.model_aliases.keys().map(|id| format!("alias:{id}")));

    match format {
        Format::OpenAI => json!({
            "object": "list",
            "data": entries.iter().map(|id| json!({ "id": id, "object": "model", "owned_by": "llm-router" })).collect::<Vec<_>>(),
        }),
        Format::Claude => json!({
            "data": entries.iter().map(|id| json!({ "id": id, "type": "model" })).collect::<Vec<_>>(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ProviderConfig};
    use crate::state::{memory::MemoryStore, StateStore};

    fn config_with_one_model() -> crate::config::RuntimeConfig {
        crate::config::RuntimeConfig {
            version: 1,
            default_model: "smart".into(),
            master_key: None,
            providers: vec![ProviderConfig {
                id: "openai".into(),
                name: None,
                enabled: true,
                base_url: "https://api.openai.com".into(),
                base_url_by_format: Default::default(),
                api_key: None,
                api_key_env: None,
                formats: vec![Format::OpenAI],
                format: Some(Format::OpenAI),
                auth: None,
                auth_by_format: Default::default(),
                headers: Default::default(),
                anthropic_version: None,
                anthropic_beta: None,
                models: vec![ModelConfig {
                    id: "gpt-4o-mini".into(),
                    aliases: vec![],
                    formats: vec![],
                    enabled: true,
                    context_window: None,
                    fallback_models: vec![],
                }],
                rate_limits: vec![],
            }],
            model_aliases: Default::default(),
            amp_routing: None,
        }
    }

    #[tokio::test]
    async fn lists_enabled_provider_models_in_openai_shape() {
        let state = Arc::new(AppState::new(config_with_one_model(), StateStore::Memory(MemoryStore::new())));
        let Json(body) = list_openai(State(state)).await;
        assert_eq!(body["data"][0]["id"], "openai/gpt-4o-mini");
    }

    #[tokio::test]
    async fn lists_in_claude_shape_without_object_field() {
        let state = Arc::new(AppState::new(config_with_one_model(), StateStore::Memory(MemoryStore::new())));
        let Json(body) = list_claude(State(state)).await;
        assert_eq!(body["data"][0]["id"], "openai/gpt-4o-mini");
        assert_eq!(body["data"][0]["type"], "model");
    }
}
