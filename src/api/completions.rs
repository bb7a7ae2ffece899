//! Chat-completions / Messages endpoint handlers: detect `sourceFormat`,
//! dispatch to [`crate::handler::handle_completion`], and branch to the
//! streaming path when the body requests `stream: true`.

use std::sync::Arc;

use axum::{body::Bytes, extract::{Extension, State}, http::StatusCode, response::Response};
use serde_json::Value;

use crate::amp_routing::AmpContext;
use crate::api::request_id::RequestId;
use crate::config::Format;
use crate::error::AppError;
use crate::handler::{self, AppState};

const MAX_BODY_BYTES_ENV: &str = "LLM_ROUTER_MAX_REQUEST_BODY_BYTES";
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

fn max_body_bytes() -> usize {
    std::env::var(MAX_BODY_BYTES_ENV).ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_MAX_BODY_BYTES)
}

fn parse_body(raw: &Bytes) -> Result<Value, AppError> {
    if raw.len() > max_body_bytes() {
        return Err(AppError::with_status(anyhow::anyhow!("request body exceeds the configured size limit"), StatusCode::PAYLOAD_TOO_LARGE));
    }
    serde_json::from_slice(raw).map_err(|e| AppError::with_status(anyhow::anyhow!("invalid JSON body: {e}"), StatusCode::BAD_REQUEST))
}

/// `requestedModel` provenance the Amp overlay needs, read from headers the
/// handler doesn't otherwise interpret.
fn amp_context(headers: &axum::http::HeaderMap) -> AmpContext {
    AmpContext {
        agent: headers.get("x-amp-agent").and_then(|v| v.to_str().ok()).map(String::from),
        mode: headers.get("x-amp-mode").and_then(|v| v.to_str().ok()).map(String::from),
        application: headers.get("x-amp-application").and_then(|v| v.to_str().ok()).map(String::from),
    }
}

async fn dispatch(state: Arc<AppState>, request_id: &RequestId, headers: axum::http::HeaderMap, body: Value, source_format: Format) -> Result<Response, AppError> {
    tracing::debug!(request_id = %request_id.0, source_format = ?source_format, "dispatching completion request");
    let ctx = amp_context(&headers);
    handler::handle_completion(&state, body, source_format, ctx).await
}

pub async fn openai_completions(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: axum::http::HeaderMap,
    raw: Bytes,
) -> Result<Response, AppError> {
    let body = parse_body(&raw)?;
    dispatch(state, &request_id, headers, body, Format::OpenAI).await
}

pub async fn claude_messages(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: axum::http::HeaderMap,
    raw: Bytes,
) -> Result<Response, AppError> {
    let body = parse_body(&raw)?;
    dispatch(state, &request_id, headers, body, Format::Claude).await
}

/// `POST /` or `/route` — source format auto-detected from body shape:
/// the presence of a top-level `max_tokens` + `messages` without a
/// `messages[].content` string-or-array ambiguity is not reliable, so the
/// detection instead keys on the field Anthropic requires and OpenAI does
/// not: `max_tokens` at the top level plus absence of `n`/`presence_penalty`
/// (OpenAI-only fields). Defaults to `openai` when ambiguous.
pub async fn auto_route(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: axum::http::HeaderMap,
    raw: Bytes,
) -> Result<Response, AppError> {
    let body = parse_body(&raw)?;
    let source_format = detect_format(&body);
    dispatch(state, &request_id, headers, body, source_format).await
}

fn detect_format(body: &Value) -> Format {
    let has_system_field = body.get("system").is_some();
    let has_openai_only_fields = body.get("n").is_some() || body.get("presence_penalty").is_some() || body.get("frequency_penalty").is_some();
    if has_system_field && !has_openai_only_fields {
        Format::Claude
    } else {
        Format::OpenAI
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_claude_via_system_field() {
        let body = json!({ "model": "m", "system": "be nice", "messages": [] });
        assert_eq!(detect_format(&body), Format::Claude);
    }

    #[test]
    fn detects_openai_by_default() {
        let body = json!({ "model": "m", "messages": [] });
        assert_eq!(detect_format(&body), Format::OpenAI);
    }

    #[test]
    fn openai_only_fields_override_system_field_ambiguity() {
        let body = json!({ "model": "m", "system": "x", "n": 2 });
        assert_eq!(detect_format(&body), Format::OpenAI);
    }
}
