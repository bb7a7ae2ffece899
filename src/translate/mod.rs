//! Translator collaborators: convert request/response bodies between the two
//! wire formats a candidate might speak (`openai`, `claude`).
//!
//! The non-streaming translation functions live in [`claude`]; reasoning
//! effort normalization lives in [`reasoning`]. This module only picks which
//! direction to call and handles the streaming SSE case, grounded on the
//! teacher's `backends/anthropic.rs` streaming loop shape.

pub mod claude;
pub mod reasoning;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::config::Format;
pub use reasoning::Effort;

/// Translate a request body from `source` format to `target` format. A
/// same-format pass-through is a clone, not a no-op branch, so callers can
/// always treat this as "the body this candidate's upstream expects."
pub fn translate_request(body: &Value, source: Format, target: Format, effort: Option<Effort>) -> anyhow::Result<Value> {
    match (source, target) {
        (Format::OpenAI, Format::OpenAI) => {
            let mut body = body.clone();
            if let Some(effort) = effort {
                reasoning::apply_to_openai_body(&mut body, effort);
            }
            Ok(body)
        }
        (Format::Claude, Format::Claude) => {
            let mut body = body.clone();
            if let Some(effort) = effort {
                reasoning::apply_to_claude_body(&mut body, effort);
            }
            Ok(body)
        }
        (Format::OpenAI, Format::Claude) => claude::to_claude(body, effort),
        (Format::Claude, Format::OpenAI) => claude::to_openai(body, effort),
    }
}

/// Translate a response body from `source` format (what the upstream
/// actually returned) to `target` format (what the client asked for).
pub fn translate_response(body: &Value, source: Format, target: Format) -> anyhow::Result<Value> {
    match (source, target) {
        (Format::OpenAI, Format::OpenAI) | (Format::Claude, Format::Claude) => Ok(body.clone()),
        (Format::Claude, Format::OpenAI) => claude::from_claude(body),
        (Format::OpenAI, Format::Claude) => claude::to_claude_response(body),
    }
}

/// A single decoded chunk of an SSE stream, either fully translated into the
/// target format's wire bytes or passed through unchanged.
pub struct TranslatedChunk {
    pub bytes: Bytes,
    pub done: bool,
}

/// Translate an upstream SSE byte stream into the target format's SSE shape,
/// event by event. When `source == target` this only re-frames whatever
/// arrives, never buffering more than one event at a time — a mismatched
/// format pair incurs incremental per-event JSON parsing instead.
pub fn translate_stream(
    upstream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin + Send + 'static,
    source: Format,
    target: Format,
) -> impl Stream<Item = anyhow::Result<TranslatedChunk>> + Send {
    let mut buf = Vec::new();
    let mut state = StreamState::default();
    upstream.flat_map(move |chunk| {
        let events: Vec<anyhow::Result<TranslatedChunk>> = match chunk {
            Ok(bytes) => {
                buf.extend_from_slice(&bytes);
                drain_events(&mut buf, source, target, &mut state)
            }
            Err(e) => vec![Err(anyhow::anyhow!(e))],
        };
        futures_util::stream::iter(events)
    })
}

#[derive(Default)]
struct StreamState {
    // Claude→OpenAI needs the message id and model carried across the
    // `message_start` event into every subsequent `chunk` event.
    message_id: Option<String>,
    model: Option<String>,
    tool_call_index: usize,
}

fn drain_events(
    buf: &mut Vec<u8>,
    source: Format,
    target: Format,
    state: &mut StreamState,
) -> Vec<anyhow::Result<TranslatedChunk>> {
    let mut out = Vec::new();
    while let Some(boundary) = find_event_boundary(buf) {
        let raw = buf.drain(..boundary).collect::<Vec<u8>>();
        let event_text = String::from_utf8_lossy(&raw);

        for line in event_text.lines() {
            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                out.push(Ok(TranslatedChunk {
                    bytes: Bytes::from_static(b"data: [DONE]\n\n"),
                    done: true,
                }));
                continue;
            }
            match translate_stream_event(data, source, target, state) {
                Ok(Some(translated)) => out.push(Ok(TranslatedChunk {
                    bytes: Bytes::from(format!("data: {translated}\n\n")),
                    done: false,
                })),
                Ok(None) => {}
                Err(e) => out.push(Err(e)),
            }
        }
    }
    out
}

fn find_event_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}

fn translate_stream_event(data: &str, source: Format, target: Format, state: &mut StreamState) -> anyhow::Result<Option<String>> {
    if source == target {
        return Ok(Some(data.to_string()));
    }
    let event: Value = serde_json::from_str(data)?;
    match (source, target) {
        (Format::Claude, Format::OpenAI) => Ok(claude_event_to_openai_chunk(&event, state)?),
        (Format::OpenAI, Format::Claude) => Ok(openai_chunk_to_claude_event(&event, state)?),
        _ => unreachable!("same-format case handled above"),
    }
}

/// One Claude SSE event translated into an OpenAI `chat.completion.chunk`,
/// or `None` for event types with no chunk equivalent (e.g. `ping`).
fn claude_event_to_openai_chunk(event: &Value, state: &mut StreamState) -> anyhow::Result<Option<String>> {
    let delta = match event["type"].as_str() {
        Some("message_start") => {
            state.message_id = event["message"]["id"].as_str().map(String::from);
            state.model = event["message"]["model"].as_str().map(String::from);
            serde_json::json!({ "role": "assistant", "content": "" })
        }
        Some("content_block_delta") => match event["delta"]["type"].as_str() {
            Some("text_delta") => serde_json::json!({ "content": event["delta"]["text"] }),
            Some("input_json_delta") => serde_json::json!({
                "tool_calls": [{
                    "index": state.tool_call_index,
                    "function": { "arguments": event["delta"]["partial_json"] },
                }],
            }),
            _ => return Ok(None),
        },
        Some("content_block_start") if event["content_block"]["type"] == "tool_use" => {
            let idx = state.tool_call_index;
            state.tool_call_index += 1;
            serde_json::json!({
                "tool_calls": [{
                    "index": idx,
                    "id": event["content_block"]["id"],
                    "type": "function",
                    "function": { "name": event["content_block"]["name"], "arguments": "" },
                }],
            })
        }
        Some("message_delta") => {
            let finish = event["delta"]["stop_reason"].as_str().map(|r| match r {
                "end_turn" | "stop_sequence" => "stop",
                "max_tokens" => "length",
                "tool_use" => "tool_calls",
                other => other,
            });
            let chunk = serde_json::json!({
                "id": state.message_id,
                "object": "chat.completion.chunk",
                "model": state.model,
                "choices": [{ "index": 0, "delta": {}, "finish_reason": finish }],
            });
            return Ok(Some(chunk.to_string()));
        }
        _ => return Ok(None),
    };

    let chunk = serde_json::json!({
        "id": state.message_id,
        "object": "chat.completion.chunk",
        "model": state.model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": Value::Null }],
    });
    Ok(Some(chunk.to_string()))
}

/// One OpenAI `chat.completion.chunk` translated into a Claude SSE event.
/// Lossy in the same way the rest of this dispatcher is lossy: a single
/// OpenAI delta produces at most one Claude event, never the
/// `message_start`/`content_block_start` pair a native Claude stream would
/// emit, since OpenAI chunks don't carry that framing distinction.
fn openai_chunk_to_claude_event(event: &Value, state: &mut StreamState) -> anyhow::Result<Option<String>> {
    state.model = event["model"].as_str().map(String::from).or_else(|| state.model.clone());
    let delta = &event["choices"][0]["delta"];

    if let Some(text) = delta["content"].as_str() {
        let chunk = serde_json::json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": text },
        });
        return Ok(Some(chunk.to_string()));
    }

    if let Some(reason) = event["choices"][0]["finish_reason"].as_str() {
        let stop_reason = match reason {
            "length" => "max_tokens",
            "tool_calls" => "tool_use",
            _ => "end_turn",
        };
        let chunk = serde_json::json!({
            "type": "message_delta",
            "delta": { "stop_reason": stop_reason },
        });
        return Ok(Some(chunk.to_string()));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn translate_request_same_format_is_pass_through_clone() {
        let body = json!({ "model": "m", "messages": [] });
        let out = translate_request(&body, Format::OpenAI, Format::OpenAI, None).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn translate_request_cross_format_delegates_to_claude_module() {
        let body = json!({ "model": "m", "messages": [{ "role": "user", "content": "hi" }] });
        let out = translate_request(&body, Format::OpenAI, Format::Claude, None).unwrap();
        assert!(out.get("max_tokens").is_some());
    }

    #[test]
    fn translate_response_cross_format_delegates() {
        let body = json!({
            "id": "msg_1", "model": "m",
            "content": [{ "type": "text", "text": "hi" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 1, "output_tokens": 1 },
        });
        let out = translate_response(&body, Format::Claude, Format::OpenAI).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hi");
    }

    #[test]
    fn claude_content_block_delta_becomes_openai_chunk() {
        let mut state = StreamState::default();
        let event = json!({
            "type": "content_block_delta",
            "delta": { "type": "text_delta", "text": "hi" },
        });
        let out = claude_event_to_openai_chunk(&event, &mut state).unwrap().unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["choices"][0]["delta"]["content"], "hi");
    }

    #[test]
    fn openai_content_delta_becomes_claude_event() {
        let mut state = StreamState::default();
        let event = json!({ "model": "m", "choices": [{ "delta": { "content": "hi" } }] });
        let out = openai_chunk_to_claude_event(&event, &mut state).unwrap().unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["delta"]["text"], "hi");
    }

    #[test]
    fn event_boundary_requires_double_newline() {
        let mut buf = b"data: {}\n".to_vec();
        assert!(find_event_boundary(&buf).is_none());
        buf.extend_from_slice(b"\n");
        assert_eq!(find_event_boundary(&buf), Some(buf.len()));
    }
}
