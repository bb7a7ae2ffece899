//! OpenAI chat-completions ↔ Anthropic Messages schema translation.
//!
//! The non-streaming base case (system-message extraction, `max_tokens`
//! defaulting, `stop_reason` mapping) is grounded on the teacher's
//! `backends/anthropic.rs` `to_anthropic`/`from_anthropic`. Tool-use mapping,
//! content-block-exhaustive response matching, and the streaming
//! event-by-event translation are enriched from `agentgateway`'s
//! `llm/conversion/messages.rs`.

use anyhow::Context;
use serde_json::{json, Value};

use super::reasoning::{self, Effort};

pub const DEFAULT_MAX_TOKENS: u64 = 8_192;
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Convert an OpenAI chat-completions request body to Anthropic Messages.
pub fn to_claude(request: &Value, effort: Option<Effort>) -> anyhow::Result<Value> {
    let model = request["model"].as_str().context("`model` field is required")?;
    let max_tokens = request["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);
    let raw_messages = request["messages"].as_array().context("`messages` array is required")?;

    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());

    for msg in raw_messages {
        match msg["role"].as_str() {
            Some("system") => {
                if let Some(content) = msg["content"].as_str() {
                    system_parts.push(content);
                }
            }
            Some("tool") => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg["tool_call_id"].as_str().unwrap_or_default(),
                        "content": msg["content"].as_str().unwrap_or_default(),
                    }],
                }));
            }
            Some("assistant") if msg.get("tool_calls").is_some() => {
                messages.push(assistant_tool_calls_to_claude(msg));
            }
            _ => messages.push(msg.clone()),
        }
    }

    let mut req = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !system_parts.is_empty() {
        req["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(stop) = request.get("stop") {
        req["stop_sequences"] = stop.clone();
    }
    if let Some(tools) = request["tools"].as_array() {
        req["tools"] = Value::Array(tools.iter().map(tool_to_claude).collect());
    }
    if let Some(choice) = request.get("tool_choice") {
        req["tool_choice"] = tool_choice_to_claude(choice);
    }
    if let Some(effort) = effort.or_else(|| reasoning::extract_from_openai_body(request)) {
        reasoning::apply_to_claude_body(&mut req, effort);
    }

    Ok(req)
}

fn assistant_tool_calls_to_claude(msg: &Value) -> Value {
    let mut blocks = Vec::new();
    if let Some(text) = msg["content"].as_str() {
        if !text.is_empty() {
            blocks.push(json!({ "type": "text", "text": text }));
        }
    }
    if let Some(calls) = msg["tool_calls"].as_array() {
        for call in calls {
            let args: Value = call["function"]["arguments"]
                .as_str()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(Value::Object(Default::default()));
            blocks.push(json!({
                "type": "tool_use",
                "id": call["id"],
                "name": call["function"]["name"],
                "input": args,
            }));
        }
    }
    json!({ "role": "assistant", "content": blocks })
}

fn tool_to_claude(tool: &Value) -> Value {
    json!({
        "name": tool["function"]["name"],
        "description": tool["function"]["description"],
        "input_schema": tool["function"]["parameters"],
    })
}

fn tool_choice_to_claude(choice: &Value) -> Value {
    match choice.as_str() {
        Some("auto") => json!({ "type": "auto" }),
        Some("none") => json!({ "type": "none" }),
        Some("required") => json!({ "type": "any" }),
        _ => {
            if let Some(name) = choice["function"]["name"].as_str() {
                json!({ "type": "tool", "name": name })
            } else {
                json!({ "type": "auto" })
            }
        }
    }
}

fn stop_reason_to_openai(reason: &str) -> &str {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "stop_sequence" => "stop",
        other => other,
    }
}

fn finish_reason_to_claude(reason: &str) -> &str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        other => other,
    }
}

/// Convert an Anthropic Messages response to the OpenAI chat-completions
/// schema. Every content block type is matched explicitly; unrecognized
/// block types are ignored rather than rejected, so a future Anthropic block
/// type doesn't hard-fail translation.
pub fn from_claude(resp: &Value) -> anyhow::Result<Value> {
    let blocks = resp["content"].as_array().context("Anthropic response missing `content` array")?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                tool_calls.push(json!({
                    "id": block["id"],
                    "type": "function",
                    "function": {
                        "name": block["name"],
                        "arguments": serde_json::to_string(&block["input"]).unwrap_or_default(),
                    },
                }));
            }
            // thinking / redacted_thinking / server_tool_use / tool_result / other
            // block types carry no OpenAI chat-completions equivalent field and
            // are intentionally dropped.
            _ => {}
        }
    }

    let model = resp["model"].as_str().unwrap_or("unknown");
    let stop_reason = resp["stop_reason"].as_str().unwrap_or("end_turn");
    let finish_reason = if !tool_calls.is_empty() { "tool_calls" } else { stop_reason_to_openai(stop_reason) };

    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);

    let mut message = json!({ "role": "assistant", "content": if text.is_empty() { Value::Null } else { Value::String(text) } });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

/// Convert an OpenAI chat-completions response to the Anthropic Messages
/// schema (needed when the client speaks Claude but the resolved candidate's
/// upstream speaks OpenAI).
pub fn to_claude_response(resp: &Value) -> anyhow::Result<Value> {
    let choice = resp["choices"][0].clone();
    let message = &choice["message"];
    let mut content = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let args: Value = call["function"]["arguments"]
                .as_str()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(Value::Object(Default::default()));
            content.push(json!({
                "type": "tool_use",
                "id": call["id"],
                "name": call["function"]["name"],
                "input": args,
            }));
        }
    }

    let finish_reason = choice["finish_reason"].as_str().unwrap_or("stop");
    let prompt_tokens = resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
    let completion_tokens = resp["usage"]["completion_tokens"].as_u64().unwrap_or(0);

    Ok(json!({
        "id": resp["id"],
        "type": "message",
        "role": "assistant",
        "model": resp["model"],
        "content": content,
        "stop_reason": finish_reason_to_claude(finish_reason),
        "usage": {
            "input_tokens": prompt_tokens,
            "output_tokens": completion_tokens,
        },
    }))
}

/// Convert an Anthropic-shaped request body to OpenAI chat-completions
/// (needed when the client speaks Claude but the resolved candidate's
/// upstream speaks OpenAI).
pub fn to_openai(request: &Value, effort: Option<Effort>) -> anyhow::Result<Value> {
    let model = request["model"].as_str().context("`model` field is required")?;
    let mut messages = Vec::new();
    if let Some(system) = request["system"].as_str() {
        messages.push(json!({ "role": "system", "content": system }));
    }
    if let Some(raw) = request["messages"].as_array() {
        for msg in raw {
            messages.push(claude_message_to_openai(msg));
        }
    }

    let mut req = json!({
        "model": model,
        "messages": messages,
        "max_tokens": request["max_tokens"],
    });
    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(stop) = request.get("stop_sequences") {
        req["stop"] = stop.clone();
    }
    if let Some(tools) = request["tools"].as_array() {
        req["tools"] = Value::Array(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t["name"],
                            "description": t["description"],
                            "parameters": t["input_schema"],
                        },
                    })
                })
                .collect(),
        );
    }
    if let Some(effort) = effort.or_else(|| reasoning::extract_from_claude_body(request)) {
        reasoning::apply_to_openai_body(&mut req, effort);
    }

    Ok(req)
}

fn claude_message_to_openai(msg: &Value) -> Value {
    let role = msg["role"].as_str().unwrap_or("user");
    match &msg["content"] {
        Value::String(s) => json!({ "role": role, "content": s }),
        Value::Array(blocks) => {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(t) = block["text"].as_str() {
                            text.push_str(t);
                        }
                    }
                    Some("tool_use") => tool_calls.push(json!({
                        "id": block["id"],
                        "type": "function",
                        "function": {
                            "name": block["name"],
                            "arguments": serde_json::to_string(&block["input"]).unwrap_or_default(),
                        },
                    })),
                    Some("tool_result") => {
                        return json!({
                            "role": "tool",
                            "tool_call_id": block["tool_use_id"],
                            "content": block["content"],
                        });
                    }
                    _ => {}
                }
            }
            let mut out = json!({ "role": role, "content": text });
            if !tool_calls.is_empty() {
                out["tool_calls"] = Value::Array(tool_calls);
            }
            out
        }
        _ => json!({ "role": role, "content": Value::Null }),
    }
}
