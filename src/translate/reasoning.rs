//! Reasoning-effort normalization and re-emission.
//!
//! A per-request hint is extracted from body fields or headers, normalized to
//! a common tier, then re-emitted into whichever wire format the chosen
//! candidate speaks. The budget-token tiers are grounded on
//! `agentgateway`'s `llm/conversion/messages.rs` reasoning-effort mapping
//! (`Minimal`/`Low` → 1024, `Medium` → 2048, `High`/`Xhigh` → 4096).

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effort {
    None,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl Effort {
    pub fn parse(raw: &str) -> Option<Effort> {
        match raw.to_ascii_lowercase().as_str() {
            "none" => Some(Effort::None),
            "minimal" => Some(Effort::Minimal),
            "low" => Some(Effort::Low),
            "medium" => Some(Effort::Medium),
            "high" => Some(Effort::High),
            "xhigh" | "x-high" => Some(Effort::Xhigh),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Effort::None => "none",
            Effort::Minimal => "minimal",
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
            Effort::Xhigh => "xhigh",
        }
    }

    /// Claude `thinking.budget_tokens` for this tier. `None` disables
    /// extended thinking entirely.
    pub fn budget_tokens(self) -> Option<u64> {
        match self {
            Effort::None => None,
            Effort::Minimal | Effort::Low => Some(1024),
            Effort::Medium => Some(2048),
            Effort::High | Effort::Xhigh => Some(4096),
        }
    }
}

/// Extract an effort hint from an OpenAI-shaped body: `reasoning_effort` at
/// the top level, or nested `reasoning.effort`.
pub fn extract_from_openai_body(body: &Value) -> Option<Effort> {
    body.get("reasoning_effort")
        .and_then(Value::as_str)
        .or_else(|| body.get("reasoning").and_then(|r| r.get("effort")).and_then(Value::as_str))
        .and_then(Effort::parse)
}

/// Extract an effort hint from a Claude-shaped body's `thinking` block by
/// mapping its `budget_tokens` back to the nearest tier.
pub fn extract_from_claude_body(body: &Value) -> Option<Effort> {
    let budget = body.get("thinking")?.get("budget_tokens")?.as_u64()?;
    Some(match budget {
        0 => Effort::None,
        1..=1024 => Effort::Low,
        1025..=2048 => Effort::Medium,
        _ => Effort::High,
    })
}

/// Stamp `effort` onto an OpenAI-shaped request body as `reasoning_effort`.
pub fn apply_to_openai_body(body: &mut Value, effort: Effort) {
    if effort == Effort::None {
        return;
    }
    body["reasoning_effort"] = Value::String(effort.as_str().to_string());
}

/// Stamp `effort` onto a Claude-shaped request body as a `thinking` block
/// sized to a fraction of `max_tokens`.
pub fn apply_to_claude_body(body: &mut Value, effort: Effort) {
    let Some(budget) = effort.budget_tokens() else {
        return;
    };
    let max_tokens = body.get("max_tokens").and_then(Value::as_u64).unwrap_or(8192);
    let budget = budget.min(max_tokens.saturating_sub(1).max(1));
    body["thinking"] = serde_json::json!({ "type": "enabled", "budget_tokens": budget });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_tiers_case_insensitively() {
        assert_eq!(Effort::parse("MEDIUM"), Some(Effort::Medium));
        assert_eq!(Effort::parse("xhigh"), Some(Effort::Xhigh));
        assert_eq!(Effort::parse("bogus"), None);
    }

    #[test]
    fn budget_tiers_match_reference_mapping() {
        assert_eq!(Effort::Minimal.budget_tokens(), Some(1024));
        assert_eq!(Effort::Low.budget_tokens(), Some(1024));
        assert_eq!(Effort::Medium.budget_tokens(), Some(2048));
        assert_eq!(Effort::High.budget_tokens(), Some(4096));
        assert_eq!(Effort::Xhigh.budget_tokens(), Some(4096));
        assert_eq!(Effort::None.budget_tokens(), None);
    }

    #[test]
    fn extracts_top_level_reasoning_effort() {
        let body = json!({ "reasoning_effort": "high" });
        assert_eq!(extract_from_openai_body(&body), Some(Effort::High));
    }

    #[test]
    fn extracts_nested_reasoning_effort() {
        let body = json!({ "reasoning": { "effort": "low" } });
        assert_eq!(extract_from_openai_body(&body), Some(Effort::Low));
    }

    #[test]
    fn applies_thinking_block_capped_by_max_tokens() {
        let mut body = json!({ "max_tokens": 500 });
        apply_to_claude_body(&mut body, Effort::Medium);
        assert_eq!(body["thinking"]["budget_tokens"], 499);
    }

    #[test]
    fn none_effort_leaves_body_untouched() {
        let mut body = json!({ "max_tokens": 500 });
        apply_to_claude_body(&mut body, Effort::None);
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn round_trips_budget_back_to_a_tier() {
        let body = json!({ "thinking": { "budget_tokens": 2048 } });
        assert_eq!(extract_from_claude_body(&body), Some(Effort::Medium));
    }
}
