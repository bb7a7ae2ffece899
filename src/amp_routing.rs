//! Amp client routing overlay: a pure pre-step that may substitute
//! `requestedModel` before the resolver runs, for traffic the handler has
//! already identified as coming from the Amp client.
//!
//! Client identification itself (header/user-agent matching) is out of
//! scope here — the handler passes in the already-extracted `{agent, mode,
//! application}` fields and this module only applies the lookup-and-rewrite.

use crate::config::AmpRoutingConfig;

/// Already-extracted request provenance the handler derived from headers.
#[derive(Debug, Clone, Default)]
pub struct AmpContext {
    pub agent: Option<String>,
    pub mode: Option<String>,
    pub application: Option<String>,
}

/// Apply the overlay to `requested_model`. Returns the original string
/// unchanged when the overlay is disabled, absent, or none of the lookup
/// tiers match and there is no `fallback_route`.
///
/// Lookup order: `model_map[requested_model]`, `agent_mode_map[(agent,
/// mode)]`, `agent_map[agent]`, `application_map[application]`,
/// `mode_map[mode]`, then `fallback_route`.
pub fn apply(cfg: Option<&AmpRoutingConfig>, ctx: &AmpContext, requested_model: &str) -> String {
    let Some(cfg) = cfg else {
        return requested_model.to_string();
    };
    if !cfg.enabled {
        return requested_model.to_string();
    }

    if let Some(hit) = cfg.model_map.get(requested_model) {
        return hit.clone();
    }
    if let (Some(agent), Some(mode)) = (&ctx.agent, &ctx.mode) {
        let key = format!("{agent}:{mode}");
        if let Some(hit) = cfg.agent_mode_map.get(&key) {
            return hit.clone();
        }
    }
    if let Some(agent) = &ctx.agent {
        if let Some(hit) = cfg.agent_map.get(agent) {
            return hit.clone();
        }
    }
    if let Some(application) = &ctx.application {
        if let Some(hit) = cfg.application_map.get(application) {
            return hit.clone();
        }
    }
    if let Some(mode) = &ctx.mode {
        if let Some(hit) = cfg.mode_map.get(mode) {
            return hit.clone();
        }
    }
    if let Some(fallback) = &cfg.fallback_route {
        return fallback.clone();
    }

    requested_model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg() -> AmpRoutingConfig {
        AmpRoutingConfig {
            enabled: true,
            model_map: HashMap::from([("gpt-4".to_string(), "alias:fast".to_string())]),
            agent_mode_map: HashMap::from([("cli:edit".to_string(), "alias:precise".to_string())]),
            agent_map: HashMap::from([("cli".to_string(), "alias:default-cli".to_string())]),
            application_map: HashMap::from([("vscode".to_string(), "alias:ide".to_string())]),
            mode_map: HashMap::from([("chat".to_string(), "alias:chat-default".to_string())]),
            fallback_route: Some("alias:fallback".to_string()),
        }
    }

    #[test]
    fn disabled_overlay_is_a_no_op() {
        let mut c = cfg();
        c.enabled = false;
        assert_eq!(apply(Some(&c), &AmpContext::default(), "gpt-4"), "gpt-4");
    }

    #[test]
    fn no_config_is_a_no_op() {
        assert_eq!(apply(None, &AmpContext::default(), "gpt-4"), "gpt-4");
    }

    #[test]
    fn model_map_wins_over_every_other_tier() {
        let ctx = AmpContext { agent: Some("cli".into()), mode: Some("edit".into()), application: Some("vscode".into()) };
        assert_eq!(apply(Some(&cfg()), &ctx, "gpt-4"), "alias:fast");
    }

    #[test]
    fn agent_mode_pair_wins_over_agent_alone() {
        let ctx = AmpContext { agent: Some("cli".into()), mode: Some("edit".into()), application: None };
        assert_eq!(apply(Some(&cfg()), &ctx, "unmapped-model"), "alias:precise");
    }

    #[test]
    fn agent_wins_over_application_and_mode() {
        let ctx = AmpContext { agent: Some("cli".into()), mode: Some("chat".into()), application: Some("vscode".into()) };
        assert_eq!(apply(Some(&cfg()), &ctx, "unmapped-model"), "alias:default-cli");
    }

    #[test]
    fn application_wins_over_mode() {
        let ctx = AmpContext { agent: None, mode: Some("chat".into()), application: Some("vscode".into()) };
        assert_eq!(apply(Some(&cfg()), &ctx, "unmapped-model"), "alias:ide");
    }

    #[test]
    fn mode_alone_matches() {
        let ctx = AmpContext { agent: None, mode: Some("chat".into()), application: None };
        assert_eq!(apply(Some(&cfg()), &ctx, "unmapped-model"), "alias:chat-default");
    }

    #[test]
    fn falls_back_when_no_tier_matches() {
        let ctx = AmpContext::default();
        assert_eq!(apply(Some(&cfg()), &ctx, "unmapped-model"), "alias:fallback");
    }

    #[test]
    fn passes_through_when_nothing_matches_and_no_fallback() {
        let mut c = cfg();
        c.fallback_route = None;
        let ctx = AmpContext::default();
        assert_eq!(apply(Some(&c), &ctx, "unmapped-model"), "unmapped-model");
    }
}
