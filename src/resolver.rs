//! Route resolver: turns a requested route reference into an ordered plan of
//! concrete `(provider, model, wire format)` candidates.
//!
//! Resolution is pure — it only reads the [`RuntimeConfig`] snapshot, never
//! the state store. The same `(config, requestedModel, sourceFormat)` always
//! produces the same [`RoutePlan`].

use crate::config::{parse_route_ref, AliasTarget, Format, ModelConfig, ProviderConfig, RouteRef, RuntimeConfig, Strategy};

/// A concrete, resolved upstream target.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub provider_id: String,
    pub model_id: String,
    pub request_model_id: String,
    pub target_format: Format,
    pub route_weight: Option<f64>,
    pub route_tier: RouteTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTier {
    Primary,
    Fallback,
}

impl Candidate {
    pub fn candidate_key(&self) -> String {
        format!(
            "candidate:{}@{}",
            urlencode(&self.request_model_id),
            urlencode(&self.target_format.to_string())
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    Direct,
    Alias,
    Unknown,
}

impl RouteType {
    fn as_str(self) -> &'static str {
        match self {
            RouteType::Direct => "direct",
            RouteType::Alias => "alias",
            RouteType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub requested_model: String,
    pub resolved_model: Option<String>,
    pub route_type: RouteType,
    pub route_ref: String,
    pub route_strategy: Strategy,
    pub primary: Option<Candidate>,
    pub fallbacks: Vec<Candidate>,
    pub error: Option<String>,
}

impl RoutePlan {
    /// Every candidate in the plan, primary first.
    pub fn all_candidates(&self) -> Vec<Candidate> {
        let mut out = Vec::new();
        if let Some(primary) = &self.primary {
            out.push(primary.clone());
        }
        out.extend(self.fallbacks.iter().cloned());
        out
    }

    /// The route key used for the round-robin cursor, per the data model:
    /// `route:<routeType>:<routeRef>@<sourceFormat>`.
    pub fn route_key(&self, source_format: Format) -> String {
        format!(
            "route:{}:{}@{}",
            urlencode(self.route_type.as_str()),
            urlencode(&self.route_ref),
            urlencode(&source_format.to_string())
        )
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Resolve `requestedModel` (empty/absent treated as `"smart"`) against
/// `config` for a client speaking `sourceFormat`.
pub fn resolve(config: &RuntimeConfig, requested_model: &str, source_format: Format) -> RoutePlan {
    let requested_model = if requested_model.trim().is_empty() {
        "smart".to_string()
    } else {
        requested_model.to_string()
    };

    let mut effective = requested_model.clone();
    if effective == "smart" {
        effective = config.default_model.clone();
    }
    if effective == "smart" {
        return RoutePlan {
            requested_model,
            resolved_model: None,
            route_type: RouteType::Unknown,
            route_ref: "smart".to_string(),
            route_strategy: Strategy::Ordered,
            primary: None,
            fallbacks: vec![],
            error: Some("No default model is configured.".to_string()),
        };
    }

    let Some(route_ref) = parse_route_ref(&effective) else {
        return RoutePlan {
            requested_model,
            resolved_model: None,
            route_type: RouteType::Unknown,
            route_ref: effective.clone(),
            route_strategy: Strategy::Ordered,
            primary: None,
            fallbacks: vec![],
            error: Some(format!("'{effective}' is not a valid route reference.")),
        };
    };

    match route_ref {
        RouteRef::Direct { provider, model } => {
            resolve_direct(config, &requested_model, &provider, &model, source_format)
        }
        RouteRef::Alias(alias_id) => resolve_alias(config, &requested_model, &alias_id, source_format),
    }
}

fn find_enabled_model<'a>(
    config: &'a RuntimeConfig,
    provider_id: &str,
    model_id: &str,
) -> Option<(&'a ProviderConfig, &'a ModelConfig)> {
    let provider = config.providers.iter().find(|p| p.id == provider_id && p.enabled)?;
    let model = provider.model(model_id).filter(|m| m.enabled)?;
    Some((provider, model))
}

fn build_candidate(
    provider: &ProviderConfig,
    model: &ModelConfig,
    source_format: Format,
    weight: Option<f64>,
    tier: RouteTier,
) -> Candidate {
    Candidate {
        provider_id: provider.id.clone(),
        model_id: model.id.clone(),
        request_model_id: format!("{}/{}", provider.id, model.id),
        target_format: select_target_format(provider, model, source_format),
        route_weight: weight,
        route_tier: tier,
    }
}

/// Per spec §4.1: intersect model-declared formats with provider-declared
/// formats (model filter wins when non-empty), prefer the source format when
/// supported, otherwise the first supported format, otherwise the provider's
/// preferred format.
fn select_target_format(provider: &ProviderConfig, model: &ModelConfig, source_format: Format) -> Format {
    let provider_formats = if provider.formats.is_empty() {
        vec![provider.preferred_format()]
    } else {
        provider.formats.clone()
    };
    let supported: Vec<Format> = if model.formats.is_empty() {
        provider_formats.clone()
    } else {
        model
            .formats
            .iter()
            .copied()
            .filter(|f| provider_formats.contains(f))
            .collect()
    };
    let supported = if supported.is_empty() { provider_formats } else { supported };

    if supported.contains(&source_format) {
        source_format
    } else {
        supported.first().copied().unwrap_or(provider.preferred_format())
    }
}

fn resolve_direct(
    config: &RuntimeConfig,
    requested_model: &str,
    provider_id: &str,
    model_id: &str,
    source_format: Format,
) -> RoutePlan {
    let Some((provider, model)) = find_enabled_model(config, provider_id, model_id) else {
        return RoutePlan {
            requested_model: requested_model.to_string(),
            resolved_model: None,
            route_type: RouteType::Direct,
            route_ref: format!("{provider_id}/{model_id}"),
            route_strategy: Strategy::Ordered,
            primary: None,
            fallbacks: vec![],
            error: Some(format!("'{provider_id}/{model_id}' does not resolve to an enabled model.")),
        };
    };

    let primary = build_candidate(provider, model, source_format, None, RouteTier::Primary);

    let mut fallbacks = Vec::new();
    for fb in &model.fallback_models {
        if let Some((p, m)) = fb
            .split_once('/')
            .and_then(|(p, m)| find_enabled_model(config, p, m))
        {
            let candidate = build_candidate(p, m, source_format, None, RouteTier::Fallback);
            if candidate.request_model_id != primary.request_model_id
                && !fallbacks.iter().any(|c: &Candidate| c.request_model_id == candidate.request_model_id)
            {
                fallbacks.push(candidate);
            }
        }
    }

    RoutePlan {
        requested_model: requested_model.to_string(),
        resolved_model: Some(primary.request_model_id.clone()),
        route_type: RouteType::Direct,
        route_ref: format!("{provider_id}/{model_id}"),
        route_strategy: Strategy::Ordered,
        primary: Some(primary),
        fallbacks,
        error: None,
    }
}

/// Expand a single alias target (direct or nested alias) into zero-or-more
/// candidates, threading a DFS stack to short-circuit on a cycle.
fn expand_target(
    config: &RuntimeConfig,
    target: &AliasTarget,
    source_format: Format,
    tier: RouteTier,
    stack: &mut Vec<String>,
    out: &mut Vec<Candidate>,
) -> Option<String> {
    if let Some((provider_id, model_id)) = target.target_ref.split_once('/') {
        if let Some((p, m)) = find_enabled_model(config, provider_id, model_id) {
            let candidate = build_candidate(p, m, source_format, target.weight, tier);
            if !out.iter().any(|c| c.request_model_id == candidate.request_model_id) {
                out.push(candidate);
            }
        }
        return None;
    }

    let alias_id = &target.target_ref;
    if let Some(pos) = stack.iter().position(|s| s == alias_id) {
        let mut cycle = stack[pos..].to_vec();
        cycle.push(alias_id.clone());
        return Some(format!("Alias cycle detected: {}", cycle.join(" -> ")));
    }
    let alias = config.model_aliases.get(alias_id)?;
    stack.push(alias_id.clone());
    for inner in &alias.targets {
        if let Some(err) = expand_target(config, inner, source_format, tier, stack, out) {
            stack.pop();
            return Some(err);
        }
    }
    for inner in &alias.fallback_targets {
        if let Some(err) = expand_target(config, inner, source_format, RouteTier::Fallback, stack, out) {
            stack.pop();
            return Some(err);
        }
    }
    stack.pop();
    None
}

fn resolve_alias(
    config: &RuntimeConfig,
    requested_model: &str,
    alias_id: &str,
    source_format: Format,
) -> RoutePlan {
    let Some(alias) = config.model_aliases.get(alias_id) else {
        return RoutePlan {
            requested_model: requested_model.to_string(),
            resolved_model: None,
            route_type: RouteType::Alias,
            route_ref: alias_id.to_string(),
            route_strategy: Strategy::Ordered,
            primary: None,
            fallbacks: vec![],
            error: Some(format!("Alias '{alias_id}' is not configured.")),
        };
    };

    let mut primaries = Vec::new();
    let mut stack = vec![alias_id.to_string()];
    for target in &alias.targets {
        if let Some(err) = expand_target(config, target, source_format, RouteTier::Primary, &mut stack, &mut primaries) {
            return RoutePlan {
                requested_model: requested_model.to_string(),
                resolved_model: None,
                route_type: RouteType::Alias,
                route_ref: alias_id.to_string(),
                route_strategy: alias.strategy.normalized(),
                primary: None,
                fallbacks: vec![],
                error: Some(err),
            };
        }
    }

    let mut fallbacks = Vec::new();
    for target in &alias.fallback_targets {
        if let Some(err) = expand_target(config, target, source_format, RouteTier::Fallback, &mut stack, &mut fallbacks) {
            return RoutePlan {
                requested_model: requested_model.to_string(),
                resolved_model: None,
                route_type: RouteType::Alias,
                route_ref: alias_id.to_string(),
                route_strategy: alias.strategy.normalized(),
                primary: None,
                fallbacks: vec![],
                error: Some(err),
            };
        }
    }

    if primaries.is_empty() {
        return RoutePlan {
            requested_model: requested_model.to_string(),
            resolved_model: None,
            route_type: RouteType::Alias,
            route_ref: alias_id.to_string(),
            route_strategy: alias.strategy.normalized(),
            primary: None,
            fallbacks: vec![],
            error: Some(format!("Alias '{alias_id}' has no resolvable targets.")),
        };
    }

    let primary = primaries.remove(0);
    let mut all_fallbacks = primaries;
    for candidate in fallbacks {
        if candidate.request_model_id != primary.request_model_id
            && !all_fallbacks.iter().any(|c: &Candidate| c.request_model_id == candidate.request_model_id)
        {
            all_fallbacks.push(candidate);
        }
    }

    RoutePlan {
        requested_model: requested_model.to_string(),
        resolved_model: Some(primary.request_model_id.clone()),
        route_type: RouteType::Alias,
        route_ref: alias_id.to_string(),
        route_strategy: alias.strategy.normalized(),
        primary: Some(primary),
        fallbacks: all_fallbacks,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AliasConfig, AuthConfig, AuthType, ModelConfig, ProviderConfig};
    use std::collections::HashMap;

    fn provider(id: &str, models: Vec<ModelConfig>) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            name: None,
            enabled: true,
            base_url: "https://api.example.com".to_string(),
            base_url_by_format: HashMap::new(),
            api_key: Some("sk-test".to_string()),
            api_key_env: None,
            formats: vec![Format::OpenAI],
            format: Some(Format::OpenAI),
            auth: Some(AuthConfig {
                kind: AuthType::Bearer,
                header_name: None,
                prefix: None,
            }),
            auth_by_format: HashMap::new(),
            headers: HashMap::new(),
            anthropic_version: None,
            anthropic_beta: None,
            models,
            rate_limits: vec![],
        }
    }

    fn model(id: &str, fallback_models: Vec<&str>) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            aliases: vec![],
            formats: vec![],
            enabled: true,
            context_window: None,
            fallback_models: fallback_models.into_iter().map(String::from).collect(),
        }
    }

    fn sample_config() -> RuntimeConfig {
        RuntimeConfig {
            version: 1,
            default_model: "alias:chat.default".to_string(),
            master_key: None,
            providers: vec![
                provider(
                    "openai",
                    vec![model("gpt-4o-mini", vec!["anthropic/claude-3-5-haiku"])],
                ),
                provider("anthropic", vec![model("claude-3-5-haiku", vec![])]),
            ],
            model_aliases: {
                let mut m = HashMap::new();
                m.insert(
                    "chat.default".to_string(),
                    AliasConfig {
                        strategy: Strategy::RoundRobin,
                        targets: vec![
                            AliasTarget { target_ref: "openai/gpt-4o-mini".into(), weight: None, metadata: None },
                            AliasTarget { target_ref: "anthropic/claude-3-5-haiku".into(), weight: None, metadata: None },
                        ],
                        fallback_targets: vec![],
                        metadata: None,
                    },
                );
                m
            },
            amp_routing: None,
        }
    }

    #[test]
    fn resolves_direct_reference_with_fallback() {
        let cfg = sample_config();
        let plan = resolve(&cfg, "openai/gpt-4o-mini", Format::OpenAI);
        assert!(plan.error.is_none());
        assert_eq!(plan.primary.unwrap().request_model_id, "openai/gpt-4o-mini");
        assert_eq!(plan.fallbacks[0].request_model_id, "anthropic/claude-3-5-haiku");
    }

    #[test]
    fn resolves_smart_to_default_alias() {
        let cfg = sample_config();
        let plan = resolve(&cfg, "smart", Format::OpenAI);
        assert!(plan.error.is_none());
        assert_eq!(plan.route_type, RouteType::Alias);
        assert_eq!(plan.primary.unwrap().request_model_id, "openai/gpt-4o-mini");
        assert_eq!(plan.fallbacks.len(), 1);
    }

    #[test]
    fn resolves_alias_prefixed_reference() {
        let cfg = sample_config();
        let plan = resolve(&cfg, "alias:chat.default", Format::OpenAI);
        assert!(plan.error.is_none());
        assert_eq!(plan.route_ref, "chat.default");
    }

    #[test]
    fn reports_cycle_in_alias_graph() {
        let mut cfg = sample_config();
        cfg.model_aliases.insert(
            "a".to_string(),
            AliasConfig {
                strategy: Strategy::Ordered,
                targets: vec![AliasTarget { target_ref: "b".into(), weight: None, metadata: None }],
                fallback_targets: vec![],
                metadata: None,
            },
        );
        cfg.model_aliases.insert(
            "b".to_string(),
            AliasConfig {
                strategy: Strategy::Ordered,
                targets: vec![AliasTarget { target_ref: "a".into(), weight: None, metadata: None }],
                fallback_targets: vec![],
                metadata: None,
            },
        );
        let plan = resolve(&cfg, "a", Format::OpenAI);
        assert!(plan.error.unwrap().starts_with("Alias cycle detected"));
    }

    #[test]
    fn unknown_direct_reference_yields_error() {
        let cfg = sample_config();
        let plan = resolve(&cfg, "openai/does-not-exist", Format::OpenAI);
        assert!(plan.error.is_some());
        assert!(plan.primary.is_none());
    }

    #[test]
    fn target_format_prefers_source_format_when_supported() {
        let mut cfg = sample_config();
        cfg.providers[1].formats = vec![Format::OpenAI, Format::Claude];
        let plan = resolve(&cfg, "anthropic/claude-3-5-haiku", Format::Claude);
        assert_eq!(plan.primary.unwrap().target_format, Format::Claude);
    }

    #[test]
    fn target_format_falls_back_when_source_unsupported() {
        let cfg = sample_config();
        // anthropic provider only declares openai in this fixture's base config
        let plan = resolve(&cfg, "openai/gpt-4o-mini", Format::Claude);
        assert_eq!(plan.primary.unwrap().target_format, Format::OpenAI);
    }

    #[test]
    fn route_key_is_stable_for_same_inputs() {
        let cfg = sample_config();
        let plan_a = resolve(&cfg, "smart", Format::OpenAI);
        let plan_b = resolve(&cfg, "smart", Format::OpenAI);
        assert_eq!(plan_a.route_key(Format::OpenAI), plan_b.route_key(Format::OpenAI));
    }
}
