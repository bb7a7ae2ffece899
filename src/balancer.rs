//! Balancer / scheduler: ranks a route plan's candidates under a scheduling
//! strategy, skipping cooldown- or quota-blocked candidates, and commits the
//! route cursor exactly once per request.
//!
//! The overall shape — iterate candidates, check eligibility, pick one,
//! persist the outcome — mirrors the teacher's `dispatch`/`escalate`
//! attempt-iteration loop in `router.rs`; the weighted-slot construction and
//! quota-aware weighting are new, grounded on spec §4.3.

use crate::config::{RuntimeConfig, Strategy};
use crate::rate_limit;
use crate::resolver::Candidate;
use crate::state::StateStore;

const MAX_WEIGHTED_SLOTS: usize = 512;

#[derive(Debug, Clone)]
pub struct Entry {
    pub candidate: Candidate,
    pub eligible: bool,
    pub skip_reasons: Vec<&'static str>,
    pub remaining_capacity_ratio: f64,
    pub health_factor: f64,
}

#[derive(Debug, Clone)]
pub struct Ranking {
    pub entries: Vec<Entry>,
    pub selected_index: Option<usize>,
    pub route_cursor: u64,
    pub next_cursor: u64,
    pub should_advance_cursor: bool,
}

impl Ranking {
    #[cfg(test)]
    fn selected(&self) -> Option<&Entry> {
        self.selected_index.map(|i| &self.entries[i])
    }
}

fn health_factor(consecutive_retryable_failures: u32) -> f64 {
    let base = 1.0 / (1.0 + 0.5 * consecutive_retryable_failures as f64);
    base.clamp(0.05, 1.0)
}

/// Build a per-candidate entry: read candidate + rate-limit state, derive
/// eligibility and weighting inputs. Does not mutate the store.
async fn build_entry(
    config: &RuntimeConfig,
    store: &StateStore,
    candidate: &Candidate,
    now_ms: i64,
) -> anyhow::Result<Entry> {
    let mut skip_reasons = Vec::new();

    let candidate_state = store.get_candidate_state(&candidate.candidate_key()).await?;
    let blocked = candidate_state.as_ref().map(|s| s.blocked(now_ms)).unwrap_or(false);
    if blocked {
        skip_reasons.push("cooldown");
    }
    let consecutive_failures = candidate_state
        .as_ref()
        .map(|s| s.consecutive_retryable_failures)
        .unwrap_or(0);

    let provider = config.providers.iter().find(|p| p.id == candidate.provider_id);
    let remaining_capacity_ratio = if let Some(provider) = provider {
        let buckets = rate_limit::applicable_buckets(provider, &candidate.model_id, now_ms);
        let evaluation = rate_limit::evaluate(store, &buckets).await?;
        if !evaluation.eligible {
            skip_reasons.push("quota-exhausted");
        }
        evaluation.remaining_capacity_ratio
    } else {
        1.0
    };

    Ok(Entry {
        candidate: candidate.clone(),
        eligible: skip_reasons.is_empty(),
        skip_reasons,
        remaining_capacity_ratio,
        health_factor: health_factor(consecutive_failures),
    })
}

/// Rank `candidates` (primary first, then fallbacks, per the route plan)
/// under `strategy`. Does not commit the cursor — call [`commit`] with the
/// chosen entry once the handler has decided which candidate to attempt.
pub async fn rank(
    config: &RuntimeConfig,
    store: &StateStore,
    route_key: &str,
    candidates: &[Candidate],
    strategy: Strategy,
    now_ms: i64,
) -> anyhow::Result<Ranking> {
    let mut entries = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        entries.push(build_entry(config, store, candidate, now_ms).await?);
    }

    let cursor = store.get_route_cursor(route_key).await?;
    let strategy = strategy.normalized();

    let (ordered, next_cursor, should_advance) = match strategy {
        Strategy::Ordered => (entries.clone(), cursor, false),
        Strategy::RoundRobin => rotate(&entries, cursor),
        Strategy::WeightedRr | Strategy::QuotaAwareWeightedRr => {
            weighted_rotate(&entries, cursor, strategy == Strategy::QuotaAwareWeightedRr)
        }
        Strategy::Auto => unreachable!("normalized above"),
    };

    // `selected_index` indexes into `ordered` below (which becomes
    // `Ranking.entries`), not the pre-rotation `entries` — the first
    // eligible entry in rotation order is the one to attempt.
    let selected_index = ordered.iter().position(|e| e.eligible);

    Ok(Ranking {
        entries: ordered,
        selected_index,
        route_cursor: cursor,
        next_cursor,
        should_advance_cursor: should_advance,
    })
}

fn rotate(entries: &[Entry], cursor: u64) -> (Vec<Entry>, u64, bool) {
    let eligible: Vec<Entry> = entries.iter().filter(|e| e.eligible).cloned().collect();
    let ineligible: Vec<Entry> = entries.iter().filter(|e| !e.eligible).cloned().collect();
    if eligible.is_empty() {
        return (ineligible, cursor, false);
    }
    let offset = (cursor as usize) % eligible.len();
    let mut rotated = eligible[offset..].to_vec();
    rotated.extend_from_slice(&eligible[..offset]);
    rotated.extend(ineligible);
    let next_cursor = (cursor + 1) % eligible.len() as u64;
    (rotated, next_cursor, true)
}

/// Build a slot vector: each candidate's `weight * 100` scaled down by the
/// gcd of all scaled weights, capped at [`MAX_WEIGHTED_SLOTS`] total slots,
/// with every candidate guaranteed at least one slot.
fn weighted_rotate(entries: &[Entry], cursor: u64, quota_aware: bool) -> (Vec<Entry>, u64, bool) {
    let eligible: Vec<Entry> = entries.iter().filter(|e| e.eligible).cloned().collect();
    let ineligible: Vec<Entry> = entries.iter().filter(|e| !e.eligible).cloned().collect();
    if eligible.is_empty() {
        return (ineligible, cursor, false);
    }

    let effective_weight = |e: &Entry| -> f64 {
        let base = e.candidate.route_weight.unwrap_or(1.0).max(0.0);
        if quota_aware {
            base * e.remaining_capacity_ratio.clamp(0.0, 1.0) * e.health_factor
        } else {
            base
        }
    };

    let scaled: Vec<u64> = eligible
        .iter()
        .map(|e| ((effective_weight(e) * 100.0).round().max(1.0)) as u64)
        .collect();

    let g = scaled.iter().copied().fold(0u64, gcd);
    let reduced: Vec<u64> = if g > 1 {
        scaled.iter().map(|w| (w / g).max(1)).collect()
    } else {
        scaled
    };

    let total: u64 = reduced.iter().sum();
    let shrink = if total as usize > MAX_WEIGHTED_SLOTS {
        total as f64 / MAX_WEIGHTED_SLOTS as f64
    } else {
        1.0
    };
    let slot_counts: Vec<u64> = reduced
        .iter()
        .map(|w| ((*w as f64 / shrink).round().max(1.0)) as u64)
        .collect();
    let total_slots: u64 = slot_counts.iter().sum();

    let mut slots: Vec<usize> = Vec::with_capacity(total_slots as usize);
    for (idx, count) in slot_counts.iter().enumerate() {
        for _ in 0..*count {
            slots.push(idx);
        }
    }

    let offset = (cursor % total_slots) as usize;
    let mut order = Vec::with_capacity(eligible.len());
    let mut seen = vec![false; eligible.len()];
    for i in 0..slots.len() {
        let idx = slots[(offset + i) % slots.len()];
        if !seen[idx] {
            seen[idx] = true;
            order.push(eligible[idx].clone());
        }
    }

    let next_cursor = (cursor + 1) % total_slots;
    order.extend(ineligible);
    (order, next_cursor, true)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Advance the route cursor once, regardless of how many retries were spent
/// on the selected candidate. Rate-limit consumption happens separately, per
/// candidate actually attempted, in the request handlers.
pub async fn commit(store: &StateStore, route_key: &str, ranking: &Ranking) -> anyhow::Result<()> {
    if ranking.should_advance_cursor {
        tracing::debug!(route_key, from = ranking.route_cursor, to = ranking.next_cursor, "advancing route cursor");
        store.set_route_cursor(route_key, ranking.next_cursor).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Format;
    use crate::resolver::RouteTier;
    use crate::state::memory::MemoryStore;

    fn candidate(provider_id: &str, model_id: &str, weight: Option<f64>) -> Candidate {
        Candidate {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            request_model_id: format!("{provider_id}/{model_id}"),
            target_format: Format::OpenAI,
            route_weight: weight,
            route_tier: RouteTier::Primary,
        }
    }

    fn empty_config() -> RuntimeConfig {
        RuntimeConfig {
            version: 1,
            default_model: "x".into(),
            master_key: None,
            providers: vec![],
            model_aliases: Default::default(),
            amp_routing: None,
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_through_candidates() {
        let store = StateStore::Memory(MemoryStore::new());
        let config = empty_config();
        let candidates = vec![candidate("openrouter", "gpt-4o-mini", None), candidate("anthropic", "claude-3-5-haiku", None)];

        let mut picks = Vec::new();
        for _ in 0..5 {
            let ranking = rank(&config, &store, "route:1", &candidates, Strategy::RoundRobin, 0).await.unwrap();
            let selected = ranking.selected().unwrap().candidate.request_model_id.clone();
            commit(&store, "route:1", &ranking).await.unwrap();
            picks.push(selected);
        }

        assert_eq!(
            picks,
            vec![
                "openrouter/gpt-4o-mini",
                "anthropic/claude-3-5-haiku",
                "openrouter/gpt-4o-mini",
                "anthropic/claude-3-5-haiku",
                "openrouter/gpt-4o-mini",
            ]
        );
    }

    #[tokio::test]
    async fn weighted_rr_distributes_roughly_by_weight() {
        let store = StateStore::Memory(MemoryStore::new());
        let config = empty_config();
        let candidates = vec![candidate("p", "small", Some(1.0)), candidate("p", "large", Some(3.0))];

        let mut small_count = 0;
        let mut large_count = 0;
        for _ in 0..120 {
            let ranking = rank(&config, &store, "route:wrr", &candidates, Strategy::WeightedRr, 0).await.unwrap();
            let selected = ranking.selected().unwrap().candidate.request_model_id.clone();
            commit(&store, "route:wrr", &ranking).await.unwrap();
            if selected == "p/small" {
                small_count += 1;
            } else {
                large_count += 1;
            }
        }

        assert!((20..=40).contains(&small_count), "small={small_count}");
        assert!((80..=100).contains(&large_count), "large={large_count}");
    }

    #[tokio::test]
    async fn ordered_strategy_never_advances_cursor() {
        let store = StateStore::Memory(MemoryStore::new());
        let config = empty_config();
        let candidates = vec![candidate("a", "m1", None), candidate("b", "m2", None)];
        let ranking = rank(&config, &store, "route:ord", &candidates, Strategy::Ordered, 0).await.unwrap();
        assert!(!ranking.should_advance_cursor);
        assert_eq!(ranking.selected().unwrap().candidate.request_model_id, "a/m1");
    }

    #[tokio::test]
    async fn cooldown_blocked_candidate_is_skipped() {
        let store = StateStore::Memory(MemoryStore::new());
        let config = empty_config();
        let candidates = vec![candidate("a", "m1", None), candidate("b", "m2", None)];
        let blocked = crate::state::CandidateState {
            cooldown_until_ms: 1_000_000,
            ..Default::default()
        };
        store
            .set_candidate_state(&candidates[0].candidate_key(), Some(blocked))
            .await
            .unwrap();

        let ranking = rank(&config, &store, "route:cd", &candidates, Strategy::Ordered, 0).await.unwrap();
        assert_eq!(ranking.selected().unwrap().candidate.request_model_id, "b/m2");
        assert!(ranking.entries.iter().any(|e| e.skip_reasons.contains(&"cooldown")));
    }

    #[test]
    fn gcd_reduces_slot_counts() {
        assert_eq!(gcd(200, 400), 200);
        assert_eq!(gcd(150, 100), 50);
    }
}
