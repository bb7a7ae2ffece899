//! In-memory state store backend.
//!
//! Plain `dashmap::DashMap`s, mirroring the teacher's per-IP token-bucket
//! limiter in `api/rate_limit.rs` (`DashMap<IpAddr, Bucket>`) generalized to
//! this store's three key spaces. Lost on process restart — intended for
//! single-node deployments that don't need state to survive a restart.

use dashmap::DashMap;

use super::{BucketUsage, CandidateState, PruneResult, CANDIDATE_STATE_TTL_MS};

#[derive(Default)]
pub struct MemoryStore {
    route_cursors: DashMap<String, u64>,
    candidate_states: DashMap<String, CandidateState>,
    bucket_usage: DashMap<String, DashMap<String, BucketUsage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_route_cursor(&self, route_key: &str) -> anyhow::Result<u64> {
        Ok(self.route_cursors.get(route_key).map(|v| *v).unwrap_or(0))
    }

    pub fn set_route_cursor(&self, route_key: &str, value: u64) -> anyhow::Result<()> {
        self.route_cursors.insert(route_key.to_string(), value);
        Ok(())
    }

    pub fn get_candidate_state(&self, candidate_key: &str) -> anyhow::Result<Option<CandidateState>> {
        Ok(self.candidate_states.get(candidate_key).map(|v| v.clone()))
    }

    pub fn set_candidate_state(
        &self,
        candidate_key: &str,
        state: Option<CandidateState>,
    ) -> anyhow::Result<()> {
        match state {
            Some(s) => {
                self.candidate_states.insert(candidate_key.to_string(), s);
            }
            None => {
                self.candidate_states.remove(candidate_key);
            }
        }
        Ok(())
    }

    pub fn read_bucket_usage(&self, bucket_key: &str, window_key: &str) -> anyhow::Result<u64> {
        Ok(self
            .bucket_usage
            .get(bucket_key)
            .and_then(|windows| windows.get(window_key).map(|u| u.count))
            .unwrap_or(0))
    }

    pub fn increment_bucket_usage(
        &self,
        bucket_key: &str,
        window_key: &str,
        amount: u64,
        expires_at_ms: i64,
    ) -> anyhow::Result<u64> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let windows = self.bucket_usage.entry(bucket_key.to_string()).or_default();
        let mut entry = windows.entry(window_key.to_string()).or_insert_with(|| BucketUsage {
            count: 0,
            expires_at_ms,
            updated_at_ms: now_ms,
        });
        entry.count += amount;
        entry.expires_at_ms = expires_at_ms;
        entry.updated_at_ms = now_ms;
        Ok(entry.count)
    }

    pub fn prune_expired(&self, now_ms: i64) -> anyhow::Result<PruneResult> {
        let mut pruned_buckets = 0;
        for bucket in self.bucket_usage.iter() {
            let expired: Vec<String> = bucket
                .value()
                .iter()
                .filter(|w| w.value().expires_at_ms <= now_ms)
                .map(|w| w.key().clone())
                .collect();
            for key in expired {
                bucket.value().remove(&key);
                pruned_buckets += 1;
            }
        }

        let mut pruned_candidate_states = 0;
        let expired_candidates: Vec<String> = self
            .candidate_states
            .iter()
            .filter(|c| candidate_expiry(c.value()) <= now_ms)
            .map(|c| c.key().clone())
            .collect();
        for key in expired_candidates {
            self.candidate_states.remove(&key);
            pruned_candidate_states += 1;
        }

        Ok(PruneResult {
            pruned_buckets,
            pruned_candidate_states,
        })
    }
}

fn candidate_expiry(state: &CandidateState) -> i64 {
    let from_blocks = state.cooldown_until_ms.max(state.open_until_ms) + CANDIDATE_STATE_TTL_MS;
    let from_update = state.updated_at_ms + CANDIDATE_STATE_TTL_MS;
    from_blocks.max(from_update)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_cursor_defaults_to_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.get_route_cursor("route:alias:chat@openai").unwrap(), 0);
    }

    #[test]
    fn route_cursor_round_trips() {
        let store = MemoryStore::new();
        store.set_route_cursor("r", 3).unwrap();
        assert_eq!(store.get_route_cursor("r").unwrap(), 3);
    }

    #[test]
    fn candidate_state_round_trips_and_deletes() {
        let store = MemoryStore::new();
        let state = CandidateState {
            consecutive_retryable_failures: 2,
            ..Default::default()
        };
        store.set_candidate_state("c1", Some(state.clone())).unwrap();
        assert_eq!(store.get_candidate_state("c1").unwrap(), Some(state));
        store.set_candidate_state("c1", None).unwrap();
        assert_eq!(store.get_candidate_state("c1").unwrap(), None);
    }

    #[test]
    fn bucket_usage_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.read_bucket_usage("b1", "day:1:2026-01-01").unwrap(), 0);
        store.increment_bucket_usage("b1", "day:1:2026-01-01", 1, 1_000).unwrap();
        store.increment_bucket_usage("b1", "day:1:2026-01-01", 1, 1_000).unwrap();
        assert_eq!(store.read_bucket_usage("b1", "day:1:2026-01-01").unwrap(), 2);
    }

    #[test]
    fn prune_removes_expired_bucket_windows() {
        let store = MemoryStore::new();
        store.increment_bucket_usage("b1", "w1", 1, 100).unwrap();
        store.prune_expired(200).unwrap();
        assert_eq!(store.read_bucket_usage("b1", "w1").unwrap(), 0);
    }

    #[test]
    fn prune_keeps_unexpired_candidate_state() {
        let store = MemoryStore::new();
        let state = CandidateState {
            updated_at_ms: 1_000,
            ..Default::default()
        };
        store.set_candidate_state("c1", Some(state)).unwrap();
        store.prune_expired(1_000 + CANDIDATE_STATE_TTL_MS - 1).unwrap();
        assert!(store.get_candidate_state("c1").unwrap().is_some());
    }
}
