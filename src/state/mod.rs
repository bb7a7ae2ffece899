//! State store abstraction: route cursors, per-candidate health/cooldown
//! state, and rate-limit bucket usage counters.
//!
//! Two backends implement the capability set described in spec §4.5:
//! [`memory::MemoryStore`] (plain concurrent maps, lost on restart) and
//! [`file::FileStore`] (single JSON file, atomically rewritten). Neither
//! coordinates across processes — state is node-local by design.
//!
//! Dispatch between backends is a closed enum, mirroring the teacher's
//! `BackendClient` enum-dispatch pattern in `backends/mod.rs`, rather than a
//! `dyn Trait` object — the set of backends is small and known at compile
//! time.

pub mod file;
pub mod memory;

use serde::{Deserialize, Serialize};

/// Per-candidate health/cooldown bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidateState {
    pub cooldown_until_ms: i64,
    pub open_until_ms: i64,
    pub consecutive_retryable_failures: u32,
    pub last_failure_at_ms: Option<i64>,
    pub last_failure_status: Option<u16>,
    pub last_failure_category: Option<String>,
    pub updated_at_ms: i64,
}

impl CandidateState {
    pub fn blocked(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms.max(self.open_until_ms) > now_ms
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BucketUsage {
    pub count: u64,
    pub expires_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PruneResult {
    pub pruned_buckets: usize,
    pub pruned_candidate_states: usize,
}

/// Candidate-state rows expire this long after their last relevant
/// timestamp, per spec §3.
pub const CANDIDATE_STATE_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// The state store, dispatching to one of the two supported backends.
pub enum StateStore {
    Memory(memory::MemoryStore),
    File(file::FileStore),
}

impl StateStore {
    pub async fn get_route_cursor(&self, route_key: &str) -> anyhow::Result<u64> {
        match self {
            Self::Memory(s) => s.get_route_cursor(route_key),
            Self::File(s) => s.get_route_cursor(route_key).await,
        }
    }

    pub async fn set_route_cursor(&self, route_key: &str, value: u64) -> anyhow::Result<()> {
        match self {
            Self::Memory(s) => s.set_route_cursor(route_key, value),
            Self::File(s) => s.set_route_cursor(route_key, value).await,
        }
    }

    pub async fn get_candidate_state(&self, candidate_key: &str) -> anyhow::Result<Option<CandidateState>> {
        match self {
            Self::Memory(s) => s.get_candidate_state(candidate_key),
            Self::File(s) => s.get_candidate_state(candidate_key).await,
        }
    }

    pub async fn set_candidate_state(
        &self,
        candidate_key: &str,
        state: Option<CandidateState>,
    ) -> anyhow::Result<()> {
        match self {
            Self::Memory(s) => s.set_candidate_state(candidate_key, state),
            Self::File(s) => s.set_candidate_state(candidate_key, state).await,
        }
    }

    pub async fn read_bucket_usage(&self, bucket_key: &str, window_key: &str) -> anyhow::Result<u64> {
        match self {
            Self::Memory(s) => s.read_bucket_usage(bucket_key, window_key),
            Self::File(s) => s.read_bucket_usage(bucket_key, window_key).await,
        }
    }

    pub async fn increment_bucket_usage(
        &self,
        bucket_key: &str,
        window_key: &str,
        amount: u64,
        expires_at_ms: i64,
    ) -> anyhow::Result<u64> {
        match self {
            Self::Memory(s) => s.increment_bucket_usage(bucket_key, window_key, amount, expires_at_ms),
            Self::File(s) => s.increment_bucket_usage(bucket_key, window_key, amount, expires_at_ms).await,
        }
    }

    pub async fn prune_expired(&self, now_ms: i64) -> anyhow::Result<PruneResult> {
        match self {
            Self::Memory(s) => s.prune_expired(now_ms),
            Self::File(s) => s.prune_expired(now_ms).await,
        }
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::File(s) => s.close().await,
        }
    }
}
