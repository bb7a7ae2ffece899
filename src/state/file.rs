//! File-backed state store: a single JSON file, atomically rewritten on
//! every mutation.
//!
//! Grounded on the teacher's `main.rs` config hot-reload pattern (poll, log,
//! keep the previous good state on a parse failure) for the "external file is
//! the source of truth but don't ever block the hot path on a bad write"
//! posture, generalized here to the write side: every mutation serializes
//! through a single-writer queue and persists via write-tmp-then-rename so a
//! crash mid-write never corrupts the live file.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{BucketUsage, CandidateState, PruneResult, CANDIDATE_STATE_TTL_MS};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default)]
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    route_cursors: HashMap<String, u64>,
    #[serde(default)]
    candidate_states: HashMap<String, CandidateState>,
    #[serde(default)]
    bucket_usage: HashMap<String, HashMap<String, BucketUsage>>,
}

pub struct FileStore {
    path: PathBuf,
    inner: Mutex<PersistedState>,
    write_counter: AtomicU32,
}

impl FileStore {
    /// Open (or create) the state file at `path`. A corrupt file is renamed
    /// aside rather than overwritten, and loading continues with empty
    /// state, per spec §4.5.
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let quarantine = append_suffix(&path, &format!(".corrupt-{}", chrono::Utc::now().timestamp()));
                    tracing::warn!(error = %e, path = %path.display(), quarantine = %quarantine.display(), "state file is corrupt; quarantining and starting fresh");
                    let _ = tokio::fs::rename(&path, &quarantine).await;
                    PersistedState {
                        version: 1,
                        ..Default::default()
                    }
                }
            },
            Err(_) => PersistedState {
                version: 1,
                ..Default::default()
            },
        };

        Ok(Self {
            path,
            inner: Mutex::new(state),
            write_counter: AtomicU32::new(0),
        })
    }

    /// Re-read the on-disk file, discarding any in-memory state.
    pub async fn reload_from_disk(&self) -> anyhow::Result<()> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let parsed: PersistedState = serde_json::from_str(&raw)?;
        *self.inner.lock().await = parsed;
        Ok(())
    }

    async fn persist(&self, state: &PersistedState) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let n = self.write_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = append_suffix(
            &self.path,
            &format!(
                ".tmp-{}-{}-{n}",
                std::process::id(),
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
            ),
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::write(&tmp_path, &json).await?;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        #[cfg(not(unix))]
        {
            tokio::fs::write(&tmp_path, &json).await?;
        }

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn get_route_cursor(&self, route_key: &str) -> anyhow::Result<u64> {
        Ok(self.inner.lock().await.route_cursors.get(route_key).copied().unwrap_or(0))
    }

    pub async fn set_route_cursor(&self, route_key: &str, value: u64) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().await;
        guard.route_cursors.insert(route_key.to_string(), value);
        guard.updated_at = Some(chrono::Utc::now());
        self.persist(&guard).await
    }

    pub async fn get_candidate_state(&self, candidate_key: &str) -> anyhow::Result<Option<CandidateState>> {
        Ok(self.inner.lock().await.candidate_states.get(candidate_key).cloned())
    }

    pub async fn set_candidate_state(
        &self,
        candidate_key: &str,
        state: Option<CandidateState>,
    ) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().await;
        match state {
            Some(s) => {
                guard.candidate_states.insert(candidate_key.to_string(), s);
            }
            None => {
                guard.candidate_states.remove(candidate_key);
            }
        }
        guard.updated_at = Some(chrono::Utc::now());
        self.persist(&guard).await
    }

    pub async fn read_bucket_usage(&self, bucket_key: &str, window_key: &str) -> anyhow::Result<u64> {
        Ok(self
            .inner
            .lock()
            .await
            .bucket_usage
            .get(bucket_key)
            .and_then(|w| w.get(window_key))
            .map(|u| u.count)
            .unwrap_or(0))
    }

    pub async fn increment_bucket_usage(
        &self,
        bucket_key: &str,
        window_key: &str,
        amount: u64,
        expires_at_ms: i64,
    ) -> anyhow::Result<u64> {
        let mut guard = self.inner.lock().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let windows = guard.bucket_usage.entry(bucket_key.to_string()).or_default();
        let entry = windows.entry(window_key.to_string()).or_insert_with(|| BucketUsage {
            count: 0,
            expires_at_ms,
            updated_at_ms: now_ms,
        });
        entry.count += amount;
        entry.expires_at_ms = expires_at_ms;
        entry.updated_at_ms = now_ms;
        let new_count = entry.count;
        guard.updated_at = Some(chrono::Utc::now());
        self.persist(&guard).await?;
        Ok(new_count)
    }

    pub async fn prune_expired(&self, now_ms: i64) -> anyhow::Result<PruneResult> {
        let mut guard = self.inner.lock().await;
        let mut pruned_buckets = 0;
        for windows in guard.bucket_usage.values_mut() {
            let before = windows.len();
            windows.retain(|_, usage| usage.expires_at_ms > now_ms);
            pruned_buckets += before - windows.len();
        }

        let before = guard.candidate_states.len();
        guard
            .candidate_states
            .retain(|_, s| candidate_expiry(s) > now_ms);
        let pruned_candidate_states = before - guard.candidate_states.len();

        if pruned_buckets > 0 || pruned_candidate_states > 0 {
            guard.updated_at = Some(chrono::Utc::now());
            self.persist(&guard).await?;
        }

        Ok(PruneResult {
            pruned_buckets,
            pruned_candidate_states,
        })
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        let guard = self.inner.lock().await;
        self.persist(&guard).await
    }
}

fn candidate_expiry(state: &CandidateState) -> i64 {
    let from_blocks = state.cooldown_until_ms.max(state.open_until_ms) + CANDIDATE_STATE_TTL_MS;
    let from_update = state.updated_at_ms + CANDIDATE_STATE_TTL_MS;
    from_blocks.max(from_update)
}

fn append_suffix(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_route_cursor_through_reopen() {
        let dir = tempdir();
        let path = dir.join("state.json");
        {
            let store = FileStore::open(path.clone()).await.unwrap();
            store.set_route_cursor("r1", 5).await.unwrap();
        }
        let reopened = FileStore::open(path).await.unwrap();
        assert_eq!(reopened.get_route_cursor("r1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn round_trips_bucket_usage_through_reopen() {
        let dir = tempdir();
        let path = dir.join("state.json");
        {
            let store = FileStore::open(path.clone()).await.unwrap();
            store.increment_bucket_usage("b1", "day:1:2026-01-01", 3, 10_000).await.unwrap();
        }
        let reopened = FileStore::open(path).await.unwrap();
        assert_eq!(reopened.read_bucket_usage("b1", "day:1:2026-01-01").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_and_load_continues() {
        let dir = tempdir();
        let path = dir.join("state.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let store = FileStore::open(path.clone()).await.unwrap();
        assert_eq!(store.get_route_cursor("anything").await.unwrap(), 0);

        let mut quarantined = false;
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains("corrupt") {
                quarantined = true;
            }
        }
        assert!(quarantined, "corrupt file should be renamed aside");
    }

    #[tokio::test]
    async fn missing_file_starts_with_empty_state() {
        let dir = tempdir();
        let path = dir.join("does-not-exist.json");
        let store = FileStore::open(path).await.unwrap();
        assert_eq!(store.get_route_cursor("x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn no_leftover_tmp_files_after_writes() {
        let dir = tempdir();
        let path = dir.join("state.json");
        let store = FileStore::open(path).await.unwrap();
        for i in 0..5 {
            store.set_route_cursor(&format!("r{i}"), i as u64).await.unwrap();
        }
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().contains("tmp-"));
        }
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "llm-router-test-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
