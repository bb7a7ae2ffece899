//! In-process counters feeding the `/metrics` endpoint.
//!
//! Generalized from the teacher's ring-buffer-derived `lmg_*` gauges in
//! `api/metrics.rs` into lifetime counters (this router tracks candidate
//! attempts and bucket evaluations, not a fixed-size traffic window), keyed
//! by the same `(route, candidate, outcome)`-shaped labels.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub route_resolutions_total: AtomicU64,
    pub route_resolution_errors_total: AtomicU64,
    candidate_attempts: DashMap<(String, &'static str), u64>,
    bucket_evaluations: DashMap<(String, bool), u64>,
}

impl Metrics {
    pub fn record_resolution(&self, ok: bool) {
        self.route_resolutions_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.route_resolution_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_attempt(&self, candidate_key: &str, category: &'static str) {
        *self.candidate_attempts.entry((candidate_key.to_string(), category)).or_insert(0) += 1;
    }

    pub fn record_bucket_evaluation(&self, bucket_key: &str, eligible: bool) {
        *self.bucket_evaluations.entry((bucket_key.to_string(), eligible)).or_insert(0) += 1;
    }

    /// Render Prometheus text-exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);

        out.push_str("# HELP llm_router_route_resolutions_total Total route resolution attempts.\n");
        out.push_str("# TYPE llm_router_route_resolutions_total counter\n");
        out.push_str(&format!(
            "llm_router_route_resolutions_total {}\n\n",
            self.route_resolutions_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP llm_router_route_resolution_errors_total Route resolutions that failed to produce a primary candidate.\n");
        out.push_str("# TYPE llm_router_route_resolution_errors_total counter\n");
        out.push_str(&format!(
            "llm_router_route_resolution_errors_total {}\n\n",
            self.route_resolution_errors_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP llm_router_candidate_attempts_total Per-candidate attempt outcomes.\n");
        out.push_str("# TYPE llm_router_candidate_attempts_total counter\n");
        let mut rows: Vec<_> = self.candidate_attempts.iter().map(|e| (e.key().clone(), *e.value())).collect();
        rows.sort();
        for ((candidate, category), count) in rows {
            out.push_str(&format!(
                "llm_router_candidate_attempts_total{{candidate=\"{candidate}\",category=\"{category}\"}} {count}\n"
            ));
        }
        out.push('\n');

        out.push_str("# HELP llm_router_bucket_evaluations_total Rate-limit bucket eligibility evaluations.\n");
        out.push_str("# TYPE llm_router_bucket_evaluations_total counter\n");
        let mut bucket_rows: Vec<_> = self.bucket_evaluations.iter().map(|e| (e.key().clone(), *e.value())).collect();
        bucket_rows.sort_by(|a, b| a.0.cmp(&b.0));
        for ((bucket, eligible), count) in bucket_rows {
            out.push_str(&format!(
                "llm_router_bucket_evaluations_total{{bucket=\"{bucket}\",eligible=\"{eligible}\"}} {count}\n"
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_after_recording() {
        let m = Metrics::default();
        m.record_resolution(true);
        m.record_resolution(false);
        m.record_attempt("openai/gpt-4o-mini", "ok");
        m.record_bucket_evaluation("bucket:daily", true);

        let out = m.render();
        assert!(out.contains("llm_router_route_resolutions_total 2"));
        assert!(out.contains("llm_router_route_resolution_errors_total 1"));
        assert!(out.contains("candidate=\"openai/gpt-4o-mini\",category=\"ok\"} 1"));
        assert!(out.contains("bucket=\"bucket:daily\",eligible=\"true\"} 1"));
    }
}
