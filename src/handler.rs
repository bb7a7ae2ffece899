//! Request handler: the resolve → rank → attempt pipeline behind every
//! chat-completions/messages endpoint.
//!
//! The overall attempt loop (iterate ranked candidates, translate, call
//! upstream, classify the failure, retry-or-fallback) mirrors the teacher's
//! `router.rs` `escalate()` shape, generalized from tier-escalation to
//! candidate-ranking with origin retry and cross-format translation.

use std::sync::{atomic::AtomicU32, Arc};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use rand::Rng;
use serde_json::{json, Value};

use crate::amp_routing::{self, AmpContext};
use crate::config::{Format, RuntimeConfig};
use crate::error::{AppError, FailureCategory};
use crate::metrics::Metrics;
use crate::rate_limit;
use crate::resolver::{self, Candidate};
use crate::state::{CandidateState, StateStore};
use crate::translate;
use crate::upstream::UpstreamClient;

const DEBUG_ROUTING_ENV: &str = "LLM_ROUTER_DEBUG_ROUTING";
const ORIGIN_RETRY_ATTEMPTS_ENV: &str = "LLM_ROUTER_ORIGIN_RETRY_ATTEMPTS";
const DEFAULT_ORIGIN_RETRY_ATTEMPTS: u32 = 1;
const RETRY_BASE_MS: u64 = 200;
const RETRY_CAP_MS: u64 = 2_000;

pub struct AppState {
    /// Atomically-swappable live config, mirroring the teacher's
    /// `RouterState::config_lock`: the lock is held only for the duration of
    /// the `Arc::clone` in [`AppState::config`], so it never blocks request
    /// handling even while a reload is in flight.
    config_lock: std::sync::RwLock<Arc<RuntimeConfig>>,
    pub store: Arc<StateStore>,
    pub upstream: Arc<UpstreamClient>,
    pub started_at: std::time::Instant,
    pub metrics: Metrics,
    request_counter: AtomicU32,
}

impl AppState {
    pub fn new(config: RuntimeConfig, store: StateStore) -> Self {
        Self {
            config_lock: std::sync::RwLock::new(Arc::new(config)),
            store: Arc::new(store),
            upstream: Arc::new(UpstreamClient::new()),
            started_at: std::time::Instant::now(),
            metrics: Metrics::default(),
            request_counter: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> Arc<RuntimeConfig> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replace the live config. Called only from the hot-reload task.
    pub fn replace_config(&self, new: RuntimeConfig) {
        *self.config_lock.write().expect("config lock poisoned") = Arc::new(new);
    }

    pub fn next_request_id(&self) -> u32 {
        self.request_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

fn debug_routing_enabled() -> bool {
    std::env::var(DEBUG_ROUTING_ENV).map(|v| v == "1").unwrap_or(false)
}

fn origin_retry_attempts() -> u32 {
    std::env::var(ORIGIN_RETRY_ATTEMPTS_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_ORIGIN_RETRY_ATTEMPTS)
        .max(1)
}

/// `min(cap, base * 2^(attempt-1)) * (0.5..1.5)`.
fn compute_retry_delay_ms(attempt: u32) -> u64 {
    let exp = RETRY_BASE_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
    let capped = exp.min(RETRY_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    ((capped as f64) * jitter) as u64
}

struct AttemptRecord {
    candidate_key: String,
    status: Option<u16>,
    category: &'static str,
    attempt: u32,
}

struct Prelude {
    plan: resolver::RoutePlan,
    supported: Vec<Candidate>,
    ranking: crate::balancer::Ranking,
}

/// Shared resolve → filter → rank → commit prelude for both the buffered and
/// streaming paths. Returns `Err` only for the "no route at all" case; an
/// empty-but-resolved ranking is still returned as `Ok` so callers can report
/// per-candidate skip reasons.
async fn resolve_and_rank(
    state: &AppState,
    config: &RuntimeConfig,
    body: &Value,
    source_format: Format,
    amp_ctx: &AmpContext,
    now_ms: i64,
) -> Result<Prelude, Response> {
    let requested_model = body["model"].as_str().unwrap_or("smart").to_string();
    let rewritten_model = amp_routing::apply(config.amp_routing.as_ref(), amp_ctx, &requested_model);

    let plan = resolver::resolve(config, &rewritten_model, source_format);

    if plan.primary.is_none() {
        state.metrics.record_resolution(false);
        let status = if plan.error.as_deref().map(|e| e.contains("not configured") || e.contains("does not resolve")).unwrap_or(false) {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        return Err(error_response(status, plan.error.unwrap_or_else(|| "no route available".to_string())));
    }
    state.metrics.record_resolution(true);

    let all_candidates = plan.all_candidates();
    let supported: Vec<Candidate> = all_candidates
        .iter()
        .filter(|c| matches!(c.target_format, Format::OpenAI | Format::Claude))
        .cloned()
        .collect();

    if supported.is_empty() {
        return Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "no candidate supports a compatible wire format".to_string()));
    }

    let route_key = plan.route_key(source_format);
    let ranking = crate::balancer::rank(config, &state.store, &route_key, &supported, plan.route_strategy, now_ms)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    crate::balancer::commit(&state.store, &route_key, &ranking)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Prelude { plan, supported, ranking })
}

/// Run the full pipeline for a single non-streaming chat/messages request.
/// `source_format` is the format the client's body is shaped as; the
/// response is translated back to it regardless of which candidate's native
/// format served it.
pub async fn handle_completion(
    state: &AppState,
    body: Value,
    source_format: Format,
    amp_ctx: AmpContext,
) -> Result<Response, AppError> {
    let config = state.config();
    let now_ms = chrono::Utc::now().timestamp_millis();
    let _ = state.store.prune_expired(now_ms).await;

    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        return handle_streaming_completion(state, &config, body, source_format, amp_ctx, now_ms).await;
    }

    let Prelude { plan, supported, ranking } = match resolve_and_rank(state, &config, &body, source_format, &amp_ctx, now_ms).await {
        Ok(p) => p,
        Err(resp) => return Ok(resp),
    };

    let selected_index = ranking.selected_index;
    let mut attempts = Vec::new();
    let mut skipped = Vec::new();
    let mut last_error: Option<(StatusCode, String)> = None;

    for (idx, entry) in ranking.entries.iter().enumerate() {
        if !entry.eligible {
            skipped.push(format!("{}:{}", entry.candidate.request_model_id, entry.skip_reasons.join("+")));
            continue;
        }
        let is_originally_selected = Some(idx) == selected_index;
        let max_attempts = if is_originally_selected { origin_retry_attempts() } else { 1 };

        let mut attempt_num = 1;
        let mut quota_charged = false;
        loop {
            let outcome = attempt_candidate(state, &config, &entry.candidate, &body, source_format).await;
            match outcome {
                Ok((status, translated)) => {
                    state.metrics.record_attempt(&entry.candidate.request_model_id, FailureCategory::Ok.as_str());
                    attempts.push(AttemptRecord {
                        candidate_key: entry.candidate.request_model_id.clone(),
                        status: Some(status.as_u16()),
                        category: FailureCategory::Ok.as_str(),
                        attempt: attempt_num,
                    });
                    clear_candidate_state(&state.store, &entry.candidate, now_ms).await;
                    consume_candidate_quota(&config, &state.store, &entry.candidate, now_ms).await;
                    return Ok(build_response(&plan, &supported, idx, &attempts, &skipped, translated));
                }
                Err(AttemptError::Status { status, message, retry_after_ms, reached }) => {
                    let category = FailureCategory::from_status(status.as_u16());
                    state.metrics.record_attempt(&entry.candidate.request_model_id, category.as_str());
                    attempts.push(AttemptRecord {
                        candidate_key: entry.candidate.request_model_id.clone(),
                        status: Some(status.as_u16()),
                        category: category.as_str(),
                        attempt: attempt_num,
                    });
                    if reached && !quota_charged {
                        consume_candidate_quota(&config, &state.store, &entry.candidate, now_ms).await;
                        quota_charged = true;
                    }
                    if category.track_cooldown() {
                        record_candidate_failure(&state.store, &entry.candidate, category, status.as_u16(), retry_after_ms, now_ms).await;
                    }
                    if category.retry_origin() && is_originally_selected && attempt_num < max_attempts {
                        tokio::time::sleep(Duration::from_millis(compute_retry_delay_ms(attempt_num))).await;
                        attempt_num += 1;
                        continue;
                    }
                    if !category.allow_fallback() {
                        return Ok(error_response(status, message));
                    }
                    last_error = Some((status, message));
                    break;
                }
                Err(AttemptError::Network(message)) => {
                    let category = FailureCategory::network_error();
                    state.metrics.record_attempt(&entry.candidate.request_model_id, category.as_str());
                    attempts.push(AttemptRecord {
                        candidate_key: entry.candidate.request_model_id.clone(),
                        status: None,
                        category: category.as_str(),
                        attempt: attempt_num,
                    });
                    record_candidate_failure(&state.store, &entry.candidate, category, 0, None, now_ms).await;
                    last_error = Some((StatusCode::BAD_GATEWAY, message));
                    if is_originally_selected && attempt_num < max_attempts {
                        tokio::time::sleep(Duration::from_millis(compute_retry_delay_ms(attempt_num))).await;
                        attempt_num += 1;
                        continue;
                    }
                    break;
                }
            }
        }
    }

    let (status, message) = last_error.unwrap_or((StatusCode::SERVICE_UNAVAILABLE, "no eligible candidate".to_string()));
    Ok(error_response(status, message))
}

/// Streaming counterpart of the main loop above. Streaming requests don't
/// retry mid-flight (the response has already started flushing to the
/// client by the time a mid-stream failure would be detected), so this is a
/// single pass over eligible candidates: first one to establish a stream
/// wins, a connection-level failure falls through to the next candidate.
async fn handle_streaming_completion(
    state: &AppState,
    config: &RuntimeConfig,
    body: Value,
    source_format: Format,
    amp_ctx: AmpContext,
    now_ms: i64,
) -> Result<Response, AppError> {
    let Prelude { supported: _, ranking, .. } = match resolve_and_rank(state, config, &body, source_format, &amp_ctx, now_ms).await {
        Ok(p) => p,
        Err(resp) => return Ok(resp),
    };

    let mut last_error: Option<(StatusCode, String)> = None;
    for entry in ranking.entries.iter().filter(|e| e.eligible) {
        let Some(provider) = config.providers.iter().find(|p| p.id == entry.candidate.provider_id) else {
            continue;
        };
        let translated_body = match translate::translate_request(&body, source_format, entry.candidate.target_format, None) {
            Ok(mut b) => {
                b["model"] = Value::String(entry.candidate.model_id.clone());
                b
            }
            Err(e) => {
                last_error = Some((StatusCode::BAD_REQUEST, e.to_string()));
                continue;
            }
        };

        match stream_candidate(state, provider, &entry.candidate, translated_body, source_format).await {
            Ok(stream_body) => {
                state.metrics.record_attempt(&entry.candidate.request_model_id, FailureCategory::Ok.as_str());
                clear_candidate_state(&state.store, &entry.candidate, now_ms).await;
                consume_candidate_quota(config, &state.store, &entry.candidate, now_ms).await;
                let content_type = match source_format {
                    Format::OpenAI => "text/event-stream",
                    Format::Claude => "text/event-stream",
                };
                return Ok((StatusCode::OK, [(axum::http::header::CONTENT_TYPE, content_type)], stream_body).into_response());
            }
            Err(AttemptError::Status { status, message, retry_after_ms, reached }) => {
                let category = FailureCategory::from_status(status.as_u16());
                state.metrics.record_attempt(&entry.candidate.request_model_id, category.as_str());
                if reached {
                    consume_candidate_quota(config, &state.store, &entry.candidate, now_ms).await;
                }
                if category.track_cooldown() {
                    record_candidate_failure(&state.store, &entry.candidate, category, status.as_u16(), retry_after_ms, now_ms).await;
                }
                last_error = Some((status, message));
            }
            Err(AttemptError::Network(message)) => {
                state.metrics.record_attempt(&entry.candidate.request_model_id, FailureCategory::network_error().as_str());
                record_candidate_failure(&state.store, &entry.candidate, FailureCategory::network_error(), 0, None, now_ms).await;
                last_error = Some((StatusCode::BAD_GATEWAY, message));
            }
        }
    }

    let (status, message) = last_error.unwrap_or((StatusCode::SERVICE_UNAVAILABLE, "no eligible candidate".to_string()));
    Ok(error_response(status, message))
}

pub(crate) enum AttemptError {
    /// `reached` is true iff a response (any status) was actually received
    /// from the upstream — false for failures before the HTTP call went out
    /// (missing provider, request translation), which must not consume a
    /// rate-limit unit.
    Status { status: StatusCode, message: String, retry_after_ms: Option<i64>, reached: bool },
    Network(String),
}

async fn attempt_candidate(
    state: &AppState,
    config: &RuntimeConfig,
    candidate: &Candidate,
    body: &Value,
    source_format: Format,
) -> Result<(StatusCode, Value), AttemptError> {
    let Some(provider) = config.providers.iter().find(|p| p.id == candidate.provider_id) else {
        return Err(AttemptError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: format!("provider '{}' no longer configured", candidate.provider_id),
            retry_after_ms: None,
            reached: false,
        });
    };

    let mut translated_body = translate::translate_request(body, source_format, candidate.target_format, None).map_err(|e| AttemptError::Status {
        status: StatusCode::BAD_REQUEST,
        message: e.to_string(),
        retry_after_ms: None,
        reached: false,
    })?;
    translated_body["model"] = Value::String(candidate.model_id.clone());

    let (status, headers, response_body) = state
        .upstream
        .send(provider, candidate.target_format, translated_body)
        .await
        .map_err(|e| AttemptError::Network(e.to_string()))?;

    if !status.is_success() {
        let message = response_body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| response_body.to_string());
        return Err(AttemptError::Status { status, message, retry_after_ms: UpstreamClient::retry_after_ms(&headers), reached: true });
    }

    let translated_response = translate::translate_response(&response_body, candidate.target_format, source_format).map_err(|e| AttemptError::Status {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: e.to_string(),
        retry_after_ms: None,
        reached: true,
    })?;

    Ok((status, translated_response))
}

/// Charge the candidate's rate-limit buckets once it has actually reached the
/// upstream, regardless of the response status. Consumption happens per
/// candidate actually attempted, not once per request up front.
async fn consume_candidate_quota(config: &RuntimeConfig, store: &StateStore, candidate: &Candidate, now_ms: i64) {
    if let Some(provider) = config.providers.iter().find(|p| p.id == candidate.provider_id) {
        let buckets = rate_limit::applicable_buckets(provider, &candidate.model_id, now_ms);
        let _ = rate_limit::consume(store, &buckets).await;
    }
}

async fn clear_candidate_state(store: &StateStore, candidate: &Candidate, now_ms: i64) {
    let _ = store
        .set_candidate_state(
            &candidate.candidate_key(),
            Some(CandidateState { updated_at_ms: now_ms, ..Default::default() }),
        )
        .await;
}

/// Records a failed attempt and updates the candidate's cooldown. When the
/// upstream sent a `Retry-After` header, the cooldown is extended to honor it
/// (`cooldownUntil = max(backoff-derived, now + retryAfterMs)`) rather than
/// relying solely on the exponential-backoff estimate.
async fn record_candidate_failure(store: &StateStore, candidate: &Candidate, category: FailureCategory, status: u16, retry_after_ms: Option<i64>, now_ms: i64) {
    let key = candidate.candidate_key();
    let existing = store.get_candidate_state(&key).await.ok().flatten();
    let consecutive = existing.as_ref().map(|s| s.consecutive_retryable_failures).unwrap_or(0) + 1;
    let backoff_ms = (1_000u64 * (1u64 << consecutive.min(6))).min(60_000) as i64;
    let mut cooldown_until_ms = now_ms + backoff_ms;
    if let Some(retry_after_ms) = retry_after_ms {
        cooldown_until_ms = cooldown_until_ms.max(now_ms + retry_after_ms);
    }
    let next = CandidateState {
        cooldown_until_ms,
        open_until_ms: existing.as_ref().map(|s| s.open_until_ms).unwrap_or(0),
        consecutive_retryable_failures: consecutive,
        last_failure_at_ms: Some(now_ms),
        last_failure_status: Some(status),
        last_failure_category: Some(category.as_str().to_string()),
        updated_at_ms: now_ms,
    };
    let _ = store.set_candidate_state(&key, Some(next)).await;
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, axum::Json(json!({ "type": "error", "error": { "type": status.canonical_reason().unwrap_or("error"), "message": message } }))).into_response()
}

fn build_response(
    plan: &resolver::RoutePlan,
    supported: &[Candidate],
    selected_idx: usize,
    attempts: &[AttemptRecord],
    skipped: &[String],
    body: Value,
) -> Response {
    let mut response = axum::Json(body).into_response();
    if debug_routing_enabled() {
        let headers = response.headers_mut();
        insert_header(headers, "x-llm-router-requested-model", &plan.requested_model);
        if let Some(resolved) = &plan.resolved_model {
            insert_header(headers, "x-llm-router-resolved-model", resolved);
        }
        insert_header(headers, "x-llm-router-route-type", format!("{:?}", plan.route_type).to_lowercase());
        insert_header(headers, "x-llm-router-route-ref", &plan.route_ref);
        insert_header(headers, "x-llm-router-route-strategy", format!("{:?}", plan.route_strategy).to_lowercase());
        insert_header(headers, "x-llm-router-selected-candidate", &supported[selected_idx].request_model_id);
        insert_header(headers, "x-llm-router-skipped-candidates", skipped.join(","));
        let attempts_str = attempts
            .iter()
            .map(|a| format!("{}:{}/{}#{}", a.candidate_key, a.status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()), a.category, a.attempt))
            .collect::<Vec<_>>()
            .join(",");
        insert_header(headers, "x-llm-router-attempts", attempts_str);
    }
    response
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: impl AsRef<str>) {
    if let Ok(v) = axum::http::HeaderValue::from_str(value.as_ref()) {
        headers.insert(name, v);
    }
}

/// Build a streaming response body, translating chunks on the fly from the
/// selected candidate's format back to `source_format`. Used by the public
/// streaming path once a candidate has already been chosen by the
/// non-streaming selection pass above (streaming requests don't retry
/// mid-flight, per spec §4.4 step 7's "tee and translate" note).
pub async fn stream_candidate(
    state: &AppState,
    provider: &crate::config::ProviderConfig,
    candidate: &Candidate,
    body: Value,
    source_format: Format,
) -> Result<Body, AttemptError> {
    let (status, headers, raw_stream) = state
        .upstream
        .send_stream(provider, candidate.target_format, body)
        .await
        .map_err(|e| AttemptError::Network(e.to_string()))?;

    if !status.is_success() {
        return Err(AttemptError::Status {
            status,
            message: format!("upstream streaming request returned HTTP {status}"),
            retry_after_ms: UpstreamClient::retry_after_ms(&headers),
            reached: true,
        });
    }

    let candidate_key = candidate.request_model_id.clone();
    let translated = translate::translate_stream(Box::pin(raw_stream), candidate.target_format, source_format);
    let body_stream = translated.map(move |item| match item {
        Ok(chunk) => {
            if chunk.done {
                tracing::debug!(candidate = %candidate_key, "stream completed");
            }
            Ok::<_, std::io::Error>(chunk.bytes)
        }
        Err(e) => Err(std::io::Error::other(e.to_string())),
    });
    Ok(Body::from_stream(body_stream))
}

use futures_util::StreamExt as _;
