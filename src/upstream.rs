//! Upstream HTTP client: a single data-driven client keyed by provider
//! config, generalized from the teacher's `backends::BackendClient` enum
//! dispatch over per-provider adapters (`backends/openai.rs`,
//! `backends/anthropic.rs`) into one client whose behavior is parameterized
//! by [`ProviderConfig`] and [`Format`] rather than fixed at construction.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header, Client};
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::config::{AuthType, Format, ProviderConfig};

/// Which OpenAI endpoint family to target. Claude has only one (`messages`),
/// so this only varies the suffix when `format` is [`Format::OpenAI`].
///
/// `Responses`/`Completions` exist for `endpoint()`'s URL composition but are
/// never selected today: nothing in the request model picks an operation
/// other than the default per-request yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(dead_code)]
pub enum Operation {
    #[default]
    ChatCompletions,
    Responses,
    Completions,
}

/// Buffered-request timeout. Streaming requests use no request-level
/// timeout, matching the teacher's split client/stream_client posture —
/// the response body arrives incrementally and a fixed deadline would cut
/// off long-running generations.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct UpstreamClient {
    client: Client,
    stream_client: Client,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build().expect("failed to build reqwest client"),
            stream_client: Client::builder().build().expect("failed to build streaming reqwest client"),
        }
    }

    /// Compose the upstream URL for `(provider, format, operation)`: appends
    /// `/v1/<suffix>` if not already present, or just `/<suffix>` when the
    /// base already ends in `/v1` — idempotent against a `baseUrl` that
    /// already carries the full path.
    fn endpoint(provider: &ProviderConfig, format: Format, operation: Operation) -> String {
        let base = provider.base_url_for(format).trim_end_matches('/');
        let suffix = match (format, operation) {
            (Format::Claude, _) => "messages",
            (Format::OpenAI, Operation::ChatCompletions) => "chat/completions",
            (Format::OpenAI, Operation::Responses) => "responses",
            (Format::OpenAI, Operation::Completions) => "completions",
        };
        if base.ends_with(&format!("/v1/{suffix}")) {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{base}/{suffix}")
        } else {
            format!("{base}/v1/{suffix}")
        }
    }

    fn apply_auth(
        builder: reqwest::RequestBuilder,
        provider: &ProviderConfig,
        format: Format,
    ) -> reqwest::RequestBuilder {
        let auth = provider.auth_for(format);
        let mut builder = builder;
        match auth.kind {
            AuthType::None => {}
            AuthType::Bearer => {
                if let Some(key) = provider.api_key() {
                    let prefix = auth.prefix.as_deref().unwrap_or("Bearer");
                    builder = builder.header(header::AUTHORIZATION, format!("{prefix} {key}"));
                }
            }
            AuthType::Header => {
                if let Some(key) = provider.api_key() {
                    let name = auth.header_name.as_deref().unwrap_or("x-api-key");
                    builder = builder.header(name, key);
                }
            }
        }
        if format == Format::Claude {
            let version = provider.anthropic_version.as_deref().unwrap_or(crate::translate::claude::ANTHROPIC_VERSION);
            builder = builder.header("anthropic-version", version);
            if let Some(beta) = &provider.anthropic_beta {
                builder = builder.header("anthropic-beta", beta.clone());
            }
        }
        for (name, value) in &provider.headers {
            builder = builder.header(name, value);
        }
        builder
    }

    /// Send a buffered (non-streaming) request and return the parsed JSON
    /// response body, in whatever format the upstream actually speaks
    /// (translation back to the client's format happens one layer up), along
    /// with the response headers so the caller can read `retry-after`.
    pub async fn send(&self, provider: &ProviderConfig, format: Format, body: Value) -> anyhow::Result<(reqwest::StatusCode, HeaderMap, Value)> {
        let url = Self::endpoint(provider, format, Operation::ChatCompletions);
        let builder = Self::apply_auth(self.client.post(&url), provider, format);
        let response = builder.json(&body).send().await.with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.context("reading upstream response body")?;
        let parsed = serde_json::from_str(&text)
            .with_context(|| format!("parsing upstream response as JSON (status {status}): {text}"))?;
        Ok((status, headers, parsed))
    }

    /// Send a streaming request and return the raw byte stream plus the
    /// response status and headers (checked before the body is consumed,
    /// since a non-2xx streaming response is usually a short error body, not
    /// SSE).
    pub async fn send_stream(
        &self,
        provider: &ProviderConfig,
        format: Format,
        mut body: Value,
    ) -> anyhow::Result<(reqwest::StatusCode, HeaderMap, impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>>)> {
        body["stream"] = Value::Bool(true);
        let url = Self::endpoint(provider, format, Operation::ChatCompletions);
        let builder = Self::apply_auth(self.stream_client.post(&url), provider, format);
        let response = builder.json(&body).send().await.with_context(|| format!("POST {url} (streaming)"))?;
        let status = response.status();
        let headers = response.headers().clone();
        Ok((status, headers, response.bytes_stream()))
    }

    /// Parse a `retry-after` response header as milliseconds: either an
    /// integer seconds delta (per RFC 9110) or an HTTP-date, the latter
    /// converted to a delta against now.
    pub fn retry_after_ms(headers: &HeaderMap) -> Option<i64> {
        let raw = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
        if let Ok(secs) = raw.trim().parse::<i64>() {
            return Some(secs.max(0) * 1_000);
        }
        let at = chrono::DateTime::parse_from_rfc2822(raw.trim()).ok()?;
        let delta = at.timestamp_millis() - chrono::Utc::now().timestamp_millis();
        Some(delta.max(0))
    }

    /// Probe a provider for liveness with a minimal GET, matching the
    /// teacher's `GET /v1/models` health-check shape. Claude has no
    /// equivalent unauthenticated listing endpoint, so the models path is
    /// used there too; a 401/403 is treated as "reachable" since it proves
    /// the upstream answered at all.
    pub async fn health_check(&self, provider: &ProviderConfig, format: Format) -> anyhow::Result<()> {
        let base = provider.base_url_for(format).trim_end_matches('/');
        let url = format!("{base}/v1/models");
        let builder = Self::apply_auth(self.client.get(&url), provider, format);
        let response = builder.send().await.with_context(|| format!("GET {url}"))?;
        let status = response.status();
        anyhow::ensure!(
            status.is_success() || status.as_u16() == 401 || status.as_u16() == 403,
            "health check returned HTTP {status}"
        );
        Ok(())
    }
}
