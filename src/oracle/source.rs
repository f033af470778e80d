//! Oracle source interface and per-source health tracking.
//!
//! A source wraps exactly one upstream feed and returns raw single-source
//! quotes; consensus is the risk manager's job. Sources are stateless
//! beyond their network client. Rolling health stats live in
//! `SourceState`, owned by the manager.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::SourceConfig;
use crate::models::PriceQuote;

/// Consecutive failures before a source is considered degraded.
const DEGRADED_AFTER_FAILURES: u32 = 3;
/// Consecutive failures before a source is taken out of rotation.
const FAILED_AFTER_FAILURES: u32 = 10;
/// Consecutive successes before a recovering source is healthy again.
const HEALTHY_AFTER_SUCCESSES: u32 = 3;

const LATENCY_EMA_ALPHA: f64 = 0.1;

/// One external price feed.
#[async_trait]
pub trait OracleSource: Send + Sync {
    fn id(&self) -> &str;

    /// Fetch a quote for `pair`, optionally pinned to a historical
    /// timestamp. The absolute `deadline` bounds the call: implementations
    /// must abandon in-flight I/O once it elapses and return an error.
    async fn fetch(&self, pair: &str, at: Option<i64>, deadline: Instant) -> Result<PriceQuote>;
}

/// Broad failure class, used to drive status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorClass {
    Timeout,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Healthy,
    Degraded,
    Failed,
    Unreachable,
}

/// Mutable per-source record owned by the risk manager.
#[derive(Debug, Clone, Serialize)]
pub struct SourceState {
    pub source_id: String,
    pub weight: f64,
    pub declared_reliability: f64,
    #[serde(skip)]
    pub per_source_timeout: Duration,
    pub status: SourceStatus,
    /// Unix seconds of the most recent successful fetch.
    pub last_success_at: Option<i64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub ema_latency_us: f64,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl SourceState {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            source_id: config.id.clone(),
            weight: config.weight,
            declared_reliability: config.declared_reliability,
            per_source_timeout: config.per_source_timeout(),
            status: SourceStatus::Healthy,
            last_success_at: None,
            success_count: 0,
            failure_count: 0,
            ema_latency_us: 0.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    /// Whether the source may participate in a fan-out.
    pub fn selectable(&self) -> bool {
        matches!(self.status, SourceStatus::Healthy | SourceStatus::Degraded)
    }

    pub fn record_success(&mut self, latency_us: u64, now_unix: i64) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        self.last_success_at = Some(now_unix);

        self.ema_latency_us = if self.success_count == 1 {
            latency_us as f64
        } else {
            LATENCY_EMA_ALPHA * latency_us as f64
                + (1.0 - LATENCY_EMA_ALPHA) * self.ema_latency_us
        };

        self.status = match self.status {
            SourceStatus::Healthy => SourceStatus::Healthy,
            // A recovering source earns Healthy back gradually.
            _ if self.consecutive_successes >= HEALTHY_AFTER_SUCCESSES => SourceStatus::Healthy,
            _ => SourceStatus::Degraded,
        };
    }

    pub fn record_failure(&mut self, class: FetchErrorClass) {
        self.failure_count += 1;
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;

        if self.consecutive_failures >= FAILED_AFTER_FAILURES {
            self.status = match class {
                FetchErrorClass::Timeout => SourceStatus::Unreachable,
                FetchErrorClass::Upstream => SourceStatus::Failed,
            };
        } else if self.consecutive_failures >= DEGRADED_AFTER_FAILURES {
            self.status = SourceStatus::Degraded;
        }
    }
}

/// Upstream JSON response shape for the bundled HTTP adapter.
#[derive(Debug, Deserialize)]
struct QuoteResponse {
    price: f64,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Generic HTTP JSON price feed adapter.
///
/// Wraps any upstream that answers `GET {endpoint}?pair=...` with
/// `{"price": ..., "confidence": ..., "timestamp": ...}`. Feed-specific
/// adapters live outside the core; this one exists so a deployment can be
/// configured end to end without writing code.
pub struct HttpJsonSource {
    id: String,
    endpoint: String,
    fallback_confidence: f64,
    client: reqwest::Client,
}

impl HttpJsonSource {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, fallback_confidence: f64) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build HTTP client");
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            fallback_confidence: fallback_confidence.clamp(0.0, 1.0),
            client,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .with_context(|| format!("source {} has no endpoint configured", config.id))?;
        Ok(Self::new(&config.id, endpoint, config.declared_reliability))
    }
}

#[async_trait]
impl OracleSource for HttpJsonSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, pair: &str, at: Option<i64>, deadline: Instant) -> Result<PriceQuote> {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            bail!("{}: deadline already elapsed", self.id);
        };

        let mut request = self.client.get(&self.endpoint).query(&[("pair", pair)]);
        if let Some(at) = at {
            request = request.query(&[("at", at.to_string())]);
        }

        // timeout() drops the request future at the deadline, which aborts
        // the underlying connection.
        let response = tokio::time::timeout(remaining, request.send())
            .await
            .map_err(|_| anyhow::anyhow!("{}: fetch timed out", self.id))?
            .with_context(|| format!("{}: request failed", self.id))?;

        if !response.status().is_success() {
            bail!("{}: upstream returned {}", self.id, response.status());
        }

        let body: QuoteResponse = response
            .json()
            .await
            .with_context(|| format!("{}: malformed quote body", self.id))?;

        if !body.price.is_finite() || body.price <= 0.0 {
            bail!("{}: non-positive price {}", self.id, body.price);
        }

        let received_at = Utc::now().timestamp();
        Ok(PriceQuote {
            source_id: self.id.clone(),
            pair: pair.to_string(),
            price: body.price,
            confidence: body
                .confidence
                .unwrap_or(self.fallback_confidence)
                .clamp(0.0, 1.0),
            observed_at: body.timestamp.unwrap_or(received_at),
            received_at,
        })
    }
}
