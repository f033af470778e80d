//! Multi-source oracle risk management.
//!
//! Fans a price lookup out to every selectable source in parallel, accepts
//! whatever arrives within the budget, and condenses the quotes into a
//! single verdict: weighted-median consensus, worst-case deviation, and a
//! manipulation classification. Never raises: an empty or late fan-out
//! yields an `insufficient_sources` verdict and the engine decides policy.

pub mod source;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::VerificationCache;
use crate::config::{DeviationThresholds, EngineConfig};
use crate::fingerprint::quote_fingerprint;
use crate::models::{OracleClassification, OracleVerdict, PriceQuote};
use source::{FetchErrorClass, OracleSource, SourceState};

/// Relative std/mean bound under which a mid-band spread still counts as
/// normal market noise.
const VOLATILITY_STD_BOUND: f64 = 0.02;

/// Quorum and deviation analysis across configured oracle sources.
pub struct OracleRiskManager {
    sources: Vec<Arc<dyn OracleSource>>,
    states: HashMap<String, Mutex<SourceState>>,
    quote_cache: Arc<VerificationCache<PriceQuote>>,
    min_sources: usize,
    thresholds: DeviationThresholds,
    staleness_limit_secs: i64,
    quote_ttl: Duration,
    quote_window_secs: u64,
}

impl OracleRiskManager {
    /// Build from configuration plus the injected source adapters.
    ///
    /// Every adapter must have a matching `sources[]` entry (weights and
    /// timeouts come from there); configured entries without an adapter are
    /// logged and skipped.
    pub fn new(config: &EngineConfig, sources: Vec<Arc<dyn OracleSource>>) -> Result<Self> {
        let mut states = HashMap::new();
        for source_config in &config.sources {
            states.insert(
                source_config.id.clone(),
                Mutex::new(SourceState::from_config(source_config)),
            );
        }

        for source in &sources {
            if !states.contains_key(source.id()) {
                bail!("oracle source {} has no configuration entry", source.id());
            }
        }
        let adapter_ids: HashSet<&str> = sources.iter().map(|s| s.id()).collect();
        for id in states.keys() {
            if !adapter_ids.contains(id.as_str()) {
                warn!(source = %id, "configured oracle source has no adapter; skipping");
            }
        }

        Ok(Self {
            sources,
            states,
            quote_cache: Arc::new(VerificationCache::new(config.cache_capacity)),
            min_sources: config.min_sources,
            thresholds: config.thresholds.clone(),
            staleness_limit_secs: config.staleness_limit_secs,
            quote_ttl: config.quote_ttl(),
            quote_window_secs: config.quote_ttl_ms / 1_000,
        })
    }

    pub fn min_sources(&self) -> usize {
        self.min_sources
    }

    /// Snapshot of per-source health, sorted by source id.
    pub fn source_states(&self) -> Vec<SourceState> {
        let mut states: Vec<SourceState> =
            self.states.values().map(|s| s.lock().clone()).collect();
        states.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        states
    }

    /// Run the bounded parallel fan-out and produce a verdict.
    pub async fn verify(
        &self,
        pair: &str,
        at: Option<i64>,
        allow_list: Option<&[String]>,
        budget: Duration,
    ) -> OracleVerdict {
        let start = Instant::now();
        let joint_deadline = start + budget;

        let selected: Vec<Arc<dyn OracleSource>> = self
            .sources
            .iter()
            .filter(|s| allow_list.map_or(true, |list| list.iter().any(|id| id == s.id())))
            .filter(|s| {
                self.states
                    .get(s.id())
                    .map_or(false, |state| state.lock().selectable())
            })
            .cloned()
            .collect();

        if selected.is_empty() {
            debug!(pair = %pair, "no selectable oracle sources");
            return OracleVerdict::insufficient(0, self.min_sources, Vec::new());
        }

        let mut fan_out = FuturesUnordered::new();
        for oracle_source in &selected {
            let source = oracle_source.clone();
            let id = source.id().to_string();
            let per_source_timeout = self.states[&id].lock().per_source_timeout;
            let source_deadline = (start + per_source_timeout).min(joint_deadline);
            let cache = self.quote_cache.clone();
            let key = quote_fingerprint(&id, pair, at, self.quote_window_secs.max(1));
            let pair = pair.to_string();
            let staleness_limit = self.staleness_limit_secs;
            let quote_ttl = self.quote_ttl;

            fan_out.push(async move {
                let fetch_start = Instant::now();
                let (result, _) = cache
                    .get_or_compute(&key, quote_ttl, move || async move {
                        let quote = source.fetch(&pair, at, source_deadline).await?;
                        validate_quote(&quote, staleness_limit)?;
                        Ok(quote)
                    })
                    .await;
                (id, result, fetch_start.elapsed())
            });
        }

        let mut quotes: Vec<PriceQuote> = Vec::with_capacity(selected.len());
        let mut completed: HashSet<String> = HashSet::new();
        let mut budget_exhausted = false;

        loop {
            let next = tokio::time::timeout_at(joint_deadline.into(), fan_out.next());
            match next.await {
                Ok(Some((id, result, latency))) => {
                    completed.insert(id.clone());
                    match result {
                        Ok(quote) => {
                            self.record_success(&id, latency);
                            quotes.push(quote);
                        }
                        Err(err) => {
                            debug!(source = %id, error = %err, "oracle fetch failed");
                            self.record_failure(&id, latency);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    // Budget elapsed; dropping the stream cancels the
                    // remaining per-source fetches.
                    budget_exhausted = true;
                    break;
                }
            }
        }
        drop(fan_out);

        if budget_exhausted {
            for oracle_source in &selected {
                if !completed.contains(oracle_source.id()) {
                    if let Some(state) = self.states.get(oracle_source.id()) {
                        state.lock().record_failure(FetchErrorClass::Timeout);
                    }
                }
            }
        }

        let mut verdict = self.build_verdict(&selected, quotes);
        verdict.budget_exhausted = budget_exhausted;
        debug!(
            pair = %pair,
            classification = verdict.classification.as_str(),
            sources = verdict.source_count,
            max_deviation = verdict.max_deviation,
            elapsed_us = start.elapsed().as_micros() as u64,
            "oracle fan-out complete"
        );
        verdict
    }

    fn record_success(&self, id: &str, latency: Duration) {
        if let Some(state) = self.states.get(id) {
            state
                .lock()
                .record_success(latency.as_micros() as u64, Utc::now().timestamp());
        }
    }

    fn record_failure(&self, id: &str, latency: Duration) {
        if let Some(state) = self.states.get(id) {
            let mut state = state.lock();
            let class = if latency >= state.per_source_timeout {
                FetchErrorClass::Timeout
            } else {
                FetchErrorClass::Upstream
            };
            state.record_failure(class);
        }
    }

    fn build_verdict(
        &self,
        selected: &[Arc<dyn OracleSource>],
        mut quotes: Vec<PriceQuote>,
    ) -> OracleVerdict {
        quotes.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        let mut participating: Vec<String> =
            quotes.iter().map(|q| q.source_id.clone()).collect();
        participating.sort();

        if quotes.len() < self.min_sources {
            return OracleVerdict::insufficient(quotes.len(), self.min_sources, participating);
        }

        let config_weight = |id: &str| -> f64 {
            self.states.get(id).map_or(0.0, |s| s.lock().weight)
        };

        // Weighted median: smallest price whose cumulative weight reaches
        // half of the total. Equal-weight two-source splits resolve to the
        // lower price.
        let weights: Vec<f64> = quotes
            .iter()
            .map(|q| config_weight(&q.source_id) * q.confidence)
            .collect();
        let total_weight: f64 = weights.iter().sum();
        let half_weight = total_weight / 2.0;

        let mut consensus_price = quotes[quotes.len() - 1].price;
        let mut cumulative = 0.0;
        for (quote, weight) in quotes.iter().zip(&weights) {
            cumulative += weight;
            if cumulative >= half_weight {
                consensus_price = quote.price;
                break;
            }
        }

        let max_deviation = quotes
            .iter()
            .map(|q| (q.price - consensus_price).abs() / consensus_price)
            .fold(0.0, f64::max);

        let classification = self.classify(&quotes, max_deviation);

        let selected_weight: f64 = selected.iter().map(|s| config_weight(s.id())).sum();
        let succeeded_weight: f64 = quotes
            .iter()
            .map(|q| config_weight(&q.source_id))
            .sum();
        let weighted_success = if selected_weight > 0.0 {
            succeeded_weight / selected_weight
        } else {
            0.0
        };
        let mean_confidence =
            quotes.iter().map(|q| q.confidence).sum::<f64>() / quotes.len() as f64;
        let health_score = ((weighted_success + mean_confidence) / 2.0).clamp(0.0, 1.0);

        OracleVerdict {
            consensus_price: Some(consensus_price),
            max_deviation,
            participating_sources: participating,
            source_count: quotes.len(),
            health_score,
            classification,
            budget_exhausted: false,
        }
    }

    fn classify(&self, quotes: &[PriceQuote], max_deviation: f64) -> OracleClassification {
        let t = &self.thresholds;
        if max_deviation <= t.dev_normal {
            return OracleClassification::Normal;
        }
        if max_deviation <= t.dev_warn {
            let prices: Vec<f64> = quotes.iter().map(|q| q.price).collect();
            let mean = prices.iter().sum::<f64>() / prices.len() as f64;
            let variance = prices
                .iter()
                .map(|p| (p - mean).powi(2))
                .sum::<f64>()
                / prices.len() as f64;
            let std = variance.sqrt();
            return if mean > 0.0 && std / mean <= VOLATILITY_STD_BOUND {
                OracleClassification::Normal
            } else {
                OracleClassification::Volatile
            };
        }
        if max_deviation <= t.dev_manip {
            return OracleClassification::Volatile;
        }
        OracleClassification::SuspectedManipulation
    }
}

/// Ingestion-time quote validation; rejected quotes count as fetch
/// failures.
fn validate_quote(quote: &PriceQuote, staleness_limit_secs: i64) -> Result<()> {
    if !quote.price.is_finite() || quote.price <= 0.0 {
        bail!("{}: non-positive price", quote.source_id);
    }
    if quote.received_at - quote.observed_at > staleness_limit_secs {
        bail!(
            "{}: quote is {}s stale",
            quote.source_id,
            quote.received_at - quote.observed_at
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use async_trait::async_trait;

    /// Scripted source for consensus tests.
    struct StaticSource {
        id: String,
        price: f64,
        confidence: f64,
        delay: Duration,
        fail: bool,
        stale_by: i64,
    }

    impl StaticSource {
        fn new(id: &str, price: f64) -> Self {
            Self {
                id: id.to_string(),
                price,
                confidence: 0.95,
                delay: Duration::ZERO,
                fail: false,
                stale_by: 0,
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn stale_by(mut self, secs: i64) -> Self {
            self.stale_by = secs;
            self
        }
    }

    #[async_trait]
    impl OracleSource for StaticSource {
        fn id(&self) -> &str {
            &self.id
        }

        async fn fetch(
            &self,
            pair: &str,
            _at: Option<i64>,
            _deadline: Instant,
        ) -> Result<PriceQuote> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                bail!("{}: scripted failure", self.id);
            }
            let now = Utc::now().timestamp();
            Ok(PriceQuote {
                source_id: self.id.clone(),
                pair: pair.to_string(),
                price: self.price,
                confidence: self.confidence,
                observed_at: now - self.stale_by,
                received_at: now,
            })
        }
    }

    fn manager_with(sources: Vec<StaticSource>, min_sources: usize) -> OracleRiskManager {
        let configs: Vec<SourceConfig> = sources
            .iter()
            .map(|s| SourceConfig {
                id: s.id.clone(),
                weight: 0.5,
                declared_reliability: 0.95,
                per_source_timeout_ms: 1_000,
                endpoint: None,
            })
            .collect();
        let config = EngineConfig {
            min_sources,
            sources: configs,
            ..Default::default()
        };
        let adapters: Vec<Arc<dyn OracleSource>> = sources
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn OracleSource>)
            .collect();
        OracleRiskManager::new(&config, adapters).unwrap()
    }

    #[tokio::test]
    async fn test_two_source_consensus_is_normal() {
        let manager = manager_with(
            vec![
                StaticSource::new("alpha", 43_490.0),
                StaticSource::new("beta", 43_510.0),
            ],
            2,
        );
        let verdict = manager
            .verify("BTC/USDT", None, None, Duration::from_secs(1))
            .await;

        assert_eq!(verdict.classification, OracleClassification::Normal);
        assert_eq!(verdict.source_count, 2);
        // Equal weights resolve the median to the lower price.
        assert_eq!(verdict.consensus_price, Some(43_490.0));
        assert!(verdict.health_score >= 0.9);
        assert!(verdict.integrity_verified());
    }

    #[tokio::test]
    async fn test_outlier_flags_manipulation() {
        let manager = manager_with(
            vec![
                StaticSource::new("alpha", 43_500.0),
                StaticSource::new("beta", 43_500.0),
                StaticSource::new("gamma", 52_000.0),
            ],
            2,
        );
        let verdict = manager
            .verify("BTC/USDT", None, None, Duration::from_secs(1))
            .await;

        assert_eq!(verdict.consensus_price, Some(43_500.0));
        assert_eq!(
            verdict.classification,
            OracleClassification::SuspectedManipulation
        );
        assert!(verdict.max_deviation > 0.10);
    }

    #[tokio::test]
    async fn test_deviation_at_manipulation_bound_is_volatile() {
        // Consensus lands on 100.0; the far quote deviates exactly 10%.
        let manager = manager_with(
            vec![
                StaticSource::new("alpha", 100.0),
                StaticSource::new("beta", 110.0),
            ],
            2,
        );
        let verdict = manager
            .verify("ETH/USDT", None, None, Duration::from_secs(1))
            .await;

        assert_eq!(verdict.consensus_price, Some(100.0));
        assert!((verdict.max_deviation - 0.10).abs() < 1e-12);
        assert_eq!(verdict.classification, OracleClassification::Volatile);
    }

    #[tokio::test]
    async fn test_below_quorum_is_insufficient() {
        let manager = manager_with(
            vec![
                StaticSource::new("alpha", 43_500.0),
                StaticSource::new("beta", 43_500.0).failing(),
            ],
            2,
        );
        let verdict = manager
            .verify("BTC/USDT", None, None, Duration::from_secs(1))
            .await;

        assert_eq!(
            verdict.classification,
            OracleClassification::InsufficientSources
        );
        assert_eq!(verdict.source_count, 1);
        assert!(verdict.consensus_price.is_none());
        assert!((verdict.health_score - 0.5).abs() < 1e-9);
        assert!((verdict.max_deviation - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_budget_cuts_off_slow_source() {
        let manager = manager_with(
            vec![
                StaticSource::new("alpha", 43_500.0),
                StaticSource::new("beta", 43_505.0),
                StaticSource::new("slow", 43_510.0).delayed(Duration::from_millis(500)),
            ],
            2,
        );
        let verdict = manager
            .verify("BTC/USDT", None, None, Duration::from_millis(100))
            .await;

        assert!(verdict.budget_exhausted);
        assert_eq!(verdict.source_count, 2);
        assert_eq!(verdict.classification, OracleClassification::Normal);
    }

    #[tokio::test]
    async fn test_stale_quotes_rejected_at_ingestion() {
        let manager = manager_with(
            vec![
                StaticSource::new("alpha", 43_500.0).stale_by(120),
                StaticSource::new("beta", 43_505.0),
            ],
            2,
        );
        let verdict = manager
            .verify("BTC/USDT", None, None, Duration::from_secs(1))
            .await;

        assert_eq!(
            verdict.classification,
            OracleClassification::InsufficientSources
        );
        assert_eq!(verdict.source_count, 1);
    }

    #[tokio::test]
    async fn test_allow_list_restricts_fan_out() {
        let manager = manager_with(
            vec![
                StaticSource::new("alpha", 43_500.0),
                StaticSource::new("beta", 43_505.0),
                StaticSource::new("gamma", 52_000.0),
            ],
            2,
        );
        let allow = vec!["alpha".to_string(), "beta".to_string()];
        let verdict = manager
            .verify("BTC/USDT", None, Some(&allow), Duration::from_secs(1))
            .await;

        assert_eq!(verdict.source_count, 2);
        assert_eq!(
            verdict.participating_sources,
            vec!["alpha".to_string(), "beta".to_string()]
        );
        assert_eq!(verdict.classification, OracleClassification::Normal);
    }

    #[tokio::test]
    async fn test_consensus_within_quote_range() {
        let cases: Vec<Vec<f64>> = vec![
            vec![100.0, 101.0],
            vec![95.0, 100.0, 105.0],
            vec![100.0, 100.0, 100.0, 250.0],
            vec![42.0, 43.0, 44.0, 45.0, 46.0],
        ];
        for (case_index, prices) in cases.into_iter().enumerate() {
            let lo = prices.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let sources: Vec<StaticSource> = prices
                .iter()
                .enumerate()
                .map(|(i, p)| StaticSource::new(&format!("s{case_index}_{i}"), *p))
                .collect();
            let manager = manager_with(sources, 2);
            let verdict = manager
                .verify("BTC/USDT", None, None, Duration::from_secs(1))
                .await;
            let consensus = verdict.consensus_price.unwrap();
            assert!(consensus >= lo && consensus <= hi);
        }
    }

    #[tokio::test]
    async fn test_failures_update_source_health() {
        let manager = manager_with(
            vec![
                StaticSource::new("alpha", 43_500.0),
                StaticSource::new("beta", 43_505.0).failing(),
            ],
            1,
        );
        for round in 0..3 {
            // Distinct pairs defeat the quote cache so each round fetches.
            let pair = format!("PAIR{round}");
            let _ = manager
                .verify(&pair, None, None, Duration::from_secs(1))
                .await;
        }

        let states = manager.source_states();
        let beta = states
            .iter()
            .find(|s| s.source_id == "beta")
            .unwrap();
        assert_eq!(beta.failure_count, 3);
        assert!(!matches!(beta.status, source::SourceStatus::Healthy));
    }
}
