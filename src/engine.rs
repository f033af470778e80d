//! Verification engine: the orchestrator.
//!
//! Composes the cache, local verifier, oracle risk manager, attestation
//! generator, and metrics behind one `verify` call with a hard per-request
//! deadline. All internal failures degrade into violations or a degraded
//! oracle verdict; the only thing this module ever returns is a well-formed
//! result.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::attestation::{AttestationGenerator, DisclosureView, PrivacyLevel};
use crate::cache::{CacheOutcome, CacheStats, VerificationCache};
use crate::config::EngineConfig;
use crate::fingerprint::request_fingerprint;
use crate::metrics::{EngineMetrics, HealthReport, MetricsSnapshot};
use crate::models::{
    tags, ClaimPayload, LocalResult, OracleClassification, OracleVerdict, PerformanceClaim,
    PerformanceFigures, RiskGrade, StrategyClaim, TradeClaim, VerificationRequest,
    VerificationResult, VerificationStatus,
};
use crate::oracle::source::{OracleSource, SourceState};
use crate::oracle::OracleRiskManager;
use crate::verifier::{LocalVerifier, VerifyContext};

/// Slack reserved inside the request budget for synthesis and bookkeeping.
const OVERHEAD_MARGIN: Duration = Duration::from_millis(5);

/// Risk synthesis coefficients: oracle ill-health and excess deviation are
/// folded into the local risk score.
const ORACLE_HEALTH_RISK_WEIGHT: f64 = 0.3;
const DEVIATION_RISK_WEIGHT: f64 = 0.5;
const CONFIDENCE_RISK_PENALTY: f64 = 0.3;

/// Oracle health below this earns a recommendation to add sources.
const ORACLE_HEALTH_ADVISORY: f64 = 0.9;
/// Confidence below this earns a recommendation to gather more data.
const CONFIDENCE_ADVISORY: f64 = 0.8;

/// Orchestrator for verification requests.
///
/// Engines are plain values: construct one per configuration, share it via
/// `Arc`, and drop it when done. Tests build their own with scripted
/// sources.
pub struct VerificationEngine {
    config: Arc<EngineConfig>,
    result_cache: Arc<VerificationCache<VerificationResult>>,
    oracle: Arc<OracleRiskManager>,
    verifier: LocalVerifier,
    attestor: AttestationGenerator,
    metrics: Arc<EngineMetrics>,
    inflight: AtomicUsize,
}

impl VerificationEngine {
    /// Validate the configuration and wire the components together.
    pub fn new(config: EngineConfig, sources: Vec<Arc<dyn OracleSource>>) -> Result<Self> {
        config.validate()?;
        let oracle = Arc::new(OracleRiskManager::new(&config, sources)?);
        let result_cache = Arc::new(VerificationCache::new(config.cache_capacity));
        let verifier = LocalVerifier::new(&config);
        Ok(Self {
            config: Arc::new(config),
            result_cache,
            oracle,
            verifier,
            attestor: AttestationGenerator::new(),
            metrics: Arc::new(EngineMetrics::new()),
            inflight: AtomicUsize::new(0),
        })
    }

    /// Verify one request within the configured deadline.
    pub async fn verify(&self, request: VerificationRequest) -> VerificationResult {
        let started = Instant::now();

        // A zero budget admits nothing; fail fast before touching any
        // component.
        if self.config.max_total_ms == 0 {
            let result = self.rejection_result(&request, tags::OVERLOADED, started);
            self.metrics.record(&result);
            return result;
        }

        let Some(_admission) =
            AdmissionGuard::acquire(&self.inflight, self.config.max_inflight_requests)
        else {
            let result = self.rejection_result(&request, tags::OVERLOADED, started);
            self.metrics.record(&result);
            return result;
        };

        if let Err(reason) = request.validate() {
            debug!(request_id = %request.request_id, reason, "rejecting malformed request");
            let mut result = self.rejection_result(&request, tags::INVALID_REQUEST, started);
            result
                .details
                .insert("rejection_reason".to_string(), json!(reason));
            self.metrics.record(&result);
            return result;
        }

        let fingerprint = request_fingerprint(&request, self.config.fingerprint_window_secs);
        let (computed, outcome) = self
            .result_cache
            .get_or_compute(&fingerprint, self.config.result_ttl(), || {
                self.compute(&request, started)
            })
            .await;

        let mut result = match computed {
            Ok(result) => result,
            Err(err) => {
                warn!(request_id = %request.request_id, error = %err, "verification compute failed");
                self.rejection_result(&request, tags::INTERNAL_ERROR, started)
            }
        };

        if outcome == CacheOutcome::Hit {
            result.request_id = request.request_id.clone();
            result
                .details
                .insert("from_cache".to_string(), json!(true));
        }

        self.metrics.record(&result);
        result
    }

    /// The uncached verification path.
    async fn compute(
        &self,
        request: &VerificationRequest,
        started: Instant,
    ) -> Result<VerificationResult> {
        let now_unix = Utc::now().timestamp();
        let kind = request.claim.kind();
        let deadline = started + self.config.max_total();
        let oracle_required = kind.requires_oracle() && request.claim.pair().is_some();

        // The fan-out starts first so oracle I/O overlaps the synchronous
        // local pass.
        let oracle_task = if oracle_required {
            let pair = request.claim.pair().unwrap_or_default().to_string();
            let at = request.claim.timestamp();
            let allow_list = request.oracle_sources.clone();
            let oracle = self.oracle.clone();
            let budget = self
                .config
                .max_total()
                .saturating_sub(started.elapsed() + OVERHEAD_MARGIN);
            Some(tokio::spawn(async move {
                oracle.verify(&pair, at, allow_list.as_deref(), budget).await
            }))
        } else {
            None
        };

        let local_started = Instant::now();
        let mut local = self.verifier.verify(
            &request.claim,
            &VerifyContext {
                oracle: None,
                preserve_privacy: request.preserve_privacy,
                now_unix,
            },
        );
        let mut local_latency = local_started.elapsed();

        let oracle_verdict = match oracle_task {
            Some(mut handle) => {
                match tokio::time::timeout_at(deadline.into(), &mut handle).await {
                    Ok(Ok(verdict)) => Some(verdict),
                    Ok(Err(join_err)) => {
                        warn!(error = %join_err, "oracle fan-out task failed");
                        Some(OracleVerdict::insufficient(
                            0,
                            self.oracle.min_sources(),
                            Vec::new(),
                        ))
                    }
                    Err(_) => {
                        // Joint deadline elapsed: cancel the fan-out and
                        // synthesize a degraded verdict.
                        handle.abort();
                        let mut verdict =
                            OracleVerdict::insufficient(0, self.oracle.min_sources(), Vec::new());
                        verdict.budget_exhausted = true;
                        Some(verdict)
                    }
                }
            }
            None => None,
        };

        // The oracle verdict feeds trading and strategy rules, so those
        // kinds get a second local pass against it.
        if let Some(ref verdict) = oracle_verdict {
            let second_started = Instant::now();
            local = self.verifier.verify(
                &request.claim,
                &VerifyContext {
                    oracle: Some(verdict),
                    preserve_privacy: request.preserve_privacy,
                    now_unix,
                },
            );
            local_latency += second_started.elapsed();
        }

        if local_latency > Duration::from_millis(self.config.local_target_ms) {
            debug!(
                request_id = %request.request_id,
                local_latency_us = local_latency.as_micros() as u64,
                target_ms = self.config.local_target_ms,
                "local verification exceeded its soft latency target"
            );
        }

        let oracle_health = oracle_verdict
            .as_ref()
            .map(|v| v.health_score)
            .unwrap_or(1.0);
        let deviation_excess = oracle_verdict
            .as_ref()
            .map(|v| (v.max_deviation - self.config.thresholds.dev_normal).max(0.0))
            .unwrap_or(0.0);

        let risk_score = (local.risk_score
            + ORACLE_HEALTH_RISK_WEIGHT * (1.0 - oracle_health)
            + DEVIATION_RISK_WEIGHT * deviation_excess)
            .clamp(0.0, 1.0);
        let risk_grade = RiskGrade::from_score(risk_score);
        let confidence = (0.5 * local.confidence + 0.5 * oracle_health
            - CONFIDENCE_RISK_PENALTY * risk_score)
            .clamp(0.0, 1.0);

        // Every oracle-driven failure must carry an explaining tag, even
        // when no kind-level rule consumed the verdict.
        let mut violations = local.violations.clone();
        if let Some(ref verdict) = oracle_verdict {
            if oracle_required {
                match verdict.classification {
                    OracleClassification::SuspectedManipulation => {
                        violations.push(tags::ORACLE_PRICE_MANIPULATION.to_string());
                    }
                    OracleClassification::InsufficientSources => {
                        violations.push(tags::INSUFFICIENT_ORACLE_SOURCES.to_string());
                    }
                    _ => {}
                }
            }
            if verdict.budget_exhausted {
                violations.push(tags::HIGH_ORACLE_LATENCY.to_string());
            }
        }
        // The verifier may already report the manipulation tag; keep the
        // first occurrence of each tag regardless of where it came from.
        let mut seen = std::collections::HashSet::new();
        violations.retain(|tag| seen.insert(tag.clone()));

        let compliance = self.evaluate_compliance(request, &local, oracle_verdict.as_ref());
        let status = decide_status(
            &local,
            oracle_required,
            oracle_verdict.as_ref(),
            risk_grade,
            &compliance,
            &violations,
        );

        let recommendations =
            build_recommendations(risk_grade, oracle_health, confidence, &violations);

        let mut details: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        details.insert("kind".to_string(), json!(kind.as_str()));
        details.insert(
            "local".to_string(),
            serde_json::Value::Object(local.details.clone().into_iter().collect()),
        );
        if let Some(ref verdict) = oracle_verdict {
            details.insert(
                "oracle".to_string(),
                json!({
                    "classification": verdict.classification.as_str(),
                    "source_count": verdict.source_count,
                    "participating_sources": verdict.participating_sources,
                    "max_deviation": verdict.max_deviation,
                    "consensus_price": verdict.consensus_price,
                    "health_score": verdict.health_score,
                }),
            );
        }

        let attestation = if request.preserve_privacy {
            let view = DisclosureView {
                status: status.as_str().to_string(),
                risk_grade: risk_grade.as_str().to_string(),
                compliance: compliance.clone(),
            };
            match self.attestor.attest(&view, PrivacyLevel::Standard) {
                Ok(attestation) => Some(attestation),
                Err(err) => {
                    warn!(error = %err, "attestation generation failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(VerificationResult {
            request_id: request.request_id.clone(),
            status,
            confidence,
            risk_grade,
            risk_score,
            violations,
            oracle_health,
            local_latency_ns: local_latency.as_nanos() as u64,
            total_latency_ns: started.elapsed().as_nanos() as u64,
            attestation,
            recommendations,
            compliance,
            details,
        })
    }

    /// Evaluate every requested framework plus the operator-required set.
    fn evaluate_compliance(
        &self,
        request: &VerificationRequest,
        local: &LocalResult,
        oracle: Option<&OracleVerdict>,
    ) -> BTreeMap<String, bool> {
        let mut compliance = BTreeMap::new();
        let requested = request
            .compliance
            .iter()
            .chain(self.config.compliance.required.iter());
        for framework in requested {
            let satisfied = match framework.as_str() {
                "SOC2" => request.preserve_privacy && local.audit_trail,
                "ISO27001" => {
                    local.data_integrity && oracle.map_or(true, OracleVerdict::integrity_verified)
                }
                "GDPR" => request.preserve_privacy,
                // Unknown frameworks are unmet, never an error.
                _ => false,
            };
            compliance.insert(framework.clone(), satisfied);
        }
        compliance
    }

    /// Well-formed failure result for requests rejected before (or instead
    /// of) the pipeline.
    fn rejection_result(
        &self,
        request: &VerificationRequest,
        violation: &str,
        started: Instant,
    ) -> VerificationResult {
        VerificationResult {
            request_id: request.request_id.clone(),
            status: VerificationStatus::Failed,
            confidence: 0.0,
            risk_grade: RiskGrade::Critical,
            risk_score: 1.0,
            violations: vec![violation.to_string()],
            oracle_health: 0.0,
            local_latency_ns: 0,
            total_latency_ns: started.elapsed().as_nanos() as u64,
            attestation: None,
            recommendations: Vec::new(),
            compliance: BTreeMap::new(),
            details: BTreeMap::new(),
        }
    }

    /// Verify a proposed trade for a bot, with privacy on by default.
    pub async fn verify_trading_decision(
        &self,
        bot_id: &str,
        trade: TradeClaim,
    ) -> VerificationResult {
        let claim = TradeClaim {
            bot_id: Some(bot_id.to_string()),
            ..trade
        };
        let request = VerificationRequest {
            request_id: scoped_request_id("trade", bot_id),
            claim: ClaimPayload::TradingDecision(claim),
            created_at: monotonic_nanos(),
            preserve_privacy: true,
            oracle_sources: None,
            compliance: Vec::new(),
        };
        self.verify(request).await
    }

    /// Verify a reported-vs-actual performance claim.
    pub async fn verify_performance_claim(
        &self,
        bot_id: &str,
        claimed: PerformanceFigures,
        actual: PerformanceFigures,
    ) -> VerificationResult {
        let request = VerificationRequest {
            request_id: scoped_request_id("performance", bot_id),
            claim: ClaimPayload::PerformanceClaim(PerformanceClaim {
                bot_id: Some(bot_id.to_string()),
                claimed: Some(claimed),
                actual: Some(actual),
            }),
            created_at: monotonic_nanos(),
            preserve_privacy: true,
            oracle_sources: None,
            compliance: Vec::new(),
        };
        self.verify(request).await
    }

    /// Verify a DeFi strategy configuration.
    pub async fn verify_defi_strategy(
        &self,
        strategy: StrategyClaim,
        preserve_privacy: bool,
    ) -> VerificationResult {
        let request = VerificationRequest {
            request_id: scoped_request_id("defi", "strategy"),
            claim: ClaimPayload::DefiStrategy(strategy),
            created_at: monotonic_nanos(),
            preserve_privacy,
            oracle_sources: None,
            compliance: Vec::new(),
        };
        self.verify(request).await
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.result_cache.stats()
    }

    /// Component health roll-up for scrape endpoints.
    pub fn health(&self) -> EngineHealth {
        let metrics = self.metrics.health(&self.config);
        EngineHealth {
            healthy: metrics.healthy,
            cache: self.result_cache.stats(),
            oracle_sources: self.oracle.source_states(),
            metrics,
        }
    }
}

/// Per-component health view.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub healthy: bool,
    pub cache: CacheStats,
    pub oracle_sources: Vec<SourceState>,
    pub metrics: HealthReport,
}

fn decide_status(
    local: &LocalResult,
    oracle_required: bool,
    oracle: Option<&OracleVerdict>,
    risk_grade: RiskGrade,
    compliance: &BTreeMap<String, bool>,
    violations: &[String],
) -> VerificationStatus {
    if risk_grade == RiskGrade::Critical {
        return VerificationStatus::Failed;
    }
    let oracle_untrustworthy = oracle_required
        && oracle.map_or(false, |v| {
            matches!(
                v.classification,
                OracleClassification::SuspectedManipulation
                    | OracleClassification::InsufficientSources
            )
        });
    if !local.valid || oracle_untrustworthy {
        return VerificationStatus::Failed;
    }
    if compliance.values().any(|satisfied| !satisfied) {
        return VerificationStatus::NeedsReview;
    }
    if risk_grade == RiskGrade::High {
        return VerificationStatus::NeedsReview;
    }
    // A verified verdict never carries violations; residual advisory tags
    // push the claim to review instead.
    if !violations.is_empty() {
        return VerificationStatus::NeedsReview;
    }
    VerificationStatus::Verified
}

fn build_recommendations(
    risk_grade: RiskGrade,
    oracle_health: f64,
    confidence: f64,
    violations: &[String],
) -> Vec<String> {
    let mut recommendations = Vec::new();
    if matches!(risk_grade, RiskGrade::High | RiskGrade::Critical) {
        recommendations.push("Implement additional risk controls".to_string());
        recommendations.push("Consider manual review before execution".to_string());
    }
    if oracle_health < ORACLE_HEALTH_ADVISORY {
        recommendations.push("Verify oracle health before continuing".to_string());
        recommendations.push("Consider using additional oracle sources".to_string());
    }
    if confidence < CONFIDENCE_ADVISORY {
        recommendations.push("Increase verification parameters".to_string());
        recommendations.push("Collect additional validation data".to_string());
    }
    if !violations.is_empty() {
        recommendations.push("Address identified violations before proceeding".to_string());
        recommendations.push("Review compliance requirements".to_string());
    }
    recommendations
}

/// Monotonic, non-zero nanosecond stamp for engine-built requests.
fn monotonic_nanos() -> u64 {
    static ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let origin = *ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_nanos() as u64 + 1
}

fn scoped_request_id(scope: &str, subject: &str) -> String {
    let subject: String = subject.chars().take(32).collect();
    let id = format!("{scope}_{subject}_{}", Utc::now().timestamp());
    id.chars()
        .take(VerificationRequest::MAX_REQUEST_ID_BYTES)
        .collect()
}

/// RAII admission slot; releases on drop.
struct AdmissionGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> AdmissionGuard<'a> {
    fn acquire(counter: &'a AtomicUsize, cap: usize) -> Option<Self> {
        let previous = counter.fetch_add(1, Ordering::AcqRel);
        if previous >= cap {
            counter.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self { counter })
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
