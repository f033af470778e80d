//! Verification metrics and health roll-up.
//!
//! Counters are lock-free; the EMA latencies and violation map take a
//! short lock per update. Readers see eventually consistent values: a
//! snapshot may lag the most recent request by one update.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::models::{VerificationResult, VerificationStatus};

const EMA_ALPHA: f64 = 0.1;

/// Oracle health below this degrades the component roll-up.
const ORACLE_HEALTH_FLOOR: f64 = 0.7;
/// Verified share below this degrades the component roll-up.
const SUCCESS_RATE_FLOOR: f64 = 0.95;

#[derive(Debug, Default)]
struct Ema {
    value: Option<f64>,
}

impl Ema {
    fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(current) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * current,
        });
    }

    fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Aggregated verification metrics.
pub struct EngineMetrics {
    total: AtomicU64,
    verified: AtomicU64,
    failed: AtomicU64,
    needs_review: AtomicU64,
    pending: AtomicU64,
    by_violation: Mutex<BTreeMap<String, u64>>,
    local_latency_ns: Mutex<Ema>,
    total_latency_ns: Mutex<Ema>,
    oracle_health: Mutex<Ema>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            verified: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            needs_review: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            by_violation: Mutex::new(BTreeMap::new()),
            local_latency_ns: Mutex::new(Ema::default()),
            total_latency_ns: Mutex::new(Ema::default()),
            oracle_health: Mutex::new(Ema::default()),
        }
    }

    /// Record one completed verification.
    pub fn record(&self, result: &VerificationResult) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match result.status {
            VerificationStatus::Verified => &self.verified,
            VerificationStatus::Failed => &self.failed,
            VerificationStatus::NeedsReview => &self.needs_review,
            VerificationStatus::Pending => &self.pending,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if !result.violations.is_empty() {
            let mut by_violation = self.by_violation.lock();
            for violation in &result.violations {
                *by_violation.entry(violation.clone()).or_insert(0) += 1;
            }
        }

        self.local_latency_ns
            .lock()
            .update(result.local_latency_ns as f64);
        self.total_latency_ns
            .lock()
            .update(result.total_latency_ns as f64);
        self.oracle_health.lock().update(result.oracle_health);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let verified = self.verified.load(Ordering::Relaxed);
        let mut by_status = BTreeMap::new();
        by_status.insert("verified".to_string(), verified);
        by_status.insert("failed".to_string(), self.failed.load(Ordering::Relaxed));
        by_status.insert(
            "needs_review".to_string(),
            self.needs_review.load(Ordering::Relaxed),
        );
        by_status.insert("pending".to_string(), self.pending.load(Ordering::Relaxed));

        MetricsSnapshot {
            total,
            by_status,
            by_violation: self.by_violation.lock().clone(),
            avg_local_latency_ms: self.local_latency_ns.lock().get() / 1e6,
            avg_total_latency_ms: self.total_latency_ns.lock().get() / 1e6,
            oracle_health_score: self.oracle_health.lock().get(),
            success_rate: if total > 0 {
                verified as f64 / total as f64
            } else {
                1.0
            },
        }
    }

    /// Roll the snapshot up into a healthy/degraded verdict with named
    /// issues.
    pub fn health(&self, config: &EngineConfig) -> HealthReport {
        let snapshot = self.snapshot();
        let mut issues = Vec::new();

        if snapshot.total > 0 && snapshot.avg_total_latency_ms > config.max_total_ms as f64 {
            issues.push(format!(
                "average latency {:.1}ms exceeds the {}ms budget",
                snapshot.avg_total_latency_ms, config.max_total_ms
            ));
        }
        if snapshot.total > 0 && snapshot.oracle_health_score < ORACLE_HEALTH_FLOOR {
            issues.push(format!(
                "oracle health {:.2} below {ORACLE_HEALTH_FLOOR}",
                snapshot.oracle_health_score
            ));
        }
        if snapshot.total > 0 && snapshot.success_rate < SUCCESS_RATE_FLOOR {
            issues.push(format!(
                "success rate {:.2} below {SUCCESS_RATE_FLOOR}",
                snapshot.success_rate
            ));
        }

        HealthReport {
            healthy: issues.is_empty(),
            issues,
            snapshot,
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_violation: BTreeMap<String, u64>,
    pub avg_local_latency_ms: f64,
    pub avg_total_latency_ms: f64,
    pub oracle_health_score: f64,
    pub success_rate: f64,
}

/// Health roll-up for scrape endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub snapshot: MetricsSnapshot,
}
