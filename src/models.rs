//! Core value types for the verification pipeline.
//!
//! Requests and results are immutable values: the engine owns nothing the
//! caller handed in, and the caller owns the result once it is returned.
//! Payloads are a tagged variant over the claim kind so validation happens
//! once at the boundary and downstream code sees typed data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable violation tags that appear in `VerificationResult::violations`.
///
/// These strings are part of the external contract; downstream systems key
/// alerting and routing off them.
pub mod tags {
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const UNKNOWN_KIND: &str = "unknown_kind";

    pub const STALE_TRADE_DATA: &str = "stale_trade_data";
    pub const RISK_LIMIT_EXCEEDED: &str = "risk_limit_exceeded";
    pub const STRATEGY_DEVIATION: &str = "strategy_deviation";

    pub const PERFORMANCE_MISMATCH: &str = "performance_mismatch";
    pub const WIN_RATE_MISMATCH: &str = "win_rate_mismatch";
    pub const SUSPICIOUS_PATTERN: &str = "suspicious_pattern";

    pub const INVALID_STRATEGY_CONFIG: &str = "invalid_strategy_config";
    pub const HIGH_SLIPPAGE_RISK: &str = "high_slippage_risk";
    pub const HIGH_RISK_PROTOCOL: &str = "high_risk_protocol";

    pub const EXCESSIVE_DRAWDOWN_LIMIT: &str = "excessive_drawdown_limit";
    pub const EXCESSIVE_POSITION_SIZE: &str = "excessive_position_size";
    pub const EXCESSIVE_LEVERAGE: &str = "excessive_leverage";
    pub const MISSING_STOP_LOSS: &str = "missing_stop_loss";
    pub const WIDE_STOP_LOSS: &str = "wide_stop_loss";

    pub const EMPTY_DATA: &str = "empty_data";
    pub const SUSPICIOUS_PRECISION: &str = "suspicious_precision";

    pub const ORACLE_PRICE_MANIPULATION: &str = "oracle_price_manipulation";
    pub const INSUFFICIENT_ORACLE_SOURCES: &str = "insufficient_oracle_sources";
    pub const HIGH_ORACLE_LATENCY: &str = "high_oracle_latency";

    pub const OVERLOADED: &str = "overloaded";
    pub const INTERNAL_ERROR: &str = "internal_error";

    /// Tag for a payload field that is missing or outside its basic domain.
    pub fn invalid_field(name: &str) -> String {
        format!("invalid_field_{name}")
    }

    /// Tag for a strategy parameter outside its declared range.
    pub fn out_of_range(field: &str) -> String {
        format!("{field}_out_of_range")
    }
}

/// Claim kinds accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    TradingDecision,
    PerformanceClaim,
    DefiStrategy,
    RiskCompliance,
    Generic,
}

impl ClaimKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimKind::TradingDecision => "trading_decision",
            ClaimKind::PerformanceClaim => "performance_claim",
            ClaimKind::DefiStrategy => "defi_strategy",
            ClaimKind::RiskCompliance => "risk_compliance",
            ClaimKind::Generic => "generic",
        }
    }

    /// Kinds whose rules consume price context from the oracle layer.
    pub fn requires_oracle(&self) -> bool {
        matches!(self, ClaimKind::TradingDecision | ClaimKind::DefiStrategy)
    }
}

/// Buy/sell side of a proposed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }
}

/// Declared strategy context attached to a trading decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyProfile {
    #[serde(rename = "type")]
    pub strategy_type: String,
    #[serde(default)]
    pub max_position: Option<f64>,
}

/// A proposed trade submitted for verification.
///
/// Fields are optional so the rule engine can report exactly which ones are
/// missing instead of rejecting the whole payload at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TradeClaim {
    #[serde(default)]
    pub pair: Option<String>,
    #[serde(default)]
    pub action: Option<TradeAction>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    /// Unix seconds at which the decision was produced.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub strategy: Option<StrategyProfile>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

/// One side of a performance comparison (claimed or measured).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceFigures {
    #[serde(default)]
    pub roi: Option<f64>,
    #[serde(default)]
    pub win_rate: Option<f64>,
    #[serde(default)]
    pub sharpe: Option<f64>,
    #[serde(default)]
    pub max_drawdown: Option<f64>,
}

/// A reported-vs-actual performance claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceClaim {
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub claimed: Option<PerformanceFigures>,
    #[serde(default)]
    pub actual: Option<PerformanceFigures>,
}

/// A DeFi strategy configuration submitted for verification.
///
/// Type-specific parameters (`take_profit`, `grid_size`, ...) arrive in the
/// flattened `params` map and are range-checked against the table for the
/// declared strategy type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StrategyClaim {
    #[serde(rename = "type", default)]
    pub strategy_type: Option<String>,
    #[serde(default)]
    pub pair: Option<String>,
    #[serde(default)]
    pub slippage_tolerance: Option<f64>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

/// Declared risk limits submitted for compliance review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RiskProfileClaim {
    #[serde(default)]
    pub max_drawdown: Option<f64>,
    #[serde(default)]
    pub max_position_size: Option<f64>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

/// Tagged claim payload, keyed by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ClaimPayload {
    TradingDecision(TradeClaim),
    PerformanceClaim(PerformanceClaim),
    DefiStrategy(StrategyClaim),
    RiskCompliance(RiskProfileClaim),
    Generic(serde_json::Map<String, Value>),
}

impl ClaimPayload {
    pub fn kind(&self) -> ClaimKind {
        match self {
            ClaimPayload::TradingDecision(_) => ClaimKind::TradingDecision,
            ClaimPayload::PerformanceClaim(_) => ClaimKind::PerformanceClaim,
            ClaimPayload::DefiStrategy(_) => ClaimKind::DefiStrategy,
            ClaimPayload::RiskCompliance(_) => ClaimKind::RiskCompliance,
            ClaimPayload::Generic(_) => ClaimKind::Generic,
        }
    }

    /// Trading pair referenced by the payload, if any.
    pub fn pair(&self) -> Option<&str> {
        match self {
            ClaimPayload::TradingDecision(t) => t.pair.as_deref(),
            ClaimPayload::DefiStrategy(s) => s.pair.as_deref(),
            _ => None,
        }
    }

    /// Timestamp carried by the payload, if any (Unix seconds).
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            ClaimPayload::TradingDecision(t) => t.timestamp,
            _ => None,
        }
    }
}

/// A verification request entering the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    /// Opaque caller-chosen identifier, at most 64 bytes.
    pub request_id: String,
    #[serde(flatten)]
    pub claim: ClaimPayload,
    /// Monotonic nanoseconds at creation; must be non-zero.
    pub created_at: u64,
    #[serde(default)]
    pub preserve_privacy: bool,
    /// Optional allow-list restricting which configured oracle sources
    /// may participate.
    #[serde(default)]
    pub oracle_sources: Option<Vec<String>>,
    /// Compliance framework tags the caller wants evaluated.
    #[serde(default)]
    pub compliance: Vec<String>,
}

impl VerificationRequest {
    pub const MAX_REQUEST_ID_BYTES: usize = 64;

    /// Check the structural invariants a request must satisfy before any
    /// component is touched.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.request_id.is_empty() {
            return Err("request_id is empty");
        }
        if self.request_id.len() > Self::MAX_REQUEST_ID_BYTES {
            return Err("request_id exceeds 64 bytes");
        }
        if self.created_at == 0 {
            return Err("created_at is zero");
        }
        Ok(())
    }
}

/// Final verdict status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Failed,
    NeedsReview,
    Pending,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Failed => "failed",
            VerificationStatus::NeedsReview => "needs_review",
            VerificationStatus::Pending => "pending",
        }
    }
}

/// Coarse risk bucket over the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskGrade {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskGrade {
    /// Bucket thresholds: low < 0.2 ≤ medium < 0.5 ≤ high < 0.8 ≤ critical.
    pub fn from_score(score: f64) -> Self {
        if score < 0.2 {
            RiskGrade::Low
        } else if score < 0.5 {
            RiskGrade::Medium
        } else if score < 0.8 {
            RiskGrade::High
        } else {
            RiskGrade::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskGrade::Low => "low",
            RiskGrade::Medium => "medium",
            RiskGrade::High => "high",
            RiskGrade::Critical => "critical",
        }
    }
}

/// The engine's answer to a verification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub request_id: String,
    pub status: VerificationStatus,
    pub confidence: f64,
    pub risk_grade: RiskGrade,
    pub risk_score: f64,
    pub violations: Vec<String>,
    /// 1.0 when no oracle call was required.
    pub oracle_health: f64,
    pub local_latency_ns: u64,
    pub total_latency_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<String>,
    pub recommendations: Vec<String>,
    pub compliance: BTreeMap<String, bool>,
    /// Diagnostic context; non-authoritative.
    pub details: BTreeMap<String, Value>,
}

/// A single price observation from one oracle source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub source_id: String,
    pub pair: String,
    pub price: f64,
    pub confidence: f64,
    /// Provider's own timestamp (Unix seconds).
    pub observed_at: i64,
    /// Local receive timestamp (Unix seconds).
    pub received_at: i64,
}

/// Consensus classification over a fan-out of quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleClassification {
    Normal,
    Volatile,
    SuspectedManipulation,
    InsufficientSources,
}

impl OracleClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleClassification::Normal => "normal",
            OracleClassification::Volatile => "volatile",
            OracleClassification::SuspectedManipulation => "suspected_manipulation",
            OracleClassification::InsufficientSources => "insufficient_sources",
        }
    }
}

/// Aggregate verdict produced by the oracle risk manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    /// Weighted median across participating quotes; absent below quorum.
    pub consensus_price: Option<f64>,
    /// Largest relative distance of any quote from the consensus price.
    pub max_deviation: f64,
    pub participating_sources: Vec<String>,
    pub source_count: usize,
    pub health_score: f64,
    pub classification: OracleClassification,
    /// True when the joint budget elapsed before every selected source
    /// reported.
    pub budget_exhausted: bool,
}

impl OracleVerdict {
    /// Verdict for a fan-out that did not reach quorum.
    pub fn insufficient(successes: usize, min_sources: usize, participating: Vec<String>) -> Self {
        let health = if min_sources == 0 {
            0.0
        } else {
            (successes as f64 / min_sources as f64).clamp(0.0, 1.0)
        };
        Self {
            consensus_price: None,
            max_deviation: 1.0,
            participating_sources: participating,
            source_count: successes,
            health_score: health,
            classification: OracleClassification::InsufficientSources,
            budget_exhausted: false,
        }
    }

    /// Whether downstream integrity-sensitive checks may rely on this
    /// verdict: quorum reached and prices agree.
    pub fn integrity_verified(&self) -> bool {
        self.classification == OracleClassification::Normal
    }
}

/// Outcome of the deterministic local rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalResult {
    pub valid: bool,
    pub confidence: f64,
    pub violations: Vec<String>,
    pub risk_score: f64,
    pub details: BTreeMap<String, Value>,
    /// The verifier emitted enough structured context to reconstruct the
    /// decision path.
    pub audit_trail: bool,
    /// No integrity-class violations (missing or malformed fields) were
    /// found in the payload.
    pub data_integrity: bool,
}
