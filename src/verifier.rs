//! Deterministic local rule engine.
//!
//! Applies per-kind rules to a claim in-process, with no I/O and no
//! suspension: the hot path of every verification. Determinism is a hard
//! contract. Identical `(claim, oracle, config, now)` inputs produce
//! byte-identical results, so the clock is injected and all diagnostic
//! maps are ordered.

use std::collections::{BTreeMap, HashSet};

use serde_json::{json, Map, Value};

use crate::config::EngineConfig;
use crate::models::{
    tags, ClaimPayload, LocalResult, OracleClassification, OracleVerdict, PerformanceClaim,
    RiskProfileClaim, StrategyClaim, TradeAction, TradeClaim,
};

/// Floor for the claimed-ROI denominator in relative deviation.
const ROI_EPSILON: f64 = 1e-6;
/// Win-rate gap beyond which claimed and actual disagree.
const WIN_RATE_TOLERANCE: f64 = 0.1;
/// Claims above these smell like fabricated numbers.
const SUSPICIOUS_ROI: f64 = 5.0;
const SUSPICIOUS_WIN_RATE: f64 = 0.95;
/// Slippage tolerance above which a strategy is flagged.
const SLIPPAGE_BOUND: f64 = 0.05;
/// Risk-compliance bounds.
const DRAWDOWN_BOUND: f64 = 0.2;
const LEVERAGE_BOUND: f64 = 3.0;
const STOP_LOSS_BOUND: f64 = 0.1;
/// Fractional digits beyond which a number is suspiciously precise.
const MAX_FRACTIONAL_DIGITS: usize = 8;

/// Per-type parameter ranges for DeFi strategies.
const DCA_PARAMS: &[(&str, f64, f64)] = &[
    ("take_profit", 0.5, 20.0),
    ("safety_orders", 1.0, 10.0),
    ("deviation", 1.0, 10.0),
];
const GRID_PARAMS: &[(&str, f64, f64)] = &[
    ("grid_size", 3.0, 50.0),
    ("upper_limit", 0.01, 2.0),
    ("lower_limit", 0.01, 2.0),
];
const ARBITRAGE_PARAMS: &[(&str, f64, f64)] = &[
    ("min_spread", 0.001, 0.1),
    ("max_exposure", 0.1, 1.0),
];

/// Context the engine passes alongside the claim.
#[derive(Debug, Clone, Copy)]
pub struct VerifyContext<'a> {
    /// Oracle verdict, when the engine already has one for this claim.
    pub oracle: Option<&'a OracleVerdict>,
    /// Raw payload values must stay out of diagnostics.
    pub preserve_privacy: bool,
    /// Injected clock (Unix seconds); the verifier never reads wall time.
    pub now_unix: i64,
}

/// Deterministic rule engine over claims.
pub struct LocalVerifier {
    performance_threshold: f64,
    position_cap: f64,
    stale_trade_secs: i64,
    denied_protocols: Vec<String>,
}

impl LocalVerifier {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            performance_threshold: config.performance_threshold,
            position_cap: config.position_cap,
            stale_trade_secs: config.stale_trade_secs,
            denied_protocols: config
                .denied_protocols
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    /// Apply the rules for the claim's kind and fold violations into a
    /// risk score.
    pub fn verify(&self, claim: &ClaimPayload, ctx: &VerifyContext<'_>) -> LocalResult {
        let (violations, details) = match claim {
            ClaimPayload::TradingDecision(trade) => self.verify_trade(trade, ctx),
            ClaimPayload::PerformanceClaim(perf) => self.verify_performance(perf),
            ClaimPayload::DefiStrategy(strategy) => self.verify_defi(strategy, ctx),
            ClaimPayload::RiskCompliance(profile) => self.verify_risk_profile(profile),
            ClaimPayload::Generic(map) => self.verify_generic(map),
        };

        let violations = dedup_preserving_order(violations);
        let risk_score = violations
            .iter()
            .map(|tag| violation_weight(tag))
            .sum::<f64>()
            .min(1.0);
        let data_integrity = !violations.iter().any(|tag| is_integrity_violation(tag));

        LocalResult {
            valid: violations.is_empty(),
            confidence: (1.0 - risk_score).max(0.0),
            violations,
            risk_score,
            details,
            audit_trail: true,
            data_integrity,
        }
    }

    fn verify_trade(
        &self,
        trade: &TradeClaim,
        ctx: &VerifyContext<'_>,
    ) -> (Vec<String>, BTreeMap<String, Value>) {
        let mut violations = Vec::new();
        let mut details = BTreeMap::new();

        if trade.pair.as_deref().map_or(true, str::is_empty) {
            violations.push(tags::invalid_field("pair"));
        }
        if trade.action.is_none() {
            violations.push(tags::invalid_field("action"));
        }
        match trade.amount {
            Some(amount) if amount.is_finite() && amount > 0.0 => {}
            _ => violations.push(tags::invalid_field("amount")),
        }
        match trade.price {
            Some(price) if price.is_finite() && price > 0.0 => {}
            _ => violations.push(tags::invalid_field("price")),
        }

        match trade.timestamp {
            Some(ts) => {
                let age = (ctx.now_unix - ts).abs();
                if age > self.stale_trade_secs {
                    violations.push(tags::STALE_TRADE_DATA.to_string());
                }
                details.insert("trade_age_secs".to_string(), json!(age));
            }
            None => violations.push(tags::invalid_field("timestamp")),
        }

        if let (Some(amount), Some(price), Some(strategy)) =
            (trade.amount, trade.price, trade.strategy.as_ref())
        {
            if let Some(max_position) = strategy.max_position {
                let notional = amount * price;
                if notional > max_position {
                    violations.push(tags::RISK_LIMIT_EXCEEDED.to_string());
                }
                if !ctx.preserve_privacy {
                    details.insert("notional".to_string(), json!(notional));
                }
                details.insert(
                    "within_position_limit".to_string(),
                    json!(notional <= max_position),
                );
            }
        }

        if let (Some(strategy), Some(action)) = (trade.strategy.as_ref(), trade.action) {
            // DCA only accumulates; a sell leg contradicts the declared
            // strategy.
            if strategy.strategy_type.eq_ignore_ascii_case("dca")
                && action == TradeAction::Sell
            {
                violations.push(tags::STRATEGY_DEVIATION.to_string());
            }
        }

        if let Some(oracle) = ctx.oracle {
            details.insert(
                "oracle_classification".to_string(),
                json!(oracle.classification.as_str()),
            );
            if oracle.classification == OracleClassification::SuspectedManipulation {
                violations.push(tags::ORACLE_PRICE_MANIPULATION.to_string());
            }
        }

        details.insert("trade_valid".to_string(), json!(violations.is_empty()));
        (violations, details)
    }

    fn verify_performance(
        &self,
        perf: &PerformanceClaim,
    ) -> (Vec<String>, BTreeMap<String, Value>) {
        let mut violations = Vec::new();
        let mut details = BTreeMap::new();
        let mut roi_mismatch = false;
        let mut win_rate_mismatch = false;

        let claimed = match perf.claimed.as_ref() {
            Some(c) => c,
            None => {
                violations.push(tags::invalid_field("claimed"));
                details.insert("comparison_possible".to_string(), json!(false));
                return (violations, details);
            }
        };
        let actual = match perf.actual.as_ref() {
            Some(a) => a,
            None => {
                violations.push(tags::invalid_field("actual"));
                details.insert("comparison_possible".to_string(), json!(false));
                return (violations, details);
            }
        };

        match (claimed.roi, actual.roi) {
            (Some(claimed_roi), Some(actual_roi)) => {
                let deviation =
                    (claimed_roi - actual_roi).abs() / claimed_roi.abs().max(ROI_EPSILON);
                let within = deviation <= self.performance_threshold;
                if !within {
                    roi_mismatch = true;
                    violations.push(tags::PERFORMANCE_MISMATCH.to_string());
                }
                if claimed_roi > SUSPICIOUS_ROI {
                    violations.push(tags::SUSPICIOUS_PATTERN.to_string());
                }
                if claimed_roi > 0.0 && actual_roi < 0.0 {
                    violations.push(tags::SUSPICIOUS_PATTERN.to_string());
                }
                // Diagnostics stay aggregate: a relative deviation and a
                // verdict, never the measured figures themselves.
                details.insert("roi_deviation".to_string(), json!(deviation));
                details.insert("roi_within_threshold".to_string(), json!(within));
                details.insert(
                    "roi_sign_consistent".to_string(),
                    json!(!(claimed_roi > 0.0 && actual_roi < 0.0)),
                );
            }
            (claimed_roi, actual_roi) => {
                if claimed_roi.is_none() {
                    violations.push(tags::invalid_field("claimed_roi"));
                }
                if actual_roi.is_none() {
                    violations.push(tags::invalid_field("actual_roi"));
                }
            }
        }

        match (claimed.win_rate, actual.win_rate) {
            (Some(claimed_wr), Some(actual_wr)) => {
                let gap = (claimed_wr - actual_wr).abs();
                let within = gap <= WIN_RATE_TOLERANCE;
                if !within {
                    win_rate_mismatch = true;
                    violations.push(tags::WIN_RATE_MISMATCH.to_string());
                }
                if claimed_wr > SUSPICIOUS_WIN_RATE {
                    violations.push(tags::SUSPICIOUS_PATTERN.to_string());
                }
                details.insert("win_rate_gap".to_string(), json!(gap));
                details.insert("win_rate_within_threshold".to_string(), json!(within));
            }
            (claimed_wr, actual_wr) => {
                if claimed_wr.is_none() {
                    violations.push(tags::invalid_field("claimed_win_rate"));
                }
                if actual_wr.is_none() {
                    violations.push(tags::invalid_field("actual_win_rate"));
                }
            }
        }

        // Both headline figures inflated at once is a fabrication
        // signature, not two independent reporting errors.
        if roi_mismatch && win_rate_mismatch {
            violations.push(tags::SUSPICIOUS_PATTERN.to_string());
        }

        (violations, details)
    }

    fn verify_defi(
        &self,
        strategy: &StrategyClaim,
        ctx: &VerifyContext<'_>,
    ) -> (Vec<String>, BTreeMap<String, Value>) {
        let mut violations = Vec::new();
        let mut details = BTreeMap::new();

        let params: &[(&str, f64, f64)] = match strategy.strategy_type.as_deref() {
            Some("dca") => DCA_PARAMS,
            Some("grid") => GRID_PARAMS,
            Some("arbitrage") => ARBITRAGE_PARAMS,
            Some("lp") => &[],
            _ => {
                violations.push(tags::INVALID_STRATEGY_CONFIG.to_string());
                &[]
            }
        };

        let mut config_complete = true;
        let mut ranges_ok = true;
        for (field, lo, hi) in params {
            match strategy.params.get(*field).and_then(Value::as_f64) {
                Some(value) if (*lo..=*hi).contains(&value) => {}
                Some(_) => {
                    ranges_ok = false;
                    violations.push(tags::out_of_range(field));
                }
                None => {
                    config_complete = false;
                    violations.push(tags::INVALID_STRATEGY_CONFIG.to_string());
                }
            }
        }

        if let Some(slippage) = strategy.slippage_tolerance {
            if slippage > SLIPPAGE_BOUND {
                violations.push(tags::HIGH_SLIPPAGE_RISK.to_string());
            }
        }

        let denied: Vec<&String> = strategy
            .protocols
            .iter()
            .filter(|p| self.denied_protocols.contains(&p.to_lowercase()))
            .collect();
        if !denied.is_empty() {
            violations.push(tags::HIGH_RISK_PROTOCOL.to_string());
        }

        // Strategies execute against live prices, so a manipulated feed
        // invalidates the configuration just as it does a trade.
        if let Some(oracle) = ctx.oracle {
            details.insert(
                "oracle_classification".to_string(),
                json!(oracle.classification.as_str()),
            );
            if oracle.classification == OracleClassification::SuspectedManipulation {
                violations.push(tags::ORACLE_PRICE_MANIPULATION.to_string());
            }
        }

        if !ctx.preserve_privacy {
            if let Some(kind) = strategy.strategy_type.as_deref() {
                details.insert("strategy_type".to_string(), json!(kind));
            }
        }
        details.insert("config_complete".to_string(), json!(config_complete));
        details.insert("ranges_ok".to_string(), json!(ranges_ok));
        details.insert("protocols_ok".to_string(), json!(denied.is_empty()));
        (violations, details)
    }

    fn verify_risk_profile(
        &self,
        profile: &RiskProfileClaim,
    ) -> (Vec<String>, BTreeMap<String, Value>) {
        let mut violations = Vec::new();
        let mut details = BTreeMap::new();

        match profile.max_drawdown {
            Some(dd) if dd > DRAWDOWN_BOUND => {
                violations.push(tags::EXCESSIVE_DRAWDOWN_LIMIT.to_string())
            }
            Some(_) => {}
            None => violations.push(tags::invalid_field("max_drawdown")),
        }
        match profile.max_position_size {
            Some(size) if size > self.position_cap => {
                violations.push(tags::EXCESSIVE_POSITION_SIZE.to_string())
            }
            Some(_) => {}
            None => violations.push(tags::invalid_field("max_position_size")),
        }
        match profile.leverage {
            Some(leverage) if leverage > LEVERAGE_BOUND => {
                violations.push(tags::EXCESSIVE_LEVERAGE.to_string())
            }
            Some(_) => {}
            None => violations.push(tags::invalid_field("leverage")),
        }
        match profile.stop_loss {
            Some(stop) if stop > STOP_LOSS_BOUND => {
                violations.push(tags::WIDE_STOP_LOSS.to_string())
            }
            Some(_) => {}
            None => violations.push(tags::MISSING_STOP_LOSS.to_string()),
        }

        details.insert("limits_checked".to_string(), json!(4));
        details.insert("limits_ok".to_string(), json!(violations.is_empty()));
        (violations, details)
    }

    fn verify_generic(&self, map: &Map<String, Value>) -> (Vec<String>, BTreeMap<String, Value>) {
        let mut violations = Vec::new();
        let mut details = BTreeMap::new();

        if map.is_empty() {
            violations.push(tags::EMPTY_DATA.to_string());
        } else if map.values().any(has_suspicious_precision) {
            violations.push(tags::SUSPICIOUS_PRECISION.to_string());
        }

        details.insert("field_count".to_string(), json!(map.len()));
        (violations, details)
    }
}

/// Fixed per-violation contribution to the risk score.
fn violation_weight(tag: &str) -> f64 {
    match tag {
        tags::EMPTY_DATA => 1.0,
        tags::ORACLE_PRICE_MANIPULATION => 0.6,
        tags::RISK_LIMIT_EXCEEDED | tags::HIGH_RISK_PROTOCOL => 0.4,
        tags::PERFORMANCE_MISMATCH
        | tags::STALE_TRADE_DATA
        | tags::EXCESSIVE_LEVERAGE
        | tags::SUSPICIOUS_PRECISION => 0.3,
        tags::SUSPICIOUS_PATTERN
        | tags::STRATEGY_DEVIATION
        | tags::EXCESSIVE_DRAWDOWN_LIMIT
        | tags::EXCESSIVE_POSITION_SIZE => 0.25,
        tags::WIN_RATE_MISMATCH
        | tags::HIGH_SLIPPAGE_RISK
        | tags::MISSING_STOP_LOSS
        | tags::INVALID_STRATEGY_CONFIG => 0.2,
        tags::WIDE_STOP_LOSS => 0.15,
        _ if tag.starts_with("invalid_field_") => 0.2,
        _ if tag.ends_with("_out_of_range") => 0.2,
        _ => 0.15,
    }
}

/// Violations that mean the payload itself cannot be trusted.
fn is_integrity_violation(tag: &str) -> bool {
    tag.starts_with("invalid_field_")
        || tag == tags::INVALID_STRATEGY_CONFIG
        || tag == tags::EMPTY_DATA
        || tag == tags::SUSPICIOUS_PRECISION
}

fn dedup_preserving_order(violations: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    violations
        .into_iter()
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

/// Heuristic against fabricated numbers: flags floats carrying more than
/// eight fractional digits.
fn has_suspicious_precision(value: &Value) -> bool {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() != 0.0 => {
                let rendered = format!("{f}");
                match rendered.split_once('.') {
                    Some((_, frac)) => {
                        frac.trim_end_matches(|c: char| !c.is_ascii_digit()).len()
                            > MAX_FRACTIONAL_DIGITS
                            || rendered.contains('e')
                    }
                    None => rendered.contains('e'),
                }
            }
            _ => false,
        },
        Value::Array(items) => items.iter().any(has_suspicious_precision),
        Value::Object(map) => map.values().any(has_suspicious_precision),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PerformanceFigures, StrategyProfile};

    const NOW: i64 = 1_700_000_000;

    fn verifier() -> LocalVerifier {
        LocalVerifier::new(&EngineConfig {
            denied_protocols: vec!["shadowswap".to_string()],
            ..Default::default()
        })
    }

    fn ctx() -> VerifyContext<'static> {
        VerifyContext {
            oracle: None,
            preserve_privacy: true,
            now_unix: NOW,
        }
    }

    fn good_trade() -> TradeClaim {
        TradeClaim {
            pair: Some("BTC/USDT".to_string()),
            action: Some(TradeAction::Buy),
            amount: Some(0.1),
            price: Some(43_500.0),
            timestamp: Some(NOW - 5),
            strategy: None,
            bot_id: None,
        }
    }

    #[test]
    fn test_valid_trade_passes() {
        let result = verifier().verify(&ClaimPayload::TradingDecision(good_trade()), &ctx());
        assert!(result.valid);
        assert!(result.violations.is_empty());
        assert!((result.confidence - 1.0).abs() < 1e-9);
        assert!(result.data_integrity);
    }

    #[test]
    fn test_missing_trade_fields_are_named() {
        let result = verifier().verify(
            &ClaimPayload::TradingDecision(TradeClaim::default()),
            &ctx(),
        );
        assert!(!result.valid);
        for field in ["pair", "action", "amount", "price", "timestamp"] {
            assert!(
                result.violations.contains(&tags::invalid_field(field)),
                "missing {field} not reported"
            );
        }
        assert!(!result.data_integrity);
    }

    #[test]
    fn test_stale_trade_flagged() {
        let mut trade = good_trade();
        trade.timestamp = Some(NOW - 600);
        let result = verifier().verify(&ClaimPayload::TradingDecision(trade), &ctx());
        assert!(result
            .violations
            .contains(&tags::STALE_TRADE_DATA.to_string()));
        assert!(!result.valid);
    }

    #[test]
    fn test_position_limit_enforced() {
        let mut trade = good_trade();
        trade.amount = Some(1.0);
        trade.strategy = Some(StrategyProfile {
            strategy_type: "grid".to_string(),
            max_position: Some(10_000.0),
        });
        let result = verifier().verify(&ClaimPayload::TradingDecision(trade), &ctx());
        assert!(result
            .violations
            .contains(&tags::RISK_LIMIT_EXCEEDED.to_string()));
    }

    #[test]
    fn test_dca_sell_is_strategy_deviation() {
        let mut trade = good_trade();
        trade.action = Some(TradeAction::Sell);
        trade.strategy = Some(StrategyProfile {
            strategy_type: "dca".to_string(),
            max_position: None,
        });
        let result = verifier().verify(&ClaimPayload::TradingDecision(trade), &ctx());
        assert!(result
            .violations
            .contains(&tags::STRATEGY_DEVIATION.to_string()));
    }

    #[test]
    fn test_oracle_manipulation_reaches_trade_rules() {
        let verdict = OracleVerdict {
            consensus_price: Some(43_500.0),
            max_deviation: 0.2,
            participating_sources: vec!["alpha".to_string()],
            source_count: 3,
            health_score: 0.9,
            classification: OracleClassification::SuspectedManipulation,
            budget_exhausted: false,
        };
        let context = VerifyContext {
            oracle: Some(&verdict),
            preserve_privacy: true,
            now_unix: NOW,
        };
        let result = verifier().verify(&ClaimPayload::TradingDecision(good_trade()), &context);
        assert!(result
            .violations
            .contains(&tags::ORACLE_PRICE_MANIPULATION.to_string()));
        assert!(!result.valid);
    }

    fn exaggerated_claim() -> PerformanceClaim {
        PerformanceClaim {
            bot_id: None,
            claimed: Some(PerformanceFigures {
                roi: Some(0.25),
                win_rate: Some(0.90),
                sharpe: None,
                max_drawdown: None,
            }),
            actual: Some(PerformanceFigures {
                roi: Some(0.08),
                win_rate: Some(0.60),
                sharpe: None,
                max_drawdown: None,
            }),
        }
    }

    #[test]
    fn test_performance_exaggeration_flags_all_rules() {
        let result = verifier().verify(&ClaimPayload::PerformanceClaim(exaggerated_claim()), &ctx());
        assert!(result
            .violations
            .contains(&tags::PERFORMANCE_MISMATCH.to_string()));
        assert!(result
            .violations
            .contains(&tags::WIN_RATE_MISMATCH.to_string()));
        assert!(result
            .violations
            .contains(&tags::SUSPICIOUS_PATTERN.to_string()));
        assert!(!result.valid);
    }

    #[test]
    fn test_performance_details_never_leak_actuals() {
        let result = verifier().verify(&ClaimPayload::PerformanceClaim(exaggerated_claim()), &ctx());
        let rendered = serde_json::to_string(&result.details).unwrap();
        assert!(!rendered.contains("actual"));
        assert!(!rendered.contains("claimed"));
        // Raw measured figures must not appear anywhere.
        assert!(!rendered.contains("0.08"));
        assert!(!rendered.contains("0.25"));
        assert!(!rendered.contains("0.9"));
        // Aggregate deltas are allowed.
        assert!(result.details.contains_key("roi_deviation"));
    }

    #[test]
    fn test_positive_claim_negative_actual_is_suspicious() {
        let mut claim = exaggerated_claim();
        claim.actual.as_mut().unwrap().roi = Some(-0.05);
        let result = verifier().verify(&ClaimPayload::PerformanceClaim(claim), &ctx());
        assert!(result
            .violations
            .contains(&tags::SUSPICIOUS_PATTERN.to_string()));
    }

    #[test]
    fn test_absurd_claim_is_suspicious() {
        let mut claim = exaggerated_claim();
        claim.claimed.as_mut().unwrap().roi = Some(12.0);
        let result = verifier().verify(&ClaimPayload::PerformanceClaim(claim), &ctx());
        assert!(result
            .violations
            .contains(&tags::SUSPICIOUS_PATTERN.to_string()));
        // The duplicate tag collapses to one entry.
        let count = result
            .violations
            .iter()
            .filter(|v| *v == tags::SUSPICIOUS_PATTERN)
            .count();
        assert_eq!(count, 1);
    }

    fn dca_strategy() -> StrategyClaim {
        let mut params = Map::new();
        params.insert("take_profit".to_string(), json!(2.5));
        params.insert("safety_orders".to_string(), json!(5));
        params.insert("deviation".to_string(), json!(2.0));
        StrategyClaim {
            strategy_type: Some("dca".to_string()),
            pair: Some("ETH/USDT".to_string()),
            slippage_tolerance: Some(0.01),
            protocols: vec!["uniswap".to_string()],
            params,
        }
    }

    #[test]
    fn test_valid_dca_strategy_passes() {
        let result = verifier().verify(&ClaimPayload::DefiStrategy(dca_strategy()), &ctx());
        assert!(result.valid, "violations: {:?}", result.violations);
    }

    #[test]
    fn test_strategy_param_out_of_range() {
        let mut strategy = dca_strategy();
        strategy
            .params
            .insert("take_profit".to_string(), json!(45.0));
        let result = verifier().verify(&ClaimPayload::DefiStrategy(strategy), &ctx());
        assert!(result
            .violations
            .contains(&"take_profit_out_of_range".to_string()));
    }

    #[test]
    fn test_missing_strategy_param_is_invalid_config() {
        let mut strategy = dca_strategy();
        strategy.params.remove("deviation");
        let result = verifier().verify(&ClaimPayload::DefiStrategy(strategy), &ctx());
        assert!(result
            .violations
            .contains(&tags::INVALID_STRATEGY_CONFIG.to_string()));
    }

    #[test]
    fn test_unknown_strategy_type_rejected() {
        let mut strategy = dca_strategy();
        strategy.strategy_type = Some("martingale".to_string());
        let result = verifier().verify(&ClaimPayload::DefiStrategy(strategy), &ctx());
        assert!(result
            .violations
            .contains(&tags::INVALID_STRATEGY_CONFIG.to_string()));
    }

    #[test]
    fn test_manipulated_oracle_invalidates_strategy() {
        let verdict = OracleVerdict {
            consensus_price: Some(100.0),
            max_deviation: 1.0,
            participating_sources: vec!["alpha".to_string()],
            source_count: 3,
            health_score: 0.95,
            classification: OracleClassification::SuspectedManipulation,
            budget_exhausted: false,
        };
        let context = VerifyContext {
            oracle: Some(&verdict),
            preserve_privacy: true,
            now_unix: NOW,
        };
        let result = verifier().verify(&ClaimPayload::DefiStrategy(dca_strategy()), &context);
        assert!(result
            .violations
            .contains(&tags::ORACLE_PRICE_MANIPULATION.to_string()));
        assert!(!result.valid);
    }

    #[test]
    fn test_slippage_and_denied_protocol_flagged() {
        let mut strategy = dca_strategy();
        strategy.slippage_tolerance = Some(0.08);
        strategy.protocols.push("ShadowSwap".to_string());
        let result = verifier().verify(&ClaimPayload::DefiStrategy(strategy), &ctx());
        assert!(result
            .violations
            .contains(&tags::HIGH_SLIPPAGE_RISK.to_string()));
        assert!(result
            .violations
            .contains(&tags::HIGH_RISK_PROTOCOL.to_string()));
    }

    #[test]
    fn test_risk_profile_rules() {
        let profile = RiskProfileClaim {
            max_drawdown: Some(0.35),
            max_position_size: Some(50_000.0),
            leverage: Some(5.0),
            stop_loss: None,
        };
        let result = verifier().verify(&ClaimPayload::RiskCompliance(profile), &ctx());
        for tag in [
            tags::EXCESSIVE_DRAWDOWN_LIMIT,
            tags::EXCESSIVE_POSITION_SIZE,
            tags::EXCESSIVE_LEVERAGE,
            tags::MISSING_STOP_LOSS,
        ] {
            assert!(result.violations.contains(&tag.to_string()), "missing {tag}");
        }
    }

    #[test]
    fn test_wide_stop_loss() {
        let profile = RiskProfileClaim {
            max_drawdown: Some(0.1),
            max_position_size: Some(1_000.0),
            leverage: Some(2.0),
            stop_loss: Some(0.25),
        };
        let result = verifier().verify(&ClaimPayload::RiskCompliance(profile), &ctx());
        assert_eq!(result.violations, vec![tags::WIDE_STOP_LOSS.to_string()]);
    }

    #[test]
    fn test_generic_empty_payload() {
        let result = verifier().verify(&ClaimPayload::Generic(Map::new()), &ctx());
        assert_eq!(result.violations, vec![tags::EMPTY_DATA.to_string()]);
        assert!((result.risk_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_generic_suspicious_precision() {
        let mut map = Map::new();
        map.insert("roi".to_string(), json!(0.123456789012345));
        let result = verifier().verify(&ClaimPayload::Generic(map), &ctx());
        assert!(result
            .violations
            .contains(&tags::SUSPICIOUS_PRECISION.to_string()));
    }

    #[test]
    fn test_generic_reasonable_precision_passes() {
        let mut map = Map::new();
        map.insert("roi".to_string(), json!(0.1234));
        map.insert("label".to_string(), json!("fine"));
        let result = verifier().verify(&ClaimPayload::Generic(map), &ctx());
        assert!(result.valid);
    }

    #[test]
    fn test_verifier_is_deterministic() {
        let verifier = verifier();
        let claim = ClaimPayload::PerformanceClaim(exaggerated_claim());
        let first = verifier.verify(&claim, &ctx());
        let second = verifier.verify(&claim, &ctx());
        let a = serde_json::to_vec(&first).unwrap();
        let b = serde_json::to_vec(&second).unwrap();
        assert_eq!(a, b);
    }
}
