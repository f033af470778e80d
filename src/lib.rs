//! TrustWrapper verification gateway.
//!
//! Verifies claims produced by external AI trading systems (proposed
//! trades, reported performance, DeFi strategy configurations) within a
//! hard latency budget, and answers with a verdict, a confidence score, a
//! risk grade, and optionally a privacy-preserving attestation.
//!
//! The crate is transport-agnostic: construct a [`VerificationEngine`]
//! with a validated [`EngineConfig`] and whatever [`OracleSource`]
//! adapters the deployment uses, then call
//! [`VerificationEngine::verify`]. REST plumbing, auth, and persistence
//! belong to the embedding service.

pub mod attestation;
pub mod cache;
pub mod config;
pub mod engine;
pub mod fingerprint;
pub mod metrics;
pub mod models;
pub mod oracle;
pub mod verifier;

pub use attestation::{AttestationGenerator, DisclosureView, PrivacyLevel};
pub use cache::{CacheOutcome, CacheStats, ComputeError, ComputeOptions, VerificationCache};
pub use config::{EngineConfig, SourceConfig};
pub use engine::{EngineHealth, VerificationEngine};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use models::{
    ClaimKind, ClaimPayload, LocalResult, OracleClassification, OracleVerdict, PerformanceClaim,
    PerformanceFigures, PriceQuote, RiskGrade, RiskProfileClaim, StrategyClaim, StrategyProfile,
    TradeAction, TradeClaim, VerificationRequest, VerificationResult, VerificationStatus,
};
pub use oracle::source::{HttpJsonSource, OracleSource, SourceState, SourceStatus};
pub use oracle::OracleRiskManager;
pub use verifier::{LocalVerifier, VerifyContext};
