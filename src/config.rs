//! Engine configuration.
//!
//! A single validated object consumed at construction time. Invalid values
//! abort startup; nothing is re-read after the engine is built.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the verification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard deadline per request in milliseconds.
    #[serde(default = "default_max_total_ms")]
    pub max_total_ms: u64,

    /// Soft latency target for the local rule engine in milliseconds.
    #[serde(default = "default_local_target_ms")]
    pub local_target_ms: u64,

    /// Maximum number of cache entries.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Default TTL for cached verification results in milliseconds.
    #[serde(default = "default_result_ttl_ms")]
    pub result_ttl_ms: u64,

    /// TTL for individual cached price quotes in milliseconds.
    #[serde(default = "default_quote_ttl_ms")]
    pub quote_ttl_ms: u64,

    /// Minimum successful oracle fetches required for consensus.
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,

    /// Deviation classification thresholds.
    #[serde(default)]
    pub thresholds: DeviationThresholds,

    /// Allowed relative ROI deviation before a performance claim is flagged.
    #[serde(default = "default_performance_threshold")]
    pub performance_threshold: f64,

    /// Absolute cap on a declared `max_position_size`.
    #[serde(default = "default_position_cap")]
    pub position_cap: f64,

    /// Trade timestamps older than this (seconds) are stale.
    #[serde(default = "default_stale_trade_secs")]
    pub stale_trade_secs: i64,

    /// Quotes whose provider timestamp lags local receipt by more than this
    /// (seconds) are rejected at ingestion.
    #[serde(default = "default_staleness_limit_secs")]
    pub staleness_limit_secs: i64,

    /// Coarse time window for request fingerprinting (seconds).
    #[serde(default = "default_fingerprint_window_secs")]
    pub fingerprint_window_secs: u64,

    /// Compliance frameworks evaluated on every request.
    #[serde(default)]
    pub compliance: ComplianceConfig,

    /// DeFi protocols refused outright.
    #[serde(default)]
    pub denied_protocols: Vec<String>,

    /// Configured oracle sources.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Admission cap; requests beyond it fail fast as overloaded.
    #[serde(default = "default_max_inflight")]
    pub max_inflight_requests: usize,
}

fn default_max_total_ms() -> u64 {
    50
}
fn default_local_target_ms() -> u64 {
    10
}
fn default_cache_capacity() -> usize {
    10_000
}
fn default_result_ttl_ms() -> u64 {
    300_000
}
fn default_quote_ttl_ms() -> u64 {
    60_000
}
fn default_min_sources() -> usize {
    2
}
fn default_performance_threshold() -> f64 {
    0.05
}
fn default_position_cap() -> f64 {
    10_000.0
}
fn default_stale_trade_secs() -> i64 {
    300
}
fn default_staleness_limit_secs() -> i64 {
    60
}
fn default_fingerprint_window_secs() -> u64 {
    60
}
fn default_max_inflight() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_total_ms: default_max_total_ms(),
            local_target_ms: default_local_target_ms(),
            cache_capacity: default_cache_capacity(),
            result_ttl_ms: default_result_ttl_ms(),
            quote_ttl_ms: default_quote_ttl_ms(),
            min_sources: default_min_sources(),
            thresholds: DeviationThresholds::default(),
            performance_threshold: default_performance_threshold(),
            position_cap: default_position_cap(),
            stale_trade_secs: default_stale_trade_secs(),
            staleness_limit_secs: default_staleness_limit_secs(),
            fingerprint_window_secs: default_fingerprint_window_secs(),
            compliance: ComplianceConfig::default(),
            denied_protocols: Vec::new(),
            sources: Vec::new(),
            max_inflight_requests: default_max_inflight(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            bail!("cache_capacity must be positive");
        }
        if self.result_ttl_ms == 0 || self.quote_ttl_ms == 0 {
            bail!("result_ttl_ms and quote_ttl_ms must be positive");
        }
        if self.min_sources == 0 {
            bail!("min_sources must be positive");
        }
        if self.min_sources == 1 {
            tracing::warn!("min_sources = 1 accepts single-source consensus");
        }
        self.thresholds.validate()?;
        if self.performance_threshold <= 0.0 {
            bail!("performance_threshold must be positive");
        }
        if self.position_cap <= 0.0 {
            bail!("position_cap must be positive");
        }
        if self.stale_trade_secs <= 0 || self.staleness_limit_secs <= 0 {
            bail!("staleness windows must be positive");
        }
        if self.fingerprint_window_secs == 0 {
            bail!("fingerprint_window_secs must be positive");
        }
        if self.max_inflight_requests == 0 {
            bail!("max_inflight_requests must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.id.as_str()) {
                bail!("duplicate oracle source id: {}", source.id);
            }
        }
        Ok(())
    }

    pub fn max_total(&self) -> Duration {
        Duration::from_millis(self.max_total_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_millis(self.result_ttl_ms)
    }

    pub fn quote_ttl(&self) -> Duration {
        Duration::from_millis(self.quote_ttl_ms)
    }
}

/// Consensus deviation thresholds, tightest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviationThresholds {
    /// Deviations at or below this are normal market noise.
    #[serde(default = "default_dev_normal")]
    pub dev_normal: f64,
    /// Deviations at or below this are volatile but plausible.
    #[serde(default = "default_dev_warn")]
    pub dev_warn: f64,
    /// Deviations above this suggest manipulation.
    #[serde(default = "default_dev_manip")]
    pub dev_manip: f64,
}

fn default_dev_normal() -> f64 {
    0.005
}
fn default_dev_warn() -> f64 {
    0.02
}
fn default_dev_manip() -> f64 {
    0.10
}

impl Default for DeviationThresholds {
    fn default() -> Self {
        Self {
            dev_normal: default_dev_normal(),
            dev_warn: default_dev_warn(),
            dev_manip: default_dev_manip(),
        }
    }
}

impl DeviationThresholds {
    fn validate(&self) -> Result<()> {
        if self.dev_normal <= 0.0 {
            bail!("dev_normal must be positive");
        }
        if !(self.dev_normal < self.dev_warn && self.dev_warn < self.dev_manip) {
            bail!("deviation thresholds must satisfy dev_normal < dev_warn < dev_manip");
        }
        Ok(())
    }
}

/// Compliance frameworks the operator requires on every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplianceConfig {
    #[serde(default)]
    pub required: Vec<String>,
}

/// One configured oracle source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// Relative weight in consensus, in (0, 1].
    pub weight: f64,
    /// Operator-declared reliability, in (0, 1]; used as the fallback quote
    /// confidence for feeds that do not report one.
    pub declared_reliability: f64,
    #[serde(default = "default_source_timeout_ms")]
    pub per_source_timeout_ms: u64,
    /// Endpoint URL for the bundled HTTP adapter; adapters constructed in
    /// code may ignore it.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_source_timeout_ms() -> u64 {
    30
}

impl SourceConfig {
    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("oracle source id must not be empty");
        }
        if !(self.weight > 0.0 && self.weight <= 1.0) {
            bail!("source {} weight must be in (0, 1]", self.id);
        }
        if !(self.declared_reliability > 0.0 && self.declared_reliability <= 1.0) {
            bail!("source {} declared_reliability must be in (0, 1]", self.id);
        }
        if self.per_source_timeout_ms == 0 {
            bail!("source {} per_source_timeout_ms must be positive", self.id);
        }
        Ok(())
    }

    pub fn per_source_timeout(&self) -> Duration {
        Duration::from_millis(self.per_source_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source(id: &str) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            weight: 0.5,
            declared_reliability: 0.95,
            per_source_timeout_ms: 30,
            endpoint: None,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_total_ms, 50);
        assert_eq!(config.min_sources, 2);
        assert_eq!(config.cache_capacity, 10_000);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = EngineConfig {
            cache_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_monotonic_thresholds() {
        let config = EngineConfig {
            thresholds: DeviationThresholds {
                dev_normal: 0.05,
                dev_warn: 0.02,
                dev_manip: 0.10,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_source_ids() {
        let config = EngineConfig {
            sources: vec![source("chainlink"), source("chainlink")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_source_weight() {
        let mut bad = source("chainlink");
        bad.weight = 1.5;
        let config = EngineConfig {
            sources: vec![bad],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig {
            sources: vec![source("chainlink"), source("band_protocol")],
            ..Default::default()
        };
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.sources.len(), 2);
        assert_eq!(parsed.max_total_ms, config.max_total_ms);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
max_total_ms = 40
min_sources = 3

[[sources]]
id = "chainlink"
weight = 0.6
declared_reliability = 0.98

[[sources]]
id = "band_protocol"
weight = 0.4
declared_reliability = 0.96
"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_total_ms, 40);
        assert_eq!(config.min_sources, 3);
        assert_eq!(config.sources[0].per_source_timeout_ms, 30);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_capacity = 0").unwrap();
        assert!(EngineConfig::load(file.path()).is_err());
    }
}
