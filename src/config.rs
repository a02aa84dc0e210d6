// Engine configuration. Every tunable the scoring pipeline consults lives
// here with its production default; construction validates the invariants
// the fuser depends on (ascending thresholds, positive weights).

use serde::{Deserialize, Serialize};

use crate::error::VigilError;

/// Risk-level thresholds, ascending in [0, 1]. A fused score below `low`
/// is minimal; at or above `critical` it is critical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: 0.3,
            medium: 0.5,
            high: 0.7,
            critical: 0.9,
        }
    }
}

/// Per-signal fusion weights. They need not sum to 1: the fuser normalizes
/// by the weight sum over the signals present for a given request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalWeights {
    pub behavior: f64,
    pub patterns: f64,
    pub rate_limit: f64,
    pub fingerprint: f64,
    pub reputation: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            behavior: 0.25,
            patterns: 0.25,
            rate_limit: 0.20,
            fingerprint: 0.15,
            reputation: 0.15,
        }
    }
}

/// Upward clamps applied after linear fusion. Each is the minimum fused
/// score once the corresponding condition holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FloorRules {
    /// Rate limiter denied the request.
    pub rate_denied: f64,
    /// A known attack class matched.
    pub attack: f64,
    /// The fingerprinter classified the client as a bot.
    pub bot: f64,
    /// The session tracker flagged impossible travel.
    pub impossible_travel: f64,
}

impl Default for FloorRules {
    fn default() -> Self {
        Self {
            rate_denied: 0.5,
            attack: 0.6,
            bot: 0.7,
            impossible_travel: 0.6,
        }
    }
}

/// Store capacity and sweep cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum entry count before approximate-LRU eviction on insert.
    pub capacity: usize,
    /// Default TTL applied when `set` is called without one. `None`
    /// means entries without an explicit TTL never expire.
    pub default_ttl_ms: Option<u64>,
    pub cleanup_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            default_ttl_ms: None,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Sliding-window rate limiter tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window before penalties and risk shrink.
    pub default_limit: u32,
    pub window_ms: u64,
    /// Burst ceiling as a multiple of the effective limit.
    pub burst_multiplier: f64,
    /// Multiplicative decay applied to the penalty on compliant traffic.
    pub penalty_decay: f64,
    /// Fraction of the limit under which traffic counts as compliant and
    /// earns penalty decay.
    pub reward_rate: f64,
    pub max_penalty: f64,
    /// Enables penalty reward decay and per-identity adaptive limits.
    pub adaptive: bool,
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: 30,
            window_ms: 60_000,
            burst_multiplier: 2.0,
            penalty_decay: 0.9,
            reward_rate: 0.5,
            max_penalty: 10.0,
            adaptive: true,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Behavior analyzer tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Below this many events the analyzer reports `reliable = false`.
    pub min_samples: usize,
    /// Z-score above which a feature counts as anomalous.
    pub anomaly_threshold: f64,
    /// Feature snapshots required before a baseline is computed.
    pub baseline_min_samples: usize,
    pub max_feature_history: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            anomaly_threshold: 2.5,
            baseline_min_samples: 5,
            max_feature_history: 100,
        }
    }
}

/// Pattern detector tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Occurrences required before a repeated sub-sequence is significant.
    pub significance: usize,
    pub max_sequence_len: usize,
    /// Sequence patterns kept per analysis, by descending risk.
    pub max_patterns: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            significance: 3,
            max_sequence_len: 10,
            max_patterns: 10,
        }
    }
}

/// Top-level engine configuration accepted at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub thresholds: Thresholds,
    pub weights: SignalWeights,
    pub floors: FloorRules,
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub behavior: BehaviorConfig,
    pub patterns: PatternConfig,
    /// Per-identity event history bound.
    pub max_events: usize,
    pub ban_duration_ms: u64,
    pub block_duration_ms: u64,
    pub throttle_factor: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            weights: SignalWeights::default(),
            floors: FloorRules::default(),
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            behavior: BehaviorConfig::default(),
            patterns: PatternConfig::default(),
            max_events: 1000,
            ban_duration_ms: 24 * 60 * 60 * 1000,
            block_duration_ms: 60 * 60 * 1000,
            throttle_factor: 0.5,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), VigilError> {
        let t = &self.thresholds;
        let ascending = t.low < t.medium && t.medium < t.high && t.high < t.critical;
        let bounded = t.low >= 0.0 && t.critical <= 1.0;
        if !ascending || !bounded {
            return Err(VigilError::InvalidConfig(format!(
                "thresholds must ascend within [0,1]: {:.2}/{:.2}/{:.2}/{:.2}",
                t.low, t.medium, t.high, t.critical
            )));
        }

        let w = &self.weights;
        let weights = [w.behavior, w.patterns, w.rate_limit, w.fingerprint, w.reputation];
        if weights.iter().any(|&x| x < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(VigilError::InvalidConfig(
                "signal weights must be non-negative with a positive sum".into(),
            ));
        }

        if self.rate_limit.default_limit == 0 || self.rate_limit.window_ms == 0 {
            return Err(VigilError::InvalidConfig(
                "rate limit and window must be positive".into(),
            ));
        }
        if self.rate_limit.burst_multiplier < 1.0 {
            return Err(VigilError::InvalidConfig(
                "burst multiplier must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rate_limit.penalty_decay) {
            return Err(VigilError::InvalidConfig(
                "penalty decay must lie in [0,1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rate_limit.reward_rate) {
            return Err(VigilError::InvalidConfig(
                "reward rate must lie in [0,1]".into(),
            ));
        }
        if self.store.capacity == 0 {
            return Err(VigilError::InvalidConfig("store capacity must be positive".into()));
        }
        if self.max_events == 0 {
            return Err(VigilError::InvalidConfig("event history bound must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().expect("default config must validate");
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let mut config = EngineConfig::default();
        config.thresholds.high = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_weights() {
        let mut config = EngineConfig::default();
        config.weights = SignalWeights {
            behavior: 0.0,
            patterns: 0.0,
            rate_limit: 0.0,
            fingerprint: 0.0,
            reputation: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_window() {
        let mut config = EngineConfig::default();
        config.rate_limit.window_ms = 0;
        assert!(config.validate().is_err());
    }
}
