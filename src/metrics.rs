use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// Engine counter snapshot. Counters are monotone; the mean risk score is
/// a running average over every evaluation since start.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineStats {
    pub total: u64,
    pub allowed: u64,
    pub challenged: u64,
    pub throttled: u64,
    pub blocked: u64,
    pub banned: u64,
    pub mean_risk_score: f64,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct Counters {
    total: u64,
    allowed: u64,
    challenged: u64,
    throttled: u64,
    blocked: u64,
    banned: u64,
    score_sum: f64,
}

/// Metrics registry
#[derive(Clone)]
pub struct MetricsCollector {
    counters: Arc<RwLock<Counters>>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(Counters::default())),
            start_time: Instant::now(),
        }
    }

    pub fn record(&self, action: crate::engine::ActionKind, risk_score: f64) {
        let mut c = self.counters.write();
        c.total += 1;
        c.score_sum += risk_score;
        match action {
            crate::engine::ActionKind::Allow => c.allowed += 1,
            crate::engine::ActionKind::Challenge => c.challenged += 1,
            crate::engine::ActionKind::Throttle => c.throttled += 1,
            crate::engine::ActionKind::Block => c.blocked += 1,
            crate::engine::ActionKind::Ban => c.banned += 1,
        }
    }

    pub fn snapshot(&self) -> EngineStats {
        let c = self.counters.read();
        EngineStats {
            total: c.total,
            allowed: c.allowed,
            challenged: c.challenged,
            throttled: c.throttled,
            blocked: c.blocked,
            banned: c.banned,
            mean_risk_score: if c.total == 0 { 0.0 } else { c.score_sum / c.total as f64 },
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ActionKind;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record(ActionKind::Allow, 0.1);
        metrics.record(ActionKind::Block, 0.9);
        metrics.record(ActionKind::Challenge, 0.4);

        let stats = metrics.snapshot();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.challenged, 1);
        assert!((stats.mean_risk_score - 0.4666).abs() < 1e-3);
    }

    #[test]
    fn test_empty_snapshot() {
        let stats = MetricsCollector::new().snapshot();
        assert_eq!(stats, EngineStats { uptime_secs: stats.uptime_secs, ..Default::default() });
    }
}
