// Decaying per-identity reputation derived from prior decisions. The
// score blends an EWMA of recent decision risk scores with the recent
// block ratio; both are computed over the last 20 history entries, so a
// bad burst decays purely by windowing once clean traffic resumes. The
// cumulative request counters are monotone and never reset by decay.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::stats::{clamp01, ewma};
use crate::store::MemoryStore;

const EWMA_ALPHA: f64 = 0.3;
const SCORE_WINDOW: usize = 20;
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationSample {
    pub timestamp_ms: u64,
    pub risk_score: f64,
    /// Mitigation the decision carried ("allow", "challenge", ...).
    pub action: String,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub score: f64,
    pub history: Vec<ReputationSample>,
    pub first_seen: u64,
    pub total_requests: u64,
    pub blocked_requests: u64,
}

pub struct ReputationTracker {
    store: Arc<MemoryStore>,
}

impl ReputationTracker {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Current reputation score, or `None` for an identity with no
    /// decision history (the fuser drops the signal entirely).
    pub fn score(&self, identity: &str) -> Option<f64> {
        self.record(identity).map(|r| r.score)
    }

    pub fn record(&self, identity: &str) -> Option<ReputationRecord> {
        self.store.get_as(&reputation_key(identity))
    }

    /// Fold one decision into the identity's reputation and return the
    /// updated score. The record is mutated under the store's per-key
    /// lock so concurrent decisions for one identity all land.
    pub fn update(
        &self,
        identity: &str,
        risk_score: f64,
        action: &str,
        allowed: bool,
        now: u64,
    ) -> f64 {
        let key = reputation_key(identity);
        if !self.store.has(&key) {
            self.store.set_obj(
                &key,
                &ReputationRecord {
                    score: 0.0,
                    history: Vec::new(),
                    first_seen: now,
                    total_requests: 0,
                    blocked_requests: 0,
                },
                None,
            );
        }

        let mut score = 0.0;
        self.store.update_as::<ReputationRecord, _>(&key, |record| {
            record.history.push(ReputationSample {
                timestamp_ms: now,
                risk_score: clamp01(risk_score),
                action: action.to_string(),
                blocked: !allowed,
            });
            while record.history.len() > HISTORY_LIMIT {
                record.history.remove(0);
            }

            record.total_requests += 1;
            if !allowed {
                record.blocked_requests += 1;
            }
            debug_assert!(record.blocked_requests <= record.total_requests);

            let window_start = record.history.len().saturating_sub(SCORE_WINDOW);
            let window = &record.history[window_start..];
            let scores: Vec<f64> = window.iter().map(|s| s.risk_score).collect();
            let block_ratio =
                window.iter().filter(|s| s.blocked).count() as f64 / window.len() as f64;

            record.score = clamp01(0.7 * ewma(&scores, EWMA_ALPHA) + 0.3 * block_ratio);
            score = record.score;
        });
        score
    }

    pub fn reset(&self, identity: &str) {
        self.store.delete(&reputation_key(identity));
    }
}

fn reputation_key(identity: &str) -> String {
    format!("reputation:{identity}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn tracker() -> ReputationTracker {
        ReputationTracker::new(Arc::new(MemoryStore::new(StoreConfig::default())))
    }

    #[test]
    fn test_unknown_identity_has_no_score() {
        assert_eq!(tracker().score("nobody"), None);
    }

    #[test]
    fn test_score_bounded_and_counters_consistent() {
        let tracker = tracker();
        for i in 0..150u64 {
            let score = tracker.update("u", 0.95, "block", false, 1_000 + i);
            assert!((0.0..=1.0).contains(&score));
        }
        let record = tracker.record("u").unwrap();
        assert_eq!(record.total_requests, 150);
        assert_eq!(record.blocked_requests, 150);
        assert!(record.blocked_requests <= record.total_requests);
        assert_eq!(record.history.len(), HISTORY_LIMIT);
        assert!(record.score > 0.8);
    }

    #[test]
    fn test_recovery_after_blocked_burst() {
        let tracker = tracker();
        for i in 0..20u64 {
            tracker.update("u", 0.9, "block", false, 1_000 + i);
        }
        assert!(tracker.score("u").unwrap() > 0.7);

        // ~30 clean low-risk requests wash the burst out of the window.
        let mut last = 1.0;
        for i in 0..30u64 {
            last = tracker.update("u", 0.05, "allow", true, 10_000 + i);
        }
        assert!(last < 0.1, "reputation should recover, got {last}");

        // Cumulative counters are unaffected by the decay.
        let record = tracker.record("u").unwrap();
        assert_eq!(record.total_requests, 50);
        assert_eq!(record.blocked_requests, 20);
    }

    #[test]
    fn test_block_ratio_raises_score() {
        let tracker = tracker();
        for i in 0..10u64 {
            tracker.update("mild", 0.4, "allow", true, 1_000 + i);
        }
        let allowed_only = tracker.score("mild").unwrap();

        for i in 0..10u64 {
            tracker.update("rough", 0.4, "throttle", false, 1_000 + i);
        }
        let with_blocks = tracker.score("rough").unwrap();
        assert!(with_blocks > allowed_only);
    }

    #[test]
    fn test_reset_removes_record() {
        let tracker = tracker();
        tracker.update("gone", 0.5, "allow", true, 1_000);
        assert!(tracker.score("gone").is_some());
        tracker.reset("gone");
        assert!(tracker.score("gone").is_none());
    }
}
