// Sliding-window rate limiting with adaptive penalties. Buckets live in
// the shared store (one per identity+endpoint) so resets and substitution
// of a networked backend cover them too; the penalty and per-identity
// limit maps are process-local and updated atomically via their shards.
//
// Besides the primary sliding-window log, the token-bucket, leaky-bucket
// and weighted-window primitives are exposed for callers that want a
// different admission shape. The orchestrator only uses `check`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;
use crate::now_ms;
use crate::store::MemoryStore;

const PENALTY_EPSILON: f64 = 0.01;
const USAGE_WINDOW: usize = 100;
const ADAPTIVE_MIN_SAMPLES: usize = 50;

/// Sliding-window log for one (identity, endpoint) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bucket {
    requests: Vec<u64>,
    created_at: u64,
    last_access: u64,
    violations: u32,
}

impl Bucket {
    fn new(now: u64) -> Self {
        Self {
            requests: Vec::new(),
            created_at: now,
            last_access: now,
            violations: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RateExceeded,
    BurstExceeded,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::RateExceeded => write!(f, "rate_exceeded"),
            DenyReason::BurstExceeded => write!(f, "burst_exceeded"),
        }
    }
}

/// Outcome of a sliding-window check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub current_count: u32,
    pub reset_in_ms: u64,
    pub severity: Option<f64>,
    pub reason: Option<DenyReason>,
    pub retry_after_ms: Option<u64>,
}

/// Per-call options. `None` fields fall back to configuration; `now_ms`
/// lets tests and replays drive the clock.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub endpoint: Option<String>,
    pub limit: Option<u32>,
    pub window_ms: Option<u64>,
    pub risk_score: Option<f64>,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDecision {
    pub allowed: bool,
    pub tokens_remaining: f64,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakyDecision {
    pub allowed: bool,
    pub level: f64,
    pub capacity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenState {
    tokens: f64,
    last_refill: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeakyState {
    level: f64,
    last_leak: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<MemoryStore>,
    /// Penalty multiplier per identity, in [1, max_penalty].
    penalties: Arc<DashMap<String, f64>>,
    /// Adaptively recomputed per-identity limits.
    user_limits: Arc<DashMap<String, u32>>,
    /// Recent usage ratios per identity, feeding adaptive recomputation.
    usage: Arc<DashMap<String, VecDeque<f64>>>,
    config: RateLimitConfig,
    shutdown: Arc<AtomicBool>,
    sweeper_running: Arc<AtomicBool>,
}

impl RateLimiter {
    pub fn new(store: Arc<MemoryStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            penalties: Arc::new(DashMap::new()),
            user_limits: Arc::new(DashMap::new()),
            usage: Arc::new(DashMap::new()),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            sweeper_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sliding-window admission check for `id`.
    ///
    /// The effective limit is `floor(base / penalty)`, shrunk by
    /// `1 - 0.7 * risk` when a risk score is supplied, floored at 1.
    /// Denials raise the penalty proportionally to how deep into the
    /// burst range the caller is; staying under half the limit decays it.
    pub fn check(&self, id: &str, opts: &CheckOptions) -> RateDecision {
        let now = opts.now_ms.unwrap_or_else(now_ms);
        let window = opts.window_ms.unwrap_or(self.config.window_ms);
        let endpoint = opts.endpoint.as_deref().unwrap_or("global");
        let key = bucket_key(id, endpoint);

        // Read-modify-write under the store's per-key lock so concurrent
        // checks for one identity never lose admissions.
        if !self.store.has(&key) {
            self.store.set_obj(&key, &Bucket::new(now), None);
        }
        let mut decision = None;
        let updated = self.store.update_as::<Bucket, _>(&key, |bucket| {
            decision = Some(self.check_bucket(id, opts, bucket, now, window));
        });
        if let (true, Some(decision)) = (updated, decision) {
            return decision;
        }

        // The entry was evicted between the existence check and the
        // update; run against a fresh bucket and store it.
        let mut bucket = Bucket::new(now);
        let decision = self.check_bucket(id, opts, &mut bucket, now, window);
        self.store.set_obj(&key, &bucket, None);
        decision
    }

    fn check_bucket(
        &self,
        id: &str,
        opts: &CheckOptions,
        bucket: &mut Bucket,
        now: u64,
        window: u64,
    ) -> RateDecision {
        let horizon = now.saturating_sub(window);
        bucket.requests.retain(|&t| t > horizon);

        let penalty = self.penalty(id);
        let base = opts
            .limit
            .unwrap_or_else(|| self.user_limit(id));
        let mut effective = (base as f64 / penalty).floor();
        if let Some(risk) = opts.risk_score {
            if risk > 0.0 && risk <= 1.0 {
                effective *= 1.0 - 0.7 * risk;
            }
        }
        let limit = (effective.floor() as u32).max(1);
        let burst_limit = ((limit as f64) * self.config.burst_multiplier).floor() as u32;
        let current = bucket.requests.len() as u32;

        // Usage sample for adaptive recomputation; explicit limits opt
        // the caller out of adaptation.
        if self.config.adaptive && opts.limit.is_none() {
            self.record_usage(id, current as f64 / limit as f64, opts.risk_score.unwrap_or(0.0));
        }

        if current >= limit {
            let severity = if current >= burst_limit {
                1.0
            } else {
                let span = burst_limit.saturating_sub(limit).max(1) as f64;
                (((current + 1).saturating_sub(limit)) as f64 / span).min(1.0)
            };
            let raised = (penalty * (1.0 + 0.5 * severity)).min(self.config.max_penalty);
            if self.config.adaptive {
                self.penalties.insert(id.to_string(), raised);
            }
            bucket.violations += 1;
            bucket.last_access = now;
            let reset_in_ms = reset_in(bucket, window, now);

            let reason = if current >= burst_limit {
                DenyReason::BurstExceeded
            } else {
                DenyReason::RateExceeded
            };
            trace!("rate limit denied for {id}: {current}/{limit} ({reason})");
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                current_count: current,
                reset_in_ms,
                severity: Some(severity),
                reason: Some(reason),
                retry_after_ms: Some(((window as f64 / 10.0) * severity * raised).ceil() as u64),
            };
        }

        bucket.requests.push(now);
        bucket.last_access = now;
        let count = bucket.requests.len() as u32;

        // Reward compliant traffic: decay the penalty toward 1 and drop
        // the entry once it is effectively neutral.
        if self.config.adaptive && (count as f64) < limit as f64 * self.config.reward_rate {
            if let Some(mut entry) = self.penalties.get_mut(id) {
                *entry = (*entry * self.config.penalty_decay).max(1.0);
                let neutral = *entry - 1.0 < PENALTY_EPSILON;
                drop(entry);
                if neutral {
                    self.penalties.remove(id);
                }
            }
        }

        let reset_in_ms = reset_in(bucket, window, now);

        RateDecision {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(count),
            current_count: count,
            reset_in_ms,
            severity: None,
            reason: None,
            retry_after_ms: None,
        }
    }

    /// Token-bucket admission: capacity `limit`, refilled continuously at
    /// `limit / window` tokens per second.
    pub fn check_token_bucket(
        &self,
        id: &str,
        limit: u32,
        window_ms: u64,
        cost: f64,
        now_override: Option<u64>,
    ) -> TokenDecision {
        let now = now_override.unwrap_or_else(now_ms);
        let key = format!("ratelimit:token:{id}");
        if !self.store.has(&key) {
            self.store.set_obj(
                &key,
                &TokenState {
                    tokens: limit as f64,
                    last_refill: now,
                },
                None,
            );
        }

        let rate_per_ms = limit as f64 / window_ms as f64;
        let mut decision = TokenDecision {
            allowed: true,
            tokens_remaining: limit as f64 - cost,
            retry_after_ms: None,
        };
        self.store.update_as::<TokenState, _>(&key, |state| {
            let elapsed = now.saturating_sub(state.last_refill) as f64;
            state.tokens = (state.tokens + elapsed * rate_per_ms).min(limit as f64);
            state.last_refill = now;

            decision = if state.tokens >= cost {
                state.tokens -= cost;
                TokenDecision {
                    allowed: true,
                    tokens_remaining: state.tokens,
                    retry_after_ms: None,
                }
            } else {
                let deficit = cost - state.tokens;
                TokenDecision {
                    allowed: false,
                    tokens_remaining: state.tokens,
                    retry_after_ms: Some((deficit / rate_per_ms).ceil() as u64),
                }
            };
        });
        decision
    }

    /// Leaky-bucket admission: the bucket drains at `leak_rate_per_sec`
    /// and a request adds `amount` if it fits under `capacity`.
    pub fn check_leaky_bucket(
        &self,
        id: &str,
        capacity: f64,
        leak_rate_per_sec: f64,
        amount: f64,
        now_override: Option<u64>,
    ) -> LeakyDecision {
        let now = now_override.unwrap_or_else(now_ms);
        let key = format!("ratelimit:leaky:{id}");
        if !self.store.has(&key) {
            self.store.set_obj(
                &key,
                &LeakyState {
                    level: 0.0,
                    last_leak: now,
                },
                None,
            );
        }

        let mut decision = LeakyDecision {
            allowed: amount <= capacity,
            level: amount.min(capacity),
            capacity,
        };
        self.store.update_as::<LeakyState, _>(&key, |state| {
            let elapsed_s = now.saturating_sub(state.last_leak) as f64 / 1000.0;
            state.level = (state.level - elapsed_s * leak_rate_per_sec).max(0.0);
            state.last_leak = now;

            let allowed = state.level + amount <= capacity;
            if allowed {
                state.level += amount;
            }
            decision = LeakyDecision {
                allowed,
                level: state.level,
                capacity,
            };
        });
        decision
    }

    /// Sliding-window variant that weighs each in-window timestamp by its
    /// freshness (`1 - age/window`), so old requests count fractionally.
    pub fn check_weighted_window(&self, id: &str, opts: &CheckOptions) -> RateDecision {
        let now = opts.now_ms.unwrap_or_else(now_ms);
        let window = opts.window_ms.unwrap_or(self.config.window_ms);
        let endpoint = opts.endpoint.as_deref().unwrap_or("global");
        let key = format!("ratelimit:weighted:{id}:{endpoint}");
        let limit = opts.limit.unwrap_or(self.config.default_limit);

        if !self.store.has(&key) {
            self.store.set_obj(&key, &Bucket::new(now), None);
        }
        let mut decision = None;
        self.store.update_as::<Bucket, _>(&key, |bucket| {
            let horizon = now.saturating_sub(window);
            bucket.requests.retain(|&t| t > horizon);

            let weighted: f64 = bucket
                .requests
                .iter()
                .map(|&t| 1.0 - (now.saturating_sub(t) as f64 / window as f64))
                .sum();
            let allowed = weighted < limit as f64;
            if allowed {
                bucket.requests.push(now);
            } else {
                bucket.violations += 1;
            }
            bucket.last_access = now;

            decision = Some(RateDecision {
                allowed,
                limit,
                remaining: (limit as f64 - weighted).max(0.0).floor() as u32,
                current_count: bucket.requests.len() as u32,
                reset_in_ms: reset_in(bucket, window, now),
                severity: if allowed { None } else { Some(0.5) },
                reason: if allowed { None } else { Some(DenyReason::RateExceeded) },
                retry_after_ms: if allowed { None } else { Some(window / 10) },
            });
        });

        decision.unwrap_or(RateDecision {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(1),
            current_count: 1,
            reset_in_ms: window,
            severity: None,
            reason: None,
            retry_after_ms: None,
        })
    }

    pub fn penalty(&self, id: &str) -> f64 {
        self.penalties.get(id).map(|p| *p).unwrap_or(1.0)
    }

    pub fn user_limit(&self, id: &str) -> u32 {
        self.user_limits
            .get(id)
            .map(|l| *l)
            .unwrap_or(self.config.default_limit)
    }

    /// Drop all state held for `id`: bucket logs, penalty, adaptive limit
    /// and usage history.
    pub fn reset(&self, id: &str) {
        self.penalties.remove(id);
        self.user_limits.remove(id);
        self.usage.remove(id);
        for key in self.store.keys(Some(&format!("ratelimit:*:{id}"))) {
            self.store.delete(&key);
        }
        for key in self.store.keys(Some(&format!("ratelimit:*:{id}:*"))) {
            self.store.delete(&key);
        }
    }

    /// Delete buckets idle for more than ten windows.
    pub fn cleanup(&self, now_override: Option<u64>) -> usize {
        let now = now_override.unwrap_or_else(now_ms);
        let stale_after = self.config.window_ms * 10;
        let mut removed = 0;
        for key in self.store.keys(Some("ratelimit:bucket:*")) {
            if let Some(bucket) = self.store.get_as::<Bucket>(&key) {
                if now.saturating_sub(bucket.last_access) > stale_after {
                    self.store.delete(&key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("rate limiter: removed {removed} stale buckets");
        }
        removed
    }

    /// Spawn the periodic stale-bucket sweeper. Idempotent; stopped by
    /// [`shutdown`](Self::shutdown).
    pub fn start_sweeper(&self) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(limiter.config.cleanup_interval_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if limiter.shutdown.load(Ordering::Relaxed) {
                    trace!("rate limiter sweeper shutting down");
                    break;
                }
                limiter.cleanup(None);
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn record_usage(&self, id: &str, ratio: f64, risk: f64) {
        let mut samples = self.usage.entry(id.to_string()).or_default();
        samples.push_back(ratio.min(2.0));
        while samples.len() > USAGE_WINDOW {
            samples.pop_front();
        }
        if samples.len() < ADAPTIVE_MIN_SAMPLES {
            return;
        }

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let peak = samples.iter().cloned().fold(0.0, f64::max);
        samples.clear();
        drop(samples);

        let current = self.user_limit(id) as f64;
        let adjusted = if mean < 0.3 && peak < 0.5 {
            current * 1.2
        } else if mean > 0.8 || peak > 0.95 {
            current * 0.8
        } else {
            return;
        };

        let default = self.config.default_limit as f64;
        let clamped = adjusted.clamp(default * 0.1, default * 3.0);
        let shrunk = clamped * (1.0 - 0.5 * risk.clamp(0.0, 1.0));
        let new_limit = (shrunk.floor() as u32).max(1);
        debug!("adaptive limit for {id}: {} -> {new_limit} (mean {mean:.2}, peak {peak:.2})", current as u32);
        self.user_limits.insert(id.to_string(), new_limit);
    }
}

fn bucket_key(id: &str, endpoint: &str) -> String {
    format!("ratelimit:bucket:{id}:{endpoint}")
}

fn reset_in(bucket: &Bucket, window: u64, now: u64) -> u64 {
    bucket
        .requests
        .first()
        .map(|&oldest| (oldest + window).saturating_sub(now))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        let store = Arc::new(MemoryStore::new(StoreConfig::default()));
        RateLimiter::new(store, config)
    }

    fn opts(limit: u32, window_ms: u64, now: u64) -> CheckOptions {
        CheckOptions {
            limit: Some(limit),
            window_ms: Some(window_ms),
            now_ms: Some(now),
            ..Default::default()
        }
    }

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let rl = limiter(RateLimitConfig::default());
        let base = 1_000_000;
        for i in 0..10 {
            let decision = rl.check("u", &opts(10, 10_000, base + i * 100));
            assert!(decision.allowed, "request {i} should pass");
        }
        let denied = rl.check("u", &opts(10, 10_000, base + 1_500));
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::RateExceeded));
        assert!(denied.retry_after_ms.unwrap() > 0);
        assert!(denied.severity.unwrap() > 0.0);
    }

    #[test]
    fn test_window_expiry_frees_capacity() {
        let rl = limiter(RateLimitConfig::default());
        let base = 1_000_000;
        for i in 0..10 {
            assert!(rl.check("u", &opts(10, 10_000, base + i)).allowed);
        }
        assert!(!rl.check("u", &opts(10, 10_000, base + 100)).allowed);

        // One full window later everything admitted so far has expired.
        // The earlier violation may have left a small penalty, so compare
        // against the effective limit the decision reports.
        let later = base + 10_000 + 200;
        let decision = rl.check("u", &opts(10, 10_000, later));
        assert!(decision.allowed);
        assert_eq!(decision.current_count, 1);
        assert_eq!(decision.remaining, decision.limit - 1);
    }

    #[test]
    fn test_penalty_bounded_and_decays() {
        let mut config = RateLimitConfig::default();
        config.penalty_decay = 0.5;
        let rl = limiter(config);
        let base = 1_000_000;

        for i in 0..5 {
            assert!(rl.check("u", &opts(5, 1_000, base + i)).allowed);
        }
        // Hammer violations; penalty must stay within [1, 10].
        for i in 0..200 {
            rl.check("u", &opts(5, 1_000, base + 10 + i));
        }
        let peak = rl.penalty("u");
        assert!(peak > 1.0 && peak <= 10.0, "penalty {peak} out of bounds");

        // Compliant traffic in fresh windows decays the penalty toward 1.
        let mut t = base + 1_000_000;
        for _ in 0..20 {
            rl.check("u", &opts(100, 1_000, t));
            t += 10_000;
        }
        assert!(rl.penalty("u") < peak);
        assert!(rl.penalty("u") >= 1.0);
    }

    #[test]
    fn test_risk_score_shrinks_limit() {
        let rl = limiter(RateLimitConfig::default());
        let options = CheckOptions {
            limit: Some(10),
            window_ms: Some(10_000),
            risk_score: Some(1.0),
            now_ms: Some(1_000_000),
            ..Default::default()
        };
        let decision = rl.check("risky", &options);
        // floor(10 * (1 - 0.7)) = 3
        assert_eq!(decision.limit, 3);
    }

    #[test]
    fn test_burst_denial_reports_burst_reason() {
        let mut config = RateLimitConfig::default();
        config.adaptive = false;
        let rl = limiter(config);
        let base = 1_000_000;
        let mut denied_burst = false;
        for i in 0..30 {
            let d = rl.check("u", &opts(5, 10_000, base + i));
            if d.reason == Some(DenyReason::BurstExceeded) {
                assert_eq!(d.severity, Some(1.0));
                denied_burst = true;
            }
        }
        assert!(denied_burst, "pushing far past the limit must hit the burst ceiling");
    }

    #[test]
    fn test_token_bucket_refills_over_time() {
        let rl = limiter(RateLimitConfig::default());
        let base = 1_000_000;
        for _ in 0..5 {
            assert!(rl.check_token_bucket("t", 5, 10_000, 1.0, Some(base)).allowed);
        }
        let exhausted = rl.check_token_bucket("t", 5, 10_000, 1.0, Some(base));
        assert!(!exhausted.allowed);
        assert!(exhausted.retry_after_ms.unwrap() > 0);

        // 2 s at 0.5 tokens/s refills one token.
        let refilled = rl.check_token_bucket("t", 5, 10_000, 1.0, Some(base + 2_000));
        assert!(refilled.allowed);
    }

    #[test]
    fn test_leaky_bucket_drains() {
        let rl = limiter(RateLimitConfig::default());
        let base = 1_000_000;
        for _ in 0..3 {
            assert!(rl.check_leaky_bucket("l", 3.0, 1.0, 1.0, Some(base)).allowed);
        }
        assert!(!rl.check_leaky_bucket("l", 3.0, 1.0, 1.0, Some(base)).allowed);
        // After 2 s the bucket leaked 2 units.
        assert!(rl.check_leaky_bucket("l", 3.0, 1.0, 1.0, Some(base + 2_000)).allowed);
    }

    #[test]
    fn test_weighted_window_counts_fresh_requests_more() {
        let rl = limiter(RateLimitConfig::default());
        let base = 1_000_000;
        let window = 10_000;
        for i in 0..3 {
            let o = CheckOptions {
                limit: Some(3),
                window_ms: Some(window),
                now_ms: Some(base + i),
                ..Default::default()
            };
            assert!(rl.check_weighted_window("w", &o).allowed);
        }
        // Immediately the weighted count is ~3.0 and a fourth is denied.
        let denied = rl.check_weighted_window(
            "w",
            &CheckOptions {
                limit: Some(3),
                window_ms: Some(window),
                now_ms: Some(base + 10),
                ..Default::default()
            },
        );
        assert!(!denied.allowed);

        // Half a window later the old requests only weigh ~1.5 total.
        let aged = rl.check_weighted_window(
            "w",
            &CheckOptions {
                limit: Some(3),
                window_ms: Some(window),
                now_ms: Some(base + window / 2 + 100),
                ..Default::default()
            },
        );
        assert!(aged.allowed);
    }

    #[test]
    fn test_adaptive_limit_raises_for_light_users() {
        let rl = limiter(RateLimitConfig::default());
        let base = 1_000_000;
        // 50 windows of a single request each: mean and peak usage are low.
        for i in 0..50u64 {
            let o = CheckOptions {
                window_ms: Some(1_000),
                now_ms: Some(base + i * 10_000),
                ..Default::default()
            };
            assert!(rl.check("light", &o).allowed);
        }
        let raised = rl.user_limit("light");
        assert!(
            raised > RateLimitConfig::default().default_limit,
            "light usage should raise the limit, got {raised}"
        );
    }

    #[test]
    fn test_cleanup_drops_stale_buckets() {
        let rl = limiter(RateLimitConfig::default());
        let base = 1_000_000;
        rl.check("old", &opts(10, 1_000, base));
        rl.check("fresh", &opts(10, 1_000, base + 600_000 * 10));
        let removed = rl.cleanup(Some(base + 600_000 * 10 + 1));
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_reset_clears_identity_state() {
        let rl = limiter(RateLimitConfig::default());
        let base = 1_000_000;
        for i in 0..20 {
            rl.check("gone", &opts(5, 10_000, base + i));
        }
        assert!(rl.penalty("gone") > 1.0);
        rl.reset("gone");
        assert_eq!(rl.penalty("gone"), 1.0);
        let decision = rl.check("gone", &opts(5, 10_000, base + 100));
        assert!(decision.allowed);
        assert_eq!(decision.current_count, 1);
    }
}
