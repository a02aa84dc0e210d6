// Risk engine orchestrator. Per request: derive the identity, record the
// event, run the five signal producers, fuse their scores under the
// configured weights with upward floor clamps, map the fused score to a
// level and mitigation action, then update reputation, counters and
// hooks. `evaluate` is infallible by design: producers degrade to
// sentinels and the fuser drops their weight.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::behavior::{BehaviorAnalyzer, BehaviorAssessment};
use crate::config::EngineConfig;
use crate::error::VigilError;
use crate::fingerprint::{FingerprintAssessment, Fingerprinter};
use crate::metrics::{EngineStats, MetricsCollector};
use crate::now_ms;
use crate::patterns::{PatternAssessment, PatternDetector};
use crate::rate_limiter::{CheckOptions, RateDecision, RateLimiter};
use crate::reputation::ReputationTracker;
use crate::request::{Event, RequestRecord};
use crate::session::{SessionFlag, SessionTracker};
use crate::stats::clamp01;
use crate::store::{MemoryStore, StoreStats};

// ==================== DECISION MODEL ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

/// Action discriminant without payload, for counters and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Allow,
    Challenge,
    Throttle,
    Block,
    Ban,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    Captcha,
    ProofOfWork,
    JsChallenge,
}

/// Mitigation selected for a request. Each variant carries only the
/// fields meaningful for that action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MitigationAction {
    Allow,
    Challenge {
        challenge_type: ChallengeType,
        nonce: String,
    },
    Throttle {
        factor: f64,
    },
    Block {
        reason: String,
        duration_ms: u64,
    },
    Ban {
        reason: String,
        duration_ms: u64,
    },
}

impl MitigationAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            MitigationAction::Allow => ActionKind::Allow,
            MitigationAction::Challenge { .. } => ActionKind::Challenge,
            MitigationAction::Throttle { .. } => ActionKind::Throttle,
            MitigationAction::Block { .. } => ActionKind::Block,
            MitigationAction::Ban { .. } => ActionKind::Ban,
        }
    }

    /// Allow and challenge let the request proceed; the rest do not.
    pub fn allowed(&self) -> bool {
        matches!(self, MitigationAction::Allow | MitigationAction::Challenge { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            MitigationAction::Block { reason, .. } | MitigationAction::Ban { reason, .. } => {
                Some(reason)
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.kind() {
            ActionKind::Allow => "allow",
            ActionKind::Challenge => "challenge",
            ActionKind::Throttle => "throttle",
            ActionKind::Block => "block",
            ActionKind::Ban => "ban",
        }
    }
}

/// Per-signal breakdown carried on every decision.
#[derive(Debug, Clone, Serialize)]
pub struct SignalBreakdown {
    pub behavior: BehaviorAssessment,
    pub patterns: PatternAssessment,
    pub rate_limit: RateDecision,
    pub fingerprint: FingerprintAssessment,
    pub reputation: Option<f64>,
    pub session_flag: Option<SessionFlag>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DecisionMetadata {
    pub evaluation_time_ms: f64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub identity: String,
    pub session_id: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub action: MitigationAction,
    pub allowed: bool,
    pub components: SignalBreakdown,
    pub metadata: DecisionMetadata,
}

// ==================== HOOKS ====================

/// Outbound notification points. Implementations must be panic-tolerant
/// in spirit, but the engine guards every invocation anyway: a hook
/// failure never affects the decision.
pub trait RiskHooks: Send + Sync {
    fn on_high_risk(&self, _decision: &Decision) {}
    fn on_block(&self, _decision: &Decision) {}
    fn on_anomaly(&self, _identity: &str, _behavior: &BehaviorAssessment) {}
}

/// Default no-op hook set.
pub struct NoopHooks;

impl RiskHooks for NoopHooks {}

// ==================== ENGINE ====================

pub struct RiskEngine {
    config: EngineConfig,
    store: Arc<MemoryStore>,
    limiter: RateLimiter,
    fingerprinter: Fingerprinter,
    behavior: BehaviorAnalyzer,
    patterns: PatternDetector,
    reputation: ReputationTracker,
    sessions: SessionTracker,
    metrics: MetricsCollector,
    hooks: Arc<dyn RiskHooks>,
}

impl RiskEngine {
    pub fn new(config: EngineConfig) -> Result<Self, VigilError> {
        Self::with_hooks(config, Arc::new(NoopHooks))
    }

    pub fn with_hooks(config: EngineConfig, hooks: Arc<dyn RiskHooks>) -> Result<Self, VigilError> {
        config.validate()?;
        let store = Arc::new(MemoryStore::new(config.store));
        Ok(Self {
            limiter: RateLimiter::new(store.clone(), config.rate_limit),
            fingerprinter: Fingerprinter::new(store.clone()),
            behavior: BehaviorAnalyzer::new(store.clone(), config.behavior),
            patterns: PatternDetector::new(config.patterns),
            reputation: ReputationTracker::new(store.clone()),
            sessions: SessionTracker::new(store.clone()),
            metrics: MetricsCollector::new(),
            hooks,
            store,
            config,
        })
    }

    /// Start the background sweepers (store TTL/LRU, stale rate-limit
    /// buckets). Requires a tokio runtime.
    pub fn start(&self) {
        self.store.start_sweeper();
        self.limiter.start_sweeper();
        info!("risk engine started");
    }

    /// Stop both sweepers and release all per-identity state.
    pub fn destroy(&self) {
        self.store.shutdown();
        self.limiter.shutdown();
        self.store.clear();
        info!("risk engine destroyed");
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.metrics.snapshot()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Export all engine state (events, profiles, buckets, reputation) as
    /// a JSON snapshot.
    pub fn export_state(&self) -> serde_json::Value {
        self.store.export()
    }

    pub fn import_state(&self, snapshot: &serde_json::Value) -> Result<usize, VigilError> {
        self.store.import(snapshot)
    }

    /// Evaluate one request. Never fails; a producer that cannot compute
    /// drops out of the fusion instead.
    pub fn evaluate(&self, request: &RequestRecord) -> Decision {
        let started = Instant::now();
        let now = request.timestamp_ms.unwrap_or_else(now_ms);
        let identity = derive_identity(request);
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| synthetic_session_id(request, now));

        // Record the event, bounded to the most recent window.
        let event = Event::from_request(request, now);
        let events_key = format!("events:{identity}");
        self.store.push(
            &events_key,
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
            self.config.max_events,
        );
        let events: Vec<Event> = self.store.get_as(&events_key).unwrap_or_default();

        // Signal producers. Reputation is read before this decision is
        // folded in, and feeds the rate limiter's risk shrink.
        let reputation = self.reputation.score(&identity);
        let behavior = self.behavior.analyze(&identity, &events, now);
        let patterns = self.patterns.detect(&events);
        let rate_limit = self.limiter.check(
            &identity,
            &CheckOptions {
                endpoint: Some(request.endpoint.clone()),
                risk_score: reputation,
                now_ms: Some(now),
                ..Default::default()
            },
        );
        let fingerprint = self.fingerprinter.assess(request, &identity, now);
        let session_flag = self.sessions.track(
            &identity,
            &session_id,
            &request.ip,
            request.client.as_ref().and_then(|c| c.geo),
            now,
        );

        let risk_score = self.fuse(&behavior, &patterns, &rate_limit, &fingerprint, reputation, &session_flag);
        let risk_level = self.level_for(risk_score);
        let action = self.select_action(
            risk_score,
            &behavior,
            &patterns,
            &rate_limit,
            &fingerprint,
            reputation,
        );
        let allowed = action.allowed();

        self.reputation
            .update(&identity, risk_score, action.label(), allowed, now);
        self.metrics.record(action.kind(), risk_score);

        let decision = Decision {
            identity,
            session_id,
            risk_score,
            risk_level,
            allowed,
            action,
            components: SignalBreakdown {
                behavior,
                patterns,
                rate_limit,
                fingerprint,
                reputation,
                session_flag,
            },
            metadata: DecisionMetadata {
                evaluation_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
                timestamp_ms: now,
            },
        };

        self.fire_hooks(&decision);
        if !decision.allowed {
            debug!(
                "denied {} ({}): score {:.3}, {}",
                decision.identity,
                decision.action.label(),
                decision.risk_score,
                decision.action.reason().unwrap_or("-")
            );
        }
        decision
    }

    /// Purge every piece of per-identity state: events, behavior profile,
    /// fingerprint history, reputation, sessions and rate-limiter state.
    /// Each key removal is atomic with respect to concurrent readers.
    pub fn reset_user(&self, identity: &str) {
        self.store.delete(&format!("events:{identity}"));
        self.behavior.reset(identity);
        self.fingerprinter.reset(identity);
        self.reputation.reset(identity);
        self.sessions.reset(identity);
        self.limiter.reset(identity);
        info!("reset all state for {identity}");
    }

    // ==================== FUSION ====================

    /// Weighted mean over present components, then upward floor clamps.
    /// A missing or unreliable component drops both its weight and its
    /// numerator contribution.
    fn fuse(
        &self,
        behavior: &BehaviorAssessment,
        patterns: &PatternAssessment,
        rate_limit: &RateDecision,
        fingerprint: &FingerprintAssessment,
        reputation: Option<f64>,
        session_flag: &Option<SessionFlag>,
    ) -> f64 {
        let w = &self.config.weights;
        let mut numerator = 0.0;
        let mut denominator = 0.0;

        if behavior.reliable {
            numerator += w.behavior * behavior.risk;
            denominator += w.behavior;
        }

        numerator += w.patterns * patterns.risk;
        denominator += w.patterns;

        // Denied requests contribute their severity; 0.5 is only the
        // fallback for a denial that carries no severity value.
        let rate_component = if rate_limit.allowed {
            0.0
        } else {
            rate_limit.severity.unwrap_or(0.5)
        };
        numerator += w.rate_limit * rate_component;
        denominator += w.rate_limit;

        let fp_component = fingerprint
            .anomaly_score
            .max(fingerprint.bot_score)
            .max(if fingerprint.suspicious { 0.7 } else { 0.0 });
        numerator += w.fingerprint * fp_component;
        denominator += w.fingerprint;

        if let Some(score) = reputation {
            numerator += w.reputation * score;
            denominator += w.reputation;
        }

        let mut fused = if denominator > 0.0 {
            clamp01(numerator / denominator)
        } else {
            0.0
        };

        // Floor rules: hard signals clamp the score upward regardless of
        // how diluted the linear combination is.
        let floors = &self.config.floors;
        if patterns.attack_type.is_some() {
            fused = fused.max(floors.attack);
        }
        if fingerprint.is_bot {
            fused = fused.max(floors.bot);
        }
        if !rate_limit.allowed {
            fused = fused.max(floors.rate_denied);
        }
        if session_flag.is_some() {
            fused = fused.max(floors.impossible_travel);
        }
        clamp01(fused)
    }

    fn level_for(&self, score: f64) -> RiskLevel {
        let t = &self.config.thresholds;
        if score >= t.critical {
            RiskLevel::Critical
        } else if score >= t.high {
            RiskLevel::High
        } else if score >= t.medium {
            RiskLevel::Medium
        } else if score >= t.low {
            RiskLevel::Low
        } else {
            RiskLevel::Minimal
        }
    }

    fn select_action(
        &self,
        score: f64,
        behavior: &BehaviorAssessment,
        patterns: &PatternAssessment,
        rate_limit: &RateDecision,
        fingerprint: &FingerprintAssessment,
        reputation: Option<f64>,
    ) -> MitigationAction {
        let t = &self.config.thresholds;
        if score >= t.critical {
            return MitigationAction::Ban {
                reason: self.deny_reason(behavior, patterns, rate_limit, fingerprint, reputation),
                duration_ms: self.config.ban_duration_ms,
            };
        }
        if score >= t.high {
            return MitigationAction::Block {
                reason: self.deny_reason(behavior, patterns, rate_limit, fingerprint, reputation),
                duration_ms: self.config.block_duration_ms,
            };
        }
        if score >= t.medium {
            return MitigationAction::Throttle {
                factor: self.config.throttle_factor,
            };
        }
        if score >= t.low {
            let challenge_type = if fingerprint.bot_score > 0.5 {
                ChallengeType::Captcha
            } else if behavior.automation > 0.5 {
                ChallengeType::ProofOfWork
            } else {
                ChallengeType::JsChallenge
            };
            return MitigationAction::Challenge {
                challenge_type,
                nonce: challenge_nonce(),
            };
        }
        MitigationAction::Allow
    }

    /// Human-readable denial reason derived from the dominant signal.
    fn deny_reason(
        &self,
        behavior: &BehaviorAssessment,
        patterns: &PatternAssessment,
        rate_limit: &RateDecision,
        fingerprint: &FingerprintAssessment,
        reputation: Option<f64>,
    ) -> String {
        if let Some(attack) = patterns.attack_type {
            return format!("detected_{attack}");
        }
        if !rate_limit.allowed {
            return "rate_limit_exceeded".to_string();
        }
        if fingerprint.is_bot {
            return "bot_detected".to_string();
        }

        let behavior_risk = if behavior.reliable { behavior.risk } else { 0.0 };
        let candidates = [
            (behavior_risk, "behavioral_anomaly"),
            (patterns.risk, "pattern_risk"),
            (fingerprint.anomaly_score, "fingerprint_risk"),
            (reputation.unwrap_or(0.0), "reputation_risk"),
        ];
        candidates
            .iter()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, reason)| reason.to_string())
            .unwrap_or_else(|| "high_risk".to_string())
    }

    /// Invoke hooks behind a panic boundary; a failing hook is logged and
    /// otherwise ignored.
    fn fire_hooks(&self, decision: &Decision) {
        if decision.risk_level >= RiskLevel::High {
            self.guarded(|| self.hooks.on_high_risk(decision), "on_high_risk");
        }
        if matches!(
            decision.action.kind(),
            ActionKind::Block | ActionKind::Ban
        ) {
            self.guarded(|| self.hooks.on_block(decision), "on_block");
        }
        let behavior = &decision.components.behavior;
        if behavior.reliable && behavior.risk >= 0.7 {
            self.guarded(
                || self.hooks.on_anomaly(&decision.identity, behavior),
                "on_anomaly",
            );
        }
    }

    fn guarded<F: FnOnce()>(&self, f: F, name: &str) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            warn!("{name} hook panicked; ignoring");
        }
    }
}

// ==================== IDENTITY & SESSION ====================

/// Identity preference order: explicit user id, authenticated user id,
/// adapter-supplied header id, caller IP, then the anonymous bucket.
fn derive_identity(request: &RequestRecord) -> String {
    if let Some(user_id) = request.user_id.as_deref().filter(|s| !s.is_empty()) {
        return user_id.to_string();
    }
    if let Some(auth_id) = request.auth_user_id.as_deref().filter(|s| !s.is_empty()) {
        return auth_id.to_string();
    }
    if let Some(header_id) = request.headers.get("x-user-id").filter(|s| !s.is_empty()) {
        return header_id.to_string();
    }
    if !request.ip.is_empty() {
        return request.ip.clone();
    }
    "anonymous".to_string()
}

/// Synthetic session id: digest of ip|user-agent|coarse time bucket.
fn synthetic_session_id(request: &RequestRecord, now: u64) -> String {
    let bucket = now / 1_800_000; // 30 minute buckets
    let mut hasher = Sha256::new();
    hasher.update(request.ip.as_bytes());
    hasher.update(b"|");
    hasher.update(request.user_agent().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_le_bytes());
    hex::encode(&hasher.finalize()[..8])
}

fn challenge_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
