//! vigil-core: behavior-based anti-abuse risk engine.
//!
//! Given a stream of per-request events keyed by caller identity, the
//! engine produces a bounded risk score in [0,1], a categorical risk
//! level, and a mitigation action (allow / challenge / throttle / block /
//! ban). Five independent signal sources feed a weighted decision:
//! behavioral statistics over recent events, sequence/temporal attack
//! patterns, sliding-window rate limiting with adaptive penalties, device
//! fingerprinting with anomaly scoring, and a decaying reputation derived
//! from prior decisions. All per-identity state lives behind the bounded
//! in-process [`store::MemoryStore`].

// Production modules
pub mod error;
pub mod config;

pub mod stats; // Numeric kernel shared by every signal producer
pub mod store; // TTL/LRU bounded per-identity state store
pub mod request; // Inbound adapter contract (requests, events, hints)
pub mod rate_limiter; // Sliding-window limiting with adaptive penalties
pub mod fingerprint; // Device fingerprinting and bot scoring
pub mod behavior; // Behavioral feature extraction and baselines
pub mod patterns; // Sequence/temporal attack-pattern detection
pub mod reputation; // Decaying per-identity reputation
pub mod session; // Session lifecycle and impossible-travel checks
pub mod anomaly; // Offline statistical anomaly analysis
pub mod metrics; // Engine counters and snapshots
pub mod engine; // Orchestrator fusing the five signals

pub use config::EngineConfig;
pub use engine::{
    ActionKind, ChallengeType, Decision, MitigationAction, NoopHooks, RiskEngine, RiskHooks,
    RiskLevel,
};
pub use error::VigilError;
pub use request::{ClientHints, Event, GeoPoint, Headers, RequestRecord};
pub use store::MemoryStore;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch milliseconds.
///
/// All engine timestamps are epoch-ms `u64`; callers that need replay
/// determinism supply explicit timestamps instead via
/// [`RequestRecord::timestamp_ms`].
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
