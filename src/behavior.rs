// Behavioral statistics over a caller's recent event history. Extracts a
// fixed feature vector, maintains a per-identity baseline profile in the
// store, and scores six independent factors; factors that clear their
// inclusion threshold fuse into a weighted behavior risk.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BehaviorConfig;
use crate::request::Event;
use crate::stats::{
    clamp01, coefficient_of_variation, intervals, interval_entropy, mean, normalized_entropy,
    percentile, shannon_entropy, sigmoid, std_dev, z_score,
};
use crate::store::MemoryStore;

pub const FEATURE_COUNT: usize = 13;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "interval_mean",
    "interval_std",
    "interval_entropy",
    "action_entropy",
    "endpoint_entropy",
    "event_count",
    "unique_actions",
    "unique_endpoints",
    "response_time_mean",
    "response_time_std",
    "payload_mean",
    "time_span_ms",
    "events_per_minute",
];

/// Feature snapshot for one analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub timestamp_ms: u64,
    pub values: [f64; FEATURE_COUNT],
}

/// Per-feature distribution summary learned from the profile history.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub q1: f64,
    pub q3: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub features: [FeatureStats; FEATURE_COUNT],
}

/// Stored per-identity profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub feature_history: Vec<FeatureVector>,
    pub baseline: Option<Baseline>,
    /// Grows with history size: `min(len / 20, 1)`.
    pub confidence: f64,
    pub last_updated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BehaviorFactor {
    pub name: &'static str,
    pub score: f64,
    pub weight: f64,
    pub included: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BehaviorAssessment {
    pub risk: f64,
    /// False below the event-count floor; the fuser drops the signal.
    pub reliable: bool,
    pub confidence: f64,
    pub factors: Vec<BehaviorFactor>,
    pub anomaly: f64,
    pub velocity: f64,
    pub rhythm: f64,
    pub low_diversity: f64,
    pub automation: f64,
    pub session_anomaly: f64,
    pub features: Option<FeatureVector>,
}

impl BehaviorAssessment {
    fn unreliable() -> Self {
        Self {
            risk: 0.5,
            reliable: false,
            confidence: 0.0,
            factors: Vec::new(),
            anomaly: 0.0,
            velocity: 0.0,
            rhythm: 0.0,
            low_diversity: 0.0,
            automation: 0.0,
            session_anomaly: 0.0,
            features: None,
        }
    }
}

// Factor weights and inclusion thresholds.
const W_ANOMALY: f64 = 0.25;
const W_VELOCITY: f64 = 0.20;
const W_RHYTHM: f64 = 0.15;
const W_DIVERSITY: f64 = 0.10;
const W_AUTOMATION: f64 = 0.20;
const W_SESSION: f64 = 0.10;

const T_ANOMALY: f64 = 0.3;
const T_VELOCITY: f64 = 0.5;
const T_RHYTHM: f64 = 0.4;
const T_DIVERSITY: f64 = 0.8;
const T_AUTOMATION: f64 = 0.6;
const T_SESSION: f64 = 0.5;

pub struct BehaviorAnalyzer {
    store: Arc<MemoryStore>,
    config: BehaviorConfig,
}

impl BehaviorAnalyzer {
    pub fn new(store: Arc<MemoryStore>, config: BehaviorConfig) -> Self {
        Self { store, config }
    }

    /// Analyze the caller's recent events and update its profile.
    ///
    /// Below `min_samples` events the assessment is unreliable and the
    /// profile is left untouched. The anomaly factor compares against the
    /// baseline as it stood before this call.
    pub fn analyze(&self, identity: &str, events: &[Event], now: u64) -> BehaviorAssessment {
        if events.len() < self.config.min_samples {
            return BehaviorAssessment::unreliable();
        }

        let features = extract_features(events, now);
        let profile = self.profile(identity).unwrap_or_default();

        let anomaly = self.anomaly_factor(&features, &profile);
        let velocity = velocity_factor(events);
        let rhythm = rhythm_factor(events);
        let low_diversity = low_diversity_factor(events);
        let automation = automation_factor(events);
        let session_anomaly = session_anomaly_factor(events);

        let factors = vec![
            factor("anomaly", anomaly, W_ANOMALY, T_ANOMALY),
            factor("velocity", velocity, W_VELOCITY, T_VELOCITY),
            factor("rhythm", rhythm, W_RHYTHM, T_RHYTHM),
            factor("low_diversity", low_diversity, W_DIVERSITY, T_DIVERSITY),
            factor("automation", automation, W_AUTOMATION, T_AUTOMATION),
            factor("session_anomaly", session_anomaly, W_SESSION, T_SESSION),
        ];

        // Weighted mean over the factors that cleared their threshold,
        // renormalized by the included weight mass.
        let included_weight: f64 = factors.iter().filter(|f| f.included).map(|f| f.weight).sum();
        let risk = if included_weight > 0.0 {
            let weighted: f64 = factors
                .iter()
                .filter(|f| f.included)
                .map(|f| f.score * f.weight)
                .sum();
            clamp01(weighted / included_weight)
        } else {
            0.0
        };

        let updated = self.update_profile(identity, features.clone(), now);

        BehaviorAssessment {
            risk,
            reliable: true,
            confidence: updated,
            factors,
            anomaly,
            velocity,
            rhythm,
            low_diversity,
            automation,
            session_anomaly,
            features: Some(features),
        }
    }

    pub fn profile(&self, identity: &str) -> Option<BehaviorProfile> {
        self.store.get_as(&profile_key(identity))
    }

    pub fn reset(&self, identity: &str) {
        self.store.delete(&profile_key(identity));
    }

    fn anomaly_factor(&self, features: &FeatureVector, profile: &BehaviorProfile) -> f64 {
        let Some(baseline) = &profile.baseline else {
            return 0.0;
        };
        if profile.confidence < 0.3 {
            return 0.0;
        }

        let threshold = self.config.anomaly_threshold;
        let ratios: Vec<f64> = features
            .values
            .iter()
            .zip(baseline.features.iter())
            .map(|(&value, stats)| (z_score(value, stats.mean, stats.std) / threshold).min(2.0))
            .collect();
        sigmoid(mean(&ratios) - 1.0)
    }

    /// Append the snapshot under the store's per-key lock, recompute the
    /// baseline once enough history exists, and persist. Returns the new
    /// confidence.
    fn update_profile(&self, identity: &str, features: FeatureVector, now: u64) -> f64 {
        let key = profile_key(identity);
        if !self.store.has(&key) {
            self.store.set_obj(&key, &BehaviorProfile::default(), None);
        }

        let max_history = self.config.max_feature_history;
        let baseline_min = self.config.baseline_min_samples;
        let mut confidence = 0.0;
        self.store.update_as::<BehaviorProfile, _>(&key, |profile| {
            profile.feature_history.push(features);
            while profile.feature_history.len() > max_history {
                profile.feature_history.remove(0);
            }
            if profile.feature_history.len() >= baseline_min {
                profile.baseline = Some(compute_baseline(&profile.feature_history));
            }
            profile.confidence = (profile.feature_history.len() as f64 / 20.0).min(1.0);
            profile.last_updated = now;
            confidence = profile.confidence;
        });
        confidence
    }
}

fn profile_key(identity: &str) -> String {
    format!("behavior:profile:{identity}")
}

fn factor(name: &'static str, score: f64, weight: f64, threshold: f64) -> BehaviorFactor {
    BehaviorFactor {
        name,
        score,
        weight,
        included: score > threshold,
    }
}

// ==================== FEATURE EXTRACTION ====================

pub fn extract_features(events: &[Event], now: u64) -> FeatureVector {
    let timestamps: Vec<u64> = events.iter().map(|e| e.timestamp_ms).collect();
    let iv = intervals(&timestamps);
    let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
    let endpoints: Vec<&str> = events.iter().map(|e| e.endpoint.as_str()).collect();
    let response_times: Vec<f64> = events.iter().filter_map(|e| e.response_time_ms).collect();
    let payloads: Vec<f64> = events.iter().map(|e| e.payload_size as f64).collect();

    let span = timestamps
        .last()
        .zip(timestamps.first())
        .map(|(&last, &first)| last.saturating_sub(first))
        .unwrap_or(0) as f64;
    let per_minute = if span > 0.0 {
        events.len() as f64 / (span / 60_000.0)
    } else {
        0.0
    };

    let unique = |items: &[&str]| items.iter().collect::<std::collections::HashSet<_>>().len() as f64;

    FeatureVector {
        timestamp_ms: now,
        values: [
            mean(&iv),
            std_dev(&iv),
            interval_entropy(&iv),
            shannon_entropy(&actions),
            shannon_entropy(&endpoints),
            events.len() as f64,
            unique(&actions),
            unique(&endpoints),
            mean(&response_times),
            std_dev(&response_times),
            mean(&payloads),
            span,
            per_minute,
        ],
    }
}

pub fn compute_baseline(history: &[FeatureVector]) -> Baseline {
    let mut features = [FeatureStats::default(); FEATURE_COUNT];
    for (i, stats) in features.iter_mut().enumerate() {
        let series: Vec<f64> = history.iter().map(|f| f.values[i]).collect();
        *stats = FeatureStats {
            mean: mean(&series),
            std: std_dev(&series),
            median: percentile(&series, 50.0),
            q1: percentile(&series, 25.0),
            q3: percentile(&series, 75.0),
        };
    }
    Baseline { features }
}

// ==================== FACTOR SCORING ====================

fn velocity_factor(events: &[Event]) -> f64 {
    let timestamps: Vec<u64> = events.iter().map(|e| e.timestamp_ms).collect();
    let iv = intervals(&timestamps);
    if iv.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    let min_interval = iv.iter().cloned().fold(f64::INFINITY, f64::min);
    if min_interval < 50.0 {
        score += 0.4;
    } else if min_interval < 100.0 {
        score += 0.2;
    }

    let span_s = match (timestamps.first(), timestamps.last()) {
        (Some(&first), Some(&last)) => last.saturating_sub(first) as f64 / 1000.0,
        _ => 0.0,
    };
    let per_second = if span_s > 0.0 {
        events.len() as f64 / span_s
    } else {
        events.len() as f64
    };
    if per_second > 10.0 {
        score += 0.3;
    } else if per_second > 5.0 {
        score += 0.15;
    }

    score += 0.3 * burst_score(&iv);
    clamp01(score)
}

/// Burst intensity: how many bursts occurred and how long the longest
/// ran, where a burst interval is under a fifth of the average.
fn burst_score(iv: &[f64]) -> f64 {
    let avg = mean(iv);
    if avg <= 0.0 {
        return 0.0;
    }
    let threshold = avg * 0.2;
    let mut bursts = 0usize;
    let mut longest = 0usize;
    let mut run = 0usize;
    for &interval in iv {
        if interval < threshold {
            run += 1;
            longest = longest.max(run);
        } else {
            if run > 0 {
                bursts += 1;
            }
            run = 0;
        }
    }
    if run > 0 {
        bursts += 1;
    }
    clamp01(bursts as f64 / 5.0 * 0.5 + longest as f64 / 10.0 * 0.5)
}

fn rhythm_factor(events: &[Event]) -> f64 {
    let timestamps: Vec<u64> = events.iter().map(|e| e.timestamp_ms).collect();
    let iv = intervals(&timestamps);
    if iv.len() < 2 {
        return 0.0;
    }

    let cv = coefficient_of_variation(&iv);
    let mut score = if cv < 0.1 {
        0.8
    } else if cv < 0.2 {
        0.5
    } else if cv < 0.3 {
        0.2
    } else {
        0.0
    };

    // Clock-grid alignment: intervals within 20 ms of a 100 ms multiple.
    let aligned = iv
        .iter()
        .filter(|&&i| {
            let rem = i % 100.0;
            rem <= 20.0 || rem >= 80.0
        })
        .count();
    if aligned as f64 / iv.len() as f64 > 0.8 {
        score += 0.2;
    }
    clamp01(score)
}

/// Risk from *lack* of diversity: a blend of unique ratios and normalized
/// entropies for actions and endpoints, inverted.
fn low_diversity_factor(events: &[Event]) -> f64 {
    let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
    let endpoints: Vec<&str> = events.iter().map(|e| e.endpoint.as_str()).collect();
    let n = events.len() as f64;
    if n == 0.0 {
        return 0.0;
    }

    let blend = |items: &[&str]| {
        let distinct = items.iter().collect::<std::collections::HashSet<_>>().len() as f64;
        0.5 * (distinct / n) + 0.5 * normalized_entropy(items)
    };
    let diversity = 0.5 * blend(&actions) + 0.5 * blend(&endpoints);
    clamp01(1.0 - diversity)
}

fn automation_factor(events: &[Event]) -> f64 {
    let timestamps: Vec<u64> = events.iter().map(|e| e.timestamp_ms).collect();
    let iv = intervals(&timestamps);
    if iv.is_empty() {
        return 0.0;
    }

    // Machine-timed intervals: integer multiples of 100/500/1000 ms.
    let machine = iv
        .iter()
        .filter(|&&i| {
            let rem = i % 100.0;
            rem <= 10.0 || rem >= 90.0
        })
        .count() as f64
        / iv.len() as f64;

    // Interval repetition: share of the most common 10 ms bucket.
    let mut buckets: HashMap<i64, usize> = HashMap::new();
    for &i in &iv {
        *buckets.entry((i / 10.0).round() as i64).or_insert(0) += 1;
    }
    let repetition = buckets.values().copied().max().unwrap_or(0) as f64 / iv.len() as f64;

    // Action-sequence repetition: best self-match under small shifts.
    let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
    let seq_repetition = (1..=3usize)
        .map(|shift| {
            if actions.len() <= shift {
                return 0.0;
            }
            let matches = actions
                .iter()
                .skip(shift)
                .zip(actions.iter())
                .filter(|(a, b)| a == b)
                .count();
            matches as f64 / (actions.len() - shift) as f64
        })
        .fold(0.0, f64::max);

    // Human interaction markers: pointer/scroll activity and variable
    // response times. Each missing marker adds a third.
    let has_pointer = actions
        .iter()
        .any(|a| a.contains("mouse") || a.contains("click") || a.contains("touch"));
    let has_scroll = actions.iter().any(|a| a.contains("scroll"));
    let response_times: Vec<f64> = events.iter().filter_map(|e| e.response_time_ms).collect();
    let variable_latency = coefficient_of_variation(&response_times) >= 0.1;
    let missing =
        [!has_pointer, !has_scroll, !variable_latency].iter().filter(|&&m| m).count() as f64 / 3.0;

    clamp01(machine * 0.3 + repetition * 0.2 + seq_repetition * 0.25 + missing * 0.25)
}

fn session_anomaly_factor(events: &[Event]) -> f64 {
    let timestamps: Vec<u64> = events.iter().map(|e| e.timestamp_ms).collect();
    let span = timestamps
        .last()
        .zip(timestamps.first())
        .map(|(&last, &first)| last.saturating_sub(first))
        .unwrap_or(0);

    let mut score = 0.0;
    if events.len() > 20 && span < 5_000 {
        score += 0.4;
    }

    let hours: Vec<u32> = timestamps
        .iter()
        .filter_map(|&t| Utc.timestamp_millis_opt(t as i64).single())
        .map(|dt| dt.hour())
        .collect();
    if !hours.is_empty() && normalized_hour_entropy(&hours) < 0.2 {
        score += 0.2;
    }

    // Long unbroken session: humans pause, scripted sessions do not.
    let iv = intervals(&timestamps);
    let max_gap = iv.iter().cloned().fold(0.0, f64::max);
    if span > 30 * 60 * 1000 && max_gap < 60_000.0 {
        score += 0.4;
    }
    clamp01(score)
}

/// Hour-of-day entropy normalized by the 24-bin maximum.
fn normalized_hour_entropy(hours: &[u32]) -> f64 {
    if hours.is_empty() {
        return 0.0;
    }
    shannon_entropy(hours) / (24.0f64).log2()
}
