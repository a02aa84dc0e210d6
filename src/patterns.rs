// Sequence/temporal attack-pattern detection over a caller's event
// history. Four detector families run per analysis: repeated action
// sub-sequences, temporal structure (periodicity, bursts, clock
// alignment), a closed registry of known attack classes, and
// anomalous/coordinated traffic shapes. Each emits patterns with a
// bounded risk; the aggregate favors the worst finding.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PatternConfig;
use crate::request::Event;
use crate::stats::{clamp01, coefficient_of_variation, intervals, mean, percentile, std_dev};

// ==================== ATTACK REGISTRY ====================

/// Closed set of known attack classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    BruteForce,
    Enumeration,
    Scraping,
    CardTesting,
    AccountTakeover,
    ApiAbuse,
}

impl std::fmt::Display for AttackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AttackType::BruteForce => "brute_force",
            AttackType::Enumeration => "enumeration",
            AttackType::Scraping => "scraping",
            AttackType::CardTesting => "card_testing",
            AttackType::AccountTakeover => "account_takeover",
            AttackType::ApiAbuse => "api_abuse",
        };
        write!(f, "{name}")
    }
}

/// One registry entry. The pattern is matched against both endpoint and
/// action; `max_interval_ms` and `sequential_ids` gate the match, while
/// `low_variance` only sweetens the risk when observed.
pub struct AttackSignature {
    pub attack: AttackType,
    pub pattern: Regex,
    pub min_repetitions: usize,
    pub max_interval_ms: Option<u64>,
    pub sequential_ids: bool,
    pub low_variance_bonus: bool,
    pub risk_multiplier: f64,
}

static ATTACK_REGISTRY: Lazy<Vec<AttackSignature>> = Lazy::new(|| {
    let compile = |p: &str| Regex::new(p).expect("attack pattern compiles");
    vec![
        AttackSignature {
            attack: AttackType::BruteForce,
            pattern: compile(r"(?i)(login|signin|sign-in|auth|password)"),
            min_repetitions: 5,
            max_interval_ms: Some(10_000),
            sequential_ids: false,
            low_variance_bonus: true,
            risk_multiplier: 1.5,
        },
        AttackSignature {
            attack: AttackType::Enumeration,
            pattern: compile(r"(?i)/(users?|accounts?|items?|products?|orders?|profiles?)/\d+"),
            min_repetitions: 8,
            max_interval_ms: None,
            sequential_ids: true,
            low_variance_bonus: false,
            risk_multiplier: 1.2,
        },
        AttackSignature {
            attack: AttackType::Scraping,
            pattern: compile(r"(?i)(search|list|catalog|products|feed|export)"),
            min_repetitions: 20,
            max_interval_ms: Some(2_000),
            sequential_ids: false,
            low_variance_bonus: false,
            risk_multiplier: 1.0,
        },
        AttackSignature {
            attack: AttackType::CardTesting,
            pattern: compile(r"(?i)(payment|checkout|card|billing|charge)"),
            min_repetitions: 5,
            max_interval_ms: Some(30_000),
            sequential_ids: false,
            low_variance_bonus: true,
            risk_multiplier: 1.8,
        },
        AttackSignature {
            attack: AttackType::AccountTakeover,
            pattern: compile(r"(?i)(password|reset|recover|forgot|2fa|mfa)"),
            min_repetitions: 4,
            max_interval_ms: None,
            sequential_ids: false,
            low_variance_bonus: false,
            risk_multiplier: 1.6,
        },
        AttackSignature {
            attack: AttackType::ApiAbuse,
            pattern: compile(r"(?i)^/api/"),
            min_repetitions: 30,
            max_interval_ms: Some(1_000),
            sequential_ids: false,
            low_variance_bonus: false,
            risk_multiplier: 1.0,
        },
    ]
});

/// Registry accessor, mainly for diagnostics and tests.
pub fn attack_registry() -> &'static [AttackSignature] {
    &ATTACK_REGISTRY
}

// ==================== DETECTED PATTERNS ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternKind {
    Sequence {
        actions: Vec<String>,
        count: usize,
    },
    Periodicity {
        interval_ms: u64,
        confidence: f64,
    },
    Burst {
        count: usize,
        duration_ms: u64,
        rate_per_sec: f64,
    },
    ClockAlignment {
        unit_ms: u64,
        fraction: f64,
    },
    KnownAttack {
        attack: AttackType,
        match_count: usize,
    },
    EndpointAnomaly {
        endpoint: String,
        z: f64,
    },
    PayloadRepetition {
        fraction: f64,
    },
    IpRotation {
        distinct_ips: usize,
    },
    SharedUserAgent {
        distinct_ips: usize,
    },
    HighFrequency {
        peak_per_second: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub kind: PatternKind,
    pub risk: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternAssessment {
    pub risk: f64,
    pub attack_type: Option<AttackType>,
    pub patterns: Vec<DetectedPattern>,
}

// ==================== DETECTOR ====================

pub struct PatternDetector {
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, events: &[Event]) -> PatternAssessment {
        if events.len() < 3 {
            return PatternAssessment::default();
        }

        let mut patterns = Vec::new();
        patterns.extend(self.detect_sequences(events));
        patterns.extend(detect_temporal(events));

        let mut attack_type: Option<AttackType> = None;
        let mut attack_risk = 0.0;
        for pattern in detect_known_attacks(events) {
            if let PatternKind::KnownAttack { attack, .. } = pattern.kind {
                if pattern.risk > attack_risk {
                    attack_risk = pattern.risk;
                    attack_type = Some(attack);
                }
            }
            patterns.push(pattern);
        }

        patterns.extend(detect_anomalous(events));

        let risks: Vec<f64> = patterns.iter().map(|p| p.risk).collect();
        let max = risks.iter().cloned().fold(0.0, f64::max);
        let risk = if risks.is_empty() {
            0.0
        } else {
            clamp01(0.6 * max + 0.3 * mean(&risks) + (risks.len() as f64 / 10.0).min(0.2))
        };

        PatternAssessment {
            risk,
            attack_type,
            patterns,
        }
    }

    /// Repeated action sub-sequences of length 2..=min(10, n/2) occurring
    /// at least `significance` times. Regularly spaced occurrences raise
    /// the risk.
    fn detect_sequences(&self, events: &[Event]) -> Vec<DetectedPattern> {
        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        let n = actions.len();
        let max_len = self.config.max_sequence_len.min(n / 2);
        if max_len < 2 {
            return Vec::new();
        }

        let mut found = Vec::new();
        for len in 2..=max_len {
            let mut occurrences: HashMap<Vec<&str>, Vec<u64>> = HashMap::new();
            for start in 0..=(n - len) {
                let window: Vec<&str> = actions[start..start + len].to_vec();
                occurrences
                    .entry(window)
                    .or_default()
                    .push(events[start].timestamp_ms);
            }

            for (window, starts) in occurrences {
                if starts.len() < self.config.significance {
                    continue;
                }
                let gaps = intervals(&starts);
                let regular = gaps.len() >= 2 && coefficient_of_variation(&gaps) < 0.2;
                let risk = clamp01(
                    (starts.len() as f64).log2() / 10.0
                        + 0.3 * len as f64 / max_len as f64
                        + if regular { 0.3 } else { 0.0 },
                );
                found.push(DetectedPattern {
                    kind: PatternKind::Sequence {
                        actions: window.iter().map(|s| s.to_string()).collect(),
                        count: starts.len(),
                    },
                    risk,
                });
            }
        }

        found.sort_by(|a, b| b.risk.partial_cmp(&a.risk).unwrap_or(std::cmp::Ordering::Equal));
        found.truncate(self.config.max_patterns);
        found
    }
}

// ==================== TEMPORAL ANALYSIS ====================

fn detect_temporal(events: &[Event]) -> Vec<DetectedPattern> {
    let timestamps: Vec<u64> = events.iter().map(|e| e.timestamp_ms).collect();
    let iv = intervals(&timestamps);
    let mut found = Vec::new();
    if iv.is_empty() {
        return found;
    }

    // Periodicity: the dominant 100 ms interval bucket.
    let mut buckets: HashMap<i64, usize> = HashMap::new();
    for &i in &iv {
        *buckets.entry((i / 100.0).round() as i64).or_insert(0) += 1;
    }
    if let Some((&bucket, &count)) = buckets.iter().max_by_key(|(_, &c)| c) {
        let confidence = count as f64 / iv.len() as f64;
        if confidence >= 0.3 {
            found.push(DetectedPattern {
                kind: PatternKind::Periodicity {
                    interval_ms: (bucket * 100).max(0) as u64,
                    confidence,
                },
                risk: clamp01(0.6 * confidence),
            });
        }
    }

    // Bursts: runs of 5+ events with inter-arrival below a fifth of the
    // average interval.
    let avg = mean(&iv);
    if avg > 0.0 {
        let threshold = avg * 0.2;
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for (i, &interval) in iv.iter().enumerate() {
            if interval < threshold {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
            } else {
                if run_len + 1 >= 5 {
                    found.push(burst_pattern(&timestamps, run_start, run_len));
                }
                run_len = 0;
            }
        }
        if run_len + 1 >= 5 {
            found.push(burst_pattern(&timestamps, run_start, run_len));
        }
    }

    // Clock alignment: timestamps landing exactly on second/minute/hour
    // boundaries.
    for unit in [1_000u64, 60_000, 3_600_000] {
        let aligned = timestamps.iter().filter(|&&t| t % unit == 0).count();
        let fraction = aligned as f64 / timestamps.len() as f64;
        if fraction > 0.3 {
            found.push(DetectedPattern {
                kind: PatternKind::ClockAlignment {
                    unit_ms: unit,
                    fraction,
                },
                risk: clamp01(fraction * 0.8),
            });
        }
    }

    found
}

fn burst_pattern(timestamps: &[u64], run_start: usize, run_len: usize) -> DetectedPattern {
    // A run of `run_len` burst intervals spans `run_len + 1` events.
    let count = run_len + 1;
    let first = timestamps[run_start];
    let last = timestamps[run_start + run_len];
    let duration_ms = last.saturating_sub(first);
    let rate_per_sec = if duration_ms > 0 {
        count as f64 * 1000.0 / duration_ms as f64
    } else {
        count as f64 * 1000.0
    };
    DetectedPattern {
        kind: PatternKind::Burst {
            count,
            duration_ms,
            rate_per_sec,
        },
        risk: clamp01(0.4 + count as f64 / 50.0 + rate_per_sec / 100.0),
    }
}

// ==================== KNOWN ATTACKS ====================

fn detect_known_attacks(events: &[Event]) -> Vec<DetectedPattern> {
    let mut found = Vec::new();

    for signature in ATTACK_REGISTRY.iter() {
        let matching: Vec<&Event> = events
            .iter()
            .filter(|e| signature.pattern.is_match(&e.endpoint) || signature.pattern.is_match(&e.action))
            .collect();
        if matching.len() < signature.min_repetitions {
            continue;
        }

        let timestamps: Vec<u64> = matching.iter().map(|e| e.timestamp_ms).collect();
        let gaps = intervals(&timestamps);

        if let Some(max_interval) = signature.max_interval_ms {
            if percentile(&gaps, 50.0) > max_interval as f64 {
                continue;
            }
        }
        if signature.sequential_ids && !ids_are_sequential(&matching) {
            continue;
        }

        let mut bonus = 1.0;
        if signature.low_variance_bonus && !gaps.is_empty() && coefficient_of_variation(&gaps) < 0.3 {
            bonus *= 1.2;
        }

        let base = matching.len() as f64 / (3.0 * signature.min_repetitions as f64);
        found.push(DetectedPattern {
            kind: PatternKind::KnownAttack {
                attack: signature.attack,
                match_count: matching.len(),
            },
            risk: clamp01(base * signature.risk_multiplier * bonus),
        });
    }

    found
}

/// True when at least 70% of consecutive trailing numeric path ids step
/// by exactly one.
fn ids_are_sequential(events: &[&Event]) -> bool {
    let ids: Vec<i64> = events.iter().filter_map(|e| trailing_id(&e.endpoint)).collect();
    if ids.len() < 3 {
        return false;
    }
    let sequential = ids.windows(2).filter(|w| w[1] - w[0] == 1).count();
    sequential as f64 / (ids.len() - 1) as f64 >= 0.7
}

fn trailing_id(endpoint: &str) -> Option<i64> {
    let digits: String = endpoint
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    digits.parse().ok()
}

// ==================== ANOMALOUS & COORDINATED ====================

fn detect_anomalous(events: &[Event]) -> Vec<DetectedPattern> {
    let mut found = Vec::new();
    let n = events.len();

    // An endpoint hammered far beyond the caller's own distribution.
    let mut per_endpoint: HashMap<&str, usize> = HashMap::new();
    for event in events {
        *per_endpoint.entry(event.endpoint.as_str()).or_insert(0) += 1;
    }
    if per_endpoint.len() >= 3 {
        let counts: Vec<f64> = per_endpoint.values().map(|&c| c as f64).collect();
        let (m, s) = (mean(&counts), std_dev(&counts));
        if s > 0.0 {
            for (&endpoint, &count) in &per_endpoint {
                let z = (count as f64 - m) / s;
                if z > 3.0 {
                    found.push(DetectedPattern {
                        kind: PatternKind::EndpointAnomaly {
                            endpoint: endpoint.to_string(),
                            z,
                        },
                        risk: clamp01(0.3 + z / 10.0),
                    });
                }
            }
        }
    }

    // Identical payload sizes repeated across most of the traffic.
    if n >= 10 {
        let mut sizes: HashMap<u64, usize> = HashMap::new();
        for event in events {
            *sizes.entry(event.payload_size).or_insert(0) += 1;
        }
        let top = sizes.values().copied().max().unwrap_or(0);
        let fraction = top as f64 / n as f64;
        if fraction > 0.8 && sizes.len() > 1 {
            found.push(DetectedPattern {
                kind: PatternKind::PayloadRepetition { fraction },
                risk: 0.5,
            });
        }
    }

    // One identity rotating through source addresses.
    let distinct_ips: std::collections::HashSet<&str> =
        events.iter().map(|e| e.ip.as_str()).collect();
    if n >= 10 && distinct_ips.len() >= 5 && distinct_ips.len() as f64 / n as f64 > 0.5 {
        found.push(DetectedPattern {
            kind: PatternKind::IpRotation {
                distinct_ips: distinct_ips.len(),
            },
            risk: 0.6,
        });
    }

    // Many addresses presenting one user agent.
    let distinct_uas: std::collections::HashSet<&str> = events
        .iter()
        .map(|e| e.user_agent.as_str())
        .filter(|ua| !ua.is_empty())
        .collect();
    if distinct_uas.len() == 1 && distinct_ips.len() >= 5 {
        found.push(DetectedPattern {
            kind: PatternKind::SharedUserAgent {
                distinct_ips: distinct_ips.len(),
            },
            risk: 0.5,
        });
    }

    // Raw per-second frequency spikes.
    let mut per_second: HashMap<u64, usize> = HashMap::new();
    for event in events {
        *per_second.entry(event.timestamp_ms / 1_000).or_insert(0) += 1;
    }
    if let Some(&peak) = per_second.values().max() {
        if peak > 20 {
            found.push(DetectedPattern {
                kind: PatternKind::HighFrequency {
                    peak_per_second: peak,
                },
                risk: 0.7,
            });
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> PatternDetector {
        PatternDetector::new(PatternConfig::default())
    }

    fn event(timestamp_ms: u64, action: &str, endpoint: &str, ip: &str) -> Event {
        Event {
            timestamp_ms,
            action: action.to_string(),
            endpoint: endpoint.to_string(),
            ip: ip.to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            response_time_ms: None,
            payload_size: 256,
            status_code: Some(401),
            method: "POST".to_string(),
        }
    }

    #[test]
    fn test_brute_force_login_detected() {
        let events: Vec<Event> = (0..30)
            .map(|i| event(1_000_000 + i * 500, "login", "/api/login", "1.2.3.4"))
            .collect();
        let assessment = detector().detect(&events);
        assert_eq!(assessment.attack_type, Some(AttackType::BruteForce));
        assert!(assessment.risk >= 0.6, "risk {}", assessment.risk);
        assert!(assessment
            .patterns
            .iter()
            .any(|p| matches!(p.kind, PatternKind::KnownAttack { attack: AttackType::BruteForce, .. })));
    }

    #[test]
    fn test_periodicity_detected_on_fixed_spacing() {
        let events: Vec<Event> = (0..50)
            .map(|i| event(1_000_000 + i * 1_000, "poll", "/status", "1.2.3.4"))
            .collect();
        let assessment = detector().detect(&events);
        let periodic = assessment
            .patterns
            .iter()
            .find_map(|p| match &p.kind {
                PatternKind::Periodicity {
                    interval_ms,
                    confidence,
                } => Some((*interval_ms, *confidence)),
                _ => None,
            })
            .expect("periodicity pattern");
        assert_eq!(periodic.0, 1_000);
        assert!(periodic.1 > 0.9);
    }

    #[test]
    fn test_clock_alignment_on_second_boundaries() {
        // Timestamps exactly on second boundaries.
        let events: Vec<Event> = (0..20)
            .map(|i| event(1_000_000 + i * 1_000, "tick", "/cron", "1.2.3.4"))
            .collect();
        let assessment = detector().detect(&events);
        assert!(assessment
            .patterns
            .iter()
            .any(|p| matches!(p.kind, PatternKind::ClockAlignment { unit_ms: 1_000, .. })));
    }

    #[test]
    fn test_burst_detection() {
        // Sparse traffic with a dense 10-event burst in the middle.
        let mut events = Vec::new();
        for i in 0..10u64 {
            events.push(event(1_000_000 + i * 10_000, "view", "/page", "1.2.3.4"));
        }
        let burst_base = 1_000_000 + 9 * 10_000;
        for i in 1..=10u64 {
            events.push(event(burst_base + i * 20, "view", "/page", "1.2.3.4"));
        }
        for i in 0..5u64 {
            events.push(event(burst_base + 1_000 + (i + 1) * 10_000, "view", "/page", "1.2.3.4"));
        }
        let assessment = detector().detect(&events);
        let burst = assessment
            .patterns
            .iter()
            .find(|p| matches!(p.kind, PatternKind::Burst { .. }))
            .expect("burst pattern");
        assert!(burst.risk > 0.4);
    }

    #[test]
    fn test_enumeration_requires_sequential_ids() {
        let sequential: Vec<Event> = (0..12)
            .map(|i| {
                event(
                    1_000_000 + i * 300,
                    "fetch",
                    &format!("/users/{}", 100 + i),
                    "1.2.3.4",
                )
            })
            .collect();
        let assessment = detector().detect(&sequential);
        assert!(assessment
            .patterns
            .iter()
            .any(|p| matches!(p.kind, PatternKind::KnownAttack { attack: AttackType::Enumeration, .. })));

        // Same endpoints in random id order: not enumeration.
        let scattered: Vec<Event> = [907, 3, 511, 42, 777, 13, 1009, 256, 88, 671, 4, 350]
            .iter()
            .enumerate()
            .map(|(i, id)| {
                event(
                    1_000_000 + i as u64 * 300,
                    "fetch",
                    &format!("/users/{id}"),
                    "1.2.3.4",
                )
            })
            .collect();
        let assessment = detector().detect(&scattered);
        assert!(!assessment
            .patterns
            .iter()
            .any(|p| matches!(p.kind, PatternKind::KnownAttack { attack: AttackType::Enumeration, .. })));
    }

    #[test]
    fn test_ip_rotation_flagged() {
        let events: Vec<Event> = (0..12)
            .map(|i| {
                event(
                    1_000_000 + i * 700,
                    "login",
                    "/api/login",
                    &format!("10.0.{}.{}", i, i + 1),
                )
            })
            .collect();
        let assessment = detector().detect(&events);
        assert!(assessment
            .patterns
            .iter()
            .any(|p| matches!(p.kind, PatternKind::IpRotation { .. })));
        assert!(assessment
            .patterns
            .iter()
            .any(|p| matches!(p.kind, PatternKind::SharedUserAgent { .. })));
    }

    #[test]
    fn test_high_frequency_bucket() {
        let events: Vec<Event> = (0..30)
            .map(|i| event(1_000_000 + i * 10, "spam", "/api/msg", "1.2.3.4"))
            .collect();
        let assessment = detector().detect(&events);
        assert!(assessment
            .patterns
            .iter()
            .any(|p| matches!(p.kind, PatternKind::HighFrequency { .. })));
    }

    #[test]
    fn test_benign_traffic_low_risk() {
        // Irregular spacing, no action 2-gram recurs three times.
        let actions = [
            "view", "search", "click", "read", "view", "compare", "click", "browse", "read",
            "search", "view", "click", "compare", "read", "browse", "view", "search", "browse",
        ];
        let endpoints = ["/home", "/faq", "/about", "/blog", "/contact", "/pricing"];
        let events: Vec<Event> = (0..18u64)
            .map(|i| {
                event(
                    1_000_000 + i * 4_777 + (i * i * 13) % 900,
                    actions[i as usize],
                    endpoints[(i as usize * 5) % endpoints.len()],
                    "84.20.1.9",
                )
            })
            .collect();
        let assessment = detector().detect(&events);
        assert_eq!(assessment.attack_type, None);
        assert!(assessment.risk < 0.5, "risk {}", assessment.risk);
    }

    #[test]
    fn test_sequence_mining_caps_output() {
        let events: Vec<Event> = (0..60)
            .map(|i| {
                let action = if i % 3 == 0 { "add" } else if i % 3 == 1 { "set" } else { "commit" }
                    .to_string();
                event(1_000_000 + i * 250, &action, "/api/cart", "1.2.3.4")
            })
            .collect();
        let assessment = detector().detect(&events);
        let sequences = assessment
            .patterns
            .iter()
            .filter(|p| matches!(p.kind, PatternKind::Sequence { .. }))
            .count();
        assert!(sequences > 0);
        assert!(sequences <= PatternConfig::default().max_patterns);
    }

    #[test]
    fn test_risk_bounded() {
        let events: Vec<Event> = (0..200)
            .map(|i| event(1_000_000 + i * 5, "login", "/api/login", "1.2.3.4"))
            .collect();
        let assessment = detector().detect(&events);
        assert!((0.0..=1.0).contains(&assessment.risk));
        for pattern in &assessment.patterns {
            assert!((0.0..=1.0).contains(&pattern.risk));
        }
    }
}
