// Device/client fingerprinting. Derives a stable FNV-1a hash from the
// request's significant components, parses the user agent, classifies the
// source IP, and scores configuration anomalies and bot likelihood.
//
// Missing components are never errors: they lower confidence and, in
// combination, raise the anomaly score.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::request::RequestRecord;
use crate::stats::clamp01;
use crate::store::MemoryStore;

const HISTORY_LIMIT: usize = 100;
const STABILITY_WINDOW: usize = 10;
const STABILITY_MAX_DISTINCT: usize = 3;
const UA_CACHE_SIZE: usize = 1024;

/// Browser-automation frameworks plus non-browser HTTP clients. Anything
/// matching is a bot regardless of the rest of the fingerprint.
static BOT_UA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(bot|crawler|spider|scraper|headless|phantom|selenium|puppeteer|playwright|webdriver|python-requests|python-urllib|aiohttp|scrapy|curl/|wget/|libwww|java/|okhttp|go-http-client)",
    )
    .expect("bot pattern compiles")
});

/// Datacenter address space by leading prefix. Coarse on purpose: the
/// signal is weighted, not decisive.
const DATACENTER_PREFIXES: &[&str] = &[
    "3.", "13.", "18.", "23.", "34.", "35.", "44.", "52.", "54.", "64.62.", "66.249.",
    "104.131.", "134.209.", "138.68.", "142.93.", "157.245.", "159.65.", "165.227.",
    "167.99.", "178.62.", "188.166.", "192.241.", "198.199.", "206.189.",
];

// ==================== CLASSIFICATION TYPES ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Browser {
    Chrome,
    Firefox,
    Safari,
    Edge,
    Opera,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Os {
    Windows,
    MacOs,
    Linux,
    Android,
    Ios,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpClass {
    Private,
    Datacenter,
    Residential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedUserAgent {
    pub browser: Browser,
    pub major_version: Option<u32>,
    pub os: Os,
    pub device: DeviceClass,
    pub is_bot: bool,
}

/// Significant components feeding the fingerprint hash, kept for
/// component-wise comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FingerprintComponents {
    pub user_agent: Option<String>,
    pub ip_prefix: Option<String>,
    pub languages: Option<String>,
    pub timezone: Option<String>,
    pub screen: Option<String>,
    pub platform: Option<String>,
    pub canvas: Option<String>,
    pub webgl: Option<String>,
    pub plugins: Option<String>,
    pub fonts: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// 32-bit FNV-1a of the joined components, hex encoded.
    pub hash: String,
    pub components: FingerprintComponents,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintAssessment {
    pub fingerprint: Fingerprint,
    pub parsed_ua: ParsedUserAgent,
    pub ip_class: IpClass,
    pub anomaly_score: f64,
    pub bot_score: f64,
    pub is_bot: bool,
    /// Anomalous configuration or churning fingerprint history.
    pub suspicious: bool,
    pub stable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryEntry {
    hash: String,
    timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FingerprintMatch {
    pub similarity: f64,
    pub matched: bool,
}

// ==================== HASHING ====================

/// 32-bit FNV-1a (offset 0x811c9dc5, prime 0x01000193).
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn fnv_hex(data: &str) -> String {
    format!("{:08x}", fnv1a_32(data.as_bytes()))
}

// ==================== FINGERPRINTER ====================

pub struct Fingerprinter {
    store: Arc<MemoryStore>,
    ua_cache: Mutex<LruCache<String, ParsedUserAgent>>,
}

impl Fingerprinter {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            ua_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(UA_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Full per-request assessment: fingerprint, UA/IP classification,
    /// anomaly and bot scores, and stability against the identity's
    /// fingerprint history.
    pub fn assess(&self, request: &RequestRecord, identity: &str, now: u64) -> FingerprintAssessment {
        let fingerprint = self.generate(request);
        let parsed_ua = self.parse_user_agent(request.user_agent());
        let ip_class = classify_ip(&request.ip);
        let anomaly_score = anomaly_score(request, &parsed_ua, ip_class);
        let bot_score = bot_score(request, &parsed_ua, ip_class);
        let stable = self.record_and_check_stability(identity, &fingerprint.hash, now);

        FingerprintAssessment {
            is_bot: bot_score > 0.7,
            suspicious: anomaly_score >= 0.5 || !stable,
            parsed_ua,
            ip_class,
            anomaly_score,
            bot_score,
            stable,
            fingerprint,
        }
    }

    /// Deterministic fingerprint over the significant components joined
    /// with `|`. Unchanged input produces a byte-identical hash.
    pub fn generate(&self, request: &RequestRecord) -> Fingerprint {
        let client = request.client.as_ref();
        let components = FingerprintComponents {
            user_agent: request.user_agent().map(fnv_hex),
            ip_prefix: ip_prefix(&request.ip).map(|p| fnv_hex(&p)),
            languages: request.accept_language().map(|l| primary_languages(l)),
            timezone: client.and_then(|c| c.timezone.clone()),
            screen: client.and_then(|c| c.screen_resolution.clone()),
            platform: client.and_then(|c| c.platform.clone()),
            canvas: client.and_then(|c| c.canvas_hash.clone()),
            webgl: client.and_then(|c| c.webgl_hash.clone()),
            plugins: client
                .and_then(|c| c.plugins.as_ref())
                .map(|p| fnv_hex(&sorted_join(p))),
            fonts: client
                .and_then(|c| c.fonts.as_ref())
                .map(|f| fnv_hex(&sorted_join(f))),
        };

        let joined = [
            components.user_agent.as_deref().unwrap_or(""),
            components.ip_prefix.as_deref().unwrap_or(""),
            components.languages.as_deref().unwrap_or(""),
            components.timezone.as_deref().unwrap_or(""),
            components.screen.as_deref().unwrap_or(""),
            components.platform.as_deref().unwrap_or(""),
            components.canvas.as_deref().unwrap_or(""),
            components.webgl.as_deref().unwrap_or(""),
            components.plugins.as_deref().unwrap_or(""),
            components.fonts.as_deref().unwrap_or(""),
        ]
        .join("|");

        Fingerprint {
            hash: fnv_hex(&joined),
            confidence: confidence(request),
            components,
        }
    }

    /// Parse (and cache) a user-agent string.
    pub fn parse_user_agent(&self, ua: Option<&str>) -> ParsedUserAgent {
        let Some(ua) = ua else {
            return ParsedUserAgent {
                browser: Browser::Unknown,
                major_version: None,
                os: Os::Unknown,
                device: DeviceClass::Desktop,
                is_bot: false,
            };
        };

        if let Some(parsed) = self.ua_cache.lock().get(ua) {
            return parsed.clone();
        }
        let parsed = parse_user_agent(ua);
        self.ua_cache.lock().put(ua.to_string(), parsed.clone());
        parsed
    }

    /// Component-wise comparison of two fingerprints. Exact hash match is
    /// similarity 1; otherwise string fields contribute their normalized
    /// edit-distance similarity under the component weights.
    pub fn compare(&self, a: &Fingerprint, b: &Fingerprint) -> FingerprintMatch {
        if a.hash == b.hash {
            return FingerprintMatch {
                similarity: 1.0,
                matched: true,
            };
        }

        let pairs: [(&Option<String>, &Option<String>, f64); 10] = [
            (&a.components.user_agent, &b.components.user_agent, 0.15),
            (&a.components.ip_prefix, &b.components.ip_prefix, 0.20),
            (&a.components.languages, &b.components.languages, 0.10),
            (&a.components.timezone, &b.components.timezone, 0.10),
            (&a.components.screen, &b.components.screen, 0.10),
            (&a.components.platform, &b.components.platform, 0.05),
            (&a.components.canvas, &b.components.canvas, 0.05),
            (&a.components.webgl, &b.components.webgl, 0.05),
            (&a.components.plugins, &b.components.plugins, 0.05),
            (&a.components.fonts, &b.components.fonts, 0.05),
        ];

        let mut total_weight = 0.0;
        let mut score = 0.0;
        for (left, right, weight) in pairs {
            match (left, right) {
                (Some(l), Some(r)) => {
                    total_weight += weight;
                    score += weight * string_similarity(l, r);
                }
                (None, None) => {}
                _ => total_weight += weight,
            }
        }

        let similarity = if total_weight > 0.0 { score / total_weight } else { 0.0 };
        FingerprintMatch {
            similarity,
            matched: similarity > 0.8,
        }
    }

    /// Fingerprint history for an identity, oldest first.
    pub fn history(&self, identity: &str) -> Vec<String> {
        self.store
            .get_as::<Vec<HistoryEntry>>(&history_key(identity))
            .map(|entries| entries.into_iter().map(|e| e.hash).collect())
            .unwrap_or_default()
    }

    pub fn reset(&self, identity: &str) {
        self.store.delete(&history_key(identity));
    }

    /// Append the hash to the identity's history and evaluate stability:
    /// stable means fewer than 3 distinct fingerprints over the last 10
    /// observations.
    fn record_and_check_stability(&self, identity: &str, hash: &str, now: u64) -> bool {
        let key = history_key(identity);
        let entry = HistoryEntry {
            hash: hash.to_string(),
            timestamp_ms: now,
        };
        self.store.push(
            &key,
            serde_json::to_value(&entry).unwrap_or(serde_json::Value::Null),
            HISTORY_LIMIT,
        );

        let history = self
            .store
            .get_as::<Vec<HistoryEntry>>(&key)
            .unwrap_or_default();
        let recent: Vec<&str> = history
            .iter()
            .rev()
            .take(STABILITY_WINDOW)
            .map(|e| e.hash.as_str())
            .collect();
        let distinct: std::collections::HashSet<&str> = recent.iter().copied().collect();
        distinct.len() < STABILITY_MAX_DISTINCT
    }
}

fn history_key(identity: &str) -> String {
    format!("fingerprint:history:{identity}")
}

// ==================== USER AGENT PARSING ====================

fn parse_user_agent(ua: &str) -> ParsedUserAgent {
    let lower = ua.to_ascii_lowercase();

    let (browser, major_version) = if lower.contains("edg/") || lower.contains("edge/") {
        (Browser::Edge, version_after(&lower, &["edg/", "edge/"]))
    } else if lower.contains("opr/") || lower.contains("opera") {
        (Browser::Opera, version_after(&lower, &["opr/", "opera/"]))
    } else if lower.contains("chrome/") {
        (Browser::Chrome, version_after(&lower, &["chrome/"]))
    } else if lower.contains("firefox/") {
        (Browser::Firefox, version_after(&lower, &["firefox/"]))
    } else if lower.contains("safari/") && lower.contains("version/") {
        (Browser::Safari, version_after(&lower, &["version/"]))
    } else {
        (Browser::Unknown, None)
    };

    let os = if lower.contains("windows nt") {
        Os::Windows
    } else if lower.contains("iphone") || lower.contains("ipad") || lower.contains("ios") {
        Os::Ios
    } else if lower.contains("mac os x") || lower.contains("macintosh") {
        Os::MacOs
    } else if lower.contains("android") {
        Os::Android
    } else if lower.contains("linux") {
        Os::Linux
    } else {
        Os::Unknown
    };

    let device = if lower.contains("ipad") || lower.contains("tablet") {
        DeviceClass::Tablet
    } else if lower.contains("mobile") || lower.contains("iphone") || os == Os::Android {
        DeviceClass::Mobile
    } else {
        DeviceClass::Desktop
    };

    ParsedUserAgent {
        browser,
        major_version,
        os,
        device,
        is_bot: BOT_UA.is_match(ua),
    }
}

fn version_after(lower: &str, markers: &[&str]) -> Option<u32> {
    for marker in markers {
        if let Some(idx) = lower.find(marker) {
            let rest = &lower[idx + marker.len()..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(v) = digits.parse() {
                return Some(v);
            }
        }
    }
    None
}

// ==================== IP CLASSIFICATION ====================

pub fn classify_ip(ip: &str) -> IpClass {
    if ip.starts_with("10.")
        || ip.starts_with("192.168.")
        || ip.starts_with("127.")
        || is_private_172(ip)
    {
        return IpClass::Private;
    }
    if DATACENTER_PREFIXES.iter().any(|p| ip.starts_with(p)) {
        return IpClass::Datacenter;
    }
    IpClass::Residential
}

fn is_private_172(ip: &str) -> bool {
    let Some(rest) = ip.strip_prefix("172.") else {
        return false;
    };
    let Some((second, _)) = rest.split_once('.') else {
        return false;
    };
    matches!(second.parse::<u8>(), Ok(octet) if (16..=31).contains(&octet))
}

fn ip_prefix(ip: &str) -> Option<String> {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() == 4 {
        Some(format!("{}.{}.{}", octets[0], octets[1], octets[2]))
    } else {
        // Not IPv4; use the whole address as the prefix component.
        Some(ip.to_string())
    }
}

// ==================== SCORING ====================

fn anomaly_score(request: &RequestRecord, ua: &ParsedUserAgent, ip_class: IpClass) -> f64 {
    let client = request.client.as_ref();
    let mut score = 0.0;

    if ua.is_bot {
        score += 0.8;
    }
    if request.user_agent().is_none() {
        score += 0.3;
    }
    if ip_class == IpClass::Datacenter {
        score += 0.4;
    }
    if ua.browser == Browser::Chrome && matches!(ua.major_version, Some(v) if v < 70) {
        score += 0.2;
    }

    let timezone_missing = client.map_or(true, |c| c.timezone.is_none());
    let screen_missing = client.map_or(true, |c| c.screen_resolution.is_none());
    if timezone_missing && screen_missing {
        score += 0.3;
    }

    let canvas_missing = client.map_or(true, |c| c.canvas_hash.is_none());
    let webgl_missing = client.map_or(true, |c| c.webgl_hash.is_none());
    if canvas_missing && webgl_missing {
        score += 0.2;
    }

    if let Some((width, _)) = client.and_then(|c| c.screen_dimensions()) {
        if width > 3840 || width < 320 {
            score += 0.15;
        }
    }

    if ua.device == DeviceClass::Mobile
        && client.and_then(|c| c.touch_support) == Some(false)
    {
        score += 0.25;
    }

    let plugins_empty = client
        .and_then(|c| c.plugins.as_ref())
        .map_or(false, |p| p.is_empty());
    if plugins_empty && ua.browser == Browser::Chrome && ua.os == Os::Windows {
        score += 0.15;
    }

    if client.and_then(|c| c.cookies_enabled) == Some(false) {
        score += 0.1;
    }

    clamp01(score)
}

fn bot_score(request: &RequestRecord, ua: &ParsedUserAgent, ip_class: IpClass) -> f64 {
    let client = request.client.as_ref();
    let headless_chrome = request
        .user_agent()
        .map_or(false, |u| u.to_ascii_lowercase().contains("headlesschrome"));

    let mut score = 0.0;
    if ua.is_bot {
        score += 0.9;
    }
    if client.and_then(|c| c.has_js) == Some(false) {
        score += 0.7;
    }
    if client.and_then(|c| c.phantom_navigator) == Some(true) {
        score += 0.6;
    }
    if headless_chrome {
        score += 0.95;
    }
    if client.and_then(|c| c.webdriver) == Some(true) {
        score += 1.0;
    }
    if ip_class == IpClass::Datacenter {
        score += 0.3;
    }
    clamp01(score)
}

fn confidence(request: &RequestRecord) -> f64 {
    let client = request.client.as_ref();
    let mut score = 0.0;

    if request.user_agent().is_some() {
        score += 0.15;
    }
    if !request.ip.is_empty() {
        score += 0.20;
    }
    if client.and_then(|c| c.timezone.as_ref()).is_some() {
        score += 0.10;
    }
    if client.and_then(|c| c.screen_resolution.as_ref()).is_some() {
        score += 0.10;
    }
    if request.accept_language().is_some() {
        score += 0.10;
    }
    if request.headers.contains("accept-encoding") {
        score += 0.05;
    }
    if request.headers.contains("connection") {
        score += 0.05;
    }
    if client.and_then(|c| c.color_depth).is_some() {
        score += 0.05;
    }
    if client.and_then(|c| c.platform.as_ref()).is_some() {
        score += 0.05;
    }
    if client.and_then(|c| c.plugins.as_ref()).is_some() {
        score += 0.05;
    }
    if client.and_then(|c| c.canvas_hash.as_ref()).is_some() {
        score += 0.05 + 0.05;
    }
    if client.and_then(|c| c.webgl_hash.as_ref()).is_some() {
        score += 0.05 + 0.05;
    }
    if client.and_then(|c| c.fonts.as_ref()).is_some() {
        score += 0.03;
    }
    if client.and_then(|c| c.audio_hash.as_ref()).is_some() {
        score += 0.02;
    }
    clamp01(score)
}

// ==================== HELPERS ====================

fn primary_languages(accept_language: &str) -> String {
    let mut codes: Vec<String> = accept_language
        .split(',')
        .map(|part| {
            part.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .split('-')
                .next()
                .unwrap_or("")
                .to_ascii_lowercase()
        })
        .filter(|code| !code.is_empty())
        .collect();
    codes.sort();
    codes.dedup();
    codes.join(",")
}

fn sorted_join(items: &[String]) -> String {
    let mut sorted = items.to_vec();
    sorted.sort();
    sorted.join(",")
}

/// Normalized string similarity: `1 - editDistance / maxLen`.
fn string_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / max_len as f64
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
