// Inbound adapter contract: the closed request/event structures the engine
// consumes. Framework adapters build a RequestRecord per request; every
// field beyond ip/method/path is optional and missing data degrades to
// weaker signals, never to an error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Case-insensitive header map. Keys are lowercased on insert so lookups
/// match regardless of the casing the adapter received.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Headers {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.insert(name, value);
        }
        headers
    }
}

/// Geographic coordinate supplied by the adapter (e.g. from a geo-IP
/// lookup it performed). The engine never resolves IPs itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Client-declared attributes gathered by an instrumentation script and
/// forwarded by the adapter. Everything is optional; absent fields lower
/// fingerprint confidence rather than failing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientHints {
    pub timezone: Option<String>,
    /// Screen resolution as "WIDTHxHEIGHT".
    pub screen_resolution: Option<String>,
    pub platform: Option<String>,
    pub color_depth: Option<u8>,
    pub touch_support: Option<bool>,
    pub cookies_enabled: Option<bool>,
    pub canvas_hash: Option<String>,
    pub webgl_hash: Option<String>,
    pub audio_hash: Option<String>,
    pub plugins: Option<Vec<String>>,
    pub fonts: Option<Vec<String>>,
    /// False when the instrumentation script never executed (no JS).
    pub has_js: Option<bool>,
    /// navigator.webdriver as reported by the client.
    pub webdriver: Option<bool>,
    /// window.callPhantom / navigator anomalies typical of PhantomJS.
    pub phantom_navigator: Option<bool>,
    pub geo: Option<GeoPoint>,
}

impl ClientHints {
    /// Parse "1920x1080" into (width, height).
    pub fn screen_dimensions(&self) -> Option<(u32, u32)> {
        let res = self.screen_resolution.as_deref()?;
        let (w, h) = res.split_once('x')?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }
}

/// One inbound request as seen by the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub ip: String,
    /// Caller-declared user id (e.g. from the request body or a client
    /// token the adapter has not verified).
    pub user_id: Option<String>,
    /// User id established by the adapter's authentication layer. Ranks
    /// below `user_id` in identity preference but above header hints.
    pub auth_user_id: Option<String>,
    pub session_id: Option<String>,
    pub method: String,
    pub path: String,
    /// Logical endpoint (route template), falls back to `path` when empty.
    pub endpoint: String,
    /// Logical action name ("login", "search", ...).
    pub action: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub query: Option<HashMap<String, String>>,
    pub client: Option<ClientHints>,
    /// Arrival time override in epoch milliseconds. `None` means the
    /// engine stamps the wall clock; tests and replay tooling inject
    /// explicit timestamps for determinism.
    pub timestamp_ms: Option<u64>,
    pub response_time_ms: Option<f64>,
    pub payload_size: u64,
    pub status_code: Option<u16>,
}

impl RequestRecord {
    /// Minimal record for the given ip/method/path; endpoint and action
    /// default from the path.
    pub fn new(ip: &str, method: &str, path: &str) -> Self {
        Self {
            ip: ip.to_string(),
            user_id: None,
            auth_user_id: None,
            session_id: None,
            method: method.to_string(),
            path: path.to_string(),
            endpoint: path.to_string(),
            action: path.trim_start_matches('/').replace('/', "_"),
            headers: Headers::new(),
            body: None,
            query: None,
            client: None,
            timestamp_ms: None,
            response_time_ms: None,
            payload_size: 0,
            status_code: None,
        }
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("user-agent")
    }

    pub fn accept_language(&self) -> Option<&str> {
        self.headers.get("accept-language")
    }
}

/// One recorded request in a caller's event history. This is the unit the
/// behavior analyzer and pattern detector consume; the per-identity list
/// is bounded to the most recent [`crate::config::EngineConfig::max_events`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub timestamp_ms: u64,
    pub action: String,
    pub endpoint: String,
    pub ip: String,
    pub user_agent: String,
    pub response_time_ms: Option<f64>,
    pub payload_size: u64,
    pub status_code: Option<u16>,
    pub method: String,
}

impl Event {
    pub fn from_request(request: &RequestRecord, timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            action: request.action.clone(),
            endpoint: request.endpoint.clone(),
            ip: request.ip.clone(),
            user_agent: request.user_agent().unwrap_or_default().to_string(),
            response_time_ms: request.response_time_ms,
            payload_size: request.payload_size,
            status_code: request.status_code,
            method: request.method.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let headers = Headers::from([("User-Agent", "Mozilla/5.0"), ("X-Forwarded-For", "1.2.3.4")]);
        assert_eq!(headers.get("user-agent"), Some("Mozilla/5.0"));
        assert_eq!(headers.get("USER-AGENT"), Some("Mozilla/5.0"));
        assert!(headers.contains("x-forwarded-for"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_screen_dimensions_parsing() {
        let hints = ClientHints {
            screen_resolution: Some("1920x1080".into()),
            ..Default::default()
        };
        assert_eq!(hints.screen_dimensions(), Some((1920, 1080)));

        let bad = ClientHints {
            screen_resolution: Some("huge".into()),
            ..Default::default()
        };
        assert_eq!(bad.screen_dimensions(), None);
    }

    #[test]
    fn test_event_from_request_defaults() {
        let mut request = RequestRecord::new("1.2.3.4", "GET", "/api/items");
        request.headers.insert("User-Agent", "Mozilla/5.0");
        let event = Event::from_request(&request, 1_000);
        assert_eq!(event.timestamp_ms, 1_000);
        assert_eq!(event.action, "api_items");
        assert_eq!(event.user_agent, "Mozilla/5.0");
    }
}
