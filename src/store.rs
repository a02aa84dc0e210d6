// In-process TTL-bounded key/value store. All per-identity mutable state
// (event lists, behavior profiles, fingerprint histories, rate-limiter
// buckets, reputation records) lives here under namespaced keys, so a
// networked backend can be substituted behind the same interface.
//
// Values are JSON documents; typed accessors round-trip closed structs
// through serde. Per-key operations are linearizable via the DashMap
// shard locks. Recency for eviction uses a logical access clock rather
// than wall time so "least recently used" is a strict order even when
// many touches land in the same millisecond.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::config::StoreConfig;
use crate::error::VigilError;
use crate::now_ms;

struct CacheEntry {
    value: Value,
    created_at: u64,
    expires_at: Option<u64>,
    /// Logical access clock value at last touch.
    touched: AtomicU64,
    access_count: AtomicU64,
}

impl CacheEntry {
    fn new(value: Value, created_at: u64, expires_at: Option<u64>, tick: u64) -> Self {
        Self {
            value,
            created_at,
            expires_at,
            touched: AtomicU64::new(tick),
            access_count: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Bookkeeping for one live entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMetadata {
    pub created_at_ms: u64,
    pub expires_at_ms: Option<u64>,
    pub access_count: u64,
}

/// Store counters. Hits, misses and evictions are monotone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub size: usize,
    pub hit_rate: f64,
}

/// Process-wide bounded store with TTL expiry and approximate-LRU
/// eviction on insert over capacity.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, CacheEntry>>,
    clock: Arc<AtomicU64>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    expired: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    sweeper_running: Arc<AtomicBool>,
    config: StoreConfig,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock: Arc::new(AtomicU64::new(1)),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            expired: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            sweeper_running: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert or replace `key`. `ttl` overrides the configured default;
    /// entries without either never expire. Inserting at capacity evicts
    /// the least-recently-accessed entry first.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = now_ms();
        if !self.entries.contains_key(key) && self.entries.len() >= self.config.capacity {
            self.evict_lru();
        }
        let ttl_ms = ttl
            .map(|d| d.as_millis() as u64)
            .or(self.config.default_ttl_ms);
        let expires_at = ttl_ms.map(|ms| now + ms);
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, now, expires_at, self.tick()));
    }

    /// Serialize `value` and store it under `key`.
    pub fn set_obj<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_value(value) {
            Ok(v) => self.set(key, v, ttl),
            Err(e) => warn!("store: failed to serialize value for {key}: {e}"),
        }
    }

    /// Fetch `key`, refreshing its recency and access count. An entry past
    /// its expiry is deleted and reported as a miss - it is never returned.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = now_ms();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.remove_expired(key, now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.touched.store(self.tick(), Ordering::Relaxed);
            entry.access_count.fetch_add(1, Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Typed fetch; type mismatch is treated as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Non-expired presence check without touching recency.
    pub fn has(&self, key: &str) -> bool {
        let now = now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if !entry.is_expired(now) {
                    return true;
                }
                true
            }
            None => false,
        };
        if expired {
            self.remove_expired(key, now);
        }
        false
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Lifecycle metadata for a live entry, without touching recency.
    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        let now = now_ms();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(EntryMetadata {
            created_at_ms: entry.created_at,
            expires_at_ms: entry.expires_at,
            access_count: entry.access_count.load(Ordering::Relaxed),
        })
    }

    /// Mutate the value under `key` in place. Returns false when the key
    /// is absent or expired.
    pub fn update<F: FnOnce(&mut Value)>(&self, key: &str, f: F) -> bool {
        let now = now_ms();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.remove_expired(key, now);
                return false;
            }
            f(&mut entry.value);
            entry.touched.store(self.tick(), Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Typed in-place update. Returns false without mutating when the key
    /// is absent, expired, or holds a value that does not deserialize as
    /// `T`.
    pub fn update_as<T, F>(&self, key: &str, f: F) -> bool
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let now = now_ms();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.remove_expired(key, now);
                return false;
            }
            let mut typed: T = match serde_json::from_value(entry.value.clone()) {
                Ok(t) => t,
                Err(_) => return false,
            };
            f(&mut typed);
            match serde_json::to_value(&typed) {
                Ok(v) => {
                    entry.value = v;
                    entry.touched.store(self.tick(), Ordering::Relaxed);
                    true
                }
                Err(_) => false,
            }
        } else {
            false
        }
    }

    /// Add `amount` to a numeric value, or to `field` of an object value.
    /// A missing key is created. Returns the new total, or `None` when the
    /// existing value is not numeric (nothing is mutated in that case).
    pub fn increment(&self, key: &str, field: Option<&str>, amount: f64) -> Option<f64> {
        let now = now_ms();
        if let Some(mut guard) = self.entries.get_mut(key) {
            if guard.is_expired(now) {
                drop(guard);
                self.remove_expired(key, now);
            } else {
                let entry = guard.value_mut();
                let next = match (field, &entry.value) {
                    (None, Value::Number(n)) => Some(n.as_f64().unwrap_or(0.0) + amount),
                    (Some(name), Value::Object(map)) => match map.get(name) {
                        Some(Value::Number(n)) => Some(n.as_f64().unwrap_or(0.0) + amount),
                        Some(_) => None,
                        None => Some(amount),
                    },
                    _ => None,
                }?;

                match (field, &mut entry.value) {
                    (None, _) => entry.value = json!(next),
                    (Some(name), Value::Object(map)) => {
                        map.insert(name.to_string(), json!(next));
                    }
                    _ => unreachable!("shape checked above"),
                }
                entry.touched.store(self.tick(), Ordering::Relaxed);
                return Some(next);
            }
        }

        let fresh = match field {
            None => json!(amount),
            Some(name) => json!({ name: amount }),
        };
        self.set(key, fresh, None);
        Some(amount)
    }

    /// Append to a list-valued entry, trimming oldest-first past `max_len`.
    /// A missing key becomes a fresh list; a non-list value returns false
    /// without mutation.
    pub fn push(&self, key: &str, value: Value, max_len: usize) -> bool {
        let now = now_ms();
        if let Some(mut guard) = self.entries.get_mut(key) {
            if guard.is_expired(now) {
                drop(guard);
                self.remove_expired(key, now);
            } else {
                let tick = self.tick();
                let entry = guard.value_mut();
                return match &mut entry.value {
                    Value::Array(list) => {
                        list.push(value);
                        while list.len() > max_len {
                            list.remove(0);
                        }
                        entry.touched.store(tick, Ordering::Relaxed);
                        true
                    }
                    _ => false,
                };
            }
        }
        self.set(key, Value::Array(vec![value]), None);
        true
    }

    /// Non-expired keys, optionally filtered by a pattern where `*`
    /// matches any run of characters.
    pub fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let now = now_ms();
        let matcher = pattern.map(|p| {
            let escaped = regex::escape(p).replace(r"\*", ".*");
            regex::Regex::new(&format!("^{escaped}$")).expect("escaped pattern is valid")
        });
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .filter(|key| matcher.as_ref().map_or(true, |m| m.is_match(key)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Sweep expired entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("store: swept {removed} expired entries");
        }
        removed
    }

    pub fn stats(&self) -> StoreStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        StoreStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    /// JSON snapshot of all live entries, keyed by cache key.
    pub fn export(&self) -> Value {
        let now = now_ms();
        let mut out = serde_json::Map::new();
        for entry in self.entries.iter() {
            if entry.value().is_expired(now) {
                continue;
            }
            let mut record = serde_json::Map::new();
            record.insert("value".into(), entry.value().value.clone());
            if let Some(at) = entry.value().expires_at {
                record.insert("expires_at_ms".into(), json!(at));
            }
            out.insert(entry.key().clone(), Value::Object(record));
        }
        Value::Object(out)
    }

    /// Re-hydrate entries from an [`export`](Self::export) snapshot,
    /// skipping any that have already expired. Returns the count imported.
    pub fn import(&self, snapshot: &Value) -> Result<usize, VigilError> {
        let now = now_ms();
        let map = snapshot
            .as_object()
            .ok_or_else(|| VigilError::Import("snapshot root must be an object".into()))?;
        let mut imported = 0;
        for (key, record) in map {
            let record = record
                .as_object()
                .ok_or_else(|| VigilError::Import(format!("entry {key} must be an object")))?;
            let value = record
                .get("value")
                .ok_or_else(|| VigilError::Import(format!("entry {key} is missing a value")))?
                .clone();
            let expires_at = record.get("expires_at_ms").and_then(Value::as_u64);
            if matches!(expires_at, Some(at) if at <= now) {
                continue;
            }
            if !self.entries.contains_key(key) && self.entries.len() >= self.config.capacity {
                self.evict_lru();
            }
            self.entries
                .insert(key.clone(), CacheEntry::new(value, now, expires_at, self.tick()));
            imported += 1;
        }
        Ok(imported)
    }

    /// Spawn the periodic TTL sweeper. Idempotent; stopped by
    /// [`shutdown`](Self::shutdown).
    pub fn start_sweeper(&self) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(store.config.cleanup_interval_ms));
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if store.shutdown.load(Ordering::Relaxed) {
                    trace!("store sweeper shutting down");
                    break;
                }
                store.cleanup();
            }
        });
    }

    /// Signal the sweeper to stop at its next tick.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn remove_expired(&self, key: &str, now: u64) {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some();
        if removed {
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict the entry with the minimum logical access tick. Linear scan:
    /// acceptable at the target sizes, and the recency order is exact.
    fn evict_lru(&self) {
        let mut oldest_tick = u64::MAX;
        let mut oldest_key: Option<String> = None;
        for entry in self.entries.iter() {
            let tick = entry.value().touched.load(Ordering::Relaxed);
            if tick < oldest_tick {
                oldest_tick = tick;
                oldest_key = Some(entry.key().clone());
            }
        }
        if let Some(key) = oldest_key {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!("store: evicted {key}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_capacity(capacity: usize) -> MemoryStore {
        MemoryStore::new(StoreConfig {
            capacity,
            default_ttl_ms: None,
            cleanup_interval_ms: 60_000,
        })
    }

    #[test]
    fn test_set_get_roundtrip() {
        let store = store_with_capacity(16);
        store.set("k", json!({"n": 1}), None);
        assert_eq!(store.get("k"), Some(json!({"n": 1})));
        assert!(store.has("k"));
        assert!(store.delete("k"));
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_expired_entry_never_returned() {
        let store = store_with_capacity(16);
        store.set("gone", json!(1), Some(Duration::from_millis(0)));
        assert_eq!(store.get("gone"), None);
        assert!(!store.has("gone"));
        // access deleted it
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let store = store_with_capacity(3);
        store.set("a", json!(1), None);
        store.set("b", json!(2), None);
        store.set("c", json!(3), None);
        // Touch a and c so b is strictly the least recently used.
        store.get("a");
        store.get("c");
        store.set("d", json!(4), None);
        assert!(store.has("a"));
        assert!(!store.has("b"));
        assert!(store.has("c"));
        assert!(store.has("d"));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_push_caps_list_and_rejects_non_list() {
        let store = store_with_capacity(16);
        for i in 0..5 {
            assert!(store.push("list", json!(i), 3));
        }
        assert_eq!(store.get("list"), Some(json!([2, 3, 4])));

        store.set("scalar", json!(7), None);
        assert!(!store.push("scalar", json!(0), 3));
        assert_eq!(store.get("scalar"), Some(json!(7)));
    }

    #[test]
    fn test_increment_number_and_field() {
        let store = store_with_capacity(16);
        assert_eq!(store.increment("count", None, 1.0), Some(1.0));
        assert_eq!(store.increment("count", None, 2.5), Some(3.5));

        assert_eq!(store.increment("obj", Some("hits"), 1.0), Some(1.0));
        assert_eq!(store.increment("obj", Some("hits"), 1.0), Some(2.0));
        assert_eq!(store.get("obj"), Some(json!({"hits": 2.0})));

        store.set("text", json!("nope"), None);
        assert_eq!(store.increment("text", None, 1.0), None);
        assert_eq!(store.get("text"), Some(json!("nope")));
    }

    #[test]
    fn test_update_as_type_mismatch_leaves_value() {
        let store = store_with_capacity(16);
        store.set("v", json!({"score": 0.5}), None);
        let touched = store.update_as::<Vec<u64>, _>("v", |list| list.push(1));
        assert!(!touched);
        assert_eq!(store.get("v"), Some(json!({"score": 0.5})));
    }

    #[test]
    fn test_keys_wildcard() {
        let store = store_with_capacity(16);
        store.set("events:alice", json!([]), None);
        store.set("events:bob", json!([]), None);
        store.set("reputation:alice", json!({}), None);

        let mut events = store.keys(Some("events:*"));
        events.sort();
        assert_eq!(events, vec!["events:alice", "events:bob"]);

        let alice = store.keys(Some("*:alice"));
        assert_eq!(alice.len(), 2);
        assert_eq!(store.keys(None).len(), 3);
    }

    #[test]
    fn test_stats_counters_monotone() {
        let store = store_with_capacity(16);
        store.set("k", json!(1), None);
        store.get("k");
        store.get("missing");
        let first = store.stats();
        assert_eq!(first.hits, 1);
        assert_eq!(first.misses, 1);
        assert!((first.hit_rate - 0.5).abs() < 1e-12);

        store.get("missing");
        let second = store.stats();
        assert!(second.hits >= first.hits);
        assert!(second.misses > first.misses);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let store = store_with_capacity(16);
        store.set("keep", json!({"a": 1}), None);
        store.set("expiring", json!(2), Some(Duration::from_secs(3600)));
        store.set("dead", json!(3), Some(Duration::from_millis(0)));

        let snapshot = store.export();
        let fresh = store_with_capacity(16);
        let imported = fresh.import(&snapshot).expect("import");
        assert_eq!(imported, 2);
        assert_eq!(fresh.get("keep"), Some(json!({"a": 1})));
        assert_eq!(fresh.get("expiring"), Some(json!(2)));
        assert_eq!(fresh.get("dead"), None);

        assert!(fresh.import(&json!("not an object")).is_err());
    }

    #[test]
    fn test_metadata_tracks_access_count() {
        let store = store_with_capacity(16);
        store.set("k", json!(1), None);
        store.get("k");
        store.get("k");
        let meta = store.metadata("k").expect("live entry");
        assert_eq!(meta.access_count, 2);
        assert!(meta.expires_at_ms.is_none());
        assert!(store.metadata("missing").is_none());
    }

    #[test]
    fn test_cleanup_sweeps_expired() {
        let store = store_with_capacity(16);
        store.set("a", json!(1), Some(Duration::from_millis(0)));
        store.set("b", json!(2), None);
        assert_eq!(store.cleanup(), 1);
        assert_eq!(store.len(), 1);
    }
}
