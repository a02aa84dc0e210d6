// Per-user session lifecycle tracking. The engine feeds it the derived
// session id plus whatever geo hint the adapter supplied; the tracker
// keeps a bounded history and flags transitions that are physically
// implausible (two sessions too far apart for the elapsed time).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::GeoPoint;
use crate::store::MemoryStore;

const SESSION_HISTORY_LIMIT: usize = 20;
/// Commercial flight speed with margin; anything faster is not travel.
const MAX_PLAUSIBLE_SPEED_KMH: f64 = 900.0;
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub ip: String,
    pub geo: Option<GeoPoint>,
    pub started_at: u64,
    pub last_seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFlag {
    ImpossibleTravel {
        distance_km: f64,
        elapsed_ms: u64,
        speed_kmh: f64,
        risk: f64,
    },
}

impl SessionFlag {
    pub fn risk(&self) -> f64 {
        match self {
            SessionFlag::ImpossibleTravel { risk, .. } => *risk,
        }
    }
}

pub struct SessionTracker {
    store: Arc<MemoryStore>,
}

impl SessionTracker {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Record activity for (identity, session) and compare against the
    /// previous geo-located session. Missing geo hints degrade to a plain
    /// history update with no flag.
    pub fn track(
        &self,
        identity: &str,
        session_id: &str,
        ip: &str,
        geo: Option<GeoPoint>,
        now: u64,
    ) -> Option<SessionFlag> {
        let key = session_key(identity);
        if !self.store.has(&key) {
            self.store.set_obj(&key, &Vec::<SessionRecord>::new(), None);
        }

        let mut flag = None;
        self.store.update_as::<Vec<SessionRecord>, _>(&key, |history| {
            flag = match (geo, latest_located(history, session_id).and_then(|p| p.geo.map(|g| (p, g)))) {
                (Some(current), Some((previous, prev_geo))) => {
                    let distance_km = haversine_km(prev_geo, current);
                    let elapsed_ms = now.saturating_sub(previous.last_seen);
                    let hours = (elapsed_ms as f64 / 3_600_000.0).max(1.0 / 3600.0);
                    let speed_kmh = distance_km / hours;
                    if speed_kmh > MAX_PLAUSIBLE_SPEED_KMH && distance_km > 100.0 {
                        debug!(
                            "impossible travel for {identity}: {distance_km:.0} km in {elapsed_ms} ms"
                        );
                        Some(SessionFlag::ImpossibleTravel {
                            distance_km,
                            elapsed_ms,
                            speed_kmh,
                            risk: 0.8,
                        })
                    } else {
                        None
                    }
                }
                _ => None,
            };

            match history.iter_mut().rfind(|r| r.session_id == session_id) {
                Some(existing) => {
                    existing.last_seen = now;
                    existing.ip = ip.to_string();
                    if geo.is_some() {
                        existing.geo = geo;
                    }
                }
                None => {
                    history.push(SessionRecord {
                        session_id: session_id.to_string(),
                        ip: ip.to_string(),
                        geo,
                        started_at: now,
                        last_seen: now,
                    });
                    while history.len() > SESSION_HISTORY_LIMIT {
                        history.remove(0);
                    }
                }
            }
        });
        flag
    }

    pub fn sessions(&self, identity: &str) -> Vec<SessionRecord> {
        self.store.get_as(&session_key(identity)).unwrap_or_default()
    }

    pub fn reset(&self, identity: &str) {
        self.store.delete(&session_key(identity));
    }
}

fn session_key(identity: &str) -> String {
    format!("session:history:{identity}")
}

/// Most recent record from a *different* session that carries a geo hint.
fn latest_located<'a>(history: &'a [SessionRecord], current_session: &str) -> Option<&'a SessionRecord> {
    history
        .iter()
        .rev()
        .find(|r| r.geo.is_some() && r.session_id != current_session)
}

/// Great-circle distance between two coordinates.
fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    const PARIS: GeoPoint = GeoPoint {
        latitude: 48.8566,
        longitude: 2.3522,
    };
    const SYDNEY: GeoPoint = GeoPoint {
        latitude: -33.8688,
        longitude: 151.2093,
    };
    const VERSAILLES: GeoPoint = GeoPoint {
        latitude: 48.8049,
        longitude: 2.1204,
    };

    fn tracker() -> SessionTracker {
        SessionTracker::new(Arc::new(MemoryStore::new(StoreConfig::default())))
    }

    #[test]
    fn test_haversine_known_distance() {
        let d = haversine_km(PARIS, SYDNEY);
        assert!((16_000.0..18_000.0).contains(&d), "Paris-Sydney {d} km");
        assert!(haversine_km(PARIS, PARIS) < 1e-6);
    }

    #[test]
    fn test_impossible_travel_flagged() {
        let tracker = tracker();
        let base = 1_000_000;
        assert!(tracker
            .track("alice", "s1", "84.1.1.1", Some(PARIS), base)
            .is_none());

        // Second session 3 minutes later from the other side of the world.
        let flag = tracker
            .track("alice", "s2", "203.2.2.2", Some(SYDNEY), base + 3 * 60 * 1_000)
            .expect("impossible travel");
        assert!(flag.risk() >= 0.6);
        let SessionFlag::ImpossibleTravel { speed_kmh, .. } = flag;
        assert!(speed_kmh > MAX_PLAUSIBLE_SPEED_KMH);
    }

    #[test]
    fn test_nearby_session_not_flagged() {
        let tracker = tracker();
        let base = 1_000_000;
        tracker.track("bob", "s1", "84.1.1.1", Some(PARIS), base);
        let flag = tracker.track("bob", "s2", "84.1.1.2", Some(VERSAILLES), base + 60_000);
        assert!(flag.is_none());
    }

    #[test]
    fn test_missing_geo_degrades_silently() {
        let tracker = tracker();
        tracker.track("carol", "s1", "84.1.1.1", None, 1_000);
        assert!(tracker.track("carol", "s2", "9.9.9.9", None, 2_000).is_none());
        assert_eq!(tracker.sessions("carol").len(), 2);
    }

    #[test]
    fn test_same_session_updates_in_place() {
        let tracker = tracker();
        tracker.track("dave", "s1", "84.1.1.1", Some(PARIS), 1_000);
        // Same session moving impossibly is still the same session: the
        // comparison only considers *other* sessions.
        assert!(tracker
            .track("dave", "s1", "84.1.1.1", Some(SYDNEY), 2_000)
            .is_none());
        let sessions = tracker.sessions("dave");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].last_seen, 2_000);
    }

    #[test]
    fn test_history_bounded() {
        let tracker = tracker();
        for i in 0..30u64 {
            tracker.track("erin", &format!("s{i}"), "84.1.1.1", None, 1_000 + i);
        }
        assert_eq!(tracker.sessions("erin").len(), SESSION_HISTORY_LIMIT);
    }
}
