//! GTFS-realtime client: one time-bounded cache per feed kind.
//!
//! A `get` on any kind serves the stored snapshot while it is younger than
//! the refresh period, otherwise it fetches, replaces the snapshot, and
//! returns the new one. Fetch-and-store is atomic per kind; the three kinds
//! are independent of each other.

pub mod merge;
pub mod model;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::Utc;
use chrono_tz::Tz;
use lazy_static::lazy_static;
use prost::Message;
use regex::Regex;

use crate::error::{Error, Result};

pub use model::{
    FeedAlert, FeedEntitySelector, FeedPosition, FeedStopTimeEvent, FeedStopTimeUpdate,
    FeedTimeRange, FeedTranslatedString, FeedTranslation, FeedTripDescriptor, FeedTripUpdate,
    FeedVehicle, FeedVehicleDescriptor,
};

lazy_static! {
    static ref FEED_URL_RE: Regex = Regex::new(
        r"^(http://www\.|https://www\.|http://|https://|/|//)?[A-Za-z0-9_-]*?[:]?[A-Za-z0-9_-]*?[@]?[A-Za-z0-9]+([\-.][a-z0-9]+)*\.[a-z]{2,5}(:[0-9]{1,5})?(/.*)?$"
    )
    .unwrap();
}

pub type VehicleMap = AHashMap<String, FeedVehicle>;
pub type TripUpdateMap = AHashMap<String, FeedTripUpdate>;

#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub api_key: String,
    pub api_header: String,
    pub refresh_period: Duration,
    pub vehicles_url: String,
    pub trip_updates_url: String,
    pub alerts_url: String,
    pub time_zone: Tz,
}

struct TimedCache<T> {
    inner: Mutex<CacheSlot<T>>,
}

struct CacheSlot<T> {
    snapshot: Option<T>,
    fetched_at: Option<Instant>,
}

impl<T: Clone> TimedCache<T> {
    fn new() -> Self {
        TimedCache {
            inner: Mutex::new(CacheSlot {
                snapshot: None,
                fetched_at: None,
            }),
        }
    }

    /// Return the snapshot while it is fresh, otherwise run `fetch` (which
    /// sees the prior snapshot, for merge policies) and store its result.
    /// The check-fetch-store sequence holds the lock, so concurrent callers
    /// of the same kind never race a fetch.
    fn get_with<F>(&self, refresh_period: Duration, fetch: F) -> Result<T>
    where
        F: FnOnce(Option<&T>) -> Result<T>,
    {
        let mut slot = self
            .inner
            .lock()
            .map_err(|_| Error::internal("realtime cache lock poisoned"))?;

        if let (Some(snapshot), Some(fetched_at)) = (&slot.snapshot, slot.fetched_at) {
            if fetched_at.elapsed() < refresh_period {
                return Ok(snapshot.clone());
            }
        }

        match fetch(slot.snapshot.as_ref()) {
            Ok(value) => {
                slot.snapshot = Some(value.clone());
                slot.fetched_at = Some(Instant::now());
                Ok(value)
            }
            Err(e) => {
                // The stale snapshot is kept for the next successful fetch
                // to merge against, but the caller sees the failure.
                log::warn!("realtime fetch failed: {e}");
                Err(e)
            }
        }
    }
}

pub struct RealtimeClient {
    config: RealtimeConfig,
    http: reqwest::blocking::Client,
    vehicles: TimedCache<VehicleMap>,
    trip_updates: TimedCache<TripUpdateMap>,
    alerts: TimedCache<Vec<FeedAlert>>,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::invalid_input("missing api key"));
        }
        if config.api_header.is_empty() {
            return Err(Error::invalid_input("missing api header"));
        }
        for (label, url) in [
            ("vehicles", &config.vehicles_url),
            ("trip updates", &config.trip_updates_url),
            ("alerts", &config.alerts_url),
        ] {
            if url.is_empty() || !FEED_URL_RE.is_match(url) {
                return Err(Error::invalid_input(format!("invalid {label} url: {url}")));
            }
        }

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(RealtimeClient {
            config,
            http,
            vehicles: TimedCache::new(),
            trip_updates: TimedCache::new(),
            alerts: TimedCache::new(),
        })
    }

    fn fetch_feed(&self, url: &str) -> Result<gtfs_realtime::FeedMessage> {
        let response = self
            .http
            .get(url)
            .header("Cache-Control", "no-cache")
            .header("Accept", "application/x-protobuf")
            .header(self.config.api_header.as_str(), self.config.api_key.as_str())
            .send()
            .map_err(|e| Error::transient(format!("realtime request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "realtime fetch returned HTTP {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .map_err(|e| Error::transient(format!("error reading realtime body: {e}")))?;

        let feed = gtfs_realtime::FeedMessage::decode(bytes.as_ref())
            .map_err(|e| Error::transient(format!("error decoding realtime protobuf: {e}")))?;

        if feed.entity.is_empty() {
            return Err(Error::transient(format!("empty realtime feed from {url}")));
        }

        Ok(feed)
    }

    /// Current vehicle positions keyed by trip id.
    pub fn get_vehicles(&self) -> Result<VehicleMap> {
        self.vehicles.get_with(self.config.refresh_period, |_| {
            let feed = self.fetch_feed(&self.config.vehicles_url)?;

            let mut vehicles = VehicleMap::new();
            for entity in feed.entity {
                let Some(vehicle_position) = entity.vehicle else {
                    continue;
                };
                let vehicle = FeedVehicle::from(vehicle_position);
                let key = vehicle
                    .trip
                    .as_ref()
                    .and_then(|t| t.trip_id.clone())
                    .unwrap_or_else(|| entity.id.clone());
                vehicles.insert(key, vehicle);
            }
            Ok(vehicles)
        })
    }

    /// Current trip updates keyed by trip id. Within a fetch the selection
    /// rule keeps one update per trip; across fetches the merge policy
    /// preserves historical stop-time entries.
    pub fn get_trip_updates(&self) -> Result<TripUpdateMap> {
        self.trip_updates.get_with(self.config.refresh_period, |prior| {
            let feed = self.fetch_feed(&self.config.trip_updates_url)?;

            let updates: Vec<FeedTripUpdate> = feed
                .entity
                .into_iter()
                .filter_map(|entity| entity.trip_update.map(FeedTripUpdate::from))
                .collect();

            let collapsed =
                merge::collapse_fetch(updates, self.config.time_zone, Utc::now());
            Ok(match prior {
                Some(cached) => merge::merge_caches(cached, collapsed),
                None => collapsed,
            })
        })
    }

    /// Current service alerts.
    pub fn get_alerts(&self) -> Result<Vec<FeedAlert>> {
        self.alerts.get_with(self.config.refresh_period, |_| {
            let feed = self.fetch_feed(&self.config.alerts_url)?;

            Ok(feed
                .entity
                .into_iter()
                .filter_map(|entity| {
                    let id = entity.id;
                    entity.alert.map(|alert| FeedAlert::from_entity(id, alert))
                })
                .collect())
        })
    }

    pub fn get_vehicle_by_trip_id(&self, trip_id: &str) -> Result<FeedVehicle> {
        self.get_vehicles()?
            .remove(trip_id)
            .ok_or_else(|| Error::not_found(format!("no vehicle found for trip {trip_id}")))
    }

    pub fn get_trip_update_by_trip_id(&self, trip_id: &str) -> Result<FeedTripUpdate> {
        self.get_trip_updates()?
            .remove(trip_id)
            .ok_or_else(|| Error::not_found(format!("no trip update found for trip {trip_id}")))
    }

    /// Alerts whose informed entities name the given route or stop id.
    pub fn get_alerts_for_entity(&self, route_or_stop_id: &str) -> Result<Vec<FeedAlert>> {
        let matching: Vec<FeedAlert> = self
            .get_alerts()?
            .into_iter()
            .filter(|alert| alert.informs(route_or_stop_id))
            .collect();

        if matching.is_empty() {
            return Err(Error::not_found(format!(
                "no alerts found for {route_or_stop_id}"
            )));
        }

        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            api_key: "secret".to_string(),
            api_header: "Ocp-Apim-Subscription-Key".to_string(),
            refresh_period: Duration::from_secs(15),
            vehicles_url: "https://api.example.co.nz/realtime/vehiclelocations".to_string(),
            trip_updates_url: "https://api.example.co.nz/realtime/tripupdates".to_string(),
            alerts_url: "https://api.example.co.nz/realtime/servicealerts".to_string(),
            time_zone: chrono_tz::Pacific::Auckland,
        }
    }

    #[test]
    fn client_construction_validates_inputs() {
        assert!(RealtimeClient::new(config()).is_ok());

        let mut no_key = config();
        no_key.api_key = String::new();
        assert!(matches!(
            RealtimeClient::new(no_key),
            Err(Error::InvalidInput(_))
        ));

        let mut bad_url = config();
        bad_url.alerts_url = "not a url".to_string();
        assert!(matches!(
            RealtimeClient::new(bad_url),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn fresh_snapshots_are_served_without_a_second_fetch() {
        let cache: TimedCache<u32> = TimedCache::new();
        let calls = AtomicUsize::new(0);
        let fetch = |_: Option<&u32>| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7u32)
        };

        let first = cache.get_with(Duration::from_secs(60), fetch).unwrap();
        let second = cache.get_with(Duration::from_secs(60), fetch).unwrap();
        assert_eq!(first, 7);
        assert_eq!(second, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_snapshots_trigger_a_refetch() {
        let cache: TimedCache<u32> = TimedCache::new();
        let calls = AtomicUsize::new(0);
        let fetch = |_: Option<&u32>| {
            Ok(calls.fetch_add(1, Ordering::SeqCst) as u32)
        };

        assert_eq!(cache.get_with(Duration::ZERO, fetch).unwrap(), 0);
        assert_eq!(cache.get_with(Duration::ZERO, fetch).unwrap(), 1);
    }

    #[test]
    fn failed_refetch_keeps_the_prior_snapshot_for_merging() {
        let cache: TimedCache<u32> = TimedCache::new();

        cache
            .get_with(Duration::ZERO, |_| Ok(5u32))
            .unwrap();
        let err = cache.get_with(Duration::ZERO, |_: Option<&u32>| {
            Err::<u32, _>(Error::transient("down"))
        });
        assert!(err.is_err());

        // The next successful fetch still sees the old snapshot.
        let merged = cache
            .get_with(Duration::ZERO, |prior| Ok(prior.copied().unwrap_or(0) + 1))
            .unwrap();
        assert_eq!(merged, 6);
    }
}
