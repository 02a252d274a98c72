//! Trip-update selection and cross-fetch merge policy.
//!
//! Feeds sometimes carry several updates for the same trip (a late vehicle
//! colliding with the next day's scheduled run), and consecutive fetches
//! drop the stop-time entries of calls already made. The rules here keep
//! the authoritative update per trip and preserve historical stop-time
//! entries across fetches.

use ahash::AHashMap;
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;

use crate::gtfs_time::{parse_hms_to_secs, parse_service_date};

use super::model::{FeedStopTimeUpdate, FeedTripUpdate};

/// True when the update's scheduled start instant, resolved in the feed's
/// time zone, is at or before `now`. Updates without a parseable start are
/// treated as not started.
pub fn has_started(update: &FeedTripUpdate, tz: Tz, now: DateTime<Utc>) -> bool {
    let (Some(start_date), Some(start_time)) =
        (&update.trip.start_date, &update.trip.start_time)
    else {
        return false;
    };

    let Ok(date) = parse_service_date(start_date) else {
        return false;
    };
    let Ok(secs) = parse_hms_to_secs(start_time) else {
        return false;
    };

    let Some(midnight) = tz
        .from_local_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is always valid"))
        .earliest()
    else {
        return false;
    };

    // Start times beyond 24:00 resolve past local midnight, same as the
    // schedule tables.
    let start = midnight.with_timezone(&Utc) + Duration::seconds(secs);
    start <= now
}

/// Whether `candidate` should displace `incumbent` for the same trip id
/// within one fetch: a started update beats an unstarted one; among started
/// updates the larger timestamp wins; among unstarted updates the first
/// seen stays.
pub fn candidate_wins(
    incumbent: &FeedTripUpdate,
    candidate: &FeedTripUpdate,
    tz: Tz,
    now: DateTime<Utc>,
) -> bool {
    let incumbent_started = has_started(incumbent, tz, now);
    let candidate_started = has_started(candidate, tz, now);

    match (incumbent_started, candidate_started) {
        (false, true) => true,
        (true, false) => false,
        (true, true) => candidate.timestamp.unwrap_or(0) > incumbent.timestamp.unwrap_or(0),
        (false, false) => false,
    }
}

/// Collapse one fetch's updates into a per-trip map using the selection
/// rule. Updates without a trip id are dropped.
pub fn collapse_fetch(
    updates: Vec<FeedTripUpdate>,
    tz: Tz,
    now: DateTime<Utc>,
) -> AHashMap<String, FeedTripUpdate> {
    let mut by_trip: AHashMap<String, FeedTripUpdate> = AHashMap::new();

    for update in updates {
        let Some(trip_id) = update.trip.trip_id.clone() else {
            continue;
        };
        match by_trip.get(&trip_id) {
            Some(incumbent) if !candidate_wins(incumbent, &update, tz, now) => {}
            _ => {
                by_trip.insert(trip_id, update);
            }
        }
    }

    by_trip
}

/// StopTimeUpdates key primarily on stop_sequence, falling back to stop_id
/// for feeds that leave the sequence unset.
fn stop_time_update_key(update: &FeedStopTimeUpdate) -> String {
    match update.stop_sequence {
        Some(sequence) if sequence > 0 => format!("seq:{sequence}"),
        _ => format!("stop:{}", update.stop_id.as_deref().unwrap_or("")),
    }
}

/// Merge the cached and freshly fetched update for one trip. Top-level
/// fields follow the newer timestamp; the merged timestamp is the max of
/// both. StopTimeUpdates are unioned by key with fetched entries winning
/// collisions, then sorted by stop_sequence.
pub fn merge_trip_update(cached: &FeedTripUpdate, fetched: &FeedTripUpdate) -> FeedTripUpdate {
    let fetched_newer = fetched.timestamp.unwrap_or(0) >= cached.timestamp.unwrap_or(0);
    let newer = if fetched_newer { fetched } else { cached };

    let mut keyed: AHashMap<String, FeedStopTimeUpdate> = AHashMap::new();
    for update in &cached.stop_time_updates {
        keyed.insert(stop_time_update_key(update), update.clone());
    }
    for update in &fetched.stop_time_updates {
        keyed.insert(stop_time_update_key(update), update.clone());
    }

    let mut stop_time_updates: Vec<FeedStopTimeUpdate> = keyed.into_values().collect();
    stop_time_updates.sort_by_key(|u| u.stop_sequence.unwrap_or(0));

    FeedTripUpdate {
        trip: newer.trip.clone(),
        vehicle: newer.vehicle.clone(),
        stop_time_updates,
        timestamp: match (cached.timestamp, fetched.timestamp) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        },
        delay: newer.delay,
    }
}

/// Apply a collapsed fetch on top of the cached per-trip map. Trips present
/// in the cache but absent from the fetch are removed.
pub fn merge_caches(
    cached: &AHashMap<String, FeedTripUpdate>,
    fetched: AHashMap<String, FeedTripUpdate>,
) -> AHashMap<String, FeedTripUpdate> {
    fetched
        .into_iter()
        .map(|(trip_id, update)| {
            let merged = match cached.get(&trip_id) {
                Some(previous) => merge_trip_update(previous, &update),
                None => update,
            };
            (trip_id, merged)
        })
        .collect()
}
