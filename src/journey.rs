//! RAPTOR-style journey planning between two coordinates.
//!
//! The scan works in rounds over the day's trip table: each round boards
//! every trip at stops improved in the previous round and relaxes the
//! arrival time of every later stop on the trip. K transfers need K+1
//! rounds. Walking covers access and egress only; there are no
//! mid-journey walking transfers between stops.

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geomath::{haversine_km, walk_duration_secs};
use crate::gtfs_time::{format_service_date, parse_hms_to_secs, weekday_column};
use crate::models::{Route, Stop, StopWithDistance};
use crate::routes::get_routes;
use crate::shapes::{
    get_shape_by_trip_id, has_full_distance_annotation, segment_by_distance,
    segment_by_nearest_index, stop_shape_distance,
};
use crate::stops::get_stops;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JourneyRequest {
    pub start_lat: f64,
    pub start_lon: f64,
    pub end_lat: f64,
    pub end_lon: f64,
    pub depart_at: Option<DateTime<Utc>>,
    pub max_walk_km: f64,
    pub walk_speed_kmph: f64,
    pub max_transfers: u32,
    pub max_nearby_stops: usize,
    pub min_results: usize,
    pub max_results: usize,
    pub include_child_stops: bool,
    /// Base URL of an OSRM-compatible foot-routing service. Absent or
    /// unreachable, walk legs fall back to straight lines.
    pub walking_route_url: Option<String>,
}

impl Default for JourneyRequest {
    fn default() -> Self {
        JourneyRequest {
            start_lat: 0.0,
            start_lon: 0.0,
            end_lat: 0.0,
            end_lon: 0.0,
            depart_at: None,
            max_walk_km: 1.0,
            walk_speed_kmph: 4.8,
            max_transfers: 2,
            max_nearby_stops: 50,
            min_results: 0,
            max_results: 1,
            include_child_stops: false,
            walking_route_url: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegMode {
    Walk,
    Transit,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JourneyLeg {
    pub mode: LegMode,
    pub from_stop: Option<Stop>,
    pub to_stop: Option<Stop>,
    pub trip_id: String,
    pub route_id: String,
    pub route: Option<Route>,
    pub departure_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    pub duration_secs: i64,
    pub distance_km: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JourneyPlan {
    pub id: String,
    pub start_lat: f64,
    pub start_lon: f64,
    pub end_lat: f64,
    pub end_lon: f64,
    pub departure_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    pub total_duration_secs: i64,
    pub transfers: u32,
    pub transfer_stops: Vec<Stop>,
    pub legs: Vec<JourneyLeg>,
    pub route_geojson: FeatureCollection,
}

#[derive(Clone, Debug)]
struct TripCall {
    stop_id: String,
    arrival_sec: i64,
    departure_sec: i64,
    trip_id: String,
    route_id: String,
}

#[derive(Clone, Debug)]
enum Predecessor {
    WalkOrigin {
        arrive_sec: i64,
    },
    Transit {
        from_stop_id: String,
        trip_id: String,
        route_id: String,
        depart_sec: i64,
        arrive_sec: i64,
    },
}

const INF: i64 = i64::MAX / 4;

fn normalize_request(req: &JourneyRequest) -> JourneyRequest {
    let mut req = req.clone();
    if req.max_walk_km <= 0.0 {
        req.max_walk_km = 1.0;
    }
    if req.walk_speed_kmph <= 0.0 {
        req.walk_speed_kmph = 4.8;
    }
    if req.max_transfers == 0 {
        req.max_transfers = 2;
    }
    if req.max_nearby_stops == 0 {
        req.max_nearby_stops = 50;
    }
    if req.max_results == 0 {
        req.max_results = 1;
    }
    if req.min_results > 0 && req.max_results < req.min_results {
        req.max_results = req.min_results;
    }
    req
}

/// Stops within `max_distance_km` of a point, nearest first, capped.
fn filter_nearby_stops(
    stops: &[Stop],
    lat: f64,
    lon: f64,
    max_distance_km: f64,
    max_stops: usize,
) -> Vec<StopWithDistance> {
    let mut nearby: Vec<StopWithDistance> = stops
        .iter()
        .filter_map(|stop| {
            let distance_km = haversine_km(lat, lon, stop.stop_lat, stop.stop_lon);
            (distance_km <= max_distance_km).then(|| StopWithDistance {
                stop: stop.clone(),
                distance_km,
            })
        })
        .collect();

    nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    nearby.truncate(max_stops);
    nearby
}

/// The day's trip table: every scheduled call of every service active on the
/// date, keyed by trip, in stop-sequence order, with clock strings parsed to
/// seconds since the service day start. Boarding-forbidden and
/// alighting-forbidden calls are excluded up front.
fn load_day_trip_table(
    conn: &Connection,
    date: NaiveDate,
) -> Result<AHashMap<String, Vec<TripCall>>> {
    let day = format_service_date(date);
    let weekday = weekday_column(date);

    let sql = format!(
        "WITH active_services AS (
            SELECT service_id
            FROM calendar
            WHERE start_date <= ?1 AND end_date >= ?1 AND {weekday} = 1
            UNION ALL
            SELECT service_id
            FROM calendar_dates
            WHERE date = ?1 AND exception_type = 1
        ),
        removed_services AS (
            SELECT service_id
            FROM calendar_dates
            WHERE date = ?1 AND exception_type = 2
        ),
        adjusted_services AS (
            SELECT DISTINCT service_id
            FROM active_services
            WHERE service_id NOT IN (SELECT service_id FROM removed_services)
        )
        SELECT st.trip_id, t.route_id, st.stop_id, st.arrival_time, st.departure_time
        FROM stop_times st
        JOIN trips t ON st.trip_id = t.trip_id
        JOIN adjusted_services a ON t.service_id = a.service_id
        WHERE (st.drop_off_type = 0 OR st.drop_off_type IS NULL)
          AND (st.pickup_type = 0 OR st.pickup_type IS NULL)
        ORDER BY st.trip_id, st.stop_sequence"
    );

    let mut trips: AHashMap<String, Vec<TripCall>> = AHashMap::new();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![day], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    for row in rows {
        let (trip_id, route_id, stop_id, arrival_time, departure_time) = row?;
        let arrival_sec = parse_hms_to_secs(&arrival_time).unwrap_or(0);
        let departure_sec = parse_hms_to_secs(&departure_time).unwrap_or(arrival_sec);
        trips.entry(trip_id.clone()).or_default().push(TripCall {
            stop_id,
            arrival_sec,
            departure_sec,
            trip_id,
            route_id,
        });
    }

    if trips.is_empty() {
        return Err(Error::not_found("no trip times found for active services"));
    }

    Ok(trips)
}

/// Plan one or more journeys between two coordinates using the round-based
/// scan. Returns `NoReachableStops` when neither end has stops within
/// walking range and `NoRouteFound` when the scan cannot connect them.
pub fn plan_journeys_raptor(
    conn: &Connection,
    tz: Tz,
    req: &JourneyRequest,
) -> Result<Vec<JourneyPlan>> {
    let req = normalize_request(req);

    let Some(depart_at) = req.depart_at else {
        return Err(Error::invalid_input("depart time required"));
    };

    let depart_local = depart_at.with_timezone(&tz);
    let day_start = tz
        .from_local_datetime(
            &depart_local
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always valid"),
        )
        .earliest()
        .ok_or_else(|| Error::internal("could not resolve local midnight"))?;
    let depart_sec = (depart_local.with_timezone(&Utc) - day_start.with_timezone(&Utc)).num_seconds();
    let service_date = depart_local.date_naive();

    let stops = get_stops(conn, req.include_child_stops)?;
    let stop_map: AHashMap<String, Stop> = stops
        .iter()
        .map(|s| (s.stop_id.clone(), s.clone()))
        .collect();

    let nearby_start = filter_nearby_stops(
        &stops,
        req.start_lat,
        req.start_lon,
        req.max_walk_km,
        req.max_nearby_stops,
    );
    let nearby_end = filter_nearby_stops(
        &stops,
        req.end_lat,
        req.end_lon,
        req.max_walk_km,
        req.max_nearby_stops,
    );
    if nearby_start.is_empty() || nearby_end.is_empty() {
        return Err(Error::NoReachableStops);
    }

    let trips = load_day_trip_table(conn, service_date)?;
    let route_map: AHashMap<String, Route> = get_routes(conn)?
        .into_iter()
        .map(|r| (r.route_id.clone(), r))
        .collect();

    let mut arrival: AHashMap<String, i64> = AHashMap::with_capacity(stop_map.len());
    let mut predecessor: AHashMap<String, Predecessor> = AHashMap::new();
    let mut updated: AHashSet<String> = AHashSet::new();

    for candidate in &nearby_start {
        let walk_secs = walk_duration_secs(candidate.distance_km, req.walk_speed_kmph);
        let arrive_sec = depart_sec + walk_secs;
        let best = arrival
            .get(&candidate.stop.stop_id)
            .copied()
            .unwrap_or(INF);
        if arrive_sec < best {
            arrival.insert(candidate.stop.stop_id.clone(), arrive_sec);
            predecessor.insert(
                candidate.stop.stop_id.clone(),
                Predecessor::WalkOrigin { arrive_sec },
            );
            updated.insert(candidate.stop.stop_id.clone());
        }
    }

    for _round in 0..=req.max_transfers {
        let mut next_updated: AHashSet<String> = AHashSet::new();

        for trip_calls in trips.values() {
            let mut boarded = false;
            let mut board_stop_id = "";
            let mut board_depart_sec = 0i64;

            for call in trip_calls {
                if !boarded {
                    let best = arrival.get(&call.stop_id).copied().unwrap_or(INF);
                    if updated.contains(&call.stop_id) && best <= call.departure_sec {
                        boarded = true;
                        board_stop_id = call.stop_id.as_str();
                        board_depart_sec = call.departure_sec;
                    }
                    continue;
                }

                let best = arrival.get(&call.stop_id).copied().unwrap_or(INF);
                if call.arrival_sec < best {
                    arrival.insert(call.stop_id.clone(), call.arrival_sec);
                    predecessor.insert(
                        call.stop_id.clone(),
                        Predecessor::Transit {
                            from_stop_id: board_stop_id.to_string(),
                            trip_id: call.trip_id.clone(),
                            route_id: call.route_id.clone(),
                            depart_sec: board_depart_sec,
                            arrive_sec: call.arrival_sec,
                        },
                    );
                    next_updated.insert(call.stop_id.clone());
                }
            }
        }

        if next_updated.is_empty() {
            break;
        }
        updated = next_updated;
    }

    // Candidate destinations: reachable nearby-end stops plus their egress
    // walk, earliest overall arrival first.
    let mut candidates: Vec<(StopWithDistance, i64)> = nearby_end
        .iter()
        .filter_map(|candidate| {
            let at_stop = arrival.get(&candidate.stop.stop_id).copied()?;
            if at_stop >= INF {
                return None;
            }
            let total =
                at_stop + walk_duration_secs(candidate.distance_km, req.walk_speed_kmph);
            (total >= depart_sec).then(|| (candidate.clone(), total))
        })
        .collect();
    candidates.sort_by_key(|(_, total)| *total);
    candidates.truncate(req.max_results);

    if candidates.is_empty() {
        return Err(Error::NoRouteFound);
    }

    let mut plans: Vec<JourneyPlan> = Vec::new();
    for (end_stop, end_arrival_sec) in candidates {
        let (legs, transfers, transfer_stops) = build_journey_legs(
            &end_stop,
            end_arrival_sec,
            &predecessor,
            &stop_map,
            &route_map,
            depart_local.with_timezone(&Utc),
            day_start.with_timezone(&Utc),
            depart_sec,
            req.walk_speed_kmph,
            req.start_lat,
            req.start_lon,
        );
        if legs.is_empty() {
            continue;
        }

        let arrival_time = day_start.with_timezone(&Utc) + chrono::Duration::seconds(end_arrival_sec);
        let departure_time = depart_local.with_timezone(&Utc);
        plans.push(JourneyPlan {
            id: Uuid::new_v4().to_string(),
            start_lat: req.start_lat,
            start_lon: req.start_lon,
            end_lat: req.end_lat,
            end_lon: req.end_lon,
            departure_time,
            arrival_time,
            total_duration_secs: (arrival_time - departure_time).num_seconds(),
            transfers,
            transfer_stops,
            route_geojson: build_journey_geojson(conn, &req, &legs),
            legs,
        });
    }

    if plans.is_empty() {
        return Err(Error::NoRouteFound);
    }

    Ok(plans)
}

#[allow(clippy::too_many_arguments)]
fn build_journey_legs(
    end_stop: &StopWithDistance,
    end_arrival_sec: i64,
    predecessor: &AHashMap<String, Predecessor>,
    stop_map: &AHashMap<String, Stop>,
    route_map: &AHashMap<String, Route>,
    depart_at: DateTime<Utc>,
    day_start: DateTime<Utc>,
    depart_sec: i64,
    walk_speed_kmph: f64,
    start_lat: f64,
    start_lon: f64,
) -> (Vec<JourneyLeg>, u32, Vec<Stop>) {
    let at_secs = |sec: i64| day_start + chrono::Duration::seconds(sec);
    let lookup_stop = |stop_id: &str| {
        stop_map.get(stop_id).cloned().unwrap_or_else(|| Stop {
            stop_id: stop_id.to_string(),
            ..Stop::default()
        })
    };

    let mut legs: Vec<JourneyLeg> = Vec::new();
    let mut transfers = 0u32;
    let mut transfer_stops: Vec<Stop> = Vec::new();

    // Legs are collected destination-first and reversed at the end.
    let egress_walk_secs = walk_duration_secs(end_stop.distance_km, walk_speed_kmph);
    legs.push(JourneyLeg {
        mode: LegMode::Walk,
        from_stop: Some(end_stop.stop.clone()),
        to_stop: None,
        trip_id: String::new(),
        route_id: String::new(),
        route: None,
        departure_time: at_secs(end_arrival_sec - egress_walk_secs),
        arrival_time: at_secs(end_arrival_sec),
        duration_secs: egress_walk_secs,
        distance_km: end_stop.distance_km,
    });

    let mut current_stop_id = end_stop.stop.stop_id.clone();
    let mut last_trip_id = String::new();
    let mut last_stop = end_stop.stop.clone();

    while let Some(pred) = predecessor.get(&current_stop_id) {
        match pred {
            Predecessor::WalkOrigin { arrive_sec } => {
                let stop = lookup_stop(&current_stop_id);
                legs.push(JourneyLeg {
                    mode: LegMode::Walk,
                    from_stop: None,
                    to_stop: Some(stop.clone()),
                    trip_id: String::new(),
                    route_id: String::new(),
                    route: None,
                    departure_time: depart_at,
                    arrival_time: at_secs(*arrive_sec),
                    duration_secs: arrive_sec - depart_sec,
                    distance_km: haversine_km(start_lat, start_lon, stop.stop_lat, stop.stop_lon),
                });
                break;
            }
            Predecessor::Transit {
                from_stop_id,
                trip_id,
                route_id,
                depart_sec: board_sec,
                arrive_sec,
            } => {
                let from_stop = lookup_stop(from_stop_id);
                let to_stop = lookup_stop(&current_stop_id);
                legs.push(JourneyLeg {
                    mode: LegMode::Transit,
                    from_stop: Some(from_stop.clone()),
                    to_stop: Some(to_stop),
                    trip_id: trip_id.clone(),
                    route_id: route_id.clone(),
                    route: route_map.get(route_id).cloned(),
                    departure_time: at_secs(*board_sec),
                    arrival_time: at_secs(*arrive_sec),
                    duration_secs: arrive_sec - board_sec,
                    distance_km: 0.0,
                });

                // A trip-id boundary between consecutive transit legs is a
                // transfer, at the arrival stop of the earlier (in travel
                // order) leg.
                if !last_trip_id.is_empty() && last_trip_id != *trip_id {
                    transfers += 1;
                    transfer_stops.push(last_stop.clone());
                }
                last_trip_id = trip_id.clone();
                last_stop = from_stop;
                current_stop_id = from_stop_id.clone();
            }
        }
    }

    legs.reverse();
    (legs, transfers, transfer_stops)
}

fn build_journey_geojson(
    conn: &Connection,
    req: &JourneyRequest,
    legs: &[JourneyLeg],
) -> FeatureCollection {
    let mut features: Vec<Feature> = Vec::new();

    for leg in legs {
        match leg.mode {
            LegMode::Transit => {
                if leg.trip_id.is_empty() {
                    continue;
                }
                let Ok(mut shape) = get_shape_by_trip_id(conn, &leg.trip_id) else {
                    continue;
                };
                shape.coordinates = segment_shape_for_leg(conn, &shape.coordinates, leg);
                if shape.coordinates.is_empty() {
                    continue;
                }

                let mut feature = crate::shapes::shape_to_feature(&shape);
                if let Some(properties) = feature.properties.as_mut() {
                    properties.insert("mode".to_string(), json!("transit"));
                    if !leg.route_id.is_empty() {
                        properties.insert("route_id".to_string(), json!(leg.route_id));
                    }
                    properties.insert("trip_id".to_string(), json!(leg.trip_id));
                }
                features.push(feature);
            }
            LegMode::Walk => {
                let Some((from_lat, from_lon, to_lat, to_lon)) = walk_leg_coordinates(req, leg)
                else {
                    continue;
                };
                features.push(build_walk_feature(
                    req.walking_route_url.as_deref(),
                    from_lat,
                    from_lon,
                    to_lat,
                    to_lon,
                ));
            }
        }
    }

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn walk_leg_coordinates(req: &JourneyRequest, leg: &JourneyLeg) -> Option<(f64, f64, f64, f64)> {
    match (&leg.from_stop, &leg.to_stop) {
        (None, Some(to)) => Some((req.start_lat, req.start_lon, to.stop_lat, to.stop_lon)),
        (Some(from), None) => Some((from.stop_lat, from.stop_lon, req.end_lat, req.end_lon)),
        (Some(from), Some(to)) => Some((from.stop_lat, from.stop_lon, to.stop_lat, to.stop_lon)),
        (None, None) => None,
    }
}

fn segment_shape_for_leg(
    conn: &Connection,
    points: &[crate::models::ShapePoint],
    leg: &JourneyLeg,
) -> Vec<crate::models::ShapePoint> {
    let (Some(from_stop), Some(to_stop)) = (&leg.from_stop, &leg.to_stop) else {
        return points.to_vec();
    };

    if has_full_distance_annotation(points) {
        let from_dist = stop_shape_distance(conn, &leg.trip_id, &from_stop.stop_id);
        let to_dist = stop_shape_distance(conn, &leg.trip_id, &to_stop.stop_id);
        if let (Some(from_dist), Some(to_dist)) = (from_dist, to_dist) {
            let segment =
                segment_by_distance(points, from_dist.min(to_dist), from_dist.max(to_dist));
            if segment.len() > 1 {
                return segment;
            }
        }
    }

    segment_by_nearest_index(
        points,
        from_stop.stop_lat,
        from_stop.stop_lon,
        to_stop.stop_lat,
        to_stop.stop_lon,
    )
}

fn build_walk_feature(
    walking_route_url: Option<&str>,
    from_lat: f64,
    from_lon: f64,
    to_lat: f64,
    to_lon: f64,
) -> Feature {
    if let Some(base_url) = walking_route_url {
        if let Some(feature) = fetch_walking_feature(base_url, from_lat, from_lon, to_lat, to_lon) {
            return feature;
        }
    }
    straight_line_walk_feature(from_lat, from_lon, to_lat, to_lon)
}

#[derive(Deserialize)]
struct WalkingRouteResponse {
    code: String,
    #[serde(default)]
    routes: Vec<WalkingRoute>,
}

#[derive(Deserialize)]
struct WalkingRoute {
    geometry: Geometry,
    distance: f64,
    duration: f64,
}

fn fetch_walking_feature(
    base_url: &str,
    from_lat: f64,
    from_lon: f64,
    to_lat: f64,
    to_lon: f64,
) -> Option<Feature> {
    let base = base_url.trim_end_matches('/');
    let endpoint = format!(
        "{base}/route/v1/foot/{from_lon},{from_lat};{to_lon},{to_lat}?overview=full&geometries=geojson"
    );

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .ok()?;
    let response = client.get(&endpoint).send().ok()?;
    if !response.status().is_success() {
        log::debug!("walking route fetch returned HTTP {}", response.status());
        return None;
    }

    let payload: WalkingRouteResponse = response.json().ok()?;
    if payload.code != "Ok" || payload.routes.is_empty() {
        return None;
    }
    let route = payload.routes.into_iter().next()?;

    let mut properties = JsonObject::new();
    properties.insert("mode".to_string(), json!("walk"));
    properties.insert("distance_meters".to_string(), json!(route.distance));
    properties.insert("duration_seconds".to_string(), json!(route.duration));

    Some(Feature {
        bbox: None,
        geometry: Some(route.geometry),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    })
}

fn straight_line_walk_feature(from_lat: f64, from_lon: f64, to_lat: f64, to_lon: f64) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("mode".to_string(), json!("walk"));

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::LineString(vec![
            vec![from_lon, from_lat],
            vec![to_lon, to_lat],
        ]))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}
