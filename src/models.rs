use serde::Deserialize;
use serde::Serialize;

/// A row from `stops`, as surfaced by every stop query.
///
/// `stop_type` and `platform` are derived, not stored: the feed leaves
/// platform_code empty for most rail stops, so the service resolver fills
/// them from the stop name heuristics in `services.rs`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Stop {
    pub stop_id: String,
    pub stop_code: String,
    pub stop_name: String,
    pub stop_lat: f64,
    pub stop_lon: f64,
    pub location_type: i32,
    pub parent_station: String,
    pub platform_code: String,
    pub wheelchair_boarding: i32,
    pub stop_headsign: String,
    pub stop_type: String,
    pub stop_sequence: i32,
    pub is_child_stop: bool,
}

impl Stop {
    /// A child stop is a boarding position (location_type 0) attached to a
    /// parent station. Stops with a dangling parent reference are still
    /// flagged as children; the query layer treats them as top-level when
    /// the parent cannot be resolved.
    pub fn is_child(&self) -> bool {
        self.location_type == 0 && !self.parent_station.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub route_id: String,
    pub agency_id: String,
    pub route_short_name: String,
    pub route_long_name: String,
    pub route_type: i32,
    pub route_color: String,
    pub vehicle_type: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub trip_headsign: String,
    pub shape_id: String,
    pub direction_id: i32,
    pub wheelchair_accessible: i32,
    pub bikes_allowed: i32,
}

/// One scheduled call at a stop, joined across stop_times, trips, stops and
/// routes by the service resolver. Arrival and departure keep their GTFS
/// string form; hours may exceed 23 on trips crossing midnight.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StopTimeRow {
    pub trip_id: String,
    pub arrival_time: String,
    pub departure_time: String,
    pub stop_id: String,
    pub stop_sequence: i32,
    pub stop_headsign: String,
    pub platform: String,
    pub route_color: String,
    pub route_short_name: String,
    pub stop_data: Stop,
    pub trip_data: Trip,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeedInfo {
    pub feed_publisher_name: String,
    pub feed_lang: String,
    pub feed_start_date: String,
    pub feed_end_date: String,
    pub feed_version: String,
}

/// Ordered polyline for one shape_id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Shape {
    pub shape_id: String,
    pub coordinates: Vec<ShapePoint>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ShapePoint {
    pub lat: f64,
    pub lon: f64,
    pub dist_traveled: f64,
}

/// A stop with its distance from some query point, in kilometres.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopWithDistance {
    pub stop: Stop,
    pub distance_km: f64,
}

/// Search hit for the stop text search.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StopSearchResult {
    pub name: String,
    pub stop_id: String,
    pub type_of_stop: String,
}

/// Search hit for the route text search.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RouteSearchResult {
    pub name: String,
    pub route_id: String,
}
