//! Domain mirror structs for the GTFS-realtime payloads this crate serves.
//! Decoded protobuf messages are converted once at the fetch boundary so
//! snapshots hang on to plain owned data, not prost types.

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedTripDescriptor {
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    pub start_time: Option<String>,
    pub start_date: Option<String>,
    pub schedule_relationship: Option<i32>,
}

impl From<gtfs_realtime::TripDescriptor> for FeedTripDescriptor {
    fn from(trip: gtfs_realtime::TripDescriptor) -> Self {
        FeedTripDescriptor {
            trip_id: trip.trip_id,
            route_id: trip.route_id,
            direction_id: trip.direction_id,
            start_time: trip.start_time,
            start_date: trip.start_date,
            schedule_relationship: trip.schedule_relationship,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedVehicleDescriptor {
    pub id: Option<String>,
    pub label: Option<String>,
    pub license_plate: Option<String>,
}

impl From<gtfs_realtime::VehicleDescriptor> for FeedVehicleDescriptor {
    fn from(vehicle: gtfs_realtime::VehicleDescriptor) -> Self {
        FeedVehicleDescriptor {
            id: vehicle.id,
            label: vehicle.label,
            license_plate: vehicle.license_plate,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedPosition {
    pub latitude: f32,
    pub longitude: f32,
    pub speed: Option<f32>,
}

impl From<gtfs_realtime::Position> for FeedPosition {
    fn from(position: gtfs_realtime::Position) -> Self {
        FeedPosition {
            latitude: position.latitude,
            longitude: position.longitude,
            speed: position.speed,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedVehicle {
    pub trip: Option<FeedTripDescriptor>,
    pub position: Option<FeedPosition>,
    pub timestamp: Option<u64>,
    pub vehicle: Option<FeedVehicleDescriptor>,
    pub occupancy_status: Option<i32>,
}

impl From<gtfs_realtime::VehiclePosition> for FeedVehicle {
    fn from(vehicle_position: gtfs_realtime::VehiclePosition) -> Self {
        FeedVehicle {
            trip: vehicle_position.trip.map(|t| t.into()),
            position: vehicle_position.position.map(|p| p.into()),
            timestamp: vehicle_position.timestamp,
            vehicle: vehicle_position.vehicle.map(|v| v.into()),
            occupancy_status: vehicle_position.occupancy_status,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedStopTimeEvent {
    pub delay: Option<i32>,
    pub time: Option<i64>,
}

impl From<gtfs_realtime::trip_update::StopTimeEvent> for FeedStopTimeEvent {
    fn from(event: gtfs_realtime::trip_update::StopTimeEvent) -> Self {
        FeedStopTimeEvent {
            delay: event.delay,
            time: event.time,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedStopTimeUpdate {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub arrival: Option<FeedStopTimeEvent>,
    pub departure: Option<FeedStopTimeEvent>,
    pub schedule_relationship: Option<i32>,
}

impl From<gtfs_realtime::trip_update::StopTimeUpdate> for FeedStopTimeUpdate {
    fn from(update: gtfs_realtime::trip_update::StopTimeUpdate) -> Self {
        FeedStopTimeUpdate {
            stop_sequence: update.stop_sequence,
            stop_id: update.stop_id,
            arrival: update.arrival.map(|e| e.into()),
            departure: update.departure.map(|e| e.into()),
            schedule_relationship: update.schedule_relationship,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedTripUpdate {
    pub trip: FeedTripDescriptor,
    pub vehicle: Option<FeedVehicleDescriptor>,
    pub stop_time_updates: Vec<FeedStopTimeUpdate>,
    pub timestamp: Option<u64>,
    pub delay: Option<i32>,
}

impl From<gtfs_realtime::TripUpdate> for FeedTripUpdate {
    fn from(trip_update: gtfs_realtime::TripUpdate) -> Self {
        FeedTripUpdate {
            trip: trip_update.trip.into(),
            vehicle: trip_update.vehicle.map(|v| v.into()),
            stop_time_updates: trip_update
                .stop_time_update
                .into_iter()
                .map(|u| u.into())
                .collect(),
            timestamp: trip_update.timestamp,
            delay: trip_update.delay,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedTimeRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl From<gtfs_realtime::TimeRange> for FeedTimeRange {
    fn from(range: gtfs_realtime::TimeRange) -> Self {
        FeedTimeRange {
            start: range.start,
            end: range.end,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedEntitySelector {
    pub route_id: Option<String>,
    pub stop_id: Option<String>,
}

impl From<gtfs_realtime::EntitySelector> for FeedEntitySelector {
    fn from(selector: gtfs_realtime::EntitySelector) -> Self {
        FeedEntitySelector {
            route_id: selector.route_id,
            stop_id: selector.stop_id,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedTranslation {
    pub text: String,
    pub language: Option<String>,
}

impl From<gtfs_realtime::translated_string::Translation> for FeedTranslation {
    fn from(translation: gtfs_realtime::translated_string::Translation) -> Self {
        FeedTranslation {
            text: translation.text,
            language: translation.language,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedTranslatedString {
    pub translation: Vec<FeedTranslation>,
}

impl From<gtfs_realtime::TranslatedString> for FeedTranslatedString {
    fn from(translated: gtfs_realtime::TranslatedString) -> Self {
        FeedTranslatedString {
            translation: translated.translation.into_iter().map(|t| t.into()).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedAlert {
    pub id: String,
    pub active_period: Vec<FeedTimeRange>,
    pub informed_entity: Vec<FeedEntitySelector>,
    pub cause: Option<i32>,
    pub effect: Option<i32>,
    pub header_text: Option<FeedTranslatedString>,
    pub description_text: Option<FeedTranslatedString>,
}

impl FeedAlert {
    pub fn from_entity(id: String, alert: gtfs_realtime::Alert) -> Self {
        FeedAlert {
            id,
            active_period: alert.active_period.into_iter().map(|p| p.into()).collect(),
            informed_entity: alert
                .informed_entity
                .into_iter()
                .map(|e| e.into())
                .collect(),
            cause: alert.cause,
            effect: alert.effect,
            header_text: alert.header_text.map(|t| t.into()),
            description_text: alert.description_text.map(|t| t.into()),
        }
    }

    /// True when the alert names a route or stop with this id.
    pub fn informs(&self, route_or_stop_id: &str) -> bool {
        self.informed_entity.iter().any(|entity| {
            entity.route_id.as_deref() == Some(route_or_stop_id)
                || entity.stop_id.as_deref() == Some(route_or_stop_id)
        })
    }
}
