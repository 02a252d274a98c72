pub mod cache;
pub mod database;
pub mod error;
pub mod geomath;
pub mod gtfs_time;
pub mod ingest;
pub mod journey;
pub mod models;
pub mod realtime;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod services;
pub mod shapes;
pub mod sqlite_tools;
pub mod stops;
pub mod trips;

pub use crate::cache::DerivedCache;
pub use crate::database::{Database, DatabaseConfig};
pub use crate::error::{Error, Result};
pub use crate::journey::{JourneyLeg, JourneyPlan, JourneyRequest, LegMode};
pub use crate::models::{FeedInfo, Route, Shape, ShapePoint, Stop, StopTimeRow, Trip};
pub use crate::realtime::{RealtimeClient, RealtimeConfig};
