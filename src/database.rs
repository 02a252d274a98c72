//! The `Database` handle: one SQLite-backed static feed plus its lifecycle.
//!
//! Opening a database checks feed validity, refreshes a stale feed from the
//! archive, and schedules the daily refresh. All query entry points check a
//! connection out of the shared pool; mutation happens only inside
//! `refresh_feed_data`, guarded by the refresh mutex.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::OptionalExtension;

use crate::error::{Error, Result};
use crate::gtfs_time::{format_service_date, parse_service_date};
use crate::journey::{self, JourneyPlan, JourneyRequest};
use crate::models::{
    FeedInfo, Route, RouteSearchResult, Shape, Stop, StopSearchResult, StopTimeRow,
    StopWithDistance, Trip,
};
use crate::sqlite_tools::{self, KauriConn, KauriSqlitePool};
use crate::{ingest, routes, scheduler, schema, services, shapes, stops, trips};

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub archive_url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub name: String,
    pub time_zone: Tz,
    pub contact_email: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            archive_url: String::new(),
            api_key: None,
            api_key_header: "Authorization".to_string(),
            name: String::new(),
            time_zone: chrono_tz::UTC,
            contact_email: None,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: KauriSqlitePool,
    config: DatabaseConfig,
    refresh_mutex: Arc<Mutex<()>>,
    refresh_subscribers: Arc<Mutex<Vec<Sender<()>>>>,
}

impl Database {
    /// Open (or create) the named database, refresh it when the stored feed
    /// has expired, and schedule the daily refresh.
    pub fn new(config: DatabaseConfig) -> Result<Database> {
        if config.archive_url.is_empty() {
            return Err(Error::invalid_input("missing archive url"));
        }
        if config.name.len() < 3 {
            return Err(Error::invalid_input(
                "database name too short, need at least 3 characters",
            ));
        }

        let path = sqlite_tools::database_path(&config.name)?;
        let pool = sqlite_tools::make_pool(&path)?;
        let database = Database::from_pool(pool, config);

        {
            let conn = database.conn()?;
            schema::create_default_tables(&conn)?;
            schema::create_indexes(&conn)?;
        }

        if !database.is_feed_data_up_to_date().unwrap_or(false) {
            log::info!("feed data is missing or outdated, refreshing");
            database.refresh_feed_data()?;
        } else {
            log::info!("feed data is still up to date");
        }

        let for_scheduler = database.clone();
        scheduler::spawn_daily(database.config.time_zone, move || {
            log::info!("running scheduled feed refresh");
            if let Err(e) = for_scheduler.refresh_feed_data() {
                log::error!(
                    "scheduled refresh of gtfs database {} failed: {e}",
                    for_scheduler.config.name
                );
            }
        });

        Ok(database)
    }

    pub(crate) fn from_pool(pool: KauriSqlitePool, config: DatabaseConfig) -> Database {
        Database {
            pool,
            config,
            refresh_mutex: Arc::new(Mutex::new(())),
            refresh_subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn conn(&self) -> Result<KauriConn> {
        Ok(self.pool.get()?)
    }

    pub fn time_zone(&self) -> Tz {
        self.config.time_zone
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.config.time_zone).date_naive()
    }

    // --- Feed lifecycle -------------------------------------------------

    pub fn feed_info(&self) -> Result<FeedInfo> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT feed_publisher_name, feed_lang, feed_start_date, feed_end_date, feed_version
             FROM feed_info LIMIT 1",
            [],
            |row| {
                Ok(FeedInfo {
                    feed_publisher_name: row.get(0)?,
                    feed_lang: row.get(1)?,
                    feed_start_date: row.get(2)?,
                    feed_end_date: row.get(3)?,
                    feed_version: row.get(4)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found("no feed_info row stored"))
    }

    pub fn feed_end_date(&self) -> Result<NaiveDate> {
        parse_service_date(&self.feed_info()?.feed_end_date)
    }

    /// True iff the stored feed_end_date parses and its local midnight lies
    /// strictly after the current instant.
    pub fn is_feed_data_up_to_date(&self) -> Result<bool> {
        let end_date = self.feed_end_date()?;
        let Some(end_midnight) = self
            .config
            .time_zone
            .from_local_datetime(&end_date.and_hms_opt(0, 0, 0).expect("midnight is always valid"))
            .earliest()
        else {
            return Ok(false);
        };

        Ok(end_midnight.with_timezone(&Utc) > Utc::now())
    }

    /// Full refresh: truncate every user table, re-apply the canonical
    /// schema and indexes, re-ingest the archive, rebuild the search
    /// tables, and notify derived-cache subscribers. Concurrent refresh
    /// requests serialise on the refresh mutex.
    pub fn refresh_feed_data(&self) -> Result<()> {
        let _guard = self
            .refresh_mutex
            .lock()
            .map_err(|_| Error::internal("refresh mutex poisoned"))?;

        log::info!("refreshing gtfs database {}", self.config.name);
        let conn = self.conn()?;

        schema::clear_user_tables(&conn)?;
        schema::create_default_tables(&conn)?;
        schema::create_indexes(&conn)?;

        let auth = self
            .config
            .api_key
            .as_deref()
            .map(|key| (self.config.api_key_header.as_str(), key));
        let archive = ingest::fetch_archive(
            &self.config.archive_url,
            auth,
            self.config.contact_email.as_deref(),
        )?;
        ingest::write_archive(&conn, &archive)?;

        stops::rebuild_stop_ngrams(&conn)?;
        routes::rebuild_route_ngrams(&conn)?;

        log::info!("gtfs database {} refreshed", self.config.name);
        self.notify_refresh();

        Ok(())
    }

    /// Receiver end of the refresh broadcast, for derived caches.
    pub fn subscribe_refresh(&self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.refresh_subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub(crate) fn notify_refresh(&self) {
        if let Ok(mut subscribers) = self.refresh_subscribers.lock() {
            subscribers.retain(|tx| tx.send(()).is_ok());
        }
    }

    // --- Service resolution ---------------------------------------------

    pub fn active_services(&self, date: NaiveDate) -> Result<Vec<String>> {
        let conn = self.conn()?;
        services::active_services(&conn, date)
    }

    /// Scheduled calls at a stop, defaulting to today in the feed's time
    /// zone when no date is given.
    pub fn get_active_trips(
        &self,
        stop_id: &str,
        departure_after: Option<&str>,
        date: Option<NaiveDate>,
        limit: Option<u32>,
    ) -> Result<Vec<StopTimeRow>> {
        let date = date.unwrap_or_else(|| self.today());
        let conn = self.conn()?;
        services::services_at_stop(&conn, stop_id, date, departure_after, limit)
    }

    pub fn get_service_by_trip_and_stop(
        &self,
        trip_id: &str,
        stop_id: &str,
        departure_filter: Option<&str>,
    ) -> Result<StopTimeRow> {
        let conn = self.conn()?;
        services::service_by_trip_and_stop(&conn, trip_id, stop_id, departure_filter)
    }

    // --- Stops ----------------------------------------------------------

    pub fn get_stops(&self, include_child_stops: bool) -> Result<Vec<Stop>> {
        let conn = self.conn()?;
        stops::get_stops(&conn, include_child_stops)
    }

    pub fn get_stop_by_id(&self, stop_id: &str) -> Result<Stop> {
        let conn = self.conn()?;
        stops::get_stop_by_id(&conn, stop_id)
    }

    pub fn get_stop_by_name_or_code(&self, name_or_code: &str) -> Result<Stop> {
        let today = format_service_date(self.today());
        let conn = self.conn()?;
        stops::get_stop_by_name_or_code(&conn, name_or_code, &today)
    }

    pub fn get_child_stops(&self, stop_id: &str) -> Result<Vec<Stop>> {
        let conn = self.conn()?;
        stops::get_child_stops(&conn, stop_id)
    }

    pub fn get_parent_stop(&self, child_stop_id: &str) -> Result<Stop> {
        let conn = self.conn()?;
        stops::get_parent_stop(&conn, child_stop_id)
    }

    pub fn get_stops_by_route(&self, route_id: &str) -> Result<Vec<Stop>> {
        let conn = self.conn()?;
        stops::get_stops_by_route(&conn, route_id)
    }

    pub fn get_parent_stops_by_route(&self, route_id: &str) -> Result<Vec<Stop>> {
        let conn = self.conn()?;
        stops::get_parent_stops_by_route(&conn, route_id)
    }

    pub fn get_stops_for_trip(&self, trip_id: &str) -> Result<(Vec<Stop>, i32)> {
        let conn = self.conn()?;
        stops::get_stops_for_trip(&conn, trip_id)
    }

    pub fn search_stops(
        &self,
        search_text: &str,
        include_child_stops: bool,
    ) -> Result<Vec<StopSearchResult>> {
        let conn = self.conn()?;
        stops::search_stops(&conn, search_text, include_child_stops)
    }

    /// Closest stored stops to a point, nearest first, capped at 50.
    pub fn closest_stops(
        &self,
        lat: f64,
        lon: f64,
        include_child_stops: bool,
    ) -> Result<Vec<StopWithDistance>> {
        let all = self.get_stops(include_child_stops)?;
        Ok(stops::closest_stops(&all, lat, lon))
    }

    // --- Routes and trips -----------------------------------------------

    pub fn get_routes(&self) -> Result<Vec<Route>> {
        let conn = self.conn()?;
        routes::get_routes(&conn)
    }

    pub fn get_route_by_id(&self, route_id: &str) -> Result<Route> {
        let conn = self.conn()?;
        routes::get_route_by_id(&conn, route_id)
    }

    pub fn get_routes_by_stop(&self, stop_id: &str) -> Result<Vec<Route>> {
        let conn = self.conn()?;
        routes::get_routes_by_stop(&conn, stop_id)
    }

    pub fn get_route_by_trip(&self, trip_id: &str) -> Result<Route> {
        let conn = self.conn()?;
        routes::get_route_by_trip(&conn, trip_id)
    }

    pub fn search_routes(&self, search_text: &str) -> Result<Vec<RouteSearchResult>> {
        let conn = self.conn()?;
        routes::search_routes(&conn, search_text)
    }

    pub fn search_routes_by_id(&self, search_text: &str) -> Result<Vec<Route>> {
        let conn = self.conn()?;
        routes::search_routes_by_id(&conn, search_text)
    }

    pub fn get_trip_by_id(&self, trip_id: &str) -> Result<Trip> {
        let conn = self.conn()?;
        trips::get_trip_by_id(&conn, trip_id)
    }

    pub fn get_trip_stop_ids_as_parents(&self, trip_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        trips::trip_stop_ids_as_parents(&conn, trip_id)
    }

    pub fn get_shape_by_trip_id(&self, trip_id: &str) -> Result<Shape> {
        let conn = self.conn()?;
        shapes::get_shape_by_trip_id(&conn, trip_id)
    }

    pub fn get_shape_by_id(&self, shape_id: &str) -> Result<Shape> {
        let conn = self.conn()?;
        shapes::get_shape_by_id(&conn, shape_id)
    }

    // --- Journey planning -----------------------------------------------

    pub fn plan_journeys_raptor(&self, request: &JourneyRequest) -> Result<Vec<JourneyPlan>> {
        let conn = self.conn()?;
        journey::plan_journeys_raptor(&conn, self.config.time_zone, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_tools::make_memory_pool;

    fn memory_database() -> Database {
        let pool = make_memory_pool().unwrap();
        let database = Database::from_pool(
            pool,
            DatabaseConfig {
                archive_url: "https://example.co.nz/gtfs.zip".to_string(),
                name: "test".to_string(),
                time_zone: chrono_tz::Pacific::Auckland,
                ..DatabaseConfig::default()
            },
        );
        let conn = database.conn().unwrap();
        schema::create_default_tables(&conn).unwrap();
        schema::create_indexes(&conn).unwrap();
        database
    }

    // The test pool holds a single shared in-memory connection, so every
    // direct statement runs in its own scope before Database methods check
    // a connection out again.
    fn execute(database: &Database, sql: &str) {
        let conn = database.conn().unwrap();
        conn.execute(sql, []).unwrap();
    }

    #[test]
    fn feed_freshness_follows_the_end_date() {
        let database = memory_database();

        // No feed_info row yet.
        assert!(database.is_feed_data_up_to_date().is_err());

        execute(
            &database,
            "INSERT INTO feed_info (feed_publisher_name, feed_end_date) VALUES ('AT', '19990101')",
        );
        assert!(!database.is_feed_data_up_to_date().unwrap());

        execute(&database, "UPDATE feed_info SET feed_end_date = '29990101'");
        assert!(database.is_feed_data_up_to_date().unwrap());
        assert_eq!(
            database.feed_end_date().unwrap(),
            NaiveDate::from_ymd_opt(2999, 1, 1).unwrap()
        );
    }

    #[test]
    fn malformed_end_dates_are_invalid_input() {
        let database = memory_database();
        execute(
            &database,
            "INSERT INTO feed_info (feed_publisher_name, feed_end_date) VALUES ('AT', 'soon')",
        );

        assert!(matches!(
            database.is_feed_data_up_to_date(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn refresh_broadcast_reaches_every_subscriber() {
        let database = memory_database();
        let first = database.subscribe_refresh();
        let second = database.subscribe_refresh();

        database.notify_refresh();
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());

        // A dropped subscriber is pruned on the next broadcast.
        drop(first);
        database.notify_refresh();
        assert!(second.try_recv().is_ok());
        assert_eq!(database.refresh_subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn construction_rejects_bad_configs() {
        assert!(matches!(
            Database::new(DatabaseConfig {
                name: "abc".to_string(),
                ..DatabaseConfig::default()
            }),
            Err(Error::InvalidInput(_))
        ));

        assert!(matches!(
            Database::new(DatabaseConfig {
                archive_url: "https://example.co.nz/gtfs.zip".to_string(),
                name: "ab".to_string(),
                ..DatabaseConfig::default()
            }),
            Err(Error::InvalidInput(_))
        ));
    }
}
