//! Service resolution: which service_ids run on a calendar date, and which
//! scheduled calls a stop sees on that date.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::{params, params_from_iter, Connection, Row};

use crate::error::{Error, Result};
use crate::gtfs_time::{format_service_date, weekday_column};
use crate::models::{Stop, StopTimeRow, Trip};

lazy_static! {
    static ref STATION_PLATFORM_RE: Regex = Regex::new(r"Train Station (\d)$").unwrap();
    static ref TRAILING_DIGIT_RE: Regex = Regex::new(r"\d$").unwrap();
    static ref TRAILING_CAPITAL_RE: Regex = Regex::new(r"[A-Z]$").unwrap();
}

/// Derive a platform label from the stop name. Only consulted when the feed
/// leaves platform_code empty.
pub fn determine_platform(stop_name: &str) -> String {
    if let Some(captures) = STATION_PLATFORM_RE.captures(stop_name) {
        return captures[1].to_string();
    }
    if stop_name.ends_with("Train Station") && !TRAILING_DIGIT_RE.is_match(stop_name) {
        return "1".to_string();
    }
    if TRAILING_CAPITAL_RE.is_match(stop_name) {
        return stop_name[stop_name.len() - 1..].to_string();
    }
    "no platform".to_string()
}

/// Rough stop category from the name. The feed never labels bus stops as
/// such, so anything that is not a ferry terminal or train station is a bus
/// stop.
pub fn type_of_stop(stop_name: &str) -> &'static str {
    if stop_name.contains("Ferry Terminal") {
        return "ferry";
    }
    if stop_name.contains("Train Station") {
        return "train";
    }
    "bus"
}

/// The set of service_ids active on `date`:
/// (weekly calendar matches ∪ added exceptions) \ removed exceptions.
/// A removal always wins over an addition on the same date.
pub fn active_services(conn: &Connection, date: NaiveDate) -> Result<Vec<String>> {
    let day = format_service_date(date);
    let weekday = weekday_column(date);

    let sql = format!(
        "SELECT DISTINCT service_id FROM (
            SELECT service_id
            FROM calendar
            WHERE start_date <= ?1 AND end_date >= ?1 AND {weekday} = 1
            UNION ALL
            SELECT service_id
            FROM calendar_dates
            WHERE date = ?1 AND exception_type = 1
        )
        WHERE service_id NOT IN (
            SELECT service_id FROM calendar_dates WHERE date = ?1 AND exception_type = 2
        )"
    );

    let mut stmt = conn.prepare(&sql)?;
    let services = stmt
        .query_map(params![day], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<String>, rusqlite::Error>>()?;

    Ok(services)
}

const STOP_TIME_ROW_COLUMNS: &str = "
    st.trip_id, st.arrival_time, st.departure_time, st.stop_id, st.stop_sequence, st.stop_headsign,
    s.stop_id, s.stop_code, s.stop_name, s.stop_lat, s.stop_lon, s.location_type,
    s.parent_station, s.wheelchair_boarding, s.platform_code,
    t.route_id, t.trip_headsign, t.shape_id, t.service_id, t.direction_id,
    t.wheelchair_accessible, t.bikes_allowed,
    r.route_color, r.route_short_name";

fn stop_time_row_from_row(row: &Row) -> rusqlite::Result<StopTimeRow> {
    let mut stop = Stop {
        stop_id: row.get(6)?,
        stop_code: row.get(7)?,
        stop_name: row.get(8)?,
        stop_lat: row.get(9)?,
        stop_lon: row.get(10)?,
        location_type: row.get(11)?,
        parent_station: row.get(12)?,
        wheelchair_boarding: row.get(13)?,
        platform_code: row.get(14)?,
        ..Stop::default()
    };
    stop.stop_type = type_of_stop(&stop.stop_name).to_string();
    stop.is_child_stop = stop.is_child();

    let trip = Trip {
        trip_id: row.get(0)?,
        route_id: row.get(15)?,
        trip_headsign: row.get(16)?,
        shape_id: row.get(17)?,
        service_id: row.get(18)?,
        direction_id: row.get(19)?,
        wheelchair_accessible: row.get(20)?,
        bikes_allowed: row.get(21)?,
    };

    let platform = if stop.platform_code.is_empty() {
        determine_platform(&stop.stop_name)
    } else {
        stop.platform_code.clone()
    };

    Ok(StopTimeRow {
        trip_id: row.get(0)?,
        arrival_time: row.get(1)?,
        departure_time: row.get(2)?,
        stop_id: row.get(3)?,
        stop_sequence: row.get(4)?,
        stop_headsign: row.get(5)?,
        platform,
        route_color: row.get(22)?,
        route_short_name: row.get(23)?,
        stop_data: stop,
        trip_data: trip,
    })
}

/// Scheduled calls at a stop on a date, ordered by departure time.
///
/// When the queried stop is a parent station the calls of all its child
/// stops are returned. Calls that forbid boarding (pickup_type 1) or
/// alighting (drop_off_type 1) are filtered out. `departure_after` is a
/// zero-padded "HH:MM:SS" lower bound.
pub fn services_at_stop(
    conn: &Connection,
    stop_id: &str,
    date: NaiveDate,
    departure_after: Option<&str>,
    limit: Option<u32>,
) -> Result<Vec<StopTimeRow>> {
    if stop_id.is_empty() {
        return Err(Error::invalid_input("missing stop id"));
    }

    // Expand a parent station to its boarding positions.
    let mut stop_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT stop_id FROM stops WHERE parent_station = ?1")?;
        let rows = stmt
            .query_map(params![stop_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, rusqlite::Error>>()?;
        rows
    };
    if stop_ids.is_empty() {
        stop_ids.push(stop_id.to_string());
    }

    let day = format_service_date(date);
    let weekday = weekday_column(date);

    let stop_placeholders = vec!["?"; stop_ids.len()].join(", ");
    let mut sql = format!(
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
        SELECT {STOP_TIME_ROW_COLUMNS}
        FROM stop_times st
        JOIN trips t ON st.trip_id = t.trip_id
        JOIN adjusted_services a ON t.service_id = a.service_id
        JOIN stops s ON st.stop_id = s.stop_id
        JOIN routes r ON t.route_id = r.route_id
        WHERE st.stop_id IN ({stop_placeholders})
          AND (st.pickup_type = 0 OR st.pickup_type IS NULL)
          AND (st.drop_off_type = 0 OR st.drop_off_type IS NULL)"
    );

    let mut sql_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    sql_params.push(Box::new(day));
    for id in &stop_ids {
        sql_params.push(Box::new(id.clone()));
    }

    if let Some(bound) = departure_after {
        if !bound.is_empty() {
            sql.push_str(" AND st.departure_time > ?");
            sql_params.push(Box::new(bound.to_string()));
        }
    }

    sql.push_str(" ORDER BY st.departure_time ASC");

    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        sql_params.push(Box::new(limit as i64));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), stop_time_row_from_row)?
        .collect::<std::result::Result<Vec<StopTimeRow>, rusqlite::Error>>()?;

    if rows.is_empty() {
        return Err(Error::not_found(format!(
            "no trips found for stop {stop_id} on {date}"
        )));
    }

    Ok(rows)
}

/// The scheduled call of one trip at one stop. The departure filter is
/// appended only when non-empty, and the query binds exactly the parameters
/// it declares.
pub fn service_by_trip_and_stop(
    conn: &Connection,
    trip_id: &str,
    stop_id: &str,
    departure_filter: Option<&str>,
) -> Result<StopTimeRow> {
    let mut sql = format!(
        "SELECT {STOP_TIME_ROW_COLUMNS}
        FROM stop_times st
        JOIN trips t ON st.trip_id = t.trip_id
        JOIN stops s ON st.stop_id = s.stop_id
        JOIN routes r ON t.route_id = r.route_id
        WHERE st.trip_id = ?1 AND st.stop_id = ?2"
    );

    let mut sql_params: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(trip_id.to_string()),
        Box::new(stop_id.to_string()),
    ];
    if let Some(filter) = departure_filter {
        if !filter.is_empty() {
            sql.push_str(" AND st.departure_time > ?3");
            sql_params.push(Box::new(filter.to_string()));
        }
    }
    sql.push_str(" LIMIT 1");

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params_from_iter(sql_params.iter()), stop_time_row_from_row)?;

    match rows.next() {
        Some(row) => Ok(row?),
        None => Err(Error::not_found(format!(
            "no service found for trip {trip_id} at stop {stop_id}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use chrono::NaiveDate;
    use rusqlite::Connection;

    fn fixture_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_default_tables(&conn).unwrap();
        conn
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y%m%d").unwrap()
    }

    #[test]
    fn removal_exception_beats_weekly_calendar() {
        let conn = fixture_conn();
        conn.execute_batch(
            "INSERT INTO calendar (service_id, monday, tuesday, wednesday, thursday, friday, start_date, end_date)
             VALUES ('A', 1, 1, 1, 1, 1, '20240101', '20241231');
             INSERT INTO calendar_dates (service_id, date, exception_type) VALUES ('A', '20240715', 2);",
        )
        .unwrap();

        // 20240715 is a Monday, but the removal wins.
        let on_holiday = active_services(&conn, date("20240715")).unwrap();
        assert!(!on_holiday.contains(&"A".to_string()));

        let next_day = active_services(&conn, date("20240716")).unwrap();
        assert!(next_day.contains(&"A".to_string()));
    }

    #[test]
    fn addition_exception_runs_on_an_off_day() {
        let conn = fixture_conn();
        conn.execute_batch(
            "INSERT INTO calendar (service_id, saturday, sunday, start_date, end_date)
             VALUES ('B', 1, 1, '20240101', '20241231');
             INSERT INTO calendar_dates (service_id, date, exception_type) VALUES ('B', '20240715', 1);",
        )
        .unwrap();

        let monday = active_services(&conn, date("20240715")).unwrap();
        assert!(monday.contains(&"B".to_string()));
    }

    #[test]
    fn removal_beats_a_weekly_match_plus_addition() {
        let conn = fixture_conn();
        // C is weekly-active on Mondays AND carries an addition on one
        // Monday; the same-date removal still knocks it out of the union.
        conn.execute_batch(
            "INSERT INTO calendar (service_id, monday, start_date, end_date)
             VALUES ('C', 1, '20240101', '20241231');
             INSERT INTO calendar_dates (service_id, date, exception_type) VALUES ('C', '20240722', 1);
             INSERT INTO calendar_dates (service_id, date, exception_type) VALUES ('C', '20240715', 2);",
        )
        .unwrap();

        let removed_day = active_services(&conn, date("20240715")).unwrap();
        assert!(!removed_day.contains(&"C".to_string()));

        // Weekly match plus addition on 20240722 collapses to one entry.
        let doubled_day = active_services(&conn, date("20240722")).unwrap();
        assert_eq!(
            doubled_day.iter().filter(|s| s.as_str() == "C").count(),
            1
        );
    }

    fn seed_stop_schedule(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO calendar (service_id, monday, start_date, end_date)
             VALUES ('WD', 1, '20240101', '20241231');
             INSERT INTO stops (stop_id, stop_name, stop_lat, stop_lon) VALUES ('X', 'Symonds St', -36.85, 174.76);
             INSERT INTO routes (route_id, route_short_name, route_type, route_color) VALUES ('R1', 'INN', 3, '00FF00');
             INSERT INTO trips (trip_id, route_id, service_id) VALUES ('T1', 'R1', 'WD');
             INSERT INTO trips (trip_id, route_id, service_id) VALUES ('T2', 'R1', 'WD');",
        )
        .unwrap();
    }

    #[test]
    fn pickup_and_drop_off_restrictions_filter_rows() {
        let conn = fixture_conn();
        seed_stop_schedule(&conn);
        conn.execute_batch(
            "INSERT INTO stop_times (trip_id, stop_id, stop_sequence, arrival_time, departure_time, pickup_type, drop_off_type)
             VALUES ('T1', 'X', 1, '08:00:00', '08:00:00', 1, 0);
             INSERT INTO stop_times (trip_id, stop_id, stop_sequence, arrival_time, departure_time, pickup_type, drop_off_type)
             VALUES ('T2', 'X', 1, '09:00:00', '09:00:00', 0, 0);",
        )
        .unwrap();

        let rows = services_at_stop(&conn, "X", date("20240715"), None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trip_id, "T2");
    }

    #[test]
    fn rows_are_ordered_and_bounded_by_departure_time() {
        let conn = fixture_conn();
        seed_stop_schedule(&conn);
        conn.execute_batch(
            "INSERT INTO stop_times (trip_id, stop_id, stop_sequence, arrival_time, departure_time)
             VALUES ('T1', 'X', 1, '09:30:00', '09:30:00');
             INSERT INTO stop_times (trip_id, stop_id, stop_sequence, arrival_time, departure_time)
             VALUES ('T2', 'X', 1, '08:15:00', '08:15:00');",
        )
        .unwrap();

        let all = services_at_stop(&conn, "X", date("20240715"), None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].trip_id, "T2");
        assert_eq!(all[1].trip_id, "T1");

        let late = services_at_stop(&conn, "X", date("20240715"), Some("09:00:00"), None).unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].trip_id, "T1");

        let limited = services_at_stop(&conn, "X", date("20240715"), None, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].trip_id, "T2");
    }

    #[test]
    fn parent_station_query_covers_child_stops() {
        let conn = fixture_conn();
        seed_stop_schedule(&conn);
        conn.execute_batch(
            "INSERT INTO stops (stop_id, stop_name, location_type) VALUES ('P', 'Newmarket Train Station', 1);
             INSERT INTO stops (stop_id, stop_name, parent_station, platform_code) VALUES ('P1', 'Newmarket Train Station 1', 'P', '');
             INSERT INTO stop_times (trip_id, stop_id, stop_sequence, arrival_time, departure_time)
             VALUES ('T1', 'P1', 1, '10:00:00', '10:00:00');",
        )
        .unwrap();

        let rows = services_at_stop(&conn, "P", date("20240715"), None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stop_id, "P1");
        assert_eq!(rows[0].platform, "1");
        assert_eq!(rows[0].stop_data.stop_type, "train");
    }

    #[test]
    fn trip_and_stop_lookup_appends_filter_only_when_set() {
        let conn = fixture_conn();
        seed_stop_schedule(&conn);
        conn.execute_batch(
            "INSERT INTO stop_times (trip_id, stop_id, stop_sequence, arrival_time, departure_time)
             VALUES ('T1', 'X', 1, '08:00:00', '08:00:00');",
        )
        .unwrap();

        let row = service_by_trip_and_stop(&conn, "T1", "X", None).unwrap();
        assert_eq!(row.departure_time, "08:00:00");

        let row = service_by_trip_and_stop(&conn, "T1", "X", Some("")).unwrap();
        assert_eq!(row.trip_id, "T1");

        assert!(service_by_trip_and_stop(&conn, "T1", "X", Some("08:30:00")).is_err());
    }

    #[test]
    fn platform_heuristic_matches_known_names() {
        assert_eq!(determine_platform("Britomart Train Station 3"), "3");
        assert_eq!(determine_platform("Newmarket Train Station"), "1");
        assert_eq!(determine_platform("Queen St Stop B"), "B");
        assert_eq!(determine_platform("Symonds St"), "no platform");
    }

    #[test]
    fn platform_heuristic_is_pure() {
        for _ in 0..3 {
            assert_eq!(determine_platform("Queen St Stop B"), "B");
        }
    }

    #[test]
    fn stop_type_from_name_substrings() {
        assert_eq!(type_of_stop("Half Moon Bay Ferry Terminal"), "ferry");
        assert_eq!(type_of_stop("Britomart Train Station 3"), "train");
        assert_eq!(type_of_stop("Symonds St"), "bus");
    }
}
