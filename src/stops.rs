//! Stop query layer: lookups by id, parent, route and trip, plus the text
//! search and proximity helpers the journey planner builds on.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::geomath::haversine_km;
use crate::models::{Stop, StopSearchResult, StopWithDistance};
use crate::services::type_of_stop;

const STOP_COLUMNS: &str = "stop_id, stop_code, stop_name, stop_lat, stop_lon, location_type, parent_station, platform_code, wheelchair_boarding";

pub(crate) fn stop_from_row(row: &Row) -> rusqlite::Result<Stop> {
    let mut stop = Stop {
        stop_id: row.get(0)?,
        stop_code: row.get(1)?,
        stop_name: row.get(2)?,
        stop_lat: row.get(3)?,
        stop_lon: row.get(4)?,
        location_type: row.get(5)?,
        parent_station: row.get(6)?,
        platform_code: row.get(7)?,
        wheelchair_boarding: row.get(8)?,
        ..Stop::default()
    };
    stop.stop_type = type_of_stop(&stop.stop_name).to_string();
    stop.is_child_stop = stop.is_child();
    Ok(stop)
}

/// All stored stops. With `include_children` false, boarding positions that
/// belong to a parent station are filtered out and only stations and
/// free-standing stops remain.
pub fn get_stops(conn: &Connection, include_children: bool) -> Result<Vec<Stop>> {
    let mut sql = format!("SELECT {STOP_COLUMNS} FROM stops");
    if !include_children {
        sql.push_str(" WHERE (location_type = 1 OR parent_station = '')");
    }

    let mut stmt = conn.prepare(&sql)?;
    let stops = stmt
        .query_map([], stop_from_row)?
        .collect::<std::result::Result<Vec<Stop>, rusqlite::Error>>()?;

    if stops.is_empty() {
        return Err(Error::not_found("no stops found"));
    }

    Ok(stops)
}

pub fn get_stop_by_id(conn: &Connection, stop_id: &str) -> Result<Stop> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STOP_COLUMNS} FROM stops WHERE stop_id = ?1"
    ))?;
    stmt.query_row(params![stop_id], stop_from_row)
        .optional()?
        .ok_or_else(|| Error::not_found(format!("no stop found with id {stop_id}")))
}

/// Look a stop up by exact name, exact code, or the "name code" display
/// concatenation. Feeds that were re-ingested with validity columns get an
/// extra currency filter; the column probe keeps older databases working.
pub fn get_stop_by_name_or_code(
    conn: &Connection,
    name_or_code: &str,
    today: &str,
) -> Result<Stop> {
    let columns = crate::schema::table_columns(conn, "stops")?;
    let has_validity =
        columns.iter().any(|c| c == "start_date") && columns.iter().any(|c| c == "end_date");

    let stop = if has_validity {
        let sql = format!(
            "SELECT {STOP_COLUMNS} FROM stops
             WHERE (stop_name = ?1 OR stop_code = ?1 OR stop_name || ' ' || stop_code = ?1)
               AND (start_date IS NULL OR start_date = '' OR start_date <= ?2)
               AND (end_date IS NULL OR end_date = '' OR end_date >= ?2)
             LIMIT 1"
        );
        conn.prepare(&sql)?
            .query_row(params![name_or_code, today], stop_from_row)
            .optional()?
    } else {
        let sql = format!(
            "SELECT {STOP_COLUMNS} FROM stops
             WHERE (stop_name = ?1 OR stop_code = ?1 OR stop_name || ' ' || stop_code = ?1)
             LIMIT 1"
        );
        conn.prepare(&sql)?
            .query_row(params![name_or_code], stop_from_row)
            .optional()?
    };

    stop.ok_or_else(|| Error::not_found(format!("no active stop found for {name_or_code}")))
}

/// Child stops of a parent station. Querying a free-standing stop by its own
/// id returns the stop itself.
pub fn get_child_stops(conn: &Connection, stop_id: &str) -> Result<Vec<Stop>> {
    let sql = format!(
        "SELECT {STOP_COLUMNS} FROM stops
         WHERE (stop_id = ?1 AND parent_station = '' AND location_type = 0)
            OR parent_station = ?1"
    );

    let mut stmt = conn.prepare(&sql)?;
    let stops = stmt
        .query_map(params![stop_id], stop_from_row)?
        .collect::<std::result::Result<Vec<Stop>, rusqlite::Error>>()?;

    if stops.is_empty() {
        return Err(Error::not_found(format!(
            "no child stops found for {stop_id}"
        )));
    }

    Ok(stops)
}

/// Parent station of a child stop; a stop with no parent resolves to
/// itself. A dangling parent reference resolves to nothing.
pub fn get_parent_stop(conn: &Connection, child_stop_id: &str) -> Result<Stop> {
    let sql = format!(
        "SELECT {STOP_COLUMNS} FROM stops
         WHERE stop_id = (
            SELECT CASE
                WHEN parent_station = '' OR parent_station IS NULL THEN stop_id
                ELSE parent_station
            END
            FROM stops WHERE stop_id = ?1
         )"
    );

    conn.prepare(&sql)?
        .query_row(params![child_stop_id], stop_from_row)
        .optional()?
        .ok_or_else(|| {
            Error::not_found(format!(
                "no parent stop or self stop found for {child_stop_id}"
            ))
        })
}

/// The distinct parent-level stops a route calls at. Children collapse to
/// their parent; free-standing stops stand for themselves.
pub fn get_parent_stops_by_route(conn: &Connection, route_id: &str) -> Result<Vec<Stop>> {
    let sql = "
        SELECT DISTINCT
            ps.stop_id, ps.stop_code, ps.stop_name, ps.stop_lat, ps.stop_lon,
            ps.location_type, ps.parent_station, ps.platform_code, ps.wheelchair_boarding
        FROM routes r
        JOIN trips t ON r.route_id = t.route_id
        JOIN stop_times st ON t.trip_id = st.trip_id
        JOIN stops s ON st.stop_id = s.stop_id
        JOIN stops ps ON ps.stop_id = COALESCE(NULLIF(s.parent_station, ''), s.stop_id)
        WHERE r.route_id = ?1
          AND (ps.location_type = 1
               OR (ps.location_type = 0 AND (ps.parent_station IS NULL OR ps.parent_station = '')))
        ORDER BY ps.stop_id";

    let mut stmt = conn.prepare(sql)?;
    let stops = stmt
        .query_map(params![route_id], stop_from_row)?
        .collect::<std::result::Result<Vec<Stop>, rusqlite::Error>>()?;

    if stops.is_empty() {
        return Err(Error::not_found(format!(
            "no parent stops found for route {route_id}"
        )));
    }

    Ok(stops)
}

pub fn get_stops_by_route(conn: &Connection, route_id: &str) -> Result<Vec<Stop>> {
    let sql = "
        SELECT DISTINCT s.stop_id, s.stop_code, s.stop_name, s.stop_lat, s.stop_lon,
               s.location_type, s.parent_station, s.platform_code, s.wheelchair_boarding,
               st.stop_sequence
        FROM routes r
        JOIN trips t ON r.route_id = t.route_id
        JOIN stop_times st ON t.trip_id = st.trip_id
        JOIN stops s ON st.stop_id = s.stop_id
        WHERE r.route_id = ?1
        ORDER BY s.stop_id";

    let mut stmt = conn.prepare(sql)?;
    let stops = stmt
        .query_map(params![route_id], |row| {
            let mut stop = stop_from_row(row)?;
            stop.stop_sequence = row.get(9)?;
            Ok(stop)
        })?
        .collect::<std::result::Result<Vec<Stop>, rusqlite::Error>>()?;

    if stops.is_empty() {
        return Err(Error::not_found(format!(
            "no stops found for route {route_id}"
        )));
    }

    Ok(stops)
}

/// Stops of a trip in sequence order, plus the lowest sequence seen.
/// Alighting-forbidden calls are dropped; no-pickup calls stay, since the
/// vehicle still stops there for passengers already aboard.
pub fn get_stops_for_trip(conn: &Connection, trip_id: &str) -> Result<(Vec<Stop>, i32)> {
    let sql = "
        SELECT s.stop_id, s.stop_code, s.stop_name, s.stop_lat, s.stop_lon,
               s.location_type, s.parent_station, s.platform_code, s.wheelchair_boarding,
               st.stop_sequence
        FROM stop_times st
        JOIN stops s ON st.stop_id = s.stop_id
        WHERE st.trip_id = ?1
          AND (st.drop_off_type = 0 OR st.drop_off_type IS NULL)
        ORDER BY st.stop_sequence";

    let mut stmt = conn.prepare(sql)?;
    let stops = stmt
        .query_map(params![trip_id], |row| {
            let mut stop = stop_from_row(row)?;
            stop.stop_sequence = row.get(9)?;
            Ok(stop)
        })?
        .collect::<std::result::Result<Vec<Stop>, rusqlite::Error>>()?;

    if stops.is_empty() {
        return Err(Error::not_found(format!(
            "no stops found for trip {trip_id}"
        )));
    }

    let lowest_sequence = stops.iter().map(|s| s.stop_sequence).min().unwrap_or(-1);

    Ok((stops, lowest_sequence))
}

/// One scheduled call of a trip, keyed by stop in `stop_times_for_trip`.
#[derive(Clone, Debug)]
pub struct TripStopTime {
    pub stop: Stop,
    pub arrival_time: String,
    pub departure_time: String,
}

/// Arrival and departure strings for every stop of a trip, keyed by stop id.
pub fn stop_times_for_trip(
    conn: &Connection,
    trip_id: &str,
) -> Result<ahash::AHashMap<String, TripStopTime>> {
    let sql = "
        SELECT s.stop_id, s.stop_code, s.stop_name, s.stop_lat, s.stop_lon,
               s.location_type, s.parent_station, s.platform_code, s.wheelchair_boarding,
               st.stop_sequence, st.arrival_time, st.departure_time
        FROM stop_times st
        JOIN stops s ON st.stop_id = s.stop_id
        WHERE st.trip_id = ?1
          AND (st.drop_off_type = 0 OR st.drop_off_type IS NULL)
        ORDER BY st.stop_sequence";

    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![trip_id], |row| {
            let mut stop = stop_from_row(row)?;
            stop.stop_sequence = row.get(9)?;
            let arrival_time: String = row.get(10)?;
            let departure_time: String = row.get(11)?;
            Ok(TripStopTime {
                stop,
                arrival_time,
                departure_time,
            })
        })?
        .collect::<std::result::Result<Vec<TripStopTime>, rusqlite::Error>>()?;

    if rows.is_empty() {
        return Err(Error::not_found(format!(
            "no stop times found for trip {trip_id}"
        )));
    }

    Ok(rows
        .into_iter()
        .map(|r| (r.stop.stop_id.clone(), r))
        .collect())
}

/// Whitespace-split scored text search over stop name, code, id and the
/// n-gram table. Per word: 3 for a full-word match, 2 for a prefix match,
/// 1 for any substring; every word must match somewhere. Ordered by score
/// then name, capped at 100.
pub fn search_stops(
    conn: &Connection,
    search_text: &str,
    include_children: bool,
) -> Result<Vec<StopSearchResult>> {
    let normalized = search_text.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(Error::invalid_input("empty search text"));
    }
    let words: Vec<&str> = normalized.split_whitespace().collect();

    let mut score_exprs: Vec<String> = Vec::new();
    let mut conditions: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    for word in &words {
        score_exprs.push(
            "(CASE
                WHEN LOWER(s.stop_name) LIKE '% ' || ? || ' %' THEN 3
                WHEN LOWER(s.stop_name) LIKE ? || '%' THEN 2
                WHEN LOWER(s.stop_name) LIKE '%' || ? || '%' THEN 1
                ELSE 0
            END)"
                .to_string(),
        );
        args.push(Box::new(word.to_string()));
        args.push(Box::new(word.to_string()));
        args.push(Box::new(word.to_string()));
    }

    for word in &words {
        conditions.push(
            "(LOWER(s.stop_name) LIKE '%' || ? || '%'
              OR LOWER(s.stop_code) LIKE '%' || ? || '%'
              OR LOWER(s.stop_id) LIKE '%' || ? || '%'
              OR LOWER(n.ngram) LIKE '%' || ? || '%')"
                .to_string(),
        );
        for _ in 0..4 {
            args.push(Box::new(word.to_string()));
        }
    }

    let sql = format!(
        "SELECT DISTINCT s.stop_id, s.stop_code, s.stop_name, s.parent_station, s.location_type,
                ({score}) AS score
         FROM stops s
         LEFT JOIN stop_ngrams n ON s.stop_id = n.stop_id
         WHERE {conditions}
         ORDER BY score DESC, s.stop_name ASC
         LIMIT 100",
        score = score_exprs.join(" + "),
        conditions = conditions.join(" AND "),
    );

    let mut stmt = conn.prepare(&sql)?;
    let hits = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            let stop_id: String = row.get(0)?;
            let stop_code: String = row.get(1)?;
            let stop_name: String = row.get(2)?;
            let parent_station: String = row.get(3)?;
            let location_type: i32 = row.get(4)?;
            Ok((stop_id, stop_code, stop_name, parent_station, location_type))
        })?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

    let results: Vec<StopSearchResult> = hits
        .into_iter()
        .filter(|(_, _, _, parent, location_type)| {
            include_children || *location_type != 0 || parent.is_empty()
        })
        .map(|(stop_id, stop_code, stop_name, _, _)| StopSearchResult {
            name: format!("{stop_name} {stop_code}"),
            type_of_stop: type_of_stop(&stop_name).to_string(),
            stop_id,
        })
        .collect();

    if results.is_empty() {
        return Err(Error::not_found(format!(
            "no stops found for search {search_text}"
        )));
    }

    Ok(results)
}

/// The stops closest to a point, ascending by haversine distance, capped at
/// 50.
pub fn closest_stops(stops: &[Stop], lat: f64, lon: f64) -> Vec<StopWithDistance> {
    let mut with_distance: Vec<StopWithDistance> = stops
        .iter()
        .map(|stop| StopWithDistance {
            stop: stop.clone(),
            distance_km: haversine_km(lat, lon, stop.stop_lat, stop.stop_lon),
        })
        .collect();

    with_distance.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    with_distance.truncate(50);
    with_distance
}

/// Lowercased letter trigrams of a display name, for the auxiliary search
/// tables. Short names yield the whole name as a single gram.
pub(crate) fn name_trigrams(text: &str) -> Vec<String> {
    let lowered: Vec<char> = text.to_lowercase().chars().collect();
    if lowered.len() < 3 {
        let whole: String = lowered.into_iter().collect();
        return if whole.trim().is_empty() {
            Vec::new()
        } else {
            vec![whole]
        };
    }

    let mut grams: Vec<String> = Vec::new();
    for window in lowered.windows(3) {
        let gram: String = window.iter().collect();
        if gram.trim().len() == 3 && !grams.contains(&gram) {
            grams.push(gram);
        }
    }
    grams
}

/// Rebuild the stop n-gram table from the current stops. Called at the end
/// of every refresh.
pub fn rebuild_stop_ngrams(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM stop_ngrams", [])?;
    {
        let mut select = tx.prepare("SELECT stop_id, stop_name FROM stops")?;
        let mut insert = tx.prepare("INSERT INTO stop_ngrams (stop_id, ngram) VALUES (?1, ?2)")?;
        let rows = select.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (stop_id, stop_name) = row?;
            for gram in name_trigrams(&stop_name) {
                insert.execute(params![stop_id, gram])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}
