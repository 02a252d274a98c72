//! Route query layer and the GTFS route_type to vehicle-category mapping.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::models::{Route, RouteSearchResult};
use crate::stops::name_trigrams;

/// Textual category for a GTFS route_type.
pub fn vehicle_type(route_type: i32) -> &'static str {
    match route_type {
        0 => "tram",
        1 => "metro",
        2 => "train",
        3 => "bus",
        4 => "ferry",
        5 => "cable tram",
        6 => "gondola",
        7 => "funicular",
        11 => "trolleybus",
        12 => "monorail",
        _ => "unknown",
    }
}

const ROUTE_COLUMNS: &str =
    "route_id, agency_id, route_short_name, route_long_name, route_type, route_color";

fn route_from_row(row: &Row) -> rusqlite::Result<Route> {
    let mut route = Route {
        route_id: row.get(0)?,
        agency_id: row.get(1)?,
        route_short_name: row.get(2)?,
        route_long_name: row.get(3)?,
        route_type: row.get(4)?,
        route_color: row.get(5)?,
        ..Route::default()
    };
    route.vehicle_type = vehicle_type(route.route_type).to_string();
    Ok(route)
}

pub fn get_routes(conn: &Connection) -> Result<Vec<Route>> {
    let mut stmt = conn.prepare(&format!("SELECT {ROUTE_COLUMNS} FROM routes"))?;
    let routes = stmt
        .query_map([], route_from_row)?
        .collect::<std::result::Result<Vec<Route>, rusqlite::Error>>()?;

    if routes.is_empty() {
        return Err(Error::not_found("no routes found"));
    }

    Ok(routes)
}

pub fn get_route_by_id(conn: &Connection, route_id: &str) -> Result<Route> {
    conn.prepare(&format!(
        "SELECT {ROUTE_COLUMNS} FROM routes WHERE route_id = ?1"
    ))?
    .query_row(params![route_id], route_from_row)
    .optional()?
    .ok_or_else(|| Error::not_found(format!("no route found with id {route_id}")))
}

/// All routes that call at a stop, via its stop_times and trips.
pub fn get_routes_by_stop(conn: &Connection, stop_id: &str) -> Result<Vec<Route>> {
    let sql = "
        SELECT DISTINCT r.route_id, r.agency_id, r.route_short_name, r.route_long_name,
               r.route_type, r.route_color
        FROM stop_times st
        JOIN trips t ON st.trip_id = t.trip_id
        JOIN routes r ON t.route_id = r.route_id
        WHERE st.stop_id = ?1";

    let mut stmt = conn.prepare(sql)?;
    let routes = stmt
        .query_map(params![stop_id], route_from_row)?
        .collect::<std::result::Result<Vec<Route>, rusqlite::Error>>()?;

    if routes.is_empty() {
        return Err(Error::not_found(format!(
            "no routes found for stop {stop_id}"
        )));
    }

    Ok(routes)
}

pub fn get_route_by_trip(conn: &Connection, trip_id: &str) -> Result<Route> {
    let sql = "
        SELECT r.route_id, r.agency_id, r.route_short_name, r.route_long_name,
               r.route_type, r.route_color
        FROM trips t
        JOIN routes r ON t.route_id = r.route_id
        WHERE t.trip_id = ?1";

    conn.prepare(sql)?
        .query_row(params![trip_id], route_from_row)
        .optional()?
        .ok_or_else(|| Error::not_found(format!("no route found for trip {trip_id}")))
}

/// Substring lookup on the route id.
pub fn search_routes_by_id(conn: &Connection, search_text: &str) -> Result<Vec<Route>> {
    let normalized = search_text.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(Error::invalid_input("empty search text"));
    }

    let sql = format!(
        "SELECT {ROUTE_COLUMNS} FROM routes WHERE LOWER(route_id) LIKE '%' || ?1 || '%'"
    );

    let mut stmt = conn.prepare(&sql)?;
    let routes = stmt
        .query_map(params![normalized], route_from_row)?
        .collect::<std::result::Result<Vec<Route>, rusqlite::Error>>()?;

    if routes.is_empty() {
        return Err(Error::not_found(format!(
            "no routes found for search {search_text}"
        )));
    }

    Ok(routes)
}

/// Whitespace-split scored text search over long name, short name, id and
/// the route n-gram table. Same boosts as the stop search: 3 word, 2 prefix,
/// 1 substring; ordered by score then long name, capped at 100.
pub fn search_routes(conn: &Connection, search_text: &str) -> Result<Vec<RouteSearchResult>> {
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
                WHEN LOWER(r.route_long_name) LIKE '% ' || ? || ' %' THEN 3
                WHEN LOWER(r.route_long_name) LIKE ? || '%' THEN 2
                WHEN LOWER(r.route_long_name) LIKE '%' || ? || '%' THEN 1
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
            "(LOWER(r.route_long_name) LIKE '%' || ? || '%'
              OR LOWER(r.route_short_name) LIKE '%' || ? || '%'
              OR LOWER(r.route_id) LIKE '%' || ? || '%'
              OR LOWER(n.ngram) LIKE '%' || ? || '%')"
                .to_string(),
        );
        for _ in 0..4 {
            args.push(Box::new(word.to_string()));
        }
    }

    let sql = format!(
        "SELECT DISTINCT r.route_id, r.route_long_name, ({score}) AS score
         FROM routes r
         LEFT JOIN route_ngrams n ON r.route_id = n.route_id
         WHERE {conditions}
         ORDER BY score DESC, r.route_long_name ASC
         LIMIT 100",
        score = score_exprs.join(" + "),
        conditions = conditions.join(" AND "),
    );

    let mut stmt = conn.prepare(&sql)?;
    let results = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok(RouteSearchResult {
                route_id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<RouteSearchResult>, rusqlite::Error>>()?;

    if results.is_empty() {
        return Err(Error::not_found(format!(
            "no routes found for search {search_text}"
        )));
    }

    Ok(results)
}

/// Rebuild the route n-gram table from the current routes. Called at the end
/// of every refresh.
pub fn rebuild_route_ngrams(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM route_ngrams", [])?;
    {
        let mut select = tx.prepare("SELECT route_id, route_long_name FROM routes")?;
        let mut insert =
            tx.prepare("INSERT INTO route_ngrams (route_id, ngram) VALUES (?1, ?2)")?;
        let rows = select.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (route_id, long_name) = row?;
            for gram in name_trigrams(&long_name) {
                insert.execute(params![route_id, gram])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use rusqlite::Connection;

    fn fixture_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_default_tables(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO routes (route_id, agency_id, route_short_name, route_long_name, route_type, route_color) VALUES
                ('EAST-201', 'AM', 'EAST', 'Eastern Line', 2, '00AA00');
             INSERT INTO routes (route_id, agency_id, route_short_name, route_long_name, route_type, route_color) VALUES
                ('INN-202', 'NZB', 'INN', 'Inner Link', 3, 'FFAA00');
             INSERT INTO stops (stop_id, stop_name) VALUES ('s1', 'Britomart Train Station 3');
             INSERT INTO trips (trip_id, route_id, service_id) VALUES ('t1', 'EAST-201', 'WD');
             INSERT INTO stop_times (trip_id, stop_id, stop_sequence) VALUES ('t1', 's1', 1);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn vehicle_type_mapping_covers_the_gtfs_table() {
        assert_eq!(vehicle_type(0), "tram");
        assert_eq!(vehicle_type(1), "metro");
        assert_eq!(vehicle_type(2), "train");
        assert_eq!(vehicle_type(3), "bus");
        assert_eq!(vehicle_type(4), "ferry");
        assert_eq!(vehicle_type(5), "cable tram");
        assert_eq!(vehicle_type(6), "gondola");
        assert_eq!(vehicle_type(7), "funicular");
        assert_eq!(vehicle_type(11), "trolleybus");
        assert_eq!(vehicle_type(12), "monorail");
        assert_eq!(vehicle_type(8), "unknown");
        assert_eq!(vehicle_type(99), "unknown");
    }

    #[test]
    fn lookups_by_id_stop_and_trip() {
        let conn = fixture_conn();

        let all = get_routes(&conn).unwrap();
        assert_eq!(all.len(), 2);

        let east = get_route_by_id(&conn, "EAST-201").unwrap();
        assert_eq!(east.vehicle_type, "train");
        assert!(get_route_by_id(&conn, "missing").is_err());

        let at_stop = get_routes_by_stop(&conn, "s1").unwrap();
        assert_eq!(at_stop.len(), 1);
        assert_eq!(at_stop[0].route_id, "EAST-201");

        let by_trip = get_route_by_trip(&conn, "t1").unwrap();
        assert_eq!(by_trip.route_id, "EAST-201");
    }

    #[test]
    fn id_search_is_substring_based() {
        let conn = fixture_conn();
        let hits = search_routes_by_id(&conn, "east").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].route_id, "EAST-201");
    }

    #[test]
    fn scored_search_prefers_word_matches() {
        let conn = fixture_conn();
        rebuild_route_ngrams(&conn).unwrap();

        let hits = search_routes(&conn, "eastern line").unwrap();
        assert_eq!(hits[0].route_id, "EAST-201");

        assert!(search_routes(&conn, "").is_err());
        assert!(search_routes(&conn, "nothing matches this").is_err());
    }
}
