use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::Trip;
use crate::stops::get_parent_stop;

pub fn get_trip_by_id(conn: &Connection, trip_id: &str) -> Result<Trip> {
    let sql = "SELECT trip_id, route_id, service_id, trip_headsign, shape_id,
                      direction_id, wheelchair_accessible, bikes_allowed
               FROM trips WHERE trip_id = ?1";

    conn.prepare(sql)?
        .query_row(params![trip_id], |row| {
            Ok(Trip {
                trip_id: row.get(0)?,
                route_id: row.get(1)?,
                service_id: row.get(2)?,
                trip_headsign: row.get(3)?,
                shape_id: row.get(4)?,
                direction_id: row.get(5)?,
                wheelchair_accessible: row.get(6)?,
                bikes_allowed: row.get(7)?,
            })
        })
        .optional()?
        .ok_or_else(|| Error::not_found(format!("no trip found with id {trip_id}")))
}

/// The stops a trip calls at, reduced to parent-station ids for routing
/// context. Free-standing stops stand for themselves; duplicates collapse.
pub fn trip_stop_ids_as_parents(conn: &Connection, trip_id: &str) -> Result<Vec<String>> {
    let child_ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT stop_id FROM stop_times WHERE trip_id = ?1 ORDER BY stop_sequence",
        )?;
        let rows = stmt
            .query_map(params![trip_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, rusqlite::Error>>()?;
        rows
    };

    let mut parent_ids: Vec<String> = Vec::new();
    for child_id in child_ids {
        let parent = get_parent_stop(conn, &child_id)?;
        if !parent_ids.contains(&parent.stop_id) {
            parent_ids.push(parent.stop_id);
        }
    }

    if parent_ids.is_empty() {
        return Err(Error::not_found(format!(
            "no stops found for trip {trip_id}"
        )));
    }

    Ok(parent_ids)
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
            "INSERT INTO trips (trip_id, route_id, service_id, trip_headsign, shape_id) VALUES
                ('t1', 'EAST-201', 'WD', 'Manukau', 'shp-1');
             INSERT INTO stops (stop_id, stop_name, location_type) VALUES ('P', 'Panmure Train Station', 1);
             INSERT INTO stops (stop_id, stop_name, parent_station) VALUES ('P1', 'Panmure Train Station 1', 'P');
             INSERT INTO stops (stop_id, stop_name) VALUES ('B1', 'Symonds St');
             INSERT INTO stop_times (trip_id, stop_id, stop_sequence) VALUES ('t1', 'P1', 1);
             INSERT INTO stop_times (trip_id, stop_id, stop_sequence) VALUES ('t1', 'B1', 2);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn trip_lookup_by_id() {
        let conn = fixture_conn();
        let trip = get_trip_by_id(&conn, "t1").unwrap();
        assert_eq!(trip.trip_headsign, "Manukau");
        assert_eq!(trip.shape_id, "shp-1");
        assert!(get_trip_by_id(&conn, "missing").is_err());
    }

    #[test]
    fn trip_stops_collapse_to_parent_ids() {
        let conn = fixture_conn();
        let parents = trip_stop_ids_as_parents(&conn, "t1").unwrap();
        assert_eq!(parents, vec!["P".to_string(), "B1".to_string()]);
    }
}
