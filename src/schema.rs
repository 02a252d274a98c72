//! Canonical GTFS table set, index batch, and the dynamic DDL used when an
//! archive carries columns (or whole files) the canonical set does not know
//! about. Required columns get NOT NULL with a textual default and optional
//! columns default to empty/zero, so partial archive rows always insert.

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::Connection;

use crate::error::{Error, Result};

lazy_static! {
    static ref VALID_SQL_IDENT: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

const DEFAULT_TABLES_SQL: &str = r#"
    -- Table: agency
    CREATE TABLE IF NOT EXISTS agency (
        agency_id TEXT PRIMARY KEY,
        agency_name TEXT NOT NULL DEFAULT '',
        agency_url TEXT NOT NULL DEFAULT '',
        agency_timezone TEXT NOT NULL DEFAULT '',
        agency_lang TEXT DEFAULT '',
        agency_phone TEXT DEFAULT '',
        agency_fare_url TEXT DEFAULT '',
        agency_email TEXT DEFAULT ''
    );

    -- Table: stops
    CREATE TABLE IF NOT EXISTS stops (
        stop_id TEXT PRIMARY KEY,
        stop_code TEXT DEFAULT '',
        stop_name TEXT NOT NULL DEFAULT '',
        stop_desc TEXT DEFAULT '',
        stop_lat REAL NOT NULL DEFAULT 0.0,
        stop_lon REAL NOT NULL DEFAULT 0.0,
        zone_id TEXT DEFAULT '',
        stop_url TEXT DEFAULT '',
        location_type INTEGER DEFAULT 0,
        parent_station TEXT DEFAULT '',
        stop_timezone TEXT DEFAULT '',
        wheelchair_boarding INTEGER DEFAULT 0,
        level_id TEXT DEFAULT '',
        platform_code TEXT DEFAULT ''
    );

    -- Table: routes
    CREATE TABLE IF NOT EXISTS routes (
        route_id TEXT PRIMARY KEY,
        agency_id TEXT DEFAULT '',
        route_short_name TEXT NOT NULL DEFAULT '',
        route_long_name TEXT NOT NULL DEFAULT '',
        route_desc TEXT DEFAULT '',
        route_type INTEGER NOT NULL DEFAULT 0,
        route_url TEXT DEFAULT '',
        route_color TEXT DEFAULT '',
        route_text_color TEXT DEFAULT '',
        route_sort_order INTEGER DEFAULT 0,
        continuous_pickup INTEGER DEFAULT 0,
        continuous_drop_off INTEGER DEFAULT 0
    );

    -- Table: trips
    CREATE TABLE IF NOT EXISTS trips (
        trip_id TEXT PRIMARY KEY,
        route_id TEXT NOT NULL DEFAULT '',
        service_id TEXT NOT NULL DEFAULT '',
        trip_headsign TEXT DEFAULT '',
        trip_short_name TEXT DEFAULT '',
        direction_id INTEGER DEFAULT 0,
        block_id TEXT DEFAULT '',
        shape_id TEXT DEFAULT '',
        wheelchair_accessible INTEGER DEFAULT 0,
        bikes_allowed INTEGER DEFAULT 0
    );

    -- Table: stop_times
    CREATE TABLE IF NOT EXISTS stop_times (
        trip_id TEXT NOT NULL DEFAULT '',
        arrival_time TEXT DEFAULT '',
        departure_time TEXT DEFAULT '',
        stop_id TEXT NOT NULL DEFAULT '',
        stop_sequence INTEGER NOT NULL DEFAULT 0,
        stop_headsign TEXT DEFAULT '',
        pickup_type INTEGER DEFAULT 0,
        drop_off_type INTEGER DEFAULT 0,
        continuous_pickup INTEGER DEFAULT 0,
        continuous_drop_off INTEGER DEFAULT 0,
        shape_dist_traveled REAL DEFAULT 0.0,
        timepoint INTEGER DEFAULT 0,
        PRIMARY KEY (trip_id, stop_sequence)
    );

    -- Table: calendar
    CREATE TABLE IF NOT EXISTS calendar (
        service_id TEXT PRIMARY KEY,
        monday INTEGER NOT NULL DEFAULT 0,
        tuesday INTEGER NOT NULL DEFAULT 0,
        wednesday INTEGER NOT NULL DEFAULT 0,
        thursday INTEGER NOT NULL DEFAULT 0,
        friday INTEGER NOT NULL DEFAULT 0,
        saturday INTEGER NOT NULL DEFAULT 0,
        sunday INTEGER NOT NULL DEFAULT 0,
        start_date TEXT NOT NULL DEFAULT '',
        end_date TEXT NOT NULL DEFAULT ''
    );

    -- Table: calendar_dates
    CREATE TABLE IF NOT EXISTS calendar_dates (
        service_id TEXT NOT NULL DEFAULT '',
        date TEXT NOT NULL DEFAULT '',
        exception_type INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (service_id, date)
    );

    -- Table: fare_attributes
    CREATE TABLE IF NOT EXISTS fare_attributes (
        fare_id TEXT PRIMARY KEY,
        price REAL NOT NULL DEFAULT 0.0,
        currency_type TEXT NOT NULL DEFAULT '',
        payment_method INTEGER NOT NULL DEFAULT 0,
        transfers INTEGER DEFAULT 0,
        agency_id TEXT DEFAULT '',
        transfer_duration INTEGER DEFAULT 0
    );

    -- Table: fare_rules
    CREATE TABLE IF NOT EXISTS fare_rules (
        fare_id TEXT NOT NULL DEFAULT '',
        route_id TEXT DEFAULT '',
        origin_id TEXT DEFAULT '',
        destination_id TEXT DEFAULT '',
        contains_id TEXT DEFAULT ''
    );

    -- Table: shapes
    CREATE TABLE IF NOT EXISTS shapes (
        shape_id TEXT NOT NULL DEFAULT '',
        shape_pt_lat REAL NOT NULL DEFAULT 0.0,
        shape_pt_lon REAL NOT NULL DEFAULT 0.0,
        shape_pt_sequence INTEGER NOT NULL DEFAULT 0,
        shape_dist_traveled REAL DEFAULT 0.0,
        PRIMARY KEY (shape_id, shape_pt_sequence)
    );

    -- Table: frequencies
    CREATE TABLE IF NOT EXISTS frequencies (
        trip_id TEXT NOT NULL DEFAULT '',
        start_time TEXT NOT NULL DEFAULT '',
        end_time TEXT NOT NULL DEFAULT '',
        headway_secs INTEGER NOT NULL DEFAULT 0,
        exact_times INTEGER DEFAULT 0
    );

    -- Table: transfers
    CREATE TABLE IF NOT EXISTS transfers (
        from_stop_id TEXT NOT NULL DEFAULT '',
        to_stop_id TEXT NOT NULL DEFAULT '',
        from_trip_id TEXT DEFAULT '',
        to_trip_id TEXT DEFAULT '',
        transfer_type INTEGER NOT NULL DEFAULT 0,
        min_transfer_time INTEGER DEFAULT 0,
        PRIMARY KEY (from_stop_id, to_stop_id, from_trip_id, to_trip_id)
    );

    -- Table: pathways
    CREATE TABLE IF NOT EXISTS pathways (
        pathway_id TEXT PRIMARY KEY,
        from_stop_id TEXT NOT NULL DEFAULT '',
        to_stop_id TEXT NOT NULL DEFAULT '',
        pathway_mode INTEGER NOT NULL DEFAULT 0,
        is_bidirectional INTEGER NOT NULL DEFAULT 0,
        length REAL DEFAULT 0.0,
        traversal_time INTEGER DEFAULT 0,
        stair_count INTEGER DEFAULT 0,
        max_slope REAL DEFAULT 0.0,
        min_width REAL DEFAULT 0.0,
        signposted_as TEXT DEFAULT '',
        reversed_signposted_as TEXT DEFAULT ''
    );

    -- Table: levels
    CREATE TABLE IF NOT EXISTS levels (
        level_id TEXT PRIMARY KEY,
        level_index REAL NOT NULL DEFAULT 0.0,
        level_name TEXT DEFAULT ''
    );

    -- Table: feed_info
    CREATE TABLE IF NOT EXISTS feed_info (
        feed_publisher_name TEXT NOT NULL DEFAULT '',
        feed_publisher_url TEXT NOT NULL DEFAULT '',
        feed_lang TEXT NOT NULL DEFAULT '',
        default_lang TEXT DEFAULT '',
        feed_start_date TEXT DEFAULT '',
        feed_end_date TEXT DEFAULT '',
        feed_version TEXT DEFAULT '',
        feed_contact_email TEXT DEFAULT '',
        feed_contact_url TEXT DEFAULT ''
    );

    -- Auxiliary text-search tables, rebuilt after every ingest.
    CREATE TABLE IF NOT EXISTS stop_ngrams (
        stop_id TEXT NOT NULL DEFAULT '',
        ngram TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS route_ngrams (
        route_id TEXT NOT NULL DEFAULT '',
        ngram TEXT NOT NULL DEFAULT ''
    );
"#;

const DEFAULT_INDEXES_SQL: &str = r#"
    -- Indexes for agency table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_agency_agency_id ON agency (agency_id);

    -- Indexes for stops table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_stops_stop_id ON stops (stop_id);
    CREATE INDEX IF NOT EXISTS idx_stops_zone_id ON stops (zone_id);
    CREATE INDEX IF NOT EXISTS idx_stops_parent_station ON stops (parent_station);

    -- Indexes for routes table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_routes_route_id ON routes (route_id);
    CREATE INDEX IF NOT EXISTS idx_routes_agency_id ON routes (agency_id);

    -- Indexes for trips table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_trips_trip_id ON trips (trip_id);
    CREATE INDEX IF NOT EXISTS idx_trips_service_id ON trips (service_id);
    CREATE INDEX IF NOT EXISTS idx_trips_route_id ON trips (route_id);

    -- Indexes for stop_times table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_stop_times_trip_id_sequence ON stop_times (trip_id, stop_sequence);
    CREATE INDEX IF NOT EXISTS idx_stop_times_stop_id ON stop_times (stop_id);

    -- Indexes for calendar table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_calendar_service_id ON calendar (service_id);
    CREATE INDEX IF NOT EXISTS idx_calendar_start_end_date ON calendar (start_date, end_date);

    -- Indexes for calendar_dates table
    CREATE INDEX IF NOT EXISTS idx_calendar_dates_date_exception_type ON calendar_dates (date, exception_type);
    CREATE INDEX IF NOT EXISTS idx_calendar_dates_service_id ON calendar_dates (service_id);

    -- Indexes for fare tables
    CREATE UNIQUE INDEX IF NOT EXISTS idx_fare_attributes_fare_id ON fare_attributes (fare_id);
    CREATE INDEX IF NOT EXISTS idx_fare_rules_fare_id ON fare_rules (fare_id);
    CREATE INDEX IF NOT EXISTS idx_fare_rules_route_id ON fare_rules (route_id);

    -- Indexes for shapes table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_shapes_shape_id_sequence ON shapes (shape_id, shape_pt_sequence);

    -- Indexes for frequencies table
    CREATE INDEX IF NOT EXISTS idx_frequencies_trip_id ON frequencies (trip_id);

    -- Indexes for transfers table
    CREATE INDEX IF NOT EXISTS idx_transfers_from_to_stop_id ON transfers (from_stop_id, to_stop_id);

    -- Indexes for pathways table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_pathways_pathway_id ON pathways (pathway_id);
    CREATE INDEX IF NOT EXISTS idx_pathways_from_stop_id ON pathways (from_stop_id);
    CREATE INDEX IF NOT EXISTS idx_pathways_to_stop_id ON pathways (to_stop_id);

    -- Indexes for levels table
    CREATE UNIQUE INDEX IF NOT EXISTS idx_levels_level_id ON levels (level_id);

    -- Indexes for the text-search tables
    CREATE INDEX IF NOT EXISTS idx_stop_ngrams_stop_id ON stop_ngrams (stop_id);
    CREATE INDEX IF NOT EXISTS idx_route_ngrams_route_id ON route_ngrams (route_id);
"#;

/// Materialise the canonical table set. Safe to run repeatedly.
pub fn create_default_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(DEFAULT_TABLES_SQL)?;
    Ok(())
}

/// Create the full index batch backing the query layer. Safe to run
/// repeatedly; a refresh re-runs it after re-ingest.
pub fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(DEFAULT_INDEXES_SQL)?;
    Ok(())
}

fn validate_ident(name: &str, what: &str) -> Result<()> {
    if VALID_SQL_IDENT.is_match(name) {
        Ok(())
    } else {
        Err(Error::invalid_input(format!("invalid {what} name: {name}")))
    }
}

/// Create a table for an archive member the canonical set does not cover,
/// all columns TEXT, with an index on every `*_id` column. Identifiers come
/// from the archive so they are validated before being spliced into SQL.
pub fn create_table_if_not_exists(conn: &Connection, table: &str, headers: &[String]) -> Result<()> {
    validate_ident(table, "table")?;
    for header in headers {
        validate_ident(header, "column")?;
    }

    let columns: Vec<String> = headers.iter().map(|h| format!("{h} TEXT")).collect();
    let create_sql = format!(
        "CREATE TABLE IF NOT EXISTS {table} ({});",
        columns.join(", ")
    );
    conn.execute_batch(&create_sql)?;

    for header in headers {
        if header.ends_with("_id") {
            let index_sql = format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{header} ON {table} ({header});"
            );
            conn.execute_batch(&index_sql)?;
        }
    }

    Ok(())
}

/// Column names of a table via PRAGMA table_info.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    validate_ident(table, "table")?;

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<String>, rusqlite::Error>>()?;

    Ok(columns)
}

/// Add a TEXT column when an archive member carries a header the existing
/// table lacks. No-op when the column is already present.
pub fn add_column_if_absent(conn: &Connection, table: &str, column: &str) -> Result<()> {
    validate_ident(table, "table")?;
    validate_ident(column, "column")?;

    if table_columns(conn, table)?.iter().any(|c| c == column) {
        return Ok(());
    }

    let alter_sql = format!("ALTER TABLE {table} ADD COLUMN {column} TEXT DEFAULT '';");
    conn.execute_batch(&alter_sql)?;

    Ok(())
}

/// Delete every row from every user table, enumerated from the catalogue.
/// Internal sqlite_* tables are skipped. Runs inside the caller's refresh
/// transaction scope.
pub fn clear_user_tables(conn: &Connection) -> Result<()> {
    let tables: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, rusqlite::Error>>()?;
        rows
    };

    for table in tables {
        if table.starts_with("sqlite_") {
            continue;
        }
        validate_ident(&table, "table")?;
        conn.execute(&format!("DELETE FROM {table}"), [])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn memory_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn default_tables_and_indexes_apply_cleanly_twice() {
        let conn = memory_conn();
        create_default_tables(&conn).unwrap();
        create_indexes(&conn).unwrap();
        create_default_tables(&conn).unwrap();
        create_indexes(&conn).unwrap();

        let cols = table_columns(&conn, "stop_times").unwrap();
        assert!(cols.contains(&"pickup_type".to_string()));
        assert!(cols.contains(&"shape_dist_traveled".to_string()));
    }

    #[test]
    fn partial_rows_get_defaults() {
        let conn = memory_conn();
        create_default_tables(&conn).unwrap();

        conn.execute("INSERT INTO stops (stop_id) VALUES ('s1')", [])
            .unwrap();
        let (name, location_type): (String, i32) = conn
            .query_row(
                "SELECT stop_name, location_type FROM stops WHERE stop_id = 's1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, "");
        assert_eq!(location_type, 0);
    }

    #[test]
    fn rejects_hostile_identifiers() {
        let conn = memory_conn();
        assert!(create_table_if_not_exists(
            &conn,
            "stops; DROP TABLE stops",
            &["stop_id".to_string()]
        )
        .is_err());
        assert!(create_table_if_not_exists(
            &conn,
            "extra",
            &["bad column".to_string()]
        )
        .is_err());
        assert!(add_column_if_absent(&conn, "stops", "x'y").is_err());
        assert!(table_columns(&conn, "1bad").is_err());
    }

    #[test]
    fn dynamic_table_indexes_id_columns() {
        let conn = memory_conn();
        create_table_if_not_exists(
            &conn,
            "occupancies",
            &["trip_id".to_string(), "load_factor".to_string()],
        )
        .unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_occupancies_trip_id'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn add_column_is_idempotent() {
        let conn = memory_conn();
        create_default_tables(&conn).unwrap();
        add_column_if_absent(&conn, "stops", "start_date").unwrap();
        add_column_if_absent(&conn, "stops", "start_date").unwrap();
        assert!(table_columns(&conn, "stops")
            .unwrap()
            .contains(&"start_date".to_string()));
    }

    #[test]
    fn clear_user_tables_empties_everything_but_keeps_schema() {
        let conn = memory_conn();
        create_default_tables(&conn).unwrap();
        conn.execute("INSERT INTO stops (stop_id) VALUES ('s1')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO calendar (service_id, start_date, end_date) VALUES ('A', '20240101', '20241231')",
            [],
        )
        .unwrap();

        clear_user_tables(&conn).unwrap();

        let stops: i64 = conn
            .query_row("SELECT COUNT(*) FROM stops", [], |row| row.get(0))
            .unwrap();
        let services: i64 = conn
            .query_row("SELECT COUNT(*) FROM calendar", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stops, 0);
        assert_eq!(services, 0);
        // Tables themselves survive.
        assert!(table_columns(&conn, "stops").unwrap().len() > 1);
    }
}
