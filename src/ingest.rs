//! Archive ingestion: fetch the GTFS zip from the feed publisher and stream
//! its tabular members into the store, one transaction per member.

use std::io::{Cursor, Read};

use rusqlite::{params_from_iter, Connection};
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::schema;

/// Fetch the archive bytes from the publisher. The request is marked
/// non-cacheable; the auth header and the contact email are attached when
/// configured.
pub fn fetch_archive(
    url: &str,
    auth: Option<(&str, &str)>,
    contact_email: Option<&str>,
) -> Result<Vec<u8>> {
    if url.is_empty() {
        return Err(Error::invalid_input("missing archive url"));
    }

    let client = reqwest::blocking::Client::new();
    let mut request = client.get(url).header("Cache-Control", "no-cache");
    if let Some((header, key)) = auth {
        request = request.header(header, key);
    }
    if let Some(email) = contact_email {
        request = request.header("From", email);
    }

    let response = request.send().map_err(|e| {
        Error::transient(format!("archive request to {url} failed: {e}"))
    })?;

    if !response.status().is_success() {
        return Err(Error::transient(format!(
            "archive fetch returned HTTP {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .map_err(|e| Error::transient(format!("error reading archive body: {e}")))?;

    Ok(body.to_vec())
}

/// Stream every tabular member of the archive into the store. Directories
/// and non-.txt members are skipped. A failure inside a member rolls that
/// member back and aborts the whole ingest.
pub fn write_archive(conn: &Connection, zip_bytes: &[u8]) -> Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;

    for index in 0..archive.len() {
        let member = archive.by_index(index)?;
        let name = member.name().to_string();

        if member.is_dir() || !name.ends_with(".txt") {
            log::debug!("skipping non-tabular archive member {name}");
            continue;
        }

        let table = canonical_table_name(&name);
        log::info!("ingesting archive member {name} into {table}");
        ingest_member(conn, &table, member)
            .map_err(|e| Error::internal(format!("ingest of {name} failed: {e}")))?;
    }

    Ok(())
}

/// Member basename, suffix stripped, lowercased: "GTFS/Stops.txt" -> "stops".
fn canonical_table_name(member_name: &str) -> String {
    let base = member_name.rsplit('/').next().unwrap_or(member_name);
    base.trim_end_matches(".txt").to_ascii_lowercase()
}

fn ingest_member(conn: &Connection, table: &str, reader: impl Read) -> Result<()> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Ok(());
    }

    ensure_member_table(conn, table, &headers)?;

    let tx = conn.unchecked_transaction()?;
    let mut record = csv::StringRecord::new();
    while csv_reader.read_record(&mut record)? {
        // Empty fields are left out of the insert so column defaults fire.
        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<&str> = Vec::new();
        for (i, value) in record.iter().enumerate() {
            if i >= headers.len() {
                break;
            }
            if !value.is_empty() {
                columns.push(headers[i].as_str());
                values.push(value);
            }
        }
        if columns.is_empty() {
            continue;
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
        );
        let mut stmt = tx.prepare_cached(&sql)?;
        stmt.execute(params_from_iter(values.iter()))?;
    }
    tx.commit()?;

    Ok(())
}

/// Make sure a table exists for this member with at least the header
/// columns. Canonical tables are extended with TEXT columns for headers the
/// default schema does not know; unknown members get a fresh all-TEXT table.
fn ensure_member_table(conn: &Connection, table: &str, headers: &[String]) -> Result<()> {
    let existing = schema::table_columns(conn, table)?;

    if existing.is_empty() {
        schema::create_table_if_not_exists(conn, table, headers)?;
        return Ok(());
    }

    for header in headers {
        if !existing.iter().any(|c| c == header) {
            schema::add_column_if_absent(conn, table, header)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(members: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in members {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn prepared_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_default_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn ingests_canonical_members_and_skips_the_rest() {
        let conn = prepared_conn();
        let zip_bytes = build_zip(&[
            ("docs/", ""),
            ("readme.md", "not a feed file"),
            (
                "stops.txt",
                "stop_id,stop_name,stop_lat,stop_lon\n\
                 s1,Britomart Train Station 3,-36.844,174.768\n\
                 s2,Queen St Stop B,-36.850,174.765\n",
            ),
            (
                "routes.txt",
                "route_id,route_short_name,route_type\nr1,EAST,2\n",
            ),
        ]);

        write_archive(&conn, &zip_bytes).unwrap();

        let stops: i64 = conn
            .query_row("SELECT COUNT(*) FROM stops", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stops, 2);

        let route_type: i64 = conn
            .query_row("SELECT route_type FROM routes WHERE route_id = 'r1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(route_type, 2);
    }

    #[test]
    fn empty_fields_fall_back_to_column_defaults() {
        let conn = prepared_conn();
        let zip_bytes = build_zip(&[(
            "stop_times.txt",
            "trip_id,arrival_time,departure_time,stop_id,stop_sequence,pickup_type\n\
             t1,08:00:00,08:00:00,s1,1,\n",
        )]);

        write_archive(&conn, &zip_bytes).unwrap();

        // pickup_type was empty in the record, so the schema default (0) fired.
        let pickup: i64 = conn
            .query_row("SELECT pickup_type FROM stop_times WHERE trip_id = 't1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(pickup, 0);
    }

    #[test]
    fn unknown_member_creates_its_own_table() {
        let conn = prepared_conn();
        let zip_bytes = build_zip(&[(
            "occupancies.txt",
            "trip_id,occupancy_status\nt1,MANY_SEATS_AVAILABLE\n",
        )]);

        write_archive(&conn, &zip_bytes).unwrap();

        let status: String = conn
            .query_row(
                "SELECT occupancy_status FROM occupancies WHERE trip_id = 't1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, "MANY_SEATS_AVAILABLE");
    }

    #[test]
    fn new_headers_extend_existing_tables() {
        let conn = prepared_conn();
        let zip_bytes = build_zip(&[(
            "stops.txt",
            "stop_id,stop_name,start_date\ns1,Symonds St,20240101\n",
        )]);

        write_archive(&conn, &zip_bytes).unwrap();

        let start_date: String = conn
            .query_row("SELECT start_date FROM stops WHERE stop_id = 's1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(start_date, "20240101");
    }

    #[test]
    fn hostile_header_aborts_the_member() {
        let conn = prepared_conn();
        let zip_bytes = build_zip(&[(
            "extra.txt",
            "good_id,bad column name\nx,y\n",
        )]);

        assert!(write_archive(&conn, &zip_bytes).is_err());
    }

    #[test]
    fn nested_member_names_map_to_plain_tables() {
        assert_eq!(canonical_table_name("gtfs/Stops.txt"), "stops");
        assert_eq!(canonical_table_name("agency.txt"), "agency");
    }
}
