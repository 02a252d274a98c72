//! Shape polylines: loading, per-leg segmentation, and GeoJSON output.

use geojson::{Feature, Geometry, JsonObject, Value};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::error::{Error, Result};
use crate::geomath::haversine_km;
use crate::models::{Shape, ShapePoint};

/// Shape points for a trip, ordered by shape_pt_sequence.
pub fn get_shape_by_trip_id(conn: &Connection, trip_id: &str) -> Result<Shape> {
    let sql = "
        SELECT s.shape_id, s.shape_pt_lat, s.shape_pt_lon, s.shape_dist_traveled
        FROM shapes s
        JOIN trips t ON s.shape_id = t.shape_id
        WHERE t.trip_id = ?1
        ORDER BY s.shape_pt_sequence";

    let mut shape = Shape::default();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![trip_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            ShapePoint {
                lat: row.get(1)?,
                lon: row.get(2)?,
                dist_traveled: row.get(3)?,
            },
        ))
    })?;
    for row in rows {
        let (shape_id, point) = row?;
        shape.shape_id = shape_id;
        shape.coordinates.push(point);
    }

    if shape.coordinates.is_empty() {
        return Err(Error::not_found(format!(
            "no shape found for trip {trip_id}"
        )));
    }

    Ok(shape)
}

/// Shape points for a shape_id, ordered by shape_pt_sequence.
pub fn get_shape_by_id(conn: &Connection, shape_id: &str) -> Result<Shape> {
    let sql = "
        SELECT shape_pt_lat, shape_pt_lon, shape_dist_traveled
        FROM shapes
        WHERE shape_id = ?1
        ORDER BY shape_pt_sequence";

    let mut stmt = conn.prepare(sql)?;
    let coordinates = stmt
        .query_map(params![shape_id], |row| {
            Ok(ShapePoint {
                lat: row.get(0)?,
                lon: row.get(1)?,
                dist_traveled: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<ShapePoint>, rusqlite::Error>>()?;

    if coordinates.is_empty() {
        return Err(Error::not_found(format!("no shape found with id {shape_id}")));
    }

    Ok(Shape {
        shape_id: shape_id.to_string(),
        coordinates,
    })
}

/// shape_dist_traveled of a trip's call at a stop, when present and
/// positive.
pub fn stop_shape_distance(conn: &Connection, trip_id: &str, stop_id: &str) -> Option<f64> {
    let dist: Option<f64> = conn
        .query_row(
            "SELECT shape_dist_traveled FROM stop_times WHERE trip_id = ?1 AND stop_id = ?2 LIMIT 1",
            params![trip_id, stop_id],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();

    dist.filter(|d| *d > 0.0)
}

/// True when the cumulative-distance segmentation path can be trusted:
/// every point must carry a positive distance.
pub fn has_full_distance_annotation(points: &[ShapePoint]) -> bool {
    !points.is_empty() && points.iter().all(|p| p.dist_traveled > 0.0)
}

/// Keep the points whose cumulative distance lies inside [min, max].
/// Idempotent: re-running on its own output returns the same points.
pub fn segment_by_distance(points: &[ShapePoint], min_dist: f64, max_dist: f64) -> Vec<ShapePoint> {
    points
        .iter()
        .filter(|p| p.dist_traveled >= min_dist && p.dist_traveled <= max_dist)
        .copied()
        .collect()
}

/// Index of the shape point nearest to a coordinate.
pub fn nearest_shape_index(points: &[ShapePoint], lat: f64, lon: f64) -> Option<usize> {
    points
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            haversine_km(lat, lon, a.lat, a.lon).total_cmp(&haversine_km(lat, lon, b.lat, b.lon))
        })
        .map(|(i, _)| i)
}

/// Slice the shape between the points nearest to two stops, inclusive,
/// normalising order. The fallback when distance annotation is unusable;
/// approximate when a shape revisits a location.
pub fn segment_by_nearest_index(
    points: &[ShapePoint],
    from_lat: f64,
    from_lon: f64,
    to_lat: f64,
    to_lon: f64,
) -> Vec<ShapePoint> {
    let (Some(start), Some(end)) = (
        nearest_shape_index(points, from_lat, from_lon),
        nearest_shape_index(points, to_lat, to_lon),
    ) else {
        return points.to_vec();
    };

    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    points[start..=end].to_vec()
}

/// A shape as a GeoJSON LineString feature. The third coordinate carries the
/// cumulative distance when the shape is annotated.
pub fn shape_to_feature(shape: &Shape) -> Feature {
    let coordinates: Vec<Vec<f64>> = shape
        .coordinates
        .iter()
        .map(|p| vec![p.lon, p.lat, p.dist_traveled])
        .collect();

    let mut properties = JsonObject::new();
    properties.insert("shape_id".to_string(), json!(shape.shape_id));

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::LineString(coordinates))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use rusqlite::Connection;

    fn point(lat: f64, lon: f64, dist: f64) -> ShapePoint {
        ShapePoint {
            lat,
            lon,
            dist_traveled: dist,
        }
    }

    #[test]
    fn loads_ordered_shape_for_trip() {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_default_tables(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO trips (trip_id, route_id, service_id, shape_id) VALUES ('t1', 'r1', 'WD', 'shp-1');
             INSERT INTO shapes (shape_id, shape_pt_lat, shape_pt_lon, shape_pt_sequence, shape_dist_traveled)
             VALUES ('shp-1', -36.85, 174.76, 2, 1.5);
             INSERT INTO shapes (shape_id, shape_pt_lat, shape_pt_lon, shape_pt_sequence, shape_dist_traveled)
             VALUES ('shp-1', -36.84, 174.77, 1, 0.5);",
        )
        .unwrap();

        let shape = get_shape_by_trip_id(&conn, "t1").unwrap();
        assert_eq!(shape.shape_id, "shp-1");
        assert_eq!(shape.coordinates.len(), 2);
        // Ordered by sequence, not by insert order.
        assert_eq!(shape.coordinates[0].dist_traveled, 0.5);

        assert!(get_shape_by_trip_id(&conn, "t2").is_err());
    }

    #[test]
    fn distance_segmentation_is_idempotent() {
        let points = vec![
            point(-36.1, 174.1, 1.0),
            point(-36.2, 174.2, 2.0),
            point(-36.3, 174.3, 3.0),
            point(-36.4, 174.4, 4.0),
        ];

        let once = segment_by_distance(&points, 2.0, 3.0);
        let twice = segment_by_distance(&once, 2.0, 3.0);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn full_annotation_requires_every_point() {
        let mut points = vec![point(-36.1, 174.1, 1.0), point(-36.2, 174.2, 2.0)];
        assert!(has_full_distance_annotation(&points));
        points.push(point(-36.3, 174.3, 0.0));
        assert!(!has_full_distance_annotation(&points));
        assert!(!has_full_distance_annotation(&[]));
    }

    #[test]
    fn nearest_index_slicing_normalises_order() {
        let points = vec![
            point(-36.10, 174.10, 0.0),
            point(-36.20, 174.20, 0.0),
            point(-36.30, 174.30, 0.0),
            point(-36.40, 174.40, 0.0),
        ];

        // "from" is nearest the later point, "to" the earlier one.
        let segment = segment_by_nearest_index(&points, -36.40, 174.40, -36.20, 174.20);
        assert_eq!(segment.len(), 3);
        assert_eq!(segment[0].lat, -36.20);
        assert_eq!(segment[2].lat, -36.40);
    }

    #[test]
    fn feature_carries_lon_lat_dist_triples() {
        let shape = Shape {
            shape_id: "shp-1".to_string(),
            coordinates: vec![point(-36.85, 174.76, 1.0)],
        };
        let feature = shape_to_feature(&shape);
        let Some(Geometry {
            value: Value::LineString(coords),
            ..
        }) = feature.geometry
        else {
            panic!("expected a LineString");
        };
        assert_eq!(coords[0], vec![174.76, -36.85, 1.0]);
    }
}
