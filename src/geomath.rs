//! Great-circle distance and walking-time helpers shared by the stop
//! queries and the journey planner.

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two WGS-84 points, in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin() * (d_lat / 2.0).sin()
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin() * (d_lon / 2.0).sin();

    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Seconds to walk `distance_km` at `speed_kmph`, rounded to the nearest
/// second. A non-positive speed falls back to the default 4.8 km/h.
pub fn walk_duration_secs(distance_km: f64, speed_kmph: f64) -> i64 {
    let speed = if speed_kmph <= 0.0 { 4.8 } else { speed_kmph };
    ((distance_km / speed) * 3600.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_pair() {
        // Britomart to Newmarket, roughly 3.1 km apart.
        let d = haversine_km(-36.8442, 174.7676, -36.8699, 174.7782);
        assert!(d > 2.5 && d < 3.5, "got {d}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_km(-36.85, 174.76, -36.85, 174.76), 0.0);
    }

    #[test]
    fn walk_duration_default_speed() {
        // 100 m at 4.8 km/h is 75 seconds.
        assert_eq!(walk_duration_secs(0.1, 4.8), 75);
        assert_eq!(walk_duration_secs(0.1, 0.0), 75);
    }
}
