//! Great-circle distance over the WGS84 sphere.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two points, in meters
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Cumulative distance along an ordered (lat, lon) track, in meters
pub fn track_distance(points: &[(f64, f64)]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_distance(pair[0].0, pair[0].1, pair[1].0, pair[1].1))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_points_are_zero() {
        assert_eq!(haversine_distance(10.5, -74.8, 10.5, -74.8), 0.0);
    }

    #[test]
    fn test_symmetry() {
        let forward = haversine_distance(10.0, -74.0, 11.0, -75.0);
        let backward = haversine_distance(11.0, -75.0, 10.0, -74.0);
        assert!((forward - backward).abs() < 1e-9);
    }

    #[test]
    fn test_antipodes_are_half_circumference() {
        let d = haversine_distance(0.0, 0.0, 0.0, 180.0);
        let half_circumference = std::f64::consts::PI * EARTH_RADIUS_M;
        assert!((d - half_circumference).abs() < 1.0);
    }

    #[test]
    fn test_one_degree_latitude() {
        // 1 degree of latitude is ~111.2 km everywhere
        let d = haversine_distance(10.0, -74.0, 11.0, -74.0);
        assert!((d - 111_195.0).abs() < 100.0);
    }

    #[test]
    fn test_track_distance_accumulates() {
        let track = vec![(0.0, 0.0), (0.0, 0.001), (0.0, 0.002)];
        let total = track_distance(&track);
        let direct = haversine_distance(0.0, 0.0, 0.0, 0.002);
        assert!((total - direct).abs() < 0.01);
    }

    #[test]
    fn test_track_distance_degenerate() {
        assert_eq!(track_distance(&[]), 0.0);
        assert_eq!(track_distance(&[(1.0, 1.0)]), 0.0);
    }
}
