//! Geographic utilities.
//!
//! Distances use the haversine formula on a spherical Earth of radius
//! 6,371,000 m. Control-point tolerances are expressed against this radius,
//! so it must not be swapped for an ellipsoidal model.

use crate::GeoPoint;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two coordinates given in degrees.
///
/// # Example
/// ```
/// use tramify::geo_utils::haversine_distance;
///
/// let d = haversine_distance(51.5074, -0.1278, 48.8566, 2.3522);
/// assert!((d - 343_500.0).abs() < 5_000.0);
/// ```
pub fn haversine_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lng2 - lng1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Haversine distance between two track points.
pub fn point_distance(p1: &GeoPoint, p2: &GeoPoint) -> f64 {
    haversine_distance(p1.latitude, p1.longitude, p2.latitude, p2.longitude)
}

/// Length of a polyline in meters (sum of consecutive haversine distances).
///
/// This is the GPS-integrated distance. It is reported for diagnostics only
/// and never used as the distance term of a speed.
pub fn polyline_length(points: &[GeoPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| point_distance(&w[0], &w[1]))
        .sum()
}
