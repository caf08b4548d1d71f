//! Control-point matching by closest approach.
//!
//! A raw track usually dips in and out of a control point's tolerance disc
//! several times. The crossing is the point of closest approach over the
//! searched range, not the first fix that happens to fall inside the disc.

use serde::{Deserialize, Serialize};

use crate::{ControlPoint, GeoPoint};

/// The track point selected for a control point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Matched track point
    pub point: GeoPoint,
    /// Distance from the control point in meters
    pub distance_m: f64,
    /// Index of the point in the full track
    pub index: usize,
}

/// Closest candidate to a control point, ignoring tolerance.
///
/// Searches `points[start..]` and returns the absolute index of the global
/// minimum. Exact ties resolve to the lowest index. Returns `None` if the
/// range is empty.
pub fn closest_candidate(
    points: &[GeoPoint],
    start: usize,
    control_point: &ControlPoint,
) -> Option<MatchResult> {
    let candidates = points.get(start..)?;

    let mut best: Option<MatchResult> = None;
    for (offset, point) in candidates.iter().enumerate() {
        let distance_m = point.distance_to(control_point.latitude, control_point.longitude);
        // NaN never compares less, so corrupt fixes are never selected
        let closer = match &best {
            Some(b) => distance_m < b.distance_m,
            None => !distance_m.is_nan(),
        };
        if closer {
            best = Some(MatchResult {
                point: *point,
                distance_m,
                index: start + offset,
            });
        }
    }

    best
}

/// Find the track point matching a control point.
///
/// Selects the closest point in `points[start..]` and accepts it only if it
/// lies within the control point's tolerance radius. The closest point is
/// never traded for a farther one that happens to be inside tolerance.
///
/// # Example
/// ```
/// use tramify::{ControlPoint, ControlRole, GeoPoint, find_closest_match};
///
/// let track = vec![
///     GeoPoint::new(-33.4500, -70.6600),
///     GeoPoint::new(-33.4503, -70.6600),
///     GeoPoint::new(-33.4510, -70.6600),
/// ];
/// let hito = ControlPoint::new("a", -33.4503, -70.6600, 50.0, ControlRole::Entry);
///
/// let m = find_closest_match(&track, 0, &hito).unwrap();
/// assert_eq!(m.index, 1);
/// assert_eq!(m.distance_m, 0.0);
/// ```
pub fn find_closest_match(
    points: &[GeoPoint],
    start: usize,
    control_point: &ControlPoint,
) -> Option<MatchResult> {
    closest_candidate(points, start, control_point)
        .filter(|m| m.distance_m <= control_point.tolerance_m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlRole;

    /// Points spaced ~11.1 m apart heading south along a meridian.
    fn meridian_track(n: usize) -> Vec<GeoPoint> {
        (0..n)
            .map(|i| GeoPoint::new(-33.45 - i as f64 * 0.0001, -70.66))
            .collect()
    }

    fn hito(lat: f64, lng: f64, tolerance: f64) -> ControlPoint {
        ControlPoint::new("h", lat, lng, tolerance, ControlRole::Entry)
    }

    #[test]
    fn test_exact_coincidence_wins() {
        let track = meridian_track(10);
        let target = track[4];
        let cp = hito(target.latitude, target.longitude, 100.0);

        let m = find_closest_match(&track, 0, &cp).unwrap();
        assert_eq!(m.index, 4);
        assert_eq!(m.distance_m, 0.0);
    }

    #[test]
    fn test_global_minimum_not_first_inside_tolerance() {
        let track = meridian_track(10);
        // Indices 2..=6 are all within 50 m of index 4
        let cp = hito(track[4].latitude, track[4].longitude, 50.0);

        let m = find_closest_match(&track, 0, &cp).unwrap();
        assert_eq!(m.index, 4);
    }

    #[test]
    fn test_nearest_outside_tolerance_is_no_match() {
        let track = meridian_track(10);
        // 0.01 deg east is ~930 m away from every point
        let cp = hito(track[4].latitude, -70.65, 50.0);

        assert!(closest_candidate(&track, 0, &cp).is_some());
        assert!(find_closest_match(&track, 0, &cp).is_none());
    }

    #[test]
    fn test_ties_resolve_to_lowest_index() {
        let p = GeoPoint::new(-33.45, -70.66);
        let track = vec![GeoPoint::new(-33.40, -70.66), p, p, p];
        let cp = hito(p.latitude, p.longitude, 10.0);

        assert_eq!(find_closest_match(&track, 0, &cp).unwrap().index, 1);
        assert_eq!(find_closest_match(&track, 2, &cp).unwrap().index, 2);
    }

    #[test]
    fn test_start_offset_returns_absolute_index() {
        let track = meridian_track(10);
        // Closest approach overall is index 1, but the search starts at 5 (~44 m away)
        let cp = hito(track[1].latitude, track[1].longitude, 50.0);
        assert_eq!(find_closest_match(&track, 5, &cp).unwrap().index, 5);

        let tight = hito(track[1].latitude, track[1].longitude, 30.0);
        assert!(find_closest_match(&track, 5, &tight).is_none());
    }

    #[test]
    fn test_empty_range() {
        let track = meridian_track(3);
        let cp = hito(-33.45, -70.66, 50.0);
        assert!(find_closest_match(&[], 0, &cp).is_none());
        assert!(find_closest_match(&track, 3, &cp).is_none());
        assert!(find_closest_match(&track, 7, &cp).is_none());
    }
}
