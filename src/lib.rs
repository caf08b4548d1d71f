//! # Tramify
//!
//! GPS track tramification: timing vehicles between surveyed control points.
//!
//! This library provides:
//! - GPX track parsing and writing
//! - Control-point matching by closest approach within a tolerance radius
//! - Segment extraction across an ordered chain of control points
//! - Speed from the route's authoritative distance (GPS is only the clock)
//! - AM/PM period classification and grouped speed statistics
//!
//! ## Features
//!
//! - **`parallel`** - Evaluate batches of tracks with rayon
//! - **`http`** - Fetch raw track payloads over HTTP
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use tramify::{ControlPoint, ControlRole, MasterRoute, extract_segment, calculate_speed};
//! use tramify::gpx::parse_gpx;
//!
//! let gpx = r#"<gpx><trk><trkseg>
//!   <trkpt lat="-33.4500" lon="-70.6600"><time>2024-03-04T08:00:00-03:00</time></trkpt>
//!   <trkpt lat="-33.4550" lon="-70.6600"><time>2024-03-04T08:01:00-03:00</time></trkpt>
//!   <trkpt lat="-33.4600" lon="-70.6600"><time>2024-03-04T08:02:00-03:00</time></trkpt>
//! </trkseg></trk></gpx>"#;
//! let track = parse_gpx(gpx);
//!
//! let route = MasterRoute::new(
//!     "alameda-ns",
//!     vec![
//!         ControlPoint::new("a", -33.4500, -70.6600, 50.0, ControlRole::Entry),
//!         ControlPoint::new("b", -33.4600, -70.6600, 50.0, ControlRole::Exit),
//!     ],
//!     1100.0,
//! );
//!
//! let segment = extract_segment(&track, &route.control_points);
//! assert!(segment.found);
//! let speed = calculate_speed(route.distance_m, segment.elapsed_seconds);
//! assert!((speed - 33.0).abs() < 1e-9);
//! ```

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TramificationError};

// Geographic utilities (haversine distance, polyline length)
pub mod geo_utils;

// GPX exchange format
pub mod gpx;
pub use gpx::{parse_gpx, write_gpx};

// Closest-approach control point matching
pub mod matcher;
pub use matcher::{find_closest_match, MatchResult};

// Segment extraction across control point chains
pub mod segment;
pub use segment::{extract_segment, ExtractionFailure, ExtractionState, LegTiming, Segment};

// Speed from authoritative distance
pub mod speed;
pub use speed::{calculate_speed, format_travel_time};

// Time-of-day period classification
pub mod period;
pub use period::{classify_period, LocalTimeBasis, Period, PeriodConfig};

// Grouped speed statistics
pub mod aggregate;
pub use aggregate::{aggregate_samples, AggregateGroup, AggregateReport, GroupKey, SpeedStats};

// Per-pair analysis and batch driver
pub mod analysis;
pub use analysis::{
    analyze_pair, run_batch, run_tramification, AnalysisConfig, AnalysisFailure, AnalysisOutcome,
    BatchReport, LegSpeed, SpeedSample, TrackInput,
};
#[cfg(feature = "parallel")]
pub use analysis::run_batch_parallel;

// Route and track repositories (external collaborators)
pub mod repository;
pub use repository::{
    format_track_name, InMemoryRouteRepository, InMemoryTrackRepository, RouteRepository,
    TrackRecord, TrackRepository,
};

// HTTP module for track payload fetching
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{fetch_payloads_blocking, FetchConfig, TrackFetchResult, TrackFetcher};

/// Absolute timestamp with the UTC offset it was recorded in.
pub type Timestamp = DateTime<FixedOffset>;

/// Tolerance radius applied when a route definition omits one.
pub const DEFAULT_TOLERANCE_M: f64 = 50.0;

// ============================================================================
// Core Types
// ============================================================================

/// A single position fix of a track.
///
/// # Example
/// ```
/// use tramify::GeoPoint;
/// let point = GeoPoint::new(-33.4489, -70.6693); // Santiago
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in meters
    pub elevation: Option<f64>,
    /// Absolute time of the fix
    pub time: Option<Timestamp>,
    /// Instantaneous speed reported by the capture device (km/h)
    pub speed: Option<f64>,
}

impl GeoPoint {
    /// Create a new point without elevation, time or speed.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation: None,
            time: None,
            speed: None,
        }
    }

    pub fn with_time(mut self, time: Timestamp) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Haversine distance in meters to a coordinate.
    pub fn distance_to(&self, latitude: f64, longitude: f64) -> f64 {
        geo_utils::haversine_distance(self.latitude, self.longitude, latitude, longitude)
    }
}

/// A completed capture session: an immutable, time-ordered list of fixes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    name: String,
    started_at: Option<Timestamp>,
    points: Vec<GeoPoint>,
}

impl Track {
    pub fn new(name: impl Into<String>, started_at: Option<Timestamp>, points: Vec<GeoPoint>) -> Self {
        Self {
            name: name.into(),
            started_at,
            points,
        }
    }

    /// A track with no points, the result of an unreadable payload.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Capture statistics as shown after a recording session.
    pub fn summary(&self) -> TrackSummary {
        TrackSummary::from_points(&self.points)
    }
}

/// Capture statistics of a track.
///
/// `distance_m` is GPS-integrated and only descriptive; speeds over a
/// master route always use the route's authoritative distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub point_count: usize,
    /// GPS-integrated length in meters
    pub distance_m: f64,
    /// Seconds between the first and last timestamped fix
    pub duration_seconds: Option<f64>,
    /// Mean of the recorded instantaneous speeds (km/h)
    pub avg_speed: Option<f64>,
    /// Max of the recorded instantaneous speeds (km/h)
    pub max_speed: Option<f64>,
}

impl TrackSummary {
    pub fn from_points(points: &[GeoPoint]) -> Self {
        let first_time = points.iter().find_map(|p| p.time);
        let last_time = points.iter().rev().find_map(|p| p.time);
        let duration_seconds = match (first_time, last_time) {
            (Some(first), Some(last)) => {
                Some((last - first).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };

        let speeds: Vec<f64> = points.iter().filter_map(|p| p.speed).collect();
        let (avg_speed, max_speed) = if speeds.is_empty() {
            (None, None)
        } else {
            let sum: f64 = speeds.iter().sum();
            let max = speeds.iter().copied().fold(f64::MIN, f64::max);
            (Some(sum / speeds.len() as f64), Some(max))
        };

        Self {
            point_count: points.len(),
            distance_m: geo_utils::polyline_length(points),
            duration_seconds,
            avg_speed,
            max_speed,
        }
    }
}

/// Role of a control point within a master route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlRole {
    Entry,
    Intermediate,
    Exit,
}

impl std::fmt::Display for ControlRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlRole::Entry => write!(f, "entry"),
            ControlRole::Intermediate => write!(f, "intermediate"),
            ControlRole::Exit => write!(f, "exit"),
        }
    }
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE_M
}

/// A fixed geographic reference (hito) with a tolerance radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPoint {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Tolerance radius in meters (> 0)
    #[serde(default = "default_tolerance")]
    pub tolerance_m: f64,
    pub role: ControlRole,
    /// Authoritative distance from the previous control point, in meters.
    /// Only meaningful for intermediate and exit points.
    #[serde(default)]
    pub segment_distance_m: Option<f64>,
}

impl ControlPoint {
    pub fn new(
        id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        tolerance_m: f64,
        role: ControlRole,
    ) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            latitude,
            longitude,
            tolerance_m,
            role,
            segment_distance_m: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_segment_distance(mut self, distance_m: f64) -> Self {
        self.segment_distance_m = Some(distance_m);
        self
    }

    /// Check coordinate range and tolerance.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| TramificationError::InvalidControlPoint {
            control_point_id: self.id.clone(),
            message: message.to_string(),
        };

        if !GeoPoint::new(self.latitude, self.longitude).is_valid() {
            return Err(invalid("coordinates out of range"));
        }
        if !(self.tolerance_m.is_finite() && self.tolerance_m > 0.0) {
            return Err(invalid("tolerance must be a positive number of meters"));
        }
        if let Some(d) = self.segment_distance_m {
            if !(d.is_finite() && d > 0.0) {
                return Err(invalid("segment distance must be positive"));
            }
        }
        Ok(())
    }
}

/// Authoritative definition of a monitored road segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRoute {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Entry, zero or more intermediates, exit
    pub control_points: Vec<ControlPoint>,
    /// Surveyed entry-to-exit distance in meters (> 0)
    pub distance_m: f64,
    /// Direction label, e.g. "Norte-Sur"
    #[serde(default)]
    pub direction: String,
    /// Road class label, e.g. "Principal"
    #[serde(default)]
    pub road_type: String,
}

impl MasterRoute {
    pub fn new(id: impl Into<String>, control_points: Vec<ControlPoint>, distance_m: f64) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            control_points,
            distance_m,
            direction: String::new(),
            road_type: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = direction.into();
        self
    }

    pub fn with_road_type(mut self, road_type: impl Into<String>) -> Self {
        self.road_type = road_type.into();
        self
    }

    pub fn entry(&self) -> Option<&ControlPoint> {
        self.control_points.first()
    }

    pub fn exit(&self) -> Option<&ControlPoint> {
        self.control_points.last()
    }

    pub fn intermediates(&self) -> &[ControlPoint] {
        match self.control_points.len() {
            0..=2 => &[],
            n => &self.control_points[1..n - 1],
        }
    }

    /// Check the structural invariants of the route.
    ///
    /// At least two control points, entry first, exit last, intermediates
    /// in between, every tolerance positive and a positive distance.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| TramificationError::InvalidRoute {
            route_id: self.id.clone(),
            message,
        };

        let n = self.control_points.len();
        if n < 2 {
            return Err(invalid(format!(
                "needs at least 2 control points, has {}",
                n
            )));
        }
        if !(self.distance_m.is_finite() && self.distance_m > 0.0) {
            return Err(invalid(format!(
                "authoritative distance must be positive, got {}",
                self.distance_m
            )));
        }

        for (i, cp) in self.control_points.iter().enumerate() {
            let expected = if i == 0 {
                ControlRole::Entry
            } else if i == n - 1 {
                ControlRole::Exit
            } else {
                ControlRole::Intermediate
            };
            if cp.role != expected {
                return Err(invalid(format!(
                    "control point '{}' at position {} has role {}, expected {}",
                    cp.id, i, cp.role, expected
                )));
            }
            cp.validate()?;
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_route() -> MasterRoute {
        MasterRoute::new(
            "route-1",
            vec![
                ControlPoint::new("a", -33.45, -70.66, 50.0, ControlRole::Entry),
                ControlPoint::new("m", -33.46, -70.66, 50.0, ControlRole::Intermediate),
                ControlPoint::new("b", -33.47, -70.66, 50.0, ControlRole::Exit),
            ],
            2200.0,
        )
        .with_direction("Norte-Sur")
    }

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(-33.45, -70.66).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_valid_route() {
        let route = sample_route();
        assert!(route.validate().is_ok());
        assert_eq!(route.entry().unwrap().id, "a");
        assert_eq!(route.exit().unwrap().id, "b");
        assert_eq!(route.intermediates().len(), 1);
    }

    #[test]
    fn test_route_needs_two_points() {
        let mut route = sample_route();
        route.control_points.truncate(1);
        assert!(matches!(
            route.validate(),
            Err(TramificationError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn test_route_rejects_non_positive_distance() {
        let mut route = sample_route();
        route.distance_m = 0.0;
        assert!(route.validate().is_err());
    }

    #[test]
    fn test_route_rejects_misplaced_roles() {
        let mut route = sample_route();
        route.control_points.swap(0, 2);
        assert!(route.validate().is_err());
    }

    #[test]
    fn test_route_rejects_zero_tolerance() {
        let mut route = sample_route();
        route.control_points[1].tolerance_m = 0.0;
        assert!(matches!(
            route.validate(),
            Err(TramificationError::InvalidControlPoint { .. })
        ));
    }

    #[test]
    fn test_control_point_default_tolerance() {
        let json = r#"{"id":"a","latitude":-33.45,"longitude":-70.66,"role":"entry"}"#;
        let cp: ControlPoint = serde_json::from_str(json).unwrap();
        assert_eq!(cp.tolerance_m, DEFAULT_TOLERANCE_M);
        assert_eq!(cp.segment_distance_m, None);
    }

    #[test]
    fn test_track_summary() {
        let t0 = DateTime::parse_from_rfc3339("2024-03-04T08:00:00-03:00").unwrap();
        let points = vec![
            GeoPoint::new(0.0, 0.0).with_time(t0).with_speed(20.0),
            GeoPoint::new(0.001, 0.0)
                .with_time(t0 + chrono::Duration::seconds(30))
                .with_speed(40.0),
        ];
        let track = Track::new("t", Some(t0), points);
        let summary = track.summary();

        assert_eq!(summary.point_count, 2);
        assert_eq!(summary.duration_seconds, Some(30.0));
        assert_eq!(summary.avg_speed, Some(30.0));
        assert_eq!(summary.max_speed, Some(40.0));
        assert!(summary.distance_m > 100.0 && summary.distance_m < 120.0);
    }

    #[test]
    fn test_empty_track_summary() {
        let summary = Track::empty().summary();
        assert_eq!(summary.point_count, 0);
        assert_eq!(summary.distance_m, 0.0);
        assert_eq!(summary.duration_seconds, None);
        assert_eq!(summary.avg_speed, None);
    }
}
