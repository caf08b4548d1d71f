//! Route and track repositories.
//!
//! The engine never owns storage. Master routes and captured tracks are
//! served through these traits; the in-memory implementations back tests
//! and JSON-loaded datasets.

use std::collections::BTreeMap;
use std::sync::RwLock;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::OptionExt;
use crate::{MasterRoute, Result, Timestamp, TramificationError};

/// Vehicle-type label of a track that does not state one.
pub const DEFAULT_VEHICLE_TYPE: &str = "Público";

fn default_vehicle_type() -> String {
    DEFAULT_VEHICLE_TYPE.to_string()
}

/// Storage name of a captured track: `YYYYMMDDHHMMSS-name-vehicle`.
///
/// # Example
/// ```
/// use chrono::DateTime;
/// use tramify::repository::format_track_name;
///
/// let ts = DateTime::parse_from_rfc3339("2024-03-04T08:05:09-03:00").unwrap();
/// assert_eq!(format_track_name(&ts, "alameda", "Público"), "20240304080509-alameda-Público");
/// ```
pub fn format_track_name(captured_at: &Timestamp, name: &str, vehicle_type: &str) -> String {
    format!(
        "{}-{}-{}",
        captured_at.format("%Y%m%d%H%M%S"),
        name,
        vehicle_type
    )
}

/// A stored track: raw exchange-format payload plus capture metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub captured_at: Option<Timestamp>,
    #[serde(default = "default_vehicle_type")]
    pub vehicle_type: String,
    /// Raw GPX text
    pub payload: String,
}

impl TrackRecord {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            captured_at: None,
            vehicle_type: default_vehicle_type(),
            payload: payload.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_vehicle_type(mut self, vehicle_type: impl Into<String>) -> Self {
        self.vehicle_type = vehicle_type.into();
        self
    }

    pub fn with_captured_at(mut self, captured_at: Timestamp) -> Self {
        self.captured_at = Some(captured_at);
        self
    }

    /// Storage name, when the capture date is known.
    pub fn storage_name(&self) -> Option<String> {
        self.captured_at
            .map(|ts| format_track_name(&ts, &self.name, &self.vehicle_type))
    }
}

/// Source of master route definitions.
pub trait RouteRepository: Send + Sync {
    fn master_route(&self, route_id: &str) -> Result<Option<MasterRoute>>;

    fn master_routes(&self) -> Result<Vec<MasterRoute>>;

    /// Store a route, replacing any route with the same id.
    fn save_master_route(&self, route: MasterRoute) -> Result<()>;

    /// Remove a route. Returns whether it existed.
    fn delete_master_route(&self, route_id: &str) -> Result<bool>;

    /// Like [`RouteRepository::master_route`], failing when the route is missing.
    fn require_master_route(&self, route_id: &str) -> Result<MasterRoute> {
        self.master_route(route_id)?.ok_or_route_not_found(route_id)
    }
}

/// Source of captured tracks.
pub trait TrackRepository: Send + Sync {
    fn track_record(&self, track_id: &str) -> Result<Option<TrackRecord>>;

    fn track_records(&self) -> Result<Vec<TrackRecord>>;

    /// Like [`TrackRepository::track_record`], failing when the track is missing.
    fn require_track_record(&self, track_id: &str) -> Result<TrackRecord> {
        self.track_record(track_id)?.ok_or_track_not_found(track_id)
    }
}

fn poisoned() -> TramificationError {
    TramificationError::Repository {
        message: "store lock poisoned".to_string(),
    }
}

// ============================================================================
// In-memory routes
// ============================================================================

/// Route store held in memory, keyed and listed by route id.
#[derive(Debug, Default)]
pub struct InMemoryRouteRepository {
    routes: RwLock<BTreeMap<String, MasterRoute>>,
}

impl InMemoryRouteRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from routes, validating each one.
    pub fn from_routes(routes: Vec<MasterRoute>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for route in routes {
            route.validate()?;
            map.insert(route.id.clone(), route);
        }
        Ok(Self {
            routes: RwLock::new(map),
        })
    }

    /// Load routes from a JSON array of route definitions.
    pub fn from_json(json: &str) -> Result<Self> {
        let routes: Vec<MasterRoute> = serde_json::from_str(json)?;
        info!("[RouteRepository] Loaded {} master routes", routes.len());
        Self::from_routes(routes)
    }

    /// Serialize every route as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.master_routes()?)?)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.routes.read().map_err(|_| poisoned())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl RouteRepository for InMemoryRouteRepository {
    fn master_route(&self, route_id: &str) -> Result<Option<MasterRoute>> {
        let routes = self.routes.read().map_err(|_| poisoned())?;
        Ok(routes.get(route_id).cloned())
    }

    fn master_routes(&self) -> Result<Vec<MasterRoute>> {
        let routes = self.routes.read().map_err(|_| poisoned())?;
        Ok(routes.values().cloned().collect())
    }

    fn save_master_route(&self, route: MasterRoute) -> Result<()> {
        route.validate()?;
        let mut routes = self.routes.write().map_err(|_| poisoned())?;
        debug!("[RouteRepository] Saving route '{}'", route.id);
        routes.insert(route.id.clone(), route);
        Ok(())
    }

    fn delete_master_route(&self, route_id: &str) -> Result<bool> {
        let mut routes = self.routes.write().map_err(|_| poisoned())?;
        Ok(routes.remove(route_id).is_some())
    }
}

// ============================================================================
// In-memory tracks
// ============================================================================

/// Track store held in memory, keyed by track id.
#[derive(Debug, Default)]
pub struct InMemoryTrackRepository {
    tracks: RwLock<BTreeMap<String, TrackRecord>>,
}

impl InMemoryTrackRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<TrackRecord>) -> Self {
        let map = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            tracks: RwLock::new(map),
        }
    }

    /// Load records from a JSON array.
    pub fn from_json(json: &str) -> Result<Self> {
        let records: Vec<TrackRecord> = serde_json::from_str(json)?;
        info!("[TrackRepository] Loaded {} track records", records.len());
        Ok(Self::from_records(records))
    }

    /// Store a record, replacing any record with the same id.
    pub fn insert(&self, record: TrackRecord) -> Result<()> {
        let mut tracks = self.tracks.write().map_err(|_| poisoned())?;
        tracks.insert(record.id.clone(), record);
        Ok(())
    }
}

impl TrackRepository for InMemoryTrackRepository {
    fn track_record(&self, track_id: &str) -> Result<Option<TrackRecord>> {
        let tracks = self.tracks.read().map_err(|_| poisoned())?;
        Ok(tracks.get(track_id).cloned())
    }

    fn track_records(&self) -> Result<Vec<TrackRecord>> {
        let tracks = self.tracks.read().map_err(|_| poisoned())?;
        Ok(tracks.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlPoint, ControlRole};
    use chrono::DateTime;

    const ROUTES_JSON: &str = r#"[
        {
            "id": "alameda-ns",
            "name": "Alameda",
            "distance_m": 1000.0,
            "direction": "Norte-Sur",
            "road_type": "Principal",
            "control_points": [
                {"id": "a", "latitude": -33.45, "longitude": -70.66, "role": "entry"},
                {"id": "b", "latitude": -33.46, "longitude": -70.66, "tolerance_m": 30.0, "role": "exit"}
            ]
        }
    ]"#;

    fn route(id: &str) -> MasterRoute {
        MasterRoute::new(
            id,
            vec![
                ControlPoint::new("a", -33.45, -70.66, 50.0, ControlRole::Entry),
                ControlPoint::new("b", -33.46, -70.66, 50.0, ControlRole::Exit),
            ],
            1000.0,
        )
    }

    #[test]
    fn test_load_routes_from_json() {
        let repo = InMemoryRouteRepository::from_json(ROUTES_JSON).unwrap();
        assert_eq!(repo.len().unwrap(), 1);

        let route = repo.master_route("alameda-ns").unwrap().unwrap();
        assert_eq!(route.direction, "Norte-Sur");
        assert_eq!(route.control_points[0].tolerance_m, 50.0);
        assert_eq!(route.control_points[1].tolerance_m, 30.0);
    }

    #[test]
    fn test_json_rejects_invalid_route() {
        let json = r#"[{"id": "bad", "distance_m": 0.0, "control_points": []}]"#;
        assert!(matches!(
            InMemoryRouteRepository::from_json(json),
            Err(TramificationError::InvalidRoute { .. })
        ));
        assert!(matches!(
            InMemoryRouteRepository::from_json("{"),
            Err(TramificationError::Serialization { .. })
        ));
    }

    #[test]
    fn test_save_and_delete() {
        let repo = InMemoryRouteRepository::new();
        assert!(repo.is_empty().unwrap());

        repo.save_master_route(route("r1")).unwrap();
        repo.save_master_route(route("r2")).unwrap();
        let ids: Vec<String> = repo.master_routes().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r1", "r2"]);

        assert!(repo.delete_master_route("r1").unwrap());
        assert!(!repo.delete_master_route("r1").unwrap());
        assert!(matches!(
            repo.require_master_route("r1"),
            Err(TramificationError::RouteNotFound { .. })
        ));
    }

    #[test]
    fn test_save_rejects_invalid_route() {
        let repo = InMemoryRouteRepository::new();
        let mut bad = route("r1");
        bad.distance_m = -1.0;
        assert!(repo.save_master_route(bad).is_err());
        assert!(repo.is_empty().unwrap());
    }

    #[test]
    fn test_poisoned_store_reports_error() {
        let repo = std::sync::Arc::new(InMemoryRouteRepository::from_routes(vec![route("r1")]).unwrap());
        let writer = std::sync::Arc::clone(&repo);
        let panicked = std::thread::spawn(move || {
            let _guard = writer.routes.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(panicked.is_err());

        assert!(matches!(repo.len(), Err(TramificationError::Repository { .. })));
        assert!(repo.is_empty().is_err());
        assert!(repo.master_routes().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let repo = InMemoryRouteRepository::from_routes(vec![route("r1")]).unwrap();
        let json = repo.to_json().unwrap();
        let reloaded = InMemoryRouteRepository::from_json(&json).unwrap();
        assert_eq!(reloaded.master_route("r1").unwrap(), Some(route("r1")));
    }

    #[test]
    fn test_track_records() {
        let json = r#"[{"id": "t1", "payload": "<gpx/>"}]"#;
        let repo = InMemoryTrackRepository::from_json(json).unwrap();

        let record = repo.require_track_record("t1").unwrap();
        assert_eq!(record.vehicle_type, DEFAULT_VEHICLE_TYPE);
        assert_eq!(record.captured_at, None);

        repo.insert(TrackRecord::new("t2", "").with_vehicle_type("Privado"))
            .unwrap();
        assert_eq!(repo.track_records().unwrap().len(), 2);
        assert!(matches!(
            repo.require_track_record("missing"),
            Err(TramificationError::TrackNotFound { .. })
        ));
    }

    #[test]
    fn test_storage_name() {
        let ts = DateTime::parse_from_rfc3339("2024-11-30T17:45:00-03:00").unwrap();
        let record = TrackRecord::new("t1", "")
            .with_name("costanera")
            .with_vehicle_type("Privado")
            .with_captured_at(ts);
        assert_eq!(
            record.storage_name().as_deref(),
            Some("20241130174500-costanera-Privado")
        );
        assert_eq!(TrackRecord::new("t2", "").storage_name(), None);
    }
}
