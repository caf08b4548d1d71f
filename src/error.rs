//! Unified error handling for the tramification engine.
//!
//! Only problems that stop a whole request end up here: invalid route
//! definitions, missing routes, bad configuration, serialization and HTTP
//! failures. A track that does not cross a route is a normal negative
//! outcome and is reported through [`crate::segment::ExtractionFailure`].

use thiserror::Error;

/// Unified error type for tramification operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TramificationError {
    /// Master route violates a structural invariant
    #[error("Route '{route_id}' is invalid: {message}")]
    InvalidRoute { route_id: String, message: String },

    /// A control point violates a structural invariant
    #[error("Control point '{control_point_id}' is invalid: {message}")]
    InvalidControlPoint {
        control_point_id: String,
        message: String,
    },

    /// Requested route does not exist in the repository
    #[error("Route '{route_id}' not found")]
    RouteNotFound { route_id: String },

    /// Requested track does not exist in the repository
    #[error("Track '{track_id}' not found")]
    TrackNotFound { track_id: String },

    /// JSON (de)serialization error
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A repository backend could not serve the request
    #[error("Repository error: {message}")]
    Repository { message: String },

    /// HTTP error while fetching a payload
    #[error("HTTP error{}: {}", status_suffix(.status_code), .message)]
    Http {
        message: String,
        status_code: Option<u16>,
    },
}

impl From<serde_json::Error> for TramificationError {
    fn from(e: serde_json::Error) -> Self {
        TramificationError::Serialization {
            message: e.to_string(),
        }
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}

/// Result type alias for tramification operations.
pub type Result<T> = std::result::Result<T, TramificationError>;

/// Extension trait for converting repository lookups into errors.
pub trait OptionExt<T> {
    /// Convert Option to Result with a route-not-found error.
    fn ok_or_route_not_found(self, route_id: &str) -> Result<T>;

    /// Convert Option to Result with a track-not-found error.
    fn ok_or_track_not_found(self, track_id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_route_not_found(self, route_id: &str) -> Result<T> {
        self.ok_or_else(|| TramificationError::RouteNotFound {
            route_id: route_id.to_string(),
        })
    }

    fn ok_or_track_not_found(self, track_id: &str) -> Result<T> {
        self.ok_or_else(|| TramificationError::TrackNotFound {
            track_id: track_id.to_string(),
        })
    }
}
