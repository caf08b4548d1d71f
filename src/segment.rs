//! Segment extraction across an ordered chain of control points.
//!
//! The entry point is matched against the whole track. Every following
//! control point is matched against the suffix that begins at the previous
//! match (inclusive), so matched indices never move backwards. The first
//! failed match ends the chain; there is no backtracking and no partial
//! result.
//!
//! Search ranges are start offsets into the single track buffer, so a chain
//! of k control points costs O(k * n) distance evaluations and no copies.

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher::{closest_candidate, find_closest_match, MatchResult};
use crate::{ControlPoint, ControlRole, GeoPoint, Timestamp, Track};

/// Why a track could not be tramified over a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionFailure {
    /// The track has no usable points
    #[error("track has no points")]
    EmptyTrack,

    /// The control point list cannot form a chain
    #[error("route needs at least 2 control points, has {control_point_count}")]
    InvalidRoute { control_point_count: usize },

    /// No point of the searched range lies within tolerance
    #[error("no match for {role} control point '{control_point_id}' (position {position})")]
    NoMatch {
        control_point_id: String,
        role: ControlRole,
        /// Position of the control point in the route
        position: usize,
        /// Closest approach in the searched range, if the range was not empty
        nearest_distance_m: Option<f64>,
    },

    /// The best candidate would require travelling backwards along the track
    #[error(
        "{role} control point '{control_point_id}' (position {position}) matched at index {matched_index}, not after index {previous_index}"
    )]
    OutOfOrder {
        control_point_id: String,
        role: ControlRole,
        position: usize,
        matched_index: usize,
        previous_index: usize,
    },
}

/// Extraction progress.
///
/// `SearchingEntry → SearchingIntermediate(k) → SearchingExit → Done`.
/// `Done` is terminal; a failed match jumps straight to `Done { found: false }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionState {
    SearchingEntry,
    /// Looking for the k-th intermediate (0-based)
    SearchingIntermediate(usize),
    SearchingExit,
    Done { found: bool },
}

impl ExtractionState {
    /// State for the control point at `position` in a chain of `count`.
    fn for_position(position: usize, count: usize) -> Self {
        if position == 0 {
            ExtractionState::SearchingEntry
        } else if position + 1 == count {
            ExtractionState::SearchingExit
        } else {
            ExtractionState::SearchingIntermediate(position - 1)
        }
    }

    /// State after a successful match at `position`.
    fn advance(self, position: usize, count: usize) -> Self {
        match self {
            ExtractionState::SearchingExit => ExtractionState::Done { found: true },
            ExtractionState::Done { .. } => self,
            _ => Self::for_position(position + 1, count),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExtractionState::Done { .. })
    }
}

/// Timing of the stretch between two consecutive control points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegTiming {
    pub from_control_point: String,
    pub to_control_point: String,
    pub from_index: usize,
    pub to_index: usize,
    /// Seconds between the two matched fixes, when both carry a timestamp
    pub elapsed_seconds: Option<f64>,
}

/// Result of extracting a route segment from a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub found: bool,
    pub entry_time: Option<Timestamp>,
    pub exit_time: Option<Timestamp>,
    /// Exit minus entry time; 0 when either timestamp is missing
    pub elapsed_seconds: f64,
    /// Track points from entry to exit, both inclusive
    pub subtrack: Vec<GeoPoint>,
    pub entry_index: Option<usize>,
    pub exit_index: Option<usize>,
    /// One match per control point, in route order
    pub matches: Vec<MatchResult>,
    pub legs: Vec<LegTiming>,
    /// Matched endpoints lack timestamps or run backwards in time
    pub degenerate_timing: bool,
    pub failure: Option<ExtractionFailure>,
}

impl Segment {
    fn not_found(failure: ExtractionFailure) -> Self {
        Self {
            found: false,
            entry_time: None,
            exit_time: None,
            elapsed_seconds: 0.0,
            subtrack: Vec::new(),
            entry_index: None,
            exit_index: None,
            matches: Vec::new(),
            legs: Vec::new(),
            degenerate_timing: false,
            failure: Some(failure),
        }
    }
}

fn seconds_between(from: Option<Timestamp>, to: Option<Timestamp>) -> Option<f64> {
    match (from, to) {
        (Some(from), Some(to)) => Some((to - from).num_milliseconds() as f64 / 1000.0),
        _ => None,
    }
}

/// Classify a failed suffix search for the control point at `position`.
///
/// If the control point has a candidate within tolerance somewhere at or
/// before the previous match, the track did pass it, only in the wrong
/// order. Otherwise it never came close enough.
fn diagnose_miss(
    points: &[GeoPoint],
    control_point: &ControlPoint,
    position: usize,
    previous_index: usize,
) -> ExtractionFailure {
    let earlier = points
        .get(..=previous_index)
        .and_then(|head| find_closest_match(head, 0, control_point));

    if let Some(m) = earlier {
        return ExtractionFailure::OutOfOrder {
            control_point_id: control_point.id.clone(),
            role: control_point.role,
            position,
            matched_index: m.index,
            previous_index,
        };
    }

    ExtractionFailure::NoMatch {
        control_point_id: control_point.id.clone(),
        role: control_point.role,
        position,
        nearest_distance_m: closest_candidate(points, previous_index, control_point)
            .map(|m| m.distance_m),
    }
}

/// Extract the part of a track that runs through an ordered chain of
/// control points `[entry, intermediates.., exit]`.
///
/// On success the sub-track spans the entry match to the exit match
/// inclusive and the exit index is strictly greater than the entry index.
/// Elapsed time is only computed when both endpoints carry timestamps;
/// otherwise it is 0 and the segment is flagged `degenerate_timing`.
pub fn extract_segment(track: &Track, control_points: &[ControlPoint]) -> Segment {
    let points = track.points();
    let count = control_points.len();

    if count < 2 {
        return Segment::not_found(ExtractionFailure::InvalidRoute {
            control_point_count: count,
        });
    }
    if points.is_empty() {
        return Segment::not_found(ExtractionFailure::EmptyTrack);
    }

    let mut state = ExtractionState::SearchingEntry;
    let mut matches: Vec<MatchResult> = Vec::with_capacity(count);
    let mut search_start = 0usize;

    for (position, cp) in control_points.iter().enumerate() {
        trace!("[Tramification] {:?} for '{}' from index {}", state, cp.id, search_start);

        let matched = match find_closest_match(points, search_start, cp) {
            Some(m) => m,
            None => {
                let failure = if position == 0 {
                    ExtractionFailure::NoMatch {
                        control_point_id: cp.id.clone(),
                        role: cp.role,
                        position,
                        nearest_distance_m: closest_candidate(points, 0, cp).map(|m| m.distance_m),
                    }
                } else {
                    diagnose_miss(points, cp, position, search_start)
                };
                debug!("[Tramification] '{}': {}", track.name(), failure);
                return Segment::not_found(failure);
            }
        };

        if state == ExtractionState::SearchingExit {
            if let Some(entry) = matches.first() {
                if matched.index <= entry.index {
                    let failure = ExtractionFailure::OutOfOrder {
                        control_point_id: cp.id.clone(),
                        role: cp.role,
                        position,
                        matched_index: matched.index,
                        previous_index: entry.index,
                    };
                    debug!("[Tramification] '{}': {}", track.name(), failure);
                    return Segment::not_found(failure);
                }
            }
        }

        search_start = matched.index;
        matches.push(matched);
        state = state.advance(position, count);
    }

    debug_assert_eq!(state, ExtractionState::Done { found: true });

    let entry = matches[0];
    let exit = matches[count - 1];

    let legs: Vec<LegTiming> = matches
        .windows(2)
        .zip(control_points.windows(2))
        .map(|(m, cp)| LegTiming {
            from_control_point: cp[0].id.clone(),
            to_control_point: cp[1].id.clone(),
            from_index: m[0].index,
            to_index: m[1].index,
            elapsed_seconds: seconds_between(m[0].point.time, m[1].point.time),
        })
        .collect();

    let elapsed = seconds_between(entry.point.time, exit.point.time);
    let degenerate_timing = !matches!(elapsed, Some(s) if s > 0.0);

    debug!(
        "[Tramification] '{}': entry #{} ({:.1} m), exit #{} ({:.1} m), {:?} s",
        track.name(),
        entry.index,
        entry.distance_m,
        exit.index,
        exit.distance_m,
        elapsed
    );

    Segment {
        found: true,
        entry_time: entry.point.time,
        exit_time: exit.point.time,
        elapsed_seconds: elapsed.unwrap_or(0.0),
        subtrack: points[entry.index..=exit.index].to_vec(),
        entry_index: Some(entry.index),
        exit_index: Some(exit.index),
        matches,
        legs,
        degenerate_timing,
        failure: None,
    }
}
