//! # Tramification runs
//!
//! Evaluates (track, master route) pairs into speed samples and folds a
//! batch of outcomes into grouped statistics.
//!
//! Every pair is independent: a track that misses a control point, or
//! cannot be loaded at all, produces a failed outcome for that pair and the
//! batch carries on. Route definitions are read-only for the duration of a
//! batch.
//!
//! Samples with degenerate timing (missing timestamps, non-positive elapsed
//! time) are kept in the outcomes, flagged `low_confidence`, and left out of
//! the aggregate unless [`AnalysisConfig::include_low_confidence`] is set.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{aggregate_samples, AggregateReport};
use crate::gpx::parse_gpx;
use crate::period::{Period, PeriodConfig};
use crate::repository::{RouteRepository, TrackRecord, TrackRepository, DEFAULT_VEHICLE_TYPE};
use crate::segment::{extract_segment, ExtractionFailure, Segment};
use crate::speed::calculate_speed;
use crate::{MasterRoute, Result, Timestamp, Track};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a tramification run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Period windows and the meaning of "local" time
    pub period: PeriodConfig,
    /// Aggregate samples with degenerate timing as well.
    /// Default: false (they would contribute 0 km/h data points)
    pub include_low_confidence: bool,
}

impl AnalysisConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.period.validate()
    }
}

// ============================================================================
// Inputs and outputs
// ============================================================================

/// A parsed track with the metadata needed to label its samples.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInput {
    pub id: String,
    pub name: String,
    pub vehicle_type: String,
    pub track: Track,
}

impl TrackInput {
    pub fn new(id: impl Into<String>, track: Track) -> Self {
        Self {
            id: id.into(),
            name: track.name().to_string(),
            vehicle_type: DEFAULT_VEHICLE_TYPE.to_string(),
            track,
        }
    }

    pub fn with_vehicle_type(mut self, vehicle_type: impl Into<String>) -> Self {
        self.vehicle_type = vehicle_type.into();
        self
    }

    /// Parse a repository record. An unreadable payload gives an empty track.
    pub fn from_record(record: &TrackRecord) -> Self {
        let track = parse_gpx(&record.payload);
        if track.is_empty() {
            warn!("[Tramification] Track '{}' has no usable points", record.id);
        }
        let name = if record.name.is_empty() {
            track.name().to_string()
        } else {
            record.name.clone()
        };
        Self {
            id: record.id.clone(),
            name,
            vehicle_type: record.vehicle_type.clone(),
            track,
        }
    }
}

/// Speed over one leg between consecutive control points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegSpeed {
    pub from_control_point: String,
    pub to_control_point: String,
    /// Authoritative leg distance, when the route defines one
    pub distance_m: Option<f64>,
    pub elapsed_seconds: Option<f64>,
    /// Only present with both a leg distance and a positive elapsed time
    pub speed_kmh: Option<f64>,
}

/// One speed observation of a track over a master route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub route_id: String,
    pub track_id: String,
    pub track_name: String,
    pub vehicle_type: String,
    pub direction: String,
    pub entry_time: Option<Timestamp>,
    pub exit_time: Option<Timestamp>,
    pub elapsed_seconds: f64,
    /// Authoritative distance over elapsed time, in km/h
    pub speed_kmh: f64,
    pub period: Period,
    /// Timing is degenerate; the speed is not a real observation
    pub low_confidence: bool,
    pub legs: Vec<LegSpeed>,
}

/// Why a pair produced no sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum AnalysisFailure {
    #[error("{0}")]
    Extraction(ExtractionFailure),
    #[error("invalid route: {message}")]
    InvalidRoute { message: String },
    #[error("track not found")]
    TrackNotFound,
    #[error("track could not be loaded: {message}")]
    TrackUnavailable { message: String },
}

/// Result of evaluating one (track, route) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Matched {
        sample: SpeedSample,
        segment: Segment,
    },
    Failed {
        route_id: String,
        track_id: String,
        track_name: String,
        reason: AnalysisFailure,
    },
}

impl AnalysisOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, AnalysisOutcome::Matched { .. })
    }

    pub fn sample(&self) -> Option<&SpeedSample> {
        match self {
            AnalysisOutcome::Matched { sample, .. } => Some(sample),
            AnalysisOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&AnalysisFailure> {
        match self {
            AnalysisOutcome::Matched { .. } => None,
            AnalysisOutcome::Failed { reason, .. } => Some(reason),
        }
    }

    pub fn track_id(&self) -> &str {
        match self {
            AnalysisOutcome::Matched { sample, .. } => &sample.track_id,
            AnalysisOutcome::Failed { track_id, .. } => track_id,
        }
    }

    fn failed(route_id: &str, track_id: &str, track_name: &str, reason: AnalysisFailure) -> Self {
        AnalysisOutcome::Failed {
            route_id: route_id.to_string(),
            track_id: track_id.to_string(),
            track_name: track_name.to_string(),
            reason,
        }
    }
}

// ============================================================================
// Single pair
// ============================================================================

/// Evaluate one track against one master route.
pub fn analyze_pair(input: &TrackInput, route: &MasterRoute, config: &AnalysisConfig) -> AnalysisOutcome {
    if let Err(e) = route.validate() {
        return AnalysisOutcome::failed(
            &route.id,
            &input.id,
            &input.name,
            AnalysisFailure::InvalidRoute {
                message: e.to_string(),
            },
        );
    }

    let mut segment = extract_segment(&input.track, &route.control_points);
    if let Some(failure) = segment.failure.take() {
        debug!(
            "[Tramification] Track '{}' does not cross route '{}': {}",
            input.id, route.id, failure
        );
        return AnalysisOutcome::failed(
            &route.id,
            &input.id,
            &input.name,
            AnalysisFailure::Extraction(failure),
        );
    }

    let speed_kmh = calculate_speed(route.distance_m, segment.elapsed_seconds);
    let period = segment
        .entry_time
        .map(|t| config.period.classify(&t))
        .unwrap_or(Period::Unknown);

    let legs = segment
        .legs
        .iter()
        .zip(route.control_points.iter().skip(1))
        .map(|(leg, cp)| {
            let speed_kmh = match (cp.segment_distance_m, leg.elapsed_seconds) {
                (Some(d), Some(t)) if t > 0.0 => Some(calculate_speed(d, t)),
                _ => None,
            };
            LegSpeed {
                from_control_point: leg.from_control_point.clone(),
                to_control_point: leg.to_control_point.clone(),
                distance_m: cp.segment_distance_m,
                elapsed_seconds: leg.elapsed_seconds,
                speed_kmh,
            }
        })
        .collect();

    if segment.degenerate_timing {
        warn!(
            "[Tramification] Track '{}' on route '{}' has degenerate timing ({} s), marked low confidence",
            input.id, route.id, segment.elapsed_seconds
        );
    }

    let sample = SpeedSample {
        route_id: route.id.clone(),
        track_id: input.id.clone(),
        track_name: input.name.clone(),
        vehicle_type: input.vehicle_type.clone(),
        direction: route.direction.clone(),
        entry_time: segment.entry_time,
        exit_time: segment.exit_time,
        elapsed_seconds: segment.elapsed_seconds,
        speed_kmh,
        period,
        low_confidence: segment.degenerate_timing,
        legs,
    };

    AnalysisOutcome::Matched { sample, segment }
}

// ============================================================================
// Batches
// ============================================================================

/// Outcomes of a batch run and the statistics of its admitted samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// One outcome per evaluated pair, in input order
    pub outcomes: Vec<AnalysisOutcome>,
    /// Statistics over the samples admitted by the confidence policy
    pub aggregate: AggregateReport,
    pub matched: usize,
    pub failed: usize,
    /// Matched samples left out of the aggregate as low confidence
    pub excluded: usize,
    /// The stop flag was raised before every pair was evaluated
    pub stopped: bool,
}

impl BatchReport {
    pub fn from_outcomes(outcomes: Vec<AnalysisOutcome>, config: &AnalysisConfig, stopped: bool) -> Self {
        let samples: Vec<&SpeedSample> = outcomes.iter().filter_map(|o| o.sample()).collect();
        let matched = samples.len();
        let failed = outcomes.len() - matched;

        let admitted: Vec<&SpeedSample> = samples
            .into_iter()
            .filter(|s| config.include_low_confidence || !s.low_confidence)
            .collect();
        let excluded = matched - admitted.len();
        let aggregate = aggregate_samples(admitted);

        Self {
            outcomes,
            aggregate,
            matched,
            failed,
            excluded,
            stopped,
        }
    }

    /// Samples of all matched outcomes, including low-confidence ones.
    pub fn samples(&self) -> impl Iterator<Item = &SpeedSample> {
        self.outcomes.iter().filter_map(|o| o.sample())
    }
}

fn stop_requested(stop: Option<&AtomicBool>) -> bool {
    stop.map_or(false, |s| s.load(Ordering::Relaxed))
}

/// One slot per pair, in input order; `None` for pairs skipped after a stop.
fn evaluate_pairs(
    pairs: &[(&TrackInput, &MasterRoute)],
    config: &AnalysisConfig,
    stop: Option<&AtomicBool>,
) -> Vec<Option<AnalysisOutcome>> {
    let mut slots = Vec::with_capacity(pairs.len());
    for (input, route) in pairs {
        if stop_requested(stop) {
            info!(
                "[Tramification] Stop requested, {} of {} pairs left unevaluated",
                pairs.len() - slots.len(),
                pairs.len()
            );
            slots.resize(pairs.len(), None);
            break;
        }
        slots.push(Some(analyze_pair(input, route, config)));
    }
    slots
}

#[cfg(feature = "parallel")]
fn evaluate_pairs_parallel(
    pairs: &[(&TrackInput, &MasterRoute)],
    config: &AnalysisConfig,
    stop: Option<&AtomicBool>,
) -> Vec<Option<AnalysisOutcome>> {
    pairs
        .par_iter()
        .map(|(input, route)| {
            if stop_requested(stop) {
                None
            } else {
                Some(analyze_pair(input, route, config))
            }
        })
        .collect()
}

fn into_report(slots: Vec<Option<AnalysisOutcome>>, config: &AnalysisConfig) -> BatchReport {
    let stopped = slots.iter().any(Option::is_none);
    let outcomes = slots.into_iter().flatten().collect();
    let report = BatchReport::from_outcomes(outcomes, config, stopped);
    log_batch(&report);
    report
}

fn log_batch(report: &BatchReport) {
    info!(
        "[Tramification] Batch: {} matched, {} failed, {} excluded as low confidence, {} groups",
        report.matched,
        report.failed,
        report.excluded,
        report.aggregate.groups.len()
    );
}

/// Evaluate pairs one after another.
///
/// Fails only on an invalid `config`. Setting `stop` prevents pairs that
/// have not started yet from being evaluated; outcomes already produced
/// are kept in the report.
pub fn run_batch(
    pairs: &[(&TrackInput, &MasterRoute)],
    config: &AnalysisConfig,
    stop: Option<&AtomicBool>,
) -> Result<BatchReport> {
    config.validate()?;
    Ok(into_report(evaluate_pairs(pairs, config, stop), config))
}

/// Evaluate pairs in parallel with rayon.
///
/// Produces the same outcomes, in the same order, as [`run_batch`].
#[cfg(feature = "parallel")]
pub fn run_batch_parallel(
    pairs: &[(&TrackInput, &MasterRoute)],
    config: &AnalysisConfig,
    stop: Option<&AtomicBool>,
) -> Result<BatchReport> {
    config.validate()?;
    Ok(into_report(evaluate_pairs_parallel(pairs, config, stop), config))
}

/// Run one master route against a set of stored tracks.
///
/// A missing or invalid route fails the whole request. A track that is
/// missing or cannot be loaded yields a failed outcome for that track only.
pub fn run_tramification(
    routes: &dyn RouteRepository,
    tracks: &dyn TrackRepository,
    route_id: &str,
    track_ids: &[String],
    config: &AnalysisConfig,
    stop: Option<&AtomicBool>,
) -> Result<BatchReport> {
    config.validate()?;
    let route = routes.require_master_route(route_id)?;
    route.validate()?;

    info!(
        "[Tramification] Route '{}' against {} tracks",
        route.id,
        track_ids.len()
    );

    // Slot per requested track; load failures are final outcomes already
    let mut slots: Vec<Option<AnalysisOutcome>> = Vec::with_capacity(track_ids.len());
    let mut inputs: Vec<(usize, TrackInput)> = Vec::new();

    for (slot, track_id) in track_ids.iter().enumerate() {
        match tracks.track_record(track_id) {
            Ok(Some(record)) => {
                inputs.push((slot, TrackInput::from_record(&record)));
                slots.push(None);
            }
            Ok(None) => {
                slots.push(Some(AnalysisOutcome::failed(
                    &route.id,
                    track_id,
                    "",
                    AnalysisFailure::TrackNotFound,
                )));
            }
            Err(e) => {
                warn!("[Tramification] Could not load track '{}': {}", track_id, e);
                slots.push(Some(AnalysisOutcome::failed(
                    &route.id,
                    track_id,
                    "",
                    AnalysisFailure::TrackUnavailable {
                        message: e.to_string(),
                    },
                )));
            }
        }
    }

    let pairs: Vec<(&TrackInput, &MasterRoute)> =
        inputs.iter().map(|(_, input)| (input, &route)).collect();

    #[cfg(feature = "parallel")]
    let evaluated = evaluate_pairs_parallel(&pairs, config, stop);
    #[cfg(not(feature = "parallel"))]
    let evaluated = evaluate_pairs(&pairs, config, stop);

    for ((slot, _), outcome) in inputs.iter().zip(evaluated) {
        slots[*slot] = outcome;
    }

    let report = into_report(slots, config);
    Ok(report)
}
