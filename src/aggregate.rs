//! Grouped speed statistics.
//!
//! Samples are grouped by exact equality of (vehicle type, period,
//! direction). Labels are compared verbatim: "Norte-Sur" and "norte-sur" are
//! different groups.
//!
//! ## Example
//! ```rust
//! use tramify::aggregate::SpeedStats;
//!
//! let stats = SpeedStats::from_speeds(&[10.0, 20.0, 30.0]).unwrap();
//! assert_eq!(stats.mean, 20.0);
//! assert!((stats.std_dev - 8.165).abs() < 1e-3);
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::analysis::SpeedSample;
use crate::period::Period;

/// Composite grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub vehicle_type: String,
    pub period: Period,
    pub direction: String,
}

impl GroupKey {
    pub fn of(sample: &SpeedSample) -> Self {
        Self {
            vehicle_type: sample.vehicle_type.clone(),
            period: sample.period,
            direction: sample.direction.clone(),
        }
    }
}

/// Descriptive statistics of a set of speeds (km/h).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation (divides by n)
    pub std_dev: f64,
}

impl SpeedStats {
    /// Compute statistics, or `None` for an empty slice.
    pub fn from_speeds(speeds: &[f64]) -> Option<Self> {
        if speeds.is_empty() {
            return None;
        }

        let n = speeds.len() as f64;
        let mean = speeds.iter().sum::<f64>() / n;
        let min = speeds.iter().copied().fold(f64::INFINITY, f64::min);
        let max = speeds.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let variance = speeds.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            count: speeds.len(),
            mean,
            min,
            max,
            std_dev: variance.sqrt(),
        })
    }
}

/// Statistics of one group of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroup {
    pub key: GroupKey,
    pub stats: SpeedStats,
}

/// Grouped and overall statistics of an analysis run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Groups sorted by key
    pub groups: Vec<AggregateGroup>,
    /// Statistics over every input sample regardless of group
    pub overall: Option<SpeedStats>,
    pub total_samples: usize,
}

impl AggregateReport {
    pub fn group(&self, key: &GroupKey) -> Option<&AggregateGroup> {
        self.groups.iter().find(|g| &g.key == key)
    }
}

/// Group samples by (vehicle type, period, direction) and compute
/// statistics per group and overall.
///
/// Every sample given is aggregated; filtering low-confidence samples is
/// the caller's policy (see [`crate::analysis::BatchReport`]).
pub fn aggregate_samples<'a, I>(samples: I) -> AggregateReport
where
    I: IntoIterator<Item = &'a SpeedSample>,
{
    let mut by_key: HashMap<GroupKey, Vec<f64>> = HashMap::new();
    let mut all_speeds = Vec::new();

    for sample in samples {
        by_key
            .entry(GroupKey::of(sample))
            .or_default()
            .push(sample.speed_kmh);
        all_speeds.push(sample.speed_kmh);
    }

    let mut groups: Vec<AggregateGroup> = by_key
        .into_iter()
        .filter_map(|(key, speeds)| {
            SpeedStats::from_speeds(&speeds).map(|stats| AggregateGroup { key, stats })
        })
        .collect();
    groups.sort_by(|a, b| a.key.cmp(&b.key));

    AggregateReport {
        groups,
        overall: SpeedStats::from_speeds(&all_speeds),
        total_samples: all_speeds.len(),
    }
}
