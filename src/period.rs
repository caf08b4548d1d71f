//! Time-of-day period classification.
//!
//! A sample is classified by the local hour of its entry timestamp:
//! AM for [6, 12), PM for [12, 20), anything else is out of window.
//!
//! "Local" is explicit configuration. [`LocalTimeBasis::Embedded`] reads the
//! wall clock in the UTC offset carried by the timestamp itself, which is
//! what the capture device recorded. [`LocalTimeBasis::Fixed`] converts every
//! timestamp to one project-wide offset first, which is the right choice when
//! devices write UTC (`Z`) times.
//!
//! ## Example
//! ```rust
//! use chrono::DateTime;
//! use tramify::period::{classify_period, LocalTimeBasis, Period, PeriodConfig};
//!
//! let ts = DateTime::parse_from_rfc3339("2024-03-04T11:30:00Z").unwrap();
//!
//! assert_eq!(classify_period(&ts, &PeriodConfig::default()), Period::Am);
//!
//! let santiago = PeriodConfig::with_basis(LocalTimeBasis::fixed_hours(-3));
//! assert_eq!(classify_period(&ts, &santiago), Period::Am); // 08:30 local
//! ```

use chrono::{FixedOffset, Timelike};
use serde::{Deserialize, Serialize};

use crate::{Result, Timestamp, TramificationError};

/// Categorical time window of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Period {
    Am,
    Pm,
    OutOfWindow,
    /// The observation has no timestamp to classify
    Unknown,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Am => "AM",
            Period::Pm => "PM",
            Period::OutOfWindow => "OUT_OF_WINDOW",
            Period::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which clock defines the local hour of a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum LocalTimeBasis {
    /// Wall clock in the offset embedded in the timestamp
    #[default]
    Embedded,
    /// Wall clock in a fixed project-wide offset (seconds east of UTC)
    Fixed { offset_seconds: i32 },
}

impl LocalTimeBasis {
    /// Saturates on overflow; the result then fails [`PeriodConfig::validate`].
    pub fn fixed_hours(hours: i32) -> Self {
        LocalTimeBasis::Fixed {
            offset_seconds: hours.saturating_mul(3600),
        }
    }
}

/// Configuration for period classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodConfig {
    pub basis: LocalTimeBasis,
    /// First hour of the AM window. Default: 6
    pub am_start_hour: u32,
    /// First hour of the PM window (end of AM). Default: 12
    pub pm_start_hour: u32,
    /// First hour after the PM window. Default: 20
    pub window_end_hour: u32,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            basis: LocalTimeBasis::Embedded,
            am_start_hour: 6,
            pm_start_hour: 12,
            window_end_hour: 20,
        }
    }
}

impl PeriodConfig {
    /// Default windows with a specific local time basis.
    pub fn with_basis(basis: LocalTimeBasis) -> Self {
        Self {
            basis,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.am_start_hour < self.pm_start_hour
            && self.pm_start_hour < self.window_end_hour
            && self.window_end_hour <= 24)
        {
            return Err(TramificationError::Config {
                message: format!(
                    "period hours must satisfy am_start < pm_start < window_end <= 24, got {} / {} / {}",
                    self.am_start_hour, self.pm_start_hour, self.window_end_hour
                ),
            });
        }
        if let LocalTimeBasis::Fixed { offset_seconds } = self.basis {
            if FixedOffset::east_opt(offset_seconds).is_none() {
                return Err(TramificationError::Config {
                    message: format!("invalid UTC offset of {} seconds", offset_seconds),
                });
            }
        }
        Ok(())
    }

    /// Local hour (0-23) of a timestamp under the configured basis.
    pub fn local_hour(&self, timestamp: &Timestamp) -> u32 {
        match self.basis {
            LocalTimeBasis::Embedded => timestamp.hour(),
            LocalTimeBasis::Fixed { offset_seconds } => match FixedOffset::east_opt(offset_seconds) {
                Some(offset) => timestamp.with_timezone(&offset).hour(),
                None => timestamp.hour(),
            },
        }
    }

    /// Classify a local hour (0-23).
    pub fn classify_hour(&self, hour: u32) -> Period {
        if hour >= self.am_start_hour && hour < self.pm_start_hour {
            Period::Am
        } else if hour >= self.pm_start_hour && hour < self.window_end_hour {
            Period::Pm
        } else {
            Period::OutOfWindow
        }
    }

    /// Classify a timestamp. Never returns [`Period::Unknown`].
    pub fn classify(&self, timestamp: &Timestamp) -> Period {
        self.classify_hour(self.local_hour(timestamp))
    }
}

/// Classify a timestamp into AM, PM or out of window.
pub fn classify_period(timestamp: &Timestamp, config: &PeriodConfig) -> Period {
    config.classify(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn at(local: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(&format!("2024-03-04T{}-03:00", local)).unwrap()
    }

    #[test]
    fn test_window_boundaries() {
        let config = PeriodConfig::default();
        assert_eq!(classify_period(&at("06:00:00"), &config), Period::Am);
        assert_eq!(classify_period(&at("11:59:59"), &config), Period::Am);
        assert_eq!(classify_period(&at("12:00:00"), &config), Period::Pm);
        assert_eq!(classify_period(&at("19:59:59"), &config), Period::Pm);
        assert_eq!(classify_period(&at("20:00:00"), &config), Period::OutOfWindow);
        assert_eq!(classify_period(&at("05:59:59"), &config), Period::OutOfWindow);
        assert_eq!(classify_period(&at("00:00:00"), &config), Period::OutOfWindow);
    }

    #[test]
    fn test_embedded_offset_is_wall_clock() {
        // 11:30 at -03:00 is 14:30 UTC
        let ts = at("11:30:00");
        assert_eq!(PeriodConfig::default().classify(&ts), Period::Am);

        let utc = PeriodConfig::with_basis(LocalTimeBasis::fixed_hours(0));
        assert_eq!(utc.classify(&ts), Period::Pm);
    }

    #[test]
    fn test_fixed_basis_converts_utc_times() {
        let ts = DateTime::parse_from_rfc3339("2024-03-04T22:30:00Z").unwrap();
        assert_eq!(PeriodConfig::default().classify(&ts), Period::OutOfWindow);

        let santiago = PeriodConfig::with_basis(LocalTimeBasis::fixed_hours(-3));
        assert_eq!(santiago.local_hour(&ts), 19);
        assert_eq!(santiago.classify(&ts), Period::Pm);
    }

    #[test]
    fn test_validate() {
        assert!(PeriodConfig::default().validate().is_ok());

        let inverted = PeriodConfig {
            pm_start_hour: 5,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let bad_offset = PeriodConfig::with_basis(LocalTimeBasis::Fixed {
            offset_seconds: 30 * 3600,
        });
        assert!(bad_offset.validate().is_err());
    }

    #[test]
    fn test_fixed_hours_saturates() {
        assert_eq!(
            LocalTimeBasis::fixed_hours(i32::MAX),
            LocalTimeBasis::Fixed {
                offset_seconds: i32::MAX
            }
        );
        assert!(PeriodConfig::with_basis(LocalTimeBasis::fixed_hours(i32::MIN))
            .validate()
            .is_err());
    }

    #[test]
    fn test_labels() {
        assert_eq!(Period::Am.to_string(), "AM");
        assert_eq!(Period::OutOfWindow.to_string(), "OUT_OF_WINDOW");
        assert_eq!(serde_json::to_string(&Period::Pm).unwrap(), "\"PM\"");
        let basis: LocalTimeBasis =
            serde_json::from_str(r#"{"basis":"fixed","offset_seconds":-10800}"#).unwrap();
        assert_eq!(basis, LocalTimeBasis::fixed_hours(-3));
    }
}
