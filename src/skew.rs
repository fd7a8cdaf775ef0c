//! Clock skew estimation between source and local timestamps.
//!
//! Skew is a monitoring signal only. Classification decides the log
//! level an update is reported at; no update is ever dropped for it.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{MonitorError, Result};

/// Thresholds for skew classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewThresholds {
    /// Magnitude at or above which skew is reported as a warning.
    pub warning: Duration,
    /// Magnitude at or above which skew is reported as an error.
    pub error: Duration,
}

impl Default for SkewThresholds {
    fn default() -> Self {
        Self {
            warning: Duration::from_secs(1),
            error: Duration::from_secs(5),
        }
    }
}

impl SkewThresholds {
    pub fn new(warning: Duration, error: Duration) -> Result<Self> {
        if warning > error {
            return Err(MonitorError::Configuration(format!(
                "skew warning threshold {warning:?} exceeds error threshold {error:?}"
            )));
        }
        Ok(Self { warning, error })
    }
}

/// Severity class of a skew measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkewLevel {
    Normal,
    Warning,
    Critical,
}

impl SkewLevel {
    pub fn symbol(&self) -> &'static str {
        match self {
            SkewLevel::Normal => "OK",
            SkewLevel::Warning => "WARN",
            SkewLevel::Critical => "CRIT",
        }
    }
}

/// A computed skew and its classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewReading {
    /// `local - (source + offset)` in seconds. Positive means the source
    /// timestamp lags local time.
    pub seconds: f64,
    pub level: SkewLevel,
}

/// Computes and classifies clock skew for each update.
#[derive(Debug, Clone, Copy)]
pub struct SkewEstimator {
    /// Seconds added to every source timestamp before comparison.
    offset: f64,
    thresholds: SkewThresholds,
}

impl SkewEstimator {
    pub fn new(offset: f64, thresholds: SkewThresholds) -> Self {
        Self { offset, thresholds }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn thresholds(&self) -> SkewThresholds {
        self.thresholds
    }

    /// Source timestamp with the configured offset applied.
    pub fn adjusted_source(&self, source_timestamp: f64) -> f64 {
        source_timestamp + self.offset
    }

    /// Compute skew for an update delivered at `local`.
    pub fn estimate(&self, source_timestamp: f64, local: DateTime<Utc>) -> SkewReading {
        let seconds = epoch_seconds(local) - self.adjusted_source(source_timestamp);
        SkewReading {
            seconds,
            level: self.classify(seconds),
        }
    }

    /// Classify a skew value by magnitude.
    pub fn classify(&self, seconds: f64) -> SkewLevel {
        let magnitude = seconds.abs();
        if magnitude >= self.thresholds.error.as_secs_f64() {
            SkewLevel::Critical
        } else if magnitude >= self.thresholds.warning.as_secs_f64() {
            SkewLevel::Warning
        } else {
            SkewLevel::Normal
        }
    }
}

impl Default for SkewEstimator {
    fn default() -> Self {
        Self::new(0.0, SkewThresholds::default())
    }
}

/// Seconds since the Unix epoch, with sub-second precision.
pub fn epoch_seconds(t: DateTime<Utc>) -> f64 {
    t.timestamp() as f64 + f64::from(t.timestamp_subsec_nanos()) / 1e9
}

/// Convert raw epoch seconds to a UTC instant. Out-of-range input maps to
/// the epoch itself.
pub fn from_epoch_seconds(seconds: f64) -> DateTime<Utc> {
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(whole as i64, nanos)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_at(seconds: f64) -> DateTime<Utc> {
        from_epoch_seconds(seconds)
    }

    #[test]
    fn classification_with_default_thresholds() {
        let estimator = SkewEstimator::default();
        assert_eq!(estimator.classify(0.3), SkewLevel::Normal);
        assert_eq!(estimator.classify(2.0), SkewLevel::Warning);
        assert_eq!(estimator.classify(6.0), SkewLevel::Critical);
        assert_eq!(estimator.classify(-2.0), SkewLevel::Warning);
        assert_eq!(estimator.classify(-6.0), SkewLevel::Critical);
    }

    #[test]
    fn boundaries_are_inclusive() {
        let estimator = SkewEstimator::default();
        assert_eq!(estimator.classify(1.0), SkewLevel::Warning);
        assert_eq!(estimator.classify(5.0), SkewLevel::Critical);
    }

    #[test]
    fn skew_is_local_minus_adjusted_source() {
        let estimator = SkewEstimator::new(0.0, SkewThresholds::default());
        let reading = estimator.estimate(1_000.0, local_at(1_002.0));
        assert!((reading.seconds - 2.0).abs() < 1e-6);
        assert_eq!(reading.level, SkewLevel::Warning);
    }

    #[test]
    fn offset_is_added_to_source() {
        let estimator = SkewEstimator::new(5.7, SkewThresholds::default());
        let reading = estimator.estimate(1_000.0, local_at(1_006.0));
        assert!((reading.seconds - 0.3).abs() < 1e-6);
        assert_eq!(reading.level, SkewLevel::Normal);

        let estimator = SkewEstimator::new(-3.0, SkewThresholds::default());
        let reading = estimator.estimate(1_000.0, local_at(1_000.0));
        assert!((reading.seconds - 3.0).abs() < 1e-6);
    }

    #[test]
    fn custom_thresholds() {
        let thresholds =
            SkewThresholds::new(Duration::from_millis(100), Duration::from_millis(500)).unwrap();
        let estimator = SkewEstimator::new(0.0, thresholds);
        assert_eq!(estimator.classify(0.3), SkewLevel::Warning);
        assert_eq!(estimator.classify(0.6), SkewLevel::Critical);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let result = SkewThresholds::new(Duration::from_secs(5), Duration::from_secs(1));
        assert!(matches!(result, Err(MonitorError::Configuration(_))));
    }

    #[test]
    fn epoch_conversion_keeps_subseconds() {
        let t = from_epoch_seconds(1_700_000_000.25);
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert!((epoch_seconds(t) - 1_700_000_000.25).abs() < 1e-6);
    }
}
