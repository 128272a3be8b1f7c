use crate::features;
use crate::window::Stabilizer;
use log::trace;

/// Minimum number of filtered samples before an estimate is attempted.
pub const MIN_WINDOW: usize = 30;
/// Samples (about two beats at 30 Hz) used for the AC/DC ratio.
pub const ANALYSIS_SAMPLES: usize = 60;
pub const MIN_PERFUSION: f64 = 0.001;
pub const MOVING_AVERAGE_SIZE: usize = 10;
pub const MEDIAN_SIZE: usize = 5;

pub const SPO2_MIN: f64 = 70.0;
pub const SPO2_MAX: f64 = 100.0;

/// Empirical calibration curve `110 - 25R`, rounded and clamped.
pub fn ratio_to_spo2(ratio: f64) -> f64 {
    (110.0 - 25.0 * ratio).round().clamp(SPO2_MIN, SPO2_MAX)
}

/// SpO2 from the AC/DC ratio, smoothed by a median over a moving average.
#[derive(Debug, Clone)]
pub struct Spo2Estimator {
    averages: Stabilizer,
    medians: Stabilizer,
    last_valid: Option<f64>,
}

impl Spo2Estimator {
    pub fn new() -> Self {
        Self {
            averages: Stabilizer::new(MOVING_AVERAGE_SIZE),
            medians: Stabilizer::new(MEDIAN_SIZE),
            last_valid: None,
        }
    }

    /// Too short a window yields `None`; a weak signal repeats the last
    /// accepted value.
    pub fn estimate(&mut self, window: &[f64]) -> Option<f64> {
        if window.len() < MIN_WINDOW {
            return None;
        }
        let recent = &window[window.len().saturating_sub(ANALYSIS_SAMPLES)..];

        let dc = features::dc_component(recent);
        if dc <= 0.0 {
            return self.last_valid;
        }
        let ratio = features::ac_component(recent) / dc;
        if ratio < MIN_PERFUSION {
            trace!("SpO2 skipped: perfusion {:.5} below {}", ratio, MIN_PERFUSION);
            return self.last_valid;
        }

        self.averages.push(ratio_to_spo2(ratio));
        let averaged = self.averages.mean()?;
        self.medians.push(averaged);
        let value = self.medians.median()?.round().clamp(SPO2_MIN, SPO2_MAX);
        self.last_valid = Some(value);
        Some(value)
    }

    pub fn last_valid(&self) -> Option<f64> {
        self.last_valid
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Spo2Estimator {
    fn default() -> Self {
        Self::new()
    }
}
