//! Cuffless blood-pressure estimation from PPG morphology.
//!
//! Six waveform features each contribute a bounded term to a 120/80
//! baseline. A single reference reading turns into a fixed offset, and a
//! delayed-finalization mode averages the live estimates of the last part of
//! a session into one time-weighted value.

use crate::error::{EngineError, Result};
use crate::features;
use crate::window::{SlidingWindow, Stabilizer};
use log::{debug, trace};
use std::fmt;

pub const MIN_WINDOW: usize = 90;
pub const SYSTOLIC_RANGE: (f64, f64) = (90.0, 180.0);
pub const DIASTOLIC_RANGE: (f64, f64) = (60.0, 110.0);
pub const PULSE_PRESSURE_RANGE: (f64, f64) = (25.0, 75.0);
pub const STABILIZER_SIZE: usize = 5;
pub const DEFAULT_COMPLETION_DELAY_MS: u64 = 3000;
const FINAL_BUFFER_SIZE: usize = 300;

const BASE_SYSTOLIC: f64 = 120.0;
const BASE_DIASTOLIC: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloodPressure {
    pub systolic: f64,
    pub diastolic: f64,
}

impl BloodPressure {
    pub fn pulse_pressure(&self) -> f64 {
        self.systolic - self.diastolic
    }
}

impl fmt::Display for BloodPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}/{:.0}", self.systolic.round(), self.diastolic.round())
    }
}

/// Clamps a candidate into the physiological ranges while keeping the
/// pulse pressure inside its bounds. Candidates that are non-finite or
/// already inverted (diastolic at or above systolic) are rejected.
pub fn constrain(systolic: f64, diastolic: f64) -> Option<BloodPressure> {
    if !systolic.is_finite() || !diastolic.is_finite() || diastolic >= systolic {
        return None;
    }
    let systolic = systolic.clamp(SYSTOLIC_RANGE.0, SYSTOLIC_RANGE.1);
    let low = DIASTOLIC_RANGE.0.max(systolic - PULSE_PRESSURE_RANGE.1);
    let high = DIASTOLIC_RANGE.1.min(systolic - PULSE_PRESSURE_RANGE.0);
    let diastolic = diastolic.clamp(low, high);
    Some(BloodPressure {
        systolic,
        diastolic,
    })
}

/// Morphology features of one analysis window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformFeatures {
    pub pulse_transit_ms: f64,
    /// Peak-to-valley amplitude relative to the DC level.
    pub relative_amplitude: f64,
    pub heart_rate: f64,
    pub peak_valley_ratio: f64,
    /// Fraction of the cycle spent above half amplitude.
    pub width_ratio: f64,
    /// Notch height above the valley, relative to the amplitude.
    pub notch_ratio: Option<f64>,
}

impl WaveformFeatures {
    pub fn extract(window: &[f64], sample_rate: f64, heart_rate: Option<f64>) -> Option<Self> {
        if window.len() < MIN_WINDOW {
            return None;
        }
        let peaks = features::find_peaks(window, features::MIN_EVENT_DISTANCE, features::PEAK_THRESHOLD_FRACTION);
        let valleys = features::find_valleys(window, features::MIN_EVENT_DISTANCE, features::PEAK_THRESHOLD_FRACTION);
        if peaks.len() < 2 || valleys.is_empty() {
            return None;
        }

        let dc = features::dc_component(window);
        let peak_mean = features::mean(&peaks.iter().map(|&i| window[i]).collect::<Vec<_>>());
        let valley_mean = features::mean(&valleys.iter().map(|&i| window[i]).collect::<Vec<_>>());
        let amplitude = peak_mean - valley_mean;
        if dc <= 0.0 || amplitude <= 0.0 || valley_mean.abs() < f64::EPSILON {
            return None;
        }

        let pulse_transit_ms = features::pulse_transit_time(&peaks, sample_rate);
        if pulse_transit_ms <= 0.0 {
            return None;
        }
        let cycle_samples = pulse_transit_ms * sample_rate / 1000.0;

        let half_level = valley_mean + amplitude / 2.0;
        let widths: Vec<f64> = peaks
            .iter()
            .map(|&p| {
                let left = window[..=p].iter().rev().take_while(|&&v| v >= half_level).count();
                let right = window[p + 1..].iter().take_while(|&&v| v >= half_level).count();
                (left + right) as f64 / cycle_samples
            })
            .collect();

        let notch_span = (cycle_samples * 0.6).round() as usize;
        let notches: Vec<f64> = peaks
            .iter()
            .filter_map(|&p| features::dicrotic_notch(window, p, notch_span))
            .map(|n| (window[n] - valley_mean) / amplitude)
            .collect();

        Some(Self {
            pulse_transit_ms,
            relative_amplitude: amplitude / dc,
            heart_rate: heart_rate
                .filter(|hr| *hr > 0.0)
                .unwrap_or(60_000.0 / pulse_transit_ms),
            peak_valley_ratio: peak_mean / valley_mean,
            width_ratio: features::mean(&widths),
            notch_ratio: if notches.is_empty() {
                None
            } else {
                Some(features::mean(&notches))
            },
        })
    }

    /// Uncalibrated regression: bounded additive terms around 120/80.
    pub fn regress(&self) -> (f64, f64) {
        let mut systolic = BASE_SYSTOLIC;
        let mut diastolic = BASE_DIASTOLIC;

        let ptt = 800.0 - self.pulse_transit_ms;
        systolic += (ptt * 0.04).clamp(-12.0, 12.0);
        diastolic += (ptt * 0.025).clamp(-8.0, 8.0);

        let amplitude = self.relative_amplitude - 0.02;
        systolic += (amplitude * 200.0).clamp(-8.0, 8.0);
        diastolic += (amplitude * 100.0).clamp(-4.0, 4.0);

        let hr = self.heart_rate - 70.0;
        systolic += (hr * 0.3).clamp(-10.0, 10.0);
        diastolic += (hr * 0.2).clamp(-7.0, 7.0);

        let ratio = self.peak_valley_ratio - 1.0;
        systolic += (ratio * 50.0).clamp(-5.0, 5.0);
        diastolic += (ratio * 25.0).clamp(-3.0, 3.0);

        let width = 0.35 - self.width_ratio;
        systolic += (width * 30.0).clamp(-6.0, 6.0);
        diastolic += (width * 20.0).clamp(-4.0, 4.0);

        if let Some(notch) = self.notch_ratio {
            systolic += ((0.3 - notch) * 10.0).clamp(-3.0, 3.0);
            diastolic += ((notch - 0.3) * 20.0).clamp(-5.0, 5.0);
        }

        (systolic, diastolic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalibrationOffset {
    pub systolic: f64,
    pub diastolic: f64,
}

pub struct BloodPressureEstimator {
    sample_rate: f64,
    systolic: Stabilizer,
    diastolic: Stabilizer,
    offset: Option<CalibrationOffset>,
    last_valid: Option<BloodPressure>,
    completion_delay_ms: u64,
    finalizing_since: Option<u64>,
    final_buffer: SlidingWindow<(u64, BloodPressure)>,
    finalized: Option<BloodPressure>,
}

impl BloodPressureEstimator {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            systolic: Stabilizer::new(STABILIZER_SIZE),
            diastolic: Stabilizer::new(STABILIZER_SIZE),
            offset: None,
            last_valid: None,
            completion_delay_ms: DEFAULT_COMPLETION_DELAY_MS,
            finalizing_since: None,
            final_buffer: SlidingWindow::new(FINAL_BUFFER_SIZE),
            finalized: None,
        }
    }

    pub fn with_completion_delay(mut self, delay_ms: u64) -> Self {
        self.completion_delay_ms = delay_ms;
        self
    }

    /// Raw regression output for a window, before offset and clamping.
    pub fn uncalibrated(&self, window: &[f64], heart_rate: Option<f64>) -> Option<(f64, f64)> {
        WaveformFeatures::extract(window, self.sample_rate, heart_rate).map(|f| f.regress())
    }

    pub fn estimate(&mut self, window: &[f64], heart_rate: Option<f64>, timestamp_ms: u64) -> Option<BloodPressure> {
        if window.len() < MIN_WINDOW {
            return None;
        }
        let Some((raw_sys, raw_dia)) = self.uncalibrated(window, heart_rate) else {
            return self.last_valid;
        };
        let offset = self.offset.unwrap_or_default();
        let Some(candidate) = constrain(raw_sys + offset.systolic, raw_dia + offset.diastolic) else {
            trace!("Discarding inconsistent blood pressure candidate {:.1}/{:.1}", raw_sys, raw_dia);
            return self.last_valid;
        };

        self.systolic.push(candidate.systolic);
        self.diastolic.push(candidate.diastolic);
        let smoothed = match (self.systolic.median(), self.diastolic.median()) {
            (Some(sys), Some(dia)) => constrain(sys, dia),
            _ => None,
        };
        if let Some(bp) = smoothed {
            self.last_valid = Some(bp);
            if self.finalizing_since.is_some() && self.finalized.is_none() {
                self.final_buffer.push((timestamp_ms, bp));
            }
        }
        self.last_valid
    }

    /// Learns the offset between a reference reading and the uncalibrated
    /// estimate of `window`. Repeating the call replaces the offset.
    pub fn calibrate(
        &mut self,
        reference_systolic: f64,
        reference_diastolic: f64,
        window: &[f64],
        heart_rate: Option<f64>,
    ) -> Result<CalibrationOffset> {
        if !(reference_systolic.is_finite() && reference_diastolic.is_finite())
            || reference_diastolic <= 0.0
            || reference_diastolic >= reference_systolic
        {
            return Err(EngineError::InvalidReference {
                metric: "blood pressure",
                reason: format!(
                    "{}/{} is not a valid systolic/diastolic pair",
                    reference_systolic, reference_diastolic
                ),
            });
        }
        if window.len() < MIN_WINDOW {
            return Err(EngineError::CalibrationDataInsufficient {
                metric: "blood pressure",
                required: MIN_WINDOW,
                provided: window.len(),
            });
        }
        let (raw_sys, raw_dia) = self.uncalibrated(window, heart_rate).ok_or_else(|| EngineError::InvalidReference {
            metric: "blood pressure",
            reason: "reference window contains no usable pulse waveform".into(),
        })?;

        let offset = CalibrationOffset {
            systolic: reference_systolic - raw_sys,
            diastolic: reference_diastolic - raw_dia,
        };
        debug!(
            "Blood pressure calibrated: raw {:.1}/{:.1}, offset {:+.1}/{:+.1}",
            raw_sys, raw_dia, offset.systolic, offset.diastolic
        );
        self.offset = Some(offset);
        self.systolic.clear();
        self.diastolic.clear();
        Ok(offset)
    }

    pub fn offset(&self) -> Option<CalibrationOffset> {
        self.offset
    }

    /// Starts buffering live estimates for the session's final value.
    pub fn begin_finalization(&mut self, timestamp_ms: u64) {
        debug!("Blood pressure finalization started at {} ms", timestamp_ms);
        self.finalizing_since = Some(timestamp_ms);
        self.final_buffer.clear();
        self.finalized = None;
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing_since.is_some() && self.finalized.is_none()
    }

    /// Once the completion delay has elapsed, collapses the buffered
    /// estimates into one time-weighted average (recent samples weigh up to
    /// twice as much as the oldest).
    pub fn final_value(&mut self, timestamp_ms: u64) -> Option<BloodPressure> {
        if self.finalized.is_some() {
            return self.finalized;
        }
        let since = self.finalizing_since?;
        if timestamp_ms.saturating_sub(since) < self.completion_delay_ms || self.final_buffer.is_empty() {
            return None;
        }

        let buffered = self.final_buffer.as_slice();
        let systolic: Vec<(u64, f64)> = buffered.iter().map(|(t, bp)| (*t, bp.systolic)).collect();
        let diastolic: Vec<(u64, f64)> = buffered.iter().map(|(t, bp)| (*t, bp.diastolic)).collect();
        self.finalized = match (
            features::time_weighted_average(&systolic),
            features::time_weighted_average(&diastolic),
        ) {
            (Some(sys), Some(dia)) => constrain(sys, dia),
            _ => None,
        };
        debug!(
            "Final blood pressure from {} estimates: {:?}",
            self.final_buffer.len(),
            self.finalized
        );
        self.finalized
    }

    pub fn last_valid(&self) -> Option<BloodPressure> {
        self.last_valid
    }

    /// Clears live buffers; the calibration offset survives.
    pub fn clear_buffers(&mut self) {
        self.systolic.clear();
        self.diastolic.clear();
        self.last_valid = None;
        self.finalizing_since = None;
        self.final_buffer.clear();
        self.finalized = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn ppg_window(len: usize, bpm: f64) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let phase = 2.0 * PI * bpm / 60.0 * i as f64 / 30.0;
                100.0 + 2.0 * phase.sin() + 0.4 * (2.0 * phase).sin()
            })
            .collect()
    }

    #[test]
    fn constrain_enforces_every_bound() {
        for sys in (0..=30).map(|i| 40.0 + i as f64 * 10.0) {
            for dia in (0..=30).map(|i| 20.0 + i as f64 * 8.0) {
                if let Some(bp) = constrain(sys, dia) {
                    assert!(bp.systolic >= 90.0 && bp.systolic <= 180.0);
                    assert!(bp.diastolic >= 60.0 && bp.diastolic <= 110.0);
                    assert!(bp.diastolic < bp.systolic);
                    let pp = bp.pulse_pressure();
                    assert!((25.0..=75.0).contains(&pp), "pp {pp} for {sys}/{dia}");
                }
            }
        }
        assert_eq!(constrain(80.0, 90.0), None);
        assert_eq!(constrain(f64::NAN, 80.0), None);
    }

    #[test]
    fn estimates_from_pulsatile_window() {
        let mut estimator = BloodPressureEstimator::new(30.0);
        let bp = estimator.estimate(&ppg_window(300, 75.0), Some(75.0), 0).unwrap();
        assert!(bp.systolic > bp.diastolic);
        assert_eq!(estimator.estimate(&ppg_window(60, 75.0), Some(75.0), 33), None);
        assert_eq!(estimator.estimate(&[100.0; 300], None, 66), Some(bp));
    }

    #[test]
    fn reference_offset_is_applied_once() {
        let window = ppg_window(300, 75.0);
        let mut estimator = BloodPressureEstimator::new(30.0);
        let (raw_sys, raw_dia) = estimator.uncalibrated(&window, Some(75.0)).unwrap();
        let reference = (raw_sys.round() + 10.0, raw_dia.round() + 5.0);

        estimator.calibrate(reference.0, reference.1, &window, Some(75.0)).unwrap();
        estimator.calibrate(reference.0, reference.1, &window, Some(75.0)).unwrap();
        for t in 0..5 {
            let bp = estimator.estimate(&window, Some(75.0), t * 33).unwrap();
            assert_eq!(bp.systolic.round(), reference.0);
            assert_eq!(bp.diastolic.round(), reference.1);
        }
    }

    #[test]
    fn calibration_rejects_short_or_invalid_input() {
        let mut estimator = BloodPressureEstimator::new(30.0);
        assert!(matches!(
            estimator.calibrate(130.0, 85.0, &ppg_window(20, 75.0), None),
            Err(EngineError::CalibrationDataInsufficient { required: MIN_WINDOW, provided: 20, .. })
        ));
        assert!(matches!(
            estimator.calibrate(80.0, 85.0, &ppg_window(300, 75.0), None),
            Err(EngineError::InvalidReference { .. })
        ));
        assert!(matches!(
            estimator.calibrate(130.0, 85.0, &[100.0; 300], None),
            Err(EngineError::InvalidReference { .. })
        ));
        assert_eq!(estimator.offset(), None);
    }

    #[test]
    fn finalization_weights_recent_estimates() {
        let mut estimator = BloodPressureEstimator::new(30.0).with_completion_delay(1000);
        estimator.begin_finalization(0);
        for (t, systolic, diastolic) in [(0, 110.0, 70.0), (500, 120.0, 80.0), (1000, 130.0, 90.0)] {
            estimator.final_buffer.push((t, BloodPressure { systolic, diastolic }));
        }
        assert_eq!(estimator.final_value(900), None);
        let bp = estimator.final_value(1000).unwrap();
        assert!(bp.systolic > 120.0 && bp.systolic < 130.0);
        assert!(bp.diastolic > 80.0 && bp.diastolic < 90.0);
        assert!(!estimator.is_finalizing());
        assert_eq!(estimator.final_value(5000), Some(bp));
    }

    #[test]
    fn display_rounds_to_whole_numbers() {
        let bp = BloodPressure { systolic: 119.6, diastolic: 79.4 };
        assert_eq!(bp.to_string(), "120/79");
    }
}
