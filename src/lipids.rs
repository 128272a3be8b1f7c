//! Lipid profile estimation from PPG morphology and spectral band powers.
//!
//! Eight features are projected onto two fixed correlation vectors. The
//! cosine of the angle between features and coefficients is the relative
//! score that positions each metric inside its configured span.

use crate::config::{LipidModel, LIPID_FEATURES};
use crate::error::{EngineError, Result};
use crate::features;
use log::{debug, trace};

pub const CHOLESTEROL_RANGE: (f64, f64) = (100.0, 300.0);
pub const TRIGLYCERIDE_RANGE: (f64, f64) = (50.0, 500.0);
pub const CALIBRATION_FACTOR_RANGE: (f64, f64) = (0.5, 2.0);
/// Perfusion index at which the quality score saturates.
const FULL_PERFUSION: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LipidProfile {
    pub cholesterol: f64,
    pub triglycerides: f64,
}

/// One cardiac cycle: valley, systolic peak, next valley (sample indices).
#[derive(Debug, Clone, Copy)]
struct Cycle {
    start: usize,
    peak: usize,
    end: usize,
}

fn cycles(window: &[f64], peaks: &[usize], valleys: &[usize]) -> Vec<Cycle> {
    valleys
        .windows(2)
        .filter_map(|v| {
            peaks
                .iter()
                .find(|&&p| p > v[0] && p < v[1])
                .map(|&peak| Cycle {
                    start: v[0],
                    peak,
                    end: v[1],
                })
        })
        .filter(|c| window[c.peak] > window[c.start])
        .collect()
}

fn area_above(window: &[f64], from: usize, to: usize, floor: f64) -> f64 {
    window[from..to].iter().map(|v| (v - floor).max(0.0)).sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LipidFeatures {
    pub values: [f64; LIPID_FEATURES],
    /// Signal quality in `[0, 1]`: perfusion times beat regularity.
    pub confidence: f64,
}

impl LipidFeatures {
    /// Feature order: systolic area ratio, systolic slope, diastolic slope,
    /// peak-to-peak interval (s), post-notch area ratio, then the low, mid
    /// and high band-power fractions.
    pub fn extract(window: &[f64], sample_rate: f64) -> Option<Self> {
        let peaks = features::find_peaks(window, features::MIN_EVENT_DISTANCE, features::PEAK_THRESHOLD_FRACTION);
        let valleys = features::find_valleys(window, features::MIN_EVENT_DISTANCE, features::PEAK_THRESHOLD_FRACTION);
        let cycles = cycles(window, &peaks, &valleys);
        if cycles.is_empty() || peaks.len() < 2 || sample_rate <= 0.0 {
            return None;
        }

        let mut area_ratios = Vec::with_capacity(cycles.len());
        let mut rise_slopes = Vec::with_capacity(cycles.len());
        let mut fall_slopes = Vec::with_capacity(cycles.len());
        let mut notch_ratios = Vec::new();
        for c in &cycles {
            let floor = window[c.start].min(window[c.end]);
            let amplitude = window[c.peak] - floor;
            let total = area_above(window, c.start, c.end, floor);
            if amplitude <= 0.0 || total <= 0.0 {
                continue;
            }
            area_ratios.push(area_above(window, c.start, c.peak, floor) / total);
            rise_slopes.push(sample_rate / (c.peak - c.start) as f64);
            fall_slopes.push(sample_rate / (c.end - c.peak) as f64);
            if let Some(notch) = features::dicrotic_notch(window, c.peak, c.end - c.peak) {
                notch_ratios.push(area_above(window, notch, c.end, floor) / total);
            }
        }
        if area_ratios.is_empty() {
            return None;
        }

        let intervals: Vec<f64> = peaks.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
        let regularity = (1.0 - features::coefficient_of_variation(&intervals)).clamp(0.0, 1.0);
        let perfusion = (features::perfusion_index(window) / FULL_PERFUSION).min(1.0);

        let spectrum = features::power_spectrum(window, sample_rate);
        let total_power = spectrum.total_power();
        let band = |lo: f64, hi: f64| {
            if total_power > 0.0 {
                spectrum.band_power(lo, hi) / total_power
            } else {
                0.0
            }
        };

        Some(Self {
            values: [
                features::mean(&area_ratios),
                features::mean(&rise_slopes),
                features::mean(&fall_slopes),
                features::pulse_transit_time(&peaks, sample_rate) / 1000.0,
                features::mean(&notch_ratios),
                band(0.04, 0.5),
                band(0.5, 2.5),
                band(2.5, 5.0),
            ],
            confidence: perfusion * regularity,
        })
    }

    /// Cosine similarity with a coefficient vector, in `[-1, 1]`.
    pub fn score(&self, coefficients: &[f64]) -> f64 {
        let dot: f64 = self.values.iter().zip(coefficients).map(|(f, c)| f * c).sum();
        let norm_f = self.values.iter().map(|f| f * f).sum::<f64>().sqrt();
        let norm_c = coefficients.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm_f <= f64::EPSILON || norm_c <= f64::EPSILON {
            return 0.0;
        }
        (dot / (norm_f * norm_c)).clamp(-1.0, 1.0)
    }
}

pub struct LipidEstimator {
    model: LipidModel,
    sample_rate: f64,
    factors: Option<(f64, f64)>,
    last_raw: Option<LipidProfile>,
    smoothed: Option<LipidProfile>,
}

impl LipidEstimator {
    pub fn new(model: LipidModel, sample_rate: f64) -> Self {
        Self {
            model,
            sample_rate,
            factors: None,
            last_raw: None,
            smoothed: None,
        }
    }

    fn raw_profile(&self, features: &LipidFeatures) -> LipidProfile {
        LipidProfile {
            cholesterol: self.model.cholesterol_base
                + self.model.cholesterol_span * features.score(&self.model.cholesterol_coefficients),
            triglycerides: self.model.triglyceride_base
                + self.model.triglyceride_span * features.score(&self.model.triglyceride_coefficients),
        }
    }

    /// Low-confidence windows keep the previous value; accepted windows move
    /// the output by `smoothing × confidence` of the way toward the new
    /// estimate.
    pub fn estimate(&mut self, window: &[f64]) -> Option<LipidProfile> {
        if window.len() < self.model.min_window {
            return None;
        }
        let Some(features) = LipidFeatures::extract(window, self.sample_rate) else {
            return self.smoothed;
        };
        if features.confidence < self.model.min_confidence {
            trace!("Lipid window rejected: confidence {:.2}", features.confidence);
            return self.smoothed;
        }

        let raw = self.raw_profile(&features);
        self.last_raw = Some(raw);
        let (chol_factor, trig_factor) = self.factors.unwrap_or((1.0, 1.0));
        let target = LipidProfile {
            cholesterol: (raw.cholesterol * chol_factor).clamp(CHOLESTEROL_RANGE.0, CHOLESTEROL_RANGE.1),
            triglycerides: (raw.triglycerides * trig_factor).clamp(TRIGLYCERIDE_RANGE.0, TRIGLYCERIDE_RANGE.1),
        };

        let alpha = (self.model.smoothing * features.confidence).clamp(0.0, 1.0);
        self.smoothed = Some(match self.smoothed {
            Some(prev) => LipidProfile {
                cholesterol: prev.cholesterol + alpha * (target.cholesterol - prev.cholesterol),
                triglycerides: prev.triglycerides + alpha * (target.triglycerides - prev.triglycerides),
            },
            None => target,
        });
        self.smoothed
    }

    /// Derives per-metric factors from the most recent raw estimate.
    pub fn calibrate(&mut self, reference_cholesterol: f64, reference_triglycerides: f64) -> Result<(f64, f64)> {
        for (name, value) in [
            ("cholesterol", reference_cholesterol),
            ("triglycerides", reference_triglycerides),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(EngineError::InvalidReference {
                    metric: "lipids",
                    reason: format!("{} reference {} must be positive", name, value),
                });
            }
        }
        let raw = self.last_raw.ok_or(EngineError::CalibrationDataInsufficient {
            metric: "lipids",
            required: self.model.min_window,
            provided: 0,
        })?;

        let clamp = |f: f64| f.clamp(CALIBRATION_FACTOR_RANGE.0, CALIBRATION_FACTOR_RANGE.1);
        let factors = (
            clamp(reference_cholesterol / raw.cholesterol),
            clamp(reference_triglycerides / raw.triglycerides),
        );
        debug!("Lipids calibrated: factors {:.3}/{:.3}", factors.0, factors.1);
        self.factors = Some(factors);
        self.smoothed = None;
        Ok(factors)
    }

    pub fn calibration_factors(&self) -> Option<(f64, f64)> {
        self.factors
    }

    pub fn last_valid(&self) -> Option<LipidProfile> {
        self.smoothed
    }

    /// Clears live state; calibration factors survive.
    pub fn clear_buffers(&mut self) {
        self.last_raw = None;
        self.smoothed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn ppg_window(len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let phase = 2.0 * PI * 1.25 * i as f64 / 30.0;
                100.0 + 2.0 * phase.sin() + 0.5 * (2.0 * phase).sin()
            })
            .collect()
    }

    #[test]
    fn extracts_features_from_regular_pulses() {
        let features = LipidFeatures::extract(&ppg_window(300), 30.0).unwrap();
        assert!(features.confidence > 0.9, "confidence {}", features.confidence);
        assert!((features.values[3] - 0.8).abs() < 0.05, "interval {}", features.values[3]);
        assert!(features.values.iter().all(|v| v.is_finite()));
        // Almost all of the power sits around the 1.25 Hz fundamental.
        assert!(features.values[6] > features.values[5]);
    }

    #[test]
    fn cosine_score_is_bounded() {
        let features = LipidFeatures {
            values: [1.0; LIPID_FEATURES],
            confidence: 1.0,
        };
        assert!((features.score(&[1.0; LIPID_FEATURES]) - 1.0).abs() < 1e-12);
        assert!((features.score(&[-2.0; LIPID_FEATURES]) + 1.0).abs() < 1e-12);
        assert_eq!(features.score(&[0.0; LIPID_FEATURES]), 0.0);
    }

    #[test]
    fn estimates_stay_in_range() {
        let mut estimator = LipidEstimator::new(LipidModel::default(), 30.0);
        let profile = estimator.estimate(&ppg_window(300)).unwrap();
        assert!((CHOLESTEROL_RANGE.0..=CHOLESTEROL_RANGE.1).contains(&profile.cholesterol));
        assert!((TRIGLYCERIDE_RANGE.0..=TRIGLYCERIDE_RANGE.1).contains(&profile.triglycerides));
        assert_eq!(estimator.estimate(&ppg_window(100)), None);
        assert_eq!(estimator.estimate(&[100.0; 300]), Some(profile));
    }

    #[test]
    fn calibration_needs_a_prior_estimate() {
        let mut estimator = LipidEstimator::new(LipidModel::default(), 30.0);
        assert!(matches!(
            estimator.calibrate(200.0, 150.0),
            Err(EngineError::CalibrationDataInsufficient { metric: "lipids", .. })
        ));
        assert!(matches!(estimator.calibrate(0.0, 150.0), Err(EngineError::InvalidReference { .. })));

        let window = ppg_window(300);
        let raw = estimator.estimate(&window).unwrap();
        let (chol, trig) = estimator.calibrate(raw.cholesterol * 1.1, raw.triglycerides * 0.9).unwrap();
        assert!((chol - 1.1).abs() < 1e-9);
        assert!((trig - 0.9).abs() < 1e-9);

        let calibrated = estimator.estimate(&window).unwrap();
        assert!((calibrated.cholesterol - (raw.cholesterol * 1.1).min(CHOLESTEROL_RANGE.1)).abs() < 1e-6);
    }
}
