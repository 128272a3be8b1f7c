//! Glucose estimation from a synthesized near-infrared absorbance set.
//!
//! The window's DC level is turned into an optical density against the
//! full-scale intensity. Each configured band combines that density and the
//! pulsatility into an absorbance, Beer-Lambert inverts it with the band's
//! extinction coefficient, and the band concentrations are weight-averaged. The coefficients come from
//! [`GlucoseModel`] and are placeholders, not validated constants.

use crate::config::{GlucoseModel, NirBand};
use crate::error::{EngineError, Result};
use crate::features;
use crate::window::Stabilizer;
use log::{debug, trace};

pub const GLUCOSE_MIN: f64 = 70.0;
pub const GLUCOSE_MAX: f64 = 400.0;
pub const CALIBRATION_FACTOR_RANGE: (f64, f64) = (0.5, 2.0);

/// Smallest transmitted fraction considered, so a near-black window keeps a
/// finite optical density.
const MIN_TRANSMITTANCE: f64 = 1e-3;

/// Optical density `log10(I0 / I)` of a DC level against the incident
/// intensity. Levels above full scale read as fully transmissive.
pub fn optical_density(dc: f64, full_scale: f64) -> f64 {
    let transmittance = (dc / full_scale).clamp(MIN_TRANSMITTANCE, 1.0);
    -transmittance.log10()
}

/// Absorbance of one band for the given signal features.
pub fn band_absorbance(band: &NirBand, density: f64, pulsatility: f64) -> f64 {
    band.offset + band.od_gain * density + band.pulse_gain * pulsatility
}

/// Beer-Lambert: `c = A / (ε · l)`, in mmol/L.
pub fn beer_lambert_concentration(absorbance: f64, extinction: f64, path_length_cm: f64) -> Option<f64> {
    let denominator = extinction * path_length_cm;
    if denominator <= 0.0 || !absorbance.is_finite() {
        return None;
    }
    Some(absorbance / denominator)
}

pub struct GlucoseEstimator {
    model: GlucoseModel,
    stabilizer: Stabilizer,
    calibration_factor: Option<f64>,
    last_valid: Option<f64>,
}

impl GlucoseEstimator {
    pub fn new(model: GlucoseModel) -> Self {
        Self {
            stabilizer: Stabilizer::new(model.stabilizer_size),
            model,
            calibration_factor: None,
            last_valid: None,
        }
    }

    /// Uncalibrated concentration in mg/dL, or `None` when the window is
    /// too short or too weakly perfused to model.
    pub fn uncalibrated(&self, window: &[f64]) -> Option<f64> {
        if window.len() < self.model.min_window {
            return None;
        }
        let dc = features::dc_component(window);
        if dc <= 0.0 {
            return None;
        }
        let pulsatility = features::ac_component(window) / dc;
        if pulsatility < self.model.min_perfusion {
            return None;
        }
        let density = optical_density(dc, self.model.intensity_full_scale);

        let (weighted, weights) = self
            .model
            .bands
            .iter()
            .filter_map(|band| {
                let absorbance = band_absorbance(band, density, pulsatility);
                beer_lambert_concentration(absorbance, band.extinction, self.model.path_length_cm)
                    .map(|c| (c * band.weight, band.weight))
            })
            .fold((0.0, 0.0), |(c, w), (bc, bw)| (c + bc, w + bw));
        if weights <= 0.0 {
            return None;
        }

        let mmol = weighted / weights;
        trace!(
            "Glucose model: optical density {:.3}, pulsatility {:.4}, {:.2} mmol/L",
            density,
            pulsatility,
            mmol
        );
        Some(mmol * self.model.mgdl_per_mmol)
    }

    pub fn estimate(&mut self, window: &[f64]) -> Option<f64> {
        if window.len() < self.model.min_window {
            return None;
        }
        let Some(raw) = self.uncalibrated(window) else {
            return self.last_valid;
        };
        let value = raw * self.calibration_factor.unwrap_or(1.0);
        self.stabilizer.push(value.clamp(GLUCOSE_MIN, GLUCOSE_MAX));
        self.last_valid = self
            .stabilizer
            .median()
            .map(|v| v.round().clamp(GLUCOSE_MIN, GLUCOSE_MAX));
        self.last_valid
    }

    /// Derives `reference / raw` from a reference reading and the signal
    /// window recorded alongside it. Returns the clamped factor.
    pub fn calibrate(&mut self, reference_mgdl: f64, window: &[f64]) -> Result<f64> {
        if !reference_mgdl.is_finite() || reference_mgdl <= 0.0 {
            return Err(EngineError::InvalidReference {
                metric: "glucose",
                reason: format!("{} mg/dL is not a positive concentration", reference_mgdl),
            });
        }
        if window.len() < self.model.min_window {
            return Err(EngineError::CalibrationDataInsufficient {
                metric: "glucose",
                required: self.model.min_window,
                provided: window.len(),
            });
        }
        let raw = self.uncalibrated(window).ok_or_else(|| EngineError::InvalidReference {
            metric: "glucose",
            reason: "reference window is not perfused enough to model".into(),
        })?;

        let factor = (reference_mgdl / raw).clamp(CALIBRATION_FACTOR_RANGE.0, CALIBRATION_FACTOR_RANGE.1);
        debug!("Glucose calibrated: raw {:.1} mg/dL, factor {:.3}", raw, factor);
        self.calibration_factor = Some(factor);
        self.stabilizer.clear();
        Ok(factor)
    }

    pub fn calibration_factor(&self) -> Option<f64> {
        self.calibration_factor
    }

    pub fn last_valid(&self) -> Option<f64> {
        self.last_valid
    }

    /// Clears live buffers; the calibration factor survives.
    pub fn clear_buffers(&mut self) {
        self.stabilizer.clear();
        self.last_valid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn pulse_window(len: usize, dc: f64, ac: f64) -> Vec<f64> {
        (0..len)
            .map(|i| dc + ac / 2.0 * (2.0 * PI * 1.25 * i as f64 / 30.0).sin())
            .collect()
    }

    #[test]
    fn beer_lambert_inverts_absorbance() {
        assert_eq!(beer_lambert_concentration(1.2, 0.6, 2.0), Some(1.0));
        assert_eq!(beer_lambert_concentration(1.2, 0.0, 1.0), None);
    }

    #[test]
    fn optical_density_follows_transmittance() {
        assert_eq!(optical_density(255.0, 255.0), 0.0);
        assert!((optical_density(25.5, 255.0) - 1.0).abs() < 1e-12);
        assert_eq!(optical_density(400.0, 255.0), 0.0);
        assert!((optical_density(0.0001, 255.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn extinction_coefficients_scale_the_estimate() {
        let window = pulse_window(300, 100.0, 4.0);
        let base = GlucoseEstimator::new(GlucoseModel::default()).uncalibrated(&window).unwrap();

        let mut stronger = GlucoseModel::default();
        for band in &mut stronger.bands {
            band.extinction *= 2.0;
        }
        let halved = GlucoseEstimator::new(stronger).uncalibrated(&window).unwrap();
        assert!((halved - base / 2.0).abs() < 1e-9, "{base} -> {halved}");

        let mut one_band = GlucoseModel::default();
        one_band.bands[4].extinction *= 4.0;
        let shifted = GlucoseEstimator::new(one_band).uncalibrated(&window).unwrap();
        assert!(shifted < base - 1.0, "{base} -> {shifted}");
    }

    #[test]
    fn typical_window_lands_in_physiological_range() {
        let mut estimator = GlucoseEstimator::new(GlucoseModel::default());
        let value = estimator.estimate(&pulse_window(300, 100.0, 4.0)).unwrap();
        assert!((GLUCOSE_MIN..=GLUCOSE_MAX).contains(&value), "glucose {value}");
        assert_eq!(value, value.round());
    }

    #[test]
    fn short_or_flat_windows_degrade() {
        let mut estimator = GlucoseEstimator::new(GlucoseModel::default());
        assert_eq!(estimator.estimate(&pulse_window(100, 100.0, 4.0)), None);
        assert_eq!(estimator.estimate(&[100.0; 300]), None);
        let value = estimator.estimate(&pulse_window(300, 100.0, 4.0));
        assert!(value.is_some());
        assert_eq!(estimator.estimate(&[100.0; 300]), value);
    }

    #[test]
    fn calibration_factor_is_clamped() {
        let window = pulse_window(300, 100.0, 4.0);
        let mut estimator = GlucoseEstimator::new(GlucoseModel::default());
        let raw = estimator.uncalibrated(&window).unwrap();

        let factor = estimator.calibrate(raw * 1.2, &window).unwrap();
        assert!((factor - 1.2).abs() < 1e-9);
        let value = estimator.estimate(&window).unwrap();
        assert!((value - (raw * 1.2).round()).abs() <= 1.0);

        assert_eq!(estimator.calibrate(raw * 10.0, &window).unwrap(), 2.0);
        assert_eq!(estimator.calibrate(raw * 0.1, &window).unwrap(), 0.5);
    }

    #[test]
    fn calibration_errors_are_reported() {
        let mut estimator = GlucoseEstimator::new(GlucoseModel::default());
        assert!(matches!(
            estimator.calibrate(100.0, &pulse_window(10, 100.0, 4.0)),
            Err(EngineError::CalibrationDataInsufficient { metric: "glucose", provided: 10, .. })
        ));
        assert!(matches!(
            estimator.calibrate(-5.0, &pulse_window(300, 100.0, 4.0)),
            Err(EngineError::InvalidReference { .. })
        ));
        assert_eq!(estimator.calibration_factor(), None);
    }
}
