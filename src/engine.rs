//! The vitals engine: one `process` call per PPG sample drives the filter
//! chain, every estimator and the calibration session, and assembles one
//! [`VitalsReading`].

use crate::arrhythmia::{ArrhythmiaAnalyzer, ArrhythmiaResult, HrvMetrics};
use crate::blood_pressure::{BloodPressure, BloodPressureEstimator};
use crate::calibration::{CalibrationProgress, CalibrationSession, CalibrationState};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::features;
use crate::glucose::GlucoseEstimator;
use crate::heart_rate::HeartRateEstimator;
use crate::lipids::{LipidEstimator, LipidProfile};
use crate::preprocessing::FilterChain;
use crate::spo2::Spo2Estimator;
use crate::window::SlidingWindow;
use log::{debug, info};
use serde::Serialize;

/// Placeholder shown while blood pressure is undetermined.
pub const BP_PLACEHOLDER: &str = "--/--";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Lipids {
    pub cholesterol: u32,
    pub triglycerides: u32,
}

/// Aggregated per-sample output. Undetermined values are reported as `0`
/// (or `"--/--"` for blood pressure).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VitalsReading {
    pub timestamp_ms: u64,
    pub heart_rate: u32,
    pub spo2: u32,
    pub blood_pressure: String,
    pub arrhythmia_status: String,
    pub glucose: u32,
    pub lipids: Lipids,
    pub calibration: Option<CalibrationProgress>,
}

impl VitalsReading {
    /// Heart rate, SpO2 and blood pressure are all determined.
    pub fn is_fully_valid(&self) -> bool {
        self.heart_rate > 0 && self.spo2 > 0 && self.blood_pressure != BP_PLACEHOLDER
    }
}

/// Typed per-frame estimates before conversion to boundary sentinels.
#[derive(Debug, Clone, Default)]
struct Estimates {
    heart_rate: Option<f64>,
    spo2: Option<f64>,
    blood_pressure: Option<BloodPressure>,
    glucose: Option<f64>,
    lipids: Option<LipidProfile>,
}

fn to_count(value: Option<f64>) -> u32 {
    value
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v.round() as u32)
        .unwrap_or(0)
}

impl Estimates {
    fn into_reading(self, timestamp_ms: u64, arrhythmia_status: String) -> VitalsReading {
        VitalsReading {
            timestamp_ms,
            heart_rate: to_count(self.heart_rate),
            spo2: to_count(self.spo2),
            blood_pressure: self
                .blood_pressure
                .map_or_else(|| BP_PLACEHOLDER.to_string(), |bp| bp.to_string()),
            arrhythmia_status,
            glucose: to_count(self.glucose),
            lipids: self
                .lipids
                .map(|l| Lipids {
                    cholesterol: to_count(Some(l.cholesterol)),
                    triglycerides: to_count(Some(l.triglycerides)),
                })
                .unwrap_or_default(),
            calibration: None,
        }
    }
}

pub struct VitalsEngine {
    config: EngineConfig,
    filter: FilterChain,
    window: SlidingWindow<f64>,
    heart_rate: HeartRateEstimator,
    arrhythmia: ArrhythmiaAnalyzer,
    spo2: Spo2Estimator,
    blood_pressure: BloodPressureEstimator,
    glucose: GlucoseEstimator,
    lipids: LipidEstimator,
    calibration: CalibrationSession,
    last_valid: Option<VitalsReading>,
    last_timestamp: Option<u64>,
    samples_processed: u64,
}

impl VitalsEngine {
    /// Builds an engine after validating `config`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        Self {
            filter: FilterChain::new(),
            window: SlidingWindow::new(config.window_size),
            heart_rate: HeartRateEstimator::new(config.heart_rate.clone()),
            arrhythmia: ArrhythmiaAnalyzer::new(config.arrhythmia.clone()),
            spo2: Spo2Estimator::new(),
            blood_pressure: BloodPressureEstimator::new(config.sample_rate_hz),
            glucose: GlucoseEstimator::new(config.glucose.clone()),
            lipids: LipidEstimator::new(config.lipids.clone(), config.sample_rate_hz),
            calibration: CalibrationSession::new(config.calibration.clone()),
            last_valid: None,
            last_timestamp: None,
            samples_processed: 0,
            config,
        }
    }

    /// Processes one raw sample taken at `timestamp_ms`. Samples must arrive
    /// in order.
    pub fn process(&mut self, raw: f64, timestamp_ms: u64) -> VitalsReading {
        self.samples_processed += 1;
        self.last_timestamp = Some(timestamp_ms);

        let filtered = self.filter.filter(raw);
        self.window.push(filtered);

        let beat = if self.filter.signal_lost() {
            if self.filter.signal_just_lost() {
                debug!("Flat input at {} ms, holding heart-rate detection", timestamp_ms);
            }
            self.heart_rate.hold_signal_loss(filtered)
        } else {
            self.heart_rate.process(filtered, timestamp_ms)
        };
        let rhythm = match beat.rr_interval_ms {
            Some(rr) => self.arrhythmia.push_interval(rr, timestamp_ms),
            None => self.arrhythmia.status(timestamp_ms),
        };

        let heart_rate = Some(beat.bpm).filter(|bpm| *bpm > 0.0);
        let window = self.window.as_slice();
        let estimates = Estimates {
            heart_rate,
            spo2: self.spo2.estimate(window),
            blood_pressure: self.blood_pressure.estimate(window, heart_rate, timestamp_ms),
            glucose: self.glucose.estimate(window),
            lipids: self.lipids.estimate(window),
        };

        if self.calibration.is_calibrating() {
            self.calibration.update(timestamp_ms);
            let progress = self.calibration.progress();
            let mut reading = Estimates::default().into_reading(
                timestamp_ms,
                format!("CALIBRATING...|{}", progress.overall().round() as u32),
            );
            reading.calibration = Some(progress);
            return reading;
        }

        let reading = estimates.into_reading(timestamp_ms, rhythm.status_string());
        if reading.is_fully_valid() {
            self.last_valid = Some(reading.clone());
        }
        reading
    }

    /// Arms a calibration run; its clock starts at the next processed sample.
    pub fn start_calibration(&mut self) {
        self.calibration.start();
    }

    pub fn force_calibration_completion(&mut self) {
        self.calibration.force_complete();
    }

    pub fn calibration_state(&self) -> CalibrationState {
        self.calibration.state()
    }

    pub fn calibration_progress(&self) -> CalibrationProgress {
        self.calibration.progress()
    }

    /// Runs raw reference samples through a fresh filter chain.
    fn filter_reference(samples: &[f64]) -> Vec<f64> {
        let mut chain = FilterChain::new();
        samples.iter().map(|&s| chain.filter(s)).collect()
    }

    /// Learns the blood-pressure offset from a reference reading and the raw
    /// samples recorded alongside it.
    pub fn set_blood_pressure_calibration(
        &mut self,
        reference_systolic: f64,
        reference_diastolic: f64,
        samples: &[f64],
    ) -> Result<()> {
        let filtered = Self::filter_reference(samples);
        self.blood_pressure.calibrate(
            reference_systolic,
            reference_diastolic,
            &filtered,
            self.heart_rate.smoothed_bpm(),
        )?;
        info!(
            "Blood pressure calibrated to {}/{}",
            reference_systolic, reference_diastolic
        );
        Ok(())
    }

    pub fn set_glucose_calibration(&mut self, reference_mgdl: f64, samples: &[f64]) -> Result<()> {
        let filtered = Self::filter_reference(samples);
        let factor = self.glucose.calibrate(reference_mgdl, &filtered)?;
        info!("Glucose calibrated to {} mg/dL (factor {:.3})", reference_mgdl, factor);
        Ok(())
    }

    /// Needs at least one accepted lipid estimate from the live stream.
    pub fn set_lipid_calibration(&mut self, reference_cholesterol: f64, reference_triglycerides: f64) -> Result<()> {
        self.lipids.calibrate(reference_cholesterol, reference_triglycerides)?;
        info!(
            "Lipids calibrated to {}/{} mg/dL",
            reference_cholesterol, reference_triglycerides
        );
        Ok(())
    }

    /// Soft reset: clears signal and estimator state, keeps user
    /// calibrations and returns the last fully valid reading.
    pub fn reset(&mut self) -> Option<VitalsReading> {
        info!("Soft reset after {} samples", self.samples_processed);
        self.filter.reset();
        self.window.clear();
        self.heart_rate.reset();
        self.arrhythmia.reset();
        self.spo2.reset();
        self.blood_pressure.clear_buffers();
        self.glucose.clear_buffers();
        self.lipids.clear_buffers();
        self.calibration.reset();
        self.last_timestamp = None;
        self.samples_processed = 0;
        self.last_valid.clone()
    }

    /// Hard reset: also discards calibrations and the retained reading.
    pub fn full_reset(&mut self) {
        info!("Full reset");
        *self = Self::build(self.config.clone());
    }

    pub fn last_valid_reading(&self) -> Option<&VitalsReading> {
        self.last_valid.as_ref()
    }

    pub fn get_final_bpm(&self) -> Option<f64> {
        self.heart_rate.get_final_bpm()
    }

    /// Starts delayed blood-pressure finalization at the latest sample time.
    pub fn begin_finalization(&mut self) {
        self.blood_pressure
            .begin_finalization(self.last_timestamp.unwrap_or_default());
    }

    /// Time-weighted session blood pressure, once the completion delay has
    /// passed since [`Self::begin_finalization`].
    pub fn final_blood_pressure(&mut self) -> Option<BloodPressure> {
        self.blood_pressure
            .final_value(self.last_timestamp.unwrap_or_default())
    }

    /// FFT cross-check of the heart rate over the current window.
    pub fn spectral_heart_rate(&self) -> Option<f64> {
        features::dominant_frequency_bpm(
            self.window.as_slice(),
            self.config.sample_rate_hz,
            self.config.heart_rate.min_bpm,
            self.config.heart_rate.max_bpm,
        )
    }

    pub fn hrv_metrics(&self) -> HrvMetrics {
        self.arrhythmia.metrics()
    }

    pub fn arrhythmia_status(&self) -> ArrhythmiaResult {
        self.arrhythmia.status(self.last_timestamp.unwrap_or_default())
    }

    pub fn heart_rate(&self) -> &HeartRateEstimator {
        &self.heart_rate
    }

    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Default for VitalsEngine {
    fn default() -> Self {
        Self::build(EngineConfig::default())
    }
}
