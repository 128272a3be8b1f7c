use crate::error::{EngineError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Nominal camera frame rate.
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 30.0;

/// Tunables for the heart-rate / peak estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartRateConfig {
    /// No peak is confirmed during this initial period (ms).
    pub warmup_ms: u64,
    /// Refractory period between two confirmed peaks (ms).
    pub min_peak_time_ms: u64,
    pub min_bpm: f64,
    pub max_bpm: f64,
    pub bpm_history_size: usize,
    pub bpm_ema_alpha: f64,
    pub baseline_factor: f64,
    pub signal_threshold: f64,
    pub min_signal_threshold: f64,
    pub max_signal_threshold: f64,
    pub min_confidence: f64,
    pub min_confidence_floor: f64,
    pub min_confidence_ceiling: f64,
    /// Negative: a candidate must already be on its falling edge.
    pub derivative_threshold: f64,
    pub min_derivative_threshold: f64,
    pub max_derivative_threshold: f64,
    pub tuning_peak_window: usize,
    pub tuning_learning_rate: f64,
    pub peak_validation_ratio: f64,
    pub peak_validation_window: usize,
    pub low_signal_threshold: f64,
    pub low_signal_frames: usize,
    pub low_signal_bpm_decay: f64,
    pub final_trim_fraction: f64,
}

impl Default for HeartRateConfig {
    fn default() -> Self {
        Self {
            warmup_ms: 3000,
            min_peak_time_ms: 600,
            min_bpm: 40.0,
            max_bpm: 200.0,
            bpm_history_size: 12,
            bpm_ema_alpha: 0.2,
            baseline_factor: 0.97,
            signal_threshold: 0.1,
            min_signal_threshold: 0.05,
            max_signal_threshold: 50.0,
            min_confidence: 0.5,
            min_confidence_floor: 0.3,
            min_confidence_ceiling: 0.8,
            derivative_threshold: -0.005,
            min_derivative_threshold: -10.0,
            max_derivative_threshold: -0.001,
            tuning_peak_window: 20,
            tuning_learning_rate: 0.1,
            peak_validation_ratio: 1.15,
            peak_validation_window: 5,
            low_signal_threshold: 0.02,
            low_signal_frames: 10,
            low_signal_bpm_decay: 0.85,
            final_trim_fraction: 0.2,
        }
    }
}

/// Tunables for the HRV / arrhythmia analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrhythmiaConfig {
    /// Learning ends after this long or after `learning_intervals`, whichever first.
    pub learning_period_ms: u64,
    pub learning_intervals: usize,
    pub min_learning_intervals: usize,
    pub analysis_window: usize,
    pub min_analysis_intervals: usize,
    pub history_size: usize,
    pub rmssd_factor: f64,
    pub mean_sd_factor: f64,
    pub sd_factor: f64,
    pub outlier_low: f64,
    pub outlier_high: f64,
    pub min_time_between_arrhythmias_ms: u64,
    pub grace_period_ms: u64,
    /// Below this rhythm confidence the status reads WEAK SIGNAL.
    pub min_confidence: f64,
    /// Recent interval attempts, accepted or rejected, behind the
    /// plausibility share of the confidence.
    pub confidence_window: usize,
    pub min_baseline_rmssd_ms: f64,
    pub min_baseline_sd_fraction: f64,
    pub min_rr_ms: f64,
    pub max_rr_ms: f64,
}

impl Default for ArrhythmiaConfig {
    fn default() -> Self {
        Self {
            learning_period_ms: 5000,
            learning_intervals: 6,
            min_learning_intervals: 3,
            analysis_window: 5,
            min_analysis_intervals: 3,
            history_size: 50,
            rmssd_factor: 1.5,
            mean_sd_factor: 2.0,
            sd_factor: 1.8,
            outlier_low: 0.6,
            outlier_high: 1.4,
            min_time_between_arrhythmias_ms: 1000,
            grace_period_ms: 3000,
            min_confidence: 0.5,
            confidence_window: 8,
            min_baseline_rmssd_ms: 20.0,
            min_baseline_sd_fraction: 0.05,
            min_rr_ms: 300.0,
            max_rr_ms: 1500.0,
        }
    }
}

/// Per-metric weighting of calibration progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricWeights {
    pub heart_rate: f64,
    pub spo2: f64,
    pub blood_pressure: f64,
    pub arrhythmia: f64,
    pub glucose: f64,
    pub lipids: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            heart_rate: 1.0,
            spo2: 1.2,
            blood_pressure: 0.9,
            arrhythmia: 0.8,
            glucose: 0.7,
            lipids: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Samples after which calibration completes.
    pub required_samples: u64,
    /// Calibration completes after this long even without enough samples (ms).
    pub timeout_ms: u64,
    pub weights: MetricWeights,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            required_samples: 150,
            timeout_ms: 10_000,
            weights: MetricWeights::default(),
        }
    }
}

/// One synthesized near-infrared band of the glucose model.
///
/// The band's absorbance is `offset + od_gain · OD + pulse_gain · pulsatility`,
/// where OD is the optical density of the window's DC level. The extinction
/// coefficient only enters when the absorbance is inverted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NirBand {
    pub wavelength_nm: f64,
    /// Molar extinction coefficient, absorbance per (mmol/L · cm).
    pub extinction: f64,
    pub offset: f64,
    pub od_gain: f64,
    pub pulse_gain: f64,
    pub weight: f64,
}

impl NirBand {
    fn new(wavelength_nm: f64, extinction: f64, offset: f64, od_gain: f64, pulse_gain: f64, weight: f64) -> Self {
        Self {
            wavelength_nm,
            extinction,
            offset,
            od_gain,
            pulse_gain,
            weight,
        }
    }
}

/// Beer-Lambert glucose model. The coefficients are empirical placeholders,
/// kept configurable because they do not generalize across devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlucoseModel {
    pub bands: Vec<NirBand>,
    pub path_length_cm: f64,
    /// Incident intensity: a sample at this level has zero optical density.
    pub intensity_full_scale: f64,
    /// mg/dL per mmol/L.
    pub mgdl_per_mmol: f64,
    pub min_window: usize,
    pub min_perfusion: f64,
    pub stabilizer_size: usize,
}

impl Default for GlucoseModel {
    fn default() -> Self {
        Self {
            bands: vec![
                NirBand::new(940.0, 0.32, 1.20, 1.0, 3.0, 0.15),
                NirBand::new(1050.0, 0.45, 1.80, 1.2, 2.5, 0.20),
                NirBand::new(1160.0, 0.61, 2.60, 1.4, 2.0, 0.25),
                NirBand::new(1300.0, 0.38, 1.55, 1.1, 2.8, 0.20),
                NirBand::new(1450.0, 0.92, 4.10, 1.8, 2.2, 0.20),
            ],
            path_length_cm: 1.0,
            intensity_full_scale: 255.0,
            mgdl_per_mmol: 18.016,
            min_window: 150,
            min_perfusion: 0.001,
            stabilizer_size: 5,
        }
    }
}

/// Number of morphology and spectral features the lipid model projects.
pub const LIPID_FEATURES: usize = 8;

/// Correlation-vector lipid model. Coefficients are empirical placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LipidModel {
    pub cholesterol_coefficients: Vec<f64>,
    pub triglyceride_coefficients: Vec<f64>,
    pub cholesterol_base: f64,
    pub cholesterol_span: f64,
    pub triglyceride_base: f64,
    pub triglyceride_span: f64,
    pub min_window: usize,
    pub min_confidence: f64,
    pub smoothing: f64,
}

impl Default for LipidModel {
    fn default() -> Self {
        Self {
            cholesterol_coefficients: vec![0.35, -0.25, 0.20, 0.15, 0.30, 0.10, -0.20, 0.15],
            triglyceride_coefficients: vec![0.30, 0.20, -0.15, 0.25, 0.20, -0.10, 0.15, 0.20],
            cholesterol_base: 180.0,
            cholesterol_span: 60.0,
            triglyceride_base: 150.0,
            triglyceride_span: 100.0,
            min_window: 180,
            min_confidence: 0.5,
            smoothing: 0.3,
        }
    }
}

/// Top-level engine configuration, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate_hz: f64,
    /// Capacity of the filtered-sample window shared by the estimators.
    pub window_size: usize,
    pub heart_rate: HeartRateConfig,
    pub arrhythmia: ArrhythmiaConfig,
    pub calibration: CalibrationConfig,
    pub glucose: GlucoseModel,
    pub lipids: LipidModel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            window_size: 300,
            heart_rate: HeartRateConfig::default(),
            arrhythmia: ArrhythmiaConfig::default(),
            calibration: CalibrationConfig::default(),
            glucose: GlucoseModel::default(),
            lipids: LipidModel::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(EngineError::Config(format!(
                "sample_rate_hz must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if self.window_size < 30 {
            return Err(EngineError::Config(format!(
                "window_size must be at least 30 samples, got {}",
                self.window_size
            )));
        }
        if self.heart_rate.min_bpm >= self.heart_rate.max_bpm {
            return Err(EngineError::Config("heart_rate.min_bpm must be below max_bpm".into()));
        }
        if self.glucose.bands.is_empty() || self.glucose.bands.iter().any(|b| b.extinction <= 0.0) {
            return Err(EngineError::Config(
                "glucose model needs at least one band with positive extinction".into(),
            ));
        }
        if self.lipids.cholesterol_coefficients.len() != LIPID_FEATURES
            || self.lipids.triglyceride_coefficients.len() != LIPID_FEATURES
        {
            return Err(EngineError::Config(format!(
                "lipid coefficient vectors must have {} entries",
                LIPID_FEATURES
            )));
        }
        Ok(())
    }
}

/// A `HIGH/LOW` pair given on the command line, e.g. `130/85`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferencePair {
    pub high: f64,
    pub low: f64,
}

impl FromStr for ReferencePair {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| format!("Invalid reference pair: {}. Expected format A/B, e.g. 130/85", s))?;
        let high = high
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("Invalid reference value {}: {}", high, e))?;
        let low = low
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("Invalid reference value {}: {}", low, e))?;
        Ok(ReferencePair { high, low })
    }
}

/// Estimate vital signs from a recorded PPG brightness trace
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// CSV file with timestamp_ms,value rows
    #[arg(help = "CSV file with timestamp,value rows (timestamp in milliseconds)")]
    pub input_path: PathBuf,

    /// JSON file overriding the engine configuration
    #[arg(long, env = "PPG_VITALS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Sample rate in Hz (overrides the config file)
    #[arg(long)]
    pub sample_rate: Option<f64>,

    /// Run a calibration phase at the start of the recording
    #[arg(long)]
    pub calibrate: bool,

    /// Force calibration to complete after this many samples
    #[arg(long)]
    pub force_calibration_after: Option<u64>,

    /// Blood pressure reference reading (SYS/DIA, e.g. 120/80)
    #[arg(long)]
    pub bp_reference: Option<ReferencePair>,

    /// Glucose reference reading in mg/dL
    #[arg(long)]
    pub glucose_reference: Option<f64>,

    /// Lipid reference reading (CHOLESTEROL/TRIGLYCERIDES in mg/dL)
    #[arg(long)]
    pub lipid_reference: Option<ReferencePair>,

    /// Compute a time-weighted final blood pressure at the end of the recording
    #[arg(long)]
    pub finalize: bool,

    /// CSV output file for per-sample readings
    #[arg(long)]
    pub csv_output: Option<PathBuf>,
}
