use crate::config::{CalibrationConfig, MetricWeights};
use log::{debug, info};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricId {
    HeartRate,
    Spo2,
    BloodPressure,
    Arrhythmia,
    Glucose,
    Lipids,
}

impl MetricId {
    pub const ALL: [MetricId; 6] = [
        MetricId::HeartRate,
        MetricId::Spo2,
        MetricId::BloodPressure,
        MetricId::Arrhythmia,
        MetricId::Glucose,
        MetricId::Lipids,
    ];

    fn weight(self, weights: &MetricWeights) -> f64 {
        match self {
            MetricId::HeartRate => weights.heart_rate,
            MetricId::Spo2 => weights.spo2,
            MetricId::BloodPressure => weights.blood_pressure,
            MetricId::Arrhythmia => weights.arrhythmia,
            MetricId::Glucose => weights.glucose,
            MetricId::Lipids => weights.lipids,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    Calibrating,
    /// Calibration finished; the engine reports numeric readings.
    Complete,
}

/// Per-metric progress in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CalibrationProgress {
    pub heart_rate: f64,
    pub spo2: f64,
    pub blood_pressure: f64,
    pub arrhythmia: f64,
    pub glucose: f64,
    pub lipids: f64,
}

impl CalibrationProgress {
    fn complete() -> Self {
        let mut progress = Self::default();
        for metric in MetricId::ALL {
            progress.set(metric, 100.0);
        }
        progress
    }

    pub fn get(&self, metric: MetricId) -> f64 {
        match metric {
            MetricId::HeartRate => self.heart_rate,
            MetricId::Spo2 => self.spo2,
            MetricId::BloodPressure => self.blood_pressure,
            MetricId::Arrhythmia => self.arrhythmia,
            MetricId::Glucose => self.glucose,
            MetricId::Lipids => self.lipids,
        }
    }

    fn set(&mut self, metric: MetricId, value: f64) {
        let slot = match metric {
            MetricId::HeartRate => &mut self.heart_rate,
            MetricId::Spo2 => &mut self.spo2,
            MetricId::BloodPressure => &mut self.blood_pressure,
            MetricId::Arrhythmia => &mut self.arrhythmia,
            MetricId::Glucose => &mut self.glucose,
            MetricId::Lipids => &mut self.lipids,
        };
        *slot = value;
    }

    /// Mean over all metrics.
    pub fn overall(&self) -> f64 {
        MetricId::ALL.iter().map(|m| self.get(*m)).sum::<f64>() / MetricId::ALL.len() as f64
    }

    pub fn is_complete(&self) -> bool {
        MetricId::ALL.iter().all(|m| self.get(*m) >= 100.0)
    }
}

/// Tracks one calibration run. Time is measured from the timestamp of the
/// first sample seen after [`CalibrationSession::start`].
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    config: CalibrationConfig,
    state: CalibrationState,
    started_at: Option<u64>,
    samples_seen: u64,
    progress: CalibrationProgress,
}

impl CalibrationSession {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            state: CalibrationState::Idle,
            started_at: None,
            samples_seen: 0,
            progress: CalibrationProgress::default(),
        }
    }

    pub fn start(&mut self) {
        info!(
            "Calibration started: {} samples or {} ms",
            self.config.required_samples, self.config.timeout_ms
        );
        self.state = CalibrationState::Calibrating;
        self.started_at = None;
        self.samples_seen = 0;
        self.progress = CalibrationProgress::default();
    }

    /// Counts one processed sample and recomputes progress. Returns `true`
    /// on the sample that completes the session.
    pub fn update(&mut self, timestamp_ms: u64) -> bool {
        if self.state != CalibrationState::Calibrating {
            return false;
        }
        let started_at = *self.started_at.get_or_insert(timestamp_ms);
        self.samples_seen += 1;
        let elapsed = timestamp_ms.saturating_sub(started_at);

        if self.samples_seen >= self.config.required_samples {
            info!("Calibration complete after {} samples", self.samples_seen);
            self.finish();
            return true;
        }
        if elapsed >= self.config.timeout_ms {
            info!(
                "Calibration timed out after {} ms with {} samples",
                elapsed, self.samples_seen
            );
            self.finish();
            return true;
        }

        let time_fraction = elapsed as f64 / self.config.timeout_ms.max(1) as f64;
        let sample_fraction = self.samples_seen as f64 / self.config.required_samples.max(1) as f64;
        let base = time_fraction.min(sample_fraction) * 100.0;
        for metric in MetricId::ALL {
            let weighted = (base * metric.weight(&self.config.weights)).clamp(0.0, 100.0);
            self.progress.set(metric, weighted);
        }
        false
    }

    pub fn force_complete(&mut self) {
        if self.state == CalibrationState::Calibrating {
            debug!("Calibration force-completed at {} samples", self.samples_seen);
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.state = CalibrationState::Complete;
        self.progress = CalibrationProgress::complete();
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn is_calibrating(&self) -> bool {
        self.state == CalibrationState::Calibrating
    }

    pub fn progress(&self) -> CalibrationProgress {
        self.progress
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}
