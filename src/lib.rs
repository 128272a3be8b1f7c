//! Vital-signs estimation from camera PPG brightness samples.
//!
//! [`VitalsEngine`] is the entry point: feed it one raw sample at a time
//! and it returns an aggregated [`VitalsReading`].

pub mod arrhythmia;
pub mod blood_pressure;
pub mod calibration;
pub mod config;
pub mod data_loading;
pub mod engine;
pub mod error;
pub mod features;
pub mod glucose;
pub mod heart_rate;
pub mod lipids;
pub mod output;
pub mod preprocessing;
pub mod spo2;
pub mod window;

pub use arrhythmia::{ArrhythmiaResult, HrvMetrics, RhythmLabel};
pub use blood_pressure::BloodPressure;
pub use calibration::{CalibrationProgress, CalibrationState, MetricId};
pub use config::EngineConfig;
pub use engine::{Lipids, VitalsEngine, VitalsReading};
pub use error::{EngineError, Result};
