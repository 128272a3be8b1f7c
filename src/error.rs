use thiserror::Error;

/// Errors surfaced to callers of the engine.
///
/// Short windows, weak signal and out-of-range estimates are handled inside
/// the estimators and never show up here; only calls that cannot be
/// degraded silently fail.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("not enough reference data for {metric} calibration: need {required} samples, got {provided}")]
    CalibrationDataInsufficient {
        metric: &'static str,
        required: usize,
        provided: usize,
    },

    #[error("invalid {metric} reference: {reason}")]
    InvalidReference {
        metric: &'static str,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
