use crate::features;
use crate::window::SlidingWindow;
use log::{debug, trace};

pub const MEDIAN_WINDOW: usize = 5;
pub const MOVING_AVERAGE_WINDOW: usize = 3;
pub const EMA_ALPHA: f64 = 0.4;
pub const BASELINE_FACTOR: f64 = 0.95;
pub const DENOISE_WINDOW: usize = 10;
/// Soft threshold as a fraction of the short-window standard deviation.
pub const DENOISE_THRESHOLD_FACTOR: f64 = 0.5;
/// Sub-threshold values are scaled by at least this much, never zeroed.
pub const MIN_ATTENUATION: f64 = 0.3;
/// Raw-input standard deviation below which a sample counts as flat.
pub const LOW_SIGNAL_THRESHOLD: f64 = 0.05;
pub const LOW_SIGNAL_FRAMES: usize = 10;
/// Raw samples whose spread decides whether the input is flat.
pub const LOW_SIGNAL_WINDOW: usize = 5;

/// 7-point quadratic Savitzky-Golay smoothing coefficients.
const SAVITZKY_GOLAY: [f64; 7] = [-2.0, 3.0, 6.0, 7.0, 6.0, 3.0, -2.0];
const SAVITZKY_GOLAY_NORM: f64 = 21.0;

/// Counts consecutive low-level samples and reports a sustained loss of signal.
///
/// The level is whatever the caller measures: the filter chain feeds the
/// spread of its recent raw input, the heart-rate estimator its derivative.
#[derive(Debug, Clone)]
pub struct LowSignalDetector {
    threshold: f64,
    required_frames: usize,
    run: usize,
}

impl LowSignalDetector {
    pub fn new(threshold: f64, required_frames: usize) -> Self {
        Self {
            threshold,
            required_frames: required_frames.max(1),
            run: 0,
        }
    }

    /// Feeds one signal level; returns true while the loss condition holds.
    pub fn update(&mut self, level: f64) -> bool {
        if level.abs() < self.threshold {
            self.run = self.run.saturating_add(1);
        } else {
            self.run = 0;
        }
        self.is_lost()
    }

    pub fn is_lost(&self) -> bool {
        self.run >= self.required_frames
    }

    /// True only on the sample where the run reaches the required length.
    pub fn just_lost(&self) -> bool {
        self.run == self.required_frames
    }

    pub fn reset(&mut self) {
        self.run = 0;
    }
}

impl Default for LowSignalDetector {
    fn default() -> Self {
        Self::new(LOW_SIGNAL_THRESHOLD, LOW_SIGNAL_FRAMES)
    }
}

/// Stateful denoising chain applied to every raw sample in arrival order:
/// median, moving average, EMA, adaptive baseline, soft-threshold denoise and
/// Savitzky-Golay smoothing.
#[derive(Debug, Clone)]
pub struct FilterChain {
    raw: SlidingWindow<f64>,
    spread: SlidingWindow<f64>,
    medians: SlidingWindow<f64>,
    ema: Option<f64>,
    baseline: Option<f64>,
    normalized: SlidingWindow<f64>,
    denoised: SlidingWindow<f64>,
    low_signal: LowSignalDetector,
    last_normalized: f64,
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            raw: SlidingWindow::new(MEDIAN_WINDOW),
            spread: SlidingWindow::new(LOW_SIGNAL_WINDOW),
            medians: SlidingWindow::new(MOVING_AVERAGE_WINDOW),
            ema: None,
            baseline: None,
            normalized: SlidingWindow::new(DENOISE_WINDOW),
            denoised: SlidingWindow::new(SAVITZKY_GOLAY.len()),
            low_signal: LowSignalDetector::default(),
            last_normalized: 0.0,
        }
    }

    /// Filters one raw sample. Non-finite input repeats the last value.
    pub fn filter(&mut self, raw: f64) -> f64 {
        let raw = if raw.is_finite() {
            raw
        } else {
            trace!("Non-finite raw sample replaced by previous value");
            self.raw.last().copied().unwrap_or(0.0)
        };

        self.raw.push(raw);
        self.spread.push(raw);
        // Judged on the raw input; the smoothing stages below keep moving
        // for a dozen samples after the sensor goes flat.
        if self.low_signal.update(features::std_dev(self.spread.as_slice())) && self.low_signal.just_lost() {
            debug!(
                "Signal lost: raw spread < {} for {} samples",
                LOW_SIGNAL_THRESHOLD, LOW_SIGNAL_FRAMES
            );
        }

        let median = features::median(self.raw.as_slice());

        self.medians.push(median);
        let averaged = features::mean(self.medians.as_slice());

        let ema = match self.ema {
            Some(prev) => EMA_ALPHA * averaged + (1.0 - EMA_ALPHA) * prev,
            None => averaged,
        };
        self.ema = Some(ema);

        let baseline = match self.baseline {
            Some(prev) => prev * BASELINE_FACTOR + ema * (1.0 - BASELINE_FACTOR),
            None => ema,
        };
        self.baseline = Some(baseline);

        let normalized = ema - baseline;
        self.last_normalized = normalized;

        self.normalized.push(normalized);
        let threshold = features::std_dev(self.normalized.as_slice()) * DENOISE_THRESHOLD_FACTOR;
        let shrunk = if normalized.abs() < threshold {
            normalized * (normalized.abs() / threshold).max(MIN_ATTENUATION)
        } else {
            normalized
        };

        self.denoised.push(baseline + shrunk);
        if self.denoised.is_full() {
            self.denoised
                .iter()
                .zip(SAVITZKY_GOLAY.iter())
                .map(|(v, c)| v * c)
                .sum::<f64>()
                / SAVITZKY_GOLAY_NORM
        } else {
            features::mean(self.denoised.as_slice())
        }
    }

    /// True while the raw input has stayed flat for the required number of
    /// samples.
    pub fn signal_lost(&self) -> bool {
        self.low_signal.is_lost()
    }

    /// True only on the sample that starts a signal-loss episode.
    pub fn signal_just_lost(&self) -> bool {
        self.low_signal.just_lost()
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn last_normalized(&self) -> f64 {
        self.last_normalized
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}
