//! Real-time heart-rate estimation from filtered PPG samples.
//!
//! Peaks are detected on the falling edge of each pulse: a sample becomes a
//! candidate once the signal turns down while still well above its baseline,
//! and the candidate is confirmed after two consecutive decreasing steps,
//! outside the refractory period and past the warmup phase. Detection
//! thresholds retune themselves every `tuning_peak_window` confirmed peaks.

use crate::config::HeartRateConfig;
use crate::features;
use crate::preprocessing::LowSignalDetector;
use crate::window::SlidingWindow;
use log::{debug, trace};

/// Number of trailing values inspected for the descending-edge confirmation.
const CONFIRMATION_DEPTH: usize = 3;

/// Candidates must still sit at or above this fraction of the baseline.
const BASELINE_GUARD: f64 = 0.98;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    Warmup,
    Detecting,
    Candidate,
}

/// A confirmed beat. Only lives for the duration of one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakEvent {
    pub timestamp_ms: u64,
    pub amplitude: f64,
    pub confidence: f64,
    pub derivative: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartRateResult {
    /// Smoothed BPM, zero until the first valid interval.
    pub bpm: f64,
    pub confidence: f64,
    pub is_peak: bool,
    /// RR interval closed by this peak, when it passed the range checks.
    pub rr_interval_ms: Option<f64>,
}

impl HeartRateResult {
    fn idle(bpm: f64) -> Self {
        Self {
            bpm,
            confidence: 0.0,
            is_peak: false,
            rr_interval_ms: None,
        }
    }
}

/// Detection thresholds that adapt to the user's signal strength.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveThresholds {
    pub signal: f64,
    pub min_confidence: f64,
    pub derivative: f64,
}

impl AdaptiveThresholds {
    fn defaults(config: &HeartRateConfig) -> Self {
        Self {
            signal: config.signal_threshold,
            min_confidence: config.min_confidence,
            derivative: config.derivative_threshold,
        }
    }
}

pub struct HeartRateEstimator {
    config: HeartRateConfig,
    started_at: Option<u64>,
    phase: DetectorPhase,
    baseline: Option<f64>,
    previous_value: Option<f64>,
    confirmation: SlidingWindow<f64>,
    peak_armed: bool,
    /// Start of the next RR interval; cleared on signal loss.
    previous_peak_at: Option<u64>,
    /// Refractory reference; survives signal-loss resets.
    last_confirmed_at: Option<u64>,
    amplitudes: SlidingWindow<f64>,
    tuning_window: Vec<PeakEvent>,
    bpm_history: SlidingWindow<f64>,
    rr_intervals: SlidingWindow<f64>,
    smoothed_bpm: Option<f64>,
    thresholds: AdaptiveThresholds,
    low_signal: LowSignalDetector,
    confirmed_peaks: usize,
}

impl HeartRateEstimator {
    pub fn new(config: HeartRateConfig) -> Self {
        Self {
            started_at: None,
            phase: DetectorPhase::Warmup,
            baseline: None,
            previous_value: None,
            confirmation: SlidingWindow::new(CONFIRMATION_DEPTH),
            peak_armed: false,
            previous_peak_at: None,
            last_confirmed_at: None,
            amplitudes: SlidingWindow::new(config.peak_validation_window),
            tuning_window: Vec::with_capacity(config.tuning_peak_window),
            bpm_history: SlidingWindow::new(config.bpm_history_size),
            rr_intervals: SlidingWindow::new(config.bpm_history_size),
            smoothed_bpm: None,
            thresholds: AdaptiveThresholds::defaults(&config),
            low_signal: LowSignalDetector::new(config.low_signal_threshold, config.low_signal_frames),
            confirmed_peaks: 0,
            config,
        }
    }

    /// Feeds one filtered sample taken at `timestamp_ms`.
    pub fn process(&mut self, value: f64, timestamp_ms: u64) -> HeartRateResult {
        let current_bpm = self.bpm();
        if !value.is_finite() {
            return HeartRateResult::idle(current_bpm);
        }

        let started_at = *self.started_at.get_or_insert(timestamp_ms);
        let (baseline, last_value, derivative) = self.track(value);
        let normalized = value - baseline;

        if self.low_signal.update(derivative) {
            if self.low_signal.just_lost() {
                debug!(
                    "Low signal for {} samples, resetting peak detection",
                    self.config.low_signal_frames
                );
            }
            return self.lose_signal();
        }

        self.confirmation.push(value);
        if derivative > 0.0 {
            self.peak_armed = true;
        }

        if timestamp_ms.saturating_sub(started_at) < self.config.warmup_ms {
            self.phase = DetectorPhase::Warmup;
            return HeartRateResult::idle(current_bpm);
        }
        if self.phase == DetectorPhase::Warmup {
            debug!("Heart-rate warmup finished at {} ms", timestamp_ms);
            self.phase = DetectorPhase::Detecting;
        }

        let last_value = last_value.unwrap_or(value);
        let is_candidate = derivative < self.thresholds.derivative
            && normalized > self.thresholds.signal
            && last_value >= BASELINE_GUARD * baseline;
        if !is_candidate {
            if self.phase == DetectorPhase::Candidate && derivative >= 0.0 {
                self.phase = DetectorPhase::Detecting;
            }
            return HeartRateResult::idle(current_bpm);
        }
        self.phase = DetectorPhase::Candidate;

        let confidence = self.peak_confidence(normalized, derivative);
        let refractory_elapsed = self
            .last_confirmed_at
            .map_or(true, |t| timestamp_ms.saturating_sub(t) >= self.config.min_peak_time_ms);
        if !(self.peak_armed
            && confidence >= self.thresholds.min_confidence
            && self.is_descending()
            && refractory_elapsed)
        {
            return HeartRateResult {
                bpm: current_bpm,
                confidence,
                is_peak: false,
                rr_interval_ms: None,
            };
        }

        // The first buffered value is the highest point of the descent.
        let amplitude = self.confirmation.as_slice()[0] - baseline;
        self.peak_armed = false;
        self.phase = DetectorPhase::Detecting;
        if !self.validate_amplitude(amplitude) {
            trace!(
                "Rejected peak at {} ms: amplitude {:.3} below recent average",
                timestamp_ms,
                amplitude
            );
            return HeartRateResult {
                bpm: current_bpm,
                confidence,
                is_peak: false,
                rr_interval_ms: None,
            };
        }

        let event = PeakEvent {
            timestamp_ms,
            amplitude,
            confidence,
            derivative,
        };
        let rr_interval_ms = self.confirm_peak(event);

        HeartRateResult {
            bpm: self.bpm(),
            confidence,
            is_peak: true,
            rr_interval_ms,
        }
    }

    /// Signal loss detected upstream of the estimator: `value` still feeds
    /// the baseline, but detection is reset and the BPM decays.
    pub fn hold_signal_loss(&mut self, value: f64) -> HeartRateResult {
        if value.is_finite() {
            self.track(value);
        }
        self.lose_signal()
    }

    /// Updates the running baseline and returns it with the previous value
    /// and the sample-to-sample derivative.
    fn track(&mut self, value: f64) -> (f64, Option<f64>, f64) {
        let factor = self.config.baseline_factor;
        let baseline = match self.baseline {
            Some(b) => b * factor + value * (1.0 - factor),
            None => value,
        };
        self.baseline = Some(baseline);
        let last_value = self.previous_value.replace(value);
        let derivative = last_value.map(|prev| value - prev).unwrap_or(0.0);
        (baseline, last_value, derivative)
    }

    fn lose_signal(&mut self) -> HeartRateResult {
        self.reset_detection();
        self.decay_bpm();
        HeartRateResult::idle(self.bpm())
    }

    fn is_descending(&self) -> bool {
        let values = self.confirmation.as_slice();
        values.len() == CONFIRMATION_DEPTH && values.windows(2).all(|w| w[0] > w[1])
    }

    fn peak_confidence(&self, normalized: f64, derivative: f64) -> f64 {
        let amplitude_score = (normalized / (self.thresholds.signal * 2.0)).clamp(0.0, 1.0);
        let slope_score = if self.thresholds.derivative < 0.0 {
            (derivative / self.thresholds.derivative).clamp(0.0, 1.0)
        } else {
            1.0
        };
        (0.7 * amplitude_score + 0.3 * slope_score).clamp(0.0, 1.0)
    }

    /// Second gate against isolated spurious peaks: once enough history
    /// exists, the amplitude must reach the recent mean divided by the
    /// validation ratio. Every checked amplitude enters the history so the
    /// gate follows a genuinely weakening signal.
    fn validate_amplitude(&mut self, amplitude: f64) -> bool {
        let accepted = if self.amplitudes.is_full() {
            let recent = features::mean(self.amplitudes.as_slice());
            amplitude * self.config.peak_validation_ratio >= recent
        } else {
            true
        };
        self.amplitudes.push(amplitude);
        accepted
    }

    fn confirm_peak(&mut self, event: PeakEvent) -> Option<f64> {
        self.last_confirmed_at = Some(event.timestamp_ms);
        self.confirmed_peaks += 1;
        trace!(
            "Peak confirmed at {} ms (amplitude {:.3}, confidence {:.2})",
            event.timestamp_ms,
            event.amplitude,
            event.confidence
        );

        let rr = self
            .previous_peak_at
            .replace(event.timestamp_ms)
            .map(|prev| event.timestamp_ms.saturating_sub(prev) as f64);

        let accepted_rr = rr.and_then(|interval| {
            let max_interval = 60_000.0 / self.config.min_bpm;
            if interval < self.config.min_peak_time_ms as f64 || interval > max_interval {
                trace!("RR interval {:.0} ms outside valid range", interval);
                return None;
            }
            let instantaneous = 60_000.0 / interval;
            if instantaneous < self.config.min_bpm || instantaneous > self.config.max_bpm {
                return None;
            }
            self.bpm_history.push(instantaneous);
            self.rr_intervals.push(interval);
            let median = features::median(self.bpm_history.as_slice());
            let alpha = self.config.bpm_ema_alpha;
            self.smoothed_bpm = Some(match self.smoothed_bpm {
                Some(s) => s * (1.0 - alpha) + median * alpha,
                None => median,
            });
            Some(interval)
        });

        self.tuning_window.push(event);
        if self.tuning_window.len() >= self.config.tuning_peak_window {
            self.tune_thresholds();
            self.tuning_window.clear();
        }

        accepted_rr
    }

    fn tune_thresholds(&mut self) {
        let n = self.tuning_window.len() as f64;
        if n == 0.0 {
            return;
        }
        let mean_amplitude = self.tuning_window.iter().map(|p| p.amplitude).sum::<f64>() / n;
        let mean_confidence = self.tuning_window.iter().map(|p| p.confidence).sum::<f64>() / n;
        let mean_derivative = self.tuning_window.iter().map(|p| p.derivative).sum::<f64>() / n;

        let rate = self.config.tuning_learning_rate;
        let blend = |current: f64, target: f64| current + rate * (target - current);
        let t = &mut self.thresholds;

        t.signal = blend(t.signal, mean_amplitude * 0.6)
            .clamp(self.config.min_signal_threshold, self.config.max_signal_threshold);

        let confidence_target = if mean_confidence > t.min_confidence + 0.1 {
            t.min_confidence + 0.02
        } else {
            t.min_confidence - 0.02
        };
        t.min_confidence = blend(t.min_confidence, confidence_target)
            .clamp(self.config.min_confidence_floor, self.config.min_confidence_ceiling);

        t.derivative = blend(t.derivative, mean_derivative * 0.5)
            .clamp(self.config.min_derivative_threshold, self.config.max_derivative_threshold);

        debug!(
            "Adaptive tuning after {} peaks: signal {:.4}, min confidence {:.3}, derivative {:.4}",
            self.confirmed_peaks, t.signal, t.min_confidence, t.derivative
        );
    }

    fn decay_bpm(&mut self) {
        self.smoothed_bpm = self
            .smoothed_bpm
            .map(|bpm| bpm * self.config.low_signal_bpm_decay)
            .filter(|bpm| *bpm >= 1.0);
    }

    /// Clears per-peak state and reverts the adaptive thresholds. BPM history
    /// and the refractory reference are kept.
    pub fn reset_detection(&mut self) {
        self.confirmation.clear();
        self.amplitudes.clear();
        self.tuning_window.clear();
        self.previous_peak_at = None;
        self.peak_armed = false;
        self.thresholds = AdaptiveThresholds::defaults(&self.config);
        if self.phase == DetectorPhase::Candidate {
            self.phase = DetectorPhase::Detecting;
        }
    }

    /// Discards all state, including the warmup clock.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    pub fn bpm(&self) -> f64 {
        self.smoothed_bpm.unwrap_or(0.0)
    }

    pub fn smoothed_bpm(&self) -> Option<f64> {
        self.smoothed_bpm
    }

    /// End-of-session heart rate: mean of the BPM history after trimming the
    /// top and bottom fifth.
    pub fn get_final_bpm(&self) -> Option<f64> {
        features::trimmed_mean(self.bpm_history.as_slice(), self.config.final_trim_fraction)
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    pub fn thresholds(&self) -> AdaptiveThresholds {
        self.thresholds
    }

    pub fn confirmation_buffer_len(&self) -> usize {
        self.confirmation.len()
    }

    pub fn last_peak_time(&self) -> Option<u64> {
        self.previous_peak_at
    }

    pub fn rr_intervals(&self) -> &[f64] {
        self.rr_intervals.as_slice()
    }

    pub fn bpm_history(&self) -> &[f64] {
        self.bpm_history.as_slice()
    }

    pub fn confirmed_peaks(&self) -> usize {
        self.confirmed_peaks
    }

    pub fn signal_lost(&self) -> bool {
        self.low_signal.is_lost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const FS: f64 = 30.0;

    fn timestamp(i: usize) -> u64 {
        (i as f64 * 1000.0 / FS).round() as u64
    }

    fn pulse(i: usize, bpm: f64, amplitude: f64) -> f64 {
        amplitude * (2.0 * PI * bpm / 60.0 * i as f64 / FS).sin()
    }

    fn run_sine(estimator: &mut HeartRateEstimator, samples: usize, bpm: f64) -> Vec<HeartRateResult> {
        (0..samples)
            .map(|i| estimator.process(pulse(i, bpm, 10.0), timestamp(i)))
            .collect()
    }

    #[test]
    fn no_peaks_during_warmup() {
        let mut estimator = HeartRateEstimator::new(HeartRateConfig::default());
        let results = run_sine(&mut estimator, 89, 75.0);
        assert!(results.iter().all(|r| !r.is_peak));
        assert_eq!(estimator.phase(), DetectorPhase::Warmup);
    }

    #[test]
    fn converges_to_sine_rate() {
        let mut estimator = HeartRateEstimator::new(HeartRateConfig::default());
        let results = run_sine(&mut estimator, 390, 75.0);
        let peaks = results.iter().filter(|r| r.is_peak).count();
        assert!(peaks >= 10, "only {peaks} peaks confirmed");
        let bpm = results.last().unwrap().bpm;
        assert!((bpm - 75.0).abs() <= 3.0, "bpm = {bpm}");
        let final_bpm = estimator.get_final_bpm().unwrap();
        assert!((final_bpm - 75.0).abs() <= 3.0);
    }

    #[test]
    fn refractory_period_is_respected() {
        let mut estimator = HeartRateEstimator::new(HeartRateConfig::default());
        // Fast, noisy signal: 150 BPM carrier plus a harmonic.
        let mut peak_times = Vec::new();
        for i in 0..900 {
            let v = pulse(i, 150.0, 6.0) + pulse(i, 330.0, 2.0);
            if estimator.process(v, timestamp(i)).is_peak {
                peak_times.push(timestamp(i));
            }
        }
        assert!(!peak_times.is_empty());
        for pair in peak_times.windows(2) {
            assert!(pair[1] - pair[0] >= 600, "peaks {} ms apart", pair[1] - pair[0]);
        }
    }

    #[test]
    fn flat_signal_resets_detection_and_decays_bpm() {
        let mut estimator = HeartRateEstimator::new(HeartRateConfig::default());
        run_sine(&mut estimator, 300, 75.0);
        let before = estimator.bpm();
        assert!(before > 0.0);

        let mut last = None;
        for i in 300..315 {
            last = Some(estimator.process(0.0, timestamp(i)));
        }
        let last = last.unwrap();
        assert!(!last.is_peak);
        assert!(estimator.signal_lost());
        assert_eq!(estimator.confirmation_buffer_len(), 0);
        assert_eq!(estimator.last_peak_time(), None);
        assert!(last.bpm < before, "bpm did not decay: {} -> {}", before, last.bpm);
        assert_eq!(
            estimator.thresholds(),
            AdaptiveThresholds::defaults(&HeartRateConfig::default())
        );
    }

    #[test]
    fn upstream_signal_loss_clears_detection_state() {
        let mut estimator = HeartRateEstimator::new(HeartRateConfig::default());
        run_sine(&mut estimator, 300, 75.0);
        let before = estimator.bpm();
        assert!(estimator.confirmation_buffer_len() > 0);

        let held = estimator.hold_signal_loss(3.0);
        assert!(!held.is_peak);
        assert_eq!(held.rr_interval_ms, None);
        assert_eq!(estimator.confirmation_buffer_len(), 0);
        assert_eq!(estimator.last_peak_time(), None);
        assert!((held.bpm - before * 0.85).abs() < 1e-9);
        assert!(estimator.hold_signal_loss(f64::NAN).bpm < held.bpm);
    }

    #[test]
    fn adaptive_tuning_moves_thresholds_toward_signal() {
        let config = HeartRateConfig {
            tuning_peak_window: 5,
            ..HeartRateConfig::default()
        };
        let initial = AdaptiveThresholds::defaults(&config);
        let mut estimator = HeartRateEstimator::new(config);
        run_sine(&mut estimator, 600, 75.0);
        let tuned = estimator.thresholds();
        assert!(tuned.signal > initial.signal);
        assert!(tuned.derivative < initial.derivative);
        assert!(tuned.min_confidence >= 0.3 && tuned.min_confidence <= 0.8);
    }

    #[test]
    fn validation_gate_rejects_weak_stray_peak() {
        let config = HeartRateConfig::default();
        let mut estimator = HeartRateEstimator::new(config);
        for _ in 0..5 {
            assert!(estimator.validate_amplitude(10.0));
        }
        assert!(!estimator.validate_amplitude(5.0));
        assert!(estimator.validate_amplitude(9.0));
    }

    #[test]
    fn out_of_range_intervals_never_reach_history() {
        let mut estimator = HeartRateEstimator::new(HeartRateConfig::default());
        // 30 BPM is below the accepted range.
        run_sine(&mut estimator, 900, 30.0);
        assert!(estimator.bpm_history().is_empty());
        assert_eq!(estimator.bpm(), 0.0);
        assert_eq!(estimator.get_final_bpm(), None);
    }

    #[test]
    fn reset_restarts_warmup() {
        let mut estimator = HeartRateEstimator::new(HeartRateConfig::default());
        run_sine(&mut estimator, 300, 75.0);
        estimator.reset();
        assert_eq!(estimator.bpm(), 0.0);
        assert_eq!(estimator.phase(), DetectorPhase::Warmup);
        assert!(estimator.bpm_history().is_empty());
    }
}
