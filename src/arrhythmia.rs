//! Heart-rate-variability statistics and arrhythmia detection over the RR
//! intervals produced by the heart-rate estimator.
//!
//! The analyzer first learns a per-user baseline (RMSSD, mean and standard
//! deviation of RR) and then compares each short window of recent intervals
//! against it. Detections are counted on the rising edge of an irregular
//! window, or on a fresh extreme interval, and are rate-limited.
//!
//! A confidence score gates detection. Its first part is the stability of
//! the window's core beats (RMSSD, SD and mean) against the baseline, its
//! second the share of recent intervals that were physiologically
//! plausible. A rhythm too erratic or too noisy to judge is reported as
//! WEAK SIGNAL rather than as an arrhythmia.

use crate::config::ArrhythmiaConfig;
use crate::features;
use crate::window::SlidingWindow;
use log::{debug, info, trace};
use std::fmt;

/// Histogram bin width for the RR entropy metric (ms).
const ENTROPY_BIN_MS: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerPhase {
    Learning,
    Analyzing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhythmLabel {
    Learning,
    Normal,
    ArrhythmiaDetected,
    WeakSignal,
}

impl fmt::Display for RhythmLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RhythmLabel::Learning => "CALIBRATING...",
            RhythmLabel::Normal => "NORMAL RHYTHM",
            RhythmLabel::ArrhythmiaDetected => "ARRHYTHMIA DETECTED",
            RhythmLabel::WeakSignal => "WEAK SIGNAL",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrhythmiaEvent {
    pub timestamp_ms: u64,
    pub rmssd: f64,
    /// Relative deviation of the triggering interval from the window average.
    pub rr_variation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrhythmiaResult {
    pub label: RhythmLabel,
    pub count: u32,
    pub last_event: Option<ArrhythmiaEvent>,
}

impl ArrhythmiaResult {
    /// `"<LABEL>|<count>"`, the format consumed by display layers.
    pub fn status_string(&self) -> String {
        format!("{}|{}", self.label, self.count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RhythmBaseline {
    pub rmssd: f64,
    pub rr_mean: f64,
    pub rr_sd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HrvMetrics {
    pub mean_rr: f64,
    pub sdnn: f64,
    pub rmssd: f64,
    pub pnn50: f64,
    pub shannon_entropy: f64,
}

/// Root mean square of successive differences.
pub fn rmssd(intervals: &[f64]) -> f64 {
    if intervals.len() < 2 {
        return 0.0;
    }
    let sum_sq = intervals
        .windows(2)
        .map(|w| {
            let diff = w[1] - w[0];
            diff * diff
        })
        .sum::<f64>();
    (sum_sq / (intervals.len() - 1) as f64).sqrt()
}

/// Sample standard deviation of the intervals.
pub fn sdnn(intervals: &[f64]) -> f64 {
    if intervals.len() < 2 {
        return 0.0;
    }
    let mean_rr = features::mean(intervals);
    (intervals
        .iter()
        .map(|&x| {
            let diff = x - mean_rr;
            diff * diff
        })
        .sum::<f64>()
        / (intervals.len() - 1) as f64)
        .sqrt()
}

/// Percentage of successive differences larger than 50 ms.
pub fn pnn50(intervals: &[f64]) -> f64 {
    if intervals.len() < 2 {
        return 0.0;
    }
    let diffs = intervals.len() - 1;
    let nn50 = intervals
        .windows(2)
        .filter(|w| (w[1] - w[0]).abs() > 50.0)
        .count();
    nn50 as f64 / diffs as f64 * 100.0
}

/// Shannon entropy (bits) of the RR histogram.
pub fn shannon_entropy(intervals: &[f64]) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }
    let mut counts: std::collections::BTreeMap<i64, usize> = std::collections::BTreeMap::new();
    for &rr in intervals {
        *counts.entry((rr / ENTROPY_BIN_MS).floor() as i64).or_insert(0) += 1;
    }
    let n = intervals.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}

pub struct ArrhythmiaAnalyzer {
    config: ArrhythmiaConfig,
    phase: AnalyzerPhase,
    started_at: Option<u64>,
    learning: Vec<f64>,
    baseline: Option<RhythmBaseline>,
    history: SlidingWindow<f64>,
    attempts: SlidingWindow<bool>,
    stability: f64,
    irregular: bool,
    weak_signal: bool,
    count: u32,
    last_detection_at: Option<u64>,
    last_event: Option<ArrhythmiaEvent>,
    confidence: f64,
}

impl ArrhythmiaAnalyzer {
    pub fn new(config: ArrhythmiaConfig) -> Self {
        Self {
            phase: AnalyzerPhase::Learning,
            started_at: None,
            learning: Vec::with_capacity(config.learning_intervals),
            baseline: None,
            history: SlidingWindow::new(config.history_size),
            attempts: SlidingWindow::new(config.confidence_window),
            stability: 1.0,
            irregular: false,
            weak_signal: false,
            count: 0,
            last_detection_at: None,
            last_event: None,
            confidence: 0.0,
            config,
        }
    }

    /// Adds one RR interval that ended at `timestamp_ms`.
    pub fn push_interval(&mut self, rr_ms: f64, timestamp_ms: u64) -> ArrhythmiaResult {
        if !rr_ms.is_finite() || rr_ms < self.config.min_rr_ms || rr_ms > self.config.max_rr_ms {
            trace!("Ignoring implausible RR interval {:.0} ms", rr_ms);
            self.attempts.push(false);
            if self.phase == AnalyzerPhase::Analyzing {
                self.refresh_confidence();
            }
            return self.status(timestamp_ms);
        }
        self.attempts.push(true);

        let started_at = *self.started_at.get_or_insert(timestamp_ms);
        self.history.push(rr_ms);

        match self.phase {
            AnalyzerPhase::Learning => {
                self.learning.push(rr_ms);
                let elapsed = timestamp_ms.saturating_sub(started_at);
                let enough = self.learning.len() >= self.config.learning_intervals
                    || (elapsed >= self.config.learning_period_ms
                        && self.learning.len() >= self.config.min_learning_intervals);
                if enough {
                    self.finish_learning();
                }
            }
            AnalyzerPhase::Analyzing => self.analyze(rr_ms, timestamp_ms),
        }

        self.status(timestamp_ms)
    }

    fn finish_learning(&mut self) {
        let rr_mean = features::mean(&self.learning);
        let baseline = RhythmBaseline {
            rmssd: rmssd(&self.learning).max(self.config.min_baseline_rmssd_ms),
            rr_mean,
            rr_sd: features::std_dev(&self.learning)
                .max(rr_mean * self.config.min_baseline_sd_fraction),
        };
        debug!(
            "Rhythm baseline learned from {} intervals: rmssd {:.1}, mean {:.1}, sd {:.1}",
            self.learning.len(),
            baseline.rmssd,
            baseline.rr_mean,
            baseline.rr_sd
        );
        self.baseline = Some(baseline);
        self.learning.clear();
        self.phase = AnalyzerPhase::Analyzing;
    }

    fn analyze(&mut self, rr_ms: f64, timestamp_ms: u64) {
        let Some(baseline) = self.baseline else {
            return;
        };
        let history = self.history.as_slice();
        let start = history.len().saturating_sub(self.config.analysis_window);
        let window = &history[start..];
        if window.len() < self.config.min_analysis_intervals {
            return;
        }

        let window_rmssd = rmssd(window);
        let window_mean = features::mean(window);
        let window_sd = features::std_dev(window);
        let previous_avg = features::mean(&window[..window.len() - 1]);
        let rr_variation = if previous_avg > 0.0 {
            (rr_ms - previous_avg) / previous_avg
        } else {
            0.0
        };
        let outlier = previous_avg > 0.0
            && (rr_ms < previous_avg * self.config.outlier_low
                || rr_ms > previous_avg * self.config.outlier_high);

        let irregular = window_rmssd > baseline.rmssd * self.config.rmssd_factor
            || (window_mean - baseline.rr_mean).abs() > baseline.rr_sd * self.config.mean_sd_factor
            || window_sd > baseline.rr_sd * self.config.sd_factor
            || outlier;

        self.stability = self.window_stability(window, &baseline);
        self.refresh_confidence();
        if self.weak_signal {
            trace!("Rhythm confidence {:.2} too low, skipping detection", self.confidence);
            return;
        }

        let fresh = irregular && (!self.irregular || outlier);
        let rate_ok = self.last_detection_at.map_or(true, |t| {
            timestamp_ms.saturating_sub(t) >= self.config.min_time_between_arrhythmias_ms
        });
        if fresh && rate_ok {
            self.count += 1;
            self.last_detection_at = Some(timestamp_ms);
            self.last_event = Some(ArrhythmiaEvent {
                timestamp_ms,
                rmssd: window_rmssd,
                rr_variation,
            });
            info!(
                "Arrhythmia #{} at {} ms (rmssd {:.1}, rr variation {:+.2})",
                self.count, timestamp_ms, window_rmssd, rr_variation
            );
        }
        self.irregular = irregular;
    }

    /// How closely the window's core beats match the baseline, in [0, 1].
    /// Intervals far from the window median are left to the outlier check,
    /// so one ectopic beat does not read as an unstable signal.
    fn window_stability(&self, window: &[f64], baseline: &RhythmBaseline) -> f64 {
        let median = features::median(window);
        let core: Vec<f64> = window
            .iter()
            .copied()
            .filter(|&rr| rr >= median * self.config.outlier_low && rr <= median * self.config.outlier_high)
            .collect();
        if core.len() * 2 < window.len() {
            return 0.0;
        }
        let closeness = |observed: f64, limit: f64| if observed <= limit { 1.0 } else { limit / observed };
        let rmssd_score = closeness(rmssd(&core), baseline.rmssd * self.config.rmssd_factor);
        let sd_score = closeness(features::std_dev(&core), baseline.rr_sd * self.config.sd_factor);
        let mean_score = closeness(
            (features::mean(&core) - baseline.rr_mean).abs(),
            baseline.rr_sd * self.config.mean_sd_factor,
        );
        (rmssd_score + sd_score + mean_score) / 3.0
    }

    fn refresh_confidence(&mut self) {
        let attempts = self.attempts.as_slice();
        let plausible = if attempts.is_empty() {
            1.0
        } else {
            attempts.iter().filter(|&&ok| ok).count() as f64 / attempts.len() as f64
        };
        self.confidence = (plausible * self.stability).clamp(0.0, 1.0);
        let weak = self.confidence < self.config.min_confidence;
        if weak && !self.weak_signal {
            debug!("Rhythm confidence dropped to {:.2}", self.confidence);
        }
        self.weak_signal = weak;
    }

    /// Current status at `timestamp_ms`; a detection label decays back to
    /// normal once the grace period passes without a new detection.
    pub fn status(&self, timestamp_ms: u64) -> ArrhythmiaResult {
        let label = match self.phase {
            AnalyzerPhase::Learning => RhythmLabel::Learning,
            AnalyzerPhase::Analyzing if self.weak_signal => RhythmLabel::WeakSignal,
            AnalyzerPhase::Analyzing => match self.last_detection_at {
                Some(t) if timestamp_ms.saturating_sub(t) < self.config.grace_period_ms => {
                    RhythmLabel::ArrhythmiaDetected
                }
                _ => RhythmLabel::Normal,
            },
        };
        ArrhythmiaResult {
            label,
            count: self.count,
            last_event: self.last_event,
        }
    }

    pub fn metrics(&self) -> HrvMetrics {
        let intervals = self.history.as_slice();
        HrvMetrics {
            mean_rr: features::mean(intervals),
            sdnn: sdnn(intervals),
            rmssd: rmssd(intervals),
            pnn50: pnn50(intervals),
            shannon_entropy: shannon_entropy(intervals),
        }
    }

    pub fn phase(&self) -> AnalyzerPhase {
        self.phase
    }

    pub fn baseline(&self) -> Option<RhythmBaseline> {
        self.baseline
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_learning() -> ArrhythmiaConfig {
        ArrhythmiaConfig {
            learning_intervals: 3,
            ..ArrhythmiaConfig::default()
        }
    }

    fn feed(analyzer: &mut ArrhythmiaAnalyzer, intervals: &[f64]) -> Vec<ArrhythmiaResult> {
        let mut t = 0u64;
        intervals
            .iter()
            .map(|&rr| {
                t += rr as u64;
                analyzer.push_interval(rr, t)
            })
            .collect()
    }

    #[test]
    fn hrv_statistics() {
        let rr = [800.0, 810.0, 790.0, 800.0];
        let expected = ((100.0 + 400.0 + 100.0) / 3.0f64).sqrt();
        assert!((rmssd(&rr) - expected).abs() < 1e-9);
        assert_eq!(pnn50(&rr), 0.0);
        assert_eq!(pnn50(&[800.0, 900.0]), 100.0);
        assert_eq!(rmssd(&[800.0]), 0.0);
        assert!(sdnn(&rr) > 0.0);
    }

    #[test]
    fn entropy_is_zero_for_constant_rhythm() {
        assert_eq!(shannon_entropy(&[800.0; 10]), 0.0);
        let mixed = shannon_entropy(&[700.0, 800.0, 900.0, 1000.0]);
        assert!((mixed - 2.0).abs() < 1e-9);
    }

    #[test]
    fn learns_baseline_before_analyzing() {
        let mut analyzer = ArrhythmiaAnalyzer::new(quick_learning());
        let results = feed(&mut analyzer, &[800.0, 820.0]);
        assert_eq!(results[1].label, RhythmLabel::Learning);
        assert_eq!(results[1].status_string(), "CALIBRATING...|0");
        feed(&mut analyzer, &[810.0]);
        assert_eq!(analyzer.phase(), AnalyzerPhase::Analyzing);
        let baseline = analyzer.baseline().unwrap();
        assert!((baseline.rr_mean - 810.0).abs() < 1e-9);
        assert!(baseline.rmssd >= 20.0);
    }

    #[test]
    fn single_long_interval_is_one_detection() {
        let mut analyzer = ArrhythmiaAnalyzer::new(quick_learning());
        let results = feed(&mut analyzer, &[800.0, 800.0, 800.0, 1400.0, 800.0, 800.0]);
        assert_eq!(results[2].count, 0);
        assert_eq!(results[3].count, 1);
        assert_eq!(results[3].label, RhythmLabel::ArrhythmiaDetected);
        assert_eq!(results[3].status_string(), "ARRHYTHMIA DETECTED|1");
        let event = results[3].last_event.unwrap();
        assert_eq!(event.timestamp_ms, 3800);
        assert!(event.rr_variation > 0.7);
        assert_eq!(results[5].count, 1);
    }

    #[test]
    fn regular_rhythm_stays_normal() {
        let mut analyzer = ArrhythmiaAnalyzer::new(quick_learning());
        let rr: Vec<f64> = (0..30).map(|i| 800.0 + if i % 2 == 0 { 10.0 } else { -10.0 }).collect();
        let results = feed(&mut analyzer, &rr);
        let last = results.last().unwrap();
        assert_eq!(last.count, 0);
        assert_eq!(last.label, RhythmLabel::Normal);
    }

    #[test]
    fn detections_are_rate_limited() {
        let config = ArrhythmiaConfig {
            min_time_between_arrhythmias_ms: 1500,
            ..quick_learning()
        };
        let mut analyzer = ArrhythmiaAnalyzer::new(config);
        let mut rr = vec![800.0; 3];
        rr.extend((0..20).map(|i| if i % 2 == 0 { 500.0 } else { 1200.0 }));

        let mut t = 0u64;
        let mut detections = Vec::new();
        let mut previous = 0;
        for &interval in &rr {
            t += interval as u64;
            let result = analyzer.push_interval(interval, t);
            if result.count > previous {
                detections.push(t);
                previous = result.count;
            }
        }
        assert!(!detections.is_empty());
        for pair in detections.windows(2) {
            assert!(pair[1] - pair[0] >= 1500);
        }
    }

    #[test]
    fn detection_label_decays_after_grace_period() {
        let mut analyzer = ArrhythmiaAnalyzer::new(quick_learning());
        feed(&mut analyzer, &[800.0, 800.0, 800.0, 1400.0]);
        assert_eq!(analyzer.status(4000).label, RhythmLabel::ArrhythmiaDetected);
        let later = analyzer.status(3800 + 3000);
        assert_eq!(later.label, RhythmLabel::Normal);
        assert_eq!(later.status_string(), "NORMAL RHYTHM|1");
    }

    #[test]
    fn single_ectopic_beat_keeps_full_confidence() {
        let mut analyzer = ArrhythmiaAnalyzer::new(quick_learning());
        let results = feed(&mut analyzer, &[800.0, 800.0, 800.0, 1400.0, 800.0, 800.0]);
        assert!(results[3..].iter().all(|r| r.label != RhythmLabel::WeakSignal));
        assert_eq!(analyzer.confidence(), 1.0);
    }

    #[test]
    fn erratic_intervals_report_weak_signal() {
        let mut analyzer = ArrhythmiaAnalyzer::new(quick_learning());
        let mut rr = vec![800.0; 3];
        // Spread over the whole plausible range, 300..=1500 ms.
        rr.extend((0..200u64).map(|i| 300.0 + ((i * 7919) % 1201) as f64));
        let results = feed(&mut analyzer, &rr);

        let weak: Vec<usize> = (1..results.len())
            .filter(|&i| results[i].label == RhythmLabel::WeakSignal)
            .collect();
        assert!(!weak.is_empty(), "erratic rhythm never flagged");
        for &i in &weak {
            assert_eq!(results[i].count, results[i - 1].count);
            assert!(results[i].status_string().starts_with("WEAK SIGNAL|"));
        }
    }

    #[test]
    fn rejected_intervals_lower_confidence_until_recovery() {
        let mut analyzer = ArrhythmiaAnalyzer::new(quick_learning());
        feed(&mut analyzer, &[800.0; 5]);
        assert_eq!(analyzer.status(4000).label, RhythmLabel::Normal);

        let mut t = 4000;
        for _ in 0..5 {
            t += 200;
            analyzer.push_interval(200.0, t);
        }
        assert!(analyzer.confidence() < 0.5);
        assert_eq!(analyzer.status(t).label, RhythmLabel::WeakSignal);

        for _ in 0..4 {
            t += 800;
            analyzer.push_interval(800.0, t);
        }
        assert_eq!(analyzer.status(t).label, RhythmLabel::Normal);
        assert_eq!(analyzer.count(), 0);
    }

    #[test]
    fn implausible_intervals_are_ignored() {
        let mut analyzer = ArrhythmiaAnalyzer::new(quick_learning());
        analyzer.push_interval(100.0, 100);
        analyzer.push_interval(f64::NAN, 200);
        analyzer.push_interval(5000.0, 5200);
        assert_eq!(analyzer.metrics(), HrvMetrics::default());
        assert_eq!(analyzer.phase(), AnalyzerPhase::Learning);
    }
}
