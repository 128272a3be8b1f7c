//! Stateless feature extraction over windows of filtered PPG samples.
//!
//! Every function here is total: a window too short for the requested
//! feature yields zero, an empty vector or `None` instead of panicking.

use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

/// Minimum distance, in samples, between two detected peaks or valleys.
pub const MIN_EVENT_DISTANCE: usize = 15;

/// Fraction of the signal range a peak must clear above the window minimum.
pub const PEAK_THRESHOLD_FRACTION: f64 = 0.3;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values
        .iter()
        .map(|&x| {
            let diff = x - m;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Mean after dropping `fraction` of the values from each end of the sorted list.
pub fn trimmed_mean(values: &[f64], fraction: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let cut = (sorted.len() as f64 * fraction.clamp(0.0, 0.49)).floor() as usize;
    let kept = &sorted[cut..sorted.len() - cut];
    if kept.is_empty() {
        return None;
    }
    Some(mean(kept))
}

/// Time-weighted average of `(timestamp_ms, value)` points in arrival order.
/// Weights rise linearly from 1 at the oldest point to 2 at the newest.
pub fn time_weighted_average(points: &[(u64, f64)]) -> Option<f64> {
    let (first, last) = (points.first()?.0, points.last()?.0);
    let span = last.saturating_sub(first).max(1) as f64;
    let (sum, weights) = points.iter().fold((0.0, 0.0), |(sum, weights), &(t, v)| {
        let w = 1.0 + t.saturating_sub(first) as f64 / span;
        (sum + v * w, weights + w)
    });
    Some(sum / weights)
}

/// Coefficient of variation (std / |mean|); zero for a zero-mean window.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m.abs() < f64::EPSILON {
        return 0.0;
    }
    std_dev(values) / m.abs()
}

fn find_extrema(signal: &[f64], min_distance: usize, threshold_fraction: f64, maxima: bool) -> Vec<usize> {
    if signal.len() < 3 {
        return Vec::new();
    }
    let min = signal.iter().copied().fold(f64::INFINITY, f64::min);
    let max = signal.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if !range.is_finite() || range <= f64::EPSILON {
        return Vec::new();
    }

    // Work on a sign-flipped view for valleys so the same comparisons apply.
    let value = |i: usize| if maxima { signal[i] } else { -signal[i] };
    let threshold = if maxima {
        min + threshold_fraction * range
    } else {
        -(max - threshold_fraction * range)
    };

    let mut events: Vec<usize> = Vec::new();
    for i in 1..signal.len() - 1 {
        let v = value(i);
        if v > value(i - 1) && v >= value(i + 1) && v > threshold {
            match events.last().copied() {
                Some(prev) if i - prev < min_distance => {
                    if v > value(prev) {
                        events.pop();
                        events.push(i);
                    }
                }
                _ => events.push(i),
            }
        }
    }
    events
}

/// Local maxima above `min + threshold_fraction * range`, at least
/// `min_distance` samples apart. Within the distance the higher one wins.
pub fn find_peaks(signal: &[f64], min_distance: usize, threshold_fraction: f64) -> Vec<usize> {
    find_extrema(signal, min_distance, threshold_fraction, true)
}

/// Local minima below `max - threshold_fraction * range`, at least
/// `min_distance` samples apart. Within the distance the lower one wins.
pub fn find_valleys(signal: &[f64], min_distance: usize, threshold_fraction: f64) -> Vec<usize> {
    find_extrema(signal, min_distance, threshold_fraction, false)
}

/// Pulsatile component: peak-to-trough span of the window.
pub fn ac_component(signal: &[f64]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let min = signal.iter().copied().fold(f64::INFINITY, f64::min);
    let max = signal.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    max - min
}

pub fn dc_component(signal: &[f64]) -> f64 {
    mean(signal)
}

pub fn perfusion_index(signal: &[f64]) -> f64 {
    let dc = dc_component(signal);
    if dc.abs() < f64::EPSILON {
        return 0.0;
    }
    ac_component(signal) / dc.abs()
}

/// Mean inter-peak interval converted to milliseconds; zero with fewer than two peaks.
pub fn pulse_transit_time(peaks: &[usize], sample_rate: f64) -> f64 {
    if peaks.len() < 2 || sample_rate <= 0.0 {
        return 0.0;
    }
    let intervals: Vec<f64> = peaks
        .windows(2)
        .map(|w| (w[1] - w[0]) as f64 * 1000.0 / sample_rate)
        .collect();
    mean(&intervals)
}

/// Locates the dicrotic notch after `peak` as the first negative-to-positive
/// sign change of the second derivative, searching at most `max_span` samples.
pub fn dicrotic_notch(signal: &[f64], peak: usize, max_span: usize) -> Option<usize> {
    if peak + 3 >= signal.len() {
        return None;
    }
    let end = (peak + max_span).min(signal.len() - 1);
    let second = |i: usize| signal[i + 1] - 2.0 * signal[i] + signal[i - 1];
    let mut prev = second(peak + 1);
    for i in peak + 2..end {
        let d2 = second(i);
        if prev < 0.0 && d2 >= 0.0 {
            return Some(i);
        }
        prev = d2;
    }
    None
}

/// One-sided power spectrum of a mean-removed window.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub power: Vec<f64>,
    /// Width of one bin in Hz.
    pub bin_hz: f64,
}

impl Spectrum {
    /// Total power between `low_hz` and `high_hz` inclusive.
    pub fn band_power(&self, low_hz: f64, high_hz: f64) -> f64 {
        if self.power.is_empty() || self.bin_hz <= 0.0 || high_hz < low_hz {
            return 0.0;
        }
        let lo = (low_hz / self.bin_hz).ceil().max(0.0) as usize;
        let hi = ((high_hz / self.bin_hz).floor() as usize).min(self.power.len() - 1);
        if lo > hi {
            return 0.0;
        }
        self.power[lo..=hi].iter().sum()
    }

    pub fn total_power(&self) -> f64 {
        self.power.iter().skip(1).sum()
    }
}

/// Hann window of the given length.
pub fn create_hann_window(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / size as f64).cos()))
        .collect()
}

/// Radix-2 FFT power spectrum: the window is mean-removed, Hann-weighted and
/// zero-padded to the next power of two.
pub fn power_spectrum(signal: &[f64], sample_rate: f64) -> Spectrum {
    if signal.len() < 4 || sample_rate <= 0.0 {
        return Spectrum {
            power: Vec::new(),
            bin_hz: 0.0,
        };
    }

    let m = mean(signal);
    let window = create_hann_window(signal.len());
    let n = signal.len().next_power_of_two();
    let mut buffer = vec![Complex::new(0.0, 0.0); n];
    for (i, (&x, &w)) in signal.iter().zip(window.iter()).enumerate() {
        buffer[i] = Complex::new((x - m) * w, 0.0);
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    Spectrum {
        power: buffer[..=n / 2].iter().map(|c| c.norm_sqr()).collect(),
        bin_hz: sample_rate / n as f64,
    }
}

/// Frequency of the strongest spectral peak inside `[min_bpm, max_bpm]`, in BPM.
pub fn dominant_frequency_bpm(signal: &[f64], sample_rate: f64, min_bpm: f64, max_bpm: f64) -> Option<f64> {
    let spectrum = power_spectrum(signal, sample_rate);
    if spectrum.power.len() < 3 {
        return None;
    }
    let lo = ((min_bpm / 60.0) / spectrum.bin_hz).ceil().max(1.0) as usize;
    let hi = (((max_bpm / 60.0) / spectrum.bin_hz).floor() as usize).min(spectrum.power.len() - 2);
    if lo > hi {
        return None;
    }

    let (bin, power) = (lo..=hi)
        .map(|i| (i, spectrum.power[i]))
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    if power <= f64::EPSILON {
        return None;
    }

    // Parabolic interpolation between neighbouring bins.
    let (a, b, c) = (spectrum.power[bin - 1], power, spectrum.power[bin + 1]);
    let denom = a - 2.0 * b + c;
    let offset = if denom.abs() > f64::EPSILON {
        (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
    } else {
        0.0
    };
    Some((bin as f64 + offset) * spectrum.bin_hz * 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(n: usize, fs: f64, hz: f64, amplitude: f64, offset: f64) -> Vec<f64> {
        (0..n)
            .map(|i| offset + amplitude * (2.0 * PI * hz * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn short_windows_return_empty_results() {
        assert!(find_peaks(&[1.0, 2.0], 15, 0.3).is_empty());
        assert!(find_valleys(&[], 15, 0.3).is_empty());
        assert_eq!(ac_component(&[]), 0.0);
        assert_eq!(perfusion_index(&[0.0, 0.0]), 0.0);
        assert_eq!(pulse_transit_time(&[10], 30.0), 0.0);
        assert_eq!(dicrotic_notch(&[1.0, 2.0], 0, 10), None);
        assert!(power_spectrum(&[1.0, 2.0], 30.0).power.is_empty());
        assert_eq!(dominant_frequency_bpm(&[1.0], 30.0, 40.0, 200.0), None);
    }

    #[test]
    fn flat_signal_has_no_peaks() {
        assert!(find_peaks(&[5.0; 100], 15, 0.3).is_empty());
    }

    #[test]
    fn finds_one_peak_per_cycle() {
        // 1.25 Hz at 30 Hz: one cycle every 24 samples.
        let signal = sine(240, 30.0, 1.25, 5.0, 100.0);
        let peaks = find_peaks(&signal, MIN_EVENT_DISTANCE, PEAK_THRESHOLD_FRACTION);
        let valleys = find_valleys(&signal, MIN_EVENT_DISTANCE, PEAK_THRESHOLD_FRACTION);
        assert_eq!(peaks.len(), 10);
        assert_eq!(valleys.len(), 10);
        let ptt = pulse_transit_time(&peaks, 30.0);
        assert!((ptt - 800.0).abs() < 1.0, "ptt = {ptt}");
    }

    #[test]
    fn close_candidates_keep_the_higher_peak() {
        let mut signal = vec![0.0; 40];
        signal[10] = 5.0;
        signal[14] = 8.0;
        signal[35] = 6.0;
        let peaks = find_peaks(&signal, 15, 0.3);
        assert_eq!(peaks, vec![14, 35]);
    }

    #[test]
    fn ac_dc_and_perfusion() {
        let signal = [98.0, 100.0, 102.0, 100.0];
        assert_eq!(ac_component(&signal), 4.0);
        assert_eq!(dc_component(&signal), 100.0);
        assert!((perfusion_index(&signal) - 0.04).abs() < 1e-12);
    }

    #[test]
    fn dominant_frequency_matches_sine() {
        let signal = sine(300, 30.0, 1.25, 3.0, 50.0);
        let bpm = dominant_frequency_bpm(&signal, 30.0, 40.0, 200.0).unwrap();
        assert!((bpm - 75.0).abs() < 3.0, "bpm = {bpm}");
    }

    #[test]
    fn band_power_concentrates_at_signal_frequency() {
        let signal = sine(256, 32.0, 2.0, 1.0, 0.0);
        let spectrum = power_spectrum(&signal, 32.0);
        let in_band = spectrum.band_power(1.5, 2.5);
        let out_band = spectrum.band_power(5.0, 10.0);
        assert!(in_band > 100.0 * out_band);
    }

    #[test]
    fn dicrotic_notch_found_after_peak() {
        // Peak, steep fall, small secondary bump, then decay.
        let signal = [
            0.0, 4.0, 8.0, 10.0, 8.0, 5.0, 3.0, 2.5, 2.6, 2.4, 1.5, 0.5, 0.0,
        ];
        let notch = dicrotic_notch(&signal, 3, 10).unwrap();
        assert!(notch > 3 && notch < 10, "notch at {notch}");
    }

    #[test]
    fn trimmed_mean_drops_extremes() {
        let values = [10.0, 70.0, 72.0, 74.0, 200.0];
        assert_eq!(trimmed_mean(&values, 0.2), Some(72.0));
        assert_eq!(trimmed_mean(&[], 0.2), None);
    }

    #[test]
    fn median_of_even_count_averages_middle_pair() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn time_weighting_favours_recent_points() {
        let avg = time_weighted_average(&[(0, 100.0), (500, 100.0), (1000, 130.0)]).unwrap();
        // Weights 1, 1.5 and 2.
        assert!((avg - (100.0 + 150.0 + 260.0) / 4.5).abs() < 1e-9);
        assert_eq!(time_weighted_average(&[(7, 42.0)]), Some(42.0));
        assert_eq!(time_weighted_average(&[]), None);
    }
}
