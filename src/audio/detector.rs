/// Chirp arrival detection by normalized cross-correlation.
///
/// The capture is band-limited to the chirp's span, correlated against the
/// identically filtered reference, and the best correlation peak is accepted
/// only if it clears the detection threshold and is not ambiguous.

use std::ops::Range;

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::audio::chirp::ChirpSpec;
use crate::audio::device::CaptureBuffer;
use crate::audio::filter::BandPass;
use crate::error::{RangingError, Result};

/// Windows whose energy is below this fraction of the template energy score 0.
const ENERGY_FLOOR_RATIO: f64 = 1e-6;

/// Tunables for peak acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum normalized correlation for a valid detection.
    pub detection_threshold: f32,
    /// Peaks scoring within this much of the maximum are near-ties.
    pub peak_margin: f32,
    /// Near-ties arriving this soon after the earliest one are treated as echoes of it.
    pub echo_window_secs: f32,
    /// Extra pass band on either side of the sweep.
    pub band_margin_hz: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.4,
            peak_margin: 0.1,
            echo_window_secs: 0.03,
            band_margin_hz: 1000.0,
        }
    }
}

/// Outcome of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionEvent {
    /// Peak location on the capture clock.
    pub sample_index: u64,
    /// Normalized correlation score in [0, 1].
    pub correlation_score: f32,
    pub valid: bool,
}

/// Stateless matched-filter detector for one chirp spec.
#[derive(Debug, Clone)]
pub struct Detector {
    config: DetectorConfig,
    filter: BandPass,
    /// Maxima closer than this to a stronger one belong to the same arrival.
    exclusion_radius: usize,
    echo_window: usize,
}

impl Detector {
    pub fn new(spec: &ChirpSpec, config: DetectorConfig) -> Self {
        let (low, high) = spec.band();
        let fs = spec.sample_rate_hz as f32;
        let filter = BandPass::new(
            low - config.band_margin_hz,
            high + config.band_margin_hz,
            spec.sample_rate_hz,
        );
        let exclusion_radius = (2.0 * fs / spec.bandwidth_hz().max(1.0)).ceil() as usize;
        let echo_window = (config.echo_window_secs * fs).round() as usize;
        Self {
            config,
            filter,
            exclusion_radius: exclusion_radius.max(1),
            echo_window,
        }
    }

    /// Locate the chirp `reference` inside `window` (offsets relative to the
    /// start of `capture`). The returned index is absolute on the capture clock.
    pub fn detect(
        &self,
        capture: &CaptureBuffer,
        reference: &[f32],
        window: Range<usize>,
    ) -> Result<DetectionEvent> {
        let samples = capture.samples();
        let start = window.start.min(samples.len());
        let end = window.end.min(samples.len()).max(start);
        let available = end - start;
        if reference.is_empty() || available < reference.len() {
            return Err(RangingError::InsufficientCaptureLength {
                available,
                required: reference.len(),
            });
        }

        // Filter the whole capture so filter start-up transients stay outside the window.
        let filtered = self.filter.filtfilt(samples);
        let template = self.filter.filtfilt(reference);
        let scores = normalized_xcorr(&filtered[start..end], &template);

        let (offset, score, valid) = self.pick_peak(&scores);
        Ok(DetectionEvent {
            sample_index: capture.start_index() + (start + offset) as u64,
            correlation_score: score,
            valid,
        })
    }

    /// Choose the arrival among correlation scores: `(offset, score, valid)`.
    fn pick_peak(&self, scores: &[f32]) -> (usize, f32, bool) {
        let (best_idx, best) = scores
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, s)| if s > acc.1 { (i, s) } else { acc });

        if best < self.config.detection_threshold {
            return (best_idx, best.max(0.0), false);
        }

        let peaks = self.distinct_peaks(scores);
        let floor = (best - self.config.peak_margin).max(self.config.detection_threshold);
        let near_ties: Vec<usize> = peaks.into_iter().filter(|&p| scores[p] >= floor).collect();

        // The best peak always survives suppression; fall back to it if the list is empty
        let earliest = near_ties.iter().copied().min().unwrap_or(best_idx);
        let ambiguous = near_ties.iter().any(|&p| p > earliest + self.echo_window);
        if ambiguous {
            tracing::debug!(
                best_idx,
                best,
                near_ties = near_ties.len(),
                "Ambiguous correlation peaks, rejecting detection"
            );
            return (best_idx, best, false);
        }

        (earliest, scores[earliest], true)
    }

    /// Local maxima after suppressing those within the exclusion radius of a stronger one.
    fn distinct_peaks(&self, scores: &[f32]) -> Vec<usize> {
        let last = scores.len().saturating_sub(1);
        let mut maxima: Vec<usize> = (0..scores.len())
            .filter(|&k| {
                let left_ok = k == 0 || scores[k] >= scores[k - 1];
                let right_ok = k == last || scores[k] >= scores[k + 1];
                left_ok && right_ok && scores[k] > 0.0
            })
            .collect();
        maxima.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

        let mut kept: Vec<usize> = Vec::new();
        for k in maxima {
            if kept.iter().all(|&p| p.abs_diff(k) > self.exclusion_radius) {
                kept.push(k);
            }
        }
        kept
    }
}

/// Absolute normalized cross-correlation of `template` against every lag of `signal`.
///
/// `signal.len() >= template.len()`; the result has `signal.len() - template.len() + 1`
/// entries.
fn normalized_xcorr(signal: &[f64], template: &[f64]) -> Vec<f32> {
    let n = signal.len();
    let m = template.len();
    let lags = n - m + 1;

    let template_energy: f64 = template.iter().map(|v| v * v).sum();
    if template_energy <= 0.0 {
        return vec![0.0; lags];
    }

    let size = (n + m).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(size);
    let inverse = planner.plan_fft_inverse(size);

    let mut sig_buf = padded(signal, size);
    let mut tpl_buf = padded(template, size);
    forward.process(&mut sig_buf);
    forward.process(&mut tpl_buf);
    for (s, t) in sig_buf.iter_mut().zip(&tpl_buf) {
        *s *= t.conj();
    }
    inverse.process(&mut sig_buf);

    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0f64);
    for &v in signal {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + v * v);
    }

    let scale = size as f64;
    (0..lags)
        .map(|k| {
            let window_energy = prefix[k + m] - prefix[k];
            if window_energy <= ENERGY_FLOOR_RATIO * template_energy {
                return 0.0;
            }
            let cross = sig_buf[k].re / scale;
            (cross / (window_energy.sqrt() * template_energy.sqrt())).abs().min(1.0) as f32
        })
        .collect()
}

fn padded(values: &[f64], size: usize) -> Vec<Complex<f64>> {
    let mut buf: Vec<Complex<f64>> = values.iter().map(|&v| Complex::new(v, 0.0)).collect();
    buf.resize(size, Complex::new(0.0, 0.0));
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chirp::generate;

    fn embed(len: usize, chirp: &[f32], at: &[(usize, f32)]) -> Vec<f32> {
        let mut buf = vec![0.0f32; len];
        for &(offset, gain) in at {
            for (i, &s) in chirp.iter().enumerate() {
                buf[offset + i] += s * gain;
            }
        }
        buf
    }

    #[test]
    fn test_exact_reference_is_found_at_offset() {
        let spec = ChirpSpec::default();
        let chirp = generate(&spec);
        let detector = Detector::new(&spec, DetectorConfig::default());

        let capture = CaptureBuffer::new(0, embed(8000, &chirp, &[(3000, 1.0)]));
        let event = detector.detect(&capture, &chirp, 0..8000).unwrap();

        assert!(event.valid);
        assert!(
            (event.sample_index as i64 - 3000).abs() <= 1,
            "index {}",
            event.sample_index
        );
        assert!(event.correlation_score > 0.97, "score {}", event.correlation_score);
    }

    #[test]
    fn test_index_is_absolute_on_capture_clock() {
        let spec = ChirpSpec::default();
        let chirp = generate(&spec);
        let detector = Detector::new(&spec, DetectorConfig::default());

        let capture = CaptureBuffer::new(1_000_000, embed(8000, &chirp, &[(5000, 0.5)]));
        let event = detector.detect(&capture, &chirp, 4000..8000).unwrap();

        assert!(event.valid);
        assert!((event.sample_index as i64 - 1_005_000).abs() <= 1);
    }

    #[test]
    fn test_short_window_is_insufficient() {
        let spec = ChirpSpec::default();
        let chirp = generate(&spec);
        let detector = Detector::new(&spec, DetectorConfig::default());

        let capture = CaptureBuffer::new(0, vec![0.0; 4000]);
        let err = detector.detect(&capture, &chirp, 100..1000).unwrap_err();
        assert_eq!(
            err,
            RangingError::InsufficientCaptureLength {
                available: 900,
                required: chirp.len()
            }
        );

        // Window clamped by the end of the capture
        let err = detector.detect(&capture, &chirp, 3500..9000).unwrap_err();
        assert!(matches!(err, RangingError::InsufficientCaptureLength { available: 500, .. }));
    }

    #[test]
    fn test_silence_is_not_a_detection() {
        let spec = ChirpSpec::default();
        let chirp = generate(&spec);
        let detector = Detector::new(&spec, DetectorConfig::default());

        let capture = CaptureBuffer::new(0, vec![0.0; 6000]);
        let event = detector.detect(&capture, &chirp, 0..6000).unwrap();
        assert!(!event.valid);
        assert_eq!(event.correlation_score, 0.0);
    }

    #[test]
    fn test_near_equal_echo_resolves_to_earliest_peak() {
        let spec = ChirpSpec::default();
        let chirp = generate(&spec);
        let detector = Detector::new(&spec, DetectorConfig::default());

        // Echo 12.5 ms after the direct path and slightly louder
        let capture = CaptureBuffer::new(0, embed(10_000, &chirp, &[(2000, 0.7), (2600, 0.75)]));
        let event = detector.detect(&capture, &chirp, 0..10_000).unwrap();

        assert!(event.valid);
        assert!(
            (event.sample_index as i64 - 2000).abs() <= 1,
            "expected direct path, got {}",
            event.sample_index
        );
    }

    #[test]
    fn test_distant_near_tie_is_ambiguous() {
        let spec = ChirpSpec::default();
        let chirp = generate(&spec);
        let detector = Detector::new(&spec, DetectorConfig::default());

        // Two equal chirps 100 ms apart: far outside the echo window
        let capture = CaptureBuffer::new(0, embed(12_000, &chirp, &[(1000, 0.6), (5800, 0.6)]));
        let event = detector.detect(&capture, &chirp, 0..12_000).unwrap();
        assert!(!event.valid);
    }

    #[test]
    fn test_window_restricts_search() {
        let spec = ChirpSpec::default();
        let chirp = generate(&spec);
        let detector = Detector::new(&spec, DetectorConfig::default());

        let capture = CaptureBuffer::new(0, embed(12_000, &chirp, &[(1000, 0.6), (7000, 0.3)]));
        let first = detector.detect(&capture, &chirp, 0..4000).unwrap();
        let second = detector.detect(&capture, &chirp, 4000..12_000).unwrap();

        assert!(first.valid && second.valid);
        assert!((first.sample_index as i64 - 1000).abs() <= 1);
        assert!((second.sample_index as i64 - 7000).abs() <= 1);
    }

    #[test]
    fn test_wrong_sweep_scores_low() {
        let spec = ChirpSpec::default();
        let template = generate(&spec);
        let reversed = generate(&ChirpSpec {
            start_frequency_hz: spec.end_frequency_hz,
            end_frequency_hz: spec.start_frequency_hz,
            ..spec
        });
        let detector = Detector::new(&spec, DetectorConfig::default());

        let capture = CaptureBuffer::new(0, embed(6000, &reversed, &[(2000, 1.0)]));
        let event = detector.detect(&capture, &template, 0..6000).unwrap();
        assert!(event.correlation_score < 0.5, "score {}", event.correlation_score);
    }
}
