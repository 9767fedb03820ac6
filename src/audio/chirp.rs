/// Chirp synthesis for acoustic ranging.
///
/// A chirp sweeps linearly from one frequency to another over a short time. Its
/// autocorrelation has a single sharp peak, which is what makes it a good
/// matched-filter probe. Both devices must build the reference from an identical
/// `ChirpSpec`: the waveform is the template the Detector correlates against.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{RangingError, Result};

/// Default sweep: near-ultrasonic so the exchange is inaudible to most people.
pub const DEFAULT_START_FREQ: f32 = 17_000.0;
pub const DEFAULT_END_FREQ: f32 = 20_000.0;
pub const DEFAULT_DURATION_SECS: f32 = 0.025;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
/// Fraction of the chirp tapered at each end.
pub const DEFAULT_TAPER_FRACTION: f32 = 0.05;
pub const DEFAULT_PEAK_AMPLITUDE: f32 = 0.9;

/// Parameters of the probe chirp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChirpSpec {
    pub start_frequency_hz: f32,
    pub end_frequency_hz: f32,
    pub duration_secs: f32,
    pub sample_rate_hz: u32,
    pub taper_fraction: f32,
    pub peak_amplitude: f32,
}

impl Default for ChirpSpec {
    fn default() -> Self {
        Self {
            start_frequency_hz: DEFAULT_START_FREQ,
            end_frequency_hz: DEFAULT_END_FREQ,
            duration_secs: DEFAULT_DURATION_SECS,
            sample_rate_hz: DEFAULT_SAMPLE_RATE,
            taper_fraction: DEFAULT_TAPER_FRACTION,
            peak_amplitude: DEFAULT_PEAK_AMPLITUDE,
        }
    }
}

impl ChirpSpec {
    /// Number of samples in the generated waveform.
    pub fn num_samples(&self) -> usize {
        (self.duration_secs as f64 * self.sample_rate_hz as f64).round() as usize
    }

    /// Lower and upper edge of the sweep, regardless of sweep direction.
    pub fn band(&self) -> (f32, f32) {
        (
            self.start_frequency_hz.min(self.end_frequency_hz),
            self.start_frequency_hz.max(self.end_frequency_hz),
        )
    }

    pub fn bandwidth_hz(&self) -> f32 {
        (self.end_frequency_hz - self.start_frequency_hz).abs()
    }

    /// Check that the spec describes a waveform we can actually generate.
    pub fn validate(&self) -> Result<()> {
        let nyquist = self.sample_rate_hz as f32 / 2.0;
        if self.sample_rate_hz == 0 {
            return Err(RangingError::InvalidChirp("sample rate must be positive".into()));
        }
        if !(self.duration_secs > 0.0) {
            return Err(RangingError::InvalidChirp(format!(
                "duration must be positive, got {}",
                self.duration_secs
            )));
        }
        let (low, high) = self.band();
        if low <= 0.0 || high >= nyquist {
            return Err(RangingError::InvalidChirp(format!(
                "sweep {}..{} Hz must lie inside (0, {}) Hz",
                low, high, nyquist
            )));
        }
        if self.bandwidth_hz() == 0.0 {
            return Err(RangingError::InvalidChirp("sweep has zero bandwidth".into()));
        }
        if !(0.0..0.5).contains(&self.taper_fraction) {
            return Err(RangingError::InvalidChirp(format!(
                "taper fraction {} outside [0, 0.5)",
                self.taper_fraction
            )));
        }
        if !(self.peak_amplitude > 0.0 && self.peak_amplitude <= 1.0) {
            return Err(RangingError::InvalidChirp(format!(
                "peak amplitude {} outside (0, 1]",
                self.peak_amplitude
            )));
        }
        if self.num_samples() < 2 {
            return Err(RangingError::InvalidChirp("chirp shorter than two samples".into()));
        }
        Ok(())
    }
}

/// Generate the reference chirp described by `spec`.
///
/// Phase is accumulated in f64 from the closed-form expression, so two devices
/// given the same spec produce bit-identical samples.
pub fn generate(spec: &ChirpSpec) -> Vec<f32> {
    let n = spec.num_samples();
    let fs = spec.sample_rate_hz as f64;
    let f0 = spec.start_frequency_hz as f64;
    let f1 = spec.end_frequency_hz as f64;
    let duration = n as f64 / fs;
    let taper_len = (n as f64 * spec.taper_fraction as f64).round() as usize;

    let mut samples: Vec<f64> = (0..n)
        .map(|i| {
            let t = i as f64 / fs;
            // 2π * (f0*t + (f1-f0)*t²/(2T))
            let phase = 2.0 * PI * (f0 * t + (f1 - f0) * t * t / (2.0 * duration));
            phase.sin() * taper(i, n, taper_len)
        })
        .collect();

    let peak = samples.iter().fold(0.0f64, |m, s| m.max(s.abs()));
    if peak > 0.0 {
        let scale = spec.peak_amplitude as f64 / peak;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }

    samples.into_iter().map(|s| s as f32).collect()
}

/// The chirp framed by silence, as played during a device self-test.
pub fn ranging_signal(spec: &ChirpSpec, lead_secs: f32, tail_secs: f32) -> Vec<f32> {
    let fs = spec.sample_rate_hz as f32;
    let lead = (lead_secs * fs) as usize;
    let tail = (tail_secs * fs) as usize;
    let chirp = generate(spec);

    let mut out = Vec::with_capacity(lead + chirp.len() + tail);
    out.resize(lead, 0.0);
    out.extend_from_slice(&chirp);
    out.resize(lead + chirp.len() + tail, 0.0);
    out
}

/// Raised-cosine taper over the first and last `taper_len` samples.
fn taper(i: usize, total: usize, taper_len: usize) -> f64 {
    if taper_len == 0 {
        return 1.0;
    }
    let from_edge = i.min(total - 1 - i);
    if from_edge >= taper_len {
        1.0
    } else {
        0.5 * (1.0 - (PI * from_edge as f64 / taper_len as f64).cos())
    }
}
