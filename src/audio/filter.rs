/// Band-pass pre-filter for chirp detection.
///
/// Cascaded 2nd-order Butterworth high-pass and low-pass sections, run forward
/// and then backward over the buffer. The backward pass cancels the phase delay
/// of the forward pass, so correlation peaks stay where the chirp really is.

use std::f64::consts::TAU;

/// Second-order IIR (biquad) filter coefficients, pre-normalized by a0.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    /// Design a 2nd-order Butterworth low-pass filter.
    fn lowpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        let omega = TAU * cutoff_hz / sample_rate;
        let cos_w = omega.cos();
        let alpha = omega.sin() / 2.0_f64.sqrt(); // Q = 1/sqrt(2)
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 - cos_w) / 2.0) / a0,
            b1: (1.0 - cos_w) / a0,
            b2: ((1.0 - cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Design a 2nd-order Butterworth high-pass filter.
    fn highpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        let omega = TAU * cutoff_hz / sample_rate;
        let cos_w = omega.cos();
        let alpha = omega.sin() / 2.0_f64.sqrt();
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 + cos_w) / 2.0) / a0,
            b1: (-(1.0 + cos_w)) / a0,
            b2: ((1.0 + cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Run the filter over `buf` in place.
    fn apply_in_place(&self, buf: &mut [f64]) {
        let (mut x1, mut x2) = (0.0, 0.0);
        let (mut y1, mut y2) = (0.0, 0.0);
        for sample in buf.iter_mut() {
            let x = *sample;
            let y = self.b0 * x + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x;
            y2 = y1;
            y1 = y;
            *sample = y;
        }
    }
}

/// Zero-phase band-pass filter over `[low_hz, high_hz]`.
#[derive(Debug, Clone, Copy)]
pub struct BandPass {
    highpass: Biquad,
    lowpass: Biquad,
}

impl BandPass {
    /// Build a band-pass filter. The upper edge is clamped below Nyquist.
    pub fn new(low_hz: f32, high_hz: f32, sample_rate: u32) -> Self {
        let fs = sample_rate as f64;
        let high = (high_hz as f64).min(0.49 * fs);
        let low = (low_hz as f64).clamp(1.0, high * 0.99);
        Self {
            highpass: Biquad::highpass(low, fs),
            lowpass: Biquad::lowpass(high, fs),
        }
    }

    /// Filter `samples` forward and backward, returning f64 output.
    pub fn filtfilt(&self, samples: &[f32]) -> Vec<f64> {
        let mut buf: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        self.pass(&mut buf);
        buf.reverse();
        self.pass(&mut buf);
        buf.reverse();
        buf
    }

    fn pass(&self, buf: &mut [f64]) {
        self.highpass.apply_in_place(buf);
        self.lowpass.apply_in_place(buf);
    }
}
