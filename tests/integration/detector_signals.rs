/// Integration test: chirp detection on noisy, realistic captures.

use beepbeep::audio::chirp::{self, ChirpSpec};
use beepbeep::audio::detector::{Detector, DetectorConfig};
use beepbeep::audio::device::CaptureBuffer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

fn noisy_capture(len: usize, chirps: &[(usize, f32)], noise_std: f32, seed: u64) -> Vec<f32> {
    let reference = chirp::generate(&ChirpSpec::default());
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, noise_std).unwrap();
    let mut samples: Vec<f32> = (0..len).map(|_| noise.sample(&mut rng)).collect();
    for &(at, gain) in chirps {
        for (i, &s) in reference.iter().enumerate() {
            samples[at + i] += s * gain;
        }
    }
    samples
}

fn detector() -> (Detector, Vec<f32>) {
    let spec = ChirpSpec::default();
    (Detector::new(&spec, DetectorConfig::default()), chirp::generate(&spec))
}

#[test]
fn test_moderate_noise_keeps_arrival_within_a_few_samples() {
    let (detector, reference) = detector();
    for seed in 0..5 {
        let capture = CaptureBuffer::new(500_000, noisy_capture(9000, &[(4321, 1.0)], 0.3, seed));
        let event = detector.detect(&capture, &reference, 0..9000).unwrap();

        assert!(event.valid, "seed {}: score {}", seed, event.correlation_score);
        assert!(event.correlation_score > 0.8, "seed {}: score {}", seed, event.correlation_score);
        let error = event.sample_index as i64 - 504_321;
        assert!(error.abs() <= 3, "seed {}: off by {} samples", seed, error);
    }
}

#[test]
fn test_extreme_noise_is_rejected() {
    let (detector, reference) = detector();
    let capture = CaptureBuffer::new(0, noisy_capture(1600, &[(200, 1.0)], 50.0, 11));
    let event = detector.detect(&capture, &reference, 0..1600).unwrap();

    assert!(!event.valid, "score {}", event.correlation_score);
    assert!(event.correlation_score < 0.4);
}

#[test]
fn test_out_of_band_hum_is_filtered_out() {
    let (detector, reference) = detector();
    let mut samples = noisy_capture(6000, &[(2500, 0.5)], 0.0, 0);
    for (i, s) in samples.iter_mut().enumerate() {
        *s += (std::f32::consts::TAU * 2000.0 * i as f32 / 48_000.0).sin();
    }

    let capture = CaptureBuffer::new(0, samples);
    let event = detector.detect(&capture, &reference, 0..6000).unwrap();
    assert!(event.valid);
    assert!(event.correlation_score > 0.9, "score {}", event.correlation_score);
    assert!((event.sample_index as i64 - 2500).abs() <= 1);
}

#[test]
fn test_weak_direct_path_beats_stronger_reflection() {
    let (detector, reference) = detector();
    // Reflection 27 ms after the direct path and a bit louder
    let capture = CaptureBuffer::new(0, noisy_capture(8000, &[(3000, 0.2), (4300, 0.22)], 0.01, 3));
    let event = detector.detect(&capture, &reference, 0..8000).unwrap();

    assert!(event.valid);
    assert!(
        (event.sample_index as i64 - 3000).abs() <= 2,
        "expected direct path, got {}",
        event.sample_index
    );
}

#[test]
fn test_quiet_chirp_scores_like_a_loud_one() {
    let (detector, reference) = detector();
    let loud = CaptureBuffer::new(0, noisy_capture(5000, &[(1000, 1.0)], 0.0, 0));
    let quiet = CaptureBuffer::new(0, noisy_capture(5000, &[(1000, 0.01)], 0.0, 0));

    let a = detector.detect(&loud, &reference, 0..5000).unwrap();
    let b = detector.detect(&quiet, &reference, 0..5000).unwrap();
    assert_eq!(a.sample_index, b.sample_index);
    assert!((a.correlation_score - b.correlation_score).abs() < 1e-3);
}
