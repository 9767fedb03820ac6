/// BeepBeep distance from the two devices' locally measured deltas.
///
/// Each delta is "arrival of the responder's chirp minus arrival of the
/// initiator's chirp" on one device's own clock, so any offset between the
/// two clocks cancels in the subtraction. `local_delta` is the initiator's.
pub fn beepbeep_distance(
    speed_of_sound: f64,
    local_delta: f64,
    peer_delta: f64,
    d_aa: f64,
    d_bb: f64,
) -> f64 {
    speed_of_sound / 2.0 * (local_delta - peer_delta) + (d_aa + d_bb) / 2.0
}

/// One-way distance covered in `delta_secs`, clamped at zero.
pub fn one_way_distance(speed_of_sound: f64, delta_secs: f64) -> f64 {
    (speed_of_sound * delta_secs).max(0.0)
}

/// Sample-index difference expressed in seconds.
pub fn samples_to_secs(from: u64, to: u64, sample_rate: u32) -> f64 {
    (to as f64 - from as f64) / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_exchange() {
        // 171.5 * 0.001 + 0.11
        let d = beepbeep_distance(343.0, 0.0300, 0.0290, 0.10, 0.12);
        assert!((d - 0.2815).abs() < 1e-9, "distance {}", d);
    }

    #[test]
    fn test_clock_offset_cancels() {
        // Two devices 2 m apart (mics 0.15 m from speakers, same side):
        // true flight times and an arbitrary shift of every index on device B.
        let c = 343.0;
        let fs = 48_000u32;
        let (d_aa, d_bb) = (0.15, 0.15);
        let d_ab = 2.15; // A speaker -> B mic
        let d_ba = 1.85; // B speaker -> A mic

        let to_samples = |m: f64| (m / c * fs as f64).round() as u64;
        let emit_a = 10_000u64;
        let emit_b = 30_000u64;
        let offset_b = 7_777_777u64;

        let a_self = emit_a + to_samples(d_aa);
        let a_peer = emit_b + to_samples(d_ba);
        let b_self = emit_b + to_samples(d_bb) + offset_b;
        let b_peer = emit_a + to_samples(d_ab) + offset_b;

        let delta_a = samples_to_secs(a_self, a_peer, fs);
        let delta_b = samples_to_secs(b_peer, b_self, fs);
        let d = beepbeep_distance(c, delta_a, delta_b, d_aa, d_bb);
        assert!((d - 2.0).abs() < 0.01, "distance {}", d);
    }

    #[test]
    fn test_one_way_clamps_negative() {
        assert_eq!(one_way_distance(343.0, -0.01), 0.0);
        assert!((one_way_distance(343.0, 0.01) - 3.43).abs() < 1e-12);
    }
}
