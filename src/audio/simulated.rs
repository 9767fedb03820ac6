/// Simulated acoustics for running two devices without hardware.
///
/// Devices sit on a line. Each has a speaker at its position and a microphone
/// `speaker_to_mic_m` further along. Every device has its own clock offset, so
/// sample indices are never comparable across devices; only the room knows the
/// shared timeline. Captures block in real time until their window has passed,
/// then are synthesized from every emission that reached the microphone.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::audio::device::{CaptureBuffer, DuplexAudio};

/// Emissions older than this are forgotten.
const EMISSION_RETENTION_SECS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoomConfig {
    pub sample_rate: u32,
    pub speed_of_sound: f64,
    /// Standard deviation of white noise added to every capture.
    pub noise_std: f32,
    pub seed: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            speed_of_sound: 343.0,
            noise_std: 0.01,
            seed: 7,
        }
    }
}

/// Where a device sits and how its audio stack behaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DevicePlacement {
    pub position_m: f64,
    pub speaker_to_mic_m: f64,
    /// Added to the room clock to get this device's clock.
    pub clock_offset_samples: u64,
    /// Delay between `play` returning and sound leaving the speaker.
    pub output_latency_samples: u64,
}

impl DevicePlacement {
    pub fn at(position_m: f64) -> Self {
        Self {
            position_m,
            speaker_to_mic_m: 0.15,
            clock_offset_samples: 0,
            output_latency_samples: 0,
        }
    }

    fn speaker(&self) -> f64 {
        self.position_m
    }

    fn mic(&self) -> f64 {
        self.position_m + self.speaker_to_mic_m
    }
}

struct Emission {
    source: usize,
    /// Room-clock index of the first sample.
    start: u64,
    samples: Arc<Vec<f32>>,
}

struct DeviceState {
    placement: DevicePlacement,
    muted: bool,
    rng: StdRng,
    /// `None` when the room is noiseless.
    noise: Option<Normal<f32>>,
}

struct RoomState {
    devices: Vec<DeviceState>,
    emissions: Vec<Emission>,
}

/// Shared acoustic space for simulated devices.
#[derive(Clone)]
pub struct SimulatedRoom {
    config: RoomConfig,
    epoch: Instant,
    state: Arc<Mutex<RoomState>>,
}

fn lock(state: &Mutex<RoomState>) -> MutexGuard<'_, RoomState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedRoom {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            state: Arc::new(Mutex::new(RoomState {
                devices: Vec::new(),
                emissions: Vec::new(),
            })),
        }
    }

    pub fn add_device(&self, placement: DevicePlacement) -> SimulatedDevice {
        let mut state = lock(&self.state);
        let id = state.devices.len();
        let seed = self.config.seed.wrapping_add(id as u64);
        let noise = match Normal::new(0.0, self.config.noise_std) {
            Ok(normal) if self.config.noise_std > 0.0 => Some(normal),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(
                    noise_std = self.config.noise_std,
                    "Invalid room noise, capturing clean: {}",
                    e
                );
                None
            }
        };
        state.devices.push(DeviceState {
            placement,
            muted: false,
            rng: StdRng::seed_from_u64(seed),
            noise,
        });
        SimulatedDevice {
            room: self.clone(),
            id,
        }
    }

    /// Distance the BeepBeep exchange between two devices should report:
    /// the mean of both speaker-to-other-mic paths.
    pub fn true_distance(&self, a: &SimulatedDevice, b: &SimulatedDevice) -> f64 {
        let state = lock(&self.state);
        let pa = state.devices[a.id].placement;
        let pb = state.devices[b.id].placement;
        ((pa.speaker() - pb.mic()).abs() + (pb.speaker() - pa.mic()).abs()) / 2.0
    }

    fn room_now(&self) -> u64 {
        (self.epoch.elapsed().as_secs_f64() * self.config.sample_rate as f64) as u64
    }

    fn instant_of(&self, room_index: u64) -> Instant {
        self.epoch + Duration::from_secs_f64(room_index as f64 / self.config.sample_rate as f64)
    }

    fn delay_samples(&self, from: &DevicePlacement, to: &DevicePlacement) -> u64 {
        let meters = (from.speaker() - to.mic()).abs();
        (meters / self.config.speed_of_sound * self.config.sample_rate as f64).round() as u64
    }
}

/// One device in a [`SimulatedRoom`].
#[derive(Clone)]
pub struct SimulatedDevice {
    room: SimulatedRoom,
    id: usize,
}

impl SimulatedDevice {
    /// Silence this device's speaker; `play` still reports an emission index.
    pub fn set_muted(&self, muted: bool) {
        lock(&self.room.state).devices[self.id].muted = muted;
    }

    fn placement(&self) -> DevicePlacement {
        lock(&self.room.state).devices[self.id].placement
    }

    fn synthesize(&self, start: u64, len: usize) -> Vec<f32> {
        let room = &self.room;
        let mut state = lock(&room.state);
        let listener = state.devices[self.id].placement;
        let end = start + len as u64;

        let mut buf = vec![0.0f32; len];
        for emission in &state.emissions {
            let source = state.devices[emission.source].placement;
            let arrival = emission.start + room.delay_samples(&source, &listener);
            let meters = (source.speaker() - listener.mic()).abs();
            let gain = (1.0 / (1.0 + meters)) as f32;
            let emission_end = arrival + emission.samples.len() as u64;
            if emission_end <= start || arrival >= end {
                continue;
            }
            for (i, &s) in emission.samples.iter().enumerate() {
                let at = arrival + i as u64;
                if at >= start && at < end {
                    buf[(at - start) as usize] += s * gain;
                }
            }
        }

        let device = &mut state.devices[self.id];
        if let Some(noise) = device.noise {
            for sample in buf.iter_mut() {
                *sample += noise.sample(&mut device.rng);
            }
        }
        buf
    }
}

impl DuplexAudio for SimulatedDevice {
    fn sample_rate(&self) -> u32 {
        self.room.config.sample_rate
    }

    fn now(&self) -> u64 {
        self.room.room_now() + self.placement().clock_offset_samples
    }

    fn play(&self, samples: &[f32]) -> Result<u64> {
        let room_now = self.room.room_now();
        let retention = (EMISSION_RETENTION_SECS * self.room.config.sample_rate as f64) as u64;

        let mut state = lock(&self.room.state);
        let device = &state.devices[self.id];
        let placement = device.placement;
        let muted = device.muted;

        state
            .emissions
            .retain(|e| e.start + e.samples.len() as u64 + retention > room_now);
        if !muted {
            state.emissions.push(Emission {
                source: self.id,
                start: room_now + placement.output_latency_samples,
                samples: Arc::new(samples.to_vec()),
            });
        }
        tracing::trace!(device = self.id, room_now, muted, "Simulated emission");
        Ok(room_now + placement.clock_offset_samples)
    }

    fn capture(&self, num_samples: usize) -> Result<CaptureBuffer> {
        let start = self.room.room_now();
        let end = start + num_samples as u64;

        let wake = self.room.instant_of(end);
        let now = Instant::now();
        if wake > now {
            std::thread::sleep(wake - now);
        }

        let samples = self.synthesize(start, num_samples);
        let offset = self.placement().clock_offset_samples;
        Ok(CaptureBuffer::new(start + offset, samples))
    }

    fn description(&self) -> String {
        let p = self.placement();
        format!("simulated device {} at {:.2} m", self.id, p.position_m)
    }
}
