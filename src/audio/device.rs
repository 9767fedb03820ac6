/// Duplex audio boundary and the cpal-backed implementation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::audio::chirp::{self, ChirpSpec};
use crate::audio::detector::{Detector, DetectorConfig};

/// Seconds of microphone history kept for captures.
const INPUT_HISTORY_SECS: u32 = 10;
/// Polling period while a capture waits for the window to fill.
const CAPTURE_POLL: Duration = Duration::from_millis(5);

/// A block of mono samples tagged with where it starts on the device clock.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureBuffer {
    start_index: u64,
    samples: Vec<f32>,
}

impl CaptureBuffer {
    pub fn new(start_index: u64, samples: Vec<f32>) -> Self {
        Self {
            start_index,
            samples,
        }
    }

    /// Device-clock index of the first sample.
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Device-clock index one past the last sample.
    pub fn end_index(&self) -> u64 {
        self.start_index + self.samples.len() as u64
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Offset into the buffer of an absolute device-clock index, saturating at both ends.
    pub fn offset_of(&self, index: u64) -> usize {
        index.saturating_sub(self.start_index).min(self.samples.len() as u64) as usize
    }
}

/// A speaker and microphone sharing one monotonic sample clock.
///
/// `play` only schedules output and returns the device-clock index at which the
/// first sample is expected to leave the speaker. `capture` blocks until the
/// requested number of samples, starting now, has been recorded.
pub trait DuplexAudio: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Current position of the capture clock.
    fn now(&self) -> u64;

    fn play(&self, samples: &[f32]) -> Result<u64>;

    fn capture(&self, num_samples: usize) -> Result<CaptureBuffer>;

    fn description(&self) -> String;
}

/// Recent microphone samples, indexed on the input clock.
struct InputHistory {
    start_index: u64,
    samples: VecDeque<f32>,
    capacity: usize,
}

impl InputHistory {
    fn new(capacity: usize) -> Self {
        Self {
            start_index: 0,
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn end_index(&self) -> u64 {
        self.start_index + self.samples.len() as u64
    }

    fn push(&mut self, mono: impl Iterator<Item = f32>) {
        self.samples.extend(mono);
        let excess = self.samples.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.samples.drain(..excess);
            self.start_index += excess as u64;
        }
    }

    fn copy_range(&self, from: u64, to: u64) -> Option<Vec<f32>> {
        if from < self.start_index || to > self.end_index() {
            return None;
        }
        let begin = (from - self.start_index) as usize;
        let end = (to - self.start_index) as usize;
        Some(self.samples.range(begin..end).copied().collect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // An audio callback panicking leaves plain sample data behind; keep using it
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// CpalAudio drives the default input and output devices through cpal.
///
/// The streams live on a dedicated thread (cpal streams are not `Send` on every
/// host); this handle only shares the sample queues with the callbacks.
pub struct CpalAudio {
    sample_rate: u32,
    output_queue: Arc<Mutex<VecDeque<f32>>>,
    input: Arc<Mutex<InputHistory>>,
    input_clock: Arc<AtomicU64>,
    description: String,
    shutdown: Option<Sender<()>>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalAudio {
    /// Open the default devices at `sample_rate`.
    ///
    /// Adapts to each device's native channel count: output duplicates mono
    /// samples across all channels, input mixes down to mono.
    pub fn open(sample_rate: u32) -> Result<Self> {
        let output_queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let input = Arc::new(Mutex::new(InputHistory::new(
            (sample_rate * INPUT_HISTORY_SECS) as usize,
        )));
        let input_clock = Arc::new(AtomicU64::new(0));

        let (ready_tx, ready_rx): (Sender<Result<String>>, Receiver<Result<String>>) = bounded(1);
        let (shutdown_tx, shutdown_rx): (Sender<()>, Receiver<()>) = bounded(1);

        let queue = output_queue.clone();
        let history = input.clone();
        let clock = input_clock.clone();
        let stream_thread = std::thread::Builder::new()
            .name("beepbeep-audio".into())
            .spawn(move || {
                match build_streams(sample_rate, queue, history, clock) {
                    Ok((description, _output, _input)) => {
                        let _ = ready_tx.send(Ok(description));
                        // Streams stay alive until the handle is dropped
                        let _ = shutdown_rx.recv();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .context("Failed to spawn audio thread")?;

        let description = ready_rx
            .recv()
            .context("Audio thread exited before the streams started")??;

        Ok(Self {
            sample_rate,
            output_queue,
            input,
            input_clock,
            description,
            shutdown: Some(shutdown_tx),
            stream_thread: Some(stream_thread),
        })
    }
}

type Streams = (String, cpal::Stream, cpal::Stream);

fn build_streams(
    sample_rate: u32,
    output_queue: Arc<Mutex<VecDeque<f32>>>,
    input: Arc<Mutex<InputHistory>>,
    input_clock: Arc<AtomicU64>,
) -> Result<Streams> {
    let host = cpal::default_host();

    let output_device = host
        .default_output_device()
        .context("No output audio device")?;
    let input_device = host
        .default_input_device()
        .context("No input audio device")?;

    let out_name = device_name(&output_device);
    let in_name = device_name(&input_device);
    tracing::info!(output = %out_name, input = %in_name, sample_rate, "Opening audio devices");

    let out_channels = output_device
        .default_output_config()
        .context("No default output config")?
        .channels();
    let in_channels = input_device
        .default_input_config()
        .context("No default input config")?
        .channels();

    // Use each device's native channel count; many USB devices only do stereo
    let out_config = cpal::StreamConfig {
        channels: out_channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    let in_config = cpal::StreamConfig {
        channels: in_channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let output_stream = output_device.build_output_stream(
        &out_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut queue = lock(&output_queue);
            for frame in data.chunks_mut(out_channels as usize) {
                let sample = queue.pop_front().unwrap_or(0.0);
                for ch in frame.iter_mut() {
                    *ch = sample;
                }
            }
        },
        |err| tracing::error!("Output stream error: {}", err),
        None,
    )?;

    let input_stream = input_device.build_input_stream(
        &in_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let frames = data.len() / in_channels as usize;
            let mono = data
                .chunks(in_channels as usize)
                .map(|frame| frame.iter().sum::<f32>() / in_channels as f32);
            lock(&input).push(mono);
            input_clock.fetch_add(frames as u64, Ordering::Release);
        },
        |err| tracing::error!("Input stream error: {}", err),
        None,
    )?;

    output_stream.play()?;
    input_stream.play()?;

    let description = format!("cpal out={} in={} @ {} Hz", out_name, in_name, sample_rate);
    Ok((description, output_stream, input_stream))
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "Unknown".into())
}

impl DuplexAudio for CpalAudio {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> u64 {
        self.input_clock.load(Ordering::Acquire)
    }

    fn play(&self, samples: &[f32]) -> Result<u64> {
        let mut queue = lock(&self.output_queue);
        // Input and output streams start together, so the input clock stands in for both
        let index = self.now() + queue.len() as u64;
        queue.extend(samples.iter().copied());
        Ok(index)
    }

    fn capture(&self, num_samples: usize) -> Result<CaptureBuffer> {
        let start = self.now();
        let end = start + num_samples as u64;
        let window = Duration::from_secs_f64(num_samples as f64 / self.sample_rate as f64);
        let deadline = Instant::now() + window + Duration::from_secs(1);

        loop {
            {
                let history = lock(&self.input);
                if history.end_index() >= end {
                    let samples = history
                        .copy_range(start, end)
                        .context("Capture window fell out of the input history")?;
                    return Ok(CaptureBuffer::new(start, samples));
                }
            }
            if Instant::now() > deadline {
                anyhow::bail!(
                    "Input stream stalled: wanted samples up to {}, clock at {}",
                    end,
                    self.now()
                );
            }
            std::thread::sleep(CAPTURE_POLL);
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

impl Drop for CpalAudio {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }
}

/// List all available audio input and output devices.
pub fn list_devices(sample_rate: u32) -> Result<()> {
    let host = cpal::default_host();
    println!("Audio host: {:?}", host.id());

    let default_out = host.default_output_device().map(|d| device_name(&d));
    let default_in = host.default_input_device().map(|d| device_name(&d));

    println!("\n--- Output Devices ---");
    if let Ok(devices) = host.output_devices() {
        for (i, device) in devices.enumerate() {
            let name = device_name(&device);
            let marker = if Some(&name) == default_out.as_ref() { " (default)" } else { "" };
            let supported = device
                .supported_output_configs()
                .map(|mut configs| {
                    configs.any(|c| c.min_sample_rate() <= sample_rate && c.max_sample_rate() >= sample_rate)
                })
                .unwrap_or(false);
            println!("  [{}] {}{} {} Hz: {}", i, name, marker, sample_rate, yes_no(supported));
        }
    }

    println!("\n--- Input Devices ---");
    if let Ok(devices) = host.input_devices() {
        for (i, device) in devices.enumerate() {
            let name = device_name(&device);
            let marker = if Some(&name) == default_in.as_ref() { " (default)" } else { "" };
            let supported = device
                .supported_input_configs()
                .map(|mut configs| {
                    configs.any(|c| c.min_sample_rate() <= sample_rate && c.max_sample_rate() >= sample_rate)
                })
                .unwrap_or(false);
            println!("  [{}] {}{} {} Hz: {}", i, name, marker, sample_rate, yes_no(supported));
        }
    }

    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "supported"
    } else {
        "not supported"
    }
}

/// Result of playing a chirp and finding it again in the microphone signal.
#[derive(Debug, Clone, Copy)]
pub struct SelfTestReport {
    pub emitted_at: u64,
    pub detected_at: u64,
    pub correlation_score: f32,
    pub valid: bool,
    pub sample_rate: u32,
}

impl SelfTestReport {
    /// Output-to-input latency plus the speaker-to-mic flight time, in seconds.
    pub fn loop_delay_secs(&self) -> f64 {
        (self.detected_at as f64 - self.emitted_at as f64) / self.sample_rate as f64
    }
}

/// Play one chirp and detect it on the same device, checking the acoustic path.
pub fn self_test(
    audio: &dyn DuplexAudio,
    spec: &ChirpSpec,
    detector_config: DetectorConfig,
) -> Result<SelfTestReport> {
    const LEAD_SECS: f32 = 0.1;
    let signal = chirp::ranging_signal(spec, LEAD_SECS, 0.3);
    let reference = chirp::generate(spec);
    let detector = Detector::new(spec, detector_config);

    let lead = (LEAD_SECS * spec.sample_rate_hz as f32) as u64;
    let window = signal.len() + (0.2 * spec.sample_rate_hz as f32) as usize;

    std::thread::scope(|scope| -> Result<SelfTestReport> {
        let capture = scope.spawn(|| audio.capture(window));
        let emitted_at = audio.play(&signal)? + lead;
        let capture = capture
            .join()
            .map_err(|_| anyhow::anyhow!("Capture thread panicked"))??;

        let from = capture.offset_of(emitted_at);
        let event = detector
            .detect(&capture, &reference, from..capture.len())
            .context("Self-test capture too short")?;
        tracing::info!(
            emitted_at,
            detected_at = event.sample_index,
            score = event.correlation_score,
            valid = event.valid,
            "Self-test detection"
        );
        Ok(SelfTestReport {
            emitted_at,
            detected_at: event.sample_index,
            correlation_score: event.correlation_score,
            valid: event.valid,
            sample_rate: spec.sample_rate_hz,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_buffer_offsets() {
        let buf = CaptureBuffer::new(1000, vec![0.0; 50]);
        assert_eq!(buf.end_index(), 1050);
        assert_eq!(buf.offset_of(1010), 10);
        assert_eq!(buf.offset_of(500), 0);
        assert_eq!(buf.offset_of(5000), 50);
    }

    #[test]
    fn test_input_history_drops_oldest() {
        let mut history = InputHistory::new(4);
        history.push([1.0, 2.0, 3.0].into_iter());
        history.push([4.0, 5.0, 6.0].into_iter());

        assert_eq!(history.start_index, 2);
        assert_eq!(history.end_index(), 6);
        assert_eq!(history.copy_range(3, 5), Some(vec![4.0, 5.0]));
        assert_eq!(history.copy_range(0, 3), None);
        assert_eq!(history.copy_range(4, 7), None);
    }
}
