/// One device's side of the two-chirp exchange.
///
/// The session performs no I/O. Every input (a peer message, an emission
/// report, a finished capture, a clock tick) goes through a method that returns
/// the [`Action`]s the driver has to carry out. Transitions are therefore
/// serialized by construction, and the whole protocol can be exercised in unit
/// tests with hand-made captures.

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::audio::chirp;
use crate::audio::detector::{DetectionEvent, Detector};
use crate::audio::device::CaptureBuffer;
use crate::config::{Calibration, Mode, RangingConfig};
use crate::error::{RangingError, Result};
use crate::protocol::message::Message;

use super::distance::{beepbeep_distance, samples_to_secs};
use super::history::{History, RangingResult};
use super::state::{Role, SessionState};

/// Work the driver must perform on behalf of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Message),
    /// Start capturing `capture_samples` now and play the reference chirp
    /// `emit_after` into the capture.
    StartListening {
        seq: u64,
        capture_samples: usize,
        emit_after: Duration,
    },
    Report(RangingResult),
    Abandoned { seq: u64, reason: AbandonReason },
    Degraded { consecutive_failures: u32 },
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    LocalDetectionFailed,
    PeerDetectionFailed,
    Timeout,
    /// The initiator started a newer sequence.
    Superseded,
    AudioFailed,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbandonReason::LocalDetectionFailed => "local detection failed",
            AbandonReason::PeerDetectionFailed => "peer detection failed",
            AbandonReason::Timeout => "timed out",
            AbandonReason::Superseded => "superseded by a newer sequence",
            AbandonReason::AudioFailed => "audio device failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerInfo {
    device_id: Uuid,
    speaker_to_mic_distance_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DeltaReport {
    delta_secs: f64,
    valid: bool,
}

/// Bookkeeping for the sequence in flight.
#[derive(Debug, Clone)]
struct Exchange {
    seq: u64,
    started_at: Instant,
    window_opened_at: Option<Instant>,
    emission_index: Option<u64>,
    local: Option<DeltaReport>,
    peer: Option<DeltaReport>,
    peer_distance: Option<f64>,
    detection_sent_at: Option<Instant>,
}

impl Exchange {
    fn new(seq: u64, now: Instant) -> Self {
        Self {
            seq,
            started_at: now,
            window_opened_at: None,
            emission_index: None,
            local: None,
            peer: None,
            peer_distance: None,
            detection_sent_at: None,
        }
    }
}

pub struct RangingSession {
    role: Role,
    device_id: Uuid,
    config: RangingConfig,
    calibration: Calibration,
    reference: Arc<Vec<f32>>,
    detector: Detector,
    history: Arc<RwLock<History>>,

    state: SessionState,
    peer: Option<PeerInfo>,
    exchange: Option<Exchange>,
    /// Next sequence number the initiator will start.
    next_seq: u64,
    /// Every sequence at or below this one is finished; its messages are ignored.
    last_resolved: u64,
    deadline: Option<Instant>,
    next_start_at: Option<Instant>,
    degraded: bool,
}

impl RangingSession {
    pub fn new(
        role: Role,
        device_id: Uuid,
        config: RangingConfig,
        calibration: Calibration,
        history: Arc<RwLock<History>>,
    ) -> Result<Self> {
        config.validate()?;
        let reference = Arc::new(chirp::generate(&config.chirp));
        let detector = Detector::new(&config.chirp, config.detector);
        Ok(Self {
            role,
            device_id,
            config,
            calibration,
            reference,
            detector,
            history,
            state: SessionState::Idle,
            peer: None,
            exchange: None,
            next_seq: 1,
            last_resolved: 0,
            deadline: None,
            next_start_at: None,
            degraded: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn peer_device_id(&self) -> Option<Uuid> {
        self.peer.map(|p| p.device_id)
    }

    pub fn config(&self) -> &RangingConfig {
        &self.config
    }

    /// The chirp this device plays and searches for.
    pub fn reference(&self) -> Arc<Vec<f32>> {
        self.reference.clone()
    }

    pub fn history(&self) -> Arc<RwLock<History>> {
        self.history.clone()
    }

    pub fn last_resolved(&self) -> u64 {
        self.last_resolved
    }

    /// When `on_tick` next has something to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let start = match (self.role, self.state, &self.exchange) {
            (Role::Initiator, SessionState::Armed, None) => self.next_start_at,
            _ => None,
        };
        match (self.deadline, start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The transport is up: introduce ourselves.
    pub fn on_connected(&mut self, _now: Instant) -> Vec<Action> {
        if self.state != SessionState::Idle {
            return Vec::new();
        }
        self.transition(SessionState::Connected);
        vec![Action::Send(Message::SyncRequest {
            device_id: self.device_id,
            role: self.role,
            chirp: self.config.chirp,
            speaker_to_mic_distance_m: self.calibration.speaker_to_mic_distance_m,
        })]
    }

    /// Handle a decoded peer message. Only session-ending problems are errors.
    pub fn on_message(&mut self, message: Message, now: Instant) -> Result<Vec<Action>> {
        if self.state.is_stopped() {
            return Ok(Vec::new());
        }
        tracing::debug!(kind = message.kind(), seq = ?message.sequence_number(), state = %self.state, "Peer message");

        if let Message::SyncRequest {
            device_id,
            role,
            chirp,
            speaker_to_mic_distance_m,
        } = message
        {
            self.on_sync(device_id, role, chirp, speaker_to_mic_distance_m, now)?;
            return Ok(Vec::new());
        }
        if self.peer.is_none() {
            tracing::warn!(kind = message.kind(), "Message before SYNC_REQUEST, ignoring");
            return Ok(Vec::new());
        }

        let actions = match message {
            Message::SyncRequest { .. } => Vec::new(),
            Message::RangingStart { sequence_number } => match self.role {
                Role::Responder => self.on_start(sequence_number, now),
                Role::Initiator => self.on_echo(sequence_number, now),
            },
            Message::DetectionResult {
                sequence_number,
                local_delta_seconds,
                valid,
            } => self.on_peer_detection(sequence_number, local_delta_seconds, valid, now),
            Message::DistanceResult {
                sequence_number,
                distance_meters,
            } => self.on_distance(sequence_number, distance_meters, now),
        };
        Ok(actions)
    }

    /// Our chirp has been handed to the speaker at device-clock `emission_index`.
    pub fn on_emitted(&mut self, seq: u64, emission_index: u64, _now: Instant) -> Vec<Action> {
        if self.state != (SessionState::Emitting { seq }) {
            tracing::debug!(seq, state = %self.state, "Late emission report, ignoring");
            return Vec::new();
        }
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.emission_index = Some(emission_index);
        }
        self.transition(SessionState::Listening { seq });
        Vec::new()
    }

    /// Playback or capture for `seq` failed.
    pub fn on_audio_failed(&mut self, seq: u64, now: Instant) -> Vec<Action> {
        if self.current_seq() != Some(seq) {
            return Vec::new();
        }
        self.abandon(AbandonReason::AudioFailed, now)
    }

    /// The listening window for `seq` has closed and its samples are in.
    pub fn on_capture(&mut self, seq: u64, capture: &CaptureBuffer, now: Instant) -> Vec<Action> {
        let emission_index = match (self.state, &self.exchange) {
            (SessionState::Listening { seq: s }, Some(exchange)) if s == seq => exchange.emission_index,
            (SessionState::Emitting { seq: s }, _) if s == seq => None,
            _ => {
                tracing::debug!(seq, state = %self.state, "Capture for a finished sequence, ignoring");
                return Vec::new();
            }
        };
        let Some(emission_index) = emission_index else {
            tracing::warn!(seq, "Window closed before the chirp was emitted");
            return self.abandon(AbandonReason::AudioFailed, now);
        };

        self.transition(SessionState::Correlating { seq });
        let local = self.correlate(capture, emission_index);

        let mut actions = vec![Action::Send(Message::DetectionResult {
            sequence_number: seq,
            local_delta_seconds: local.delta_secs,
            valid: local.valid,
        })];
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.local = Some(local);
            exchange.detection_sent_at = Some(now);
        }
        if !local.valid {
            actions.extend(self.abandon(AbandonReason::LocalDetectionFailed, now));
            return actions;
        }

        self.transition(SessionState::Reconciling { seq });
        self.deadline = Some(now + self.config.response_timeout());
        actions.extend(self.try_resolve(now));
        actions
    }

    /// Time-driven work: timeouts and, for the initiator, starting the next sequence.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        if self.state.is_stopped() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.deadline.is_some_and(|d| now >= d) {
            tracing::warn!(seq = ?self.current_seq(), state = %self.state, "Sequence timed out");
            actions.extend(self.abandon(AbandonReason::Timeout, now));
        }

        let due = self.next_start_at.is_some_and(|t| now >= t);
        if self.role == Role::Initiator && self.state == SessionState::Armed && self.exchange.is_none() && due {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.next_start_at = None;
            self.exchange = Some(Exchange::new(seq, now));
            self.deadline = Some(now + self.config.response_timeout());
            tracing::debug!(seq, "Starting sequence");
            actions.push(Action::Send(Message::RangingStart { sequence_number: seq }));
        }
        actions
    }

    pub fn on_disconnected(&mut self) {
        if !self.state.is_stopped() {
            tracing::warn!(state = %self.state, "Peer disconnected");
        }
        self.shut_down();
    }

    pub fn stop(&mut self) {
        tracing::info!(state = %self.state, "Session stopped");
        self.shut_down();
    }

    fn shut_down(&mut self) {
        self.exchange = None;
        self.deadline = None;
        self.next_start_at = None;
        self.transition(SessionState::Stopped);
    }

    fn on_sync(
        &mut self,
        device_id: Uuid,
        role: Role,
        chirp: crate::audio::chirp::ChirpSpec,
        speaker_to_mic_distance_m: f64,
        now: Instant,
    ) -> Result<()> {
        let mismatch = if role == self.role {
            Some(format!("both devices are configured as {}", role))
        } else if chirp != self.config.chirp {
            Some(format!("chirp spec differs: ours {:?}, peer {:?}", self.config.chirp, chirp))
        } else if !(speaker_to_mic_distance_m.is_finite() && speaker_to_mic_distance_m >= 0.0) {
            Some(format!("peer speaker-to-mic distance {} is not usable", speaker_to_mic_distance_m))
        } else {
            None
        };
        if let Some(reason) = mismatch {
            let err = RangingError::ConfigMismatch(reason);
            tracing::error!(error = %err, "Cannot range with this peer");
            self.shut_down();
            return Err(err);
        }

        self.peer = Some(PeerInfo {
            device_id,
            speaker_to_mic_distance_m,
        });
        if self.state == SessionState::Connected {
            tracing::info!(peer = %device_id, peer_d = speaker_to_mic_distance_m, "Peer synchronized");
            self.transition(SessionState::Armed);
            if self.role == Role::Initiator {
                self.next_start_at = Some(now);
            }
        }
        Ok(())
    }

    /// Responder: the initiator asks for sequence `seq`.
    fn on_start(&mut self, seq: u64, now: Instant) -> Vec<Action> {
        if seq <= self.last_resolved {
            tracing::debug!(seq, last_resolved = self.last_resolved, "Stale RANGING_START, ignoring");
            return Vec::new();
        }
        let mut actions = Vec::new();
        if let Some(current) = self.current_seq() {
            if seq <= current {
                tracing::debug!(seq, current, "Duplicate RANGING_START, ignoring");
                return actions;
            }
            actions.extend(self.abandon(AbandonReason::Superseded, now));
        }
        if self.state != SessionState::Armed {
            return actions;
        }

        self.exchange = Some(Exchange::new(seq, now));
        actions.push(self.open_window(seq, now));
        actions.push(Action::Send(Message::RangingStart { sequence_number: seq }));
        actions
    }

    /// Initiator: the responder echoed our start and is listening.
    fn on_echo(&mut self, seq: u64, now: Instant) -> Vec<Action> {
        if let Err(err) = self.check_sequence(seq) {
            tracing::debug!(error = %err, "Ignoring RANGING_START echo");
            return Vec::new();
        }
        if self.state != SessionState::Armed {
            tracing::debug!(seq, state = %self.state, "Duplicate RANGING_START echo, ignoring");
            return Vec::new();
        }
        vec![self.open_window(seq, now)]
    }

    fn open_window(&mut self, seq: u64, now: Instant) -> Action {
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.window_opened_at = Some(now);
        }
        let capture_samples = self.config.listen_samples();
        let listen = Duration::from_secs_f64(self.config.listen_secs());
        self.deadline = Some(now + listen + self.config.response_timeout());
        self.transition(SessionState::Emitting { seq });
        Action::StartListening {
            seq,
            capture_samples,
            emit_after: self.config.emit_delay(self.role),
        }
    }

    fn on_peer_detection(&mut self, seq: u64, delta_secs: f64, valid: bool, now: Instant) -> Vec<Action> {
        if let Err(err) = self.check_sequence(seq) {
            tracing::debug!(error = %err, "Ignoring DETECTION_RESULT");
            return Vec::new();
        }
        // A delta longer than the listening window cannot come from a real capture
        let plausible = delta_secs.is_finite() && delta_secs.abs() <= self.config.listen_secs();
        if valid && !plausible {
            tracing::warn!(seq, delta_secs, "Peer reported an impossible delta");
        }
        let valid = valid && plausible;
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.peer = Some(DeltaReport { delta_secs, valid });
        }
        match self.state {
            SessionState::Reconciling { .. } => self.try_resolve(now),
            // Not until our own window has closed and been correlated
            SessionState::Armed if !valid => self.abandon(AbandonReason::PeerDetectionFailed, now),
            _ => {
                tracing::debug!(seq, state = %self.state, "Buffered peer detection");
                Vec::new()
            }
        }
    }

    fn on_distance(&mut self, seq: u64, distance: f64, now: Instant) -> Vec<Action> {
        if self.role == Role::Initiator {
            tracing::debug!(seq, "Initiator ignores DISTANCE_RESULT");
            return Vec::new();
        }
        if let Err(err) = self.check_sequence(seq) {
            tracing::debug!(error = %err, "Ignoring DISTANCE_RESULT");
            return Vec::new();
        }
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.peer_distance = Some(distance);
        }
        match self.state {
            SessionState::Reconciling { .. } => self.try_resolve(now),
            _ => Vec::new(),
        }
    }

    /// Finish the sequence if everything it needs has arrived.
    fn try_resolve(&mut self, now: Instant) -> Vec<Action> {
        let Some(exchange) = self.exchange.clone() else {
            return Vec::new();
        };
        let (Some(local), Some(peer_info)) = (exchange.local, self.peer) else {
            return Vec::new();
        };
        if exchange.peer.is_some_and(|p| !p.valid) {
            return self.abandon(AbandonReason::PeerDetectionFailed, now);
        }
        let seq = exchange.seq;

        match self.role {
            Role::Initiator => {
                let Some(peer) = exchange.peer else {
                    return Vec::new();
                };
                let distance = beepbeep_distance(
                    self.config.speed_of_sound,
                    local.delta_secs,
                    peer.delta_secs,
                    self.calibration.speaker_to_mic_distance_m,
                    peer_info.speaker_to_mic_distance_m,
                );
                let round_trip = exchange
                    .window_opened_at
                    .map(|t| t.saturating_duration_since(exchange.started_at))
                    .unwrap_or_default();
                if !distance.is_finite() {
                    tracing::warn!(seq, distance, "Distance is not a number");
                    return self.abandon(AbandonReason::PeerDetectionFailed, now);
                }
                self.transition(SessionState::Reporting { seq });
                let mut actions = vec![Action::Send(Message::DistanceResult {
                    sequence_number: seq,
                    distance_meters: distance,
                })];
                actions.extend(self.complete(seq, distance, round_trip, now));
                actions
            }
            Role::Responder => {
                let Some(distance) = exchange.peer_distance else {
                    return Vec::new();
                };
                if !distance.is_finite() {
                    tracing::warn!(seq, distance, "Peer reported a distance that is not a number");
                    return self.abandon(AbandonReason::PeerDetectionFailed, now);
                }
                let round_trip = exchange
                    .detection_sent_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                self.transition(SessionState::Reporting { seq });
                self.complete(seq, distance, round_trip, now)
            }
        }
    }

    fn complete(&mut self, seq: u64, distance: f64, round_trip: Duration, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let recorded = self.write_history().record(seq, distance, round_trip, now);
        if let Some(result) = recorded {
            tracing::info!(
                seq,
                distance_m = result.distance_meters,
                smoothed_m = ?result.smoothed_meters,
                rtt_ms = round_trip.as_secs_f64() * 1000.0,
                "Distance measured"
            );
            actions.push(Action::Report(result));
        }
        self.last_resolved = self.last_resolved.max(seq);
        self.exchange = None;
        self.deadline = None;
        if self.degraded {
            self.degraded = false;
            tracing::info!("Ranging recovered");
            actions.push(Action::Recovered);
        }

        match self.config.mode {
            Mode::Continuous => {
                self.transition(SessionState::Armed);
                if self.role == Role::Initiator {
                    self.next_start_at = Some(now + self.config.interval());
                }
            }
            Mode::SingleShot => self.shut_down(),
        }
        actions
    }

    fn abandon(&mut self, reason: AbandonReason, now: Instant) -> Vec<Action> {
        let Some(exchange) = self.exchange.take() else {
            return Vec::new();
        };
        let seq = exchange.seq;
        tracing::info!(seq, %reason, "Sequence abandoned");

        self.last_resolved = self.last_resolved.max(seq);
        self.deadline = None;
        self.transition(SessionState::Armed);
        if self.role == Role::Initiator {
            self.next_start_at = Some(now + self.config.interval());
        }

        let failures = {
            let mut history = self.write_history();
            history.record_failure();
            history.snapshot().consecutive_failures
        };
        let mut actions = vec![Action::Abandoned { seq, reason }];
        if failures >= self.config.max_consecutive_failures && !self.degraded {
            self.degraded = true;
            tracing::warn!(consecutive_failures = failures, "Ranging degraded");
            actions.push(Action::Degraded {
                consecutive_failures: failures,
            });
        }
        actions
    }

    fn current_seq(&self) -> Option<u64> {
        self.exchange.as_ref().map(|e| e.seq)
    }

    fn check_sequence(&self, seq: u64) -> Result<()> {
        let current = self.current_seq();
        if seq <= self.last_resolved || current != Some(seq) {
            return Err(RangingError::SequenceMismatch { got: seq, current });
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    fn write_history(&self) -> RwLockWriteGuard<'_, History> {
        self.history.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Self and peer search windows, as offsets into the capture.
    fn search_windows(&self, capture: &CaptureBuffer, emission_index: u64) -> (Range<usize>, Range<usize>) {
        let emit = capture.offset_of(emission_index);
        let guard = self.config.secs_to_samples(self.config.timing.self_guard_secs);
        let slack = self.config.secs_to_samples(self.config.timing.self_slack_secs);
        let self_start = emit.saturating_sub(guard);
        let self_end = (emit + self.reference.len() + slack).min(capture.len());
        let peer = match self.role {
            Role::Initiator => self_end..capture.len(),
            Role::Responder => 0..self_start,
        };
        (self_start..self_end, peer)
    }

    fn correlate(&self, capture: &CaptureBuffer, emission_index: u64) -> DeltaReport {
        let (self_window, peer_window) = self.search_windows(capture, emission_index);
        let own = self.detector.detect(capture, &self.reference, self_window);
        let peer = self.detector.detect(capture, &self.reference, peer_window);

        let (own, peer) = match (own, peer) {
            (Ok(own), Ok(peer)) => (own, peer),
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(error = %err, "Detection window unusable");
                return DeltaReport {
                    delta_secs: 0.0,
                    valid: false,
                };
            }
        };
        log_detection("self", &own);
        log_detection("peer", &peer);
        if !(own.valid && peer.valid) {
            return DeltaReport {
                delta_secs: 0.0,
                valid: false,
            };
        }

        let fs = self.config.chirp.sample_rate_hz;
        // Responder's chirp minus initiator's chirp, on this device's clock
        let delta_secs = match self.role {
            Role::Initiator => samples_to_secs(own.sample_index, peer.sample_index, fs),
            Role::Responder => samples_to_secs(peer.sample_index, own.sample_index, fs),
        };
        DeltaReport {
            delta_secs,
            valid: true,
        }
    }
}

fn log_detection(which: &str, event: &DetectionEvent) {
    if event.valid {
        tracing::debug!(which, index = event.sample_index, score = event.correlation_score, "Chirp detected");
    } else {
        let err = RangingError::NoPeakDetected {
            best_score: event.correlation_score,
        };
        tracing::info!(which, error = %err, "Chirp not detected");
    }
}
