/// Async driver that connects a [`RangingSession`] to real audio and a channel.
///
/// Blocking work (socket reads, captures, playback) runs on the blocking pool
/// and reports back through one input queue, so the session only ever sees one
/// input at a time.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::audio::device::{CaptureBuffer, DuplexAudio};
use crate::comms::channel::CommChannel;
use crate::error::RangingError;
use crate::protocol::codec::{decode_message, encode_message, frame_version};
use crate::protocol::message::{Message, PROTOCOL_VERSION};

use super::history::{History, RangingResult};
use super::session::{AbandonReason, Action, RangingSession};
use super::state::SessionState;
use super::stats::StatisticsSnapshot;

/// What subscribers hear about a running session.
#[derive(Debug, Clone)]
pub enum RangingEvent {
    StateChanged(SessionState),
    Result(RangingResult),
    Abandoned { seq: u64, reason: AbandonReason },
    Degraded { consecutive_failures: u32 },
    Recovered,
    /// The session ended; `Some` when it ended because of an error.
    Stopped(Option<RangingError>),
}

enum EngineInput {
    Message(Message),
    Malformed(RangingError),
    ForeignVersion(u8),
    Disconnected,
    Emitted { seq: u64, index: u64 },
    Captured { seq: u64, capture: CaptureBuffer },
    AudioFailed { seq: u64, error: String },
}

enum Step {
    Stop,
    Input(EngineInput),
    Tick,
}

/// Control surface for a spawned session.
pub struct EngineHandle {
    state_rx: watch::Receiver<SessionState>,
    events: broadcast::Sender<RangingEvent>,
    stop_tx: watch::Sender<bool>,
    history: Arc<RwLock<History>>,
    task: JoinHandle<Option<RangingError>>,
}

impl EngineHandle {
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch state changes as they happen.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RangingEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> Arc<RwLock<History>> {
        self.history.clone()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .snapshot()
    }

    pub fn latest(&self) -> Option<RangingResult> {
        self.history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .latest()
            .cloned()
    }

    /// Ask the session to stop; it finishes after the current input.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end. Returns the error that ended it, if any.
    pub async fn join(self) -> Result<Option<RangingError>> {
        let outcome = self.task.await?;
        Ok(outcome)
    }

    pub async fn shutdown(self) -> Result<Option<RangingError>> {
        self.stop();
        self.join().await
    }
}

pub struct RangingEngine {
    session: RangingSession,
    audio: Arc<dyn DuplexAudio>,
    channel: Arc<dyn CommChannel>,
    inputs_tx: mpsc::UnboundedSender<EngineInput>,
    events: broadcast::Sender<RangingEvent>,
    state_tx: watch::Sender<SessionState>,
    error: Option<RangingError>,
}

impl RangingEngine {
    /// Start driving `session` over an already connected `channel`.
    ///
    /// The returned receiver sees every event from the very first one.
    pub fn spawn(
        session: RangingSession,
        audio: Arc<dyn DuplexAudio>,
        channel: Arc<dyn CommChannel>,
    ) -> (EngineHandle, broadcast::Receiver<RangingEvent>) {
        let (events, event_rx) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(session.state());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let history = session.history();

        let span = tracing::info_span!(
            "session",
            role = %session.role(),
            device = %session.device_id(),
        );
        tracing::info!(
            parent: &span,
            channel = %channel.description(),
            audio = %audio.description(),
            "Ranging session starting"
        );

        let engine = RangingEngine {
            session,
            audio,
            channel,
            inputs_tx,
            events: events.clone(),
            state_tx,
            error: None,
        };
        let task = tokio::spawn(engine.run(inputs_rx, stop_rx).instrument(span));

        let handle = EngineHandle {
            state_rx,
            events,
            stop_tx,
            history,
            task,
        };
        (handle, event_rx)
    }

    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<EngineInput>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Option<RangingError> {
        self.spawn_reader();
        let actions = self.session.on_connected(Instant::now());
        self.perform(actions).await;

        while !self.session.state().is_stopped() {
            let wake = self.session.next_wakeup();
            let timer = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let step = tokio::select! {
                changed = stop_rx.changed() => match changed {
                    Ok(()) if !*stop_rx.borrow() => continue,
                    // A dropped handle also stops the session
                    _ => Step::Stop,
                },
                input = inputs.recv() => match input {
                    Some(input) => Step::Input(input),
                    None => Step::Stop,
                },
                _ = timer => Step::Tick,
            };

            let now = Instant::now();
            let actions = match step {
                Step::Stop => {
                    self.session.stop();
                    Vec::new()
                }
                Step::Tick => self.session.on_tick(now),
                Step::Input(input) => self.handle_input(input, now),
            };
            self.perform(actions).await;
        }

        if let Err(e) = self.channel.close() {
            tracing::debug!(error = %e, "Closing channel failed");
        }
        let error = self.error.take();
        match &error {
            Some(err) => tracing::warn!(error = %err, "Ranging session ended"),
            None => tracing::info!("Ranging session ended"),
        }
        let _ = self.events.send(RangingEvent::Stopped(error.clone()));
        error
    }

    fn handle_input(&mut self, input: EngineInput, now: Instant) -> Vec<Action> {
        match input {
            EngineInput::Message(message) => match self.session.on_message(message, now) {
                Ok(actions) => actions,
                Err(err) => {
                    self.error = Some(err);
                    Vec::new()
                }
            },
            EngineInput::Malformed(err) => {
                tracing::warn!(error = %err, "Dropping malformed message");
                Vec::new()
            }
            EngineInput::ForeignVersion(version) => {
                let err = RangingError::ConfigMismatch(format!(
                    "peer speaks protocol version {}, we speak {}",
                    version, PROTOCOL_VERSION
                ));
                tracing::error!(error = %err, "Cannot range with this peer");
                self.session.stop();
                self.error = Some(err);
                Vec::new()
            }
            EngineInput::Disconnected => {
                self.session.on_disconnected();
                self.error.get_or_insert(RangingError::Disconnected);
                Vec::new()
            }
            EngineInput::Emitted { seq, index } => self.session.on_emitted(seq, index, now),
            EngineInput::Captured { seq, capture } => self.session.on_capture(seq, &capture, now),
            EngineInput::AudioFailed { seq, error } => {
                tracing::error!(seq, error = %error, "Audio failure");
                self.session.on_audio_failed(seq, now)
            }
        }
    }

    async fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(message) => {
                    let bytes = match encode_message(&message) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            tracing::error!(
                                error = %err,
                                kind = message.kind(),
                                "Message could not be encoded"
                            );
                            self.session.stop();
                            self.error.get_or_insert(err);
                            continue;
                        }
                    };
                    if let Err(e) = self.send(bytes).await {
                        tracing::warn!(error = %e, kind = message.kind(), "Send failed");
                        self.session.on_disconnected();
                        self.error.get_or_insert(RangingError::Disconnected);
                    }
                }
                Action::StartListening {
                    seq,
                    capture_samples,
                    emit_after,
                } => self.start_listening(seq, capture_samples, emit_after),
                Action::Report(result) => {
                    let _ = self.events.send(RangingEvent::Result(result));
                }
                Action::Abandoned { seq, reason } => {
                    let _ = self.events.send(RangingEvent::Abandoned { seq, reason });
                }
                Action::Degraded {
                    consecutive_failures,
                } => {
                    let _ = self.events.send(RangingEvent::Degraded {
                        consecutive_failures,
                    });
                }
                Action::Recovered => {
                    let _ = self.events.send(RangingEvent::Recovered);
                }
            }
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let state = self.session.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            let _ = self.events.send(RangingEvent::StateChanged(state));
        }
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let channel = self.channel.clone();
        tokio::task::spawn_blocking(move || channel.send_message(&bytes)).await??;
        Ok(())
    }

    /// Open the listening window: capture now, play our chirp `emit_after` in.
    fn start_listening(&self, seq: u64, capture_samples: usize, emit_after: Duration) {
        let span = tracing::Span::current();

        let audio = self.audio.clone();
        let tx = self.inputs_tx.clone();
        let capture_span = span.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = capture_span.enter();
            let input = match audio.capture(capture_samples) {
                Ok(capture) => EngineInput::Captured { seq, capture },
                Err(e) => EngineInput::AudioFailed {
                    seq,
                    error: format!("{:#}", e),
                },
            };
            let _ = tx.send(input);
        });

        let audio = self.audio.clone();
        let tx = self.inputs_tx.clone();
        let reference = self.session.reference();
        tokio::spawn(
            async move {
                tokio::time::sleep(emit_after).await;
                let played = tokio::task::spawn_blocking(move || audio.play(&reference)).await;
                let input = match played {
                    Ok(Ok(index)) => EngineInput::Emitted { seq, index },
                    Ok(Err(e)) => EngineInput::AudioFailed {
                        seq,
                        error: format!("{:#}", e),
                    },
                    Err(e) => EngineInput::AudioFailed {
                        seq,
                        error: e.to_string(),
                    },
                };
                let _ = tx.send(input);
            }
            .instrument(span),
        );
    }

    fn spawn_reader(&self) {
        let channel = self.channel.clone();
        let tx = self.inputs_tx.clone();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            loop {
                let input = match channel.recv_message() {
                    Ok(bytes) => match decode_message(&bytes) {
                        Ok(message) => EngineInput::Message(message),
                        Err(err) => match frame_version(&bytes) {
                            Some(version) if version != PROTOCOL_VERSION => {
                                EngineInput::ForeignVersion(version)
                            }
                            _ => EngineInput::Malformed(err),
                        },
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "Channel reader finished");
                        let _ = tx.send(EngineInput::Disconnected);
                        break;
                    }
                };
                if tx.send(input).is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{DevicePlacement, RoomConfig, SimulatedRoom};
    use crate::comms::memory::MemoryChannel;
    use crate::config::{Calibration, RangingConfig};
    use crate::ranging::state::Role;
    use uuid::Uuid;

    fn responder() -> (RangingSession, Arc<dyn DuplexAudio>) {
        responder_with(Calibration::default())
    }

    fn responder_with(calibration: Calibration) -> (RangingSession, Arc<dyn DuplexAudio>) {
        let config = RangingConfig::default();
        let history = Arc::new(RwLock::new(History::new(
            config.history_capacity,
            config.outlier,
            config.smoothing,
        )));
        let session =
            RangingSession::new(Role::Responder, Uuid::new_v4(), config, calibration, history).unwrap();
        let room = SimulatedRoom::new(RoomConfig::default());
        let audio: Arc<dyn DuplexAudio> = Arc::new(room.add_device(DevicePlacement::at(0.0)));
        (session, audio)
    }

    #[tokio::test]
    async fn test_announces_itself_and_survives_garbage() {
        let (session, audio) = responder();
        let (local, remote) = MemoryChannel::pair();
        let (handle, _events) = RangingEngine::spawn(session, audio, Arc::new(local));

        let remote = Arc::new(remote);
        let r = remote.clone();
        let first = tokio::task::spawn_blocking(move || r.recv_message()).await.unwrap().unwrap();
        assert!(matches!(decode_message(&first).unwrap(), Message::SyncRequest { role: Role::Responder, .. }));

        remote.send_message(b"not json").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(handle.state(), SessionState::Connected);

        remote.close().unwrap();
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome, Some(RangingError::Disconnected));
    }

    #[tokio::test]
    async fn test_foreign_protocol_version_is_fatal() {
        let (session, audio) = responder();
        let (local, remote) = MemoryChannel::pair();
        let (handle, _events) = RangingEngine::spawn(session, audio, Arc::new(local));

        remote
            .send_message(br#"{"version":2,"type":"SYNC_REQUEST","device_id":"x"}"#)
            .unwrap();
        let outcome = handle.join().await.unwrap();
        assert!(matches!(outcome, Some(RangingError::ConfigMismatch(_))));
    }

    #[tokio::test]
    async fn test_stop_ends_session_cleanly() {
        let (session, audio) = responder();
        let (local, _remote) = MemoryChannel::pair();
        let (handle, mut events) = RangingEngine::spawn(session, audio, Arc::new(local));

        handle.stop();
        let mut stopped = None;
        while let Ok(event) = events.recv().await {
            if let RangingEvent::Stopped(err) = event {
                stopped = Some(err);
                break;
            }
        }
        assert_eq!(stopped, Some(None));
        assert_eq!(handle.join().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unencodable_message_ends_session_with_error() {
        let (session, audio) = responder_with(Calibration {
            speaker_to_mic_distance_m: f64::NAN,
        });
        let (local, _remote) = MemoryChannel::pair();
        let (handle, _events) = RangingEngine::spawn(session, audio, Arc::new(local));

        let outcome = handle.join().await.unwrap();
        assert!(matches!(outcome, Some(RangingError::MalformedMessage(_))));
    }
}
