/// Integration test: two sessions ranging each other in a simulated room.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use beepbeep::audio::simulated::{DevicePlacement, RoomConfig, SimulatedDevice, SimulatedRoom};
use beepbeep::comms::memory::MemoryChannel;
use beepbeep::config::{Calibration, RangingConfig};
use beepbeep::error::RangingError;
use beepbeep::ranging::engine::{EngineHandle, RangingEngine, RangingEvent};
use beepbeep::ranging::history::{History, RangingResult};
use beepbeep::ranging::session::RangingSession;
use beepbeep::ranging::state::{Role, SessionState};
use tokio::sync::broadcast::Receiver;
use uuid::Uuid;

struct Setup {
    room: SimulatedRoom,
    initiator_audio: SimulatedDevice,
    responder_audio: SimulatedDevice,
    initiator: EngineHandle,
    initiator_events: Receiver<RangingEvent>,
    responder: EngineHandle,
    responder_events: Receiver<RangingEvent>,
}

fn session(role: Role, config: RangingConfig, placement: &DevicePlacement) -> RangingSession {
    let history = Arc::new(RwLock::new(History::new(
        config.history_capacity,
        config.outlier,
        config.smoothing,
    )));
    let calibration = Calibration {
        speaker_to_mic_distance_m: placement.speaker_to_mic_m,
    };
    RangingSession::new(role, Uuid::new_v4(), config, calibration, history).unwrap()
}

fn start(distance: f64, config: RangingConfig) -> Setup {
    let room = SimulatedRoom::new(RoomConfig::default());
    // Device clocks are unrelated and the target's speaker lags
    let anchor = DevicePlacement {
        clock_offset_samples: 9_000_000,
        ..DevicePlacement::at(0.0)
    };
    let target = DevicePlacement {
        clock_offset_samples: 123,
        output_latency_samples: 48,
        ..DevicePlacement::at(distance)
    };
    let responder_audio = room.add_device(anchor);
    let initiator_audio = room.add_device(target);

    let (anchor_end, target_end) = MemoryChannel::pair();
    let (responder, responder_events) = RangingEngine::spawn(
        session(Role::Responder, config, &anchor),
        Arc::new(responder_audio.clone()),
        Arc::new(anchor_end),
    );
    let (initiator, initiator_events) = RangingEngine::spawn(
        session(Role::Initiator, config, &target),
        Arc::new(initiator_audio.clone()),
        Arc::new(target_end),
    );

    Setup {
        room,
        initiator_audio,
        responder_audio,
        initiator,
        initiator_events,
        responder,
        responder_events,
    }
}

/// Next event matching `pick`, or `None` once `within` has passed.
async fn wait_for<T>(
    events: &mut Receiver<RangingEvent>,
    within: Duration,
    mut pick: impl FnMut(RangingEvent) -> Option<T>,
) -> Option<T> {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return Some(found);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

fn result(event: RangingEvent) -> Option<RangingResult> {
    match event {
        RangingEvent::Result(r) => Some(r),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measures_true_distance_on_both_devices() {
    let mut setup = start(1.2, RangingConfig::default());
    let truth = setup.room.true_distance(&setup.initiator_audio, &setup.responder_audio);

    let mut measured = Vec::new();
    for _ in 0..3 {
        let r = wait_for(&mut setup.initiator_events, Duration::from_secs(10), result)
            .await
            .expect("no ranging result");
        assert!(
            (r.distance_meters - truth).abs() < 0.05,
            "seq {}: measured {:.4} m, true {:.4} m",
            r.sequence_number,
            r.distance_meters,
            truth
        );
        measured.push(r);
    }

    // The responder learns the same numbers from DISTANCE_RESULT
    let last = measured.last().unwrap().clone();
    let echoed = wait_for(&mut setup.responder_events, Duration::from_secs(5), |e| {
        result(e).filter(|r| r.sequence_number == last.sequence_number)
    })
    .await
    .expect("responder never reported the last sequence");
    assert_eq!(echoed.distance_meters, last.distance_meters);

    let snapshot = setup.initiator.snapshot();
    assert!(snapshot.all.count >= 3);
    assert!((snapshot.all.mean.unwrap() - truth).abs() < 0.05);

    assert_eq!(setup.initiator.shutdown().await.unwrap(), None);
    setup.responder.join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peer_degrades_then_recovers() {
    let mut config = RangingConfig::default();
    config.max_consecutive_failures = 2;
    let mut setup = start(0.8, config);
    setup.responder_audio.set_muted(true);

    let degraded = wait_for(&mut setup.initiator_events, Duration::from_secs(15), |e| match e {
        RangingEvent::Degraded {
            consecutive_failures,
        } => Some(consecutive_failures),
        RangingEvent::Result(r) => panic!("unexpected result {:?}", r),
        _ => None,
    })
    .await
    .expect("session never degraded");
    assert_eq!(degraded, 2);

    let snapshot = setup.initiator.snapshot();
    assert_eq!(snapshot.all.count, 0);
    assert!(snapshot.consecutive_failures >= 2);
    assert!(setup.initiator.history().read().unwrap().is_empty());
    assert!(!setup.initiator.state().is_stopped());
    assert!(!setup.responder.state().is_stopped());

    setup.responder_audio.set_muted(false);
    let recovered = wait_for(&mut setup.initiator_events, Duration::from_secs(15), |e| {
        matches!(e, RangingEvent::Recovered).then_some(())
    })
    .await;
    assert!(recovered.is_some(), "session never recovered");
    assert_eq!(setup.initiator.snapshot().consecutive_failures, 0);

    setup.initiator.shutdown().await.unwrap();
    setup.responder.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_going_away_stops_the_session() {
    let mut setup = start(0.5, RangingConfig::default());

    let armed = wait_for(&mut setup.initiator_events, Duration::from_secs(5), |e| {
        matches!(e, RangingEvent::StateChanged(SessionState::Armed)).then_some(())
    })
    .await;
    assert!(armed.is_some());

    assert_eq!(setup.responder.shutdown().await.unwrap(), None);
    let stopped = wait_for(&mut setup.initiator_events, Duration::from_secs(5), |e| match e {
        RangingEvent::Stopped(err) => Some(err),
        _ => None,
    })
    .await
    .expect("initiator kept running");
    assert_eq!(stopped, Some(RangingError::Disconnected));
    assert_eq!(setup.initiator.state(), SessionState::Stopped);
}
