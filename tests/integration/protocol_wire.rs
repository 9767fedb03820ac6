/// Integration test: control messages through codec and transport.

use std::thread;

use beepbeep::audio::chirp::ChirpSpec;
use beepbeep::comms::channel::CommChannel;
use beepbeep::comms::memory::MemoryChannel;
use beepbeep::comms::tcp::{TcpChannel, TcpCommListener};
use beepbeep::error::RangingError;
use beepbeep::protocol::codec::{decode_message, encode_message};
use beepbeep::protocol::message::Message;
use beepbeep::ranging::state::Role;
use uuid::Uuid;

fn exchange() -> Vec<Message> {
    vec![
        Message::SyncRequest {
            device_id: Uuid::new_v4(),
            role: Role::Initiator,
            chirp: ChirpSpec::default(),
            speaker_to_mic_distance_m: 0.15,
        },
        Message::RangingStart { sequence_number: 1 },
        Message::DetectionResult {
            sequence_number: 1,
            local_delta_seconds: 0.231_25,
            valid: true,
        },
        Message::DistanceResult {
            sequence_number: 1,
            distance_meters: 1.4375,
        },
    ]
}

fn send_all(channel: &dyn CommChannel, messages: &[Message]) {
    for msg in messages {
        channel.send_message(&encode_message(msg).unwrap()).unwrap();
    }
}

fn recv_n(channel: &dyn CommChannel, n: usize) -> Vec<Message> {
    (0..n)
        .map(|_| decode_message(&channel.recv_message().unwrap()).unwrap())
        .collect()
}

#[test]
fn test_full_exchange_over_tcp_keeps_order() {
    let listener = TcpCommListener::bind(0).unwrap();
    let port = listener.local_addr().unwrap().port();
    let messages = exchange();

    let expected = messages.clone();
    let anchor = thread::spawn(move || {
        let channel = listener.accept().unwrap();
        let received = recv_n(&channel, expected.len());
        assert_eq!(received, expected);
        // Echo the start back, as a responder does
        send_all(&channel, &received[1..2]);
    });

    let target = TcpChannel::connect(&format!("127.0.0.1:{}", port)).unwrap();
    send_all(&target, &messages);
    let echoed = recv_n(&target, 1);
    assert_eq!(echoed, vec![Message::RangingStart { sequence_number: 1 }]);

    anchor.join().unwrap();
}

#[test]
fn test_memory_channel_carries_the_same_bytes() {
    let (a, b) = MemoryChannel::pair();
    let messages = exchange();
    send_all(&a, &messages);
    assert_eq!(recv_n(&b, messages.len()), messages);
}

#[test]
fn test_malformed_frame_does_not_break_the_stream() {
    let (a, b) = MemoryChannel::pair();

    a.send_message(br#"{"version":1,"type":"RANGING_START"}"#).unwrap();
    a.send_message(&encode_message(&Message::RangingStart { sequence_number: 2 }).unwrap())
        .unwrap();

    let bad = decode_message(&b.recv_message().unwrap());
    assert!(matches!(bad, Err(RangingError::MalformedMessage(_))));
    let good = decode_message(&b.recv_message().unwrap()).unwrap();
    assert_eq!(good.sequence_number(), Some(2));
}

#[test]
fn test_peer_close_surfaces_as_receive_error() {
    let listener = TcpCommListener::bind(0).unwrap();
    let port = listener.local_addr().unwrap().port();

    let anchor = thread::spawn(move || {
        let channel = listener.accept().unwrap();
        let first = channel.recv_message().map(|b| decode_message(&b).unwrap());
        let second = channel.recv_message();
        (first.unwrap(), second.is_err())
    });

    let target = TcpChannel::connect(&format!("127.0.0.1:{}", port)).unwrap();
    target
        .send_message(&encode_message(&Message::RangingStart { sequence_number: 5 }).unwrap())
        .unwrap();
    target.close().unwrap();

    let (first, closed) = anchor.join().unwrap();
    assert_eq!(first, Message::RangingStart { sequence_number: 5 });
    assert!(closed);
}
