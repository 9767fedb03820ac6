/// Control messages exchanged between the two ranging devices.
///
/// Wire format is one JSON object per frame:
/// `{"version": 1, "type": "RANGING_START", "sequence_number": 7}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::chirp::ChirpSpec;
use crate::ranging::state::Role;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Calibration and configuration handshake, sent by both sides on connect.
    SyncRequest {
        device_id: Uuid,
        role: Role,
        chirp: ChirpSpec,
        speaker_to_mic_distance_m: f64,
    },
    RangingStart {
        sequence_number: u64,
    },
    DetectionResult {
        sequence_number: u64,
        local_delta_seconds: f64,
        valid: bool,
    },
    DistanceResult {
        sequence_number: u64,
        distance_meters: f64,
    },
}

impl Message {
    /// Sequence number the message belongs to, if any.
    pub fn sequence_number(&self) -> Option<u64> {
        match self {
            Message::SyncRequest { .. } => None,
            Message::RangingStart { sequence_number }
            | Message::DetectionResult { sequence_number, .. }
            | Message::DistanceResult { sequence_number, .. } => Some(*sequence_number),
        }
    }

    /// Wire name of the message type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SyncRequest { .. } => "SYNC_REQUEST",
            Message::RangingStart { .. } => "RANGING_START",
            Message::DetectionResult { .. } => "DETECTION_RESULT",
            Message::DistanceResult { .. } => "DISTANCE_RESULT",
        }
    }
}

/// Versioned wrapper that is actually serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }
}
