/// JSON serialization of control messages.

use serde::Deserialize;

use super::message::{Envelope, Message, PROTOCOL_VERSION};
use crate::error::{RangingError, Result};

/// Serialize a Message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    if let Some(value) = non_finite_field(msg) {
        return Err(RangingError::MalformedMessage(format!(
            "{} carries a non-finite value {}",
            msg.kind(),
            value
        )));
    }
    Ok(serde_json::to_vec(&Envelope::new(msg.clone()))?)
}

/// Deserialize a Message from bytes.
///
/// Missing fields, wrongly typed fields, unknown message types and foreign
/// protocol versions are all `MalformedMessage`.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    let envelope: Envelope = serde_json::from_slice(data)?;
    if envelope.version != PROTOCOL_VERSION {
        tracing::warn!("Unknown protocol version: {}", envelope.version);
        return Err(RangingError::MalformedMessage(format!(
            "unsupported protocol version {} (expected {})",
            envelope.version, PROTOCOL_VERSION
        )));
    }
    Ok(envelope.message)
}

/// Protocol version a frame claims, even when the rest of it cannot be decoded.
pub fn frame_version(data: &[u8]) -> Option<u8> {
    #[derive(Deserialize)]
    struct Versioned {
        version: u8,
    }
    serde_json::from_slice::<Versioned>(data).ok().map(|v| v.version)
}

// JSON has no NaN or infinity, so reject them before they turn into `null`
fn non_finite_field(msg: &Message) -> Option<f64> {
    let value = match msg {
        Message::SyncRequest {
            speaker_to_mic_distance_m,
            ..
        } => *speaker_to_mic_distance_m,
        Message::DetectionResult {
            local_delta_seconds,
            ..
        } => *local_delta_seconds,
        Message::DistanceResult {
            distance_meters, ..
        } => *distance_meters,
        Message::RangingStart { .. } => return None,
    };
    (!value.is_finite()).then_some(value)
}
