/// Error taxonomy for the ranging core.
///
/// Only `Disconnected` and `ConfigMismatch` end a session. Everything else is
/// handled by abandoning the current sequence and carrying on.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RangingError {
    #[error("search window holds {available} samples, reference needs {required}")]
    InsufficientCaptureLength { available: usize, required: usize },

    #[error("no chirp peak detected (best score {best_score:.3})")]
    NoPeakDetected { best_score: f32 },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("sequence mismatch: got {got}, current {current:?}")]
    SequenceMismatch { got: u64, current: Option<u64> },

    #[error("peer disconnected")]
    Disconnected,

    #[error("configuration mismatch with peer: {0}")]
    ConfigMismatch(String),

    #[error("invalid chirp spec: {0}")]
    InvalidChirp(String),

    #[error("invalid ranging configuration: {0}")]
    InvalidConfig(String),
}

impl RangingError {
    /// Whether this error ends the session (reconnection required).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::ConfigMismatch(_))
    }
}

pub type Result<T> = std::result::Result<T, RangingError>;

impl From<serde_json::Error> for RangingError {
    fn from(err: serde_json::Error) -> Self {
        RangingError::MalformedMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_disconnect_and_config_mismatch_are_fatal() {
        assert!(RangingError::Disconnected.is_fatal());
        assert!(RangingError::ConfigMismatch("rate".into()).is_fatal());
        assert!(!RangingError::MalformedMessage("x".into()).is_fatal());
        assert!(!RangingError::NoPeakDetected { best_score: 0.1 }.is_fatal());
        assert!(!RangingError::SequenceMismatch { got: 1, current: Some(2) }.is_fatal());
        assert!(!RangingError::InsufficientCaptureLength { available: 1, required: 2 }.is_fatal());
    }
}
