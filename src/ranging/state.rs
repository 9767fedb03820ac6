/// Session roles and states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side drives the exchange.
///
/// The initiator (the target device) sends `RANGING_START`, chirps first and
/// computes the distance. The responder (the anchor) echoes the start, chirps
/// after a fixed delay and learns the distance from `DISTANCE_RESULT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connected,
    Armed,
    Emitting { seq: u64 },
    Listening { seq: u64 },
    Correlating { seq: u64 },
    Reconciling { seq: u64 },
    Reporting { seq: u64 },
    Stopped,
}

impl SessionState {
    /// Sequence number being worked on, if any.
    pub fn sequence(&self) -> Option<u64> {
        match *self {
            SessionState::Emitting { seq }
            | SessionState::Listening { seq }
            | SessionState::Correlating { seq }
            | SessionState::Reconciling { seq }
            | SessionState::Reporting { seq } => Some(seq),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Armed => "armed",
            SessionState::Emitting { .. } => "emitting",
            SessionState::Listening { .. } => "listening",
            SessionState::Correlating { .. } => "correlating",
            SessionState::Reconciling { .. } => "reconciling",
            SessionState::Reporting { .. } => "reporting",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence() {
            Some(seq) => write!(f, "{}#{}", self.name(), seq),
            None => write!(f, "{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_sequence() {
        assert_eq!(SessionState::Listening { seq: 3 }.to_string(), "listening#3");
        assert_eq!(SessionState::Armed.to_string(), "armed");
        assert_eq!(SessionState::Stopped.sequence(), None);
    }

    #[test]
    fn test_role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::Responder).unwrap(), "\"responder\"");
        assert_eq!(Role::Initiator.peer(), Role::Responder);
    }
}
