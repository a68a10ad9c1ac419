//! Session/dialog state and notifications.
//!
//! The state machine in [`machine`] is the only writer of the session
//! state; every other component observes it through `SessionEvent`
//! notifications broadcast by the runtime.

pub mod machine;

use serde::{Deserialize, Serialize};

use crate::protocol::WireListenMode;

pub use machine::{Action, SessionMachine, ToolFamily};

/// Dialog states. Transitions are owned by `SessionMachine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Speaking,
    Aborting,
}

/// How an utterance ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Stop automatically on end-of-utterance (silence timeout).
    #[default]
    AutoStop,
    /// The user explicitly stops listening.
    Manual,
    /// Full-duplex: keep capturing during TTS, interrupt on user speech.
    Realtime,
}

impl ListeningMode {
    pub fn to_wire(self) -> WireListenMode {
        match self {
            ListeningMode::AutoStop => WireListenMode::Auto,
            ListeningMode::Manual => WireListenMode::Manual,
            ListeningMode::Realtime => WireListenMode::Realtime,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: ListeningMode,
    /// Allow the wake word to interrupt active TTS.
    pub wake_barge_in: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: ListeningMode::AutoStop,
            wake_barge_in: false,
        }
    }
}

/// Notifications published by the session runtime.
///
/// Front-ends subscribe to these; nothing in the core blocks on a slow
/// subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Human-readable reason for user-visible failures.
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Recognized user speech relayed by the service.
    Transcript { text: String },
    /// A TTS sentence is about to play.
    TtsSentence { text: String },
    /// A wake word fired.
    WakeWord { keyword: String, confidence: f32 },
    /// Non-recoverable failure surfaced to the UI.
    Error { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionState::Listening).unwrap(),
            "\"listening\""
        );
    }

    #[test]
    fn mode_maps_to_wire_names() {
        assert_eq!(
            serde_json::to_value(ListeningMode::AutoStop.to_wire()).unwrap(),
            "auto"
        );
        assert_eq!(
            serde_json::to_value(ListeningMode::Realtime.to_wire()).unwrap(),
            "realtime"
        );
    }

    #[test]
    fn event_carries_kind_tag() {
        let event = SessionEvent::StateChanged {
            state: SessionState::Idle,
            session_id: None,
            detail: Some("transport failed".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "state_changed");
        assert_eq!(json["state"], "idle");
        assert_eq!(json["detail"], "transport failed");
    }
}
