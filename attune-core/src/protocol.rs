//! Control-plane wire protocol (JSON over text frames).
//!
//! Client→server: `hello`, `listen`, `abort`, plus `mcp`/`iot` tool-result
//! envelopes. Server→client: `hello` (ack with session id), `tts`, `stt`,
//! `abort`, and `mcp`/`iot` tool-call envelopes.
//!
//! Both the `iot` and `mcp` families are accepted while the server side is
//! mid-migration and either may carry the JSON-RPC envelope.
//!
//! Unknown message types and malformed JSON are a log-and-drop concern for
//! the caller; parsing never aborts the session.

use serde::{Deserialize, Serialize};

use crate::error::{AttuneError, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Negotiated audio-plane parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".into(),
            sample_rate: 16_000,
            channels: 1,
            frame_duration_ms: 60,
        }
    }
}

/// Listening mode on the wire: `auto` maps to AUTO_STOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireListenMode {
    Auto,
    Manual,
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    WakeWordDetected,
    UserInterrupt,
}

/// Messages this client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        version: u32,
        transport: String,
        audio_params: AudioParams,
    },
    Listen {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        mode: WireListenMode,
        state: ListenState,
        /// Carries the detected wake-word keyword when `state == Detect`.
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Abort {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        reason: AbortReason,
    },
    Mcp {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        payload: serde_json::Value,
    },
    Iot {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        payload: serde_json::Value,
    },
}

impl ClientMessage {
    pub fn hello(transport: &str) -> Self {
        ClientMessage::Hello {
            version: PROTOCOL_VERSION,
            transport: transport.to_string(),
            audio_params: AudioParams::default(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| AttuneError::Protocol(e.to_string()))
    }
}

/// Messages this client receives.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    Tts {
        state: TtsState,
        #[serde(default)]
        text: Option<String>,
    },
    Stt {
        text: String,
    },
    Abort {
        #[serde(default)]
        reason: Option<AbortReason>,
    },
    Mcp {
        payload: serde_json::Value,
    },
    Iot {
        payload: serde_json::Value,
    },
}

/// Parse a server text frame.
///
/// Malformed JSON yields `AttuneError::Protocol`; an unknown `type` yields
/// `Ok(None)` so the caller can log and drop without tearing the session.
pub fn parse_server_message(raw: &str) -> Result<Option<ServerMessage>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| AttuneError::Protocol(format!("bad JSON: {e}")))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| AttuneError::Protocol("missing message type".into()))?
        .to_string();

    match serde_json::from_value::<ServerMessage>(value) {
        Ok(msg) => Ok(Some(msg)),
        Err(e) => {
            // Known shape mismatch is a protocol error; an unrecognized tag
            // is merely dropped.
            if matches!(
                kind.as_str(),
                "hello" | "tts" | "stt" | "abort" | "mcp" | "iot"
            ) {
                Err(AttuneError::Protocol(format!("malformed {kind}: {e}")))
            } else {
                Ok(None)
            }
        }
    }
}
