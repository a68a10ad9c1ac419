//! Bidirectional message transports.
//!
//! Two variants share one interface: WebSocket (single TLS connection,
//! application-level ping/pong liveness) and MQTT (four-topic layout, QoS 0
//! audio / QoS 1 control). Control messages are JSON text; audio packets are
//! binary, one Opus packet each. MQTT binary frames carry a 4-byte
//! big-endian sequence prefix; WebSocket relies on order-preserving
//! delivery and the receive side numbers packets locally.
//!
//! Reconnection policy (driven by the session layer): backoff 0.5, 1, 2, 4,
//! 8 s capped, jittered ±25 %; after 5 consecutive failures the session
//! drops to IDLE with `TransportFailed`. Each reconnect starts a fresh
//! session; there is no mid-stream resumption.

pub mod mqtt;
pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use mqtt::{MqttConfig, MqttTransport};
pub use websocket::{WebSocketConfig, WebSocketTransport};

/// Transport connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Server-hello handshake timeout.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive reconnect failures before giving up.
pub const MAX_RECONNECT_ATTEMPTS: usize = 5;

/// One message off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    /// A JSON control message.
    Text(String),
    /// One Opus packet with its envelope sequence number.
    Binary { seq: u32, payload: Vec<u8> },
}

/// Duplex message channel to the AI service.
///
/// Implementations own their I/O tasks; `recv` surfaces both inbound
/// messages and connection failures, which is how the session layer learns
/// it must reconnect.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection, authenticating with `token`.
    async fn connect(&mut self, token: &str) -> Result<()>;

    /// Send one JSON control message.
    async fn send_text(&mut self, json: String) -> Result<()>;

    /// Send one Opus packet. `seq` is carried in the envelope where the
    /// variant needs it (MQTT prefix).
    async fn send_binary(&mut self, seq: u32, payload: Vec<u8>) -> Result<()>;

    /// Receive the next message; resolves to an error when the connection
    /// is lost.
    async fn recv(&mut self) -> Result<TransportMessage>;

    /// Close the connection and stop the I/O tasks.
    async fn close(&mut self) -> Result<()>;
}

/// Which transport variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Websocket,
    Mqtt,
}

impl TransportKind {
    /// Name used in the `hello` message.
    pub fn wire_name(self) -> &'static str {
        match self {
            TransportKind::Websocket => "websocket",
            TransportKind::Mqtt => "mqtt",
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based): 0.5 s doubling to a
/// ceiling of 8 s, jittered ±25 %.
pub fn reconnect_delay(attempt: usize) -> Duration {
    const BASE_MS: [u64; 5] = [500, 1_000, 2_000, 4_000, 8_000];
    let base = BASE_MS[attempt.min(BASE_MS.len() - 1)];
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Prefix a payload with its 4-byte big-endian sequence number (MQTT audio
/// framing).
pub fn frame_sequenced(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&seq.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Split a sequenced frame back into (seq, payload).
pub fn parse_sequenced(frame: &[u8]) -> Option<(u32, &[u8])> {
    if frame.len() < 4 {
        return None;
    }
    let seq = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    Some((seq, &frame[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delays_follow_capped_doubling_with_jitter() {
        let cases = [
            (0, 500),
            (1, 1_000),
            (2, 2_000),
            (3, 4_000),
            (4, 8_000),
            (9, 8_000), // capped
        ];
        for (attempt, base_ms) in cases {
            for _ in 0..20 {
                let d = reconnect_delay(attempt).as_millis() as u64;
                let lo = base_ms * 3 / 4;
                let hi = base_ms * 5 / 4;
                assert!(
                    (lo..=hi).contains(&d),
                    "attempt {attempt}: delay {d} outside [{lo}, {hi}]"
                );
            }
        }
    }

    #[test]
    fn sequenced_framing_round_trips() {
        let framed = frame_sequenced(0xAABBCCDD, b"opus");
        assert_eq!(&framed[..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        let (seq, payload) = parse_sequenced(&framed).unwrap();
        assert_eq!(seq, 0xAABBCCDD);
        assert_eq!(payload, b"opus");
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(parse_sequenced(&[1, 2, 3]).is_none());
    }

    #[test]
    fn wire_names_match_protocol() {
        assert_eq!(TransportKind::Websocket.wire_name(), "websocket");
        assert_eq!(TransportKind::Mqtt.wire_name(), "mqtt");
    }
}
