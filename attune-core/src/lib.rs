//! # attune-core
//!
//! Voice-first conversational client core: full-duplex audio pipeline,
//! dialog state machine, and tool dispatch.
//!
//! ## Architecture
//!
//! ```text
//! Microphone ─► capture ring ─► resample 16 kHz ─► AEC ─┬─► VAD ──► SpeechGate
//!      (cpal, zero-alloc cb)        (rubato)     (NLMS) ├─► wake word
//!                                                       └─► Opus ─► transport
//!
//! transport ─► Opus decode (PLC) ─┬─► reference ring (AEC far end)
//!                                 └─► resample device rate ─► playback ring ─► Speaker
//! ```
//!
//! The control plane (session state machine, tool dispatcher, transport
//! protocol) runs cooperatively on the Tokio runtime; compute-bound stages
//! run on dedicated blocking threads and meet the async world only at
//! bounded queues. The audio callbacks are zero-alloc and lock-free.
//!
//! Session states: IDLE → CONNECTING → LISTENING ⇄ SPEAKING → ABORTING,
//! with reconnect backoff, wake-word activation, and barge-in interruption.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod codec;
pub mod config;
pub mod dsp;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod tools;
pub mod transport;
pub mod vad;
pub mod wake;

// Convenience re-exports for downstream crates
pub use config::{AttuneConfig, DeviceIdentity, TokenCache};
pub use error::AttuneError;
pub use runtime::{AttuneRuntime, UserCommand};
pub use session::{ListeningMode, SessionEvent, SessionState};
pub use tools::{
    ParamSpec, ParamType, ToolDescriptor, ToolHandler, ToolRegistry, ToolRegistryBuilder,
};
pub use transport::TransportKind;

#[cfg(feature = "onnx")]
pub use vad::SileroVad;
