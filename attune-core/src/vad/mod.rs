//! Voice activity detection.
//!
//! The `VoiceActivityDetector` trait is the extensibility point: the energy
//! detector is always available, the ONNX classifier sits behind the `onnx`
//! feature. Detectors report a raw frame-level speech probability; the
//! `SpeechGate` applies smoothing and the enter/exit hysteresis the session
//! logic depends on.

pub mod energy;

#[cfg(feature = "onnx")]
pub mod silero;

#[cfg(feature = "onnx")]
pub use silero::SileroVad;

pub use energy::EnergyVad;

use serde::{Deserialize, Serialize};

use crate::audio::frame::FRAME_DURATION_MS;

/// Frame-level speech classifier.
///
/// Implementors may be stateful (RNN hidden states, rolling windows).
pub trait VoiceActivityDetector: Send + 'static {
    /// Speech probability in [0, 1] for one 16 kHz mono 60 ms frame.
    fn probability(&mut self, frame: &[i16]) -> f32;

    /// Reset any internal state.
    fn reset(&mut self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Probability threshold above which a frame counts as speech.
    pub threshold: f32,
    /// Consecutive speech required before entering SPEECH (ms).
    pub enter_ms: u32,
    /// Consecutive silence required before leaving SPEECH (ms).
    pub silence_timeout_ms: u32,
    /// Override for realtime mode, where a snappier end-of-utterance keeps
    /// the barge-in loop tight. Falls back to `silence_timeout_ms`.
    pub realtime_silence_timeout_ms: Option<u32>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            enter_ms: 200,
            silence_timeout_ms: 800,
            realtime_silence_timeout_ms: None,
        }
    }
}

impl VadConfig {
    /// Effective config for a listening mode.
    pub fn for_realtime(&self) -> Self {
        Self {
            silence_timeout_ms: self
                .realtime_silence_timeout_ms
                .unwrap_or(self.silence_timeout_ms),
            ..self.clone()
        }
    }
}

/// State change reported by the gate for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    None,
    /// Enough consecutive speech frames: an utterance has started.
    SpeechStart,
    /// Silence timeout elapsed: end of utterance.
    SpeechEnd,
}

/// Hysteresis over raw per-frame probabilities.
///
/// Enters SPEECH after `enter_ms` of consecutive positives, leaves after
/// `silence_timeout_ms` of consecutive negatives. A single contrary frame
/// resets the opposing counter, so short noise spikes and short pauses do
/// not flip the state.
pub struct SpeechGate {
    config: VadConfig,
    enter_frames: u32,
    exit_frames: u32,
    consecutive_speech: u32,
    consecutive_silence: u32,
    in_speech: bool,
    smoothed: f32,
}

/// Exponential smoothing factor for the reported probability.
const SMOOTH_ALPHA: f32 = 0.3;

impl SpeechGate {
    pub fn new(config: VadConfig) -> Self {
        let enter_frames = config.enter_ms.div_ceil(FRAME_DURATION_MS).max(1);
        let exit_frames = config.silence_timeout_ms.div_ceil(FRAME_DURATION_MS).max(1);
        Self {
            config,
            enter_frames,
            exit_frames,
            consecutive_speech: 0,
            consecutive_silence: 0,
            in_speech: false,
            smoothed: 0.0,
        }
    }

    /// Feed one frame's raw probability; returns any state transition.
    pub fn update(&mut self, probability: f32) -> GateTransition {
        self.smoothed += (probability - self.smoothed) * SMOOTH_ALPHA;
        let is_speech = probability >= self.config.threshold;

        if is_speech {
            self.consecutive_speech += 1;
            self.consecutive_silence = 0;
        } else {
            self.consecutive_silence += 1;
            self.consecutive_speech = 0;
        }

        if !self.in_speech && self.consecutive_speech >= self.enter_frames {
            self.in_speech = true;
            return GateTransition::SpeechStart;
        }
        if self.in_speech && self.consecutive_silence >= self.exit_frames {
            self.in_speech = false;
            return GateTransition::SpeechEnd;
        }
        GateTransition::None
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Smoothed speech probability of the most recent frame.
    pub fn smoothed_probability(&self) -> f32 {
        self.smoothed
    }

    pub fn reset(&mut self) {
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.in_speech = false;
        self.smoothed = 0.0;
    }
}
