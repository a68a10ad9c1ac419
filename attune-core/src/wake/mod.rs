//! Wake-word detection.
//!
//! Runs on the raw (pre-AEC) microphone stream while the session is IDLE,
//! and optionally during SPEAKING to allow barge-in. The spotter scores a
//! sliding window per keyword; `WakeDetector` applies the confidence
//! threshold, the refractory interval, and the pause-until-idle rule.

#[cfg(feature = "onnx")]
pub mod kws;

#[cfg(feature = "onnx")]
pub use kws::OnnxSpotter;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A keyword with its pronunciation hint, loaded at startup.
///
/// The pronunciation string follows the shipped model's token vocabulary;
/// the entry order must match the model's output order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyword {
    pub phrase: String,
    #[serde(default)]
    pub pronunciation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    pub enabled: bool,
    /// Confidence threshold below which spots are ignored.
    pub threshold: f32,
    /// Minimum interval between two fires (ms).
    pub min_interval_ms: u64,
    /// Keyword table; may also be loaded from a JSON file by the host.
    pub keywords: Vec<Keyword>,
    /// Path to the keyword-spotting ONNX model.
    pub model_path: Option<std::path::PathBuf>,
    /// Also listen during SPEAKING so the wake word can barge in.
    pub barge_in: bool,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.6,
            min_interval_ms: 1_500,
            keywords: Vec::new(),
            model_path: None,
            barge_in: false,
        }
    }
}

/// Emitted when a keyword clears the threshold and refractory checks.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeEvent {
    pub keyword: String,
    pub confidence: f32,
    pub timestamp_ns: u64,
}

/// Raw keyword scorer over the audio stream.
pub trait WakeWordSpotter: Send + 'static {
    /// Feed one 16 kHz mono frame; returns the best (keyword, confidence)
    /// spotted in the current window, if any.
    fn feed(&mut self, frame: &[i16]) -> Option<(String, f32)>;

    fn reset(&mut self);
}

/// Spotter stub used when wake detection is disabled or no model is present.
pub struct NullSpotter;

impl WakeWordSpotter for NullSpotter {
    fn feed(&mut self, _frame: &[i16]) -> Option<(String, f32)> {
        None
    }

    fn reset(&mut self) {}
}

/// Threshold + refractory + pause logic around a spotter.
pub struct WakeDetector {
    spotter: Box<dyn WakeWordSpotter>,
    threshold: f32,
    min_interval_ns: u64,
    last_fire_ns: Option<u64>,
    /// Set after a fire; cleared when the session returns to IDLE.
    paused: bool,
}

impl WakeDetector {
    pub fn new(spotter: Box<dyn WakeWordSpotter>, config: &WakeConfig) -> Self {
        Self {
            spotter,
            threshold: config.threshold,
            min_interval_ns: config.min_interval_ms * 1_000_000,
            last_fire_ns: None,
            paused: false,
        }
    }

    /// Feed a raw capture frame; returns a wake event when one fires.
    pub fn process(&mut self, frame: &[i16], timestamp_ns: u64) -> Option<WakeEvent> {
        if self.paused {
            return None;
        }

        let (keyword, confidence) = self.spotter.feed(frame)?;
        if confidence < self.threshold {
            return None;
        }
        if let Some(last) = self.last_fire_ns {
            if timestamp_ns.saturating_sub(last) < self.min_interval_ns {
                return None;
            }
        }

        self.last_fire_ns = Some(timestamp_ns);
        self.paused = true;
        debug!(keyword = keyword.as_str(), confidence, "wake word fired");
        Some(WakeEvent {
            keyword,
            confidence,
            timestamp_ns,
        })
    }

    /// Re-arm after the session has returned to IDLE.
    pub fn resume(&mut self) {
        self.paused = false;
        self.spotter.reset();
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted spotter returning a fixed confidence every frame.
    struct ConstSpotter(f32);

    impl WakeWordSpotter for ConstSpotter {
        fn feed(&mut self, _frame: &[i16]) -> Option<(String, f32)> {
            Some(("hey attune".into(), self.0))
        }

        fn reset(&mut self) {}
    }

    fn detector(confidence: f32) -> WakeDetector {
        WakeDetector::new(Box::new(ConstSpotter(confidence)), &WakeConfig::default())
    }

    #[test]
    fn fires_above_threshold() {
        let mut d = detector(0.9);
        let event = d.process(&[0; 960], 1_000).expect("should fire");
        assert_eq!(event.keyword, "hey attune");
        assert!((event.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn ignores_below_threshold() {
        let mut d = detector(0.4);
        assert!(d.process(&[0; 960], 1_000).is_none());
    }

    #[test]
    fn pauses_after_fire_until_resume() {
        let mut d = detector(0.9);
        assert!(d.process(&[0; 960], 0).is_some());
        assert!(d.is_paused());
        assert!(d.process(&[0; 960], 10_000_000_000).is_none());
        d.resume();
        assert!(d.process(&[0; 960], 10_000_000_000).is_some());
    }

    #[test]
    fn refractory_interval_suppresses_rapid_refires() {
        let mut d = detector(0.9);
        assert!(d.process(&[0; 960], 0).is_some());
        d.resume();
        // 1 s later: still inside the 1500 ms refractory window.
        assert!(d.process(&[0; 960], 1_000_000_000).is_none());
        // 2 s later: allowed again.
        assert!(d.process(&[0; 960], 2_000_000_000).is_some());
    }
}
