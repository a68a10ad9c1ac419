//! Energy-based VAD fallback.
//!
//! Maps frame RMS onto a pseudo-probability: 0 at silence, 0.5 at the
//! configured RMS threshold, saturating at 1.0 for levels well above it.
//! Always available; the ONNX classifier replaces it when a model loads.

use super::VoiceActivityDetector;

/// A simple energy-based voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS amplitude (full-scale normalized) at which probability = 0.5.
    /// Typical range: 0.01–0.05 for a quiet microphone.
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples
            .iter()
            .map(|&s| {
                let v = s as f32 / 32768.0;
                v * v
            })
            .sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn probability(&mut self, frame: &[i16]) -> f32 {
        let rms = Self::rms(frame);
        (rms / (2.0 * self.threshold)).clamp(0.0, 1.0)
    }

    fn reset(&mut self) {}
}
