//! Time-domain noise suppression.
//!
//! Tracks a noise-floor estimate with asymmetric smoothing (falls quickly,
//! rises slowly so speech does not inflate it) and applies a smoothed
//! frame-level gain based on the estimated SNR. The suppression ceiling maps
//! from the configured level.

use serde::{Deserialize, Serialize};

/// Aggressiveness of the suppressor: sets the maximum attenuation applied
/// to frames classified as noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NoiseSuppressionLevel {
    Low,
    Moderate,
    #[default]
    High,
    VeryHigh,
}

impl NoiseSuppressionLevel {
    /// Maximum attenuation in dB for pure-noise frames.
    fn max_attenuation_db(self) -> f32 {
        match self {
            NoiseSuppressionLevel::Low => 6.0,
            NoiseSuppressionLevel::Moderate => 12.0,
            NoiseSuppressionLevel::High => 18.0,
            NoiseSuppressionLevel::VeryHigh => 24.0,
        }
    }
}

/// Frame-level noise suppressor.
pub struct NoiseSuppressor {
    level: NoiseSuppressionLevel,
    /// Smoothed noise-floor RMS estimate.
    noise_floor: f32,
    /// Current gain, slewed between frames to avoid pumping.
    gain: f32,
}

/// SNR (linear) above which a frame is passed untouched.
const SNR_PASS: f32 = 4.0;
/// SNR below which a frame receives full attenuation.
const SNR_FLOOR: f32 = 1.5;
/// Upward floor adaptation per frame (slow, so speech does not raise it).
const FLOOR_RISE: f32 = 0.02;
/// Downward floor adaptation per frame (fast).
const FLOOR_FALL: f32 = 0.3;
/// Gain slew per frame.
const GAIN_SLEW: f32 = 0.4;

impl NoiseSuppressor {
    pub fn new(level: NoiseSuppressionLevel) -> Self {
        Self {
            level,
            noise_floor: 1e-4,
            gain: 1.0,
        }
    }

    /// Apply suppression in place to one frame of f32 samples.
    pub fn process(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }
        let rms =
            (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();

        // Asymmetric noise-floor tracking.
        if rms < self.noise_floor {
            self.noise_floor += (rms - self.noise_floor) * FLOOR_FALL;
        } else {
            self.noise_floor += (rms - self.noise_floor) * FLOOR_RISE;
        }
        self.noise_floor = self.noise_floor.max(1e-6);

        let snr = rms / self.noise_floor;
        let min_gain = db_to_linear(-self.level.max_attenuation_db());

        let target = if snr >= SNR_PASS {
            1.0
        } else if snr <= SNR_FLOOR {
            min_gain
        } else {
            // Linear ramp between the two thresholds.
            let t = (snr - SNR_FLOOR) / (SNR_PASS - SNR_FLOOR);
            min_gain + (1.0 - min_gain) * t
        };

        self.gain += (target - self.gain) * GAIN_SLEW;

        for s in samples.iter_mut() {
            *s *= self.gain;
        }
    }

    pub fn reset(&mut self) {
        self.noise_floor = 1e-4;
        self.gain = 1.0;
    }
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(s: &[f32]) -> f32 {
        (s.iter().map(|v| v * v).sum::<f32>() / s.len() as f32).sqrt()
    }

    #[test]
    fn attenuates_steady_noise() {
        let mut ns = NoiseSuppressor::new(NoiseSuppressionLevel::High);
        let mut st = 1u32;
        let mut last_rms = 0.0;
        for _ in 0..100 {
            let mut frame: Vec<f32> = (0..960)
                .map(|_| {
                    st = st.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                    (st as i32 as f32) / (i32::MAX as f32) * 0.01
                })
                .collect();
            ns.process(&mut frame);
            last_rms = rms(&frame);
        }
        // Steady low-level noise converges to the floor and gets attenuated.
        assert!(last_rms < 0.004, "noise rms after suppression: {last_rms}");
    }

    #[test]
    fn passes_loud_speech_onset() {
        let mut ns = NoiseSuppressor::new(NoiseSuppressionLevel::High);
        // Train on quiet noise first.
        for _ in 0..50 {
            let mut frame = vec![0.002f32; 960];
            ns.process(&mut frame);
        }
        // Loud frame well above the floor: gain should recover toward 1.
        let mut loud = vec![0.3f32; 960];
        for _ in 0..5 {
            let mut frame = loud.clone();
            ns.process(&mut frame);
            loud = frame;
        }
        assert!(rms(&loud) > 0.15, "speech attenuated: {}", rms(&loud));
    }

    #[test]
    fn very_high_attenuates_more_than_low() {
        let run = |level| {
            let mut ns = NoiseSuppressor::new(level);
            let mut out = 0.0;
            for _ in 0..100 {
                let mut frame = vec![0.005f32; 960];
                ns.process(&mut frame);
                out = rms(&frame);
            }
            out
        };
        assert!(run(NoiseSuppressionLevel::VeryHigh) < run(NoiseSuppressionLevel::Low));
    }
}
