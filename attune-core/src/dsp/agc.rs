//! Automatic gain control.
//!
//! Normalizes the capture level toward a target dBFS with slewed gain
//! changes; an optional limiter soft-clips peaks after the gain stage.

use serde::{Deserialize, Serialize};

/// Gain-control strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgcMode {
    /// Adapt toward the target assuming an analog gain knob upstream.
    AdaptiveAnalog,
    /// Adapt the digital gain directly.
    #[default]
    AdaptiveDigital,
    /// Apply a fixed digital gain of `compression_gain_db`.
    FixedDigital,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgcConfig {
    pub enabled: bool,
    pub mode: AgcMode,
    /// Target level below full scale, in dBFS (positive number, e.g. 3).
    pub target_level_dbfs: f32,
    /// Maximum digital gain (adaptive modes) or the fixed gain (FixedDigital).
    pub compression_gain_db: f32,
    pub limiter: bool,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AgcMode::AdaptiveDigital,
            target_level_dbfs: 3.0,
            compression_gain_db: 9.0,
            limiter: true,
        }
    }
}

pub struct AutomaticGainControl {
    config: AgcConfig,
    /// Smoothed RMS envelope of the input.
    envelope: f32,
    /// Current applied gain (linear).
    gain: f32,
}

/// Envelope smoothing per frame.
const ENV_ALPHA: f32 = 0.3;
/// Gain slew per frame.
const GAIN_SLEW: f32 = 0.15;
/// Below this envelope the AGC holds its gain (no pumping on silence).
const ACTIVITY_FLOOR: f32 = 1e-3;

impl AutomaticGainControl {
    pub fn new(config: AgcConfig) -> Self {
        let gain = match config.mode {
            AgcMode::FixedDigital => db_to_linear(config.compression_gain_db),
            _ => 1.0,
        };
        Self {
            config,
            envelope: 0.0,
            gain,
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        if !self.config.enabled || samples.is_empty() {
            return;
        }

        match self.config.mode {
            AgcMode::FixedDigital => {
                let g = db_to_linear(self.config.compression_gain_db);
                for s in samples.iter_mut() {
                    *s *= g;
                }
            }
            AgcMode::AdaptiveAnalog | AgcMode::AdaptiveDigital => {
                let rms = (samples.iter().map(|s| s * s).sum::<f32>()
                    / samples.len() as f32)
                    .sqrt();
                self.envelope += (rms - self.envelope) * ENV_ALPHA;

                if self.envelope > ACTIVITY_FLOOR {
                    let target_rms = db_to_linear(-self.config.target_level_dbfs);
                    let max_gain = db_to_linear(self.config.compression_gain_db);
                    let desired = (target_rms / self.envelope).clamp(1.0 / max_gain, max_gain);
                    self.gain += (desired - self.gain) * GAIN_SLEW;
                }

                for s in samples.iter_mut() {
                    *s *= self.gain;
                }
            }
        }

        if self.config.limiter {
            for s in samples.iter_mut() {
                *s = soft_limit(*s);
            }
        }
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
        self.gain = match self.config.mode {
            AgcMode::FixedDigital => db_to_linear(self.config.compression_gain_db),
            _ => 1.0,
        };
    }
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// tanh-style soft clip keeping |y| < 1.
fn soft_limit(x: f32) -> f32 {
    if x.abs() <= 0.5 {
        x
    } else {
        x.signum() * (0.5 + 0.5 * ((x.abs() - 0.5) * 2.0).tanh() * 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(s: &[f32]) -> f32 {
        (s.iter().map(|v| v * v).sum::<f32>() / s.len() as f32).sqrt()
    }

    #[test]
    fn boosts_quiet_signal_toward_target() {
        let mut agc = AutomaticGainControl::new(AgcConfig::default());
        let mut out_rms = 0.0;
        for _ in 0..60 {
            let mut frame: Vec<f32> = (0..960)
                .map(|i| (std::f32::consts::TAU * 440.0 * i as f32 / 16_000.0).sin() * 0.05)
                .collect();
            agc.process(&mut frame);
            out_rms = rms(&frame);
        }
        assert!(out_rms > 0.08, "quiet signal not boosted: rms={out_rms}");
    }

    #[test]
    fn fixed_digital_applies_constant_gain() {
        let config = AgcConfig {
            mode: AgcMode::FixedDigital,
            compression_gain_db: 6.0,
            limiter: false,
            ..AgcConfig::default()
        };
        let mut agc = AutomaticGainControl::new(config);
        let mut frame = vec![0.1f32; 960];
        agc.process(&mut frame);
        approx::assert_relative_eq!(frame[0], 0.1 * 10f32.powf(0.3), epsilon = 1e-3);
    }

    #[test]
    fn limiter_bounds_output() {
        let mut agc = AutomaticGainControl::new(AgcConfig {
            mode: AgcMode::FixedDigital,
            compression_gain_db: 20.0,
            limiter: true,
            ..AgcConfig::default()
        });
        let mut frame = vec![0.9f32; 960];
        agc.process(&mut frame);
        assert!(frame.iter().all(|s| s.abs() < 1.0));
    }

    #[test]
    fn disabled_agc_is_identity() {
        let mut agc = AutomaticGainControl::new(AgcConfig {
            enabled: false,
            ..AgcConfig::default()
        });
        let mut frame = vec![0.2f32; 64];
        agc.process(&mut frame);
        assert_eq!(frame, vec![0.2f32; 64]);
    }
}
