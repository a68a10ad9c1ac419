//! Capture-side signal processing: high-pass, echo cancellation, noise
//! suppression, and AGC, applied per 60 ms frame in that order.
//!
//! ## Echo path
//!
//! The canceller is an NLMS adaptive filter whose tail covers the acoustic
//! echo path. Per frame, the caller supplies the far-end reference frame
//! whose presentation timestamp is closest to
//! `capture_timestamp - stream_delay_ms`; residual misalignment inside the
//! tail is absorbed by the filter taps. When playback is inactive no
//! reference exists and echo processing is skipped for that frame.

pub mod agc;
pub mod highpass;
pub mod nlms;
pub mod noise;
pub mod reference;

use serde::{Deserialize, Serialize};

use crate::audio::frame::{f32_to_pcm, pcm_to_f32, PIPELINE_SAMPLE_RATE};

pub use agc::{AgcConfig, AgcMode, AutomaticGainControl};
pub use highpass::HighPassFilter;
pub use nlms::NlmsFilter;
pub use noise::{NoiseSuppressionLevel, NoiseSuppressor};

/// Echo-cancellation tail in milliseconds (full mode).
const TAIL_MS: usize = 200;
/// Reduced tail for mobile mode, trading convergence depth for CPU.
const TAIL_MS_MOBILE: usize = 64;
/// NLMS step size μ.
const STEP_SIZE: f32 = 0.5;
/// First-order smoothing factor for stream-delay updates.
const DELAY_ALPHA: f32 = 0.25;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    pub enabled: bool,
    pub mobile_mode: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mobile_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSuppressionConfig {
    pub enabled: bool,
    pub level: NoiseSuppressionLevel,
}

impl Default for NoiseSuppressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: NoiseSuppressionLevel::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HighPassConfig {
    pub enabled: bool,
}

impl Default for HighPassConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Capture-side processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProcessorConfig {
    pub echo: EchoConfig,
    pub noise_suppression: NoiseSuppressionConfig,
    pub high_pass: HighPassConfig,
    pub agc1: AgcConfig,
    /// Initial estimate of the round-trip capture↔playback latency (ms).
    pub stream_delay_ms: u32,
}

/// Per-frame capture processor.
pub struct AudioProcessor {
    config: ProcessorConfig,
    hpf: HighPassFilter,
    suppressor: NoiseSuppressor,
    agc: AutomaticGainControl,
    canceller: NlmsFilter,
    /// Smoothed stream delay estimate (ms, fractional).
    stream_delay_ms: f32,
    // Scratch buffers reused across frames.
    near_f32: Vec<f32>,
    far_f32: Vec<f32>,
    err_f32: Vec<f32>,
}

impl AudioProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        let tail_ms = if config.echo.mobile_mode {
            TAIL_MS_MOBILE
        } else {
            TAIL_MS
        };
        let taps = PIPELINE_SAMPLE_RATE as usize * tail_ms / 1000;
        Self {
            hpf: HighPassFilter::new(PIPELINE_SAMPLE_RATE),
            suppressor: NoiseSuppressor::new(config.noise_suppression.level),
            agc: AutomaticGainControl::new(config.agc1.clone()),
            canceller: NlmsFilter::new(taps, STEP_SIZE),
            stream_delay_ms: config.stream_delay_ms as f32,
            config,
            near_f32: Vec::new(),
            far_f32: Vec::new(),
            err_f32: Vec::new(),
        }
    }

    /// Current smoothed delay estimate, rounded to whole milliseconds.
    pub fn stream_delay_ms(&self) -> u32 {
        self.stream_delay_ms.round().max(0.0) as u32
    }

    /// Fold a new delay observation into the estimate (α = 0.25).
    /// Called when playback re-starts.
    pub fn update_stream_delay(&mut self, observed_ms: u32) {
        self.stream_delay_ms += (observed_ms as f32 - self.stream_delay_ms) * DELAY_ALPHA;
    }

    /// Process one capture frame in place.
    ///
    /// `reference` is the time-aligned far-end frame, or `None` while
    /// playback is inactive (echo processing is skipped for that frame).
    pub fn process_capture(&mut self, frame: &mut Vec<i16>, reference: Option<&[i16]>) {
        pcm_to_f32(frame, &mut self.near_f32);

        if self.config.high_pass.enabled {
            self.hpf.process(&mut self.near_f32);
        }

        if self.config.echo.enabled {
            if let Some(reference) = reference {
                pcm_to_f32(reference, &mut self.far_f32);
                // Reference frames always match the 60 ms cadence; pad a short
                // tail frame with silence rather than dropping alignment.
                self.far_f32.resize(self.near_f32.len(), 0.0);

                self.err_f32.resize(self.near_f32.len(), 0.0);
                self.canceller
                    .process_block(&self.far_f32, &self.near_f32, &mut self.err_f32);
                std::mem::swap(&mut self.near_f32, &mut self.err_f32);
            }
        }

        if self.config.noise_suppression.enabled {
            self.suppressor.process(&mut self.near_f32);
        }

        self.agc.process(&mut self.near_f32);

        f32_to_pcm(&self.near_f32, frame);
    }

    /// Reset all adaptive state (used after a stream rebuild).
    pub fn reset(&mut self) {
        self.hpf.reset();
        self.suppressor.reset();
        self.agc.reset();
        self.canceller.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::PIPELINE_FRAME_SAMPLES;

    fn energy(samples: &[i16]) -> f64 {
        samples.iter().map(|&s| (s as f64).powi(2)).sum()
    }

    fn tone_frame(freq: f32, frame_idx: usize, amplitude: f32) -> Vec<i16> {
        (0..PIPELINE_FRAME_SAMPLES)
            .map(|i| {
                let n = frame_idx * PIPELINE_FRAME_SAMPLES + i;
                let t = n as f32 / PIPELINE_SAMPLE_RATE as f32;
                ((t * freq * std::f32::consts::TAU).sin() * amplitude * 32767.0) as i16
            })
            .collect()
    }

    /// Echo-path model: fixed FIR = pure 40 ms delay with gain 0.6.
    fn echo_path(far_frames: &[Vec<i16>], frame_idx: usize) -> Vec<i16> {
        const DELAY_SAMPLES: usize = 640; // 40 ms at 16 kHz
        const GAIN: f32 = 0.6;
        let flat: Vec<i16> = far_frames.iter().flatten().copied().collect();
        let start = frame_idx * PIPELINE_FRAME_SAMPLES;
        (0..PIPELINE_FRAME_SAMPLES)
            .map(|i| {
                let n = start + i;
                if n >= DELAY_SAMPLES {
                    (flat[n - DELAY_SAMPLES] as f32 * GAIN) as i16
                } else {
                    0
                }
            })
            .collect()
    }

    #[test]
    fn aec_attenuates_echo_by_15_db_after_convergence() {
        // Property: far-end 1 kHz tone through a fixed FIR (≤ 100 ms delay);
        // after 500 ms of convergence the residual energy must be ≥ 15 dB
        // below the unprocessed near-end energy.
        let mut config = ProcessorConfig::default();
        config.noise_suppression.enabled = false;
        config.high_pass.enabled = false;
        config.agc1.enabled = false;
        let mut processor = AudioProcessor::new(config);

        let total_frames = 17; // ~1 s
        let convergence_frames = 9; // ~540 ms
        let far: Vec<Vec<i16>> = (0..total_frames)
            .map(|f| tone_frame(1_000.0, f, 0.5))
            .collect();

        let mut residual_energy = 0.0f64;
        let mut near_energy = 0.0f64;

        for idx in 0..total_frames {
            let near = echo_path(&far, idx);
            let mut processed = near.clone();
            processor.process_capture(&mut processed, Some(&far[idx]));

            if idx >= convergence_frames {
                near_energy += energy(&near);
                residual_energy += energy(&processed);
            }
        }

        let erle_db = 10.0 * (near_energy / residual_energy.max(1.0)).log10();
        assert!(
            erle_db >= 15.0,
            "echo attenuation {erle_db:.1} dB below the 15 dB requirement"
        );
    }

    #[test]
    fn frame_without_reference_passes_through_uncancelled() {
        let mut config = ProcessorConfig::default();
        config.noise_suppression.enabled = false;
        config.high_pass.enabled = false;
        config.agc1.enabled = false;
        let mut processor = AudioProcessor::new(config);

        let frame = tone_frame(440.0, 0, 0.3);
        let mut processed = frame.clone();
        processor.process_capture(&mut processed, None);

        let in_e = energy(&frame);
        let out_e = energy(&processed);
        assert!(
            (out_e - in_e).abs() / in_e < 0.05,
            "no-reference frame was altered: {in_e} -> {out_e}"
        );
    }

    #[test]
    fn stream_delay_smoothing_follows_first_order_filter() {
        let mut processor = AudioProcessor::new(ProcessorConfig {
            stream_delay_ms: 100,
            ..ProcessorConfig::default()
        });
        processor.update_stream_delay(200);
        // 100 + 0.25 * (200 - 100) = 125
        assert_eq!(processor.stream_delay_ms(), 125);
        processor.update_stream_delay(200);
        // 125 + 0.25 * 75 = 143.75 → 144
        assert_eq!(processor.stream_delay_ms(), 144);
    }

    #[test]
    fn mobile_mode_uses_shorter_tail() {
        let full = AudioProcessor::new(ProcessorConfig::default());
        let mobile = AudioProcessor::new(ProcessorConfig {
            echo: EchoConfig {
                enabled: true,
                mobile_mode: true,
            },
            ..ProcessorConfig::default()
        });
        assert!(mobile.canceller.weights().len() < full.canceller.weights().len());
    }
}
