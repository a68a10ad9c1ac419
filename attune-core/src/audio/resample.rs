//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! `cpal` runs both streams at the device's native rate (commonly 48 kHz).
//! The processing chain runs at 16 kHz mono. `RateConverter` bridges that gap
//! in both directions on the non-RT pipeline threads, where allocation is
//! allowed. Frames enter and leave as i16 PCM; rubato works in f32 internally.
//!
//! When the two rates match, `RateConverter` is a passthrough; no rubato
//! session is created at all.
//!
//! Partial input is accumulated and the residual carried forward, so frame
//! monotonicity is preserved and no samples are lost between calls.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::audio::frame::{f32_to_pcm, pcm_to_f32};
use crate::error::{AttuneError, Result};

/// Rates the converter accepts on either side of 16 kHz.
pub const SUPPORTED_RATES: &[u32] = &[8_000, 16_000, 22_050, 24_000, 32_000, 44_100, 48_000];

/// Converts mono i16 PCM from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == output rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer holding partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    /// Scratch for i16 ↔ f32 conversion.
    scratch_f32: Vec<f32>,
    scratch_i16: Vec<i16>,
    from_rate: u32,
    to_rate: u32,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// `chunk_size` is the input frame count per rubato call; one 60 ms block
    /// at `from_rate` keeps added latency well under the 5 ms budget because
    /// rubato's cubic interpolator carries only a few taps of delay line.
    ///
    /// # Errors
    /// `AttuneError::Config` if either rate is unsupported, or
    /// `AttuneError::AudioStream` if rubato fails to initialise.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if !SUPPORTED_RATES.contains(&from_rate) || !SUPPORTED_RATES.contains(&to_rate) {
            return Err(AttuneError::Config(format!(
                "unsupported resample pair {from_rate} -> {to_rate}"
            )));
        }

        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                scratch_f32: Vec::new(),
                scratch_i16: Vec::new(),
                from_rate,
                to_rate,
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| AttuneError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(from_rate, to_rate, chunk_size, max_out, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            scratch_f32: Vec::new(),
            scratch_i16: Vec::new(),
            from_rate,
            to_rate,
        })
    }

    /// Process incoming i16 samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        pcm_to_f32(samples, &mut self.scratch_f32);
        self.input_buf.extend_from_slice(&self.scratch_f32);

        let mut result_f32: Vec<f32> = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result_f32.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        f32_to_pcm(&result_f32, &mut self.scratch_i16);
        std::mem::take(&mut self.scratch_i16)
    }

    /// Returns `true` when input rate == output rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Number of buffered input samples not yet converted.
    pub fn pending(&self) -> usize {
        self.input_buf.len()
    }

    /// Drop buffered residual (used when a stream is rebuilt mid-session).
    pub fn reset(&mut self) {
        self.input_buf.clear();
    }
}
