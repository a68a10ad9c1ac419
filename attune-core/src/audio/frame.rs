//! Typed PCM frames passed between pipeline stages.

/// Frame cadence of the whole pipeline (ms).
pub const FRAME_DURATION_MS: u32 = 60;

/// Sample rate the processing chain runs at (Hz).
pub const PIPELINE_SAMPLE_RATE: u32 = 16_000;

/// Samples in one pipeline frame: 16 kHz × 60 ms = 960.
pub const PIPELINE_FRAME_SAMPLES: usize =
    (PIPELINE_SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

/// Number of mono samples in one 60 ms frame at `sample_rate`.
pub fn samples_per_frame(sample_rate: u32) -> usize {
    (sample_rate as usize * FRAME_DURATION_MS as usize) / 1000
}

/// A contiguous 60 ms block of mono 16-bit PCM at a known sample rate.
///
/// Allocated once per pipeline iteration (on the non-RT pipeline thread).
/// `seq` is strictly increasing per stream; a gap of more than one is only
/// permitted when the drop metric was incremented.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic sequence id within the stream.
    pub seq: u64,
    /// Channel count (always 1 inside the pipeline).
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Mono i16 PCM samples; length = sample_rate × 0.06 × channels.
    pub samples: Vec<i16>,
    /// Capture timestamp in nanoseconds (monotonic clock).
    pub capture_ts_ns: u64,
}

impl AudioFrame {
    pub fn new(seq: u64, sample_rate: u32, samples: Vec<i16>, capture_ts_ns: u64) -> Self {
        Self {
            seq,
            channels: 1,
            sample_rate,
            samples,
            capture_ts_ns,
        }
    }

    /// Duration of this frame in nanoseconds.
    pub fn duration_ns(&self) -> u64 {
        (self.samples.len() as u64 / self.channels as u64) * 1_000_000_000
            / self.sample_rate as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A decoded playback frame retained as the AEC far-end reference.
///
/// Appended to the reference ring when the decoded frame is handed to the
/// mixer; dropped once older than the ring's retention window.
#[derive(Debug, Clone)]
pub struct ReferenceFrame {
    pub seq: u64,
    pub sample_rate: u32,
    pub samples: Vec<i16>,
    /// Estimated presentation timestamp in nanoseconds (monotonic clock).
    pub presentation_ts_ns: u64,
}

/// Convert i16 PCM to f32 in [-1.0, 1.0].
pub fn pcm_to_f32(samples: &[i16], out: &mut Vec<f32>) {
    out.clear();
    out.extend(samples.iter().map(|&s| s as f32 / 32768.0));
}

/// Convert f32 in [-1.0, 1.0] back to i16 PCM with clamping.
pub fn f32_to_pcm(samples: &[f32], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16),
    );
}
