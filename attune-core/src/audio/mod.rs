//! Duplex audio I/O via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal callbacks run on OS audio threads at elevated priority. They
//! **must not**:
//! - Allocate heap memory (beyond first-call buffer growth)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! Both callbacks therefore talk to the rest of the process through lock-free
//! SPSC ring buffers: the input callback pushes raw device-rate i16 samples,
//! the output callback pulls device-rate i16 samples and substitutes silence
//! on underrun.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioDuplex` must be created and dropped on the same thread; the
//! capture pipeline owns it inside its `spawn_blocking` thread and rebuilds
//! it there after mid-session stream errors (≤ 3 attempts, 500 ms apart).

pub mod device;
pub mod frame;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use ringbuf::{traits::Split, HeapRb};
use tracing::{error, info, warn};

use crate::error::{AttuneError, Result};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer/consumer halves for i16 device-rate samples.
pub type PcmProducer = ringbuf::HeapProd<i16>;
pub type PcmConsumer = ringbuf::HeapCons<i16>;

/// Capture ring capacity: 2^18 = 262 144 samples ≈ 5.5 s at 48 kHz.
/// Generous enough that the 60 ms pipeline never starves the callback.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 18;

/// Playback ring capacity: ~1 s at 48 kHz. The decoder blocks when full:
/// dropping audio during TTS is audibly worse than buffering.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 16;

/// Slot through which the playback pipeline reaches the current output ring.
///
/// The producer half is replaced whenever the duplex is (re)built; the
/// playback thread locks this mutex (it is not an RT thread), the output
/// callback never does.
pub type PlaybackSink = Arc<Mutex<Option<PcmProducer>>>;

pub fn playback_sink() -> PlaybackSink {
    Arc::new(Mutex::new(None))
}

/// Shared counters for the audio boundary (underrun/overrun/rebuild metrics).
#[derive(Debug, Default)]
pub struct DuplexCounters {
    /// Output underruns (silence substituted while playback was active).
    pub underruns: AtomicU64,
    /// Capture samples dropped because the capture ring was full.
    pub capture_overrun_samples: AtomicU64,
    /// Mid-session stream rebuilds performed.
    pub rebuilds: AtomicU64,
    /// Set by the playback pipeline while TTS audio is being queued.
    pub playback_active: AtomicBool,
}

/// Device-selection preferences, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct DevicePrefs {
    pub input_name: Option<String>,
    pub output_name: Option<String>,
}

/// Handle to an active duplex pair of cpal streams.
///
/// **Not `Send`**: create and drop on the same OS thread.
pub struct AudioDuplex {
    #[cfg(feature = "audio-cpal")]
    _input: Stream,
    #[cfg(feature = "audio-cpal")]
    _output: Stream,
    /// Set by either error callback when the device stream dies.
    failed: Arc<AtomicBool>,
    /// Shared sample rate of both streams (Hz).
    pub sample_rate: u32,
}

impl AudioDuplex {
    /// Open input and output streams at a common sample rate.
    ///
    /// Returns the duplex handle and the capture consumer; the playback
    /// producer is installed into `sink`.
    ///
    /// # Errors
    /// `AttuneError::AudioDeviceUnavailable` when no usable device exists,
    /// `AttuneError::AudioStream` if cpal fails to build either stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        prefs: &DevicePrefs,
        running: Arc<AtomicBool>,
        counters: Arc<DuplexCounters>,
        sink: &PlaybackSink,
    ) -> Result<(Self, PcmConsumer)> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();

        let input = select_device(
            host.input_devices()
                .map_err(|e| AttuneError::AudioStream(e.to_string()))?,
            host.default_input_device(),
            prefs.input_name.as_deref(),
            true,
        )?;
        let output = select_device(
            host.output_devices()
                .map_err(|e| AttuneError::AudioStream(e.to_string()))?,
            host.default_output_device(),
            prefs.output_name.as_deref(),
            false,
        )?;

        let in_supported = input
            .default_input_config()
            .map_err(|e| AttuneError::AudioStream(e.to_string()))?;
        // Both streams must share one rate so the reference path and the
        // capture path see the same clock.
        let sample_rate = in_supported.sample_rate().0;
        let in_channels = in_supported.channels();

        let out_supported = output
            .default_output_config()
            .map_err(|e| AttuneError::AudioStream(e.to_string()))?;
        let out_channels = out_supported.channels();

        info!(
            input = input.name().unwrap_or_default().as_str(),
            output = output.name().unwrap_or_default().as_str(),
            sample_rate,
            in_channels,
            out_channels,
            "opening duplex audio streams"
        );

        let (capture_prod, capture_cons) = HeapRb::<i16>::new(CAPTURE_RING_CAPACITY).split();
        let (playback_prod, playback_cons) = HeapRb::<i16>::new(PLAYBACK_RING_CAPACITY).split();

        let failed = Arc::new(AtomicBool::new(false));

        let in_config = StreamConfig {
            channels: in_channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let out_config = StreamConfig {
            channels: out_channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let input_stream = build_input_stream(
            &input,
            &in_config,
            in_supported.sample_format(),
            capture_prod,
            Arc::clone(&running),
            Arc::clone(&counters),
            Arc::clone(&failed),
        )?;

        let output_stream = build_output_stream(
            &output,
            &out_config,
            out_supported.sample_format(),
            playback_cons,
            Arc::clone(&counters),
            Arc::clone(&failed),
        )?;

        input_stream
            .play()
            .map_err(|e| AttuneError::AudioStream(e.to_string()))?;
        output_stream
            .play()
            .map_err(|e| AttuneError::AudioStream(e.to_string()))?;

        *sink.lock() = Some(playback_prod);

        Ok((
            Self {
                _input: input_stream,
                _output: output_stream,
                failed,
                sample_rate,
            },
            capture_cons,
        ))
    }

    /// True once either stream reported a device error; the owner should
    /// rebuild.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Pick the device to open.
///
/// A configured name wins unconditionally (even a monitor source, with a
/// warning, so users can test echo paths deliberately). Otherwise the system
/// default is taken unless, on the capture side, it classifies as a monitor
/// source; then the highest-ranked remaining candidate wins.
#[cfg(feature = "audio-cpal")]
fn select_device(
    devices: impl Iterator<Item = cpal::Device>,
    default: Option<cpal::Device>,
    preferred: Option<&str>,
    capture: bool,
) -> Result<cpal::Device> {
    use device::{capture_rank, classify_capture_name, CaptureClass};

    let mut candidates: Vec<(String, cpal::Device)> = devices
        .enumerate()
        .map(|(idx, d)| {
            let name = d
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            (name, d)
        })
        .collect();

    if let Some(preferred) = preferred {
        match candidates.iter().position(|(n, _)| n == preferred) {
            Some(idx) => {
                if capture && classify_capture_name(preferred) == CaptureClass::Monitor {
                    warn!(
                        device = preferred,
                        "configured capture device is a monitor source; the \
                         echo canceller will see its own far end"
                    );
                }
                return Ok(candidates.swap_remove(idx).1);
            }
            None => warn!("configured device '{preferred}' not found, falling back"),
        }
    }

    let default_name = default
        .as_ref()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();
    let default_is_monitor =
        capture && classify_capture_name(&default_name) == CaptureClass::Monitor;
    if let Some(default) = default {
        if !default_is_monitor {
            return Ok(default);
        }
        warn!(
            default = default_name.as_str(),
            "default input is a monitor source, picking a microphone instead"
        );
    }

    if capture {
        candidates.sort_by(|(a, _), (b, _)| capture_rank(b).cmp(&capture_rank(a)));
    }
    candidates
        .into_iter()
        .next()
        .map(|(name, d)| {
            info!(device = name.as_str(), "selected fallback device");
            d
        })
        .ok_or(AttuneError::AudioDeviceUnavailable)
}

#[cfg(feature = "audio-cpal")]
fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    mut producer: PcmProducer,
    running: Arc<AtomicBool>,
    counters: Arc<DuplexCounters>,
    failed: Arc<AtomicBool>,
) -> Result<Stream> {
    let ch = config.channels as usize;
    let err_failed = Arc::clone(&failed);
    let err_cb = move |err| {
        error!("input stream error: {err}");
        err_failed.store(true, Ordering::Release);
    };

    let stream = match format {
        SampleFormat::I16 => {
            let mut mono: Vec<i16> = Vec::new();
            device.build_input_stream(
                config,
                move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = data.len() / ch;
                    mono.resize(frames, 0);
                    if ch == 1 {
                        mono.copy_from_slice(&data[..frames]);
                    } else {
                        for f in 0..frames {
                            let base = f * ch;
                            let sum: i32 = data[base..base + ch].iter().map(|&s| s as i32).sum();
                            mono[f] = (sum / ch as i32) as i16;
                        }
                    }
                    let written = producer.push_slice(&mono);
                    if written < mono.len() {
                        counters
                            .capture_overrun_samples
                            .fetch_add((mono.len() - written) as u64, Ordering::Relaxed);
                    }
                },
                err_cb,
                None,
            )
        }
        SampleFormat::F32 => {
            let mut mono: Vec<i16> = Vec::new();
            device.build_input_stream(
                config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = data.len() / ch;
                    mono.resize(frames, 0);
                    for f in 0..frames {
                        let base = f * ch;
                        let mut sum = 0f32;
                        for c in 0..ch {
                            sum += data[base + c];
                        }
                        mono[f] = ((sum / ch as f32).clamp(-1.0, 1.0) * 32767.0) as i16;
                    }
                    let written = producer.push_slice(&mono);
                    if written < mono.len() {
                        counters
                            .capture_overrun_samples
                            .fetch_add((mono.len() - written) as u64, Ordering::Relaxed);
                    }
                },
                err_cb,
                None,
            )
        }
        fmt => {
            return Err(AttuneError::AudioStream(format!(
                "unsupported input sample format: {fmt:?}"
            )))
        }
    };

    stream.map_err(|e| AttuneError::AudioStream(e.to_string()))
}

#[cfg(feature = "audio-cpal")]
fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    mut consumer: PcmConsumer,
    counters: Arc<DuplexCounters>,
    failed: Arc<AtomicBool>,
) -> Result<Stream> {
    let ch = config.channels as usize;
    let err_cb = move |err| {
        error!("output stream error: {err}");
        failed.store(true, Ordering::Release);
    };

    let stream = match format {
        SampleFormat::I16 => {
            let mut mono: Vec<i16> = Vec::new();
            device.build_output_stream(
                config,
                move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / ch;
                    mono.resize(frames, 0);
                    let got = consumer.pop_slice(&mut mono);
                    if got < frames {
                        mono[got..].fill(0);
                        if got > 0 || counters.playback_active.load(Ordering::Relaxed) {
                            counters.underruns.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    for f in 0..frames {
                        let base = f * ch;
                        data[base..base + ch].fill(mono[f]);
                    }
                },
                err_cb,
                None,
            )
        }
        SampleFormat::F32 => {
            let mut mono: Vec<i16> = Vec::new();
            device.build_output_stream(
                config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / ch;
                    mono.resize(frames, 0);
                    let got = consumer.pop_slice(&mut mono);
                    if got < frames {
                        mono[got..].fill(0);
                        if got > 0 || counters.playback_active.load(Ordering::Relaxed) {
                            counters.underruns.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    for f in 0..frames {
                        let sample = mono[f] as f32 / 32768.0;
                        let base = f * ch;
                        data[base..base + ch].fill(sample);
                    }
                },
                err_cb,
                None,
            )
        }
        fmt => {
            return Err(AttuneError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    };

    stream.map_err(|e| AttuneError::AudioStream(e.to_string()))
}

/// Stub when the `audio-cpal` feature is disabled (tests, headless CI).
#[cfg(not(feature = "audio-cpal"))]
impl AudioDuplex {
    pub fn open(
        _prefs: &DevicePrefs,
        _running: Arc<AtomicBool>,
        _counters: Arc<DuplexCounters>,
        _sink: &PlaybackSink,
    ) -> Result<(Self, PcmConsumer)> {
        Err(AttuneError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
