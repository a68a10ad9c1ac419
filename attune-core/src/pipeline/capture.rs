//! Blocking capture pipeline.
//!
//! ## Stages (per 60 ms frame)
//!
//! ```text
//! 1. Drain the capture ring → one device-rate block
//! 2. Resample to 16 kHz, slice into 960-sample frames
//! 3. Wake detection on the raw (pre-AEC) frame while armed
//! 4. AEC with the time-aligned far-end reference (+ NS, HPF, AGC)
//! 5. VAD probability → SpeechGate hysteresis → session signals
//! 6. When armed: Opus encode → bounded outbound queue (drop-oldest)
//! ```
//!
//! The thread owns the `AudioDuplex` (cpal streams are `!Send`) and rebuilds
//! it in place after mid-session stream errors: up to 3 attempts, 500 ms
//! apart, then `DeviceFatal`. Frame sequence numbers keep increasing across
//! a rebuild, leaving a visible gap instead of a reset.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::audio::frame::{
    samples_per_frame, AudioFrame, PIPELINE_FRAME_SAMPLES, PIPELINE_SAMPLE_RATE,
};
use crate::audio::resample::RateConverter;
use crate::audio::{AudioDuplex, Consumer, DevicePrefs, DuplexCounters, PlaybackSink};
use crate::codec::VoiceEncoder;
use crate::dsp::reference::ReferenceWindow;
use crate::dsp::AudioProcessor;
use crate::pipeline::{
    AudioPacket, FrameQueue, PipelineControl, PipelineDiagnostics, PipelineSignal, WavTap,
};
use crate::vad::{GateTransition, SpeechGate, VoiceActivityDetector};
use crate::wake::WakeDetector;

/// Stream rebuild policy: 3 attempts, 500 ms apart.
const REBUILD_ATTEMPTS: u32 = 3;
const REBUILD_BACKOFF: Duration = Duration::from_millis(500);

/// Sleep when the ring has no fresh block yet (well under one frame).
const EMPTY_SLEEP: Duration = Duration::from_millis(5);

pub struct CaptureContext {
    pub prefs: DevicePrefs,
    pub control: Arc<PipelineControl>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub counters: Arc<DuplexCounters>,
    pub playback_sink: PlaybackSink,
    pub processor: AudioProcessor,
    pub vad: Box<dyn VoiceActivityDetector>,
    pub gate: SpeechGate,
    pub wake: WakeDetector,
    pub encoder: VoiceEncoder,
    pub reference: ReferenceWindow,
    pub outbound: Arc<FrameQueue<AudioPacket>>,
    pub signals: mpsc::UnboundedSender<PipelineSignal>,
    pub wav_tap: Option<WavTap>,
    /// Shared monotonic epoch for capture/presentation timestamps.
    pub clock: Instant,
}

/// Run the capture pipeline until `control.running` clears.
pub fn run(ctx: CaptureContext) {
    let CaptureContext {
        prefs,
        control,
        diagnostics,
        counters,
        playback_sink,
        mut processor,
        mut vad,
        mut gate,
        mut wake,
        mut encoder,
        mut reference,
        outbound,
        signals,
        mut wav_tap,
        clock,
    } = ctx;

    let running_flag = Arc::new(std::sync::atomic::AtomicBool::new(true));

    // ── Open the duplex (must happen on THIS thread — cpal streams are !Send) ──
    let (mut duplex, mut capture_cons) = match AudioDuplex::open(
        &prefs,
        Arc::clone(&running_flag),
        Arc::clone(&counters),
        &playback_sink,
    ) {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to open audio devices: {e}");
            let _ = signals.send(PipelineSignal::DeviceFatal(e.to_string()));
            return;
        }
    };

    let device_rate = duplex.sample_rate;
    control
        .device_sample_rate
        .store(device_rate, Ordering::Release);
    let block_samples = samples_per_frame(device_rate);

    let mut resampler = match RateConverter::new(device_rate, PIPELINE_SAMPLE_RATE, block_samples) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create capture resampler: {e}");
            let _ = signals.send(PipelineSignal::DeviceFatal(e.to_string()));
            return;
        }
    };

    info!(device_rate, block_samples, "capture pipeline started");

    let mut block = vec![0i16; block_samples];
    let mut block_fill = 0usize;
    // Resampled 16 kHz samples awaiting a full frame.
    let mut pending: Vec<i16> = Vec::with_capacity(PIPELINE_FRAME_SAMPLES * 2);
    let mut seq: u64 = 0;

    'outer: while control.running.load(Ordering::Relaxed) {
        // ── Stream health ────────────────────────────────────────────────
        if duplex.is_failed() {
            warn!("audio stream lost, rebuilding");
            let mut rebuilt = false;
            for attempt in 1..=REBUILD_ATTEMPTS {
                std::thread::sleep(REBUILD_BACKOFF);
                if !control.running.load(Ordering::Relaxed) {
                    break 'outer;
                }
                match AudioDuplex::open(
                    &prefs,
                    Arc::clone(&running_flag),
                    Arc::clone(&counters),
                    &playback_sink,
                ) {
                    Ok((new_duplex, new_cons)) => {
                        duplex = new_duplex;
                        capture_cons = new_cons;
                        counters.rebuilds.fetch_add(1, Ordering::Relaxed);
                        diagnostics.stream_rebuilds.fetch_add(1, Ordering::Relaxed);
                        // Adaptive state is stale after a gap; start clean.
                        resampler.reset();
                        processor.reset();
                        vad.reset();
                        block_fill = 0;
                        pending.clear();
                        // Leave a visible sequence gap instead of resetting.
                        seq += 1;
                        info!(attempt, "audio stream rebuilt");
                        rebuilt = true;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, "stream rebuild failed: {e}");
                    }
                }
            }
            if !rebuilt {
                error!("audio stream lost beyond rebuild attempts");
                let _ = signals.send(PipelineSignal::DeviceFatal(
                    "audio stream lost beyond rebuild attempts".into(),
                ));
                break;
            }
        }

        // ── Wake re-arm request from the session task ────────────────────
        if control.wake_resume.swap(false, Ordering::AcqRel) {
            wake.resume();
        }

        // ── 1. Drain ring into the current device-rate block ─────────────
        let read = capture_cons.pop_slice(&mut block[block_fill..]);
        block_fill += read;
        if block_fill < block_samples {
            std::thread::sleep(EMPTY_SLEEP);
            continue;
        }
        block_fill = 0;

        let capture_ts_ns = clock.elapsed().as_nanos() as u64;

        // ── 2. Resample to the pipeline rate ─────────────────────────────
        pending.extend_from_slice(&resampler.process(&block));

        while pending.len() >= PIPELINE_FRAME_SAMPLES {
            let samples: Vec<i16> = pending.drain(..PIPELINE_FRAME_SAMPLES).collect();
            seq += 1;
            let mut frame = AudioFrame::new(seq, PIPELINE_SAMPLE_RATE, samples, capture_ts_ns);
            diagnostics.frames_captured.fetch_add(1, Ordering::Relaxed);

            // ── 3. Wake detection on the raw stream ──────────────────────
            if control.wake_armed.load(Ordering::Relaxed) {
                if let Some(event) = wake.process(&frame.samples, frame.capture_ts_ns) {
                    diagnostics.wake_fires.fetch_add(1, Ordering::Relaxed);
                    let _ = signals.send(PipelineSignal::Wake {
                        keyword: event.keyword,
                        confidence: event.confidence,
                    });
                }
            }

            // ── 4. Echo cancellation with the aligned reference ──────────
            if control.delay_updated.swap(false, Ordering::AcqRel) {
                processor.update_stream_delay(control.observed_delay_ms.load(Ordering::Acquire));
            }
            let far = if counters.playback_active.load(Ordering::Relaxed) {
                let delay_ns = processor.stream_delay_ms() as u64 * 1_000_000;
                let target = frame.capture_ts_ns.saturating_sub(delay_ns);
                reference.closest(target).map(|f| f.samples.clone())
            } else {
                None
            };
            processor.process_capture(&mut frame.samples, far.as_deref());

            if let Some(tap) = wav_tap.as_mut() {
                tap.write(&frame.samples);
            }

            // ── 5. VAD + hysteresis ──────────────────────────────────────
            let probability = vad.probability(&frame.samples);
            match gate.update(probability) {
                GateTransition::SpeechStart => {
                    let _ = signals.send(PipelineSignal::SpeechStart);
                }
                GateTransition::SpeechEnd => {
                    let _ = signals.send(PipelineSignal::EndOfUtterance);
                }
                GateTransition::None => {}
            }
            if gate.in_speech() {
                diagnostics.vad_speech_frames.fetch_add(1, Ordering::Relaxed);
            }

            // ── 6. Encode + enqueue for the transport ────────────────────
            if control.capture_armed.load(Ordering::Relaxed) {
                match encoder.encode(&frame.samples) {
                    Ok(payload) => {
                        diagnostics.frames_encoded.fetch_add(1, Ordering::Relaxed);
                        let packet = AudioPacket {
                            seq: frame.seq as u32,
                            payload,
                        };
                        if outbound.push_drop_oldest(packet) {
                            diagnostics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        // One bad frame is dropped; the encoder state resets.
                        warn!("encode error: {e}");
                        encoder.reset();
                    }
                }
            }
        }
    }

    running_flag.store(false, Ordering::Release);
    outbound.clear();
    drop(duplex);

    let snap = diagnostics.snapshot();
    info!(
        frames_captured = snap.frames_captured,
        frames_encoded = snap.frames_encoded,
        packets_dropped = snap.packets_dropped,
        vad_speech_frames = snap.vad_speech_frames,
        wake_fires = snap.wake_fires,
        stream_rebuilds = snap.stream_rebuilds,
        "capture pipeline stopped"
    );
}
