//! Blocking playback pipeline.
//!
//! ```text
//! transport binary → decode (PLC on gaps) → 16 kHz frames
//!     ├─► reference ring (pre-mix copy, presentation-stamped, for the AEC)
//!     └─► resample to device rate → playback ring → output callback
//! ```
//!
//! Backpressure here blocks the producer: dropping TTS audio is audibly
//! worse than buffering. The ring occupancy is paced to a small target so
//! an abort can drain the queue within the 100 ms budget.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use ringbuf::traits::{Observer, Producer};
use tracing::{debug, info, warn};

use crate::audio::frame::{ReferenceFrame, PIPELINE_FRAME_SAMPLES, PIPELINE_SAMPLE_RATE};
use crate::audio::resample::RateConverter;
use crate::audio::{DuplexCounters, PlaybackSink};
use crate::codec::VoiceDecoder;
use crate::dsp::reference::ReferenceProducer;
use crate::pipeline::{PipelineControl, PipelineDiagnostics, PlaybackCommand};

/// Target playback-ring occupancy at the device rate: keeps the flush
/// residual under the 100 ms drain budget.
const PACE_TARGET_MS: u64 = 80;

/// Poll interval while waiting for commands or ring space.
const POLL: Duration = Duration::from_millis(5);

pub struct PlaybackContext {
    pub control: Arc<PipelineControl>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub counters: Arc<DuplexCounters>,
    pub decoder: VoiceDecoder,
    pub playback_sink: PlaybackSink,
    pub reference_tx: ReferenceProducer,
    pub inbound: crossbeam_channel::Receiver<PlaybackCommand>,
    /// Shared monotonic epoch for capture/presentation timestamps.
    pub clock: Instant,
}

/// Run the playback pipeline until `control.running` clears.
pub fn run(ctx: PlaybackContext) {
    let PlaybackContext {
        control,
        diagnostics,
        counters,
        mut decoder,
        playback_sink,
        mut reference_tx,
        inbound,
        clock,
    } = ctx;

    // The device rate is known once the capture thread opens the duplex.
    let device_rate = loop {
        if !control.running.load(Ordering::Relaxed) {
            return;
        }
        let rate = control.device_sample_rate.load(Ordering::Acquire);
        if rate != 0 {
            break rate;
        }
        std::thread::sleep(POLL);
    };

    let mut resampler =
        match RateConverter::new(PIPELINE_SAMPLE_RATE, device_rate, PIPELINE_FRAME_SAMPLES) {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to create playback resampler: {e}");
                return;
            }
        };

    let pace_target_samples = (device_rate as u64 * PACE_TARGET_MS / 1_000) as usize;
    info!(device_rate, pace_target_samples, "playback pipeline started");

    let mut reference_seq: u64 = 0;
    let mut was_active = false;

    while control.running.load(Ordering::Relaxed) {
        let command = match inbound.recv_timeout(Duration::from_millis(50)) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => {
                // Idle: mark playback inactive once the ring has drained.
                if was_active && ring_occupancy(&playback_sink) == 0 {
                    counters.playback_active.store(false, Ordering::Release);
                    was_active = false;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match command {
            PlaybackCommand::Flush => {
                // Drop whatever is still queued, then start clean.
                while inbound.try_recv().is_ok() {}
                decoder.reset();
                resampler.reset();
                counters.playback_active.store(false, Ordering::Release);
                control.flush_pending.store(false, Ordering::Release);
                was_active = false;
                debug!("playback flushed");
            }
            PlaybackCommand::Audio { epoch, seq, payload } => {
                if control.flush_pending.load(Ordering::Acquire) {
                    continue;
                }
                if epoch != control.epoch.load(Ordering::Acquire) {
                    debug!(seq, "dropping audio packet from stale session");
                    continue;
                }

                let pcm = match decoder.decode_packet(seq, &payload) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        // Codec errors reset state and cost one silent frame.
                        warn!(seq, "decode error: {e}");
                        diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                        decoder.reset();
                        vec![0i16; PIPELINE_FRAME_SAMPLES]
                    }
                };
                if pcm.is_empty() {
                    continue;
                }

                let frames = pcm.len() / PIPELINE_FRAME_SAMPLES;
                diagnostics
                    .frames_decoded
                    .fetch_add(frames.max(1), Ordering::Relaxed);
                if frames > 1 {
                    diagnostics
                        .frames_concealed
                        .fetch_add(frames - 1, Ordering::Relaxed);
                }

                // First audio after idle: observe the current buffering as
                // the stream-delay estimate for the AEC.
                if !was_active {
                    let queued_ms =
                        ring_occupancy(&playback_sink) as u64 * 1_000 / device_rate as u64;
                    control
                        .observed_delay_ms
                        .store(queued_ms as u32 + PACE_TARGET_MS as u32 / 2, Ordering::Release);
                    control.delay_updated.store(true, Ordering::Release);
                    was_active = true;
                }
                counters.playback_active.store(true, Ordering::Release);

                for chunk in pcm.chunks(PIPELINE_FRAME_SAMPLES) {
                    // Pre-mix copy for the echo canceller, stamped with the
                    // estimated presentation time.
                    let queued_ns = ring_occupancy(&playback_sink) as u64 * 1_000_000_000
                        / device_rate as u64;
                    let frame = ReferenceFrame {
                        seq: reference_seq,
                        sample_rate: PIPELINE_SAMPLE_RATE,
                        samples: chunk.to_vec(),
                        presentation_ts_ns: clock.elapsed().as_nanos() as u64 + queued_ns,
                    };
                    reference_seq += 1;
                    let _ = reference_tx.try_push(frame);

                    let device_pcm = resampler.process(chunk);
                    push_with_backpressure(
                        &playback_sink,
                        &device_pcm,
                        &control,
                        pace_target_samples,
                    );
                    if control.flush_pending.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
    }

    let snap = diagnostics.snapshot();
    info!(
        frames_decoded = snap.frames_decoded,
        frames_concealed = snap.frames_concealed,
        decode_errors = snap.decode_errors,
        "playback pipeline stopped"
    );
}

fn ring_occupancy(sink: &PlaybackSink) -> usize {
    sink.lock().as_ref().map_or(0, |prod| prod.occupied_len())
}

/// Blocking push into the playback ring, pacing occupancy to the target.
fn push_with_backpressure(
    sink: &PlaybackSink,
    samples: &[i16],
    control: &PipelineControl,
    pace_target: usize,
) {
    let mut offset = 0;
    while offset < samples.len() {
        if !control.running.load(Ordering::Relaxed)
            || control.flush_pending.load(Ordering::Acquire)
        {
            return;
        }
        {
            let mut guard = sink.lock();
            if let Some(prod) = guard.as_mut() {
                if prod.occupied_len() < pace_target {
                    offset += prod.push_slice(&samples[offset..]);
                    continue;
                }
            } else {
                // Duplex is rebuilding; the producer will reappear shortly.
            }
        }
        std::thread::sleep(POLL);
    }
}
