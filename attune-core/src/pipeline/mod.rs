//! Pipeline scaffolding shared by the capture and playback threads.
//!
//! Both halves run as blocking loops in `spawn_blocking`, keeping the Tokio
//! executor free for the control plane. They coordinate with the session
//! task through lock-free flags (`PipelineControl`), bounded queues, and
//! atomic counters (`PipelineDiagnostics`).

pub mod capture;
pub mod playback;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One encoded Opus packet heading for the transport.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Commands consumed by the playback thread.
#[derive(Debug)]
pub enum PlaybackCommand {
    Audio {
        /// Session epoch the packet was received under; stale epochs are
        /// dropped before decoding.
        epoch: u64,
        seq: u32,
        payload: Vec<u8>,
    },
    /// Drop everything queued and reset the decoder.
    Flush,
}

/// Signals from the pipeline threads to the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineSignal {
    SpeechStart,
    EndOfUtterance,
    Wake { keyword: String, confidence: f32 },
    /// Audio device lost beyond rebuild attempts; fatal to the session.
    DeviceFatal(String),
}

/// Shared run-state flags. The session task writes, pipelines read.
#[derive(Debug, Default)]
pub struct PipelineControl {
    /// Master run flag; cleared on shutdown.
    pub running: AtomicBool,
    /// Encode-and-send armed (LISTENING, or SPEAKING in realtime mode).
    pub capture_armed: AtomicBool,
    /// Wake detection armed (IDLE, or SPEAKING with barge-in).
    pub wake_armed: AtomicBool,
    /// Request the capture thread to re-arm its wake detector.
    pub wake_resume: AtomicBool,
    /// Session epoch, bumped on every fresh session so stale audio packets
    /// are rejected.
    pub epoch: AtomicU64,
    /// Fast-path flag telling playback to discard audio until the Flush
    /// command is consumed.
    pub flush_pending: AtomicBool,
    /// Device sample rate, published by the capture thread once the duplex
    /// is open (0 = not yet known).
    pub device_sample_rate: AtomicU32,
    /// Latest playback-start delay observation (ms) for the AEC.
    pub observed_delay_ms: AtomicU32,
    /// Set when `observed_delay_ms` holds a fresh value.
    pub delay_updated: AtomicBool,
}

/// Atomic counters for observability; mirrors the drop/underrun metrics the
/// audio boundary is required to keep.
#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_encoded: AtomicUsize,
    /// Oldest-frame drops at the full outbound queue.
    pub packets_dropped: AtomicUsize,
    pub frames_decoded: AtomicUsize,
    pub frames_concealed: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub stream_rebuilds: AtomicUsize,
    pub vad_speech_frames: AtomicUsize,
    pub wake_fires: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub frames_encoded: usize,
    pub packets_dropped: usize,
    pub frames_decoded: usize,
    pub frames_concealed: usize,
    pub decode_errors: usize,
    pub stream_rebuilds: usize,
    pub vad_speech_frames: usize,
    pub wake_fires: usize,
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_concealed: self.frames_concealed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            stream_rebuilds: self.stream_rebuilds.load(Ordering::Relaxed),
            vad_speech_frames: self.vad_speech_frames.load(Ordering::Relaxed),
            wake_fires: self.wake_fires.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_encoded.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.frames_decoded.store(0, Ordering::Relaxed);
        self.frames_concealed.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.stream_rebuilds.store(0, Ordering::Relaxed);
        self.vad_speech_frames.store(0, Ordering::Relaxed);
        self.wake_fires.store(0, Ordering::Relaxed);
    }
}

/// Bounded FIFO between pipeline stages.
///
/// A full queue drops the **oldest** element (at the audio boundary
/// freshness beats completeness) and reports the drop so the caller can
/// bump the metric. `pop_timeout` lets blocking consumers observe the run
/// flag periodically.
pub struct FrameQueue<T> {
    inner: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

/// Default stage-queue depth: 8 frames ≈ 480 ms.
pub const STAGE_QUEUE_FRAMES: usize = 8;

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Push, evicting the oldest element when full. Returns `true` if an
    /// element was dropped.
    pub fn push_drop_oldest(&self, item: T) -> bool {
        let mut queue = self.inner.lock();
        let dropped = if queue.len() >= self.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(item);
        drop(queue);
        self.available.notify_one();
        dropped
    }

    /// Pop the oldest element, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut queue = self.inner.lock();
        if queue.is_empty() {
            self.available.wait_for(&mut queue, timeout);
        }
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Remove everything (cancellation drain).
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Debug WAV tap on the post-AEC capture stream. Off unless configured.
pub struct WavTap {
    writer: hound::WavWriter<std::io::BufWriter<std::fs::File>>,
}

impl WavTap {
    pub fn create(path: &std::path::Path, sample_rate: u32) -> crate::error::Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)
            .map_err(|e| crate::error::AttuneError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, frame: &[i16]) {
        for &sample in frame {
            // Tap failures must never disturb the pipeline.
            if self.writer.write_sample(sample).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_fifo_order() {
        let queue = FrameQueue::new(4);
        for i in 0..4 {
            assert!(!queue.push_drop_oldest(i));
        }
        for i in 0..4 {
            assert_eq!(queue.pop_timeout(Duration::from_millis(1)), Some(i));
        }
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = FrameQueue::new(3);
        for i in 0..3 {
            queue.push_drop_oldest(i);
        }
        assert!(queue.push_drop_oldest(3), "expected a drop report");
        // 0 was evicted; 1 is now the oldest.
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), Some(1));
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), Some(2));
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), Some(3));
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue: FrameQueue<u32> = FrameQueue::new(2);
        let start = std::time::Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn pop_wakes_on_push_from_other_thread() {
        let queue = std::sync::Arc::new(FrameQueue::new(2));
        let producer = std::sync::Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push_drop_oldest(42u32);
        });
        let got = queue.pop_timeout(Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got, Some(42));
    }

    #[test]
    fn diagnostics_reset_zeroes_counters() {
        let diag = PipelineDiagnostics::default();
        diag.frames_captured.store(10, Ordering::Relaxed);
        diag.packets_dropped.store(2, Ordering::Relaxed);
        diag.reset();
        let snap = diag.snapshot();
        assert_eq!(snap.frames_captured, 0);
        assert_eq!(snap.packets_dropped, 0);
    }
}
