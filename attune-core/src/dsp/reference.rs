//! Far-end reference ring shared by playback (writer) and the AEC (reader).
//!
//! Lock-free SPSC: the playback pipeline pushes each decoded pre-mix frame
//! with its presentation timestamp; the capture pipeline drains into a small
//! local window and picks the frame whose presentation timestamp is closest
//! to `capture_ts - stream_delay`.

use std::collections::VecDeque;

use ringbuf::{traits::Split, HeapRb};

use crate::audio::frame::ReferenceFrame;

pub use ringbuf::traits::{Consumer, Producer};

pub type ReferenceProducer = ringbuf::HeapProd<ReferenceFrame>;
pub type ReferenceConsumer = ringbuf::HeapCons<ReferenceFrame>;

/// Ring capacity in frames: 1 s of audio at the 60 ms cadence, rounded up.
pub const REFERENCE_RING_FRAMES: usize = 17;

/// Window retention in nanoseconds; must cover the AEC tail (≥ 200 ms);
/// frames older than this relative to the newest are evicted.
const WINDOW_RETENTION_NS: u64 = 1_000_000_000;

pub fn create_reference_ring() -> (ReferenceProducer, ReferenceConsumer) {
    HeapRb::<ReferenceFrame>::new(REFERENCE_RING_FRAMES).split()
}

/// AEC-side view over the reference ring.
pub struct ReferenceWindow {
    consumer: ReferenceConsumer,
    window: VecDeque<ReferenceFrame>,
}

impl ReferenceWindow {
    pub fn new(consumer: ReferenceConsumer) -> Self {
        Self {
            consumer,
            window: VecDeque::new(),
        }
    }

    /// Pull everything the playback side has produced and trim stale frames.
    fn drain(&mut self) {
        while let Some(frame) = self.consumer.try_pop() {
            self.window.push_back(frame);
        }
        if let Some(newest) = self.window.back().map(|f| f.presentation_ts_ns) {
            while let Some(front) = self.window.front() {
                if newest.saturating_sub(front.presentation_ts_ns) > WINDOW_RETENTION_NS {
                    self.window.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// The reference frame whose presentation timestamp is closest to
    /// `target_ts_ns`, or `None` when playback is inactive.
    pub fn closest(&mut self, target_ts_ns: u64) -> Option<&ReferenceFrame> {
        self.drain();
        let idx = self
            .window
            .iter()
            .enumerate()
            .min_by_key(|(_, f)| f.presentation_ts_ns.abs_diff(target_ts_ns))
            .map(|(i, _)| i)?;
        self.window.get(idx)
    }

    /// Discard all buffered reference audio (used on abort, when the playback
    /// queue is flushed).
    pub fn clear(&mut self) {
        while self.consumer.try_pop().is_some() {}
        self.window.clear();
    }

    pub fn is_empty(&mut self) -> bool {
        self.drain();
        self.window.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64, ts_ms: u64) -> ReferenceFrame {
        ReferenceFrame {
            seq,
            sample_rate: 16_000,
            samples: vec![0; 960],
            presentation_ts_ns: ts_ms * 1_000_000,
        }
    }

    #[test]
    fn closest_picks_nearest_timestamp() {
        let (mut prod, cons) = create_reference_ring();
        let mut window = ReferenceWindow::new(cons);

        for (seq, ts) in [(0, 0), (1, 60), (2, 120), (3, 180)] {
            prod.try_push(frame(seq, ts)).unwrap();
        }

        let chosen = window.closest(130 * 1_000_000).unwrap();
        assert_eq!(chosen.seq, 2);
    }

    #[test]
    fn empty_ring_yields_none() {
        let (_prod, cons) = create_reference_ring();
        let mut window = ReferenceWindow::new(cons);
        assert!(window.closest(0).is_none());
    }

    #[test]
    fn stale_frames_are_evicted() {
        let (mut prod, cons) = create_reference_ring();
        let mut window = ReferenceWindow::new(cons);

        prod.try_push(frame(0, 0)).unwrap();
        window.closest(0);
        // Push a frame far in the future; the first one ages out.
        prod.try_push(frame(1, 3_000)).unwrap();
        let chosen = window.closest(0).unwrap();
        assert_eq!(chosen.seq, 1);
    }

    #[test]
    fn clear_discards_everything() {
        let (mut prod, cons) = create_reference_ring();
        let mut window = ReferenceWindow::new(cons);
        prod.try_push(frame(0, 0)).unwrap();
        window.clear();
        assert!(window.is_empty());
    }
}
