//! Opus framing for the audio plane.
//!
//! Encoder: 16 kHz mono, 60 ms frames, VoIP application profile, 24 kbps,
//! VBR, in-band FEC. One packet per frame, ≤ 512 bytes.
//!
//! Decoder: tracks the transport-envelope sequence number, conceals gaps of
//! up to 5 frames with PLC, and flushes its state on larger gaps so a long
//! outage does not smear stale prediction into fresh audio.

use tracing::{debug, warn};

use crate::audio::frame::{PIPELINE_FRAME_SAMPLES, PIPELINE_SAMPLE_RATE};
use crate::error::{AttuneError, Result};

/// Hard ceiling on encoded packet size (bytes).
pub const MAX_PACKET_BYTES: usize = 512;

/// Target encoder bitrate (bits/s).
const BITRATE: i32 = 24_000;

/// Largest sequence gap concealed with PLC; beyond this the decoder resets.
pub const MAX_PLC_GAP: u32 = 5;

pub struct VoiceEncoder {
    encoder: opus::Encoder,
}

impl VoiceEncoder {
    pub fn new() -> Result<Self> {
        let mut encoder = opus::Encoder::new(
            PIPELINE_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| AttuneError::Codec(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(BITRATE))
            .map_err(|e| AttuneError::Codec(e.to_string()))?;
        encoder
            .set_vbr(true)
            .map_err(|e| AttuneError::Codec(e.to_string()))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| AttuneError::Codec(e.to_string()))?;

        Ok(Self { encoder })
    }

    /// Encode one 60 ms pipeline frame into a single Opus packet.
    ///
    /// # Errors
    /// `AttuneError::Codec` on wrong frame length or encoder failure.
    pub fn encode(&mut self, frame: &[i16]) -> Result<Vec<u8>> {
        if frame.len() != PIPELINE_FRAME_SAMPLES {
            return Err(AttuneError::Codec(format!(
                "encoder expects {PIPELINE_FRAME_SAMPLES} samples, got {}",
                frame.len()
            )));
        }
        let packet = self
            .encoder
            .encode_vec(frame, MAX_PACKET_BYTES)
            .map_err(|e| AttuneError::Codec(e.to_string()))?;
        debug_assert!(packet.len() <= MAX_PACKET_BYTES);
        Ok(packet)
    }

    /// Drop encoder prediction state (used after a codec error).
    pub fn reset(&mut self) {
        if let Err(e) = self.encoder.reset_state() {
            warn!("encoder reset failed: {e}");
        }
    }
}

pub struct VoiceDecoder {
    decoder: opus::Decoder,
    /// Last sequence number successfully decoded, if any this session.
    last_seq: Option<u32>,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self> {
        let decoder = opus::Decoder::new(PIPELINE_SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| AttuneError::Codec(e.to_string()))?;
        Ok(Self {
            decoder,
            last_seq: None,
        })
    }

    /// Decode one sequenced packet into PCM.
    ///
    /// Returns the concealed frames for any gap ≤ `MAX_PLC_GAP` followed by
    /// the decoded frame, flattened. Stale or duplicate sequence numbers
    /// yield an empty vector.
    pub fn decode_packet(&mut self, seq: u32, payload: &[u8]) -> Result<Vec<i16>> {
        let mut out = Vec::new();

        if let Some(last) = self.last_seq {
            if seq <= last {
                debug!(seq, last, "dropping stale/duplicate audio packet");
                return Ok(out);
            }
            let gap = seq - last - 1;
            if gap > 0 {
                if gap <= MAX_PLC_GAP {
                    debug!(gap, "concealing lost packets");
                    for _ in 0..gap {
                        out.extend_from_slice(&self.conceal()?);
                    }
                } else {
                    warn!(gap, "sequence gap too large; flushing decoder state");
                    self.reset();
                }
            }
        }

        let mut pcm = vec![0i16; PIPELINE_FRAME_SAMPLES];
        let decoded = self
            .decoder
            .decode(payload, &mut pcm, false)
            .map_err(|e| AttuneError::Codec(e.to_string()))?;
        pcm.truncate(decoded);
        out.extend_from_slice(&pcm);

        self.last_seq = Some(seq);
        Ok(out)
    }

    /// One frame of packet-loss concealment.
    fn conceal(&mut self) -> Result<Vec<i16>> {
        let mut pcm = vec![0i16; PIPELINE_FRAME_SAMPLES];
        let decoded = self
            .decoder
            .decode(&[], &mut pcm, false)
            .map_err(|e| AttuneError::Codec(e.to_string()))?;
        pcm.truncate(decoded);
        Ok(pcm)
    }

    /// Flush prediction state and forget the sequence position.
    pub fn reset(&mut self) {
        if let Err(e) = self.decoder.reset_state() {
            warn!("decoder reset failed: {e}");
        }
        self.last_seq = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_frame(freq: f32, frame_idx: usize) -> Vec<i16> {
        (0..PIPELINE_FRAME_SAMPLES)
            .map(|i| {
                let n = frame_idx * PIPELINE_FRAME_SAMPLES + i;
                let t = n as f32 / PIPELINE_SAMPLE_RATE as f32;
                ((t * freq * std::f32::consts::TAU).sin() * 0.4 * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn encode_produces_bounded_packets() {
        let mut enc = VoiceEncoder::new().unwrap();
        for idx in 0..10 {
            let packet = enc.encode(&tone_frame(440.0, idx)).unwrap();
            assert!(!packet.is_empty());
            assert!(packet.len() <= MAX_PACKET_BYTES);
        }
    }

    #[test]
    fn wrong_frame_length_is_rejected() {
        let mut enc = VoiceEncoder::new().unwrap();
        assert!(enc.encode(&vec![0i16; 480]).is_err());
    }

    #[test]
    fn round_trip_preserves_frame_length() {
        // Invariant: encoded packets decode back to PCM of equal length.
        let mut enc = VoiceEncoder::new().unwrap();
        let mut dec = VoiceDecoder::new().unwrap();

        for idx in 0..5 {
            let frame = tone_frame(440.0, idx);
            let packet = enc.encode(&frame).unwrap();
            let pcm = dec.decode_packet(idx as u32, &packet).unwrap();
            assert!(
                (pcm.len() as isize - frame.len() as isize).unsigned_abs() <= 1,
                "frame {idx}: decoded {} samples, expected {}",
                pcm.len(),
                frame.len()
            );
        }
    }

    #[test]
    fn small_gap_is_concealed() {
        let mut enc = VoiceEncoder::new().unwrap();
        let mut dec = VoiceDecoder::new().unwrap();

        let p0 = enc.encode(&tone_frame(440.0, 0)).unwrap();
        dec.decode_packet(0, &p0).unwrap();

        // Packets 1 and 2 lost; packet 3 arrives.
        let p3 = enc.encode(&tone_frame(440.0, 3)).unwrap();
        let pcm = dec.decode_packet(3, &p3).unwrap();

        // 2 concealed frames + the decoded one.
        assert_eq!(pcm.len(), 3 * PIPELINE_FRAME_SAMPLES);
    }

    #[test]
    fn large_gap_flushes_state() {
        let mut enc = VoiceEncoder::new().unwrap();
        let mut dec = VoiceDecoder::new().unwrap();

        let p0 = enc.encode(&tone_frame(440.0, 0)).unwrap();
        dec.decode_packet(0, &p0).unwrap();

        // Gap of 10 > MAX_PLC_GAP: no concealment, just the fresh frame.
        let p11 = enc.encode(&tone_frame(440.0, 11)).unwrap();
        let pcm = dec.decode_packet(11, &p11).unwrap();
        assert_eq!(pcm.len(), PIPELINE_FRAME_SAMPLES);
    }

    #[test]
    fn stale_packet_is_dropped() {
        let mut enc = VoiceEncoder::new().unwrap();
        let mut dec = VoiceDecoder::new().unwrap();

        let p5 = enc.encode(&tone_frame(440.0, 5)).unwrap();
        dec.decode_packet(5, &p5).unwrap();

        let p4 = enc.encode(&tone_frame(440.0, 4)).unwrap();
        let pcm = dec.decode_packet(4, &p4).unwrap();
        assert!(pcm.is_empty());
    }
}
