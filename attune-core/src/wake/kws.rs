//! ONNX keyword spotter.
//!
//! Scores a one-second sliding window of 16 kHz audio against the keyword
//! table on every pipeline frame. The model takes `[1, 16000]` f32 samples
//! and returns `[1, K+1]` logits, one per keyword plus a trailing
//! background class; entry order in the keyword table must match the
//! model's output order.

use std::path::Path;

use ndarray::Array2;
use ort::session::builder::SessionBuilder;
use ort::session::SessionInputValue;
use ort::value::Value;
use tracing::{error, info};

use super::{Keyword, WakeWordSpotter};
use crate::error::{AttuneError, Result};

/// Sliding window length (samples at 16 kHz = 1 s).
const WINDOW: usize = 16_000;
/// Hop between scored windows (samples = 60 ms): once per pipeline frame.
const HOP: usize = 960;

pub struct OnnxSpotter {
    session: ort::session::Session,
    keywords: Vec<Keyword>,
    input_name: String,
    window: Vec<f32>,
    pending: usize,
}

impl OnnxSpotter {
    pub fn new(path: impl AsRef<Path>, keywords: Vec<Keyword>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AttuneError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        if keywords.is_empty() {
            return Err(AttuneError::Config(
                "wake-word spotter requires a non-empty keyword table".into(),
            ));
        }

        let session = SessionBuilder::new()
            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;

        let input_name = session
            .inputs()
            .first()
            .map(|outlet| outlet.name().to_string())
            .ok_or_else(|| AttuneError::OnnxSession("KWS model has no inputs".into()))?;

        info!(?path, keywords = keywords.len(), "keyword spotter loaded");

        Ok(Self {
            session,
            keywords,
            input_name,
            window: vec![0.0; WINDOW],
            pending: 0,
        })
    }

    fn score_window(&mut self) -> Result<Option<(String, f32)>> {
        let onnx = |e: ort::Error| AttuneError::OnnxSession(e.to_string());

        let input_arr = Array2::<f32>::from_shape_vec((1, WINDOW), self.window.clone())
            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;
        let inputs: Vec<(String, SessionInputValue<'_>)> = vec![(
            self.input_name.clone(),
            Value::from_array(input_arr).map_err(onnx)?.into(),
        )];

        let outputs = self.session.run(inputs).map_err(onnx)?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;

        // Softmax over keyword classes + background.
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        if sum <= 0.0 {
            return Ok(None);
        }

        let best = self
            .keywords
            .iter()
            .zip(exps.iter())
            .max_by(|(_, a), (_, b)| a.total_cmp(b));

        Ok(best.map(|(keyword, &e)| (keyword.phrase.clone(), e / sum)))
    }
}

impl WakeWordSpotter for OnnxSpotter {
    fn feed(&mut self, frame: &[i16]) -> Option<(String, f32)> {
        // Slide the window forward by the frame length.
        let n = frame.len().min(WINDOW);
        self.window.rotate_left(n);
        let start = WINDOW - n;
        for (dst, &src) in self.window[start..].iter_mut().zip(frame.iter()) {
            *dst = src as f32 / 32768.0;
        }

        self.pending += n;
        if self.pending < HOP {
            return None;
        }
        self.pending = 0;

        match self.score_window() {
            Ok(result) => result,
            Err(e) => {
                error!("keyword spotter inference error: {e}");
                None
            }
        }
    }

    fn reset(&mut self) {
        self.window.fill(0.0);
        self.pending = 0;
    }
}
