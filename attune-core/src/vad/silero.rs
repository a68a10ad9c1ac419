//! Silero VAD neural classifier (ONNX).
//!
//! Wraps the Silero VAD model published at
//! <https://github.com/snakers4/silero-vad>, supporting both the v3/v4 LSTM
//! interface (separate `h`/`c` tensors) and the v5 GRU interface (single
//! `state` tensor). Input/output names are resolved tolerantly so minor
//! model revisions keep loading.
//!
//! The model scores 512-sample windows (32 ms at 16 kHz); a 60 ms pipeline
//! frame spans one to two windows and the frame probability is the maximum
//! over its windows.

use std::path::Path;

use ndarray::{Array1, Array2, Array3};
use ort::session::builder::SessionBuilder;
use ort::session::SessionInputValue;
use ort::value::Value;
use tracing::{error, info, warn};

use super::VoiceActivityDetector;
use crate::error::{AttuneError, Result};

/// Window size expected by the model (samples at 16 kHz = 32 ms).
const WINDOW: usize = 512;
/// v3/v4 LSTM state: 2 layers × 1 batch × 64 units per tensor.
const LSTM_STATE: usize = 128;
/// v5 GRU state: 2 layers × 1 batch × 128 units.
const GRU_STATE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoMode {
    StatefulLstm,
    StatefulGru,
    Stateless,
}

struct IoNames {
    input: String,
    sr: Option<String>,
    output: String,
    h: Option<String>,
    c: Option<String>,
    hn: Option<String>,
    cn: Option<String>,
    state: Option<String>,
    state_out: Option<String>,
}

/// Neural VAD over a Silero ONNX session.
pub struct SileroVad {
    session: ort::session::Session,
    io_mode: IoMode,
    names: IoNames,
    h: Vec<f32>,
    c: Vec<f32>,
    state: Vec<f32>,
    input_buf: Vec<f32>,
}

impl SileroVad {
    /// Load the model from `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AttuneError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }

        let session = SessionBuilder::new()
            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();

        let names = IoNames {
            input: resolve_name(&input_names, &["input", "audio", "x"])
                .or_else(|| input_names.first().cloned())
                .ok_or_else(|| AttuneError::OnnxSession("VAD model has no inputs".into()))?,
            sr: resolve_name(&input_names, &["sr", "sample_rate"]),
            output: resolve_name(&output_names, &["output", "speech_prob", "prob"])
                .or_else(|| output_names.first().cloned())
                .ok_or_else(|| AttuneError::OnnxSession("VAD model has no outputs".into()))?,
            h: resolve_name(&input_names, &["h", "state_h"]),
            c: resolve_name(&input_names, &["c", "state_c"]),
            hn: resolve_name(&output_names, &["hn", "state_hn", "h_out"]),
            cn: resolve_name(&output_names, &["cn", "state_cn", "c_out"]),
            state: resolve_name(&input_names, &["state", "h_0", "hidden"]),
            state_out: resolve_name(&output_names, &["stateN", "state_out", "hn_out"]),
        };

        let io_mode = if names.h.is_some()
            && names.c.is_some()
            && names.hn.is_some()
            && names.cn.is_some()
        {
            IoMode::StatefulLstm
        } else if names.state.is_some() {
            IoMode::StatefulGru
        } else {
            IoMode::Stateless
        };

        info!(?path, ?io_mode, inputs = ?input_names, outputs = ?output_names, "silero VAD loaded");

        Ok(Self {
            session,
            io_mode,
            names,
            h: vec![0.0; LSTM_STATE],
            c: vec![0.0; LSTM_STATE],
            state: vec![0.0; GRU_STATE],
            input_buf: Vec::new(),
        })
    }

    fn run_window(&mut self, window: &[f32]) -> Result<f32> {
        debug_assert_eq!(window.len(), WINDOW);

        let onnx = |e: ort::Error| AttuneError::OnnxSession(e.to_string());
        let shape = |e: ndarray::ShapeError| AttuneError::OnnxSession(e.to_string());

        let input_arr =
            Array2::<f32>::from_shape_vec((1, WINDOW), window.to_vec()).map_err(shape)?;
        let mut inputs: Vec<(String, SessionInputValue<'_>)> = vec![(
            self.names.input.clone(),
            Value::from_array(input_arr).map_err(onnx)?.into(),
        )];

        if let Some(sr_name) = &self.names.sr {
            let sr_arr = Array1::<i64>::from_elem(1, 16_000i64);
            inputs.push((
                sr_name.clone(),
                Value::from_array(sr_arr).map_err(onnx)?.into(),
            ));
        }

        match self.io_mode {
            IoMode::StatefulLstm => {
                let h_arr =
                    Array3::<f32>::from_shape_vec((2, 1, 64), self.h.clone()).map_err(shape)?;
                let c_arr =
                    Array3::<f32>::from_shape_vec((2, 1, 64), self.c.clone()).map_err(shape)?;
                if let (Some(h_name), Some(c_name)) = (&self.names.h, &self.names.c) {
                    inputs.push((h_name.clone(), Value::from_array(h_arr).map_err(onnx)?.into()));
                    inputs.push((c_name.clone(), Value::from_array(c_arr).map_err(onnx)?.into()));
                }
            }
            IoMode::StatefulGru => {
                let state_arr = Array3::<f32>::from_shape_vec((2, 1, 128), self.state.clone())
                    .map_err(shape)?;
                if let Some(state_name) = &self.names.state {
                    inputs.push((
                        state_name.clone(),
                        Value::from_array(state_arr).map_err(onnx)?.into(),
                    ));
                }
            }
            IoMode::Stateless => {}
        }

        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;

        let prob_output = outputs
            .get(self.names.output.as_str())
            .unwrap_or(&outputs[0]);
        let (_, prob_data) = prob_output
            .try_extract_tensor::<f32>()
            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        // Carry recurrent state forward; degrade to stateless if the model
        // stops returning it.
        match self.io_mode {
            IoMode::StatefulLstm => {
                let pair = self
                    .names
                    .hn
                    .as_deref()
                    .zip(self.names.cn.as_deref())
                    .and_then(|(hn, cn)| outputs.get(hn).zip(outputs.get(cn)));
                match pair {
                    Some((hn_out, cn_out)) => {
                        let (_, hn) = hn_out
                            .try_extract_tensor::<f32>()
                            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;
                        let (_, cn) = cn_out
                            .try_extract_tensor::<f32>()
                            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;
                        self.h = hn.to_vec();
                        self.c = cn.to_vec();
                    }
                    None => {
                        warn!("VAD LSTM state outputs missing; switching to stateless");
                        self.io_mode = IoMode::Stateless;
                    }
                }
            }
            IoMode::StatefulGru => {
                match self
                    .names
                    .state_out
                    .as_deref()
                    .and_then(|name| outputs.get(name))
                {
                    Some(state_out) => {
                        let (_, data) = state_out
                            .try_extract_tensor::<f32>()
                            .map_err(|e| AttuneError::OnnxSession(e.to_string()))?;
                        self.state = data.to_vec();
                    }
                    None => {
                        warn!("VAD GRU state output missing; switching to stateless");
                        self.io_mode = IoMode::Stateless;
                    }
                }
            }
            IoMode::Stateless => {}
        }

        Ok(prob)
    }
}

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}

impl VoiceActivityDetector for SileroVad {
    fn probability(&mut self, frame: &[i16]) -> f32 {
        self.input_buf
            .extend(frame.iter().map(|&s| s as f32 / 32768.0));

        let mut max_prob = 0.0f32;
        while self.input_buf.len() >= WINDOW {
            let window: Vec<f32> = self.input_buf[..WINDOW].to_vec();
            self.input_buf.drain(..WINDOW);

            match self.run_window(&window) {
                Ok(prob) => max_prob = max_prob.max(prob),
                Err(e) => error!("silero VAD inference error: {e}"),
            }
        }
        max_prob
    }

    fn reset(&mut self) {
        self.h.fill(0.0);
        self.c.fill(0.0);
        self.state.fill(0.0);
        self.input_buf.clear();
    }
}
