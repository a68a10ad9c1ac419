//! Core configuration and the persisted-state structs the core consumes.
//!
//! Loading is the host's job; the core defines the typed shapes, fills
//! defaults for everything optional, and validates hard bounds. Validation
//! failures are fatal at startup; a half-configured audio pipeline is worse
//! than no pipeline.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dsp::ProcessorConfig;
use crate::error::{AttuneError, Result};
use crate::session::SessionConfig;
use crate::tools::dispatch::DispatchConfig;
use crate::transport::{MqttConfig, TransportKind, WebSocketConfig};
use crate::vad::VadConfig;
use crate::wake::WakeConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransportSettings {
    pub kind: TransportKind,
    pub websocket: Option<WebSocketConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub max_concurrent_calls: usize,
    pub call_timeout_s: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 8,
            call_timeout_s: 20,
        }
    }
}

impl ToolSettings {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_concurrent: self.max_concurrent_calls,
            call_timeout: std::time::Duration::from_secs(self.call_timeout_s),
        }
    }
}

/// Top-level configuration for the core runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AttuneConfig {
    /// Preferred capture device name; `None` selects heuristically.
    pub input_device: Option<String>,
    /// Preferred playback device name; `None` selects the default.
    pub output_device: Option<String>,
    pub processing: ProcessorConfig,
    pub vad: VadConfig,
    pub wake: WakeConfig,
    pub transport: TransportSettings,
    pub session: SessionConfig,
    pub tools: ToolSettings,
    /// Path to the ONNX VAD model; the energy fallback is used when unset
    /// or when loading fails.
    pub vad_model_path: Option<PathBuf>,
    /// Write the post-AEC capture stream to this WAV file (diagnostics).
    pub debug_capture_wav: Option<PathBuf>,
}

impl AttuneConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AttuneConfig = serde_json::from_str(&raw)
            .map_err(|e| AttuneError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check hard bounds. Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(AttuneError::Config(format!(
                "vad.threshold {} outside [0, 1]",
                self.vad.threshold
            )));
        }
        if !(100..=10_000).contains(&self.vad.silence_timeout_ms) {
            return Err(AttuneError::Config(format!(
                "vad.silence_timeout_ms {} outside [100, 10000]",
                self.vad.silence_timeout_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.wake.threshold) {
            return Err(AttuneError::Config(format!(
                "wake.threshold {} outside [0, 1]",
                self.wake.threshold
            )));
        }
        if self.processing.stream_delay_ms > 500 {
            return Err(AttuneError::Config(format!(
                "processing.stream_delay_ms {} above 500",
                self.processing.stream_delay_ms
            )));
        }
        if !(0.0..=31.0).contains(&self.processing.agc1.target_level_dbfs) {
            return Err(AttuneError::Config(format!(
                "agc1.target_level_dbfs {} outside [0, 31]",
                self.processing.agc1.target_level_dbfs
            )));
        }
        if !(0.0..=90.0).contains(&self.processing.agc1.compression_gain_db) {
            return Err(AttuneError::Config(format!(
                "agc1.compression_gain_db {} outside [0, 90]",
                self.processing.agc1.compression_gain_db
            )));
        }
        if !(1..=64).contains(&self.tools.max_concurrent_calls) {
            return Err(AttuneError::Config(format!(
                "tools.max_concurrent_calls {} outside [1, 64]",
                self.tools.max_concurrent_calls
            )));
        }
        if !(1..=300).contains(&self.tools.call_timeout_s) {
            return Err(AttuneError::Config(format!(
                "tools.call_timeout_s {} outside [1, 300]",
                self.tools.call_timeout_s
            )));
        }

        match self.transport.kind {
            TransportKind::Websocket => {
                let ws = self.transport.websocket.as_ref().ok_or_else(|| {
                    AttuneError::Config("websocket transport selected but not configured".into())
                })?;
                let url = url::Url::parse(&ws.url)
                    .map_err(|e| AttuneError::Config(format!("websocket.url: {e}")))?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(AttuneError::Config(format!(
                        "websocket.url scheme '{}' is not ws/wss",
                        url.scheme()
                    )));
                }
            }
            TransportKind::Mqtt => {
                let mqtt = self.transport.mqtt.as_ref().ok_or_else(|| {
                    AttuneError::Config("mqtt transport selected but not configured".into())
                })?;
                if mqtt.host.is_empty() || mqtt.port == 0 {
                    return Err(AttuneError::Config("mqtt host/port missing".into()));
                }
                for (name, topic) in [
                    ("publish_audio_topic", &mqtt.publish_audio_topic),
                    ("publish_control_topic", &mqtt.publish_control_topic),
                    ("subscribe_audio_topic", &mqtt.subscribe_audio_topic),
                    ("subscribe_control_topic", &mqtt.subscribe_control_topic),
                ] {
                    if topic.is_empty() {
                        return Err(AttuneError::Config(format!("mqtt.{name} is empty")));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Device identity produced by the activation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub uuid: uuid::Uuid,
    /// MAC-derived serial, e.g. `a1:b2:c3:d4:e5:f6`.
    pub serial: String,
}

impl DeviceIdentity {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| AttuneError::Config(format!("device identity {}: {e}", path.display())))
    }
}

/// Cached session token, managed externally and consumed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCache {
    pub access_token: String,
}

impl TokenCache {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| AttuneError::Config(format!("token cache {}: {e}", path.display())))
    }
}
