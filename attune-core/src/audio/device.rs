//! Audio device enumeration and capture-side classification.
//!
//! Enumeration runs once at startup (hot-swap is unsupported). The capture
//! side must never open a monitor/loopback source: such a device re-captures
//! system output, so the echo canceller would receive its own far end as
//! near-end input and the wake detector would trigger on TTS playback.
//! Names are the only portable signal cpal gives us, so classification is a
//! marker scan over the device name.

use serde::{Deserialize, Serialize};

/// What a capture device name says about the signal behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureClass {
    /// A real microphone-style source, safe for the voice pipeline.
    Microphone,
    /// A monitor/loopback source that re-captures system output.
    Monitor,
    /// Nothing recognizable in the name.
    Unknown,
}

/// Markers for monitor/loopback sources across the platforms we run on:
/// PulseAudio/PipeWire monitors, Windows mixed-output endpoints, and the
/// usual macOS virtual-device drivers.
const MONITOR_MARKERS: &[&str] = &[
    "monitor",
    "loopback",
    "stereo mix",
    "what u hear",
    "wave out",
    "blackhole",
    "soundflower",
    "virtual cable",
    "vb-audio",
    "desktop audio",
    "system audio",
];

/// Markers for microphone-style sources.
const MICROPHONE_MARKERS: &[&str] = &[
    "microphone",
    "mic",
    "headset",
    "array",
    "webcam",
    "line in",
    "lavalier",
    "usb audio",
];

/// Classify a capture device by name.
///
/// Monitor markers win over microphone markers: a name like
/// "Monitor of USB Audio" is still a monitor.
pub fn classify_capture_name(name: &str) -> CaptureClass {
    let lowered = name.trim().to_ascii_lowercase();
    if MONITOR_MARKERS.iter().any(|m| lowered.contains(m)) {
        return CaptureClass::Monitor;
    }
    if MICROPHONE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return CaptureClass::Microphone;
    }
    CaptureClass::Unknown
}

/// Selection rank for the capture side; higher is safer to open.
pub fn capture_rank(name: &str) -> u8 {
    match classify_capture_name(name) {
        CaptureClass::Microphone => 2,
        CaptureClass::Unknown => 1,
        CaptureClass::Monitor => 0,
    }
}

/// One entry in a device listing, as surfaced to the host so users can fill
/// the `input_device`/`output_device` config fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Name reported by the OS; this exact string goes into the config.
    pub name: String,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    /// Capture-side classification; playback listings report `None`.
    pub class: Option<CaptureClass>,
}

/// List the capture devices on the system, classified.
///
/// Returns an empty `Vec` if cpal is unavailable or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    class: Some(classify_capture_name(&name)),
                    name,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            vec![]
        }
    }
}

/// List the playback devices on the system.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    match host.output_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    class: None,
                    name,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            vec![]
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::{capture_rank, classify_capture_name, CaptureClass};

    #[test]
    fn monitor_sources_are_flagged_before_they_reach_the_canceller() {
        for name in [
            "Monitor of Built-in Audio Analog Stereo",
            "BlackHole 2ch",
            "VB-Audio Virtual Cable",
            "Loopback Audio",
        ] {
            assert_eq!(
                classify_capture_name(name),
                CaptureClass::Monitor,
                "{name} should classify as a monitor source"
            );
        }
    }

    #[test]
    fn monitor_markers_win_over_microphone_markers() {
        assert_eq!(
            classify_capture_name("Monitor of USB Audio Headset"),
            CaptureClass::Monitor
        );
    }

    #[test]
    fn capture_rank_orders_mic_over_unknown_over_monitor() {
        let mic = capture_rank("Headset Microphone (Realtek HD Audio)");
        let unknown = capture_rank("CODEC Analog Stereo");
        let monitor = capture_rank("Monitor of Speakers");
        assert!(mic > unknown, "microphone should outrank unlabeled device");
        assert!(unknown > monitor, "unlabeled device should outrank monitor");
    }

    #[test]
    fn unlabeled_names_stay_unknown() {
        assert_eq!(
            classify_capture_name("CODEC Analog Stereo"),
            CaptureClass::Unknown
        );
    }
}
