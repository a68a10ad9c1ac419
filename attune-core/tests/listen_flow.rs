//! End-to-end conversation flow over synthetic audio: wake word, speech,
//! end-of-utterance, and barge-in interruption, driving the real VAD gate,
//! state machine, and Opus encoder without audio hardware.

use attune_core::codec::VoiceEncoder;
use attune_core::protocol::{ClientMessage, ListenState, ServerMessage};
use attune_core::session::{
    Action, ListeningMode, SessionMachine, SessionState,
};
use attune_core::vad::{EnergyVad, GateTransition, SpeechGate, VadConfig, VoiceActivityDetector};
use attune_core::wake::{WakeConfig, WakeDetector, WakeWordSpotter};

const FRAME: usize = 960; // 60 ms at 16 kHz
const FRAME_MS: u64 = 60;

/// One 60 ms frame of a 440 Hz tone at the given amplitude.
fn tone_frame(frame_idx: usize, amplitude: f32) -> Vec<i16> {
    (0..FRAME)
        .map(|i| {
            let n = frame_idx * FRAME + i;
            let t = n as f32 / 16_000.0;
            ((t * 440.0 * std::f32::consts::TAU).sin() * amplitude * 32767.0) as i16
        })
        .collect()
}

fn silence_frame() -> Vec<i16> {
    vec![0i16; FRAME]
}

/// Spotter scripted to fire during a fixed frame range.
struct ScriptedSpotter {
    fire_from: usize,
    fire_to: usize,
    frame: usize,
}

impl WakeWordSpotter for ScriptedSpotter {
    fn feed(&mut self, _frame: &[i16]) -> Option<(String, f32)> {
        let idx = self.frame;
        self.frame += 1;
        if idx >= self.fire_from && idx < self.fire_to {
            Some(("hey attune".into(), 0.85))
        } else {
            None
        }
    }

    fn reset(&mut self) {}
}

fn server_hello(session_id: &str) -> ServerMessage {
    ServerMessage::Hello {
        version: Some(1),
        session_id: Some(session_id.to_string()),
        audio_params: None,
    }
}

#[derive(Default)]
struct Harness {
    sent_listens: Vec<ListenState>,
    audio_end_markers: usize,
    packets: usize,
    capture_armed: bool,
}

impl Harness {
    fn apply(&mut self, actions: &[Action]) {
        for action in actions {
            match action {
                Action::SendText(ClientMessage::Listen { state, .. }) => {
                    self.sent_listens.push(*state);
                }
                Action::SendAudioEnd => self.audio_end_markers += 1,
                Action::StartCapture => self.capture_armed = true,
                Action::StopCapture => self.capture_armed = false,
                _ => {}
            }
        }
    }
}

#[test]
fn wake_listen_end_of_utterance_flow() {
    // Timeline: 2 s silence, 0.5 s wake word, 1.5 s speech, 1.0 s silence.
    // Expected: IDLE → CONNECTING → LISTENING, end_of_utterance after the
    // 800 ms silence timeout, one listen{start}, ≥ 25 Opus frames, one
    // listen{stop}.
    let mut machine = SessionMachine::new(Default::default(), Default::default());
    let mut vad: Box<dyn VoiceActivityDetector> = Box::new(EnergyVad::default());
    let mut gate = SpeechGate::new(VadConfig::default());
    let mut encoder = VoiceEncoder::new().unwrap();

    let wake_from = 2_000 / FRAME_MS as usize; // frame 33
    let wake_to = wake_from + 500 / FRAME_MS as usize + 1;
    let mut wake = WakeDetector::new(
        Box::new(ScriptedSpotter {
            fire_from: wake_from,
            fire_to: wake_to,
            frame: 0,
        }),
        &WakeConfig::default(),
    );

    let mut harness = Harness::default();
    let mut states = vec![machine.state()];

    // Frame schedule: silence, wake tone, speech tone, trailing silence.
    let speech_from = wake_to;
    let speech_to = speech_from + 1_500 / FRAME_MS as usize; // 25 frames
    let total = speech_to + 1_000 / FRAME_MS as usize + 2;

    for idx in 0..total {
        let frame = if (wake_from..speech_to).contains(&idx) {
            tone_frame(idx, 0.35)
        } else {
            silence_frame()
        };

        // Wake detection runs while IDLE.
        if machine.state() == SessionState::Idle {
            if let Some(event) = wake.process(&frame, idx as u64 * FRAME_MS * 1_000_000) {
                let actions = machine.on_wake(&event.keyword, event.confidence);
                harness.apply(&actions);
                states.push(machine.state());

                // Transport establishes and the server acks immediately.
                harness.apply(&machine.on_transport_connected());
                let actions = machine.on_server_message(server_hello("s1"));
                harness.apply(&actions);
                states.push(machine.state());
            }
        }

        // VAD + gate over the processed frame.
        let probability = vad.probability(&frame);
        match gate.update(probability) {
            GateTransition::SpeechStart => {
                harness.apply(&machine.on_speech_start());
            }
            GateTransition::SpeechEnd => {
                harness.apply(&machine.on_end_of_utterance());
            }
            GateTransition::None => {}
        }

        // Encode while armed, as the capture pipeline would.
        if harness.capture_armed {
            let packet = encoder.encode(&frame).unwrap();
            assert!(!packet.is_empty());
            harness.packets += 1;
        }
    }

    assert_eq!(
        states,
        vec![
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Listening,
        ]
    );
    assert_eq!(
        harness
            .sent_listens
            .iter()
            .filter(|s| **s == ListenState::Start)
            .count(),
        1,
        "expected exactly one listen start, got {:?}",
        harness.sent_listens
    );
    assert_eq!(
        harness
            .sent_listens
            .iter()
            .filter(|s| **s == ListenState::Stop)
            .count(),
        1,
        "expected exactly one listen stop, got {:?}",
        harness.sent_listens
    );
    assert_eq!(harness.audio_end_markers, 1);
    assert!(
        harness.packets >= 25,
        "expected at least 25 encoded frames, got {}",
        harness.packets
    );
    // The wake keyword was reported via listen{detect}.
    assert!(harness.sent_listens.contains(&ListenState::Detect));
    assert_eq!(machine.state(), SessionState::Listening);
}

#[test]
fn user_speech_interrupts_tts_in_realtime_mode() {
    // SPEAKING with streaming TTS; user speech at ~500 ms triggers
    // abort{user_interrupt} and playback flush in REALTIME mode.
    let mut machine = SessionMachine::new(
        attune_core::session::SessionConfig {
            mode: ListeningMode::Realtime,
            wake_barge_in: false,
        },
        Default::default(),
    );
    let mut vad: Box<dyn VoiceActivityDetector> = Box::new(EnergyVad::default());
    let mut gate = SpeechGate::new(VadConfig::default());

    machine.on_user_start();
    machine.on_transport_connected();
    machine.on_server_message(server_hello("s1"));
    machine.on_first_audio_packet();
    assert_eq!(machine.state(), SessionState::Speaking);

    let mut flushed = false;
    let mut abort_sent = false;

    // ~500 ms of assistant audio (user silent), then 400 ms of user speech.
    for idx in 0..20 {
        let frame = if idx >= 8 {
            tone_frame(idx, 0.4)
        } else {
            silence_frame()
        };
        let probability = vad.probability(&frame);
        if gate.update(probability) == GateTransition::SpeechStart {
            let actions = machine.on_speech_start();
            for action in &actions {
                match action {
                    Action::FlushPlayback => flushed = true,
                    Action::SendText(ClientMessage::Abort { .. }) => abort_sent = true,
                    _ => {}
                }
            }
        }
    }

    assert!(abort_sent, "expected abort{{user_interrupt}}");
    assert!(flushed, "expected playback flush");
    assert_eq!(machine.state(), SessionState::Aborting);

    // Server ack completes the interruption.
    machine.on_server_message(ServerMessage::Abort { reason: None });
    assert_eq!(machine.state(), SessionState::Listening);
}
