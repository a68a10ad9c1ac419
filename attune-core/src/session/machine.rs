//! The dialog state machine.
//!
//! Pure transition logic: inputs arrive as `on_*` calls, outputs are
//! returned as [`Action`] lists the runtime interprets (sends, pipeline
//! arming, reconnects). Keeping I/O out of the machine keeps every dialog
//! scenario testable synchronously.
//!
//! ```text
//! IDLE ──user/wake──► CONNECTING ──hello ack──► LISTENING ─first audio─► SPEAKING
//!  ▲                      │ fatal                  │  ▲                    │
//!  └──────────────────────┴──── any → close ───────┘  └──── turn end ──────┤
//!                                    LISTENING ◄── abort ack ── ABORTING ◄─┘ interrupt
//! ```

use tracing::{debug, info, warn};

use super::{ListeningMode, SessionConfig, SessionEvent, SessionState};
use crate::protocol::{AbortReason, ClientMessage, ListenState, ServerMessage, TtsState};
use crate::transport::{TransportKind, MAX_RECONNECT_ATTEMPTS};

/// Which message family carried a tool call (both are accepted during the
/// server-side migration; replies go back on the same family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFamily {
    Mcp,
    Iot,
}

/// Side effects for the runtime to execute, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Establish the transport now.
    Connect,
    /// Re-establish after the backoff delay for this attempt (0-based).
    Reconnect { attempt: usize },
    /// Send a control message.
    SendText(ClientMessage),
    /// Send the zero-length end-of-utterance audio frame.
    SendAudioEnd,
    /// Close the transport.
    CloseTransport,
    /// Arm capture encode+send.
    StartCapture,
    /// Disarm capture encode+send.
    StopCapture,
    /// Drop all queued playback audio (≤ 100 ms residual).
    FlushPlayback,
    /// New session epoch: reject packets tagged with a stale session.
    ResetDecoder,
    /// Re-arm the wake detector (state returned to IDLE).
    ResumeWake,
    /// Route a tool-call payload to the dispatcher.
    DispatchTool {
        family: ToolFamily,
        payload: serde_json::Value,
    },
    /// Publish a notification.
    Emit(SessionEvent),
}

pub struct SessionMachine {
    config: SessionConfig,
    transport_kind: TransportKind,
    state: SessionState,
    session_id: Option<String>,
    reconnect_attempts: usize,
    /// Keyword that triggered the connection, reported once after hello.
    pending_wake: Option<String>,
}

impl SessionMachine {
    pub fn new(config: SessionConfig, transport_kind: TransportKind) -> Self {
        Self {
            config,
            transport_kind,
            state: SessionState::Idle,
            session_id: None,
            reconnect_attempts: 0,
            pending_wake: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn mode(&self) -> ListeningMode {
        self.config.mode
    }

    fn set_state(&mut self, state: SessionState, detail: Option<String>, actions: &mut Vec<Action>) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "session state transition");
        }
        self.state = state;
        actions.push(Action::Emit(SessionEvent::StateChanged {
            state,
            session_id: self.session_id.clone(),
            detail,
        }));
    }

    fn listen_message(&self, state: ListenState, text: Option<String>) -> ClientMessage {
        ClientMessage::Listen {
            session_id: self.session_id.clone(),
            mode: self.config.mode.to_wire(),
            state,
            text,
        }
    }

    // ── Triggers ────────────────────────────────────────────────────────

    /// User asked to start a conversation.
    pub fn on_user_start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != SessionState::Idle {
            return actions;
        }
        self.reconnect_attempts = 0;
        self.set_state(SessionState::Connecting, None, &mut actions);
        actions.push(Action::Connect);
        actions
    }

    /// A wake word fired on the raw capture stream.
    pub fn on_wake(&mut self, keyword: &str, confidence: f32) -> Vec<Action> {
        let mut actions = vec![Action::Emit(SessionEvent::WakeWord {
            keyword: keyword.to_string(),
            confidence,
        })];
        match self.state {
            SessionState::Idle => {
                self.pending_wake = Some(keyword.to_string());
                self.reconnect_attempts = 0;
                self.set_state(SessionState::Connecting, None, &mut actions);
                actions.push(Action::Connect);
            }
            SessionState::Speaking if self.config.wake_barge_in => {
                info!(keyword, "wake word barge-in");
                actions.push(Action::SendText(ClientMessage::Abort {
                    session_id: self.session_id.clone(),
                    reason: AbortReason::WakeWordDetected,
                }));
                actions.push(Action::FlushPlayback);
                self.set_state(SessionState::Aborting, None, &mut actions);
            }
            _ => {}
        }
        actions
    }

    /// Transport connected; greet the server.
    pub fn on_transport_connected(&mut self) -> Vec<Action> {
        vec![Action::SendText(ClientMessage::hello(
            self.transport_kind.wire_name(),
        ))]
    }

    /// Transport dropped or failed to connect.
    pub fn on_transport_error(&mut self, error: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == SessionState::Idle {
            return actions;
        }
        warn!(error, attempts = self.reconnect_attempts, "transport error");
        actions.push(Action::StopCapture);
        actions.push(Action::FlushPlayback);

        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            self.session_id = None;
            self.set_state(
                SessionState::Idle,
                Some("transport failed".into()),
                &mut actions,
            );
            actions.push(Action::CloseTransport);
            actions.push(Action::ResumeWake);
            actions.push(Action::Emit(SessionEvent::Error {
                reason: "transport failed after repeated reconnect attempts".into(),
            }));
        } else {
            let attempt = self.reconnect_attempts;
            self.reconnect_attempts += 1;
            self.set_state(SessionState::Connecting, None, &mut actions);
            actions.push(Action::Reconnect { attempt });
        }
        actions
    }

    /// First binary audio packet of a server turn.
    pub fn on_first_audio_packet(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != SessionState::Listening {
            return actions;
        }
        self.set_state(SessionState::Speaking, None, &mut actions);
        if self.config.mode != ListeningMode::Realtime {
            // Half-duplex: the mic closes while the assistant speaks.
            actions.push(Action::StopCapture);
        }
        actions
    }

    /// VAD reported the user started speaking.
    pub fn on_speech_start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == SessionState::Speaking && self.config.mode == ListeningMode::Realtime {
            info!("user barge-in during TTS");
            actions.push(Action::SendText(ClientMessage::Abort {
                session_id: self.session_id.clone(),
                reason: AbortReason::UserInterrupt,
            }));
            actions.push(Action::FlushPlayback);
            self.set_state(SessionState::Aborting, None, &mut actions);
        }
        actions
    }

    /// VAD silence timeout elapsed: the utterance is over.
    pub fn on_end_of_utterance(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == SessionState::Listening && self.config.mode == ListeningMode::AutoStop {
            actions.push(Action::SendAudioEnd);
            actions.push(Action::SendText(self.listen_message(ListenState::Stop, None)));
        }
        actions
    }

    /// Explicit user stop: interrupt TTS or end the conversation.
    pub fn on_user_stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            SessionState::Speaking => {
                actions.push(Action::SendText(ClientMessage::Abort {
                    session_id: self.session_id.clone(),
                    reason: AbortReason::UserInterrupt,
                }));
                actions.push(Action::FlushPlayback);
                self.set_state(SessionState::Aborting, None, &mut actions);
            }
            SessionState::Listening => {
                actions.push(Action::SendText(self.listen_message(ListenState::Stop, None)));
            }
            _ => {}
        }
        actions
    }

    /// Shut the session down (Any → IDLE).
    pub fn on_close(&mut self, detail: Option<String>) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == SessionState::Idle {
            return actions;
        }
        actions.push(Action::StopCapture);
        actions.push(Action::FlushPlayback);
        actions.push(Action::CloseTransport);
        self.session_id = None;
        self.pending_wake = None;
        self.set_state(SessionState::Idle, detail, &mut actions);
        actions.push(Action::ResumeWake);
        actions
    }

    /// One parsed server control message.
    pub fn on_server_message(&mut self, message: ServerMessage) -> Vec<Action> {
        match message {
            ServerMessage::Hello { session_id, .. } => self.on_server_hello(session_id),
            ServerMessage::Tts { state, text } => self.on_tts(state, text),
            ServerMessage::Stt { text } => vec![Action::Emit(SessionEvent::Transcript { text })],
            ServerMessage::Abort { .. } => self.on_abort_ack(),
            ServerMessage::Mcp { payload } => vec![Action::DispatchTool {
                family: ToolFamily::Mcp,
                payload,
            }],
            ServerMessage::Iot { payload } => vec![Action::DispatchTool {
                family: ToolFamily::Iot,
                payload,
            }],
        }
    }

    // ── Server-driven transitions ───────────────────────────────────────

    fn on_server_hello(&mut self, session_id: Option<String>) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != SessionState::Connecting {
            debug!(state = ?self.state, "ignoring hello outside CONNECTING");
            return actions;
        }
        self.session_id = session_id;
        self.reconnect_attempts = 0;
        info!(session_id = ?self.session_id, "session established");

        // Fresh session: stale packets from the previous one must not reach
        // the decoder.
        actions.push(Action::ResetDecoder);
        self.set_state(SessionState::Listening, None, &mut actions);

        if let Some(keyword) = self.pending_wake.take() {
            actions.push(Action::SendText(
                self.listen_message(ListenState::Detect, Some(keyword)),
            ));
        }
        actions.push(Action::SendText(self.listen_message(ListenState::Start, None)));
        actions.push(Action::StartCapture);
        actions
    }

    fn on_tts(&mut self, state: TtsState, text: Option<String>) -> Vec<Action> {
        let mut actions = Vec::new();
        match state {
            TtsState::Start => {
                // SPEAKING is entered on the first audio packet; the control
                // message alone does not transition.
            }
            TtsState::SentenceStart => {
                if let Some(text) = text {
                    actions.push(Action::Emit(SessionEvent::TtsSentence { text }));
                }
            }
            TtsState::Stop => match self.state {
                // Turn end while speaking, or the ack for an abort we sent.
                SessionState::Speaking | SessionState::Aborting => {
                    self.set_state(SessionState::Listening, None, &mut actions);
                    if self.config.mode == ListeningMode::AutoStop {
                        actions.push(Action::SendText(
                            self.listen_message(ListenState::Start, None),
                        ));
                    }
                    actions.push(Action::StartCapture);
                }
                _ => {}
            },
        }
        actions
    }

    fn on_abort_ack(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            SessionState::Aborting => {
                self.set_state(SessionState::Listening, None, &mut actions);
                actions.push(Action::StartCapture);
            }
            SessionState::Speaking => {
                // Server-initiated abort.
                actions.push(Action::FlushPlayback);
                self.set_state(SessionState::Listening, None, &mut actions);
                actions.push(Action::StartCapture);
            }
            _ => {}
        }
        actions
    }
}
