//! Runtime assembly and lifecycle (the resource manager).
//!
//! Owns every component's lifetime. Startup follows the dependency DAG:
//! pipeline scaffolding and playback first, then capture, then the session
//! task that owns the transport. Teardown runs strictly in reverse:
//! cancel the session task (which closes the transport), clear the run
//! flag, then join each worker with a 2 s deadline before force-cancelling.
//!
//! The session task is the single writer of session state. It interprets
//! the machine's [`Action`] lists into transport sends, pipeline arming,
//! playback flushes, and reconnect timers, and it publishes
//! `SessionEvent`s over a broadcast channel for front-ends.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{playback_sink, DevicePrefs, DuplexCounters};
use crate::codec::{VoiceDecoder, VoiceEncoder};
use crate::config::AttuneConfig;
use crate::dsp::reference::{create_reference_ring, ReferenceWindow};
use crate::dsp::AudioProcessor;
use crate::error::{AttuneError, Result};
use crate::pipeline::{
    capture, playback, AudioPacket, DiagnosticsSnapshot, FrameQueue, PipelineControl,
    PipelineDiagnostics, PipelineSignal, PlaybackCommand, WavTap, STAGE_QUEUE_FRAMES,
};
use crate::protocol::{parse_server_message, ClientMessage, ServerMessage};
use crate::session::{Action, SessionEvent, SessionMachine, ToolFamily};
use crate::tools::{ToolDispatcher, ToolRegistry};
use crate::transport::{
    reconnect_delay, MqttTransport, Transport, TransportKind, TransportMessage,
    WebSocketTransport, HELLO_TIMEOUT,
};
use crate::vad::{EnergyVad, SpeechGate, VoiceActivityDetector};
use crate::wake::{NullSpotter, WakeDetector, WakeWordSpotter};

/// Broadcast capacity for session events.
const EVENT_CAP: usize = 256;
/// Per-component stop deadline during teardown.
const STOP_DEADLINE: Duration = Duration::from_secs(2);

/// Commands from the embedding front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    /// Begin a conversation (IDLE → CONNECTING).
    StartConversation,
    /// Stop listening or interrupt active TTS.
    StopConversation,
}

/// Handle to a running core.
pub struct AttuneRuntime {
    events_tx: broadcast::Sender<SessionEvent>,
    command_tx: mpsc::Sender<UserCommand>,
    cancel: CancellationToken,
    control: Arc<PipelineControl>,
    diagnostics: Arc<PipelineDiagnostics>,
    counters: Arc<DuplexCounters>,
    session_task: Option<JoinHandle<()>>,
    forwarder_task: Option<JoinHandle<()>>,
    capture_task: Option<JoinHandle<()>>,
    playback_task: Option<JoinHandle<()>>,
}

impl AttuneRuntime {
    /// Build and start every component.
    ///
    /// `token` is the validated session token produced by the activation
    /// collaborator.
    pub fn start(
        config: AttuneConfig,
        registry: Arc<ToolRegistry>,
        token: String,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let control = Arc::new(PipelineControl::default());
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let counters = Arc::new(DuplexCounters::default());
        control.running.store(true, Ordering::Release);
        control
            .wake_armed
            .store(config.wake.enabled, Ordering::Release);

        let (events_tx, _) = broadcast::channel(EVENT_CAP);
        let (command_tx, command_rx) = mpsc::channel::<UserCommand>(16);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<PipelineSignal>();
        let (audio_tx, audio_rx) = mpsc::channel::<AudioPacket>(4);
        let (playback_tx, playback_rx) = crossbeam_channel::unbounded::<PlaybackCommand>();
        let (tool_reply_tx, tool_reply_rx) = mpsc::channel::<(ToolFamily, serde_json::Value)>(32);

        let outbound = Arc::new(FrameQueue::<AudioPacket>::new(STAGE_QUEUE_FRAMES));
        let sink = playback_sink();
        let (reference_tx, reference_rx) = create_reference_ring();

        // ── Transport (leaf of the control-plane DAG) ────────────────────
        let transport: Box<dyn Transport> = match config.transport.kind {
            TransportKind::Websocket => {
                let ws = config
                    .transport
                    .websocket
                    .clone()
                    .ok_or_else(|| AttuneError::Config("websocket not configured".into()))?;
                Box::new(WebSocketTransport::new(ws))
            }
            TransportKind::Mqtt => {
                let mqtt = config
                    .transport
                    .mqtt
                    .clone()
                    .ok_or_else(|| AttuneError::Config("mqtt not configured".into()))?;
                Box::new(MqttTransport::new(mqtt))
            }
        };

        // ── Codec + dispatcher ───────────────────────────────────────────
        let encoder = VoiceEncoder::new()?;
        let decoder = VoiceDecoder::new()?;
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry,
            config.tools.dispatch_config(),
            cancel.child_token(),
        ));

        // ── Playback pipeline ────────────────────────────────────────────
        let clock = std::time::Instant::now();
        let playback_ctx = playback::PlaybackContext {
            control: Arc::clone(&control),
            diagnostics: Arc::clone(&diagnostics),
            counters: Arc::clone(&counters),
            decoder,
            playback_sink: sink.clone(),
            reference_tx,
            inbound: playback_rx,
            clock,
        };
        let playback_task = tokio::task::spawn_blocking(move || playback::run(playback_ctx));

        // ── Capture pipeline ─────────────────────────────────────────────
        let vad = build_vad(&config);
        let spotter = build_spotter(&config);
        let wav_tap = match &config.debug_capture_wav {
            Some(path) => match WavTap::create(path, crate::audio::frame::PIPELINE_SAMPLE_RATE) {
                Ok(tap) => Some(tap),
                Err(e) => {
                    warn!("capture WAV tap disabled: {e}");
                    None
                }
            },
            None => None,
        };
        let capture_ctx = capture::CaptureContext {
            prefs: DevicePrefs {
                input_name: config.input_device.clone(),
                output_name: config.output_device.clone(),
            },
            control: Arc::clone(&control),
            diagnostics: Arc::clone(&diagnostics),
            counters: Arc::clone(&counters),
            playback_sink: sink,
            processor: AudioProcessor::new(config.processing.clone()),
            vad,
            gate: SpeechGate::new(
                if config.session.mode == crate::session::ListeningMode::Realtime {
                    config.vad.for_realtime()
                } else {
                    config.vad.clone()
                },
            ),
            wake: WakeDetector::new(spotter, &config.wake),
            encoder,
            reference: ReferenceWindow::new(reference_rx),
            outbound: Arc::clone(&outbound),
            signals: signal_tx,
            wav_tap,
            clock,
        };
        let capture_task = tokio::task::spawn_blocking(move || capture::run(capture_ctx));

        // ── Outbound audio forwarder (queue → session task) ──────────────
        let forwarder_control = Arc::clone(&control);
        let forwarder_queue = Arc::clone(&outbound);
        let forwarder_task = tokio::task::spawn_blocking(move || {
            while forwarder_control.running.load(Ordering::Relaxed) {
                if let Some(packet) = forwarder_queue.pop_timeout(Duration::from_millis(100)) {
                    if audio_tx.blocking_send(packet).is_err() {
                        break;
                    }
                }
            }
        });

        // ── Session task ─────────────────────────────────────────────────
        let machine = SessionMachine::new(config.session.clone(), config.transport.kind);
        let session = SessionRuntime {
            machine,
            transport,
            token,
            dispatcher,
            control: Arc::clone(&control),
            events_tx: events_tx.clone(),
            playback_tx,
            tool_reply_tx,
            wake_enabled: config.wake.enabled,
            wake_barge_in: config.session.wake_barge_in,
            connected: false,
            reconnect_at: None,
            hello_deadline: None,
            last_audio_seq: 0,
        };
        let session_cancel = cancel.clone();
        let session_task = tokio::spawn(session_loop(
            session,
            command_rx,
            signal_rx,
            audio_rx,
            tool_reply_rx,
            session_cancel,
        ));

        info!("attune runtime started");

        Ok(Self {
            events_tx,
            command_tx,
            cancel,
            control,
            diagnostics,
            counters,
            session_task: Some(session_task),
            forwarder_task: Some(forwarder_task),
            capture_task: Some(capture_task),
            playback_task: Some(playback_task),
        })
    }

    /// Subscribe to session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub async fn start_conversation(&self) -> Result<()> {
        self.command_tx
            .send(UserCommand::StartConversation)
            .await
            .map_err(|_| AttuneError::NotRunning)
    }

    pub async fn stop_conversation(&self) -> Result<()> {
        self.command_tx
            .send(UserCommand::StopConversation)
            .await
            .map_err(|_| AttuneError::NotRunning)
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn counters(&self) -> &DuplexCounters {
        &self.counters
    }

    /// Ordered teardown: session task (closes the transport) first, then
    /// the pipeline workers in reverse startup order. Each gets 2 s to
    /// signal stopped before being force-cancelled.
    pub async fn shutdown(mut self) {
        info!("runtime shutdown requested");
        self.cancel.cancel();

        join_with_deadline("session", self.session_task.take()).await;

        self.control.running.store(false, Ordering::Release);
        join_with_deadline("forwarder", self.forwarder_task.take()).await;
        join_with_deadline("capture", self.capture_task.take()).await;
        join_with_deadline("playback", self.playback_task.take()).await;

        info!("runtime shutdown complete");
    }
}

async fn join_with_deadline(name: &str, handle: Option<JoinHandle<()>>) {
    let Some(mut handle) = handle else { return };
    match tokio::time::timeout(STOP_DEADLINE, &mut handle).await {
        Ok(Ok(())) => debug!(component = name, "stopped"),
        Ok(Err(e)) => warn!(component = name, "worker panicked: {e}"),
        Err(_) => {
            error!(component = name, "did not stop within deadline, force-cancelling");
            handle.abort();
        }
    }
}

fn build_vad(config: &AttuneConfig) -> Box<dyn VoiceActivityDetector> {
    #[cfg(feature = "onnx")]
    if let Some(path) = &config.vad_model_path {
        match crate::vad::SileroVad::new(path) {
            Ok(vad) => {
                info!(?path, "using neural VAD");
                return Box::new(vad);
            }
            Err(e) => {
                warn!("neural VAD load failed ({e}), falling back to energy VAD");
            }
        }
    }
    #[cfg(not(feature = "onnx"))]
    if config.vad_model_path.is_some() {
        warn!("vad_model_path set but built without the onnx feature");
    }
    Box::new(EnergyVad::default())
}

fn build_spotter(config: &AttuneConfig) -> Box<dyn WakeWordSpotter> {
    if !config.wake.enabled {
        return Box::new(NullSpotter);
    }
    #[cfg(feature = "onnx")]
    if let Some(path) = &config.wake.model_path {
        match crate::wake::OnnxSpotter::new(path, config.wake.keywords.clone()) {
            Ok(spotter) => {
                info!(?path, "using ONNX keyword spotter");
                return Box::new(spotter);
            }
            Err(e) => {
                warn!("keyword spotter load failed ({e}), wake detection disabled");
            }
        }
    }
    #[cfg(not(feature = "onnx"))]
    if config.wake.model_path.is_some() {
        warn!("wake.model_path set but built without the onnx feature");
    }
    Box::new(NullSpotter)
}

// ─────────────────────────────────────────────────────────────────────────
// Session task
// ─────────────────────────────────────────────────────────────────────────

struct SessionRuntime {
    machine: SessionMachine,
    transport: Box<dyn Transport>,
    token: String,
    dispatcher: Arc<ToolDispatcher>,
    control: Arc<PipelineControl>,
    events_tx: broadcast::Sender<SessionEvent>,
    playback_tx: crossbeam_channel::Sender<PlaybackCommand>,
    tool_reply_tx: mpsc::Sender<(ToolFamily, serde_json::Value)>,
    wake_enabled: bool,
    wake_barge_in: bool,
    connected: bool,
    reconnect_at: Option<tokio::time::Instant>,
    hello_deadline: Option<tokio::time::Instant>,
    /// Sequence of the last audio packet forwarded to the transport.
    last_audio_seq: u32,
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86_400)
}

async fn session_loop(
    mut rt: SessionRuntime,
    mut command_rx: mpsc::Receiver<UserCommand>,
    mut signal_rx: mpsc::UnboundedReceiver<PipelineSignal>,
    mut audio_rx: mpsc::Receiver<AudioPacket>,
    mut tool_reply_rx: mpsc::Receiver<(ToolFamily, serde_json::Value)>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let actions = rt.machine.on_close(None);
                rt.execute(actions).await;
                break;
            }

            Some(command) = command_rx.recv() => {
                let actions = match command {
                    UserCommand::StartConversation => rt.machine.on_user_start(),
                    UserCommand::StopConversation => rt.machine.on_user_stop(),
                };
                rt.execute(actions).await;
            }

            Some(signal) = signal_rx.recv() => {
                let actions = match signal {
                    PipelineSignal::SpeechStart => rt.machine.on_speech_start(),
                    PipelineSignal::EndOfUtterance => rt.machine.on_end_of_utterance(),
                    PipelineSignal::Wake { keyword, confidence } => {
                        rt.machine.on_wake(&keyword, confidence)
                    }
                    PipelineSignal::DeviceFatal(reason) => {
                        let mut actions = rt.machine.on_close(Some(reason.clone()));
                        actions.push(Action::Emit(SessionEvent::Error {
                            reason: format!("audio device unavailable: {reason}"),
                        }));
                        actions
                    }
                };
                rt.execute(actions).await;
            }

            Some(packet) = audio_rx.recv() => {
                if rt.connected {
                    rt.last_audio_seq = packet.seq;
                    if let Err(e) = rt.transport.send_binary(packet.seq, packet.payload).await {
                        rt.connected = false;
                        let actions = rt.machine.on_transport_error(&e.to_string());
                        rt.execute(actions).await;
                    }
                }
            }

            Some((family, payload)) = tool_reply_rx.recv() => {
                let session_id = rt.machine.session_id().map(str::to_string);
                let message = match family {
                    ToolFamily::Mcp => ClientMessage::Mcp { session_id, payload },
                    ToolFamily::Iot => ClientMessage::Iot { session_id, payload },
                };
                rt.execute(vec![Action::SendText(message)]).await;
            }

            result = rt.transport.recv(), if rt.connected => {
                match result {
                    Ok(TransportMessage::Text(text)) => {
                        rt.handle_text(&text).await;
                    }
                    Ok(TransportMessage::Binary { seq, payload }) => {
                        let actions = rt.machine.on_first_audio_packet();
                        rt.execute(actions).await;
                        // Audio is only playable mid-turn; packets arriving
                        // during an abort or teardown are dropped.
                        if rt.machine.state() == crate::session::SessionState::Speaking
                            && !rt.control.flush_pending.load(Ordering::Acquire)
                        {
                            let epoch = rt.control.epoch.load(Ordering::Acquire);
                            let _ = rt.playback_tx.send(PlaybackCommand::Audio {
                                epoch,
                                seq,
                                payload,
                            });
                        }
                    }
                    Err(e) => {
                        rt.connected = false;
                        rt.hello_deadline = None;
                        let actions = rt.machine.on_transport_error(&e.to_string());
                        rt.execute(actions).await;
                    }
                }
            }

            _ = tokio::time::sleep_until(rt.reconnect_at.unwrap_or_else(far_future)),
                if rt.reconnect_at.is_some() =>
            {
                rt.reconnect_at = None;
                rt.execute(vec![Action::Connect]).await;
            }

            _ = tokio::time::sleep_until(rt.hello_deadline.unwrap_or_else(far_future)),
                if rt.hello_deadline.is_some() =>
            {
                rt.hello_deadline = None;
                warn!("server hello timed out");
                let _ = rt.transport.close().await;
                rt.connected = false;
                let actions = rt.machine.on_transport_error("hello timeout");
                rt.execute(actions).await;
            }
        }
    }
    debug!("session task exited");
}

impl SessionRuntime {
    async fn handle_text(&mut self, text: &str) {
        match parse_server_message(text) {
            Ok(Some(message)) => {
                if matches!(message, ServerMessage::Hello { .. }) {
                    self.hello_deadline = None;
                }
                let actions = self.machine.on_server_message(message);
                self.execute(actions).await;
            }
            Ok(None) => {
                debug!("dropping unknown message type");
            }
            Err(e) => {
                // Protocol errors are log-and-drop, never session-fatal.
                warn!("protocol error: {e}");
            }
        }
    }

    /// Interpret the machine's actions, in order. Transport failures during
    /// execution feed back into the machine and the resulting actions are
    /// appended.
    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Connect => {
                    match self.transport.connect(&self.token).await {
                        Ok(()) => {
                            self.connected = true;
                            self.hello_deadline =
                                Some(tokio::time::Instant::now() + HELLO_TIMEOUT);
                            queue.extend(self.machine.on_transport_connected());
                        }
                        Err(e) => {
                            warn!("connect failed: {e}");
                            queue.extend(self.machine.on_transport_error(&e.to_string()));
                        }
                    }
                }
                Action::Reconnect { attempt } => {
                    let delay = reconnect_delay(attempt);
                    debug!(attempt, ?delay, "reconnect scheduled");
                    self.reconnect_at = Some(tokio::time::Instant::now() + delay);
                }
                Action::SendText(message) => {
                    let json = match message.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!("failed to serialize outbound message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = self.transport.send_text(json).await {
                        self.connected = false;
                        queue.extend(self.machine.on_transport_error(&e.to_string()));
                    }
                }
                Action::SendAudioEnd => {
                    let seq = self.last_audio_seq.wrapping_add(1);
                    self.last_audio_seq = seq;
                    if let Err(e) = self.transport.send_binary(seq, Vec::new()).await {
                        self.connected = false;
                        queue.extend(self.machine.on_transport_error(&e.to_string()));
                    }
                }
                Action::CloseTransport => {
                    let _ = self.transport.close().await;
                    self.connected = false;
                    self.hello_deadline = None;
                    self.reconnect_at = None;
                }
                Action::StartCapture => {
                    self.control.capture_armed.store(true, Ordering::Release);
                }
                Action::StopCapture => {
                    self.control.capture_armed.store(false, Ordering::Release);
                }
                Action::FlushPlayback => {
                    self.control.flush_pending.store(true, Ordering::Release);
                    let _ = self.playback_tx.send(PlaybackCommand::Flush);
                }
                Action::ResetDecoder => {
                    self.control.epoch.fetch_add(1, Ordering::AcqRel);
                    self.control.flush_pending.store(true, Ordering::Release);
                    let _ = self.playback_tx.send(PlaybackCommand::Flush);
                }
                Action::ResumeWake => {
                    self.control.wake_resume.store(true, Ordering::Release);
                }
                Action::DispatchTool { family, payload } => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let reply_tx = self.tool_reply_tx.clone();
                    tokio::spawn(async move {
                        if let Some(response) = dispatcher.dispatch(payload).await {
                            match serde_json::to_value(&response) {
                                Ok(value) => {
                                    let _ = reply_tx.send((family, value)).await;
                                }
                                Err(e) => error!("failed to serialize tool response: {e}"),
                            }
                        }
                    });
                }
                Action::Emit(event) => {
                    if let SessionEvent::StateChanged { state, .. } = &event {
                        use crate::session::SessionState;
                        let wake_armed = match state {
                            SessionState::Idle => self.wake_enabled,
                            SessionState::Speaking => self.wake_enabled && self.wake_barge_in,
                            _ => false,
                        };
                        self.control.wake_armed.store(wake_armed, Ordering::Release);
                    }
                    let _ = self.events_tx.send(event);
                }
            }
        }
    }
}
