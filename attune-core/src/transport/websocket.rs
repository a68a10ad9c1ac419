//! WebSocket transport variant.
//!
//! Single TLS connection. Binary frame = one Opus packet, text frame = one
//! JSON message. Liveness: a ping every 20 s; three missed pongs mark the
//! peer dead and surface as a transport error on `recv`.
//!
//! The socket is split at connect time: a writer task drains the outbound
//! queue into the sink, a reader task forwards inbound frames and runs the
//! ping schedule. Both exit on error, closing the inbound channel so the
//! caller sees the failure exactly once.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{Transport, TransportMessage, CONNECT_TIMEOUT};
use crate::error::{AttuneError, Result};
use crate::protocol::PROTOCOL_VERSION;

/// Keepalive ping interval.
const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(20);
/// Missed pongs before the peer is declared dead.
const MAX_MISSED_PONGS: u32 = 3;
/// Outbound queue depth (messages).
const WRITE_QUEUE: usize = 64;
/// Inbound queue depth (messages).
const READ_QUEUE: usize = 64;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WebSocketConfig {
    /// wss:// endpoint of the AI service.
    pub url: String,
    /// Device identifier sent in the connection headers.
    #[serde(default)]
    pub device_id: Option<String>,
}

pub struct WebSocketTransport {
    config: WebSocketConfig,
    writer_tx: Option<mpsc::Sender<Message>>,
    inbound_rx: Option<mpsc::Receiver<Result<TransportMessage>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            writer_tx: None,
            inbound_rx: None,
            tasks: Vec::new(),
        }
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.writer_tx = None;
        self.inbound_rx = None;
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self, token: &str) -> Result<()> {
        self.stop_tasks();

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AttuneError::Transport(format!("bad url: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AttuneError::Transport(e.to_string()))?,
        );
        headers.insert(
            "Protocol-Version",
            HeaderValue::from_str(&PROTOCOL_VERSION.to_string())
                .map_err(|e| AttuneError::Transport(e.to_string()))?,
        );
        if let Some(device_id) = &self.config.device_id {
            headers.insert(
                "Device-Id",
                HeaderValue::from_str(device_id)
                    .map_err(|e| AttuneError::Transport(e.to_string()))?,
            );
        }

        let (socket, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| AttuneError::Transport("connect timed out".into()))?
        .map_err(|e| AttuneError::Transport(e.to_string()))?;

        info!(url = self.config.url.as_str(), "websocket connected");

        let (mut sink, mut stream) = socket.split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(WRITE_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<TransportMessage>>(READ_QUEUE);

        // Writer: drains the outbound queue; an I/O failure ends the task
        // and the reader will notice the broken connection shortly after.
        let writer = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("websocket send failed: {e}");
                    break;
                }
            }
        });

        // Reader: forwards frames, runs the ping schedule, counts pongs.
        let ping_tx = writer_tx.clone();
        let reader = tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(PING_INTERVAL);
            ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping_interval.tick().await; // immediate first tick
            let mut missed_pongs = 0u32;
            // WebSocket delivery is order-preserving; number inbound audio
            // packets locally for the decoder's gap tracking.
            let mut recv_seq = 0u32;

            loop {
                tokio::select! {
                    _ = ping_interval.tick() => {
                        if missed_pongs >= MAX_MISSED_PONGS {
                            let _ = inbound_tx
                                .send(Err(AttuneError::Transport("dead peer: missed pongs".into())))
                                .await;
                            break;
                        }
                        missed_pongs += 1;
                        if ping_tx.send(Message::Ping(Vec::new())).await.is_err() {
                            let _ = inbound_tx
                                .send(Err(AttuneError::Transport("writer gone".into())))
                                .await;
                            break;
                        }
                    }
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                if inbound_tx.send(Ok(TransportMessage::Text(text))).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Binary(payload))) => {
                                let message = TransportMessage::Binary { seq: recv_seq, payload };
                                recv_seq = recv_seq.wrapping_add(1);
                                if inbound_tx.send(Ok(message)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Pong(_))) => {
                                missed_pongs = 0;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                // tungstenite queues the protocol-level pong
                                // itself; nothing to do beyond logging.
                                debug!(len = data.len(), "server ping");
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = inbound_tx
                                    .send(Err(AttuneError::Transport("closed by peer".into())))
                                    .await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = inbound_tx
                                    .send(Err(AttuneError::Transport(e.to_string())))
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        self.writer_tx = Some(writer_tx);
        self.inbound_rx = Some(inbound_rx);
        self.tasks = vec![writer, reader];
        Ok(())
    }

    async fn send_text(&mut self, json: String) -> Result<()> {
        let tx = self
            .writer_tx
            .as_ref()
            .ok_or_else(|| AttuneError::Transport("not connected".into()))?;
        tx.send(Message::Text(json))
            .await
            .map_err(|_| AttuneError::Transport("connection lost".into()))
    }

    async fn send_binary(&mut self, _seq: u32, payload: Vec<u8>) -> Result<()> {
        let tx = self
            .writer_tx
            .as_ref()
            .ok_or_else(|| AttuneError::Transport("not connected".into()))?;
        tx.send(Message::Binary(payload))
            .await
            .map_err(|_| AttuneError::Transport("connection lost".into()))
    }

    async fn recv(&mut self) -> Result<TransportMessage> {
        let rx = self
            .inbound_rx
            .as_mut()
            .ok_or_else(|| AttuneError::Transport("not connected".into()))?;
        match rx.recv().await {
            Some(result) => result,
            None => Err(AttuneError::Transport("connection lost".into())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.writer_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        self.stop_tasks();
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
