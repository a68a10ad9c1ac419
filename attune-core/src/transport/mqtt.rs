//! MQTT transport variant.
//!
//! Four-topic layout: one publish topic each for capture audio and control
//! JSON, one subscribe topic each for playback audio and control JSON.
//! Audio uses QoS 0 (stale frames are worthless), control uses QoS 1.
//! Audio payloads carry the 4-byte big-endian sequence prefix because MQTT
//! does not guarantee ordering across QoS levels.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{frame_sequenced, parse_sequenced, Transport, TransportMessage, CONNECT_TIMEOUT};
use crate::error::{AttuneError, Result};

/// Broker keepalive.
const KEEP_ALIVE: std::time::Duration = std::time::Duration::from_secs(20);
/// Inbound queue depth (messages).
const READ_QUEUE: usize = 64;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Encrypt with TLS (on by default; plain TCP is for local brokers only).
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// Topic this client publishes capture audio to.
    pub publish_audio_topic: String,
    /// Topic this client publishes control JSON to.
    pub publish_control_topic: String,
    /// Topic carrying playback audio from the service.
    pub subscribe_audio_topic: String,
    /// Topic carrying control JSON from the service.
    pub subscribe_control_topic: String,
}

fn default_tls() -> bool {
    true
}

pub struct MqttTransport {
    config: MqttConfig,
    client: Option<AsyncClient>,
    inbound_rx: Option<mpsc::Receiver<Result<TransportMessage>>>,
    task: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            client: None,
            inbound_rx: None,
            task: None,
        }
    }

    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.client = None;
        self.inbound_rx = None;
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, token: &str) -> Result<()> {
        self.stop_task();

        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(KEEP_ALIVE);
        let username = self
            .config
            .username
            .clone()
            .unwrap_or_else(|| self.config.client_id.clone());
        options.set_credentials(username, token.to_string());
        if self.config.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<TransportMessage>>(READ_QUEUE);
        let (connack_tx, connack_rx) = tokio::sync::oneshot::channel::<()>();

        let audio_topic = self.config.subscribe_audio_topic.clone();
        let control_topic = self.config.subscribe_control_topic.clone();

        let task = tokio::spawn(async move {
            let mut connack_tx = Some(connack_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Some(tx) = connack_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = if publish.topic == control_topic {
                            match String::from_utf8(publish.payload.to_vec()) {
                                Ok(text) => Some(TransportMessage::Text(text)),
                                Err(_) => {
                                    warn!("non-UTF-8 control payload dropped");
                                    None
                                }
                            }
                        } else if publish.topic == audio_topic {
                            match parse_sequenced(&publish.payload) {
                                Some((seq, payload)) => Some(TransportMessage::Binary {
                                    seq,
                                    payload: payload.to_vec(),
                                }),
                                None => {
                                    warn!("malformed audio frame dropped");
                                    None
                                }
                            }
                        } else {
                            None
                        };
                        if let Some(message) = message {
                            if inbound_tx.send(Ok(message)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = inbound_tx
                            .send(Err(AttuneError::Transport(e.to_string())))
                            .await;
                        break;
                    }
                }
            }
        });

        // Wait for the broker to accept us before subscribing.
        tokio::time::timeout(CONNECT_TIMEOUT, connack_rx)
            .await
            .map_err(|_| AttuneError::Transport("connect timed out".into()))?
            .map_err(|_| AttuneError::Transport("connection closed during connect".into()))?;

        client
            .subscribe(self.config.subscribe_control_topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| AttuneError::Transport(e.to_string()))?;
        client
            .subscribe(self.config.subscribe_audio_topic.as_str(), QoS::AtMostOnce)
            .await
            .map_err(|e| AttuneError::Transport(e.to_string()))?;

        info!(
            host = self.config.host.as_str(),
            port = self.config.port,
            "mqtt connected"
        );

        self.client = Some(client);
        self.inbound_rx = Some(inbound_rx);
        self.task = Some(task);
        Ok(())
    }

    async fn send_text(&mut self, json: String) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AttuneError::Transport("not connected".into()))?;
        client
            .publish(
                self.config.publish_control_topic.as_str(),
                QoS::AtLeastOnce,
                false,
                json,
            )
            .await
            .map_err(|e| AttuneError::Transport(e.to_string()))
    }

    async fn send_binary(&mut self, seq: u32, payload: Vec<u8>) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AttuneError::Transport("not connected".into()))?;
        client
            .publish(
                self.config.publish_audio_topic.as_str(),
                QoS::AtMostOnce,
                false,
                frame_sequenced(seq, &payload),
            )
            .await
            .map_err(|e| AttuneError::Transport(e.to_string()))
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
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.stop_task();
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop_task();
    }
}
