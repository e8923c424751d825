//! Realtime transport - WebSocket communication

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use anyhow::{Context, Result};
use url::Url;

use planner_core::RealtimeSettings;
use crate::protocol::{ChannelConfig, ChannelMessage, Frame};

/// Opens channels. The listener only sees this seam, so tests can drive it
/// with in-memory channels.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, config: &ChannelConfig) -> Result<ChannelConnection>;
}

/// An open channel
///
/// Messages arrive over an mpsc queue. Dropping the connection stops its
/// background tasks, which closes the socket.
pub struct ChannelConnection {
    messages: mpsc::UnboundedReceiver<ChannelMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelConnection {
    pub fn new(messages: mpsc::UnboundedReceiver<ChannelMessage>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { messages, tasks }
    }

    /// Next message; `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.messages.recv().await
    }

    pub fn close(&mut self) {
        self.messages.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// tokio-tungstenite transport
pub struct WsTransport {
    settings: RealtimeSettings,
    refs: Arc<AtomicU64>,
}

impl WsTransport {
    pub fn new(settings: RealtimeSettings) -> Self {
        Self {
            settings,
            refs: Arc::new(AtomicU64::new(1)),
        }
    }

    /// `<url>/websocket?apikey=..&vsn=1.0.0`
    pub fn socket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.settings.url)
            .with_context(|| format!("invalid realtime url {}", self.settings.url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("realtime url cannot be a base: {}", self.settings.url))?
            .pop_if_empty()
            .push("websocket");
        {
            let mut query = url.query_pairs_mut();
            if let Some(key) = &self.settings.api_key {
                query.append_pair("apikey", key);
            }
            query.append_pair("vsn", "1.0.0");
        }
        Ok(url)
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

fn encode(frame: &Frame) -> Result<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(frame)?))
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn connect(&self, config: &ChannelConfig) -> Result<ChannelConnection> {
        let url = self.socket_url()?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to open realtime socket for {}", config.topic))?;
        let (mut write, mut read) = ws_stream.split();

        // Channel for outgoing frames
        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<WsMessage>();

        // Channel for incoming messages
        let (msg_tx, msg_rx) = mpsc::unbounded_channel::<ChannelMessage>();

        // Writer
        let writer = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Reader
        let join_ref = self.next_ref();
        let reader_ref = join_ref.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                match msg {
                    WsMessage::Text(text) => {
                        let frame = match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::debug!(error = %e, "Ignoring undecodable frame");
                                continue;
                            }
                        };
                        if let Some(message) = frame.into_message(&reader_ref) {
                            if msg_tx.send(message).is_err() {
                                return;
                            }
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            let _ = msg_tx.send(ChannelMessage::Closed);
        });

        // Heartbeat
        let heartbeat_tx = ws_tx.clone();
        let refs = self.refs.clone();
        let period = self.settings.heartbeat_interval().max(Duration::from_secs(1));
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let reference = format!("hb-{}", refs.fetch_add(1, Ordering::Relaxed));
                let Ok(msg) = encode(&Frame::heartbeat(&reference)) else { break };
                if heartbeat_tx.send(msg).is_err() {
                    break;
                }
            }
        });

        ws_tx
            .send(encode(&Frame::join(config, &join_ref))?)
            .map_err(|e| anyhow::anyhow!("Failed to send join: {}", e))?;
        tracing::debug!(topic = %config.topic, join_ref = %join_ref, "Joining realtime channel");

        Ok(ChannelConnection::new(msg_rx, vec![writer, reader, heartbeat]))
    }
}
