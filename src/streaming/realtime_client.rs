//! Live API WebSocket client
//!
//! Manages one WebSocket connection for one connect attempt.
//!
//! # Connection Flow
//!
//! 1. `RealtimeDialer::dial()` - open the socket, send `setup`, wait for
//!    `setupComplete`
//! 2. `audio_sink()` - queue microphone frames (non-blocking, drop on full)
//! 3. inbound messages are forwarded as [`TransportEvent`]s in arrival order
//! 4. `close()` - send a close frame and stop both background tasks
//!
//! A single attempt never retries; reconnection is decided by the session.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
};

use super::protocol::{ClientMessage, ServerMessage, LIVE_API_URL};
use super::{AudioSink, Dialer, StreamingError, Transport, TransportEvent, OUTBOUND_QUEUE_DEPTH};

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the `setupComplete` acknowledgement
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens [`RealtimeSession`]s against the live endpoint.
#[derive(Clone)]
pub struct RealtimeDialer {
    api_key: String,
    url: String,
}

impl RealtimeDialer {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: LIVE_API_URL.to_string(),
        }
    }

    /// Point at a different endpoint (local proxies, tests).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl std::fmt::Debug for RealtimeDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the key.
        f.debug_struct("RealtimeDialer").field("url", &self.url).finish()
    }
}

#[async_trait]
impl Dialer for RealtimeDialer {
    async fn dial(
        &self,
        setup: ClientMessage,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn Transport>, StreamingError> {
        if self.api_key.is_empty() {
            return Err(StreamingError::MissingApiKey);
        }
        let session = RealtimeSession::connect(&self.url, &self.api_key, setup, events).await?;
        Ok(Box::new(session))
    }
}

/// Handle to an open live session
///
/// Owns the writer and reader tasks. Dropping the handle stops both.
pub struct RealtimeSession {
    outbound: mpsc::Sender<ClientMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
    label: String,
}

impl RealtimeSession {
    /// Single connection attempt (no retries)
    pub async fn connect(
        url: &str,
        api_key: &str,
        setup: ClientMessage,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, StreamingError> {
        let endpoint = format!("{}?key={}", url, api_key);
        let request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to live API...");

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| classify_connect_error(e.to_string()))?;

        log::info!("WebSocket connected, sending setup...");

        let (mut write, mut read) = ws_stream.split();

        let json = serde_json::to_string(&setup)
            .map_err(|e| StreamingError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(json))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))?;

        timeout(SETUP_TIMEOUT, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if parse_message(text.as_bytes())?.is_setup_complete() {
                            return Ok(());
                        }
                        log::debug!("Ignoring message while waiting for setupComplete");
                    }
                    Ok(Message::Binary(bytes)) => {
                        if parse_message(&bytes)?.is_setup_complete() {
                            return Ok(());
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "no reason".to_string());
                        return Err(StreamingError::AuthenticationFailed(format!(
                            "Connection closed during setup: {}",
                            reason
                        )));
                    }
                    Err(e) => return Err(StreamingError::ProtocolError(e.to_string())),
                    _ => {} // Ignore ping/pong
                }
            }
            Err(StreamingError::Disconnected("Stream ended".to_string()))
        })
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Setup timeout".to_string()))??;

        log::info!("Live session set up");

        let (outbound, mut outbound_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let writer_events = events.clone();
        let writer_task = tokio::spawn(async move {
            let mut sent: u64 = 0;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = outbound_rx.recv() => {
                        let Some(msg) = next else { break };
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                log::warn!("Failed to serialize outbound message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            log::warn!("WebSocket send failed: {}", e);
                            let _ = writer_events.send(TransportEvent::Failed(e.to_string())).await;
                            return;
                        }
                        sent += 1;
                        // Periodic logging (every 100 frames)
                        if sent % 100 == 0 {
                            log::debug!("Live transport: sent {} messages", sent);
                        }
                    }
                }
            }
            if let Err(e) = write.close().await {
                log::debug!("Error closing WebSocket: {}", e);
            }
            log::debug!("Writer task exiting");
        });

        let reader_task = tokio::spawn(async move {
            let end = loop {
                let Some(msg_result) = read.next().await else {
                    break TransportEvent::Closed("stream ended".to_string());
                };
                let parsed = match msg_result {
                    Ok(Message::Text(text)) => parse_message(text.as_bytes()),
                    Ok(Message::Binary(bytes)) => parse_message(&bytes),
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                        log::info!("WebSocket closed by server: {}", reason);
                        break TransportEvent::Closed(reason);
                    }
                    Err(e) => {
                        log::warn!("WebSocket error: {}", e);
                        break TransportEvent::Failed(e.to_string());
                    }
                    _ => continue, // Ignore ping/pong/frames
                };
                match parsed {
                    Ok(msg) => {
                        if events.send(TransportEvent::Message(msg)).await.is_err() {
                            log::debug!("Transport event channel closed");
                            return;
                        }
                    }
                    Err(e) => log::warn!("Failed to parse message: {}", e),
                }
            };
            let _ = events.send(end).await;
            log::debug!("Reader task exiting");
        });

        Ok(Self {
            outbound,
            shutdown: Some(shutdown_tx),
            writer_task,
            reader_task,
            label: format!("ws#{}", next_connection_number()),
        })
    }
}

impl Transport for RealtimeSession {
    fn label(&self) -> &str {
        &self.label
    }

    fn audio_sink(&self) -> AudioSink {
        AudioSink::new(self.outbound.clone())
    }

    fn close(mut self: Box<Self>) {
        log::info!("Closing live transport {}", self.label);
        // Stop reporting first so the close is never seen as a failure.
        self.reader_task.abort();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        } else if self.writer_task.is_finished() {
            log::debug!("Transport {} dropped after close", self.label);
        }
    }
}

fn parse_message(bytes: &[u8]) -> Result<ServerMessage, StreamingError> {
    serde_json::from_slice(bytes).map_err(|e| StreamingError::ProtocolError(e.to_string()))
}

fn classify_connect_error(message: String) -> StreamingError {
    if message.contains("401") || message.contains("403") {
        StreamingError::AuthenticationFailed(message)
    } else {
        StreamingError::ConnectionFailed(message)
    }
}

fn next_connection_number() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
