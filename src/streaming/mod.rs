//! Live transport to the remote dialogue service
//!
//! A [`Dialer`] produces one [`Transport`] per connect attempt. The transport
//! reports inbound traffic and its own end through a [`TransportEvent`]
//! channel; the caller tags that channel with the attempt's generation.
//!
//! # Architecture
//!
//! ```text
//! CapturePipeline ──AudioSink──▶ writer task ──▶ WebSocket
//!                                                   │
//!                     TransportEvent ◀── reader task ┘
//! ```
//!
//! Retries are not done here: the reconnection controller owns them.

mod audio_streamer;
mod protocol;
mod realtime_client;
mod transcript_aggregator;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use audio_streamer::{CaptureGate, CapturePipeline};
pub use protocol::{
    ClientMessage, GoAway, InlineData, LiveSessionConfig, MediaChunk, ModelTurn, Part,
    ServerContent, ServerMessage, Transcription, DEFAULT_MODEL, DEFAULT_VOICE, LIVE_API_URL,
};
pub use realtime_client::{RealtimeDialer, RealtimeSession};
pub use transcript_aggregator::{
    sanitize, Speaker, TranscriptAggregator, Turn, Utterance, DEFAULT_HISTORY_LIMIT,
};

/// Outbound messages queued ahead of the socket writer. A full queue drops.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Errors that can occur on the live transport
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamingError {
    #[error("API key not configured. Set GEMINI_API_KEY or run `voxlink set-key`.")]
    MissingApiKey,
    #[error("Failed to connect to live API: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
    #[error("Failed to send audio: {0}")]
    SendFailed(String),
}

/// What a live transport reports after it is open.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    Closed(String),
    Failed(String),
}

/// Cloneable handle for pushing audio frames to a transport's writer.
#[derive(Debug, Clone)]
pub struct AudioSink {
    tx: mpsc::Sender<ClientMessage>,
}

impl AudioSink {
    pub fn new(tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { tx }
    }

    /// Queue one frame without waiting. Never blocks the capture path.
    pub fn try_send(&self, chunk: MediaChunk) -> Result<(), StreamingError> {
        self.tx
            .try_send(ClientMessage::audio(chunk))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    StreamingError::SendFailed("outbound queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    StreamingError::Disconnected("transport closed".to_string())
                }
            })
    }
}

/// One open connection to the service. Superseded transports are closed,
/// never reused.
pub trait Transport: Send {
    /// Human-readable identity for logs.
    fn label(&self) -> &str;
    fn audio_sink(&self) -> AudioSink;
    /// Close the connection. No further events are reported after this.
    fn close(self: Box<Self>);
}

/// Opens transports.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect, send `setup`, and return once the service confirmed it.
    async fn dial(
        &self,
        setup: ClientMessage,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn Transport>, StreamingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = StreamingError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StreamingError::AuthenticationFailed("invalid key".to_string());
        assert!(err.to_string().contains("invalid key"));
    }

    #[tokio::test]
    async fn test_audio_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = AudioSink::new(tx);

        assert!(sink.try_send(MediaChunk::pcm16(&[1], 16000)).is_ok());
        assert!(matches!(
            sink.try_send(MediaChunk::pcm16(&[2], 16000)),
            Err(StreamingError::SendFailed(_))
        ));

        assert!(rx.recv().await.is_some());
        drop(rx);
        assert!(matches!(
            sink.try_send(MediaChunk::pcm16(&[3], 16000)),
            Err(StreamingError::Disconnected(_))
        ));
    }
}
