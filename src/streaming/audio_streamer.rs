//! Capture pipeline: microphone frames to the live transport
//!
//! Bridges the device thread (sync) to the transport writer (async).
//! Each fixed-size frame is converted to PCM16, wrapped as a media chunk, and
//! queued on the current transport's [`AudioSink`].
//!
//! # Architecture
//!
//! ```text
//! Audio Thread (sync)              Tokio Runtime (async)
//! ┌──────────────────┐             ┌────────────────────────┐
//! │ CPAL Callback    │──channel──▶ │ CapturePipeline task   │
//! │ try_send(frame)  │             │   ├─ gate (open/muted) │
//! └──────────────────┘             │   ├─ f32 → PCM16       │
//!                                  │   └─ try_send to sink  │
//!                                  └────────────────────────┘
//! ```
//!
//! Sending never blocks and never fails the session: a frame that cannot be
//! queued is dropped and logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::MediaChunk;
use super::{AudioSink, StreamingError};
use crate::audio::pcm::frame_to_pcm16;

/// Shared switches read by the capture task for every frame.
#[derive(Debug, Clone, Default)]
pub struct CaptureGate {
    closed: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
}

impl CaptureGate {
    pub fn new(muted: bool) -> Self {
        let gate = Self::default();
        gate.set_muted(muted);
        gate
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Stop forwarding for good. In-flight frames are dropped from here on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Counters kept by the capture task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub sent: u64,
    pub muted: u64,
    pub dropped: u64,
}

/// Running capture task for one link.
#[derive(Debug)]
pub struct CapturePipeline {
    gate: CaptureGate,
    task: JoinHandle<CaptureStats>,
}

impl CapturePipeline {
    /// Start forwarding `frames` (at `sample_rate`) to `sink`.
    pub fn spawn(
        frames: mpsc::Receiver<Vec<f32>>,
        sink: AudioSink,
        sample_rate: u32,
        gate: CaptureGate,
    ) -> Self {
        log::info!("CapturePipeline: forwarding {}Hz frames", sample_rate);
        let task = tokio::spawn(run(frames, sink, sample_rate, gate.clone()));
        Self { gate, task }
    }

    pub fn gate(&self) -> &CaptureGate {
        &self.gate
    }

    /// Close the gate and abort the task. No frame is sent after this returns.
    pub fn stop(self) {
        self.gate.close();
        self.task.abort();
    }
}

async fn run(
    mut frames: mpsc::Receiver<Vec<f32>>,
    sink: AudioSink,
    sample_rate: u32,
    gate: CaptureGate,
) -> CaptureStats {
    let mut stats = CaptureStats::default();

    while let Some(frame) = frames.recv().await {
        if gate.is_closed() {
            break;
        }
        if gate.is_muted() {
            stats.muted += 1;
            continue;
        }

        let chunk = MediaChunk::pcm16(&frame_to_pcm16(&frame), sample_rate);
        match sink.try_send(chunk) {
            Ok(()) => {
                stats.sent += 1;
                // Periodic logging (every 50 frames)
                if stats.sent % 50 == 0 {
                    log::debug!("CapturePipeline: sent {} frames", stats.sent);
                }
            }
            Err(StreamingError::Disconnected(_)) => {
                log::debug!("CapturePipeline: transport gone, stopping");
                break;
            }
            Err(e) => {
                stats.dropped += 1;
                log::warn!("CapturePipeline: dropped frame: {}", e);
            }
        }
    }

    log::info!(
        "CapturePipeline: done ({} sent, {} muted, {} dropped)",
        stats.sent,
        stats.muted,
        stats.dropped
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::ClientMessage;

    fn media_count(rx: &mut mpsc::Receiver<ClientMessage>) -> usize {
        let mut count = 0;
        while let Ok(msg) = rx.try_recv() {
            assert!(matches!(msg, ClientMessage::RealtimeInput(_)));
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_frames_are_forwarded_as_pcm16() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        let handle = tokio::spawn(run(
            frame_rx,
            AudioSink::new(out_tx),
            16000,
            CaptureGate::default(),
        ));
        frame_tx.send(vec![0.5; 4096]).await.unwrap();
        frame_tx.send(vec![-0.5; 4096]).await.unwrap();
        drop(frame_tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.sent, 2);

        match out_rx.recv().await.unwrap() {
            ClientMessage::RealtimeInput(input) => {
                assert_eq!(input.media_chunks.len(), 1);
                assert_eq!(input.media_chunks[0].mime_type, "audio/pcm;rate=16000");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_muted_frames_are_not_sent() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let gate = CaptureGate::new(true);

        let handle = tokio::spawn(run(frame_rx, AudioSink::new(out_tx), 16000, gate.clone()));
        frame_tx.send(vec![0.1; 16]).await.unwrap();
        frame_tx.send(vec![0.1; 16]).await.unwrap();
        drop(frame_tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.muted, 2);
        assert_eq!(media_count(&mut out_rx), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_stopping() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(1);

        let handle = tokio::spawn(run(
            frame_rx,
            AudioSink::new(out_tx),
            16000,
            CaptureGate::default(),
        ));
        for _ in 0..3 {
            frame_tx.send(vec![0.0; 16]).await.unwrap();
        }
        drop(frame_tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(media_count(&mut out_rx), 1);
    }

    #[tokio::test]
    async fn test_closed_gate_stops_forwarding() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let gate = CaptureGate::default();
        gate.close();

        let handle = tokio::spawn(run(frame_rx, AudioSink::new(out_tx), 16000, gate));
        frame_tx.send(vec![0.0; 16]).await.unwrap();

        let stats = handle.await.unwrap();
        assert_eq!(stats.sent, 0);
        assert_eq!(media_count(&mut out_rx), 0);
    }
}
