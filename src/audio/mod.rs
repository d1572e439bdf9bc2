//! Audio device bridge
//!
//! Acquires the microphone stream and the two audio clocks (capture and
//! playback) for one connect attempt. Everything acquired here is owned by an
//! [`AudioDevices`] value and released when it is dropped, so every exit path
//! (stop, error escalation, stale attempt, disposal) closes the devices.

pub mod capture;
pub mod output;
pub mod pcm;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

pub use capture::CpalMicrophone;
pub use output::{CpalSpeaker, Mixer};

/// Captured frames queued between the device thread and the capture pipeline.
/// Frames beyond this are dropped at the source.
pub const FRAME_QUEUE_DEPTH: usize = 32;

/// Errors that can occur while acquiring or driving audio devices.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Audio device already closed")]
    Closed,
}

/// Rates and framing requested for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub frame_size: usize,
}

/// The live microphone stream. Its captured-frame counter is the capture clock.
pub trait MicrophoneStream: Send {
    /// Rate of the frames delivered to the capture pipeline.
    fn sample_rate(&self) -> u32;
    /// Seconds of audio captured so far.
    fn captured_secs(&self) -> f64;
    /// Stop the device. Idempotent.
    fn close(&mut self);
}

/// The playback clock plus the ability to place buffers on it.
pub trait PlaybackOutput: Send + Sync {
    /// Current position of the playback clock, in seconds.
    fn now(&self) -> f64;
    /// Native rate of the output device.
    fn sample_rate(&self) -> u32;
    /// Schedule `samples` (at the native rate) to begin at clock time `at`.
    fn start(&self, id: u64, samples: Vec<f32>, at: f64) -> Result<(), AudioError>;
    /// Force-stop a scheduled buffer. No completion is reported for it.
    fn stop(&self, id: u64);
    fn is_closed(&self) -> bool;
    /// Release the device. Idempotent.
    fn close(&self);
}

/// Everything one connect attempt holds from the audio bridge.
pub struct AudioDevices {
    pub microphone: Box<dyn MicrophoneStream>,
    pub output: Arc<dyn PlaybackOutput>,
    /// Fixed-size frames at the capture rate.
    pub frames: Option<mpsc::Receiver<Vec<f32>>>,
    /// Ids of buffers that finished playing naturally.
    pub ended: Option<mpsc::UnboundedReceiver<u64>>,
}

impl AudioDevices {
    /// Explicitly release both devices (also happens on drop).
    pub fn release(mut self) {
        self.close_all();
    }

    fn close_all(&mut self) {
        if !self.output.is_closed() {
            log::info!(
                "Releasing audio devices (captured {:.1}s, playback clock at {:.1}s)",
                self.microphone.captured_secs(),
                self.output.now()
            );
        }
        self.microphone.close();
        self.output.close();
    }
}

impl Drop for AudioDevices {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl std::fmt::Debug for AudioDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDevices")
            .field("capture_rate", &self.microphone.sample_rate())
            .field("playback_rate", &self.output.sample_rate())
            .finish()
    }
}

/// Source of audio devices. Called from a blocking context.
pub trait AudioBackend: Send + Sync + 'static {
    fn acquire(&self, spec: &AudioSpec) -> Result<AudioDevices, AudioError>;
}

/// Default input/output devices through CPAL.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn acquire(&self, spec: &AudioSpec) -> Result<AudioDevices, AudioError> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let microphone = CpalMicrophone::open(spec.capture_sample_rate, spec.frame_size, frame_tx)?;

        // If the speaker fails, the microphone is closed by its Drop.
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let speaker = CpalSpeaker::open(ended_tx)?;

        Ok(AudioDevices {
            microphone: Box::new(microphone),
            output: Arc::new(speaker),
            frames: Some(frame_rx),
            ended: Some(ended_rx),
        })
    }
}
