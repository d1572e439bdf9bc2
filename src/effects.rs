//! Effect runner for the live session
//!
//! Runs the one effect that needs to leave the session task: a connect
//! attempt. It acquires the audio devices (blocking, on the blocking pool),
//! dials the transport, and reports back with either a ready [`Link`] or a
//! classified failure. The rest of the effects touch state the session task
//! owns and are handled there.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::audio::{AudioBackend, AudioDevices, AudioSpec};
use crate::session::SessionInput;
use crate::state_machine::{Event, Fault};
use crate::streaming::{ClientMessage, Dialer, Transport, TransportEvent};

/// Inbound transport events buffered until the link is adopted.
pub const TRANSPORT_EVENT_DEPTH: usize = 64;

/// One connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub generation: u64,
    pub setup: ClientMessage,
}

/// Everything one successful connect attempt holds. Released as a unit.
pub struct Link {
    pub generation: u64,
    pub devices: AudioDevices,
    pub transport: Box<dyn Transport>,
    /// Inbound events, taken by the session when the link is adopted.
    pub events: Option<mpsc::Receiver<TransportEvent>>,
}

impl Link {
    /// Close the transport, then the devices.
    pub fn release(self) {
        log::debug!(
            "Releasing link {} (generation {})",
            self.transport.label(),
            self.generation
        );
        self.transport.close();
        self.devices.release();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("generation", &self.generation)
            .field("transport", &self.transport.label())
            .field("devices", &self.devices)
            .finish()
    }
}

/// Trait for running connect attempts asynchronously.
/// Completion is sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn_connect(&self, request: ConnectRequest, tx: mpsc::Sender<SessionInput>);
}

/// Real effect runner: audio devices from an [`AudioBackend`], transports from
/// a [`Dialer`].
pub struct LiveEffectRunner {
    audio: Arc<dyn AudioBackend>,
    dialer: Arc<dyn Dialer>,
    spec: AudioSpec,
}

impl LiveEffectRunner {
    pub fn new(audio: Arc<dyn AudioBackend>, dialer: Arc<dyn Dialer>, spec: AudioSpec) -> Arc<Self> {
        Arc::new(Self {
            audio,
            dialer,
            spec,
        })
    }
}

impl EffectRunner for LiveEffectRunner {
    fn spawn_connect(&self, request: ConnectRequest, tx: mpsc::Sender<SessionInput>) {
        let audio = self.audio.clone();
        let dialer = self.dialer.clone();
        let spec = self.spec;

        tokio::spawn(async move {
            let generation = request.generation;
            let input = match connect(audio, dialer, spec, request).await {
                Ok(link) => {
                    log::info!(
                        "Connect attempt {} ready ({})",
                        generation,
                        link.transport.label()
                    );
                    SessionInput::LinkReady { generation, link }
                }
                Err(fault) => {
                    log::warn!("Connect attempt {} failed: {}", generation, fault);
                    SessionInput::Event(Event::ConnectFailed { generation, fault })
                }
            };

            // If the session is gone the link is dropped here, which releases it.
            if tx.send(input).await.is_err() {
                log::debug!("Session closed, discarding connect attempt {}", generation);
            }
        });
    }
}

async fn connect(
    audio: Arc<dyn AudioBackend>,
    dialer: Arc<dyn Dialer>,
    spec: AudioSpec,
    request: ConnectRequest,
) -> Result<Link, Fault> {
    // Device setup blocks (device enumeration, stream start), keep it off the runtime.
    let devices = tokio::task::spawn_blocking(move || audio.acquire(&spec))
        .await
        .map_err(|e| Fault::device(format!("Audio setup task failed: {}", e)))?
        .map_err(|e| Fault::device(e.to_string()))?;
    log::debug!("Audio devices acquired: {:?}", devices);

    let (event_tx, event_rx) = mpsc::channel(TRANSPORT_EVENT_DEPTH);
    // On failure `devices` drops here and both devices are released.
    let transport = dialer
        .dial(request.setup, event_tx)
        .await
        .map_err(|e| Fault::transport(e.to_string()))?;

    Ok(Link {
        generation: request.generation,
        devices,
        transport,
        events: Some(event_rx),
    })
}
