//! The realtime session manager
//!
//! One task owns everything mutable about the conversation: the connection
//! state, the live link (devices + transport + capture pipeline), the playback
//! scheduler, and the transcript. Every input arrives on a single channel and
//! is handled to completion before the next one, so the only races left are
//! between logically concurrent attempts, and those are settled by the
//! generation tags carried on every input.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::AudioSpec;
use crate::effects::{ConnectRequest, EffectRunner, Link};
use crate::history::{history_context, HistoryStore};
use crate::playback::PlaybackScheduler;
use crate::reconnect::{ReconnectPolicy, ReconnectTimer};
use crate::settings::AppSettings;
use crate::state_machine::{reduce, ConnectionStatus, Effect, Event, State};
use crate::streaming::{
    CaptureGate, CapturePipeline, ClientMessage, LiveSessionConfig, ServerContent,
    ServerMessage, Speaker, TranscriptAggregator, TransportEvent, DEFAULT_HISTORY_LIMIT,
};
use crate::UiState;

/// Inputs queued ahead of the session task.
pub const SESSION_QUEUE_DEPTH: usize = 256;

/// Everything the session task reacts to.
#[derive(Debug)]
pub enum SessionInput {
    /// Lifecycle events, fed to the reducer
    Event(Event),
    /// A connect attempt finished successfully
    LinkReady { generation: u64, link: Link },
    /// Inbound message from the transport of `generation`
    Server {
        generation: u64,
        message: ServerMessage,
    },
    /// A scheduled chunk of `generation` finished playing on its own
    PlaybackEnded { generation: u64, id: u64 },
    SetMuted(bool),
    ClearHistory,
}

/// Session parameters, usually derived from [`AppSettings`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub audio: AudioSpec,
    pub reconnect: ReconnectPolicy,
    /// Zero disables the periodic context refresh.
    pub context_refresh: Duration,
    pub history_limit: usize,
    pub persona: String,
    pub live: LiveSessionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&AppSettings::default())
    }
}

impl From<&AppSettings> for SessionConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            audio: settings.audio_spec(),
            reconnect: settings.reconnect_policy(),
            context_refresh: settings.context_refresh(),
            history_limit: if settings.history_limit == 0 {
                DEFAULT_HISTORY_LIMIT
            } else {
                settings.history_limit
            },
            persona: settings.persona.clone(),
            live: settings.live.clone(),
        }
    }
}

/// The adopted link plus the tasks serving it.
struct ActiveLink {
    generation: u64,
    link: Link,
    capture: CapturePipeline,
    forwarders: Vec<JoinHandle<()>>,
}

impl ActiveLink {
    fn close(self) {
        // Capture first so no frame reaches a closing transport.
        self.capture.stop();
        for forwarder in self.forwarders {
            forwarder.abort();
        }
        self.link.release();
    }
}

/// Cloneable handle used to drive a running [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionInput>,
    ui: watch::Receiver<UiState>,
}

impl SessionHandle {
    pub async fn start(&self) {
        self.send(SessionInput::Event(Event::Start)).await;
    }

    pub async fn stop(&self) {
        self.send(SessionInput::Event(Event::Stop)).await;
    }

    pub async fn set_muted(&self, muted: bool) {
        self.send(SessionInput::SetMuted(muted)).await;
    }

    pub async fn clear_history(&self) {
        self.send(SessionInput::ClearHistory).await;
    }

    /// Tear everything down and end the session task.
    pub async fn shutdown(&self) {
        self.send(SessionInput::Event(Event::Exit)).await;
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> UiState {
        self.ui.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.ui.clone()
    }

    async fn send(&self, input: SessionInput) {
        if self.tx.send(input).await.is_err() {
            log::warn!("Session task is not running");
        }
    }
}

/// Owns and drives one conversation.
pub struct SessionManager {
    config: SessionConfig,
    state: State,
    runner: Arc<dyn EffectRunner>,
    history_store: Arc<dyn HistoryStore>,
    tx: mpsc::Sender<SessionInput>,
    rx: mpsc::Receiver<SessionInput>,
    /// Link reported ready and waiting for the reducer's verdict
    ready: Option<Link>,
    active: Option<ActiveLink>,
    playback: PlaybackScheduler,
    transcript: TranscriptAggregator,
    timer: ReconnectTimer,
    refresh: Option<JoinHandle<()>>,
    muted: bool,
    ui: watch::Sender<UiState>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        runner: Arc<dyn EffectRunner>,
        history_store: Arc<dyn HistoryStore>,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);

        let turns = match history_store.load(&config.persona) {
            Ok(turns) => turns,
            Err(e) => {
                log::warn!("History: failed to load '{}': {}", config.persona, e);
                Vec::new()
            }
        };
        log::info!(
            "Session for '{}' starting with {} turns of history",
            config.persona,
            turns.len()
        );
        let transcript = TranscriptAggregator::with_history(config.history_limit, turns);

        let (ui_tx, ui_rx) = watch::channel(UiState::default());
        let manager = Self {
            state: State::new(config.reconnect),
            playback: PlaybackScheduler::new(config.audio.playback_sample_rate),
            config,
            runner,
            history_store,
            tx: tx.clone(),
            rx,
            ready: None,
            active: None,
            transcript,
            timer: ReconnectTimer::new(),
            refresh: None,
            muted: false,
            ui: ui_tx,
        };
        manager.publish();

        (manager, SessionHandle { tx, ui: ui_rx })
    }

    /// Run until `Exit`. Everything acquired is released before returning.
    pub async fn run(mut self) {
        log::info!("Session loop started");
        self.refresh = spawn_refresh_ticker(self.config.context_refresh, self.tx.clone());

        while let Some(input) = self.rx.recv().await {
            let exit = matches!(input, SessionInput::Event(Event::Exit));
            self.handle(input);
            if exit {
                break;
            }
        }

        self.dispose();
        log::info!("Session loop exiting");
    }

    fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Event(event) => self.dispatch(event),
            SessionInput::LinkReady { generation, link } => {
                if let Some(previous) = self.ready.replace(link) {
                    previous.release();
                }
                self.dispatch(Event::LinkReady { generation });
            }
            SessionInput::Server {
                generation,
                message,
            } => self.on_server_message(generation, message),
            SessionInput::PlaybackEnded { generation, id } => {
                if self.is_live(generation)
                    && self.playback.on_ended(id)
                    && !self.playback.is_speaking()
                {
                    self.publish();
                }
            }
            SessionInput::SetMuted(muted) => {
                self.muted = muted;
                if let Some(active) = &self.active {
                    active.capture.gate().set_muted(muted);
                }
                log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
                self.publish();
            }
            SessionInput::ClearHistory => {
                self.transcript.clear_history();
                if let Err(e) = self.history_store.clear(&self.config.persona) {
                    log::warn!("History: failed to clear '{}': {}", self.config.persona, e);
                }
                self.publish();
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        if event == Event::RefreshDue && !self.is_idle() {
            log::debug!("Context refresh skipped: conversation in progress");
            return;
        }

        let old_status = self.state.status;
        let (next, effects) = reduce(&self.state, event);
        if next.status != old_status {
            log::info!("State transition: {:?} -> {:?}", old_status, next.status);
        }
        self.state = next;

        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Connect { generation } => {
                let instruction = format!(
                    "{}{}",
                    self.config.live.system_instruction,
                    history_context(self.transcript.history())
                );
                let setup = ClientMessage::setup(&self.config.live, &instruction);
                log::info!("Connecting (generation {})", generation);
                self.runner
                    .spawn_connect(ConnectRequest { generation, setup }, self.tx.clone());
            }
            Effect::AdoptLink { generation } => self.adopt(generation),
            Effect::ReleaseLink { generation } => {
                if let Some(link) = self.ready.take() {
                    log::debug!(
                        "Stale link for generation {} (current {}), releasing",
                        generation,
                        self.state.generation
                    );
                    link.release();
                }
            }
            Effect::Teardown => {
                self.teardown();
                // A silent retry keeps the status but is no longer listening.
                self.publish();
            }
            Effect::ScheduleReconnect { token, delay } => {
                let delay = delay + self.state.reconnect.policy().sample_jitter();
                log::info!(
                    "Silent reconnect {}/{} in {:?}",
                    self.state.reconnect.attempts(),
                    self.state.reconnect.policy().max_attempts,
                    delay
                );
                self.timer.schedule(
                    delay,
                    SessionInput::Event(Event::ReconnectDue { token }),
                    self.tx.clone(),
                );
            }
            Effect::CancelReconnect => self.timer.cancel(),
            Effect::EmitUi => self.publish(),
        }
    }

    fn adopt(&mut self, generation: u64) {
        let Some(mut link) = self.ready.take() else {
            log::warn!("No ready link to adopt for generation {}", generation);
            return;
        };
        if let Some(previous) = self.active.take() {
            previous.close();
        }

        self.playback.attach(link.devices.output.clone());

        let frames = link
            .devices
            .frames
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1);
        let capture = CapturePipeline::spawn(
            frames,
            link.transport.audio_sink(),
            link.devices.microphone.sample_rate(),
            CaptureGate::new(self.muted),
        );

        let mut forwarders = Vec::new();
        if let Some(events) = link.events.take() {
            forwarders.push(forward_transport_events(generation, events, self.tx.clone()));
        }
        if let Some(ended) = link.devices.ended.take() {
            forwarders.push(forward_playback_ended(generation, ended, self.tx.clone()));
        }

        log::info!(
            "Link {} live (generation {})",
            link.transport.label(),
            generation
        );
        self.active = Some(ActiveLink {
            generation,
            link,
            capture,
            forwarders,
        });
    }

    /// Release every per-link resource. Safe to call with nothing held.
    fn teardown(&mut self) {
        self.playback.release();
        if let Some(active) = self.active.take() {
            log::info!("Tearing down link (generation {})", active.generation);
            active.close();
        }
        if let Some(link) = self.ready.take() {
            link.release();
        }
        self.transcript.discard_in_progress();
    }

    fn dispose(&mut self) {
        self.timer.cancel();
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        self.teardown();
        self.publish();
    }

    fn is_live(&self, generation: u64) -> bool {
        generation == self.state.generation
            && self
                .active
                .as_ref()
                .map_or(false, |active| active.generation == generation)
    }

    /// No agent audio outstanding and no utterance being assembled.
    fn is_idle(&self) -> bool {
        !self.playback.is_speaking() && !self.transcript.has_in_progress()
    }

    fn on_server_message(&mut self, generation: u64, message: ServerMessage) {
        if !self.is_live(generation) {
            log::debug!(
                "Dropping message from stale generation {} (current {})",
                generation,
                self.state.generation
            );
            return;
        }

        if let Some(content) = message.server_content {
            self.on_server_content(content);
        }

        if let Some(go_away) = message.go_away {
            log::info!(
                "Server is closing the session (time left: {}), rotating transport",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
            self.dispatch(Event::TransportLost {
                generation,
                reason: "server sent goAway".to_string(),
            });
        }
    }

    fn on_server_content(&mut self, content: ServerContent) {
        let was_speaking = self.playback.is_speaking();
        let mut changed = false;

        for payload in content.audio_payloads() {
            if let Err(e) = self.playback.enqueue(payload) {
                log::warn!("Dropping inbound audio chunk: {}", e);
            }
        }

        if content.interrupted {
            self.playback.interrupt();
            changed = true;
        }

        if let Some(text) = content.user_text() {
            changed |= self.transcript.process_fragment(Speaker::User, text);
        }
        if let Some(text) = content.agent_text() {
            changed |= self.transcript.process_fragment(Speaker::Agent, text);
        }

        if content.turn_complete {
            if self.transcript.complete_turn().is_some() {
                let turns = self.transcript.history_vec();
                if let Err(e) = self.history_store.save(&self.config.persona, &turns) {
                    log::warn!("History: failed to save '{}': {}", self.config.persona, e);
                }
            }
            changed = true;
        }

        if changed || was_speaking != self.playback.is_speaking() {
            self.publish();
        }
    }

    fn snapshot(&self) -> UiState {
        UiState {
            status: self.state.status,
            is_speaking: self.playback.is_speaking(),
            is_listening: self.state.status == ConnectionStatus::Connected
                && self.active.is_some()
                && !self.muted,
            is_muted: self.muted,
            active: self.transcript.current().cloned(),
            history: self.transcript.history_vec(),
            last_error: self.state.last_error.clone(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        log::debug!(
            "Emitting UI state: {:?} (speaking={}, listening={})",
            snapshot.status,
            snapshot.is_speaking,
            snapshot.is_listening
        );
        self.ui.send_replace(snapshot);
    }
}

/// Tag transport events with their generation and feed them to the session.
fn forward_transport_events(
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    tx: mpsc::Sender<SessionInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let input = match event {
                TransportEvent::Message(message) => SessionInput::Server {
                    generation,
                    message,
                },
                TransportEvent::Closed(reason) => SessionInput::Event(Event::TransportLost {
                    generation,
                    reason: format!("transport closed: {}", reason),
                }),
                TransportEvent::Failed(reason) => SessionInput::Event(Event::TransportLost {
                    generation,
                    reason: format!("transport failed: {}", reason),
                }),
            };
            if tx.send(input).await.is_err() {
                break;
            }
        }
    })
}

fn forward_playback_ended(
    generation: u64,
    mut ended: mpsc::UnboundedReceiver<u64>,
    tx: mpsc::Sender<SessionInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(id) = ended.recv().await {
            if tx
                .send(SessionInput::PlaybackEnded { generation, id })
                .await
                .is_err()
            {
                break;
            }
        }
    })
}

/// Periodic `RefreshDue`. The first tick is one full period after start.
fn spawn_refresh_ticker(period: Duration, tx: mpsc::Sender<SessionInput>) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        log::info!("Context refresh disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if tx.send(SessionInput::Event(Event::RefreshDue)).await.is_err() {
                break;
            }
        }
    }))
}
