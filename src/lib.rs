pub mod api_key;
pub mod audio;
pub mod effects;
pub mod history;
pub mod playback;
pub mod reconnect;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use serde::Serialize;
use std::sync::Arc;

use audio::{AudioBackend, CpalBackend};
use effects::LiveEffectRunner;
use history::HistoryStore;
use session::{SessionConfig, SessionHandle, SessionManager};
use settings::AppSettings;
use state_machine::ConnectionStatus;
use streaming::{Dialer, RealtimeDialer, Turn, Utterance};

/// Snapshot published to whatever renders the session.
/// Serialized as `{ "status": "CONNECTED", "isSpeaking": true, ... }`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub status: ConnectionStatus,
    /// Agent audio is outstanding.
    pub is_speaking: bool,
    /// Connected with a live link and not muted.
    pub is_listening: bool,
    pub is_muted: bool,
    /// Utterance being assembled, if any.
    pub active: Option<Utterance>,
    pub history: Vec<Turn>,
    pub last_error: Option<String>,
}

/// Wire a session to the default audio devices and the live endpoint.
pub fn build_live_session(
    settings: &AppSettings,
    api_key: String,
    history: Arc<dyn HistoryStore>,
) -> (SessionManager, SessionHandle) {
    let audio: Arc<dyn AudioBackend> = Arc::new(CpalBackend);
    let dialer: Arc<dyn Dialer> = Arc::new(RealtimeDialer::new(api_key));
    build_session(settings, audio, dialer, history)
}

/// Wire a session to any audio backend and dialer.
pub fn build_session(
    settings: &AppSettings,
    audio: Arc<dyn AudioBackend>,
    dialer: Arc<dyn Dialer>,
    history: Arc<dyn HistoryStore>,
) -> (SessionManager, SessionHandle) {
    let config = SessionConfig::from(settings);
    let runner = LiveEffectRunner::new(audio, dialer, config.audio);
    SessionManager::new(config, runner, history)
}
