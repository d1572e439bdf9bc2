use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use voxlink::api_key::{mask, resolve_api_key, set_stored_api_key};
use voxlink::history::{HistoryStore, JsonFileStore, MemoryStore};
use voxlink::settings::{default_settings_path, load_settings, save_settings, AppSettings};
use voxlink::state_machine::ConnectionStatus;
use voxlink::streaming::StreamingError;
use voxlink::UiState;

#[derive(Debug, Parser)]
#[command(name = "voxlink", version, about = "Talk with a live voice agent")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Hold a conversation until Ctrl-C (default)
    Run {
        /// Keep history in memory only
        #[arg(long)]
        ephemeral: bool,
        /// Start with the microphone muted
        #[arg(long)]
        muted: bool,
    },
    /// Store the API key in the system keyring
    SetKey { key: String },
    /// Delete the stored API key
    ClearKey,
    /// Forget the conversation history of the configured persona
    ClearHistory,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings_path = match cli.settings {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let settings = if settings_path.exists() {
        let settings = load_settings(&settings_path);
        log::debug!("Settings loaded from {:?}", settings_path);
        settings
    } else {
        // First run: leave an editable file behind.
        let settings = AppSettings::default();
        match save_settings(&settings_path, &settings) {
            Ok(()) => log::info!("Wrote default settings to {:?}", settings_path),
            Err(e) => log::warn!("Failed to write default settings: {}", e),
        }
        settings
    };

    match cli.command.unwrap_or(Command::Run {
        ephemeral: false,
        muted: false,
    }) {
        Command::Run { ephemeral, muted } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(converse(settings, ephemeral, muted))?;
        }
        Command::SetKey { key } => {
            set_stored_api_key(Some(&key)).context("Failed to store API key")?;
            println!("Stored API key {}", mask(key.trim()));
        }
        Command::ClearKey => {
            set_stored_api_key(None).context("Failed to delete API key")?;
            println!("API key deleted");
        }
        Command::ClearHistory => {
            JsonFileStore::open_default()?.clear(&settings.persona)?;
            println!("History for '{}' cleared", settings.persona);
        }
    }
    Ok(())
}

async fn converse(settings: AppSettings, ephemeral: bool, muted: bool) -> anyhow::Result<()> {
    let api_key = resolve_api_key().ok_or(StreamingError::MissingApiKey)?;

    // Both ring and aws-lc-rs may be compiled in; pick one for the process.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let history: Arc<dyn HistoryStore> = if ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(JsonFileStore::open_default()?)
    };

    let (manager, handle) = voxlink::build_live_session(&settings, api_key, history);
    let session = tokio::spawn(manager.run());

    let mut ui = handle.subscribe();
    let mut printer = TranscriptPrinter::new(&ui.borrow_and_update());

    if muted {
        handle.set_muted(true).await;
    }
    handle.start().await;
    println!("Listening as '{}'. Press Ctrl-C to stop.", settings.persona);

    let mut failed = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-C received, stopping");
                break;
            }
            changed = ui.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = ui.borrow_and_update().clone();
                printer.render(&state);
                if state.status == ConnectionStatus::Error {
                    failed = state.last_error.or_else(|| Some("unknown error".to_string()));
                    break;
                }
            }
        }
    }

    handle.stop().await;
    handle.shutdown().await;
    session.await.context("Session task panicked")?;

    match failed {
        Some(message) => anyhow::bail!("Session failed: {}", message),
        None => Ok(()),
    }
}

/// Prints status changes and newly finalized turns.
struct TranscriptPrinter {
    status: ConnectionStatus,
    last_turn: Option<String>,
}

impl TranscriptPrinter {
    fn new(initial: &UiState) -> Self {
        Self {
            status: initial.status,
            last_turn: initial.history.last().map(|t| t.id.clone()),
        }
    }

    fn render(&mut self, state: &UiState) {
        if state.status != self.status {
            log::info!("Status: {:?}", state.status);
            self.status = state.status;
        }

        let start = self
            .last_turn
            .as_ref()
            .and_then(|id| state.history.iter().position(|t| &t.id == id))
            .map_or(0, |i| i + 1);
        for turn in &state.history[start..] {
            println!("{}: {}", turn.speaker.label(), turn.text);
        }
        self.last_turn = state.history.last().map(|t| t.id.clone());
    }
}
