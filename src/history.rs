//! Persisted conversation history, keyed per persona.
//!
//! Records are stored as a JSON array of `{id, text, sender, isComplete}`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use crate::streaming::Turn;

const APP_DIR_NAME: &str = "voxlink";
const HISTORY_DIR_NAME: &str = "history";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("History file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Could not determine data directory")]
    NoDataDir,
}

/// Append/trim/clear storage for finalized turns.
pub trait HistoryStore: Send + Sync + 'static {
    fn load(&self, persona: &str) -> Result<Vec<Turn>, HistoryError>;
    /// Replace the stored history with `turns` (already trimmed by the caller).
    fn save(&self, persona: &str, turns: &[Turn]) -> Result<(), HistoryError>;
    fn clear(&self, persona: &str) -> Result<(), HistoryError>;
}

/// One JSON file per persona under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data_dir>/voxlink/history`
    pub fn open_default() -> Result<Self, HistoryError> {
        let base = dirs::data_dir().ok_or(HistoryError::NoDataDir)?;
        Ok(Self::new(base.join(APP_DIR_NAME).join(HISTORY_DIR_NAME)))
    }

    pub fn path_for(&self, persona: &str) -> PathBuf {
        let name: String = persona
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = if name.is_empty() { "default".to_string() } else { name };
        self.dir.join(format!("{}.json", name))
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self, persona: &str) -> Result<Vec<Turn>, HistoryError> {
        let path = self.path_for(persona);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, persona: &str, turns: &[Turn]) -> Result<(), HistoryError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(persona);
        let contents = serde_json::to_string_pretty(turns)?;

        // Write to a temp file in the same directory, then rename over.
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents)?;
        if cfg!(windows) && path.exists() {
            std::fs::remove_file(&path)?;
        }
        std::fs::rename(&tmp_path, &path)?;
        log::debug!("History: saved {} turns to {:?}", turns.len(), path);
        Ok(())
    }

    fn clear(&self, persona: &str) -> Result<(), HistoryError> {
        match std::fs::remove_file(self.path_for(persona)) {
            Ok(()) => {
                log::info!("History: cleared '{}'", persona);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps history for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    turns: Mutex<HashMap<String, Vec<Turn>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryStore {
    fn load(&self, persona: &str) -> Result<Vec<Turn>, HistoryError> {
        let turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        Ok(turns.get(persona).cloned().unwrap_or_default())
    }

    fn save(&self, persona: &str, turns: &[Turn]) -> Result<(), HistoryError> {
        let mut stored = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        stored.insert(persona.to_string(), turns.to_vec());
        Ok(())
    }

    fn clear(&self, persona: &str) -> Result<(), HistoryError> {
        let mut stored = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        stored.remove(persona);
        Ok(())
    }
}

/// Block appended to the system instruction so the agent remembers earlier
/// sessions. Empty when there is no history.
pub fn history_context<'a>(turns: impl IntoIterator<Item = &'a Turn>) -> String {
    let lines: Vec<String> = turns
        .into_iter()
        .map(|turn| format!("{}: {}", turn.speaker.label(), turn.text))
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    format!(
        "\n\nCONTEXT OF PREVIOUS CONVERSATION:\n{}",
        lines.join("\n")
    )
}
