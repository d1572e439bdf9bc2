use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::audio::AudioSpec;
use crate::reconnect::ReconnectPolicy;
use crate::streaming::{LiveSessionConfig, DEFAULT_HISTORY_LIMIT};

const APP_DIR_NAME: &str = "voxlink";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Settings I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Rate of the PCM sent to the service.
    pub capture_sample_rate: u32,

    /// Rate of the PCM the service sends back.
    pub playback_sample_rate: u32,

    /// Samples per captured frame (one outbound media chunk each).
    pub frame_size: usize,

    /// First silent retry delay; doubled per attempt.
    pub reconnect_base_ms: u64,

    /// Upper bound on the backoff delay before jitter.
    pub reconnect_cap_ms: u64,

    /// Random extra delay added to each retry, up to this value.
    pub reconnect_jitter_ms: u64,

    /// Failures tolerated before the session shows an error.
    pub max_silent_attempts: u32,

    /// How often an idle, connected session rotates its transport.
    pub context_refresh_secs: u64,

    /// Finalized turns kept in history.
    pub history_limit: usize,

    /// History is stored per persona.
    pub persona: String,

    /// Passed to the service at setup.
    pub live: LiveSessionConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            frame_size: 4096,
            reconnect_base_ms: 600,
            reconnect_cap_ms: 15_000,
            reconnect_jitter_ms: 250,
            max_silent_attempts: 8,
            context_refresh_secs: 300,
            history_limit: DEFAULT_HISTORY_LIMIT,
            persona: "maximus".to_string(),
            live: LiveSessionConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn audio_spec(&self) -> AudioSpec {
        AudioSpec {
            capture_sample_rate: self.capture_sample_rate,
            playback_sample_rate: self.playback_sample_rate,
            frame_size: self.frame_size.max(1),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
            jitter: Duration::from_millis(self.reconnect_jitter_ms),
            max_attempts: self.max_silent_attempts.max(1),
        }
    }

    pub fn context_refresh(&self) -> Duration {
        Duration::from_secs(self.context_refresh_secs)
    }
}

/// `<config_dir>/voxlink/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults on any problem.
pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write atomically: write to a temp file in the same directory, then rename.
    // This prevents partial/corrupt settings.json if the process dies mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|e| io_error(&tmp_path, e))?;

    // On Windows, rename fails if the destination exists, so remove it first.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_error(path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| io_error(path, e))?;
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> SettingsError {
    SettingsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AppSettings::default();
        let policy = settings.reconnect_policy();
        assert_eq!(policy.base, Duration::from_millis(600));
        assert_eq!(policy.cap, Duration::from_secs(15));
        assert_eq!(policy.max_attempts, 8);
        assert_eq!(settings.context_refresh(), Duration::from_secs(300));
        assert_eq!(settings.history_limit, 20);

        let spec = settings.audio_spec();
        assert_eq!(spec.capture_sample_rate, 16000);
        assert_eq!(spec.playback_sample_rate, 24000);
        assert_eq!(spec.frame_size, 4096);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"persona": "ada", "live": {"voice": "Kore"}}"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.persona, "ada");
        assert_eq!(settings.live.voice, "Kore");
        assert_eq!(settings.live.model, crate::streaming::DEFAULT_MODEL);
        assert_eq!(settings.frame_size, 4096);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            max_silent_attempts: 3,
            ..AppSettings::default()
        };

        save_settings(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings(&path), settings);
    }
}
