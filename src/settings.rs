use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR_NAME: &str = "session-engine";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const ENV_BACKEND_URL: &str = "SESSION_ENGINE_BACKEND_URL";
pub const ENV_STALL_TIMEOUT_MS: &str = "SESSION_ENGINE_STALL_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("settings I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Base URL of the backend. `ws(s)://` is derived from it for realtime sessions.
    pub backend_url: String,
    pub chat_path: String,
    pub realtime_path: String,
    pub finalize_path: String,

    /// A stream that delivers no data for this long while a reply is pending is
    /// considered stalled.
    pub stall_timeout_ms: u64,

    /// HTTP timeout of the one-shot finalize call. Does not affect the live session.
    pub finalize_timeout_ms: u64,

    pub text_model: String,
    /// Backing model of the `voice-a` provider.
    pub voice_model_a: String,
    /// Backing model of the `voice-b` provider.
    pub voice_model_b: String,
    pub voice: String,

    /// Sample rate of microphone frames handed to `AudioInput`. Downsampled to 24kHz on send.
    pub input_sample_rate: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8787".to_string(),
            chat_path: "/v1/chat/stream".to_string(),
            realtime_path: "/v1/realtime".to_string(),
            finalize_path: "/v1/sessions/finalize".to_string(),
            stall_timeout_ms: 15_000,
            finalize_timeout_ms: 30_000,
            text_model: "chat-default".to_string(),
            voice_model_a: "realtime-a".to_string(),
            voice_model_b: "realtime-b".to_string(),
            voice: "calm".to_string(),
            input_sample_rate: 48_000,
        }
    }
}

impl EngineSettings {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }

    pub fn chat_url(&self) -> String {
        join_url(&self.backend_url, &self.chat_path)
    }

    pub fn finalize_url(&self) -> String {
        join_url(&self.backend_url, &self.finalize_path)
    }

    /// Realtime endpoint with the scheme swapped to `ws` / `wss`.
    pub fn realtime_url(&self) -> String {
        let base = if let Some(rest) = self.backend_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.backend_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.backend_url.clone()
        };
        join_url(&base, &self.realtime_path)
    }

    /// Apply `SESSION_ENGINE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BACKEND_URL).filter(|v| !v.trim().is_empty()) {
            log::debug!("Settings: backend_url overridden from environment");
            self.backend_url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_STALL_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.stall_timeout_ms = ms,
                _ => log::warn!(
                    "Settings: ignoring invalid {}={:?}",
                    ENV_STALL_TIMEOUT_MS,
                    raw
                ),
            }
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// `<config dir>/session-engine`, if the platform has a config dir.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME))
}

pub fn settings_path() -> Result<PathBuf, SettingsError> {
    config_dir()
        .map(|dir| dir.join(SETTINGS_FILE_NAME))
        .ok_or(SettingsError::NoConfigDir)
}

/// Load settings from the default location, then apply environment overrides.
pub fn load_settings() -> EngineSettings {
    let mut settings = match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            EngineSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

/// Missing or unparsable files fall back to defaults.
pub fn load_settings_from(path: &Path) -> EngineSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<EngineSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                EngineSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => EngineSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            EngineSettings::default()
        }
    }
}

pub fn save_settings(settings: &EngineSettings) -> Result<(), SettingsError> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &EngineSettings) -> Result<(), SettingsError> {
    let contents = serde_json::to_string_pretty(settings)?;
    write_atomic(path, &contents).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write to a temp file in the same directory, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents)?;

    // rename does not replace an existing file on Windows
    if cfg!(windows) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"stall_timeout_ms": 5000}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.stall_timeout_ms, 5000);
        assert_eq!(settings.chat_path, "/v1/chat/stream");
    }

    #[test]
    fn missing_or_corrupt_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.json");
        assert_eq!(load_settings_from(&missing), EngineSettings::default());

        let corrupt = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&corrupt, "[1, 2").unwrap();
        assert_eq!(load_settings_from(&corrupt), EngineSettings::default());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg").join(SETTINGS_FILE_NAME);
        let settings = EngineSettings {
            voice: "bright".to_string(),
            ..EngineSettings::default()
        };

        save_settings_to(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn urls_are_joined_and_scheme_swapped() {
        let settings = EngineSettings {
            backend_url: "https://api.example.com/".to_string(),
            ..EngineSettings::default()
        };
        assert_eq!(settings.chat_url(), "https://api.example.com/v1/chat/stream");
        assert_eq!(settings.realtime_url(), "wss://api.example.com/v1/realtime");

        let local = EngineSettings::default();
        assert_eq!(local.realtime_url(), "ws://127.0.0.1:8787/v1/realtime");
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let mut settings = EngineSettings::default();
        settings.apply_overrides(|key| match key {
            ENV_BACKEND_URL => Some(" http://10.0.0.2:9000 ".to_string()),
            ENV_STALL_TIMEOUT_MS => Some("abc".to_string()),
            _ => None,
        });
        assert_eq!(settings.backend_url, "http://10.0.0.2:9000");
        assert_eq!(settings.stall_timeout_ms, 15_000);

        settings.apply_overrides(|key| (key == ENV_STALL_TIMEOUT_MS).then(|| "250".to_string()));
        assert_eq!(settings.stall_timeout(), Duration::from_millis(250));
    }
}
