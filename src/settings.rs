use crate::backoff::ReconnectPolicy;
use crate::transport::status_channel_url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Where the pipeline server listens out of the box
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 500;

/// Transcription plus intent extraction can take a while on slow hardware.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Overrides the stored server URL for one run
pub const SERVER_URL_ENV: &str = "VOICE_PIPELINE_SERVER_URL";

const APP_DIR: &str = "voice-pipeline-client";
const SETTINGS_FILE: &str = "settings.json";

// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No configuration directory on this platform")]
    NoConfigDir,

    #[error("Invalid server URL: {0}")]
    InvalidServerUrl(String),
}

/// Reconnect timing, in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_RECONNECT_BASE_MS,
            cap_ms: DEFAULT_RECONNECT_CAP_MS,
            jitter_ms: DEFAULT_RECONNECT_JITTER_MS,
        }
    }
}

impl ReconnectSettings {
    pub fn to_policy(&self) -> ReconnectPolicy {
        // A zero base would reconnect in a tight loop.
        let base = Duration::from_millis(self.base_ms.max(1));
        let cap = Duration::from_millis(self.cap_ms).max(base);
        ReconnectPolicy::new(base, cap, Duration::from_millis(self.jitter_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub reconnect: ReconnectSettings,
    pub request_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect: ReconnectSettings::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Fill in keys the file does not have yet. Returns true if anything changed.
fn seed_defaults(object: &mut Map<String, Value>) -> bool {
    let is_missing = |v: Option<&Value>| -> bool { matches!(v, None | Some(Value::Null)) };

    let mut dirty = false;
    let mut set_if_missing = |object: &mut Map<String, Value>, key: &str, value: Value| {
        if is_missing(object.get(key)) {
            object.insert(key.to_string(), value);
            dirty = true;
        }
    };

    set_if_missing(object, "server_url", json!(DEFAULT_SERVER_URL));
    set_if_missing(object, "reconnect", json!({}));
    set_if_missing(object, "request_timeout_secs", json!(DEFAULT_REQUEST_TIMEOUT_SECS));

    if let Some(Value::Object(reconnect)) = object.get_mut("reconnect") {
        set_if_missing(reconnect, "base_ms", json!(DEFAULT_RECONNECT_BASE_MS));
        set_if_missing(reconnect, "cap_ms", json!(DEFAULT_RECONNECT_CAP_MS));
        set_if_missing(reconnect, "jitter_ms", json!(DEFAULT_RECONNECT_JITTER_MS));
    }

    dirty
}

fn validate_server_url(url: &str) -> Result<String, SettingsError> {
    let trimmed = url.trim();
    status_channel_url(trimmed).map_err(|e| SettingsError::InvalidServerUrl(e.to_string()))?;
    Ok(trimmed.trim_end_matches('/').to_string())
}

#[derive(Debug)]
struct Inner {
    settings: ClientSettings,
    server_override: Option<String>,
}

/// Client settings shared between the UI and the connection's URL provider.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<Inner>>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    /// `settings.json` in the platform config directory
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(dir.join(APP_DIR).join(SETTINGS_FILE))
    }

    /// Load from `path`, creating the file with defaults when it is missing
    /// and writing back any keys it lacked.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();

        let mut value = match std::fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => serde_json::from_str(&contents)?,
            Ok(_) => Value::Object(Map::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(e) => return Err(e.into()),
        };

        let dirty = match value.as_object_mut() {
            Some(object) => seed_defaults(object),
            None => {
                log::warn!("{} is not a JSON object, replacing with defaults", path.display());
                let mut object = Map::new();
                seed_defaults(&mut object);
                value = Value::Object(object);
                true
            }
        };

        let settings: ClientSettings = serde_json::from_value(value)?;
        let store = Self::from_parts(settings, Some(path));
        if dirty {
            store.save()?;
            log::info!("Seeded default settings");
        }
        Ok(store)
    }

    /// Settings that are never written to disk
    pub fn in_memory(settings: ClientSettings) -> Self {
        Self::from_parts(settings, None)
    }

    fn from_parts(settings: ClientSettings, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                settings,
                server_override: None,
            })),
            path,
        }
    }

    /// Apply `VOICE_PIPELINE_SERVER_URL` if it is set.
    pub fn with_env_override(self) -> Self {
        let value = std::env::var(SERVER_URL_ENV).ok();
        self.with_server_override(value)
    }

    /// Use `url` instead of the stored server URL until the user edits it.
    /// Blank or invalid values are ignored.
    pub fn with_server_override(self, url: Option<String>) -> Self {
        let Some(raw) = url.filter(|u| !u.trim().is_empty()) else {
            return self;
        };
        match validate_server_url(&raw) {
            Ok(url) => {
                log::info!("Server URL overridden from environment: {}", url);
                self.write().server_override = Some(url);
            }
            Err(e) => log::warn!("Ignoring {}: {}", SERVER_URL_ENV, e),
        }
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> ClientSettings {
        let inner = self.read();
        let mut settings = inner.settings.clone();
        if let Some(url) = &inner.server_override {
            settings.server_url = url.clone();
        }
        settings
    }

    /// Server base URL in effect right now
    pub fn server_url(&self) -> String {
        let inner = self.read();
        inner
            .server_override
            .clone()
            .unwrap_or_else(|| inner.settings.server_url.clone())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.read().settings.reconnect.to_policy()
    }

    /// Change the server URL. Persists immediately and replaces any override.
    pub fn set_server_url(&self, url: &str) -> Result<String, SettingsError> {
        let url = validate_server_url(url)?;
        {
            let mut inner = self.write();
            inner.settings.server_url = url.clone();
            inner.server_override = None;
        }
        self.save()?;
        log::info!("Server URL set to {}", url);
        Ok(url)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn save(&self) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.read().settings)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.get(), ClientSettings::default());
        assert!(path.exists());

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["server_url"], json!(DEFAULT_SERVER_URL));
        assert_eq!(written["reconnect"]["cap_ms"], json!(DEFAULT_RECONNECT_CAP_MS));
    }

    #[test]
    fn test_partial_file_keeps_user_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server_url":"http://10.0.0.2:8000","reconnect":{"jitter_ms":0}}"#,
        )
        .unwrap();

        let settings = SettingsStore::load(&path).unwrap().get();
        assert_eq!(settings.server_url, "http://10.0.0.2:8000");
        assert_eq!(settings.reconnect.jitter_ms, 0);
        assert_eq!(settings.reconnect.base_ms, DEFAULT_RECONNECT_BASE_MS);
        assert_eq!(settings.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(SettingsStore::load(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn test_set_server_url_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::load(&path).unwrap();
        let url = store.set_server_url(" https://pipeline.example.com/ ").unwrap();
        assert_eq!(url, "https://pipeline.example.com");
        assert_eq!(store.server_url(), "https://pipeline.example.com");

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.server_url(), "https://pipeline.example.com");
    }

    #[test]
    fn test_invalid_server_url_is_rejected() {
        let store = SettingsStore::in_memory(ClientSettings::default());
        assert!(matches!(
            store.set_server_url("ftp://example.com"),
            Err(SettingsError::InvalidServerUrl(_))
        ));
        assert_eq!(store.server_url(), DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_override_wins_until_user_edit() {
        let store = SettingsStore::in_memory(ClientSettings::default())
            .with_server_override(Some("http://gpu-box:8000".to_string()));
        assert_eq!(store.server_url(), "http://gpu-box:8000");
        assert_eq!(store.get().server_url, "http://gpu-box:8000");

        store.set_server_url("http://localhost:9000").unwrap();
        assert_eq!(store.server_url(), "http://localhost:9000");
    }

    #[test]
    fn test_blank_or_bad_override_is_ignored() {
        let store = SettingsStore::in_memory(ClientSettings::default())
            .with_server_override(Some("  ".to_string()))
            .with_server_override(Some("nonsense".to_string()));
        assert_eq!(store.server_url(), DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_reconnect_policy_from_settings() {
        let policy = ReconnectSettings::default().to_policy();
        assert_eq!(policy, ReconnectPolicy::default());

        let odd = ReconnectSettings {
            base_ms: 0,
            cap_ms: 0,
            jitter_ms: 10,
        }
        .to_policy();
        assert_eq!(odd.base, Duration::from_millis(1));
        assert_eq!(odd.cap, Duration::from_millis(1));
    }
}
