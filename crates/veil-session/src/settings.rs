//! Session settings
//!
//! Everything the orchestrator needs that outlives a process: where the
//! engine lives, where its config and the profile list are written, routing
//! preferences and system-proxy behaviour. Loaded once through a
//! [`SettingsStore`] when the session is built and saved back on change.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use veil_engine::{detect_platform, RoutingOptions};
use veil_profile::write_atomic;

/// HTTP port announced to the OS proxy settings alongside the mixed port
pub const DEFAULT_HTTP_PORT: u16 = 10809;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Engine executable
    pub engine_path: PathBuf,
    /// Working directory for the engine (geo data files live here)
    pub engine_working_dir: Option<PathBuf>,
    /// Where the compiled engine config is written before each connect
    pub config_path: PathBuf,
    /// Profile list (JSON array)
    pub profiles_path: PathBuf,
    /// Point the OS proxy settings at the mixed port once connected
    pub enable_system_proxy: bool,
    pub http_port: u16,
    /// Clear the OS proxy settings when the engine stops
    pub auto_disable_system_proxy: bool,
    /// Identifier of the selected profile
    pub selected_profile: Option<String>,
    /// Loopback address of the privileged TUN helper
    pub tun_helper_addr: Option<SocketAddr>,
    /// Shared secret sent with every helper request
    pub tun_helper_token: String,
    pub routing: RoutingOptions,
}

impl Default for Settings {
    fn default() -> Self {
        let runtime_dir = std::env::temp_dir().join("veil");
        Self {
            engine_path: PathBuf::from(detect_platform().engine_binary_name()),
            engine_working_dir: None,
            config_path: runtime_dir.join("config.json"),
            profiles_path: PathBuf::from("profiles.json"),
            enable_system_proxy: false,
            http_port: DEFAULT_HTTP_PORT,
            auto_disable_system_proxy: true,
            selected_profile: None,
            tun_helper_addr: None,
            tun_helper_token: String::new(),
            routing: RoutingOptions::default(),
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Where settings come from and go to
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings, SettingsError>;

    fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// TOML file on disk; a missing file loads as defaults
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            debug!("No settings at {}, using defaults", self.path.display());
            return Ok(Settings::default());
        }
        let text = std::fs::read_to_string(&self.path)?;
        let settings = Settings::from_toml(&text)?;
        info!("Loaded settings from {}", self.path.display());
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let text = settings.to_toml()?;
        write_atomic(&self.path, text.as_bytes())?;
        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store for embedding and tests
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    /// Last saved value
    pub fn current(&self) -> Settings {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.current())
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_engine::{DefaultPolicy, DEFAULT_API_PORT, DEFAULT_SOCKS_PORT};

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.routing.socks_port, DEFAULT_SOCKS_PORT);
        assert_eq!(settings.routing.api_port, Some(DEFAULT_API_PORT));
        assert_eq!(settings.routing.log_level, "warning");
        assert_eq!(settings.routing.default_policy, DefaultPolicy::Blacklist);
        assert!(!settings.routing.mux);
        assert!(!settings.routing.tun.enabled);
        assert!(!settings.enable_system_proxy);
        assert!(settings.auto_disable_system_proxy);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings = Settings::from_toml(
            r#"
engine_path = "/opt/xray/xray"
selected_profile = "abc"
tun_helper_addr = "127.0.0.1:47321"

[routing]
socks_port = 2080
default_policy = "whitelist"
direct_domains = ["example.com", "EXAMPLE.com", " lan "]
"#,
        )
        .unwrap();

        assert_eq!(settings.engine_path, PathBuf::from("/opt/xray/xray"));
        assert_eq!(settings.selected_profile.as_deref(), Some("abc"));
        assert_eq!(settings.routing.socks_port, 2080);
        assert_eq!(settings.routing.api_port, Some(DEFAULT_API_PORT));
        assert_eq!(settings.routing.default_policy, DefaultPolicy::Whitelist);
        assert_eq!(settings.routing.direct_domains.as_slice(), &["example.com", "lan"]);
        assert_eq!(settings.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(
            settings.tun_helper_addr,
            Some(SocketAddr::from(([127, 0, 0, 1], 47321)))
        );
        assert!(settings.tun_helper_token.is_empty());
    }

    #[test]
    fn test_toml_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlSettingsStore::new(dir.path().join("nested").join("veil.toml"));

        assert_eq!(store.load().unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.enable_system_proxy = true;
        settings.routing.mux = true;
        settings.routing.block_domains.add("ads.example");
        settings.tun_helper_addr = Some(SocketAddr::from(([127, 0, 0, 1], 47321)));
        settings.tun_helper_token = "secret".into();
        store.save(&settings).unwrap();

        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil.toml");
        std::fs::write(&path, "routing = 5").unwrap();

        assert!(matches!(
            TomlSettingsStore::new(&path).load(),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySettingsStore::default();
        let mut settings = store.load().unwrap();
        settings.selected_profile = Some("x".into());
        store.save(&settings).unwrap();
        assert_eq!(store.current().selected_profile.as_deref(), Some("x"));
    }
}
