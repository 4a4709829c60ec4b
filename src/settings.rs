use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SettingsError;

pub const SETTINGS_FILE: &str = "nextdesk.toml";
pub const ENGINE_CONFIG_FILE: &str = "runtime_engine.yaml";
pub const CLIENT_CONFIG_FILE: &str = "client.multidesk";
pub const STATE_FILE: &str = "state.json";
pub const SUBSCRIPTION_FILE: &str = "subscription.txt";
pub const LOG_FILE: &str = "engine.log";
pub const BIN_DIR: &str = "bin";
pub const HOME_ENV: &str = "NEXTDESK_HOME";

/// Tunables read from `nextdesk.toml`. Every field has a default, so an
/// absent or partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Directory holding the bundled binaries; relative paths resolve
    /// against the data directory.
    pub bin_dir: PathBuf,
    pub engine_binary: String,
    pub client_binary: String,
    /// Control-API ports probed in order when looking for a running engine.
    pub control_ports: Vec<u16>,
    pub probe_timeout_ms: u64,
    /// SOCKS port assumed for a reused engine whose configuration can't be read.
    pub reuse_default_port: u16,
    pub bundled_http_port: u16,
    pub bundled_socks_port: u16,
    pub bundled_controller: String,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    pub group_keywords: Vec<String>,
    pub client_group_name: String,
    pub window_title: String,
    /// Window titles containing this marker get renamed to `window_title`.
    pub branding_marker: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from(BIN_DIR),
            engine_binary: format!("mihomo{}", std::env::consts::EXE_SUFFIX),
            client_binary: format!("MultiDesk{}", std::env::consts::EXE_SUFFIX),
            control_ports: vec![9090, 9097, 7890, 9091],
            probe_timeout_ms: 800,
            reuse_default_port: 7890,
            bundled_http_port: 17890,
            bundled_socks_port: 17897,
            bundled_controller: "127.0.0.1:17899".to_string(),
            fetch_timeout_secs: 15,
            user_agent: "clash-verge/v2.4.2".to_string(),
            group_keywords: vec!["server-".to_string(), "auto-".to_string()],
            client_group_name: "NextDesk".to_string(),
            window_title: "NextDesk".to_string(),
            branding_marker: "MultiDesk".to_string(),
        }
    }
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads `nextdesk.toml` from the data directory, falling back to the
    /// defaults when the file does not exist.
    pub fn load(data_dir: &Path) -> Result<Self, SettingsError> {
        let path = data_dir.join(SETTINGS_FILE);
        if !path.exists() {
            debug!("no settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(|source| SettingsError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&content)
    }
}

/// Resolved on-disk layout under one data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub engine_binary: PathBuf,
    pub client_binary: PathBuf,
    pub engine_config: PathBuf,
    pub client_config: PathBuf,
    pub state: PathBuf,
    /// Last body that loaded, so the engine config can be rebuilt after a
    /// restart.
    pub subscription: PathBuf,
    pub log: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>, settings: &Settings) -> Self {
        let data_dir = data_dir.into();
        let bin_dir = if settings.bin_dir.is_absolute() {
            settings.bin_dir.clone()
        } else {
            data_dir.join(&settings.bin_dir)
        };
        Self {
            engine_binary: bin_dir.join(&settings.engine_binary),
            client_binary: bin_dir.join(&settings.client_binary),
            engine_config: data_dir.join(ENGINE_CONFIG_FILE),
            client_config: data_dir.join(CLIENT_CONFIG_FILE),
            state: data_dir.join(STATE_FILE),
            subscription: data_dir.join(SUBSCRIPTION_FILE),
            log: data_dir.join(LOG_FILE),
            bin_dir,
            data_dir,
        }
    }
}

/// Data directory when none is given explicitly: `$NEXTDESK_HOME`, else
/// `.nextdesk` under the user's home.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(dir);
    }
    home_dir()
        .map(|home| home.join(".nextdesk"))
        .unwrap_or_else(|| PathBuf::from(".nextdesk"))
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    }
    #[cfg(not(windows))]
    {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}
