use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

const APP_DIR: &str = "vlessmux";
const CONFIG_FILE: &str = "config.json";
const ENGINE_BINARY: &str = "xray";

pub const DEFAULT_SOCKS_PORT: u16 = 10808;
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub engine: EngineConfig,
    pub probe: ProbeConfig,
    pub remote: RemoteConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log to this file instead of the terminal.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub socks_port: u16,
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: None,
            config_path: None,
            socks_port: DEFAULT_SOCKS_PORT,
            ready_timeout_ms: 10_000,
            ready_poll_ms: 200,
            stop_grace_ms: 500,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn binary_path(&self) -> PathBuf {
        self.binary.clone().unwrap_or_else(find_engine_binary)
    }

    #[must_use]
    pub fn transient_config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| runtime_dir().join("engine.json"))
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    #[must_use]
    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms.max(10))
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_ms: 2_000 }
    }
}

impl ProbeConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Newline-delimited, Base64-per-line candidate list.
    pub url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub test_url: String,
    pub timeout_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            test_url: DEFAULT_TEST_URL.to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Root config directory: ~/.config/vlessmux/
#[must_use]
pub fn app_config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join(APP_DIR)
}

/// Data directory holding the bundled engine: ~/.local/share/vlessmux/
#[must_use]
pub fn app_data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share").join(APP_DIR)
}

/// Key-value slots: ~/.config/vlessmux/prefs/
#[must_use]
pub fn prefs_dir() -> PathBuf {
    app_config_dir().join("prefs")
}

/// Scratch space rewritten on every launch: $XDG_RUNTIME_DIR/vlessmux/
#[must_use]
pub fn runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join(APP_DIR),
        None => app_config_dir().join("run"),
    }
}

#[must_use]
pub fn config_file_path() -> PathBuf {
    app_config_dir().join(CONFIG_FILE)
}

fn xdg_dir(var: &str, home_relative: &str) -> PathBuf {
    if let Some(dir) = std::env::var_os(var) {
        PathBuf::from(dir)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(home_relative)
    } else {
        PathBuf::from("/tmp")
    }
}

fn find_engine_binary() -> PathBuf {
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        for candidate in [dir.join(ENGINE_BINARY), dir.join("bin").join(ENGINE_BINARY)] {
            if candidate.exists() {
                return candidate;
            }
        }
    }
    app_data_dir().join(ENGINE_BINARY)
}

/// Create `dir` (and parents) readable only by the current user.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Load `config.json`; missing or broken files fall back to defaults.
#[must_use]
pub fn load_config() -> AppConfig {
    load_config_from(&config_file_path())
}

#[must_use]
pub fn load_config_from(path: &Path) -> AppConfig {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AppConfig::default(),
        Err(e) => {
            tracing::warn!(path = ?path.display().to_string(), error = %e, "config_read_failed");
            return AppConfig::default();
        }
    };
    match serde_json::from_str(&json) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = ?path.display().to_string(), error = %e, "config_parse_failed");
            AppConfig::default()
        }
    }
}
