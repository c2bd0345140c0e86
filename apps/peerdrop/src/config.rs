//! Peer configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/peerdrop/peer.toml`
//! - Windows: `%APPDATA%/peerdrop/peer.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use peerdrop_session::SessionConfig;
use peerdrop_transfer::ReceiverConfig;
use serde::{Deserialize, Serialize};

/// Peer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Where received files are saved.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Root of the chunk ledger used to resume interrupted receives.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Stream incoming files straight into `download_dir` instead of the
    /// ledger. Direct transfers cannot resume.
    #[serde(default)]
    pub direct_download: bool,

    /// Ledger size limit in bytes (unlimited when absent).
    #[serde(default)]
    pub quota_bytes: Option<u64>,

    /// Heartbeat period in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// How long an offer waits for the peer to answer, in seconds.
    #[serde(default = "default_accept_timeout_secs")]
    pub accept_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:9470".into()
}

fn default_download_dir() -> String {
    "~/Downloads".into()
}

fn default_store_dir() -> String {
    "~/.local/share/peerdrop/chunks".into()
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_accept_timeout_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            download_dir: default_download_dir(),
            store_dir: default_store_dir(),
            direct_download: false,
            quota_bytes: None,
            heartbeat_secs: default_heartbeat_secs(),
            accept_timeout_secs: default_accept_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Loads configuration from `path`, creating a default there if missing.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn download_path(&self) -> PathBuf {
        expand_home(&self.download_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store_dir)
    }

    /// Session settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            accept_timeout: Duration::from_secs(self.accept_timeout_secs.max(1)),
            receiver: ReceiverConfig {
                download_dir: self.direct_download.then(|| self.download_path()),
                ..ReceiverConfig::default()
            },
        }
    }
}

/// Replaces a leading `~` with the home directory.
fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(rest.trim_start_matches(['/', '\\']))
        }
        None => PathBuf::from(path),
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("peerdrop")
            .join("peer.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("peerdrop").join("peer.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/peerdrop/peer.toml"))
    }
}
