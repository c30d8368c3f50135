//! Receiver configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/dropline/receiver.toml`
//! - Windows: `%APPDATA%/dropline/receiver.toml`

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use dropline_protocol::PROTOCOL_VERSION;
use dropline_server::ServerConfig;
use dropline_transfer::TransferPolicy;
use serde::{Deserialize, Serialize};

/// Receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name shown to senders (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Interface to listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// TCP port (0 = auto-assign).
    #[serde(default)]
    pub port: u16,

    /// Where files go and what is accepted.
    #[serde(default = "default_transfer")]
    pub transfer: TransferPolicy,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Dropline Receiver".into())
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_transfer() -> TransferPolicy {
    TransferPolicy::with_storage(default_storage_dir())
}

fn default_storage_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join("Downloads").join("Dropline")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind_addr: default_bind_addr(),
            port: 0,
            transfer: default_transfer(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

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

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Server settings derived from this configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr,
            port: self.port,
            device_name: self.name.clone(),
            protocol_version: PROTOCOL_VERSION.into(),
            policy: self.transfer.clone(),
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("dropline").join("receiver.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("dropline")
            .join("receiver.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.name.is_empty());
        assert_eq!(config.port, 0);
        assert_eq!(config.transfer.allowed_extensions, vec!["zip".to_string()]);
        assert!(config.transfer.temp_dir().starts_with(&config.transfer.storage_dir));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
            name = "Den"
            port = 47000

            [transfer]
            storage_dir = "/srv/inbox"
            verify_checksum = true
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.name, "Den");
        assert_eq!(config.port, 47000);
        assert_eq!(config.bind_addr, default_bind_addr());
        assert_eq!(config.transfer.storage_dir, PathBuf::from("/srv/inbox"));
        assert!(config.transfer.verify_checksum);
        assert!(config.transfer.temp_dir().starts_with(&config.transfer.storage_dir));
        assert_eq!(config.transfer.max_chunk_size, TransferPolicy::default().max_chunk_size);
    }

    #[test]
    fn load_creates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("receiver.toml");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.name, created.name);
        assert_eq!(loaded.transfer, created.transfer);
    }

    #[test]
    fn server_config_carries_settings() {
        let config = Config {
            name: "Den".into(),
            port: 9000,
            ..Config::default()
        };
        let server = config.server_config();
        assert_eq!(server.device_name, "Den");
        assert_eq!(server.port, 9000);
        assert_eq!(server.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn config_path_not_empty() {
        assert!(config_path().to_string_lossy().contains("dropline"));
    }
}
