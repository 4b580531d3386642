//! Daemon configuration
//!
//! Loads and resolves `$HOME/.arca/config.json`, ensuring the on-disk
//! directory layout described in the daemon's persistent state contract
//! exists before any other subsystem touches it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which network driver backs networks that don't name one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkBackendKind {
    Overlay,
    Native,
}

impl Default for NetworkBackendKind {
    fn default() -> Self {
        NetworkBackendKind::Overlay
    }
}

impl std::fmt::Display for NetworkBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkBackendKind::Overlay => write!(f, "overlay"),
            NetworkBackendKind::Native => write!(f, "native"),
        }
    }
}

/// Top-level daemon configuration, deserialized from `config.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Configuration {
    /// Default network driver; individual networks may override via `driver`.
    #[serde(default, rename = "networkBackend")]
    pub network_backend: NetworkBackendKind,

    /// Path to the guest kernel image used to boot container VMs.
    #[serde(rename = "kernelPath")]
    pub kernel_path: PathBuf,

    /// Host socket path exposing the HTTP API.
    #[serde(default = "default_socket_path", rename = "socketPath")]
    pub socket_path: PathBuf,

    /// `debug` / `info` / `warn` / `error`.
    #[serde(default = "default_log_level", rename = "logLevel")]
    pub log_level: String,

    /// Root directory for all daemon-owned state (not itself serialized;
    /// derived from the config file's location).
    #[serde(skip)]
    pub root_directory: PathBuf,

    #[serde(skip)]
    pub state_db_path: PathBuf,

    #[serde(skip)]
    pub exit_wal_path: PathBuf,

    #[serde(skip)]
    pub volumes_directory: PathBuf,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/arca.sock")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Configuration {
    /// Load configuration from the given path, resolving derived paths
    /// relative to the config file's parent directory and creating the
    /// directories the daemon expects to already exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: Configuration = serde_json::from_str(&content)
            .with_context(|| "failed to parse configuration")?;

        let root_directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        config.resolve_paths(root_directory);
        config.ensure_directories()?;

        Ok(config)
    }

    /// Load from the default location, `$HOME/.arca/config.json`, creating
    /// a minimal default configuration on first run.
    pub fn load_default(kernel_path: PathBuf) -> Result<Self> {
        let home = dirs_home()?;
        let root_directory = home.join(".arca");
        let config_path = root_directory.join("config.json");

        if !config_path.exists() {
            std::fs::create_dir_all(&root_directory)?;
            let defaults = Configuration {
                network_backend: NetworkBackendKind::default(),
                kernel_path,
                socket_path: default_socket_path(),
                log_level: default_log_level(),
                root_directory: root_directory.clone(),
                state_db_path: PathBuf::new(),
                exit_wal_path: PathBuf::new(),
                volumes_directory: PathBuf::new(),
            };
            std::fs::write(&config_path, serde_json::to_string_pretty(&defaults)?)
                .with_context(|| "failed to write default config.json")?;
        }

        Self::load(config_path)
    }

    fn resolve_paths(&mut self, root_directory: PathBuf) {
        self.state_db_path = root_directory.join("state.db");
        self.exit_wal_path = root_directory.join("exit-wal.log");
        self.volumes_directory = root_directory.join("volumes");
        self.root_directory = root_directory;
    }

    fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_directory)?;
        std::fs::create_dir_all(&self.volumes_directory)?;
        Ok(())
    }
}

fn dirs_home() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .context("HOME environment variable not set")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_and_resolves_paths() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"kernelPath": "/boot/vmlinux"}"#,
        )
        .unwrap();

        let config = Configuration::load(&config_path).unwrap();
        assert_eq!(config.network_backend, NetworkBackendKind::Overlay);
        assert_eq!(config.state_db_path, dir.path().join("state.db"));
        assert_eq!(config.exit_wal_path, dir.path().join("exit-wal.log"));
        assert!(config.volumes_directory.ends_with("volumes"));
    }

    #[test]
    fn native_backend_parses() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"kernelPath": "/boot/vmlinux", "networkBackend": "native", "logLevel": "debug"}"#,
        )
        .unwrap();

        let config = Configuration::load(&config_path).unwrap();
        assert_eq!(config.network_backend, NetworkBackendKind::Native);
        assert_eq!(config.log_level, "debug");
    }
}
