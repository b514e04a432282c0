//! Host Configuration
//!
//! Settings for the `framelink-host` binary, loaded from an explicit path
//! or the XDG config directory. Engine components take their own explicit
//! config structs at construction; nothing here is a process-wide global.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::server::ServerConfig;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Name reported in the `initialize` response.
    pub name: Option<String>,
    pub request_timeout_secs: u64,
    pub parent_poll_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: None,
            request_timeout_secs: 30,
            parent_poll_secs: 3,
        }
    }
}

impl HostConfig {
    /// Load settings from `path`, or fall back to
    /// `$XDG_CONFIG_HOME/framelink/config.toml` (then `~/.config/...`).
    /// A missing file yields the defaults; a malformed one is logged and
    /// ignored.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("ignoring malformed config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            name: self.server.name.clone().unwrap_or(defaults.name),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
            parent_poll: Duration::from_secs(self.server.parent_poll_secs),
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|d| d.join("framelink/config.toml"))
        .filter(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_file_absent() {
        let config = HostConfig::load(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config.server.request_timeout_secs, 30);
        assert!(config.server.name.is_none());
    }

    #[test]
    fn test_partial_config_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nname = \"robot-ls\"").unwrap();

        let config = HostConfig::load(Some(file.path()));
        assert_eq!(config.server.name.as_deref(), Some("robot-ls"));
        assert_eq!(config.server.parent_poll_secs, 3);
    }

    #[test]
    fn test_server_config_applies_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nname = \"picker\"\nrequest_timeout_secs = 5\nparent_poll_secs = 1"
        )
        .unwrap();

        let server = HostConfig::load(Some(file.path())).server_config();
        assert_eq!(server.name, "picker");
        assert_eq!(server.request_timeout, Duration::from_secs(5));
        assert_eq!(server.parent_poll, Duration::from_secs(1));
    }

    #[test]
    fn test_malformed_config_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not toml [[").unwrap();

        let config = HostConfig::load(Some(file.path()));
        assert_eq!(config.server.request_timeout_secs, 30);
    }
}
