//! Unified configuration (figment-deserialized from defaults / hypha.toml /
//! env vars).
//!
//! Three equivalent ways to configure:
//!
//!   hypha.toml:      [sessions]
//!                    evict_idle = true
//!
//!   env var:         HYPHA_SESSIONS__EVICT_IDLE=true   (double underscore = nesting)
//!
//!   CLI flags:       merged on top by main (flags win)

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub swarm: SwarmFileConfig,
    #[serde(default)]
    pub rendezvous: RendezvousFileConfig,
    #[serde(default)]
    pub overlay: OverlayFileConfig,
    #[serde(default)]
    pub sessions: SessionsFileConfig,
}

/// Web server knobs (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// TCP swarm knobs (lives under `[swarm]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwarmFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_swarm_port")]
    pub port: u16,
}

impl Default for SwarmFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_swarm_port(),
        }
    }
}

/// Rendezvous hub for browser-to-browser peers (lives under `[rendezvous]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RendezvousFileConfig {
    #[serde(default)]
    pub url: Option<String>,
}

/// Control-message overlay knobs (lives under `[overlay]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayFileConfig {
    /// Evict seen message digests older than this many seconds; 0 keeps
    /// them forever (matches short-lived nodes).
    #[serde(default = "default_message_window_secs")]
    pub message_window_secs: u64,
}

impl Default for OverlayFileConfig {
    fn default() -> Self {
        Self {
            message_window_secs: default_message_window_secs(),
        }
    }
}

impl OverlayFileConfig {
    pub fn message_window(&self) -> Option<Duration> {
        (self.message_window_secs > 0).then(|| Duration::from_secs(self.message_window_secs))
    }
}

/// Session lifecycle knobs (lives under `[sessions]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionsFileConfig {
    /// Close a session when its last transport detaches. Off by default:
    /// a relay keeps sessions open for reconnecting peers.
    #[serde(default)]
    pub evict_idle: bool,
}

impl Default for SessionsFileConfig {
    fn default() -> Self {
        Self { evict_idle: false }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8440
}

fn default_swarm_port() -> u16 {
    8441
}

fn default_true() -> bool {
    true
}

fn default_message_window_secs() -> u64 {
    3600
}

/// Load configuration: defaults, then the config file (if any), then
/// `HYPHA_*` env vars.
pub fn load(path: Option<&Path>) -> Result<FileConfig> {
    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    figment = match path {
        Some(path) => figment.merge(Toml::file(path)),
        None => figment.merge(Toml::file("hypha.toml")),
    };
    figment
        .merge(Env::prefixed("HYPHA_").split("__"))
        .extract()
        .context("failed to load configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = FileConfig::default();
        assert_eq!(config.server.port, 8440);
        assert_eq!(config.swarm.port, 8441);
        assert!(config.swarm.enabled);
        assert!(!config.sessions.evict_idle);
        assert_eq!(
            config.overlay.message_window(),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn zero_window_means_unbounded() {
        let config = OverlayFileConfig {
            message_window_secs: 0,
        };
        assert_eq!(config.message_window(), None);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nport = 9000\n\n[sessions]\nevict_idle = true"
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(config.sessions.evict_idle);
        // Untouched sections keep their defaults.
        assert_eq!(config.swarm.port, 8441);
    }
}
