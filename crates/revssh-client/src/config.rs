//! Agent configuration: TOML file + CLI overrides.
//!
//! ```toml
//! [agent]
//! remote = "bastion.example.com:22"
//! user = "alice"
//! hostname = "box1"
//! path = "~/.config/revssh"
//! ```

use revssh_core::{expand_tilde, RevsshError, RevsshResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_REMOTE: &str = "127.0.0.1:2222";
const FALLBACK_HOSTNAME: &str = "revssh";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
}

/// `[agent]` section. Unset keys fall back to runtime defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSection {
    pub remote: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub path: Option<String>,
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub remote: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub path: Option<String>,
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub remote: String,
    pub user: String,
    pub hostname: String,
    /// Directory holding identity keys, `authorized_keys` and `known_hosts`.
    pub path: PathBuf,
}

impl AgentConfig {
    /// Load config from a TOML file (if present), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> RevsshResult<Self> {
        let file = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RevsshError::Other(format!("config parse error: {e}")))?
                } else {
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        let section = file.agent;

        let path = cli
            .path
            .or(section.path)
            .unwrap_or_else(|| "~/.config/revssh".to_string());

        Ok(Self {
            remote: cli
                .remote
                .or(section.remote)
                .unwrap_or_else(|| DEFAULT_REMOTE.to_string()),
            user: cli.user.or(section.user).unwrap_or_else(current_user),
            hostname: cli
                .hostname
                .or(section.hostname)
                .unwrap_or_else(system_hostname),
            path: expand_tilde(&path),
        })
    }
}

/// Login name of the current user.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "revssh".to_string())
}

/// System hostname, or `revssh` when it cannot be determined.
pub fn system_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}
