//! Broker configuration: TOML file + CLI overrides.

use revssh_core::{expand_tilde, RevsshError, RevsshResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub max_auth_tries: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            max_auth_tries: 0,
        }
    }
}

fn default_listen() -> String {
    ":22".to_string()
}
fn default_path() -> String {
    "~/.config/revssh".to_string()
}

/// Resolved broker configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:22`.
    pub listen: String,
    /// Directory holding host keys, `authorized_keys` and `known_hosts`.
    pub path: PathBuf,
    /// 0 means unlimited.
    pub max_auth_tries: usize,
}

impl ServerConfig {
    /// Load config from a TOML file (if present), then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_path: Option<&str>,
        cli_max_auth_tries: Option<usize>,
    ) -> RevsshResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RevsshError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let listen = cli_listen
            .map(str::to_string)
            .unwrap_or(file_config.server.listen);
        let path = cli_path
            .map(str::to_string)
            .unwrap_or(file_config.server.path);

        Ok(Self {
            listen: normalize_listen(&listen),
            path: expand_tilde(&path),
            max_auth_tries: cli_max_auth_tries.unwrap_or(file_config.server.max_auth_tries),
        })
    }
}

/// `:22` → `0.0.0.0:22`; anything else is used as given.
pub fn normalize_listen(listen: &str) -> String {
    match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    }
}
