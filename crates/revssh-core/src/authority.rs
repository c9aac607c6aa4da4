//! Transport authority: where identity keys, trusted keys and host-trust
//! decisions come from.

use crate::error::{RevsshError, RevsshResult};
use crate::keys;
use crate::known_hosts::{self, KnownHosts};
use russh::keys::{PrivateKey, PublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Supplies keys and host-trust decisions to connection managers and
/// reverse clients.
pub trait TransportAuthority: Send + Sync {
    /// Private keys for this process's own identity (host keys on the server
    /// side, client keys on the reverse-client side).
    fn signers(&self) -> Vec<PrivateKey>;

    /// Locally trusted public keys.
    fn authorized_keys(&self) -> Vec<PublicKey>;

    /// Validate `key` for `hostname`, recording it on first use.
    fn is_known_host(
        &self,
        hostname: &str,
        remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> RevsshResult<()>;
}

// ── In-memory authority ─────────────────────────────────────────────

/// Authority holding everything in memory.
#[derive(Default)]
pub struct MemoryAuthority {
    signers: Vec<PrivateKey>,
    authorized: RwLock<Vec<PublicKey>>,
    known: Mutex<HashMap<String, PublicKey>>,
}

impl MemoryAuthority {
    pub fn new(signers: Vec<PrivateKey>) -> Self {
        Self {
            signers,
            ..Default::default()
        }
    }

    pub fn with_authorized_keys(self, keys: Vec<PublicKey>) -> Self {
        if let Ok(mut authorized) = self.authorized.write() {
            authorized.extend(keys);
        }
        self
    }

    pub fn authorize(&self, key: PublicKey) {
        if let Ok(mut authorized) = self.authorized.write() {
            authorized.push(key);
        }
    }

    /// Pre-seed a host record.
    pub fn trust_host(&self, hostname: &str, key: PublicKey) {
        if let Ok(mut known) = self.known.lock() {
            known.insert(known_hosts::normalize(hostname), key);
        }
    }

    pub fn known_host(&self, hostname: &str) -> Option<PublicKey> {
        self.known
            .lock()
            .ok()?
            .get(&known_hosts::normalize(hostname))
            .cloned()
    }
}

impl TransportAuthority for MemoryAuthority {
    fn signers(&self) -> Vec<PrivateKey> {
        self.signers.clone()
    }

    fn authorized_keys(&self) -> Vec<PublicKey> {
        self.authorized
            .read()
            .map(|keys| keys.clone())
            .unwrap_or_default()
    }

    fn is_known_host(
        &self,
        hostname: &str,
        _remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> RevsshResult<()> {
        let host = known_hosts::normalize(hostname);
        let mut known = self
            .known
            .lock()
            .map_err(|_| RevsshError::Other("known hosts lock poisoned".into()))?;
        match known.get(&host) {
            Some(stored) if keys::keys_equal(stored, key) => Ok(()),
            Some(_) => Err(RevsshError::HostKeyMismatch { host }),
            None => {
                known.insert(host, key.clone());
                Ok(())
            }
        }
    }
}

// ── File-backed authority ───────────────────────────────────────────

/// Authority backed by a configuration directory:
///
/// - `ssh_host_{ecdsa,ed25519,rsa}_key`: identity keys
/// - `authorized_keys`: trusted keys (re-read on every call)
/// - `known_hosts`: TOFU host records
pub struct FileAuthority {
    dir: PathBuf,
    known_hosts: KnownHosts,
    tofu: Mutex<()>,
}

impl FileAuthority {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let known_hosts = KnownHosts::new(dir.join("known_hosts"));
        Self {
            dir,
            known_hosts,
            tofu: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TransportAuthority for FileAuthority {
    fn signers(&self) -> Vec<PrivateKey> {
        keys::load_host_keys(&self.dir)
    }

    fn authorized_keys(&self) -> Vec<PublicKey> {
        let path = self.dir.join("authorized_keys");
        match std::fs::read_to_string(&path) {
            Ok(content) => keys::parse_authorized_keys(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read authorized_keys");
                Vec::new()
            }
        }
    }

    fn is_known_host(
        &self,
        hostname: &str,
        remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> RevsshResult<()> {
        let _guard = self
            .tofu
            .lock()
            .map_err(|_| RevsshError::Other("known hosts lock poisoned".into()))?;
        let result = self.known_hosts.check_and_record(hostname, key);
        match &result {
            Ok(()) => {}
            Err(RevsshError::HostKeyMismatch { host }) => warn!(
                host = %host,
                remote = ?remote,
                fingerprint = %keys::short_fingerprint(key),
                "host key mismatch"
            ),
            Err(e) => warn!(host = %hostname, error = %e, "known_hosts check failed"),
        }
        result
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Default configuration directory, `~/.config/revssh`.
pub fn default_config_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("revssh");
    info!(path = %dir.display(), "using default config directory");
    dir
}
