//! Reverse client registry.
//!
//! Holds the registered reverse clients, keyed by lowercase hostname and
//! username, together with the session map binding each authenticated
//! connection to the key it used. Both live behind one lock so lookups never
//! observe a half-applied registration or teardown.

use revssh_core::keys;
use revssh_core::Tunnel;
use russh::keys::PublicKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A reverse client that registered a hostname.
#[derive(Clone)]
pub struct ReverseClientEntry {
    /// Registered hostname, lowercase.
    pub hostname: String,
    /// Username inbound clients must present to be routed here.
    pub username: String,
    /// Keys the reverse client accepts on its own nested server.
    pub keys: Vec<PublicKey>,
    /// Opens secondary streams on the reverse client's connection.
    pub tunnel: Arc<dyn Tunnel>,
    /// Connection that registered the entry.
    pub connection_id: u64,
    pub remote_addr: Option<SocketAddr>,
    pub registered_at: Instant,
}

impl std::fmt::Debug for ReverseClientEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseClientEntry")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("keys", &self.keys.len())
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl ReverseClientEntry {
    pub fn new(
        hostname: &str,
        username: &str,
        keys: Vec<PublicKey>,
        tunnel: Arc<dyn Tunnel>,
        connection_id: u64,
    ) -> Self {
        Self {
            hostname: hostname.to_lowercase(),
            username: username.to_string(),
            keys,
            tunnel,
            connection_id,
            remote_addr: None,
            registered_at: Instant::now(),
        }
    }

    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<(String, String), ReverseClientEntry>,
    sessions: HashMap<u64, PublicKey>,
}

/// Registry of reverse clients and authenticated sessions.
#[derive(Default)]
pub struct ReverseClientRegistry {
    state: RwLock<RegistryState>,
}

impl ReverseClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Reverse clients ──────────────────────────────────────────────

    /// Insert an entry, replacing any entry for the same hostname and
    /// username. Returns the replaced entry.
    pub async fn insert(&self, entry: ReverseClientEntry) -> Option<ReverseClientEntry> {
        let key = (entry.hostname.clone(), entry.username.clone());
        let connection_id = entry.connection_id;
        let mut state = self.state.write().await;
        let previous = state.clients.insert(key, entry);

        match &previous {
            Some(old) => info!(
                hostname = %old.hostname,
                username = %old.username,
                conn_id = connection_id,
                replaced_conn_id = old.connection_id,
                "reverse client re-registered, previous entry replaced"
            ),
            None => debug!(conn_id = connection_id, total = state.clients.len(), "reverse client stored"),
        }
        previous
    }

    /// Find the entry for `hostname` (case-insensitive) and `username`.
    pub async fn lookup(&self, hostname: &str, username: &str) -> Option<ReverseClientEntry> {
        let key = (hostname.to_lowercase(), username.to_string());
        self.state.read().await.clients.get(&key).cloned()
    }

    /// Keys registered by every reverse client accepting `username`.
    pub async fn keys_for_user(&self, username: &str) -> Vec<PublicKey> {
        self.state
            .read()
            .await
            .clients
            .values()
            .filter(|entry| entry.username == username)
            .flat_map(|entry| entry.keys.iter().cloned())
            .collect()
    }

    /// Remove every entry owned by `connection_id`. Entries that a newer
    /// connection has since replaced are left alone.
    pub async fn remove_connection(&self, connection_id: u64) -> usize {
        let mut state = self.state.write().await;
        let before = state.clients.len();
        state.clients.retain(|(hostname, username), entry| {
            let owned = entry.connection_id == connection_id;
            if owned {
                info!(hostname = %hostname, username = %username, conn_id = connection_id, "reverse client removed");
            }
            !owned
        });
        before - state.clients.len()
    }

    /// Snapshot of all registered reverse clients.
    pub async fn list(&self) -> Vec<ReverseClientEntry> {
        self.state.read().await.clients.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    // ── Sessions ─────────────────────────────────────────────────────

    pub(crate) async fn bind_session(&self, session_id: u64, key: PublicKey) {
        debug!(session_id, fingerprint = %keys::short_fingerprint(&key), "session bound");
        self.state.write().await.sessions.insert(session_id, key);
    }

    pub(crate) async fn session_key(&self, session_id: u64) -> Option<PublicKey> {
        self.state.read().await.sessions.get(&session_id).cloned()
    }

    pub(crate) async fn unbind_session(&self, session_id: u64) -> bool {
        self.state.write().await.sessions.remove(&session_id).is_some()
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}
