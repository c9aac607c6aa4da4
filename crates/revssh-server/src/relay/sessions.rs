//! Session binder: ties a connection's session id to the public key that
//! authenticated it.

use super::registry::ReverseClientRegistry;
use russh::keys::PublicKey;
use std::sync::Arc;

/// Per-connection view of the registry's session map.
#[derive(Clone)]
pub struct SessionBinder {
    registry: Arc<ReverseClientRegistry>,
    session_id: u64,
}

impl SessionBinder {
    pub fn new(registry: Arc<ReverseClientRegistry>, session_id: u64) -> Self {
        Self {
            registry,
            session_id,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Record the authenticating key. Called before authentication success
    /// is reported to the peer.
    pub async fn bind(&self, key: PublicKey) {
        self.registry.bind_session(self.session_id, key).await;
    }

    /// Key bound to this session, if authentication has completed.
    pub async fn key(&self) -> Option<PublicKey> {
        self.registry.session_key(self.session_id).await
    }

    pub async fn unbind(&self) -> bool {
        self.registry.unbind_session(self.session_id).await
    }
}
