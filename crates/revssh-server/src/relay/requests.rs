//! Request router: dispatches out-of-band requests arriving on an
//! authenticated connection.
//!
//! Every role answers keepalives. Only the broker role handles
//! registrations; anything else gets a failure reply and changes nothing.

use super::registry::{ReverseClientEntry, ReverseClientRegistry};
use super::sessions::SessionBinder;
use revssh_core::protocol::{DEFAULT_SSH_PORT, REPLY_VERSION};
use revssh_core::{
    keys, RegistrationPayload, Reply, RequestKind, RevsshError, RevsshResult, Role,
    TransportAuthority, Tunnel,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-request view of the connection a request arrived on.
pub struct RequestContext<'a> {
    pub binder: &'a SessionBinder,
    pub remote_addr: Option<SocketAddr>,
    /// Handle the registry keeps for opening secondary streams.
    pub tunnel: Arc<dyn Tunnel>,
}

pub struct RequestRouter {
    role: Role,
    registry: Arc<ReverseClientRegistry>,
    authority: Arc<dyn TransportAuthority>,
}

impl RequestRouter {
    pub fn new(
        role: Role,
        registry: Arc<ReverseClientRegistry>,
        authority: Arc<dyn TransportAuthority>,
    ) -> Self {
        Self {
            role,
            registry,
            authority,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Handle one request and produce the reply for the peer.
    pub async fn dispatch(
        &self,
        request_type: &str,
        payload: &[u8],
        ctx: RequestContext<'_>,
    ) -> Reply {
        let kind = RequestKind::parse(request_type).filter(|kind| self.role.accepts(*kind));
        match kind {
            Some(RequestKind::Keepalive) => Reply::success(Vec::new()),
            Some(RequestKind::Registration) => self.register(payload, ctx).await,
            None => {
                warn!(
                    session_id = ctx.binder.session_id(),
                    request_type = %request_type,
                    role = %self.role,
                    "unknown request type"
                );
                Reply::failure(format!("unknown request type: {request_type}"))
            }
        }
    }

    async fn register(&self, payload: &[u8], ctx: RequestContext<'_>) -> Reply {
        let session_id = ctx.binder.session_id();
        match self.try_register(payload, ctx).await {
            Ok(entry) => {
                info!(
                    session_id,
                    hostname = %entry.hostname,
                    username = %entry.username,
                    keys = entry.keys.len(),
                    "reverse client registered"
                );
                Reply::success(REPLY_VERSION)
            }
            Err(e) => {
                warn!(session_id, error = %e, "reverse client registration rejected");
                Reply::failure(REPLY_VERSION)
            }
        }
    }

    async fn try_register(
        &self,
        payload: &[u8],
        ctx: RequestContext<'_>,
    ) -> RevsshResult<ReverseClientEntry> {
        let data = RegistrationPayload::decode(payload)?;
        debug!(
            hostname = %data.hostname,
            username = %data.username,
            version = %data.protocol_version,
            "registration received"
        );

        let session_id = ctx.binder.session_id();
        let session_key = ctx
            .binder
            .key()
            .await
            .ok_or(RevsshError::SessionNotFound(session_id))?;

        // known_hosts lookups may touch the filesystem
        let authority = self.authority.clone();
        let target = format!("{}:{}", data.hostname, DEFAULT_SSH_PORT);
        let remote_addr = ctx.remote_addr;
        tokio::task::spawn_blocking(move || {
            authority.is_known_host(&target, remote_addr, &session_key)
        })
        .await
        .map_err(|e| RevsshError::Other(format!("host key check failed: {e}")))??;

        let accepted = keys::public_keys_from_hex(&data.public_keys_hex);
        if accepted.len() < data.public_keys_hex.len() {
            debug!(
                skipped = data.public_keys_hex.len() - accepted.len(),
                "ignored undecodable keys in registration"
            );
        }

        let entry = ReverseClientEntry::new(
            &data.hostname,
            &data.username,
            accepted,
            ctx.tunnel,
            session_id,
        )
        .with_remote_addr(ctx.remote_addr);
        self.registry.insert(entry.clone()).await;
        Ok(entry)
    }
}
