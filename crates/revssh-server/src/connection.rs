//! Connection manager: runs the server side of an SSH handshake over any raw
//! transport and wires authentication, out-of-band requests and logical
//! streams to the relay and gateway components.
//!
//! The same manager serves TCP sockets on the broker and secondary streams
//! inside a reverse client ([`Role::Nested`]).

use crate::gateway::streams::{session_stub, SessionRequest, StubReply};
use crate::gateway::{spawn_relay, ForwardingEngine, StreamRouter};
use crate::relay::{RequestContext, RequestRouter, ReverseClientRegistry, SessionBinder};
use revssh_core::protocol::{
    version_string, FORWARD_OPEN_TIMEOUT, STREAM_DIRECT_STREAMLOCAL, STREAM_DIRECT_TCPIP,
    STREAM_FORWARDED_TCPIP, STREAM_SESSION, STREAM_X11, VERSION,
};
use revssh_core::{
    keys, BoxedStream, Dialer, ForwardRequest, RawTransport, RequestEnvelope, RevsshError,
    RevsshResult, Role, TransportAuthority, Tunnel,
};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet, SshId};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tunables for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub role: Role,
    /// Maximum authentication attempts per connection; 0 means unlimited.
    pub max_auth_tries: usize,
    /// Implementation version advertised in the identification string.
    pub version: String,
    /// Delay before answering a rejected authentication attempt.
    pub auth_rejection_time: Duration,
    /// Upper bound on opening the outbound side of a port forward. The
    /// connection handles no other messages while an open is pending.
    pub forward_timeout: Duration,
}

impl ConnectionSettings {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_auth_tries: 0,
            version: VERSION.to_string(),
            auth_rejection_time: Duration::from_secs(1),
            forward_timeout: FORWARD_OPEN_TIMEOUT,
        }
    }

    pub fn with_max_auth_tries(mut self, max_auth_tries: usize) -> Self {
        self.max_auth_tries = max_auth_tries;
        self
    }

    pub fn with_forward_timeout(mut self, forward_timeout: Duration) -> Self {
        self.forward_timeout = forward_timeout;
        self
    }

    fn russh_config(&self, host_keys: Vec<russh::keys::PrivateKey>) -> russh::server::Config {
        russh::server::Config {
            server_id: SshId::Standard(version_string(&self.version).into()),
            methods: MethodSet::from(&[MethodKind::PublicKey][..]),
            keys: host_keys,
            max_auth_attempts: match self.max_auth_tries {
                0 => usize::MAX,
                n => n,
            },
            auth_rejection_time: self.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        }
    }
}

/// Accepts raw transports and serves SSH on them.
pub struct ConnectionManager {
    role: Role,
    config: Arc<russh::server::Config>,
    authority: Arc<dyn TransportAuthority>,
    registry: Arc<ReverseClientRegistry>,
    requests: RequestRouter,
    streams: StreamRouter,
    forwarder: ForwardingEngine,
    next_id: AtomicU64,
}

impl ConnectionManager {
    /// Build a manager whose host keys are the authority's signers.
    pub fn new(
        settings: ConnectionSettings,
        authority: Arc<dyn TransportAuthority>,
        registry: Arc<ReverseClientRegistry>,
        dialer: Arc<dyn Dialer>,
    ) -> RevsshResult<Arc<Self>> {
        let host_keys = authority.signers();
        if host_keys.is_empty() {
            return Err(RevsshError::NoIdentityKey);
        }
        for key in &host_keys {
            debug!(
                role = %settings.role,
                algorithm = %key.algorithm(),
                fingerprint = %keys::short_fingerprint(key.public_key()),
                "host key loaded"
            );
        }

        Ok(Arc::new(Self {
            role: settings.role,
            config: Arc::new(settings.russh_config(host_keys)),
            requests: RequestRouter::new(settings.role, registry.clone(), authority.clone()),
            streams: StreamRouter,
            forwarder: ForwardingEngine::new(registry.clone(), dialer)
                .with_open_timeout(settings.forward_timeout),
            authority,
            registry,
            next_id: AtomicU64::new(1),
        }))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Arc<ReverseClientRegistry> {
        &self.registry
    }

    /// Serve one connection until it closes, then remove its session and
    /// any registry entries it owns.
    pub async fn serve<S>(self: Arc<Self>, stream: S, peer: Option<SocketAddr>) -> RevsshResult<()>
    where
        S: RawTransport + 'static,
    {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let binder = SessionBinder::new(self.registry.clone(), conn_id);
        debug!(conn_id, peer = ?peer, role = %self.role, "connection accepted");

        let handler = ConnectionHandler {
            manager: self.clone(),
            conn_id,
            peer,
            binder: binder.clone(),
            user: None,
        };

        let result = match russh::server::run_stream(self.config.clone(), stream, handler).await {
            Ok(session) => session.await,
            Err(e) => Err(e),
        };

        binder.unbind().await;
        let removed = self.registry.remove_connection(conn_id).await;
        info!(conn_id, peer = ?peer, removed, "connection closed");
        result
    }

    /// Serve a connection on its own task, logging how it ended.
    pub fn spawn<S>(self: &Arc<Self>, stream: S, peer: Option<SocketAddr>) -> JoinHandle<()>
    where
        S: RawTransport + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.serve(stream, peer).await {
                warn!(peer = ?peer, error = %e, "connection ended with error");
            }
        })
    }

    /// A key is accepted if it belongs to a reverse client registered for
    /// `user`, or to the authority's trusted set.
    async fn authorize(&self, user: &str, key: &PublicKey) -> bool {
        let registered = self.registry.keys_for_user(user).await;
        let authority = self.authority.clone();
        // authorized_keys is re-read from disk on every call
        let trusted = match tokio::task::spawn_blocking(move || authority.authorized_keys()).await {
            Ok(trusted) => trusted,
            Err(e) => {
                warn!(error = %e, "authorized keys lookup failed");
                Vec::new()
            }
        };
        // evaluate both sets unconditionally
        let by_registration = keys::contains_key(&registered, key);
        let by_authority = keys::contains_key(&trusted, key);
        by_registration | by_authority
    }
}

// ── Secondary streams ───────────────────────────────────────────────

/// Opens `forwarded-tcpip` channels on a live server-side connection.
#[derive(Clone)]
pub struct SshTunnel {
    handle: Handle,
}

impl SshTunnel {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Tunnel for SshTunnel {
    fn open_secondary<'a>(
        &'a self,
        request: &'a ForwardRequest,
    ) -> Pin<Box<dyn Future<Output = RevsshResult<BoxedStream>> + Send + 'a>> {
        Box::pin(async move {
            let channel = self
                .handle
                .channel_open_forwarded_tcpip(
                    request.destination_host.clone(),
                    request.destination_port,
                    request.originator_host.clone(),
                    request.originator_port,
                )
                .await
                .map_err(|e| RevsshError::SecondaryStream(e.to_string()))?;
            Ok(Box::new(channel.into_stream()) as BoxedStream)
        })
    }
}

// ── Per-connection handler ──────────────────────────────────────────

/// Replies are queued on the session; a failure means the channel or the
/// connection is already gone.
fn log_unsent<T, E>(result: Result<T, E>, conn_id: u64, channel: ChannelId, what: &'static str) {
    if result.is_err() {
        debug!(conn_id, channel = ?channel, reply = what, "reply not sent");
    }
}

struct ConnectionHandler {
    manager: Arc<ConnectionManager>,
    conn_id: u64,
    peer: Option<SocketAddr>,
    binder: SessionBinder,
    user: Option<String>,
}

impl ConnectionHandler {
    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("")
    }

    fn answer_stub(&self, channel: ChannelId, request: SessionRequest<'_>, session: &mut Session) {
        match session_stub(self.user(), &request) {
            StubReply::Greet(greeting) => {
                log_unsent(session.channel_success(channel), self.conn_id, channel, "success");
                log_unsent(
                    session.data(channel, CryptoVec::from_slice(greeting.as_bytes())),
                    self.conn_id,
                    channel,
                    "data",
                );
            }
            StubReply::Unimplemented => {
                log_unsent(session.channel_failure(channel), self.conn_id, channel, "failure");
            }
        }
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = RevsshError;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.manager.authorize(user, public_key).await {
            Ok(Auth::Accept)
        } else {
            debug!(conn_id = self.conn_id, user = %user, "offered key not acceptable");
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = keys::short_fingerprint(public_key);
        if !self.manager.authorize(user, public_key).await {
            warn!(
                conn_id = self.conn_id,
                peer = ?self.peer,
                user = %user,
                fingerprint = %fingerprint,
                "public key authentication rejected"
            );
            return Ok(Self::reject());
        }

        self.binder.bind(public_key.clone()).await;
        self.user = Some(user.to_string());
        info!(
            conn_id = self.conn_id,
            peer = ?self.peer,
            user = %user,
            fingerprint = %fingerprint,
            "public key authentication accepted"
        );
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.manager.streams.route(STREAM_SESSION).is_err() {
            return Ok(false);
        }
        debug!(conn_id = self.conn_id, channel = ?channel.id(), "session stream opened");
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.manager.streams.route(STREAM_DIRECT_TCPIP).is_err() {
            return Ok(false);
        }

        let request = ForwardRequest::new(
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        );
        let user = self.user().to_string();
        match self.manager.forwarder.connect(&request, &user).await {
            Ok((route, outbound)) => {
                debug!(conn_id = self.conn_id, route = ?route, "forward established");
                spawn_relay(
                    Box::new(channel.into_stream()),
                    outbound,
                    request.destination(),
                );
                Ok(true)
            }
            Err(e) => {
                warn!(
                    conn_id = self.conn_id,
                    destination = %request.destination(),
                    user = %user,
                    error = %e,
                    "port forward rejected"
                );
                Ok(false)
            }
        }
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let reason = self.manager.streams.route(STREAM_FORWARDED_TCPIP).err();
        debug!(
            conn_id = self.conn_id,
            destination = %format!("{host_to_connect}:{port_to_connect}"),
            reason = ?reason,
            "inbound forwarded-tcpip refused"
        );
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let reason = self.manager.streams.route(STREAM_X11).err();
        debug!(
            conn_id = self.conn_id,
            originator = %format!("{originator_address}:{originator_port}"),
            reason = ?reason,
            "x11 stream refused"
        );
        Ok(false)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let reason = self.manager.streams.route(STREAM_DIRECT_STREAMLOCAL).err();
        debug!(
            conn_id = self.conn_id,
            socket_path = %socket_path,
            reason = ?reason,
            "streamlocal forward refused"
        );
        Ok(false)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_stub(channel, SessionRequest::Shell, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(envelope) = RequestEnvelope::decode(data) else {
            self.answer_stub(channel, SessionRequest::Exec(data), session);
            return Ok(());
        };

        let ctx = RequestContext {
            binder: &self.binder,
            remote_addr: self.peer,
            tunnel: Arc::new(SshTunnel::new(session.handle())),
        };
        let reply = self
            .manager
            .requests
            .dispatch(&envelope.request_type, &envelope.payload, ctx)
            .await;

        let conn_id = self.conn_id;
        if !reply.payload.is_empty() {
            log_unsent(
                session.data(channel, CryptoVec::from_slice(&reply.payload)),
                conn_id,
                channel,
                "data",
            );
        }
        if reply.ok {
            log_unsent(session.channel_success(channel), conn_id, channel, "success");
        } else {
            log_unsent(session.channel_failure(channel), conn_id, channel, "failure");
        }
        log_unsent(session.eof(channel), conn_id, channel, "eof");
        log_unsent(session.close(channel), conn_id, channel, "close");
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_stub(channel, SessionRequest::Pty, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_stub(channel, SessionRequest::Subsystem(name), session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_stub(channel, SessionRequest::Env, session);
        Ok(())
    }
}
