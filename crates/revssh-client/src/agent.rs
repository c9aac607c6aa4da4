//! Reverse client agent: dials the broker, registers a hostname and serves
//! every secondary stream the broker opens with an embedded SSH server.
//!
//! ```text
//! Disconnected → Connecting → Registering → Serving
//!       ↑             │             │           │
//!       └──── backoff ┴─────────────┴───────────┘
//! ```
//!
//! A missing identity key or a rejected registration stops the agent; every
//! other failure reconnects after a backoff delay. [`ReverseAgent::shutdown`]
//! disconnects from the broker and makes [`ReverseAgent::run`] return `Ok`.

use crate::backoff::{Backoff, BackoffConfig};
use crate::control::{send_request, SessionPinger};
use crate::keepalive::run_keepalive;
use revssh_core::protocol::{
    version_string, KEEPALIVE_INTERVAL, KEEPALIVE_MAX_FAILURES, REQUEST_REGISTRATION, VERSION,
};
use revssh_core::{
    keys, Dialer, RegistrationPayload, RevsshError, RevsshResult, Role, TcpDialer,
    TransportAuthority,
};
use revssh_server::{ConnectionManager, ConnectionSettings, ReverseClientRegistry};
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect, SshId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Agent connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Registering,
    Serving,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::Disconnected => "disconnected",
            AgentState::Connecting => "connecting",
            AgentState::Registering => "registering",
            AgentState::Serving => "serving",
        };
        f.write_str(name)
    }
}

/// Where to connect and who to register as.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Broker address, `host:port`.
    pub remote: String,
    /// Username to authenticate and register as.
    pub username: String,
    /// Hostname to claim on the broker.
    pub hostname: String,
    /// Implementation version sent in the identification string and the
    /// registration payload.
    pub version: String,
    pub keepalive_interval: Duration,
    pub keepalive_max_failures: u32,
    pub backoff: BackoffConfig,
}

impl AgentSettings {
    pub fn new(
        remote: impl Into<String>,
        username: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            remote: remote.into(),
            username: username.into(),
            hostname: hostname.into(),
            version: VERSION.to_string(),
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_max_failures: KEEPALIVE_MAX_FAILURES,
            backoff: BackoffConfig::default(),
        }
    }
}

/// The reverse client.
pub struct ReverseAgent {
    settings: AgentSettings,
    authority: Arc<dyn TransportAuthority>,
    dialer: Arc<dyn Dialer>,
    state: watch::Sender<AgentState>,
    shutdown: watch::Sender<bool>,
}

impl ReverseAgent {
    pub fn new(settings: AgentSettings, authority: Arc<dyn TransportAuthority>) -> Self {
        let (state, _) = watch::channel(AgentState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            authority,
            dialer: Arc::new(TcpDialer),
            state,
            shutdown,
        }
    }

    /// Dialer used by the embedded server for direct port forwards.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Watch state transitions.
    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Ask [`run`](Self::run) to disconnect and return.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(remote = %self.settings.remote, "agent shutting down");
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|stop| *stop).await;
    }

    fn set_state(&self, state: AgentState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "agent state changed");
        }
    }

    /// Connect, register and serve, reconnecting until a fatal error or
    /// [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> RevsshResult<()> {
        if self.settings.remote.is_empty() {
            return Err(RevsshError::Other("no remote specified".into()));
        }

        let mut backoff = Backoff::new(self.settings.backoff.clone());
        while !self.stopping() {
            self.set_state(AgentState::Connecting);
            let outcome = self.connect_once(&mut backoff).await;
            self.set_state(AgentState::Disconnected);
            if self.stopping() {
                break;
            }

            match outcome {
                Ok(()) => info!(remote = %self.settings.remote, "connection to broker lost"),
                Err(e) if e.is_fatal() => {
                    error!(remote = %self.settings.remote, error = %e, "giving up");
                    return Err(e);
                }
                Err(e) => warn!(remote = %self.settings.remote, error = %e, "connection failed"),
            }

            tokio::select! {
                delay = backoff.wait() => debug!(delay = ?delay, "reconnecting"),
                _ = self.stopped() => break,
            }
        }

        info!(remote = %self.settings.remote, "agent stopped");
        Ok(())
    }

    /// One connection lifetime. `Ok` means the broker went away after
    /// registration succeeded, or a shutdown was requested.
    async fn connect_once(&self, backoff: &mut Backoff) -> RevsshResult<()> {
        let signers = self.authority.signers();
        if signers.is_empty() {
            return Err(RevsshError::NoIdentityKey);
        }
        let nested = ConnectionManager::new(
            ConnectionSettings::new(Role::Nested),
            self.authority.clone(),
            Arc::new(ReverseClientRegistry::new()),
            self.dialer.clone(),
        )?;

        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let (handle, peer) = tokio::select! {
            established = self.establish(signers, forward_tx) => established?,
            _ = self.stopped() => return Ok(()),
        };
        let remote = &self.settings.remote;
        backoff.reset();
        info!(remote = %remote, peer = ?peer, user = %self.settings.username, "connected to broker");

        self.set_state(AgentState::Registering);
        let handle = Arc::new(handle);
        let target = SessionPinger::new(handle.clone());
        let interval = self.settings.keepalive_interval;
        let max_failures = self.settings.keepalive_max_failures;
        let mut keepalive = AbortOnDrop(tokio::spawn(async move {
            run_keepalive(&target, interval, max_failures).await
        }));

        let result = self
            .register_and_serve(&handle, &nested, forward_rx, &mut keepalive.0)
            .await;

        drop(keepalive);
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(remote = %remote, error = %e, "disconnect not sent");
        }
        result
    }

    /// Dial the broker, run the handshake and authenticate.
    async fn establish(
        &self,
        signers: Vec<russh::keys::PrivateKey>,
        forwards: mpsc::UnboundedSender<ForwardedStream>,
    ) -> RevsshResult<(Handle<AgentHandler>, Option<SocketAddr>)> {
        let remote = &self.settings.remote;
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|source| RevsshError::Dial {
                addr: remote.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();

        let handler = AgentHandler {
            remote: remote.clone(),
            peer,
            authority: self.authority.clone(),
            forwards,
        };
        let config = Arc::new(client::Config {
            client_id: SshId::Standard(version_string(&self.settings.version).into()),
            ..Default::default()
        });
        let mut handle = client::connect_stream(config, stream, handler).await?;
        self.authenticate(&mut handle, signers).await?;
        Ok((handle, peer))
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<AgentHandler>,
        signers: Vec<russh::keys::PrivateKey>,
    ) -> RevsshResult<()> {
        let user = &self.settings.username;
        for key in signers {
            let fingerprint = keys::short_fingerprint(key.public_key());
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            let result = handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await?;
            if result.success() {
                debug!(user = %user, fingerprint = %fingerprint, "authenticated");
                return Ok(());
            }
            debug!(user = %user, fingerprint = %fingerprint, "key not accepted");
        }
        Err(RevsshError::AuthFailed(format!("no key accepted for {user}")))
    }

    async fn register_and_serve(
        &self,
        handle: &Handle<AgentHandler>,
        nested: &Arc<ConnectionManager>,
        mut forwards: mpsc::UnboundedReceiver<ForwardedStream>,
        keepalive: &mut JoinHandle<RevsshError>,
    ) -> RevsshResult<()> {
        tokio::select! {
            registered = self.register(handle) => registered?,
            _ = self.stopped() => return Ok(()),
        }
        self.set_state(AgentState::Serving);

        loop {
            tokio::select! {
                _ = self.stopped() => {
                    debug!("leaving serve loop for shutdown");
                    return Ok(());
                }
                forward = forwards.recv() => {
                    let Some(forward) = forward else {
                        return Ok(());
                    };
                    debug!(
                        destination = %forward.destination,
                        originator = ?forward.originator,
                        "serving secondary stream"
                    );
                    nested.spawn(forward.channel.into_stream(), forward.originator);
                }
                outcome = &mut *keepalive => {
                    return Err(match outcome {
                        Ok(e) => e,
                        Err(e) => RevsshError::Other(format!("keepalive task: {e}")),
                    });
                }
            }
        }
    }

    async fn register(&self, handle: &Handle<AgentHandler>) -> RevsshResult<()> {
        let public_keys_hex = self
            .authority
            .authorized_keys()
            .iter()
            .filter_map(|key| keys::public_key_hex(key).ok())
            .collect::<Vec<_>>();
        let key_count = public_keys_hex.len();
        let payload = RegistrationPayload {
            protocol_version: self.settings.version.clone(),
            hostname: self.settings.hostname.clone(),
            username: self.settings.username.clone(),
            public_keys_hex,
        };

        let reply = send_request(handle, REQUEST_REGISTRATION, &payload.encode()).await?;
        if !reply.ok {
            error!(hostname = %self.settings.hostname, "reverse request rejected");
            return Err(RevsshError::RegistrationRejected);
        }
        info!(
            hostname = %self.settings.hostname,
            user = %self.settings.username,
            keys = key_count,
            broker_version = %String::from_utf8_lossy(&reply.payload),
            "registered with broker"
        );
        Ok(())
    }
}

/// Aborts the task when dropped, so cancelling [`ReverseAgent::run`] also
/// stops the keepalive task holding the connection open.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ── SSH client handler ──────────────────────────────────────────────

/// A secondary stream opened by the broker.
struct ForwardedStream {
    channel: Channel<Msg>,
    destination: String,
    originator: Option<SocketAddr>,
}

struct AgentHandler {
    remote: String,
    peer: Option<SocketAddr>,
    authority: Arc<dyn TransportAuthority>,
    forwards: mpsc::UnboundedSender<ForwardedStream>,
}

impl client::Handler for AgentHandler {
    type Error = RevsshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self
            .authority
            .is_known_host(&self.remote, self.peer, server_public_key)
        {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(remote = %self.remote, error = %e, "broker host key rejected");
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let forward = ForwardedStream {
            channel,
            destination: format!("{connected_address}:{connected_port}"),
            originator: format!("{originator_address}:{originator_port}").parse().ok(),
        };
        if self.forwards.send(forward).is_err() {
            debug!("secondary stream arrived after shutdown");
        }
        Ok(())
    }
}
