//! Protocol constants and the closed sets of request, stream and role kinds.

use std::time::Duration;

/// Identification string prefix required by RFC 4253 §4.2.
pub const SSH_VERSION_PREFIX: &str = "SSH-2.0-";

/// Implementation version token advertised in the identification string.
pub const VERSION: &str = concat!("revssh-", env!("CARGO_PKG_VERSION"));

/// Payload tag carried by registration replies.
pub const REPLY_VERSION: &str = "v1";

/// Out-of-band request a reverse client sends to claim a hostname.
pub const REQUEST_REGISTRATION: &str = "reverse-client";

/// Out-of-band liveness check.
pub const REQUEST_KEEPALIVE: &str = "keepalive@openssh.com";

/// Interactive session stream type.
pub const STREAM_SESSION: &str = "session";

/// Port-forward stream type (RFC 4254 §7.2).
pub const STREAM_DIRECT_TCPIP: &str = "direct-tcpip";

/// Secondary stream type the broker opens back toward a reverse client.
pub const STREAM_FORWARDED_TCPIP: &str = "forwarded-tcpip";

/// X11 forwarding stream type; never accepted.
pub const STREAM_X11: &str = "x11";

/// OpenSSH Unix-socket forward stream type; never accepted.
pub const STREAM_DIRECT_STREAMLOCAL: &str = "direct-streamlocal@openssh.com";

/// Default port assumed when a hostname is checked against known hosts.
pub const DEFAULT_SSH_PORT: u16 = 22;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const KEEPALIVE_MAX_FAILURES: u32 = 5;

/// Upper bound on opening the outbound side of a forward (direct dial or
/// secondary stream). The connection's event loop waits on it.
pub const FORWARD_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub const BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Build the identification string for `version`, adding the `SSH-2.0-`
/// prefix unless it is already present.
pub fn version_string(version: &str) -> String {
    let version = if version.is_empty() { VERSION } else { version };
    if version.starts_with(SSH_VERSION_PREFIX) {
        version.to_string()
    } else {
        format!("{SSH_VERSION_PREFIX}{version}")
    }
}

// ── Request kinds ───────────────────────────────────────────────────

/// Broker-level out-of-band requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Keepalive,
    Registration,
}

impl RequestKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            REQUEST_KEEPALIVE => Some(Self::Keepalive),
            REQUEST_REGISTRATION => Some(Self::Registration),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keepalive => REQUEST_KEEPALIVE,
            Self::Registration => REQUEST_REGISTRATION,
        }
    }
}

// ── Stream kinds ────────────────────────────────────────────────────

/// Logical stream types a connection accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Session,
    DirectTcpip,
}

impl StreamKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            STREAM_SESSION => Some(Self::Session),
            STREAM_DIRECT_TCPIP => Some(Self::DirectTcpip),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => STREAM_SESSION,
            Self::DirectTcpip => STREAM_DIRECT_TCPIP,
        }
    }
}

// ── Roles ───────────────────────────────────────────────────────────

/// Role a connection manager plays.
///
/// The broker accepts registrations; the server embedded in a reverse client
/// (serving secondary streams) does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Broker,
    Nested,
}

impl Role {
    /// Whether connections in this role handle the given request kind.
    pub fn accepts(self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Keepalive => true,
            RequestKind::Registration => self == Role::Broker,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Broker => f.write_str("broker"),
            Role::Nested => f.write_str("nested"),
        }
    }
}

// ── Replies ─────────────────────────────────────────────────────────

/// Outcome of an out-of-band request, as seen by both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn success(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            ok: true,
            payload: payload.into(),
        }
    }

    pub fn failure(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            ok: false,
            payload: payload.into(),
        }
    }
}
