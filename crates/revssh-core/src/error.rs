use thiserror::Error;

/// Errors produced by the revssh broker and reverse client.
#[derive(Debug, Error)]
pub enum RevsshError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("key not found")]
    NoIdentityKey,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("host key mismatch for {host}")]
    HostKeyMismatch { host: String },

    #[error("reverse request rejected")]
    RegistrationRejected,

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("unsupported stream type: {0}")]
    UnsupportedStream(String),

    #[error("no session bound to connection {0}")]
    SessionNotFound(u64),

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("secondary stream open failed: {0}")]
    SecondaryStream(String),

    #[error("keepalive failed {0} times")]
    KeepaliveExhausted(u32),

    #[error("timeout")]
    Timeout,

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("key error: {0}")]
    Keys(#[from] russh::keys::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RevsshError {
    /// Whether a reverse client should stop instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RevsshError::NoIdentityKey | RevsshError::RegistrationRejected)
    }
}

pub type RevsshResult<T> = Result<T, RevsshError>;
