//! Stream router: decides which logical stream types a connection accepts
//! and implements the interactive-session stub.

use revssh_core::{RevsshError, RevsshResult, StreamKind};
use tracing::{debug, warn};

/// Classifies stream-open requests by type.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamRouter;

impl StreamRouter {
    /// Accept or reject a stream-open by type, before any handler runs.
    pub fn route(&self, stream_type: &str) -> RevsshResult<StreamKind> {
        match StreamKind::parse(stream_type) {
            Some(kind) => {
                debug!(stream_type = %stream_type, "stream accepted");
                Ok(kind)
            }
            None => {
                warn!(stream_type = %stream_type, "unsupported stream type");
                Err(RevsshError::UnsupportedStream(stream_type.to_string()))
            }
        }
    }
}

/// Sub-requests arriving on an interactive session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest<'a> {
    Shell,
    Pty,
    Exec(&'a [u8]),
    Subsystem(&'a str),
    Env,
}

/// What the stub answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubReply {
    /// Succeed and write the greeting to the stream.
    Greet(String),
    /// Reject as unimplemented.
    Unimplemented,
}

/// Interactive-session stub: greets a shell request, rejects the rest.
pub fn session_stub(user: &str, request: &SessionRequest<'_>) -> StubReply {
    match request {
        SessionRequest::Shell => StubReply::Greet(format!("Welcome to {user}\n\r")),
        other => {
            debug!(user = %user, request = ?other, "session request not implemented");
            StubReply::Unimplemented
        }
    }
}
