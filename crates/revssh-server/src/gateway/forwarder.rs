//! Forwarding engine: connects a port-forward request to its destination
//! and relays bytes.
//!
//! A destination that matches a registered reverse client (by hostname and
//! the requester's username) is reached through a secondary stream on that
//! client's connection. Anything else is dialed directly. A failed
//! secondary open never falls back to a direct dial. Both kinds of open are
//! bounded by the engine's open timeout.

use crate::relay::ReverseClientRegistry;
use revssh_core::protocol::FORWARD_OPEN_TIMEOUT;
use revssh_core::{BoxedStream, Dialer, ForwardRequest, RevsshError, RevsshResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RELAY_BUFFER: usize = 16 * 1024;

/// How a forward was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Reverse { hostname: String, connection_id: u64 },
}

pub struct ForwardingEngine {
    registry: Arc<ReverseClientRegistry>,
    dialer: Arc<dyn Dialer>,
    open_timeout: Duration,
}

impl ForwardingEngine {
    pub fn new(registry: Arc<ReverseClientRegistry>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            registry,
            dialer,
            open_timeout: FORWARD_OPEN_TIMEOUT,
        }
    }

    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    /// Open the outbound side of a forward for `username`.
    pub async fn connect(
        &self,
        request: &ForwardRequest,
        username: &str,
    ) -> RevsshResult<(Route, BoxedStream)> {
        match self.registry.lookup(&request.destination_host, username).await {
            Some(entry) => {
                info!(
                    destination = %request.destination(),
                    user = %username,
                    conn_id = entry.connection_id,
                    "forwarding through reverse client"
                );
                let stream = self
                    .bounded(entry.tunnel.open_secondary(request))
                    .await
                    .map_err(|e| {
                        warn!(hostname = %entry.hostname, error = %e, "secondary stream open failed");
                        match e {
                            RevsshError::SecondaryStream(_) => e,
                            other => RevsshError::SecondaryStream(other.to_string()),
                        }
                    })?;
                Ok((
                    Route::Reverse {
                        hostname: entry.hostname,
                        connection_id: entry.connection_id,
                    },
                    stream,
                ))
            }
            None => {
                let port = request.port()?;
                debug!(destination = %request.destination(), user = %username, "dialing directly");
                let stream = self
                    .bounded(self.dialer.dial(&request.destination_host, port))
                    .await
                    .inspect_err(|e| warn!(destination = %request.destination(), error = %e, "direct dial failed"))?;
                info!(destination = %request.destination(), user = %username, "forwarding directly");
                Ok((Route::Direct, stream))
            }
        }
    }

    async fn bounded<F>(&self, open: F) -> RevsshResult<BoxedStream>
    where
        F: Future<Output = RevsshResult<BoxedStream>>,
    {
        match tokio::time::timeout(self.open_timeout, open).await {
            Ok(result) => result,
            Err(_) => Err(RevsshError::Timeout),
        }
    }
}

// ── Relay ────────────────────────────────────────────────────────────

/// Which side ended the relay first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub closed_by: ClosedBy,
    /// Bytes copied from the inbound stream to the outbound one.
    pub bytes_out: u64,
    /// Bytes copied from the outbound stream back to the inbound one.
    pub bytes_in: u64,
}

/// Copy bytes both ways until either direction ends, then shut both
/// streams down.
pub async fn relay(inbound: BoxedStream, outbound: BoxedStream, destination: &str) -> RelayStats {
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);
    let mut bytes_out = 0u64;
    let mut bytes_in = 0u64;

    let (closed_by, result) = tokio::select! {
        up = pump(&mut in_read, &mut out_write, &mut bytes_out) => (ClosedBy::Inbound, up),
        down = pump(&mut out_read, &mut in_write, &mut bytes_in) => (ClosedBy::Outbound, down),
    };
    if let Err(e) = result {
        warn!(destination = %destination, closed_by = ?closed_by, error = %e, "relay stream failed");
    }

    if let Err(e) = in_write.shutdown().await {
        debug!(destination = %destination, error = %e, "inbound shutdown failed");
    }
    if let Err(e) = out_write.shutdown().await {
        debug!(destination = %destination, error = %e, "outbound shutdown failed");
    }

    RelayStats {
        closed_by,
        bytes_out,
        bytes_in,
    }
}

/// Copy until EOF, counting bytes as they are written.
async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

/// Run [`relay`] on its own task.
pub fn spawn_relay(
    inbound: BoxedStream,
    outbound: BoxedStream,
    destination: String,
) -> JoinHandle<RelayStats> {
    tokio::spawn(async move {
        let stats = relay(inbound, outbound, &destination).await;
        debug!(
            destination = %destination,
            closed_by = ?stats.closed_by,
            bytes_out = stats.bytes_out,
            bytes_in = stats.bytes_in,
            "relay finished"
        );
        stats
    })
}
