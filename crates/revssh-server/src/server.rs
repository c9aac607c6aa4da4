//! TCP accept loop for the broker.

use crate::connection::ConnectionManager;
use revssh_core::RevsshResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Accepts TCP connections and hands each to the connection manager.
pub struct RevsshServer {
    manager: Arc<ConnectionManager>,
}

impl RevsshServer {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Bind `addr` and serve until the task is cancelled.
    pub async fn run(&self, addr: &str) -> RevsshResult<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening");
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener. Accept errors are
    /// retried with a delay growing from 5ms to 1s.
    pub async fn serve(&self, listener: TcpListener) -> RevsshResult<()> {
        let mut delay = Duration::ZERO;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    delay = Duration::ZERO;
                    let _ = stream.set_nodelay(true);
                    self.manager.spawn(stream, Some(peer));
                }
                Err(e) => {
                    delay = next_accept_delay(delay);
                    warn!(error = %e, retry_in = ?delay, "accept failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn next_accept_delay(current: Duration) -> Duration {
    if current.is_zero() {
        ACCEPT_BACKOFF_MIN
    } else {
        (current * 2).min(ACCEPT_BACKOFF_MAX)
    }
}
