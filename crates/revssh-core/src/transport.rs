//! Abstract transport traits.
//!
//! A connection manager serves anything implementing [`RawTransport`], so the
//! same code runs over a TCP socket or over a secondary stream multiplexed
//! inside another SSH connection.

use crate::error::{RevsshError, RevsshResult};
use crate::wire::ForwardRequest;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte transport (async read, write and shutdown).
pub trait RawTransport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawTransport for T {}

/// An owned, type-erased transport.
pub type BoxedStream = Box<dyn RawTransport>;

/// A live connection that can open secondary streams toward its peer.
pub trait Tunnel: Send + Sync {
    /// Open a secondary stream carrying `request` as its extra data.
    fn open_secondary<'a>(
        &'a self,
        request: &'a ForwardRequest,
    ) -> Pin<Box<dyn Future<Output = RevsshResult<BoxedStream>> + Send + 'a>>;
}

/// Outbound connector used for direct port forwards.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = RevsshResult<BoxedStream>> + Send + 'a>>;
}

/// Dials plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = RevsshResult<BoxedStream>> + Send + 'a>> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|source| RevsshError::Dial {
                    addr: format!("{host}:{port}"),
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hello").await.unwrap();
        });

        let mut stream = TcpDialer.dial("127.0.0.1", port).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_dialer_reports_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        match TcpDialer.dial("127.0.0.1", port).await {
            Err(RevsshError::Dial { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{port}")),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("dial to closed port succeeded"),
        }
    }
}
