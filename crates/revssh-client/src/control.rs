//! Out-of-band requests from the reverse client to the broker.
//!
//! A request rides on a short-lived session channel: the exec command is the
//! encoded [`RequestEnvelope`], the broker answers with optional data, then
//! success or failure, then closes the channel.

use crate::keepalive::KeepaliveTarget;
use revssh_core::protocol::REQUEST_KEEPALIVE;
use revssh_core::{Reply, RequestEnvelope, RevsshError, RevsshResult};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, trace};

/// Send one request and collect the broker's reply.
pub async fn send_request<H>(
    handle: &Handle<H>,
    request_type: &str,
    payload: &[u8],
) -> RevsshResult<Reply>
where
    H: client::Handler,
{
    let mut channel = handle.channel_open_session().await?;
    let envelope = RequestEnvelope::new(request_type, payload.to_vec());
    channel.exec(true, envelope.encode()).await?;

    let mut data = Vec::new();
    let mut ok = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data: chunk } => data.extend_from_slice(&chunk),
            ChannelMsg::Success => ok = Some(true),
            ChannelMsg::Failure => ok = Some(false),
            ChannelMsg::Eof | ChannelMsg::Close => break,
            other => trace!(msg = ?other, "ignoring channel message"),
        }
    }
    let _ = channel.close().await;

    match ok {
        Some(ok) => {
            debug!(request = %request_type, ok, reply_len = data.len(), "request answered");
            Ok(Reply { ok, payload: data })
        }
        None => Err(RevsshError::RequestFailed(format!(
            "{request_type}: channel closed without a reply"
        ))),
    }
}

/// Keepalive pings over a live client connection.
pub struct SessionPinger<H: client::Handler> {
    handle: Arc<Handle<H>>,
}

impl<H: client::Handler> SessionPinger<H> {
    pub fn new(handle: Arc<Handle<H>>) -> Self {
        Self { handle }
    }
}

impl<H> KeepaliveTarget for SessionPinger<H>
where
    H: client::Handler,
{
    fn ping(&self) -> Pin<Box<dyn Future<Output = RevsshResult<()>> + Send + '_>> {
        Box::pin(async move {
            let reply = send_request(&self.handle, REQUEST_KEEPALIVE, &[]).await?;
            if reply.ok {
                Ok(())
            } else {
                Err(RevsshError::RequestFailed("keepalive refused".into()))
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let _ = self
                .handle
                .disconnect(Disconnect::ByApplication, "keepalive timeout", "en")
                .await;
        })
    }
}
