//! Abstract peer-to-peer transport.
//!
//! The session logic never touches sockets: it talks to a [`PeerEndpoint`]
//! that hands out [`MessageChannel`]s. A channel is reliable and ordered;
//! messages arrive in the order they were sent or not at all.
//!
//! Implementations in this workspace:
//! - [`MemoryNetwork`](crate::memory::MemoryNetwork): in-process, for tests
//! - [`StreamChannel`]: any `AsyncRead`/`AsyncWrite` pair (QUIC streams,
//!   duplex pipes)
//! - `qrdrop_wan::IrohEndpoint`: iroh, with NAT traversal and relays

use anyhow::{Result, anyhow};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::transfer::protocol::{WireMessage, read_frame, write_frame};

/// A reliable, ordered message channel to exactly one remote peer.
///
/// All methods take `&self` so one task can block in [`recv`](Self::recv)
/// while another sends.
pub trait MessageChannel: Send + Sync + 'static {
    /// Returns a human-readable identifier for the remote end.
    fn peer(&self) -> String;

    /// Sends one message. Fails once the channel is closed.
    fn send(&self, msg: WireMessage) -> impl Future<Output = Result<()>> + Send + '_;

    /// Waits for the next message.
    ///
    /// Returns `Ok(None)` when the remote end has closed the channel.
    fn recv(&self) -> impl Future<Output = Result<Option<WireMessage>>> + Send + '_;

    /// Closes the channel. The remote end observes a normal close.
    fn close(&self, reason: &'static str) -> impl Future<Output = ()> + Send + '_;
}

/// The local side of the transport: an identity plus the ability to open
/// and accept channels.
pub trait PeerEndpoint: Send + Sync + 'static {
    /// The concrete channel type produced by [`connect`](Self::connect)
    /// and [`accept`](Self::accept).
    type Channel: MessageChannel;

    /// The identifier other peers use to reach this endpoint.
    fn local_id(&self) -> String;

    /// Opens a channel to the peer with the given identifier.
    fn connect<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Future<Output = Result<Self::Channel>> + Send + 'a;

    /// Waits for the next inbound channel.
    ///
    /// Returns `Ok(None)` once the endpoint is shut down. An `Err` only
    /// concerns the single failed attempt; callers may keep accepting.
    fn accept(&self) -> impl Future<Output = Result<Option<Self::Channel>>> + Send + '_;
}

/// A [`MessageChannel`] over a pair of byte streams, using the
/// length-prefixed framing from [`protocol`](crate::transfer::protocol).
pub struct StreamChannel<R, W> {
    peer: String,
    reader: Mutex<R>,
    writer: Mutex<Option<W>>,
}

impl<R, W> StreamChannel<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(peer: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            peer: peer.into(),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
        }
    }
}

impl<R, W> MessageChannel for StreamChannel<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn send(&self, msg: WireMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| anyhow!("Channel to {} is closed", self.peer))?;
        write_frame(writer, &msg).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<WireMessage>> {
        let mut reader = self.reader.lock().await;
        Ok(read_frame(&mut *reader).await?)
    }

    async fn close(&self, reason: &'static str) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            tracing::debug!(peer = %self.peer, reason, "closing stream channel");
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(peer = %self.peer, error = %e, "stream shutdown failed");
            }
        }
    }
}
