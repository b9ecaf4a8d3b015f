//! In-process transport.
//!
//! A [`MemoryNetwork`] routes connection attempts between endpoints by
//! identifier. Channels are pairs of unbounded queues, so delivery is
//! reliable and ordered and sends never block. Used by the tests and handy
//! for exercising the session logic without a real network.

use anyhow::{Result, anyhow, bail};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};

use crate::channel::{MessageChannel, PeerEndpoint};
use crate::transfer::protocol::WireMessage;

type Registry = HashMap<String, mpsc::UnboundedSender<MemoryChannel>>;

/// Shared switchboard connecting [`MemoryEndpoint`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint under a fixed identifier.
    pub async fn endpoint(&self, id: impl Into<String>) -> Result<MemoryEndpoint> {
        let id = id.into();
        let mut endpoints = self.endpoints.lock().await;
        if endpoints.contains_key(&id) {
            bail!("Endpoint {} already registered", id);
        }

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        endpoints.insert(id.clone(), incoming_tx);
        tracing::debug!(id = %id, "memory endpoint registered");

        Ok(MemoryEndpoint {
            id,
            network: self.clone(),
            incoming: Mutex::new(incoming_rx),
        })
    }

    /// Registers an endpoint under a fresh random identifier.
    pub async fn random_endpoint(&self) -> Result<MemoryEndpoint> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.endpoint(id).await
    }
}

/// One participant of a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    id: String,
    network: MemoryNetwork,
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryChannel>>,
}

impl PeerEndpoint for MemoryEndpoint {
    type Channel = MemoryChannel;

    fn local_id(&self) -> String {
        self.id.clone()
    }

    async fn connect<'a>(&'a self, target: &'a str) -> Result<MemoryChannel> {
        let endpoints = self.network.endpoints.lock().await;
        let remote = endpoints
            .get(target)
            .ok_or_else(|| anyhow!("Could not connect to peer {}", target))?;

        let (local, remote_half) = MemoryChannel::pair(&self.id, target);
        remote
            .send(remote_half)
            .map_err(|_| anyhow!("Peer {} is no longer listening", target))?;

        tracing::debug!(local = %self.id, remote = %target, "memory channel opened");
        Ok(local)
    }

    async fn accept(&self) -> Result<Option<MemoryChannel>> {
        Ok(self.incoming.lock().await.recv().await)
    }
}

/// One end of an in-memory channel.
pub struct MemoryChannel {
    peer: String,
    tx: Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
    rx: Mutex<mpsc::UnboundedReceiver<WireMessage>>,
    sent: AtomicU64,
}

impl MemoryChannel {
    /// Creates two connected ends: the first talks to `remote_id`, the
    /// second to `local_id`.
    pub fn pair(local_id: &str, remote_id: &str) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self::new(remote_id, a_tx, b_rx),
            Self::new(local_id, b_tx, a_rx),
        )
    }

    fn new(
        peer: &str,
        tx: mpsc::UnboundedSender<WireMessage>,
        rx: mpsc::UnboundedReceiver<WireMessage>,
    ) -> Self {
        Self {
            peer: peer.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            sent: AtomicU64::new(0),
        }
    }

    /// Number of messages successfully sent on this end.
    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Whether this end has been closed locally.
    pub async fn is_closed(&self) -> bool {
        self.tx.lock().await.is_none()
    }
}

impl MessageChannel for MemoryChannel {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn send(&self, msg: WireMessage) -> Result<()> {
        let tx = self.tx.lock().await;
        let tx = tx
            .as_ref()
            .ok_or_else(|| anyhow!("Channel to {} is closed", self.peer))?;
        tx.send(msg)
            .map_err(|_| anyhow!("Channel to {} was closed by the peer", self.peer))?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<WireMessage>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self, reason: &'static str) {
        if self.tx.lock().await.take().is_some() {
            tracing::debug!(peer = %self.peer, reason, "memory channel closed");
        }
        // Stop accepting further deliveries; queued messages stay readable.
        // A pending recv holds the lock and will see the peer's close instead.
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}
