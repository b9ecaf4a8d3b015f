use anyhow::{Context, Result, anyhow};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use qrdrop_core::transfer::WireMessage;
use qrdrop_core::transfer::protocol::{read_preamble, write_preamble};
use qrdrop_core::{AppEvent, MessageChannel, PeerEndpoint, StreamChannel};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::monitor::spawn_connection_monitor;
use crate::protocol::{ALPN, CLOSE_GRACE, HANDSHAKE_TIMEOUT};

/// One iroh endpoint used for both the outbound and the inbound side of a
/// session.
pub struct IrohEndpoint {
    endpoint: Endpoint,
    monitor_tx: Option<mpsc::Sender<AppEvent>>,
}

impl IrohEndpoint {
    /// Binds a new endpoint with the given secret key
    ///
    /// # Arguments
    /// * `secret_key` - The secret key that determines the session identifier
    pub async fn bind(secret_key: SecretKey) -> Result<Self> {
        info!("Initializing Iroh endpoint...");

        let mut transport_config = iroh::endpoint::TransportConfig::default();
        transport_config.receive_window(iroh::endpoint::VarInt::from_u32(16 * 1024 * 1024));
        transport_config.send_window(16 * 1024 * 1024);
        transport_config.initial_mtu(1200);
        transport_config.max_idle_timeout(Some(
            Duration::from_secs(60)
                .try_into()
                .context("Invalid idle timeout")?,
        ));
        transport_config.max_concurrent_bidi_streams(iroh::endpoint::VarInt::from_u32(4));
        transport_config.max_concurrent_uni_streams(iroh::endpoint::VarInt::from_u32(0));

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![ALPN.to_vec()])
            .transport_config(transport_config)
            .bind()
            .await
            .context("Failed to bind endpoint")?;

        info!("Iroh endpoint initialized with Node ID: {}", endpoint.id());
        Ok(Self {
            endpoint,
            monitor_tx: None,
        })
    }

    /// Report connection type and RTT of every connection to `event_tx`
    pub fn with_monitor(mut self, event_tx: mpsc::Sender<AppEvent>) -> Self {
        self.monitor_tx = Some(event_tx);
        self
    }

    /// Returns the underlying endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the Node ID of this endpoint
    pub fn id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Returns the full node address including relay information
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Connect to a peer by address and open the session stream
    pub async fn connect_addr(&self, addr: impl Into<EndpointAddr>) -> Result<IrohChannel> {
        let addr = addr.into();
        let target = addr.id;
        info!("Connecting to {} (hole punch / relay)...", target);
        let start = std::time::Instant::now();

        let connection = self
            .endpoint
            .connect(addr, ALPN)
            .await
            .context("Failed to connect to peer")?;
        info!("Connected to {} in {:?}", target, start.elapsed());

        let (mut send, recv) = connection
            .open_bi()
            .await
            .context("Failed to open stream")?;
        // The acceptor only sees the stream once something is written to it
        write_preamble(&mut send).await?;

        self.start_monitor(target, &connection);
        Ok(IrohChannel::new(connection, send, recv))
    }

    /// Gracefully closes the endpoint
    pub async fn close(&self) {
        info!("Closing endpoint...");
        self.endpoint.close().await;
    }

    fn start_monitor(&self, peer_id: EndpointId, connection: &Connection) {
        if let Some(event_tx) = &self.monitor_tx {
            tokio::spawn(spawn_connection_monitor(
                self.endpoint.clone(),
                peer_id,
                connection.clone(),
                event_tx.clone(),
            ));
        }
    }

    async fn handshake(&self, incoming: iroh::endpoint::Incoming) -> Result<IrohChannel> {
        let connection = incoming.await.context("Failed to accept connection")?;
        let peer_id = connection.remote_id();
        debug!("Connection established with {}, waiting for stream", peer_id);

        let (send, mut recv) = connection
            .accept_bi()
            .await
            .context("Peer did not open a stream")?;
        if let Err(e) = read_preamble(&mut recv).await {
            connection.close(1u8.into(), b"bad preamble");
            return Err(e.into());
        }

        self.start_monitor(peer_id, &connection);
        Ok(IrohChannel::new(connection, send, recv))
    }
}

impl PeerEndpoint for IrohEndpoint {
    type Channel = IrohChannel;

    fn local_id(&self) -> String {
        self.endpoint.id().to_string()
    }

    async fn connect<'a>(&'a self, target: &'a str) -> Result<IrohChannel> {
        let target_id = EndpointId::from_str(target)
            .map_err(|e| anyhow!("Invalid code {}: {}", target, e))?;
        self.connect_addr(target_id).await
    }

    async fn accept(&self) -> Result<Option<IrohChannel>> {
        let Some(incoming) = self.endpoint.accept().await else {
            warn!("Endpoint closed, stopping listener");
            return Ok(None);
        };
        info!("Incoming connection detected");

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(incoming)).await {
            Ok(result) => result.map(Some),
            Err(_) => Err(anyhow!(
                "Peer did not complete the handshake within {:?}",
                HANDSHAKE_TIMEOUT
            )),
        }
    }
}

/// The session stream of one iroh connection.
pub struct IrohChannel {
    connection: Connection,
    stream: StreamChannel<RecvStream, SendStream>,
}

impl IrohChannel {
    fn new(connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        let peer = connection.remote_id().to_string();
        Self {
            connection,
            stream: StreamChannel::new(peer, recv, send),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl MessageChannel for IrohChannel {
    fn peer(&self) -> String {
        self.stream.peer()
    }

    async fn send(&self, msg: WireMessage) -> Result<()> {
        self.stream.send(msg).await
    }

    async fn recv(&self) -> Result<Option<WireMessage>> {
        self.stream.recv().await
    }

    async fn close(&self, reason: &'static str) {
        // Finish our side first so queued frames still reach the peer
        self.stream.close(reason).await;
        if tokio::time::timeout(CLOSE_GRACE, self.connection.closed())
            .await
            .is_err()
        {
            debug!(peer = %self.peer(), "peer did not close in time");
        }
        self.connection.close(0u8.into(), reason.as_bytes());
    }
}
