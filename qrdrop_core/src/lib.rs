//! Core of qrdrop: one-to-one file transfer between two peers.
//!
//! One side (the initiator) publishes a share link carrying its identifier;
//! the other side (the joiner) opens that link and connects. Once the
//! channel is open either side can send files, which travel as a metadata
//! message, a run of chunks and an end marker.
//!
//! The transport is abstract ([`channel::PeerEndpoint`]); `qrdrop_wan`
//! provides the iroh implementation and [`memory`] an in-process one.

use anyhow::Result;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod channel;
pub mod config;
pub mod link;
pub mod memory;
pub mod session;
pub mod transfer;

pub use channel::{MessageChannel, PeerEndpoint, StreamChannel};
pub use config::AppConfig;
pub use link::{code_from_link, share_link};
pub use session::{Admission, ConnectionManager, ConnectionState, Role};

use transfer::progress::ProgressReporter;
use transfer::{
    FileSink, ReceiveOutcome, TransferError, TransferReceiver, TransferSummary, WireMessage,
    send_file,
};

/// Depth of the queue feeding the backend loop
const INPUT_QUEUE_DEPTH: usize = 64;

//Command from UI to Core
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Send a file to the connected peer. Queued behind a send already
    /// in progress.
    SendFile(PathBuf),
    /// Close the connection and stop the backend
    Shutdown,
}

//Report from Core to UI
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),

    /// Initiator only: the link the peer has to open
    ShareLinkReady {
        id: String,
        link: String,
    },

    ConnectionOpened {
        peer: String,
    },
    ConnectionClosed,

    /// Connection type / latency update from the transport
    ConnectionInfo {
        connection_type: String,
        rtt_ms: Option<u64>,
    },

    TransferStarted {
        file_name: String,
        file_size: u64,
        is_sending: bool,
    },
    TransferProgress {
        file_name: String,
        progress: f32,
        speed: String,
        speed_bps: f64,
        is_sending: bool,
    },
    TransferCompleted {
        file_name: String,
        /// BLAKE3 hex digest of the transferred bytes
        digest: String,
        is_sending: bool,
    },

    /// A received file was written to disk
    FileSaved {
        file_name: String,
        saved_path: PathBuf,
    },

    Error(String),
}

/// Everything the backend loop reacts to besides UI commands.
enum SessionInput<C> {
    Incoming(C),
    Data(WireMessage),
    /// The active channel ended, with the transport error if there was one
    Closed(Option<String>),
    /// An outgoing file finished, successfully or not
    SendFinished {
        path: PathBuf,
        result: Result<TransferSummary>,
    },
}

/// Run one session until shutdown, the peer disconnecting, or a failed
/// connection attempt.
///
/// # Arguments
/// * `endpoint` - Transport the session identifier and connections come from
/// * `role` - Initiator (publish the link) or Joiner (connect to the target)
/// * `config` - Chunk size, size limit and share link base
/// * `sink` - Where completed incoming files are saved
/// * `cmd_rx` - Commands from the UI
/// * `event_tx` - Events to the UI
/// * `cancel` - Stops the loop
pub async fn run_backend<E, S>(
    endpoint: Arc<E>,
    role: Role,
    config: AppConfig,
    sink: S,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    event_tx: mpsc::Sender<AppEvent>,
    cancel: CancellationToken,
) -> Result<()>
where
    E: PeerEndpoint,
    S: FileSink,
{
    config.validate()?;

    let local_id = endpoint.local_id();
    info!("Session started, local id: {}", local_id);

    let pumps = cancel.child_token();
    let (input_tx, mut input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
    let mut manager = ConnectionManager::<E::Channel>::new();

    spawn_accept_pump(endpoint.clone(), input_tx.clone(), pumps.clone());

    match &role {
        Role::Initiator => {
            let link = share_link(&config.share_base_url, &local_id)?;
            info!("Share link: {}", link);
            let _ = event_tx
                .send(AppEvent::ShareLinkReady {
                    id: local_id.clone(),
                    link: link.to_string(),
                })
                .await;
            let _ = event_tx
                .send(AppEvent::Status(
                    "Waiting for a device to connect...".to_string(),
                ))
                .await;
        }
        Role::Joiner { target } => {
            manager.begin_connect()?;
            let _ = event_tx
                .send(AppEvent::Status(format!("Connecting to {}...", target)))
                .await;

            let attempt = tokio::select! {
                _ = cancel.cancelled() => None,
                result = endpoint.connect(target) => Some(result),
            };
            match attempt {
                None => {
                    pumps.cancel();
                    return Ok(());
                }
                Some(Ok(conn)) => {
                    let conn = manager.on_open(conn);
                    let _ = event_tx
                        .send(AppEvent::ConnectionOpened { peer: conn.peer() })
                        .await;
                    spawn_read_pump(conn, input_tx.clone(), pumps.clone());
                }
                Some(Err(e)) => {
                    manager.on_connect_failed();
                    error!("Failed to connect to {}: {:#}", target, e);
                    let _ = event_tx
                        .send(AppEvent::Error(format!("Error: {}. Try refreshing.", e)))
                        .await;
                    pumps.cancel();
                    return Ok(());
                }
            }
        }
    }

    let mut receiver = TransferReceiver::new(config.max_file_size);
    let mut incoming_progress: Option<ProgressReporter> = None;
    // One file goes out at a time; the rest wait here
    let mut sending = false;
    let mut pending_sends: VecDeque<PathBuf> = VecDeque::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Backend cancelled");
                break;
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(AppCommand::SendFile(path)) => {
                    let Some(conn) = manager.active().cloned() else {
                        let _ = event_tx
                            .send(AppEvent::Error("Connect to a device to send files.".to_string()))
                            .await;
                        continue;
                    };

                    if sending {
                        debug!("Queueing {} behind the current send", path.display());
                        pending_sends.push_back(path);
                        continue;
                    }
                    sending = true;
                    spawn_send(conn, path, config.chunk_size, event_tx.clone(), input_tx.clone(), pumps.clone());
                }
                Some(AppCommand::Shutdown) | None => {
                    info!("Shutting down session");
                    break;
                }
            },
            Some(input) = input_rx.recv() => match input {
                SessionInput::Incoming(conn) => {
                    let peer = conn.peer();
                    if let Admission::Accepted(conn) = manager.on_incoming_connection(conn) {
                        let _ = event_tx.send(AppEvent::ConnectionOpened { peer }).await;
                        spawn_read_pump(conn, input_tx.clone(), pumps.clone());
                    }
                }
                SessionInput::Data(msg) => {
                    handle_incoming(&mut receiver, &mut incoming_progress, msg, &sink, &event_tx).await;
                }
                SessionInput::SendFinished { path, result } => {
                    if let Err(e) = result {
                        error!("File transfer failed for {}: {:#}", path.display(), e);
                        let _ = event_tx.send(AppEvent::Error(send_failure_message(&path, &e))).await;
                    }

                    sending = false;
                    if let (Some(conn), Some(next)) = (manager.active().cloned(), pending_sends.pop_front()) {
                        sending = true;
                        spawn_send(conn, next, config.chunk_size, event_tx.clone(), input_tx.clone(), pumps.clone());
                    }
                }
                SessionInput::Closed(reason) => {
                    if let Some(e) = reason {
                        error!("Connection error: {}", e);
                        let _ = event_tx
                            .send(AppEvent::Error(format!("Error: {}. Try refreshing.", e)))
                            .await;
                    }
                    if let Some(metadata) = receiver.current() {
                        warn!(
                            "Connection closed while receiving {}; {} of {} bytes buffered were not saved",
                            metadata.name,
                            receiver.buffered_bytes(),
                            metadata.size
                        );
                    }
                    if !pending_sends.is_empty() {
                        warn!("Dropping {} queued sends", pending_sends.len());
                    }
                    manager.on_closed();
                    let _ = event_tx.send(AppEvent::ConnectionClosed).await;
                    let _ = event_tx
                        .send(AppEvent::Status(
                            "Disconnected. Refresh to get a new code.".to_string(),
                        ))
                        .await;
                    break;
                }
            },
        }
    }

    // Stops the pumps and any send still running
    pumps.cancel();
    manager.close("shutdown").await;
    info!("Session ended");
    Ok(())
}

/// What the user sees when a send fails. Local problems with the file leave
/// the session usable; anything else means the connection is gone.
fn send_failure_message(path: &Path, e: &anyhow::Error) -> String {
    match e.downcast_ref::<TransferError>() {
        Some(local) => format!("Could not send {}: {}", path.display(), local),
        None => format!("Error: {}. Try refreshing.", e),
    }
}

/// Send one file on its own task so the loop keeps draining incoming
/// messages, then report back through the input queue.
fn spawn_send<C: MessageChannel>(
    conn: Arc<C>,
    path: PathBuf,
    chunk_size: usize,
    event_tx: mpsc::Sender<AppEvent>,
    input_tx: mpsc::Sender<SessionInput<C>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Send of {} cancelled", path.display());
                return;
            }
            result = send_file(&*conn, &path, chunk_size, &event_tx) => result,
        };
        let _ = input_tx.send(SessionInput::SendFinished { path, result }).await;
    });
}

/// Feed one message to the receiver and report what it did.
async fn handle_incoming<S: FileSink>(
    receiver: &mut TransferReceiver,
    progress: &mut Option<ProgressReporter>,
    msg: WireMessage,
    sink: &S,
    event_tx: &mpsc::Sender<AppEvent>,
) {
    match receiver.handle(msg) {
        ReceiveOutcome::Started(metadata) => {
            let _ = event_tx
                .send(AppEvent::TransferStarted {
                    file_name: metadata.name.clone(),
                    file_size: metadata.size,
                    is_sending: false,
                })
                .await;
            *progress = Some(ProgressReporter::new(
                event_tx.clone(),
                &metadata.name,
                metadata.size,
                false,
            ));
        }
        ReceiveOutcome::Buffered { received, .. } => {
            if let Some(progress) = progress.as_mut() {
                progress.update(received).await;
            }
        }
        ReceiveOutcome::Completed(file) => {
            if let Some(mut progress) = progress.take() {
                if file.data.is_empty() {
                    progress.update(0).await;
                }
            }

            let file_name = file.metadata.name.clone();
            let _ = event_tx
                .send(AppEvent::TransferCompleted {
                    file_name: file_name.clone(),
                    digest: file.digest.clone(),
                    is_sending: false,
                })
                .await;

            match sink.save(file).await {
                Ok(saved_path) => {
                    let _ = event_tx
                        .send(AppEvent::FileSaved {
                            file_name,
                            saved_path,
                        })
                        .await;
                }
                Err(e) => {
                    error!("Failed to save {}: {:#}", file_name, e);
                    let _ = event_tx
                        .send(AppEvent::Error(format!("Failed to save {}: {}", file_name, e)))
                        .await;
                }
            }
        }
        ReceiveOutcome::Rejected { reason, .. } => {
            *progress = None;
            let _ = event_tx.send(AppEvent::Error(reason)).await;
        }
        ReceiveOutcome::Discarded => {}
    }
}

/// Forward inbound connections into the backend queue.
fn spawn_accept_pump<E: PeerEndpoint>(
    endpoint: Arc<E>,
    input_tx: mpsc::Sender<SessionInput<E::Channel>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = endpoint.accept() => accepted,
            };
            match accepted {
                Ok(Some(conn)) => {
                    debug!(peer = %conn.peer(), "inbound connection");
                    if input_tx.send(SessionInput::Incoming(conn)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("endpoint stopped accepting");
                    break;
                }
                Err(e) => {
                    warn!("Failed to accept connection: {:#}", e);
                }
            }
        }
    });
}

/// Forward messages of the active channel into the backend queue, then its
/// close.
fn spawn_read_pump<C: MessageChannel>(
    conn: Arc<C>,
    input_tx: mpsc::Sender<SessionInput<C>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = conn.recv() => received,
            };
            let input = match received {
                Ok(Some(msg)) => SessionInput::Data(msg),
                Ok(None) => SessionInput::Closed(None),
                Err(e) => SessionInput::Closed(Some(format!("{:#}", e))),
            };
            let done = matches!(input, SessionInput::Closed(_));
            if input_tx.send(input).await.is_err() || done {
                break;
            }
        }
    });
}
