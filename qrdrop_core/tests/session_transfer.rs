//! End-to-end sessions over the in-memory network and a bounded pipe
//! transport.

use anyhow::Result;
use bytes::Bytes;
use qrdrop_core::memory::MemoryNetwork;
use qrdrop_core::transfer::hash::digest_hex;
use qrdrop_core::transfer::{DownloadDir, FileSink, ReceivedFile, TransferMetadata, WireMessage};
use qrdrop_core::{
    AppCommand, AppConfig, AppEvent, MessageChannel, PeerEndpoint, Role, StreamChannel, run_backend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);
/// For transfers of several megabytes
const LONG_WAIT: Duration = Duration::from_secs(60);
/// Small enough that a peer which stops reading stalls the writer
const PIPE_CAPACITY: usize = 64 * 1024;

/// Keeps received files in memory instead of writing them out.
#[derive(Clone, Default)]
struct CaptureSink {
    files: Arc<Mutex<Vec<ReceivedFile>>>,
}

impl FileSink for CaptureSink {
    async fn save(&self, file: ReceivedFile) -> Result<PathBuf> {
        let path = PathBuf::from(&file.metadata.name);
        self.files.lock().await.push(file);
        Ok(path)
    }
}

struct Session {
    commands: mpsc::Sender<AppCommand>,
    events: mpsc::Receiver<AppEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Session {
    fn start<E: PeerEndpoint, S: FileSink>(endpoint: E, role: Role, sink: S) -> Self {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init()
            .ok();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(4096);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_backend(
            Arc::new(endpoint),
            role,
            AppConfig::default(),
            sink,
            cmd_rx,
            event_tx,
            cancel.clone(),
        ));

        Self {
            commands: cmd_tx,
            events: event_rx,
            cancel,
            handle,
        }
    }

    /// Next event matching `pred`, skipping the others.
    async fn wait_for(&mut self, pred: impl Fn(&AppEvent) -> bool) -> AppEvent {
        self.wait_for_within(WAIT, pred).await
    }

    async fn wait_for_within(
        &mut self,
        limit: Duration,
        pred: impl Fn(&AppEvent) -> bool,
    ) -> AppEvent {
        tokio::time::timeout(limit, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("backend stopped before the expected event"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Everything the backend reports until it stops.
    async fn finish(mut self) -> Vec<AppEvent> {
        tokio::time::timeout(WAIT, &mut self.handle)
            .await
            .expect("backend did not stop")
            .unwrap()
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn is_opened(event: &AppEvent) -> bool {
    matches!(event, AppEvent::ConnectionOpened { .. })
}

fn is_saved(event: &AppEvent) -> bool {
    matches!(event, AppEvent::FileSaved { .. })
}

type PipeChannel = StreamChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Transport over small in-memory pipes. Unlike [`MemoryNetwork`] it has
/// back-pressure: writes block once the reader falls behind.
struct PipeEndpoint {
    id: String,
    peer_inbox: mpsc::Sender<PipeChannel>,
    inbox: Mutex<mpsc::Receiver<PipeChannel>>,
}

/// Two endpoints that can only reach each other.
fn pipe_endpoints(a: &str, b: &str) -> (PipeEndpoint, PipeEndpoint) {
    let (a_tx, a_rx) = mpsc::channel(4);
    let (b_tx, b_rx) = mpsc::channel(4);
    (
        PipeEndpoint {
            id: a.to_string(),
            peer_inbox: b_tx,
            inbox: Mutex::new(a_rx),
        },
        PipeEndpoint {
            id: b.to_string(),
            peer_inbox: a_tx,
            inbox: Mutex::new(b_rx),
        },
    )
}

impl PeerEndpoint for PipeEndpoint {
    type Channel = PipeChannel;

    fn local_id(&self) -> String {
        self.id.clone()
    }

    async fn connect<'a>(&'a self, target: &'a str) -> Result<PipeChannel> {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);
        self.peer_inbox
            .send(StreamChannel::new(self.id.clone(), remote_read, remote_write))
            .await
            .map_err(|_| anyhow::anyhow!("{} is not listening", target))?;
        Ok(StreamChannel::new(target, local_read, local_write))
    }

    async fn accept(&self) -> Result<Option<PipeChannel>> {
        Ok(self.inbox.lock().await.recv().await)
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Initiator `abc123` plus a joiner that opened the link to it.
async fn connected_pair(
    initiator_sink: CaptureSink,
) -> (MemoryNetwork, Session, Session) {
    let network = MemoryNetwork::new();
    let initiator_ep = network.endpoint("abc123").await.unwrap();
    let joiner_ep = network.random_endpoint().await.unwrap();

    let mut initiator = Session::start(initiator_ep, Role::Initiator, initiator_sink);
    let link = match initiator
        .wait_for(|e| matches!(e, AppEvent::ShareLinkReady { .. }))
        .await
    {
        AppEvent::ShareLinkReady { id, link } => {
            assert_eq!(id, "abc123");
            link
        }
        _ => unreachable!(),
    };
    assert_eq!(link, "qrdrop://connect#abc123");

    let mut joiner = Session::start(joiner_ep, Role::from_link(Some(link.as_str())), CaptureSink::default());
    joiner.wait_for(is_opened).await;
    initiator.wait_for(is_opened).await;

    (network, initiator, joiner)
}

#[tokio::test]
async fn test_round_trip_preserves_bytes_name_and_type() {
    let sink = CaptureSink::default();
    let (_network, mut initiator, mut joiner) = connected_pair(sink.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("holiday.png");
    let data = payload(150 * 1024);
    tokio::fs::write(&path, &data).await.unwrap();

    joiner.commands.send(AppCommand::SendFile(path)).await.unwrap();
    let sent_digest = match joiner
        .wait_for(|e| matches!(e, AppEvent::TransferCompleted { is_sending: true, .. }))
        .await
    {
        AppEvent::TransferCompleted { digest, .. } => digest,
        _ => unreachable!(),
    };

    match initiator
        .wait_for(|e| matches!(e, AppEvent::TransferCompleted { is_sending: false, .. }))
        .await
    {
        AppEvent::TransferCompleted { file_name, digest, .. } => {
            assert_eq!(file_name, "holiday.png");
            assert_eq!(digest, sent_digest);
        }
        _ => unreachable!(),
    }
    initiator
        .wait_for(is_saved)
        .await;

    let files = sink.files.lock().await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].metadata.name, "holiday.png");
    assert_eq!(files[0].metadata.mime_type, "image/png");
    assert_eq!(files[0].metadata.size, data.len() as u64);
    assert_eq!(&files[0].data[..], &data[..]);
    assert_eq!(files[0].digest, digest_hex(&data));
}

#[tokio::test]
async fn test_150k_file_arrives_as_three_chunks() {
    let network = MemoryNetwork::new();
    let initiator_ep = network.endpoint("abc123").await.unwrap();
    let peer = network.random_endpoint().await.unwrap();

    let mut initiator = Session::start(initiator_ep, Role::Initiator, CaptureSink::default());
    initiator
        .wait_for(|e| matches!(e, AppEvent::ShareLinkReady { .. }))
        .await;

    let target = qrdrop_core::code_from_link("qrdrop://connect#abc123").unwrap();
    let channel = peer.connect(&target).await.unwrap();
    initiator.wait_for(is_opened).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.bin");
    let data = payload(150 * 1024);
    tokio::fs::write(&path, &data).await.unwrap();

    initiator.commands.send(AppCommand::SendFile(path)).await.unwrap();

    let mut messages = Vec::new();
    loop {
        let msg = tokio::time::timeout(WAIT, channel.recv())
            .await
            .expect("timed out waiting for message")
            .unwrap()
            .expect("channel closed early");
        let end = msg == WireMessage::End;
        messages.push(msg);
        if end {
            break;
        }
    }

    assert!(matches!(
        &messages[0],
        WireMessage::Metadata(m) if m.name == "report.bin" && m.size == 150 * 1024
    ));
    let chunks: Vec<&Bytes> = messages
        .iter()
        .filter_map(|m| match m {
            WireMessage::Chunk(data) => Some(data),
            _ => None,
        })
        .collect();
    let lengths: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
    assert_eq!(lengths, vec![64 * 1024, 64 * 1024, 22 * 1024]);
    assert_eq!(messages.len(), 5);

    let rebuilt: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(rebuilt, data);
}

#[tokio::test]
async fn test_second_connection_does_not_disturb_the_first() {
    let sink = CaptureSink::default();
    let (network, mut initiator, mut joiner) = connected_pair(sink.clone()).await;

    // A third device tries the same link
    let intruder = network.random_endpoint().await.unwrap();
    let intruder_channel = intruder.connect("abc123").await.unwrap();
    let closed = tokio::time::timeout(WAIT, intruder_channel.recv())
        .await
        .expect("intruder was not closed")
        .unwrap();
    assert_eq!(closed, None);

    // And again, with the same outcome
    let again = intruder.connect("abc123").await.unwrap();
    let closed = tokio::time::timeout(WAIT, again.recv()).await.unwrap().unwrap();
    assert_eq!(closed, None);

    // The original pair still works
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("after.txt");
    tokio::fs::write(&path, b"still here").await.unwrap();
    joiner.commands.send(AppCommand::SendFile(path)).await.unwrap();

    initiator
        .wait_for(is_saved)
        .await;
    assert_eq!(&sink.files.lock().await[0].data[..], b"still here");
}

#[tokio::test]
async fn test_zero_byte_file() {
    let sink = CaptureSink::default();
    let (_network, mut initiator, mut joiner) = connected_pair(sink.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.txt");
    tokio::fs::write(&path, b"").await.unwrap();
    joiner.commands.send(AppCommand::SendFile(path)).await.unwrap();

    match initiator
        .wait_for(|e| matches!(e, AppEvent::TransferProgress { is_sending: false, .. }))
        .await
    {
        AppEvent::TransferProgress { progress, .. } => assert_eq!(progress, 100.0),
        _ => unreachable!(),
    }
    initiator
        .wait_for(is_saved)
        .await;

    let files = sink.files.lock().await;
    assert_eq!(files[0].metadata.name, "empty.txt");
    assert!(files[0].data.is_empty());
}

#[tokio::test]
async fn test_saved_to_download_dir() {
    let network = MemoryNetwork::new();
    let initiator_ep = network.endpoint("abc123").await.unwrap();
    let joiner_ep = network.random_endpoint().await.unwrap();
    let downloads = tempfile::tempdir().unwrap();

    let mut initiator = Session::start(
        initiator_ep,
        Role::Initiator,
        DownloadDir::new(downloads.path()),
    );
    let mut joiner = Session::start(
        joiner_ep,
        Role::from_link(Some("abc123")),
        CaptureSink::default(),
    );
    joiner.wait_for(is_opened).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.md");
    tokio::fs::write(&path, b"# notes").await.unwrap();
    joiner.commands.send(AppCommand::SendFile(path)).await.unwrap();

    match initiator
        .wait_for(is_saved)
        .await
    {
        AppEvent::FileSaved { saved_path, .. } => {
            assert_eq!(saved_path, downloads.path().join("notes.md"));
            assert_eq!(tokio::fs::read(&saved_path).await.unwrap(), b"# notes");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_close_mid_transfer_is_not_an_error() {
    let network = MemoryNetwork::new();
    let initiator_ep = network.endpoint("abc123").await.unwrap();
    let peer = network.random_endpoint().await.unwrap();
    let sink = CaptureSink::default();

    let mut initiator = Session::start(initiator_ep, Role::Initiator, sink.clone());
    let channel = peer.connect("abc123").await.unwrap();
    initiator.wait_for(is_opened).await;

    channel
        .send(WireMessage::Metadata(TransferMetadata {
            name: "movie.mkv".to_string(),
            size: 1000,
            mime_type: "video/x-matroska".to_string(),
        }))
        .await
        .unwrap();
    channel
        .send(WireMessage::Chunk(Bytes::from_static(b"first bytes")))
        .await
        .unwrap();
    channel.close("gone").await;

    let events = initiator.finish().await;
    assert!(events.iter().any(|e| matches!(e, AppEvent::ConnectionClosed)));
    assert!(!events.iter().any(|e| matches!(e, AppEvent::Error(_))));
    assert!(!events.iter().any(|e| matches!(e, AppEvent::TransferCompleted { .. })));
    assert!(sink.files.lock().await.is_empty());
}

#[tokio::test]
async fn test_send_before_connecting_is_reported() {
    let network = MemoryNetwork::new();
    let endpoint = network.endpoint("abc123").await.unwrap();
    let mut initiator = Session::start(endpoint, Role::Initiator, CaptureSink::default());

    initiator
        .commands
        .send(AppCommand::SendFile(PathBuf::from("whatever.txt")))
        .await
        .unwrap();
    match initiator.wait_for(|e| matches!(e, AppEvent::Error(_))).await {
        AppEvent::Error(msg) => assert_eq!(msg, "Connect to a device to send files."),
        _ => unreachable!(),
    }

    initiator.commands.send(AppCommand::Shutdown).await.unwrap();
    initiator.finish().await;
}

#[tokio::test]
async fn test_joiner_with_unknown_target_fails() {
    let network = MemoryNetwork::new();
    let endpoint = network.random_endpoint().await.unwrap();
    let mut joiner = Session::start(
        endpoint,
        Role::from_link(Some("qrdrop://connect#nobody")),
        CaptureSink::default(),
    );

    match joiner.wait_for(|e| matches!(e, AppEvent::Error(_))).await {
        AppEvent::Error(msg) => assert!(msg.ends_with("Try refreshing."), "{}", msg),
        _ => unreachable!(),
    }
    joiner.finish().await;
}

#[tokio::test]
async fn test_cancel_stops_the_backend() {
    let sink = CaptureSink::default();
    let (_network, initiator, mut joiner) = connected_pair(sink).await;

    initiator.cancel.cancel();
    initiator.finish().await;

    // The joiner sees the initiator go away
    joiner
        .wait_for(|e| matches!(e, AppEvent::ConnectionClosed))
        .await;
    joiner.finish().await;
}

#[tokio::test]
async fn test_both_sides_send_at_once_over_bounded_pipe() {
    let (alice_ep, bob_ep) = pipe_endpoints("alice", "bob");
    let alice_sink = CaptureSink::default();
    let bob_sink = CaptureSink::default();

    let mut alice = Session::start(alice_ep, Role::Initiator, alice_sink.clone());
    let mut bob = Session::start(
        bob_ep,
        Role::Joiner {
            target: "alice".to_string(),
        },
        bob_sink.clone(),
    );
    bob.wait_for(is_opened).await;
    alice.wait_for(is_opened).await;

    // Each file is far larger than the pipe plus the backend's input queue
    let dir = tempfile::tempdir().unwrap();
    let from_alice = payload(6 * 1024 * 1024);
    let from_bob: Vec<u8> = payload(6 * 1024 * 1024 + 1234).into_iter().rev().collect();
    let alice_path = dir.path().join("from_alice.bin");
    let bob_path = dir.path().join("from_bob.bin");
    tokio::fs::write(&alice_path, &from_alice).await.unwrap();
    tokio::fs::write(&bob_path, &from_bob).await.unwrap();

    alice.commands.send(AppCommand::SendFile(alice_path)).await.unwrap();
    bob.commands.send(AppCommand::SendFile(bob_path)).await.unwrap();

    bob.wait_for_within(LONG_WAIT, is_saved).await;
    alice.wait_for_within(LONG_WAIT, is_saved).await;

    let at_bob = bob_sink.files.lock().await;
    assert_eq!(at_bob.len(), 1);
    assert_eq!(at_bob[0].metadata.name, "from_alice.bin");
    assert!(at_bob[0].data[..] == from_alice[..]);

    let at_alice = alice_sink.files.lock().await;
    assert_eq!(at_alice.len(), 1);
    assert_eq!(at_alice[0].metadata.name, "from_bob.bin");
    assert!(at_alice[0].data[..] == from_bob[..]);
}

#[tokio::test]
async fn test_sends_queue_in_order() {
    let sink = CaptureSink::default();
    let (_network, mut initiator, joiner) = connected_pair(sink.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let names = ["one.txt", "two.txt", "three.txt"];
    for name in names {
        let path = dir.path().join(name);
        tokio::fs::write(&path, name.as_bytes()).await.unwrap();
        joiner.commands.send(AppCommand::SendFile(path)).await.unwrap();
    }

    for _ in names {
        initiator.wait_for(is_saved).await;
    }
    let received: Vec<String> = sink
        .files
        .lock()
        .await
        .iter()
        .map(|f| f.metadata.name.clone())
        .collect();
    assert_eq!(received, names);
}

#[tokio::test]
async fn test_sending_a_directory_keeps_the_session() {
    let sink = CaptureSink::default();
    let (_network, mut initiator, mut joiner) = connected_pair(sink.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    joiner
        .commands
        .send(AppCommand::SendFile(dir.path().to_path_buf()))
        .await
        .unwrap();
    match joiner.wait_for(|e| matches!(e, AppEvent::Error(_))).await {
        AppEvent::Error(msg) => {
            assert!(msg.starts_with("Could not send"), "{}", msg);
            assert!(!msg.contains("Try refreshing"), "{}", msg);
        }
        _ => unreachable!(),
    }

    // The peer never saw a transfer start, and a real file still goes through
    let path = dir.path().join("real.txt");
    tokio::fs::write(&path, b"contents").await.unwrap();
    joiner.commands.send(AppCommand::SendFile(path)).await.unwrap();

    match initiator
        .wait_for(|e| matches!(e, AppEvent::TransferStarted { .. }))
        .await
    {
        AppEvent::TransferStarted { file_name, .. } => assert_eq!(file_name, "real.txt"),
        _ => unreachable!(),
    }
    initiator.wait_for(is_saved).await;

    let files = sink.files.lock().await;
    assert_eq!(files.len(), 1);
    assert_eq!(&files[0].data[..], b"contents");
}
