use anyhow::Result;
use qrdrop_core::transfer::DownloadDir;
use qrdrop_core::{AppCommand, AppConfig, AppEvent, Role, run_backend};
use qrdrop_wan::{IrohEndpoint, generate_session_key};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod ui;

use ui::Console;

/// `qrdrop` shows a link and QR code to scan; `qrdrop <link>` joins it.
#[tokio::main]
async fn main() -> Result<()> {
    // 0. Initialize logging (stderr, so the QR code on stdout stays clean)
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // 1. Config and role
    let config = AppConfig::load();
    config.validate()?;
    let link = std::env::args().nth(1);
    let role = Role::from_link(link.as_deref());
    tracing::info!("Starting as {:?}", role);

    // 2. Create channels (bounded with capacity 1000 for backpressure)
    let (tx_cmd, rx_cmd) = mpsc::channel::<AppCommand>(1000);
    let (tx_event, mut rx_event) = mpsc::channel::<AppEvent>(1000);

    // 3. Fresh identity and endpoint for this session
    let endpoint = IrohEndpoint::bind(generate_session_key())
        .await?
        .with_monitor(tx_event.clone());
    let endpoint = Arc::new(endpoint);

    // 4. Spawn backend
    let cancel = CancellationToken::new();
    let mut backend = tokio::spawn(run_backend(
        endpoint.clone(),
        role,
        config.clone(),
        DownloadDir::new(&config.download_path),
        rx_cmd,
        tx_event,
        cancel.clone(),
    ));

    // 5. Input: stdin commands and Ctrl+C
    tokio::spawn(ui::read_commands(tx_cmd));
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    // 6. Print events until the session ends
    let mut console = Console::new(&config.download_path);
    let joined = loop {
        tokio::select! {
            Some(event) = rx_event.recv() => console.show(event),
            joined = &mut backend => break joined,
        }
    };
    while let Ok(event) = rx_event.try_recv() {
        console.show(event);
    }

    endpoint.close().await;
    joined?
}
