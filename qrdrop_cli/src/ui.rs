use qrcode::QrCode;
use qrcode::render::unicode::Dense1x2;
use qrdrop_core::{AppCommand, AppEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const HELP: &str = "Commands: send <path> (or just a path), quit";

/// Render `data` as a QR code made of unicode half blocks
pub fn render_qr(data: &str) -> Option<String> {
    let code = QrCode::new(data.as_bytes()).ok()?;
    // Inverted so it scans on dark terminal themes
    Some(
        code.render::<Dense1x2>()
            .dark_color(Dense1x2::Light)
            .light_color(Dense1x2::Dark)
            .quiet_zone(true)
            .build(),
    )
}

/// Turn one line of user input into a command
pub fn parse_command(line: &str) -> Option<AppCommand> {
    let line = line.trim();
    match line {
        "" => None,
        "quit" | "exit" | "q" => Some(AppCommand::Shutdown),
        _ => {
            let path = line.strip_prefix("send ").map(str::trim).unwrap_or(line);
            // Drag-and-drop into a terminal often quotes the path
            let path = path.trim_matches(|c| c == '\'' || c == '"');
            if path.is_empty() {
                None
            } else {
                Some(AppCommand::SendFile(PathBuf::from(path)))
            }
        }
    }
}

/// Forward stdin lines as commands until stdin or the backend closes
pub async fn read_commands(cmd_tx: mpsc::Sender<AppCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(cmd) = parse_command(&line) else {
            continue;
        };
        if cmd_tx.send(cmd).await.is_err() {
            break;
        }
    }
}

/// Prints backend events for a human.
pub struct Console {
    download_dir: PathBuf,
    /// Last progress decile printed per transfer
    progress: HashMap<(String, bool), u32>,
}

impl Console {
    pub fn new(download_dir: &Path) -> Self {
        Self {
            download_dir: download_dir.to_path_buf(),
            progress: HashMap::new(),
        }
    }

    pub fn show(&mut self, event: AppEvent) {
        match event {
            AppEvent::Status(msg) => println!("{}", msg),
            AppEvent::ShareLinkReady { id, link } => {
                println!("Scan to connect, or run `qrdrop {}` on the other device:", link);
                if let Some(qr) = render_qr(&link) {
                    println!("{}", qr);
                }
                println!("Code: {}", id);
            }
            AppEvent::ConnectionOpened { peer } => {
                println!("Connected to {}", peer);
                println!("{}", HELP);
                println!("Received files go to {}", self.download_dir.display());
            }
            AppEvent::ConnectionClosed => println!("Connection closed"),
            AppEvent::ConnectionInfo {
                connection_type,
                rtt_ms,
            } => {
                tracing::debug!(%connection_type, ?rtt_ms, "connection info");
            }
            AppEvent::TransferStarted {
                file_name,
                file_size,
                is_sending,
            } => {
                self.progress.insert((file_name.clone(), is_sending), 0);
                let verb = if is_sending { "Sending" } else { "Receiving" };
                println!("{} {} ({} bytes)", verb, file_name, file_size);
            }
            AppEvent::TransferProgress {
                file_name,
                progress,
                speed,
                is_sending,
                ..
            } => {
                let decile = (progress / 10.0) as u32;
                let last = self.progress.entry((file_name.clone(), is_sending)).or_insert(0);
                if decile > *last {
                    *last = decile;
                    println!("  {} {:>5.1}% {}", file_name, progress, speed);
                }
            }
            AppEvent::TransferCompleted {
                file_name,
                digest,
                is_sending,
            } => {
                self.progress.remove(&(file_name.clone(), is_sending));
                let verb = if is_sending { "Sent" } else { "Received" };
                println!("{} {} (blake3 {})", verb, file_name, digest);
            }
            AppEvent::FileSaved {
                file_name,
                saved_path,
            } => println!("Saved {} to {}", file_name, saved_path.display()),
            AppEvent::Error(msg) => eprintln!("[ERROR] {}", msg),
        }
    }
}
