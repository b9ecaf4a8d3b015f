use anyhow::Result;
use blake3::Hasher;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::constants::MAX_CHUNK_SIZE;
use super::progress::ProgressReporter;
use super::protocol::{TransferMetadata, WireMessage};
use crate::AppEvent;
use crate::channel::MessageChannel;

/// Failures on the sending side that have nothing to do with the
/// connection. The session stays usable after any of these.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Chunk size must be between 1 and {max} bytes, got {size}")]
    ChunkSizeOutOfRange { size: usize, max: usize },
    #[error("Failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a regular file", .0.display())]
    NotAFile(PathBuf),
    #[error("{} has no usable file name", .0.display())]
    InvalidFileName(PathBuf),
    #[error("Failed to read the source file")]
    Read(#[source] std::io::Error),
    #[error("Source ended after {read} of {expected} bytes")]
    SourceTruncated { read: u64, expected: u64 },
}

/// What a finished send produced.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub metadata: TransferMetadata,
    pub chunks_sent: u64,
    /// BLAKE3 hex digest of the bytes sent
    pub digest: String,
}

/// Number of chunk messages a file of `size` bytes produces.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

pub fn check_chunk_size(chunk_size: usize) -> Result<(), TransferError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::ChunkSizeOutOfRange {
            size: chunk_size,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok(())
}

/// Send a file from disk to the peer.
///
/// Nothing goes out unless `file_path` opens as a regular file.
///
/// # Arguments
/// * `channel` - The open channel to the peer
/// * `file_path` - File to send
/// * `chunk_size` - Slice size, at most [`MAX_CHUNK_SIZE`]
/// * `event_tx` - Channel to send progress events to the UI
pub async fn send_file<C: MessageChannel>(
    channel: &C,
    file_path: &Path,
    chunk_size: usize,
    event_tx: &mpsc::Sender<AppEvent>,
) -> Result<TransferSummary> {
    let open_err = |source| TransferError::Open {
        path: file_path.to_path_buf(),
        source,
    };
    let file = File::open(file_path).await.map_err(open_err)?;
    let file_meta = file.metadata().await.map_err(open_err)?;
    if !file_meta.is_file() {
        return Err(TransferError::NotAFile(file_path.to_path_buf()).into());
    }
    let name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidFileName(file_path.to_path_buf()))?
        .to_string();

    let metadata = TransferMetadata {
        name,
        size: file_meta.len(),
        mime_type: guess_mime_type(file_path).to_string(),
    };

    send_reader(channel, metadata, file, chunk_size, event_tx).await
}

/// Stream `metadata.size` bytes from `reader` as metadata, chunks, end.
pub async fn send_reader<C, R>(
    channel: &C,
    metadata: TransferMetadata,
    mut reader: R,
    chunk_size: usize,
    event_tx: &mpsc::Sender<AppEvent>,
) -> Result<TransferSummary>
where
    C: MessageChannel,
    R: AsyncRead + Unpin + Send,
{
    check_chunk_size(chunk_size)?;

    let file_size = metadata.size;
    info!(
        "Sending file: {} ({} bytes, {}) to {}",
        metadata.name,
        file_size,
        metadata.mime_type,
        channel.peer()
    );
    let _ = event_tx
        .send(AppEvent::TransferStarted {
            file_name: metadata.name.clone(),
            file_size,
            is_sending: true,
        })
        .await;

    channel.send(WireMessage::Metadata(metadata.clone())).await?;

    let mut progress = ProgressReporter::new(event_tx.clone(), &metadata.name, file_size, true);
    let mut hasher = Hasher::new();
    let mut offset: u64 = 0;
    let mut chunks_sent: u64 = 0;

    while offset < file_size {
        let want = chunk_size.min((file_size - offset) as usize);
        let mut slice = vec![0u8; want];
        let n = read_slice(&mut reader, &mut slice)
            .await
            .map_err(TransferError::Read)?;
        if n == 0 {
            return Err(TransferError::SourceTruncated {
                read: offset,
                expected: file_size,
            }
            .into());
        }
        slice.truncate(n);
        hasher.update(&slice);

        channel.send(WireMessage::Chunk(Bytes::from(slice))).await?;
        offset += n as u64;
        chunks_sent += 1;
        debug!(offset, chunk = chunks_sent, "chunk sent");

        progress.update(offset).await;
    }

    channel.send(WireMessage::End).await?;
    if file_size == 0 {
        progress.update(0).await;
    }

    let digest = hasher.finalize().to_hex().to_string();
    info!("File sent successfully: {} ({} chunks)", metadata.name, chunks_sent);
    let _ = event_tx
        .send(AppEvent::TransferCompleted {
            file_name: metadata.name.clone(),
            digest: digest.clone(),
            is_sending: true,
        })
        .await;

    Ok(TransferSummary {
        metadata,
        chunks_sent,
        digest,
    })
}

/// Fill `buf` from `reader`, stopping early only at end of input.
async fn read_slice<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// MIME type from the file extension, `application/octet-stream` if unknown
pub fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("7z") => "application/x-7z-compressed",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("heic") => "image/heic",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}
