//! Reassembly of incoming transfers.
//!
//! [`TransferReceiver`] is a small state machine fed one [`WireMessage`] at a
//! time: `Idle` → metadata → `Receiving` → end → `Idle`. Chunks are kept in
//! arrival order and concatenated when the end marker arrives.

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::constants::{DEFAULT_MAX_FILE_SIZE, MAX_FILENAME_LENGTH};
use super::hash::digest_hex;
use super::protocol::{TransferMetadata, WireMessage};

/// A fully reassembled file.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub metadata: TransferMetadata,
    pub data: Bytes,
    /// BLAKE3 hex digest of `data`
    pub digest: String,
}

#[derive(Debug)]
enum ReceiveState {
    Idle,
    Receiving {
        metadata: TransferMetadata,
        chunks: Vec<Bytes>,
        received: u64,
    },
    /// Draining a transfer we refused, until its end marker
    Skipping { name: String },
}

/// What a single message did to the receiver.
#[derive(Debug)]
pub enum ReceiveOutcome {
    Started(TransferMetadata),
    Buffered { received: u64, total: u64 },
    Completed(ReceivedFile),
    Rejected { name: String, reason: String },
    Discarded,
}

pub struct TransferReceiver {
    state: ReceiveState,
    max_file_size: u64,
}

impl Default for TransferReceiver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE)
    }
}

impl TransferReceiver {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            state: ReceiveState::Idle,
            max_file_size,
        }
    }

    /// Whether a transfer has started and not yet ended.
    pub fn is_receiving(&self) -> bool {
        matches!(self.state, ReceiveState::Receiving { .. })
    }

    /// Metadata of the transfer in progress.
    pub fn current(&self) -> Option<&TransferMetadata> {
        match &self.state {
            ReceiveState::Receiving { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    /// Bytes buffered for the transfer in progress.
    pub fn buffered_bytes(&self) -> u64 {
        match &self.state {
            ReceiveState::Receiving { received, .. } => *received,
            _ => 0,
        }
    }

    pub fn handle(&mut self, msg: WireMessage) -> ReceiveOutcome {
        match msg {
            WireMessage::Metadata(metadata) => self.on_metadata(metadata),
            WireMessage::Chunk(chunk) => self.on_chunk(chunk),
            WireMessage::End => self.on_end(),
        }
    }

    fn on_metadata(&mut self, metadata: TransferMetadata) -> ReceiveOutcome {
        if let ReceiveState::Receiving {
            metadata: previous,
            received,
            ..
        } = &self.state
        {
            warn!(
                "New transfer started before {} finished; dropping {} buffered bytes",
                previous.name, received
            );
        }

        if let Err(reason) = validate_metadata(&metadata, self.max_file_size) {
            warn!("Refusing transfer: {}", reason);
            self.state = ReceiveState::Skipping {
                name: metadata.name.clone(),
            };
            return ReceiveOutcome::Rejected {
                name: metadata.name,
                reason,
            };
        }

        info!(
            "Receiving: {} ({} bytes, {})",
            metadata.name, metadata.size, metadata.mime_type
        );
        self.state = ReceiveState::Receiving {
            metadata: metadata.clone(),
            chunks: Vec::new(),
            received: 0,
        };
        ReceiveOutcome::Started(metadata)
    }

    fn on_chunk(&mut self, chunk: Bytes) -> ReceiveOutcome {
        match &mut self.state {
            ReceiveState::Receiving {
                metadata,
                chunks,
                received,
            } => {
                let total = *received + chunk.len() as u64;
                if total > self.max_file_size {
                    let reason = format!(
                        "{} exceeded the {} byte limit while receiving",
                        metadata.name, self.max_file_size
                    );
                    warn!("Aborting transfer: {}", reason);
                    let name = metadata.name.clone();
                    self.state = ReceiveState::Skipping { name: name.clone() };
                    return ReceiveOutcome::Rejected { name, reason };
                }

                *received = total;
                chunks.push(chunk);
                debug!(received = total, total = metadata.size, "chunk buffered");
                ReceiveOutcome::Buffered {
                    received: total,
                    total: metadata.size,
                }
            }
            ReceiveState::Skipping { name } => {
                debug!(file = %name, len = chunk.len(), "dropping chunk of refused transfer");
                ReceiveOutcome::Discarded
            }
            ReceiveState::Idle => {
                warn!("Discarding {} byte chunk received outside a transfer", chunk.len());
                ReceiveOutcome::Discarded
            }
        }
    }

    fn on_end(&mut self) -> ReceiveOutcome {
        match std::mem::replace(&mut self.state, ReceiveState::Idle) {
            ReceiveState::Receiving {
                metadata,
                chunks,
                received,
            } => {
                if received != metadata.size {
                    warn!(
                        "{} declared {} bytes but {} arrived",
                        metadata.name, metadata.size, received
                    );
                }

                let mut data = BytesMut::with_capacity(received as usize);
                for chunk in &chunks {
                    data.extend_from_slice(chunk);
                }
                let data = data.freeze();
                let digest = digest_hex(&data);

                info!("File transfer complete: {} ({} bytes)", metadata.name, received);
                ReceiveOutcome::Completed(ReceivedFile {
                    metadata,
                    data,
                    digest,
                })
            }
            ReceiveState::Skipping { name } => {
                debug!(file = %name, "refused transfer ended");
                ReceiveOutcome::Discarded
            }
            ReceiveState::Idle => {
                warn!("Discarding end marker received outside a transfer");
                ReceiveOutcome::Discarded
            }
        }
    }
}

/// Check declared metadata against the receiver's limits
pub fn validate_metadata(metadata: &TransferMetadata, max_file_size: u64) -> Result<(), String> {
    if metadata.size > max_file_size {
        return Err(format!(
            "File rejected: {} ({} bytes) exceeds maximum allowed size of {} bytes",
            metadata.name, metadata.size, max_file_size
        ));
    }

    if metadata.name.len() > MAX_FILENAME_LENGTH {
        return Err(format!(
            "File rejected: Filename too long ({} chars, max {})",
            metadata.name.len(),
            MAX_FILENAME_LENGTH
        ));
    }
    Ok(())
}
