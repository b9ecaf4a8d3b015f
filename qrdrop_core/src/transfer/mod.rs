//! Chunked file transfer over a [`MessageChannel`](crate::channel::MessageChannel).
//!
//! This module provides:
//! - The wire envelope (metadata / chunk / end) and its stream framing
//! - The sender, which slices a file into bounded chunks
//! - The receiver state machine, which reassembles them
//! - The save collaborator for completed files

pub mod constants;
pub mod hash;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod sink;

// Re-export public API
pub use constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use protocol::{TransferMetadata, WireMessage};
pub use receiver::{ReceiveOutcome, ReceivedFile, TransferReceiver};
pub use sender::{TransferError, TransferSummary, send_file, send_reader};
pub use sink::{DownloadDir, FileSink};
