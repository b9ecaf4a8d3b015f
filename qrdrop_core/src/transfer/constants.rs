/// Default slice size for outgoing files (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk a peer may send (64KB)
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Largest encoded message: one full chunk plus room for the envelope
pub const MAX_MSG_SIZE: usize = MAX_CHUNK_SIZE + 1024;

/// Incoming files are buffered in memory until the end marker (1GB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

pub const MAX_FILENAME_LENGTH: usize = 255;

/// Progress is reported every time this many bytes have moved (1MB)
pub const PROGRESS_INTERVAL: u64 = 1024 * 1024;

/// Written once at the start of every stream-backed channel
pub const PROTOCOL_MAGIC: &[u8] = b"QRDROP\x01";
