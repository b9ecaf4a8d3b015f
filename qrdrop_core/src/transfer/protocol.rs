use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{MAX_MSG_SIZE, PROTOCOL_MAGIC};

/// Description of a file in transit, sent ahead of its chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    pub mime_type: String,
}

/// Application-level messages exchanged over a channel.
///
/// Every message carries an explicit tag, so a chunk payload can never be
/// mistaken for a control message whatever its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Opens a transfer
    Metadata(TransferMetadata),
    /// One slice of the file, in send order
    Chunk(Bytes),
    /// Closes the transfer opened by the last `Metadata`
    End,
}

impl WireMessage {
    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Metadata(_) => "metadata",
            WireMessage::Chunk(_) => "chunk",
            WireMessage::End => "end",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },
    #[error("Failed to encode {kind} message")]
    Encode {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("Failed to decode message")]
    Decode(#[source] bincode::Error),
    #[error("Peer does not speak the qrdrop protocol")]
    BadPreamble,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode a message into its binary envelope.
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(msg).map_err(|source| ProtocolError::Encode {
        kind: msg.kind(),
        source,
    })?;
    if body.len() > MAX_MSG_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            len: body.len(),
            max: MAX_MSG_SIZE,
        });
    }
    Ok(body)
}

/// Decode a binary envelope produced by [`encode`].
pub fn decode(body: &[u8]) -> Result<WireMessage, ProtocolError> {
    if body.len() > MAX_MSG_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            len: body.len(),
            max: MAX_MSG_SIZE,
        });
    }
    bincode::deserialize(body).map_err(ProtocolError::Decode)
}

/// Write one length-prefixed message to a byte stream.
pub async fn write_frame<W>(writer: &mut W, msg: &WireMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode(msg)?;
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    Ok(())
}

/// Read one length-prefixed message from a byte stream.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
/// A stream that ends inside a frame, length prefix included, is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireMessage>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < len_buf.len() {
        reader.read_exact(&mut len_buf[first..]).await?;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MSG_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            len,
            max: MAX_MSG_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body).map(Some)
}

/// Announce the protocol at the start of a fresh stream.
pub async fn write_preamble<W>(writer: &mut W) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(PROTOCOL_MAGIC).await?;
    Ok(())
}

/// Check the announcement written by [`write_preamble`].
pub async fn read_preamble<R>(reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; PROTOCOL_MAGIC.len()];
    reader.read_exact(&mut magic).await?;
    if &magic[..] != PROTOCOL_MAGIC {
        return Err(ProtocolError::BadPreamble);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::constants::MAX_CHUNK_SIZE;

    #[test]
    fn test_full_chunk_fits_in_frame() {
        let msg = WireMessage::Chunk(Bytes::from(vec![0xAB; MAX_CHUNK_SIZE]));
        let body = encode(&msg).expect("max chunk should encode");
        assert!(body.len() <= MAX_MSG_SIZE);
        assert_eq!(decode(&body).unwrap(), msg);
    }

    #[test]
    fn test_chunk_resembling_control_message_stays_a_chunk() {
        let end_body = encode(&WireMessage::End).unwrap();
        let msg = WireMessage::Chunk(Bytes::from(end_body));
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert!(matches!(decoded, WireMessage::Chunk(_)));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let msg = WireMessage::Chunk(Bytes::from(vec![0u8; MAX_MSG_SIZE + 1]));
        let err = encode(&msg).unwrap_err();
        assert!(err.to_string().contains("Message too large"));
    }

    #[tokio::test]
    async fn test_frames_over_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let metadata = WireMessage::Metadata(TransferMetadata {
            name: "photo.jpg".to_string(),
            size: 3,
            mime_type: "image/jpeg".to_string(),
        });

        let writer = tokio::spawn(async move {
            write_frame(&mut a, &metadata).await.unwrap();
            write_frame(&mut a, &WireMessage::Chunk(Bytes::from_static(b"abc")))
                .await
                .unwrap();
            write_frame(&mut a, &WireMessage::End).await.unwrap();
        });

        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert!(matches!(first, WireMessage::Metadata(ref m) if m.name == "photo.jpg"));
        let second = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(second, WireMessage::Chunk(Bytes::from_static(b"abc")));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(WireMessage::End));

        writer.await.unwrap();
        // Writer half dropped: clean end of stream
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_large_length_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bad_len = (MAX_MSG_SIZE as u32 + 1000).to_be_bytes();
        a.write_all(&bad_len).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("Message too large"), "{}", err);
    }

    #[tokio::test]
    async fn test_truncated_length_prefix_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0u8, 0]).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(
            matches!(&err, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof),
            "{}",
            err
        );
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&16u32.to_be_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);

        assert!(matches!(read_frame(&mut b).await, Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn test_preamble_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"HTTP/1.1").await.unwrap();
        assert!(matches!(
            read_preamble(&mut b).await,
            Err(ProtocolError::BadPreamble)
        ));
    }
}
