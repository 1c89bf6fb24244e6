//! Wire protocol for direct channels
//!
//! Every frame is a 4-byte big-endian length followed by a postcard-encoded
//! [`WireFrame`]. The first frame in each direction is a handshake.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use overlink_core::HandshakeInfo;

/// Maximum encoded frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Frames exchanged on a direct channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFrame {
    /// Node information, first frame in each direction
    Handshake(HandshakeInfo),
    /// One application message
    Data(Bytes),
    /// Health check request
    Ping(u64),
    /// Health check answer echoing the ping nonce
    Pong(u64),
    /// Clean close announcement
    Goodbye,
}

/// Frame a message for wire transmission
///
/// Returns the framed message as bytes (length-prefixed).
pub fn frame_message(frame: &WireFrame, max_size: usize) -> Result<Bytes, FramingError> {
    let serialized =
        postcard::to_allocvec(frame).map_err(|e| FramingError::Serialization(e.to_string()))?;

    if serialized.len() > max_size {
        return Err(FramingError::MessageTooLarge {
            size: serialized.len(),
            max: max_size,
        });
    }

    let len = serialized.len() as u32;
    let mut framed = Vec::with_capacity(LENGTH_PREFIX + serialized.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&serialized);

    Ok(Bytes::from(framed))
}

/// Parse a framed message from bytes
///
/// Expects length-prefixed format.
pub fn parse_framed_message(data: &[u8], max_size: usize) -> Result<WireFrame, FramingError> {
    if data.len() < LENGTH_PREFIX {
        return Err(FramingError::InsufficientData {
            needed: LENGTH_PREFIX,
            available: data.len(),
        });
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if len > max_size {
        return Err(FramingError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    if data.len() < LENGTH_PREFIX + len {
        return Err(FramingError::InsufficientData {
            needed: LENGTH_PREFIX + len,
            available: data.len(),
        });
    }

    postcard::from_bytes(&data[LENGTH_PREFIX..LENGTH_PREFIX + len])
        .map_err(|e| FramingError::Deserialization(e.to_string()))
}

/// Read one frame from a stream
///
/// A clean end of stream before the length prefix yields
/// [`FramingError::EndOfStream`]; not cancel safe.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<WireFrame, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    if let Err(e) = reader.read_exact(&mut prefix).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FramingError::EndOfStream,
            _ => FramingError::Io(e.to_string()),
        });
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_size {
        return Err(FramingError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| FramingError::Io(e.to_string()))?;

    postcard::from_bytes(&body).map_err(|e| FramingError::Deserialization(e.to_string()))
}

/// Write one frame to a stream and flush it
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &WireFrame,
    max_size: usize,
) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(frame, max_size)?;
    writer
        .write_all(&framed)
        .await
        .map_err(|e| FramingError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| FramingError::Io(e.to_string()))
}

/// Errors that can occur during message framing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Insufficient data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("End of stream")]
    EndOfStream,
}

#[cfg(test)]
mod tests {
    use overlink_core::InstanceNodeId;

    use super::*;

    #[test]
    fn test_wire_frame_roundtrip() {
        let frame = WireFrame::Ping(42);
        let framed = frame_message(&frame, MAX_FRAME_SIZE).unwrap();
        let parsed = parse_framed_message(&framed, MAX_FRAME_SIZE).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_handshake_frame() {
        let info = HandshakeInfo::new(InstanceNodeId::generate().new_session(), "node-a");
        let framed = frame_message(&WireFrame::Handshake(info.clone()), MAX_FRAME_SIZE).unwrap();
        match parse_framed_message(&framed, MAX_FRAME_SIZE).unwrap() {
            WireFrame::Handshake(parsed) => assert_eq!(parsed, info),
            other => panic!("Wrong frame type: {other:?}"),
        }
    }

    #[test]
    fn test_message_too_large() {
        let frame = WireFrame::Data(Bytes::from(vec![0u8; 1025]));
        let result = frame_message(&frame, 1024);
        assert!(matches!(result, Err(FramingError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_insufficient_data() {
        let framed = frame_message(&WireFrame::Goodbye, MAX_FRAME_SIZE).unwrap();
        let result = parse_framed_message(&framed[..framed.len() - 1], MAX_FRAME_SIZE);
        assert!(matches!(result, Err(FramingError::InsufficientData { .. })));
        assert!(matches!(
            parse_framed_message(&[0, 0], MAX_FRAME_SIZE),
            Err(FramingError::InsufficientData { needed: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let payload = Bytes::from(vec![7u8; 2 * 1024 * 1024]);

        let writer = tokio::spawn(async move {
            write_frame(&mut a, &WireFrame::Data(payload), MAX_FRAME_SIZE)
                .await
                .unwrap();
            write_frame(&mut a, &WireFrame::Goodbye, MAX_FRAME_SIZE)
                .await
                .unwrap();
        });

        match read_frame(&mut b, MAX_FRAME_SIZE).await.unwrap() {
            WireFrame::Data(data) => {
                assert_eq!(data.len(), 2 * 1024 * 1024);
                assert!(data.iter().all(|b| *b == 7));
            }
            other => panic!("Wrong frame type: {other:?}"),
        }
        assert_eq!(
            read_frame(&mut b, MAX_FRAME_SIZE).await.unwrap(),
            WireFrame::Goodbye
        );
        writer.await.unwrap();
        assert_eq!(
            read_frame(&mut b, MAX_FRAME_SIZE).await,
            Err(FramingError::EndOfStream)
        );
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_prefix() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&(2048u32).to_be_bytes()).await.unwrap();
        let result = read_frame(&mut b, 1024).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge { size: 2048, .. })));
    }
}
