//! MessageBlock wire codec
//!
//! Layout of one block, all integers big-endian:
//!
//! ```text
//! [channel id: u32][block type: u8][payload length: u32][payload]
//! ```
//!
//! One block per frame, no batching. A connection starts with the 8-byte
//! [`PROTOCOL_HEADER`] in each direction.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use overlink_core::UplinkError;

/// Sent by both sides before the first block
pub const PROTOCOL_HEADER: &[u8; 8] = b"OVLKUP01";

/// Bytes before the payload
pub const BLOCK_HEADER_LEN: usize = 9;

/// Largest payload a block may carry
pub const MAX_BLOCK_PAYLOAD: usize = 256 * 1024;

/// The always-open control channel
pub const DEFAULT_CHANNEL_ID: u32 = 0;

/// Kind of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    Data = 1,
    ChannelOpen = 2,
    ChannelClose = 3,
    Heartbeat = 4,
    Error = 5,
    Handshake = 6,
    Goodbye = 7,
}

impl TryFrom<u8> for BlockType {
    type Error = BlockCodecError;

    fn try_from(value: u8) -> Result<Self, BlockCodecError> {
        Ok(match value {
            1 => Self::Data,
            2 => Self::ChannelOpen,
            3 => Self::ChannelClose,
            4 => Self::Heartbeat,
            5 => Self::Error,
            6 => Self::Handshake,
            7 => Self::Goodbye,
            other => return Err(BlockCodecError::UnknownBlockType(other)),
        })
    }
}

/// Atomic unit of the multiplexed protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub channel_id: u32,
    pub block_type: BlockType,
    pub payload: Bytes,
}

impl MessageBlock {
    pub fn new(channel_id: u32, block_type: BlockType, payload: impl Into<Bytes>) -> Self {
        Self {
            channel_id,
            block_type,
            payload: payload.into(),
        }
    }

    pub fn data(channel_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(channel_id, BlockType::Data, payload)
    }

    pub fn close(channel_id: u32) -> Self {
        Self::new(channel_id, BlockType::ChannelClose, Bytes::new())
    }

    pub fn error(channel_id: u32, message: &str) -> Self {
        Self::new(channel_id, BlockType::Error, Bytes::copy_from_slice(message.as_bytes()))
    }

    pub fn heartbeat() -> Self {
        Self::new(DEFAULT_CHANNEL_ID, BlockType::Heartbeat, Bytes::new())
    }

    /// Header plus payload
    pub fn encode(&self, max_payload: usize) -> Result<Bytes, BlockCodecError> {
        if self.payload.len() > max_payload {
            return Err(BlockCodecError::PayloadTooLarge {
                size: self.payload.len(),
                max: max_payload,
            });
        }
        let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.channel_id.to_be_bytes());
        out.push(self.block_type as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(Bytes::from(out))
    }

    /// Decode one complete block from `data`
    pub fn decode(data: &[u8], max_payload: usize) -> Result<Self, BlockCodecError> {
        if data.len() < BLOCK_HEADER_LEN {
            return Err(BlockCodecError::Truncated {
                needed: BLOCK_HEADER_LEN,
                available: data.len(),
            });
        }
        let (channel_id, block_type, len) = parse_header(&data[..BLOCK_HEADER_LEN], max_payload)?;
        let available = data.len() - BLOCK_HEADER_LEN;
        if available != len {
            return Err(BlockCodecError::Truncated {
                needed: BLOCK_HEADER_LEN + len,
                available: data.len(),
            });
        }
        Ok(Self {
            channel_id,
            block_type,
            payload: Bytes::copy_from_slice(&data[BLOCK_HEADER_LEN..]),
        })
    }
}

fn parse_header(header: &[u8], max_payload: usize) -> Result<(u32, BlockType, usize), BlockCodecError> {
    let channel_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let block_type = BlockType::try_from(header[4])?;
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > max_payload {
        return Err(BlockCodecError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }
    Ok((channel_id, block_type, len))
}

/// Read one block; not cancel safe
pub async fn read_block<R>(reader: &mut R, max_payload: usize) -> Result<MessageBlock, BlockCodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; BLOCK_HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => BlockCodecError::EndOfStream,
            _ => BlockCodecError::Io(e.to_string()),
        });
    }
    let (channel_id, block_type, len) = parse_header(&header, max_payload)?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| BlockCodecError::Io(e.to_string()))?;

    Ok(MessageBlock {
        channel_id,
        block_type,
        payload: Bytes::from(payload),
    })
}

/// Write one block without flushing
pub async fn write_block<W>(
    writer: &mut W,
    block: &MessageBlock,
    max_payload: usize,
) -> Result<(), BlockCodecError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = block.encode(max_payload)?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| BlockCodecError::Io(e.to_string()))
}

/// Send the protocol header
pub async fn write_protocol_header<W>(writer: &mut W) -> Result<(), BlockCodecError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(PROTOCOL_HEADER)
        .await
        .map_err(|e| BlockCodecError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| BlockCodecError::Io(e.to_string()))
}

/// Receive and check the protocol header
pub async fn read_protocol_header<R>(reader: &mut R) -> Result<(), BlockCodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; PROTOCOL_HEADER.len()];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| BlockCodecError::Io(e.to_string()))?;
    if &header != PROTOCOL_HEADER {
        return Err(BlockCodecError::BadProtocolHeader(header.to_vec()));
    }
    Ok(())
}

/// Errors while encoding or decoding blocks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockCodecError {
    #[error("Block payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Unknown block type {0:#04x}")]
    UnknownBlockType(u8),

    #[error("Truncated block: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Bad protocol header {0:02x?}")]
    BadProtocolHeader(Vec<u8>),

    #[error("IO error: {0}")]
    Io(String),

    #[error("End of stream")]
    EndOfStream,
}

impl From<BlockCodecError> for UplinkError {
    fn from(err: BlockCodecError) -> Self {
        match err {
            BlockCodecError::PayloadTooLarge { size, max } => UplinkError::BlockTooLarge { size, max },
            BlockCodecError::Io(e) => UplinkError::Io(e),
            BlockCodecError::EndOfStream => UplinkError::Io("end of stream".into()),
            other => UplinkError::Protocol(other.to_string()),
        }
    }
}
