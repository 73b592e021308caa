//! Wire framing
//!
//! A frame is a 4-byte big-endian length followed by the CBOR encoding of a
//! `Message`. Frames larger than the configured limit are rejected on both
//! the read and the write side.

use crate::{ChannelError, Message, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for a single encoded message
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message into a complete frame
pub fn encode_frame(message: &Message, max_frame_size: usize) -> Result<BytesMut> {
    let mut encoded = Vec::new();
    ciborium::ser::into_writer(message, &mut encoded)
        .map_err(|e| ChannelError::Encoding(e.to_string()))?;

    if encoded.len() > max_frame_size {
        return Err(ChannelError::FrameTooLarge {
            size: encoded.len(),
            limit: max_frame_size,
        });
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + encoded.len());
    frame.put_u32(encoded.len() as u32);
    frame.put_slice(&encoded);
    Ok(frame)
}

/// Decode a frame body (without the length prefix)
pub fn decode_body(body: &[u8]) -> Result<Message> {
    ciborium::de::from_reader(body).map_err(|e| ChannelError::Encoding(e.to_string()))
}

/// Write one message as a frame
pub async fn write_message<W>(writer: &mut W, message: &Message, max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message, max_frame_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message; `Ok(None)` on a clean end of stream
pub async fn read_message<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > max_frame_size {
        return Err(ChannelError::FrameTooLarge {
            size: len,
            limit: max_frame_size,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}
