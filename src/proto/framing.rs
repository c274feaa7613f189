//! Length-prefixed message frames.
//!
//! A frame is a 4-byte big-endian payload length followed by one MessagePack
//! object. Before the first frame a client sends its raw 64-byte key.

use super::messages::Message;
use crate::codec;
use crate::error::VelesError;
use crate::schema::{FromValue, IntoValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame payload unless configured otherwise
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Width of the shared authentication key
pub const KEY_SIZE: usize = 64;

pub fn encode_message(msg: Message) -> Vec<u8> {
    codec::encode(&msg.into_value())
}

pub fn decode_message(payload: &[u8]) -> Result<Message, VelesError> {
    Message::from_value(codec::decode(payload)?)
}

/// Read one frame payload; `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>, VelesError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(VelesError::schema(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, max_size
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), VelesError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| VelesError::schema(format!("frame of {} bytes is too large", payload.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one message; `None` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> Result<Option<Message>, VelesError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_size).await? {
        Some(payload) => decode_message(&payload).map(Some),
        None => Ok(None),
    }
}

pub async fn write_message<W>(writer: &mut W, msg: Message) -> Result<(), VelesError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &encode_message(msg)).await
}

/// Compare two keys without an early exit.
pub fn keys_match(a: &[u8; KEY_SIZE], b: &[u8; KEY_SIZE]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
