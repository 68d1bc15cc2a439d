//! Length-prefixed MessagePack frames
//!
//! Frame layout:
//! - length (u32, big endian) of the body
//! - checksum (u32, big endian) crc32 of the body
//! - body (MessagePack, named fields)

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Default maximum body size of one frame (256 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 256 * 1024 * 1024;

/// Serialize a message into a complete frame
pub fn encode_frame<T: Serialize>(message: &T, max_len: u64) -> Result<Vec<u8>, FrameError> {
    let body = rmp_serde::to_vec_named(message)?;
    let len = body.len() as u64;
    if len > max_len || len > u32::MAX as u64 {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame and flush
pub async fn write_frame<W, T>(writer: &mut W, message: &T, max_len: u64) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message, max_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before
/// sending a frame header.
pub async fn read_frame<R, T>(reader: &mut R, max_len: u64) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as u64,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let expected = reader.read_u32().await?;
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let actual = crc32fast::hash(&body);
    if actual != expected {
        return Err(FrameError::Checksum { expected, actual });
    }

    Ok(Some(rmp_serde::from_slice(&body)?))
}
