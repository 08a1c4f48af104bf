/// Message framing for plugin socket communication
///
/// This module implements a simple length-prefixed framing protocol:
/// [4-byte length (big-endian)][protobuf message bytes]
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (10MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    TooLarge(usize),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("failed to decode protobuf message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Send a protobuf message with length-prefix framing
///
/// Wire format: [4-byte length][message bytes]
pub async fn write_message<M, W>(msg: &M, writer: &mut W) -> Result<(), FrameError>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let buf = msg.encode_to_vec();

    if buf.len() > MAX_MESSAGE_SIZE as usize {
        return Err(FrameError::TooLarge(buf.len()));
    }

    let len = buf.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&buf).await?;

    // Flush so the peer sees the frame immediately
    writer.flush().await?;

    Ok(())
}

/// Receive a protobuf message with length-prefix framing
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_message<M, R>(reader: &mut R) -> Result<Option<M>, FrameError>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    read_exact_or_truncated(reader, &mut len_buf[first..]).await?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len as usize));
    }

    let mut buf = vec![0u8; len as usize];
    read_exact_or_truncated(reader, &mut buf).await?;

    Ok(Some(M::decode(&buf[..])?))
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
        Err(err) => Err(err.into()),
    }
}
