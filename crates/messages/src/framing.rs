//! Length-prefixed JSON framing.

use crate::WireMessage;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. A `Blocks` catch-up carrying a full run's
/// chain stays far below this.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Framing failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge { len: usize },

    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the connection is still usable after this error.
    ///
    /// A malformed body leaves the stream positioned at the next frame, so
    /// the receiver may keep reading. I/O errors and oversized frames do
    /// not: the length prefix can no longer be trusted.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Json(_))
    }
}

/// Write one framed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WireMessage,
) -> Result<(), CodecError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { len: body.len() });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WireMessage, CodecError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { len });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
