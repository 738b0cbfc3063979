//! Async stream side of the wire codec: read handshakes and framed messages off a socket.

use std::io;

use symswarm_core::protocol::MessageError;
use symswarm_core::wire::{self, FrameDecodeError, HANDSHAKE_LEN, LEN_SIZE};
use symswarm_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Why a read ended.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Closed cleanly before any byte of the next frame.
    #[error("end of stream")]
    EndOfStream,
    /// Closed partway through a frame or handshake.
    #[error("stream closed mid-message")]
    Truncated,
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
    #[error(transparent)]
    Malformed(#[from] MessageError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameDecodeError> for ReadError {
    fn from(e: FrameDecodeError) -> Self {
        match e {
            FrameDecodeError::TooLarge(n) => ReadError::TooLarge(n),
            FrameDecodeError::NeedMore => ReadError::Truncated,
        }
    }
}

/// Fill `buf` completely. Distinguishes a close before the first byte from a close mid-way.
async fn fill<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<(), ReadError> {
    let mut got = 0;
    while got < buf.len() {
        let n = r.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(if got == 0 {
                ReadError::EndOfStream
            } else {
                ReadError::Truncated
            });
        }
        got += n;
    }
    Ok(())
}

/// Read the fixed-size remote handshake. Validation is the session's job.
pub async fn read_handshake<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, ReadError> {
    let mut buf = vec![0u8; HANDSHAKE_LEN];
    match fill(r, &mut buf).await {
        Err(ReadError::EndOfStream) => Err(ReadError::Truncated),
        other => other.map(|_| buf),
    }
}

/// Read one framed message.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, ReadError> {
    let mut prefix = [0u8; LEN_SIZE];
    fill(r, &mut prefix).await?;
    let len = wire::frame_len(prefix)?;
    let mut body = vec![0u8; len];
    match fill(r, &mut body).await {
        Err(ReadError::EndOfStream) => return Err(ReadError::Truncated),
        other => other?,
    }
    Ok(Message::from_frame(wire::split_body(body))?)
}

pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> io::Result<()> {
    let bytes = msg
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    w.write_all(&bytes).await
}
