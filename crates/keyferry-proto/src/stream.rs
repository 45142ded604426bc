//! Length-prefixed transport framing over byte streams.
//!
//! Every binary unit on a connection (message frames, pairing blobs) is
//! preceded by a big-endian `u32` byte count. The count is checked against
//! [`MAX_FRAME_SIZE`] before any buffer is allocated.

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted length-prefixed unit (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reads one length-prefixed unit.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix.
///
/// # Errors
///
/// Returns `InvalidData` if the declared length is zero or exceeds `max`,
/// and `UnexpectedEof` if the stream ends mid-unit.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} outside 1..={max}"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Writes one length-prefixed unit and flushes.
///
/// # Errors
///
/// Returns `InvalidInput` if `data` is larger than [`MAX_FRAME_SIZE`], or any
/// underlying write error.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame exceeds maximum size",
        ));
    }
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Reads one newline-terminated line of at most `max` bytes.
///
/// Returns `Ok(None)` on EOF before any byte. The newline is kept.
///
/// # Errors
///
/// Returns `InvalidData` if `max` bytes pass without a newline, or if the
/// stream ends mid-line.
pub async fn read_line<R>(reader: &mut R, max: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max).unwrap_or(u64::MAX);
    let n = reader.take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "line too long or unterminated",
        ));
    }
    Ok(Some(buf))
}
