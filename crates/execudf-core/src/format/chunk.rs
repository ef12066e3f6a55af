//! Chunk framing for batches on a worker's pipes.
//!
//! Format: decimal payload length, a newline, then exactly that many payload
//! bytes. Without chunk headers a pooled batch is instead delimited by its
//! row count, one newline-terminated line per row.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

/// Largest payload accepted in one chunk (1 GiB).
pub const MAX_CHUNK_LEN: usize = 1 << 30;

/// Prefix `payload` with its chunk header.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("{}\n", payload.len());
    let mut framed = Vec::with_capacity(header.len() + payload.len());
    framed.extend_from_slice(header.as_bytes());
    framed.extend_from_slice(payload);
    framed
}

fn parse_header(line: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::Format("chunk header is not UTF-8".to_string()))?;
    let len: usize = text
        .trim()
        .parse()
        .map_err(|_| Error::Format(format!("invalid chunk header {:?}", text.trim_end())))?;
    if len > MAX_CHUNK_LEN {
        return Err(Error::Format(format!("chunk too large: {} bytes", len)));
    }
    Ok(len)
}

/// Split one complete chunk out of a buffered stream.
///
/// The buffer must hold exactly one chunk; bytes past the declared length
/// are an error rather than silently ignored.
pub fn split_frame(bytes: &[u8]) -> Result<&[u8]> {
    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::Format("missing chunk header".to_string()))?;
    let len = parse_header(&bytes[..newline])?;
    let payload = &bytes[newline + 1..];
    match payload.len() {
        n if n < len => Err(Error::Format(format!(
            "chunk declared {} bytes but only {} arrived",
            len, n
        ))),
        n if n > len => Err(Error::Format(format!(
            "{} unexpected bytes after {}-byte chunk",
            n - len,
            len
        ))),
        _ => Ok(payload),
    }
}

/// Read one chunk from a long-lived stream.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = Vec::new();
    let n = reader.read_until(b'\n', &mut header).await?;
    if n == 0 || header.last() != Some(&b'\n') {
        return Err(Error::Format(
            "output ended before a chunk header".to_string(),
        ));
    }
    let len = parse_header(&header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Format(format!("output ended inside a {}-byte chunk", len))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(payload)
}

/// Read exactly `rows` newline-terminated lines from a long-lived stream.
pub async fn read_lines<R: AsyncBufRead + Unpin>(reader: &mut R, rows: usize) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for read in 0..rows {
        let n = reader.read_until(b'\n', &mut payload).await?;
        if n == 0 || payload.last() != Some(&b'\n') {
            return Err(Error::Format(format!(
                "output ended after {} of {} rows",
                read, rows
            )));
        }
    }
    Ok(payload)
}
